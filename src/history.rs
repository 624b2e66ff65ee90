//! Transaction history log.
//!
//! Keeps the last [`HISTORY_CAPACITY`] transfer records in durable storage.
//! The log doubles as the idempotency record for duplicate detection and as
//! the crash-recovery journal: an entry with `to_be_processed` set is a
//! transfer the host approved whose ledger movement may not have happened yet.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info};

use crate::Amount;
use crate::model::{
    EftCommand, HistoryLogEntry, TransactionNumber, TransferRequest, TransferResponse,
};
use crate::storage::{PersistentStorage, StorageError};

/// Regulators require the last five transfers to be retained.
pub const HISTORY_CAPACITY: usize = 5;

const BLOCK: &str = concat!(module_path!(), "::HistoryLog");
const KEY_ENTRIES: &str = "TransferHistory";
const KEY_NEXT_ID: &str = "NextEntryId";
const KEY_CASHOUT_OVERRIDE: &str = "CashoutOverride";

#[derive(Debug, Error)]
pub enum HistoryError {
    /// Finalizing a transfer that is not the last logged one. Always a
    /// sequencing bug in the caller.
    #[error(
        "last history entry does not match {command} transaction {transaction} amount {amount}"
    )]
    NoMatchingEntry {
        command: EftCommand,
        transaction: TransactionNumber,
        amount: Amount,
    },

    #[error("history persistence failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LogState {
    /// Oldest first.
    entries: VecDeque<HistoryLogEntry>,
    next_id: u64,
    cashout_override: bool,
}

pub struct HistoryLog {
    storage: Arc<dyn PersistentStorage>,
    state: Mutex<LogState>,
}

/// Public API
impl HistoryLog {
    /// Load the log from storage. A missing block yields an empty log.
    pub fn load(storage: Arc<dyn PersistentStorage>) -> Result<Self, HistoryError> {
        let entries: VecDeque<HistoryLogEntry> =
            read_value(storage.as_ref(), KEY_ENTRIES)?.unwrap_or_default();
        let next_id = read_value(storage.as_ref(), KEY_NEXT_ID)?
            .unwrap_or_else(|| entries.back().map_or(1, |e| e.id + 1));
        let cashout_override = read_value(storage.as_ref(), KEY_CASHOUT_OVERRIDE)?.unwrap_or(false);

        debug!(entries = entries.len(), next_id, "history log loaded");

        Ok(Self {
            storage,
            state: Mutex::new(LogState {
                entries,
                next_id,
                cashout_override,
            }),
        })
    }

    /// Record the outcome of an accepted host message.
    ///
    /// A message matching the last entry updates it in place: an accepted
    /// acknowledgement marks the entry to be processed, anything else
    /// refreshes its acknowledgement and status. A resent first phase also
    /// refreshes the reported amount, which is the amount later posted. Other
    /// messages append a new entry, evicting the oldest one past capacity.
    pub fn add_or_update_entry(
        &self,
        request: &TransferRequest,
        response: &TransferResponse,
        timestamp_ms: u64,
    ) -> Result<HistoryLogEntry, HistoryError> {
        self.mutate(|state| {
            if let Some(last) = state.entries.back_mut()
                && last.matches_request(request)
            {
                if request.acknowledgement && response.status.is_accepted() {
                    last.to_be_processed = true;
                } else {
                    last.acknowledgement = request.acknowledgement;
                    last.reported_status = response.status;
                    if !request.acknowledgement {
                        last.reported_amount = response.amount;
                    }
                }
                return Ok(last.clone());
            }

            let entry = HistoryLogEntry {
                id: state.next_id,
                command: request.command,
                transaction_number: request.transaction_number,
                requested_amount: request.amount,
                reported_amount: response.amount,
                acknowledgement: request.acknowledgement,
                reported_status: response.status,
                timestamp_ms,
                transfer_type: request.direction,
                to_be_processed: false,
            };
            state.next_id += 1;
            state.entries.push_back(entry.clone());
            while state.entries.len() > HISTORY_CAPACITY {
                state.entries.pop_front();
            }
            Ok(entry)
        })
    }

    /// Mark the last entry as executed.
    pub fn update_log_entry_for_request_completed(
        &self,
        command: EftCommand,
        transaction: TransactionNumber,
        amount: Amount,
    ) -> Result<(), HistoryError> {
        self.mutate(|state| {
            let last = last_matching(state, command, transaction, amount)?;
            last.acknowledgement = true;
            last.to_be_processed = false;
            Ok(())
        })?;
        info!(%command, transaction, %amount, "history entry completed");
        Ok(())
    }

    /// Withdraw the host approval of the last entry. The acknowledgement
    /// flag is left untouched.
    pub fn update_log_entry_for_nacked_lp(
        &self,
        command: EftCommand,
        transaction: TransactionNumber,
        amount: Amount,
    ) -> Result<(), HistoryError> {
        self.mutate(|state| {
            let last = last_matching(state, command, transaction, amount)?;
            last.to_be_processed = false;
            Ok(())
        })?;
        info!(%command, transaction, %amount, "history entry nacked");
        Ok(())
    }

    /// Up to the last five entries, newest first.
    pub fn get_history_logs(&self) -> Vec<HistoryLogEntry> {
        self.read(|state| state.entries.iter().rev().cloned().collect())
    }

    pub fn get_last_transaction(&self) -> Option<HistoryLogEntry> {
        self.read(|state| state.entries.back().cloned())
    }

    /// Cashout override flag owned by the companion cashout feature.
    pub fn cashout_override(&self) -> bool {
        self.read(|state| state.cashout_override)
    }

    pub fn set_cashout_override(&self, value: bool) -> Result<(), HistoryError> {
        self.mutate(|state| {
            state.cashout_override = value;
            Ok(())
        })
    }
}

/// Private API
impl HistoryLog {
    fn read<T>(&self, f: impl FnOnce(&LogState) -> T) -> T {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    /// Apply `f` to a copy of the state and publish it only once it is
    /// durable, so the in-memory view never runs ahead of storage.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut LogState) -> Result<T, HistoryError>,
    ) -> Result<T, HistoryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = state.clone();
        let result = f(&mut next)?;
        self.update_log_entries_in_database(&next)?;
        *state = next;
        Ok(result)
    }

    fn update_log_entries_in_database(&self, state: &LogState) -> Result<(), HistoryError> {
        let mut txn = self.storage.start_transaction(BLOCK);
        txn.set(KEY_ENTRIES, encode(&state.entries)?);
        txn.set(KEY_NEXT_ID, encode(&state.next_id)?);
        txn.set(KEY_CASHOUT_OVERRIDE, encode(&state.cashout_override)?);
        txn.commit()?;
        Ok(())
    }
}

fn last_matching(
    state: &mut LogState,
    command: EftCommand,
    transaction: TransactionNumber,
    amount: Amount,
) -> Result<&mut HistoryLogEntry, HistoryError> {
    state
        .entries
        .back_mut()
        .filter(|last| last.matches(command, transaction, amount))
        .ok_or(HistoryError::NoMatchingEntry {
            command,
            transaction,
            amount,
        })
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|source| StorageError::Corrupt {
        block: BLOCK.to_string(),
        source,
    })
}

fn read_value<T: DeserializeOwned>(
    storage: &dyn PersistentStorage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    storage
        .read(BLOCK, key)?
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()
        .map_err(|source| StorageError::Corrupt {
            block: BLOCK.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransferStatus;
    use crate::storage::MemoryStorage;

    // test utils

    fn new_log() -> (Arc<MemoryStorage>, HistoryLog) {
        let storage = Arc::new(MemoryStorage::new());
        let log = HistoryLog::load(storage.clone()).unwrap();
        (storage, log)
    }

    fn request(tx: TransactionNumber, amount: u64, ack: bool) -> TransferRequest {
        TransferRequest::new(EftCommand::D0, tx, Amount::from_cents(amount), ack)
    }

    fn response(request: &TransferRequest, status: TransferStatus) -> TransferResponse {
        let mut response = TransferResponse::new(request);
        response.status = status;
        response.amount = request.amount;
        response
    }

    fn log_first_phase(log: &HistoryLog, tx: TransactionNumber, amount: u64) {
        let req = request(tx, amount, false);
        log.add_or_update_entry(&req, &response(&req, TransferStatus::OperationSuccessful), 0)
            .unwrap();
    }

    #[test]
    fn empty_log() {
        let (_, log) = new_log();
        assert!(log.get_history_logs().is_empty());
        assert!(log.get_last_transaction().is_none());
    }

    #[test]
    fn first_phase_appends_entry() {
        let (storage, log) = new_log();
        log_first_phase(&log, 1, 500);

        let last = log.get_last_transaction().unwrap();
        assert_eq!(last.id, 1);
        assert_eq!(last.transaction_number, 1);
        assert_eq!(last.requested_amount, Amount::from_cents(500));
        assert!(!last.acknowledgement);
        assert!(!last.to_be_processed);
        assert_eq!(storage.commit_count(), 1);
    }

    #[test]
    fn matching_ack_marks_entry_to_be_processed() {
        let (_, log) = new_log();
        log_first_phase(&log, 1, 500);

        let ack = request(1, 500, true);
        log.add_or_update_entry(&ack, &response(&ack, TransferStatus::OperationSuccessful), 10)
            .unwrap();

        let logs = log.get_history_logs();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].to_be_processed);
        assert!(!logs[0].acknowledgement);
    }

    #[test]
    fn matching_rejected_message_updates_ack_and_status() {
        let (_, log) = new_log();
        log_first_phase(&log, 1, 500);

        let ack = request(1, 500, true);
        log.add_or_update_entry(&ack, &response(&ack, TransferStatus::EgmDoorOpen), 10)
            .unwrap();

        let last = log.get_last_transaction().unwrap();
        assert_eq!(log.get_history_logs().len(), 1);
        assert!(last.acknowledgement);
        assert_eq!(last.reported_status, TransferStatus::EgmDoorOpen);
        assert!(!last.to_be_processed);
    }

    #[test]
    fn resent_first_phase_refreshes_reported_amount() {
        let (_, log) = new_log();
        let first = request(1, 500, false);
        let mut clamped = response(&first, TransferStatus::TransferAmountExceeded);
        clamped.amount = Amount::from_cents(200);
        log.add_or_update_entry(&first, &clamped, 0).unwrap();

        log.add_or_update_entry(&first, &response(&first, TransferStatus::OperationSuccessful), 900)
            .unwrap();

        let last = log.get_last_transaction().unwrap();
        assert_eq!(log.get_history_logs().len(), 1);
        assert_eq!(last.reported_amount, Amount::from_cents(500));
        assert_eq!(last.reported_status, TransferStatus::OperationSuccessful);

        // an acknowledgement keeps the amount the host was told
        let ack = request(1, 500, true);
        let mut lower = response(&ack, TransferStatus::TransferAmountExceeded);
        lower.amount = Amount::from_cents(100);
        log.add_or_update_entry(&ack, &lower, 950).unwrap();
        assert_eq!(
            log.get_last_transaction().unwrap().reported_amount,
            Amount::from_cents(500)
        );
    }

    #[test]
    fn history_is_bounded_newest_first() {
        let (_, log) = new_log();
        for tx in 1..=7 {
            log_first_phase(&log, tx, 100 * tx as u64);
        }

        let logs = log.get_history_logs();
        assert_eq!(logs.len(), HISTORY_CAPACITY);
        let numbers: Vec<_> = logs.iter().map(|e| e.transaction_number).collect();
        assert_eq!(numbers, vec![7, 6, 5, 4, 3]);
    }

    #[test]
    fn completed_sets_ack_and_clears_pending() {
        let (_, log) = new_log();
        log_first_phase(&log, 3, 250);
        let ack = request(3, 250, true);
        log.add_or_update_entry(&ack, &response(&ack, TransferStatus::OperationSuccessful), 0)
            .unwrap();

        log.update_log_entry_for_request_completed(EftCommand::D0, 3, Amount::from_cents(250))
            .unwrap();

        let last = log.get_last_transaction().unwrap();
        assert!(last.acknowledgement);
        assert!(!last.to_be_processed);
    }

    #[test]
    fn completed_without_matching_entry_fails() {
        let (_, log) = new_log();
        log_first_phase(&log, 3, 250);

        let result =
            log.update_log_entry_for_request_completed(EftCommand::D0, 4, Amount::from_cents(250));
        assert!(matches!(
            result,
            Err(HistoryError::NoMatchingEntry { transaction: 4, .. })
        ));

        let result = log.update_log_entry_for_request_completed(
            EftCommand::D1,
            3,
            Amount::from_cents(250),
        );
        assert!(matches!(result, Err(HistoryError::NoMatchingEntry { .. })));
    }

    #[test]
    fn completed_on_empty_log_fails() {
        let (_, log) = new_log();
        let result =
            log.update_log_entry_for_request_completed(EftCommand::D0, 1, Amount::from_cents(1));
        assert!(matches!(result, Err(HistoryError::NoMatchingEntry { .. })));
    }

    #[test]
    fn nacked_clears_pending_and_keeps_ack() {
        let (_, log) = new_log();
        log_first_phase(&log, 2, 100);
        let ack = request(2, 100, true);
        log.add_or_update_entry(&ack, &response(&ack, TransferStatus::OperationSuccessful), 0)
            .unwrap();

        log.update_log_entry_for_nacked_lp(EftCommand::D0, 2, Amount::from_cents(100))
            .unwrap();

        let last = log.get_last_transaction().unwrap();
        assert!(!last.to_be_processed);
        assert!(!last.acknowledgement);

        let result = log.update_log_entry_for_nacked_lp(EftCommand::D0, 9, Amount::from_cents(100));
        assert!(matches!(result, Err(HistoryError::NoMatchingEntry { .. })));
    }

    #[test]
    fn failed_commit_leaves_log_unchanged() {
        let (storage, log) = new_log();
        log_first_phase(&log, 1, 100);

        storage.reject_commits(true);
        let req = request(2, 200, false);
        let result =
            log.add_or_update_entry(&req, &response(&req, TransferStatus::OperationSuccessful), 0);
        assert!(matches!(result, Err(HistoryError::Storage(_))));
        assert_eq!(log.get_last_transaction().unwrap().transaction_number, 1);
    }

    #[test]
    fn reload_restores_entries_ids_and_override() {
        let (storage, log) = new_log();
        log_first_phase(&log, 1, 100);
        log_first_phase(&log, 2, 200);
        log.set_cashout_override(true).unwrap();

        let reloaded = HistoryLog::load(storage.clone()).unwrap();
        assert_eq!(reloaded.get_history_logs(), log.get_history_logs());
        assert!(reloaded.cashout_override());

        log_first_phase(&reloaded, 3, 300);
        assert_eq!(reloaded.get_last_transaction().unwrap().id, 3);
    }
}
