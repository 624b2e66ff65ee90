//! Crash recovery of a host-approved transfer.
//!
//! If the process stopped between the host approval and the ledger posting,
//! the last history entry is still marked to be processed. On start-up the
//! coordinator either confirms the posting happened or performs it, then
//! finalizes the entry.

use std::sync::Arc;

use tracing::{info, warn};

use crate::controller::EftError;
use crate::handler::TransferHandler;
use crate::history::HistoryLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// The last entry is not an approved transfer of this handler.
    NothingPending,
    /// The ledger already held the transfer.
    AlreadyPosted,
    /// The transfer was posted during recovery.
    Replayed,
    /// Posting failed; the approval was withdrawn.
    ReplayFailed,
}

pub struct RecoveryCoordinator {
    history: Arc<HistoryLog>,
}

impl RecoveryCoordinator {
    pub fn new(history: Arc<HistoryLog>) -> Self {
        Self { history }
    }

    pub fn recover_if_required(
        &self,
        handler: &dyn TransferHandler,
    ) -> Result<RecoveryOutcome, EftError> {
        let Some(entry) = self.history.get_last_transaction() else {
            return Ok(RecoveryOutcome::NothingPending);
        };
        if !entry.to_be_processed || !handler.handles(entry.command) {
            return Ok(RecoveryOutcome::NothingPending);
        }

        let (command, transaction, requested) = (
            entry.command,
            entry.transaction_number,
            entry.requested_amount,
        );

        if handler.is_transfer_posted(entry.id) {
            info!(%command, transaction, "pending transfer already posted, finalizing");
            self.history
                .update_log_entry_for_request_completed(command, transaction, requested)?;
            return Ok(RecoveryOutcome::AlreadyPosted);
        }

        if handler.process_transfer(command, entry.reported_amount, entry.id) {
            info!(
                %command,
                transaction,
                amount = %entry.reported_amount,
                "pending transfer replayed"
            );
            self.history
                .update_log_entry_for_request_completed(command, transaction, requested)?;
            Ok(RecoveryOutcome::Replayed)
        } else {
            warn!(%command, transaction, "pending transfer could not be replayed");
            self.history
                .update_log_entry_for_nacked_lp(command, transaction, requested)?;
            Ok(RecoveryOutcome::ReplayFailed)
        }
    }
}
