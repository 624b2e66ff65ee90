//! Direction-specific transfer strategies.
//!
//! A handler knows which commands it serves, how much it may move right now
//! and how to post the movement to the ledger.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, error, warn};

use crate::Amount;
use crate::ledger::{Ledger, LedgerError, LedgerTxId};
use crate::model::{EftCommand, TransferDirection};

pub trait TransferHandler: Send + Sync {
    fn direction(&self) -> TransferDirection;

    fn commands(&self) -> &'static [EftCommand];

    fn handles(&self, command: EftCommand) -> bool {
        self.commands().contains(&command)
    }

    /// Clamp `requested` to what the ledger accepts. The flag is set when
    /// clamping happened.
    fn check_transfer_amount(&self, command: EftCommand, requested: Amount) -> (Amount, bool);

    /// Post the transfer. `transaction_id` is the ledger idempotency key.
    fn process_transfer(
        &self,
        command: EftCommand,
        amount: Amount,
        transaction_id: LedgerTxId,
    ) -> bool;

    /// Whether the ledger already holds this transfer.
    fn is_transfer_posted(&self, transaction_id: LedgerTxId) -> bool;

    /// Refuse transfers outright while the host has the machine disabled.
    fn stop_transfer_if_disabled_by_host(&self) -> bool;

    /// Lockup text shown while a transfer is in flight.
    fn disable_string(&self) -> &str;

    fn restart_cashout_timer(&self) {}
}

/// Clamp to `acceptable`; a zero request is never flagged as exceeded.
fn clamp(requested: Amount, acceptable: Amount) -> (Amount, bool) {
    if requested > acceptable {
        (acceptable, true)
    } else {
        (requested, false)
    }
}

/// Log the posting outcome. A duplicate id means the movement already
/// happened, which counts as success.
fn posting_succeeded(
    result: Result<(), LedgerError>,
    command: EftCommand,
    amount: Amount,
    transaction_id: LedgerTxId,
) -> bool {
    match result {
        Ok(()) => true,
        Err(LedgerError::DuplicateTxId(_)) => {
            warn!(%command, %amount, transaction_id, "transfer already posted");
            true
        }
        Err(e) => {
            error!(%command, %amount, transaction_id, reason = %e, "transfer posting failed");
            false
        }
    }
}

/// Host to machine.
pub struct DepositHandler {
    ledger: Arc<dyn Ledger>,
}

impl DepositHandler {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }
}

impl TransferHandler for DepositHandler {
    fn direction(&self) -> TransferDirection {
        TransferDirection::ToEgm
    }

    fn commands(&self) -> &'static [EftCommand] {
        &[EftCommand::D0, EftCommand::D1, EftCommand::D2]
    }

    fn check_transfer_amount(&self, command: EftCommand, requested: Amount) -> (Amount, bool) {
        clamp(requested, self.ledger.acceptable_in(command.account_type()))
    }

    fn process_transfer(
        &self,
        command: EftCommand,
        amount: Amount,
        transaction_id: LedgerTxId,
    ) -> bool {
        let result = self
            .ledger
            .deposit(command.account_type(), amount, transaction_id);
        posting_succeeded(result, command, amount, transaction_id)
    }

    fn is_transfer_posted(&self, transaction_id: LedgerTxId) -> bool {
        self.ledger.is_posted(transaction_id)
    }

    fn stop_transfer_if_disabled_by_host(&self) -> bool {
        false
    }

    fn disable_string(&self) -> &str {
        "Transfer to machine in progress"
    }
}

/// Machine to host.
pub struct WithdrawalHandler {
    ledger: Arc<dyn Ledger>,
    cashout_timer_restarts: AtomicUsize,
}

impl WithdrawalHandler {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            cashout_timer_restarts: AtomicUsize::new(0),
        }
    }

    pub fn cashout_timer_restarts(&self) -> usize {
        self.cashout_timer_restarts.load(Ordering::SeqCst)
    }
}

impl TransferHandler for WithdrawalHandler {
    fn direction(&self) -> TransferDirection {
        TransferDirection::FromEgm
    }

    fn commands(&self) -> &'static [EftCommand] {
        &[EftCommand::D3, EftCommand::D4]
    }

    fn check_transfer_amount(&self, command: EftCommand, requested: Amount) -> (Amount, bool) {
        clamp(requested, self.ledger.acceptable_out(command.account_type()))
    }

    fn process_transfer(
        &self,
        command: EftCommand,
        amount: Amount,
        transaction_id: LedgerTxId,
    ) -> bool {
        let result = self
            .ledger
            .withdraw(command.account_type(), amount, transaction_id);
        posting_succeeded(result, command, amount, transaction_id)
    }

    fn is_transfer_posted(&self, transaction_id: LedgerTxId) -> bool {
        self.ledger.is_posted(transaction_id)
    }

    fn stop_transfer_if_disabled_by_host(&self) -> bool {
        true
    }

    fn disable_string(&self) -> &str {
        "Transfer to host in progress"
    }

    fn restart_cashout_timer(&self) {
        let restarts = self.cashout_timer_restarts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(restarts, "cashout timer restarted");
    }
}
