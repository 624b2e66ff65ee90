//! Core domain types for the funds-transfer handshake.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::Amount;

/// Host-assigned transaction number. Not unique across commands.
pub type TransactionNumber = u8;

/// Direction of a transfer, seen from the gaming machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Host deposits credits onto the machine.
    ToEgm,
    /// Host withdraws credits from the machine.
    FromEgm,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::ToEgm => "to_egm",
            TransferDirection::FromEgm => "from_egm",
        }
    }
}

/// Credit meter a transfer moves value on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    Cashable,
    Promotional,
    NonCashable,
}

/// The funds-transfer command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EftCommand {
    /// Cashable credits to the machine.
    D0,
    /// Cashable promotional credits to the machine.
    D1,
    /// Non-cashable promotional credits to the machine.
    D2,
    /// Cashable credits to the host.
    D3,
    /// Promotional credits to the host.
    D4,
}

impl EftCommand {
    pub fn direction(&self) -> TransferDirection {
        match self {
            EftCommand::D0 | EftCommand::D1 | EftCommand::D2 => TransferDirection::ToEgm,
            EftCommand::D3 | EftCommand::D4 => TransferDirection::FromEgm,
        }
    }

    pub fn account_type(&self) -> AccountType {
        match self {
            EftCommand::D0 | EftCommand::D3 => AccountType::Cashable,
            EftCommand::D1 | EftCommand::D4 => AccountType::Promotional,
            EftCommand::D2 => AccountType::NonCashable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EftCommand::D0 => "D0",
            EftCommand::D1 => "D1",
            EftCommand::D2 => "D2",
            EftCommand::D3 => "D3",
            EftCommand::D4 => "D4",
        }
    }
}

impl fmt::Display for EftCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EftCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "D0" => Ok(EftCommand::D0),
            "D1" => Ok(EftCommand::D1),
            "D2" => Ok(EftCommand::D2),
            "D3" => Ok(EftCommand::D3),
            "D4" => Ok(EftCommand::D4),
            _ => Err(s.to_string()),
        }
    }
}

/// One inbound host message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub command: EftCommand,
    pub transaction_number: TransactionNumber,
    pub amount: Amount,
    /// Set when the host confirms a prior response (second phase).
    pub acknowledgement: bool,
    pub direction: TransferDirection,
}

impl TransferRequest {
    pub fn new(
        command: EftCommand,
        transaction_number: TransactionNumber,
        amount: Amount,
        acknowledgement: bool,
    ) -> Self {
        Self {
            command,
            transaction_number,
            amount,
            acknowledgement,
            direction: command.direction(),
        }
    }
}

/// Status reported back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    OperationSuccessful,
    /// Accepted with an amount clamped below the requested one.
    TransferAmountExceeded,
    InvalidAck,
    EgmBusy,
    EgmDoorOpen,
    InGamePlayMode,
    EgmInTiltCondition,
    EgmDisabled,
    EgmOutOfService,
    PreviouslyCompleted,
    InvalidTransactionNumber,
    InvalidTransferAmount,
}

impl TransferStatus {
    /// Statuses under which a transfer may proceed.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            TransferStatus::OperationSuccessful | TransferStatus::TransferAmountExceeded
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::OperationSuccessful => "operation_successful",
            TransferStatus::TransferAmountExceeded => "transfer_amount_exceeded",
            TransferStatus::InvalidAck => "invalid_ack",
            TransferStatus::EgmBusy => "egm_busy",
            TransferStatus::EgmDoorOpen => "egm_door_open",
            TransferStatus::InGamePlayMode => "in_game_play_mode",
            TransferStatus::EgmInTiltCondition => "egm_in_tilt_condition",
            TransferStatus::EgmDisabled => "egm_disabled",
            TransferStatus::EgmOutOfService => "egm_out_of_service",
            TransferStatus::PreviouslyCompleted => "previously_completed",
            TransferStatus::InvalidTransactionNumber => "invalid_transaction_number",
            TransferStatus::InvalidTransferAmount => "invalid_transfer_amount",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type AckCallback = Arc<dyn Fn() + Send + Sync>;

/// Callbacks the host-protocol layer invokes after a second-phase response
/// has been sent.
#[derive(Clone)]
pub struct AckHandlers {
    /// Host stayed silent long enough to imply acknowledgement.
    pub implied_ack: AckCallback,
    /// Host stayed silent long enough to imply a negative acknowledgement.
    pub implied_nack: AckCallback,
    /// Host asked for the response again.
    pub intermediate_nack: AckCallback,
}

impl AckHandlers {
    pub fn implied_ack(&self) {
        (self.implied_ack)()
    }

    pub fn implied_nack(&self) {
        (self.implied_nack)()
    }

    pub fn intermediate_nack(&self) {
        (self.intermediate_nack)()
    }
}

impl fmt::Debug for AckHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AckHandlers { .. }")
    }
}

/// The machine's reply to one [`TransferRequest`].
#[derive(Debug, Clone)]
pub struct TransferResponse {
    pub command: EftCommand,
    pub transaction_number: TransactionNumber,
    pub status: TransferStatus,
    pub amount: Amount,
    pub handlers: Option<AckHandlers>,
}

impl TransferResponse {
    pub fn new(request: &TransferRequest) -> Self {
        Self {
            command: request.command,
            transaction_number: request.transaction_number,
            status: TransferStatus::OperationSuccessful,
            amount: Amount::ZERO,
            handlers: None,
        }
    }
}

/// Persisted record of one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryLogEntry {
    /// Monotonic id, used as the ledger idempotency key.
    pub id: u64,
    pub command: EftCommand,
    pub transaction_number: TransactionNumber,
    pub requested_amount: Amount,
    pub reported_amount: Amount,
    pub acknowledgement: bool,
    pub reported_status: TransferStatus,
    pub timestamp_ms: u64,
    pub transfer_type: TransferDirection,
    /// Host approved, execution pending.
    pub to_be_processed: bool,
}

impl HistoryLogEntry {
    pub fn matches(
        &self,
        command: EftCommand,
        transaction_number: TransactionNumber,
        amount: Amount,
    ) -> bool {
        self.command == command
            && self.transaction_number == transaction_number
            && self.requested_amount == amount
    }

    pub fn matches_request(&self, request: &TransferRequest) -> bool {
        self.matches(request.command, request.transaction_number, request.amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_direction_and_account() {
        assert_eq!(EftCommand::D0.direction(), TransferDirection::ToEgm);
        assert_eq!(EftCommand::D2.account_type(), AccountType::NonCashable);
        assert_eq!(EftCommand::D3.direction(), TransferDirection::FromEgm);
        assert_eq!(EftCommand::D4.account_type(), AccountType::Promotional);
    }

    #[test]
    fn command_parses_case_insensitively() {
        assert_eq!("d1".parse::<EftCommand>(), Ok(EftCommand::D1));
        assert!("D9".parse::<EftCommand>().is_err());
    }

    #[test]
    fn request_direction_follows_command() {
        let request = TransferRequest::new(EftCommand::D3, 4, Amount::from_cents(10), false);
        assert_eq!(request.direction, TransferDirection::FromEgm);
    }

    #[test]
    fn accepted_statuses() {
        assert!(TransferStatus::OperationSuccessful.is_accepted());
        assert!(TransferStatus::TransferAmountExceeded.is_accepted());
        assert!(!TransferStatus::PreviouslyCompleted.is_accepted());
        assert!(!TransferStatus::EgmBusy.is_accepted());
    }

    #[test]
    fn entry_matches_on_command_transaction_and_amount() {
        let entry = HistoryLogEntry {
            id: 1,
            command: EftCommand::D0,
            transaction_number: 7,
            requested_amount: Amount::from_cents(500),
            reported_amount: Amount::from_cents(500),
            acknowledgement: false,
            reported_status: TransferStatus::OperationSuccessful,
            timestamp_ms: 0,
            transfer_type: TransferDirection::ToEgm,
            to_be_processed: false,
        };
        assert!(entry.matches(EftCommand::D0, 7, Amount::from_cents(500)));
        assert!(!entry.matches(EftCommand::D1, 7, Amount::from_cents(500)));
        assert!(!entry.matches(EftCommand::D0, 8, Amount::from_cents(500)));
        assert!(!entry.matches(EftCommand::D0, 7, Amount::from_cents(501)));
    }
}
