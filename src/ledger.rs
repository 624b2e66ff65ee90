//! Accounting ledger the transfer handlers post to.
//!
//! Every posting carries a ledger transaction id; a repeated id is refused,
//! which makes postings idempotent across crash recovery.

use std::collections::HashSet;
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;

use crate::Amount;
use crate::model::AccountType;

/// Idempotency key of a ledger posting.
pub type LedgerTxId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("duplicate ledger transaction id {0}")]
    DuplicateTxId(LedgerTxId),

    #[error("insufficient {0:?} credits: available {1}, requested {2}")]
    InsufficientFunds(AccountType, Amount, Amount),

    #[error("deposit of {requested} exceeds credit limit, {acceptable} acceptable")]
    CreditLimitExceeded { requested: Amount, acceptable: Amount },
}

pub trait Ledger: Send + Sync {
    /// Largest amount the machine can currently accept onto `account`.
    fn acceptable_in(&self, account: AccountType) -> Amount;

    /// Largest amount the machine can currently release from `account`.
    fn acceptable_out(&self, account: AccountType) -> Amount;

    fn deposit(&self, account: AccountType, amount: Amount, tx: LedgerTxId)
    -> Result<(), LedgerError>;

    fn withdraw(
        &self,
        account: AccountType,
        amount: Amount,
        tx: LedgerTxId,
    ) -> Result<(), LedgerError>;

    /// Whether a posting with this id already happened.
    fn is_posted(&self, tx: LedgerTxId) -> bool;
}

/// Credit meters of the machine.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CreditMeters {
    pub cashable: Amount,
    pub promotional: Amount,
    pub non_cashable: Amount,
}

impl CreditMeters {
    pub fn total(&self) -> Amount {
        self.cashable + self.promotional + self.non_cashable
    }

    pub fn get(&self, account: AccountType) -> Amount {
        match account {
            AccountType::Cashable => self.cashable,
            AccountType::Promotional => self.promotional,
            AccountType::NonCashable => self.non_cashable,
        }
    }

    fn meter_mut(&mut self, account: AccountType) -> &mut Amount {
        match account {
            AccountType::Cashable => &mut self.cashable,
            AccountType::Promotional => &mut self.promotional,
            AccountType::NonCashable => &mut self.non_cashable,
        }
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    meters: CreditMeters,
    posted: HashSet<LedgerTxId>,
}

/// In-process ledger with a machine-wide credit limit.
#[derive(Debug)]
pub struct CreditLedger {
    max_credit_limit: Amount,
    state: Mutex<LedgerState>,
}

/// Public API
impl CreditLedger {
    pub fn new(max_credit_limit: Amount) -> Self {
        Self {
            max_credit_limit,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Ledger starting with the given meters.
    pub fn with_meters(max_credit_limit: Amount, meters: CreditMeters) -> Self {
        Self {
            max_credit_limit,
            state: Mutex::new(LedgerState {
                meters,
                posted: HashSet::new(),
            }),
        }
    }

    pub fn meters(&self) -> CreditMeters {
        self.lock().meters
    }

    /// Number of postings applied.
    pub fn postings(&self) -> usize {
        self.lock().posted.len()
    }
}

/// Private API
impl CreditLedger {
    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn headroom(&self, meters: &CreditMeters) -> Amount {
        self.max_credit_limit.saturating_sub(meters.total())
    }
}

impl Ledger for CreditLedger {
    fn acceptable_in(&self, _account: AccountType) -> Amount {
        let state = self.lock();
        self.headroom(&state.meters)
    }

    fn acceptable_out(&self, account: AccountType) -> Amount {
        match account {
            // non-cashable credits never leave the machine
            AccountType::NonCashable => Amount::ZERO,
            _ => self.lock().meters.get(account),
        }
    }

    /// Post a deposit:
    /// - Ensure the ledger transaction id is unique
    /// - Ensure the credit limit holds
    /// - Credit the meter
    fn deposit(
        &self,
        account: AccountType,
        amount: Amount,
        tx: LedgerTxId,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.posted.contains(&tx) {
            return Err(LedgerError::DuplicateTxId(tx));
        }

        let acceptable = self.headroom(&state.meters);
        if amount > acceptable {
            return Err(LedgerError::CreditLimitExceeded {
                requested: amount,
                acceptable,
            });
        }

        *state.meters.meter_mut(account) += amount;
        state.posted.insert(tx);
        info!(tx, ?account, %amount, "ledger deposit posted");
        Ok(())
    }

    /// Post a withdrawal:
    /// - Ensure the ledger transaction id is unique
    /// - Ensure the meter holds enough credits
    /// - Debit the meter
    fn withdraw(
        &self,
        account: AccountType,
        amount: Amount,
        tx: LedgerTxId,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.posted.contains(&tx) {
            return Err(LedgerError::DuplicateTxId(tx));
        }

        let available = state.meters.get(account);
        if available < amount {
            return Err(LedgerError::InsufficientFunds(account, available, amount));
        }

        *state.meters.meter_mut(account) -= amount;
        state.posted.insert(tx);
        info!(tx, ?account, %amount, "ledger withdrawal posted");
        Ok(())
    }

    fn is_posted(&self, tx: LedgerTxId) -> bool {
        self.lock().posted.contains(&tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cents(value: u64) -> Amount {
        Amount::from_cents(value)
    }

    fn ledger_with_cashable(value: u64) -> CreditLedger {
        CreditLedger::with_meters(
            cents(10_000),
            CreditMeters {
                cashable: cents(value),
                ..CreditMeters::default()
            },
        )
    }

    #[test]
    fn meters_total_sums_all_accounts() {
        let meters = CreditMeters {
            cashable: cents(100),
            promotional: cents(50),
            non_cashable: cents(25),
        };
        assert_eq!(meters.total(), cents(175));
    }

    #[test]
    fn deposit_credits_meter() {
        let ledger = CreditLedger::new(cents(10_000));
        ledger.deposit(AccountType::Promotional, cents(300), 1).unwrap();

        assert_eq!(ledger.meters().promotional, cents(300));
        assert!(ledger.is_posted(1));
        assert_eq!(ledger.acceptable_in(AccountType::Cashable), cents(9_700));
    }

    #[test]
    fn deposit_over_limit_fails() {
        let ledger = ledger_with_cashable(9_900);
        let result = ledger.deposit(AccountType::Cashable, cents(200), 1);
        assert_eq!(
            result,
            Err(LedgerError::CreditLimitExceeded {
                requested: cents(200),
                acceptable: cents(100),
            })
        );
        assert!(!ledger.is_posted(1));
    }

    #[test]
    fn duplicate_tx_id_is_refused() {
        let ledger = CreditLedger::new(cents(10_000));
        ledger.deposit(AccountType::Cashable, cents(100), 7).unwrap();

        assert_eq!(
            ledger.deposit(AccountType::Cashable, cents(100), 7),
            Err(LedgerError::DuplicateTxId(7))
        );
        assert_eq!(
            ledger.withdraw(AccountType::Cashable, cents(10), 7),
            Err(LedgerError::DuplicateTxId(7))
        );
        assert_eq!(ledger.meters().cashable, cents(100));
        assert_eq!(ledger.postings(), 1);
    }

    #[test]
    fn withdraw_debits_meter() {
        let ledger = ledger_with_cashable(500);
        ledger.withdraw(AccountType::Cashable, cents(500), 1).unwrap();
        assert_eq!(ledger.meters().cashable, Amount::ZERO);
    }

    #[test]
    fn withdraw_insufficient_funds_fails() {
        let ledger = ledger_with_cashable(500);
        let result = ledger.withdraw(AccountType::Cashable, cents(501), 1);
        assert_eq!(
            result,
            Err(LedgerError::InsufficientFunds(
                AccountType::Cashable,
                cents(500),
                cents(501)
            ))
        );
        assert_eq!(ledger.meters().cashable, cents(500));
    }

    #[test]
    fn non_cashable_cannot_leave() {
        let ledger = CreditLedger::with_meters(
            cents(10_000),
            CreditMeters {
                non_cashable: cents(400),
                ..CreditMeters::default()
            },
        );
        assert_eq!(ledger.acceptable_out(AccountType::NonCashable), Amount::ZERO);
    }
}
