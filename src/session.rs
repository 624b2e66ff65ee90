//! Replay of a scripted host session against a simulated machine.
//!
//! Time is virtual: the script advances the clock explicitly, so a replay is
//! deterministic and runs as fast as the events arrive.

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::{Stream, StreamExt};
use tracing::{error, info, warn};

use crate::Amount;
use crate::clock::ManualClock;
use crate::config::EftConfig;
use crate::controller::{ControllerParts, EftController, EftError};
use crate::egm::{DisableManager, DisableReason, SimulatedEgm};
use crate::eligibility::EligibilityPolicy;
use crate::handler::{DepositHandler, WithdrawalHandler};
use crate::history::HistoryLog;
use crate::ledger::CreditLedger;
use crate::model::{AckHandlers, TransferRequest, TransferResponse};
use crate::recovery::RecoveryOutcome;
use crate::storage::PersistentStorage;

/// One step of a host script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEvent {
    /// Host message.
    Command(TransferRequest),
    /// Move virtual time forward.
    Advance(Duration),
    /// Link-layer outcomes, delivered through the handlers of the last response.
    ImpliedAck,
    ImpliedNack,
    ReAck,
    /// Machine conditions.
    DoorOpen(bool),
    GameIdle(bool),
    Disable(DisableReason),
    Enable(DisableReason),
}

pub struct Session {
    controller: EftController,
    clock: Arc<ManualClock>,
    egm: Arc<SimulatedEgm>,
    ledger: Arc<CreditLedger>,
    last_response: Option<TransferResponse>,
}

/// Public API
impl Session {
    /// Assemble a simulated machine over `storage` and settle any transfer
    /// left pending by a previous run.
    pub fn new(config: &EftConfig, storage: Arc<dyn PersistentStorage>) -> Result<Self, EftError> {
        let history = Arc::new(HistoryLog::load(storage)?);
        let clock = Arc::new(ManualClock::new());
        let egm = Arc::new(SimulatedEgm::new());
        let ledger = Arc::new(CreditLedger::new(Amount::from_cents(config.max_credit_limit)));

        let controller = EftController::new(ControllerParts {
            history,
            policy: EligibilityPolicy::from_config(egm.clone(), config),
            handlers: vec![
                Arc::new(DepositHandler::new(ledger.clone())),
                Arc::new(WithdrawalHandler::new(ledger.clone())),
            ],
            disable_manager: egm.clone(),
            clock: clock.clone(),
            phase_timeout: config.phase_timeout(),
        });

        let outcome = controller.recover_if_required()?;
        if outcome != RecoveryOutcome::NothingPending {
            info!(?outcome, "pending transfer recovered");
        }

        Ok(Self {
            controller,
            clock,
            egm,
            ledger,
            last_response: None,
        })
    }

    /// Replay every event of `events`. A failing event is logged and the
    /// replay continues.
    pub async fn run(&mut self, mut events: impl Stream<Item = ScriptEvent> + Unpin) {
        while let Some(event) = events.next().await {
            if let Err(e) = self.apply(event) {
                error!(reason = %e, "script event failed");
            }
        }
    }

    /// Apply a single event.
    pub fn apply(&mut self, event: ScriptEvent) -> Result<(), EftError> {
        match event {
            ScriptEvent::Command(request) => {
                let response = self.controller.handle(request)?;
                self.last_response = Some(response);
            }
            ScriptEvent::Advance(by) => self.clock.advance(by),
            ScriptEvent::ImpliedAck => self.invoke(AckHandlers::implied_ack),
            ScriptEvent::ImpliedNack => self.invoke(AckHandlers::implied_nack),
            ScriptEvent::ReAck => self.invoke(AckHandlers::intermediate_nack),
            ScriptEvent::DoorOpen(open) => self.egm.set_door_open(open),
            ScriptEvent::GameIdle(idle) => self.egm.set_game_idle(idle),
            ScriptEvent::Disable(reason) => {
                let message = reason.to_string();
                self.egm.disable(&reason, &message);
            }
            ScriptEvent::Enable(reason) => self.egm.enable(&reason),
        }
        Ok(())
    }

    pub fn controller(&self) -> &EftController {
        &self.controller
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.ledger
    }

    pub fn last_response(&self) -> Option<&TransferResponse> {
        self.last_response.as_ref()
    }
}

/// Private API
impl Session {
    fn invoke(&self, callback: fn(&AckHandlers)) {
        match self.last_response.as_ref().and_then(|r| r.handlers.as_ref()) {
            Some(handlers) => callback(handlers),
            None => warn!("last response carries no acknowledgement handlers"),
        }
    }
}
