//! Funds-transfer state controller.
//!
//! Drives the two-phase handshake: a first-phase message reserves the
//! transfer, the host acknowledgement approves it, and the approved transfer
//! executes when the phase timer or the implied-ack callback fires, unless an
//! implied nack withdraws it first.
//!
//! Every trigger, whether it comes from a host message, the phase timer or an
//! acknowledgement callback, is processed under one lock. A trigger raised by
//! a collaborator while a transition runs is queued on the side and processed
//! once that transition has completed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::Amount;
use crate::clock::{Clock, TimerHandle};
use crate::config::EFT_TRANSFER_LOCKUP;
use crate::egm::{DisableManager, DisableReason};
use crate::eligibility::EligibilityPolicy;
use crate::handler::TransferHandler;
use crate::history::HistoryLog;
use crate::model::{
    AckCallback, AckHandlers, EftCommand, TransferRequest, TransferResponse, TransferStatus,
};
use crate::recovery::{RecoveryCoordinator, RecoveryOutcome};

mod state;
pub use state::{Action, EftState, Guard, Target, Transition, Trigger, transition};

mod error;
pub use error::EftError;

/// Collaborators of the controller.
pub struct ControllerParts {
    pub history: Arc<HistoryLog>,
    pub policy: EligibilityPolicy,
    pub handlers: Vec<Arc<dyn TransferHandler>>,
    pub disable_manager: Arc<dyn DisableManager>,
    pub clock: Arc<dyn Clock>,
    pub phase_timeout: Duration,
}

/// The transfer state machine.
pub struct EftController {
    shared: Arc<Shared>,
}

struct Shared {
    machine: Mutex<Machine>,
    /// Events raised while a transition runs. Only the draining thread
    /// pushes here.
    queue: Mutex<VecDeque<Event>>,
    /// Thread currently holding the machine lock and processing events.
    drainer: Mutex<Option<ThreadId>>,
    /// Guards the ledger posting and its history update.
    commit_lock: Mutex<()>,
    history: Arc<HistoryLog>,
    policy: EligibilityPolicy,
    handlers: Vec<Arc<dyn TransferHandler>>,
    disable_manager: Arc<dyn DisableManager>,
    clock: Arc<dyn Clock>,
    phase_timeout: Duration,
    lockup: DisableReason,
}

struct Machine {
    state: EftState,
    /// Message being handled and the response built for it.
    current: Option<TransferRequest>,
    response: Option<TransferResponse>,
    /// Last accepted message of the transfer in flight.
    previous: Option<TransferRequest>,
    timer: Option<TimerHandle>,
    timer_generation: u64,
    /// Bumped every time a transfer leaves Idle.
    transaction_seq: u64,
}

/// Non-message input to the machine.
#[derive(Debug, Clone, Copy)]
enum Event {
    Fire(Trigger),
    /// Phase timer armed under `generation`.
    PhaseTimer { generation: u64 },
    /// Acknowledgement callback issued for transfer `seq`.
    Ack { seq: u64, trigger: Trigger },
}

/// Clears the drainer mark on drop. Must be dropped before the machine
/// guard it accompanies.
struct Draining<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Public API
impl EftController {
    pub fn new(parts: ControllerParts) -> Self {
        let shared = Shared {
            machine: Mutex::new(Machine {
                state: EftState::Idle,
                current: None,
                response: None,
                previous: None,
                timer: None,
                timer_generation: 0,
                transaction_seq: 0,
            }),
            queue: Mutex::new(VecDeque::new()),
            drainer: Mutex::new(None),
            commit_lock: Mutex::new(()),
            history: parts.history,
            policy: parts.policy,
            handlers: parts.handlers,
            disable_manager: parts.disable_manager,
            clock: parts.clock,
            phase_timeout: parts.phase_timeout,
            lockup: DisableReason::new(EFT_TRANSFER_LOCKUP),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Handle one host message. Concurrent calls are processed one at a time.
    ///
    /// Only internal failures are errors; a refused message is reported
    /// through the response status. A message handed in by a collaborator
    /// while a transition runs is answered with `EgmBusy`.
    pub fn handle(&self, request: TransferRequest) -> Result<TransferResponse, EftError> {
        self.shared.handler_for(request.command)?;

        if self.shared.is_draining_thread() {
            warn!(
                command = %request.command,
                transaction = request.transaction_number,
                "host message raised during a transition, refused"
            );
            let mut response = TransferResponse::new(&request);
            response.status = TransferStatus::EgmBusy;
            return Ok(response);
        }

        let mut machine = self.shared.lock_machine();
        let _draining = self.shared.mark_draining();
        machine.current = Some(request);
        machine.response = Some(TransferResponse::new(&request));

        let result = self.shared.process(&mut machine, Trigger::CommandReceived);

        machine.current = None;
        let response = machine.response.take();
        self.shared.drain(&mut machine);
        result?;

        let response = response.unwrap_or_else(|| TransferResponse::new(&request));
        info!(
            command = %request.command,
            transaction = request.transaction_number,
            ack = request.acknowledgement,
            requested = %request.amount,
            status = %response.status,
            amount = %response.amount,
            state = %machine.state,
            "host message handled"
        );
        Ok(response)
    }

    /// Fire a non-message trigger. Fired from within a transition, the
    /// trigger is queued and runs once that transition completes.
    pub fn fire(&self, trigger: Trigger) -> Result<(), EftError> {
        if trigger == Trigger::CommandReceived {
            warn!("command triggers must go through handle, ignored");
            return Ok(());
        }
        self.shared.submit(Event::Fire(trigger))
    }

    pub fn state(&self) -> EftState {
        self.shared.lock_machine().state
    }

    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.shared.history
    }

    /// Settle a transfer approved before a restart. Must run before the
    /// first host message is handled.
    pub fn recover_if_required(&self) -> Result<RecoveryOutcome, EftError> {
        let machine = self.shared.lock_machine();
        if machine.state != EftState::Idle {
            warn!(state = %machine.state, "recovery skipped, transfer in flight");
            return Ok(RecoveryOutcome::NothingPending);
        }

        let _commit = self.shared.lock_commit();
        let coordinator = RecoveryCoordinator::new(self.shared.history.clone());
        for handler in &self.shared.handlers {
            let outcome = coordinator.recover_if_required(handler.as_ref())?;
            if outcome != RecoveryOutcome::NothingPending {
                return Ok(outcome);
            }
        }
        Ok(RecoveryOutcome::NothingPending)
    }
}

/// Trigger processing
impl Shared {
    fn lock_machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_commit(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handler_for(&self, command: EftCommand) -> Result<&Arc<dyn TransferHandler>, EftError> {
        self.handlers
            .iter()
            .find(|h| h.handles(command))
            .ok_or(EftError::NoHandler(command))
    }

    fn is_draining_thread(&self) -> bool {
        let drainer = self.drainer.lock().unwrap_or_else(|e| e.into_inner());
        *drainer == Some(thread::current().id())
    }

    /// Mark the current thread as the drainer. Call with the machine lock
    /// held.
    fn mark_draining(&self) -> Draining<'_> {
        *self.drainer.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
        Draining(&self.drainer)
    }

    /// Process `event`, then whatever it queued. An event submitted from
    /// within a transition is only queued.
    fn submit(self: &Arc<Self>, event: Event) -> Result<(), EftError> {
        if self.is_draining_thread() {
            debug!(?event, "event queued behind the running transition");
            self.lock_queue().push_back(event);
            return Ok(());
        }

        let mut machine = self.lock_machine();
        let _draining = self.mark_draining();
        let result = self.dispatch(&mut machine, event);
        self.drain(&mut machine);
        result
    }

    /// Process queued events until none are left. Their failures are logged.
    fn drain(self: &Arc<Self>, m: &mut Machine) {
        loop {
            let next = self.lock_queue().pop_front();
            let Some(event) = next else {
                return;
            };
            if let Err(e) = self.dispatch(m, event) {
                error!(state = %m.state, ?event, reason = %e, "queued event failed");
            }
        }
    }

    /// Drop superseded timer and acknowledgement events, process the rest.
    fn dispatch(self: &Arc<Self>, m: &mut Machine, event: Event) -> Result<(), EftError> {
        match event {
            Event::Fire(trigger) => self.process(m, trigger),
            Event::PhaseTimer { generation } => {
                if m.timer_generation != generation {
                    debug!(generation, "stale phase timer ignored");
                    return Ok(());
                }
                m.timer = None;
                self.process(m, Trigger::TimerExpired)
            }
            Event::Ack { seq, trigger } => {
                if m.transaction_seq != seq || m.state == EftState::Idle {
                    warn!(?trigger, seq, "acknowledgement event for a finished transfer ignored");
                    return Ok(());
                }
                self.process(m, trigger)
            }
        }
    }

    fn process(self: &Arc<Self>, m: &mut Machine, trigger: Trigger) -> Result<(), EftError> {
        let Some(t) = transition(m.state, trigger) else {
            warn!(state = %m.state, ?trigger, "unhandled trigger ignored");
            return Ok(());
        };

        let passed = self.evaluate_guard(m, t.guard) && self.run_action(m, t.action)?;
        let target = if passed { t.on_pass } else { t.on_fail };

        match target {
            Target::Stay => {}
            Target::Reenter => {
                let current = m.state;
                self.record(m, current)?;
                self.on_entry(m, current);
                debug!(state = %current, ?trigger, "state re-entered");
            }
            Target::To(next) => {
                self.record(m, next)?;
                let from = m.state;
                self.on_exit(m, from);
                m.state = next;
                self.on_entry(m, next);
                info!(from = %from, to = %next, ?trigger, "transition");
            }
        }
        Ok(())
    }

    /// Persist the message that moves the machine into a phase. Runs
    /// before any state change so a failed write leaves the state intact.
    fn record(&self, m: &Machine, next: EftState) -> Result<(), EftError> {
        if next == EftState::Idle {
            return Ok(());
        }
        if let (Some(request), Some(response)) = (m.current.as_ref(), m.response.as_ref()) {
            self.history
                .add_or_update_entry(request, response, self.clock.now_ms())?;
        }
        Ok(())
    }

    fn on_exit(&self, m: &mut Machine, from: EftState) {
        match from {
            EftState::Idle => {
                m.transaction_seq += 1;
                let message = m
                    .current
                    .and_then(|r| self.handler_for(r.command).ok())
                    .map_or("Transfer in progress", |h| h.disable_string());
                self.disable_manager.disable(&self.lockup, message);
            }
            EftState::FirstPhase | EftState::SecondPhase => Self::cancel_timer(m),
        }
    }

    fn on_entry(self: &Arc<Self>, m: &mut Machine, to: EftState) {
        match to {
            EftState::Idle => {
                Self::cancel_timer(m);
                m.previous = None;
                self.disable_manager.enable(&self.lockup);
            }
            EftState::FirstPhase => {
                m.previous = m.current;
                self.start_phase_timer(m);
            }
            EftState::SecondPhase => {
                m.previous = m.current;
                self.start_phase_timer(m);
                let handlers = self.ack_handlers(m.transaction_seq);
                if let Some(response) = m.response.as_mut() {
                    response.handlers = Some(handlers);
                }
            }
        }
    }
}

/// Guards
impl Shared {
    /// Eligibility, then message validity, then amount.
    fn evaluate_guard(&self, m: &mut Machine, guard: Guard) -> bool {
        if matches!(guard, Guard::Always) {
            return true;
        }
        let (Some(request), Some(response)) = (m.current, m.response.as_mut()) else {
            return false;
        };
        let Ok(handler) = self.handler_for(request.command) else {
            return false;
        };

        let status = self
            .policy
            .check_and_set_transaction_status(handler.as_ref());
        if status != TransferStatus::OperationSuccessful {
            response.status = status;
            return false;
        }

        match guard {
            Guard::Always => true,
            Guard::FirstPhaseMessage => {
                self.is_valid_first_phase_message(&request, response)
                    && Self::check_amount(handler.as_ref(), &request, response)
            }
            Guard::SecondPhaseMessage => self
                .is_valid_second_phase_message(&request, m.previous.as_ref(), response)
                .is_some_and(|logged| {
                    Self::check_approved_amount(handler.as_ref(), &request, logged, response)
                }),
        }
    }

    /// A first-phase message carries no acknowledgement, a non-zero
    /// transaction number, and is not a resend of a completed transfer.
    fn is_valid_first_phase_message(
        &self,
        request: &TransferRequest,
        response: &mut TransferResponse,
    ) -> bool {
        if request.acknowledgement {
            response.status = TransferStatus::InvalidAck;
            return false;
        }

        if request.transaction_number == 0 {
            response.status = TransferStatus::InvalidTransactionNumber;
            return false;
        }

        if let Some(last) = self.history.get_last_transaction()
            && last.matches_request(request)
            && last.acknowledgement
        {
            response.status = TransferStatus::PreviouslyCompleted;
            response.amount = Amount::ZERO;
            return false;
        }

        true
    }

    /// A second-phase message acknowledges the transfer in flight: same
    /// transaction number as the accepted message, and the last history
    /// entry still describes it. Returns the amount logged for it.
    fn is_valid_second_phase_message(
        &self,
        request: &TransferRequest,
        previous: Option<&TransferRequest>,
        response: &mut TransferResponse,
    ) -> Option<Amount> {
        let logged = self
            .history
            .get_last_transaction()
            .filter(|last| last.matches_request(request))
            .map(|last| last.reported_amount);

        if !request.acknowledgement {
            if logged.is_some() {
                // resend of the first-phase message
                response.status = TransferStatus::PreviouslyCompleted;
                response.amount = Amount::ZERO;
            } else {
                response.status = TransferStatus::EgmBusy;
            }
            return None;
        }

        let same_transaction =
            previous.is_some_and(|p| p.transaction_number == request.transaction_number);
        if !same_transaction || logged.is_none() {
            response.status = TransferStatus::EgmBusy;
            return None;
        }

        logged
    }

    /// Clamp the amount; nothing left to move refuses the transition.
    fn check_amount(
        handler: &dyn TransferHandler,
        request: &TransferRequest,
        response: &mut TransferResponse,
    ) -> bool {
        let (allowed, exceeded) = handler.check_transfer_amount(request.command, request.amount);
        response.amount = allowed;

        if allowed.is_zero() {
            response.status = if request.amount.is_zero() {
                TransferStatus::InvalidTransferAmount
            } else {
                TransferStatus::TransferAmountExceeded
            };
            return false;
        }

        response.status = if exceeded {
            TransferStatus::TransferAmountExceeded
        } else {
            TransferStatus::OperationSuccessful
        };
        true
    }

    /// The acknowledgement approves the amount announced in the first
    /// phase, which is the amount posted. It is refused once the machine
    /// can no longer move that much.
    fn check_approved_amount(
        handler: &dyn TransferHandler,
        request: &TransferRequest,
        logged: Amount,
        response: &mut TransferResponse,
    ) -> bool {
        let (allowed, _) = handler.check_transfer_amount(request.command, request.amount);
        if allowed < logged {
            debug!(%allowed, %logged, "announced amount no longer transferable");
            response.status = TransferStatus::TransferAmountExceeded;
            response.amount = allowed;
            return false;
        }

        response.amount = logged;
        response.status = if logged < request.amount {
            TransferStatus::TransferAmountExceeded
        } else {
            TransferStatus::OperationSuccessful
        };
        true
    }
}

/// Transition actions
impl Shared {
    fn run_action(self: &Arc<Self>, m: &mut Machine, action: Action) -> Result<bool, EftError> {
        match action {
            Action::None => Ok(true),
            Action::ExecuteCommand => {
                let result = self.execute_command(m);
                if result.is_err() {
                    // still pending, keep it on a timer until it is settled
                    self.start_phase_timer(m);
                }
                result
            }
            Action::NackCommand => Ok(self.nack_command(m)),
            Action::RestartTimers => {
                self.start_phase_timer(m);
                if let Some(handler) = m.previous.and_then(|r| self.handler_for(r.command).ok()) {
                    handler.restart_cashout_timer();
                }
                Ok(true)
            }
        }
    }

    /// Post the approved transfer and finalize its history entry. Always
    /// lets the transition proceed; only a failed history write is an error.
    fn execute_command(&self, m: &Machine) -> Result<bool, EftError> {
        let _commit = self.lock_commit();

        let Some(request) = m.previous else {
            warn!("no transfer in flight, nothing executed");
            return Ok(true);
        };
        let handler = self.handler_for(request.command)?;

        let pending = self
            .history
            .get_last_transaction()
            .filter(|e| e.matches_request(&request) && e.to_be_processed);
        let Some(entry) = pending else {
            warn!(
                command = %request.command,
                transaction = request.transaction_number,
                "no approved history entry, nothing executed"
            );
            return Ok(true);
        };

        if handler.process_transfer(request.command, entry.reported_amount, entry.id) {
            self.history.update_log_entry_for_request_completed(
                request.command,
                request.transaction_number,
                request.amount,
            )?;
            info!(
                command = %request.command,
                direction = ?handler.direction(),
                transaction = request.transaction_number,
                amount = %entry.reported_amount,
                "transfer executed"
            );
        } else {
            self.history.update_log_entry_for_nacked_lp(
                request.command,
                request.transaction_number,
                request.amount,
            )?;
            warn!(
                command = %request.command,
                direction = ?handler.direction(),
                transaction = request.transaction_number,
                "transfer posting failed, approval withdrawn"
            );
        }
        Ok(true)
    }

    /// Withdraw the approval. A transfer the ledger already holds is
    /// finalized instead. The transition proceeds even when the history
    /// write fails.
    fn nack_command(&self, m: &Machine) -> bool {
        let _commit = self.lock_commit();

        let Some(request) = m.previous else {
            return true;
        };
        let posted = self
            .history
            .get_last_transaction()
            .filter(|e| e.matches_request(&request))
            .zip(self.handler_for(request.command).ok())
            .is_some_and(|(entry, handler)| handler.is_transfer_posted(entry.id));

        let result = if posted {
            warn!(
                command = %request.command,
                transaction = request.transaction_number,
                "implied nack for a posted transfer, entry finalized"
            );
            self.history.update_log_entry_for_request_completed(
                request.command,
                request.transaction_number,
                request.amount,
            )
        } else {
            self.history.update_log_entry_for_nacked_lp(
                request.command,
                request.transaction_number,
                request.amount,
            )
        };

        if let Err(e) = result {
            error!(
                command = %request.command,
                transaction = request.transaction_number,
                reason = %e,
                "failed to record implied nack"
            );
        }
        true
    }
}

/// Timers and acknowledgement callbacks
impl Shared {
    fn cancel_timer(m: &mut Machine) {
        if let Some(timer) = m.timer.take() {
            timer.cancel();
        }
        m.timer_generation += 1;
    }

    fn start_phase_timer(self: &Arc<Self>, m: &mut Machine) {
        Self::cancel_timer(m);
        let generation = m.timer_generation;
        let weak: Weak<Shared> = Arc::downgrade(self);
        let timer = self.clock.schedule_once(
            self.phase_timeout,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_callback(Event::PhaseTimer { generation });
                }
            }),
        );
        debug!(generation, timeout = ?self.phase_timeout, "phase timer started");
        m.timer = Some(timer);
    }

    fn ack_handlers(self: &Arc<Self>, seq: u64) -> AckHandlers {
        let callback = |trigger: Trigger| -> AckCallback {
            let weak: Weak<Shared> = Arc::downgrade(self);
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_callback(Event::Ack { seq, trigger });
                }
            })
        };
        AckHandlers {
            implied_ack: callback(Trigger::ImpliedAckReceived),
            implied_nack: callback(Trigger::ImpliedNackReceived),
            intermediate_nack: callback(Trigger::ReAckRequested),
        }
    }

    fn on_callback(self: &Arc<Self>, event: Event) {
        if let Err(e) = self.submit(event) {
            error!(?event, reason = %e, "timer or acknowledgement handling failed");
        }
    }
}
