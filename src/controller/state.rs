//! States, triggers and the transition table of the transfer handshake.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EftState {
    /// No transfer in flight.
    Idle,
    /// First-phase message accepted, waiting for the host acknowledgement.
    FirstPhase,
    /// Host acknowledged; the transfer executes on timeout or implied ack.
    SecondPhase,
}

impl EftState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EftState::Idle => "IDLE",
            EftState::FirstPhase => "FIRST_PHASE",
            EftState::SecondPhase => "SECOND_PHASE",
        }
    }
}

impl fmt::Display for EftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    CommandReceived,
    TimerExpired,
    ImpliedAckReceived,
    ImpliedNackReceived,
    ReAckRequested,
}

/// Condition evaluated against the message being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    Always,
    FirstPhaseMessage,
    SecondPhaseMessage,
}

/// Side effect run once the guard passed. Its result gates the transition
/// like a guard does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    ExecuteCommand,
    NackCommand,
    RestartTimers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// No state change, no entry or exit effects.
    Stay,
    /// Run the entry effects of the current state again.
    Reenter,
    To(EftState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub guard: Guard,
    pub action: Action,
    pub on_pass: Target,
    pub on_fail: Target,
}

impl Transition {
    const fn new(guard: Guard, action: Action, on_pass: Target, on_fail: Target) -> Self {
        Self {
            guard,
            action,
            on_pass,
            on_fail,
        }
    }
}

/// Transition for `trigger` in `state`, or `None` when the trigger is not
/// handled there.
pub fn transition(state: EftState, trigger: Trigger) -> Option<Transition> {
    use Action as A;
    use EftState::*;
    use Guard as G;
    use Target::*;
    use Trigger::*;

    let t = match (state, trigger) {
        (Idle, CommandReceived) => {
            Transition::new(G::FirstPhaseMessage, A::None, To(FirstPhase), Stay)
        }

        (FirstPhase, CommandReceived) => {
            Transition::new(G::SecondPhaseMessage, A::None, To(SecondPhase), To(Idle))
        }
        (FirstPhase, TimerExpired) => Transition::new(G::Always, A::None, To(Idle), Stay),

        (SecondPhase, CommandReceived) => {
            Transition::new(G::SecondPhaseMessage, A::None, Reenter, Stay)
        }
        (SecondPhase, TimerExpired) | (SecondPhase, ImpliedAckReceived) => {
            Transition::new(G::Always, A::ExecuteCommand, To(Idle), Stay)
        }
        (SecondPhase, ImpliedNackReceived) => {
            Transition::new(G::Always, A::NackCommand, To(Idle), Stay)
        }
        (SecondPhase, ReAckRequested) => Transition::new(G::Always, A::RestartTimers, Stay, Stay),

        _ => return None,
    };
    Some(t)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_only_accepts_commands() {
        assert!(transition(EftState::Idle, Trigger::CommandReceived).is_some());
        for trigger in [
            Trigger::TimerExpired,
            Trigger::ImpliedAckReceived,
            Trigger::ImpliedNackReceived,
            Trigger::ReAckRequested,
        ] {
            assert_eq!(transition(EftState::Idle, trigger), None);
        }
    }

    #[test]
    fn first_phase_falls_back_to_idle() {
        let t = transition(EftState::FirstPhase, Trigger::CommandReceived).unwrap();
        assert_eq!(t.on_pass, Target::To(EftState::SecondPhase));
        assert_eq!(t.on_fail, Target::To(EftState::Idle));

        let t = transition(EftState::FirstPhase, Trigger::TimerExpired).unwrap();
        assert_eq!(t.action, Action::None);
        assert_eq!(t.on_pass, Target::To(EftState::Idle));

        assert_eq!(
            transition(EftState::FirstPhase, Trigger::ImpliedNackReceived),
            None
        );
    }

    #[test]
    fn second_phase_timeout_executes() {
        for trigger in [Trigger::TimerExpired, Trigger::ImpliedAckReceived] {
            let t = transition(EftState::SecondPhase, trigger).unwrap();
            assert_eq!(t.action, Action::ExecuteCommand);
            assert_eq!(t.on_pass, Target::To(EftState::Idle));
        }
    }

    #[test]
    fn second_phase_nack_and_reack() {
        let t = transition(EftState::SecondPhase, Trigger::ImpliedNackReceived).unwrap();
        assert_eq!(t.action, Action::NackCommand);

        let t = transition(EftState::SecondPhase, Trigger::ReAckRequested).unwrap();
        assert_eq!(t.action, Action::RestartTimers);
        assert_eq!(t.on_pass, Target::Stay);

        let t = transition(EftState::SecondPhase, Trigger::CommandReceived).unwrap();
        assert_eq!(t.on_pass, Target::Reenter);
        assert_eq!(t.on_fail, Target::Stay);
    }

    #[test]
    fn display() {
        assert_eq!(EftState::SecondPhase.to_string(), "SECOND_PHASE");
    }
}
