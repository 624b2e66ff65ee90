//! Machine-side collaborators consulted by the transfer core.
//!
//! The core never owns door, game or disable state. It only queries it
//! through [`EgmStatus`] and applies its own lockup through [`DisableManager`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Identifier of a machine disable condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisableReason(String);

impl DisableReason {
    pub fn new(id: impl Into<String>) -> Self {
        DisableReason(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read-only view of the machine state.
pub trait EgmStatus: Send + Sync {
    fn any_door_open(&self) -> bool;
    fn game_idle(&self) -> bool;
    fn operator_menu_showing(&self) -> bool;
    /// Operator took the machine out of service.
    fn out_of_service(&self) -> bool;
    fn active_disable_reasons(&self) -> Vec<DisableReason>;
}

/// Applies and lifts machine lockups.
pub trait DisableManager: Send + Sync {
    fn disable(&self, reason: &DisableReason, message: &str);
    fn enable(&self, reason: &DisableReason);
}

#[derive(Debug)]
struct SimulatedState {
    door_open: bool,
    game_idle: bool,
    operator_menu: bool,
    out_of_service: bool,
    /// Active disable reasons and the message shown for each.
    disabled: HashMap<DisableReason, String>,
}

/// In-process machine used by the binary and by tests.
#[derive(Debug)]
pub struct SimulatedEgm {
    state: Mutex<SimulatedState>,
}

impl SimulatedEgm {
    /// An idle machine with all doors closed and no lockups.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimulatedState {
                door_open: false,
                game_idle: true,
                operator_menu: false,
                out_of_service: false,
                disabled: HashMap::new(),
            }),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimulatedState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_door_open(&self, open: bool) {
        self.with_state(|s| s.door_open = open);
    }

    pub fn set_game_idle(&self, idle: bool) {
        self.with_state(|s| s.game_idle = idle);
    }

    pub fn set_operator_menu(&self, showing: bool) {
        self.with_state(|s| s.operator_menu = showing);
    }

    pub fn set_out_of_service(&self, out: bool) {
        self.with_state(|s| s.out_of_service = out);
    }

    pub fn is_disabled_by(&self, reason: &DisableReason) -> bool {
        self.with_state(|s| s.disabled.contains_key(reason))
    }

    pub fn lockup_message(&self, reason: &DisableReason) -> Option<String> {
        self.with_state(|s| s.disabled.get(reason).cloned())
    }
}

impl Default for SimulatedEgm {
    fn default() -> Self {
        Self::new()
    }
}

impl EgmStatus for SimulatedEgm {
    fn any_door_open(&self) -> bool {
        self.with_state(|s| s.door_open)
    }

    fn game_idle(&self) -> bool {
        self.with_state(|s| s.game_idle)
    }

    fn operator_menu_showing(&self) -> bool {
        self.with_state(|s| s.operator_menu)
    }

    fn out_of_service(&self) -> bool {
        self.with_state(|s| s.out_of_service)
    }

    fn active_disable_reasons(&self) -> Vec<DisableReason> {
        self.with_state(|s| s.disabled.keys().cloned().collect())
    }
}

impl DisableManager for SimulatedEgm {
    fn disable(&self, reason: &DisableReason, message: &str) {
        self.with_state(|s| {
            s.disabled.insert(reason.clone(), message.to_string());
        });
    }

    fn enable(&self, reason: &DisableReason) {
        self.with_state(|s| {
            s.disabled.remove(reason);
        });
    }
}
