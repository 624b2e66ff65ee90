//! Machine-state checks a transfer must pass before each phase.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::EftConfig;
use crate::egm::{DisableReason, EgmStatus};
use crate::handler::TransferHandler;
use crate::model::TransferStatus;

pub struct EligibilityPolicy {
    egm: Arc<dyn EgmStatus>,
    /// Disable reasons that never block a transfer.
    non_blocking: HashSet<DisableReason>,
    /// Disable reasons caused by the host or an offline link.
    host_disable: HashSet<DisableReason>,
}

impl EligibilityPolicy {
    pub fn new(
        egm: Arc<dyn EgmStatus>,
        non_blocking: impl IntoIterator<Item = DisableReason>,
        host_disable: impl IntoIterator<Item = DisableReason>,
    ) -> Self {
        Self {
            egm,
            non_blocking: non_blocking.into_iter().collect(),
            host_disable: host_disable.into_iter().collect(),
        }
    }

    pub fn from_config(egm: Arc<dyn EgmStatus>, config: &EftConfig) -> Self {
        Self::new(
            egm,
            config.non_blocking_conditions.iter().cloned(),
            config.host_disable_conditions.iter().cloned(),
        )
    }

    /// Status of the machine for a transfer served by `handler`. The first
    /// matching check wins, in this order:
    /// - any door open
    /// - game in progress or operator menu showing
    /// - blocking disable reasons (tilt, or host disable if the handler stops on it)
    /// - out of service
    pub fn check_and_set_transaction_status(
        &self,
        handler: &dyn TransferHandler,
    ) -> TransferStatus {
        if self.egm.any_door_open() {
            return TransferStatus::EgmDoorOpen;
        }

        if !self.egm.game_idle() || self.egm.operator_menu_showing() {
            return TransferStatus::InGamePlayMode;
        }

        let blocking: Vec<DisableReason> = self
            .egm
            .active_disable_reasons()
            .into_iter()
            .filter(|reason| !self.non_blocking.contains(reason))
            .collect();
        if !blocking.is_empty() {
            if blocking.iter().any(|reason| !self.host_disable.contains(reason)) {
                return TransferStatus::EgmInTiltCondition;
            }
            if handler.stop_transfer_if_disabled_by_host() {
                return TransferStatus::EgmDisabled;
            }
        }

        if self.egm.out_of_service() {
            return TransferStatus::EgmOutOfService;
        }

        TransferStatus::OperationSuccessful
    }
}
