//! Error types for the transfer controller.

use thiserror::Error;

use crate::history::HistoryError;
use crate::model::EftCommand;

/// Failures of the controller itself. Host misbehaviour and machine
/// ineligibility are reported through the response status instead.
#[derive(Debug, Error)]
pub enum EftError {
    #[error("{0}")]
    History(#[from] HistoryError),

    #[error("no transfer handler registered for command {0}")]
    NoHandler(EftCommand),
}
