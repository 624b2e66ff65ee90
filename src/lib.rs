pub mod amount;
pub mod clock;
pub mod config;
pub mod controller;
pub mod csv;
pub mod egm;
pub mod eligibility;
pub mod handler;
pub mod history;
pub mod ledger;
pub mod model;
pub mod recovery;
pub mod session;
pub mod storage;

pub use amount::Amount;
pub use controller::{EftController, EftError, EftState};
pub use model::{EftCommand, TransferRequest, TransferResponse, TransferStatus};
pub use session::{ScriptEvent, Session};
