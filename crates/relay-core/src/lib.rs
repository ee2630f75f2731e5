pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::WorkflowConfig;
pub use error::{QuotaKind, RelayError, Result};
pub use types::*;
