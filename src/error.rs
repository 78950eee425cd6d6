use thiserror::Error;

use crate::api::ApiError;

/// Failure taxonomy for the sync core. Transport and poll failures are
/// handled inside their owning loops; only configuration problems, terminal
/// reconnect exhaustion, and collaborator API errors cross the crate
/// boundary.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Api(#[from] ApiError),
}
