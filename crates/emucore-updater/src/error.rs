use emucore_registry::StoreError;
use thiserror::Error;

/// Errors delivered through a [`crate::Pending`] result.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("an operation on core {0} is already in progress")]
    AlreadyInProgress(String),
    #[error("core {0} has no previous version to revert to")]
    NoBackupAvailable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),
    #[error("unknown core {0}")]
    UnknownIdentity(String),
    #[error("core {0} is already up to date")]
    UpToDate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("core updater has shut down")]
    UpdaterStopped,
}

impl UpdateError {
    pub fn is_busy(&self) -> bool {
        matches!(self, UpdateError::AlreadyInProgress(_))
    }
}
