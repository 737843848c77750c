use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::UpdateError;

/// Completion of an updater command.
///
/// The result is sent from the updater's owner thread after the command's
/// state transition has been committed and announced, so a caller that has
/// its result already sees the new state in the registry.
#[derive(Debug)]
pub struct Pending<T> {
    receiver: Receiver<Result<T, UpdateError>>,
}

pub(crate) type Responder<T> = Sender<Result<T, UpdateError>>;

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Responder<T>, Self) {
        let (tx, rx) = bounded(1);
        (tx, Self { receiver: rx })
    }

    pub(crate) fn ready(result: Result<T, UpdateError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Blocks until the command completes.
    pub fn blocking_get(self) -> Result<T, UpdateError> {
        match self.receiver.recv() {
            Ok(result) => result,
            Err(_) => Err(UpdateError::UpdaterStopped),
        }
    }

    /// Waits up to `timeout`; hands the handle back if the command is still running.
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, UpdateError>, Self> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(UpdateError::UpdaterStopped)),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<Result<T, UpdateError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(UpdateError::UpdaterStopped)),
        }
    }
}
