use std::io;
use std::path::PathBuf;

use nodectl_protocol::RunState;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Failures surfaced at the supervisor boundary. Every variant corresponds
/// to a stable terminal `RunState`; no error leaves the state machine in a
/// transitional value.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The submitted `NodeConfig` failed validation. Local, never retried.
    #[error("invalid node config: {reason}")]
    InvalidConfig { reason: String },

    /// `start` was issued while a run is active or an update is in flight.
    /// The message must read correctly for both, so it names the state
    /// without prescribing a remedy.
    #[error("cannot start while the node is {state}")]
    AlreadyRunning { state: RunState },

    /// `stop` was issued with no active run.
    #[error("node is not running (currently {state})")]
    NotRunning { state: RunState },

    /// `check_for_update` was issued outside `Stopped`.
    #[error("busy: cannot update while the node is {state}")]
    Busy { state: RunState },

    /// The worker binary is absent at its install location. The caller
    /// should run an update first.
    #[error("worker binary not found at {path}; run an update to install it")]
    ExecutableMissing { path: PathBuf },

    /// The OS rejected the launch.
    #[error("failed to spawn worker process: {error}")]
    Spawn {
        #[source]
        error: io::Error,
    },

    /// Waiting on or signalling the worker failed. The run still resolves
    /// to `Stopped`.
    #[error("failed to terminate worker process: {error}")]
    Terminate {
        #[source]
        error: io::Error,
    },

    /// Release index or binary transfer failure; any partial artifact has
    /// been discarded.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Reading or writing the persisted settings file failed.
    #[error("failed to access settings: {error}")]
    Settings {
        #[source]
        error: io::Error,
    },
}

/// Failures during release lookup or binary download.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("network error: {error}")]
    Network {
        #[source]
        error: reqwest::Error,
    },

    #[error("release index returned HTTP {status}")]
    Http { status: u16 },

    #[error("no release asset named {asset} was found")]
    NoReleaseFound { asset: String },

    #[error("transfer ended early: received {received} of {expected} bytes")]
    IncompleteTransfer { received: u64, expected: u64 },

    #[error("disk error while saving the binary: {error}")]
    Io {
        #[source]
        error: io::Error,
    },
}

impl TransferError {
    pub(crate) fn network(error: reqwest::Error) -> Self {
        Self::Network { error }
    }

    pub(crate) fn io(error: io::Error) -> Self {
        Self::Io { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn start_conflict_message_fits_every_blocking_state() {
        let running = SupervisorError::AlreadyRunning {
            state: RunState::Running,
        };
        assert_eq!(running.to_string(), "cannot start while the node is running");

        // A refusal during an update must not tell the user to stop a node
        // that is not running.
        let updating = SupervisorError::AlreadyRunning {
            state: RunState::Updating,
        };
        assert_eq!(updating.to_string(), "cannot start while the node is updating");
        assert!(!updating.to_string().contains("stop"));
    }
}
