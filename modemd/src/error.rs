use crate::session::SessionState;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("cannot {op} while session is {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("permission denied")]
    AccessDenied,

    #[error("transport is not available")]
    TransportUnavailable,

    #[error("failed to allocate {0}")]
    AllocationFailure(String),

    #[error("could not resolve transport path for {0}")]
    PathUnresolved(String),

    #[error("another request is pending")]
    Busy,

    #[error("already enabled")]
    AlreadyEnabled,

    #[error("already disabled")]
    AlreadyDisabled,

    #[error("not supported")]
    NotSupported,

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("passphrase required")]
    PassphraseRequired,

    #[error("request was cancelled")]
    Cancelled,

    #[error("transport call failed: {0}")]
    Transport(String),

    #[error("device operation failed: {0}")]
    Device(String),
}

impl Error {
    pub(crate) fn transport(report: color_eyre::Report) -> Self {
        Self::Transport(format!("{report:#}"))
    }

    pub(crate) fn device(report: color_eyre::Report) -> Self {
        Self::Device(format!("{report:#}"))
    }
}
