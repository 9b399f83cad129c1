use std::path::PathBuf;

use crate::domain::SessionId;

/// Core error type for the fleet.
///
/// Transport adapters map their specific errors into this type so the core can
/// handle failures consistently (report to the caller, never retry).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {path}: {reason}")]
    Persistence { path: PathBuf, reason: String },

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("external error: {0}")]
    External(String),
}

/// Structured failure of a pairing request.
///
/// Returned synchronously from the request, in the same call that would
/// otherwise have produced the pairing code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("invalid phone number: {0}")]
    InvalidFormat(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("pairing already in progress for {0}")]
    AlreadyPairing(SessionId),
}

impl PairingError {
    /// Stable machine-readable kind, used by presentation layers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFormat(_) => "invalid-format",
            Self::Transport(_) => "transport-failure",
            Self::AlreadyPairing(_) => "already-pairing",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
