use thiserror::Error;

/// Failures reported by a radio backend.
#[derive(Debug, Error)]
pub enum RadioError {
    #[error("no interface connected")]
    NotConnected,

    #[error("device error: {0}")]
    Device(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum ModjamError {
    #[error(transparent)]
    Radio(#[from] RadioError),

    #[error("event log: {0}")]
    Io(#[from] std::io::Error),

    #[error("event log encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = ModjamError> = std::result::Result<T, E>;
