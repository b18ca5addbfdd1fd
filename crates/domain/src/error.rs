/// Shared error type used across all agentway crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    /// The engine lock did not grant within the requested timeout.
    #[error("lock timeout acquiring {key}")]
    LockTimeout { key: String },

    /// The engine subprocess/session died without sending a terminal event.
    #[error("engine lost: {0}")]
    EngineLost(String),

    /// A submit referenced an engine id that isn't registered.
    #[error("unknown engine id: {0}")]
    UnknownEngine(String),

    /// The store is degraded; callers fall back to in-memory defaults rather
    /// than surfacing this to a channel.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
