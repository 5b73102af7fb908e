/// Core error type for the daemon.
///
/// Adapter crates map their specific errors into this type so the core can
/// handle failures consistently (user-facing message vs retryable vs logged).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call to {method} timed out")]
    Timeout { method: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    /// Short classification string used in usage/audit records.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Security(_) => "security",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Transport(_) => "transport",
            Error::Timeout { .. } => "timeout",
            Error::MalformedFrame(_) => "malformed_frame",
            Error::Rpc { .. } => "rpc",
            Error::External(_) => "external",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
