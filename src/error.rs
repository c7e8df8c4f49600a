use thiserror::Error;

/// Classifies rule-set fetch errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// URL could not be parsed or uses an unsupported scheme
    InvalidUrl,
    /// Server answered with a non-success status code
    Status,
    /// Connection, TLS or timeout failure before a response arrived
    Transport,
    /// I/O error while reading the body or writing the cache file
    Io,
}

/// ACL Engine error types
#[derive(Error, Debug)]
pub enum AclError {
    #[error("Unrecognized block: {0}")]
    UnrecognizedBlock(String),

    #[error("Invalid subnet: {0}")]
    InvalidSubnet(String),

    #[error("Regex error in pattern '{pattern}' (budget {budget} bytes): {message}")]
    RegexCompile {
        pattern: String,
        budget: usize,
        message: String,
    },

    #[error("Fetch error: {message}")]
    Fetch {
        kind: FetchErrorKind,
        message: String,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl AclError {
    pub(crate) fn fetch(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        AclError::Fetch {
            kind,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AclError>;
