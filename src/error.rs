//! Error types for the bus bridge.
//!
//! Every failure the bridge can surface maps onto one of the four reply
//! statuses callers see (see [`Status`]).

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    // ─────────────────────────────────────────────────────────────────────
    // Codec Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Malformed signature: {0}")]
    MalformedSignature(String),

    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Value {value} out of range for {target}")]
    RangeError { value: String, target: &'static str },

    #[error("Malformed wire data: {0}")]
    MalformedWireData(String),

    // ─────────────────────────────────────────────────────────────────────
    // Request Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // ─────────────────────────────────────────────────────────────────────
    // Dispatch Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Too many pending requests (capacity {capacity})")]
    Overloaded { capacity: usize },

    #[error("Dispatch loop is not running")]
    ServiceUnavailable,

    // ─────────────────────────────────────────────────────────────────────
    // Bus Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("{name}: {message}")]
    BusError { name: String, message: String },

    #[error("Cannot connect to {bus} bus: {reason}")]
    ConnectionError { bus: String, reason: String },

    #[error("Bus API failure: {0}")]
    BusApi(String),

    // ─────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Shorthand for a [`BridgeError::TypeMismatch`]
    pub fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        BridgeError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Status reported to the caller for this error
    pub fn status(&self) -> Status {
        match self {
            BridgeError::MalformedSignature(_)
            | BridgeError::TypeMismatch { .. }
            | BridgeError::RangeError { .. }
            | BridgeError::MalformedWireData(_)
            | BridgeError::InvalidRequest(_)
            | BridgeError::NotFound(_) => Status::InvalidRequest,
            BridgeError::BusError { .. } => Status::GenericFailure,
            BridgeError::Overloaded { .. }
            | BridgeError::ServiceUnavailable
            | BridgeError::ConnectionError { .. }
            | BridgeError::BusApi(_)
            | BridgeError::Config(_)
            | BridgeError::Io(_)
            | BridgeError::Internal(_) => Status::InternalError,
        }
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::InvalidRequest(err.to_string())
    }
}

impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::Io(err.to_string())
    }
}

#[cfg(feature = "dbus")]
impl From<zbus::Error> for BridgeError {
    fn from(err: zbus::Error) -> Self {
        match err {
            zbus::Error::MethodError(name, message, _) => BridgeError::BusError {
                name: name.to_string(),
                message: message.unwrap_or_default(),
            },
            other => BridgeError::BusApi(other.to_string()),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Completion status of a request, as surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// The request completed
    Success,
    /// The bridge itself failed (no loop, overloaded, bus unavailable, bus API failure)
    InternalError,
    /// Malformed or inconsistent request
    InvalidRequest,
    /// The bus round-trip worked and the peer answered with an error
    GenericFailure,
}

impl Status {
    /// Numeric code of the status
    pub fn code(self) -> i32 {
        match self {
            Status::Success => 0,
            Status::InternalError => -1,
            Status::InvalidRequest => -2,
            Status::GenericFailure => -3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::InternalError => "internal-error",
            Status::InvalidRequest => "invalid-request",
            Status::GenericFailure => "generic-failure",
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
