//! Error types shared across every component of the crate.
//!
//! Struct-style `thiserror` variants with small named constructors, rather
//! than a single tuple-of-string catch-all. The variant set covers
//! replication/storage/command failure modes, not a generic
//! client-library error set.

use thiserror::Error;

/// Result type alias used throughout the crate's public API.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by storage, transport, replication, and command
/// processing. Every variant carries a human-readable message; none leak
/// source-language identifiers or stack traces to callers.
#[derive(Error, Debug)]
pub enum Error {
    /// Key/value size, UTF-8, or shape violations caught before any state
    /// change is applied.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A single-key, bulk, or anti-entropy operation exceeded its deadline.
    #[error("timeout error: {message}")]
    Timeout { message: String },

    /// The transport is not `connected` and the caller requires it to be.
    #[error("disconnected: {message}")]
    Disconnected { message: String },

    /// The offline queue is at capacity and cannot accept this write.
    #[error("backpressure: {message}")]
    Backpressure { message: String },

    /// `increment`/`decrement` would overflow a signed 64-bit integer.
    #[error("arithmetic overflow: {message}")]
    OverflowArithmetic { message: String },

    /// A numeric operation was attempted on a non-numeric stored value.
    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    /// Replication event encoding/decoding failed.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// The storage backend (in-memory invariant or persistence I/O) failed.
    #[error("storage error: {message}")]
    Storage { message: String },

    /// The MQTT transport reported a failure unrelated to plain
    /// disconnection (e.g. CONNACK rejection, publish failure).
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A security policy was violated (e.g. TLS downgrade attempt).
    #[error("security error: {message}")]
    Security { message: String },

    /// Anything else: invariant violations, unreachable states.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation { message: msg.into() }
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout { message: msg.into() }
    }

    pub fn disconnected<S: Into<String>>(msg: S) -> Self {
        Error::Disconnected { message: msg.into() }
    }

    pub fn backpressure<S: Into<String>>(msg: S) -> Self {
        Error::Backpressure { message: msg.into() }
    }

    pub fn overflow<S: Into<String>>(msg: S) -> Self {
        Error::OverflowArithmetic { message: msg.into() }
    }

    pub fn type_mismatch<S: Into<String>>(msg: S) -> Self {
        Error::TypeMismatch { message: msg.into() }
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Error::Codec { message: msg.into() }
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Error::Storage { message: msg.into() }
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Error::Transport { message: msg.into() }
    }

    pub fn security<S: Into<String>>(msg: S) -> Self {
        Error::Security { message: msg.into() }
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal { message: msg.into() }
    }

    /// Stable machine-readable code for the response envelope's
    /// `error.code` field.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation { .. } => "VALIDATION",
            Error::Timeout { .. } => "TIMEOUT",
            Error::Disconnected { .. } => "DISCONNECTED",
            Error::Backpressure { .. } => "BACKPRESSURE",
            Error::OverflowArithmetic { .. } => "OVERFLOW_ARITHMETIC",
            Error::TypeMismatch { .. } => "TYPE_MISMATCH",
            Error::Codec { .. } => "CODEC",
            Error::Storage { .. } => "STORAGE",
            Error::Transport { .. } => "TRANSPORT",
            Error::Security { .. } => "SECURITY",
            Error::Internal { .. } => "INTERNAL",
        }
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Storage { message: err.to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_stable_per_variant() {
        assert_eq!(Error::validation("x").code(), "VALIDATION");
        assert_eq!(Error::overflow("x").code(), "OVERFLOW_ARITHMETIC");
        assert_eq!(Error::disconnected("x").code(), "DISCONNECTED");
    }

    #[test]
    fn message_is_preserved_in_display() {
        let e = Error::storage("disk full");
        assert!(e.to_string().contains("disk full"));
    }
}
