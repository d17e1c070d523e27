//! Error types for the session engine.
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`].
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Wire protocol | [`Error::MalformedMessage`] |
//! | Flow control | [`Error::TooManyPending`], [`Error::RequestTooLong`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::RetriesExhausted`] |
//! | Server | [`Error::ServerError`] |
//! | Engine | [`Error::EngineClosed`] |
//!
//! Malformed wire input is reported to the application through the
//! session-fatal path with internal error code 61; see the session engine.

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;

use crate::identifiers::RequestId;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

/// Internal error code used when the server sends a line the codec cannot
/// parse. Frozen by the wire protocol.
pub const ILLEGAL_MESSAGE_CODE: i32 = 61;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A protocol line did not match any known message grammar.
    ///
    /// The original text is preserved for diagnostics; decoding never
    /// panics past its boundary.
    #[error("Malformed message received: {line}")]
    MalformedMessage {
        /// The offending line, verbatim.
        line: String,
    },

    /// Too many control requests awaiting a response.
    #[error("Too many pending requests: {pending}/{limit}")]
    TooManyPending {
        /// Current number of pending requests.
        pending: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// An encoded control request exceeds the server-mandated length limit.
    #[error("Request {request_id} exceeds request limit: {length} > {limit}")]
    RequestTooLong {
        /// The rejected request.
        request_id: RequestId,
        /// Encoded length in bytes.
        length: usize,
        /// Limit reported by the server in `CONOK`.
        limit: u64,
    },

    /// Transport-level failure while opening or using a stream.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
    },

    /// The transport closed while the engine still needed it.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A control request ran out of retry attempts.
    #[error("Request {request_id} abandoned after {attempts} attempts")]
    RetriesExhausted {
        /// The abandoned request.
        request_id: RequestId,
        /// Attempts performed, including the first.
        attempts: u32,
    },

    /// The server reported a fatal session error.
    #[error("Server error {code}: {message}")]
    ServerError {
        /// Protocol error code.
        code: i32,
        /// Server-supplied description.
        message: String,
    },

    /// The engine task has terminated and no longer accepts commands.
    #[error("Session engine closed")]
    EngineClosed,
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a malformed-message error preserving the original line.
    #[inline]
    pub fn malformed(line: impl Into<String>) -> Self {
        Self::MalformedMessage { line: line.into() }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a server error.
    #[inline]
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::ServerError {
            code,
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a transport-level connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::RetriesExhausted { .. }
        )
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors drive a new create/bind/recovery attempt rather
    /// than terminating the client.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectionClosed)
    }

    /// Returns `true` if this error terminates the session fatally.
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MalformedMessage { .. } | Self::ServerError { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================
