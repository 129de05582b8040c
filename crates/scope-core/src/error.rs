//! Error types shared by every scope-daq crate.
//!
//! `ScopeError` consolidates the failure kinds a driver can hit, from byte-level
//! transport faults up to caller mistakes such as asking for a capability the
//! instrument does not have.
//!
//! ## Error Categories
//!
//! 1. **Transport** - `Transport`, `Io`, `Timeout`, `ConnectionClosed`
//!    - Byte-level failures reported by the transport.
//!    - Recovery: the acquisition engine retries up to three times per capture.
//!
//! 2. **Protocol** - `PreambleMalformed`, `LengthMismatch`, `OutOfSync`, `ResyncFailed`
//!    - Replies that do not match what was asked for.
//!    - Recovery: resynchronise the reply stream, then retry. A failed resync is fatal
//!      for the connection.
//!
//! 3. **Caller** - `Unsupported`, `InvalidParameter`, `Config`
//!    - Reported to the caller with no side effects on the instrument or cache.
//!
//! Warnings (unknown probe model, unrecognised bandwidth string, ...) are never
//! errors; they are logged with `tracing::warn!`.

use thiserror::Error;

/// Convenience alias for results using [`ScopeError`].
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

/// Primary error type for the oscilloscope runtime.
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Byte-level transport failure (socket reset, short write, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Standard I/O failure surfaced by a transport implementation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply arrived within the transport's timeout.
    #[error("Timeout waiting for reply to '{0}'")]
    Timeout(String),

    /// The instrument closed the connection.
    #[error("Connection closed by instrument")]
    ConnectionClosed,

    /// A WAVEDESC/WFMPRE descriptor had the wrong size, field count or an
    /// out-of-range field.
    #[error("Malformed waveform preamble: {0}")]
    PreambleMalformed(String),

    /// A binary block header declared a different length than what arrived.
    #[error("Block length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Reply/request correlation was lost.
    #[error("Reply stream out of sync: {0}")]
    OutOfSync(String),

    /// The PRBS resynchronisation pass did not find a matching offset.
    /// The connection must be considered dead.
    #[error("Resynchronisation failed: {0}")]
    ResyncFailed(String),

    /// The caller asked for a feature the instrument family does not advertise.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// A parameter value outside the enumerated legal set.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A reply that could not be parsed into the expected type.
    #[error("Failed to parse '{reply}' as {expected}")]
    Parse { reply: String, expected: &'static str },

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ScopeError {
    /// Build a parse error from the offending reply.
    pub fn parse(reply: impl Into<String>, expected: &'static str) -> Self {
        Self::Parse {
            reply: reply.into(),
            expected,
        }
    }

    /// Faults that are worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Io(_)
                | Self::Timeout(_)
                | Self::PreambleMalformed(_)
                | Self::LengthMismatch { .. }
                | Self::OutOfSync(_)
                | Self::Parse { .. }
        )
    }

    /// Faults after which the reply stream can no longer be trusted.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            Self::OutOfSync(_)
                | Self::PreambleMalformed(_)
                | Self::LengthMismatch { .. }
                | Self::Timeout(_)
                | Self::Parse { .. }
        )
    }

    /// Faults that end the session for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ResyncFailed(_) | Self::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ScopeError::Timeout("INR?".into()).is_transient());
        assert!(ScopeError::LengthMismatch {
            expected: 10,
            actual: 4
        }
        .requires_resync());
        assert!(!ScopeError::Unsupported("dmm".into()).is_transient());
        assert!(!ScopeError::InvalidParameter("x".into()).requires_resync());
        assert!(ScopeError::ResyncFailed("no lock".into()).is_fatal());
    }

    #[test]
    fn test_display() {
        let err = ScopeError::parse("abc", "f64");
        assert_eq!(err.to_string(), "Failed to parse 'abc' as f64");
        let err = ScopeError::LengthMismatch {
            expected: 200_000,
            actual: 100_000,
        };
        assert!(err.to_string().contains("200000"));
    }
}
