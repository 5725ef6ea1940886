//! Git protocol error types.

use thiserror::Error;

/// Errors that can occur while framing, classifying or parsing git traffic.
#[derive(Debug, Error)]
pub enum GitError {
    /// The 4-byte length header is not a hexadecimal quantity, or is too small.
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    /// The payload does not fit a 4-digit length header.
    #[error("pkt-line payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// The stream ended before the declared packet length was read.
    #[error("truncated packet: expected {expected} bytes, got {actual}")]
    TruncatedPacket {
        /// Bytes the header promised (excluding the header itself).
        expected: usize,
        /// Bytes that were actually available.
        actual: usize,
    },

    /// The request URI does not name `git-upload-pack` or `git-receive-pack`.
    #[error("no matching service types found in {0}")]
    NoMatchingService(String),

    /// The request path does not end in a git smart HTTP endpoint.
    #[error("pushed url needs to be in user/project.git format: {0}")]
    NotAGitRequest(String),

    /// The first receive-pack command line could not be parsed.
    #[error("malformed receive-pack negotiation: {0}")]
    MalformedNegotiation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
