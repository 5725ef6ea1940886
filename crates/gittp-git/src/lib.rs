//! Git smart HTTP protocol support for gittp.
//!
//! This crate holds the protocol side of the bridge between an HTTP server and
//! the `git-upload-pack` / `git-receive-pack` executables: pkt-line framing
//! (including the side-band multiplexing used to stream hook output back to a
//! pushing client), classification of incoming requests, and parsing of the
//! receive-pack negotiation line.
//!
//! Pack data itself is never interpreted here; it is opaque payload forwarded
//! to and from the external git process.

mod error;
mod negotiation;
mod pktline;
mod service;

pub use error::GitError;
pub use negotiation::{split_negotiation, ReceivePackNegotiation, ZERO_ID};
pub use pktline::{
    decode, encode, encode_ref_advertisement, encode_sideband, FlushMode, PktLine, PktLineReader,
    SidebandWriter, StreamCode, TrailingFlush, FLUSH_PKT, MAX_PKT_DATA,
};
pub use service::{detect_service, parse_repo_name, ServiceRequest, ServiceType};

/// Result type for git protocol operations.
pub type Result<T> = std::result::Result<T, GitError>;
