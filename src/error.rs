use std::io;

use crate::address::Address;

/// Errors from the node and peer session layers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("failed to bind listener on {address}: {source}")]
    Bind { address: Address, source: io::Error },

    #[error("failed to dial {address}: {source}")]
    Dial { address: Address, source: io::Error },

    #[error("multiplexed session error: {0}")]
    Session(#[from] yamux::ConnectionError),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("sender host {claimed} does not match transport host {transport}")]
    SenderMismatch { transport: String, claimed: String },

    #[error("request timed out")]
    Timeout,

    #[error("peer not found in routing table, run discovery first")]
    NotFound,

    #[error("message failed validation")]
    Validation,

    #[error("signature error: {0}")]
    Signature(String),

    #[error("{} address(es) could not be reached", .0.len())]
    Aggregate(Vec<Error>),

    #[error("session is shut down")]
    Shutdown,
}

/// Errors from the framing and codec layer.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("frame too large: {0} bytes (max {MAX_FRAME_LEN})")]
    FrameTooLarge(usize),

    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("frame encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Largest framed message accepted off the wire.
pub const MAX_FRAME_LEN: usize = 100_000_000;
