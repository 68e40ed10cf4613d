use thiserror::Error;

/// Errors produced by the wire layer: envelope codec, fragment codec, and
/// packet type conversion. Reassembler invariants live in `tunnel-reassembler`.
#[derive(Debug, Error)]
pub enum Error {
    /// Base64/gzip/json decode of a `TunnelPackage` header failed.
    #[error("bad envelope: {0}")]
    BadEnvelope(String),

    /// A packet type tag outside the closed wire-string set.
    #[error("unknown packet type: {0}")]
    UnknownPacketType(String),

    /// A connection id did not satisfy the `conn_` prefix / length contract.
    #[error("invalid connection id: {0}")]
    InvalidConnectionId(String),

    /// The encoded envelope exceeded the 64 KiB header budget.
    #[error("envelope too large: {0} bytes")]
    EnvelopeTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
