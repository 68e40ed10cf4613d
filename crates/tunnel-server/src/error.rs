//! Error taxonomy for the server stream processor (spec §7).

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("processor is closed")]
    Closed,
    #[error("poll timed out waiting for content")]
    Timeout,
    #[error("bad envelope: {0}")]
    BadEnvelope(String),
    #[error("unknown packet type: {0}")]
    UnknownPacketType(String),
    #[error("push buffer did not accept data within the backpressure window")]
    ShortWrite,
    #[error(transparent)]
    Wire(#[from] tunnel_wire::Error),
    #[error(transparent)]
    Reassembler(#[from] tunnel_reassembler::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
