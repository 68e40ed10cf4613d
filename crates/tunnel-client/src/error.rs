use thiserror::Error;

/// Errors produced by the client stream processor and byte-stream adapter.
#[derive(Debug, Error)]
pub enum Error {
    /// The processor is shut down; all further operations reject.
    #[error("processor closed")]
    Closed,

    /// A poll/read-packet call exceeded its window.
    #[error("timed out waiting for a response")]
    Timeout,

    /// An HTTP push or poll failed after exhausting retries.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// The peer closed mid-read of a sized read.
    #[error("unexpected EOF")]
    UnexpectedEOF,

    #[error(transparent)]
    Wire(#[from] tunnel_wire::Error),

    #[error(transparent)]
    Reassembler(#[from] tunnel_reassembler::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
