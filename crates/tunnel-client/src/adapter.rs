//! Client half of the byte-stream adapter (spec §4.8): presents
//! write-bytes/read-bytes as a reliable ordered stream.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::processor::ClientStreamProcessor;

#[derive(Clone)]
pub struct ClientByteStream {
    processor: Arc<ClientStreamProcessor>,
}

impl ClientByteStream {
    pub fn new(processor: Arc<ClientStreamProcessor>) -> Self {
        ClientByteStream { processor }
    }

    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.processor.write_bytes(data).await
    }

    /// Blocks until at least one byte is available, up to `max`, or the
    /// processor closes (`Closed`) — the adapter's documented contract
    /// (spec §4.8: "read blocks until at least one byte or until the
    /// processor closes"). Short reads are expected; callers wanting an
    /// exact length should use [`Self::read_exact`] instead.
    pub async fn read(&self, max: usize) -> Result<Vec<u8>> {
        loop {
            if self.is_eof() {
                return Err(crate::error::Error::Closed);
            }
            match tokio::time::timeout(Duration::from_millis(50), self.read_exact(1)).await {
                Ok(Ok(first_byte)) => {
                    let mut out = first_byte;
                    if max > 1 {
                        if let Ok(Ok(mut rest)) =
                            tokio::time::timeout(Duration::from_millis(5), self.read_exact(max - 1)).await
                        {
                            out.append(&mut rest);
                        }
                    }
                    return Ok(out);
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => continue,
            }
        }
    }

    /// Exact-length read: blocks until `n` bytes are available or the
    /// processor closes/times out (§4.5 `read-bytes(n)`). Not the adapter's
    /// own short-read `read` contract — see [`Self::read`].
    pub async fn read_exact(&self, n: usize) -> Result<Vec<u8>> {
        self.processor.read_bytes(n).await
    }

    pub fn is_eof(&self) -> bool {
        self.processor.is_closed()
    }
}
