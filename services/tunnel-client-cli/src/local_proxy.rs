//! Local TCP listener that bridges accepted connections onto a tunneled
//! byte stream, mirroring the teacher's per-stream local proxy: bind once,
//! accept loop in a background task, one tunnel byte-stream shared by every
//! local consumer.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use tunnel_client::ClientByteStream;

const READ_CHUNK: usize = 4096;

/// A handle to a running local proxy.
pub struct LocalProxy {
    pub port: u16,
}

impl LocalProxy {
    /// Bind a TCP listener on `port` and start bridging accepted connections
    /// through `stream`.
    pub async fn bind(port: u16, stream: ClientByteStream) -> std::io::Result<Self> {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let listener = TcpListener::bind(addr).await?;
        let bound_port = listener.local_addr()?.port();
        info!(port = bound_port, "local proxy bound");

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        debug!(?peer, port = bound_port, "local consumer connected");
                        tokio::spawn(serve_consumer(socket, stream.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
        });

        Ok(Self { port: bound_port })
    }
}

/// Bridge one local TCP consumer with the tunnel byte stream: consumer bytes
/// go in via write, tunnel bytes come out via read, until either side closes.
async fn serve_consumer(socket: TcpStream, stream: ClientByteStream) {
    let (mut read_half, mut write_half) = socket.into_split();
    let upload_stream = stream.clone();

    let upload = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if upload_stream.write(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let download = tokio::spawn(async move {
        loop {
            if stream.is_eof() {
                break;
            }
            match stream.read(READ_CHUNK).await {
                Ok(bytes) if bytes.is_empty() => continue,
                Ok(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let _ = tokio::join!(upload, download);
}
