//! Client-side configuration: endpoint URLs and the tunable windows named in
//! spec §4.5 and §6 (push retry backoff, poll timeout, cache limits).

use std::time::Duration;

/// How many HTTP attempts `write-packet`/`write-bytes` make before surfacing
/// `TransportFailed`: the initial attempt plus 3 retries (spec §4.5 "retries
/// up to 3 times with linear backoff (1, 2, 3 s)").
pub const PUSH_MAX_ATTEMPTS: u32 = 4;

/// Cache poll interval used by `read-packet` while waiting for a pending
/// request id to resolve.
pub const CACHE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Overall `read-packet` wait budget before raising `Timeout`.
pub const READ_PACKET_TIMEOUT: Duration = Duration::from_secs(35);

/// GET long-poll timeout advertised to the server via the `timeout` query
/// parameter.
pub const POLL_TIMEOUT_SECS: u64 = 28;

/// Control response cache size cap (spec §6 "response cache 1000 entries").
pub const CACHE_MAX_ENTRIES: usize = 1000;

/// Control response cache entry TTL (spec §6 "60 s TTL").
pub const CACHE_TTL: Duration = Duration::from_secs(60);

/// Capacity of the internal request-id channel the poll loop consumes from.
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `read-bytes` waits between nudging the poll loop while the data
/// buffer is underfilled.
pub const READ_BYTES_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Endpoint URLs and static identity for one client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub push_url: String,
    pub poll_url: String,
    /// Advisory client id sent in the initial handshake; `0` for anonymous.
    pub client_id: i64,
    /// Seeds the processor's connection id instead of waiting for the first
    /// push reply to assign one. Used when a data-typed processor joins a
    /// connection a control-typed processor already established.
    pub connection_id: Option<String>,
}

impl ClientConfig {
    pub fn new(push_url: impl Into<String>, poll_url: impl Into<String>) -> Self {
        ClientConfig {
            push_url: push_url.into(),
            poll_url: poll_url.into(),
            client_id: 0,
            connection_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: i64) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_connection_id(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }
}
