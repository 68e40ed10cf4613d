//! Client Stream Processor (spec §4.5): push pipeline, long-poll loop,
//! response cache, and the fragment-backed byte interface.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use uuid::Uuid;

use tunnel_wire::packet::{envelope_to_packet, packet_to_envelope};
use tunnel_wire::{fragment, EnvelopeMeta, FragmentResponse, Packet, TunnelPackage, TunnelType};

use crate::cache::ResponseCache;
use crate::config::{
    ClientConfig, CACHE_POLL_INTERVAL, POLL_TIMEOUT_SECS, PUSH_MAX_ATTEMPTS,
    READ_BYTES_POLL_INTERVAL, READ_PACKET_TIMEOUT, REQUEST_CHANNEL_CAPACITY,
};
use crate::error::{Error, Result};

const TUNNEL_PACKAGE_HEADER: &str = "X-Tunnel-Package";
/// Poll iterations that fail outright back off briefly before retrying, so a
/// dead server doesn't spin the loop hot.
const POLL_FAILURE_BACKOFF: Duration = Duration::from_millis(200);

/// Drives one client-side connection: the push pipeline, the background
/// long-poll loop, and the buffers `read-packet`/`read-bytes` drain.
pub struct ClientStreamProcessor {
    config: ClientConfig,
    http: reqwest::Client,
    tunnel_type: TunnelType,
    connection_id: RwLock<Option<String>>,
    closed: AtomicBool,
    received_packets: Mutex<VecDeque<Packet>>,
    cache: ResponseCache,
    pending_request_id: Mutex<Option<String>>,
    request_tx: mpsc::Sender<String>,
    data_poll_start: AtomicBool,
    data_poll_notify: Notify,
    data_buffer: Mutex<VecDeque<u8>>,
    data_buffer_notify: Notify,
    reassembler: tunnel_reassembler::FragmentReassembler,
    next_seq: AtomicI64,
}

impl ClientStreamProcessor {
    /// Builds a processor and spawns its background poll loop. `tunnel_type`
    /// must be `Control` or `Data`; `Keepalive` is poll-only and has no
    /// client-side processor.
    pub fn new(config: ClientConfig, tunnel_type: TunnelType) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let initial_connection_id = config.connection_id.clone();
        let processor = Arc::new(ClientStreamProcessor {
            config,
            http: reqwest::Client::new(),
            tunnel_type,
            connection_id: RwLock::new(initial_connection_id),
            closed: AtomicBool::new(false),
            received_packets: Mutex::new(VecDeque::new()),
            cache: ResponseCache::new(),
            pending_request_id: Mutex::new(None),
            request_tx,
            data_poll_start: AtomicBool::new(tunnel_type != TunnelType::Data),
            data_poll_notify: Notify::new(),
            data_buffer: Mutex::new(VecDeque::new()),
            data_buffer_notify: Notify::new(),
            reassembler: tunnel_reassembler::FragmentReassembler::new(),
            next_seq: AtomicI64::new(0),
        });
        tokio::spawn(Arc::clone(&processor).run_poll_loop(request_rx));
        processor
    }

    /// Releases the gate that lets a data-typed processor's poll loop begin
    /// (spec §4.5 "starts only after a data-poll-start signal is set").
    pub fn start_data_poll(&self) {
        self.data_poll_start.store(true, Ordering::SeqCst);
        self.data_poll_notify.notify_one();
    }

    pub async fn connection_id(&self) -> Option<String> {
        self.connection_id.read().await.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.received_packets.lock().await.clear();
        self.data_buffer_notify.notify_waiters();
        self.data_poll_notify.notify_waiters();
    }

    // -- write-packet -------------------------------------------------

    pub async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let request_id = Uuid::new_v4().to_string();
        let meta = EnvelopeMeta {
            connection_id: self.connection_id().await,
            request_id: Some(request_id.clone()),
            client_id: Some(self.config.client_id),
            mapping_id: None,
            tunnel_type: Some(TunnelType::Control),
        };
        let envelope = packet_to_envelope(&packet, meta);
        let header = tunnel_wire::envelope::encode(&envelope)?;

        if let Some(reply) = self.push_with_retry(header, None).await? {
            self.adopt_push_reply(&request_id, reply).await?;
        }
        Ok(())
    }

    async fn adopt_push_reply(&self, request_id: &str, reply: TunnelPackage) -> Result<()> {
        let matches = reply.request_id.as_deref().is_none_or(|id| id == request_id);
        if !matches {
            tracing::warn!(
                expected = request_id,
                got = ?reply.request_id,
                "dropping mismatched push response"
            );
            return Ok(());
        }
        if let Some(new_conn) = &reply.connection_id {
            *self.connection_id.write().await = Some(new_conn.clone());
        }
        if reply.packet_type.is_some() {
            let decoded = envelope_to_packet(&reply)?;
            self.received_packets.lock().await.push_back(decoded);
        }
        Ok(())
    }

    // -- read-packet ----------------------------------------------------

    pub async fn read_packet(&self) -> Result<Packet> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if let Some(packet) = self.received_packets.lock().await.pop_front() {
            return Ok(packet);
        }

        let request_id = self.take_or_enqueue_request_id().await;
        let deadline = Instant::now() + READ_PACKET_TIMEOUT;
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if let Some(pkg) = self.cache.take(&request_id).await {
                return Ok(envelope_to_packet(&pkg)?);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(CACHE_POLL_INTERVAL).await;
        }
    }

    async fn take_or_enqueue_request_id(&self) -> String {
        let mut pending = self.pending_request_id.lock().await;
        if let Some(id) = pending.take() {
            return id;
        }
        let id = Uuid::new_v4().to_string();
        let _ = self.request_tx.try_send(id.clone());
        id
    }

    /// Assigns a fresh request id for the poll loop to act on immediately,
    /// to be picked up by the next `read-packet` call.
    pub fn trigger_immediate_poll(&self) {
        let id = Uuid::new_v4().to_string();
        if let Ok(mut pending) = self.pending_request_id.try_lock() {
            *pending = Some(id.clone());
        }
        let _ = self.request_tx.try_send(id);
    }

    // -- write-bytes / read-bytes ----------------------------------------

    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let sequence_number = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let timestamp = chrono::Utc::now().timestamp();
        for fragment in fragment::split(data, sequence_number, timestamp) {
            self.push_fragment(fragment).await?;
        }
        Ok(())
    }

    async fn push_fragment(&self, fragment: FragmentResponse) -> Result<()> {
        let envelope = TunnelPackage {
            connection_id: self.connection_id().await,
            request_id: Some(Uuid::new_v4().to_string()),
            client_id: None,
            mapping_id: None,
            tunnel_type: Some(TunnelType::Data),
            packet_type: None,
            data: None,
        };
        let header = tunnel_wire::envelope::encode(&envelope)?;
        let body = serde_json::to_vec(&fragment).map_err(|e| Error::TransportFailed(e.to_string()))?;
        self.push_with_retry(header, Some(body)).await?;
        Ok(())
    }

    pub async fn read_bytes(&self, n: usize) -> Result<Vec<u8>> {
        loop {
            {
                let mut buffer = self.data_buffer.lock().await;
                if buffer.len() >= n {
                    return Ok(buffer.drain(..n).collect());
                }
            }
            if self.is_closed() {
                return Err(Error::UnexpectedEOF);
            }
            self.trigger_immediate_poll();
            tokio::select! {
                _ = tokio::time::sleep(READ_BYTES_POLL_INTERVAL) => {}
                _ = self.data_buffer_notify.notified() => {}
            }
        }
    }

    // -- push transport ---------------------------------------------------

    async fn push_with_retry(&self, header: String, body: Option<Vec<u8>>) -> Result<Option<TunnelPackage>> {
        let mut last_err = String::new();
        for attempt in 1..=PUSH_MAX_ATTEMPTS {
            let mut request = self.http.post(&self.config.push_url).header(TUNNEL_PACKAGE_HEADER, header.clone());
            if let Some(bytes) = &body {
                request = request.body(bytes.clone());
            }
            match request.send().await {
                Ok(response) => return self.decode_response_header(response.headers()),
                Err(e) => {
                    last_err = e.to_string();
                    if attempt < PUSH_MAX_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }
        Err(Error::TransportFailed(last_err))
    }

    fn decode_response_header(&self, headers: &reqwest::header::HeaderMap) -> Result<Option<TunnelPackage>> {
        match headers.get(TUNNEL_PACKAGE_HEADER) {
            Some(value) => {
                let text = value.to_str().map_err(|e| Error::TransportFailed(e.to_string()))?;
                Ok(Some(tunnel_wire::envelope::decode(text)?))
            }
            None => Ok(None),
        }
    }

    // -- poll loop ----------------------------------------------------------

    async fn run_poll_loop(self: Arc<Self>, mut request_rx: mpsc::Receiver<String>) {
        if self.tunnel_type == TunnelType::Data && !self.data_poll_start.load(Ordering::SeqCst) {
            self.data_poll_notify.notified().await;
        }
        while !self.is_closed() {
            let request_id = match request_rx.try_recv() {
                Ok(id) => id,
                Err(_) => Uuid::new_v4().to_string(),
            };
            if let Err(e) = self.poll_once(&request_id).await {
                tracing::warn!(error = %e, "poll iteration failed");
                tokio::time::sleep(POLL_FAILURE_BACKOFF).await;
            }
        }
    }

    async fn poll_once(&self, request_id: &str) -> Result<()> {
        let envelope = TunnelPackage {
            connection_id: self.connection_id().await,
            request_id: Some(request_id.to_owned()),
            client_id: None,
            mapping_id: None,
            tunnel_type: Some(self.tunnel_type),
            packet_type: None,
            data: None,
        };
        let header = tunnel_wire::envelope::encode(&envelope)?;
        let url = format!("{}?timeout={POLL_TIMEOUT_SECS}", self.config.poll_url);
        let response = self
            .http
            .get(&url)
            .header(TUNNEL_PACKAGE_HEADER, header)
            .send()
            .await
            .map_err(|e| Error::TransportFailed(e.to_string()))?;

        if let Some(decoded) = self.decode_response_header(response.headers())? {
            if let Some(new_conn) = &decoded.connection_id {
                *self.connection_id.write().await = Some(new_conn.clone());
            }
            self.cache.insert(request_id.to_owned(), decoded).await;
            return Ok(());
        }

        let body: serde_json::Value =
            response.json().await.map_err(|e| Error::TransportFailed(e.to_string()))?;
        if body.get("timeout").and_then(|v| v.as_bool()).unwrap_or(false) {
            return Ok(());
        }
        if let Some(data) = body.get("data") {
            let fragment: FragmentResponse =
                serde_json::from_value(data.clone()).map_err(|e| Error::TransportFailed(e.to_string()))?;
            self.ingest_fragment(fragment).await?;
        }
        Ok(())
    }

    async fn ingest_fragment(&self, fragment: FragmentResponse) -> Result<()> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&fragment.data)
            .map_err(|e| Error::TransportFailed(e.to_string()))?;
        self.reassembler
            .add_fragment(
                &fragment.fragment_group_id,
                fragment.original_size,
                fragment.fragment_size,
                fragment.fragment_index,
                fragment.total_fragments,
                fragment.sequence_number,
                bytes,
            )
            .await?;
        self.drain_reassembler().await
    }

    async fn drain_reassembler(&self) -> Result<()> {
        while let Some(group_id) = self.reassembler.next_complete_group().await {
            if let Some(bytes) = self.reassembler.reassemble(&group_id).await? {
                self.data_buffer.lock().await.extend(bytes);
                self.reassembler.remove(&group_id).await;
                self.data_buffer_notify.notify_waiters();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_wire::{PacketBody, PacketKind};

    mod mock_server {
        use std::collections::VecDeque;
        use std::net::SocketAddr;
        use std::sync::Arc;

        use axum::extract::State;
        use axum::http::{HeaderMap, HeaderValue, StatusCode};
        use axum::response::{IntoResponse, Response};
        use axum::routing::{get, post};
        use axum::Router;
        use tokio::net::TcpListener;
        use tokio::sync::Mutex;

        use tunnel_wire::{envelope, TunnelPackage};

        const HEADER: &str = "X-Tunnel-Package";

        pub enum PollReply {
            Control(TunnelPackage),
            Fragment(serde_json::Value),
        }

        #[derive(Default)]
        pub struct Inner {
            pub pushes: Vec<TunnelPackage>,
            pub push_reply: Option<TunnelPackage>,
            pub poll_replies: VecDeque<PollReply>,
        }

        pub struct MockServer {
            addr: SocketAddr,
            pub state: Arc<Mutex<Inner>>,
            _task: tokio::task::JoinHandle<()>,
        }

        impl MockServer {
            pub async fn start() -> Self {
                let state = Arc::new(Mutex::new(Inner::default()));
                let app = Router::new()
                    .route("/push", post(push_handler))
                    .route("/poll", get(poll_handler))
                    .with_state(state.clone());
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                let task = tokio::spawn(async move {
                    let _ = axum::serve(listener, app).await;
                });
                MockServer { addr, state, _task: task }
            }

            pub fn push_url(&self) -> String {
                format!("http://{}/push", self.addr)
            }

            pub fn poll_url(&self) -> String {
                format!("http://{}/poll", self.addr)
            }
        }

        async fn push_handler(
            State(state): State<Arc<Mutex<Inner>>>,
            headers: HeaderMap,
            _body: axum::body::Bytes,
        ) -> Response {
            let header = headers.get(HEADER).unwrap().to_str().unwrap();
            let decoded = envelope::decode(header).unwrap();
            let mut inner = state.lock().await;
            let reply_template = inner.push_reply.clone();
            inner.pushes.push(decoded.clone());
            drop(inner);

            let mut response = StatusCode::OK.into_response();
            if let Some(mut reply) = reply_template {
                reply.request_id = decoded.request_id;
                let encoded = envelope::encode(&reply).unwrap();
                response
                    .headers_mut()
                    .insert(HEADER, HeaderValue::from_str(&encoded).unwrap());
            }
            response
        }

        async fn poll_handler(State(state): State<Arc<Mutex<Inner>>>, headers: HeaderMap) -> Response {
            let header = headers.get(HEADER).unwrap().to_str().unwrap();
            let decoded = envelope::decode(header).unwrap();
            let reply = state.lock().await.poll_replies.pop_front();
            match reply {
                Some(PollReply::Control(mut pkg)) => {
                    pkg.request_id = decoded.request_id;
                    let encoded = envelope::encode(&pkg).unwrap();
                    let mut response = StatusCode::OK.into_response();
                    response
                        .headers_mut()
                        .insert(HEADER, HeaderValue::from_str(&encoded).unwrap());
                    response
                }
                Some(PollReply::Fragment(fragment_json)) => (
                    StatusCode::OK,
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    serde_json::json!({"success": true, "data": fragment_json, "timeout": false})
                        .to_string(),
                )
                    .into_response(),
                None => (
                    StatusCode::OK,
                    [(axum::http::header::CONTENT_TYPE, "application/json")],
                    r#"{"success":false,"timeout":true}"#.to_string(),
                )
                    .into_response(),
            }
        }
    }

    use mock_server::{MockServer, PollReply};

    #[tokio::test]
    async fn handshake_push_updates_connection_id_and_queues_response() {
        let server = MockServer::start().await;
        server.state.lock().await.push_reply = Some(TunnelPackage {
            connection_id: Some("conn_Xabc1234567".into()),
            packet_type: Some("HandshakeResponse".into()),
            data: Some(serde_json::json!({"success": true, "message": "ok client_id=42"})),
            ..Default::default()
        });

        let config = ClientConfig::new(server.push_url(), server.poll_url());
        let processor = ClientStreamProcessor::new(config, TunnelType::Control);

        let packet = Packet::new(PacketKind::Handshake, PacketBody::Json(serde_json::json!({"client_id": 0})));
        processor.write_packet(packet).await.unwrap();

        assert_eq!(processor.connection_id().await.as_deref(), Some("conn_Xabc1234567"));
        let reply = processor.read_packet().await.unwrap();
        assert_eq!(reply.kind, PacketKind::HandshakeResponse);
    }

    #[tokio::test]
    async fn read_bytes_reassembles_from_polled_fragments() {
        let server = MockServer::start().await;
        let payload = b"hello from the tunnel".to_vec();
        let fragments = fragment::split(&payload, 0, 0);
        {
            let mut state = server.state.lock().await;
            for fragment in &fragments {
                state
                    .poll_replies
                    .push_back(PollReply::Fragment(serde_json::to_value(fragment).unwrap()));
            }
        }

        let config = ClientConfig::new(server.push_url(), server.poll_url());
        let processor = ClientStreamProcessor::new(config, TunnelType::Data);
        processor.start_data_poll();

        let received = tokio::time::timeout(Duration::from_secs(5), processor.read_bytes(payload.len()))
            .await
            .expect("read_bytes should not time out")
            .unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn write_packet_fails_closed_when_processor_is_closed() {
        let config = ClientConfig::new("http://127.0.0.1:1", "http://127.0.0.1:1");
        let processor = ClientStreamProcessor::new(config, TunnelType::Control);
        processor.close().await;
        let packet = Packet::new(PacketKind::Heartbeat, PacketBody::Empty);
        assert!(matches!(processor.write_packet(packet).await, Err(Error::Closed)));
    }
}
