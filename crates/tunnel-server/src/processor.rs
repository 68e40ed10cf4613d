//! Server Stream Processor (spec §4.6): owns the outbound data priority
//! queue, the pending-control FIFO, the parked-poll map, and the inbound
//! push buffer for one connection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use tunnel_reassembler::FragmentReassembler;
use tunnel_wire::packet::{envelope_to_packet, packet_to_envelope, parse_fragment_body};
use tunnel_wire::{EnvelopeMeta, Packet, PacketBody, PacketKind, TunnelPackage, TunnelType};

use crate::error::{Error, Result};
use crate::queue::{DataQueue, Priority};

const DATA_STREAM_CAPACITY: usize = 100;
const WAIT_CHANNEL_CAPACITY: usize = 10;
const PUSH_BUFFER_CAP: usize = 1024 * 1024;
const POLL_TIMEOUT: Duration = Duration::from_secs(28);
const READ_BYTES_TIMEOUT: Duration = Duration::from_secs(30);
const SHORT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const REMATCH_TICK: Duration = Duration::from_millis(100);

static NEXT_CLIENT_ID: AtomicI64 = AtomicI64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Fresh,
    Authenticated,
    TunnelOpen,
    Closed,
}

enum PollReply {
    Control(TunnelPackage),
}

struct PendingPoll {
    tx: oneshot::Sender<PollReply>,
    tunnel_type: TunnelType,
}

/// Result of a completed `handle_poll` call.
pub enum PollOutcome {
    Control(TunnelPackage),
    /// A single fragment response, JSON-encoded, ready for the HTTP body.
    Fragment(String),
    Timeout,
}

pub struct ServerStreamProcessor {
    connection_id: String,
    client_id: AtomicI64,
    mapping_id: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    closed: AtomicBool,

    pending_control: Mutex<VecDeque<Packet>>,
    pending_polls: Mutex<HashMap<String, PendingPoll>>,
    match_lock: Mutex<()>,

    data_queue: Mutex<DataQueue>,
    write_mutex: Mutex<()>,
    write_sequence: AtomicI64,

    data_stream_tx: mpsc::Sender<Vec<u8>>,
    data_stream_rx: Mutex<mpsc::Receiver<Vec<u8>>>,

    wait_tx: broadcast::Sender<()>,

    push_buffer: Mutex<VecDeque<u8>>,
    push_reassembler: FragmentReassembler,
}

impl ServerStreamProcessor {
    pub fn new(connection_id: impl Into<String>) -> Self {
        let (data_stream_tx, data_stream_rx) = mpsc::channel(DATA_STREAM_CAPACITY);
        let (wait_tx, _) = broadcast::channel(WAIT_CHANNEL_CAPACITY);
        ServerStreamProcessor {
            connection_id: connection_id.into(),
            client_id: AtomicI64::new(0),
            mapping_id: Mutex::new(None),
            state: Mutex::new(ConnectionState::Fresh),
            closed: AtomicBool::new(false),
            pending_control: Mutex::new(VecDeque::new()),
            pending_polls: Mutex::new(HashMap::new()),
            match_lock: Mutex::new(()),
            data_queue: Mutex::new(DataQueue::new()),
            write_mutex: Mutex::new(()),
            write_sequence: AtomicI64::new(0),
            data_stream_tx,
            data_stream_rx: Mutex::new(data_stream_rx),
            wait_tx,
            push_buffer: Mutex::new(VecDeque::new()),
            push_reassembler: FragmentReassembler::new(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn client_id(&self) -> i64 {
        self.client_id.load(Ordering::Acquire)
    }

    pub async fn mapping_id(&self) -> Option<String> {
        self.mapping_id.lock().await.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the tunnel open once an external collaborator has validated
    /// the tunnel-open request (spec §4.6 state machine).
    pub async fn mark_tunnel_open(&self) {
        let mut state = self.state.lock().await;
        if *state == ConnectionState::Authenticated {
            *state = ConnectionState::TunnelOpen;
        }
    }

    /// Flips the closed flag, drains queues, and closes every parked poll
    /// channel (spec §9 "Recursive cleanup ordering").
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.state.lock().await = ConnectionState::Closed;
        self.pending_control.lock().await.clear();
        *self.data_queue.lock().await = DataQueue::new();
        self.pending_polls.lock().await.clear();
        tracing::debug!(connection_id = %self.connection_id, "server stream processor closed");
    }

    fn notify_waiters(&self) {
        let _ = self.wait_tx.send(());
    }

    // -- write path -----------------------------------------------------

    pub async fn write_packet(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if packet.kind.routes_via_control_fifo() {
            self.pending_control.lock().await.push_back(packet);
            self.try_match_control_packet().await;
        } else {
            self.write_packet_as_bytes(&packet).await?;
        }
        self.notify_waiters();
        Ok(())
    }

    async fn write_packet_as_bytes(&self, packet: &Packet) -> Result<()> {
        let bytes = match &packet.body {
            PacketBody::Opaque(b) => b.clone(),
            PacketBody::Json(v) => {
                serde_json::to_vec(v).map_err(|e| Error::BadEnvelope(e.to_string()))?
            }
            PacketBody::Empty => Vec::new(),
        };
        self.write_bytes(&bytes).await
    }

    /// Fragments `data` and enqueues every fragment contiguously under the
    /// write mutex, so concurrent write-bytes calls never interleave.
    pub async fn write_bytes(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let _write_guard = self.write_mutex.lock().await;
        let sequence = self.write_sequence.fetch_add(1, Ordering::AcqRel);
        let fragments = tunnel_wire::fragment::split(data, sequence, chrono::Utc::now().timestamp());

        {
            let mut queue = self.data_queue.lock().await;
            for fragment in &fragments {
                let json = serde_json::to_vec(fragment)
                    .map_err(|e| Error::BadEnvelope(e.to_string()))?;
                queue.push_back(Priority::Normal, json);
            }
        }
        self.notify_waiters();
        Ok(())
    }

    // -- control matching -------------------------------------------------

    /// While the pending-control FIFO is non-empty, tries to pair its head
    /// with a waiting poll (spec §4.6 "try-match-control-packet").
    async fn try_match_control_packet(&self) {
        let _guard = self.match_lock.lock().await;
        loop {
            if self.pending_control.lock().await.is_empty() {
                break;
            }

            let candidate = {
                let polls = self.pending_polls.lock().await;
                polls
                    .iter()
                    .find(|(id, w)| {
                        !id.is_empty()
                            && !id.starts_with("legacy-")
                            && w.tunnel_type != TunnelType::Keepalive
                    })
                    .map(|(id, _)| id.clone())
                    .or_else(|| {
                        polls
                            .iter()
                            .find(|(_, w)| w.tunnel_type != TunnelType::Keepalive)
                            .map(|(id, _)| id.clone())
                    })
            };

            let Some(request_id) = candidate else { break };

            let Some(waiter) = self.pending_polls.lock().await.remove(&request_id) else {
                continue;
            };

            let packet = self
                .pending_control
                .lock()
                .await
                .pop_front()
                .expect("fifo checked non-empty under match_lock");

            let envelope = packet_to_envelope(
                &packet,
                EnvelopeMeta {
                    connection_id: Some(self.connection_id.clone()),
                    request_id: Some(request_id.clone()),
                    client_id: Some(self.client_id()),
                    mapping_id: self.mapping_id.lock().await.clone(),
                    tunnel_type: Some(TunnelType::Control),
                },
            );

            if waiter.tx.send(PollReply::Control(envelope)).is_err() {
                self.pending_control.lock().await.push_front(packet);
                break;
            }
        }
    }

    // -- push path --------------------------------------------------------

    /// Decodes an inbound push. Returns a synchronous reply packet when the
    /// engine itself owns the answer (only the handshake ack, per
    /// `DESIGN.md`); other control packets are queued for async delivery via
    /// `write_packet` by the handler layer.
    pub async fn handle_push(
        &self,
        envelope: &TunnelPackage,
        fragment_body: Option<&str>,
    ) -> Result<Option<Packet>> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        if let Some(client_id) = envelope.client_id {
            if client_id != 0 {
                self.client_id.store(client_id, Ordering::Release);
            }
        }
        if let Some(mapping_id) = &envelope.mapping_id {
            *self.mapping_id.lock().await = Some(mapping_id.clone());
        }

        let mut reply = None;
        if envelope.packet_type.is_some() {
            let packet = envelope_to_packet(envelope)?;
            if packet.kind == PacketKind::Handshake {
                reply = Some(self.handshake_reply(&packet).await?);
            }
        }

        if let Some(body) = fragment_body {
            let fragment = parse_fragment_body(body).map_err(|e| Error::BadEnvelope(e.to_string()))?;
            self.ingest_fragment(fragment).await?;
        }

        Ok(reply)
    }

    async fn handshake_reply(&self, _packet: &Packet) -> Result<Packet> {
        {
            let mut state = self.state.lock().await;
            if *state == ConnectionState::Fresh {
                *state = ConnectionState::Authenticated;
            }
        }
        let assigned = if self.client_id() == 0 {
            let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::AcqRel);
            self.client_id.store(id, Ordering::Release);
            id
        } else {
            self.client_id()
        };

        let payload = tunnel_wire::packet::HandshakeResponsePayload {
            success: true,
            message: format!("handshake accepted; client_id={assigned}"),
        };
        let body = serde_json::to_value(payload).map_err(|e| Error::BadEnvelope(e.to_string()))?;
        Ok(Packet::new(PacketKind::HandshakeResponse, PacketBody::Json(body)))
    }

    async fn ingest_fragment(&self, fragment: tunnel_wire::FragmentResponse) -> Result<()> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&fragment.data)
            .map_err(|e| Error::BadEnvelope(e.to_string()))?;

        if fragment.total_fragments <= 1 {
            return self.push_into_buffer(bytes).await;
        }

        self.push_reassembler
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

        while let Some(group_id) = self.push_reassembler.next_complete_group().await {
            if let Some(complete) = self.push_reassembler.reassemble(&group_id).await? {
                self.push_into_buffer(complete).await?;
            }
            self.push_reassembler.remove(&group_id).await;
        }
        Ok(())
    }

    async fn push_into_buffer(&self, bytes: Vec<u8>) -> Result<()> {
        let deadline = Instant::now() + SHORT_WRITE_TIMEOUT;
        loop {
            {
                let mut buf = self.push_buffer.lock().await;
                if buf.len() + bytes.len() <= PUSH_BUFFER_CAP {
                    buf.extend(bytes);
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::ShortWrite);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Reads exactly `n` bytes from the push buffer, waiting for more data
    /// to arrive up to a 30 s inner timeout (spec §5).
    pub async fn read_bytes(&self, n: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + READ_BYTES_TIMEOUT;
        loop {
            {
                let mut buf = self.push_buffer.lock().await;
                if buf.len() >= n {
                    return Ok(buf.drain(0..n).collect());
                }
            }
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    // -- poll path ----------------------------------------------------------

    pub async fn handle_poll(&self, request_id: &str, tunnel_type: TunnelType) -> Result<PollOutcome> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        match tunnel_type {
            TunnelType::Keepalive => self.handle_keepalive_poll().await,
            TunnelType::Control | TunnelType::Data => {
                self.handle_parked_poll(request_id, tunnel_type).await
            }
        }
    }

    async fn handle_keepalive_poll(&self) -> Result<PollOutcome> {
        let sleep = tokio::time::sleep(POLL_TIMEOUT);
        tokio::pin!(sleep);
        let mut rx = self.data_stream_rx.lock().await;
        tokio::select! {
            biased;
            item = rx.recv() => Ok(match item {
                Some(bytes) => PollOutcome::Fragment(bytes_to_json(bytes)),
                None => PollOutcome::Timeout,
            }),
            _ = &mut sleep => Ok(PollOutcome::Timeout),
        }
    }

    async fn handle_parked_poll(&self, request_id: &str, tunnel_type: TunnelType) -> Result<PollOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending_polls
            .lock()
            .await
            .insert(request_id.to_owned(), PendingPoll { tx, tunnel_type });

        self.try_match_control_packet().await;

        let outcome = tokio::time::timeout(POLL_TIMEOUT, self.wait_for_poll_result(rx, tunnel_type)).await;

        self.pending_polls.lock().await.remove(request_id);

        match outcome {
            Ok(inner) => inner,
            Err(_elapsed) => Ok(PollOutcome::Timeout),
        }
    }

    async fn wait_for_poll_result(
        &self,
        rx: oneshot::Receiver<PollReply>,
        tunnel_type: TunnelType,
    ) -> Result<PollOutcome> {
        tokio::pin!(rx);
        let mut wait_rx = self.wait_tx.subscribe();
        let mut retick = tokio::time::interval(REMATCH_TICK);
        retick.tick().await;

        loop {
            tokio::select! {
                biased;
                res = &mut rx => {
                    return match res {
                        Ok(PollReply::Control(envelope)) => Ok(PollOutcome::Control(envelope)),
                        Err(_) => Err(Error::Closed),
                    };
                }
                item = Self::recv_data_if(tunnel_type, &self.data_stream_rx) => {
                    if let Some(bytes) = item {
                        return Ok(PollOutcome::Fragment(bytes_to_json(bytes)));
                    }
                }
                _ = wait_rx.recv() => {
                    self.try_match_control_packet().await;
                }
                _ = retick.tick() => {
                    self.try_match_control_packet().await;
                }
            }
        }
    }

    async fn recv_data_if(
        tunnel_type: TunnelType,
        data_stream_rx: &Mutex<mpsc::Receiver<Vec<u8>>>,
    ) -> Option<Vec<u8>> {
        if tunnel_type != TunnelType::Data {
            std::future::pending::<()>().await;
            unreachable!();
        }
        data_stream_rx.lock().await.recv().await
    }

    /// Spawns the 5 ms ticker that drains the data priority queue into the
    /// bounded data-stream channel (spec §4.6 "Poll data scheduler").
    pub fn spawn_scheduler(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            loop {
                ticker.tick().await;
                if self.is_closed() {
                    break;
                }
                self.drain_one_to_stream().await;
            }
        })
    }

    async fn drain_one_to_stream(&self) {
        let item = {
            let mut queue = self.data_queue.lock().await;
            queue.pop()
        };
        let Some((priority, bytes)) = item else { return };

        match self.data_stream_tx.try_send(bytes) {
            Ok(()) => self.notify_waiters(),
            Err(mpsc::error::TrySendError::Full(bytes)) => {
                self.data_queue.lock().await.push_front(priority, bytes);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

fn bytes_to_json(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).expect("data stream entries are always serialised JSON")
}
