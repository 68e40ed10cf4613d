//! Packet type tags, their wire-string mapping, and the packet <-> envelope
//! converter (spec §3 "Packet type" and §4.4 "Packet Converter").

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{FragmentResponse, TunnelPackage, TunnelType};

/// The closed set of base packet kinds (spec §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketKind {
    Handshake,
    HandshakeResponse,
    Command,
    CommandResponse,
    TunnelOpen,
    TunnelOpenAck,
    Heartbeat,
    TunnelData,
    TunnelClose,
}

impl PacketKind {
    /// Canonical wire string emitted by the encoder.
    pub fn wire_str(self) -> &'static str {
        match self {
            PacketKind::Handshake => "Handshake",
            PacketKind::HandshakeResponse => "HandshakeResponse",
            PacketKind::Command => "JsonCommand",
            PacketKind::CommandResponse => "CommandResponse",
            PacketKind::TunnelOpen => "TunnelOpen",
            PacketKind::TunnelOpenAck => "TunnelOpenAck",
            PacketKind::Heartbeat => "Heartbeat",
            PacketKind::TunnelData => "TunnelData",
            PacketKind::TunnelClose => "TunnelClose",
        }
    }

    /// Parses a wire string, accepting the `CommandResp` legacy alias for
    /// `CommandResponse` on decode (spec §6).
    pub fn from_wire_str(s: &str) -> Result<Self> {
        Ok(match s {
            "Handshake" => PacketKind::Handshake,
            "HandshakeResponse" => PacketKind::HandshakeResponse,
            "JsonCommand" => PacketKind::Command,
            "CommandResponse" | "CommandResp" => PacketKind::CommandResponse,
            "TunnelOpen" => PacketKind::TunnelOpen,
            "TunnelOpenAck" => PacketKind::TunnelOpenAck,
            "Heartbeat" => PacketKind::Heartbeat,
            "TunnelData" => PacketKind::TunnelData,
            "TunnelClose" => PacketKind::TunnelClose,
            other => return Err(Error::UnknownPacketType(other.to_owned())),
        })
    }

    pub fn is_command(self) -> bool {
        matches!(self, PacketKind::Command)
    }

    pub fn is_command_response(self) -> bool {
        matches!(self, PacketKind::CommandResponse)
    }

    pub fn is_heartbeat(self) -> bool {
        matches!(self, PacketKind::Heartbeat)
    }

    pub fn is_handshake(self) -> bool {
        matches!(self, PacketKind::Handshake | PacketKind::HandshakeResponse)
    }

    /// Control packets carry request/response commands; data packets carry
    /// opaque tunneled bytes (spec GLOSSARY).
    pub fn is_control(self) -> bool {
        !matches!(self, PacketKind::TunnelData)
    }

    /// Whether a server-written packet of this kind is routed through the
    /// pending-control FIFO rather than the data priority queue (spec §4.6
    /// "Control packets (handshake-response, tunnel-open-ack, command,
    /// command-response)..."). Narrower than [`Self::is_control`]: requests
    /// the server never originates (Handshake, TunnelOpen) and kinds shared
    /// with the data path (Heartbeat, TunnelClose, TunnelData) fall through
    /// to the data queue.
    pub fn routes_via_control_fifo(self) -> bool {
        matches!(
            self,
            PacketKind::HandshakeResponse
                | PacketKind::TunnelOpenAck
                | PacketKind::Command
                | PacketKind::CommandResponse
        )
    }
}

/// High-bit flags orthogonal to the base kind. The engine preserves these
/// across transformations but never itself compresses or encrypts payloads
/// (spec §3). Hand-rolled rather than pulled from a flags crate since only
/// two bits are ever in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const COMPRESSED: PacketFlags = PacketFlags(0b0100_0000);
    pub const ENCRYPTED: PacketFlags = PacketFlags(0b1000_0000);

    pub const fn empty() -> Self {
        PacketFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        PacketFlags(bits & 0b1100_0000)
    }

    pub fn contains(self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for PacketFlags {
    type Output = PacketFlags;
    fn bitor(self, rhs: PacketFlags) -> PacketFlags {
        PacketFlags(self.0 | rhs.0)
    }
}

/// The engine's internal packet representation: a tagged kind plus either a
/// structured JSON body (commands, handshake/tunnel-open/ack payloads) or an
/// opaque byte payload (spec §4.4, §9 "Duck-typed data field").
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub flags: PacketFlags,
    pub body: PacketBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    /// Structured JSON payload: command objects, handshake/ack bodies.
    Json(serde_json::Value),
    /// Opaque bytes: tunnel-data chunks, or an unrecognized tag's payload.
    Opaque(Vec<u8>),
    /// No payload (heartbeat, close-without-reason).
    Empty,
}

impl Packet {
    pub fn new(kind: PacketKind, body: PacketBody) -> Self {
        Packet { kind, flags: PacketFlags::empty(), body }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Routing fields that accompany a packet inside its envelope but are not
/// part of the packet itself.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeMeta {
    pub connection_id: Option<String>,
    pub request_id: Option<String>,
    pub client_id: Option<i64>,
    pub mapping_id: Option<String>,
    pub tunnel_type: Option<TunnelType>,
}

/// Converts an internal [`Packet`] plus routing metadata into the wire
/// [`TunnelPackage`] envelope (spec §4.4 "On write").
pub fn packet_to_envelope(packet: &Packet, meta: EnvelopeMeta) -> TunnelPackage {
    let data = match &packet.body {
        PacketBody::Json(v) => Some(v.clone()),
        PacketBody::Opaque(bytes) => {
            if bytes.is_empty() {
                None
            } else {
                Some(serde_json::Value::String(
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes),
                ))
            }
        }
        PacketBody::Empty => None,
    };

    TunnelPackage {
        connection_id: meta.connection_id,
        request_id: meta.request_id,
        client_id: meta.client_id,
        mapping_id: meta.mapping_id,
        tunnel_type: meta.tunnel_type,
        packet_type: Some(packet.kind.wire_str().to_owned()),
        data,
    }
}

/// Converts a wire [`TunnelPackage`] into an internal [`Packet`] (spec §4.4
/// "On read"). Fails with [`Error::UnknownPacketType`] for tags outside the
/// closed set.
pub fn envelope_to_packet(pkg: &TunnelPackage) -> Result<Packet> {
    let tag = pkg
        .packet_type
        .as_deref()
        .ok_or_else(|| Error::UnknownPacketType(String::new()))?;
    let kind = PacketKind::from_wire_str(tag)?;

    let body = match (&pkg.data, kind) {
        (None, _) => PacketBody::Empty,
        (Some(serde_json::Value::String(s)), PacketKind::TunnelData) => {
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s)
                .map_err(|e| Error::BadEnvelope(e.to_string()))?;
            PacketBody::Opaque(bytes)
        }
        (Some(v), _) => PacketBody::Json(v.clone()),
    };

    Ok(Packet { kind, flags: PacketFlags::empty(), body })
}

/// Typed accessors for the known JSON-shaped payloads. These mirror the
/// "duck-typed" helpers a handler layer uses once it has an internal packet;
/// none of them are invoked by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub client_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponsePayload {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOpenPayload {
    pub mapping_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelOpenAckPayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Packet {
    pub fn as_typed<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        match &self.body {
            PacketBody::Json(v) => serde_json::from_value(v.clone()).ok(),
            _ => None,
        }
    }
}

/// Parses a push/poll JSON body that carries a single fragment response
/// (spec §6 "body is ... a JSON-encoded fragment response").
pub fn parse_fragment_body(body: &str) -> Result<FragmentResponse> {
    serde_json::from_str(body).map_err(|e| Error::BadEnvelope(e.to_string()))
}
