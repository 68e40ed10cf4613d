use serde::{Deserialize, Serialize};

/// Which logical stream a packet or poll belongs to.
///
/// `Keepalive` is a poll-only variant: it is never assigned to a `Connection`
/// and never used as a packet's home stream, only as the `tunnel_type` of a
/// parked poll that should never be handed a control packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    Control,
    Data,
    Keepalive,
}

/// The control envelope carried in the `X-Tunnel-Package` HTTP header.
///
/// All fields are optional so a poll-only envelope can carry just the
/// routing fields. The encoder omits empty optional fields (see
/// [`crate::envelope::encode`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelPackage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_type: Option<TunnelType>,
    /// Wire packet-type tag, e.g. `"Handshake"`. Serialized as `type`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub packet_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Wire format for a slice of data bytes, possibly one of several fragments
/// of a larger payload that share `fragment_group_id` and `sequence_number`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentResponse {
    pub fragment_group_id: String,
    pub original_size: u64,
    pub fragment_size: u64,
    pub fragment_index: u32,
    pub total_fragments: u32,
    pub sequence_number: i64,
    /// Base64-encoded fragment payload.
    pub data: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Set only by the server to signal an empty long-poll result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<bool>,
}

/// Validates the `conn_` prefix / 10-100 char length contract from §3 and §6.
pub fn is_valid_connection_id(id: &str) -> bool {
    id.starts_with("conn_") && (10..=100).contains(&id.len())
}
