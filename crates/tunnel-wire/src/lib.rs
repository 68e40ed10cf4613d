//! Wire types and codecs for the long-polling tunnel protocol.
//!
//! This crate has no I/O and no async runtime dependency: it is the pure
//! codec layer shared by both the client and server stream processors.

pub mod envelope;
pub mod error;
pub mod fragment;
pub mod packet;
pub mod types;

pub use error::{Error, Result};
pub use packet::{
    envelope_to_packet, packet_to_envelope, EnvelopeMeta, HandshakePayload,
    HandshakeResponsePayload, Packet, PacketBody, PacketFlags, PacketKind, TunnelOpenAckPayload,
    TunnelOpenPayload,
};
pub use types::{is_valid_connection_id, FragmentResponse, TunnelPackage, TunnelType};
