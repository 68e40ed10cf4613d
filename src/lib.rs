//! Bidirectional tunnel transport over plain HTTP long-polling.
//!
//! This crate is a thin re-export over the four library crates that make up
//! the engine: the wire codec, the fragment reassembler, and the client/server
//! stream processors built on top of them. It exists so integration tests can
//! exercise a client and a server against each other without naming each
//! crate individually, the way the teacher's root `rusty-timer` crate hosts
//! the cross-service end-to-end suites.
//!
//! A connection is established by a client pushing a handshake with an empty
//! connection id; the server assigns one and every subsequent push or poll
//! on that logical connection (control or data) carries it. Control traffic
//! (handshake, tunnel-open, commands, heartbeats) and tunneled data travel as
//! two independent [`tunnel_wire::TunnelType`] streams sharing one connection
//! id, each with its own stream processor on both ends.

pub use tunnel_client::{self, ClientByteStream, ClientConfig, ClientStreamProcessor};
pub use tunnel_reassembler::{self, FragmentReassembler};
pub use tunnel_server::{self, ConnectionRegistry, ServerByteStream, ServerStreamProcessor};
pub use tunnel_wire::{self, Packet, PacketBody, PacketKind, TunnelPackage, TunnelType};
