//! Server Stream Processor, Connection Registry, and HTTP push/poll handlers
//! for the long-polling tunnel protocol.

pub mod adapter;
pub mod error;
pub mod http;
pub mod processor;
pub mod queue;
pub mod registry;

pub use adapter::ServerByteStream;
pub use error::{Error, Result};
pub use processor::{ConnectionState, PollOutcome, ServerStreamProcessor};
pub use registry::ConnectionRegistry;
