//! Client Stream Processor and byte-stream adapter for the long-polling
//! tunnel protocol.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod processor;

pub use adapter::ClientByteStream;
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use processor::ClientStreamProcessor;
