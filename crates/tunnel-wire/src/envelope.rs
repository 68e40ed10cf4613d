//! Tunnel Package Codec (spec §4.1): JSON-serialise, gzip, base64-encode a
//! [`TunnelPackage`] for placement in the `X-Tunnel-Package` HTTP header, and
//! the symmetric decoder.

use std::io::{Read, Write};

use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::types::TunnelPackage;

/// Header budget from spec §3: envelopes must be under 64 KiB once encoded.
pub const MAX_ENVELOPE_LEN: usize = 64 * 1024;

/// Encodes a [`TunnelPackage`] into the `X-Tunnel-Package` header string.
pub fn encode(pkg: &TunnelPackage) -> Result<String> {
    let json = serde_json::to_vec(pkg).map_err(|e| Error::BadEnvelope(e.to_string()))?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(&json).map_err(|e| Error::BadEnvelope(e.to_string()))?;
    let gzipped = gz.finish().map_err(|e| Error::BadEnvelope(e.to_string()))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(gzipped);
    if encoded.len() >= MAX_ENVELOPE_LEN {
        return Err(Error::EnvelopeTooLarge(encoded.len()));
    }
    Ok(encoded)
}

/// Decodes an `X-Tunnel-Package` header string back into a [`TunnelPackage`].
/// Fails with [`Error::BadEnvelope`] if any step (base64, gzip, json) fails.
pub fn decode(header: &str) -> Result<TunnelPackage> {
    let gzipped = base64::engine::general_purpose::STANDARD
        .decode(header.as_bytes())
        .map_err(|e| Error::BadEnvelope(e.to_string()))?;

    let mut decoder = GzDecoder::new(&gzipped[..]);
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| Error::BadEnvelope(e.to_string()))?;

    serde_json::from_slice(&json).map_err(|e| Error::BadEnvelope(e.to_string()))
}
