// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Canonical CBOR encoding of the signed response headers.
//!
//! The b3 format covers a single CBOR map: `:status` plus every response
//! header, names lowercased, keys and values as byte strings. Canonical
//! form orders keys by encoded length first, then bytewise.

use crate::resource::Headers;

/// Headers that must never be signed into an exchange: they describe the
/// connection or per-user state rather than the resource.
const UNCACHED_HEADERS: [&str; 12] = [
    "authorization",
    "connection",
    "cookie",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "set-cookie",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HeaderError {
    #[error("header {0} must not appear in a signed exchange")]
    Uncached(String),
    #[error("cbor encoding failed: {0}")]
    Cbor(String),
}

/// Encode `:status` and the response headers as the canonical CBOR map the
/// signature covers.
pub fn encode_response_headers(status: u16, headers: &Headers) -> Result<Vec<u8>, HeaderError> {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 1);
    entries.push((b":status".to_vec(), status.to_string().into_bytes()));

    let mut seen: Vec<String> = Vec::new();
    for (name, _) in headers.iter() {
        let lower = name.to_ascii_lowercase();
        if UNCACHED_HEADERS.contains(&lower.as_str()) {
            return Err(HeaderError::Uncached(lower));
        }
        if seen.contains(&lower) {
            continue;
        }
        // Repeated header fields combine into one comma-separated value.
        let combined = headers.get_all(name).collect::<Vec<_>>().join(", ");
        entries.push((lower.clone().into_bytes(), combined.into_bytes()));
        seen.push(lower);
    }

    entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let mut encoder = minicbor::Encoder::new(Vec::new());
    encoder
        .map(entries.len() as u64)
        .map_err(|e| HeaderError::Cbor(e.to_string()))?;
    for (key, value) in &entries {
        encoder
            .bytes(key)
            .map_err(|e| HeaderError::Cbor(e.to_string()))?;
        encoder
            .bytes(value)
            .map_err(|e| HeaderError::Cbor(e.to_string()))?;
    }
    Ok(encoder.into_writer())
}
