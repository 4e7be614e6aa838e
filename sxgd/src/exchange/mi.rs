// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Merkle Integrity content encoding (`mi-sha256-03`).
//!
//! The payload is split into fixed-size records. The proof of the last
//! record is `SHA-256(record || 0x00)`; the proof of every earlier record
//! is `SHA-256(record || proof(next) || 0x01)`. The encoded body is the
//! 8-byte big-endian record size followed by the records with each
//! record's successor proof interleaved. The top proof is carried in the
//! `Digest` header.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use openssl::hash::{MessageDigest, hash};

/// Header value prefix naming the encoding.
pub const DIGEST_PREFIX: &str = "mi-sha256-03=";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MiError {
    #[error("record size must be positive")]
    ZeroRecordSize,
    #[error("encoded body is truncated")]
    Truncated,
    #[error("digest header is malformed: {0}")]
    BadDigestHeader(String),
    #[error("integrity proof mismatch at record {0}")]
    ProofMismatch(usize),
    #[error("openssl failure: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

fn sha256(parts: &[&[u8]]) -> Result<[u8; 32], MiError> {
    let mut buf = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
    for part in parts {
        buf.extend_from_slice(part);
    }
    let digest = hash(MessageDigest::sha256(), &buf)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

fn record_proofs(records: &[&[u8]]) -> Result<Vec<[u8; 32]>, MiError> {
    let mut proofs = vec![[0u8; 32]; records.len()];
    let last = records.len() - 1;
    proofs[last] = sha256(&[records[last], &[0x00]])?;
    for i in (0..last).rev() {
        let next = proofs[i + 1];
        proofs[i] = sha256(&[records[i], &next, &[0x01]])?;
    }
    Ok(proofs)
}

/// Encode `payload` into MI records of `record_size` bytes.
///
/// Returns the encoded body and the `Digest` header value. An empty payload
/// encodes to an empty body whose digest is `SHA-256("")`.
pub fn encode(payload: &[u8], record_size: usize) -> Result<(Vec<u8>, String), MiError> {
    if record_size == 0 {
        return Err(MiError::ZeroRecordSize);
    }
    if payload.is_empty() {
        let digest = sha256(&[])?;
        return Ok((Vec::new(), digest_header(&digest)));
    }

    let records: Vec<&[u8]> = payload.chunks(record_size).collect();
    let proofs = record_proofs(&records)?;

    let mut encoded =
        Vec::with_capacity(8 + payload.len() + 32 * (records.len().saturating_sub(1)));
    encoded.extend_from_slice(&(record_size as u64).to_be_bytes());
    encoded.extend_from_slice(records[0]);
    for i in 1..records.len() {
        encoded.extend_from_slice(&proofs[i]);
        encoded.extend_from_slice(records[i]);
    }

    Ok((encoded, digest_header(&proofs[0])))
}

/// Decode an MI-encoded body, verifying every proof against the `Digest`
/// header value. Returns the original payload.
pub fn decode_and_verify(encoded: &[u8], digest_header_value: &str) -> Result<Vec<u8>, MiError> {
    let top = parse_digest_header(digest_header_value)?;

    if encoded.is_empty() {
        let expected = sha256(&[])?;
        if top != expected {
            return Err(MiError::ProofMismatch(0));
        }
        return Ok(Vec::new());
    }
    if encoded.len() < 8 {
        return Err(MiError::Truncated);
    }

    let record_size = u64::from_be_bytes(encoded[..8].try_into().unwrap()) as usize;
    if record_size == 0 {
        return Err(MiError::ZeroRecordSize);
    }

    let mut records: Vec<&[u8]> = Vec::new();
    let mut stored_proofs: Vec<[u8; 32]> = Vec::new();
    let mut rest = &encoded[8..];
    if rest.len() <= record_size {
        records.push(rest);
    } else {
        records.push(&rest[..record_size]);
        rest = &rest[record_size..];
        loop {
            if rest.len() < 32 {
                return Err(MiError::Truncated);
            }
            let mut proof = [0u8; 32];
            proof.copy_from_slice(&rest[..32]);
            stored_proofs.push(proof);
            rest = &rest[32..];
            if rest.is_empty() {
                return Err(MiError::Truncated);
            }
            if rest.len() <= record_size {
                records.push(rest);
                break;
            }
            records.push(&rest[..record_size]);
            rest = &rest[record_size..];
        }
    }

    let proofs = record_proofs(&records)?;
    if proofs[0] != top {
        return Err(MiError::ProofMismatch(0));
    }
    for (i, stored) in stored_proofs.iter().enumerate() {
        if *stored != proofs[i + 1] {
            return Err(MiError::ProofMismatch(i + 1));
        }
    }

    Ok(records.concat())
}

fn digest_header(top_proof: &[u8; 32]) -> String {
    format!("{DIGEST_PREFIX}{}", BASE64.encode(top_proof))
}

fn parse_digest_header(value: &str) -> Result<[u8; 32], MiError> {
    let b64 = value
        .strip_prefix(DIGEST_PREFIX)
        .ok_or_else(|| MiError::BadDigestHeader(value.to_string()))?;
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| MiError::BadDigestHeader(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| MiError::BadDigestHeader("digest is not 32 bytes".to_string()))
}
