// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Exchange signing.
//!
//! The signature covers a TLS-style message so a key shared between a TLS
//! certificate and an exchange-signing certificate cannot be abused across
//! protocols: 64 bytes of 0x20, the version context string, a NUL, then the
//! length-prefixed cert hash, validity URL, timestamps, request URL, and
//! canonical header CBOR.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use openssl::hash::{MessageDigest, hash};
use openssl::md::Md;
use openssl::pkey::{PKey, Private, Public};
use openssl::pkey_ctx::PkeyCtx;
use url::Url;

use super::Version;

/// Signs exchanges for one certificate chain and key pair.
pub struct Signer {
    pub date: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    /// SHA-256 of the leaf certificate's DER encoding.
    pub cert_sha256: [u8; 32],
    pub cert_url: Url,
    pub validity_url: Url,
    pub private_key: PKey<Private>,
}

impl Signer {
    /// Produce the `Signature` header value covering the given request URL
    /// and canonical header CBOR.
    pub fn signature_header(
        &self,
        version: Version,
        request_url: &Url,
        header_cbor: &[u8],
    ) -> anyhow::Result<String> {
        let message = signed_message(
            version,
            &self.cert_sha256,
            self.validity_url.as_str(),
            self.date.timestamp(),
            self.expires.timestamp(),
            request_url.as_str(),
            header_cbor,
        );
        let digest = hash(MessageDigest::sha256(), &message)?;

        let mut ctx = PkeyCtx::new(&self.private_key)?;
        ctx.sign_init()?;
        ctx.set_signature_md(Md::sha256())?;
        let mut signature = vec![];
        ctx.sign_to_vec(&digest, &mut signature)?;

        Ok(format!(
            "label; sig=*{}*; validity-url=\"{}\"; integrity=\"{}\"; cert-url=\"{}\"; cert-sha256=*{}*; date={}; expires={}",
            BASE64.encode(&signature),
            self.validity_url,
            version.integrity_identifier(),
            self.cert_url,
            BASE64.encode(self.cert_sha256),
            self.date.timestamp(),
            self.expires.timestamp(),
        ))
    }
}

/// Build the byte string the signature covers.
pub fn signed_message(
    version: Version,
    cert_sha256: &[u8; 32],
    validity_url: &str,
    date: i64,
    expires: i64,
    request_url: &str,
    header_cbor: &[u8],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(
        64 + 32 + validity_url.len() + request_url.len() + header_cbor.len() + 64,
    );
    message.extend_from_slice(&[0x20; 64]);
    message.extend_from_slice(version.context_string().as_bytes());
    message.push(0x00);
    message.push(32);
    message.extend_from_slice(cert_sha256);
    message.extend_from_slice(&(validity_url.len() as u64).to_be_bytes());
    message.extend_from_slice(validity_url.as_bytes());
    message.extend_from_slice(&date.to_be_bytes());
    message.extend_from_slice(&expires.to_be_bytes());
    message.extend_from_slice(&(request_url.len() as u64).to_be_bytes());
    message.extend_from_slice(request_url.as_bytes());
    message.extend_from_slice(&(header_cbor.len() as u64).to_be_bytes());
    message.extend_from_slice(header_cbor);
    message
}

/// Verify `signature` (DER ECDSA) over the signed message with the leaf
/// certificate's public key.
pub fn verify_signature(
    public_key: &PKey<Public>,
    message: &[u8],
    signature: &[u8],
) -> anyhow::Result<bool> {
    let digest = hash(MessageDigest::sha256(), message)?;
    let mut ctx = PkeyCtx::new(public_key)?;
    ctx.verify_init()?;
    ctx.set_signature_md(Md::sha256())?;
    Ok(ctx.verify(&digest, signature)?)
}

/// The parsed parameters of a `Signature` header.
#[derive(Debug, Clone, PartialEq)]
pub struct SignatureParams {
    pub label: String,
    pub sig: Vec<u8>,
    pub integrity: String,
    pub validity_url: String,
    pub cert_url: String,
    pub cert_sha256: [u8; 32],
    pub date: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl SignatureParams {
    /// Parse a `Signature` header value produced by [`Signer`].
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let mut parts = value.split(';').map(str::trim);
        let label = parts
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| anyhow::anyhow!("signature header has no label"))?
            .to_string();

        let mut sig = None;
        let mut integrity = None;
        let mut validity_url = None;
        let mut cert_url = None;
        let mut cert_sha256 = None;
        let mut date = None;
        let mut expires = None;

        for part in parts {
            let (key, raw) = part
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("malformed signature parameter: {part}"))?;
            match key {
                "sig" => sig = Some(binary_value(raw)?),
                "integrity" => integrity = Some(string_value(raw)?),
                "validity-url" => validity_url = Some(string_value(raw)?),
                "cert-url" => cert_url = Some(string_value(raw)?),
                "cert-sha256" => {
                    let bytes = binary_value(raw)?;
                    let bytes: [u8; 32] = bytes
                        .try_into()
                        .map_err(|_| anyhow::anyhow!("cert-sha256 is not 32 bytes"))?;
                    cert_sha256 = Some(bytes);
                }
                "date" => date = Some(timestamp_value(raw)?),
                "expires" => expires = Some(timestamp_value(raw)?),
                _ => {}
            }
        }

        Ok(SignatureParams {
            label,
            sig: sig.ok_or_else(|| anyhow::anyhow!("signature header missing sig"))?,
            integrity: integrity.ok_or_else(|| anyhow::anyhow!("missing integrity"))?,
            validity_url: validity_url.ok_or_else(|| anyhow::anyhow!("missing validity-url"))?,
            cert_url: cert_url.ok_or_else(|| anyhow::anyhow!("missing cert-url"))?,
            cert_sha256: cert_sha256.ok_or_else(|| anyhow::anyhow!("missing cert-sha256"))?,
            date: date.ok_or_else(|| anyhow::anyhow!("missing date"))?,
            expires: expires.ok_or_else(|| anyhow::anyhow!("missing expires"))?,
        })
    }
}

fn binary_value(raw: &str) -> anyhow::Result<Vec<u8>> {
    let inner = raw
        .strip_prefix('*')
        .and_then(|r| r.strip_suffix('*'))
        .ok_or_else(|| anyhow::anyhow!("expected *base64* value, got {raw}"))?;
    Ok(BASE64.decode(inner)?)
}

fn string_value(raw: &str) -> anyhow::Result<String> {
    raw.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("expected quoted value, got {raw}"))
}

fn timestamp_value(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let seconds: i64 = raw.parse()?;
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_message_layout() {
        let cert_sha256 = [0xabu8; 32];
        let header_cbor = b"\xa1\x47:status\x43200".to_vec();
        let message = signed_message(
            Version::V1b3,
            &cert_sha256,
            "https://example.org/hello.html.validity.100",
            100,
            200,
            "https://example.org/hello.html",
            &header_cbor,
        );

        assert_eq!(&message[..64], &[0x20u8; 64][..]);
        let context = Version::V1b3.context_string().as_bytes();
        assert_eq!(&message[64..64 + context.len()], context);
        let mut pos = 64 + context.len();
        assert_eq!(message[pos], 0x00);
        pos += 1;
        assert_eq!(message[pos], 32);
        pos += 1;
        assert_eq!(&message[pos..pos + 32], &cert_sha256);
        pos += 32;
        let validity = "https://example.org/hello.html.validity.100";
        assert_eq!(
            &message[pos..pos + 8],
            &(validity.len() as u64).to_be_bytes()
        );
        pos += 8 + validity.len();
        assert_eq!(&message[pos..pos + 8], &100i64.to_be_bytes());
        pos += 8;
        assert_eq!(&message[pos..pos + 8], &200i64.to_be_bytes());
    }

    #[test]
    fn header_value_round_trips_through_parse() {
        let header = concat!(
            "label; sig=*AQID*; ",
            "validity-url=\"https://example.org/x.validity.100\"; ",
            "integrity=\"digest/mi-sha256-03\"; ",
            "cert-url=\"https://cdn.example.com/cert/abc\"; ",
            "cert-sha256=*qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqo=*; ",
            "date=100; expires=200",
        );
        let params = SignatureParams::parse(header).unwrap();
        assert_eq!(params.label, "label");
        assert_eq!(params.sig, vec![1, 2, 3]);
        assert_eq!(params.integrity, "digest/mi-sha256-03");
        assert_eq!(params.validity_url, "https://example.org/x.validity.100");
        assert_eq!(params.cert_url, "https://cdn.example.com/cert/abc");
        assert_eq!(params.date.timestamp(), 100);
        assert_eq!(params.expires.timestamp(), 200);
    }

    #[test]
    fn parse_rejects_missing_parameters() {
        assert!(SignatureParams::parse("label; sig=*AQID*").is_err());
        assert!(SignatureParams::parse("").is_err());
    }
}
