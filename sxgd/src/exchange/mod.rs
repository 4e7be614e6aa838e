// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signed HTTP Exchange construction and verification.
//!
//! The version token pins every format decision: the outer serialization,
//! the context string the signature covers, the payload-encoding headers,
//! and the MIME type. Only `1b3` exists today; the dispatch points are kept
//! narrow so successors slot in beside it.

pub mod factory;
pub mod headers;
pub mod mi;
pub mod signer;

use bytes::Bytes;
use url::Url;

use crate::resource::Headers;

pub use factory::{Factory, FactoryConfig, FactoryProvider};

/// A signed exchange format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Version {
    /// `application/signed-exchange;v=b3`.
    V1b3,
}

impl Version {
    /// Parse a version token such as `1b3`.
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "1b3" => Some(Version::V1b3),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Version::V1b3 => "1b3",
        }
    }

    /// The MIME type of a serialized exchange of this version.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Version::V1b3 => "application/signed-exchange;v=b3",
        }
    }

    /// The `Accept` header value a fetcher advertises.
    pub fn accept_value(&self) -> &'static str {
        match self {
            Version::V1b3 => "application/signed-exchange;v=b3,*/*;q=0.8",
        }
    }

    /// The context string bound into the signed message.
    pub fn context_string(&self) -> &'static str {
        match self {
            Version::V1b3 => "HTTP Exchange 1 b3",
        }
    }

    /// The `integrity` identifier in the signature header.
    pub fn integrity_identifier(&self) -> &'static str {
        match self {
            Version::V1b3 => "digest/mi-sha256-03",
        }
    }

    /// The `Content-Encoding` value of the MI-encoded payload.
    pub fn payload_encoding(&self) -> &'static str {
        match self {
            Version::V1b3 => "mi-sha256-03",
        }
    }

    fn magic(&self) -> &'static [u8; 8] {
        match self {
            Version::V1b3 => b"sxg1-b3\0",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SerializeError {
    #[error("request URL of {0} bytes exceeds the 2-byte length prefix")]
    UrlTooLong(usize),
    #[error("signature of {0} bytes exceeds the 16384 byte limit")]
    SignatureTooLong(usize),
    #[error("signed headers of {0} bytes exceed the 524288 byte limit")]
    HeadersTooLong(usize),
}

/// An immutable signed exchange.
///
/// Produced by the factory; the payload is already MI-encoded and the
/// response headers already carry the computed `Content-Encoding` and
/// `Digest` values the signature covers.
#[derive(Debug, Clone)]
pub struct SignedExchange {
    pub version: Version,
    pub request_url: Url,
    pub request_method: String,
    pub request_headers: Headers,
    pub status: u16,
    pub response_headers: Headers,
    /// MI-encoded payload body.
    pub payload: Bytes,
    /// The `Signature` header value.
    pub signature: String,
    /// The canonical CBOR the signature covers; kept so verification and
    /// serialization reuse the exact signed bytes.
    pub header_cbor: Vec<u8>,
}

impl SignedExchange {
    /// Serialize to the wire format.
    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<(), SerializeError> {
        let fallback_url = self.request_url.as_str().as_bytes();
        if fallback_url.len() > u16::MAX as usize {
            return Err(SerializeError::UrlTooLong(fallback_url.len()));
        }
        let signature = self.signature.as_bytes();
        if signature.len() > 16384 {
            return Err(SerializeError::SignatureTooLong(signature.len()));
        }
        if self.header_cbor.len() > 524288 {
            return Err(SerializeError::HeadersTooLong(self.header_cbor.len()));
        }

        out.extend_from_slice(self.version.magic());
        out.extend_from_slice(&(fallback_url.len() as u16).to_be_bytes());
        out.extend_from_slice(fallback_url);
        out.extend_from_slice(&be24(signature.len()));
        out.extend_from_slice(&be24(self.header_cbor.len()));
        out.extend_from_slice(signature);
        out.extend_from_slice(&self.header_cbor);
        out.extend_from_slice(&self.payload);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes, SerializeError> {
        let mut out = Vec::with_capacity(
            8 + 2
                + self.request_url.as_str().len()
                + 6
                + self.signature.len()
                + self.header_cbor.len()
                + self.payload.len(),
        );
        self.write_to(&mut out)?;
        Ok(Bytes::from(out))
    }
}

fn be24(value: usize) -> [u8; 3] {
    [
        ((value >> 16) & 0xff) as u8,
        ((value >> 8) & 0xff) as u8,
        (value & 0xff) as u8,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tokens_round_trip() {
        let version = Version::parse("1b3").unwrap();
        assert_eq!(version, Version::V1b3);
        assert_eq!(version.token(), "1b3");
        assert_eq!(version.mime_type(), "application/signed-exchange;v=b3");
        assert!(Version::parse("1b2").is_none());
    }

    #[test]
    fn serialization_layout() {
        let exchange = SignedExchange {
            version: Version::V1b3,
            request_url: Url::parse("https://example.org/hello.html").unwrap(),
            request_method: "GET".to_string(),
            request_headers: Headers::new(),
            status: 200,
            response_headers: Headers::new(),
            payload: Bytes::from_static(b"payload"),
            signature: "label; sig=*AQID*".to_string(),
            header_cbor: vec![0xa0],
        };

        let bytes = exchange.to_bytes().unwrap();
        assert_eq!(&bytes[..8], b"sxg1-b3\0");
        let url = "https://example.org/hello.html";
        assert_eq!(&bytes[8..10], &(url.len() as u16).to_be_bytes());
        assert_eq!(&bytes[10..10 + url.len()], url.as_bytes());
        let mut pos = 10 + url.len();
        assert_eq!(&bytes[pos..pos + 3], &[0, 0, 17]);
        pos += 3;
        assert_eq!(&bytes[pos..pos + 3], &[0, 0, 1]);
        pos += 3;
        assert_eq!(&bytes[pos..pos + 17], b"label; sig=*AQID*");
        pos += 17;
        assert_eq!(bytes[pos], 0xa0);
        pos += 1;
        assert_eq!(&bytes[pos..], b"payload");
    }
}
