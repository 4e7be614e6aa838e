// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Certificate chains augmented with OCSP staples and SCT lists.
//!
//! Distributors fetch the publisher's chain as `application/cert-chain+cbor`
//! from the URL named in each exchange's `cert-url` parameter. The CBOR form
//! and its digest are the identity of a chain: rotation is detected by
//! digest change, and `/cert/<digest>` resolves chains by it.

pub mod der;
pub mod manager;
pub mod ocsp;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::hash::{MessageDigest, hash};
use openssl::x509::X509;

/// The magic string opening the cert-chain CBOR array: U+1F4DC U+26D3.
const CBOR_MAGIC: &str = "\u{1F4DC}\u{26D3}";

/// An X.509 chain (leaf first) with its OCSP staple and optional SCT list.
#[derive(Debug, Clone)]
pub struct AugmentedChain {
    certs: Vec<X509>,
    certs_der: Vec<Vec<u8>>,
    ocsp: Vec<u8>,
    sct: Option<Vec<u8>>,
}

impl AugmentedChain {
    pub fn new(certs: Vec<X509>, ocsp: Vec<u8>, sct: Option<Vec<u8>>) -> anyhow::Result<Self> {
        if certs.is_empty() {
            anyhow::bail!("certificate chain is empty");
        }
        let certs_der = certs
            .iter()
            .map(|c| c.to_der().map_err(anyhow::Error::from))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(AugmentedChain {
            certs,
            certs_der,
            ocsp,
            sct,
        })
    }

    /// Load a chain from PEM bytes, leaf first.
    pub fn from_pem(pem: &[u8], ocsp: Vec<u8>, sct: Option<Vec<u8>>) -> anyhow::Result<Self> {
        let certs = X509::stack_from_pem(pem)?;
        AugmentedChain::new(certs, ocsp, sct)
    }

    pub fn leaf(&self) -> &X509 {
        &self.certs[0]
    }

    pub fn leaf_der(&self) -> &[u8] {
        &self.certs_der[0]
    }

    pub fn certs(&self) -> &[X509] {
        &self.certs
    }

    pub fn ocsp(&self) -> &[u8] {
        &self.ocsp
    }

    pub fn sct(&self) -> Option<&[u8]> {
        self.sct.as_deref()
    }

    /// SHA-256 of the leaf certificate's DER form; bound into every
    /// signature as `cert-sha256`.
    pub fn leaf_sha256(&self) -> anyhow::Result<[u8; 32]> {
        let digest = hash(MessageDigest::sha256(), self.leaf_der())?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Serialize to `application/cert-chain+cbor`: an array opening with
    /// the magic string, then one map per certificate (leaf first). The
    /// leaf's map carries the OCSP staple and, when present, the SCT list.
    pub fn write_cbor(&self) -> anyhow::Result<Vec<u8>> {
        let mut encoder = minicbor::Encoder::new(Vec::new());
        encoder
            .array(1 + self.certs_der.len() as u64)
            .map_err(|e| anyhow::anyhow!("cbor encoding failed: {e}"))?;
        encoder
            .str(CBOR_MAGIC)
            .map_err(|e| anyhow::anyhow!("cbor encoding failed: {e}"))?;
        for (i, der) in self.certs_der.iter().enumerate() {
            // Canonical map order: shorter keys first, then bytewise, so
            // "sct" precedes "cert" which precedes "ocsp".
            let sct = if i == 0 { self.sct.as_deref() } else { None };
            let ocsp = if i == 0 { Some(self.ocsp.as_slice()) } else { None };
            let len = 1 + sct.is_some() as u64 + ocsp.is_some() as u64;
            encoder
                .map(len)
                .map_err(|e| anyhow::anyhow!("cbor encoding failed: {e}"))?;
            if let Some(sct) = sct {
                encoder
                    .str("sct")
                    .and_then(|e| e.bytes(sct))
                    .map_err(|e| anyhow::anyhow!("cbor encoding failed: {e}"))?;
            }
            encoder
                .str("cert")
                .and_then(|e| e.bytes(der))
                .map_err(|e| anyhow::anyhow!("cbor encoding failed: {e}"))?;
            if let Some(ocsp) = ocsp {
                encoder
                    .str("ocsp")
                    .and_then(|e| e.bytes(ocsp))
                    .map_err(|e| anyhow::anyhow!("cbor encoding failed: {e}"))?;
            }
        }
        Ok(encoder.into_writer())
    }

    /// Parse a chain back from its CBOR serialization.
    pub fn read_cbor(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut decoder = minicbor::Decoder::new(bytes);
        let len = decoder
            .array()
            .map_err(|e| anyhow::anyhow!("cert-chain cbor: {e}"))?
            .ok_or_else(|| anyhow::anyhow!("cert-chain cbor: indefinite array"))?;
        if len < 2 {
            anyhow::bail!("cert-chain cbor: no certificates");
        }
        let magic = decoder
            .str()
            .map_err(|e| anyhow::anyhow!("cert-chain cbor: {e}"))?;
        if magic != CBOR_MAGIC {
            anyhow::bail!("cert-chain cbor: bad magic string");
        }

        let mut certs = Vec::new();
        let mut ocsp = Vec::new();
        let mut sct = None;
        for i in 0..(len - 1) {
            let entries = decoder
                .map()
                .map_err(|e| anyhow::anyhow!("cert-chain cbor: {e}"))?
                .ok_or_else(|| anyhow::anyhow!("cert-chain cbor: indefinite map"))?;
            for _ in 0..entries {
                let key = decoder
                    .str()
                    .map_err(|e| anyhow::anyhow!("cert-chain cbor: {e}"))?
                    .to_string();
                let value = decoder
                    .bytes()
                    .map_err(|e| anyhow::anyhow!("cert-chain cbor: {e}"))?;
                match key.as_str() {
                    "cert" => certs.push(X509::from_der(value)?),
                    "ocsp" if i == 0 => ocsp = value.to_vec(),
                    "sct" if i == 0 => sct = Some(value.to_vec()),
                    _ => {}
                }
            }
        }

        AugmentedChain::new(certs, ocsp, sct)
    }

    /// The chain identity: base64url (no padding) of the SHA-256 over the
    /// CBOR serialization.
    pub fn digest(&self) -> anyhow::Result<String> {
        let cbor = self.write_cbor()?;
        let digest = hash(MessageDigest::sha256(), &cbor)?;
        Ok(URL_SAFE_NO_PAD.encode(&digest))
    }

    /// Validate the chain: every certificate within its validity window at
    /// `now` and each certificate signed by its successor. With
    /// `disallow_test_certs`, the leaf must also carry the
    /// CanSignHttpExchanges extension and the OCSP staple must be a
    /// well-formed successful response.
    pub fn verify_all(&self, now: DateTime<Utc>, disallow_test_certs: bool) -> anyhow::Result<()> {
        let at = Asn1Time::from_unix(now.timestamp())?;
        for (i, cert) in self.certs.iter().enumerate() {
            if cert.not_before().compare(&at)? == std::cmp::Ordering::Greater {
                anyhow::bail!("certificate {i} is not yet valid");
            }
            if cert.not_after().compare(&at)? == std::cmp::Ordering::Less {
                anyhow::bail!("certificate {i} has expired");
            }
        }
        for i in 0..self.certs.len() - 1 {
            let issuer_key = self.certs[i + 1].public_key()?;
            if !self.certs[i].verify(&issuer_key)? {
                anyhow::bail!("certificate {i} is not signed by certificate {}", i + 1);
            }
        }

        if disallow_test_certs {
            if !der::has_can_sign_http_exchanges(self.leaf_der())? {
                anyhow::bail!("leaf certificate lacks the CanSignHttpExchanges extension");
            }
            let response = openssl::ocsp::OcspResponse::from_der(&self.ocsp)
                .map_err(|e| anyhow::anyhow!("OCSP staple does not parse: {e}"))?;
            if response.status() != openssl::ocsp::OcspResponseStatus::SUCCESSFUL {
                anyhow::bail!("OCSP staple status is {:?}", response.status());
            }
        }

        Ok(())
    }
}
