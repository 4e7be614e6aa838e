// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signed-exchange factory.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use openssl::pkey::{PKey, Private};
use url::Url;

use crate::certchain::AugmentedChain;
use crate::certchain::manager::{Manager, cert_url_for};
use crate::resource::Response;
use crate::validity::ValidPeriod;

use super::signer::{SignatureParams, Signer, signed_message, verify_signature};
use super::{SignedExchange, Version, headers, mi};

/// Everything needed to produce exchanges for one chain snapshot.
pub struct FactoryConfig {
    pub version: Version,
    pub mi_record_size: usize,
    pub cert_chain: Arc<AugmentedChain>,
    /// Base the `cert-url` is resolved from, already carrying the chain
    /// digest path segment.
    pub cert_url: Url,
    pub private_key: PKey<Private>,
    pub allow_test_cert: bool,
}

/// Produces and verifies signed exchanges.
pub struct Factory {
    config: FactoryConfig,
}

impl Factory {
    pub fn new(config: FactoryConfig) -> Self {
        Factory { config }
    }

    pub fn version(&self) -> Version {
        self.config.version
    }

    pub fn cert_chain(&self) -> &Arc<AugmentedChain> {
        &self.config.cert_chain
    }

    /// Generate a signed exchange from a processed response.
    pub fn new_exchange(
        &self,
        resp: &Response,
        vp: ValidPeriod,
        validity_url: Url,
    ) -> anyhow::Result<SignedExchange> {
        let version = self.config.version;

        let (payload, digest) = mi::encode(&resp.payload, self.config.mi_record_size)?;
        let mut response_headers = resp.signed_headers();
        response_headers.remove("Content-Length");
        response_headers.set("Content-Encoding", version.payload_encoding());
        response_headers.set("Digest", digest);

        let header_cbor = headers::encode_response_headers(resp.status, &response_headers)?;

        let cert_url = resp.request.url.join(self.config.cert_url.as_str())?;
        let signer = Signer {
            date: vp.date(),
            expires: vp.expires(),
            cert_sha256: self.config.cert_chain.leaf_sha256()?,
            cert_url,
            validity_url,
            private_key: self.config.private_key.clone(),
        };
        let signature = signer.signature_header(version, &resp.request.url, &header_cbor)?;

        Ok(SignedExchange {
            version,
            request_url: resp.request.url.clone(),
            request_method: resp.request.method.clone(),
            request_headers: resp.request.headers.clone(),
            status: resp.status,
            response_headers,
            payload: payload.into(),
            signature,
            header_cbor,
        })
    }

    /// Validate `exchange` at `date` and return its decoded payload.
    ///
    /// Every check appends to a log; on failure the collected log is the
    /// error body, mirroring how distributors report invalid exchanges.
    pub fn verify(
        &self,
        exchange: &SignedExchange,
        date: DateTime<Utc>,
    ) -> anyhow::Result<Vec<u8>> {
        let mut log: Vec<String> = Vec::new();
        match self.verify_impl(exchange, date, &mut log) {
            Ok(payload) => Ok(payload),
            Err(error) => {
                log.push(error.to_string());
                Err(anyhow::anyhow!("{}", log.join("\n")))
            }
        }
    }

    fn verify_impl(
        &self,
        exchange: &SignedExchange,
        date: DateTime<Utc>,
        log: &mut Vec<String>,
    ) -> anyhow::Result<Vec<u8>> {
        let params = SignatureParams::parse(&exchange.signature)?;
        log.push(format!("signature label {}", params.label));

        if date < params.date || date > params.expires {
            anyhow::bail!(
                "signature is not fresh at {} (valid {}..{})",
                date.timestamp(),
                params.date.timestamp(),
                params.expires.timestamp()
            );
        }

        let leaf_sha256 = self.config.cert_chain.leaf_sha256()?;
        if params.cert_sha256 != leaf_sha256 {
            anyhow::bail!("cert-sha256 does not match the chain served from cert-url");
        }

        if params.integrity != exchange.version.integrity_identifier() {
            anyhow::bail!("unexpected integrity identifier {}", params.integrity);
        }

        let message = signed_message(
            exchange.version,
            &params.cert_sha256,
            &params.validity_url,
            params.date.timestamp(),
            params.expires.timestamp(),
            exchange.request_url.as_str(),
            &exchange.header_cbor,
        );
        let public_key = self.config.cert_chain.leaf().public_key()?;
        if !verify_signature(&public_key, &message, &params.sig)? {
            anyhow::bail!("signature does not verify with the leaf certificate key");
        }
        log.push("signature verified".to_string());

        let digest = exchange
            .response_headers
            .get("Digest")
            .ok_or_else(|| anyhow::anyhow!("exchange has no Digest header"))?;
        let payload = mi::decode_and_verify(&exchange.payload, digest)?;
        log.push("payload integrity verified".to_string());

        self.config
            .cert_chain
            .verify_all(date, !self.config.allow_test_cert)?;
        log.push("certificate chain verified".to_string());

        Ok(payload)
    }
}

/// Capability handing out the current factory snapshot.
///
/// Handlers go through this instead of holding a factory so that a
/// certificate refresh is picked up without reconstructing anything.
pub trait FactoryProvider: Send + Sync {
    fn get(&self) -> anyhow::Result<Arc<Factory>>;
}

impl FactoryProvider for Arc<Factory> {
    fn get(&self) -> anyhow::Result<Arc<Factory>> {
        Ok(self.clone())
    }
}

/// Provides factories bound to the certificate manager's current chain,
/// rebuilt only when the chain digest changes.
pub struct ManagedFactoryProvider {
    manager: Arc<Manager>,
    version: Version,
    mi_record_size: usize,
    cert_url_base: Url,
    private_key: PKey<Private>,
    allow_test_cert: bool,
    cached: Mutex<Option<(String, Arc<Factory>)>>,
}

impl ManagedFactoryProvider {
    pub fn new(
        manager: Arc<Manager>,
        version: Version,
        mi_record_size: usize,
        cert_url_base: Url,
        private_key: PKey<Private>,
        allow_test_cert: bool,
    ) -> Self {
        ManagedFactoryProvider {
            manager,
            version,
            mi_record_size,
            cert_url_base,
            private_key,
            allow_test_cert,
            cached: Mutex::new(None),
        }
    }
}

impl FactoryProvider for ManagedFactoryProvider {
    fn get(&self) -> anyhow::Result<Arc<Factory>> {
        let chain = self
            .manager
            .get_augmented_chain()
            .ok_or_else(|| anyhow::anyhow!("no certificate chain available yet"))?;
        let digest = chain.digest()?;

        let mut cached = self.cached.lock().expect("factory lock poisoned");
        if let Some((cached_digest, factory)) = cached.as_ref() {
            if *cached_digest == digest {
                return Ok(factory.clone());
            }
        }

        let factory = Arc::new(Factory::new(FactoryConfig {
            version: self.version,
            mi_record_size: self.mi_record_size,
            cert_chain: chain,
            cert_url: cert_url_for(&self.cert_url_base, &digest)?,
            private_key: self.private_key.clone(),
            allow_test_cert: self.allow_test_cert,
        }));
        *cached = Some((digest, factory.clone()));
        Ok(factory)
    }
}
