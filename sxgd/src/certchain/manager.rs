// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The certificate manager.
//!
//! Holds the current augmented chain, refreshes its OCSP staple and SCT
//! list, and persists chains by digest so that exchanges signed against an
//! older chain keep a resolvable `cert-url` briefly after rotation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use openssl::x509::X509;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

use crate::error::ChainError;

use super::AugmentedChain;
use super::ocsp::{OcspClient, OcspSource};

/// How many rotated-out chains stay resolvable by digest.
const RETAINED_CHAINS: usize = 4;

/// Persistent storage for augmented chains, keyed by digest.
#[derive(Debug, Clone)]
pub enum CertCache {
    /// One CBOR file per digest under `dir`, plus a `latest` marker.
    Disk { dir: PathBuf },
    /// No persistence: reads report not-found and writes do nothing. Used
    /// when the chain is supplied directly (e.g. a pre-augmented CBOR
    /// file).
    Null,
}

impl CertCache {
    pub fn read(&self, digest: &str) -> Result<AugmentedChain, ChainError> {
        match self {
            CertCache::Null => Err(ChainError::NotFound),
            CertCache::Disk { dir } => {
                if !valid_digest(digest) {
                    return Err(ChainError::NotFound);
                }
                let path = dir.join(format!("{digest}.cbor"));
                let bytes = std::fs::read(&path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ChainError::NotFound
                    } else {
                        ChainError::Cache(e)
                    }
                })?;
                AugmentedChain::read_cbor(&bytes).map_err(|e| ChainError::Invalid(e.to_string()))
            }
        }
    }

    pub fn read_latest(&self) -> Result<AugmentedChain, ChainError> {
        match self {
            CertCache::Null => Err(ChainError::NotFound),
            CertCache::Disk { dir } => {
                let digest = std::fs::read_to_string(dir.join("latest")).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        ChainError::NotFound
                    } else {
                        ChainError::Cache(e)
                    }
                })?;
                self.read(digest.trim())
            }
        }
    }

    /// Persist a chain under its digest. Idempotent: an existing file for
    /// the digest is left alone.
    pub fn write(&self, chain: &AugmentedChain) -> Result<(), ChainError> {
        match self {
            CertCache::Null => Ok(()),
            CertCache::Disk { dir } => {
                let digest = chain
                    .digest()
                    .map_err(|e| ChainError::Invalid(e.to_string()))?;
                std::fs::create_dir_all(dir)?;
                let path = dir.join(format!("{digest}.cbor"));
                if !path.exists() {
                    let cbor = chain
                        .write_cbor()
                        .map_err(|e| ChainError::Invalid(e.to_string()))?;
                    std::fs::write(&path, cbor)?;
                }
                std::fs::write(dir.join("latest"), &digest)?;
                Ok(())
            }
        }
    }
}

fn valid_digest(digest: &str) -> bool {
    !digest.is_empty()
        && digest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Where the raw (unaugmented) chain material comes from.
#[derive(Debug, Clone)]
pub enum ChainSource {
    /// PEM chain file, leaf first; augmented with OCSP/SCT on refresh.
    Pem { cert_file: PathBuf },
    /// A pre-augmented `application/cert-chain+cbor` file.
    Cbor { path: PathBuf },
}

pub struct Manager {
    source: ChainSource,
    ocsp_source: OcspSource,
    sct_file: Option<PathBuf>,
    ocsp_client: OcspClient,
    cache: CertCache,
    current: RwLock<Option<Arc<AugmentedChain>>>,
    /// Recently rotated-out chains, still resolvable by digest.
    recent: Mutex<HashMap<String, Arc<AugmentedChain>>>,
}

impl Manager {
    pub fn new(
        source: ChainSource,
        ocsp_source: OcspSource,
        sct_file: Option<PathBuf>,
        cache: CertCache,
    ) -> anyhow::Result<Self> {
        Ok(Manager {
            source,
            ocsp_source,
            sct_file,
            ocsp_client: OcspClient::new()?,
            cache,
            current: RwLock::new(None),
            recent: Mutex::new(HashMap::new()),
        })
    }

    /// The chain exchanges are currently signed against, if any.
    pub fn get_augmented_chain(&self) -> Option<Arc<AugmentedChain>> {
        self.current.read().expect("chain lock poisoned").clone()
    }

    /// Resolve a chain by digest: the current chain, a recently rotated
    /// one, or whatever the persistent cache still holds.
    pub fn read(&self, digest: &str) -> Result<Arc<AugmentedChain>, ChainError> {
        if let Some(current) = self.get_augmented_chain() {
            let current_digest = current
                .digest()
                .map_err(|e| ChainError::Invalid(e.to_string()))?;
            if current_digest == digest {
                return Ok(current);
            }
        }
        {
            let recent = self.recent.lock().expect("chain lock poisoned");
            if let Some(chain) = recent.get(digest) {
                return Ok(chain.clone());
            }
        }
        self.cache.read(digest).map(Arc::new)
    }

    /// Resolve the most recently written chain.
    pub fn read_latest(&self) -> Result<Arc<AugmentedChain>, ChainError> {
        if let Some(current) = self.get_augmented_chain() {
            return Ok(current);
        }
        self.cache.read_latest().map(Arc::new)
    }

    /// Persist a chain and make it resolvable by digest.
    pub fn write(&self, chain: Arc<AugmentedChain>) -> Result<(), ChainError> {
        self.cache.write(&chain)?;
        let digest = chain
            .digest()
            .map_err(|e| ChainError::Invalid(e.to_string()))?;
        let mut recent = self.recent.lock().expect("chain lock poisoned");
        recent.insert(digest, chain);
        if recent.len() > RETAINED_CHAINS {
            // Drop an arbitrary surplus entry; the persistent cache still
            // has everything that was ever written.
            let surplus = recent.keys().next().cloned();
            if let Some(key) = surplus {
                recent.remove(&key);
            }
        }
        Ok(())
    }

    /// Re-acquire the raw material and the OCSP/SCT augmentation. When the
    /// augmented digest changes, the new chain is promoted to current and
    /// persisted.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self) -> anyhow::Result<String> {
        let chain = match &self.source {
            ChainSource::Cbor { path } => {
                let bytes = tokio::fs::read(path).await?;
                AugmentedChain::read_cbor(&bytes)?
            }
            ChainSource::Pem { cert_file } => {
                let pem = tokio::fs::read(cert_file).await?;
                let certs = X509::stack_from_pem(&pem)?;
                if certs.is_empty() {
                    anyhow::bail!("no certificates in {}", cert_file.display());
                }
                let ocsp = self
                    .ocsp_client
                    .obtain(&self.ocsp_source, &certs[0], certs.get(1))
                    .await?;
                let sct = match &self.sct_file {
                    Some(path) => Some(tokio::fs::read(path).await?),
                    None => None,
                };
                AugmentedChain::new(certs, ocsp, sct)?
            }
        };

        let digest = chain.digest()?;
        let previous = self.get_augmented_chain();
        let changed = match &previous {
            Some(previous) => previous.digest()? != digest,
            None => true,
        };
        if changed {
            let chain = Arc::new(chain);
            self.write(chain.clone())?;
            *self.current.write().expect("chain lock poisoned") = Some(chain);
            tracing::info!(%digest, "Promoted new augmented certificate chain");
        } else {
            tracing::debug!(%digest, "Certificate chain unchanged after refresh");
        }
        Ok(digest)
    }

    /// Health verdict for the current chain.
    pub fn verify_all(&self, now: DateTime<Utc>, disallow_test_certs: bool) -> anyhow::Result<()> {
        let chain = self
            .get_augmented_chain()
            .ok_or_else(|| anyhow::anyhow!("no certificate chain loaded"))?;
        chain.verify_all(now, disallow_test_certs)
    }

    /// Periodically refresh until cancelled.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        halt_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; the chain was already
            // loaded at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = halt_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = manager.refresh().await {
                            tracing::error!(?error, "Certificate chain refresh failed");
                        }
                    }
                }
            }
        })
    }
}

/// Build the `cert-url` for a chain digest under the configured base.
pub fn cert_url_for(base: &Url, digest: &str) -> anyhow::Result<Url> {
    let base_str = base.as_str().trim_end_matches('/');
    Ok(Url::parse(&format!("{base_str}/{digest}"))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_path_segments_are_restricted() {
        assert!(valid_digest("pJbHZ91l5Z2pJy0QPl6aIRQGRb93v9kSDBbeJc4zXLo"));
        assert!(!valid_digest(""));
        assert!(!valid_digest("../escape"));
        assert!(!valid_digest("a/b"));
    }

    #[test]
    fn cert_url_appends_digest() {
        let base = Url::parse("https://example.com/webpkg/cert").unwrap();
        let url = cert_url_for(&base, "abc123").unwrap();
        assert_eq!(url.as_str(), "https://example.com/webpkg/cert/abc123");

        let base = Url::parse("https://example.com/webpkg/cert/").unwrap();
        let url = cert_url_for(&base, "abc123").unwrap();
        assert_eq!(url.as_str(), "https://example.com/webpkg/cert/abc123");
    }
}
