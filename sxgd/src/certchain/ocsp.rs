// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Obtaining OCSP staples for the augmented chain.

use std::path::PathBuf;

use openssl::hash::MessageDigest;
use openssl::ocsp::{OcspCertId, OcspRequest};
use openssl::x509::X509;
use url::Url;

use super::der;

/// A placeholder staple for test certificates that have no OCSP
/// infrastructure behind them.
pub const DUMMY_OCSP: &[u8] = b"dummy-ocsp";

/// Where the OCSP staple comes from.
#[derive(Debug, Clone)]
pub enum OcspSource {
    /// Build an OCSP request and POST it to the leaf's responder, taken
    /// from the AuthorityInfoAccess extension or the configured override.
    Fetch { responder: Option<Url> },
    /// Read a DER-encoded response from a file.
    File(PathBuf),
    /// Use [`DUMMY_OCSP`]; only sensible with `allow_test_cert`.
    Dummy,
}

pub struct OcspClient {
    http: reqwest::Client,
}

impl OcspClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::fetch::USER_AGENT)
            .build()?;
        Ok(OcspClient { http })
    }

    /// Obtain the staple for `leaf` according to `source`.
    pub async fn obtain(
        &self,
        source: &OcspSource,
        leaf: &X509,
        issuer: Option<&X509>,
    ) -> anyhow::Result<Vec<u8>> {
        match source {
            OcspSource::Dummy => Ok(DUMMY_OCSP.to_vec()),
            OcspSource::File(path) => {
                let staple = tokio::fs::read(path).await?;
                tracing::debug!(path = %path.display(), bytes = staple.len(), "Read OCSP staple from file");
                Ok(staple)
            }
            OcspSource::Fetch { responder } => {
                let responder = match responder {
                    Some(url) => url.clone(),
                    None => {
                        let discovered = der::ocsp_responder(&leaf.to_der()?)?.ok_or_else(|| {
                            anyhow::anyhow!(
                                "leaf certificate has no OCSP responder; configure one or provide a staple file"
                            )
                        })?;
                        Url::parse(&discovered)?
                    }
                };
                let issuer = issuer.ok_or_else(|| {
                    anyhow::anyhow!("OCSP requests need the issuer certificate in the chain")
                })?;
                self.fetch(&responder, leaf, issuer).await
            }
        }
    }

    async fn fetch(&self, responder: &Url, leaf: &X509, issuer: &X509) -> anyhow::Result<Vec<u8>> {
        let cert_id = OcspCertId::from_cert(MessageDigest::sha1(), leaf, issuer)?;
        let mut request = OcspRequest::new()?;
        request.add_id(cert_id)?;
        let body = request.to_der()?;

        tracing::debug!(responder = %responder, "Requesting OCSP response");
        let response = self
            .http
            .post(responder.as_str())
            .header("Content-Type", "application/ocsp-request")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let staple = response.bytes().await?.to_vec();

        // Reject garbage before it becomes part of the served chain.
        let parsed = openssl::ocsp::OcspResponse::from_der(&staple)?;
        if parsed.status() != openssl::ocsp::OcspResponseStatus::SUCCESSFUL {
            anyhow::bail!("OCSP responder returned status {:?}", parsed.status());
        }
        Ok(staple)
    }
}
