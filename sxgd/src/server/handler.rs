// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The serving endpoints.
//!
//! `{doc_path}` produces and serves exchanges, `{cert_path}/<digest>`
//! serves augmented chains, `{validity_path}` serves the stub validity
//! payload, and `{health_path}` reports whether the current chain
//! validates. Everything is GET-only.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::instrument;
use url::Url;

use crate::certchain::manager::Manager;
use crate::error::{ChainError, PackageErrorKind};
use crate::packager::Packager;
use crate::rewrite::clean_path;

use super::http::{HttpRequest, HttpResponse};

const MIME_TYPE_CERT_CHAIN: &str = "application/cert-chain+cbor";
const MIME_TYPE_EXCHANGE: &str = "application/signed-exchange";
const MIME_TYPE_VALIDITY: &str = "application/cbor";

/// CBOR empty map: the stub validity payload.
const EMPTY_MAP_CBOR: [u8; 1] = [0xa0];

pub struct Handler {
    doc_path: String,
    sign_param: String,
    cert_path: String,
    validity_path: String,
    health_path: String,
    packager: Arc<Packager>,
    cert_manager: Arc<Manager>,
    allow_test_cert: bool,
}

impl Handler {
    pub fn new(
        doc_path: &str,
        sign_param: &str,
        cert_path: &str,
        validity_path: &str,
        health_path: &str,
        packager: Arc<Packager>,
        cert_manager: Arc<Manager>,
        allow_test_cert: bool,
    ) -> Self {
        Handler {
            doc_path: trim_trailing_slash(doc_path),
            sign_param: sign_param.to_string(),
            cert_path: trim_trailing_slash(cert_path),
            validity_path: trim_trailing_slash(validity_path),
            health_path: trim_trailing_slash(health_path),
            packager,
            cert_manager,
            allow_test_cert,
        }
    }

    #[instrument(skip_all, fields(method = %req.method, target = %req.target))]
    pub async fn handle(&self, req: &HttpRequest, now: DateTime<Utc>) -> HttpResponse {
        if req.method != "GET" {
            return HttpResponse::new(405);
        }

        let path = req.path();

        // The raw-path doc form carries a full URL in the path; it must be
        // matched before any other routing so `https://` and `..` survive.
        if let Some(raw) = path.strip_prefix(&format!("{}/", self.doc_path)) {
            let mut sign_url = raw.to_string();
            if let Some(query) = req.query() {
                sign_url.push('?');
                sign_url.push_str(query);
            }
            return self.handle_doc(req, &sign_url, now).await;
        }
        if path == self.doc_path {
            let Some(sign_url) = req.query_param(&self.sign_param) else {
                return client_error(format!("missing {} parameter", self.sign_param));
            };
            return self.handle_doc(req, &sign_url, now).await;
        }
        if let Some(digest) = path.strip_prefix(&format!("{}/", self.cert_path)) {
            return self.handle_cert(digest).await;
        }
        if path == self.validity_path {
            return HttpResponse::ok(&EMPTY_MAP_CBOR[..], MIME_TYPE_VALIDITY);
        }
        if path == self.health_path {
            return self.handle_health(now);
        }

        HttpResponse::new(404)
    }

    async fn handle_doc(&self, req: &HttpRequest, sign_url: &str, now: DateTime<Utc>) -> HttpResponse {
        if let Err(why) = verify_accept_header(req) {
            return client_error(why);
        }
        let url = match parse_sign_url(sign_url) {
            Ok(url) => url,
            Err(why) => return client_error(format!("invalid sign url: {why}")),
        };

        let (artifact, errors) = self.packager.run_for_url(url.clone(), now).await;

        // The physical URL is the cache key, so errors come back wrapped
        // with it rather than the raw sign URL.
        let target = self.packager.physical_url_rule.apply(&url);
        let relevant = errors.filter(&target);
        if let Some(error) = relevant.first() {
            if relevant.len() > 1 {
                tracing::warn!(url = %target, count = relevant.len(), "Multiple errors for target URL");
            }
            return match &error.kind {
                PackageErrorKind::HttpStatus(code) => HttpResponse::new(*code),
                PackageErrorKind::UrlMismatch { .. } => {
                    tracing::info!(url = %target, "URL mismatch");
                    HttpResponse::new(400)
                }
                PackageErrorKind::BadRequest(why) => client_error(why.clone()),
                PackageErrorKind::Fetch(_) | PackageErrorKind::FetchTimeout(_) => {
                    server_error(502, error)
                }
                PackageErrorKind::Processing(_) => server_error(502, error),
                PackageErrorKind::Signing(_) | PackageErrorKind::CacheBuild(_) => {
                    server_error(500, error)
                }
            };
        }

        let Some(artifact) = artifact else {
            tracing::error!(url = %target, "No artifact and no error for target URL");
            return HttpResponse::new(500);
        };
        HttpResponse::ok(
            artifact.serialized.clone(),
            artifact.exchange.version.mime_type(),
        )
    }

    async fn handle_cert(&self, digest: &str) -> HttpResponse {
        let chain = match self.cert_manager.read(digest) {
            Ok(chain) => chain,
            Err(ChainError::NotFound) => return HttpResponse::new(404),
            Err(error) => {
                tracing::error!(?error, digest, "Unable to read certificate chain");
                return HttpResponse::new(500);
            }
        };
        match chain.write_cbor() {
            Ok(cbor) => HttpResponse::ok(cbor, MIME_TYPE_CERT_CHAIN),
            Err(error) => {
                tracing::error!(?error, digest, "Unable to serialize certificate chain");
                HttpResponse::new(500)
            }
        }
    }

    fn handle_health(&self, now: DateTime<Utc>) -> HttpResponse {
        if self.cert_manager.get_augmented_chain().is_none() {
            return HttpResponse::new(404);
        }
        match self.cert_manager.verify_all(now, !self.allow_test_cert) {
            Ok(()) => HttpResponse::ok(&b"ok"[..], "text/plain; charset=utf-8"),
            Err(error) => {
                tracing::error!(?error, "Health check failed");
                HttpResponse::new(500)
            }
        }
    }
}

fn trim_trailing_slash(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn client_error(why: impl Into<String>) -> HttpResponse {
    let why = why.into();
    tracing::info!(%why, "Rejecting request");
    HttpResponse {
        status: 400,
        headers: vec![(
            "Content-Type".to_string(),
            "text/plain; charset=utf-8".to_string(),
        )],
        body: format!("{why}\n").into(),
    }
}

fn server_error(status: u16, error: &crate::error::PackageError) -> HttpResponse {
    tracing::error!(url = %error.url, kind = %error.kind, "Packaging failed");
    // Upstream error bodies are never proxied; the detail stays in the log.
    HttpResponse::new(status)
}

fn verify_accept_header(req: &HttpRequest) -> Result<(), String> {
    // TODO parse q-values properly; for now mere presence is required.
    for value in req.headers.get_all("Accept") {
        if value.contains(MIME_TYPE_EXCHANGE) {
            return Ok(());
        }
    }
    Err(format!("Accept header missing {MIME_TYPE_EXCHANGE}"))
}

/// Validate and canonicalize a sign URL: absolute, https, no userinfo, no
/// fragment. The path is cleaned; the query survives but special
/// characters other than `&` and `=` are percent-escaped.
fn parse_sign_url(raw: &str) -> Result<Url, String> {
    if raw.is_empty() {
        return Err("must be non-empty".to_string());
    }
    let mut url = Url::parse(raw).map_err(|e| e.to_string())?;
    if url.scheme() != "https" {
        return Err("must start with https://".to_string());
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("must not have user:pass@".to_string());
    }
    if url.fragment().is_some() {
        return Err("must not have #fragment".to_string());
    }

    let cleaned = clean_path(url.path());
    url.set_path(&cleaned);
    if let Some(query) = url.query() {
        let escaped = escape_query(query);
        url.set_query(Some(&escaped));
    }
    Ok(url)
}

/// Escape query characters that are unsafe in a derived URL, leaving `&`
/// and `=` intact so parameter structure survives.
fn escape_query(query: &str) -> String {
    const KEEP: &[u8] = b"-_.~!$&'()*+,;=:@/?%";
    let mut out = String::with_capacity(query.len());
    for byte in query.bytes() {
        if byte.is_ascii_alphanumeric() || KEEP.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}
