// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing sxgd components, shared across unit and
//! integration tests.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use bytes::Bytes;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509, X509NameBuilder};
use sxgd::certchain::AugmentedChain;
use sxgd::certchain::ocsp::DUMMY_OCSP;
use sxgd::fetch::Fetcher;
use sxgd::resource::{FetchRequest, Headers, Response};
use url::Url;

/// A generated signing identity: a self-signed P-256 chain plus its key.
pub struct TestChain {
    pub chain: AugmentedChain,
    pub key: PKey<Private>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Generate a self-signed ECDSA P-256 certificate for `domain`.
///
/// The chain uses the dummy OCSP staple, so it only passes validation with
/// test certificates allowed.
pub fn create_test_chain(domain: &str) -> anyhow::Result<TestChain> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", domain)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = {
        let mut serial = BigNum::new()?;
        serial.rand(63, MsbOption::MAYBE_ZERO, false)?;
        serial.to_asn1_integer()?
    };
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    // Backdated an hour so freshly minted certs validate across skew.
    let now = chrono::Utc::now().timestamp();
    let not_before = Asn1Time::from_unix(now - 3600)?;
    let not_after = Asn1Time::from_unix(now + 90 * 86400)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    let san = SubjectAlternativeName::new()
        .dns(domain)
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;
    builder.sign(&key, MessageDigest::sha256())?;
    let cert = builder.build();

    let cert_pem = cert.to_pem()?;
    let key_pem = key.private_key_to_pem_pkcs8()?;
    let chain = AugmentedChain::new(vec![cert], DUMMY_OCSP.to_vec(), None)?;

    Ok(TestChain {
        chain,
        key,
        cert_pem,
        key_pem,
    })
}

impl TestChain {
    /// Write the PEM material to `dir` and return the two paths.
    pub fn write_pem_files(
        &self,
        dir: &Path,
    ) -> anyhow::Result<(std::path::PathBuf, std::path::PathBuf)> {
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("priv.key");
        std::fs::write(&cert_path, &self.cert_pem)?;
        std::fs::write(&key_path, &self.key_pem)?;
        Ok((cert_path, key_path))
    }
}

/// Build a [`Response`] from a raw HTTP/1.1 response string, e.g.
/// `"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<p>hi</p>"`.
pub fn make_response(url: &str, raw: &str) -> Response {
    let url = Url::parse(url).expect("test URL must parse");
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("response must have a status line");
    let status: u16 = status_line
        .split_ascii_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line must carry a code");

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line.split_once(':').expect("header line must have a colon");
        headers.add(name.trim(), value.trim());
    }

    Response::new(
        FetchRequest::get(url),
        status,
        headers,
        Bytes::from(body.as_bytes().to_vec()),
    )
}

/// An empty 200 response with a `text/html` content type.
pub fn make_empty_response(url: &str) -> Response {
    make_response(
        url,
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\r\n",
    )
}

/// A canned upstream response served by [`StubFetcher`].
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Overrides the effective response URL, to exercise mismatches.
    pub effective_url: Option<Url>,
}

impl CannedResponse {
    pub fn html(body: &str) -> Self {
        CannedResponse {
            status: 200,
            headers: vec![
                ("Cache-Control".to_string(), "public, max-age=604800".to_string()),
                ("Content-Type".to_string(), "text/html; charset=utf-8".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            body: body.as_bytes().to_vec(),
            effective_url: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A fetcher serving canned responses and counting its invocations.
#[derive(Default)]
pub struct StubFetcher {
    routes: Mutex<HashMap<String, CannedResponse>>,
    fetches: AtomicUsize,
}

impl StubFetcher {
    pub fn new() -> Self {
        StubFetcher::default()
    }

    pub fn route(self, url: &str, response: CannedResponse) -> Self {
        self.routes
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Fetcher for StubFetcher {
    fn fetch(
        &self,
        req: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Response>> + Send + '_>> {
        let canned = self
            .routes
            .lock()
            .unwrap()
            .get(req.url.as_str())
            .cloned()
            .with_context(|| format!("no canned response for {}", req.url));
        self.fetches.fetch_add(1, Ordering::SeqCst);

        Box::pin(async move {
            let canned = canned?;
            let mut request = req;
            if let Some(effective) = &canned.effective_url {
                request.url = effective.clone();
            }
            Ok(Response::new(
                request,
                canned.status,
                Headers::from_pairs(canned.headers.clone()),
                Bytes::from(canned.body),
            ))
        })
    }
}
