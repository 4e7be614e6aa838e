// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! End-to-end tests of the serving surface.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sxgd::cache::ResourceCache;
use sxgd::certchain::manager::{CertCache, ChainSource, Manager};
use sxgd::certchain::ocsp::OcspSource;
use sxgd::config::Config;
use sxgd::exchange::factory::{Factory, FactoryConfig, FactoryProvider};
use sxgd::exchange::Version;
use sxgd::fetch::RequestTweaker;
use sxgd::packager::Packager;
use sxgd::processor::{self, TaskSetConfig};
use sxgd::resource::Headers;
use sxgd::rewrite::UrlRule;
use sxgd::server::handler::Handler;
use sxgd::server::http::HttpRequest;
use sxgd::server::Server;
use sxgd::validity::{ValidPeriodRule, ValidityUrlRule};
use sxgd_test::{CannedResponse, StubFetcher, TestChain, create_test_chain};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

/// Send one raw HTTP request and return (status, headers, body).
async fn roundtrip(
    addr: std::net::SocketAddr,
    raw: &str,
) -> anyhow::Result<(u16, Vec<(String, String)>, Vec<u8>)> {
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    stream.write_all(raw.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;

    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("no header terminator in response"))?;
    let head = String::from_utf8_lossy(&response[..split]).into_owned();
    let body = response[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status: u16 = status_line
        .split_ascii_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("bad status line: {status_line}"))?;
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    Ok((status, headers, body))
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

async fn start_test_server(
    dir: &std::path::Path,
    chain: &TestChain,
) -> anyhow::Result<sxgd::server::Listener> {
    let (cert_path, key_path) = chain.write_pem_files(dir)?;

    let mut config = Config::default();
    config.listen.port = 0;
    config.sxg.cert_url = "https://example.org/webpkg/cert".to_string();
    config.sxg.fetch_timeout = Duration::from_secs(2);
    config.sxg.cert.pem_file = cert_path;
    config.sxg.cert.key_file = key_path;
    config.sxg.cert.allow_test_cert = true;

    let server = Server::new(config).await?;
    server.run()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn serving_surface_end_to_end() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = create_test_chain("example.org")?;
    let listener = start_test_server(dir.path(), &chain).await?;
    let addr = listener.local_addr();

    // Health: the chain is loaded and test certs are allowed.
    let (status, _, body) = roundtrip(
        addr,
        "GET /healthz HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");

    // Validity: the stub empty CBOR map.
    let (status, headers, body) = roundtrip(
        addr,
        "GET /webpkg/validity HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Type"), Some("application/cbor"));
    assert_eq!(body, vec![0xa0]);

    // Cert endpoint serves the augmented chain by digest.
    let digest = chain.chain.digest()?;
    let (status, headers, body) = roundtrip(
        addr,
        &format!("GET /webpkg/cert/{digest} HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"),
    )
    .await?;
    assert_eq!(status, 200);
    assert_eq!(
        header(&headers, "Content-Type"),
        Some("application/cert-chain+cbor")
    );
    assert_eq!(body, chain.chain.write_cbor()?);

    // Unknown digest is a 404.
    let (status, _, _) = roundtrip(
        addr,
        "GET /webpkg/cert/unknown_digest HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 404);

    // Non-GET methods are rejected outright.
    let (status, _, _) = roundtrip(
        addr,
        "POST /healthz HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 405);

    // The doc endpoint requires an SXG-capable Accept header.
    let (status, _, _) = roundtrip(
        addr,
        "GET /priv/doc?sign=https%3A%2F%2Fexample.org%2F HTTP/1.1\r\nHost: t\r\nAccept: text/html\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 400);

    // A bad sign URL is a 400 even with the right Accept header.
    let (status, _, _) = roundtrip(
        addr,
        "GET /priv/doc?sign=http%3A%2F%2Finsecure%2F HTTP/1.1\r\nHost: t\r\nAccept: application/signed-exchange;v=b3\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 400);

    // Unknown paths are 404.
    let (status, _, _) = roundtrip(
        addr,
        "GET /nowhere HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 404);

    listener.halt().await?;
    Ok(())
}

#[tokio::test]
async fn upstream_fetch_failures_are_bad_gateway() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = create_test_chain("example.org")?;
    let listener = start_test_server(dir.path(), &chain).await?;
    let addr = listener.local_addr();

    // Nothing listens on port 9 of localhost over TLS; the fetch fails and
    // surfaces as a 502 without proxying any upstream detail.
    let (status, _, body) = roundtrip(
        addr,
        "GET /priv/doc?sign=https%3A%2F%2F127.0.0.1%3A9%2F HTTP/1.1\r\nHost: t\r\nAccept: application/signed-exchange;v=b3\r\nConnection: close\r\n\r\n",
    )
    .await?;
    assert_eq!(status, 502);
    assert!(body.is_empty());

    listener.halt().await?;
    Ok(())
}

fn doc_request(target: &str) -> HttpRequest {
    HttpRequest {
        method: "GET".to_string(),
        target: target.to_string(),
        version: "HTTP/1.1".to_string(),
        headers: Headers::from_pairs([("Accept", "application/signed-exchange;v=b3")]),
    }
}

/// Build a handler whose packager reads from a stub fetcher, with the
/// certificate manager loaded from generated PEM files.
async fn stub_handler(
    dir: &std::path::Path,
    chain: &TestChain,
    fetcher: Arc<StubFetcher>,
) -> anyhow::Result<Handler> {
    let (cert_path, _) = chain.write_pem_files(dir)?;
    let manager = Arc::new(Manager::new(
        ChainSource::Pem {
            cert_file: cert_path,
        },
        OcspSource::Dummy,
        None,
        CertCache::Null,
    )?);
    manager.refresh().await?;

    let factory = Arc::new(Factory::new(FactoryConfig {
        version: Version::V1b3,
        mi_record_size: 4096,
        cert_chain: manager
            .get_augmented_chain()
            .ok_or_else(|| anyhow::anyhow!("chain must be loaded"))?,
        cert_url: Url::parse("https://example.org/webpkg/cert/abc")?,
        private_key: chain.key.clone(),
        allow_test_cert: true,
    }));
    let provider: Arc<dyn FactoryProvider> = Arc::new(factory);

    let packager = Arc::new(Packager {
        request_tweaker: RequestTweaker::Default(Version::V1b3),
        physical_url_rule: UrlRule::physical("index.html"),
        validity_url_rule: ValidityUrlRule::AppendExtDotLastModified(".validity".to_string()),
        valid_period_rule: ValidPeriodRule::standard(
            Duration::from_secs(72 * 3600),
            Duration::from_secs(12 * 3600),
        ),
        processor: Arc::new(processor::comprehensive(
            vec![200],
            Some(4194304),
            TaskSetConfig::default(),
        )),
        factory: provider,
        cache: Arc::new(ResourceCache::new(None)),
        fetcher,
        fetch_timeout: Duration::from_secs(5),
        max_preload_depth: 2,
        max_preloads_per_resource: 16,
        keep_non_sxg_preloads: false,
    });

    Ok(Handler::new(
        "/priv/doc",
        "sign",
        "/webpkg/cert",
        "/webpkg/validity",
        "/healthz",
        packager,
        manager,
        true,
    ))
}

#[tokio::test]
async fn doc_endpoint_serves_a_signed_exchange() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = create_test_chain("example.org")?;
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/hello.html",
        CannedResponse::html("<!doctype html><p>Hello, world!</p>"),
    ));
    let handler = stub_handler(dir.path(), &chain, fetcher).await?;

    let request = doc_request("/priv/doc?sign=https%3A%2F%2Fexample.org%2Fhello.html");
    let response = handler.handle(&request, Utc::now()).await;

    assert_eq!(response.status, 200);
    let content_type = response
        .headers
        .iter()
        .find(|(k, _)| k == "Content-Type")
        .map(|(_, v)| v.as_str());
    assert_eq!(content_type, Some("application/signed-exchange;v=b3"));
    assert_eq!(&response.body[..8], b"sxg1-b3\0");

    Ok(())
}

#[tokio::test]
async fn doc_endpoint_accepts_the_raw_path_form() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = create_test_chain("example.org")?;
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/hello.html",
        CannedResponse::html("<!doctype html><p>Hello, world!</p>"),
    ));
    let handler = stub_handler(dir.path(), &chain, fetcher).await?;

    let request = doc_request("/priv/doc/https://example.org/a/../hello.html");
    let response = handler.handle(&request, Utc::now()).await;
    assert_eq!(response.status, 200);

    Ok(())
}

#[tokio::test]
async fn excluded_status_passes_through() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = create_test_chain("example.org")?;
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/hello.html",
        CannedResponse::html("").with_status(204),
    ));
    let handler = stub_handler(dir.path(), &chain, fetcher).await?;

    let request = doc_request("/priv/doc?sign=https%3A%2F%2Fexample.org%2Fhello.html");
    let response = handler.handle(&request, Utc::now()).await;

    assert_eq!(response.status, 204);
    assert!(response.body.is_empty());

    Ok(())
}

#[tokio::test]
async fn url_mismatch_is_a_silent_bad_request() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let chain = create_test_chain("example.org")?;
    let mut canned = CannedResponse::html("<!doctype html><p>moved</p>");
    canned.effective_url = Some(Url::parse("https://example.org/moved.html")?);
    let fetcher = Arc::new(StubFetcher::new().route("https://example.org/hello.html", canned));
    let handler = stub_handler(dir.path(), &chain, fetcher).await?;

    let request = doc_request("/priv/doc?sign=https%3A%2F%2Fexample.org%2Fhello.html");
    let response = handler.handle(&request, Utc::now()).await;

    assert_eq!(response.status, 400);
    assert!(response.body.is_empty());

    Ok(())
}
