// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Pipeline behavior: single-flight builds, preload recursion, error
//! wrapping and filtering.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sxgd::error::PackageErrorKind;
use sxgd::cache::ResourceCache;
use sxgd::exchange::factory::{Factory, FactoryConfig, FactoryProvider};
use sxgd::exchange::Version;
use sxgd::fetch::RequestTweaker;
use sxgd::packager::Packager;
use sxgd::processor::{self, TaskSetConfig};
use sxgd::rewrite::UrlRule;
use sxgd::validity::{ValidPeriodRule, ValidityUrlRule};
use sxgd_test::{CannedResponse, StubFetcher, create_test_chain};
use url::Url;

fn test_packager(fetcher: Arc<StubFetcher>) -> anyhow::Result<Packager> {
    let chain = create_test_chain("example.org")?;
    let factory = Arc::new(Factory::new(FactoryConfig {
        version: Version::V1b3,
        mi_record_size: 4096,
        cert_chain: Arc::new(chain.chain.clone()),
        cert_url: Url::parse("https://example.org/webpkg/cert/abc")?,
        private_key: chain.key.clone(),
        allow_test_cert: true,
    }));
    let provider: Arc<dyn FactoryProvider> = Arc::new(factory);

    Ok(Packager {
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
            TaskSetConfig {
                aggressive: true,
                preload_css: true,
                preload_js: true,
            },
        )),
        factory: provider,
        cache: Arc::new(ResourceCache::new(None)),
        fetcher,
        fetch_timeout: Duration::from_secs(5),
        max_preload_depth: 2,
        max_preloads_per_resource: 16,
        keep_non_sxg_preloads: false,
    })
}

#[tokio::test]
async fn simple_html_produces_an_exchange() -> anyhow::Result<()> {
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/hello.html",
        CannedResponse::html("<!doctype html><p>Hello, world!</p>"),
    ));
    let packager = test_packager(fetcher)?;

    let now = Utc::now();
    let (artifact, errors) = packager
        .run_for_url(Url::parse("https://example.org/hello.html")?, now)
        .await;

    assert!(errors.is_empty(), "unexpected errors: {errors}");
    let artifact = artifact.expect("root artifact should exist");
    assert_eq!(artifact.exchange.status, 200);
    assert_eq!(&artifact.serialized[..8], b"sxg1-b3\0");

    Ok(())
}

#[tokio::test]
async fn status_outside_allow_set_is_passthrough_eligible() -> anyhow::Result<()> {
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/hello.html",
        CannedResponse::html("").with_status(204),
    ));
    let packager = test_packager(fetcher)?;

    let url = Url::parse("https://example.org/hello.html")?;
    let (artifact, errors) = packager.run_for_url(url.clone(), Utc::now()).await;

    assert!(artifact.is_none());
    let relevant = errors.filter(&url);
    assert_eq!(relevant.len(), 1);
    assert_eq!(relevant[0].kind, PackageErrorKind::HttpStatus(204));

    Ok(())
}

#[tokio::test]
async fn effective_url_mismatch_fails() -> anyhow::Result<()> {
    let mut canned = CannedResponse::html("<!doctype html><p>moved</p>");
    canned.effective_url = Some(Url::parse("https://example.org/moved.html")?);
    let fetcher = Arc::new(StubFetcher::new().route("https://example.org/hello.html", canned));
    let packager = test_packager(fetcher)?;

    let url = Url::parse("https://example.org/hello.html")?;
    let (artifact, errors) = packager.run_for_url(url.clone(), Utc::now()).await;

    assert!(artifact.is_none());
    let relevant = errors.filter(&url);
    assert!(matches!(
        relevant[0].kind,
        PackageErrorKind::UrlMismatch { .. }
    ));

    Ok(())
}

#[tokio::test]
async fn preloads_are_packaged_as_subresources() -> anyhow::Result<()> {
    let html = concat!(
        "<!doctype html>",
        r#"<link rel="stylesheet" href="style.css">"#,
        r#"<script src="script.js"></script>"#,
    );
    let fetcher = Arc::new(
        StubFetcher::new()
            .route("https://example.org/hello.html", CannedResponse::html(html))
            .route(
                "https://example.org/style.css",
                CannedResponse {
                    status: 200,
                    headers: vec![("Content-Type".to_string(), "text/css".to_string())],
                    body: b"p { color: red }".to_vec(),
                    effective_url: None,
                },
            )
            .route(
                "https://example.org/script.js",
                CannedResponse {
                    status: 200,
                    headers: vec![(
                        "Content-Type".to_string(),
                        "application/javascript".to_string(),
                    )],
                    body: b"console.log(1)".to_vec(),
                    effective_url: None,
                },
            ),
    );
    let packager = test_packager(fetcher.clone())?;

    let url = Url::parse("https://example.org/hello.html")?;
    let (artifact, errors) = packager.run_for_url(url, Utc::now()).await;

    assert!(errors.is_empty(), "unexpected errors: {errors}");
    let artifact = artifact.expect("root artifact should exist");

    let link = artifact.exchange.response_headers.get("Link").unwrap();
    assert!(link.contains("<https://example.org/style.css>;rel=\"preload\";as=\"style\""));
    assert!(link.contains("<https://example.org/script.js>;rel=\"preload\";as=\"script\""));

    // Root plus both subresources were fetched and cached.
    assert_eq!(fetcher.fetch_count(), 3);
    assert!(packager
        .cache
        .get(&Url::parse("https://example.org/style.css")?)
        .is_some());
    assert!(packager
        .cache
        .get(&Url::parse("https://example.org/script.js")?)
        .is_some());

    Ok(())
}

#[tokio::test]
async fn sibling_preload_failures_do_not_fail_the_root() -> anyhow::Result<()> {
    let html = r#"<!doctype html><link rel="stylesheet" href="missing.css">"#;
    let fetcher = Arc::new(
        StubFetcher::new().route("https://example.org/hello.html", CannedResponse::html(html)),
    );
    let packager = test_packager(fetcher)?;

    let url = Url::parse("https://example.org/hello.html")?;
    let (artifact, errors) = packager.run_for_url(url.clone(), Utc::now()).await;

    assert!(artifact.is_some(), "root must succeed");
    // The sibling error exists, but filtering by the root target drops it.
    assert!(!errors.is_empty());
    assert!(errors.filter(&url).is_empty());

    Ok(())
}

#[tokio::test]
async fn concurrent_requests_share_one_build() -> anyhow::Result<()> {
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/hello.html",
        CannedResponse::html("<!doctype html><p>Hello, world!</p>"),
    ));
    let packager = Arc::new(test_packager(fetcher.clone())?);

    let url = Url::parse("https://example.org/hello.html")?;
    let now = Utc::now();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let packager = packager.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            packager.run_for_url(url, now).await
        }));
    }

    for task in tasks {
        let (artifact, errors) = task.await?;
        assert!(errors.is_empty());
        assert!(artifact.is_some());
    }
    assert_eq!(fetcher.fetch_count(), 1);

    Ok(())
}

#[tokio::test]
async fn self_referencing_preloads_do_not_loop() -> anyhow::Result<()> {
    // A page that preloads itself as a script; the cycle is skipped.
    let html = r#"<!doctype html><link rel="preload" href="hello.html" as="script">"#;
    let fetcher = Arc::new(
        StubFetcher::new().route("https://example.org/hello.html", CannedResponse::html(html)),
    );
    let packager = test_packager(fetcher.clone())?;

    let url = Url::parse("https://example.org/hello.html")?;
    let (artifact, _errors) = packager.run_for_url(url, Utc::now()).await;

    assert!(artifact.is_some());
    assert_eq!(fetcher.fetch_count(), 1);

    Ok(())
}

#[tokio::test]
async fn slash_ended_urls_get_the_index_file() -> anyhow::Result<()> {
    let fetcher = Arc::new(StubFetcher::new().route(
        "https://example.org/dir/index.html",
        CannedResponse::html("<!doctype html><p>indexed</p>"),
    ));
    let packager = test_packager(fetcher)?;

    let (artifact, errors) = packager
        .run_for_url(Url::parse("https://example.org/dir/")?, Utc::now())
        .await;

    assert!(errors.is_empty(), "unexpected errors: {errors}");
    let artifact = artifact.expect("root artifact should exist");
    assert_eq!(
        artifact.physical_url.as_str(),
        "https://example.org/dir/index.html"
    );

    Ok(())
}
