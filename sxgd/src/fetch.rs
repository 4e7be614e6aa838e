// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Fetching upstream resources.
//!
//! The pipeline only depends on the [`Fetcher`] capability; the default
//! implementation rides on reqwest. Request tweakers adjust outgoing
//! requests before the fetch, composing in order.

use std::future::Future;
use std::pin::Pin;

use crate::exchange::Version;
use crate::resource::{FetchRequest, Headers, Response};

/// User agent advertised by the default fetcher.
pub const USER_AGENT: &str = concat!("sxgd/", env!("CARGO_PKG_VERSION"));

/// Obtains a fully materialized upstream response for a request.
pub trait Fetcher: Send + Sync {
    fn fetch(
        &self,
        req: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Response>> + Send + '_>>;
}

/// A composable rewriter applied to requests before fetching.
#[derive(Debug, Clone)]
pub enum RequestTweaker {
    /// Add the standard signing headers: an `Accept` header advertising the
    /// exchange version and `AMP-Cache-Transform: any`.
    Default(Version),
    /// Add the given headers verbatim.
    SetHeaders(Vec<(String, String)>),
    /// Apply each tweaker in order.
    Sequence(Vec<RequestTweaker>),
}

impl RequestTweaker {
    pub fn tweak(&self, req: &mut FetchRequest) {
        match self {
            RequestTweaker::Default(version) => {
                req.headers.set("Accept", version.accept_value());
                req.headers.set("AMP-Cache-Transform", "any");
            }
            RequestTweaker::SetHeaders(headers) => {
                for (name, value) in headers {
                    req.headers.add(name.clone(), value.clone());
                }
            }
            RequestTweaker::Sequence(tweakers) => {
                for tweaker in tweakers {
                    tweaker.tweak(req);
                }
            }
        }
    }
}

/// The default fetcher, backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        req: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Response>> + Send + '_>> {
        Box::pin(async move {
            let mut builder = self.client.get(req.url.as_str());
            for (name, value) in req.headers.iter() {
                builder = builder.header(name, value);
            }

            let upstream = builder.send().await?;
            let status = upstream.status().as_u16();
            let effective_url = url::Url::parse(upstream.url().as_str())?;

            let mut headers = Headers::new();
            for (name, value) in upstream.headers() {
                if let Ok(value) = value.to_str() {
                    headers.add(name.as_str(), value);
                }
            }

            let payload = upstream.bytes().await?;
            // The payload is fully materialized, so a stale Content-Length
            // from upstream must not survive into the signed headers.
            if headers.contains("Content-Length") {
                headers.set("Content-Length", payload.len().to_string());
            }

            let mut request = req;
            request.url = effective_url;
            Ok(Response::new(request, status, headers, payload))
        })
    }
}
