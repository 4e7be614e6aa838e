// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The packager pipeline.
//!
//! For a root URL: tweak the request, canonicalize to the physical URL,
//! consult the cache under single-flight, fetch, process, compute the
//! valid period and validity URL, sign, store, then walk the discovered
//! preloads the same way. Preload failures never abort the root; they are
//! accumulated and filtered at the handler boundary.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::instrument;
use url::Url;

use crate::cache::{Artifact, Claim, Lease, ResourceCache};
use crate::error::{ErrorList, PackageError, PackageErrorKind, ProcessError};
use crate::exchange::FactoryProvider;
use crate::fetch::{Fetcher, RequestTweaker};
use crate::processor::Processor;
use crate::resource::{FetchRequest, Preload};
use crate::rewrite::UrlRule;
use crate::validity::{ValidPeriodRule, ValidityUrlRule};

pub struct Packager {
    pub request_tweaker: RequestTweaker,
    pub physical_url_rule: UrlRule,
    pub validity_url_rule: ValidityUrlRule,
    pub valid_period_rule: ValidPeriodRule,
    pub processor: Arc<dyn Processor>,
    pub factory: Arc<dyn FactoryProvider>,
    pub cache: Arc<ResourceCache>,
    pub fetcher: Arc<dyn Fetcher>,
    pub fetch_timeout: Duration,
    /// How many preload hops below the root are followed.
    pub max_preload_depth: usize,
    /// Fan-out bound: preloads beyond this count per resource are dropped.
    pub max_preloads_per_resource: usize,
    /// Whether non-signed preloads survive into exchange headers.
    pub keep_non_sxg_preloads: bool,
}

impl Packager {
    /// Package `url` and its signed preloads. Returns the root artifact
    /// (when the root itself succeeded) plus every accumulated error, each
    /// wrapped with the URL it belongs to.
    pub async fn run_for_url(
        &self,
        url: Url,
        now: DateTime<Utc>,
    ) -> (Option<Arc<Artifact>>, ErrorList) {
        self.run_for_request(FetchRequest::get(url), now).await
    }

    /// Like [`Packager::run_for_url`], starting from a prepared request.
    #[instrument(skip_all, fields(url = %req.url))]
    pub async fn run_for_request(
        &self,
        req: FetchRequest,
        now: DateTime<Utc>,
    ) -> (Option<Arc<Artifact>>, ErrorList) {
        let mut errors = ErrorList::default();
        let mut root_artifact = None;

        // Work queue of (request, depth). The in-flight set tracks URLs
        // whose single-flight lease this run currently holds or has held;
        // hitting one again is a cycle and is skipped rather than awaited.
        let mut queue: VecDeque<(FetchRequest, usize)> = VecDeque::new();
        let mut visited: HashSet<Url> = HashSet::new();
        queue.push_back((req, 0));

        let mut is_root = true;
        while let Some((mut req, depth)) = queue.pop_front() {
            self.request_tweaker.tweak(&mut req);
            let phys_url = self.physical_url_rule.apply(&req.url);
            req.url = phys_url.clone();

            if !visited.insert(phys_url.clone()) {
                tracing::debug!(url = %phys_url, "Skipping preload already in this run");
                is_root = false;
                continue;
            }

            let result = match self.cache.claim(&phys_url) {
                Claim::Ready(artifact) => Ok(artifact),
                Claim::Wait(rx) => ResourceCache::wait(rx).await,
                Claim::Build(lease) => {
                    let (result, children) = self.build(req, lease, now).await;
                    for preload in children {
                        if depth + 1 > self.max_preload_depth {
                            tracing::debug!(url = %preload.url, "Preload depth bound reached");
                            continue;
                        }
                        queue.push_back((FetchRequest::get(preload.url), depth + 1));
                    }
                    result
                }
            };

            match result {
                Ok(artifact) => {
                    if is_root {
                        root_artifact = Some(artifact);
                    }
                }
                Err(shared) => {
                    for error in &shared.0 {
                        tracing::warn!(url = %error.url, kind = %error.kind, "Packaging failed");
                    }
                    errors.extend(&shared);
                }
            }
            is_root = false;
        }

        (root_artifact, errors)
    }

    /// Build one resource under an owned lease, returning the published
    /// result and the preloads to process next.
    async fn build(
        &self,
        req: FetchRequest,
        lease: Lease,
        now: DateTime<Utc>,
    ) -> (Result<Arc<Artifact>, Arc<ErrorList>>, Vec<Preload>) {
        let phys_url = lease.url().clone();
        match self.build_inner(req, &phys_url, now).await {
            Ok((artifact, children)) => {
                let result = self.cache.finish_build(lease, Ok(Arc::new(artifact))).await;
                (result, children)
            }
            Err(kind) => {
                let error = Arc::new(ErrorList::single(PackageError::new(phys_url, kind)));
                let result = self.cache.finish_build(lease, Err(error)).await;
                (result, Vec::new())
            }
        }
    }

    async fn build_inner(
        &self,
        req: FetchRequest,
        phys_url: &Url,
        now: DateTime<Utc>,
    ) -> Result<(Artifact, Vec<Preload>), PackageErrorKind> {
        let mut resp = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(req)).await
        {
            Ok(Ok(resp)) => resp,
            Ok(Err(error)) => return Err(PackageErrorKind::Fetch(error.to_string())),
            Err(_) => return Err(PackageErrorKind::FetchTimeout(self.fetch_timeout)),
        };

        if &resp.request.url != phys_url {
            return Err(PackageErrorKind::UrlMismatch {
                requested: phys_url.to_string(),
                fetched: resp.request.url.to_string(),
            });
        }

        resp.keep_non_sxg_preloads = self.keep_non_sxg_preloads;
        self.processor.process(&mut resp).map_err(|e| match e {
            ProcessError::HttpStatus(code) => PackageErrorKind::HttpStatus(code),
            other => PackageErrorKind::Processing(other.to_string()),
        })?;

        if resp.preloads.len() > self.max_preloads_per_resource {
            tracing::debug!(
                url = %phys_url,
                dropped = resp.preloads.len() - self.max_preloads_per_resource,
                "Preload fan-out bound reached"
            );
            resp.preloads.truncate(self.max_preloads_per_resource);
        }

        let vp = self.valid_period_rule.apply(&resp, now);
        let validity_url = self.validity_url_rule.apply(phys_url, &resp, &vp);

        let factory = self
            .factory
            .get()
            .map_err(|e| PackageErrorKind::Signing(e.to_string()))?;
        let exchange = factory
            .new_exchange(&resp, vp, validity_url)
            .map_err(|e| PackageErrorKind::Signing(e.to_string()))?;
        let serialized = exchange
            .to_bytes()
            .map_err(|e| PackageErrorKind::Signing(e.to_string()))?;

        let children = resp
            .preloads
            .iter()
            .filter(|p| p.needs_signing)
            .cloned()
            .collect();

        let artifact = Artifact {
            physical_url: phys_url.clone(),
            exchange,
            serialized,
            file_path: None,
        };
        Ok((artifact, children))
    }
}
