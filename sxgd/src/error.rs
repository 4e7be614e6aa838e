// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the packager pipeline and the serving handler.

use std::time::Duration;

use url::Url;

/// Errors raised by processors while preparing a response for signing.
///
/// Any processor failure is terminal for the resource being processed;
/// the pipeline reports the first failure and runs nothing further.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// The upstream status code is not in the configured allow-set.
    ///
    /// The serving handler re-emits this status to the client rather than
    /// treating it as a server error.
    #[error("response status {0} is not eligible for a signed exchange")]
    HttpStatus(u16),

    /// The payload exceeds the configured size limit.
    #[error("content is {size} bytes which exceeds the {limit} byte limit")]
    ContentTooLarge { size: usize, limit: usize },

    /// The response lacks a header required for signing.
    #[error("response is missing the {0} header")]
    MissingHeader(String),

    /// An HTML task rejected the document.
    #[error("html processing failed: {0}")]
    Html(String),
}

/// The classified failure modes of the packager pipeline.
///
/// Every error is wrapped with the URL being processed (see
/// [`PackageError`]); the handler decides client-visible behavior from the
/// kind alone.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum PackageErrorKind {
    /// The request itself was malformed; reported to the client as 400.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// An upstream status excluded by the preverify filter. The handler
    /// passes the status through to the client.
    #[error("upstream responded with status {0}")]
    HttpStatus(u16),

    /// The effective response URL differs from the requested physical URL.
    /// Reported as a silent 400.
    #[error("upstream resolved to {fetched} instead of {requested}")]
    UrlMismatch { requested: String, fetched: String },

    /// The upstream fetch did not complete within its deadline.
    #[error("fetch did not complete within {0:?}")]
    FetchTimeout(Duration),

    /// The upstream fetch failed outright; reported as 502.
    #[error("failed to fetch resource: {0}")]
    Fetch(String),

    /// A processor rejected the response; reported as 502.
    #[error("failed to process resource: {0}")]
    Processing(String),

    /// Exchange construction or signing failed; reported as 500.
    #[error("failed to sign exchange: {0}")]
    Signing(String),

    /// The single-flight build was abandoned or failed internally;
    /// reported as 500.
    #[error("cached build failed: {0}")]
    CacheBuild(String),
}

/// A pipeline failure wrapped with the URL that was being processed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{url}: {kind}")]
pub struct PackageError {
    pub url: Url,
    pub kind: PackageErrorKind,
}

impl PackageError {
    pub fn new(url: Url, kind: PackageErrorKind) -> Self {
        PackageError { url, kind }
    }
}

/// A flat list of wrapped pipeline errors.
///
/// Preload recursion can fail independently for each subresource, so the
/// pipeline accumulates failures rather than aborting on the first one. The
/// handler filters the list down to the entries for the URL the client
/// actually asked for; sibling failures stay in telemetry only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorList(pub Vec<PackageError>);

impl std::error::Error for ErrorList {}

impl ErrorList {
    pub fn single(err: PackageError) -> Self {
        ErrorList(vec![err])
    }

    pub fn push(&mut self, err: PackageError) {
        self.0.push(err);
    }

    pub fn extend(&mut self, other: &ErrorList) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Keep only the errors wrapped with `target`, collapsing the list in a
    /// single pass. Errors belonging to sibling preloads are dropped from
    /// the handler's perspective.
    pub fn filter(&self, target: &Url) -> Vec<&PackageError> {
        self.0.iter().filter(|e| &e.url == target).collect()
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return write!(f, "no errors");
        }
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

/// Errors from the certificate manager's chain caches.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChainError {
    /// No chain is stored under the requested digest.
    #[error("no certificate chain found")]
    NotFound,

    /// The cache backend failed; likely a filesystem problem.
    #[error("certificate cache error: {0}")]
    Cache(#[from] std::io::Error),

    /// A stored chain could not be decoded.
    #[error("stored certificate chain is invalid: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(url: &str, kind: PackageErrorKind) -> PackageError {
        PackageError::new(Url::parse(url).unwrap(), kind)
    }

    #[test]
    fn filter_keeps_only_target_errors() {
        let target = Url::parse("https://example.org/hello.html").unwrap();
        let mut list = ErrorList::default();
        list.push(err(
            "https://example.org/style.css",
            PackageErrorKind::HttpStatus(404),
        ));
        list.push(err(
            "https://example.org/hello.html",
            PackageErrorKind::HttpStatus(204),
        ));
        list.push(err(
            "https://example.org/script.js",
            PackageErrorKind::Fetch("connection refused".to_string()),
        ));

        let kept = list.filter(&target);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].kind, PackageErrorKind::HttpStatus(204));
    }

    #[test]
    fn filter_on_unrelated_target_is_empty() {
        let target = Url::parse("https://example.org/other.html").unwrap();
        let list = ErrorList::single(err(
            "https://example.org/hello.html",
            PackageErrorKind::Signing("bad key".to_string()),
        ));
        assert!(list.filter(&target).is_empty());
    }

    #[test]
    fn display_joins_entries() {
        let mut list = ErrorList::default();
        list.push(err(
            "https://example.org/a",
            PackageErrorKind::HttpStatus(500),
        ));
        list.push(err(
            "https://example.org/b",
            PackageErrorKind::BadRequest("nope".to_string()),
        ));
        let text = list.to_string();
        assert!(text.contains("https://example.org/a"));
        assert!(text.contains("; "));
    }
}
