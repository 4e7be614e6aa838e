// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Preverification processors.
//!
//! These run before any content processing and reject responses that must
//! not become signed exchanges at all.

use std::collections::HashSet;

use crate::error::ProcessError;
use crate::resource::Response;

use super::Processor;

/// Rejects responses whose status code is outside the allow-set.
pub struct HttpStatusCode {
    allowed: HashSet<u16>,
}

impl HttpStatusCode {
    pub fn new(allowed: impl IntoIterator<Item = u16>) -> Self {
        HttpStatusCode {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl Default for HttpStatusCode {
    fn default() -> Self {
        HttpStatusCode::new([200])
    }
}

impl Processor for HttpStatusCode {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError> {
        if self.allowed.contains(&resp.status) {
            Ok(())
        } else {
            Err(ProcessError::HttpStatus(resp.status))
        }
    }
}

/// Rejects payloads larger than the configured limit. `None` disables the
/// check.
pub struct MaxContentLength {
    limit: Option<usize>,
}

impl MaxContentLength {
    pub fn new(limit: Option<usize>) -> Self {
        MaxContentLength { limit }
    }
}

impl Processor for MaxContentLength {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError> {
        match self.limit {
            Some(limit) if resp.payload.len() > limit => Err(ProcessError::ContentTooLarge {
                size: resp.payload.len(),
                limit,
            }),
            _ => Ok(()),
        }
    }
}

/// Rejects responses lacking headers required for signing.
pub struct RequireHeaders {
    names: Vec<String>,
}

impl RequireHeaders {
    pub fn new(names: Vec<String>) -> Self {
        RequireHeaders { names }
    }
}

impl Processor for RequireHeaders {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError> {
        for name in &self.names {
            if !resp.headers.contains(name) {
                return Err(ProcessError::MissingHeader(name.clone()));
            }
        }
        Ok(())
    }
}

// Stateful and hop-by-hop headers must never appear in signed headers; a
// distributor would otherwise replay per-connection or per-user state.
const SCRUBBED_HEADERS: [&str; 15] = [
    "Authorization",
    "Connection",
    "Cookie",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Proxy-Connection",
    "Public-Key-Pins",
    "Set-Cookie",
    "Strict-Transport-Security",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
    "WWW-Authenticate",
];

/// Removes stateful and hop-by-hop headers before signing.
#[derive(Default)]
pub struct ScrubHeaders;

impl Processor for ScrubHeaders {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError> {
        for name in SCRUBBED_HEADERS {
            resp.headers.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use url::Url;

    use super::*;
    use crate::resource::{FetchRequest, Headers};

    fn response(status: u16, payload: &str) -> Response {
        let mut headers = Headers::new();
        headers.add("Cache-Control", "public, max-age=1209600");
        headers.add("Content-Type", "text/html; charset=utf-8");
        Response::new(
            FetchRequest::get(Url::parse("https://example.org/hello.html").unwrap()),
            status,
            headers,
            Bytes::from(payload.as_bytes().to_vec()),
        )
    }

    #[test]
    fn status_filter_accepts_allowed_codes() {
        let proc = HttpStatusCode::new([200, 204]);
        assert!(proc
            .process(&mut response(200, "<!doctype html><p>Hello, world!</p>"))
            .is_ok());
        assert!(proc.process(&mut response(204, "")).is_ok());
    }

    #[test]
    fn status_filter_rejects_excluded_codes() {
        let proc = HttpStatusCode::new([200]);
        let err = proc.process(&mut response(204, "")).unwrap_err();
        assert_eq!(err, ProcessError::HttpStatus(204));

        let proc = HttpStatusCode::new([200, 204]);
        let err = proc
            .process(&mut response(404, "<!doctype html><p>404 Not Found</p>"))
            .unwrap_err();
        assert_eq!(err, ProcessError::HttpStatus(404));
    }

    #[test]
    fn content_length_cap_enforced_only_when_set() {
        let mut resp = response(200, "0123456789");
        assert!(MaxContentLength::new(None).process(&mut resp).is_ok());
        assert!(MaxContentLength::new(Some(10)).process(&mut resp).is_ok());
        let err = MaxContentLength::new(Some(9)).process(&mut resp).unwrap_err();
        assert_eq!(
            err,
            ProcessError::ContentTooLarge {
                size: 10,
                limit: 9
            }
        );
    }

    #[test]
    fn missing_content_type_is_rejected() {
        let proc = RequireHeaders::new(vec!["Content-Type".to_string()]);
        let mut resp = response(200, "body");
        resp.headers.remove("Content-Type");
        let err = proc.process(&mut resp).unwrap_err();
        assert_eq!(err, ProcessError::MissingHeader("Content-Type".to_string()));
    }

    #[test]
    fn stateful_headers_are_scrubbed() {
        let mut resp = response(200, "body");
        resp.headers.add("Set-Cookie", "session=1");
        resp.headers.add("Connection", "keep-alive");
        ScrubHeaders.process(&mut resp).unwrap();
        assert!(!resp.headers.contains("Set-Cookie"));
        assert!(!resp.headers.contains("Connection"));
        assert!(resp.headers.contains("Cache-Control"));
    }
}
