// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Valid periods and validity URLs for signed exchanges.
//!
//! The format caps a signature lifetime at 168 hours; JavaScript resources
//! are held to a tighter 24 hour cap unless the insecure override is set.
//! Those caps are enforced when the configuration is loaded, so the rules
//! here apply whatever lifetime they were built with.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use url::Url;

use crate::resource::Response;

/// The media types treated as JavaScript by the default valid-period rule.
pub const JAVASCRIPT_MEDIA_TYPES: [&str; 3] = [
    "application/javascript",
    "text/javascript",
    "application/x-javascript",
];

/// The window during which a signed exchange is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidPeriod {
    date: DateTime<Utc>,
    expires: DateTime<Utc>,
}

impl ValidPeriod {
    /// Build a period starting at `date` and lasting `lifetime`.
    pub fn with_lifetime(date: DateTime<Utc>, lifetime: Duration) -> Self {
        let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::zero());
        ValidPeriod {
            date,
            expires: date + lifetime,
        }
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn expires(&self) -> DateTime<Utc> {
        self.expires
    }

    pub fn lifetime(&self) -> Duration {
        (self.expires - self.date).to_std().unwrap_or_default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.date <= at && at <= self.expires
    }
}

/// Computes the valid period for a response.
#[derive(Debug, Clone)]
pub enum ValidPeriodRule {
    /// Every response gets the same lifetime.
    FixedLifetime(Duration),
    /// Dispatch on the response media type, falling back to a default rule.
    ///
    /// Sub-content-types recorded by processors (an HTML document with
    /// inline scripts records a JavaScript sub-content-type) participate in
    /// the dispatch, taking the shortest matching lifetime.
    PerContentType {
        rules: HashMap<String, Box<ValidPeriodRule>>,
        default: Box<ValidPeriodRule>,
    },
}

impl ValidPeriodRule {
    /// The standard rule: JavaScript media types use `js_lifetime`, all
    /// others use `lifetime`.
    pub fn standard(lifetime: Duration, js_lifetime: Duration) -> Self {
        let mut rules: HashMap<String, Box<ValidPeriodRule>> = HashMap::new();
        for media_type in JAVASCRIPT_MEDIA_TYPES {
            rules.insert(
                media_type.to_string(),
                Box::new(ValidPeriodRule::FixedLifetime(js_lifetime)),
            );
        }
        ValidPeriodRule::PerContentType {
            rules,
            default: Box::new(ValidPeriodRule::FixedLifetime(lifetime)),
        }
    }

    pub fn apply(&self, resp: &Response, now: DateTime<Utc>) -> ValidPeriod {
        match self {
            ValidPeriodRule::FixedLifetime(lifetime) => ValidPeriod::with_lifetime(now, *lifetime),
            ValidPeriodRule::PerContentType { rules, default } => {
                let mut candidates = Vec::new();
                if let Some(media_type) = resp.media_type() {
                    if let Some(rule) = rules.get(&media_type) {
                        candidates.push(rule.apply(resp, now));
                    }
                }
                for sub in &resp.sub_content_types {
                    if let Some(rule) = rules.get(sub) {
                        candidates.push(rule.apply(resp, now));
                    }
                }
                candidates
                    .into_iter()
                    .min_by_key(|vp| vp.expires())
                    .unwrap_or_else(|| default.apply(resp, now))
            }
        }
    }
}

/// Derives the validity URL for an exchange.
///
/// Both flavors strip the query component and append `ext` plus a dot and a
/// UNIX timestamp to the physical URL path.
#[derive(Debug, Clone)]
pub enum ValidityUrlRule {
    /// Timestamp from the response's `Last-Modified` header, falling back
    /// to the exchange date when the header is absent or unparseable.
    AppendExtDotLastModified(String),
    /// Timestamp from the exchange date.
    AppendExtDotExchangeDate(String),
}

impl ValidityUrlRule {
    pub fn apply(&self, physical_url: &Url, resp: &Response, vp: &ValidPeriod) -> Url {
        let (ext, timestamp) = match self {
            ValidityUrlRule::AppendExtDotLastModified(ext) => {
                let timestamp = resp
                    .headers
                    .get("Last-Modified")
                    .and_then(parse_http_date)
                    .unwrap_or_else(|| vp.date());
                (ext, timestamp)
            }
            ValidityUrlRule::AppendExtDotExchangeDate(ext) => (ext, vp.date()),
        };

        let mut url = physical_url.clone();
        url.set_query(None);
        url.set_fragment(None);
        let path = format!("{}{}.{}", url.path(), ext, timestamp.timestamp());
        url.set_path(&path);
        url
    }
}

/// Parse an HTTP date (IMF-fixdate, e.g. `Mon, 01 Jul 2019 12:34:56 GMT`).
fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
