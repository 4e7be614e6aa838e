// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Captured upstream responses and the preloads discovered in them.

use bytes::Bytes;
use url::Url;

/// An ordered, case-insensitive multimap of HTTP headers.
///
/// Header names keep their insertion spelling; lookups ignore case. The
/// canonical CBOR encoding lowercases names itself, so nothing here depends
/// on normalization at insert time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Headers(Vec::new())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Headers(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// The first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replace all values of `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.0.push((name.to_string(), value.into()));
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The request side of a captured exchange. Always `GET` for SXG.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    pub headers: Headers,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        FetchRequest {
            url,
            method: "GET".to_string(),
            headers: Headers::new(),
        }
    }
}

/// The `as` destination of a preload link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PreloadAs {
    Style,
    Script,
    Image,
    Font,
    Other,
}

impl PreloadAs {
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "style" => PreloadAs::Style,
            "script" => PreloadAs::Script,
            "image" => PreloadAs::Image,
            "font" => PreloadAs::Font,
            _ => PreloadAs::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PreloadAs::Style => "style",
            PreloadAs::Script => "script",
            PreloadAs::Image => "image",
            PreloadAs::Font => "font",
            PreloadAs::Other => "fetch",
        }
    }
}

/// A structured `Link: rel=preload` element discovered by a processor.
#[derive(Debug, Clone, PartialEq)]
pub struct Preload {
    pub url: Url,
    pub as_type: PreloadAs,
    pub crossorigin: Option<String>,
    pub media: Option<String>,
    /// Whether the preload target should itself be packaged as a signed
    /// subresource by the pipeline.
    pub needs_signing: bool,
}

impl Preload {
    pub fn new(url: Url, as_type: PreloadAs) -> Self {
        Preload {
            url,
            as_type,
            crossorigin: None,
            media: None,
            needs_signing: true,
        }
    }

    /// Render this preload as a `Link` header value element.
    pub fn header_value(&self) -> String {
        let mut value = format!("<{}>;rel=\"preload\";as=\"{}\"", self.url, self.as_type.as_str());
        if let Some(crossorigin) = &self.crossorigin {
            value.push_str(&format!(";crossorigin=\"{crossorigin}\""));
        }
        if let Some(media) = &self.media {
            value.push_str(&format!(";media=\"{media}\""));
        }
        value
    }
}

/// A fully materialized upstream HTTP response.
///
/// Created by the fetcher, mutated in place by processors, then consumed by
/// the exchange factory.
#[derive(Debug, Clone)]
pub struct Response {
    pub request: FetchRequest,
    pub status: u16,
    pub headers: Headers,
    pub payload: Bytes,
    /// Preloads accumulated by processors, in discovery order.
    pub preloads: Vec<Preload>,
    /// Media types detected inside the payload (e.g. inline scripts in an
    /// HTML document) that influence the valid-period rule.
    pub sub_content_types: Vec<String>,
    /// Whether `Link: rel=preload` entries that are not packaged as signed
    /// subresources still survive into the exchange headers.
    pub keep_non_sxg_preloads: bool,
}

impl Response {
    pub fn new(request: FetchRequest, status: u16, headers: Headers, payload: Bytes) -> Self {
        Response {
            request,
            status,
            headers,
            payload,
            preloads: Vec::new(),
            sub_content_types: Vec::new(),
            keep_non_sxg_preloads: false,
        }
    }

    /// The media type portion of the `Content-Type` header, lowercased.
    pub fn media_type(&self) -> Option<String> {
        self.headers
            .get("Content-Type")
            .map(|v| v.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
    }

    /// The response headers to sign: the stored headers plus one `Link`
    /// element per surviving preload.
    pub fn signed_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        let links = self
            .preloads
            .iter()
            .filter(|p| p.needs_signing || self.keep_non_sxg_preloads)
            .map(Preload::header_value)
            .collect::<Vec<_>>();
        if !links.is_empty() {
            headers.add("Link", links.join(","));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_with(headers: Headers) -> Response {
        Response::new(
            FetchRequest::get(Url::parse("https://example.com/test.html").unwrap()),
            200,
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        headers.set("CONTENT-TYPE", "text/plain");
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn media_type_strips_parameters() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "Text/HTML; charset=utf-8");
        let resp = response_with(headers);
        assert_eq!(resp.media_type().as_deref(), Some("text/html"));
    }

    #[test]
    fn signed_headers_render_preload_links() {
        let mut resp = response_with(Headers::new());
        resp.preloads.push(Preload::new(
            Url::parse("https://example.com/style.css").unwrap(),
            PreloadAs::Style,
        ));
        let mut unsigned = Preload::new(
            Url::parse("https://example.com/font.woff2").unwrap(),
            PreloadAs::Font,
        );
        unsigned.needs_signing = false;
        resp.preloads.push(unsigned);

        let headers = resp.signed_headers();
        let link = headers.get("Link").unwrap();
        assert_eq!(
            link,
            "<https://example.com/style.css>;rel=\"preload\";as=\"style\""
        );

        resp.keep_non_sxg_preloads = true;
        let link = resp.signed_headers().get("Link").unwrap().to_string();
        assert!(link.contains("font.woff2"));
    }
}
