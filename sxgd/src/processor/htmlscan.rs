// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A tolerant HTML tag scanner.
//!
//! HTML tasks only need the start tags and their attributes, plus whether
//! any `<script>` element carries inline code. The scanner parses the
//! document once into that view; it skips comments, doctype declarations,
//! and raw text content of `script` and `style` elements, and it never
//! fails on malformed markup.

/// A start tag with its attributes, names lowercased.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<(String, Option<String>)>,
}

impl Element {
    /// The decoded value of an attribute, if present with a value.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|(k, _)| k == name)
    }
}

/// The parsed view shared by all HTML tasks for one response.
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub elements: Vec<Element>,
    /// True when any `<script>` element without a `src` attribute contains
    /// non-whitespace content.
    pub has_inline_script: bool,
}

impl Document {
    pub fn elements_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.elements.iter().filter(move |e| e.name == name)
    }

    /// The value of the first `<base href>` element, if any.
    pub fn base_href(&self) -> Option<&str> {
        self.elements_named("base").find_map(|e| e.attr("href"))
    }
}

/// Scan an HTML document into its start-tag view.
pub fn scan(html: &str) -> Document {
    let bytes = html.as_bytes();
    let mut doc = Document::default();
    let mut pos = 0;

    while let Some(open) = find_byte(bytes, b'<', pos) {
        pos = open + 1;
        if bytes[pos..].starts_with(b"!--") {
            // Comment: skip to "-->" or end of input.
            pos = find_subslice(bytes, b"-->", pos + 3).map_or(bytes.len(), |i| i + 3);
            continue;
        }
        if bytes.get(pos) == Some(&b'!') || bytes.get(pos) == Some(&b'?') {
            // Doctype or processing instruction.
            pos = find_byte(bytes, b'>', pos).map_or(bytes.len(), |i| i + 1);
            continue;
        }
        if bytes.get(pos) == Some(&b'/') {
            // Closing tag.
            pos = find_byte(bytes, b'>', pos).map_or(bytes.len(), |i| i + 1);
            continue;
        }
        let Some((element, after)) = parse_tag(html, pos) else {
            continue;
        };
        pos = after;

        match element.name.as_str() {
            "script" => {
                let (content, after) = raw_text(html, pos, "</script");
                if !element.has_attr("src") && !content.trim().is_empty() {
                    doc.has_inline_script = true;
                }
                pos = after;
            }
            "style" => {
                let (_, after) = raw_text(html, pos, "</style");
                pos = after;
            }
            _ => {}
        }
        doc.elements.push(element);
    }

    doc
}

fn find_byte(bytes: &[u8], needle: u8, from: usize) -> Option<usize> {
    bytes[from.min(bytes.len())..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
}

fn find_subslice(bytes: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    let start = from.min(bytes.len());
    bytes[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| start + i)
}

/// Parse a start tag beginning right after `<`. Returns the element and the
/// position right after the closing `>`.
fn parse_tag(html: &str, start: usize) -> Option<(Element, usize)> {
    let bytes = html.as_bytes();
    let mut pos = start;

    let name_start = pos;
    while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'-') {
        pos += 1;
    }
    if pos == name_start {
        return None;
    }
    let name = html[name_start..pos].to_ascii_lowercase();

    let mut attrs = Vec::new();
    loop {
        while pos < bytes.len() && (bytes[pos].is_ascii_whitespace() || bytes[pos] == b'/') {
            pos += 1;
        }
        if pos >= bytes.len() {
            return Some((Element { name, attrs }, pos));
        }
        if bytes[pos] == b'>' {
            return Some((Element { name, attrs }, pos + 1));
        }

        let attr_start = pos;
        while pos < bytes.len() && !matches!(bytes[pos], b'=' | b'>' | b'/') && !bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos == attr_start {
            pos += 1;
            continue;
        }
        let attr_name = html[attr_start..pos].to_ascii_lowercase();

        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        let value = if bytes.get(pos) == Some(&b'=') {
            pos += 1;
            while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            match bytes.get(pos) {
                Some(&quote @ (b'"' | b'\'')) => {
                    pos += 1;
                    let value_start = pos;
                    pos = find_byte(bytes, quote, pos).unwrap_or(bytes.len());
                    let raw = &html[value_start..pos.min(html.len())];
                    pos = (pos + 1).min(bytes.len());
                    Some(decode_entities(raw))
                }
                _ => {
                    let value_start = pos;
                    while pos < bytes.len() && !matches!(bytes[pos], b'>') && !bytes[pos].is_ascii_whitespace() {
                        pos += 1;
                    }
                    Some(decode_entities(&html[value_start..pos]))
                }
            }
        } else {
            None
        };
        attrs.push((attr_name, value));
    }
}

/// Collect raw text content up to the given case-insensitive end tag.
fn raw_text<'a>(html: &'a str, start: usize, end_tag: &str) -> (&'a str, usize) {
    let lower = html[start.min(html.len())..].to_ascii_lowercase();
    match lower.find(end_tag) {
        Some(offset) => {
            let content_end = start + offset;
            let after = find_byte(html.as_bytes(), b'>', content_end).map_or(html.len(), |i| i + 1);
            (&html[start..content_end], after)
        }
        None => (&html[start.min(html.len())..], html.len()),
    }
}

/// Decode the few character references that matter in attribute URLs.
fn decode_entities(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_tags_and_attributes() {
        let doc = scan(
            r#"<!doctype html><link rel="preload" href="icons.svg" as="image"><p>Hi</p>"#,
        );
        let link = doc.elements_named("link").next().unwrap();
        assert_eq!(link.attr("rel"), Some("preload"));
        assert_eq!(link.attr("href"), Some("icons.svg"));
        assert_eq!(link.attr("as"), Some("image"));
    }

    #[test]
    fn unquoted_and_single_quoted_values() {
        let doc = scan(r#"<script src=script.js></script><link rel='stylesheet' href='a.css'>"#);
        assert_eq!(
            doc.elements_named("script").next().unwrap().attr("src"),
            Some("script.js")
        );
        assert_eq!(
            doc.elements_named("link").next().unwrap().attr("href"),
            Some("a.css")
        );
    }

    #[test]
    fn detects_inline_scripts() {
        assert!(scan("<script>var x = 1;</script>").has_inline_script);
        assert!(!scan(r#"<script src="app.js"></script>"#).has_inline_script);
        assert!(!scan("<script>   </script>").has_inline_script);
        assert!(!scan("<p>no scripts here</p>").has_inline_script);
    }

    #[test]
    fn ignores_comments_and_script_content(){
        let doc = scan("<!-- <link rel=\"preload\" href=\"x\"> --><script>if (a < b) { document.write('<link href=y>'); }</script>");
        assert_eq!(doc.elements_named("link").count(), 0);
        assert!(doc.has_inline_script);
    }

    #[test]
    fn decodes_ampersands_in_urls() {
        let doc = scan(r#"<link rel="preload" href="/p?a=1&amp;b=2" as="style">"#);
        assert_eq!(
            doc.elements_named("link").next().unwrap().attr("href"),
            Some("/p?a=1&b=2")
        );
    }

    #[test]
    fn base_href_is_first_wins() {
        let doc = scan(r#"<base href="https://cdn.example.com/"><base href="https://other/">"#);
        assert_eq!(doc.base_href(), Some("https://cdn.example.com/"));
    }
}
