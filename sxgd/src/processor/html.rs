// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! HTML processing tasks.
//!
//! When a response carries `text/html`, the document is parsed once and a
//! configured sequence of tasks runs against the shared view. Tasks append
//! preloads and record sub-content-types; the first task failure aborts the
//! pipeline for the resource.

use url::Url;

use crate::error::ProcessError;
use crate::resource::{Preload, PreloadAs, Response};

use super::htmlscan::{self, Document};
use super::Processor;

/// A single HTML task run against the shared parsed document.
pub trait HtmlTask: Send + Sync {
    fn run(&self, doc: &Document, resp: &mut Response) -> Result<(), ProcessError>;
}

/// Selects and configures the HTML task set.
#[derive(Debug, Clone)]
pub struct TaskSetConfig {
    /// `false` honors only author-declared preloads; `true` additionally
    /// synthesizes preloads from stylesheet and script references.
    pub aggressive: bool,
    pub preload_css: bool,
    pub preload_js: bool,
}

impl Default for TaskSetConfig {
    fn default() -> Self {
        TaskSetConfig {
            aggressive: true,
            preload_css: true,
            preload_js: false,
        }
    }
}

impl TaskSetConfig {
    pub fn build(&self) -> Vec<Box<dyn HtmlTask>> {
        let mut tasks: Vec<Box<dyn HtmlTask>> = vec![
            Box::new(DetectInlineScripts),
            Box::new(ExtractPreloadTags),
        ];
        if self.aggressive {
            if self.preload_css {
                tasks.push(Box::new(PreloadStylesheets));
            }
            if self.preload_js {
                tasks.push(Box::new(PreloadScripts));
            }
        }
        tasks
    }
}

/// Runs the configured HTML tasks on `text/html` responses.
pub struct HtmlProcessor {
    tasks: Vec<Box<dyn HtmlTask>>,
}

impl HtmlProcessor {
    pub fn new(tasks: Vec<Box<dyn HtmlTask>>) -> Self {
        HtmlProcessor { tasks }
    }
}

impl Processor for HtmlProcessor {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError> {
        if resp.media_type().as_deref() != Some("text/html") {
            return Ok(());
        }
        let html = String::from_utf8_lossy(&resp.payload).into_owned();
        let doc = htmlscan::scan(&html);
        for task in &self.tasks {
            task.run(&doc, resp)?;
        }
        Ok(())
    }
}

/// Records a JavaScript sub-content-type when the document contains inline
/// scripts, so the valid-period rule applies the JS lifetime.
pub struct DetectInlineScripts;

impl HtmlTask for DetectInlineScripts {
    fn run(&self, doc: &Document, resp: &mut Response) -> Result<(), ProcessError> {
        if doc.has_inline_script {
            resp.sub_content_types
                .push("application/javascript".to_string());
        }
        Ok(())
    }
}

/// Honors author-declared `<link rel="preload">` elements.
pub struct ExtractPreloadTags;

impl HtmlTask for ExtractPreloadTags {
    fn run(&self, doc: &Document, resp: &mut Response) -> Result<(), ProcessError> {
        let base = document_base(doc, resp);
        for link in doc.elements_named("link") {
            if !has_rel(link, "preload") {
                continue;
            }
            let Some(href) = link.attr("href") else {
                continue;
            };
            let as_type = link
                .attr("as")
                .map(PreloadAs::from_token)
                .unwrap_or(PreloadAs::Other);
            if let Some(url) = resolve_https(&base, href) {
                let mut preload = Preload::new(url, as_type);
                preload.crossorigin = link.attr("crossorigin").map(str::to_string);
                preload.media = link.attr("media").map(str::to_string);
                resp.preloads.push(preload);
            }
        }
        Ok(())
    }
}

/// Synthesizes preloads for `<link rel="stylesheet">` references.
pub struct PreloadStylesheets;

impl HtmlTask for PreloadStylesheets {
    fn run(&self, doc: &Document, resp: &mut Response) -> Result<(), ProcessError> {
        let base = document_base(doc, resp);
        for link in doc.elements_named("link") {
            if !has_rel(link, "stylesheet") {
                continue;
            }
            let Some(href) = link.attr("href") else {
                continue;
            };
            if let Some(url) = resolve_https(&base, href) {
                let mut preload = Preload::new(url, PreloadAs::Style);
                preload.media = link.attr("media").map(str::to_string);
                resp.preloads.push(preload);
            }
        }
        Ok(())
    }
}

/// Synthesizes preloads for `<script src>` references.
///
/// Preloaded scripts stay cached and runnable until the exchange expires,
/// so this task is only enabled by an explicit configuration toggle.
pub struct PreloadScripts;

impl HtmlTask for PreloadScripts {
    fn run(&self, doc: &Document, resp: &mut Response) -> Result<(), ProcessError> {
        let base = document_base(doc, resp);
        for script in doc.elements_named("script") {
            let Some(src) = script.attr("src") else {
                continue;
            };
            if let Some(url) = resolve_https(&base, src) {
                resp.preloads.push(Preload::new(url, PreloadAs::Script));
            }
        }
        Ok(())
    }
}

fn has_rel(element: &htmlscan::Element, token: &str) -> bool {
    element
        .attr("rel")
        .map(|rel| {
            rel.split_ascii_whitespace()
                .any(|t| t.eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

fn document_base(doc: &Document, resp: &Response) -> Url {
    doc.base_href()
        .and_then(|href| resp.request.url.join(href).ok())
        .unwrap_or_else(|| resp.request.url.clone())
}

/// Resolve a reference against the document base; anything that does not
/// come out as an `https` URL is discarded.
fn resolve_https(base: &Url, reference: &str) -> Option<Url> {
    let url = base.join(reference).ok()?;
    if url.scheme() == "https" { Some(url) } else { None }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::resource::{FetchRequest, Headers};

    fn html_response(url: &str, html: &str) -> Response {
        let mut headers = Headers::new();
        headers.add("Cache-Control", "public, max-age=604800");
        headers.add("Content-Length", html.len().to_string());
        headers.add("Content-Type", "text/html;charset=utf-8");
        Response::new(
            FetchRequest::get(Url::parse(url).unwrap()),
            200,
            headers,
            Bytes::from(html.as_bytes().to_vec()),
        )
    }

    fn preload_urls(resp: &Response) -> Vec<String> {
        resp.preloads.iter().map(|p| p.url.to_string()).collect()
    }

    const SAMPLE: &str = concat!(
        r#"<!doctype html>"#,
        r#"<link rel="preload" href="icons.svg" as="image">"#,
        r#"<link rel="stylesheet" href="style.css">"#,
        r#"<script src="script.js"></script>"#,
    );

    #[test]
    fn conservative_task_set_honors_declared_preloads_only() {
        let proc = HtmlProcessor::new(
            TaskSetConfig {
                aggressive: false,
                preload_css: true,
                preload_js: true,
            }
            .build(),
        );
        let mut resp = html_response("https://example.com/test.html", SAMPLE);
        proc.process(&mut resp).unwrap();

        assert_eq!(preload_urls(&resp), vec!["https://example.com/icons.svg"]);
        assert_eq!(resp.preloads[0].as_type, PreloadAs::Image);
    }

    #[test]
    fn aggressive_task_set_adds_stylesheets_and_scripts() {
        let proc = HtmlProcessor::new(
            TaskSetConfig {
                aggressive: true,
                preload_css: true,
                preload_js: true,
            }
            .build(),
        );
        let mut resp = html_response("https://example.com/test.html", SAMPLE);
        proc.process(&mut resp).unwrap();

        assert_eq!(
            preload_urls(&resp),
            vec![
                "https://example.com/icons.svg",
                "https://example.com/style.css",
                "https://example.com/script.js",
            ]
        );
        assert_eq!(resp.preloads[1].as_type, PreloadAs::Style);
        assert_eq!(resp.preloads[2].as_type, PreloadAs::Script);
    }

    #[test]
    fn tasks_run_in_declared_order_and_stop_at_first_failure() {
        use std::sync::Mutex;

        struct Record {
            label: &'static str,
            log: std::sync::Arc<Mutex<String>>,
            fail: bool,
        }

        impl HtmlTask for Record {
            fn run(&self, _doc: &Document, _resp: &mut Response) -> Result<(), ProcessError> {
                self.log.lock().unwrap().push_str(self.label);
                if self.fail {
                    Err(ProcessError::Html("task2 rejected".to_string()))
                } else {
                    Ok(())
                }
            }
        }

        let log = std::sync::Arc::new(Mutex::new(String::new()));
        let task = |label, fail| {
            Box::new(Record {
                label,
                log: log.clone(),
                fail,
            }) as Box<dyn HtmlTask>
        };

        let proc = HtmlProcessor::new(vec![
            task("Task1;", false),
            task("Task2;", true),
            task("Task3;", false),
        ]);
        let mut resp = html_response(
            "https://example.com/test.html",
            "<!doctype html><p>Hello, world.</p>",
        );

        let err = proc.process(&mut resp).unwrap_err();
        assert_eq!(err, ProcessError::Html("task2 rejected".to_string()));
        assert_eq!(log.lock().unwrap().as_str(), "Task1;Task2;");
    }

    #[test]
    fn non_https_preloads_are_dropped() {
        let proc = HtmlProcessor::new(TaskSetConfig::default().build());
        let html = r#"<link rel="preload" href="http://insecure.example.com/x.css" as="style">"#;
        let mut resp = html_response("https://example.com/test.html", html);
        proc.process(&mut resp).unwrap();
        assert!(resp.preloads.is_empty());
    }

    #[test]
    fn base_href_changes_resolution() {
        let proc = HtmlProcessor::new(TaskSetConfig::default().build());
        let html = r#"<base href="https://cdn.example.com/assets/"><link rel="stylesheet" href="style.css">"#;
        let mut resp = html_response("https://example.com/test.html", html);
        proc.process(&mut resp).unwrap();
        assert_eq!(
            preload_urls(&resp),
            vec!["https://cdn.example.com/assets/style.css"]
        );
    }

    #[test]
    fn non_html_responses_pass_through() {
        let proc = HtmlProcessor::new(TaskSetConfig::default().build());
        let mut resp = html_response("https://example.com/data.json", "{}");
        resp.headers.set("Content-Type", "application/json");
        proc.process(&mut resp).unwrap();
        assert!(resp.preloads.is_empty());
    }

    #[test]
    fn inline_scripts_record_js_sub_content_type() {
        let proc = HtmlProcessor::new(TaskSetConfig::default().build());
        let mut resp = html_response(
            "https://example.com/test.html",
            "<!doctype html><script>alert(1)</script>",
        );
        proc.process(&mut resp).unwrap();
        assert_eq!(
            resp.sub_content_types,
            vec!["application/javascript".to_string()]
        );
    }
}
