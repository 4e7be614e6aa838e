// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Physical URL rules.
//!
//! The physical URL is the canonical form of a request URL used as the
//! resource cache key and as the base for validity URLs. Rules only ever
//! rewrite the path; the authority is never altered.

use url::Url;

/// A composable URL rewrite rule.
#[derive(Debug, Clone)]
pub enum UrlRule {
    /// Resolve `.` and `..` segments and collapse empty segments, keeping a
    /// trailing slash if one was present.
    CleanPath,
    /// Append the named index file to any URL whose path ends with `/`.
    IndexFile(String),
    /// Apply each rule in order.
    Sequence(Vec<UrlRule>),
}

impl UrlRule {
    /// The default physical URL rule: clean the path, then apply the index
    /// filename.
    pub fn physical(index_file: &str) -> Self {
        UrlRule::Sequence(vec![
            UrlRule::CleanPath,
            UrlRule::IndexFile(index_file.to_string()),
        ])
    }

    pub fn rewrite(&self, url: &mut Url) {
        match self {
            UrlRule::CleanPath => {
                let cleaned = clean_path(url.path());
                url.set_path(&cleaned);
            }
            UrlRule::IndexFile(name) => {
                if url.path().ends_with('/') {
                    let path = format!("{}{}", url.path(), name);
                    url.set_path(&path);
                }
            }
            UrlRule::Sequence(rules) => {
                for rule in rules {
                    rule.rewrite(url);
                }
            }
        }
    }

    pub fn apply(&self, url: &Url) -> Url {
        let mut rewritten = url.clone();
        self.rewrite(&mut rewritten);
        rewritten
    }
}

/// Resolve `.` and `..` and collapse empty segments in an absolute URL path.
///
/// A trailing slash survives, and `..` never escapes the root. The input is
/// treated as the escaped path, so percent sequences pass through untouched.
pub fn clean_path(path: &str) -> String {
    let trailing_slash = path.ends_with('/');
    let mut stack: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }

    let mut cleaned = String::from("/");
    cleaned.push_str(&stack.join("/"));
    if trailing_slash && !cleaned.ends_with('/') {
        cleaned.push('/');
    }
    cleaned
}
