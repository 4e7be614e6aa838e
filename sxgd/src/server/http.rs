// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Minimal HTTP/1.1 plumbing for the serving endpoints.
//!
//! The doc endpoint must see the raw escaped request target (a normalizing
//! router would collapse `https://…` and `..` inside it), so requests are
//! read straight off the socket: request line, headers, done. All
//! endpoints are GET, so bodies are never read.

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

use crate::resource::Headers;

const MAX_LINE_LENGTH: usize = 8192;
const MAX_HEADER_COUNT: usize = 100;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HttpError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed header line")]
    BadHeader,
    #[error("request line or header too long")]
    TooLong,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("unsupported protocol version {0}")]
    BadVersion(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed request head. The target is kept raw and escaped.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Headers,
}

impl HttpRequest {
    /// The escaped path portion of the target, without the query.
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or("")
    }

    /// The raw query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// A named query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query()?;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key == name {
                return Some(percent_decode(value));
            }
        }
        None
    }

    pub fn wants_close(&self) -> bool {
        if self.version == "HTTP/1.0" {
            return !self
                .headers
                .get("Connection")
                .is_some_and(|c| c.eq_ignore_ascii_case("keep-alive"));
        }
        self.headers
            .get("Connection")
            .is_some_and(|c| c.eq_ignore_ascii_case("close"))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn ok(body: impl Into<Bytes>, content_type: &str) -> Self {
        let body = body.into();
        HttpResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Read one request head. Returns `None` on a clean EOF before any bytes.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<HttpRequest>, HttpError>
where
    R: AsyncBufReadExt + Unpin,
{
    let Some(line) = read_line(reader).await? else {
        return Ok(None);
    };
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next().ok_or(HttpError::BadRequestLine)?.to_string();
    let target = parts.next().ok_or(HttpError::BadRequestLine)?.to_string();
    let version = parts.next().ok_or(HttpError::BadRequestLine)?.to_string();
    if parts.next().is_some() {
        return Err(HttpError::BadRequestLine);
    }
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(HttpError::BadVersion(version));
    }

    let mut headers = Headers::new();
    let mut count = 0;
    loop {
        let line = read_line(reader).await?.ok_or(HttpError::BadHeader)?;
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > MAX_HEADER_COUNT {
            return Err(HttpError::TooManyHeaders);
        }
        let (name, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
        if name.is_empty() || name.contains(' ') {
            return Err(HttpError::BadHeader);
        }
        headers.add(name, value.trim());
    }

    Ok(Some(HttpRequest {
        method,
        target,
        version,
        headers,
    }))
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>, HttpError>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = Vec::new();
    let mut limited = reader.take((MAX_LINE_LENGTH + 1) as u64);
    let read = limited.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Ok(None);
    }
    if read > MAX_LINE_LENGTH {
        return Err(HttpError::TooLong);
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| HttpError::BadHeader)
}

/// Write a response head and body.
pub async fn write_response<W>(
    writer: &mut W,
    response: &HttpResponse,
    close: bool,
) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        response.status,
        status_text(response.status)
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    if close {
        head.push_str("Connection: close\r\n");
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
