pub mod echo;
pub mod files;
pub mod fixed;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use fcx_core::LogicalRequest;
use std::fmt::Write;

/// A routed request as seen by a backend.
#[derive(Debug, Clone, Copy)]
pub struct Routed<'a> {
    pub request: &'a LogicalRequest,
    /// Request path used for routing (SCRIPT_NAME, DOCUMENT_URI or "/").
    pub path: &'a str,
    /// The matched route prefix (if any), stripped by path-based backends.
    pub matched_prefix: Option<&'a str>,
}

/// Produces CGI-style output for one request.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn respond(&self, routed: Routed<'_>) -> Result<CgiResponse>;
}

/// A CGI-style response: status line, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CgiResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::new(404, "text/plain; charset=utf-8", "not found\n")
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Serialize into raw CGI output (Status header + headers + body).
    pub fn to_cgi_output(&self) -> Bytes {
        let header_size: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + v.len() + 4)
            .sum::<usize>()
            + 40;
        let mut out = String::with_capacity(header_size);
        let _ = write!(out, "Status: {}", self.status);
        if let Some(reason) = reason_phrase(self.status) {
            let _ = write!(out, " {reason}");
        }
        out.push_str("\r\n");
        for (k, v) in &self.headers {
            let _ = write!(out, "{k}: {v}\r\n");
        }
        out.push_str("\r\n");
        let mut bytes = Vec::with_capacity(out.len() + self.body.len());
        bytes.extend_from_slice(out.as_bytes());
        bytes.extend_from_slice(&self.body);
        Bytes::from(bytes)
    }

    /// Parse CGI output back into status, headers and body.
    pub fn parse_cgi_output(data: &[u8]) -> Result<Self> {
        let (header_end, body_start) = match find_header_end(data) {
            Some(i) if data[i..].starts_with(b"\r\n\r\n") => (i, i + 4),
            Some(i) => (i, i + 2),
            None => (data.len(), data.len()),
        };
        let header_section = std::str::from_utf8(&data[..header_end])?;

        let mut status = 200u16;
        let mut headers = Vec::new();
        for line in header_section.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            if key.eq_ignore_ascii_case("Status") {
                if let Some(code) = value.split_whitespace().next() {
                    status = code.parse().unwrap_or(200);
                }
            } else {
                headers.push((key.to_string(), value.to_string()));
            }
        }
        Ok(CgiResponse {
            status,
            headers,
            body: Bytes::copy_from_slice(&data[body_start..]),
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn reason_phrase(status: u16) -> Option<&'static str> {
    Some(match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => return None,
    })
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    (0..data.len()).find(|&i| data[i..].starts_with(b"\r\n\r\n") || data[i..].starts_with(b"\n\n"))
}
