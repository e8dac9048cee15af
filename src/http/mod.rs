//! HTTP/1.1 response decoding
//!
//! Responsibilities:
//! - Incrementally parse one response from arbitrarily split reads
//! - Reassemble content-length and chunked bodies
//! - Apply gzip/deflate content encodings
//! - Surface 302 redirects as resolved URIs
//!
//! The decoder is used both for CONNECT tunnel replies (head-only mode)
//! and by the general-purpose client in this module.

mod client;
mod decoder;

pub use client::HttpClient;
pub use decoder::ResponseDecoder;

use std::collections::HashMap;

use url::Url;

/// Body framing and compression tokens from `Transfer-Encoding` /
/// `Content-Encoding` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Chunked,
    Gzip,
    Deflate,
    Compress,
    Unknown,
}

impl Encoding {
    pub(crate) fn from_token(token: &str) -> Self {
        match token.trim().to_ascii_lowercase().as_str() {
            "chunked" => Encoding::Chunked,
            "gzip" => Encoding::Gzip,
            "deflate" => Encoding::Deflate,
            "compress" => Encoding::Compress,
            _ => Encoding::Unknown,
        }
    }
}

/// Parsed response head: status line plus the headers this layer acts on
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<usize>,
    pub transfer_encoding: Vec<Encoding>,
    pub content_encoding: Vec<Encoding>,
    pub connection_close: bool,
    pub location: Option<String>,
    headers: HashMap<String, String>,
}

impl ResponseHead {
    pub(crate) fn new(status: u16, headers: HashMap<String, String>) -> Self {
        let content_length = headers.get("content-length").cloned();
        let transfer_encoding = headers
            .get("transfer-encoding")
            .map(|v| v.split(',').map(Encoding::from_token).collect())
            .unwrap_or_default();
        let content_encoding = headers
            .get("content-encoding")
            .map(|v| v.split(',').map(Encoding::from_token).collect())
            .unwrap_or_default();
        let connection_close = headers
            .get("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);
        let location = headers.get("location").cloned();

        Self {
            status,
            // Validated by the decoder before the body is read
            content_length: content_length.and_then(|v| v.parse().ok()),
            transfer_encoding,
            content_encoding,
            connection_close,
            location,
            headers,
        }
    }

    /// Look up a header by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub(crate) fn raw_content_length(&self) -> Option<&str> {
        self.headers.get("content-length").map(String::as_str)
    }
}

/// One fully decoded response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

/// Terminal decoder outcome: either a complete response or a redirect the
/// caller should re-issue against the resolved URI.
#[derive(Debug, Clone)]
pub enum HttpResult {
    Response(HttpResponse),
    Redirect(Url),
}
