//! Incremental HTTP/1.1 response decoder
//!
//! Feed it bytes as they arrive; it consumes exactly one response worth of
//! input and leaves anything past that in the caller's buffer. State
//! persists across calls, so a head, a chunk-size line or a body split at
//! any byte offset decodes the same as a single delivery.

use std::collections::HashMap;
use std::io::Read;
use std::mem;

use bytes::{Buf, BytesMut};
use flate2::read::{DeflateDecoder, GzDecoder};
use tracing::trace;
use url::Url;

use crate::common::{Error, Result};
use crate::http::{Encoding, HttpResponse, HttpResult, ResponseHead};

const HEAD_DIVIDER: &[u8] = b"\r\n\r\n";
const LINE_END: &[u8] = b"\r\n";

#[derive(Debug)]
enum DecodeState {
    /// Accumulating the head until the `\r\n\r\n` divider
    Head,
    /// Reading exactly `remaining` body bytes
    FixedBody { remaining: usize },
    /// Accumulating a `<hex-size>\r\n` chunk-size line
    ChunkSize,
    /// Reading `remaining` bytes of the current chunk
    ChunkData { remaining: usize },
    /// Consuming the `\r\n` that closes a chunk
    ChunkDataEnd,
    /// Consuming the `\r\n` after the terminal 0-size chunk
    ChunkTrailer,
    Complete,
}

/// Stateful decoder for one HTTP/1.1 response
pub struct ResponseDecoder {
    state: DecodeState,
    head_buf: Vec<u8>,
    line_buf: Vec<u8>,
    body: BytesMut,
    head: Option<ResponseHead>,
    head_only: bool,
    base: Option<Url>,
}

impl ResponseDecoder {
    /// Decoder for a full response (head + body + content encodings)
    pub fn new() -> Self {
        Self {
            state: DecodeState::Head,
            head_buf: Vec::new(),
            line_buf: Vec::new(),
            body: BytesMut::new(),
            head: None,
            head_only: false,
            base: None,
        }
    }

    /// Decoder that completes as soon as the head is parsed, consuming
    /// nothing past the blank line. Used for CONNECT tunnel replies.
    pub fn head_only() -> Self {
        Self {
            head_only: true,
            ..Self::new()
        }
    }

    /// Base URI for resolving relative redirect locations
    pub fn with_base(mut self, base: Url) -> Self {
        self.base = Some(base);
        self
    }

    /// Consume bytes from `src` until the response completes or more input
    /// is needed. `Ok(None)` means feed more bytes and call again; leftover
    /// bytes past the response stay in `src`.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpResult>> {
        loop {
            match self.state {
                DecodeState::Head => {
                    if !self.accumulate_until(src, HEAD_DIVIDER) {
                        return Ok(None);
                    }
                    if let Some(result) = self.process_head()? {
                        return Ok(Some(result));
                    }
                }
                DecodeState::FixedBody { remaining } => {
                    let taken = self.take_body(src, remaining);
                    if taken == remaining {
                        return self.finish().map(Some);
                    }
                    self.state = DecodeState::FixedBody {
                        remaining: remaining - taken,
                    };
                    return Ok(None);
                }
                DecodeState::ChunkSize => {
                    if !self.accumulate_line(src) {
                        return Ok(None);
                    }
                    let size = self.parse_chunk_size()?;
                    trace!("chunk of {size} bytes");
                    if size == 0 {
                        self.state = DecodeState::ChunkTrailer;
                    } else {
                        self.state = DecodeState::ChunkData { remaining: size };
                    }
                }
                DecodeState::ChunkData { remaining } => {
                    let taken = self.take_body(src, remaining);
                    if taken == remaining {
                        self.state = DecodeState::ChunkDataEnd;
                    } else {
                        self.state = DecodeState::ChunkData {
                            remaining: remaining - taken,
                        };
                        return Ok(None);
                    }
                }
                DecodeState::ChunkDataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let mut end = [0u8; 2];
                    src.copy_to_slice(&mut end);
                    if end != *LINE_END {
                        return Err(Error::HttpDecode("missing delimiter after chunk".into()));
                    }
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::ChunkTrailer => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let mut end = [0u8; 2];
                    src.copy_to_slice(&mut end);
                    if end != *LINE_END {
                        return Err(Error::HttpDecode("missing delimiter after last chunk".into()));
                    }
                    return self.finish().map(Some);
                }
                DecodeState::Complete => {
                    return Err(Error::InvalidState("response decoder already completed".into()));
                }
            }
        }
    }

    /// Move bytes from `src` into the head buffer until it ends with
    /// `divider`. Returns false when `src` runs dry first.
    fn accumulate_until(&mut self, src: &mut BytesMut, divider: &[u8]) -> bool {
        while src.has_remaining() {
            self.head_buf.push(src.get_u8());
            if self.head_buf.ends_with(divider) {
                return true;
            }
        }
        false
    }

    fn accumulate_line(&mut self, src: &mut BytesMut) -> bool {
        while src.has_remaining() {
            self.line_buf.push(src.get_u8());
            if self.line_buf.ends_with(LINE_END) {
                return true;
            }
        }
        false
    }

    fn take_body(&mut self, src: &mut BytesMut, wanted: usize) -> usize {
        let taken = src.len().min(wanted);
        self.body.extend_from_slice(&src.split_to(taken));
        taken
    }

    fn process_head(&mut self) -> Result<Option<HttpResult>> {
        let text = latin1_text(&self.head_buf);
        self.head_buf.clear();
        let head = parse_head(&text)?;

        if self.head_only {
            self.head = Some(head);
            return self.finish().map(Some);
        }

        if head.status == 302 {
            let target = self.resolve_redirect(&head)?;
            self.state = DecodeState::Complete;
            return Ok(Some(HttpResult::Redirect(target)));
        }

        if head.raw_content_length().is_some() && head.content_length.is_none() {
            return Err(Error::HttpDecode("invalid content-length".into()));
        }

        match head.content_length {
            Some(0) => {
                self.head = Some(head);
                self.finish().map(Some)
            }
            Some(length) => {
                self.head = Some(head);
                self.body.reserve(length);
                self.state = DecodeState::FixedBody { remaining: length };
                Ok(None)
            }
            None => {
                self.head = Some(head);
                self.state = DecodeState::ChunkSize;
                Ok(None)
            }
        }
    }

    fn resolve_redirect(&self, head: &ResponseHead) -> Result<Url> {
        let location = head
            .location
            .as_deref()
            .ok_or_else(|| Error::HttpDecode("302 response without location".into()))?;
        match Url::parse(location) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base {
                Some(base) => base
                    .join(location)
                    .map_err(|e| Error::HttpDecode(format!("unresolvable location {location}: {e}"))),
                None => Err(Error::HttpDecode(format!(
                    "relative location {location} without a request URI"
                ))),
            },
            Err(e) => Err(Error::HttpDecode(format!("invalid location {location}: {e}"))),
        }
    }

    fn parse_chunk_size(&mut self) -> Result<usize> {
        let line = latin1_text(&self.line_buf);
        self.line_buf.clear();
        let token = line
            .trim_end_matches("\r\n")
            .split(';')
            .next()
            .unwrap_or("")
            .trim();
        usize::from_str_radix(token, 16)
            .map_err(|_| Error::HttpDecode(format!("invalid chunk size: {token}")))
    }

    fn finish(&mut self) -> Result<HttpResult> {
        self.state = DecodeState::Complete;
        let head = self
            .head
            .take()
            .ok_or_else(|| Error::InvalidState("response head missing".into()))?;
        let raw = mem::take(&mut self.body);
        let body = apply_content_encodings(raw.to_vec(), &head.content_encoding)?;
        Ok(HttpResult::Response(HttpResponse { head, body }))
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the accumulated Latin-1 head text: status line plus header lines.
fn parse_head(text: &str) -> Result<ResponseHead> {
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| Error::HttpDecode("empty response head".into()))?;

    let mut tokens = status_line.split_whitespace();
    let _version = tokens
        .next()
        .ok_or_else(|| Error::HttpDecode(format!("malformed status line: {status_line}")))?;
    let status_token = tokens
        .next()
        .ok_or_else(|| Error::HttpDecode(format!("malformed status line: {status_line}")))?;
    let status: u16 = status_token
        .parse()
        .map_err(|_| Error::HttpDecode(format!("non-numeric status: {status_token}")))?;

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_ascii_lowercase();
            headers.entry(key).or_insert_with(|| value.trim().to_string());
        }
    }

    Ok(ResponseHead::new(status, headers))
}

/// Apply `Content-Encoding` tokens in declaration order: gzip decodes with
/// the standard header-aware inflate, deflate with raw inflate.
fn apply_content_encodings(body: Vec<u8>, encodings: &[Encoding]) -> Result<Vec<u8>> {
    let mut data = body;
    for encoding in encodings {
        data = match encoding {
            Encoding::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::HttpDecode(format!("gzip body: {e}")))?;
                out
            }
            Encoding::Deflate => {
                let mut out = Vec::new();
                DeflateDecoder::new(data.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| Error::HttpDecode(format!("deflate body: {e}")))?;
                out
            }
            other => {
                return Err(Error::HttpDecode(format!(
                    "unsupported content encoding: {other:?}"
                )))
            }
        };
    }
    Ok(data)
}

/// Latin-1: every byte maps to the code point of the same value.
fn latin1_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder};
    use flate2::Compression;
    use std::io::Write;

    fn decode_all(raw: &[u8]) -> Result<HttpResult> {
        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::from(raw);
        decoder
            .decode(&mut buf)
            .map(|r| r.expect("response should complete"))
    }

    fn expect_response(result: HttpResult) -> HttpResponse {
        match result {
            HttpResult::Response(response) => response,
            HttpResult::Redirect(url) => panic!("unexpected redirect to {url}"),
        }
    }

    #[test]
    fn decodes_content_length_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let response = expect_response(decode_all(raw).unwrap());
        assert_eq!(response.head.status, 200);
        assert_eq!(response.body, b"hello");
    }

    #[test]
    fn decodes_empty_body_immediately() {
        let raw = b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n";
        let response = expect_response(decode_all(raw).unwrap());
        assert!(response.body.is_empty());
    }

    #[test]
    fn decodes_chunked_body() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let response = expect_response(decode_all(raw).unwrap());
        assert_eq!(response.body, b"wikipedia");
    }

    #[test]
    fn content_length_body_survives_any_split() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nhello world";
        for split in 1..raw.len() {
            let mut decoder = ResponseDecoder::new();
            let mut first = BytesMut::from(&raw[..split]);
            let partial = decoder.decode(&mut first).unwrap();
            let result = match partial {
                Some(result) => result,
                None => {
                    assert!(first.is_empty(), "decoder must drain its input");
                    let mut second = BytesMut::from(&raw[split..]);
                    decoder.decode(&mut second).unwrap().expect("complete")
                }
            };
            let response = expect_response(result);
            assert_eq!(response.body, b"hello world", "split at {split}");
        }
    }

    #[test]
    fn chunked_body_survives_any_split() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n6\r\nfoobar\r\nA\r\n0123456789\r\n0\r\n\r\n";
        for split in 1..raw.len() {
            let mut decoder = ResponseDecoder::new();
            let mut first = BytesMut::from(&raw[..split]);
            let result = match decoder.decode(&mut first).unwrap() {
                Some(result) => result,
                None => {
                    let mut second = BytesMut::from(&raw[split..]);
                    decoder.decode(&mut second).unwrap().expect("complete")
                }
            };
            let response = expect_response(result);
            assert_eq!(response.body, b"foobar0123456789", "split at {split}");
        }
    }

    #[test]
    fn leaves_bytes_after_the_response_untouched() {
        let mut decoder = ResponseDecoder::new();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nokEXTRA"[..]);
        let response = expect_response(decoder.decode(&mut buf).unwrap().expect("complete"));
        assert_eq!(response.body, b"ok");
        assert_eq!(&buf[..], b"EXTRA");
    }

    #[test]
    fn head_only_stops_at_the_blank_line() {
        let mut decoder = ResponseDecoder::head_only();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 Connection Established\r\n\r\n\x16\x03\x01"[..]);
        let response = expect_response(decoder.decode(&mut buf).unwrap().expect("complete"));
        assert_eq!(response.head.status, 200);
        assert_eq!(&buf[..], &[0x16, 0x03, 0x01]);
    }

    #[test]
    fn resolves_relative_redirect_against_base() {
        let base = Url::parse("https://example.org/v1/session").unwrap();
        let mut decoder = ResponseDecoder::new().with_base(base);
        let mut buf =
            BytesMut::from(&b"HTTP/1.1 302 Found\r\nLocation: /v2/session\r\n\r\n"[..]);
        match decoder.decode(&mut buf).unwrap().expect("complete") {
            HttpResult::Redirect(url) => {
                assert_eq!(url.as_str(), "https://example.org/v2/session")
            }
            HttpResult::Response(_) => panic!("expected redirect"),
        }
    }

    #[test]
    fn passes_through_absolute_redirects() {
        let raw = b"HTTP/1.1 302 Found\r\nLocation: https://other.example.org/x\r\n\r\n";
        match decode_all(raw).unwrap() {
            HttpResult::Redirect(url) => {
                assert_eq!(url.as_str(), "https://other.example.org/x")
            }
            HttpResult::Response(_) => panic!("expected redirect"),
        }
    }

    #[test]
    fn inflates_gzip_bodies() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let gzipped = encoder.finish().unwrap();

        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gzipped.len()
        )
        .into_bytes();
        raw.extend_from_slice(&gzipped);

        let response = expect_response(decode_all(&raw).unwrap());
        assert_eq!(response.body, b"compressed payload");
    }

    #[test]
    fn inflates_deflate_bodies_with_raw_inflate() {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"deflated payload").unwrap();
        let deflated = encoder.finish().unwrap();

        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: deflate\r\nContent-Length: {}\r\n\r\n",
            deflated.len()
        )
        .into_bytes();
        raw.extend_from_slice(&deflated);

        let response = expect_response(decode_all(&raw).unwrap());
        assert_eq!(response.body, b"deflated payload");
    }

    #[test]
    fn applies_content_encodings_in_declaration_order() {
        let mut gzip = GzEncoder::new(Vec::new(), Compression::default());
        gzip.write_all(b"twice encoded").unwrap();
        let once = gzip.finish().unwrap();
        let mut deflate = DeflateEncoder::new(Vec::new(), Compression::default());
        deflate.write_all(&once).unwrap();
        let twice = deflate.finish().unwrap();

        // Sender deflated last, so the receiver inflates deflate first.
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: deflate, gzip\r\nContent-Length: {}\r\n\r\n",
            twice.len()
        )
        .into_bytes();
        raw.extend_from_slice(&twice);

        let response = expect_response(decode_all(&raw).unwrap());
        assert_eq!(response.body, b"twice encoded");
    }

    #[test]
    fn rejects_malformed_status_line() {
        let err = decode_all(b"garbage\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
    }

    #[test]
    fn rejects_non_numeric_status() {
        let err = decode_all(b"HTTP/1.1 abc OK\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
    }

    #[test]
    fn rejects_unparsable_content_length() {
        let err = decode_all(b"HTTP/1.1 200 OK\r\nContent-Length: many\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
    }

    #[test]
    fn rejects_invalid_chunk_size() {
        let err = decode_all(b"HTTP/1.1 200 OK\r\n\r\nzz\r\n\r\n").unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
    }

    #[test]
    fn rejects_unknown_content_encoding() {
        let err =
            decode_all(b"HTTP/1.1 200 OK\r\nContent-Encoding: br\r\nContent-Length: 2\r\n\r\nok")
                .unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
    }

    #[test]
    fn rejects_corrupt_gzip_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 4\r\n\r\n\x00\x01\x02\x03";
        let err = decode_all(raw).unwrap_err();
        assert!(matches!(err, Error::HttpDecode(_)));
    }
}
