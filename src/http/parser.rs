use bytes::Bytes;
use thiserror::Error;

use crate::http::request::{Method, Request, Version};
use crate::http::response::StatusCode;

/// Longest chunk-size line accepted before the terminating CRLF shows up.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("request is incomplete")]
    Incomplete,
    #[error("malformed request line")]
    InvalidRequest,
    #[error("unsupported method")]
    InvalidMethod,
    #[error("malformed HTTP version")]
    InvalidVersion,
    #[error("malformed header field")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("unsupported transfer coding")]
    UnsupportedTransferEncoding,
    #[error("header block exceeds the configured limit")]
    HeaderTooLarge,
    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
}

impl ParseError {
    /// Status of the response synthesized for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::InvalidMethod | ParseError::UnsupportedTransferEncoding => StatusCode::NotImplemented,
            ParseError::BodyTooLarge => StatusCode::PayloadTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_header_size: usize,
    /// Largest decoded body, for both `Content-Length` and chunked framing.
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_header_size: 64 * 1024,
            max_body_size: 8 * 1024 * 1024,
        }
    }
}

pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    parse_http_request_with(buf, &ParseLimits::default())
}

/// Parses one request from the front of `buf`.
///
/// Returns the request and the number of bytes it occupied, or
/// `ParseError::Incomplete` when more input is needed.
pub fn parse_http_request_with(buf: &[u8], limits: &ParseLimits) -> Result<(Request, usize), ParseError> {
    RequestParser::new(*limits).parse(buf)
}

/// Request parser that keeps its progress between reads.
///
/// Until a request (or an error) is returned, every buffer passed to
/// [`RequestParser::parse`] must start with the bytes of the previous one.
/// The header search and the chunked decoder resume where they stopped, so
/// a body arriving in many small reads is decoded once.
#[derive(Debug)]
pub struct RequestParser {
    limits: ParseLimits,
    state: State,
}

#[derive(Debug)]
enum State {
    /// Looking for the blank line; the first `scanned` bytes were searched.
    Head { scanned: usize },
    Body {
        head: Head,
        body_start: usize,
        body: BodyState,
    },
}

#[derive(Debug)]
struct Head {
    method: Method,
    target: String,
    version: Version,
    headers: Vec<(String, String)>,
}

#[derive(Debug)]
enum BodyState {
    Length(usize),
    Chunked(ChunkedBody),
}

#[derive(Debug, Default)]
struct ChunkedBody {
    /// Next undecoded byte, relative to the body start.
    pos: usize,
    decoded: Vec<u8>,
    stage: ChunkStage,
}

#[derive(Debug, Default, Clone, Copy)]
enum ChunkStage {
    #[default]
    Size,
    /// Chunk data up to, and including, its CRLF ends at `end`.
    Data { end: usize },
    Trailers { start: usize },
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        Self {
            limits,
            state: State::Head { scanned: 0 },
        }
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    /// Forgets any partial request.
    pub fn reset(&mut self) {
        self.state = State::Head { scanned: 0 };
    }

    pub fn parse(&mut self, buf: &[u8]) -> Result<(Request, usize), ParseError> {
        let result = self.advance(buf);
        if !matches!(result, Err(ParseError::Incomplete)) {
            self.reset();
        }
        result
    }

    fn advance(&mut self, buf: &[u8]) -> Result<(Request, usize), ParseError> {
        if let State::Head { scanned } = &mut self.state {
            let (head, body, body_start) = parse_head(buf, scanned, &self.limits)?;
            self.state = State::Body { head, body_start, body };
        }

        let State::Body { body_start, body, .. } = &mut self.state else {
            return Err(ParseError::Incomplete);
        };
        let body_start = *body_start;
        let rest = buf.get(body_start..).ok_or(ParseError::Incomplete)?;

        let (payload, body_len) = match body {
            BodyState::Length(len) => {
                let len = *len;
                if rest.len() < len {
                    return Err(ParseError::Incomplete);
                }
                (Bytes::copy_from_slice(&rest[..len]), len)
            }
            BodyState::Chunked(chunked) => {
                let consumed = chunked.decode(rest, &self.limits)?;
                (Bytes::from(std::mem::take(&mut chunked.decoded)), consumed)
            }
        };

        let State::Body { head, .. } = std::mem::replace(&mut self.state, State::Head { scanned: 0 }) else {
            return Err(ParseError::Incomplete);
        };
        let request = Request {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body: payload,
        };
        Ok((request, body_start + body_len))
    }
}

/// Finds and parses the header block. Returns the head, the body framing
/// and the offset of the first body byte.
fn parse_head(buf: &[u8], scanned: &mut usize, limits: &ParseLimits) -> Result<(Head, BodyState, usize), ParseError> {
    // Empty lines ahead of a request line are ignored.
    let mut start = 0;
    while buf[start..].starts_with(b"\r\n") {
        start += 2;
    }

    // The separator may straddle the previous search boundary.
    let from = start.max(scanned.saturating_sub(3)).min(buf.len());
    let headers_end = match find_headers_end(&buf[from..]) {
        Some(pos) => from + pos - start,
        None => {
            *scanned = buf.len();
            if buf.len() - start > limits.max_header_size {
                return Err(ParseError::HeaderTooLarge);
            }
            return Err(ParseError::Incomplete);
        }
    };
    if headers_end + 4 > limits.max_header_size {
        return Err(ParseError::HeaderTooLarge);
    }

    let header_bytes = &buf[start..start + headers_end];
    let headers_str = std::str::from_utf8(header_bytes).map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
    let mut parts = request_line.split(' ');

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let target = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;
    if parts.next().is_some() || target.is_empty() {
        return Err(ParseError::InvalidRequest);
    }

    let method = match Method::from_str(method_str) {
        Some(method) => method,
        None if is_token(method_str) => return Err(ParseError::InvalidMethod),
        None => return Err(ParseError::InvalidRequest),
    };

    let version = Version::parse(version)
        .filter(|v| v.major == 1)
        .ok_or(ParseError::InvalidVersion)?;

    // Headers
    let mut headers = Vec::new();
    for line in lines {
        if line.starts_with([' ', '\t']) {
            // obsolete line folding
            return Err(ParseError::InvalidHeader);
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        if !is_token(key) {
            return Err(ParseError::InvalidHeader);
        }

        headers.push((key.to_string(), value.trim().to_string()));
    }

    let body = body_framing(&headers, limits)?;
    let head = Head {
        method,
        target: target.to_string(),
        version,
        headers,
    };
    Ok((head, body, start + headers_end + 4))
}

fn body_framing(headers: &[(String, String)], limits: &ParseLimits) -> Result<BodyState, ParseError> {
    let mut transfer_codings = headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding"))
        .flat_map(|(_, v)| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .peekable();

    if transfer_codings.peek().is_some() {
        let only_chunked = transfer_codings.all(|t| t.eq_ignore_ascii_case("chunked"));
        if !only_chunked {
            return Err(ParseError::UnsupportedTransferEncoding);
        }
        if headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("Content-Length")) {
            return Err(ParseError::InvalidRequest);
        }
        return Ok(BodyState::Chunked(ChunkedBody::default()));
    }

    let mut length = None;
    for (_, value) in headers.iter().filter(|(k, _)| k.eq_ignore_ascii_case("Content-Length")) {
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let parsed = value
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(previous) if previous != parsed => return Err(ParseError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }

    let length = length.unwrap_or(0);
    if length > limits.max_body_size {
        return Err(ParseError::BodyTooLarge);
    }
    Ok(BodyState::Length(length))
}

impl ChunkedBody {
    /// Decodes what `buf` (the encoded body received so far) adds to the
    /// payload. Returns the encoded length once the last chunk and the
    /// trailers are in.
    fn decode(&mut self, buf: &[u8], limits: &ParseLimits) -> Result<usize, ParseError> {
        loop {
            let rest = buf.get(self.pos..).unwrap_or_default();

            match self.stage {
                ChunkStage::Size => {
                    let line_end = find_line_end(rest)?;
                    let line = std::str::from_utf8(&rest[..line_end]).map_err(|_| ParseError::InvalidChunk)?;
                    let size = parse_chunk_size(line)?;
                    self.pos += line_end + 2;

                    if size == 0 {
                        self.stage = ChunkStage::Trailers { start: self.pos };
                        continue;
                    }
                    if self.decoded.len().saturating_add(size) > limits.max_body_size {
                        return Err(ParseError::BodyTooLarge);
                    }
                    let end = self
                        .pos
                        .checked_add(size)
                        .and_then(|data_end| data_end.checked_add(2))
                        .ok_or(ParseError::InvalidChunk)?;
                    self.stage = ChunkStage::Data { end };
                }
                ChunkStage::Data { end } => {
                    if buf.len() < end {
                        return Err(ParseError::Incomplete);
                    }
                    let data_end = end - 2;
                    if &buf[data_end..end] != b"\r\n" {
                        return Err(ParseError::InvalidChunk);
                    }
                    self.decoded.extend_from_slice(&buf[self.pos..data_end]);
                    self.pos = end;
                    self.stage = ChunkStage::Size;
                }
                ChunkStage::Trailers { start } => {
                    let line_end = find_line_end(rest)?;
                    self.pos += line_end + 2;
                    if line_end == 0 {
                        return Ok(self.pos);
                    }
                    if self.pos - start > limits.max_header_size {
                        return Err(ParseError::HeaderTooLarge);
                    }
                }
            }
        }
    }
}

/// Hex chunk size, extensions after `;` ignored.
fn parse_chunk_size(line: &str) -> Result<usize, ParseError> {
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidChunk);
    }
    usize::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)
}

fn find_line_end(buf: &[u8]) -> Result<usize, ParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) => Ok(end),
        None if buf.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
        None => Err(ParseError::Incomplete),
    }
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// RFC 9110 token characters.
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}
