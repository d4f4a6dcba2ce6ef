//! Request framing and parsing.
//!
//! Nothing in here touches a socket: bytes are pushed into a [`RequestReader`] as they arrive and
//! it reports when a complete request can be handed to the router.

use std::os::unix::io::RawFd;

use crate::error::HttpError;
use crate::request::{ClientRequest, Headers, Method, Version};

pub const MAX_URI_LENGTH: usize = 2048;
pub const MAX_HEADER_NAME_LENGTH: usize = 1024;
pub const MAX_HEADER_VALUE_LENGTH: usize = 8000;
pub const MAX_HEADERS: usize = 100;
/// A header block that grows past this without a terminating empty line is rejected.
pub const MAX_HEADER_BLOCK: usize = 1 << 16;
/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 4096;

const HEADER_END: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Return the length of the header block including its terminating empty line, if complete.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    find(HEADER_END, buf).map(|pos| pos + HEADER_END.len())
}

/// How the body of a request is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    Length(usize),
    Chunked,
}

/// Body framing plus whether the client waits for `100 Continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyInfo {
    pub framing: Framing,
    pub expect_continue: bool,
}

/// Split a header line into trimmed name and value.
fn split_header(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    Some((
        line[..colon].trim_end_matches(|c| c == ' ' || c == '\t'),
        line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t'),
    ))
}

/// Inspect a header block (request line included) for body framing.
pub fn body_info(head: &[u8]) -> Result<BodyInfo, HttpError> {
    let head = std::str::from_utf8(head).map_err(|_| HttpError::BadHeader("not valid UTF-8"))?;
    let mut content_length = None;
    let mut chunked = false;
    let mut expect_continue = false;
    for (name, value) in head.split("\r\n").skip(1).filter_map(split_header) {
        if name.eq_ignore_ascii_case("content-length") {
            if content_length.is_some() {
                return Err(HttpError::DuplicateHeader("content-length".to_string()));
            }
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(HttpError::InvalidContentLength(value.to_string()));
            }
            let length = value
                .parse::<usize>()
                .map_err(|_| HttpError::InvalidContentLength(value.to_string()))?;
            content_length = Some(length);
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if !value.eq_ignore_ascii_case("chunked") {
                return Err(HttpError::EncodingNotImplemented(value.to_string()));
            }
            chunked = true;
        } else if name.eq_ignore_ascii_case("expect") {
            expect_continue = value.eq_ignore_ascii_case("100-continue");
        }
    }
    let framing = match (chunked, content_length) {
        (true, Some(_)) => return Err(HttpError::ConflictingFraming),
        (true, None) => Framing::Chunked,
        (false, Some(0)) | (false, None) => Framing::Empty,
        (false, Some(length)) => Framing::Length(length),
    };
    Ok(BodyInfo {
        framing,
        expect_continue: expect_continue && framing != Framing::Empty,
    })
}

/// Parse a chunk-size line (without its CRLF), ignoring chunk extensions.
pub fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let size = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let size = std::str::from_utf8(size)
        .map_err(|_| HttpError::BadChunk("chunk size is not valid UTF-8"))?
        .trim_matches(|c| c == ' ' || c == '\t');
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(HttpError::BadChunk("chunk size is not a hexadecimal number"));
    }
    usize::from_str_radix(size, 16).map_err(|_| HttpError::BadChunk("chunk size is too large"))
}

/// Rewrite a chunked request as the equivalent `Content-Length` framed one.
///
/// `head` is the original header block including its terminating empty line and `body` is the
/// decoded payload.
pub fn reconstruct_chunked(head: &[u8], body: &[u8]) -> Vec<u8> {
    let head = &head[..head.len().saturating_sub(CRLF.len())];
    let mut request = Vec::with_capacity(head.len() + body.len() + 32);
    for line in crlf_lines(head) {
        let is_transfer_encoding = std::str::from_utf8(line)
            .ok()
            .and_then(split_header)
            .map_or(false, |(name, _)| name.eq_ignore_ascii_case("transfer-encoding"));
        if !is_transfer_encoding {
            request.extend_from_slice(line);
        }
    }
    request.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    request.extend_from_slice(body);
    request
}

fn crlf_lines(buf: &[u8]) -> CrlfLines<'_> {
    CrlfLines(buf)
}

/// Lines of a header block, each still ending in CRLF.
struct CrlfLines<'a>(&'a [u8]);

impl<'a> Iterator for CrlfLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.is_empty() {
            return None;
        }
        let end = find(CRLF, self.0).map_or(self.0.len(), |pos| pos + CRLF.len());
        let (line, rest) = self.0.split_at(end);
        self.0 = rest;
        Some(line)
    }
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Percent-decode a request path, rejecting control characters, whitespace, quotes, backslashes
/// and non-ASCII bytes in the raw form, and control characters in the decoded form.
pub fn decode_path(path: &str) -> Result<String, HttpError> {
    let raw = path.as_bytes();
    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let c = raw[i];
        if c == b'%' {
            if i + 2 >= raw.len() {
                return Err(HttpError::BadRequestLine("truncated percent escape"));
            }
            let (hi, lo) = (raw[i + 1], raw[i + 2]);
            if !hi.is_ascii_hexdigit() || !lo.is_ascii_hexdigit() {
                return Err(HttpError::BadRequestLine("invalid percent escape"));
            }
            let byte = hex_to_digit(hi) * 16 + hex_to_digit(lo);
            if byte <= 0x1f || byte == 0x7f {
                return Err(HttpError::BadRequestLine("escaped control character"));
            }
            decoded.push(byte);
            i += 3;
        } else {
            if c <= 0x20 || c >= 0x7f || matches!(c, b'"' | b'\'' | b'\\') {
                return Err(HttpError::BadRequestLine("invalid character in URI"));
            }
            decoded.push(c);
            i += 1;
        }
    }
    String::from_utf8(decoded).map_err(|_| HttpError::BadRequestLine("URI is not valid UTF-8"))
}

fn parse_request_line(line: &str) -> Result<(Method, String, String, String, Version), HttpError> {
    let mut parts = line.split(' ');
    let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version), None) => (method, uri, version),
        _ => return Err(HttpError::BadRequestLine("expected METHOD SP URI SP VERSION")),
    };
    if method.is_empty() || uri.is_empty() || version.is_empty() {
        return Err(HttpError::BadRequestLine("empty component"));
    }
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        _ => return Err(HttpError::BadRequestLine("unsupported HTTP version")),
    };
    if uri.len() > MAX_URI_LENGTH {
        return Err(HttpError::BadRequestLine("URI is too long"));
    }
    if !uri.starts_with('/') {
        return Err(HttpError::BadRequestLine("URI must start with a slash"));
    }
    let (raw_path, query) = match uri.find('?') {
        Some(pos) => (&uri[..pos], &uri[pos + 1..]),
        None => (uri, ""),
    };
    let path = decode_path(raw_path)?;
    if query.bytes().any(|b| b <= 0x20 || b >= 0x7f) {
        return Err(HttpError::BadRequestLine("invalid character in query string"));
    }
    if !method.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(HttpError::BadRequestLine("invalid method token"));
    }
    let method = method
        .parse()
        .map_err(|_| HttpError::MethodNotImplemented(method.to_string()))?;
    Ok((method, uri.to_string(), path, query.to_string(), version))
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers, HttpError> {
    let mut headers = Headers::default();
    for line in lines {
        if headers.len() == MAX_HEADERS {
            return Err(HttpError::BadHeader("too many headers"));
        }
        let (name, value) = split_header(line).ok_or(HttpError::BadHeader("missing colon"))?;
        if name.is_empty() {
            return Err(HttpError::BadHeader("empty name"));
        }
        if name.len() > MAX_HEADER_NAME_LENGTH {
            return Err(HttpError::BadHeader("name is too long"));
        }
        if value.len() > MAX_HEADER_VALUE_LENGTH {
            return Err(HttpError::BadHeader("value is too long"));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(HttpError::BadHeader("invalid character in name"));
        }
        if value.bytes().any(|b| (b < 0x20 && b != b'\t') || b == 0x7f) {
            return Err(HttpError::BadHeader("control character in value"));
        }
        if !headers.insert(name, value) {
            return Err(HttpError::DuplicateHeader(name.to_ascii_lowercase()));
        }
    }
    if !headers.contains("host") {
        return Err(HttpError::MissingHost);
    }
    Ok(headers)
}

/// Parse a complete `Content-Length` framed (or bodiless) request.
pub fn parse_request(
    raw: &[u8],
    chunked: bool,
    client_fd: RawFd,
) -> Result<ClientRequest, HttpError> {
    let header_end =
        find_header_end(raw).ok_or(HttpError::BadHeader("missing empty line after headers"))?;
    let head = std::str::from_utf8(&raw[..header_end - HEADER_END.len()])
        .map_err(|_| HttpError::BadHeader("not valid UTF-8"))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let (method, uri, path, query, version) = parse_request_line(request_line)?;
    let headers = parse_headers(lines)?;

    let body = raw[header_end..].to_vec();
    let declared = match headers.get("content-length") {
        Some(length) => length
            .parse::<usize>()
            .map_err(|_| HttpError::InvalidContentLength(length.to_string()))?,
        None => 0,
    };
    if declared != body.len() {
        return Err(HttpError::InvalidContentLength(body.len().to_string()));
    }

    Ok(ClientRequest {
        method,
        uri,
        path,
        query,
        version,
        headers,
        body,
        chunked,
        client_fd,
        extension: None,
    })
}

/// Where a request currently stands in its framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ReadingHeaders,
    ReadingBody,
    ReadingChunkSize,
    ReadingChunkData,
    ReadingTrailer,
    ContinueSent,
    RequestComplete,
    ChunkComplete,
}

/// Result of feeding the reader.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed.
    Incomplete,
    /// The client waits for `100 Continue` before sending the body.
    SendContinue,
    Complete(ClientRequest),
}

/// Incremental request framer, fed with bytes as they arrive from the socket.
#[derive(Debug)]
pub struct RequestReader {
    buffer: Vec<u8>,
    state: State,
    /// Header block of the current request, kept to rebuild chunked requests.
    head: Vec<u8>,
    body: Vec<u8>,
    content_length: usize,
    chunk_remaining: usize,
    /// State to enter once `100 Continue` has been sent.
    after_continue: State,
    max_body: usize,
    client_fd: RawFd,
}

impl RequestReader {
    /// `max_body` of zero means unlimited.
    pub fn new(max_body: usize, client_fd: RawFd) -> Self {
        Self {
            buffer: Vec::new(),
            state: State::ReadingHeaders,
            head: Vec::new(),
            body: Vec::new(),
            content_length: 0,
            chunk_remaining: 0,
            after_continue: State::ReadingHeaders,
            max_body,
            client_fd,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Start over for the next request, keeping bytes that already arrived for it.
    pub fn reset(&mut self) {
        self.state = State::ReadingHeaders;
        self.head = Vec::new();
        self.body = Vec::new();
        self.content_length = 0;
        self.chunk_remaining = 0;
        self.after_continue = State::ReadingHeaders;
    }

    /// The interim `100 Continue` response has been written out.
    pub fn continue_sent(&mut self) {
        if self.state == State::ContinueSent {
            self.state = self.after_continue;
        }
    }

    fn check_body_size(&self, size: usize) -> Result<(), HttpError> {
        if self.max_body != 0 && size > self.max_body {
            return Err(HttpError::BodyTooLarge {
                limit: self.max_body,
            });
        }
        Ok(())
    }

    /// Take the next CRLF-terminated line out of the buffer, without its CRLF.
    fn take_line(&mut self) -> Result<Option<Vec<u8>>, HttpError> {
        match find(CRLF, &self.buffer) {
            Some(pos) => {
                let mut line: Vec<u8> = self.buffer.drain(..pos + CRLF.len()).collect();
                line.truncate(pos);
                Ok(Some(line))
            }
            None if self.buffer.len() > MAX_CHUNK_LINE => {
                Err(HttpError::BadChunk("line is too long"))
            }
            None => Ok(None),
        }
    }

    /// Advance as far as the buffered bytes allow.
    pub fn poll(&mut self) -> Result<Progress, HttpError> {
        loop {
            match self.state {
                State::ReadingHeaders => {
                    let header_end = match find_header_end(&self.buffer) {
                        Some(header_end) if header_end <= MAX_HEADER_BLOCK => header_end,
                        Some(_) => return Err(HttpError::HeadersTooLarge),
                        None if self.buffer.len() > MAX_HEADER_BLOCK => {
                            return Err(HttpError::HeadersTooLarge)
                        }
                        None => return Ok(Progress::Incomplete),
                    };
                    self.head = self.buffer.drain(..header_end).collect();
                    let info = body_info(&self.head)?;
                    let next = match info.framing {
                        Framing::Empty => {
                            self.state = State::RequestComplete;
                            return self.finish();
                        }
                        Framing::Length(length) => {
                            self.check_body_size(length)?;
                            self.content_length = length;
                            State::ReadingBody
                        }
                        Framing::Chunked => State::ReadingChunkSize,
                    };
                    if info.expect_continue {
                        self.after_continue = next;
                        self.state = State::ContinueSent;
                        return Ok(Progress::SendContinue);
                    }
                    self.state = next;
                }
                State::ReadingBody => {
                    if self.buffer.len() < self.content_length {
                        return Ok(Progress::Incomplete);
                    }
                    self.body = self.buffer.drain(..self.content_length).collect();
                    self.state = State::RequestComplete;
                    return self.finish();
                }
                State::ReadingChunkSize => {
                    let line = match self.take_line()? {
                        Some(line) => line,
                        None => return Ok(Progress::Incomplete),
                    };
                    let size = parse_chunk_size(&line)?;
                    if size.checked_add(CRLF.len()).is_none() {
                        return Err(HttpError::BadChunk("chunk size is too large"));
                    }
                    if size == 0 {
                        self.state = State::ReadingTrailer;
                    } else {
                        self.check_body_size(self.body.len().saturating_add(size))?;
                        self.chunk_remaining = size;
                        self.state = State::ReadingChunkData;
                    }
                }
                State::ReadingChunkData => {
                    let size = self.chunk_remaining;
                    if self.buffer.len() < size + CRLF.len() {
                        return Ok(Progress::Incomplete);
                    }
                    if &self.buffer[size..size + CRLF.len()] != CRLF {
                        return Err(HttpError::BadChunk("missing CRLF after chunk data"));
                    }
                    self.body.extend(self.buffer.drain(..size));
                    self.buffer.drain(..CRLF.len());
                    self.chunk_remaining = 0;
                    self.state = State::ReadingChunkSize;
                }
                State::ReadingTrailer => match self.take_line()? {
                    Some(line) if line.is_empty() => {
                        self.state = State::ChunkComplete;
                        return self.finish();
                    }
                    Some(_) => {}
                    None => return Ok(Progress::Incomplete),
                },
                // Waiting for `continue_sent` or `reset`.
                State::ContinueSent | State::RequestComplete | State::ChunkComplete => {
                    return Ok(Progress::Incomplete)
                }
            }
        }
    }

    /// Hand over the request that just completed.
    fn finish(&mut self) -> Result<Progress, HttpError> {
        let request = if self.state == State::ChunkComplete {
            let raw = reconstruct_chunked(&self.head, &self.body);
            parse_request(&raw, true, self.client_fd)?
        } else {
            let mut raw = std::mem::take(&mut self.head);
            raw.extend_from_slice(&self.body);
            parse_request(&raw, false, self.client_fd)?
        };
        Ok(Progress::Complete(request))
    }
}
