use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use crate::request::Version;

pub const SERVER_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/javascript  js",
    "application/json        json",
    "application/pdf         pdf",
    "application/zip         zip",
    "image/gif               gif",
    "image/jpeg              jpeg jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/plain              txt",
];

/// The interim response sent before reading a body the client is holding back.
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Reason phrase for a status code, from the IANA status code registry.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        422 => "Unprocessable Content",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => "Unknown",
    }
}

/// A response waiting to be serialized onto a connection.
///
/// `Date`, `Server`, `Content-Length` and the connection headers are added by [`serialize`], so
/// `headers` only holds what the handler decided.
///
/// [`serialize`]: Response::serialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Always HTTP/1.1; HTTP/1.0 clients accept it.
    pub version: Version,
    pub status: u16,
    /// Overrides the registered reason phrase, as a CGI `Status:` line may.
    pub reason: Option<String>,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            version: Version::Http11,
            status,
            reason: None,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| reason_phrase(self.status))
    }

    /// Generated HTML page.
    pub fn html(status: u16, body: String) -> Self {
        Self::new(status)
            .with_header("Content-Type", HTML_CONTENT_TYPE)
            .with_body(body.into_bytes())
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Set a header, replacing any value it already had.
    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(header) => header.1 = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Render status line, headers and body. `keep_alive` carries the idle timeout when the
    /// connection stays open afterwards.
    pub fn serialize(&self, now: SystemTime, keep_alive: Option<Duration>) -> Vec<u8> {
        let mut head = format!(
            "{} {} {}\r\n\
            Date: {}\r\n\
            Server: {}\r\n",
            self.version.as_str(),
            self.status,
            self.reason(),
            HttpDate(now),
            SERVER_NAME,
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str(&keep_alive_header(keep_alive));
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn keep_alive_header(keep_alive: Option<Duration>) -> String {
    match keep_alive {
        None => "Connection: close\r\n".to_string(),
        Some(timeout) => format!(
            "Connection: keep-alive\r\nKeep-Alive: timeout={}\r\n",
            timeout.as_secs()
        ),
    }
}

/// Maps file extensions to content types.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    default_mimetype: String,
}

impl MimeMap {
    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return,
        };
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Get content type for a file.
    pub fn content_type(&self, path: &Path) -> &str {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(|extension| self.mimetypes.get(&extension.to_ascii_lowercase()))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// "Generated by" footer of generated pages.
pub struct GeneratedOn(pub SystemTime);

impl fmt::Display for GeneratedOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Generated by {} on {}", SERVER_NAME, HttpDate(self.0))
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}
