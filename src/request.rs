use std::fmt;
use std::os::unix::io::RawFd;
use std::str::FromStr;

/// Methods the server knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// Request headers, names lower-cased at insertion, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Add a header. Returns false if a header with the same name is already present.
    pub fn insert(&mut self, name: &str, value: &str) -> bool {
        let name = name.to_ascii_lowercase();
        if self.contains(&name) {
            return false;
        }
        self.0.push((name, value.to_string()));
        true
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A fully received and parsed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub method: Method,
    /// Request target exactly as sent.
    pub uri: String,
    /// Percent-decoded path without the query string.
    pub path: String,
    /// Query string, still encoded.
    pub query: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// The body arrived chunked and was reassembled.
    pub chunked: bool,
    pub client_fd: RawFd,
    /// Script extension, set when the request is handed to a CGI interpreter.
    pub extension: Option<String>,
}

impl ClientRequest {
    /// Whether the client wants the connection kept open after this request.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self.headers.get("connection").map(str::to_ascii_lowercase);
        match (self.version, connection.as_deref()) {
            (_, Some("close")) => false,
            (Version::Http11, _) => true,
            (Version::Http10, Some("keep-alive")) => true,
            (Version::Http10, _) => false,
        }
    }
}
