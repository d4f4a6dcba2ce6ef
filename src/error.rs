use thiserror::Error;

/// Why a request could not be read or understood.
///
/// Every variant maps onto the status code sent back to the client; the connection is closed once
/// that response has been delivered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed request line: {0}")]
    BadRequestLine(&'static str),
    #[error("malformed header: {0}")]
    BadHeader(&'static str),
    #[error("duplicate header `{0}`")]
    DuplicateHeader(String),
    #[error("missing Host header")]
    MissingHost,
    #[error("both Content-Length and Transfer-Encoding are present")]
    ConflictingFraming,
    #[error("invalid Content-Length `{0}`")]
    InvalidContentLength(String),
    #[error("malformed chunked body: {0}")]
    BadChunk(&'static str),
    #[error("request header block is too large")]
    HeadersTooLarge,
    #[error("request body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },
    #[error("method `{0}` is not implemented")]
    MethodNotImplemented(String),
    #[error("transfer encoding `{0}` is not implemented")]
    EncodingNotImplemented(String),
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            Self::BodyTooLarge { .. } => 413,
            Self::MethodNotImplemented(_) | Self::EncodingNotImplemented(_) => 501,
            _ => 400,
        }
    }
}
