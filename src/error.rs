//! Crate-wide error types

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top level error taxonomy, one variant per class in the component design (spec §7)
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure or timeout talking to a provider
    #[error("network error: {0}")]
    Network(String),

    /// A provider has rate-limited this process
    #[error("rate limited by {provider}, retry at {next_retry_at}")]
    RateLimited {
        provider: String,
        next_retry_at: chrono::DateTime<chrono::Utc>,
    },

    /// Malformed XOR/zlib packet stream
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Malformed protobuf, binary packet, or WMTS XML
    #[error("parse error in {0}")]
    Parse(String),

    /// A tile could not be obtained after all epoch and zoom fallbacks
    #[error("tile {tile} unavailable for date {date:?}")]
    TileUnavailable { tile: String, date: Option<String> },

    /// Persistent cache failure
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Quadtree traversal failed while locating a packet node
    #[error("traversal error: {0}")]
    Traversal(#[from] TraversalError),

    /// Ill-formed input at a boundary (bad bbox, zoom out of range, unknown date)
    #[error("validation error: {0}")]
    Validation(String),

    /// HTTP client error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// XML parsing error (WMTS capabilities)
    #[error("xml error: {0}")]
    Xml(String),

    /// TIFF encoding error
    #[error("tiff error: {0}")]
    Tiff(String),

    /// Image decode/encode error
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    /// Generic error, used sparingly at integration seams
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a `Network` error from a displayable cause
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Error::Network(msg.into())
    }

    /// Build a `Parse` error naming the thing that failed to parse
    pub fn parse<S: Into<String>>(where_: S) -> Self {
        Error::Parse(where_.into())
    }

    /// Build a `Validation` error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    /// Build a `Tiff` error
    pub fn tiff<S: Into<String>>(msg: S) -> Self {
        Error::Tiff(msg.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<quick_xml::DeError> for Error {
    fn from(err: quick_xml::DeError) -> Self {
        Error::Xml(err.to_string())
    }
}

/// Codec-layer failures (XOR decrypt / zlib decompress framing, §4.1)
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload shorter than the 8 byte compression header")]
    Short,
    #[error("zlib stream malformed: {0}")]
    BadZlib(String),
    #[error("decompressed size mismatch: header said {expected}, got {actual}")]
    SizeMismatch { expected: u32, actual: usize },
}

/// Cache-layer failures (§4.9)
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("invalid tile coordinates z={z} x={x} y={y}")]
    InvalidCoords { z: u8, x: u32, y: u32 },
    #[error("path traversal rejected: {0}")]
    PathTraversal(String),
    #[error("cache io error: {0}")]
    Io(String),
    #[error("cache index corrupt: {0}")]
    IndexCorrupt(String),
}

/// Quadtree packet traversal failures (§4.7)
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TraversalError {
    #[error("packet missing at path {0}")]
    PacketMissing(String),
    #[error("no node at path {0}")]
    NodeMissingAtPath(String),
    #[error("network failure during traversal: {0}")]
    Network(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Codec(CodecError::Short);
        assert_eq!(err.to_string(), "codec error: payload shorter than the 8 byte compression header");

        let err = Error::Cache(CacheError::InvalidCoords { z: 40, x: 0, y: 0 });
        assert!(err.to_string().contains("z=40"));
    }
}
