use thiserror::Error;

/// Errors produced by the streaming pipeline and its image sources.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Connection-level failure; worth retrying.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered, but with a status that may clear up (5xx, 429).
    #[error("server returned {status} for {url}")]
    ServerBusy { status: u16, url: String },

    /// The data arrived but could not be decoded into pixels.
    #[error("malformed image data for frame {frame}: {reason}")]
    Decode { frame: usize, reason: String },

    /// The frame could not be fetched after exhausting all retries, or the
    /// source refused it permanently.
    #[error("frame {frame} unavailable: {reason}")]
    Unavailable { frame: usize, reason: String },

    /// The server refused a request permanently (4xx other than 429).
    #[error("server refused {url} with {status}")]
    Rejected { status: u16, url: String },

    #[error("frame {frame} out of range (series has {count} frames)")]
    InvalidFrame { frame: usize, count: usize },

    #[error("resolution level {level} out of range for frame {frame}")]
    InvalidLevel { frame: usize, level: usize },

    #[error("invalid metadata: {0}")]
    Metadata(String),

    #[error("stream has already been abolished")]
    Abolished,

    #[error("image source already attached")]
    AlreadyAttached,

    #[error("no image source attached")]
    NotAttached,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StreamError {
    /// Whether the reader should retry the request that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Network(_) | StreamError::ServerBusy { .. })
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            if status.is_server_error() || status.as_u16() == 429 {
                return StreamError::ServerBusy {
                    status: status.as_u16(),
                    url,
                };
            }
            return StreamError::Rejected {
                status: status.as_u16(),
                url,
            };
        }
        StreamError::Network(err.to_string())
    }
}

pub type Result<T, E = StreamError> = std::result::Result<T, E>;
