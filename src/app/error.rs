use std::error::Error as StdError;
use std::io;

/// Why a single transport call failed before any HTTP status was seen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Connection and timeout errors are worth another attempt; anything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connect(_) | TransportError::Timeout(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(err.to_string())
        } else if err.is_connect() || ((err.is_request() || err.is_body()) && is_connection_dropped(&err)) {
            TransportError::Connect(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// The peer reset, aborted or closed the connection before a full response arrived.
fn is_connection_dropped(err: &(dyn StdError + 'static)) -> bool {
    let mut cause = Some(err);
    while let Some(e) = cause {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_incomplete_message() || h.is_closed() {
                return true;
            }
        }
        cause = e.source();
    }
    false
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchErrorKind {
    /// Non-retryable HTTP status, raised on first sight.
    #[error("http {0}")]
    Status(u16),
    /// Every attempt ended in a retryable outcome.
    #[error("gave up after {attempts} attempts")]
    Exhausted { attempts: u32 },
    /// Non-retryable transport failure.
    #[error("transport error")]
    Transport,
    /// The run was cancelled before or while fetching.
    #[error("cancelled")]
    Cancelled,
}

/// Terminal failure of one page fetch.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} fetching {url}: {cause}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub cause: String,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, url: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            cause: cause.into(),
        }
    }

    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::new(FetchErrorKind::Cancelled, url, "run cancelled")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FetchErrorKind::Cancelled
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("history log: {0}")]
    History(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RunError>;
