use sea_orm::DbErr;
use thiserror::Error;

use crate::http::HttpError;

/// Longest response-body excerpt kept in a [`CollectorError::Status`].
const BODY_EXCERPT_LEN: usize = 200;

/// Errors that can abort a collection run.
///
/// Normal termination (end of pagination, skipped items) is never reported
/// through this type; see [`PageOutcome`](super::PageOutcome) and
/// [`ResponseAction`](crate::client::ResponseAction).
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Transport failure after retries were exhausted.
    #[error("HTTP transport error: {0}")]
    Http(#[from] HttpError),

    /// The remote API rejected the credentials.
    #[error("authentication failed (HTTP {status}) for {url}")]
    Unauthorized { status: u16, url: String },

    /// Any other non-success status the response hook did not accept.
    #[error("unexpected HTTP {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// The response body could not be split into records.
    #[error("failed to parse response: {message}")]
    Parse { message: String },

    /// A record's creation time could not be extracted.
    #[error("failed to read record creation time: {message}")]
    CreatedTime { message: String },

    /// Invalid collector arguments (template, table name, params).
    #[error("invalid collector configuration: {message}")]
    Config { message: String },

    /// Persistence failure.
    #[error("database error: {0}")]
    Database(#[from] DbErr),

    /// The async client no longer accepts requests.
    #[error("async client has been released")]
    Released,

    /// The run was cancelled by the caller or by a failing sibling worker.
    #[error("collection cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {message}")]
    Worker { message: String },

    /// An error raised while collecting one fan-out item.
    #[error("input {input}: {source}")]
    Item {
        input: String,
        #[source]
        source: Box<CollectorError>,
    },
}

impl CollectorError {
    #[inline]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    #[inline]
    pub fn created_time(message: impl Into<String>) -> Self {
        Self::CreatedTime {
            message: message.into(),
        }
    }

    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Build a status error, keeping only the start of the body.
    pub fn status(status: u16, url: impl Into<String>, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let body = match text.char_indices().nth(BODY_EXCERPT_LEN) {
            Some((idx, _)) => format!("{}...", &text[..idx]),
            None => text.into_owned(),
        };
        Self::Status {
            status,
            url: url.into(),
            body,
        }
    }

    /// Attach the identity of the fan-out item being collected.
    ///
    /// Cancellation is left bare so callers can match on it directly.
    #[must_use]
    pub fn for_input(self, input: impl Into<String>) -> Self {
        match self {
            Self::Cancelled | Self::Item { .. } => self,
            other => Self::Item {
                input: input.into(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, skipping item annotations.
    #[must_use]
    pub fn root(&self) -> &CollectorError {
        match self {
            Self::Item { source, .. } => source.root(),
            other => other,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled)
    }

    /// Transport failures, throttling and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self.root() {
            Self::Http(HttpError::Transport(_) | HttpError::Timeout(_)) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::parse(err.to_string())
    }
}

/// Extract a short error message suitable for display.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}
