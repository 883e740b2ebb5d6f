use crate::types::MessageId;

/// Failures while talking to the backend or reading local attachment files.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("invalid backend URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("{0} returned no response body")]
    MissingBody(String),

    #[error("unexpected response from {endpoint}: {reason}")]
    Schema { endpoint: String, reason: String },

    #[error("{operation} is not available on the {routes} route set")]
    Unsupported {
        operation: &'static str,
        routes: &'static str,
    },

    #[error("failed to read attachment {path}: {source}")]
    Attachment {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream read failed: {0}")]
    Stream(String),
}

/// Message store contract violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    NotFound(MessageId),

    #[error("message {0} is already receiving a stream")]
    AlreadyInFlight(MessageId),

    #[error("message {0} is not receiving a stream")]
    NotInFlight(MessageId),

    #[error("duplicate message id {0}")]
    Duplicate(MessageId),
}

/// Submission-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Empty text and no attachments. Ignored silently by callers.
    #[error("nothing to submit")]
    Validation,

    #[error("could not extract {file}: {source}")]
    Extraction {
        file: String,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to save assistant message: {0}")]
    Persistence(#[source] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ChatResult<T> = Result<T, ChatError>;
