use thiserror::Error;

use crate::resource::ResourceStatus;

/// Errors produced while parsing a resource locator string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    /// The locator string was empty
    #[error("Empty locator")]
    Empty,

    /// A handler delimiter (`//`) was not followed by a handler segment
    #[error("Unterminated handler delimiter in '{0}'")]
    UnterminatedHandler(String),

    /// A handler segment did not match `<type>-<name>[:<args>]`
    #[error("Invalid handler segment '{0}': expected <type>-<name>[:<args>]")]
    InvalidHandler(String),

    /// The URL part has a scheme but no authority or path
    #[error("Invalid url '{0}'")]
    InvalidUrl(String),
}

/// I/O errors raised while fetching the bytes behind a locator.
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Local file could not be opened or read
    #[error("I/O error on {path}: {message}")]
    File { path: String, message: String },

    /// Remote server answered with a non-success status
    #[error("HTTP {status} from {url}")]
    Http { url: String, status: u16 },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// The network transport has been shut down
    #[error("Network transport is shut down")]
    TransportClosed,
}

impl IoError {
    pub(crate) fn file(path: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        IoError::File {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors raised by codec adapters and the tile encoder.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    /// No registered codec claims the blob
    #[error("No codec recognizes '{0}'")]
    UnknownFormat(String),

    /// A codec recognized the blob but failed to decode it
    #[error("{codec} decode failed: {message}")]
    Codec { codec: String, message: String },

    /// Pixel buffer dimensions do not match its data
    #[error("Invalid pixel buffer: {0}")]
    InvalidBuffer(String),

    /// Failed to encode a tile payload
    #[error("Tile encode failed: {0}")]
    Encode(String),
}

/// Errors from the persistent store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// SQLite reported an error
    #[error("SQLite error: {0}")]
    Sqlite(String),

    /// A row id of 0 was passed where a stored row was expected
    #[error("Invalid row id")]
    InvalidRowId,

    /// A stored row could not be interpreted
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Sqlite(err.to_string())
    }
}

/// Errors delivered to callers of the resource manager.
///
/// Every variant maps onto a [`ResourceStatus`] so failures can be persisted
/// next to the resource they belong to.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
    /// The locator string could not be parsed
    #[error("Locator error: {0}")]
    Parse(#[from] LocatorError),

    /// The bytes behind the locator could not be fetched
    #[error("Access error: {0}")]
    Access(#[from] IoError),

    /// No adapter is registered for a handler or scheme
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    /// An adapter was found but failed on this blob
    #[error("Handler '{handler}' failed: {message}")]
    Handler { handler: String, message: String },

    /// Image decode or tile encode failure
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Persistent store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The tile is outside the image's pyramid or was never produced
    #[error("Tile {scale}/{x}/{y} not found for image {image_id}")]
    TileNotFound {
        image_id: i64,
        scale: u32,
        x: u32,
        y: u32,
    },

    /// A resource listing pattern is not a valid glob
    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// The request was aborted before a result was delivered
    #[error("Request aborted")]
    Aborted,

    /// The coordinator stopped before the request could be served
    #[error("Resource manager is shut down")]
    Shutdown,
}

impl ResourceError {
    pub(crate) fn handler(handler: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ResourceError::Handler {
            handler: handler.into(),
            message: err.to_string(),
        }
    }

    /// Status recorded for a resource that failed with this error.
    pub fn status(&self) -> ResourceStatus {
        match self {
            ResourceError::Parse(_) | ResourceError::Access(_) => ResourceStatus::AccessError,
            ResourceError::UnknownHandler(_) => ResourceStatus::UnknownHandler,
            ResourceError::Handler { .. } | ResourceError::Decode(_) => {
                ResourceStatus::HandlerError
            }
            ResourceError::Store(_)
            | ResourceError::TileNotFound { .. }
            | ResourceError::InvalidPattern { .. }
            | ResourceError::Aborted
            | ResourceError::Shutdown => ResourceStatus::Unknown,
        }
    }

    /// Whether a failure with this error should be written to the store.
    ///
    /// Access errors are often transient (network, missing mount) and are
    /// retried on the next request instead of being recorded.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self.status(),
            ResourceStatus::UnknownHandler | ResourceStatus::HandlerError
        )
    }
}
