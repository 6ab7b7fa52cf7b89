//! Error kinds a transcode request can fail with.
//!
//! Every variant ends up as the `error` message of a response; none of them
//! escape the worker.

use cell_transcode_proto::EnvelopeError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TranscodeError {
    /// Malformed or unreadable input encoding or image data
    #[error("decode error: {0}")]
    Decode(String),

    /// Locator unreachable or answered with a non-success status
    #[error("fetch error: {0}")]
    Fetch(String),

    /// No drawing surface could be acquired for the target size
    #[error("surface error: {0}")]
    Surface(String),

    /// The target codec rejected the parameters or the content
    #[error("encode error: {0}")]
    Encode(String),

    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

impl TranscodeError {
    /// Stable name of the error kind, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            TranscodeError::Decode(_) => "DecodeError",
            TranscodeError::Fetch(_) => "FetchError",
            TranscodeError::Surface(_) => "SurfaceError",
            TranscodeError::Encode(_) => "EncodeError",
            TranscodeError::UnknownAction(_) => "UnknownActionError",
        }
    }
}

impl From<EnvelopeError> for TranscodeError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::UnknownAction(action) => TranscodeError::UnknownAction(action),
            other => TranscodeError::Decode(format!("malformed request: {other}")),
        }
    }
}
