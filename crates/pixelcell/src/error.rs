use std::path::PathBuf;

use cell_transcode::TranscodeError;
use cellwire::RequestError;

/// Failure to start a worker
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start worker: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to initialise worker: {0}")]
    Worker(#[from] TranscodeError),

    #[error("cell process has no {0} pipe")]
    MissingPipe(&'static str),

    #[error("cell binary `{binary}` not found (searched {searched:?})")]
    CellNotFound {
        binary: &'static str,
        searched: Vec<PathBuf>,
    },

    #[error("a worker pool needs at least one worker")]
    NoWorkers,
}

/// Failure of a typed client call
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The worker answered with an error response
    #[error("{0}")]
    Worker(String),

    #[error("worker answered a {expected} request with a different kind of result")]
    UnexpectedOutput { expected: &'static str },
}
