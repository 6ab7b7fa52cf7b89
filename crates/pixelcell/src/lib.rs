//! pixelcell: image transcoding off the caller's thread.
//!
//! A [`WorkerPool`] owns a set of isolated transcode workers, either threads
//! in this process or `pxc-cell-transcode` child processes. Requests are
//! correlated by id, so responses may come back in any order.

pub mod client;
pub mod config;
pub mod error;
pub mod pool;
pub mod spawn;

pub use cell_transcode::WorkerConfig;
pub use cell_transcode_proto::{
    BinaryObject, Output, OutputFormat, RequestEnvelope, RequestId, Response, Source,
    TranscodeOptions,
};
pub use client::{TranscodeClient, Transcoded};
pub use config::PoolConfig;
pub use error::{ClientError, SpawnError};
pub use pool::WorkerPool;
pub use spawn::{
    TranscodeConnection, find_cell_binary, spawn_cell_process, spawn_in_process,
};
