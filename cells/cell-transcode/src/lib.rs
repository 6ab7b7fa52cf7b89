//! pixelcell transcode cell
//!
//! Decodes base64 payloads and resizes/re-encodes images on behalf of a host.
//! The `pxc-cell-transcode` binary serves this over stdin/stdout; hosts that
//! prefer threads can run a [`WorkerRuntime`] in-process instead.

pub mod codec;
pub mod config;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod runtime;

pub use config::WorkerConfig;
pub use error::TranscodeError;
pub use pipeline::TranscodePipeline;
pub use runtime::WorkerRuntime;
