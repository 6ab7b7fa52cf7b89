//! Worker runtime: turns request envelopes into exactly one response each.
//!
//! Requests run as local tasks on a single-threaded executor, so they
//! interleave only where a fetch, decode or encode yields. Nothing a request
//! does, including panicking, can stop the worker from answering the next one.

use std::any::Any;
use std::io;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;

use cell_transcode_proto::{RequestEnvelope, RequestId, Response};
use cellwire::{read_frame, write_frame};
use futures::FutureExt;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::error::TranscodeError;
use crate::pipeline::TranscodePipeline;

pub struct WorkerRuntime {
    pipeline: TranscodePipeline,
}

impl WorkerRuntime {
    pub fn new(config: &WorkerConfig) -> Result<Self, TranscodeError> {
        Ok(Self {
            pipeline: TranscodePipeline::new(config)?,
        })
    }

    /// Process one request. Always produces a response carrying the
    /// request's id.
    pub async fn handle(&self, request: RequestEnvelope) -> Response {
        let (id, action) = request.into_parts();

        let action = match action {
            Ok(action) => action,
            Err(e) => return failed(id, TranscodeError::from(e)),
        };
        let name = action.name();

        match AssertUnwindSafe(self.pipeline.run(action))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => {
                debug!(%id, action = name, len = output.binary().len(), "request completed");
                Response::success(id, output)
            }
            Ok(Err(e)) => failed(id, e),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(%id, action = name, panic = %message, "request panicked");
                Response::failure(id, format!("internal error: {message}"))
            }
        }
    }

    /// Process one raw JSON frame.
    ///
    /// A frame that is not a valid request is answered with a decode error
    /// when an `id` can still be read from it, and dropped otherwise.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<Response> {
        match parse_frame(frame) {
            Ok(request) => Some(self.handle(request).await),
            Err(salvaged) => salvaged,
        }
    }

    /// Serve requests from `requests` until it closes, then finish whatever
    /// is still in flight.
    ///
    /// Must run inside a [`LocalSet`].
    pub async fn serve(
        self: Rc<Self>,
        mut requests: mpsc::Receiver<RequestEnvelope>,
        responses: mpsc::Sender<Response>,
    ) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    let runtime = Rc::clone(&self);
                    let responses = responses.clone();
                    tasks.spawn_local(async move {
                        let response = runtime.handle(request).await;
                        if responses.send(response).await.is_err() {
                            debug!("response channel closed, dropping response");
                        }
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "request task failed");
                    }
                }
            }
        }

        debug!(in_flight = tasks.len(), "request channel closed, draining");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "request task failed");
            }
        }
    }

    /// Serve length-prefixed JSON frames from `reader`, writing response
    /// frames to `writer`. Returns once the input ends and every response
    /// has been written. A failed read ends the input like EOF; its error is
    /// returned only after the requests already read have been answered.
    ///
    /// Must run inside a [`LocalSet`].
    pub async fn serve_stream<R, W>(self: Rc<Self>, mut reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (request_tx, request_rx) = mpsc::channel::<RequestEnvelope>(64);
        let (response_tx, mut response_rx) = mpsc::channel::<Response>(64);

        let salvage_tx = response_tx.clone();
        let read = async move {
            let result = loop {
                let frame = match read_frame(&mut reader).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break Ok(()),
                    Err(e) => {
                        warn!(error = %e, "failed to read request frame");
                        break Err(e);
                    }
                };
                let outcome = match parse_frame(&frame) {
                    Ok(request) => request_tx.send(request).await.is_ok(),
                    Err(Some(response)) => salvage_tx.send(response).await.is_ok(),
                    Err(None) => true,
                };
                if !outcome {
                    break Ok(());
                }
            };
            // Closing the senders lets `serve` drain what was already read
            drop(request_tx);
            drop(salvage_tx);
            debug!("input closed");
            result
        };

        let serve = self.serve(request_rx, response_tx);

        let write = async move {
            while let Some(response) = response_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &response).await {
                    if e.kind() != io::ErrorKind::InvalidData {
                        return Err(e);
                    }
                    warn!(id = %response.id, error = %e, "response too large to frame");
                    let fallback = failed(
                        response.id,
                        TranscodeError::Encode(format!("response could not be framed: {e}")),
                    );
                    write_frame(&mut writer, &fallback).await?;
                }
            }
            Ok::<_, io::Error>(())
        };

        let (read_result, (), write_result) = tokio::join!(read, serve, write);
        write_result?;
        read_result
    }

    /// Run this worker on its own OS thread with a single-threaded runtime.
    ///
    /// The thread exits once `requests` is closed and the in-flight requests
    /// are answered.
    pub fn spawn_thread(
        self,
        name: impl Into<String>,
        requests: mpsc::Receiver<RequestEnvelope>,
        responses: mpsc::Sender<Response>,
    ) -> io::Result<std::thread::JoinHandle<()>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let name = name.into();

        std::thread::Builder::new().name(name.clone()).spawn(move || {
            info!(worker = %name, "worker started");
            let local = LocalSet::new();
            local.block_on(&runtime, Rc::new(self).serve(requests, responses));
            info!(worker = %name, "worker stopped");
        })
    }
}

fn failed(id: RequestId, error: TranscodeError) -> Response {
    warn!(%id, kind = error.kind(), error = %error, "request failed");
    Response::failure(id, error.to_string())
}

#[derive(Deserialize)]
struct IdOnly {
    id: RequestId,
}

fn parse_frame(frame: &[u8]) -> Result<RequestEnvelope, Option<Response>> {
    serde_json::from_slice::<RequestEnvelope>(frame).map_err(|e| {
        match serde_json::from_slice::<IdOnly>(frame) {
            Ok(IdOnly { id }) => Some(failed(
                id,
                TranscodeError::Decode(format!("malformed request: {e}")),
            )),
            Err(_) => {
                warn!(error = %e, len = frame.len(), "dropping request without a readable id");
                None
            }
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
