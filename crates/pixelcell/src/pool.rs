//! A fixed set of workers with round-robin assignment.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use cell_transcode_proto::{BinaryObject, RequestEnvelope, Response, Source, TranscodeOptions};
use cellwire::RequestError;
use tracing::info;

use crate::client::{TranscodeClient, Transcoded};
use crate::config::PoolConfig;
use crate::error::{ClientError, SpawnError};
use crate::spawn::{find_cell_binary, spawn_cell_process, spawn_in_process};

/// Independent workers sharing no state. Each request goes to exactly one.
#[derive(Clone)]
pub struct WorkerPool {
    clients: Arc<[TranscodeClient]>,
    next: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Wrap already-connected clients.
    pub fn from_clients(clients: Vec<TranscodeClient>) -> Result<Self, SpawnError> {
        if clients.is_empty() {
            return Err(SpawnError::NoWorkers);
        }
        Ok(Self {
            clients: clients.into(),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Start `config.workers` worker threads in this process.
    pub fn in_process(config: &PoolConfig) -> Result<Self, SpawnError> {
        let clients = (0..config.workers)
            .map(|n| {
                let conn = spawn_in_process(&config.worker, &format!("pixelcell-worker-{n}"))?;
                Ok(TranscodeClient::new(conn).with_timeout(config.request_timeout))
            })
            .collect::<Result<Vec<_>, SpawnError>>()?;
        info!(workers = clients.len(), "started in-process worker pool");
        Self::from_clients(clients)
    }

    /// Start `config.workers` transcode cell processes.
    pub fn processes(config: &PoolConfig) -> Result<Self, SpawnError> {
        let binary = find_cell_binary(config.cell_path.as_deref())?;
        let clients = (0..config.workers)
            .map(|_| {
                let conn = spawn_cell_process(&binary, &config.worker)?;
                Ok(TranscodeClient::new(conn).with_timeout(config.request_timeout))
            })
            .collect::<Result<Vec<_>, SpawnError>>()?;
        info!(workers = clients.len(), cell = %binary.display(), "started cell process pool");
        Self::from_clients(clients)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The worker the next request goes to
    fn pick(&self) -> &TranscodeClient {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.clients[n % self.clients.len()]
    }

    /// A fresh request id, unique within this pool
    pub fn next_id(&self) -> String {
        // Ids carry a process-unique connection prefix
        self.clients[0].next_id()
    }

    /// Requests waiting for a response, across all workers
    pub fn in_flight(&self) -> usize {
        self.clients.iter().map(TranscodeClient::in_flight).sum()
    }

    pub async fn send(&self, request: RequestEnvelope) -> Result<Response, RequestError> {
        self.pick().send(request).await
    }

    pub async fn send_timeout(
        &self,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        self.pick().send_timeout(request, timeout).await
    }

    pub async fn decode_binary(
        &self,
        data: impl Into<String>,
        content_type: Option<String>,
    ) -> Result<BinaryObject, ClientError> {
        self.pick().decode_binary(data, content_type).await
    }

    pub async fn transcode_image(
        &self,
        source: Source,
        options: &TranscodeOptions,
    ) -> Result<Transcoded, ClientError> {
        self.pick().transcode_image(source, options).await
    }
}
