//! Typed calls over a connection to one worker.

use std::time::Duration;

use cell_transcode_proto::{
    BinaryObject, DECODE_BINARY, Output, RequestEnvelope, Response, Source, TRANSCODE_IMAGE,
    TranscodeOptions,
};
use cellwire::RequestError;

use crate::error::ClientError;
use crate::spawn::TranscodeConnection;

/// A transcoded image: the encoded bytes and the same bytes as base64
#[derive(Debug, Clone, PartialEq)]
pub struct Transcoded {
    pub binary: BinaryObject,
    pub text: String,
}

#[derive(Clone)]
pub struct TranscodeClient {
    conn: TranscodeConnection,
    timeout: Option<Duration>,
}

impl TranscodeClient {
    pub fn new(conn: TranscodeConnection) -> Self {
        Self {
            conn,
            timeout: None,
        }
    }

    /// Apply `timeout` to every call made through [`TranscodeClient::send`].
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connection(&self) -> &TranscodeConnection {
        &self.conn
    }

    /// A fresh request id, unique on this client's connection
    pub fn next_id(&self) -> String {
        self.conn.next_id()
    }

    pub fn in_flight(&self) -> usize {
        self.conn.in_flight()
    }

    /// Send a raw envelope and wait for its response.
    ///
    /// Worker-side failures arrive as error responses, not as `Err`; `Err`
    /// means no response will ever arrive for this request.
    pub async fn send(&self, request: RequestEnvelope) -> Result<Response, RequestError> {
        match self.timeout {
            Some(timeout) => self.conn.request_timeout(request, timeout).await,
            None => self.conn.request(request).await,
        }
    }

    pub async fn send_timeout(
        &self,
        request: RequestEnvelope,
        timeout: Duration,
    ) -> Result<Response, RequestError> {
        self.conn.request_timeout(request, timeout).await
    }

    /// Decode base64 (optionally a data URI) into a binary object.
    pub async fn decode_binary(
        &self,
        data: impl Into<String>,
        content_type: Option<String>,
    ) -> Result<BinaryObject, ClientError> {
        let request = RequestEnvelope::decode_binary(self.next_id(), data, content_type);
        match self.send(request).await?.result {
            Ok(Output::Decoded { binary }) => Ok(binary),
            Ok(_) => Err(ClientError::UnexpectedOutput {
                expected: DECODE_BINARY,
            }),
            Err(message) => Err(ClientError::Worker(message)),
        }
    }

    /// Fit an image inside `options`' bounds and re-encode it.
    pub async fn transcode_image(
        &self,
        source: Source,
        options: &TranscodeOptions,
    ) -> Result<Transcoded, ClientError> {
        let request = RequestEnvelope::transcode_image(self.next_id(), source, options);
        match self.send(request).await?.result {
            Ok(Output::Transcoded { binary, text }) => Ok(Transcoded { binary, text }),
            Ok(_) => Err(ClientError::UnexpectedOutput {
                expected: TRANSCODE_IMAGE,
            }),
            Err(message) => Err(ClientError::Worker(message)),
        }
    }
}
