//! Stream transport for separate-process cells
//!
//! Works over any AsyncRead + AsyncWrite (child stdio, Unix sockets, pipes, etc.)

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{Connection, Correlated, encode_frame, read_frame};

/// Run a connection over a byte stream.
///
/// This spawns two tasks:
/// - One to write outgoing requests as frames
/// - One to read response frames and hand them to their waiters
///
/// When the reader sees the end of the stream the connection is closed and
/// every request still in flight resolves with `Cancelled`.
pub fn run<Req, Resp, R, W>(mut reader: R, mut writer: W) -> Connection<Req, Resp>
where
    Req: Correlated + Serialize + Send + 'static,
    Resp: Correlated + DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (conn, mut outgoing_rx) = Connection::<Req, Resp>::new(64);

    // Spawn writer task. It ends once every `Connection` handle is dropped.
    let writer_conn = conn.downgrade();
    tokio::spawn(async move {
        while let Some(request) = outgoing_rx.recv().await {
            // Only owned bytes are held across the writes below
            let id = request.correlation_id().to_owned();
            let frame = encode_frame(&request);
            drop(request);

            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    // Only this request is unencodable; the stream is still usable
                    warn!(%id, error = %e, "failed to encode request frame");
                    match writer_conn.upgrade() {
                        Some(conn) => {
                            conn.abandon(&id);
                            continue;
                        }
                        None => break,
                    }
                }
            };

            if let Err(e) = write_encoded(&mut writer, &frame).await {
                warn!(%id, error = %e, "failed to write request frame");
                if let Some(conn) = writer_conn.upgrade() {
                    conn.close();
                }
                break;
            }
        }
    });

    // Spawn reader task
    let reader_conn = conn.downgrade();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match serde_json::from_slice::<Resp>(&frame) {
                    Ok(response) => {
                        let Some(conn) = reader_conn.upgrade() else {
                            debug!("all handles dropped, discarding response");
                            break;
                        };
                        conn.handle_incoming(response);
                    }
                    Err(e) => {
                        warn!(error = %e, len = frame.len(), "dropping undecodable response frame");
                    }
                },
                Ok(None) => {
                    debug!("peer closed the stream");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read response frame");
                    break;
                }
            }
        }
        if let Some(conn) = reader_conn.upgrade() {
            conn.close();
        }
    });

    conn
}

async fn write_encoded<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestError, write_frame};
    use serde::Deserialize;
    use std::cell::Cell;
    use tokio::io::duplex;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Msg {
        id: String,
        body: String,
    }

    impl Correlated for Msg {
        fn correlation_id(&self) -> &str {
            &self.id
        }
    }

    #[tokio::test]
    async fn test_stream_transport() {
        // Create a bidirectional pipe
        let (client_stream, server_stream) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (mut server_read, mut server_write) = tokio::io::split(server_stream);

        let client: Connection<Msg, Msg> = run(client_read, client_write);

        // Server echoes with a prefix, answering pairs in reverse order
        tokio::spawn(async move {
            let mut held: Option<Msg> = None;
            while let Some(frame) = read_frame(&mut server_read).await.unwrap() {
                let req: Msg = serde_json::from_slice(&frame).unwrap();
                match held.take() {
                    None => held = Some(req),
                    Some(first) => {
                        for r in [req, first] {
                            let reply = Msg {
                                id: r.id,
                                body: format!("echo: {}", r.body),
                            };
                            write_frame(&mut server_write, &reply).await.unwrap();
                        }
                    }
                }
            }
        });

        let r1 = client.request(Msg {
            id: client.next_id(),
            body: "one".into(),
        });
        let r2 = client.request(Msg {
            id: client.next_id(),
            body: "two".into(),
        });
        let (resp1, resp2) = tokio::join!(r1, r2);
        assert_eq!(resp1.unwrap().body, "echo: one");
        assert_eq!(resp2.unwrap().body, "echo: two");
    }

    #[tokio::test]
    async fn test_peer_hangup_cancels_in_flight() {
        let (client_stream, server_stream) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (mut server_read, server_write) = tokio::io::split(server_stream);

        let client: Connection<Msg, Msg> = run(client_read, client_write);

        // Server reads one request, then hangs up without answering
        let server = tokio::spawn(async move {
            let _ = read_frame(&mut server_read).await;
            drop(server_write);
        });

        let result = client
            .request(Msg {
                id: "lost".into(),
                body: "hello?".into(),
            })
            .await;
        server.await.unwrap();
        assert!(matches!(result, Err(RequestError::Cancelled)));
        assert!(client.is_closed());
    }

    /// Sendable but not shareable across threads
    #[derive(Debug, Serialize)]
    struct Tally {
        id: String,
        hits: Cell<u32>,
    }

    impl Correlated for Tally {
        fn correlation_id(&self) -> &str {
            &self.id
        }
    }

    #[tokio::test]
    async fn test_requests_need_not_be_sync() {
        let (client_stream, server_stream) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_stream);
        let (mut server_read, mut server_write) = tokio::io::split(server_stream);

        let client: Connection<Tally, Msg> = run(client_read, client_write);

        tokio::spawn(async move {
            while let Some(frame) = read_frame(&mut server_read).await.unwrap() {
                let req: serde_json::Value = serde_json::from_slice(&frame).unwrap();
                let reply = Msg {
                    id: req["id"].as_str().unwrap().to_string(),
                    body: format!("hits={}", req["hits"]),
                };
                write_frame(&mut server_write, &reply).await.unwrap();
            }
        });

        let resp = client
            .request(Tally {
                id: "t1".into(),
                hits: Cell::new(3),
            })
            .await
            .unwrap();
        assert_eq!(resp.body, "hits=3");
    }
}
