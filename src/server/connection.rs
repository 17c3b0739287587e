//! Per-connection worker.
//!
//! Each accepted connection gets one worker task that reads framed
//! requests, dispatches them through the gateway, and writes exactly one
//! reply per accepted request. The worker owns this connection's device
//! grants; nothing outside the task ever sees them. When the loop exits,
//! for any reason, session-scoped grants are reverted best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

use crate::gateway::{device_id, DriverOpsGateway};
use crate::protocol::codec::HEADER_SIZE;
use crate::protocol::{Message, ProtocolError};

/// A driver install owed to this connection.
///
/// `auto_revoke` is true only for session installs; those are removed again
/// when the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGrant {
    pub vid: u16,
    pub pid: u16,
    pub auto_revoke: bool,
}

enum ReadOutcome {
    Message(Message),
    /// Peer closed the connection cleanly.
    Closed,
    /// Malformed envelope; close with no reply.
    Protocol(ProtocolError),
    Io(std::io::Error),
}

pub(crate) struct ConnectionWorker {
    stream: UnixStream,
    gateway: Arc<DriverOpsGateway>,
    shutdown: CancellationToken,
    conn_id: u64,
    grants: HashMap<(u16, u16), DeviceGrant>,
}

impl ConnectionWorker {
    pub(crate) fn new(
        stream: UnixStream,
        gateway: Arc<DriverOpsGateway>,
        shutdown: CancellationToken,
        conn_id: u64,
    ) -> Self {
        Self {
            stream,
            gateway,
            shutdown,
            conn_id,
            grants: HashMap::new(),
        }
    }

    /// Serves the connection until the peer disconnects, a protocol or I/O
    /// error occurs, or the server shuts down. Requests are strictly
    /// sequential: one read, one dispatch, one reply.
    pub(crate) async fn run(mut self) {
        loop {
            let outcome = tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    tracing::debug!(conn = self.conn_id, "Server shutting down, closing connection");
                    break;
                }

                outcome = read_frame(&mut self.stream) => outcome,
            };

            let message = match outcome {
                ReadOutcome::Message(message) => message,
                ReadOutcome::Closed => {
                    tracing::debug!(conn = self.conn_id, "Peer disconnected");
                    break;
                }
                ReadOutcome::Protocol(e) => {
                    tracing::warn!(conn = self.conn_id, error = %e, "Bad message, closing connection");
                    break;
                }
                ReadOutcome::Io(e) => {
                    tracing::warn!(conn = self.conn_id, error = %e, "Read failed, closing connection");
                    break;
                }
            };

            let status = match self.dispatch(message).await {
                Some(status) => status,
                // a reply frame from a client is a protocol violation
                None => {
                    tracing::warn!(conn = self.conn_id, "Unexpected reply frame from peer");
                    break;
                }
            };

            let reply = Message::Reply { status }.encode();
            if let Err(e) = self.write_reply(&reply).await {
                tracing::warn!(conn = self.conn_id, error = %e, "Write failed, closing connection");
                break;
            }
        }

        self.revoke_session_grants().await;
    }

    /// Runs one request through the gateway and updates the grant set.
    /// Returns `None` for frames a client must not send.
    async fn dispatch(&mut self, message: Message) -> Option<bool> {
        match message {
            Message::Install { vid, pid } | Message::SessionInstall { vid, pid } => {
                let auto_revoke = matches!(message, Message::SessionInstall { .. });
                tracing::info!(
                    conn = self.conn_id,
                    device = %device_id(vid, pid),
                    session = auto_revoke,
                    "Install requested"
                );
                let status = self.gateway.install(vid, pid).await;
                if status {
                    self.grants.insert(
                        (vid, pid),
                        DeviceGrant {
                            vid,
                            pid,
                            auto_revoke,
                        },
                    );
                }
                Some(status)
            }
            Message::Remove { vid, pid } => {
                tracing::info!(
                    conn = self.conn_id,
                    device = %device_id(vid, pid),
                    "Remove requested"
                );
                let status = self.gateway.remove(vid, pid).await;
                if status {
                    self.grants.remove(&(vid, pid));
                }
                Some(status)
            }
            Message::Reply { .. } => None,
        }
    }

    async fn write_reply(&mut self, reply: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(reply).await?;
        self.stream.flush().await
    }

    /// Best-effort removal of every session-scoped grant. Errors are
    /// logged, not propagated; the connection is going away regardless.
    async fn revoke_session_grants(&mut self) {
        for grant in self.grants.values().filter(|g| g.auto_revoke) {
            tracing::info!(
                conn = self.conn_id,
                device = %device_id(grant.vid, grant.pid),
                "Reverting session install"
            );
            if !self.gateway.remove(grant.vid, grant.pid).await {
                tracing::warn!(
                    conn = self.conn_id,
                    device = %device_id(grant.vid, grant.pid),
                    "Failed to revert session install"
                );
            }
        }
        self.grants.clear();
    }
}

/// Reads one frame: the fixed header first, then exactly the payload the
/// validated header promises.
async fn read_frame(stream: &mut UnixStream) -> ReadOutcome {
    let mut header = [0u8; HEADER_SIZE];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return ReadOutcome::Closed,
        Err(e) => return ReadOutcome::Io(e),
    }

    let payload_len = match Message::payload_size(&header) {
        Ok(len) => len,
        Err(e) => return ReadOutcome::Protocol(e),
    };

    let mut frame = vec![0u8; HEADER_SIZE + payload_len];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    if let Err(e) = stream.read_exact(&mut frame[HEADER_SIZE..]).await {
        return ReadOutcome::Io(e);
    }

    match Message::decode(&frame) {
        Ok(message) => ReadOutcome::Message(message),
        Err(e) => ReadOutcome::Protocol(e),
    }
}
