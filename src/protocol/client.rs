//! Client side of the broker protocol.
//!
//! Used by the `request` CLI surface and by integration tests. The client
//! holds one connection and performs one request/reply transaction at a
//! time; a session-scoped grant stays alive for as long as the connection
//! does.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::protocol::codec::REPLY_SIZE;
use crate::protocol::{Message, ProtocolError};

/// Default timeout for one request/reply transaction.
///
/// Generous because an install request may sit behind the broker's
/// pending-installation retry loop (up to 20 s at default budget).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised on the client side of the protocol.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The broker socket does not exist.
    #[error("broker not running (socket not found)")]
    BrokerNotRunning,

    /// Connection or channel I/O failed.
    #[error("broker connection failed: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    /// The broker's reply was not a well-formed reply frame.
    #[error("invalid reply from broker: {0}")]
    InvalidReply(#[from] ProtocolError),

    /// The broker answered with a non-reply message type.
    #[error("unexpected message type in reply")]
    UnexpectedReply,

    /// The transaction timed out.
    #[error("broker transaction timed out after {0:?}")]
    Timeout(Duration),
}

/// Client connection to the broker endpoint.
#[derive(Debug)]
pub struct BrokerClient {
    stream: UnixStream,
    timeout: Duration,
}

impl BrokerClient {
    /// Connects to the broker at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BrokerNotRunning`] if the socket file is
    /// absent, or [`ClientError::ConnectionFailed`] if connecting fails.
    pub async fn connect<P: AsRef<Path>>(path: P) -> Result<Self, ClientError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ClientError::BrokerNotRunning);
        }
        let stream = UnixStream::connect(&path).await?;
        Ok(Self {
            stream,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Sets the per-transaction timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Requests a persistent driver install for (vid, pid).
    ///
    /// # Errors
    ///
    /// Fails on channel I/O errors, a malformed reply, or timeout. The
    /// returned boolean is the broker's verdict.
    pub async fn install(&mut self, vid: u16, pid: u16) -> Result<bool, ClientError> {
        self.transact(Message::Install { vid, pid }).await
    }

    /// Requests a session-scoped install, reverted when this connection
    /// closes.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`BrokerClient::install`].
    pub async fn session_install(&mut self, vid: u16, pid: u16) -> Result<bool, ClientError> {
        self.transact(Message::SessionInstall { vid, pid }).await
    }

    /// Requests removal of the managed driver from (vid, pid).
    ///
    /// # Errors
    ///
    /// Same failure modes as [`BrokerClient::install`].
    pub async fn remove(&mut self, vid: u16, pid: u16) -> Result<bool, ClientError> {
        self.transact(Message::Remove { vid, pid }).await
    }

    /// One request/reply exchange, strictly in order on this connection.
    async fn transact(&mut self, request: Message) -> Result<bool, ClientError> {
        let timeout = self.timeout;
        let result = tokio::time::timeout(timeout, async {
            self.stream.write_all(&request.encode()).await?;
            self.stream.flush().await?;

            let mut buf = [0u8; REPLY_SIZE];
            self.stream.read_exact(&mut buf).await?;
            match Message::decode(&buf)? {
                Message::Reply { status } => Ok(status),
                _ => Err(ClientError::UnexpectedReply),
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}
