//! Broker IPC server.
//!
//! Binds the Unix-socket endpoint, accepts connections behind a counting
//! admission gate, and runs one [`connection::ConnectionWorker`] task per
//! client. Shutdown is a drain, not a hard kill: the accept loop is
//! cancelled, live workers notice at their next request boundary and run
//! their own grant cleanup, and in-flight driver operations finish.

pub mod connection;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::gateway::DriverOpsGateway;
use connection::ConnectionWorker;

pub use connection::DeviceGrant;

/// Default cap on simultaneous client connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Errors raised while standing up the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening endpoint could not be bound; the accept loop is
    /// never entered.
    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The broker's IPC server.
///
/// Owns the shared gateway (and through it the filter policy); both are
/// read-only after construction, so every worker can use them without
/// locking.
pub struct PipeServer {
    socket_path: PathBuf,
    gateway: Arc<DriverOpsGateway>,
    max_connections: usize,
}

impl PipeServer {
    #[must_use]
    pub fn new<P: AsRef<Path>>(socket_path: P, gateway: Arc<DriverOpsGateway>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            gateway,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    /// Caps the number of simultaneous client connections.
    #[must_use]
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the endpoint and starts the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the socket cannot be bound; this is
    /// fatal, the accept loop is never entered.
    pub fn start(&self) -> Result<ServerHandle, ServerError> {
        // stale socket from an unclean previous shutdown
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|source| ServerError::Bind {
            path: self.socket_path.clone(),
            source,
        })?;

        tracing::info!(
            path = %self.socket_path.display(),
            max_connections = self.max_connections,
            "Broker listening"
        );

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let active = Arc::new(AtomicUsize::new(0));

        let accept_shutdown = shutdown.clone();
        let accept_tracker = tracker.clone();
        let gateway = Arc::clone(&self.gateway);
        let admission = Arc::new(Semaphore::new(self.max_connections));
        let accept_active = Arc::clone(&active);

        tracker.spawn(async move {
            let mut conn_seq: u64 = 0;
            loop {
                // admission gate first: a full house blocks accept itself
                let permit = tokio::select! {
                    () = accept_shutdown.cancelled() => break,
                    permit = Arc::clone(&admission).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let stream = tokio::select! {
                    () = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => stream,
                        Err(e) => {
                            tracing::error!(error = %e, "Accept failed, stopping server");
                            accept_shutdown.cancel();
                            break;
                        }
                    },
                };

                conn_seq += 1;
                let conn_id = conn_seq;
                let live = accept_active.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::debug!(conn = conn_id, live, "Client connected");

                let worker =
                    ConnectionWorker::new(stream, Arc::clone(&gateway), accept_shutdown.clone(), conn_id);
                let active = Arc::clone(&accept_active);
                accept_tracker.spawn(async move {
                    worker.run().await;
                    let live = active.fetch_sub(1, Ordering::SeqCst) - 1;
                    tracing::debug!(conn = conn_id, live, "Client connection closed");
                    drop(permit);
                });
            }
            tracing::info!("Accept loop stopped");
        });

        Ok(ServerHandle {
            socket_path: self.socket_path.clone(),
            shutdown,
            tracker,
            active,
        })
    }
}

/// Handle for a running broker server.
#[derive(Debug)]
pub struct ServerHandle {
    socket_path: PathBuf,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    active: Arc<AtomicUsize>,
}

impl ServerHandle {
    /// Number of currently connected clients; accounting only.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Signals shutdown without waiting for the drain.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stops accepting, drains the live workers (each runs its own grant
    /// cleanup), and removes the socket file.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::warn!(
                    path = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        tracing::info!("Broker stopped");
    }
}
