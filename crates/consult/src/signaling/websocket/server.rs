//! WebSocket signaling server
//!
//! Accepts connections on a TCP listener and serves JSON-RPC 2.0 signaling
//! on each of them until shut down.

use super::handler::{handle_connection, SharedState};
use crate::session::SessionManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// WebSocket signaling server
pub struct WebSocketSignalingServer {
    /// Address to bind
    addr: String,

    /// Shared state
    state: Arc<SharedState>,
}

impl WebSocketSignalingServer {
    /// Create a server for `manager`, listening on `addr` once started
    pub fn new(addr: impl Into<String>, manager: SessionManager, channel_capacity: usize) -> Self {
        Self {
            addr: addr.into(),
            state: Arc::new(SharedState::new(manager, channel_capacity)),
        }
    }

    /// Get shared state (for external access)
    pub fn state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    /// Bind and start accepting connections
    ///
    /// Returns once the listener is bound; the accept loop runs on a
    /// spawned task until [`WebSocketServerHandle::shutdown`].
    pub async fn start(self) -> std::io::Result<WebSocketServerHandle> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind WebSocket server");
            e
        })?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket signaling server listening on ws://{}", local_addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let accept_shutdown = shutdown_tx.clone();
        let state = self.state;

        let task = tokio::spawn(async move {
            let mut shutdown_rx = accept_shutdown.subscribe();
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let state = Arc::clone(&state);
                                let connection_shutdown = accept_shutdown.subscribe();
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, state, connection_shutdown).await {
                                        error!(peer_addr = %peer_addr, error = %e, "WebSocket connection error");
                                    }
                                });
                            }
                            Err(e) => {
                                error!(error = %e, "Failed to accept WebSocket connection");
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("WebSocket signaling server received shutdown signal");
                        break;
                    }
                }
            }
            info!("WebSocket signaling server accept loop exited");
        });

        Ok(WebSocketServerHandle {
            local_addr,
            shutdown_tx,
            task: Some(task),
        })
    }
}

/// Handle to a running WebSocket server
pub struct WebSocketServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl WebSocketServerHandle {
    /// Address the server is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close every open connection
    ///
    /// Sessions are left to the [`SessionManager`]; closed connections
    /// start their participants' grace periods.
    pub async fn shutdown(mut self) {
        info!("Shutting down WebSocket signaling server");
        let _ = self.shutdown_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "WebSocket server task failed");
            }
        }
    }
}

impl Drop for WebSocketServerHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.shutdown_tx.send(());
        }
    }
}
