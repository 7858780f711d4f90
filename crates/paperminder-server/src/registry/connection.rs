//! In-memory connection registry.
//!
//! Maps an identity (device or user UUID) to its open connections, plus a
//! side table of per-connection subscriptions. One mutex guards both maps and
//! is only held for the in-memory update: callers take a snapshot of
//! connections and send outside the lock.
//!
//! A new connection starts out draining: it is registered but left out of
//! live snapshots until [`ConnectionRegistry::activate`] is called, so the
//! offline cache can be flushed into it before live traffic.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::ServerFrame;
use crate::storage::UpdateChannel;

/// Registry-local connection handle. Never persisted.
pub type ConnectionId = u64;

/// Why a frame could not be handed to a connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),

    #[error("Connection {0} did not accept the frame in time")]
    Timeout(ConnectionId),
}

/// A frame queued for a connection's writer task.
///
/// Frames sent with [`LiveConnection::send_confirmed`] carry a write receipt
/// that the writer fires once the transport has accepted the frame.
#[derive(Debug)]
pub struct Outbound {
    pub frame: ServerFrame,
    receipt: Option<oneshot::Sender<()>>,
}

impl Outbound {
    /// Report that the frame went out on the transport.
    pub fn confirm(&mut self) {
        if let Some(receipt) = self.receipt.take() {
            let _ = receipt.send(());
        }
    }
}

/// Firmware state a device declared when it subscribed on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub printer_name: String,
    pub platform: String,
    pub firmware_version: String,
    pub auto_update: bool,
    pub channel: UpdateChannel,
}

/// One open transport session.
#[derive(Debug)]
pub struct LiveConnection {
    pub id: ConnectionId,
    pub identity: Uuid,
    pub remote_addr: Option<SocketAddr>,
    frame_tx: mpsc::Sender<Outbound>,
    write_timeout: Duration,
}

impl LiveConnection {
    /// Queue a frame for this connection's writer task.
    pub async fn send_frame(&self, frame: ServerFrame) -> Result<(), SendError> {
        self.enqueue(Outbound {
            frame,
            receipt: None,
        })
        .await
    }

    /// Queue a frame and wait until the writer reports it written.
    ///
    /// A writer that exits with the frame still queued drops the receipt,
    /// which is reported as [`SendError::Closed`].
    pub async fn send_confirmed(&self, frame: ServerFrame) -> Result<(), SendError> {
        let (receipt, written) = oneshot::channel();
        self.enqueue(Outbound {
            frame,
            receipt: Some(receipt),
        })
        .await?;
        match tokio::time::timeout(self.write_timeout, written).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Closed(self.id)),
            Err(_) => Err(SendError::Timeout(self.id)),
        }
    }

    async fn enqueue(&self, outbound: Outbound) -> Result<(), SendError> {
        self.frame_tx
            .send_timeout(outbound, self.write_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => SendError::Timeout(self.id),
                mpsc::error::SendTimeoutError::Closed(_) => SendError::Closed(self.id),
            })
    }
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<Uuid, Vec<Arc<LiveConnection>>>,
    subscriptions: HashMap<ConnectionId, Subscription>,
    draining: HashSet<ConnectionId>,
    next_id: ConnectionId,
}

impl RegistryState {
    fn live(&self, identity: Uuid) -> impl Iterator<Item = &Arc<LiveConnection>> {
        self.connections
            .get(&identity)
            .into_iter()
            .flatten()
            .filter(|c| !self.draining.contains(&c.id))
    }
}

/// Shared registry of live connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    state: Arc<Mutex<RegistryState>>,
    write_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(write_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            write_timeout,
        }
    }

    /// Admit a draining connection for `identity` and return its handle.
    pub async fn connect(
        &self,
        identity: Uuid,
        frame_tx: mpsc::Sender<Outbound>,
        remote_addr: Option<SocketAddr>,
    ) -> Arc<LiveConnection> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let conn = Arc::new(LiveConnection {
            id: state.next_id,
            identity,
            remote_addr,
            frame_tx,
            write_timeout: self.write_timeout,
        });
        state.draining.insert(conn.id);
        let open = state.connections.entry(identity).or_default();
        open.push(Arc::clone(&conn));
        let count = open.len();
        drop(state);

        info!(identity = %identity, connection_id = conn.id, count, "Connection admitted");
        conn
    }

    /// Make a draining connection part of live snapshots.
    ///
    /// Returns `false` if the connection is no longer registered.
    pub async fn activate(&self, identity: Uuid, connection_id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let admitted = state
            .connections
            .get(&identity)
            .is_some_and(|open| open.iter().any(|c| c.id == connection_id));
        state.draining.remove(&connection_id);
        drop(state);

        debug!(identity = %identity, connection_id, admitted, "Connection activated");
        admitted
    }

    /// Remove a connection and its subscription.
    ///
    /// Returns how many connections `identity` still has open.
    pub async fn disconnect(&self, identity: Uuid, connection_id: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        let Some(open) = state.connections.get_mut(&identity) else {
            drop(state);
            warn!(identity = %identity, connection_id, "Tried to disconnect unknown identity");
            return 0;
        };

        open.retain(|c| c.id != connection_id);
        let remaining = open.len();
        if remaining == 0 {
            state.connections.remove(&identity);
        }
        state.subscriptions.remove(&connection_id);
        state.draining.remove(&connection_id);
        drop(state);

        info!(identity = %identity, connection_id, remaining, "Connection removed");
        remaining
    }

    /// Attach a subscription to an admitted connection.
    ///
    /// Returns `false` if the connection is no longer registered.
    pub async fn register_subscription(
        &self,
        identity: Uuid,
        connection_id: ConnectionId,
        subscription: Subscription,
    ) -> bool {
        let mut state = self.state.lock().await;
        let admitted = state
            .connections
            .get(&identity)
            .is_some_and(|open| open.iter().any(|c| c.id == connection_id));
        if admitted {
            state.subscriptions.insert(connection_id, subscription);
        }
        drop(state);

        debug!(identity = %identity, connection_id, admitted, "Subscription registered");
        admitted
    }

    pub async fn subscription_for(&self, connection_id: ConnectionId) -> Option<Subscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(&connection_id)
            .cloned()
    }

    pub async fn is_connected(&self, identity: Uuid) -> bool {
        self.state.lock().await.connections.contains_key(&identity)
    }

    /// Snapshot of the identity's active connections, in admission order.
    /// Draining connections are left out.
    pub async fn live_connections_for(&self, identity: Uuid) -> Vec<Arc<LiveConnection>> {
        self.state.lock().await.live(identity).cloned().collect()
    }

    /// All identities with at least one active connection.
    pub async fn connected_identities(&self) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state
            .connections
            .keys()
            .copied()
            .filter(|id| state.live(*id).next().is_some())
            .collect()
    }
}

/// A fake peer for tests: confirms every frame as written and forwards it.
#[cfg(test)]
pub(crate) fn confirming_peer(
    capacity: usize,
) -> (mpsc::Sender<Outbound>, mpsc::UnboundedReceiver<ServerFrame>) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(capacity);
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(mut outbound) = rx.recv().await {
            outbound.confirm();
            if frames_tx.send(outbound.frame).is_err() {
                break;
            }
        }
    });
    (tx, frames_rx)
}
