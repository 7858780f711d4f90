//! Delivery engine.
//!
//! Routes a message to every live connection of its recipient. When the
//! recipient has no live connection the message is staged in the offline
//! cache, and the cache is flushed into the next connection the recipient
//! opens.
//!
//! Deliveries and cache flushes for one recipient are serialised by a
//! per-recipient gate, so a message sent while a connection is still
//! draining its cache is staged behind the cached ones.

use std::collections::HashMap;
use std::sync::Arc;

use paperminder_core::db::unix_timestamp;
use paperminder_core::sanitize::{sanitize_message, sanitize_name};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::protocol::ServerFrame;
use crate::registry::{ConnectionRegistry, LiveConnection};
use crate::storage::{Database, DatabaseError};

/// A message on its way to a recipient, before sanitisation.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub sender_id: Option<Uuid>,
    pub sender_name: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Written to at least one live connection.
    Delivered {
        connections: usize,
        number: Option<i64>,
    },
    /// No live connection accepted the message; it is staged in the cache.
    RecipientOffline { cache_id: i64 },
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Recipient {0} is not a known device or user")]
    RecipientUnknown(Uuid),

    #[error("{0} has no printable characters")]
    Unprintable(&'static str),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecipientKind {
    Device,
    User,
}

#[derive(Clone)]
pub struct DeliveryEngine {
    db: Database,
    registry: ConnectionRegistry,
    gates: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl DeliveryEngine {
    pub fn new(db: Database, registry: ConnectionRegistry) -> Self {
        Self {
            db,
            registry,
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Deliver a message to `recipient`, staging it if the recipient is offline.
    #[instrument(skip_all, fields(recipient = %recipient))]
    pub async fn deliver(
        &self,
        recipient: Uuid,
        message: &OutgoingMessage,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        let sender_name = sanitize_name(&message.sender_name);
        let body = sanitize_message(&message.body);
        if sender_name.is_empty() {
            return Err(DeliveryError::Unprintable("sender_name"));
        }
        if body.trim().is_empty() {
            return Err(DeliveryError::Unprintable("message"));
        }
        let sender_id = message.sender_id.map(|id| id.to_string());
        let recipient_key = recipient.to_string();

        let kind = self
            .recipient_kind(&recipient_key)
            .await?
            .ok_or(DeliveryError::RecipientUnknown(recipient))?;

        let gate = self.gate(recipient).await;
        let _held = gate.lock().await;

        let live = self.registry.live_connections_for(recipient).await;
        if !live.is_empty() {
            let number = match kind {
                RecipientKind::Device => self.next_number(&recipient_key).await,
                RecipientKind::User => None,
            };
            let frame = ServerFrame::Message {
                sender_name: sender_name.clone(),
                message: body.clone(),
                number,
                timestamp: unix_timestamp(),
            };

            let connections = fan_out(&live, &frame).await;
            if connections > 0 {
                self.audit(sender_id.as_deref(), &recipient_key, &sender_name, &body)
                    .await;
                info!(connections, number, "Message delivered");
                return Ok(DeliveryOutcome::Delivered {
                    connections,
                    number,
                });
            }
            warn!("Every live connection rejected the message, staging it instead");
        }

        let cache_id = self
            .db
            .cache_offline_message(&recipient_key, sender_id.as_deref(), &sender_name, &body)
            .await?;
        self.audit(sender_id.as_deref(), &recipient_key, &sender_name, &body)
            .await;

        info!(cache_id, "Recipient offline, message cached");
        Ok(DeliveryOutcome::RecipientOffline { cache_id })
    }

    /// Write every undelivered cache entry for `identity` to the draining
    /// connection `conn`, oldest first, then activate it for live traffic.
    ///
    /// An entry counts as written only once the connection's writer confirms
    /// it. Stops at the first unconfirmed write; unsent entries stay cached
    /// for the next connection. The connection is activated even when the
    /// flush fails. Returns how many entries were written.
    #[instrument(skip_all, fields(identity = %identity, connection_id = conn.id))]
    pub async fn flush_offline_cache(
        &self,
        identity: Uuid,
        conn: &LiveConnection,
    ) -> Result<usize, DeliveryError> {
        let gate = self.gate(identity).await;
        let _held = gate.lock().await;

        let flushed = self.drain_cache(identity, conn).await;
        self.registry.activate(identity, conn.id).await;
        flushed
    }

    async fn drain_cache(
        &self,
        identity: Uuid,
        conn: &LiveConnection,
    ) -> Result<usize, DeliveryError> {
        let identity_key = identity.to_string();
        let entries = self.db.list_undelivered_for(&identity_key).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let numbered = matches!(
            self.recipient_kind(&identity_key).await?,
            Some(RecipientKind::Device)
        );

        let total = entries.len();
        let mut written = Vec::with_capacity(total);
        for entry in entries {
            let number = if numbered {
                self.next_number(&identity_key).await
            } else {
                None
            };
            let frame = ServerFrame::Message {
                sender_name: entry.sender_name,
                message: entry.message,
                number,
                timestamp: entry.created_at,
            };

            if let Err(e) = conn.send_confirmed(frame).await {
                warn!(
                    cache_id = entry.id,
                    sent = written.len(),
                    remaining = total - written.len(),
                    error = %e,
                    "Failed to flush cached message, remaining messages preserved"
                );
                break;
            }
            written.push(entry.id);
        }

        self.db.mark_delivered(&written).await?;
        info!(count = written.len(), total, "Offline cache flushed");
        Ok(written.len())
    }

    async fn gate(&self, identity: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.gates.lock().await.entry(identity).or_default())
    }

    /// Push a frame to every live connection of `identity`.
    ///
    /// Returns how many connections accepted it.
    pub async fn push_frame(&self, identity: Uuid, frame: &ServerFrame) -> usize {
        let live = self.registry.live_connections_for(identity).await;
        fan_out(&live, frame).await
    }

    /// Delete delivered cache entries older than the retention window.
    pub async fn purge(&self, retention_days: u32) -> Result<u64, DeliveryError> {
        let removed = self.db.purge_delivered_older_than(retention_days).await?;
        if removed > 0 {
            info!(removed, retention_days, "Purged delivered offline messages");
        }
        Ok(removed)
    }

    async fn recipient_kind(&self, id: &str) -> Result<Option<RecipientKind>, DatabaseError> {
        match self.db.get_device(id).await {
            Ok(_) => return Ok(Some(RecipientKind::Device)),
            Err(DatabaseError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.db.get_user(id).await {
            Ok(_) => Ok(Some(RecipientKind::User)),
            Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn next_number(&self, device_id: &str) -> Option<i64> {
        match self
            .db
            .next_daily_message_number(device_id, unix_timestamp())
            .await
        {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(device_id, error = %e, "Failed to assign daily message number");
                None
            }
        }
    }

    async fn audit(&self, sender_id: Option<&str>, recipient: &str, sender_name: &str, body: &str) {
        if let Err(e) = self
            .db
            .persist_audit_log(sender_id, recipient, sender_name, body)
            .await
        {
            warn!(recipient, error = %e, "Failed to persist message audit log");
        }
    }
}

/// Send `frame` to each connection in the snapshot. A failed write is logged
/// and does not stop the remaining writes.
async fn fan_out(live: &[Arc<LiveConnection>], frame: &ServerFrame) -> usize {
    let mut accepted = 0;
    for conn in live {
        match conn.send_frame(frame.clone()).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                debug!(identity = %conn.identity, connection_id = conn.id, error = %e, "Fan-out write failed");
            }
        }
    }
    accepted
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::{confirming_peer, Outbound};

    struct Fixture {
        engine: DeliveryEngine,
        db: Database,
        registry: ConnectionRegistry,
        device: Uuid,
        user: Uuid,
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let device = Uuid::new_v4();
        let user = Uuid::new_v4();
        db.create_user(&user.to_string(), "alice").await.unwrap();
        db.create_device(&device.to_string(), Some(&user.to_string()), "kitchen")
            .await
            .unwrap();
        let registry = ConnectionRegistry::new(Duration::from_millis(50));
        let engine = DeliveryEngine::new(db.clone(), registry.clone());
        Fixture {
            engine,
            db,
            registry,
            device,
            user,
        }
    }

    fn message(sender: Uuid, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            sender_id: Some(sender),
            sender_name: "Alice".into(),
            body: body.into(),
        }
    }

    /// Admit and activate a connection whose queue the test reads directly.
    async fn live(fx: &Fixture, id: Uuid, capacity: usize) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = fx.registry.connect(id, tx, None).await;
        fx.registry.activate(id, conn.id).await;
        rx
    }

    async fn next_body(rx: &mut mpsc::Receiver<Outbound>) -> (String, Option<i64>) {
        body_of(rx.recv().await.unwrap().frame)
    }

    fn body_of(frame: ServerFrame) -> (String, Option<i64>) {
        match frame {
            ServerFrame::Message {
                message, number, ..
            } => (message, number),
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_recipient_is_distinct_and_not_audited() {
        let fx = setup().await;
        let stranger = Uuid::new_v4();

        let err = fx
            .engine
            .deliver(stranger, &message(fx.user, "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::RecipientUnknown(id) if id == stranger));
        assert!(fx
            .db
            .list_audit_logs_for(&stranger.to_string())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn live_delivery_fans_out_with_numbers() {
        let fx = setup().await;
        let mut rx1 = live(&fx, fx.device, 8).await;
        let mut rx2 = live(&fx, fx.device, 8).await;

        let first = fx.engine.deliver(fx.device, &message(fx.user, "one")).await.unwrap();
        let second = fx.engine.deliver(fx.device, &message(fx.user, "two")).await.unwrap();

        assert_eq!(
            first,
            DeliveryOutcome::Delivered {
                connections: 2,
                number: Some(1)
            }
        );
        assert!(matches!(
            second,
            DeliveryOutcome::Delivered {
                number: Some(2),
                ..
            }
        ));
        assert_eq!(next_body(&mut rx1).await, ("one".into(), Some(1)));
        assert_eq!(next_body(&mut rx2).await, ("one".into(), Some(1)));
        assert_eq!(
            fx.db
                .list_audit_logs_for(&fx.device.to_string())
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn dead_connection_does_not_block_others() {
        let fx = setup().await;
        let dead_rx = live(&fx, fx.device, 1).await;
        let mut rx = live(&fx, fx.device, 8).await;
        drop(dead_rx);

        let outcome = fx.engine.deliver(fx.device, &message(fx.user, "hi")).await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Delivered { connections: 1, .. }
        ));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn messages_to_users_are_not_numbered() {
        let fx = setup().await;
        let mut rx = live(&fx, fx.user, 8).await;

        fx.engine.deliver(fx.user, &message(fx.device, "hello")).await.unwrap();
        assert_eq!(next_body(&mut rx).await, ("hello".into(), None));
    }

    #[tokio::test]
    async fn sanitised_content_is_cached_and_sent() {
        let fx = setup().await;
        let outgoing = OutgoingMessage {
            sender_id: None,
            sender_name: "  Zoë \u{1F600} ".into(),
            body: "Café\u{7}".into(),
        };

        let outcome = fx.engine.deliver(fx.device, &outgoing).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::RecipientOffline { .. }));

        let cached = fx.db.list_undelivered_for(&fx.device.to_string()).await.unwrap();
        assert_eq!(cached[0].sender_name, "Zoe");
        assert_eq!(cached[0].message, "Cafe");
    }

    #[tokio::test]
    async fn offline_messages_flush_in_order_before_live_ones() {
        let fx = setup().await;
        for body in ["first", "second", "third"] {
            let outcome = fx.engine.deliver(fx.device, &message(fx.user, body)).await.unwrap();
            assert!(matches!(outcome, DeliveryOutcome::RecipientOffline { .. }));
        }

        let (tx, mut rx) = confirming_peer(8);
        let conn = fx.registry.connect(fx.device, tx, None).await;
        assert_eq!(fx.engine.flush_offline_cache(fx.device, &conn).await.unwrap(), 3);
        fx.engine.deliver(fx.device, &message(fx.user, "live")).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(body_of(rx.recv().await.unwrap()));
        }
        assert_eq!(
            received,
            vec![
                ("first".into(), Some(1)),
                ("second".into(), Some(2)),
                ("third".into(), Some(3)),
                ("live".into(), Some(4)),
            ]
        );
        assert_eq!(fx.db.count_undelivered_for(&fx.device.to_string()).await.unwrap(), 0);

        // Delivered entries are never flushed again.
        assert_eq!(fx.engine.flush_offline_cache(fx.device, &conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writer_dying_mid_flush_keeps_unwritten_entries() {
        let fx = setup().await;
        for body in ["a", "b", "c"] {
            fx.engine.deliver(fx.device, &message(fx.user, body)).await.unwrap();
        }

        // The writer puts the first frame on the wire, then dies with the
        // second one taken off the queue but never written.
        let (tx, mut rx) = mpsc::channel::<Outbound>(64);
        let conn = fx.registry.connect(fx.device, tx, None).await;
        let writer = tokio::spawn(async move {
            let mut first = rx.recv().await.unwrap();
            first.confirm();
            let unwritten = rx.recv().await;
            drop(unwritten);
            first.frame
        });

        assert_eq!(fx.engine.flush_offline_cache(fx.device, &conn).await.unwrap(), 1);
        assert_eq!(body_of(writer.await.unwrap()).0, "a");

        let left = fx.db.list_undelivered_for(&fx.device.to_string()).await.unwrap();
        let bodies: Vec<_> = left.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["b", "c"]);
    }

    #[tokio::test]
    async fn queued_but_unwritten_frames_are_not_marked_delivered() {
        let fx = setup().await;
        for body in ["a", "b"] {
            fx.engine.deliver(fx.device, &message(fx.user, body)).await.unwrap();
        }

        // Nobody drains the queue; the peer goes away with frames queued.
        let (tx, rx) = mpsc::channel::<Outbound>(64);
        let conn = fx.registry.connect(fx.device, tx, None).await;
        assert_eq!(fx.engine.flush_offline_cache(fx.device, &conn).await.unwrap(), 0);
        drop(rx);

        assert_eq!(fx.db.count_undelivered_for(&fx.device.to_string()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn message_sent_while_draining_is_staged_behind_the_cache() {
        let fx = setup().await;
        fx.engine.deliver(fx.device, &message(fx.user, "cached")).await.unwrap();

        let (tx, mut frames) = confirming_peer(8);
        let conn = fx.registry.connect(fx.device, tx, None).await;

        let outcome = fx.engine.deliver(fx.device, &message(fx.user, "live")).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::RecipientOffline { .. }));

        assert_eq!(fx.engine.flush_offline_cache(fx.device, &conn).await.unwrap(), 2);
        assert_eq!(body_of(frames.recv().await.unwrap()), ("cached".into(), Some(1)));
        assert_eq!(body_of(frames.recv().await.unwrap()), ("live".into(), Some(2)));
        assert_eq!(fx.db.count_undelivered_for(&fx.device.to_string()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delivery_waits_for_a_flush_in_progress() {
        let fx = setup().await;
        // Generous write timeout: the test confirms the first write by hand.
        let registry = ConnectionRegistry::new(Duration::from_secs(5));
        let engine = DeliveryEngine::new(fx.db.clone(), registry.clone());
        engine.deliver(fx.device, &message(fx.user, "cached")).await.unwrap();

        let (tx, mut rx) = mpsc::channel::<Outbound>(8);
        let conn = registry.connect(fx.device, tx, None).await;
        let flush = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.flush_offline_cache(fx.device, &conn).await })
        };

        // The flush holds the recipient while its first write is unconfirmed.
        let mut cached = rx.recv().await.unwrap();
        let sender = {
            let engine = engine.clone();
            let recipient = fx.device;
            let user = fx.user;
            tokio::spawn(async move { engine.deliver(recipient, &message(user, "live")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        cached.confirm();
        assert_eq!(flush.await.unwrap().unwrap(), 1);
        assert_eq!(body_of(cached.frame), ("cached".into(), Some(1)));

        let outcome = sender.await.unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { number: Some(2), .. }));
        assert_eq!(next_body(&mut rx).await, ("live".into(), Some(2)));
    }

    #[tokio::test]
    async fn messages_that_sanitise_to_nothing_are_rejected() {
        let fx = setup().await;
        let emoji_only = message(fx.user, "\u{1F389}\u{1F389}");
        assert!(matches!(
            fx.engine.deliver(fx.device, &emoji_only).await,
            Err(DeliveryError::Unprintable("message"))
        ));

        let unnamed = OutgoingMessage {
            sender_id: None,
            sender_name: "\u{1F600}".into(),
            body: "hi".into(),
        };
        assert!(matches!(
            fx.engine.deliver(fx.device, &unnamed).await,
            Err(DeliveryError::Unprintable("sender_name"))
        ));

        assert_eq!(fx.db.count_undelivered_for(&fx.device.to_string()).await.unwrap(), 0);
        assert!(fx
            .db
            .list_audit_logs_for(&fx.device.to_string())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn all_connections_failing_falls_back_to_cache() {
        let fx = setup().await;
        let rx = live(&fx, fx.device, 1).await;
        drop(rx);

        let outcome = fx.engine.deliver(fx.device, &message(fx.user, "hi")).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::RecipientOffline { .. }));
        assert_eq!(fx.db.count_undelivered_for(&fx.device.to_string()).await.unwrap(), 1);
    }
}
