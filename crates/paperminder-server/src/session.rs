//! Per-connection session logic.
//!
//! A [`Session`] owns one registry admission and turns decoded client frames
//! into calls on the delivery engine, the update tracker and the registry.
//! It never touches the socket itself: outbound frames go through the
//! connection's channel, so the same code drives WebSocket peers and tests.

use std::net::SocketAddr;
use std::sync::Arc;

use paperminder_core::platform::normalize_platform;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::delivery::{DeliveryError, DeliveryOutcome, OutgoingMessage};
use crate::protocol::{ClientFrame, FirmwareReport, MessageFrame, ServerFrame, StatusCode, SubscribeFrame};
use crate::registry::{LiveConnection, Outbound, Subscription};
use crate::server::AppState;
use crate::updates::{ReportOutcome, TrackerError};

const DEFAULT_PLATFORM: &str = "esp8266";

pub struct Session {
    state: AppState,
    conn: Arc<LiveConnection>,
}

impl Session {
    /// Admit a connection, mark the device online, greet it and flush its
    /// offline cache. The connection receives live messages only once the
    /// flush is over.
    #[instrument(skip_all, fields(identity = %identity))]
    pub async fn open(
        state: AppState,
        identity: Uuid,
        frame_tx: mpsc::Sender<Outbound>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let conn = state.registry.connect(identity, frame_tx, remote_addr).await;

        let ip = remote_addr.map(|a| a.ip().to_string());
        if let Err(e) = state
            .db
            .set_device_online(&identity.to_string(), true, ip.as_deref())
            .await
        {
            warn!(error = %e, "Failed to mark device online");
        }

        let session = Self { state, conn };
        session.reply(StatusCode::Info, "connected").await;

        match session
            .state
            .delivery
            .flush_offline_cache(identity, &session.conn)
            .await
        {
            Ok(count) if count > 0 => info!(count, "Delivered cached messages on connect"),
            Err(e) => warn!(error = %e, "Failed to flush offline cache on connect"),
            _ => {}
        }

        session
    }

    /// Handle one inbound text frame. Failures are reported to this peer only.
    pub async fn handle_text(&self, raw: &str) {
        match ClientFrame::parse(raw) {
            Ok(ClientFrame::Subscribe(frame)) => self.subscribe(frame).await,
            Ok(ClientFrame::Firmware(report)) => self.firmware_report(report).await,
            Ok(ClientFrame::Message(frame)) => self.message(frame).await,
            Err(e) => self.reply(StatusCode::ValidationError, e.to_string()).await,
        }
    }

    /// Leave the registry; the last connection of a device marks it offline.
    pub async fn close(self) {
        let identity = self.conn.identity;
        let remaining = self.state.registry.disconnect(identity, self.conn.id).await;
        if remaining == 0 {
            if let Err(e) = self
                .state
                .db
                .set_device_online(&identity.to_string(), false, None)
                .await
            {
                warn!(identity = %identity, error = %e, "Failed to mark device offline");
            }
        }
    }

    #[instrument(skip_all, fields(identity = %self.conn.identity, printer = %frame.printer_name))]
    async fn subscribe(&self, frame: SubscribeFrame) {
        let identity = self.conn.identity;
        if frame.printer_id.is_some_and(|id| id != identity) {
            self.reply(
                StatusCode::ValidationError,
                "printer_id does not match the connection identity",
            )
            .await;
            return;
        }

        let mut platform = normalize_platform(&frame.platform);
        if platform.is_empty() {
            platform = DEFAULT_PLATFORM.to_string();
        }
        let subscription = Subscription {
            printer_name: frame.printer_name.clone(),
            platform,
            firmware_version: frame.firmware_version.trim().to_string(),
            auto_update: frame.auto_update,
            channel: frame.update_channel,
        };

        self.state
            .registry
            .register_subscription(identity, self.conn.id, subscription.clone())
            .await;

        let known = match self
            .state
            .db
            .update_device_subscription(
                &identity.to_string(),
                &subscription.platform,
                &subscription.firmware_version,
                subscription.auto_update,
                subscription.channel,
            )
            .await
        {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, "Failed to persist subscription");
                false
            }
        };

        self.reply(
            StatusCode::SubscriptionAccepted,
            format!("Printer '{}' subscribed successfully.", subscription.printer_name),
        )
        .await;

        if known && subscription.auto_update {
            self.offer_pending_update().await;
        }
    }

    /// Send the device the update it is eligible for right now, if any.
    async fn offer_pending_update(&self) {
        let device_id = self.conn.identity.to_string();
        let update = match self.state.tracker.check_for_updates(&device_id).await {
            Ok(Some(update)) => update,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Update check failed");
                return;
            }
        };

        let artifact = &update.artifact;
        if let Err(e) = self
            .state
            .tracker
            .open_attempt(&device_id, &artifact.version, &artifact.platform, Some(update.rollout.id))
            .await
        {
            warn!(error = %e, "Failed to open update attempt");
            return;
        }

        let frame = self.state.orchestrator.update_frame(artifact);
        match self.conn.send_frame(frame).await {
            Ok(()) => info!(
                version = %artifact.version,
                rollout_id = update.rollout.id,
                "Firmware update offered"
            ),
            Err(e) => warn!(error = %e, "Failed to send firmware update"),
        }
    }

    async fn firmware_report(&self, report: FirmwareReport) {
        let tracker = &self.state.tracker;
        let device_id = self.conn.identity.to_string();

        let result = match report {
            FirmwareReport::FirmwareProgress { percent, status } => {
                tracker.progress(&device_id, percent, &status).await
            }
            FirmwareReport::FirmwareComplete { version } => {
                tracker.complete(&device_id, version.trim()).await
            }
            FirmwareReport::FirmwareFailed { error } => tracker.failed(&device_id, &error).await,
            FirmwareReport::FirmwareDeclined {
                version,
                auto_update,
            } => tracker.declined(&device_id, version.trim(), auto_update).await,
        };

        match result {
            Ok(ReportOutcome::Applied(attempt)) => {
                debug!(attempt_id = attempt.id, status = ?attempt.status, "Firmware report applied");
            }
            Ok(ReportOutcome::Ignored) => {}
            Err(e @ TrackerError::UnknownDevice(_)) => {
                self.reply(StatusCode::ValidationError, e.to_string()).await;
            }
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Failed to record firmware report");
                self.reply(StatusCode::ValidationError, "Failed to record firmware report")
                    .await;
            }
        }
    }

    async fn message(&self, frame: MessageFrame) {
        let outgoing = OutgoingMessage {
            sender_id: Some(self.conn.identity),
            sender_name: frame.sender_name,
            body: frame.message,
        };
        let recipient = frame.recipient_id;

        match self.state.delivery.deliver(recipient, &outgoing).await {
            Ok(DeliveryOutcome::Delivered { .. }) => {}
            Ok(DeliveryOutcome::RecipientOffline { .. }) => {
                self.reply(
                    StatusCode::RecipientNotConnected,
                    format!("Recipient '{recipient}' is not connected; message queued."),
                )
                .await;
            }
            Err(e @ DeliveryError::Unprintable(_)) => {
                self.reply(StatusCode::ValidationError, e.to_string()).await;
            }
            Err(DeliveryError::RecipientUnknown(_)) => {
                self.reply(
                    StatusCode::RecipientNotConnected,
                    format!("Recipient '{recipient}' is not registered."),
                )
                .await;
            }
            Err(e) => {
                warn!(recipient = %recipient, error = %e, "Message delivery failed");
                self.reply(StatusCode::ValidationError, "Message could not be delivered")
                    .await;
            }
        }
    }

    async fn reply(&self, code: StatusCode, detail: impl Into<String>) {
        if let Err(e) = self.conn.send_frame(ServerFrame::status(code, detail)).await {
            debug!(connection_id = self.conn.id, error = %e, "Dropped status frame");
        }
    }
}
