//! Storage layer tests for the `PaperMinder` server.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use paperminder_core::db::{unix_timestamp, SECONDS_PER_DAY};

use super::db::{Database, DatabaseError};
use super::models::{AttemptStatus, RolloutStatus, RolloutType, UpdateChannel};
use super::queries::DeviceFilter;
use super::queries_firmware::NewArtifact;
use super::queries_rollouts::{AttemptOutcome, NewRollout};

async fn test_db() -> Database {
    Database::open_in_memory().await.unwrap()
}

fn artifact<'a>(version: &'a str, platform: &'a str, data: &'a [u8]) -> NewArtifact<'a> {
    NewArtifact {
        version,
        platform,
        channel: UpdateChannel::Stable,
        data,
        md5: "d41d8cd98f00b204e9800998ecf8427e",
        sha256: None,
        release_notes: None,
        changelog: None,
        mandatory: false,
        min_upgrade_version: None,
    }
}

fn immediate_rollout(version: &str) -> NewRollout<'_> {
    NewRollout {
        firmware_version: version,
        rollout_type: RolloutType::Immediate,
        percentage: 100,
        scheduled_at: None,
        target_all: true,
        target_user_ids: &[],
        target_device_ids: &[],
        target_channels: &[],
        min_version: None,
        max_version: None,
    }
}

// === User / device tests ===

#[tokio::test]
async fn create_and_get_device() {
    let db = test_db().await;
    db.create_user("u1", "alice").await.unwrap();
    let device = db.create_device("d1", Some("u1"), "kitchen").await.unwrap();

    assert_eq!(device.owner_id.as_deref(), Some("u1"));
    assert_eq!(device.platform, "esp8266");
    assert_eq!(device.firmware_version, "0.0.0");
    assert_eq!(device.update_channel, UpdateChannel::Stable);
    assert!(device.auto_update);
    assert!(!device.online);

    assert!(matches!(
        db.get_device("missing").await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn list_devices_with_filter() {
    let db = test_db().await;
    db.create_user("u1", "alice").await.unwrap();
    db.create_device("d1", Some("u1"), "a").await.unwrap();
    db.create_device("d2", None, "b").await.unwrap();
    db.update_device_subscription("d2", "esp32-c3", "1.0.0", true, UpdateChannel::Beta)
        .await
        .unwrap();

    let all = db.list_devices(&DeviceFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let owned = db
        .list_devices(&DeviceFilter {
            owner_id: Some("u1"),
            ..DeviceFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].id, "d1");

    let beta = db
        .list_devices(&DeviceFilter {
            channel: Some(UpdateChannel::Beta),
            ..DeviceFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(beta.len(), 1);
    assert_eq!(beta[0].platform, "esp32-c3");
}

#[tokio::test]
async fn online_flag_and_last_ip() {
    let db = test_db().await;
    db.create_device("d1", None, "a").await.unwrap();

    assert!(db.set_device_online("d1", true, Some("10.0.0.7")).await.unwrap());
    let device = db.get_device("d1").await.unwrap();
    assert!(device.online);
    assert_eq!(device.last_ip.as_deref(), Some("10.0.0.7"));
    assert!(device.last_connected.is_some());

    db.set_device_online("d1", false, None).await.unwrap();
    let device = db.get_device("d1").await.unwrap();
    assert!(!device.online);
    assert_eq!(device.last_ip.as_deref(), Some("10.0.0.7"));

    assert!(!db.set_device_online("nope", true, None).await.unwrap());
}

#[tokio::test]
async fn daily_counter_starts_at_one_and_resets_per_day() {
    let db = test_db().await;
    db.create_device("d1", None, "a").await.unwrap();

    let day_start = 20_000 * SECONDS_PER_DAY;
    assert_eq!(db.next_daily_message_number("d1", day_start + 5).await.unwrap(), 1);
    assert_eq!(db.next_daily_message_number("d1", day_start + 60).await.unwrap(), 2);
    assert_eq!(
        db.next_daily_message_number("d1", day_start + SECONDS_PER_DAY - 1)
            .await
            .unwrap(),
        3
    );

    let next_day = day_start + SECONDS_PER_DAY;
    assert_eq!(db.next_daily_message_number("d1", next_day).await.unwrap(), 1);
    assert_eq!(db.next_daily_message_number("d1", next_day + 1).await.unwrap(), 2);

    assert!(matches!(
        db.next_daily_message_number("missing", next_day).await,
        Err(DatabaseError::NotFound(_))
    ));
}

// === Offline cache / audit tests ===

#[tokio::test]
async fn cache_lists_in_creation_order_and_marks_delivered() {
    let db = test_db().await;
    let first = db.cache_offline_message("d1", Some("u1"), "alice", "one").await.unwrap();
    let second = db.cache_offline_message("d1", None, "bob", "two").await.unwrap();
    db.cache_offline_message("d2", None, "bob", "other").await.unwrap();

    let pending = db.list_undelivered_for("d1").await.unwrap();
    let bodies: Vec<_> = pending.iter().map(|m| m.message.as_str()).collect();
    assert_eq!(bodies, ["one", "two"]);

    assert_eq!(db.mark_delivered(&[first, second]).await.unwrap(), 2);
    // Already delivered rows are not touched again.
    assert_eq!(db.mark_delivered(&[first]).await.unwrap(), 0);
    assert_eq!(db.mark_delivered(&[]).await.unwrap(), 0);

    assert!(db.list_undelivered_for("d1").await.unwrap().is_empty());
    assert_eq!(db.count_undelivered_for("d2").await.unwrap(), 1);
}

#[tokio::test]
async fn purge_only_removes_old_delivered_entries() {
    let db = test_db().await;
    let old_delivered = db.cache_offline_message("d1", None, "a", "old").await.unwrap();
    let old_pending = db.cache_offline_message("d1", None, "a", "waiting").await.unwrap();
    let fresh = db.cache_offline_message("d1", None, "a", "fresh").await.unwrap();
    db.mark_delivered(&[old_delivered, fresh]).await.unwrap();

    let ten_days_ago = unix_timestamp() - 10 * SECONDS_PER_DAY;
    sqlx::query("UPDATE message_cache SET created_at = ? WHERE id IN (?, ?)")
        .bind(ten_days_ago)
        .bind(old_delivered)
        .bind(old_pending)
        .execute(db.pool())
        .await
        .unwrap();

    assert_eq!(db.purge_delivered_older_than(7).await.unwrap(), 1);

    let remaining: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM message_cache")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(remaining.0, 2);
    assert_eq!(db.count_undelivered_for("d1").await.unwrap(), 1);
}

#[tokio::test]
async fn audit_log_round_trip() {
    let db = test_db().await;
    db.persist_audit_log(Some("u1"), "d1", "alice", "hi").await.unwrap();

    let logs = db.list_audit_logs_for("d1").await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].sender_id.as_deref(), Some("u1"));
    assert!(db.list_audit_logs_for("d2").await.unwrap().is_empty());
}

// === Firmware tests ===

#[tokio::test]
async fn duplicate_version_platform_is_a_conflict() {
    let db = test_db().await;
    db.create_artifact(&artifact("1.0.0", "esp32", b"abc")).await.unwrap();
    // Same version on another platform is fine.
    db.create_artifact(&artifact("1.0.0", "esp8266", b"abc")).await.unwrap();

    let err = db
        .create_artifact(&artifact("1.0.0", "esp32", b"xyz"))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Conflict(_)));
}

#[tokio::test]
async fn artifact_metadata_and_payload() {
    let db = test_db().await;
    let created = db.create_artifact(&artifact("1.2.0", "esp32", b"binary")).await.unwrap();

    assert_eq!(created.size, 6);
    let fetched = db.get_artifact("1.2.0", "esp32").await.unwrap();
    assert_eq!(fetched.id, created.id);
    assert_eq!(db.get_artifact_data(created.id).await.unwrap(), b"binary");

    assert!(db.get_artifact("1.2.0", "esp8266").await.is_err());
}

#[tokio::test]
async fn deprecated_artifacts_leave_active_list() {
    let db = test_db().await;
    db.create_artifact(&artifact("1.0.0", "esp32", b"a")).await.unwrap();
    db.create_artifact(&artifact("1.1.0", "esp32", b"b")).await.unwrap();

    assert!(db.deprecate_artifact("1.1.0", "esp32").await.unwrap());
    assert!(!db.deprecate_artifact("9.9.9", "esp32").await.unwrap());

    let active = db
        .list_active_artifacts(UpdateChannel::Stable, "esp32")
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].version, "1.0.0");

    let all = db.list_artifacts(None, Some("esp32")).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(db
        .list_artifacts(Some(UpdateChannel::Beta), None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn counters_report_missing_artifact_as_false() {
    let db = test_db().await;
    let a = db.create_artifact(&artifact("1.0.0", "esp32", b"a")).await.unwrap();

    assert!(db.increment_artifact_downloads(a.id).await.unwrap());
    assert!(db.increment_artifact_downloads(a.id).await.unwrap());
    assert!(db.increment_artifact_successes(a.id).await.unwrap());
    assert!(!db.increment_artifact_failures(9999).await.unwrap());

    let a = db.get_artifact_by_id(a.id).await.unwrap();
    assert_eq!(a.download_count, 2);
    assert_eq!(a.success_count, 1);
    assert_eq!(a.failure_count, 0);
}

// === Rollout / attempt tests ===

#[tokio::test]
async fn rollout_round_trip_with_targets() {
    let db = test_db().await;
    let users = vec!["u1".to_string()];
    let channels = vec![UpdateChannel::Beta];
    let rollout = db
        .create_rollout(&NewRollout {
            target_all: false,
            target_user_ids: &users,
            target_channels: &channels,
            min_version: Some("1.0"),
            ..immediate_rollout("2.0.0")
        })
        .await
        .unwrap();

    assert_eq!(rollout.status, RolloutStatus::Pending);
    assert_eq!(rollout.target_user_ids.0, users);
    assert_eq!(rollout.target_channels.0, channels);
    assert_eq!(rollout.min_version.as_deref(), Some("1.0"));

    db.set_rollout_targets(rollout.id, 3).await.unwrap();
    db.update_rollout_status(rollout.id, RolloutStatus::Active).await.unwrap();
    let rollout = db.get_rollout(rollout.id).await.unwrap();
    assert_eq!(rollout.total_targets, 3);
    assert_eq!(rollout.pending_count, 3);

    assert_eq!(db.list_active_rollouts_for_version("2.0.0").await.unwrap().len(), 1);
    assert_eq!(
        db.list_rollouts(Some(RolloutStatus::Paused)).await.unwrap().len(),
        0
    );
}

#[tokio::test]
async fn progress_moves_pending_to_downloading() {
    let db = test_db().await;
    db.create_device("d1", None, "a").await.unwrap();
    db.create_attempt("d1", "2.0.0", "esp32", None).await.unwrap();

    let a = db.update_attempt_progress("d1", 0, "starting").await.unwrap().unwrap();
    assert_eq!(a.status, AttemptStatus::Pending);

    let a = db.update_attempt_progress("d1", 40, "downloading").await.unwrap().unwrap();
    assert_eq!(a.status, AttemptStatus::Downloading);
    assert_eq!(a.last_percent, 40);

    // Out-of-order reports are applied as they arrive.
    let a = db.update_attempt_progress("d1", 20, "late").await.unwrap().unwrap();
    assert_eq!(a.last_percent, 20);
    assert_eq!(a.status_message.as_deref(), Some("late"));

    assert!(db.update_attempt_progress("d2", 50, "x").await.unwrap().is_none());
}

#[tokio::test]
async fn finishing_attempts_keeps_counters_consistent() {
    let db = test_db().await;
    for id in ["d1", "d2", "d3"] {
        db.create_device(id, None, id).await.unwrap();
    }
    let rollout = db.create_rollout(&immediate_rollout("2.0.0")).await.unwrap();
    db.set_rollout_targets(rollout.id, 3).await.unwrap();

    let a1 = db.create_attempt("d1", "2.0.0", "esp32", Some(rollout.id)).await.unwrap();
    let a2 = db.create_attempt("d2", "2.0.0", "esp32", Some(rollout.id)).await.unwrap();
    let a3 = db.create_attempt("d3", "2.0.0", "esp32", Some(rollout.id)).await.unwrap();

    let outcomes = [
        (a1.id, AttemptOutcome::Completed),
        (a2.id, AttemptOutcome::Failed("flash error".into())),
        (a3.id, AttemptOutcome::Declined),
    ];
    for (id, outcome) in &outcomes {
        db.finish_attempt(*id, outcome).await.unwrap();
        let r = db.get_rollout(rollout.id).await.unwrap();
        assert_eq!(
            r.completed_count + r.failed_count + r.declined_count + r.pending_count,
            r.total_targets
        );
    }

    let r = db.get_rollout(rollout.id).await.unwrap();
    assert_eq!((r.completed_count, r.failed_count, r.declined_count), (1, 1, 1));
    assert_eq!(r.pending_count, 0);

    let failed = db.latest_attempt_for("d2").await.unwrap().unwrap();
    assert_eq!(failed.status, AttemptStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("flash error"));

    // A finished attempt cannot be finished twice.
    assert!(matches!(
        db.finish_attempt(a1.id, &AttemptOutcome::Completed).await,
        Err(DatabaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn attempt_outside_target_set_grows_total() {
    let db = test_db().await;
    db.create_device("d1", None, "a").await.unwrap();
    let rollout = db.create_rollout(&immediate_rollout("2.0.0")).await.unwrap();
    db.set_rollout_targets(rollout.id, 0).await.unwrap();

    let a = db.create_attempt("d1", "2.0.0", "esp32", Some(rollout.id)).await.unwrap();
    db.finish_attempt(a.id, &AttemptOutcome::Completed).await.unwrap();

    let r = db.get_rollout(rollout.id).await.unwrap();
    assert_eq!(r.total_targets, 1);
    assert_eq!(r.completed_count, 1);
    assert_eq!(r.pending_count, 0);
}

#[tokio::test]
async fn deleting_rollout_keeps_attempt_history() {
    let db = test_db().await;
    db.create_device("d1", None, "a").await.unwrap();
    let rollout = db.create_rollout(&immediate_rollout("2.0.0")).await.unwrap();
    db.create_attempt("d1", "2.0.0", "esp32", Some(rollout.id)).await.unwrap();

    assert!(db.delete_rollout(rollout.id).await.unwrap());
    assert!(!db.delete_rollout(rollout.id).await.unwrap());

    let history = db.list_attempts_for_device("d1", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].rollout_id, None);
}

#[tokio::test]
async fn declined_record_without_pending_attempt() {
    let db = test_db().await;
    db.create_device("d1", None, "a").await.unwrap();

    assert!(db.pending_attempt_for("d1", "2.0.0").await.unwrap().is_none());
    let declined = db.insert_declined_attempt("d1", "2.0.0", "esp32").await.unwrap();
    assert_eq!(declined.status, AttemptStatus::Declined);
    assert!(declined.completed_at.is_some());
    assert!(db.open_attempt_for("d1", None).await.unwrap().is_none());
}

#[tokio::test]
async fn on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("server.db");

    let db = Database::open(&path).await.unwrap();
    db.create_device("d1", None, "kitchen").await.unwrap();
    db.cache_offline_message("d1", None, "Bob", "kept").await.unwrap();
    db.pool().close().await;

    let db = Database::open(&path).await.unwrap();
    assert_eq!(db.get_device("d1").await.unwrap().name, "kitchen");
    assert_eq!(db.count_undelivered_for("d1").await.unwrap(), 1);
}
