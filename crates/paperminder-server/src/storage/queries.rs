//! User and device queries for the `PaperMinder` server.

use paperminder_core::db::{unix_timestamp, utc_day};

use super::db::{Database, DatabaseError};
use super::models::{Device, UpdateChannel, User};

/// Optional filters for [`Database::list_devices`].
#[derive(Debug, Default, Clone)]
pub struct DeviceFilter<'a> {
    pub owner_id: Option<&'a str>,
    pub channel: Option<UpdateChannel>,
    pub online: Option<bool>,
}

impl Database {
    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a new user.
    pub async fn create_user(&self, id: &str, name: &str) -> Result<User, DatabaseError> {
        sqlx::query("INSERT INTO users (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        self.get_user(id).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: &str) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    // =========================================================================
    // Device queries
    // =========================================================================

    /// Register a device with default firmware state.
    pub async fn create_device(
        &self,
        id: &str,
        owner_id: Option<&str>,
        name: &str,
    ) -> Result<Device, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            "INSERT INTO devices (id, owner_id, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(owner_id)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_device(id).await
    }

    /// Get a device by ID.
    pub async fn get_device(&self, id: &str) -> Result<Device, DatabaseError> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }

    /// List devices, optionally filtered by owner, channel and online flag.
    pub async fn list_devices(
        &self,
        filter: &DeviceFilter<'_>,
    ) -> Result<Vec<Device>, DatabaseError> {
        let devices = sqlx::query_as::<_, Device>(
            "SELECT * FROM devices \
             WHERE (?1 IS NULL OR owner_id = ?1) \
               AND (?2 IS NULL OR update_channel = ?2) \
               AND (?3 IS NULL OR online = ?3) \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(filter.owner_id)
        .bind(filter.channel)
        .bind(filter.online)
        .fetch_all(self.pool())
        .await?;

        Ok(devices)
    }

    /// Store the firmware state a device declared when it subscribed.
    pub async fn update_device_subscription(
        &self,
        id: &str,
        platform: &str,
        firmware_version: &str,
        auto_update: bool,
        channel: UpdateChannel,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE devices SET platform = ?, firmware_version = ?, auto_update = ?, update_channel = ?, updated_at = ? WHERE id = ?",
        )
        .bind(platform)
        .bind(firmware_version)
        .bind(auto_update)
        .bind(channel)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a device's connection status. Going online stamps `last_connected`.
    pub async fn set_device_online(
        &self,
        id: &str,
        online: bool,
        last_ip: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE devices SET online = ?1, \
               last_connected = CASE WHEN ?1 THEN ?2 ELSE last_connected END, \
               last_ip = COALESCE(?3, last_ip), \
               updated_at = ?2 \
             WHERE id = ?4",
        )
        .bind(online)
        .bind(now)
        .bind(last_ip)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set a device's installed firmware version.
    pub async fn set_device_firmware_version(
        &self,
        id: &str,
        version: &str,
    ) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE devices SET firmware_version = ?, updated_at = ? WHERE id = ?")
                .bind(version)
                .bind(unix_timestamp())
                .bind(id)
                .execute(self.pool())
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_device_auto_update(
        &self,
        id: &str,
        auto_update: bool,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE devices SET auto_update = ?, updated_at = ? WHERE id = ?")
            .bind(auto_update)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Take the device's next daily message number.
    ///
    /// The first call on a new UTC day returns 1; later calls that day return
    /// the previous value plus one. Read and increment happen in one statement.
    pub async fn next_daily_message_number(&self, id: &str, now: i64) -> Result<i64, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE devices SET \
               daily_message_number = CASE WHEN daily_message_day = ?1 THEN daily_message_number + 1 ELSE 1 END, \
               daily_message_day = ?1 \
             WHERE id = ?2 \
             RETURNING daily_message_number",
        )
        .bind(utc_day(now))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.map(|r| r.0)
            .ok_or_else(|| DatabaseError::NotFound(format!("Device {id}")))
    }
}
