//! Rollout target resolution and per-device eligibility.

use std::cmp::Ordering;
use std::collections::HashSet;

use md5::{Digest, Md5};
use paperminder_core::version;

use crate::storage::{Device, Rollout, RolloutType, UpdateChannel};

/// Which devices a rollout addresses.
///
/// Only the highest-precedence populated criterion applies: channels, then
/// all devices, then owners, then explicit devices, then a bare version range.
/// The version range also narrows a channel selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSpec {
    pub all: bool,
    pub user_ids: Vec<String>,
    pub device_ids: Vec<String>,
    pub channels: Vec<UpdateChannel>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
}

impl TargetSpec {
    pub fn from_rollout(rollout: &Rollout) -> Self {
        Self {
            all: rollout.target_all,
            user_ids: rollout.target_user_ids.0.clone(),
            device_ids: rollout.target_device_ids.0.clone(),
            channels: rollout.target_channels.0.clone(),
            min_version: rollout.min_version.clone(),
            max_version: rollout.max_version.clone(),
        }
    }

    fn has_range(&self) -> bool {
        self.min_version.is_some() || self.max_version.is_some()
    }

    pub fn matches(&self, device: &Device) -> bool {
        if !self.channels.is_empty() {
            return self.channels.contains(&device.update_channel)
                && self.within_range(&device.firmware_version);
        }
        if self.all {
            return true;
        }
        if !self.user_ids.is_empty() {
            return device
                .owner_id
                .as_ref()
                .is_some_and(|owner| self.user_ids.contains(owner));
        }
        if !self.device_ids.is_empty() {
            return self.device_ids.contains(&device.id);
        }
        if self.has_range() {
            return self.within_range(&device.firmware_version);
        }
        false
    }

    /// Matching devices, each listed once, in input order.
    pub fn resolve<'a>(&self, devices: &'a [Device]) -> Vec<&'a Device> {
        let mut seen = HashSet::new();
        devices
            .iter()
            .filter(|d| self.matches(d))
            .filter(|d| seen.insert(d.id.as_str()))
            .collect()
    }

    /// Whether `current` lies inside [min, max]. An unparseable device
    /// version is outside any bounded range.
    fn within_range(&self, current: &str) -> bool {
        let above_min = self.min_version.as_deref().is_none_or(|min| {
            version::compare(current, min).is_ok_and(|o| o != Ordering::Less)
        });
        let below_max = self.max_version.as_deref().is_none_or(|max| {
            version::compare(current, max).is_ok_and(|o| o != Ordering::Greater)
        });
        above_min && below_max
    }
}

/// Stable 0..100 bucket for a device: the first four bytes of the MD5 of its
/// id, big-endian, modulo 100.
pub fn bucket_for(device_id: &str) -> u32 {
    let digest = Md5::digest(device_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) % 100
}

/// Whether a device that matches `rollout` should be offered it at `now`.
pub fn should_update_now(rollout: &Rollout, device_id: &str, now: i64) -> bool {
    match rollout.rollout_type {
        RolloutType::Immediate => true,
        RolloutType::Scheduled => rollout.scheduled_at.is_none_or(|at| now >= at),
        RolloutType::Gradual => i64::from(bucket_for(device_id)) < rollout.percentage,
    }
}
