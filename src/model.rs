//! The persisted rows the core reads and writes through the [`crate::store`]
//! contract, plus the in-memory connection record owned by the
//! [`crate::registry`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device row, keyed by IMEI.
///
/// Invariants (enforced by [`crate::reducer`], not by this type): `blocked
/// == true` only ever follows a confirmed `GTOUT` status of `0000` while
/// `block_cmd_pending == Some(true)`; `block_cmd_pending == None` means the
/// device is at equilibrium with no admin-requested intent outstanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(test, derive(PartialEq))]
pub struct Device {
    pub imei: String,
    pub plate: Option<String>,
    pub customer_ref: Option<String>,
    pub ignition_on: bool,
    pub blocked: bool,
    /// `Some(true)` = block requested, `Some(false)` = unblock requested,
    /// `None` = no pending intent.
    pub block_cmd_pending: Option<bool>,
    pub ip_change_pending: bool,
    pub battery_voltage: Option<f32>,
    pub battery_low: bool,
    pub last_battery_alert_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Last client IP observed on an inbound frame. Purely informational,
    /// does not gate `ip_change_pending`.
    pub last_known_ip: Option<String>,
}

impl Device {
    /// A freshly lazily-created row for an IMEI the store has never seen.
    pub fn new(imei: impl Into<String>) -> Self {
        Device {
            imei: imei.into(),
            plate: None,
            customer_ref: None,
            ignition_on: false,
            blocked: false,
            block_cmd_pending: None,
            ip_change_pending: false,
            battery_voltage: None,
            battery_low: false,
            last_battery_alert_at: None,
            last_seen_at: None,
            last_known_ip: None,
        }
    }

    /// Apply a sparse update in place, field by field, last-writer-wins.
    pub fn apply(&mut self, update: &PartialDeviceUpdate) {
        if let Some(v) = update.ignition_on {
            self.ignition_on = v;
        }
        if let Some(v) = update.blocked {
            self.blocked = v;
        }
        if let Some(v) = &update.block_cmd_pending {
            self.block_cmd_pending = *v;
        }
        if let Some(v) = update.ip_change_pending {
            self.ip_change_pending = v;
        }
        if let Some(v) = update.battery_voltage {
            self.battery_voltage = Some(v);
        }
        if let Some(v) = update.battery_low {
            self.battery_low = v;
        }
        if let Some(v) = update.last_battery_alert_at {
            self.last_battery_alert_at = Some(v);
        }
        if let Some(v) = update.last_seen_at {
            self.last_seen_at = Some(v);
        }
        if let Some(v) = &update.last_known_ip {
            self.last_known_ip = Some(v.clone());
        }
    }
}

/// A sparse, field-level update produced by the reducer and applied
/// atomically by the store. `None` means "leave unchanged"; this is why
/// `block_cmd_pending` is `Option<Option<bool>>` — the outer `Option`
/// marks "no change to this field", the inner one is the ternary value
/// itself (set it, or clear it back to equilibrium).
#[derive(Debug, Clone, Default)]
pub struct PartialDeviceUpdate {
    pub ignition_on: Option<bool>,
    pub blocked: Option<bool>,
    pub block_cmd_pending: Option<Option<bool>>,
    pub ip_change_pending: Option<bool>,
    pub battery_voltage: Option<f32>,
    pub battery_low: Option<bool>,
    pub last_battery_alert_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub last_known_ip: Option<String>,
}

/// An append-only telemetry sample. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub imei: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    pub altitude: Option<f64>,
    pub server_ts: DateTime<Utc>,
    pub device_ts: Option<DateTime<Utc>>,
    /// The GPS fix timestamp carried as its own positional field, distinct
    /// from `device_ts` (see [`crate::parser::Location::gps_ts`]). `None`
    /// for report types that don't carry one.
    pub gps_ts: Option<DateTime<Utc>>,
    pub raw_frame: String,
}

/// A customer row, dereferenced only to obtain `fcm_token` for notification
/// targeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub fcm_token: Option<String>,
}
