//! The per-IMEI device state machine: a pure function from a parsed
//! message, the connection's client IP and the current device row to a
//! set of intents. It never performs I/O; the connection handler loads
//! the device row beforehand and carries out the intents (persistence
//! writes, notification dispatch) afterwards. Keeping it pure is what
//! makes the rule set easy to unit test without a runtime.

use crate::model::{Device, PartialDeviceUpdate, TelemetrySample};
use crate::parser::{FrameCategory, Location, ParsedMessage, ReportPayload};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;

/// Dedup window for repeated low-battery notifications.
pub const BATTERY_ALERT_DEDUP: Duration = Duration::minutes(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Block,
    Unblock,
    IpChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandIntent {
    pub kind: CommandKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationIntent {
    pub event_type: &'static str,
    pub imei: String,
    pub plate: Option<String>,
    pub customer_ref: Option<String>,
    pub data: HashMap<String, String>,
}

/// Threshold and clock inputs the reducer needs; everything else comes
/// from the parsed message and the device row.
#[derive(Debug, Clone, Copy)]
pub struct ReducerConfig {
    pub low_battery_volts: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ReduceOutcome {
    pub telemetry: Option<TelemetrySample>,
    pub device_update: Option<PartialDeviceUpdate>,
    pub notifications: Vec<NotificationIntent>,
    pub command_intent: Option<CommandIntent>,
}

fn notification(
    event_type: &'static str,
    device: &Device,
    extra: impl IntoIterator<Item = (&'static str, String)>,
) -> NotificationIntent {
    NotificationIntent {
        event_type,
        imei: device.imei.clone(),
        plate: device.plate.clone(),
        customer_ref: device.customer_ref.clone(),
        data: extra.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
    }
}

fn make_sample(
    imei: &str,
    loc: &Location,
    is_buff: bool,
    now: DateTime<Utc>,
    raw: &str,
) -> TelemetrySample {
    let device_ts_utc = loc.device_ts.map(|ndt| Utc.from_utc_datetime(&ndt));
    let gps_ts_utc = loc.gps_ts.map(|ndt| Utc.from_utc_datetime(&ndt));
    let server_ts = if is_buff {
        device_ts_utc.unwrap_or(now)
    } else {
        now
    };
    TelemetrySample {
        imei: imei.to_string(),
        longitude: loc.longitude,
        latitude: loc.latitude,
        altitude: loc.altitude,
        server_ts,
        device_ts: device_ts_utc,
        gps_ts: gps_ts_utc,
        raw_frame: raw.to_string(),
    }
}

/// Reduce one parsed message against the current device row.
///
/// `device` must be the row as currently persisted (freshly created via
/// [`Device::new`] if this is the IMEI's first-ever frame). The reducer
/// never talks to the store itself.
pub fn reduce(
    msg: &ParsedMessage,
    client_ip: &str,
    device: &Device,
    config: &ReducerConfig,
    now: DateTime<Utc>,
) -> ReduceOutcome {
    let is_buff = msg.category == FrameCategory::Buff;
    let mut update = PartialDeviceUpdate::default();
    let mut notifications = Vec::new();
    let mut telemetry = None;

    // Common prologue. Never runs for +BUFF: buffered frames are pure
    // backfill and must never mutate the device row.
    if !is_buff {
        update.last_seen_at = Some(now);
        if device.last_known_ip.as_deref() != Some(client_ip) {
            if let Some(prev) = &device.last_known_ip {
                notifications.push(notification(
                    "ip_changed",
                    device,
                    [
                        ("old_ip", prev.clone()),
                        ("new_ip", client_ip.to_string()),
                    ],
                ));
            }
            update.last_known_ip = Some(client_ip.to_string());
        }
    }

    match &msg.payload {
        ReportPayload::Location(loc) => {
            telemetry = Some(make_sample(&msg.imei, loc, is_buff, now, &msg.raw));
        }
        ReportPayload::IgnitionOn(loc) => {
            telemetry = Some(make_sample(&msg.imei, loc, is_buff, now, &msg.raw));
            if !is_buff {
                update.ignition_on = Some(true);
                notifications.push(notification("ignition_on", device, []));
            }
        }
        ReportPayload::IgnitionOff(loc) => {
            telemetry = Some(make_sample(&msg.imei, loc, is_buff, now, &msg.raw));
            if !is_buff {
                update.ignition_on = Some(false);
                notifications.push(notification("ignition_off", device, []));
            }
        }
        ReportPayload::Power { voltage, location } => {
            telemetry = Some(make_sample(&msg.imei, location, is_buff, now, &msg.raw));
            if !is_buff {
                if let Some(v) = voltage {
                    update.battery_voltage = Some(*v);
                    if *v < config.low_battery_volts {
                        update.battery_low = Some(true);
                        let should_alert = match device.last_battery_alert_at {
                            None => true,
                            Some(prev) => now - prev >= BATTERY_ALERT_DEDUP,
                        };
                        if should_alert {
                            update.last_battery_alert_at = Some(now);
                            notifications.push(notification(
                                "low_battery",
                                device,
                                [("voltage", v.to_string())],
                            ));
                        }
                    } else {
                        update.battery_low = Some(false);
                    }
                }
            }
        }
        ReportPayload::Heartbeat => {}
        ReportPayload::Motion { .. } => {}
        ReportPayload::Output { status } => {
            if !is_buff && status == "0000" {
                match device.block_cmd_pending {
                    Some(true) => {
                        update.blocked = Some(true);
                        update.block_cmd_pending = Some(None);
                        notifications.push(notification("blocked", device, []));
                    }
                    Some(false) => {
                        update.blocked = Some(false);
                        update.block_cmd_pending = Some(None);
                        notifications.push(notification("unblocked", device, []));
                    }
                    None => {}
                }
            }
        }
        ReportPayload::Migration { status } => {
            if !is_buff && status == "0000" {
                update.ip_change_pending = Some(false);
            }
        }
        ReportPayload::Lifecycle { location, .. } | ReportPayload::Other { location, .. } => {
            telemetry = Some(make_sample(&msg.imei, location, is_buff, now, &msg.raw));
        }
    }

    let mut merged = device.clone();
    merged.apply(&update);
    let command_intent = if let Some(pending) = merged.block_cmd_pending {
        Some(CommandIntent {
            kind: if pending {
                CommandKind::Block
            } else {
                CommandKind::Unblock
            },
        })
    } else if merged.ip_change_pending {
        Some(CommandIntent {
            kind: CommandKind::IpChange,
        })
    } else {
        None
    };

    ReduceOutcome {
        telemetry,
        device_update: Some(update),
        notifications,
        command_intent,
    }
}
