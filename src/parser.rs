//! Positional decoding of `@Track` frames into a typed [`ParsedMessage`].
//!
//! The parser is positional (fields are comma-separated within
//! `<header>:<payload>`), not regex-driven except for header discrimination.
//! Field indices below are 0-based within the comma-split payload, counting
//! the report type itself as field 0 — this matches the original
//! implementation's `fields = data.split(',')` indexing exactly, so the
//! offsets quoted in doc comments are bit-exact requirements.

use chrono::NaiveDateTime;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame has no ':' separating header from payload")]
    MissingHeader,
    #[error("unrecognized frame category {0:?}")]
    UnknownCategory(String),
    #[error("empty payload")]
    EmptyPayload,
    #[error("{report_type} needs at least {expected} fields, got {got}")]
    InsufficientFields {
        report_type: String,
        expected: usize,
        got: usize,
    },
}

/// Which of the three `@Track` frame categories a message arrived as.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameCategory {
    /// Real-time report.
    Resp,
    /// Replayed backlog — the device was offline and is flushing its store.
    Buff,
    /// Reply to a server-issued command.
    Ack,
}

impl FrameCategory {
    fn from_header(header: &str) -> Result<Self, ParseError> {
        match header {
            "+RESP" => Ok(FrameCategory::Resp),
            "+BUFF" => Ok(FrameCategory::Buff),
            "+ACK" => Ok(FrameCategory::Ack),
            other => Err(ParseError::UnknownCategory(other.to_string())),
        }
    }
}

/// GPS fix plus device-local timestamp, shared by every location-bearing
/// report type (the offsets differ per report type; see the parse
/// functions below).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub speed: Option<f64>,
    pub altitude: Option<f64>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
    /// The GPS fix timestamp carried as a plain positional field (`GTFRI`
    /// field 13 — `None` for report types that don't carry a distinct one).
    pub gps_ts: Option<NaiveDateTime>,
    /// The device-clock timestamp. For `GTFRI` this is *not* simply field
    /// 13: it's recovered by [`extract_device_timestamp`]'s backward scan,
    /// since the original implementation's field layout drifts near the end
    /// of the frame (mcc/mnc/lac/cell/odometer/count are optional and shift
    /// position). Other report types read it at a fixed offset instead.
    pub device_ts: Option<NaiveDateTime>,
}

/// A location-bearing lifecycle event recognized by the parser but not
/// singled out with its own reducer rule (it still gets telemetry and an
/// ACK — see SPEC_FULL.md §4.2.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    PowerOn,
    PowerOff,
    MovingAlert,
    StopMovingAlert,
    BatteryCharging,
    StatusChange,
}

/// A report type recognized by the parser but with no reducer rule at all
/// beyond telemetry + ACK (SPEC_FULL.md §4.2.1): SOS, geofence, speed,
/// towing, disconnection and I/O-status alerts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherAlert {
    pub report_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportPayload {
    /// `GTFRI` — fixed location report.
    Location(Location),
    /// `GTIGN` — ignition turned on.
    IgnitionOn(Location),
    /// `GTIGF` — ignition turned off.
    IgnitionOff(Location),
    /// `GTOUT` — immobiliser status echo / command ack. `status == "0000"`
    /// means the requested state took effect.
    Output { status: String },
    /// `GTEPS` — external power status, voltage plus a location fix.
    Power {
        voltage: Option<f32>,
        location: Location,
    },
    /// `GTHBD` — heartbeat. Carries no payload beyond the IMEI, but is a
    /// full command-dispatch opportunity (see `dispatcher`).
    Heartbeat,
    /// `GTSTT` — motion state transition. `code` is one of the raw motion
    /// codes (`11`/`12`/`21`/`22`/`41`/`42`).
    Motion { code: String },
    /// `GTSRI` — server-migration command ack.
    Migration { status: String },
    /// `GTPNA`/`GTPFA`/`GTMPN`/`GTMPF`/`GTBTC`/`GTSTC`.
    Lifecycle {
        event: LifecycleEvent,
        location: Location,
    },
    /// Recognized-but-unhandled location-bearing alert types.
    Other {
        alert: OtherAlert,
        location: Location,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    pub category: FrameCategory,
    pub report_type: String,
    pub protocol_version: Option<String>,
    pub imei: String,
    pub count: Option<u32>,
    pub payload: ReportPayload,
    pub raw: String,
}

/// Parse a complete frame (as yielded by [`crate::codec::FrameCodec`]) into
/// a [`ParsedMessage`].
///
/// Unrecognized report types are not an error at the top level — callers
/// should treat `Err` only as "log and send no ACK", matching SPEC_FULL.md
/// §7: a parse failure on a recognized header is non-fatal and a connection
/// is never torn down because of it.
pub fn parse_frame(raw: &str) -> Result<ParsedMessage, ParseError> {
    let (header, payload) = raw.split_once(':').ok_or(ParseError::MissingHeader)?;
    let category = FrameCategory::from_header(header)?;
    if payload.is_empty() {
        return Err(ParseError::EmptyPayload);
    }
    let fields: Vec<&str> = payload.split(',').collect();
    if fields.len() < 3 {
        return Err(ParseError::InsufficientFields {
            report_type: fields.first().copied().unwrap_or("").to_string(),
            expected: 3,
            got: fields.len(),
        });
    }
    let report_type = fields[0].to_string();
    let protocol_version = field(&fields, 1);
    let imei = field(&fields, 2)
        .ok_or_else(|| ParseError::InsufficientFields {
            report_type: report_type.clone(),
            expected: 3,
            got: fields.len(),
        })?
        .to_string();

    let payload = match report_type.as_str() {
        "GTFRI" => parse_gtfri(&fields, &report_type)?,
        "GTIGN" => ReportPayload::IgnitionOn(parse_ignition_location(&fields)),
        "GTIGF" => ReportPayload::IgnitionOff(parse_ignition_location(&fields)),
        "GTOUT" => parse_gtout(&fields, &report_type)?,
        "GTEPS" => parse_gteps(&fields, &report_type)?,
        "GTHBD" => ReportPayload::Heartbeat,
        "GTSTT" => parse_gtstt(&fields, &report_type)?,
        "GTSRI" => parse_gtsri(&fields, &report_type)?,
        "GTPNA" => ReportPayload::Lifecycle {
            event: LifecycleEvent::PowerOn,
            location: parse_ignition_location(&fields),
        },
        "GTPFA" => ReportPayload::Lifecycle {
            event: LifecycleEvent::PowerOff,
            location: parse_ignition_location(&fields),
        },
        "GTMPN" => ReportPayload::Lifecycle {
            event: LifecycleEvent::MovingAlert,
            location: parse_ignition_location(&fields),
        },
        "GTMPF" => ReportPayload::Lifecycle {
            event: LifecycleEvent::StopMovingAlert,
            location: parse_ignition_location(&fields),
        },
        "GTBTC" => ReportPayload::Lifecycle {
            event: LifecycleEvent::BatteryCharging,
            location: parse_ignition_location(&fields),
        },
        "GTSTC" => ReportPayload::Lifecycle {
            event: LifecycleEvent::StatusChange,
            location: parse_ignition_location(&fields),
        },
        "GTSOS" | "GTRTL" | "GTTOW" | "GTDIS" | "GTIOB" | "GTSPD" | "GTGEO" => {
            ReportPayload::Other {
                alert: OtherAlert {
                    report_type: report_type.clone(),
                },
                location: parse_ignition_location(&fields),
            }
        }
        other => {
            return Err(ParseError::InsufficientFields {
                report_type: other.to_string(),
                expected: 0,
                got: 0,
            })
        }
    };

    let count = field(&fields, 12).and_then(|s| s.trim().parse::<u32>().ok());

    Ok(ParsedMessage {
        category,
        report_type,
        protocol_version,
        imei,
        count,
        payload,
        raw: raw.to_string(),
    })
}

fn field<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    fields.get(idx).map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn parse_f64(fields: &[&str], idx: usize) -> Option<f64> {
    field(fields, idx).and_then(|s| s.parse::<f64>().ok())
}

fn parse_f32(fields: &[&str], idx: usize) -> Option<f32> {
    field(fields, idx).and_then(|s| s.parse::<f32>().ok())
}

/// `GTFRI`: `speed@8, altitude@10, longitude@11, latitude@12, gps_ts@13`,
/// `device_ts` recovered via [`extract_device_timestamp`]'s backward scan
/// rather than a fixed offset (spec.md's GTFRI row; SPEC_FULL.md §4.2).
fn parse_gtfri(fields: &[&str], report_type: &str) -> Result<ReportPayload, ParseError> {
    if fields.len() < 14 {
        return Err(ParseError::InsufficientFields {
            report_type: report_type.to_string(),
            expected: 14,
            got: fields.len(),
        });
    }
    Ok(ReportPayload::Location(Location {
        speed: parse_f64(fields, 8),
        altitude: parse_f64(fields, 10),
        longitude: parse_f64(fields, 11),
        latitude: parse_f64(fields, 12),
        gps_ts: field(fields, 13).and_then(parse_device_timestamp),
        device_ts: extract_device_timestamp(fields),
    }))
}

/// Recover the device-clock timestamp for a `GTFRI` frame by scanning the
/// last four fields (mirroring `original_source/gv50/protocol_parser.py::
/// _extract_device_timestamp`'s `range(len(fields) - 1, len(fields) - 5,
/// -1)` window) from the end backward, returning the first token that is
/// exactly 14 ASCII digits and a valid device timestamp. This exists
/// because trailing optional fields (mcc/mnc/lac/cell id/reserved/odometer/
/// count) shift the real device timestamp off a fixed offset near the end
/// of the frame, unlike every other report type's `device_ts`.
fn extract_device_timestamp(fields: &[&str]) -> Option<NaiveDateTime> {
    let len = fields.len();
    let lo = len.saturating_sub(5);
    (lo.saturating_add(1)..len).rev().find_map(|i| {
        let candidate = fields[i].trim();
        if candidate.len() == 14 && candidate.bytes().all(|b| b.is_ascii_digit()) {
            parse_device_timestamp(candidate)
        } else {
            None
        }
    })
}

/// Shared offsets for `GTIGN`/`GTIGF`/lifecycle/other-alert frames:
/// `speed@6, altitude@8, longitude@9, latitude@10, device_ts@11`.
fn parse_ignition_location(fields: &[&str]) -> Location {
    Location {
        speed: parse_f64(fields, 6),
        altitude: parse_f64(fields, 8),
        longitude: parse_f64(fields, 9),
        latitude: parse_f64(fields, 10),
        gps_ts: None,
        device_ts: field(fields, 11).and_then(parse_device_timestamp),
    }
}

/// `GTOUT`: `status@4`.
fn parse_gtout(fields: &[&str], report_type: &str) -> Result<ReportPayload, ParseError> {
    if fields.len() < 5 {
        return Err(ParseError::InsufficientFields {
            report_type: report_type.to_string(),
            expected: 5,
            got: fields.len(),
        });
    }
    Ok(ReportPayload::Output {
        status: field(fields, 4).unwrap_or_default().to_string(),
    })
}

/// `GTEPS`: `voltage@17`, location at the `GTIGN` offsets.
fn parse_gteps(fields: &[&str], report_type: &str) -> Result<ReportPayload, ParseError> {
    if fields.len() < 18 {
        return Err(ParseError::InsufficientFields {
            report_type: report_type.to_string(),
            expected: 18,
            got: fields.len(),
        });
    }
    Ok(ReportPayload::Power {
        voltage: parse_f32(fields, 17),
        location: parse_ignition_location(fields),
    })
}

/// `GTSTT`: `motion_code@4`.
fn parse_gtstt(fields: &[&str], report_type: &str) -> Result<ReportPayload, ParseError> {
    if fields.len() < 5 {
        return Err(ParseError::InsufficientFields {
            report_type: report_type.to_string(),
            expected: 5,
            got: fields.len(),
        });
    }
    Ok(ReportPayload::Motion {
        code: field(fields, 4).unwrap_or_default().to_string(),
    })
}

/// `GTSRI`: `status@4`.
fn parse_gtsri(fields: &[&str], report_type: &str) -> Result<ReportPayload, ParseError> {
    if fields.len() < 5 {
        return Err(ParseError::InsufficientFields {
            report_type: report_type.to_string(),
            expected: 5,
            got: fields.len(),
        });
    }
    Ok(ReportPayload::Migration {
        status: field(fields, 4).unwrap_or_default().to_string(),
    })
}

/// Parse a `YYYYMMDDHHMMSS` device timestamp, range-validating every
/// component. Out-of-range values and the literal `0000` both yield `None`
/// without this being treated as a parse failure of the enclosing frame.
pub fn parse_device_timestamp(s: &str) -> Option<NaiveDateTime> {
    if s == "0000" || s.len() != 14 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year: i32 = s[0..4].parse().ok()?;
    let month: u32 = s[4..6].parse().ok()?;
    let day: u32 = s[6..8].parse().ok()?;
    let hour: u32 = s[8..10].parse().ok()?;
    let minute: u32 = s[10..12].parse().ok()?;
    let second: u32 = s[12..14].parse().ok()?;

    if !(1900..=2100).contains(&year)
        || !(1..=12).contains(&month)
        || !(1..=31).contains(&day)
        || hour > 23
        || minute > 59
        || second > 59
    {
        return None;
    }

    chrono::NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `speed@8=0, altitude@10=50.0, longitude@11=100.0, latitude@12=20.0,
    /// gps_ts@13=20250727122605`, with `device_ts` placed at index 17 (one
    /// field ahead of the trailing count) so it falls inside
    /// [`extract_device_timestamp`]'s four-field backward-scan window —
    /// this is deliberately *not* the same index as `gps_ts`, so tests can
    /// tell the two fields apart.
    fn gtfri(imei: &str, device_ts: &str) -> String {
        format!(
            "+RESP:GTFRI,090200,{imei},gv50,0,0,0,0,0,0,50.0,100.0,20.0,20250727122605,0,0,0,{device_ts},0001"
        )
    }

    #[test]
    fn parses_gtfri_fields() {
        let raw = gtfri("865083030049613", "20250727122700");
        let msg = parse_frame(&raw).unwrap();
        assert_eq!(msg.category, FrameCategory::Resp);
        assert_eq!(msg.imei, "865083030049613");
        match msg.payload {
            ReportPayload::Location(loc) => {
                assert_eq!(loc.altitude, Some(50.0));
                assert_eq!(loc.longitude, Some(100.0));
                assert_eq!(loc.latitude, Some(20.0));
                assert_eq!(loc.gps_ts, parse_device_timestamp("20250727122605"));
                assert_eq!(loc.device_ts, parse_device_timestamp("20250727122700"));
                assert_ne!(loc.gps_ts, loc.device_ts);
            }
            _ => panic!("expected Location"),
        }
    }

    #[test]
    fn imei_matches_field_2_for_every_well_formed_frame() {
        for raw in [
            gtfri("865083030049613", "20250727122605"),
            "+RESP:GTIGN,090200,123456789012345,gv50,0,0,0,10,100.0,20.0,20250727122605,0,0001"
                .to_string(),
            "+ACK:GTOUT,090200,999999999999999,gv50,0000,0,0001".to_string(),
        ] {
            let msg = parse_frame(&raw).unwrap();
            let field2 = raw.split(':').nth(1).unwrap().split(',').nth(2).unwrap();
            assert_eq!(msg.imei, field2);
        }
    }

    #[test]
    fn zero_device_timestamp_is_null_without_rejecting_frame() {
        let raw = gtfri("865083030049613", "0000");
        let msg = parse_frame(&raw).unwrap();
        match msg.payload {
            ReportPayload::Location(loc) => assert!(loc.device_ts.is_none()),
            _ => panic!("expected Location"),
        }
    }

    #[test]
    fn out_of_range_timestamp_components_are_null() {
        assert!(parse_device_timestamp("99991332999999").is_none());
        assert!(parse_device_timestamp("20250732120000").is_none());
        assert!(parse_device_timestamp("20250101256000").is_none());
    }

    #[test]
    fn gtout_status_echo() {
        let raw = "+ACK:GTOUT,090200,865083030049613,gv50,0000,20250727122605,0001";
        let msg = parse_frame(raw).unwrap();
        assert_eq!(msg.category, FrameCategory::Ack);
        match msg.payload {
            ReportPayload::Output { status } => assert_eq!(status, "0000"),
            _ => panic!("expected Output"),
        }
    }

    #[test]
    fn heartbeat_has_no_payload_fields() {
        let raw = "+ACK:GTHBD,090200,865083030049613,gv50,20250727122605,0001";
        let msg = parse_frame(raw).unwrap();
        assert!(matches!(msg.payload, ReportPayload::Heartbeat));
    }

    #[test]
    fn unknown_header_is_rejected() {
        let err = parse_frame("+WAT:GTFRI,1,2,3").unwrap_err();
        assert_eq!(err, ParseError::UnknownCategory("+WAT".to_string()));
    }

    #[test]
    fn missing_colon_is_rejected() {
        let err = parse_frame("garbage").unwrap_err();
        assert_eq!(err, ParseError::MissingHeader);
    }

    #[test]
    fn eps_parses_voltage_and_location() {
        // GTIGN-family offsets: speed@6, altitude@8, longitude@9, latitude@10,
        // device_ts@11; GTEPS additionally carries voltage@17.
        let raw = "+RESP:GTEPS,090200,865083030049613,gv50,0,0,0,0,50.0,100.0,20.0,20250727122605,0,0,0,0,0,11.20,0001";
        let msg = parse_frame(raw).unwrap();
        match msg.payload {
            ReportPayload::Power { voltage, location } => {
                assert_eq!(voltage, Some(11.20));
                assert_eq!(location.altitude, Some(50.0));
                assert_eq!(location.longitude, Some(100.0));
                assert_eq!(location.latitude, Some(20.0));
                assert_eq!(location.device_ts, parse_device_timestamp("20250727122605"));
            }
            _ => panic!("expected Power"),
        }
    }

    #[test]
    fn other_alert_types_are_recognized_with_location() {
        for rt in ["GTSOS", "GTRTL", "GTTOW", "GTDIS", "GTIOB", "GTSPD", "GTGEO"] {
            let raw = format!(
                "+RESP:{rt},090200,865083030049613,gv50,0,0,0,10,100.0,20.0,20250727122605,0,0001"
            );
            let msg = parse_frame(&raw).unwrap();
            match msg.payload {
                ReportPayload::Other { alert, .. } => assert_eq!(alert.report_type, rt),
                _ => panic!("expected Other for {rt}"),
            }
        }
    }
}
