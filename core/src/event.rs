//! The ingress record envelope and its validation.
//!
//! A raw log payload becomes an [`Event`] only when it is well-formed JSON and
//! carries every required field with a known event type. Anything else is a
//! malformed record and goes to the dead-letter log.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EventError;

/// Event time and arrival time are both epoch milliseconds.
pub type EventTime = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    VideoStart,
    VideoPause,
    VideoStop,
    VideoComplete,
    BufferEvent,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::VideoStart,
        EventKind::VideoPause,
        EventKind::VideoStop,
        EventKind::VideoComplete,
        EventKind::BufferEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VideoStart => "video_start",
            EventKind::VideoPause => "video_pause",
            EventKind::VideoStop => "video_stop",
            EventKind::VideoComplete => "video_complete",
            EventKind::BufferEvent => "buffer_event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == s)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    SmartTv,
    Mobile,
    Tablet,
    Desktop,
    GameConsole,
    StreamingStick,
}

impl DeviceType {
    const ALL: [DeviceType; 6] = [
        DeviceType::SmartTv,
        DeviceType::Mobile,
        DeviceType::Tablet,
        DeviceType::Desktop,
        DeviceType::GameConsole,
        DeviceType::StreamingStick,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::SmartTv => "smart_tv",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
            DeviceType::Desktop => "desktop",
            DeviceType::GameConsole => "game_console",
            DeviceType::StreamingStick => "streaming_stick",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|device| device.as_str() == s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// A validated viewing event. Immutable once ingested.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub event_id: Option<String>,
    pub kind: EventKind,
    pub user_id: String,
    pub session_id: Option<String>,
    pub content_id: String,
    pub content_title: Option<String>,
    pub content_type: Option<String>,
    /// Producer-assigned event time.
    pub event_time: EventTime,
    /// Time the log accepted the record.
    pub arrival_time: EventTime,
    pub duration_seconds: f64,
    pub device_type: Option<DeviceType>,
    pub location: Location,
    pub buffer_duration_ms: Option<f64>,
    pub subscription_tier: Option<String>,
}

impl Event {
    /// Parses and validates one ingress payload.
    ///
    /// Only unparsable JSON, or JSON that is not an object, is a parse error.
    /// Every field problem is collected into one validation error.
    pub fn parse(payload: &[u8], arrival_time: EventTime) -> Result<Self, EventError> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| EventError::Parse {
            reason: e.to_string(),
        })?;
        let raw = match value {
            Value::Object(raw) => raw,
            other => {
                return Err(EventError::Parse {
                    reason: format!("expected a JSON object, got {}", json_type(&other)),
                });
            }
        };

        let mut fields = FieldReader {
            raw: &raw,
            errors: Vec::new(),
        };

        let kind = fields.required_string("event_type").and_then(|s| {
            let kind = EventKind::parse(&s);
            if kind.is_none() {
                fields.errors.push(format!("invalid event_type: {s}"));
            }
            kind
        });
        let user_id = fields.required_string("user_id");

        let content_id = match raw.get("content_id") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Null) | Some(Value::String(_)) | None => {
                fields.errors.push("missing required field: content_id".to_string());
                None
            }
            Some(other) => {
                fields.errors.push(format!("invalid content_id: {other}"));
                None
            }
        };

        let event_time = match raw.get("timestamp") {
            None | Some(Value::Null) => {
                fields.errors.push("missing required field: timestamp".to_string());
                None
            }
            Some(value) => {
                let parsed = parse_timestamp(value);
                if parsed.is_none() {
                    fields.errors.push(format!("invalid timestamp: {value}"));
                }
                parsed
            }
        };

        let device_type = fields.optional_string("device_type").and_then(|s| {
            let device = DeviceType::parse(&s);
            if device.is_none() {
                fields.errors.push(format!("invalid device_type: {s}"));
            }
            device
        });

        let location = match raw.get("location") {
            None | Some(Value::Null) => Location::default(),
            Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
                fields.errors.push(format!("invalid location: {e}"));
                Location::default()
            }),
        };

        let event_id = fields.optional_string("event_id");
        let session_id = fields.optional_string("session_id");
        let content_title = fields.optional_string("content_title");
        let content_type = fields.optional_string("content_type");
        let subscription_tier = fields.optional_string("subscription_tier");
        let duration_seconds = fields.optional_number("duration_seconds");
        let buffer_duration_ms = fields.optional_number("buffer_duration_ms");

        let errors = fields.errors;
        match (kind, user_id, content_id, event_time) {
            (Some(kind), Some(user_id), Some(content_id), Some(event_time)) if errors.is_empty() => {
                Ok(Event {
                    event_id,
                    kind,
                    user_id,
                    session_id,
                    content_id,
                    content_title,
                    content_type,
                    event_time,
                    arrival_time,
                    duration_seconds: duration_seconds.unwrap_or(0.0),
                    device_type,
                    location,
                    buffer_duration_ms,
                    subscription_tier,
                })
            }
            _ => Err(EventError::Validation { errors }),
        }
    }

    /// String value of a grouping dimension, if the event carries it.
    pub fn dimension(&self, field: Field) -> Option<String> {
        match field {
            Field::ContentId => Some(self.content_id.clone()),
            Field::ContentTitle => self.content_title.clone(),
            Field::ContentType => self.content_type.clone(),
            Field::UserId => Some(self.user_id.clone()),
            Field::SessionId => self.session_id.clone(),
            Field::DeviceType => self.device_type.map(|d| d.as_str().to_string()),
            Field::Country => self.location.country.clone(),
            Field::Region => self.location.region.clone(),
            Field::City => self.location.city.clone(),
            Field::SubscriptionTier => self.subscription_tier.clone(),
            Field::EventType => Some(self.kind.as_str().to_string()),
            Field::DurationSeconds => Some(self.duration_seconds.to_string()),
            Field::BufferDurationMs => self.buffer_duration_ms.map(|v| v.to_string()),
        }
    }

    /// Numeric value of a measure field. Dimension fields have none.
    pub fn measure(&self, field: Field) -> Option<f64> {
        match field {
            Field::DurationSeconds => Some(self.duration_seconds),
            Field::BufferDurationMs => self.buffer_duration_ms,
            _ => None,
        }
    }
}

/// Envelope fields usable as grouping keys or aggregation inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    ContentId,
    ContentTitle,
    ContentType,
    UserId,
    SessionId,
    DeviceType,
    Country,
    Region,
    City,
    SubscriptionTier,
    EventType,
    DurationSeconds,
    BufferDurationMs,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::ContentId => "content_id",
            Field::ContentTitle => "content_title",
            Field::ContentType => "content_type",
            Field::UserId => "user_id",
            Field::SessionId => "session_id",
            Field::DeviceType => "device_type",
            Field::Country => "country",
            Field::Region => "region",
            Field::City => "city",
            Field::SubscriptionTier => "subscription_tier",
            Field::EventType => "event_type",
            Field::DurationSeconds => "duration_seconds",
            Field::BufferDurationMs => "buffer_duration_ms",
        }
    }

    pub fn is_measure(&self) -> bool {
        matches!(self, Field::DurationSeconds | Field::BufferDurationMs)
    }
}

/// Reads optional envelope fields, recording any of the wrong JSON type.
struct FieldReader<'a> {
    raw: &'a Map<String, Value>,
    errors: Vec<String>,
}

impl FieldReader<'_> {
    fn optional_string(&mut self, name: &str) -> Option<String> {
        let raw = self.raw;
        match raw.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                self.errors.push(format!("invalid {name}: expected a string, got {}", json_type(other)));
                None
            }
        }
    }

    fn required_string(&mut self, name: &str) -> Option<String> {
        let missing = match self.raw.get(name) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            self.errors.push(format!("missing required field: {name}"));
            return None;
        }
        self.optional_string(name)
    }

    fn optional_number(&mut self, name: &str) -> Option<f64> {
        let raw = self.raw;
        match raw.get(name) {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(other) => {
                self.errors.push(format!("invalid {name}: expected a number, got {}", json_type(other)));
                None
            }
        }
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Event times run from the epoch to the end of chrono's calendar.
fn parse_timestamp(value: &Value) -> Option<EventTime> {
    let millis = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => dt.timestamp_millis(),
            // Producers occasionally omit the offset; those are UTC.
            Err(_) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()?
                .and_utc()
                .timestamp_millis(),
        },
        _ => return None,
    };
    (millis >= 0 && DateTime::<Utc>::from_timestamp_millis(millis).is_some()).then_some(millis)
}

/// RFC 3339 rendering of an epoch-millisecond time, e.g. `2025-01-15T14:30:00.000Z`.
pub fn format_time(time: EventTime) -> String {
    DateTime::<Utc>::from_timestamp_millis(time)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| time.to_string())
}

/// Start of the UTC hour containing `time`, e.g. `2025-01-15T14:00:00Z`.
pub fn hour_bucket(time: EventTime) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(time).map(|dt| dt.format("%Y-%m-%dT%H:00:00Z").to_string())
}

/// `(YYYY-MM-DD, HH)` bucket of an epoch-millisecond time, in UTC.
pub fn date_hour(time: EventTime) -> (String, String) {
    match DateTime::<Utc>::from_timestamp_millis(time) {
        Some(dt) => (dt.format("%Y-%m-%d").to_string(), dt.format("%H").to_string()),
        None => ("1970-01-01".to_string(), "00".to_string()),
    }
}
