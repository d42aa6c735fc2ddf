use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::warn;

use crate::{parse_timestamp, EntityId, SoilError};

const RAIN_AMOUNT_KEYS: &[&str] = &["amount_mm", "rain_mm", "rainfall_mm", "amount"];
const IRRIGATION_AMOUNT_KEYS: &[&str] = &["liters", "water_liters"];
const SUBTYPE_KEYS: &[&str] = &["kind", "type"];
const MASS_KEYS: &[&str] = &["amount_kg", "amount"];
const CROP_KEYS: &[&str] = &["crop", "crop_name"];

/// Shortcut event type used by quick-action clients: 25 mm of rain.
const RAIN_SHORTCUT: &str = "rain25";
const RAIN_SHORTCUT_MM: f64 = 25.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Rain,
    Irrigation,
    Fertilizer,
    Harvest,
    Amendment,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rain => "rain",
            Self::Irrigation => "irrigation",
            Self::Fertilizer => "fertilizer",
            Self::Harvest => "harvest",
            Self::Amendment => "amendment",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rain" => Some(Self::Rain),
            "irrigation" => Some(Self::Irrigation),
            "fertilizer" => Some(Self::Fertilizer),
            "harvest" => Some(Self::Harvest),
            "amendment" => Some(Self::Amendment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Manual,
    Historical,
    Live,
}

impl SourceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Historical => "historical",
            Self::Live => "live",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "historical" => Some(Self::Historical),
            "live" => Some(Self::Live),
            _ => None,
        }
    }
}

/// Names the physical source an event came from. `source_id` must be unique
/// across the sources merged in one batch pass.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Provenance {
    pub kind: SourceKind,
    pub source_id: String,
}

impl Provenance {
    #[must_use]
    pub fn new(kind: SourceKind, source_id: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
        }
    }

    /// # Errors
    /// Returns [`SoilError::Configuration`] when `source_id` is blank.
    pub fn validate(&self) -> Result<(), SoilError> {
        if self.source_id.trim().is_empty() {
            return Err(SoilError::Configuration(
                "provenance source_id MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Display for Provenance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.source_id)
    }
}

/// Canonical, validated event payload. `Malformed` and `Unrecognized` records
/// are kept in the log but carry no effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    Rain { amount_mm: f64 },
    Irrigation { liters: f64 },
    Fertilizer { kind: String, amount_kg: f64 },
    Harvest { crop: String },
    Amendment { kind: String, amount_kg: f64 },
    Malformed { declared_type: String, reason: String },
    Unrecognized { declared_type: String },
}

impl EventKind {
    /// Storage tag of the variant, matching the serde `event_type` field.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Rain { .. } => "rain",
            Self::Irrigation { .. } => "irrigation",
            Self::Fertilizer { .. } => "fertilizer",
            Self::Harvest { .. } => "harvest",
            Self::Amendment { .. } => "amendment",
            Self::Malformed { .. } => "malformed",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    #[must_use]
    pub fn event_type(&self) -> Option<EventType> {
        match self {
            Self::Rain { .. } => Some(EventType::Rain),
            Self::Irrigation { .. } => Some(EventType::Irrigation),
            Self::Fertilizer { .. } => Some(EventType::Fertilizer),
            Self::Harvest { .. } => Some(EventType::Harvest),
            Self::Amendment { .. } => Some(EventType::Amendment),
            Self::Malformed { .. } | Self::Unrecognized { .. } => None,
        }
    }

    /// Rebuilds a kind from its stored `(tag, payload)` pair.
    ///
    /// # Errors
    /// Returns [`SoilError::Validation`] when the pair does not decode.
    pub fn from_parts(tag: &str, payload: Value) -> Result<Self, SoilError> {
        let mut envelope = Map::new();
        envelope.insert("event_type".to_string(), Value::String(tag.to_string()));
        envelope.insert("payload".to_string(), payload);
        serde_json::from_value(Value::Object(envelope))
            .map_err(|err| SoilError::Validation(format!("invalid stored event `{tag}`: {err}")))
    }

    /// The payload half of the serde representation.
    #[must_use]
    pub fn payload(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoilEvent {
    pub user_id: EntityId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub kind: EventKind,
}

impl SoilEvent {
    #[must_use]
    pub fn new(user_id: impl Into<String>, timestamp: OffsetDateTime, kind: EventKind) -> Self {
        Self {
            user_id: EntityId::from(user_id.into().as_str()),
            timestamp,
            kind,
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.user_id, self.timestamp, &self.kind)
    }
}

/// Uninterpreted event as received from a client or stream file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub user_id: String,
    pub timestamp: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// SHA-256 over the `(user_id, timestamp, event_type, payload)` identity.
#[must_use]
pub fn fingerprint(user_id: &EntityId, timestamp: OffsetDateTime, kind: &EventKind) -> String {
    let kind_json = serde_json::to_string(kind).unwrap_or_else(|_| format!("{kind:?}"));
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_str().as_bytes());
    hasher.update([0x1f_u8]);
    hasher.update(timestamp.unix_timestamp_nanos().to_be_bytes());
    hasher.update([0x1f_u8]);
    hasher.update(kind_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validates a raw event at the ingestion boundary.
///
/// Payload problems never fail: they yield a zero-effect `Malformed` or
/// `Unrecognized` kind so one bad record cannot block aggregation.
///
/// # Errors
/// Returns [`SoilError::Validation`] when the event cannot be attributed to an
/// entity or placed in time (blank `user_id`, unparseable timestamp).
pub fn normalize_event(raw: &RawEvent) -> Result<SoilEvent, SoilError> {
    let user_id = EntityId::parse(&raw.user_id)?;
    let timestamp = parse_timestamp(&raw.timestamp)?;
    let kind = normalize_kind(&raw.event_type, &raw.payload);

    match &kind {
        EventKind::Malformed {
            declared_type,
            reason,
        } => warn!(
            user_id = %user_id,
            declared_type = %declared_type,
            reason = %reason,
            "malformed event kept with zero effect"
        ),
        EventKind::Unrecognized { declared_type } => warn!(
            user_id = %user_id,
            declared_type = %declared_type,
            "unrecognized event type kept with zero effect"
        ),
        _ => {}
    }

    Ok(SoilEvent {
        user_id,
        timestamp,
        kind,
    })
}

fn normalize_kind(event_type: &str, payload: &Value) -> EventKind {
    let declared = event_type.trim().to_ascii_lowercase();
    if declared == RAIN_SHORTCUT {
        return EventKind::Rain {
            amount_mm: RAIN_SHORTCUT_MM,
        };
    }

    let Some(event_type) = EventType::parse(&declared) else {
        return EventKind::Unrecognized {
            declared_type: declared,
        };
    };

    let Some(fields) = payload.as_object() else {
        return malformed(event_type, "payload MUST be a JSON object".to_string());
    };

    let result = match event_type {
        EventType::Rain => {
            required_amount(fields, RAIN_AMOUNT_KEYS).map(|amount_mm| EventKind::Rain { amount_mm })
        }
        EventType::Irrigation => required_amount(fields, IRRIGATION_AMOUNT_KEYS)
            .map(|liters| EventKind::Irrigation { liters }),
        EventType::Fertilizer => required_text(fields, SUBTYPE_KEYS).and_then(|kind| {
            required_amount(fields, MASS_KEYS)
                .map(|amount_kg| EventKind::Fertilizer { kind, amount_kg })
        }),
        EventType::Harvest => {
            // Crop streams also carry sowing and other lifecycle records.
            if let Some(stage) = optional_text(fields, &["event"]) {
                if !stage.eq_ignore_ascii_case("harvest") {
                    return EventKind::Unrecognized {
                        declared_type: format!("crop:{}", stage.to_ascii_lowercase()),
                    };
                }
            }
            required_text(fields, CROP_KEYS).map(|crop| EventKind::Harvest { crop })
        }
        EventType::Amendment => required_text(fields, SUBTYPE_KEYS).and_then(|kind| {
            required_amount(fields, MASS_KEYS)
                .map(|amount_kg| EventKind::Amendment { kind, amount_kg })
        }),
    };

    result.unwrap_or_else(|reason| malformed(event_type, reason))
}

fn malformed(event_type: EventType, reason: String) -> EventKind {
    EventKind::Malformed {
        declared_type: event_type.as_str().to_string(),
        reason,
    }
}

fn required_amount(fields: &Map<String, Value>, keys: &[&str]) -> Result<f64, String> {
    let Some((key, value)) = first_present(fields, keys) else {
        return Err(format!("missing required field `{}`", keys[0]));
    };

    let amount = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
    .ok_or_else(|| format!("field `{key}` MUST be numeric"))?;

    if !amount.is_finite() || amount < 0.0 {
        return Err(format!("field `{key}` MUST be a finite value >= 0"));
    }
    Ok(amount)
}

fn required_text(fields: &Map<String, Value>, keys: &[&str]) -> Result<String, String> {
    optional_text(fields, keys).ok_or_else(|| format!("missing required field `{}`", keys[0]))
}

fn optional_text(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    first_present(fields, keys).and_then(|(_, value)| {
        value
            .as_str()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(ToString::to_string)
    })
}

fn first_present<'a>(
    fields: &'a Map<String, Value>,
    keys: &[&'a str],
) -> Option<(&'a str, &'a Value)> {
    keys.iter()
        .find_map(|key| fields.get(*key).filter(|value| !value.is_null()).map(|value| (*key, value)))
}
