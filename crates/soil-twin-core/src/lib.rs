//! Soil digital-twin aggregation engine.
//!
//! A plot's soil state is `baseline + Σ deltas`, where every agronomic event
//! (rain, irrigation, fertilizer, harvest, amendment) is turned into a delta by a
//! versioned [`TransformRuleset`]. Two read paths exist:
//! - the authoritative path ([`recompute_states`], [`SoilTwinEngine::recompute_all`])
//!   re-aggregates the full merged event log;
//! - the optimistic path ([`project`], [`SoilTwinEngine::project_optimistic`])
//!   applies a single new event to the last known state.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

mod delta;
mod engine;
mod event;
mod merge;
mod ruleset;
mod sources;
mod state;

pub use delta::{transform, Delta};
pub use engine::{
    BaselineSource, EngineConfig, EventSource, PublishSink, RecomputeReport, SoilTwinEngine,
    StateFlavor, StateSlots, StateView,
};
pub use event::{
    fingerprint, normalize_event, EventKind, EventType, Provenance, RawEvent, SoilEvent,
    SourceKind,
};
pub use merge::{
    aggregate, merge, recompute_states, MergedEvent, MergedEvents, Recomputation, SourceBatch,
};
pub use ruleset::{AmendmentRules, CropRemoval, NutrientShares, TransformRuleset};
pub use sources::{
    JsonlBaselineSource, JsonlEventSource, MemoryEventSource, MemorySink, StreamLayout,
};
pub use state::{
    classify, last_known_state, project, project_all, reconcile, BaselineSnapshot,
    BaselineStore, CurrentState, FieldStatuses, Nutrient, NutrientStatus, SoilLevels,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SoilError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("event source error: {0}")]
    Source(String),
    #[error("publish error: {0}")]
    Publish(String),
}

/// Farmer/plot identity. Every baseline and event belongs to exactly one entity.
///
/// Deserialization goes through [`EntityId::parse`], so ids read from files and
/// clients are always trimmed.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Builds an entity id from user input, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`SoilError::Validation`] when the id is empty.
    pub fn parse(raw: &str) -> Result<Self, SoilError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SoilError::Validation(
                "user_id MUST be a non-empty string".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.trim().to_string())
    }
}

/// Parses an event timestamp and normalizes it to UTC.
///
/// Accepted forms: RFC3339 with any offset, ISO 8601 without an offset
/// (interpreted as UTC), and unix epoch seconds (integer or fractional).
///
/// # Errors
/// Returns [`SoilError::Validation`] when none of the accepted forms match.
#[allow(clippy::cast_possible_truncation)]
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, SoilError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SoilError::Validation(
            "timestamp MUST be provided".to_string(),
        ));
    }

    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }

    if let Ok(parsed) = PrimitiveDateTime::parse(trimmed, &Iso8601::DEFAULT) {
        return Ok(parsed.assume_utc());
    }

    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_finite() {
            let nanos = (seconds * 1_000_000_000.0).round() as i128;
            return OffsetDateTime::from_unix_timestamp_nanos(nanos)
                .map_err(|err| SoilError::Validation(format!("epoch timestamp out of range: {err}")));
        }
    }

    Err(SoilError::Validation(format!(
        "invalid timestamp `{trimmed}`: expected RFC3339, ISO 8601 or epoch seconds"
    )))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SoilError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SoilError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| SoilError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        let parsed = must_ok(parse_timestamp("2026-03-01T12:00:00+05:30"));
        assert_eq!(parsed.offset(), UtcOffset::UTC);
        assert_eq!(
            must_ok(format_rfc3339(parsed)),
            "2026-03-01T06:30:00Z".to_string()
        );
    }

    #[test]
    fn naive_iso_timestamps_are_treated_as_utc() {
        let parsed = must_ok(parse_timestamp("2026-03-01T06:30:00.250000"));
        assert_eq!(parsed.offset(), UtcOffset::UTC);
        assert_eq!(parsed.millisecond(), 250);
    }

    #[test]
    fn epoch_seconds_are_accepted() {
        let parsed = must_ok(parse_timestamp("1700000000"));
        assert_eq!(parsed.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn garbage_timestamps_are_rejected() {
        assert!(parse_timestamp("yesterday").is_err());
        assert!(parse_timestamp("   ").is_err());
    }

    #[test]
    fn entity_ids_are_trimmed_and_non_empty() {
        assert_eq!(must_ok(EntityId::parse("  farmer ")).as_str(), "farmer");
        assert!(EntityId::parse(" ").is_err());
        assert_eq!(EntityId::from(" farmer\t").as_str(), "farmer");
    }

    #[test]
    fn deserialized_entity_ids_are_canonical() {
        let padded: EntityId = must_ok(serde_json::from_str(r#"" SHC001 ""#));
        assert_eq!(padded, EntityId::from("SHC001"));
        assert!(serde_json::from_str::<EntityId>(r#""  ""#).is_err());
    }
}
