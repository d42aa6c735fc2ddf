use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    normalize_event, BaselineSnapshot, BaselineSource, CurrentState, EntityId, EventSource,
    EventType, Provenance, PublishSink, RawEvent, SoilError, SoilEvent,
};

const RESERVED_KEYS: &[&str] = &["user_id", "timestamp", "event_type", "payload", "note"];

/// How records in a JSON-lines stream file map onto canonical events.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StreamLayout {
    /// Flat records of a single event type (`{"timestamp", "rain_mm", ...}`).
    Fixed(EventType),
    /// Records carrying their own `event_type`, with either a nested
    /// `payload` object or flat payload fields.
    Tagged,
}

impl StreamLayout {
    /// Resolves a stream name. `live_weather` is a rain stream.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rain" | "rainfall" | "live_weather" => Some(Self::Fixed(EventType::Rain)),
            "irrigation" => Some(Self::Fixed(EventType::Irrigation)),
            "fertilizer" => Some(Self::Fixed(EventType::Fertilizer)),
            "crop" | "harvest" => Some(Self::Fixed(EventType::Harvest)),
            "amendment" => Some(Self::Fixed(EventType::Amendment)),
            "tagged" => Some(Self::Tagged),
            _ => None,
        }
    }
}

/// Event source backed by an append-only JSON-lines file.
///
/// Lines that are not JSON objects, or that cannot be attributed to an entity
/// and a point in time, are skipped with a warning.
#[derive(Debug, Clone)]
pub struct JsonlEventSource {
    path: PathBuf,
    layout: StreamLayout,
    provenance: Provenance,
    default_user: Option<EntityId>,
}

impl JsonlEventSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, layout: StreamLayout, provenance: Provenance) -> Self {
        Self {
            path: path.into(),
            layout,
            provenance,
            default_user: None,
        }
    }

    /// Entity credited with records that carry no `user_id`.
    #[must_use]
    pub fn with_default_user(mut self, user_id: EntityId) -> Self {
        self.default_user = Some(user_id);
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_to_raw(&self, record: Map<String, Value>) -> Option<RawEvent> {
        let user_id = match record.get("user_id").and_then(Value::as_str) {
            Some(user_id) => user_id.to_string(),
            None => self.default_user.as_ref()?.as_str().to_string(),
        };
        let timestamp = match record.get("timestamp") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Number(number)) => number.to_string(),
            _ => return None,
        };

        let (event_type, payload) = match self.layout {
            StreamLayout::Fixed(event_type) => {
                (event_type.as_str().to_string(), strip_reserved(record))
            }
            StreamLayout::Tagged => {
                let event_type = record.get("event_type")?.as_str()?.to_string();
                let payload = match record.get("payload") {
                    Some(payload @ Value::Object(_)) => payload.clone(),
                    _ => strip_reserved(record),
                };
                (event_type, payload)
            }
        };

        Some(RawEvent {
            user_id,
            timestamp,
            event_type,
            payload,
        })
    }
}

fn strip_reserved(mut record: Map<String, Value>) -> Value {
    for key in RESERVED_KEYS {
        record.remove(*key);
    }
    Value::Object(record)
}

impl EventSource for JsonlEventSource {
    fn provenance(&self) -> Provenance {
        self.provenance.clone()
    }

    fn read_events(&mut self) -> Result<Vec<SoilEvent>, SoilError> {
        let body = fs::read_to_string(&self.path).map_err(|err| {
            SoilError::Source(format!(
                "failed to read stream `{}`: {err}",
                self.path.display()
            ))
        })?;

        let mut events = Vec::new();
        for (index, line) in body.lines().enumerate() {
            let line_no = index + 1;
            if line.trim().is_empty() {
                continue;
            }

            let record = match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(record)) => record,
                _ => {
                    warn!(source = %self.provenance, line = line_no, "skipping non-object stream line");
                    continue;
                }
            };

            let Some(raw) = self.record_to_raw(record) else {
                warn!(
                    source = %self.provenance,
                    line = line_no,
                    "skipping stream line without user_id, timestamp or event_type"
                );
                continue;
            };

            match normalize_event(&raw) {
                Ok(event) => events.push(event),
                Err(err) => {
                    warn!(source = %self.provenance, line = line_no, error = %err, "skipping stream line");
                }
            }
        }

        debug!(source = %self.provenance, events = events.len(), "read stream file");
        Ok(events)
    }
}

/// Baselines from a JSON-lines file of soil-health-card records.
#[derive(Debug, Clone)]
pub struct JsonlBaselineSource {
    path: PathBuf,
}

impl JsonlBaselineSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BaselineSource for JsonlBaselineSource {
    fn load_baselines(&mut self) -> Result<Vec<BaselineSnapshot>, SoilError> {
        let body = fs::read_to_string(&self.path).map_err(|err| {
            SoilError::Source(format!(
                "failed to read baselines `{}`: {err}",
                self.path.display()
            ))
        })?;

        let mut baselines = Vec::new();
        for (index, line) in body.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<BaselineSnapshot>(line)
                .map_err(|err| SoilError::Validation(err.to_string()))
                .and_then(|baseline| baseline.validate().map(|()| baseline));
            match parsed {
                Ok(baseline) => baselines.push(baseline),
                Err(err) => {
                    warn!(line = index + 1, error = %err, "skipping baseline line");
                }
            }
        }
        Ok(baselines)
    }
}

impl BaselineSource for Vec<BaselineSnapshot> {
    fn load_baselines(&mut self) -> Result<Vec<BaselineSnapshot>, SoilError> {
        Ok(self.clone())
    }
}

/// In-process event log; clones share the same buffer.
#[derive(Debug, Clone)]
pub struct MemoryEventSource {
    provenance: Provenance,
    events: Arc<Mutex<Vec<SoilEvent>>>,
}

impl MemoryEventSource {
    #[must_use]
    pub fn new(provenance: Provenance) -> Self {
        Self {
            provenance,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn with_events(provenance: Provenance, events: Vec<SoilEvent>) -> Self {
        Self {
            provenance,
            events: Arc::new(Mutex::new(events)),
        }
    }

    pub fn append(&self, event: SoilEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSource for MemoryEventSource {
    fn provenance(&self) -> Provenance {
        self.provenance.clone()
    }

    fn read_events(&mut self) -> Result<Vec<SoilEvent>, SoilError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Publish sink that keeps the last published state per entity in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    published: Arc<Mutex<BTreeMap<EntityId, (CurrentState, OffsetDateTime)>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, user_id: &EntityId) -> Option<CurrentState> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|(state, _)| state.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PublishSink for MemorySink {
    fn publish(
        &mut self,
        user_id: &EntityId,
        state: &CurrentState,
        as_of: OffsetDateTime,
    ) -> Result<(), SoilError> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.clone(), (state.clone(), as_of));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::{EventKind, SourceKind};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = must_ok(tempfile::NamedTempFile::new());
        for line in lines {
            must_ok(writeln!(file, "{line}"));
        }
        file
    }

    #[test]
    fn live_weather_records_are_credited_to_the_default_user() {
        let file = write_lines(&[
            r#"{"timestamp": "2026-02-07T12:00:00", "rain_mm": 3.5, "note": "Live API: light rain"}"#,
            r#"{"timestamp": "2026-02-07T13:00:00", "rain_mm": 0.0, "user_id": "farmer2"}"#,
        ]);
        let mut source = JsonlEventSource::new(
            file.path(),
            must_ok(StreamLayout::parse("live-weather").ok_or("layout")),
            Provenance::new(SourceKind::Live, "live_weather"),
        )
        .with_default_user(EntityId::from("farmer"));

        let events = must_ok(source.read_events());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].user_id.as_str(), "farmer");
        assert_eq!(events[0].kind, EventKind::Rain { amount_mm: 3.5 });
        assert_eq!(events[1].user_id.as_str(), "farmer2");
    }

    #[test]
    fn unattributable_and_garbage_lines_are_skipped() {
        let file = write_lines(&[
            r#"{"timestamp": "2026-02-07T12:00:00Z", "water_liters": 5000}"#,
            "not json",
            r#"{"user_id": "farmer", "timestamp": "bogus", "water_liters": 5000}"#,
            "",
            r#"{"user_id": "farmer", "timestamp": "2026-02-07T12:00:00Z", "water_liters": 5000}"#,
        ]);
        let mut source = JsonlEventSource::new(
            file.path(),
            StreamLayout::Fixed(EventType::Irrigation),
            Provenance::new(SourceKind::Historical, "irrigation_events"),
        );

        let events = must_ok(source.read_events());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Irrigation { liters: 5000.0 });
    }

    #[test]
    fn tagged_streams_accept_nested_or_flat_payloads() {
        let file = write_lines(&[
            r#"{"user_id": "farmer", "timestamp": "2026-02-07T12:00:00Z", "event_type": "fertilizer", "payload": {"kind": "urea", "amount_kg": 40}}"#,
            r#"{"user_id": "farmer", "timestamp": "2026-02-07T12:05:00Z", "event_type": "amendment", "type": "lime", "amount_kg": 500}"#,
            r#"{"user_id": "farmer", "timestamp": "2026-02-07T12:10:00Z", "event_type": "rain25"}"#,
        ]);
        let mut source = JsonlEventSource::new(
            file.path(),
            StreamLayout::Tagged,
            Provenance::new(SourceKind::Manual, "manual"),
        );

        let events = must_ok(source.read_events());
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0].kind,
            EventKind::Fertilizer {
                kind: "urea".to_string(),
                amount_kg: 40.0
            }
        );
        assert_eq!(
            events[1].kind,
            EventKind::Amendment {
                kind: "lime".to_string(),
                amount_kg: 500.0
            }
        );
        assert_eq!(events[2].kind, EventKind::Rain { amount_mm: 25.0 });
    }

    #[test]
    fn missing_stream_file_is_a_source_error() {
        let mut source = JsonlEventSource::new(
            "/definitely/not/here.jsonl",
            StreamLayout::Tagged,
            Provenance::new(SourceKind::Manual, "manual"),
        );
        assert!(matches!(source.read_events(), Err(SoilError::Source(_))));
    }

    #[test]
    fn baseline_file_skips_invalid_rows() {
        let file = write_lines(&[
            r#"{"uid": "SHC001", "location": "Karnal,IN", "nitrogen": 240, "phosphorus": 20, "potassium": 200, "organic_carbon": 0.6, "ph": 7.2, "moisture": 30}"#,
            r#"{"uid": "", "nitrogen": 1, "phosphorus": 1, "potassium": 1, "organic_carbon": 1, "ph": 7, "moisture": 1}"#,
            r#"{"uid": "SHC002"}"#,
        ]);
        let baselines = must_ok(JsonlBaselineSource::new(file.path()).load_baselines());
        assert_eq!(baselines.len(), 1);
        assert_eq!(baselines[0].user_id.as_str(), "SHC001");
    }

    #[test]
    fn memory_source_clones_share_a_buffer() {
        let source = MemoryEventSource::new(Provenance::new(SourceKind::Manual, "manual"));
        let mut engine_side = source.clone();
        source.append(SoilEvent::new(
            "farmer",
            OffsetDateTime::UNIX_EPOCH,
            EventKind::Rain { amount_mm: 1.0 },
        ));
        assert_eq!(must_ok(engine_side.read_events()).len(), 1);
    }
}
