#![allow(clippy::missing_errors_doc)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use soil_twin_core::{
    format_rfc3339, last_known_state, now_utc, parse_timestamp, project_all, BaselineSnapshot,
    CurrentState, EngineConfig, EntityId, EventKind, FieldStatuses, MemoryEventSource,
    Provenance, PublishSink, SoilError, SoilEvent, SoilLevels, SoilTwinEngine, SourceBatch,
    SourceKind, StateSlots, StateView, TransformRuleset,
};
use time::OffsetDateTime;
use tracing::{info, warn};
use ulid::Ulid;

const SOIL_MIGRATION_VERSION: i64 = 1;
const PROJECTOR_NAME: &str = "soil_state_v1";

/// Default page size for activity history.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

const SCHEMA_SOIL_V1: &str = r"
CREATE TABLE IF NOT EXISTS soil_rulesets (
  ruleset_version INTEGER PRIMARY KEY,
  ruleset_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS soil_baselines (
  user_id TEXT PRIMARY KEY,
  location TEXT NOT NULL,
  nitrogen REAL NOT NULL,
  phosphorus REAL NOT NULL,
  potassium REAL NOT NULL,
  organic_carbon REAL NOT NULL,
  ph REAL NOT NULL,
  moisture REAL NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_soil_baselines_no_update
BEFORE UPDATE ON soil_baselines
BEGIN
  SELECT RAISE(FAIL, 'soil_baselines is immutable');
END;

CREATE TRIGGER IF NOT EXISTS trg_soil_baselines_no_delete
BEFORE DELETE ON soil_baselines
BEGIN
  SELECT RAISE(FAIL, 'soil_baselines is immutable');
END;

CREATE TABLE IF NOT EXISTS soil_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  event_id TEXT NOT NULL UNIQUE,
  user_id TEXT NOT NULL,
  occurred_at TEXT NOT NULL,
  occurred_at_ns INTEGER NOT NULL,
  event_type TEXT NOT NULL CHECK (
    event_type IN (
      'rain',
      'irrigation',
      'fertilizer',
      'harvest',
      'amendment',
      'malformed',
      'unrecognized'
    )
  ),
  payload_json TEXT NOT NULL DEFAULT '{}',
  source_kind TEXT NOT NULL CHECK (source_kind IN ('manual', 'historical', 'live')),
  source_id TEXT NOT NULL,
  fingerprint TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_soil_events_no_update
BEFORE UPDATE ON soil_events
BEGIN
  SELECT RAISE(FAIL, 'soil_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_soil_events_no_delete
BEFORE DELETE ON soil_events
BEGIN
  SELECT RAISE(FAIL, 'soil_events is append-only');
END;

CREATE INDEX IF NOT EXISTS idx_soil_events_user_seq
  ON soil_events(user_id, event_seq);
CREATE INDEX IF NOT EXISTS idx_soil_events_user_time
  ON soil_events(user_id, occurred_at_ns DESC, event_seq DESC);
CREATE INDEX IF NOT EXISTS idx_soil_events_source_fingerprint
  ON soil_events(source_id, fingerprint);

CREATE TABLE IF NOT EXISTS soil_state (
  user_id TEXT PRIMARY KEY,
  location TEXT NOT NULL,
  nitrogen REAL NOT NULL CHECK (nitrogen >= 0.0),
  phosphorus REAL NOT NULL CHECK (phosphorus >= 0.0),
  potassium REAL NOT NULL CHECK (potassium >= 0.0),
  organic_carbon REAL NOT NULL CHECK (organic_carbon >= 0.0),
  ph REAL NOT NULL CHECK (ph BETWEEN 0.0 AND 14.0),
  moisture REAL NOT NULL CHECK (moisture BETWEEN 0.0 AND 100.0),
  status_json TEXT NOT NULL,
  generation INTEGER NOT NULL CHECK (generation >= 1),
  ruleset_version INTEGER NOT NULL,
  last_event_seq INTEGER NOT NULL,
  as_of TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS soil_projection_state (
  projector_name TEXT PRIMARY KEY,
  ruleset_version INTEGER NOT NULL,
  generation INTEGER NOT NULL,
  last_event_seq INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);
";

const EVENT_COLUMNS: &str = "event_seq, event_id, user_id, occurred_at, event_type, payload_json,
                source_kind, source_id, fingerprint, recorded_at";

pub struct SqliteSoilStore {
    conn: Connection,
}

/// One row of the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredEvent {
    pub event_seq: i64,
    pub event_id: Ulid,
    pub fingerprint: String,
    pub provenance: Provenance,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub event: SoilEvent,
}

/// Authoritative state row written by [`SqliteSoilStore::replay`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishedState {
    pub state: CurrentState,
    pub generation: u64,
    pub ruleset_version: u32,
    pub last_event_seq: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BaselineImportReport {
    pub inserted: usize,
    pub skipped_existing: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventImportReport {
    pub source: Provenance,
    pub appended: usize,
    pub skipped_already_stored: usize,
    pub last_event_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayReport {
    pub generation: u64,
    pub ruleset_version: u32,
    pub projected_entities: usize,
    pub processed_events: usize,
    pub duplicates_collapsed: usize,
    pub missing_baseline: Vec<EntityId>,
    pub skipped_baselines: Vec<EntityId>,
    pub last_event_seq: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectorStatus {
    pub contract_version: String,
    pub projector_name: String,
    pub ruleset_version: u32,
    pub generation: u64,
    pub projected_event_seq: i64,
    pub latest_event_seq: i64,
    pub lag_events: i64,
    pub baselines: usize,
    pub state_rows: usize,
    pub entities_with_events: usize,
    pub entities_missing_baseline: usize,
    pub stale_state_rows: usize,
    pub baselines_without_state: usize,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectorIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectorIssue {
    pub code: String,
    pub severity: ProjectorIssueSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectorStaleEntity {
    pub user_id: EntityId,
    pub max_event_seq: i64,
    pub projected_event_seq: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectorCheck {
    pub contract_version: String,
    pub healthy: bool,
    pub status: ProjectorStatus,
    pub issues: Vec<ProjectorIssue>,
    pub stale_entity_sample: Vec<ProjectorStaleEntity>,
}

struct ProjectionState {
    ruleset_version: u32,
    generation: u64,
    last_event_seq: i64,
    updated_at: String,
}

impl SqliteSoilStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SOIL_V1)
            .context("failed to apply soil schema")?;

        let now = timestamp_text(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SOIL_MIGRATION_VERSION, now],
            )
            .context("failed to register soil schema migration")?;

        if self.get_rulesets()?.is_empty() {
            self.upsert_ruleset(&TransformRuleset::v1())?;
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO soil_projection_state(projector_name, ruleset_version, generation, last_event_seq, updated_at)
                 VALUES (?1, ?2, 0, 0, ?3)",
                params![PROJECTOR_NAME, 1_i64, now],
            )
            .context("failed to initialize projection state")?;

        Ok(())
    }

    pub fn upsert_ruleset(&self, ruleset: &TransformRuleset) -> Result<()> {
        ruleset
            .validate()
            .map_err(|err| anyhow!("invalid ruleset configuration: {err}"))?;

        let payload = serde_json::to_string(ruleset).context("failed to serialize ruleset")?;
        let now = timestamp_text(now_utc())?;

        self.conn
            .execute(
                "INSERT INTO soil_rulesets(ruleset_version, ruleset_json, created_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(ruleset_version) DO UPDATE SET
                   ruleset_json = excluded.ruleset_json,
                   created_at = excluded.created_at",
                params![i64::from(ruleset.ruleset_version), payload, now],
            )
            .context("failed to upsert ruleset")?;

        Ok(())
    }

    pub fn get_rulesets(&self) -> Result<BTreeMap<u32, TransformRuleset>> {
        load_rulesets(&self.conn)
    }

    /// The ruleset with the given version, or the newest stored one.
    pub fn resolve_ruleset(&self, version: Option<u32>) -> Result<TransformRuleset> {
        resolve_ruleset(&self.get_rulesets()?, version)
    }

    /// Records a baseline. Baselines are write-once.
    pub fn insert_baseline(&self, baseline: &BaselineSnapshot) -> Result<()> {
        baseline
            .validate()
            .map_err(|err| anyhow!("baseline validation failed: {err}"))?;
        if self.get_baseline(&baseline.user_id)?.is_some() {
            return Err(anyhow!(
                "baseline for {} already recorded; baselines are immutable",
                baseline.user_id
            ));
        }
        insert_baseline_row(&self.conn, baseline)
    }

    /// Imports baselines in one transaction, skipping entities that already have one.
    pub fn import_baselines(
        &mut self,
        baselines: &[BaselineSnapshot],
    ) -> Result<BaselineImportReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start baseline import transaction")?;

        let mut inserted = 0_usize;
        let mut skipped_existing = 0_usize;
        for baseline in baselines {
            baseline
                .validate()
                .map_err(|err| anyhow!("baseline validation failed: {err}"))?;
            if load_baseline(&tx, &baseline.user_id)?.is_some() {
                warn!(user_id = %baseline.user_id, "baseline already recorded; skipping");
                skipped_existing += 1;
                continue;
            }
            insert_baseline_row(&tx, baseline)?;
            inserted += 1;
        }

        tx.commit()
            .context("failed to commit baseline import transaction")?;
        Ok(BaselineImportReport {
            inserted,
            skipped_existing,
        })
    }

    pub fn get_baseline(&self, user_id: &EntityId) -> Result<Option<BaselineSnapshot>> {
        load_baseline(&self.conn, user_id)
    }

    pub fn list_baselines(&self) -> Result<Vec<BaselineSnapshot>> {
        load_baselines(&self.conn)
    }

    pub fn append_event(&mut self, event: &SoilEvent, provenance: &Provenance) -> Result<StoredEvent> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start event transaction")?;
        let stored = insert_event_row(&tx, event, provenance)?;
        tx.commit().context("failed to commit event transaction")?;
        Ok(stored)
    }

    /// Appends a stream's events, skipping those the same source already
    /// stored. Repeats inside the stream are kept, so re-importing a grown
    /// file only appends its new tail.
    pub fn import_events(
        &mut self,
        events: &[SoilEvent],
        provenance: &Provenance,
    ) -> Result<EventImportReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start event import transaction")?;

        let mut already_stored = source_fingerprint_counts(&tx, &provenance.source_id)?;
        let mut appended = 0_usize;
        let mut skipped_already_stored = 0_usize;
        for event in events {
            let fingerprint = event.fingerprint();
            if let Some(remaining) = already_stored.get_mut(&fingerprint) {
                if *remaining > 0 {
                    *remaining -= 1;
                    skipped_already_stored += 1;
                    continue;
                }
            }
            insert_event_row(&tx, event, provenance)?;
            appended += 1;
        }

        let last_event_seq = latest_event_seq(&tx)?.unwrap_or(0);
        tx.commit()
            .context("failed to commit event import transaction")?;

        Ok(EventImportReport {
            source: provenance.clone(),
            appended,
            skipped_already_stored,
            last_event_seq,
        })
    }

    pub fn list_events(
        &self,
        user_id: Option<&EntityId>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredEvent>> {
        let mut query = format!("SELECT {EVENT_COLUMNS} FROM soil_events");
        if user_id.is_some() {
            query.push_str(" WHERE user_id = ?1");
        }
        query.push_str(" ORDER BY event_seq ASC");
        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = match user_id {
            Some(user_id) => stmt.query_map(params![user_id.as_str()], parse_event_row)?,
            None => stmt.query_map([], parse_event_row)?,
        };
        collect_rows(rows)
    }

    /// Entity activity, newest first.
    pub fn history(&self, user_id: &EntityId, limit: Option<usize>) -> Result<Vec<StoredEvent>> {
        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM soil_events
             WHERE user_id = ?1
             ORDER BY occurred_at_ns DESC, event_seq DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).with_context(|| format!("invalid limit: {limit}"))?;
        let rows = stmt.query_map(params![user_id.as_str(), limit], parse_event_row)?;
        collect_rows(rows)
    }

    /// Stored events grouped into one batch per source.
    pub fn source_batches(&self) -> Result<Vec<SourceBatch>> {
        load_source_batches(&self.conn)
    }

    /// Full batch pass over the stored log. Reads and the published state
    /// rows are written in one transaction; a failure publishes nothing.
    pub fn replay(&mut self, ruleset_version: Option<u32>) -> Result<ReplayReport> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start replay transaction")?;

        let ruleset = resolve_ruleset(&load_rulesets(&tx)?, ruleset_version)?;
        let mut baselines = load_baselines(&tx)?;
        let batches = load_source_batches(&tx)?;
        let last_event_seq = latest_event_seq(&tx)?.unwrap_or(0);
        let previous_generation = load_projection_state(&tx)?.map_or(0, |state| state.generation);

        let mut engine = SoilTwinEngine::new(ruleset.clone(), EngineConfig::default(), &mut baselines)
            .context("failed to initialize soil engine")?;
        for batch in batches {
            engine = engine
                .with_source(Box::new(MemoryEventSource::with_events(
                    batch.provenance,
                    batch.events,
                )))
                .context("failed to register stored source")?;
        }

        let as_of = now_utc();
        let generation = previous_generation + 1;
        let generation_sql =
            i64::try_from(generation).with_context(|| format!("invalid generation: {generation}"))?;
        let as_of_text = timestamp_text(as_of)?;
        let mut sink = SoilStateSink {
            conn: &tx,
            generation: generation_sql,
            ruleset_version: ruleset.ruleset_version,
            last_event_seq,
        };
        let recompute = engine
            .recompute_all_into(as_of, &mut sink)
            .context("batch recompute failed")?;
        if recompute.publish_failures > 0 {
            return Err(anyhow!(
                "failed to publish {} of {} states; replay rolled back",
                recompute.publish_failures,
                recompute.states.len()
            ));
        }

        tx.execute(
            "INSERT INTO soil_projection_state(projector_name, ruleset_version, generation, last_event_seq, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(projector_name) DO UPDATE SET
               ruleset_version = excluded.ruleset_version,
               generation = excluded.generation,
               last_event_seq = excluded.last_event_seq,
               updated_at = excluded.updated_at",
            params![
                PROJECTOR_NAME,
                i64::from(ruleset.ruleset_version),
                generation_sql,
                last_event_seq,
                as_of_text
            ],
        )
        .context("failed to update projection state")?;
        tx.commit().context("failed to commit replay transaction")?;

        info!(
            generation,
            ruleset_version = ruleset.ruleset_version,
            entities = recompute.states.len(),
            events = recompute.processed_events,
            last_event_seq,
            "replay published"
        );

        Ok(ReplayReport {
            generation,
            ruleset_version: ruleset.ruleset_version,
            projected_entities: recompute.states.len(),
            processed_events: recompute.processed_events,
            duplicates_collapsed: recompute.duplicates_collapsed,
            missing_baseline: recompute.missing_baseline,
            skipped_baselines: recompute.skipped_baselines,
            last_event_seq,
        })
    }

    pub fn get_state(&self, user_id: &EntityId) -> Result<Option<PublishedState>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                user_id, location, nitrogen, phosphorus, potassium, organic_carbon, ph, moisture,
                status_json, generation, ruleset_version, last_event_seq, as_of
             FROM soil_state
             WHERE user_id = ?1",
        )?;
        let row = stmt
            .query_row(params![user_id.as_str()], parse_state_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_states(&self) -> Result<Vec<PublishedState>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                user_id, location, nitrogen, phosphorus, potassium, organic_carbon, ph, moisture,
                status_json, generation, ruleset_version, last_event_seq, as_of
             FROM soil_state
             ORDER BY user_id ASC",
        )?;
        let rows = stmt.query_map([], parse_state_row)?;
        collect_rows(rows)
    }

    /// Chains every event logged since the last replay on top of the published
    /// state (or the baseline before the first replay). `None` when nothing is
    /// pending or the entity has no baseline.
    pub fn pending_projection(
        &self,
        user_id: &EntityId,
    ) -> Result<Option<(CurrentState, OffsetDateTime)>> {
        let published = self.get_state(user_id)?;
        let baseline = match published {
            Some(_) => None,
            None => self.get_baseline(user_id)?,
        };
        let Some(last) = last_known_state(
            published.as_ref().map(|published| &published.state),
            baseline.as_ref(),
        ) else {
            return Ok(None);
        };
        let after_seq = published.as_ref().map_or(0, |published| published.last_event_seq);

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS}
             FROM soil_events
             WHERE user_id = ?1 AND event_seq > ?2
             ORDER BY event_seq ASC"
        ))?;
        let rows = stmt.query_map(params![user_id.as_str(), after_seq], parse_event_row)?;
        let pending = collect_rows(rows)?;
        let Some(newest) = pending.last() else {
            return Ok(None);
        };
        let projected_at = newest.recorded_at;

        let ruleset =
            self.resolve_ruleset(published.as_ref().map(|published| published.ruleset_version))?;
        let state = project_all(&last, pending.iter().map(|stored| &stored.event), &ruleset);
        Ok(Some((state, projected_at)))
    }

    /// Staleness-aware read over the published and pending states.
    pub fn current_view(
        &self,
        user_id: &EntityId,
        now: OffsetDateTime,
        staleness_bound_secs: u64,
    ) -> Result<Option<StateView>> {
        let config = EngineConfig {
            staleness_bound_secs,
            ..EngineConfig::default()
        };
        config
            .validate()
            .map_err(|err| anyhow!("invalid staleness bound: {err}"))?;

        let published = self.get_state(user_id)?;
        let tentative = self.pending_projection(user_id)?;
        let generation = match &published {
            Some(published) => published.generation,
            None => self.projection_generation()?,
        };
        let slots = StateSlots {
            authoritative: published.map(|published| (published.state, published.as_of)),
            tentative,
            generation,
        };
        Ok(slots.select(now, config.staleness_bound()))
    }

    pub fn projector_status(&self) -> Result<ProjectorStatus> {
        let (ruleset_version, generation, projected_event_seq, updated_at) =
            match load_projection_state(&self.conn)? {
                Some(state) => (
                    state.ruleset_version,
                    state.generation,
                    state.last_event_seq,
                    Some(state.updated_at),
                ),
                None => (1_u32, 0_u64, 0_i64, None),
            };

        let latest_event_seq = latest_event_seq(&self.conn)?.unwrap_or(0);
        let lag_events = (latest_event_seq - projected_event_seq).max(0);

        Ok(ProjectorStatus {
            contract_version: "projector_status.v1".to_string(),
            projector_name: PROJECTOR_NAME.to_string(),
            ruleset_version,
            generation,
            projected_event_seq,
            latest_event_seq,
            lag_events,
            baselines: self.count("SELECT COUNT(*) FROM soil_baselines")?,
            state_rows: self.count("SELECT COUNT(*) FROM soil_state")?,
            entities_with_events: self.count("SELECT COUNT(DISTINCT user_id) FROM soil_events")?,
            entities_missing_baseline: self.count(
                "SELECT COUNT(DISTINCT events.user_id)
                 FROM soil_events events
                 LEFT JOIN soil_baselines baselines ON baselines.user_id = events.user_id
                 WHERE baselines.user_id IS NULL",
            )?,
            stale_state_rows: self.projector_stale_entities(None)?.len(),
            baselines_without_state: self.count(
                "SELECT COUNT(*)
                 FROM soil_baselines baselines
                 LEFT JOIN soil_state state ON state.user_id = baselines.user_id
                 WHERE state.user_id IS NULL",
            )?,
            updated_at,
        })
    }

    pub fn projector_check(&self) -> Result<ProjectorCheck> {
        let status = self.projector_status()?;
        let mut issues = Vec::new();

        if status.lag_events > 0 {
            issues.push(ProjectorIssue {
                code: "projection_lag".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "projection lag detected: {} events behind",
                    status.lag_events
                ),
            });
        }

        if status.stale_state_rows > 0 {
            issues.push(ProjectorIssue {
                code: "stale_state_rows".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "stale state rows detected: {} entities out of date",
                    status.stale_state_rows
                ),
            });
        }

        if status.baselines_without_state > 0 {
            issues.push(ProjectorIssue {
                code: "baselines_without_state".to_string(),
                severity: ProjectorIssueSeverity::Error,
                message: format!(
                    "baselines never projected: {} entities",
                    status.baselines_without_state
                ),
            });
        }

        if status.entities_missing_baseline > 0 {
            issues.push(ProjectorIssue {
                code: "events_without_baseline".to_string(),
                severity: ProjectorIssueSeverity::Warning,
                message: format!(
                    "events logged for {} entities without a baseline",
                    status.entities_missing_baseline
                ),
            });
        }

        let stale_entity_sample = self.projector_stale_entities(Some(25))?;
        let healthy = !issues
            .iter()
            .any(|item| item.severity == ProjectorIssueSeverity::Error);

        Ok(ProjectorCheck {
            contract_version: "projector_check.v1".to_string(),
            healthy,
            status,
            issues,
            stale_entity_sample,
        })
    }

    /// Entities with a baseline whose published state misses logged events.
    pub fn projector_stale_entities(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<ProjectorStaleEntity>> {
        let mut query = "SELECT
                events.user_id,
                events.max_event_seq,
                state.last_event_seq
             FROM (
                SELECT user_id, MAX(event_seq) AS max_event_seq
                FROM soil_events
                GROUP BY user_id
             ) events
             JOIN soil_baselines baselines ON baselines.user_id = events.user_id
             LEFT JOIN soil_state state ON state.user_id = events.user_id
             WHERE state.last_event_seq IS NULL OR state.last_event_seq < events.max_event_seq
             ORDER BY events.user_id ASC"
            .to_string();

        if let Some(raw_limit) = limit {
            query.push_str(" LIMIT ");
            query.push_str(&raw_limit.to_string());
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], |row| {
            let user_id: String = row.get(0)?;
            Ok(ProjectorStaleEntity {
                user_id: EntityId(user_id),
                max_event_seq: row.get(1)?,
                projected_event_seq: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    fn projection_generation(&self) -> Result<u64> {
        Ok(load_projection_state(&self.conn)?.map_or(0, |state| state.generation))
    }

    fn count(&self, query: &str) -> Result<usize> {
        let count = self
            .conn
            .query_row(query, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to run count query: {query}"))?;
        usize::try_from(count).with_context(|| format!("invalid row count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Writes each published state into `soil_state` on the replay transaction.
struct SoilStateSink<'conn> {
    conn: &'conn Connection,
    generation: i64,
    ruleset_version: u32,
    last_event_seq: i64,
}

impl PublishSink for SoilStateSink<'_> {
    fn publish(
        &mut self,
        user_id: &EntityId,
        state: &CurrentState,
        as_of: OffsetDateTime,
    ) -> Result<(), SoilError> {
        upsert_state_row(
            self.conn,
            user_id,
            state,
            self.generation,
            self.ruleset_version,
            self.last_event_seq,
            as_of,
        )
        .map_err(|err| SoilError::Publish(format!("{err:#}")))
    }
}

fn upsert_state_row(
    conn: &Connection,
    user_id: &EntityId,
    state: &CurrentState,
    generation: i64,
    ruleset_version: u32,
    last_event_seq: i64,
    as_of: OffsetDateTime,
) -> Result<()> {
    let status_json = serde_json::to_string(&state.status).context("failed to serialize status")?;
    conn.execute(
        "INSERT INTO soil_state(
            user_id, location, nitrogen, phosphorus, potassium, organic_carbon, ph, moisture,
            status_json, generation, ruleset_version, last_event_seq, as_of
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(user_id) DO UPDATE SET
            location = excluded.location,
            nitrogen = excluded.nitrogen,
            phosphorus = excluded.phosphorus,
            potassium = excluded.potassium,
            organic_carbon = excluded.organic_carbon,
            ph = excluded.ph,
            moisture = excluded.moisture,
            status_json = excluded.status_json,
            generation = excluded.generation,
            ruleset_version = excluded.ruleset_version,
            last_event_seq = excluded.last_event_seq,
            as_of = excluded.as_of",
        params![
            user_id.as_str(),
            state.location,
            state.levels.nitrogen,
            state.levels.phosphorus,
            state.levels.potassium,
            state.levels.organic_carbon,
            state.levels.ph,
            state.levels.moisture,
            status_json,
            generation,
            i64::from(ruleset_version),
            last_event_seq,
            timestamp_text(as_of)?,
        ],
    )
    .with_context(|| format!("failed to publish state for {user_id}"))?;
    Ok(())
}

fn timestamp_text(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn resolve_ruleset(
    rulesets: &BTreeMap<u32, TransformRuleset>,
    version: Option<u32>,
) -> Result<TransformRuleset> {
    match version {
        Some(version) => rulesets
            .get(&version)
            .cloned()
            .ok_or_else(|| anyhow!("missing ruleset_version {version} in soil_rulesets")),
        None => rulesets
            .values()
            .next_back()
            .cloned()
            .ok_or_else(|| anyhow!("no rulesets stored; run migrate first")),
    }
}

fn load_rulesets(conn: &Connection) -> Result<BTreeMap<u32, TransformRuleset>> {
    let mut stmt = conn.prepare(
        "SELECT ruleset_version, ruleset_json FROM soil_rulesets ORDER BY ruleset_version ASC",
    )?;

    let mut rows = stmt.query([])?;
    let mut map = BTreeMap::new();

    while let Some(row) = rows.next()? {
        let version_i64: i64 = row.get(0)?;
        let version = u32::try_from(version_i64)
            .with_context(|| format!("invalid ruleset_version: {version_i64}"))?;
        let json: String = row.get(1)?;
        let value: Value = serde_json::from_str(&json).context("invalid stored ruleset JSON")?;
        let ruleset = TransformRuleset::from_json(&value)
            .map_err(|err| anyhow!("failed to parse ruleset {version}: {err}"))?;
        map.insert(version, ruleset);
    }

    Ok(map)
}

fn insert_baseline_row(conn: &Connection, baseline: &BaselineSnapshot) -> Result<()> {
    conn.execute(
        "INSERT INTO soil_baselines(
            user_id, location, nitrogen, phosphorus, potassium, organic_carbon, ph, moisture,
            recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            baseline.user_id.as_str(),
            baseline.location,
            baseline.levels.nitrogen,
            baseline.levels.phosphorus,
            baseline.levels.potassium,
            baseline.levels.organic_carbon,
            baseline.levels.ph,
            baseline.levels.moisture,
            timestamp_text(now_utc())?,
        ],
    )
    .with_context(|| format!("failed to insert baseline for {}", baseline.user_id))?;
    Ok(())
}

fn load_baseline(conn: &Connection, user_id: &EntityId) -> Result<Option<BaselineSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, location, nitrogen, phosphorus, potassium, organic_carbon, ph, moisture
         FROM soil_baselines
         WHERE user_id = ?1",
    )?;
    let row = stmt
        .query_row(params![user_id.as_str()], parse_baseline_row)
        .optional()?;
    Ok(row)
}

fn load_baselines(conn: &Connection) -> Result<Vec<BaselineSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, location, nitrogen, phosphorus, potassium, organic_carbon, ph, moisture
         FROM soil_baselines
         ORDER BY user_id ASC",
    )?;
    let rows = stmt.query_map([], parse_baseline_row)?;
    collect_rows(rows)
}

fn insert_event_row(
    conn: &Connection,
    event: &SoilEvent,
    provenance: &Provenance,
) -> Result<StoredEvent> {
    provenance
        .validate()
        .map_err(|err| anyhow!("invalid provenance: {err}"))?;
    EntityId::parse(event.user_id.as_str()).map_err(|err| anyhow!("invalid event: {err}"))?;

    let existing_kind: Option<String> = conn
        .query_row(
            "SELECT source_kind FROM soil_events WHERE source_id = ?1 LIMIT 1",
            params![provenance.source_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up source kind")?;
    if let Some(existing_kind) = existing_kind {
        if existing_kind != provenance.kind.as_str() {
            return Err(anyhow!(
                "source {} is already recorded as {existing_kind}",
                provenance.source_id
            ));
        }
    }

    let event_id = Ulid::new();
    let recorded_at = now_utc();
    let fingerprint = event.fingerprint();
    let occurred_at_ns = i64::try_from(event.timestamp.unix_timestamp_nanos())
        .with_context(|| format!("timestamp out of storable range for {}", event.user_id))?;
    let payload_json =
        serde_json::to_string(&event.kind.payload()).context("failed to serialize payload")?;

    conn.execute(
        "INSERT INTO soil_events(
            event_id, user_id, occurred_at, occurred_at_ns, event_type, payload_json,
            source_kind, source_id, fingerprint, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event_id.to_string(),
            event.user_id.as_str(),
            timestamp_text(event.timestamp)?,
            occurred_at_ns,
            event.kind.tag(),
            payload_json,
            provenance.kind.as_str(),
            provenance.source_id,
            fingerprint,
            timestamp_text(recorded_at)?,
        ],
    )
    .context("failed to append soil event")?;

    Ok(StoredEvent {
        event_seq: conn.last_insert_rowid(),
        event_id,
        fingerprint,
        provenance: provenance.clone(),
        recorded_at,
        event: event.clone(),
    })
}

fn source_fingerprint_counts(conn: &Connection, source_id: &str) -> Result<HashMap<String, usize>> {
    let mut stmt = conn.prepare(
        "SELECT fingerprint, COUNT(*) FROM soil_events WHERE source_id = ?1 GROUP BY fingerprint",
    )?;
    let rows = stmt.query_map(params![source_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = HashMap::new();
    for (fingerprint, count) in collect_rows(rows)? {
        let count =
            usize::try_from(count).with_context(|| format!("invalid fingerprint count: {count}"))?;
        counts.insert(fingerprint, count);
    }
    Ok(counts)
}

fn load_source_batches(conn: &Connection) -> Result<Vec<SourceBatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM soil_events ORDER BY event_seq ASC"
    ))?;
    let rows = stmt.query_map([], parse_event_row)?;

    let mut batches: BTreeMap<String, SourceBatch> = BTreeMap::new();
    for stored in collect_rows(rows)? {
        batches
            .entry(stored.provenance.source_id.clone())
            .or_insert_with(|| SourceBatch::new(stored.provenance.clone(), Vec::new()))
            .events
            .push(stored.event);
    }
    Ok(batches.into_values().collect())
}

fn latest_event_seq(conn: &Connection) -> Result<Option<i64>> {
    let value = conn
        .query_row("SELECT MAX(event_seq) FROM soil_events", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .context("failed to query latest event_seq")?;
    Ok(value)
}

fn load_projection_state(conn: &Connection) -> Result<Option<ProjectionState>> {
    let mut stmt = conn.prepare(
        "SELECT ruleset_version, generation, last_event_seq, updated_at
         FROM soil_projection_state
         WHERE projector_name = ?1",
    )?;

    let row = stmt
        .query_row(params![PROJECTOR_NAME], |row| {
            let ruleset_i64: i64 = row.get(0)?;
            let generation_i64: i64 = row.get(1)?;
            Ok(ProjectionState {
                ruleset_version: u32::try_from(ruleset_i64).map_err(|_| {
                    invalid_data(0, format!("invalid ruleset version: {ruleset_i64}"))
                })?,
                generation: u64::try_from(generation_i64)
                    .map_err(|_| invalid_data(1, format!("invalid generation: {generation_i64}")))?,
                last_event_seq: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn parse_baseline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BaselineSnapshot> {
    let user_id: String = row.get(0)?;
    Ok(BaselineSnapshot {
        user_id: EntityId(user_id),
        location: row.get(1)?,
        levels: SoilLevels {
            nitrogen: row.get(2)?,
            phosphorus: row.get(3)?,
            potassium: row.get(4)?,
            organic_carbon: row.get(5)?,
            ph: row.get(6)?,
            moisture: row.get(7)?,
        },
    })
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredEvent> {
    let event_id_raw: String = row.get(1)?;
    let user_id: String = row.get(2)?;
    let occurred_at_raw: String = row.get(3)?;
    let event_type_raw: String = row.get(4)?;
    let payload_raw: String = row.get(5)?;
    let source_kind_raw: String = row.get(6)?;
    let source_id: String = row.get(7)?;
    let recorded_at_raw: String = row.get(9)?;

    let event_id = Ulid::from_string(&event_id_raw)
        .map_err(|_| invalid_data(1, format!("invalid event_id ULID: {event_id_raw}")))?;
    let timestamp = parse_timestamp(&occurred_at_raw)
        .map_err(|err| invalid_data(3, err.to_string()))?;
    let payload: Value = serde_json::from_str(&payload_raw)
        .map_err(|err| invalid_data(5, format!("invalid payload_json: {err}")))?;
    let kind = EventKind::from_parts(&event_type_raw, payload)
        .map_err(|err| invalid_data(4, err.to_string()))?;
    let source_kind = SourceKind::parse(&source_kind_raw)
        .ok_or_else(|| invalid_data(6, format!("invalid source_kind: {source_kind_raw}")))?;
    let recorded_at = parse_timestamp(&recorded_at_raw)
        .map_err(|err| invalid_data(9, err.to_string()))?;

    Ok(StoredEvent {
        event_seq: row.get(0)?,
        event_id,
        fingerprint: row.get(8)?,
        provenance: Provenance::new(source_kind, source_id),
        recorded_at,
        event: SoilEvent {
            user_id: EntityId(user_id),
            timestamp,
            kind,
        },
    })
}

fn parse_state_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PublishedState> {
    let user_id: String = row.get(0)?;
    let status_raw: String = row.get(8)?;
    let generation_i64: i64 = row.get(9)?;
    let ruleset_i64: i64 = row.get(10)?;
    let as_of_raw: String = row.get(12)?;

    let status: FieldStatuses = serde_json::from_str(&status_raw)
        .map_err(|err| invalid_data(8, format!("invalid status_json: {err}")))?;

    Ok(PublishedState {
        state: CurrentState {
            user_id: EntityId(user_id),
            location: row.get(1)?,
            levels: SoilLevels {
                nitrogen: row.get(2)?,
                phosphorus: row.get(3)?,
                potassium: row.get(4)?,
                organic_carbon: row.get(5)?,
                ph: row.get(6)?,
                moisture: row.get(7)?,
            },
            status,
        },
        generation: u64::try_from(generation_i64)
            .map_err(|_| invalid_data(9, format!("invalid generation: {generation_i64}")))?,
        ruleset_version: u32::try_from(ruleset_i64)
            .map_err(|_| invalid_data(10, format!("invalid ruleset_version: {ruleset_i64}")))?,
        last_event_seq: row.get(11)?,
        as_of: parse_timestamp(&as_of_raw).map_err(|err| invalid_data(12, err.to_string()))?,
    })
}

fn invalid_data(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
