use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::{
    last_known_state, merge, now_utc, project, recompute_states, BaselineSnapshot,
    BaselineStore, CurrentState, EntityId, Provenance, SoilError, SoilEvent, SourceBatch,
    TransformRuleset,
};

/// Yields baseline records, one per entity. Loaded once at engine start.
pub trait BaselineSource {
    /// # Errors
    /// Returns [`SoilError::Source`] when the backing store cannot be read.
    fn load_baselines(&mut self) -> Result<Vec<BaselineSnapshot>, SoilError>;
}

/// A physical event stream. Each batch pass re-reads the full stream.
pub trait EventSource {
    fn provenance(&self) -> Provenance;

    /// # Errors
    /// Returns [`SoilError::Source`] when the stream cannot be read.
    fn read_events(&mut self) -> Result<Vec<SoilEvent>, SoilError>;
}

/// Receives every authoritative state after a batch pass.
pub trait PublishSink {
    /// # Errors
    /// Returns [`SoilError::Publish`] when the state cannot be delivered.
    fn publish(
        &mut self,
        user_id: &EntityId,
        state: &CurrentState,
        as_of: OffsetDateTime,
    ) -> Result<(), SoilError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EngineConfig {
    /// Age after which an authoritative state yields to a newer optimistic one.
    pub staleness_bound_secs: u64,
    /// Upper bound on batch worker threads.
    pub max_parallelism: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staleness_bound_secs: 30,
            max_parallelism: thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns [`SoilError::Configuration`] when `max_parallelism` is zero or
    /// the staleness bound does not fit a signed duration.
    pub fn validate(&self) -> Result<(), SoilError> {
        if self.max_parallelism == 0 {
            return Err(SoilError::Configuration(
                "max_parallelism MUST be >= 1".to_string(),
            ));
        }
        if i64::try_from(self.staleness_bound_secs).is_err() {
            return Err(SoilError::Configuration(
                "staleness_bound_secs is out of range".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn staleness_bound(&self) -> Duration {
        Duration::seconds(i64::try_from(self.staleness_bound_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StateFlavor {
    Authoritative,
    Optimistic,
}

/// A read of one entity's state, labelled with where it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateView {
    pub flavor: StateFlavor,
    pub state: CurrentState,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    /// Generation of the authoritative snapshot the view is based on.
    pub generation: u64,
}

/// The two state slots of one entity as seen by a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSlots {
    /// Published state and the `as_of` of the snapshot it belongs to.
    pub authoritative: Option<(CurrentState, OffsetDateTime)>,
    /// Optimistic state built on that snapshot and when it was projected.
    pub tentative: Option<(CurrentState, OffsetDateTime)>,
    pub generation: u64,
}

impl StateSlots {
    /// The authoritative state wins unless it is older than `staleness_bound`
    /// at `now` and a tentative state exists.
    #[must_use]
    pub fn select(self, now: OffsetDateTime, staleness_bound: Duration) -> Option<StateView> {
        let generation = self.generation;
        let optimistic = |(state, projected_at): (CurrentState, OffsetDateTime)| StateView {
            flavor: StateFlavor::Optimistic,
            state,
            as_of: projected_at,
            generation,
        };

        match (self.authoritative, self.tentative) {
            (Some((_, as_of)), Some(tentative)) if now - as_of > staleness_bound => {
                Some(optimistic(tentative))
            }
            (Some((state, as_of)), _) => Some(StateView {
                flavor: StateFlavor::Authoritative,
                state,
                as_of,
                generation,
            }),
            (None, Some(tentative)) => Some(optimistic(tentative)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecomputeReport {
    pub generation: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub as_of: OffsetDateTime,
    pub sources: Vec<Provenance>,
    pub processed_events: usize,
    pub duplicates_collapsed: usize,
    pub missing_baseline: Vec<EntityId>,
    /// Baselines rejected at engine start; these entities are never served.
    pub skipped_baselines: Vec<EntityId>,
    pub publish_failures: usize,
    pub states: BTreeMap<EntityId, CurrentState>,
}

#[derive(Debug, Clone)]
struct Tentative {
    state: CurrentState,
    projected_at: OffsetDateTime,
    /// Generation of the snapshot the chain was started from.
    base_generation: u64,
}

#[derive(Debug)]
struct Published {
    generation: u64,
    as_of: OffsetDateTime,
    states: BTreeMap<EntityId, CurrentState>,
}

impl Published {
    fn empty() -> Self {
        Self {
            generation: 0,
            as_of: OffsetDateTime::UNIX_EPOCH,
            states: BTreeMap::new(),
        }
    }
}

/// Keeps two state slots per entity: a tentative one advanced by
/// [`Self::project_optimistic`] and an authoritative one rebuilt by
/// [`Self::recompute_all`]. A tentative state lives until the next published
/// snapshot supersedes it.
pub struct SoilTwinEngine {
    ruleset: TransformRuleset,
    config: EngineConfig,
    baselines: BaselineStore,
    skipped_baselines: Vec<EntityId>,
    sources: Mutex<Vec<Box<dyn EventSource + Send>>>,
    sink: Option<Mutex<Box<dyn PublishSink + Send>>>,
    tentative: DashMap<EntityId, Tentative>,
    published: RwLock<Arc<Published>>,
}

impl SoilTwinEngine {
    /// Validates configuration and loads every baseline. Invalid baselines are
    /// skipped with a warning and listed in every [`RecomputeReport`].
    ///
    /// # Errors
    /// Returns [`SoilError::Configuration`] for an invalid ruleset, config or a
    /// duplicated baseline, and propagates baseline source failures.
    pub fn new(
        ruleset: TransformRuleset,
        config: EngineConfig,
        baselines: &mut dyn BaselineSource,
    ) -> Result<Self, SoilError> {
        ruleset.validate()?;
        config.validate()?;

        let mut store = BaselineStore::new();
        let mut skipped_baselines = Vec::new();
        for snapshot in baselines.load_baselines()? {
            let user_id = snapshot.user_id.clone();
            match store.insert(snapshot) {
                Ok(()) => {}
                Err(SoilError::Validation(reason)) => {
                    warn!(user_id = %user_id, reason = %reason, "skipping invalid baseline");
                    skipped_baselines.push(user_id);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(Self {
            ruleset,
            config,
            baselines: store,
            skipped_baselines,
            sources: Mutex::new(Vec::new()),
            sink: None,
            tentative: DashMap::new(),
            published: RwLock::new(Arc::new(Published::empty())),
        })
    }

    /// Registers an event source read by every batch pass.
    ///
    /// # Errors
    /// Returns [`SoilError::Configuration`] when the source id is blank or
    /// already registered.
    pub fn with_source(self, source: Box<dyn EventSource + Send>) -> Result<Self, SoilError> {
        let provenance = source.provenance();
        provenance.validate()?;
        {
            let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
            if sources
                .iter()
                .any(|existing| existing.provenance().source_id == provenance.source_id)
            {
                return Err(SoilError::Configuration(format!(
                    "duplicate event source id `{}`",
                    provenance.source_id
                )));
            }
            sources.push(source);
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Box<dyn PublishSink + Send>) -> Self {
        self.sink = Some(Mutex::new(sink));
        self
    }

    #[must_use]
    pub fn ruleset(&self) -> &TransformRuleset {
        &self.ruleset
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    /// Entities whose baseline was rejected at start.
    #[must_use]
    pub fn skipped_baselines(&self) -> &[EntityId] {
        &self.skipped_baselines
    }

    /// Generation of the currently published authoritative snapshot; 0 before
    /// the first batch pass.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.snapshot().generation
    }

    fn snapshot(&self) -> Arc<Published> {
        Arc::clone(&self.published.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// # Errors
    /// See [`Self::project_optimistic_at`].
    pub fn project_optimistic(
        &self,
        user_id: &EntityId,
        event: &SoilEvent,
    ) -> Result<CurrentState, SoilError> {
        self.project_optimistic_at(user_id, event, now_utc())
    }

    /// Applies one event to the entity's last known state and stores the result
    /// in the tentative slot. Calls for one entity are serialized.
    ///
    /// The last known state is the tentative state while it was built on the
    /// current snapshot, then the authoritative state, then the baseline.
    ///
    /// # Errors
    /// Returns [`SoilError::Validation`] when the event belongs to another
    /// entity and [`SoilError::NotFound`] when the entity has no baseline.
    pub fn project_optimistic_at(
        &self,
        user_id: &EntityId,
        event: &SoilEvent,
        now: OffsetDateTime,
    ) -> Result<CurrentState, SoilError> {
        if event.user_id != *user_id {
            return Err(SoilError::Validation(format!(
                "event for `{}` cannot be projected onto `{user_id}`",
                event.user_id
            )));
        }

        // The snapshot is read while the entry is locked, so a batch pass
        // cannot drop this slot between choosing a base and storing on it.
        let (next, generation) = match self.tentative.entry(user_id.clone()) {
            Entry::Occupied(mut slot) => {
                let published = self.snapshot();
                let last = if slot.get().base_generation == published.generation {
                    slot.get().state.clone()
                } else {
                    self.settled_state(user_id, &published)?
                };
                let next = project(&last, event, &self.ruleset);
                slot.insert(Tentative {
                    state: next.clone(),
                    projected_at: now,
                    base_generation: published.generation,
                });
                (next, published.generation)
            }
            Entry::Vacant(slot) => {
                let published = self.snapshot();
                let last = self.settled_state(user_id, &published)?;
                let next = project(&last, event, &self.ruleset);
                slot.insert(Tentative {
                    state: next.clone(),
                    projected_at: now,
                    base_generation: published.generation,
                });
                (next, published.generation)
            }
        };

        debug!(
            user_id = %user_id,
            event_type = event.kind.tag(),
            generation,
            "optimistic projection"
        );
        Ok(next)
    }

    fn settled_state(
        &self,
        user_id: &EntityId,
        published: &Published,
    ) -> Result<CurrentState, SoilError> {
        last_known_state(published.states.get(user_id), self.baselines.get(user_id))
            .ok_or_else(|| SoilError::NotFound(format!("no baseline for entity `{user_id}`")))
    }

    /// # Errors
    /// Returns [`SoilError::NotFound`] when no batch pass has produced a state
    /// for the entity.
    pub fn get_authoritative_state(&self, user_id: &EntityId) -> Result<CurrentState, SoilError> {
        self.snapshot().states.get(user_id).cloned().ok_or_else(|| {
            SoilError::NotFound(format!("no authoritative state for entity `{user_id}`"))
        })
    }

    /// # Errors
    /// See [`Self::current_state_at`].
    pub fn current_state(&self, user_id: &EntityId) -> Result<StateView, SoilError> {
        self.current_state_at(user_id, now_utc())
    }

    /// Staleness-aware read, see [`StateSlots::select`].
    ///
    /// # Errors
    /// Returns [`SoilError::NotFound`] when the entity has neither state.
    pub fn current_state_at(
        &self,
        user_id: &EntityId,
        now: OffsetDateTime,
    ) -> Result<StateView, SoilError> {
        let published = self.snapshot();
        let tentative = self
            .tentative
            .get(user_id)
            .filter(|slot| slot.base_generation == published.generation)
            .map(|slot| (slot.state.clone(), slot.projected_at));

        StateSlots {
            authoritative: published
                .states
                .get(user_id)
                .map(|state| (state.clone(), published.as_of)),
            tentative,
            generation: published.generation,
        }
        .select(now, self.config.staleness_bound())
        .ok_or_else(|| SoilError::NotFound(format!("no state for entity `{user_id}`")))
    }

    /// # Errors
    /// See [`Self::recompute_all_at`].
    pub fn recompute_all(&self) -> Result<RecomputeReport, SoilError> {
        self.recompute_all_at(now_utc())
    }

    /// Runs one batch pass: re-reads every source, merges, recomputes all
    /// entities in parallel, swaps the published snapshot and publishes to the
    /// registered sink. Only one pass runs at a time. Tentative states built on
    /// the previous snapshot are dropped.
    ///
    /// # Errors
    /// Returns the source or merge error; the previously published snapshot is
    /// left untouched.
    pub fn recompute_all_at(&self, now: OffsetDateTime) -> Result<RecomputeReport, SoilError> {
        match &self.sink {
            Some(sink) => {
                let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
                self.run_pass(now, Some(sink.as_mut()))
            }
            None => self.run_pass(now, None),
        }
    }

    /// Same as [`Self::recompute_all_at`], publishing to `sink` instead of the
    /// registered one. Lets a caller publish into a scope it owns, such as an
    /// open database transaction.
    ///
    /// # Errors
    /// See [`Self::recompute_all_at`].
    pub fn recompute_all_into(
        &self,
        now: OffsetDateTime,
        sink: &mut dyn PublishSink,
    ) -> Result<RecomputeReport, SoilError> {
        self.run_pass(now, Some(sink))
    }

    fn run_pass(
        &self,
        now: OffsetDateTime,
        sink: Option<&mut dyn PublishSink>,
    ) -> Result<RecomputeReport, SoilError> {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);

        let mut batches = Vec::with_capacity(sources.len());
        for source in sources.iter_mut() {
            let provenance = source.provenance();
            let events = source.read_events().map_err(|err| {
                warn!(
                    source = %provenance,
                    error = %err,
                    "batch pass aborted; keeping previous snapshot"
                );
                err
            })?;
            batches.push(SourceBatch::new(provenance, events));
        }
        let provenances: Vec<Provenance> = batches
            .iter()
            .map(|batch| batch.provenance.clone())
            .collect();

        let merged = merge(batches)?;
        let recomputation = recompute_states(
            &self.baselines,
            &merged,
            &self.ruleset,
            self.config.max_parallelism,
        );
        for user_id in &recomputation.missing_baseline {
            warn!(user_id = %user_id, "events without baseline; entity skipped");
        }

        let generation = {
            let mut published = self.published.write().unwrap_or_else(PoisonError::into_inner);
            let generation = published.generation + 1;
            *published = Arc::new(Published {
                generation,
                as_of: now,
                states: recomputation.states.clone(),
            });
            generation
        };
        self.tentative.retain(|_, slot| slot.base_generation == generation);

        let mut publish_failures = 0;
        if let Some(sink) = sink {
            for (user_id, state) in &recomputation.states {
                if let Err(err) = sink.publish(user_id, state, now) {
                    publish_failures += 1;
                    warn!(user_id = %user_id, error = %err, "failed to publish state");
                }
            }
        }
        drop(sources);

        info!(
            generation,
            entities = recomputation.states.len(),
            events = recomputation.processed_events,
            duplicates = merged.duplicates_collapsed(),
            missing_baseline = recomputation.missing_baseline.len(),
            publish_failures,
            "batch pass published"
        );

        Ok(RecomputeReport {
            generation,
            as_of: now,
            sources: provenances,
            processed_events: recomputation.processed_events,
            duplicates_collapsed: merged.duplicates_collapsed(),
            missing_baseline: recomputation.missing_baseline,
            skipped_baselines: self.skipped_baselines.clone(),
            publish_failures,
            states: recomputation.states,
        })
    }
}
