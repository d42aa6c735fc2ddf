use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::thread;

use time::OffsetDateTime;

use crate::{
    reconcile, transform, BaselineStore, CurrentState, Delta, EntityId, Provenance, SoilError,
    SoilEvent, TransformRuleset,
};

/// Events read from one physical source during a batch pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub provenance: Provenance,
    pub events: Vec<SoilEvent>,
}

impl SourceBatch {
    #[must_use]
    pub fn new(provenance: Provenance, events: Vec<SoilEvent>) -> Self {
        Self { provenance, events }
    }
}

/// A merged event, tagged with the source that contributed it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEvent {
    pub fingerprint: String,
    pub provenance: Provenance,
    pub event: SoilEvent,
}

/// Per-entity logical event set produced by [`merge`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedEvents {
    by_entity: BTreeMap<EntityId, Vec<MergedEvent>>,
    duplicates_collapsed: usize,
    latest: Option<OffsetDateTime>,
}

impl MergedEvents {
    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.by_entity.keys()
    }

    #[must_use]
    pub fn events_for(&self, user_id: &EntityId) -> &[MergedEvent] {
        self.by_entity.get(user_id).map_or(&[], Vec::as_slice)
    }

    /// Total number of events kept after cross-source deduplication.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_entity.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }

    /// Cross-source echoes dropped by the union.
    #[must_use]
    pub fn duplicates_collapsed(&self) -> usize {
        self.duplicates_collapsed
    }

    /// Timestamp of the newest merged event.
    #[must_use]
    pub fn latest_event_at(&self) -> Option<OffsetDateTime> {
        self.latest
    }
}

/// Unions physical sources into one logical event set per entity.
///
/// Events are identified by content fingerprint. A fingerprint seen `n1` times
/// in one source and `n2` times in another is kept `max(n1, n2)` times, so
/// repeats inside a source survive while echoes across sources collapse.
///
/// # Errors
/// Returns [`SoilError::Configuration`] when a provenance is invalid or two
/// sources share a `source_id`.
pub fn merge(sources: Vec<SourceBatch>) -> Result<MergedEvents, SoilError> {
    let mut seen_ids = BTreeSet::new();
    for source in &sources {
        source.provenance.validate()?;
        if !seen_ids.insert(source.provenance.source_id.clone()) {
            return Err(SoilError::Configuration(format!(
                "duplicate event source id `{}`",
                source.provenance.source_id
            )));
        }
    }

    let mut merged = MergedEvents::default();
    let mut kept: HashMap<String, usize> = HashMap::new();

    for source in sources {
        let mut occurrences: HashMap<String, usize> = HashMap::new();
        for event in source.events {
            let fingerprint = event.fingerprint();
            let occurrence = occurrences.entry(fingerprint.clone()).or_insert(0);
            *occurrence += 1;

            let kept_so_far = kept.entry(fingerprint.clone()).or_insert(0);
            if *occurrence <= *kept_so_far {
                merged.duplicates_collapsed += 1;
                continue;
            }
            *kept_so_far += 1;

            if merged.latest < Some(event.timestamp) {
                merged.latest = Some(event.timestamp);
            }
            merged
                .by_entity
                .entry(event.user_id.clone())
                .or_default()
                .push(MergedEvent {
                    fingerprint,
                    provenance: source.provenance.clone(),
                    event,
                });
        }
    }

    Ok(merged)
}

/// Sums the deltas of `user_id`'s events.
///
/// Events are summed in `(timestamp, fingerprint)` order, so the result is
/// bit-identical for any arrival order of the same multiset.
#[must_use]
pub fn aggregate<'a, I>(user_id: &EntityId, events: I, ruleset: &TransformRuleset) -> Delta
where
    I: IntoIterator<Item = &'a SoilEvent>,
{
    let mut keyed: Vec<(OffsetDateTime, String, &SoilEvent)> = events
        .into_iter()
        .filter(|event| event.user_id == *user_id)
        .map(|event| (event.timestamp, event.fingerprint(), event))
        .collect();
    keyed.sort_by(|left, right| (left.0, &left.1).cmp(&(right.0, &right.1)));

    keyed
        .into_iter()
        .map(|(_, _, event)| transform(&event.kind, ruleset))
        .sum()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recomputation {
    pub states: BTreeMap<EntityId, CurrentState>,
    /// Entities with events but no baseline; skipped.
    pub missing_baseline: Vec<EntityId>,
    pub processed_events: usize,
}

/// Recomputes every entity that has a baseline, from scratch, in parallel.
///
/// Entities are split into at most `parallelism` chunks, each reconciled on a
/// scoped worker thread. Entities that only appear in the event log are
/// reported in `missing_baseline`.
#[must_use]
pub fn recompute_states(
    baselines: &BaselineStore,
    merged: &MergedEvents,
    ruleset: &TransformRuleset,
    parallelism: usize,
) -> Recomputation {
    let snapshots: Vec<_> = baselines.iter().collect();
    let chunk_size = snapshots.len().div_ceil(parallelism.max(1)).max(1);

    let states = thread::scope(|scope| {
        let handles: Vec<_> = snapshots
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|baseline| {
                            let delta = aggregate(
                                &baseline.user_id,
                                merged
                                    .events_for(&baseline.user_id)
                                    .iter()
                                    .map(|entry| &entry.event),
                                ruleset,
                            );
                            (baseline.user_id.clone(), reconcile(baseline, &delta))
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
            })
            .collect::<BTreeMap<_, _>>()
    });

    let missing_baseline: Vec<EntityId> = merged
        .entities()
        .filter(|user_id| baselines.get(user_id).is_none())
        .cloned()
        .collect();
    let processed_events = states
        .keys()
        .map(|user_id| merged.events_for(user_id).len())
        .sum();

    Recomputation {
        states,
        missing_baseline,
        processed_events,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use proptest::prelude::*;

    use super::*;
    use crate::{BaselineSnapshot, EventKind, SoilLevels, SourceKind};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn at(seconds: i64) -> OffsetDateTime {
        must_ok(OffsetDateTime::from_unix_timestamp(1_770_000_000 + seconds))
    }

    fn rain(user: &str, seconds: i64, amount_mm: f64) -> SoilEvent {
        SoilEvent::new(user, at(seconds), EventKind::Rain { amount_mm })
    }

    fn source(kind: SourceKind, id: &str, events: Vec<SoilEvent>) -> SourceBatch {
        SourceBatch::new(Provenance::new(kind, id), events)
    }

    fn baseline(user: &str) -> BaselineSnapshot {
        BaselineSnapshot {
            user_id: EntityId::from(user),
            location: String::new(),
            levels: SoilLevels {
                nitrogen: 240.0,
                phosphorus: 20.0,
                potassium: 200.0,
                organic_carbon: 0.6,
                ph: 7.0,
                moisture: 30.0,
            },
        }
    }

    fn mixed_event(user: &str, index: u8, amount: f64) -> SoilEvent {
        let kind = match index % 5 {
            0 => EventKind::Rain { amount_mm: amount },
            1 => EventKind::Irrigation {
                liters: amount * 1000.0,
            },
            2 => EventKind::Fertilizer {
                kind: "dap".to_string(),
                amount_kg: amount,
            },
            3 => EventKind::Harvest {
                crop: "wheat".to_string(),
            },
            _ => EventKind::Amendment {
                kind: "compost".to_string(),
                amount_kg: amount * 10.0,
            },
        };
        SoilEvent::new(user, at(i64::from(index % 7)), kind)
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let err = merge(vec![
            source(SourceKind::Manual, "feed", vec![]),
            source(SourceKind::Live, "feed", vec![]),
        ]);
        assert!(matches!(err, Err(SoilError::Configuration(_))));
    }

    #[test]
    fn cross_source_echoes_collapse_but_in_source_repeats_survive() {
        let manual = source(
            SourceKind::Manual,
            "manual-log",
            vec![rain("farmer", 0, 5.0), rain("farmer", 0, 5.0)],
        );
        let live = source(
            SourceKind::Live,
            "weather",
            vec![rain("farmer", 0, 5.0), rain("farmer", 60, 2.0)],
        );

        let merged = must_ok(merge(vec![manual, live]));
        let farmer = EntityId::from("farmer");
        assert_eq!(merged.events_for(&farmer).len(), 3);
        assert_eq!(merged.duplicates_collapsed(), 1);
        assert_eq!(merged.latest_event_at(), Some(at(60)));

        let live_tagged = merged
            .events_for(&farmer)
            .iter()
            .filter(|event| event.provenance.kind == SourceKind::Live)
            .count();
        assert_eq!(live_tagged, 1);
    }

    #[test]
    fn aggregate_ignores_other_entities() {
        let events = vec![rain("a", 0, 10.0), rain("b", 0, 99.0)];
        let delta = aggregate(&EntityId::from("a"), &events, &TransformRuleset::v1());
        assert_eq!(delta.nitrogen, -8.0);
        assert_eq!(delta.moisture, 4.0);
    }

    #[test]
    fn recompute_keeps_entities_isolated_and_reports_missing_baselines() {
        let mut baselines = BaselineStore::new();
        must_ok(baselines.insert(baseline("a")));
        must_ok(baselines.insert(baseline("b")));
        must_ok(baselines.insert(baseline("idle")));

        let merged = must_ok(merge(vec![source(
            SourceKind::Historical,
            "history",
            vec![
                rain("a", 0, 25.0),
                SoilEvent::new(
                    "b",
                    at(1),
                    EventKind::Fertilizer {
                        kind: "urea".to_string(),
                        amount_kg: 40.0,
                    },
                ),
                rain("ghost", 2, 1.0),
            ],
        )]));

        let result = recompute_states(&baselines, &merged, &TransformRuleset::v1(), 2);
        let a = &result.states[&EntityId::from("a")];
        let b = &result.states[&EntityId::from("b")];
        let idle = &result.states[&EntityId::from("idle")];

        assert_eq!(a.levels.nitrogen, 220.0);
        assert_eq!(a.levels.moisture, 40.0);
        assert!((b.levels.nitrogen - 258.4).abs() < 1e-9);
        assert_eq!(b.levels.moisture, 30.0);
        assert_eq!(idle.levels, baseline("idle").levels);
        assert_eq!(result.missing_baseline, vec![EntityId::from("ghost")]);
        assert_eq!(result.processed_events, 2);
    }

    #[test]
    fn parallelism_does_not_change_results() {
        let mut baselines = BaselineStore::new();
        let mut events = Vec::new();
        for index in 0..9_u8 {
            let user = format!("plot-{index}");
            must_ok(baselines.insert(baseline(&user)));
            events.push(mixed_event(&user, index, f64::from(index) + 0.3));
        }
        let merged = must_ok(merge(vec![source(SourceKind::Manual, "m", events)]));
        let ruleset = TransformRuleset::v1();

        let serial = recompute_states(&baselines, &merged, &ruleset, 1);
        let parallel = recompute_states(&baselines, &merged, &ruleset, 4);
        assert_eq!(serial, parallel);
        assert_eq!(serial.states.len(), 9);
    }

    proptest! {
        #[test]
        fn aggregation_is_bit_exact_under_permutation(
            draws in prop::collection::vec((any::<u8>(), 0.0_f64..500.0), 1..40),
            seed in any::<u64>(),
        ) {
            let events: Vec<SoilEvent> = draws
                .iter()
                .map(|(index, amount)| mixed_event("farmer", *index, *amount))
                .collect();

            let mut shuffled = events.clone();
            // Deterministic Fisher-Yates driven by the seed.
            let mut state = seed;
            for i in (1..shuffled.len()).rev() {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let j = usize::try_from(state >> 33).unwrap_or(0) % (i + 1);
                shuffled.swap(i, j);
            }

            let ruleset = TransformRuleset::v1();
            let user = EntityId::from("farmer");
            let forward = aggregate(&user, &events, &ruleset);
            let permuted = aggregate(&user, &shuffled, &ruleset);
            prop_assert_eq!(forward.nitrogen.to_bits(), permuted.nitrogen.to_bits());
            prop_assert_eq!(forward.phosphorus.to_bits(), permuted.phosphorus.to_bits());
            prop_assert_eq!(forward.potassium.to_bits(), permuted.potassium.to_bits());
            prop_assert_eq!(forward.moisture.to_bits(), permuted.moisture.to_bits());
            prop_assert_eq!(forward.organic_carbon.to_bits(), permuted.organic_carbon.to_bits());
            prop_assert_eq!(forward.ph.to_bits(), permuted.ph.to_bits());
        }

        #[test]
        fn raw_sums_are_additive_before_clamping(
            left in prop::collection::vec((any::<u8>(), 0.0_f64..100.0), 0..10),
            right in prop::collection::vec((any::<u8>(), 0.0_f64..100.0), 0..10),
        ) {
            let ruleset = TransformRuleset::v1();
            let user = EntityId::from("farmer");
            let left: Vec<SoilEvent> = left.iter().map(|(i, a)| mixed_event("farmer", *i, *a)).collect();
            let right: Vec<SoilEvent> = right.iter().map(|(i, a)| mixed_event("farmer", *i, *a)).collect();
            let combined: Vec<SoilEvent> = left.iter().chain(right.iter()).cloned().collect();

            let separate = aggregate(&user, &left, &ruleset) + aggregate(&user, &right, &ruleset);
            let together = aggregate(&user, &combined, &ruleset);
            prop_assert!((separate.nitrogen - together.nitrogen).abs() < 1e-6);
            prop_assert!((separate.phosphorus - together.phosphorus).abs() < 1e-6);
            prop_assert!((separate.potassium - together.potassium).abs() < 1e-6);
            prop_assert!((separate.moisture - together.moisture).abs() < 1e-6);
            prop_assert!((separate.organic_carbon - together.organic_carbon).abs() < 1e-9);
        }

        #[test]
        fn merged_multiplicity_is_the_max_across_sources(
            first in 0_usize..4,
            second in 0_usize..4,
        ) {
            let echo = rain("farmer", 0, 5.0);
            let merged = must_ok(merge(vec![
                source(SourceKind::Manual, "a", vec![echo.clone(); first]),
                source(SourceKind::Live, "b", vec![echo; second]),
            ]));
            prop_assert_eq!(merged.len(), first.max(second));
            prop_assert_eq!(merged.duplicates_collapsed(), first.min(second));
        }
    }

    #[test]
    fn clamping_is_not_additive() {
        let ruleset = TransformRuleset::v1();
        let base = baseline("farmer");
        let user = EntityId::from("farmer");
        let harvest = |seconds| {
            SoilEvent::new(
                "farmer",
                at(seconds),
                EventKind::Harvest {
                    crop: "rice".to_string(),
                },
            )
        };
        let depleting = vec![harvest(0), harvest(1), harvest(2)];
        let topping_up = vec![SoilEvent::new(
            "farmer",
            at(3),
            EventKind::Fertilizer {
                kind: "urea".to_string(),
                amount_kg: 100.0,
            },
        )];
        let both: Vec<SoilEvent> = depleting.iter().chain(topping_up.iter()).cloned().collect();

        let first = reconcile(&base, &aggregate(&user, &depleting, &ruleset));
        let stepwise = reconcile(
            &BaselineSnapshot {
                levels: first.levels,
                ..base.clone()
            },
            &aggregate(&user, &topping_up, &ruleset),
        );
        let together = reconcile(&base, &aggregate(&user, &both, &ruleset));

        assert_eq!(first.levels.nitrogen, 0.0);
        assert!((stepwise.levels.nitrogen - 46.0).abs() < 1e-9);
        assert!((together.levels.nitrogen - 16.0).abs() < 1e-9);
    }
}
