use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{transform, Delta, EntityId, SoilError, SoilEvent, TransformRuleset};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Nutrient {
    Nitrogen,
    Phosphorus,
    Potassium,
    OrganicCarbon,
    Ph,
    Moisture,
}

impl Nutrient {
    pub const ALL: [Self; 6] = [
        Self::Nitrogen,
        Self::Phosphorus,
        Self::Potassium,
        Self::OrganicCarbon,
        Self::Ph,
        Self::Moisture,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nitrogen => "nitrogen",
            Self::Phosphorus => "phosphorus",
            Self::Potassium => "potassium",
            Self::OrganicCarbon => "organic_carbon",
            Self::Ph => "ph",
            Self::Moisture => "moisture",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "nitrogen" => Some(Self::Nitrogen),
            "phosphorus" => Some(Self::Phosphorus),
            "potassium" => Some(Self::Potassium),
            "organic_carbon" => Some(Self::OrganicCarbon),
            "ph" => Some(Self::Ph),
            "moisture" => Some(Self::Moisture),
            _ => None,
        }
    }

    /// Physically valid `[min, max]` range of the field.
    #[must_use]
    pub fn range(self) -> (f64, f64) {
        match self {
            Self::Moisture => (0.0, 100.0),
            Self::Ph => (0.0, 14.0),
            Self::Nitrogen | Self::Phosphorus | Self::Potassium | Self::OrganicCarbon => {
                (0.0, f64::MAX)
            }
        }
    }

    /// Fixed agronomic thresholds (kg/ha for N/P/K, % for organic carbon and
    /// moisture). pH is binary: inside `[6.0, 8.5]` is sufficient.
    #[must_use]
    pub fn classify(self, value: f64) -> NutrientStatus {
        let (low, high) = match self {
            Self::Nitrogen => (280.0, 560.0),
            Self::Phosphorus => (11.0, 22.0),
            Self::Potassium => (120.0, 280.0),
            Self::OrganicCarbon => (0.5, 0.75),
            Self::Moisture => (15.0, 35.0),
            Self::Ph => {
                return if (6.0..=8.5).contains(&value) {
                    NutrientStatus::Sufficient
                } else {
                    NutrientStatus::Deficient
                };
            }
        };

        if value < low {
            NutrientStatus::Deficient
        } else if value > high {
            NutrientStatus::Sufficient
        } else {
            NutrientStatus::Adequate
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NutrientStatus {
    Deficient,
    Adequate,
    Sufficient,
    Unknown,
}

impl NutrientStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deficient => "deficient",
            Self::Adequate => "adequate",
            Self::Sufficient => "sufficient",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deficient" => Some(Self::Deficient),
            "adequate" => Some(Self::Adequate),
            "sufficient" => Some(Self::Sufficient),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Dashboard colour key.
    #[must_use]
    pub fn color(self) -> &'static str {
        match self {
            Self::Deficient => "red",
            Self::Adequate => "yellow",
            Self::Sufficient => "green",
            Self::Unknown => "grey",
        }
    }
}

/// Classifies a value by field name; unrecognized names yield `Unknown`.
#[must_use]
pub fn classify(value: f64, nutrient: &str) -> NutrientStatus {
    Nutrient::parse(nutrient).map_or(NutrientStatus::Unknown, |known| known.classify(value))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct SoilLevels {
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
    pub organic_carbon: f64,
    pub ph: f64,
    pub moisture: f64,
}

impl SoilLevels {
    #[must_use]
    pub fn get(&self, nutrient: Nutrient) -> f64 {
        match nutrient {
            Nutrient::Nitrogen => self.nitrogen,
            Nutrient::Phosphorus => self.phosphorus,
            Nutrient::Potassium => self.potassium,
            Nutrient::OrganicCarbon => self.organic_carbon,
            Nutrient::Ph => self.ph,
            Nutrient::Moisture => self.moisture,
        }
    }

    /// Raw, unclamped `self + delta`.
    #[must_use]
    pub fn apply(&self, delta: &Delta) -> Self {
        Self {
            nitrogen: self.nitrogen + delta.nitrogen,
            phosphorus: self.phosphorus + delta.phosphorus,
            potassium: self.potassium + delta.potassium,
            organic_carbon: self.organic_carbon + delta.organic_carbon,
            ph: self.ph + delta.ph,
            moisture: self.moisture + delta.moisture,
        }
    }

    #[must_use]
    pub fn clamped(&self) -> Self {
        Self {
            nitrogen: clamp_field(self.nitrogen, Nutrient::Nitrogen),
            phosphorus: clamp_field(self.phosphorus, Nutrient::Phosphorus),
            potassium: clamp_field(self.potassium, Nutrient::Potassium),
            organic_carbon: clamp_field(self.organic_carbon, Nutrient::OrganicCarbon),
            ph: clamp_field(self.ph, Nutrient::Ph),
            moisture: clamp_field(self.moisture, Nutrient::Moisture),
        }
    }

    fn validate(&self) -> Result<(), SoilError> {
        for nutrient in Nutrient::ALL {
            if !self.get(nutrient).is_finite() {
                return Err(SoilError::Validation(format!(
                    "{} MUST be a finite number",
                    nutrient.as_str()
                )));
            }
        }
        Ok(())
    }
}

fn clamp_field(value: f64, nutrient: Nutrient) -> f64 {
    let (min, max) = nutrient.range();
    if value.is_nan() {
        return min;
    }
    value.clamp(min, max)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldStatuses {
    pub nitrogen: NutrientStatus,
    pub phosphorus: NutrientStatus,
    pub potassium: NutrientStatus,
    pub organic_carbon: NutrientStatus,
    pub ph: NutrientStatus,
    pub moisture: NutrientStatus,
}

impl FieldStatuses {
    #[must_use]
    pub fn of(levels: &SoilLevels) -> Self {
        Self {
            nitrogen: Nutrient::Nitrogen.classify(levels.nitrogen),
            phosphorus: Nutrient::Phosphorus.classify(levels.phosphorus),
            potassium: Nutrient::Potassium.classify(levels.potassium),
            organic_carbon: Nutrient::OrganicCarbon.classify(levels.organic_carbon),
            ph: Nutrient::Ph.classify(levels.ph),
            moisture: Nutrient::Moisture.classify(levels.moisture),
        }
    }
}

/// Immutable soil-health-card reading; the starting point of every entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BaselineSnapshot {
    #[serde(alias = "uid")]
    pub user_id: EntityId,
    #[serde(default)]
    pub location: String,
    #[serde(flatten)]
    pub levels: SoilLevels,
}

impl BaselineSnapshot {
    /// # Errors
    /// Returns [`SoilError::Validation`] for a blank or untrimmed `user_id` or a
    /// non-finite measurement.
    pub fn validate(&self) -> Result<(), SoilError> {
        let canonical = EntityId::parse(self.user_id.as_str())?;
        if canonical != self.user_id {
            return Err(SoilError::Validation(format!(
                "user_id `{}` MUST NOT carry surrounding whitespace",
                self.user_id
            )));
        }
        self.levels.validate()
    }
}

/// One baseline per entity; entries are write-once.
#[derive(Debug, Clone, Default)]
pub struct BaselineStore {
    snapshots: BTreeMap<EntityId, BaselineSnapshot>,
}

impl BaselineStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a baseline.
    ///
    /// # Errors
    /// Returns [`SoilError::Validation`] when the snapshot is invalid and
    /// [`SoilError::Configuration`] when the entity already has a baseline.
    pub fn insert(&mut self, snapshot: BaselineSnapshot) -> Result<(), SoilError> {
        snapshot.validate()?;
        if self.snapshots.contains_key(&snapshot.user_id) {
            return Err(SoilError::Configuration(format!(
                "baseline for `{}` already recorded; baselines are immutable",
                snapshot.user_id
            )));
        }
        self.snapshots.insert(snapshot.user_id.clone(), snapshot);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, user_id: &EntityId) -> Option<&BaselineSnapshot> {
        self.snapshots.get(user_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BaselineSnapshot> {
        self.snapshots.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Clamped, classified soil state of one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CurrentState {
    pub user_id: EntityId,
    pub location: String,
    #[serde(flatten)]
    pub levels: SoilLevels,
    pub status: FieldStatuses,
}

impl CurrentState {
    #[must_use]
    pub fn from_levels(user_id: EntityId, location: String, raw: &SoilLevels) -> Self {
        let levels = raw.clamped();
        Self {
            user_id,
            location,
            status: FieldStatuses::of(&levels),
            levels,
        }
    }
}

/// `clamp(baseline + delta)`, then classified.
#[must_use]
pub fn reconcile(baseline: &BaselineSnapshot, delta: &Delta) -> CurrentState {
    CurrentState::from_levels(
        baseline.user_id.clone(),
        baseline.location.clone(),
        &baseline.levels.apply(delta),
    )
}

/// Applies one event on top of the last known state (not the baseline).
#[must_use]
pub fn project(last: &CurrentState, event: &SoilEvent, ruleset: &TransformRuleset) -> CurrentState {
    let delta = transform(&event.kind, ruleset);
    CurrentState::from_levels(
        last.user_id.clone(),
        last.location.clone(),
        &last.levels.apply(&delta),
    )
}

/// Folds a run of events onto the last known state, in the given order.
#[must_use]
pub fn project_all<'a, I>(last: &CurrentState, events: I, ruleset: &TransformRuleset) -> CurrentState
where
    I: IntoIterator<Item = &'a SoilEvent>,
{
    events
        .into_iter()
        .fold(last.clone(), |state, event| project(&state, event, ruleset))
}

/// Starting point for an optimistic projection: the published state when one
/// exists, otherwise the classified baseline. `None` without either.
#[must_use]
pub fn last_known_state(
    published: Option<&CurrentState>,
    baseline: Option<&BaselineSnapshot>,
) -> Option<CurrentState> {
    published
        .cloned()
        .or_else(|| baseline.map(|snapshot| reconcile(snapshot, &Delta::ZERO)))
}
