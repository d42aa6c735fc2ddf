use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SoilError;

/// Nutrient fraction released per kg of a fertilizer product.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct NutrientShares {
    #[serde(default)]
    pub nitrogen: f64,
    #[serde(default)]
    pub phosphorus: f64,
    #[serde(default)]
    pub potassium: f64,
}

/// Fixed nutrient removal (kg/ha) for one harvest of a crop family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CropRemoval {
    /// Lowercase substring matched against the reported crop name.
    pub pattern: String,
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AmendmentRules {
    /// Substrings identifying organic amendments (manure, compost).
    pub organic_patterns: Vec<String>,
    pub organic_carbon_per_tonne: f64,
    pub organic_nitrogen_per_kg: f64,
    pub organic_phosphorus_per_kg: f64,
    pub organic_potassium_per_kg: f64,
    pub lime_pattern: String,
    pub lime_ph_per_tonne: f64,
    pub gypsum_pattern: String,
    pub gypsum_ph_per_tonne: f64,
}

/// Versioned coefficient tables used by [`crate::transform`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformRuleset {
    pub ruleset_version: u32,
    pub rain_nitrogen_leach_per_mm: f64,
    pub rain_moisture_per_mm: f64,
    pub irrigation_reference_liters: f64,
    pub irrigation_moisture_per_reference: f64,
    /// Keyed by lowercase product name; matching is exact.
    pub fertilizers: BTreeMap<String, NutrientShares>,
    /// Checked in order; the first pattern contained in the crop name wins.
    pub harvest_removals: Vec<CropRemoval>,
    pub default_harvest_removal: CropRemoval,
    pub amendments: AmendmentRules,
}

impl TransformRuleset {
    #[must_use]
    pub fn v1() -> Self {
        let mut fertilizers = BTreeMap::new();
        fertilizers.insert(
            "urea".to_string(),
            NutrientShares {
                nitrogen: 0.46,
                ..NutrientShares::default()
            },
        );
        fertilizers.insert(
            "dap".to_string(),
            NutrientShares {
                nitrogen: 0.18,
                phosphorus: 0.46,
                ..NutrientShares::default()
            },
        );
        fertilizers.insert(
            "potash".to_string(),
            NutrientShares {
                potassium: 0.60,
                ..NutrientShares::default()
            },
        );
        fertilizers.insert(
            "ssp".to_string(),
            NutrientShares {
                phosphorus: 0.16,
                ..NutrientShares::default()
            },
        );

        Self {
            ruleset_version: 1,
            rain_nitrogen_leach_per_mm: 0.8,
            rain_moisture_per_mm: 0.4,
            irrigation_reference_liters: 10_000.0,
            irrigation_moisture_per_reference: 5.0,
            fertilizers,
            harvest_removals: vec![
                CropRemoval {
                    pattern: "wheat".to_string(),
                    nitrogen: 80.0,
                    phosphorus: 15.0,
                    potassium: 60.0,
                },
                CropRemoval {
                    pattern: "rice".to_string(),
                    nitrogen: 90.0,
                    phosphorus: 20.0,
                    potassium: 70.0,
                },
            ],
            default_harvest_removal: CropRemoval {
                pattern: "*".to_string(),
                nitrogen: 50.0,
                phosphorus: 10.0,
                potassium: 40.0,
            },
            amendments: AmendmentRules {
                organic_patterns: vec!["manure".to_string(), "compost".to_string()],
                organic_carbon_per_tonne: 0.05,
                organic_nitrogen_per_kg: 0.005,
                organic_phosphorus_per_kg: 0.002,
                organic_potassium_per_kg: 0.005,
                lime_pattern: "lime".to_string(),
                lime_ph_per_tonne: 1.0,
                gypsum_pattern: "gypsum".to_string(),
                gypsum_ph_per_tonne: 0.5,
            },
        }
    }

    /// Validates coefficient bounds.
    ///
    /// # Errors
    /// Returns [`SoilError::Configuration`] when a coefficient is negative or
    /// non-finite, a pattern is blank, or the irrigation reference is not positive.
    pub fn validate(&self) -> Result<(), SoilError> {
        if self.ruleset_version == 0 {
            return Err(SoilError::Configuration(
                "ruleset_version MUST be >= 1".to_string(),
            ));
        }

        let amendments = &self.amendments;
        let mut coefficients = vec![
            ("rain_nitrogen_leach_per_mm", self.rain_nitrogen_leach_per_mm),
            ("rain_moisture_per_mm", self.rain_moisture_per_mm),
            (
                "irrigation_moisture_per_reference",
                self.irrigation_moisture_per_reference,
            ),
            (
                "amendments.organic_carbon_per_tonne",
                amendments.organic_carbon_per_tonne,
            ),
            (
                "amendments.organic_nitrogen_per_kg",
                amendments.organic_nitrogen_per_kg,
            ),
            (
                "amendments.organic_phosphorus_per_kg",
                amendments.organic_phosphorus_per_kg,
            ),
            (
                "amendments.organic_potassium_per_kg",
                amendments.organic_potassium_per_kg,
            ),
            ("amendments.lime_ph_per_tonne", amendments.lime_ph_per_tonne),
            (
                "amendments.gypsum_ph_per_tonne",
                amendments.gypsum_ph_per_tonne,
            ),
        ];
        for removal in self
            .harvest_removals
            .iter()
            .chain(std::iter::once(&self.default_harvest_removal))
        {
            coefficients.push(("harvest.nitrogen", removal.nitrogen));
            coefficients.push(("harvest.phosphorus", removal.phosphorus));
            coefficients.push(("harvest.potassium", removal.potassium));
        }
        for shares in self.fertilizers.values() {
            coefficients.push(("fertilizer.nitrogen", shares.nitrogen));
            coefficients.push(("fertilizer.phosphorus", shares.phosphorus));
            coefficients.push(("fertilizer.potassium", shares.potassium));
        }

        for (name, value) in coefficients {
            if !value.is_finite() || value < 0.0 {
                return Err(SoilError::Configuration(format!(
                    "{name} MUST be a finite value >= 0"
                )));
            }
        }

        if !self.irrigation_reference_liters.is_finite() || self.irrigation_reference_liters <= 0.0
        {
            return Err(SoilError::Configuration(
                "irrigation_reference_liters MUST be > 0".to_string(),
            ));
        }

        for name in self.fertilizers.keys() {
            if name.trim().is_empty() || *name != name.to_lowercase() {
                return Err(SoilError::Configuration(format!(
                    "fertilizer key `{name}` MUST be non-empty lowercase"
                )));
            }
        }

        let patterns = self
            .harvest_removals
            .iter()
            .map(|removal| removal.pattern.as_str())
            .chain(amendments.organic_patterns.iter().map(String::as_str))
            .chain([
                amendments.lime_pattern.as_str(),
                amendments.gypsum_pattern.as_str(),
            ]);
        for pattern in patterns {
            if pattern.trim().is_empty() {
                return Err(SoilError::Configuration(
                    "match patterns MUST be non-empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn fertilizer(&self, kind: &str) -> Option<&NutrientShares> {
        self.fertilizers.get(&kind.trim().to_lowercase())
    }

    #[must_use]
    pub fn harvest_removal(&self, crop: &str) -> &CropRemoval {
        let crop = crop.to_lowercase();
        self.harvest_removals
            .iter()
            .find(|removal| crop.contains(&removal.pattern.to_lowercase()))
            .unwrap_or(&self.default_harvest_removal)
    }

    /// Decodes and validates a ruleset from JSON.
    ///
    /// # Errors
    /// Returns [`SoilError::Configuration`] when decoding fails or the decoded
    /// values violate ruleset constraints.
    pub fn from_json(value: &Value) -> Result<Self, SoilError> {
        let ruleset: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SoilError::Configuration(format!("invalid ruleset JSON payload: {err}"))
        })?;
        ruleset.validate()?;
        Ok(ruleset)
    }
}
