use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::{EventKind, TransformRuleset};

const KG_PER_TONNE: f64 = 1000.0;

/// Per-event effect on each soil field. Summation is component-wise, so the
/// order in which deltas are accumulated only matters for float rounding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Delta {
    pub nitrogen: f64,
    pub phosphorus: f64,
    pub potassium: f64,
    pub moisture: f64,
    pub organic_carbon: f64,
    pub ph: f64,
}

impl Delta {
    pub const ZERO: Self = Self {
        nitrogen: 0.0,
        phosphorus: 0.0,
        potassium: 0.0,
        moisture: 0.0,
        organic_carbon: 0.0,
        ph: 0.0,
    };

    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Add for Delta {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            nitrogen: self.nitrogen + rhs.nitrogen,
            phosphorus: self.phosphorus + rhs.phosphorus,
            potassium: self.potassium + rhs.potassium,
            moisture: self.moisture + rhs.moisture,
            organic_carbon: self.organic_carbon + rhs.organic_carbon,
            ph: self.ph + rhs.ph,
        }
    }
}

impl AddAssign for Delta {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for Delta {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

/// Maps one canonical event to its delta. Pure and total: unknown subtypes,
/// malformed and unrecognized events all yield [`Delta::ZERO`].
#[must_use]
pub fn transform(kind: &EventKind, ruleset: &TransformRuleset) -> Delta {
    match kind {
        EventKind::Rain { amount_mm } => Delta {
            nitrogen: -(amount_mm * ruleset.rain_nitrogen_leach_per_mm),
            moisture: amount_mm * ruleset.rain_moisture_per_mm,
            ..Delta::ZERO
        },
        EventKind::Irrigation { liters } => Delta {
            moisture: liters / ruleset.irrigation_reference_liters
                * ruleset.irrigation_moisture_per_reference,
            ..Delta::ZERO
        },
        EventKind::Fertilizer { kind, amount_kg } => {
            ruleset
                .fertilizer(kind)
                .map_or(Delta::ZERO, |shares| Delta {
                    nitrogen: amount_kg * shares.nitrogen,
                    phosphorus: amount_kg * shares.phosphorus,
                    potassium: amount_kg * shares.potassium,
                    ..Delta::ZERO
                })
        }
        EventKind::Harvest { crop } => {
            let removal = ruleset.harvest_removal(crop);
            Delta {
                nitrogen: -removal.nitrogen,
                phosphorus: -removal.phosphorus,
                potassium: -removal.potassium,
                ..Delta::ZERO
            }
        }
        EventKind::Amendment { kind, amount_kg } => amendment_delta(kind, *amount_kg, ruleset),
        EventKind::Malformed { .. } | EventKind::Unrecognized { .. } => Delta::ZERO,
    }
}

fn amendment_delta(kind: &str, amount_kg: f64, ruleset: &TransformRuleset) -> Delta {
    let rules = &ruleset.amendments;
    let kind = kind.to_lowercase();
    let tonnes = amount_kg / KG_PER_TONNE;

    if kind.contains(&rules.lime_pattern.to_lowercase()) {
        return Delta {
            ph: tonnes * rules.lime_ph_per_tonne,
            ..Delta::ZERO
        };
    }

    if kind.contains(&rules.gypsum_pattern.to_lowercase()) {
        return Delta {
            ph: -(tonnes * rules.gypsum_ph_per_tonne),
            ..Delta::ZERO
        };
    }

    if rules
        .organic_patterns
        .iter()
        .any(|pattern| kind.contains(&pattern.to_lowercase()))
    {
        return Delta {
            organic_carbon: tonnes * rules.organic_carbon_per_tonne,
            nitrogen: amount_kg * rules.organic_nitrogen_per_kg,
            phosphorus: amount_kg * rules.organic_phosphorus_per_kg,
            potassium: amount_kg * rules.organic_potassium_per_kg,
            ..Delta::ZERO
        };
    }

    Delta::ZERO
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    fn fertilizer(kind: &str, amount_kg: f64) -> EventKind {
        EventKind::Fertilizer {
            kind: kind.to_string(),
            amount_kg,
        }
    }

    fn amendment(kind: &str, amount_kg: f64) -> EventKind {
        EventKind::Amendment {
            kind: kind.to_string(),
            amount_kg,
        }
    }

    #[test]
    fn rain_leaches_nitrogen_and_adds_moisture() {
        let delta = transform(&EventKind::Rain { amount_mm: 25.0 }, &TransformRuleset::v1());
        assert_close(delta.nitrogen, -20.0);
        assert_close(delta.moisture, 10.0);
        assert_eq!(delta.phosphorus, 0.0);
    }

    #[test]
    fn irrigation_scales_against_reference_volume() {
        let delta = transform(
            &EventKind::Irrigation { liters: 20_000.0 },
            &TransformRuleset::v1(),
        );
        assert_close(delta.moisture, 10.0);
        assert_eq!(delta.nitrogen, 0.0);
    }

    #[test]
    fn fertilizer_products_follow_their_nutrient_shares() {
        let ruleset = TransformRuleset::v1();

        let urea = transform(&fertilizer("Urea", 40.0), &ruleset);
        assert_close(urea.nitrogen, 18.4);

        let dap = transform(&fertilizer("dap", 100.0), &ruleset);
        assert_close(dap.nitrogen, 18.0);
        assert_close(dap.phosphorus, 46.0);

        let potash = transform(&fertilizer("POTASH", 50.0), &ruleset);
        assert_close(potash.potassium, 30.0);

        let ssp = transform(&fertilizer("ssp", 100.0), &ruleset);
        assert_close(ssp.phosphorus, 16.0);
    }

    #[test]
    fn unknown_subtypes_are_explicit_no_ops() {
        let ruleset = TransformRuleset::v1();
        assert!(transform(&fertilizer("xyz", 100.0), &ruleset).is_zero());
        assert!(transform(&amendment("biochar", 100.0), &ruleset).is_zero());
        assert!(transform(
            &EventKind::Malformed {
                declared_type: "rain".to_string(),
                reason: "missing".to_string()
            },
            &ruleset
        )
        .is_zero());
    }

    #[test]
    fn harvest_removes_crop_family_nutrients() {
        let ruleset = TransformRuleset::v1();

        let wheat = transform(
            &EventKind::Harvest {
                crop: "Wheat".to_string(),
            },
            &ruleset,
        );
        assert_eq!(
            (wheat.nitrogen, wheat.phosphorus, wheat.potassium),
            (-80.0, -15.0, -60.0)
        );

        let rice = transform(
            &EventKind::Harvest {
                crop: "rice".to_string(),
            },
            &ruleset,
        );
        assert_eq!(
            (rice.nitrogen, rice.phosphorus, rice.potassium),
            (-90.0, -20.0, -70.0)
        );

        let other = transform(
            &EventKind::Harvest {
                crop: "mustard".to_string(),
            },
            &ruleset,
        );
        assert_eq!(
            (other.nitrogen, other.phosphorus, other.potassium),
            (-50.0, -10.0, -40.0)
        );
    }

    #[test]
    fn amendments_shift_ph_or_organic_matter() {
        let ruleset = TransformRuleset::v1();

        let lime = transform(&amendment("Agricultural Lime", 500.0), &ruleset);
        assert_close(lime.ph, 0.5);

        let gypsum = transform(&amendment("gypsum", 1000.0), &ruleset);
        assert_close(gypsum.ph, -0.5);

        let manure = transform(&amendment("farmyard manure", 2000.0), &ruleset);
        assert_close(manure.organic_carbon, 0.1);
        assert_close(manure.nitrogen, 10.0);
        assert_close(manure.phosphorus, 4.0);
        assert_close(manure.potassium, 10.0);

        let compost = transform(&amendment("compost", 2000.0), &ruleset);
        assert_eq!(compost, manure);
    }

    #[test]
    fn amendment_patterns_match_regardless_of_case() {
        let mut ruleset = TransformRuleset::v1();
        ruleset.amendments.lime_pattern = "Lime".to_string();
        ruleset.amendments.gypsum_pattern = "GYPSUM".to_string();
        ruleset.amendments.organic_patterns = vec!["Vermicompost".to_string()];

        assert_close(transform(&amendment("agri lime", 1000.0), &ruleset).ph, 1.0);
        assert_close(transform(&amendment("Gypsum", 1000.0), &ruleset).ph, -0.5);
        let organic = transform(&amendment("vermicompost", 1000.0), &ruleset);
        assert_close(organic.organic_carbon, 0.05);
        assert_close(organic.nitrogen, 5.0);
    }

    #[test]
    fn deltas_sum_component_wise() {
        let a = Delta {
            nitrogen: 1.0,
            moisture: 2.0,
            ..Delta::ZERO
        };
        let b = Delta {
            nitrogen: -3.0,
            ph: 0.5,
            ..Delta::ZERO
        };
        let total: Delta = [a, b].into_iter().sum();
        assert_eq!(total.nitrogen, -2.0);
        assert_eq!(total.moisture, 2.0);
        assert_eq!(total.ph, 0.5);
    }
}
