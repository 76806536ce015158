//! Derived session metrics. Everything here is recomputed from its inputs on
//! each call; nothing touches the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::entities::bagup;
use crate::model::SpeciesRequirement;

pub const FIRST_BAGUP: &str = "First bagup";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Elapsed {
    First,
    Since(Duration),
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Elapsed::First => f.write_str(FIRST_BAGUP),
            Elapsed::Since(duration) => f.write_str(&format_duration(*duration)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpeciesProgress {
    pub species_code: String,
    pub display_name: String,
    pub total: u64,
    pub ratio: f64,
    pub required_ratio: f64,
}

impl SpeciesProgress {
    /// Signed gap between the planted share and the target share.
    pub fn deviation(&self) -> f64 {
        self.ratio - self.required_ratio
    }
}

/// Per-species sums over `bagups`. Every species in the list is present, codes
/// outside the list are ignored.
pub fn totals(species: &[SpeciesRequirement], bagups: &[bagup::Model]) -> BTreeMap<String, u64> {
    species
        .iter()
        .map(|item| {
            let sum = bagups
                .iter()
                .map(|bagup| bagup.count_for(&item.species_code))
                .sum();
            (item.species_code.clone(), sum)
        })
        .collect()
}

pub fn ratios(
    species: &[SpeciesRequirement],
    totals: &BTreeMap<String, u64>,
) -> BTreeMap<String, f64> {
    let overall: u64 = species
        .iter()
        .map(|item| totals.get(&item.species_code).copied().unwrap_or(0))
        .sum();
    species
        .iter()
        .map(|item| {
            let total = totals.get(&item.species_code).copied().unwrap_or(0);
            let ratio = if overall == 0 {
                0.0
            } else {
                total as f64 / overall as f64
            };
            (item.species_code.clone(), ratio)
        })
        .collect()
}

/// Time since the previous bagup, keyed by bagup id.
pub fn elapsed_map(bagups: &[bagup::Model]) -> BTreeMap<String, Elapsed> {
    let mut sorted: Vec<&bagup::Model> = bagups.iter().collect();
    sorted.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut elapsed = BTreeMap::new();
    let mut previous: Option<DateTime<Utc>> = None;
    for bagup in sorted {
        let entry = match previous {
            None => Elapsed::First,
            Some(prev) => {
                let gap = bagup.created_at - prev;
                Elapsed::Since(gap.max(Duration::zero()))
            }
        };
        elapsed.insert(bagup.id.clone(), entry);
        previous = Some(bagup.created_at);
    }
    elapsed
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.num_seconds().max(0);
    let minutes = total_seconds / 60;
    let seconds = total_seconds % 60;
    if minutes == 0 {
        format!("{seconds}s")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

pub fn progress(species: &[SpeciesRequirement], bagups: &[bagup::Model]) -> Vec<SpeciesProgress> {
    let totals = totals(species, bagups);
    let ratios = ratios(species, &totals);
    species
        .iter()
        .map(|item| SpeciesProgress {
            species_code: item.species_code.clone(),
            display_name: item.display_name.clone(),
            total: totals.get(&item.species_code).copied().unwrap_or(0),
            ratio: ratios.get(&item.species_code).copied().unwrap_or(0.0),
            required_ratio: item.required_ratio,
        })
        .collect()
}
