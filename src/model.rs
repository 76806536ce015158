use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{bagup, project, tally, tally_session};
use crate::error::AppError;
use crate::lifecycle::{BagupStatus, SessionStatus, TallyStatus};

pub type BagupCounts = BTreeMap<String, u32>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpeciesRequirement {
    pub species_code: String,
    pub display_name: String,
    pub required_ratio: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TallyInput {
    pub date: String,
    pub trees: i64,
    pub notes: Option<String>,
    pub block_name: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionInput {
    pub block_name: String,
    pub project_name: Option<String>,
    pub supervisor: Option<String>,
    pub target_density: Option<f64>,
    pub notes: Option<String>,
    pub species: Vec<SpeciesRequirement>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BagupInput {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub counts: BagupCounts,
}

/// Session listing filter. Without explicit statuses, archived sessions are hidden.
#[derive(Clone, Debug, Default)]
pub struct SessionFilter {
    pub statuses: Option<Vec<SessionStatus>>,
}

impl SessionFilter {
    pub fn with_statuses(statuses: Vec<SessionStatus>) -> Self {
        Self {
            statuses: Some(statuses),
        }
    }

    pub fn everything() -> Self {
        Self::with_statuses(SessionStatus::ALL.to_vec())
    }

    pub fn resolved_statuses(&self) -> Vec<SessionStatus> {
        match &self.statuses {
            Some(statuses) => statuses.clone(),
            None => SessionStatus::ALL
                .into_iter()
                .filter(|status| *status != SessionStatus::Archived)
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub tallies: Vec<(TallyStatus, u64)>,
    pub sessions: Vec<(SessionStatus, u64)>,
    pub bagups: Vec<(BagupStatus, u64)>,
}

impl tally::Model {
    pub fn sync_status(&self) -> Result<TallyStatus, AppError> {
        TallyStatus::parse(&self.status)
    }
}

impl tally_session::Model {
    pub fn sync_status(&self) -> Result<SessionStatus, AppError> {
        SessionStatus::parse(&self.status)
    }

    pub fn species_list(&self) -> Result<Vec<SpeciesRequirement>, AppError> {
        Ok(serde_json::from_value(self.species.clone())?)
    }
}

impl bagup::Model {
    pub fn sync_status(&self) -> Result<BagupStatus, AppError> {
        BagupStatus::parse(&self.status)
    }

    /// Reads one species count; absent or malformed entries count as zero.
    pub fn count_for(&self, species_code: &str) -> u64 {
        self.counts
            .get(species_code)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    pub fn count_map(&self) -> BagupCounts {
        let mut counts = BagupCounts::new();
        if let Some(entries) = self.counts.as_object() {
            for (code, value) in entries {
                let count = value.as_u64().unwrap_or(0);
                counts.insert(code.clone(), u32::try_from(count).unwrap_or(u32::MAX));
            }
        }
        counts
    }
}

impl project::Model {
    /// Species offered by a project, as `code -> display name`.
    ///
    /// Entries without a string name fall back to the code itself.
    pub fn species_catalog(&self) -> Vec<(String, String)> {
        let Some(entries) = self.species_data.as_object() else {
            return Vec::new();
        };
        entries
            .iter()
            .filter(|(code, _)| !code.trim().is_empty())
            .map(|(code, name)| {
                let display = name
                    .as_str()
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or(code.as_str());
                (code.clone(), display.to_string())
            })
            .collect()
    }
}

pub fn validate_species(species: &[SpeciesRequirement]) -> Result<(), AppError> {
    let mut seen = HashSet::new();
    for item in species {
        let code = item.species_code.trim();
        if code.is_empty() {
            return Err(AppError::InvalidInput(
                "species code cannot be empty".to_string(),
            ));
        }
        if !seen.insert(code.to_string()) {
            return Err(AppError::InvalidInput(format!(
                "duplicate species code '{code}'"
            )));
        }
        if !item.required_ratio.is_finite() || !(0.0..=1.0).contains(&item.required_ratio) {
            return Err(AppError::InvalidInput(format!(
                "required ratio for '{code}' must be between 0 and 1"
            )));
        }
    }
    Ok(())
}

pub fn trim_optional(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}
