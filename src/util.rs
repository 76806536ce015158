use chrono::{DateTime, Utc};

use crate::entities::{bagup, project, supervisor, tally, tally_session};
use crate::metrics::{self, Elapsed};
use crate::model::{SpeciesRequirement, SyncCounts};
use crate::sync::{CacheRefresh, SyncOutcome};

fn has_text(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|text| !text.trim().is_empty())
        .unwrap_or(false)
}

fn with_error(status: &str, error: &Option<String>) -> String {
    match error.as_deref() {
        Some(message) if !message.trim().is_empty() => format!("{status}: {message}"),
        _ => status.to_string(),
    }
}

pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M").to_string()
}

fn format_percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

pub fn format_tally_line(item: &tally::Model) -> String {
    let mut line = format!(
        "[{}] {} {} trees (tally id {})",
        with_error(&item.status, &item.status_error),
        item.date,
        item.trees,
        item.id
    );
    if has_text(&item.block_name) {
        line.push_str(&format!(" block {}", item.block_name.as_deref().unwrap_or("")));
    }
    if has_text(&item.notes) {
        line.push_str(&format!(" - {}", item.notes.as_deref().unwrap_or("")));
    }
    line
}

pub fn format_session_line(session: &tally_session::Model) -> String {
    let mut line = format!(
        "[{}] {} (session id {}, created {})",
        with_error(&session.status, &session.status_error),
        session.block_name,
        session.id,
        format_datetime(session.created_at)
    );
    if has_text(&session.project_name) {
        line.push_str(&format!(
            " project {}",
            session.project_name.as_deref().unwrap_or("")
        ));
    }
    line
}

pub fn format_bagup_line(
    item: &bagup::Model,
    species: &[SpeciesRequirement],
    elapsed: Option<&Elapsed>,
) -> String {
    let counts = species
        .iter()
        .map(|entry| format!("{}={}", entry.species_code, item.count_for(&entry.species_code)))
        .collect::<Vec<_>>()
        .join(" ");
    let mut line = format!(
        "- [{}] {} (bagup id {}, {})",
        with_error(&item.status, &item.status_error),
        if counts.is_empty() { "(no species)" } else { counts.as_str() },
        item.id,
        format_datetime(item.created_at)
    );
    if let Some(elapsed) = elapsed {
        line.push_str(&format!(", {elapsed}"));
    }
    if let (Some(lat), Some(lng)) = (item.lat, item.lng) {
        line.push_str(&format!(" @ {lat:.5},{lng:.5}"));
    }
    line
}

pub fn format_session_detail(
    session: &tally_session::Model,
    species: &[SpeciesRequirement],
    bagups: &[bagup::Model],
) -> String {
    let mut output = String::new();
    output.push_str(&format!("Session ID: {}\n", session.id));
    output.push_str(&format!("Block: {}\n", session.block_name));
    output.push_str(&format!(
        "Status: {}\n",
        with_error(&session.status, &session.status_error)
    ));
    if has_text(&session.project_name) {
        output.push_str(&format!(
            "Project: {}\n",
            session.project_name.as_deref().unwrap_or("")
        ));
    }
    if has_text(&session.supervisor) {
        output.push_str(&format!(
            "Supervisor: {}\n",
            session.supervisor.as_deref().unwrap_or("")
        ));
    }
    if let Some(density) = session.target_density {
        output.push_str(&format!("Target density: {density}\n"));
    }
    if has_text(&session.notes) {
        output.push_str(&format!(
            "Notes: {}\n",
            session.notes.as_deref().unwrap_or("")
        ));
    }
    output.push_str(&format!("Created: {}\n", format_datetime(session.created_at)));
    output.push('\n');

    if species.is_empty() {
        output.push_str("Species: (none)\n");
    } else {
        output.push_str("Species:\n");
        for row in metrics::progress(species, bagups) {
            output.push_str(&format!(
                "- {} ({}): {} trees, {} (target {}, {:+.1} pts)\n",
                row.display_name,
                row.species_code,
                row.total,
                format_percent(row.ratio),
                format_percent(row.required_ratio),
                row.deviation() * 100.0
            ));
        }
    }
    output.push('\n');

    if bagups.is_empty() {
        output.push_str("Bagups: (none)");
        return output;
    }
    let elapsed = metrics::elapsed_map(bagups);
    output.push_str(&format!("Bagups ({}):\n", bagups.len()));
    for item in bagups {
        output.push_str(&format_bagup_line(item, species, elapsed.get(&item.id)));
        output.push('\n');
    }
    output.trim_end().to_string()
}

pub fn format_sync_counts(counts: &SyncCounts) -> String {
    fn row<S: Copy>(label: &str, items: &[(S, u64)], name: impl Fn(S) -> &'static str) -> String {
        let parts = items
            .iter()
            .map(|(status, count)| format!("{}={count}", name(*status)))
            .collect::<Vec<_>>()
            .join(" ");
        format!("{label}: {parts}")
    }

    [
        row("Tallies", &counts.tallies, |status| status.as_str()),
        row("Sessions", &counts.sessions, |status| status.as_str()),
        row("Bagups", &counts.bagups, |status| status.as_str()),
    ]
    .join("\n")
}

pub fn format_sync_outcome(outcome: &SyncOutcome) -> String {
    if outcome.skipped {
        return "Sync skipped: offline.".to_string();
    }
    if outcome.synced == 0 && outcome.failed == 0 {
        return "Nothing to sync.".to_string();
    }
    format!(
        "Sync finished: {} synced, {} failed.",
        outcome.synced, outcome.failed
    )
}

pub fn format_cache_refresh(refresh: &CacheRefresh) -> String {
    fn part(label: &str, value: Option<usize>) -> String {
        match value {
            Some(count) => format!("{label}: {count} cached"),
            None => format!("{label}: unchanged"),
        }
    }
    format!(
        "{}\n{}",
        part("Projects", refresh.projects),
        part("Supervisors", refresh.supervisors)
    )
}

pub fn format_project_line(item: &project::Model) -> String {
    let species = item
        .species_catalog()
        .into_iter()
        .map(|(code, name)| if code == name { code } else { format!("{code} ({name})") })
        .collect::<Vec<_>>();
    let blocks = item.blocks_data.as_array().map(Vec::len).unwrap_or(0);
    if species.is_empty() {
        format!("- {} (blocks {blocks})", item.project_name)
    } else {
        format!(
            "- {} (blocks {blocks}): {}",
            item.project_name,
            species.join(", ")
        )
    }
}

pub fn format_supervisor_line(item: &supervisor::Model) -> String {
    match item.project_name.as_deref() {
        Some(project) if !project.trim().is_empty() => format!("- {} ({project})", item.name),
        _ => format!("- {}", item.name),
    }
}
