use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use tallysync::lifecycle::{SessionStatus, TallyStatus};
use tallysync::model::SpeciesRequirement;

#[derive(Parser, Debug)]
#[command(
    name = "tallysync",
    version,
    about = "Record tree-planting tallies offline and sync them when connected"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Data directory holding tallysync.db (default: $TALLYSYNC_HOME or ~/.tallysync)"
    )]
    pub data_dir: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "URL",
        help = "Remote API base URL (default: $TALLYSYNC_API_URL or http://localhost:8000)"
    )]
    pub api_url: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "SECS",
        help = "Remote request timeout in seconds"
    )]
    pub timeout_secs: Option<u64>,
    #[arg(
        short,
        long,
        global = true,
        action = ArgAction::Count,
        help = "Increase log verbosity (-v info, -vv debug)"
    )]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(subcommand)]
    Tally(TallyCommand),
    #[command(subcommand)]
    Session(SessionCommand),
    #[command(subcommand)]
    Bagup(BagupCommand),
    #[command(subcommand)]
    Sync(SyncCommand),
    #[command(subcommand)]
    Project(ProjectCommand),
    #[command(subcommand)]
    Supervisor(SupervisorCommand),
}

#[derive(Subcommand, Debug)]
pub enum TallyCommand {
    Add(TallyAdd),
    List(TallyList),
    Counts,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    Create(SessionCreate),
    List(SessionList),
    Show(SessionShow),
    Finalize(SessionFinalize),
    Archive(SessionArchive),
}

#[derive(Subcommand, Debug)]
pub enum BagupCommand {
    Add(BagupAdd),
    Set(BagupSet),
    Remove(BagupRemove),
    List(BagupList),
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    Run(SyncRun),
    Status,
}

#[derive(Subcommand, Debug)]
pub enum ProjectCommand {
    Refresh,
    List,
}

#[derive(Subcommand, Debug)]
pub enum SupervisorCommand {
    List,
}

#[derive(Args, Debug)]
pub struct TallyAdd {
    pub trees: i64,
    #[arg(long, value_name = "YYYY-MM-DD", help = "Planting date (default: today)")]
    pub date: Option<String>,
    #[arg(long = "block", value_name = "NAME")]
    pub block_name: Option<String>,
    #[arg(long)]
    pub notes: Option<String>,
}

#[derive(Args, Debug)]
pub struct TallyList {
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: Option<String>,
    #[arg(long, value_enum, num_args = 1..)]
    pub status: Vec<TallyStatusArg>,
}

#[derive(Args, Debug)]
pub struct SessionCreate {
    #[arg(value_name = "BLOCK")]
    pub block_name: String,
    #[arg(
        long,
        value_name = "CODE:NAME:RATIO",
        value_parser = parse_species_spec,
        help = "Species requirement; repeat per species"
    )]
    pub species: Vec<SpeciesRequirement>,
    #[arg(long = "project", value_name = "NAME")]
    pub project_name: Option<String>,
    #[arg(long)]
    pub supervisor: Option<String>,
    #[arg(long = "density", value_name = "TREES_PER_HA")]
    pub target_density: Option<f64>,
    #[arg(long)]
    pub notes: Option<String>,
    #[arg(
        long,
        requires = "project_name",
        help = "Fill species from the cached project when none are given"
    )]
    pub from_project: bool,
}

#[derive(Args, Debug)]
pub struct SessionList {
    #[arg(long, value_enum, num_args = 1..)]
    pub status: Vec<SessionStatusArg>,
    #[arg(long, conflicts_with = "status", help = "Include archived sessions")]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct SessionShow {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct SessionFinalize {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct SessionArchive {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct BagupAdd {
    pub session_id: String,
    #[arg(long, allow_hyphen_values = true, requires = "lng")]
    pub lat: Option<f64>,
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lng: Option<f64>,
    #[arg(long = "count", value_name = "CODE=N", value_parser = parse_count)]
    pub counts: Vec<(String, u32)>,
}

#[derive(Args, Debug)]
pub struct BagupSet {
    pub id: String,
    #[arg(value_name = "CODE=N", num_args = 1.., required = true, value_parser = parse_count)]
    pub counts: Vec<(String, u32)>,
}

#[derive(Args, Debug)]
pub struct BagupRemove {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct BagupList {
    pub session_id: String,
}

#[derive(Args, Debug)]
pub struct SyncRun {
    #[arg(long, help = "Treat the remote as unreachable")]
    pub offline: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum TallyStatusArg {
    Pending,
    Synced,
    Error,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum SessionStatusArg {
    Draft,
    Pending,
    Finalized,
    Synced,
    Error,
    Archived,
}

impl From<TallyStatusArg> for TallyStatus {
    fn from(value: TallyStatusArg) -> Self {
        match value {
            TallyStatusArg::Pending => TallyStatus::Pending,
            TallyStatusArg::Synced => TallyStatus::Synced,
            TallyStatusArg::Error => TallyStatus::Error,
        }
    }
}

impl From<SessionStatusArg> for SessionStatus {
    fn from(value: SessionStatusArg) -> Self {
        match value {
            SessionStatusArg::Draft => SessionStatus::Draft,
            SessionStatusArg::Pending => SessionStatus::Pending,
            SessionStatusArg::Finalized => SessionStatus::Finalized,
            SessionStatusArg::Synced => SessionStatus::Synced,
            SessionStatusArg::Error => SessionStatus::Error,
            SessionStatusArg::Archived => SessionStatus::Archived,
        }
    }
}

/// `CODE:NAME:RATIO`; the name may itself contain colons.
fn parse_species_spec(value: &str) -> Result<SpeciesRequirement, String> {
    let (code, rest) = value
        .split_once(':')
        .ok_or_else(|| format!("expected CODE:NAME:RATIO, got '{value}'"))?;
    let (name, ratio) = rest
        .rsplit_once(':')
        .ok_or_else(|| format!("expected CODE:NAME:RATIO, got '{value}'"))?;
    let code = code.trim();
    if code.is_empty() {
        return Err("species code cannot be empty".to_string());
    }
    let ratio: f64 = ratio
        .trim()
        .parse()
        .map_err(|_| format!("invalid ratio '{ratio}'"))?;
    let name = name.trim();
    Ok(SpeciesRequirement {
        species_code: code.to_string(),
        display_name: if name.is_empty() { code } else { name }.to_string(),
        required_ratio: ratio,
    })
}

fn parse_count(value: &str) -> Result<(String, u32), String> {
    let (code, count) = value
        .split_once('=')
        .ok_or_else(|| format!("expected CODE=N, got '{value}'"))?;
    let code = code.trim();
    if code.is_empty() {
        return Err("species code cannot be empty".to_string());
    }
    let count: u32 = count
        .trim()
        .parse()
        .map_err(|_| format!("invalid count '{count}' for {code}"))?;
    Ok((code.to_string(), count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn species_spec_keeps_colons_in_name() {
        let parsed = parse_species_spec("pl:Pine: lodgepole:0.6").expect("parse");
        assert_eq!(parsed.species_code, "pl");
        assert_eq!(parsed.display_name, "Pine: lodgepole");
        assert!((parsed.required_ratio - 0.6).abs() < 1e-9);

        let unnamed = parse_species_spec("sx::0.4").expect("parse");
        assert_eq!(unnamed.display_name, "sx");
        assert!(parse_species_spec("pl:Pine").is_err());
        assert!(parse_species_spec("pl:Pine:lots").is_err());
    }

    #[test]
    fn counts_parse_code_and_number() {
        assert_eq!(parse_count("pl=40"), Ok(("pl".to_string(), 40)));
        assert!(parse_count("pl").is_err());
        assert!(parse_count("pl=-1").is_err());
        assert!(parse_count("=3").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
