mod cli;

use std::sync::Arc;

use clap::Parser;

use tallysync::capability::{
    Connectivity, EndpointProbe, StaticConnectivity, SystemClock, UuidGenerator,
};
use tallysync::config::{Config, ConfigOverrides};
use tallysync::db;
use tallysync::error::AppError;
use tallysync::lifecycle::{SessionStatus, TallyStatus};
use tallysync::model::{BagupCounts, BagupInput, SessionFilter, SessionInput, TallyInput};
use tallysync::remote::HttpRemote;
use tallysync::store::Store;
use tallysync::sync::SyncEngine;
use tallysync::telemetry;
use tallysync::util::{
    format_bagup_line, format_cache_refresh, format_project_line, format_session_detail,
    format_session_line, format_supervisor_line, format_sync_counts, format_sync_outcome,
    format_tally_line,
};

use crate::cli::{
    BagupAdd, BagupCommand, BagupList, BagupRemove, BagupSet, Cli, Command, ProjectCommand,
    SessionArchive, SessionCommand, SessionCreate, SessionFinalize, SessionList, SessionShow,
    SupervisorCommand, SyncCommand, SyncRun, TallyAdd, TallyCommand, TallyList,
};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let Cli {
        data_dir,
        api_url,
        timeout_secs,
        verbose,
        command,
    } = Cli::parse();
    telemetry::init(verbose);

    let config = Config::resolve(ConfigOverrides {
        data_dir,
        api_url,
        timeout_secs,
    })?;
    let db_path = db::resolve_db_path(&config.data_dir);
    db::ensure_parent_dir(&db_path)?;
    let mut lock = db::open_lock(&db_path)?;
    let _guard = lock.write()?;

    let conn = db::connect(&db_path).await?;
    db::ensure_schema(&conn).await?;
    let store = Store::new(conn, Arc::new(SystemClock), Arc::new(UuidGenerator));
    tracing::debug!(path = %db_path.display(), "store opened");

    match command {
        Command::Tally(command) => handle_tally(&store, command).await,
        Command::Session(command) => handle_session(&store, command).await,
        Command::Bagup(command) => handle_bagup(&store, command).await,
        Command::Sync(command) => handle_sync(&store, &config, command).await,
        Command::Project(command) => handle_project(&store, &config, command).await,
        Command::Supervisor(SupervisorCommand::List) => handle_supervisor_list(&store).await,
    }
}

fn build_engine(store: &Store, config: &Config, offline: bool) -> Result<SyncEngine, AppError> {
    let remote = HttpRemote::new(config.api_url.clone(), config.timeout)?;
    let connectivity: Arc<dyn Connectivity> = if offline {
        Arc::new(StaticConnectivity(false))
    } else {
        Arc::new(EndpointProbe::from_url(&config.api_url, config.timeout)?)
    };
    Ok(SyncEngine::new(store.clone(), Arc::new(remote), connectivity)
        .with_batch_size(config.batch_size))
}

async fn handle_tally(store: &Store, command: TallyCommand) -> Result<(), AppError> {
    match command {
        TallyCommand::Add(args) => handle_tally_add(store, args).await,
        TallyCommand::List(args) => handle_tally_list(store, args).await,
        TallyCommand::Counts => handle_tally_counts(store).await,
    }
}

async fn handle_session(store: &Store, command: SessionCommand) -> Result<(), AppError> {
    match command {
        SessionCommand::Create(args) => handle_session_create(store, args).await,
        SessionCommand::List(args) => handle_session_list(store, args).await,
        SessionCommand::Show(args) => handle_session_show(store, args).await,
        SessionCommand::Finalize(args) => handle_session_finalize(store, args).await,
        SessionCommand::Archive(args) => handle_session_archive(store, args).await,
    }
}

async fn handle_bagup(store: &Store, command: BagupCommand) -> Result<(), AppError> {
    match command {
        BagupCommand::Add(args) => handle_bagup_add(store, args).await,
        BagupCommand::Set(args) => handle_bagup_set(store, args).await,
        BagupCommand::Remove(args) => handle_bagup_remove(store, args).await,
        BagupCommand::List(args) => handle_bagup_list(store, args).await,
    }
}

async fn handle_sync(store: &Store, config: &Config, command: SyncCommand) -> Result<(), AppError> {
    match command {
        SyncCommand::Run(args) => handle_sync_run(store, config, args).await,
        SyncCommand::Status => handle_sync_status(store).await,
    }
}

async fn handle_project(
    store: &Store,
    config: &Config,
    command: ProjectCommand,
) -> Result<(), AppError> {
    match command {
        ProjectCommand::Refresh => {
            let engine = build_engine(store, config, false)?;
            let refresh = engine.sync_projects().await;
            println!("{}", format_cache_refresh(&refresh));
            Ok(())
        }
        ProjectCommand::List => {
            let projects = store.list_projects().await?;
            if projects.is_empty() {
                println!("No projects cached.");
                return Ok(());
            }
            for project in &projects {
                println!("{}", format_project_line(project));
            }
            Ok(())
        }
    }
}

async fn handle_tally_add(store: &Store, args: TallyAdd) -> Result<(), AppError> {
    let date = args
        .date
        .unwrap_or_else(|| chrono::Local::now().format("%Y-%m-%d").to_string());
    let tally = store
        .create_tally(TallyInput {
            date,
            trees: args.trees,
            notes: args.notes,
            block_name: args.block_name,
        })
        .await?;
    println!(
        "Created tally ID: {}: {} trees on {}",
        tally.id, tally.trees, tally.date
    );
    Ok(())
}

async fn handle_tally_list(store: &Store, args: TallyList) -> Result<(), AppError> {
    let statuses: Vec<TallyStatus> = if args.status.is_empty() {
        TallyStatus::ALL.to_vec()
    } else {
        args.status.into_iter().map(Into::into).collect()
    };
    let tallies: Vec<_> = match args.date {
        Some(date) => store
            .list_tallies_by_date(date.trim())
            .await?
            .into_iter()
            .filter(|item| {
                item.sync_status()
                    .map(|status| statuses.contains(&status))
                    .unwrap_or(false)
            })
            .collect(),
        None => store.list_tallies_by_status(&statuses).await?,
    };
    if tallies.is_empty() {
        println!("No tallies found.");
        return Ok(());
    }
    let total: i64 = tallies.iter().map(|item| item.trees).sum();
    for tally in &tallies {
        println!("{}", format_tally_line(tally));
    }
    println!("Total: {total} trees in {} tallies", tallies.len());
    Ok(())
}

async fn handle_tally_counts(store: &Store) -> Result<(), AppError> {
    let counts = store.sync_counts().await?;
    for (status, count) in &counts.tallies {
        println!("{}: {count}", status.as_str());
    }
    Ok(())
}

async fn handle_session_create(store: &Store, args: SessionCreate) -> Result<(), AppError> {
    let SessionCreate {
        block_name,
        mut species,
        project_name,
        supervisor,
        target_density,
        notes,
        from_project,
    } = args;
    if from_project && species.is_empty() {
        if let Some(project) = project_name.as_deref() {
            species = store.species_from_project(project).await?;
        }
    }

    let session = store
        .create_session(SessionInput {
            block_name,
            project_name,
            supervisor,
            target_density,
            notes,
            species,
        })
        .await?;
    println!(
        "Created session ID: {}: {} ({} species)",
        session.id,
        session.block_name,
        session.species_list()?.len()
    );
    Ok(())
}

async fn handle_session_list(store: &Store, args: SessionList) -> Result<(), AppError> {
    let filter = if args.all {
        SessionFilter::everything()
    } else if args.status.is_empty() {
        SessionFilter::default()
    } else {
        SessionFilter::with_statuses(args.status.into_iter().map(Into::into).collect())
    };
    let sessions = store.list_sessions(&filter).await?;
    if sessions.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }
    for session in &sessions {
        println!("{}", format_session_line(session));
    }
    Ok(())
}

async fn handle_session_show(store: &Store, args: SessionShow) -> Result<(), AppError> {
    let session = store.get_session(&args.id).await?;
    let species = session.species_list()?;
    let bagups = store.list_bagups_by_session(&session.id).await?;
    println!("{}", format_session_detail(&session, &species, &bagups));
    Ok(())
}

async fn handle_session_finalize(store: &Store, args: SessionFinalize) -> Result<(), AppError> {
    let finalized = store.finalize_session(&args.id).await?;
    println!(
        "Finalized session ID: {} ({} bagups ready to sync)",
        finalized.session.id, finalized.bagups_finalized
    );
    Ok(())
}

async fn handle_session_archive(store: &Store, args: SessionArchive) -> Result<(), AppError> {
    let session = store.archive_session(&args.id).await?;
    println!("Archived session ID: {}", session.id);
    Ok(())
}

async fn ensure_session_editable(store: &Store, session_id: &str) -> Result<(), AppError> {
    let session = store.get_session(session_id).await?;
    let status = session.sync_status()?;
    if !status.is_editable() {
        return Err(AppError::InvalidInput(format!(
            "session id {session_id} is {}; bagups can no longer change",
            status.as_str()
        )));
    }
    Ok(())
}

async fn handle_bagup_add(store: &Store, args: BagupAdd) -> Result<(), AppError> {
    ensure_session_editable(store, &args.session_id).await?;
    let bagup = store
        .create_bagup(
            &args.session_id,
            BagupInput {
                lat: args.lat,
                lng: args.lng,
                counts: collect_counts(args.counts),
            },
        )
        .await?;
    let total: u64 = bagup.count_map().values().map(|count| u64::from(*count)).sum();
    println!("Created bagup ID: {} ({total} trees)", bagup.id);
    Ok(())
}

async fn handle_bagup_set(store: &Store, args: BagupSet) -> Result<(), AppError> {
    let existing = store.get_bagup(&args.id).await?;
    ensure_session_editable(store, &existing.session_id).await?;
    let mut counts = existing.count_map();
    counts.extend(collect_counts(args.counts));
    let bagup = store.save_bagup_counts(&args.id, counts).await?;
    let total: u64 = bagup.count_map().values().map(|count| u64::from(*count)).sum();
    println!("Updated bagup ID: {} ({total} trees)", bagup.id);
    Ok(())
}

async fn handle_bagup_remove(store: &Store, args: BagupRemove) -> Result<(), AppError> {
    store.remove_bagup(&args.id).await?;
    println!("Removed bagup ID: {}", args.id);
    Ok(())
}

async fn handle_bagup_list(store: &Store, args: BagupList) -> Result<(), AppError> {
    let session = store.get_session(&args.session_id).await?;
    let species = session.species_list()?;
    let bagups = store.list_bagups_by_session(&session.id).await?;
    if bagups.is_empty() {
        println!("No bagups found.");
        return Ok(());
    }
    let elapsed = tallysync::metrics::elapsed_map(&bagups);
    for bagup in &bagups {
        println!(
            "{}",
            format_bagup_line(bagup, &species, elapsed.get(&bagup.id))
        );
    }
    Ok(())
}

async fn handle_sync_run(store: &Store, config: &Config, args: SyncRun) -> Result<(), AppError> {
    let engine = build_engine(store, config, args.offline)?;
    let outcome = engine.run_sync().await?;
    println!("{}", format_sync_outcome(&outcome));
    if !outcome.skipped {
        engine.sync_projects().await;
    }
    Ok(())
}

async fn handle_sync_status(store: &Store) -> Result<(), AppError> {
    let counts = store.sync_counts().await?;
    println!("{}", format_sync_counts(&counts));
    let open = store
        .list_sessions_by_status(&[SessionStatus::Draft, SessionStatus::Pending])
        .await?;
    if !open.is_empty() {
        println!("Open sessions waiting to be finalized: {}", open.len());
    }
    Ok(())
}

async fn handle_supervisor_list(store: &Store) -> Result<(), AppError> {
    let supervisors = store.list_supervisors().await?;
    if supervisors.is_empty() {
        println!("No supervisors cached.");
        return Ok(());
    }
    for supervisor in &supervisors {
        println!("{}", format_supervisor_line(supervisor));
    }
    Ok(())
}

fn collect_counts(pairs: Vec<(String, u32)>) -> BagupCounts {
    pairs.into_iter().collect()
}
