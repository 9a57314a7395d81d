use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use mediamigrate_lib::config::MigrationConfig;
use mediamigrate_lib::copy_engine::FsCopyEngine;
use mediamigrate_lib::essential::migrate_essential_files;
use mediamigrate_lib::media_state::{
    resolve_media_migration_state, FsEnvironment, MediaMigrationState,
};
use mediamigrate_lib::progress::Progress;
use mediamigrate_lib::recovery::recover_from_ongoing_migration;
use mediamigrate_lib::store::StoreHandle;
use mediamigrate_lib::tracker::{spawn_observer, MigrationObserver, MigrationTracker};

const EXIT_FAILURE: i32 = 1;
const EXIT_NOT_ONGOING: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "mediamigrate",
    about = "Move a collection's media into app-private storage",
    version
)]
struct Cli {
    /// Collection folder the status check reports on. Defaults to the
    /// destination of the ongoing migration.
    #[arg(long, global = true, value_name = "DIR")]
    collection: Option<PathBuf>,

    /// App-private storage root. Defaults to the state directory.
    #[arg(long, global = true, value_name = "DIR")]
    target_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the overall migration status.
    Status {
        /// Emit a JSON object instead of the text view.
        #[arg(long)]
        json: bool,
    },
    /// Move the essential files, then migrate everything else.
    Start {
        #[arg(long, value_name = "DIR")]
        source: PathBuf,
        #[arg(long, value_name = "DIR")]
        destination: PathBuf,
    },
    /// Continue the migration recorded in the state directory.
    Resume,
    /// Move one file into place right away if it is still at the source.
    Recover {
        /// Path of the file inside the destination.
        path: PathBuf,
    },
}

/// Prints each state as a JSON line on stdout.
struct JsonLinesObserver;

impl MigrationObserver for JsonLinesObserver {
    fn on_progress(&mut self, progress: &Progress) {
        match serde_json::to_string(progress) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("Error: cannot encode progress: {err}"),
        }
    }

    fn on_finished(&mut self, outcome: &Progress) {
        if let Progress::Failure { error } = outcome {
            eprintln!("Error: {}", error.user_text());
        }
    }
}

#[tokio::main]
async fn main() {
    mediamigrate_lib::init_logging();

    let cli = Cli::parse();
    let code = match handle_cli(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            EXIT_FAILURE
        }
    };

    mediamigrate_lib::flush_file_logs();
    process::exit(code);
}

async fn handle_cli(cli: Cli) -> Result<i32> {
    let config = MigrationConfig::from_env().context("read configuration")?;
    if let Err(err) = mediamigrate_lib::init_file_logging(&config.logs_dir()) {
        tracing::warn!(
            target: "mediamigrate",
            event = "file_logging_unavailable",
            error = %err,
        );
    }
    let store = StoreHandle::json_file(config.store_path())?;

    match cli.command {
        Commands::Status { json } => {
            print_status(&config, &store, cli.collection, cli.target_root, json)?;
            Ok(0)
        }
        Commands::Start {
            source,
            destination,
        } => {
            let moved = migrate_essential_files(&store, &config.layout, &source, &destination)?;
            tracing::info!(
                target: "mediamigrate",
                event = "cli_start",
                essential_files = moved.len(),
            );
            run_migration(&config, store).await
        }
        Commands::Resume => {
            if !store.migration_ongoing()? {
                eprintln!("No migration is in progress.");
                return Ok(EXIT_NOT_ONGOING);
            }
            run_migration(&config, store).await
        }
        Commands::Recover { path } => {
            let present = recover_from_ongoing_migration(&store, &config.layout, &path)?;
            println!("{}", json!({ "present": present }));
            Ok(if present { 0 } else { EXIT_FAILURE })
        }
    }
}

async fn run_migration(config: &MigrationConfig, store: StoreHandle) -> Result<i32> {
    let paths = match store.migration_paths()? {
        Some(paths) => paths,
        None => return Ok(EXIT_NOT_ONGOING),
    };
    let engine = Arc::new(FsCopyEngine::new(
        paths.source,
        paths.destination,
        config.layout.clone(),
    ));
    let tracker = MigrationTracker::new(store, engine, config.layout.clone());
    let observer = spawn_observer(tracker.subscribe(), JsonLinesObserver);

    let outcome = tracker.run().await.unwrap_or_else(|| tracker.latest());
    observer.await.context("progress observer task")?;

    Ok(match outcome {
        Progress::Success => 0,
        _ => EXIT_FAILURE,
    })
}

fn print_status(
    config: &MigrationConfig,
    store: &StoreHandle,
    collection: Option<PathBuf>,
    target_root: Option<PathBuf>,
    as_json: bool,
) -> Result<()> {
    let paths = store.migration_paths()?;
    let collection = collection
        .or_else(|| paths.as_ref().map(|p| p.destination.clone()))
        .unwrap_or_else(|| PathBuf::from("."));
    let target_root = target_root.unwrap_or_else(|| config.state_dir.clone());
    let env = FsEnvironment::new(&collection, &target_root, config.legacy_storage_access);

    let state = resolve_media_migration_state(store, &env)?;
    let total_bytes = store.total_bytes()?;
    let error_text = store.error_text()?;

    if as_json {
        let report = json!({
            "state": state,
            "source": paths.as_ref().map(|p| display(&p.source)),
            "destination": paths.as_ref().map(|p| display(&p.destination)),
            "total_bytes": total_bytes,
            "error_text": error_text,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Status: {}", describe(&state));
    if let Some(paths) = &paths {
        println!("Source: {}", paths.source.display());
        println!("Destination: {}", paths.destination.display());
    }
    if let Some(total) = total_bytes {
        println!("Total bytes: {total}");
    }
    if let Some(text) = error_text {
        println!("Last error: {text}");
    }
    Ok(())
}

fn describe(state: &MediaMigrationState) -> String {
    use mediamigrate_lib::media_state::{NotNeededReason, NotOngoing, Ongoing};
    match state {
        MediaMigrationState::NotOngoing(NotOngoing::NotNeeded { reason }) => match reason {
            NotNeededReason::CollectionIsInTargetFolder => {
                "not needed (collection already in app storage)".to_string()
            }
            NotNeededReason::CollectionStaysAccessibleWithoutMigration => {
                "not needed (collection stays accessible)".to_string()
            }
        },
        MediaMigrationState::NotOngoing(NotOngoing::Needed) => "needed".to_string(),
        MediaMigrationState::Ongoing(Ongoing::NotPaused) => "in progress".to_string(),
        MediaMigrationState::Ongoing(Ongoing::PausedDueToError { error_text }) => {
            format!("paused: {error_text}")
        }
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}
