//! Paneweave CLI
//!
//! Command-line interface for inspecting the state paneweave windows persist
//! in their shared store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paneweave_coordinator::config::default_store_path;
use paneweave_coordinator::store::{
    LayoutsBackup, LAYOUTS_BACKUP_KEY, LIVENESS_KEY, POPOUTS_KEY, SHARED_PROPS_KEY,
};
use paneweave_coordinator::{
    Clock, Config, FileStore, LivenessRecord, Storage, StorageScope, SystemClock,
};
use paneweave_ipc::{SharedPropsState, WindowLayout, BASE_MAIN_ID};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "paneweave-cli")]
#[command(author, version, about = "Inspect paneweave session state")]
struct Cli {
    /// Store file (defaults to the configured one)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Source code scoping the state
    #[arg(long, global = true, default_value = "NG")]
    source: String,

    /// User the state belongs to
    #[arg(long, global = true, default_value = "local")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List popout windows known to base-main
    Popouts,
    /// Show heartbeat stamps and which windows are rotten
    Liveness,
    /// Layout trees by main id
    Layouts {
        #[command(subcommand)]
        what: LayoutsCommand,
    },
    /// Show the shared props
    SharedProps,
}

#[derive(Subcommand)]
enum LayoutsCommand {
    /// List main ids with a persisted layout
    List,
    /// Print the layout tree of one window
    Show {
        /// Main id of the window
        #[arg(default_value = BASE_MAIN_ID)]
        main_id: String,
    },
    /// Print the last layouts backup
    Backup,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}. Using defaults.", e);
        Config::default()
    });
    let path = cli
        .store
        .clone()
        .or_else(|| config.storage.path.clone())
        .unwrap_or_else(default_store_path);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let storage = Storage::new(
        Arc::new(FileStore::open(&path)),
        StorageScope::new(&cli.source, &cli.user),
        clock.clone(),
    );
    let version = config.storage.layouts_version.as_str();

    match cli.command {
        Commands::Popouts => {
            let popouts: Vec<WindowLayout> = storage
                .get(POPOUTS_KEY, Some(version))
                .context("Failed to read popouts")?
                .unwrap_or_default();
            if popouts.is_empty() {
                println!("No popouts");
            }
            for popout in popouts {
                let widgets: Vec<String> = popout.widgets.iter().map(|w| w.to_string()).collect();
                println!("{}  {}", popout.client.id, widgets.join(", "));
            }
        }
        Commands::Liveness => {
            let record: Option<LivenessRecord> = storage
                .get(LIVENESS_KEY, None)
                .context("Failed to read liveness record")?;
            let Some(record) = record else {
                println!("No liveness record in {}", path.display());
                return Ok(());
            };
            let now = clock.now_ms();
            let rotten_after = config.rotten_after().as_millis() as u64;
            println!("Epoch {}", record.epoch);
            for (id, seen) in &record.windows {
                let age = now.saturating_sub(*seen);
                let status = if age > rotten_after { "rotten" } else { "alive" };
                println!("{:<20} {:>8} ms ago  {}", id, age, status);
            }
        }
        Commands::Layouts { what } => match what {
            LayoutsCommand::List => {
                for id in storage.layouts(version).keys() {
                    println!("{}", id);
                }
            }
            LayoutsCommand::Show { main_id } => {
                let layouts = storage.layouts(version);
                let layout = layouts
                    .get(&main_id)
                    .with_context(|| format!("No layout for {}", main_id))?;
                println!("{}", serde_json::to_string_pretty(layout)?);
            }
            LayoutsCommand::Backup => {
                let backup: Option<LayoutsBackup> = storage
                    .get(LAYOUTS_BACKUP_KEY, None)
                    .context("Failed to read layouts backup")?;
                match backup {
                    Some(backup) => println!("{}", serde_json::to_string_pretty(&backup)?),
                    None => println!("No layouts backup"),
                }
            }
        },
        Commands::SharedProps => {
            let props: Option<SharedPropsState> = storage
                .get(SHARED_PROPS_KEY, Some(version))
                .context("Failed to read shared props")?;
            match props {
                Some(props) => println!("{}", serde_json::to_string_pretty(&props)?),
                None => println!("No shared props"),
            }
        }
    }

    Ok(())
}
