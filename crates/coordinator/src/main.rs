//! Paneweave
//!
//! Runs a local session of coordinated windows. Every window requested by the
//! session (popouts, sub-main layouts) is started in-process with its own
//! coordinator, sharing one bus and one store.

use anyhow::Result;
use clap::Parser;
use paneweave_coordinator::config::default_store_path;
use paneweave_coordinator::settings::StaticSettings;
use paneweave_coordinator::store::{Profile, PROFILE_KEY, SESSION_KEY};
use paneweave_coordinator::{
    spawn_window, ChannelHub, Clock, Config, FileStore, KvStore, LaunchParams, MemoryStore,
    Notice, NoticeLevel, SettingsSource, Storage, StorageScope, SystemClock, WindowCommand,
    WindowDeps, WindowHandle, WindowHost,
};
use paneweave_ipc::{OpenOptions, Widget};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "paneweave")]
#[command(author, version, about = "Run a local session of coordinated windows")]
struct Args {
    /// User the session belongs to
    #[arg(long, default_value = "local")]
    user: String,

    /// Source code scoping the persisted state
    #[arg(long, default_value = "NG")]
    source: String,

    /// Widgets to open in the main window
    #[arg(long, default_value = "2")]
    widgets: usize,

    /// Widgets to open in popouts
    #[arg(long, default_value = "1")]
    popouts: usize,

    /// Seconds to run before leaving
    #[arg(long, default_value = "10")]
    seconds: u64,

    /// Comma-separated user ids exempt from limits
    #[arg(long, value_delimiter = ',')]
    allow_list: Vec<String>,

    /// Keep state in memory instead of the store file
    #[arg(long)]
    memory: bool,

    /// Store file (overrides the configured path)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Events of the session loop.
#[derive(Debug)]
enum SessionEvent {
    /// A window asked for a new window.
    Open { url: String },
    /// A window closed itself.
    Closed { label: String },
    /// Time is up or Ctrl+C.
    Shutdown,
}

/// Host that turns window requests into session events.
struct SessionHost {
    label: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl WindowHost for SessionHost {
    fn open_window(&self, url: &str, features: &str) -> bool {
        debug!("[{}] open {} ({})", self.label, url, features);
        self.tx
            .send(SessionEvent::Open {
                url: url.to_string(),
            })
            .is_ok()
    }

    fn close_window(&self) {
        let _ = self.tx.send(SessionEvent::Closed {
            label: self.label.clone(),
        });
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!("[{}] {}", self.label, notice.message),
            NoticeLevel::Warning => warn!("[{}] {}", self.label, notice.message),
            NoticeLevel::Error => error!("[{}] {}", self.label, notice.message),
        }
    }
}

struct Session {
    hub: ChannelHub,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    settings: Arc<dyn SettingsSource>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    windows: Vec<(WindowHandle, JoinHandle<()>)>,
}

impl Session {
    fn launch(&mut self, launch: LaunchParams) -> Option<WindowHandle> {
        let label = match (&launch.page, &launch.room_id) {
            (Some(page), Some(room_id)) => format!("{}:{}", page, room_id),
            _ => launch.main_id().to_string(),
        };
        let deps = WindowDeps {
            hub: self.hub.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            host: Arc::new(SessionHost {
                label: label.clone(),
                tx: self.event_tx.clone(),
            }),
            config: self.config.clone(),
        };
        match spawn_window(launch, deps, self.settings.clone()) {
            Ok((handle, task)) => {
                info!("Window {} started as {}", label, handle.main_id());
                self.windows.push((handle.clone(), task));
                Some(handle)
            }
            Err(e) => {
                error!("Failed to start window {}: {}", label, e);
                None
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (needed for log level)
    let loaded = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        // Can't use tracing yet, fall back to eprintln
        eprintln!("Failed to load configuration: {}. Using defaults.", e);
        Config::default()
    });

    let log_level = match config.behavior.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_warnings = config.validate();
    for w in &config_warnings {
        warn!("Config: {} - {}", w.field, w.message);
    }

    info!("Paneweave session starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn KvStore> = if args.memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        let path = args
            .store
            .clone()
            .or_else(|| config.storage.path.clone())
            .unwrap_or_else(default_store_path);
        info!("Using store {}", path.display());
        Arc::new(FileStore::open(path))
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Sign the session in so windows fetch their settings
    let storage = Storage::new(
        store.clone(),
        StorageScope::new(&args.source, &args.user),
        clock.clone(),
    );
    if storage.get_value(SESSION_KEY, None)?.is_none() {
        storage.set(SESSION_KEY, &args.user, None, None)?;
    }
    if storage.get_value(PROFILE_KEY, None)?.is_none() {
        let profile = Profile {
            default_room_id: "room-1".to_string(),
        };
        storage.set(PROFILE_KEY, &profile, None, None)?;
    }

    let allow_list: Vec<&str> = args.allow_list.iter().map(String::as_str).collect();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut session = Session {
        hub: ChannelHub::new(),
        store,
        clock,
        config: Arc::new(config),
        settings: Arc::new(StaticSettings::with_allow_list(&allow_list)),
        event_tx: event_tx.clone(),
        windows: Vec::new(),
    };

    let Some(main) = session.launch(LaunchParams::base_main(&args.user, &args.source)) else {
        anyhow::bail!("base-main window failed to start");
    };

    for i in 0..args.widgets {
        let widget = Widget::new("Chat", format!("room-{}", i + 1));
        if let Err(e) = main.open_widget(widget, OpenOptions::default()).await {
            warn!("Failed to open widget: {}", e);
        }
    }
    for i in 0..args.popouts {
        let widget = Widget::new("Chart", format!("room-{}", i + 1));
        if let Err(e) = main.open_widget(widget, OpenOptions::popout()).await {
            warn!("Failed to open popout: {}", e);
        }
    }
    if let Err(e) = main.request(WindowCommand::OpenSubMains).await {
        warn!("Failed to reopen sub-main windows: {}", e);
    }

    // Install Ctrl+C handler so terminal kill triggers graceful shutdown
    {
        let shutdown_tx = event_tx.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("Ctrl+C received, leaving session...");
                let _ = shutdown_tx.send(SessionEvent::Shutdown);
            }
        });
    }
    {
        let timeout_tx = event_tx.clone();
        let seconds = args.seconds;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let _ = timeout_tx.send(SessionEvent::Shutdown);
        });
    }

    while let Some(event) = event_rx.recv().await {
        match event {
            SessionEvent::Open { url } => {
                let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
                match LaunchParams::from_query(query) {
                    Ok(launch) => {
                        session.launch(launch);
                    }
                    Err(e) => warn!("Ignoring window request {}: {}", url, e),
                }
            }
            SessionEvent::Closed { label } => info!("Window {} closed", label),
            SessionEvent::Shutdown => break,
        }
    }

    match main.state().await {
        Ok(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        Err(e) => warn!("Base-main is gone: {}", e),
    }
    if let Err(e) = main.request(WindowCommand::SaveAllWindows).await {
        warn!("Failed to back up layouts: {}", e);
    }

    for (handle, task) in session.windows {
        handle.shutdown().await;
        if let Err(e) = task.await {
            debug!("Window {} task ended abnormally: {}", handle.main_id(), e);
        }
    }

    info!("Session left");
    Ok(())
}
