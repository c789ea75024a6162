//! Configuration management for paneweave.
//!
//! Configuration is loaded from TOML files in the following locations (in order):
//! 1. The platform config dir (`~/.config/paneweave/config.toml` on Linux)
//! 2. `~/.config/paneweave/config.toml` (Unix-style, for every platform)
//! 3. `./config.toml` (current directory, for development)

use anyhow::{Context, Result};
use directories::ProjectDirs;
use paneweave_core_layout::WidgetKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for paneweave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Heartbeat and close timing.
    pub heartbeat: HeartbeatConfig,
    /// Rotten-window detection.
    pub liveness: LivenessConfig,
    /// Window and widget limits.
    pub limits: LimitsConfig,
    /// Layout tree policy.
    pub layout: LayoutConfig,
    /// Window opening.
    pub window: WindowConfig,
    /// Persistent store.
    pub storage: StorageConfig,
    /// Behavior configuration.
    pub behavior: BehaviorConfig,
}

/// Heartbeat-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Interval of the heartbeat job in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Extra `is_main_alive` probes before a window gives up on main.
    #[serde(default)]
    pub main_alive_retries: u32,

    /// Delay before a window whose main is gone closes itself.
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,

    /// Delay before a popout closes after its widgets were closed.
    #[serde(default = "default_self_close_ms")]
    pub self_close_ms: u64,

    /// Delay between opening consecutive sub-main windows.
    #[serde(default = "default_sub_main_stagger_ms")]
    pub sub_main_stagger_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            main_alive_retries: 0,
            close_grace_ms: default_close_grace_ms(),
            self_close_ms: default_self_close_ms(),
            sub_main_stagger_ms: default_sub_main_stagger_ms(),
        }
    }
}

impl HeartbeatConfig {
    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Grace delay before closing a window whose main is gone.
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Delay before a popout closes itself.
    pub fn self_close(&self) -> Duration {
        Duration::from_millis(self.self_close_ms)
    }
}

/// Liveness-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// How long past the next expected heartbeat a window counts as rotten.
    #[serde(default = "default_rotten_threshold_ms")]
    pub rotten_threshold_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            rotten_threshold_ms: default_rotten_threshold_ms(),
        }
    }
}

/// Limits on windows and widgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of layout windows, counting the main window.
    #[serde(default = "default_max_layouts")]
    pub max_layouts: usize,

    /// Limit applied to allow-listed users.
    #[serde(default = "default_allow_listed_max")]
    pub allow_listed_max: usize,

    /// Regex patterns of room ids that are never closed by a room limit.
    #[serde(default = "default_exempt_room_patterns")]
    pub exempt_room_patterns: Vec<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_layouts: default_max_layouts(),
            allow_listed_max: default_allow_listed_max(),
            exempt_room_patterns: default_exempt_room_patterns(),
        }
    }
}

/// Layout tree policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Minimum pixel width of a split pane on mobile-class windows.
    #[serde(default = "default_mobile_min_width")]
    pub mobile_min_width: f64,

    /// Minimum pixel width of a split pane on desktop windows.
    #[serde(default = "default_desktop_min_width")]
    pub desktop_min_width: f64,

    /// Kinds that get a close button when sharing a tabset.
    #[serde(default = "default_colocated_kinds")]
    pub closable_kinds: Vec<WidgetKind>,

    /// Kinds that can't be dragged to another place.
    #[serde(default = "default_colocated_kinds")]
    pub protected_kinds: Vec<WidgetKind>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            mobile_min_width: default_mobile_min_width(),
            desktop_min_width: default_desktop_min_width(),
            closable_kinds: default_colocated_kinds(),
            protected_kinds: default_colocated_kinds(),
        }
    }
}

/// Window opening configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Base URL new windows are opened at.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Window features used when a popout opens another window.
    #[serde(default = "default_popout_features")]
    pub popout_features: String,

    /// Window features used when a main window opens another window.
    #[serde(default = "default_main_features")]
    pub main_features: String,

    /// Whether windows are mobile-class.
    #[serde(default)]
    pub mobile: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            popout_features: default_popout_features(),
            main_features: default_main_features(),
            mobile: false,
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Version tag of the layouts, popouts and shared props entries.
    #[serde(default = "default_layouts_version")]
    pub layouts_version: String,

    /// Store file; defaults to the platform data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            layouts_version: default_layouts_version(),
            path: None,
        }
    }
}

/// Behavior-related configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions for serde
fn default_interval_ms() -> u64 {
    3000
}

fn default_close_grace_ms() -> u64 {
    3000
}

fn default_self_close_ms() -> u64 {
    100
}

fn default_sub_main_stagger_ms() -> u64 {
    3000
}

fn default_rotten_threshold_ms() -> u64 {
    1000
}

fn default_max_layouts() -> usize {
    10
}

fn default_allow_listed_max() -> usize {
    1000
}

fn default_exempt_room_patterns() -> Vec<String> {
    vec!["^Charting_".to_string(), "FakeRoom_".to_string()]
}

fn default_mobile_min_width() -> f64 {
    200.0
}

fn default_desktop_min_width() -> f64 {
    320.0
}

fn default_colocated_kinds() -> Vec<WidgetKind> {
    vec![WidgetKind::new("Announcements"), WidgetKind::new("PrivateChats")]
}

fn default_base_url() -> String {
    "http://localhost:3000/".to_string()
}

fn default_popout_features() -> String {
    "width=600,height=400,left=200,top=200".to_string()
}

fn default_main_features() -> String {
    "left=0,top=0".to_string()
}

fn default_layouts_version() -> String {
    "1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A value that was out of range and got replaced during validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
}

impl ConfigWarning {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Load configuration from standard locations.
    ///
    /// Returns default config if no file is found.
    pub fn load() -> Result<Self> {
        let paths = config_paths();

        for path in &paths {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Replace nonsensical values with defaults and report what changed.
    pub fn validate(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.heartbeat.interval_ms == 0 {
            warnings.push(ConfigWarning::new(
                "heartbeat.interval_ms",
                format!("must be positive, using {}", default_interval_ms()),
            ));
            self.heartbeat.interval_ms = default_interval_ms();
        }

        if self.liveness.rotten_threshold_ms == 0 {
            warnings.push(ConfigWarning::new(
                "liveness.rotten_threshold_ms",
                format!("must be positive, using {}", default_rotten_threshold_ms()),
            ));
            self.liveness.rotten_threshold_ms = default_rotten_threshold_ms();
        }

        // The main window and the one being opened always count
        if self.limits.max_layouts < 2 {
            warnings.push(ConfigWarning::new(
                "limits.max_layouts",
                "must be at least 2, using 2",
            ));
            self.limits.max_layouts = 2;
        }

        if self.layout.mobile_min_width <= 0.0 {
            warnings.push(ConfigWarning::new(
                "layout.mobile_min_width",
                format!("must be positive, using {}", default_mobile_min_width()),
            ));
            self.layout.mobile_min_width = default_mobile_min_width();
        }

        if self.layout.desktop_min_width <= 0.0 {
            warnings.push(ConfigWarning::new(
                "layout.desktop_min_width",
                format!("must be positive, using {}", default_desktop_min_width()),
            ));
            self.layout.desktop_min_width = default_desktop_min_width();
        }

        let mut patterns = Vec::new();
        for pattern in self.limits.exempt_room_patterns.drain(..) {
            match regex::Regex::new(&pattern) {
                Ok(_) => patterns.push(pattern),
                Err(e) => warnings.push(ConfigWarning::new(
                    "limits.exempt_room_patterns",
                    format!("dropping invalid pattern {}: {}", pattern, e),
                )),
            }
        }
        self.limits.exempt_room_patterns = patterns;

        warnings
    }

    /// How long after its last heartbeat a window counts as rotten.
    pub fn rotten_after(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms + self.liveness.rotten_threshold_ms)
    }

    /// Compile the exempt room patterns, skipping invalid ones.
    pub fn exempt_room_regexes(&self) -> Vec<regex::Regex> {
        self.limits
            .exempt_room_patterns
            .iter()
            .filter_map(|pattern| match regex::Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(_) => {
                    tracing::warn!("Invalid regex in exempt_room_patterns: {}", pattern);
                    None
                }
            })
            .collect()
    }
}

/// Get all possible config file paths in priority order.
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(proj_dirs) = ProjectDirs::from("com", "paneweave", "paneweave") {
        paths.push(proj_dirs.config_dir().join("config.toml"));
    }

    if let Some(home) = dirs_home() {
        paths.push(home.join(".config").join("paneweave").join("config.toml"));
    }

    paths.push(PathBuf::from("config.toml"));

    paths
}

/// Default location of the shared store file.
pub fn default_store_path() -> PathBuf {
    ProjectDirs::from("com", "paneweave", "paneweave")
        .map(|dirs| dirs.data_dir().join("store.json"))
        .unwrap_or_else(|| PathBuf::from("paneweave-store.json"))
}

/// Get the user's home directory.
fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
