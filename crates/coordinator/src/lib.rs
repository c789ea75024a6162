//! Paneweave Coordinator
//!
//! Keeps the windows of one session in agreement about which widgets are
//! open and where.
//!
//! Responsibilities:
//! - Deliver filtered messages between windows over a session channel
//! - Track window liveness through heartbeats persisted to a shared store
//! - Replicate placement and shared-props state from the base-main window
//! - Apply layout mutations to each window's own layout tree
//! - Drive each window from a tokio event loop

pub mod bus;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod delegate;
pub mod host;
pub mod launch;
pub mod liveness;
pub mod runtime;
pub mod settings;
pub mod store;

pub use bus::{Bus, BusError, ChannelHub, SessionChannel, Subscription};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorError, ListenerHandle, WindowDeps, WindowRole};
pub use delegate::{DelegatePolicy, LayoutDelegate};
pub use host::{Notice, NoticeLevel, RecordingHost, WindowHost};
pub use launch::{LaunchError, LaunchParams};
pub use liveness::{LivenessRecord, LivenessRegistry, DEFAULT_ROTTEN_THRESHOLD};
pub use runtime::{spawn_window, WindowCommand, WindowHandle, WindowResponse};
pub use settings::{SettingValue, SettingsError, SettingsRequest, SettingsSource, StaticSettings};
pub use store::{
    EntryUpdate, FileStore, KvStore, MemoryStore, Storage, StorageScope, StoreError, StoredEntry,
};
