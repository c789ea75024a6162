//! Window primitives provided by whatever hosts a window.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// A message shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.level, self.message)
    }
}

/// Operations a window asks of its host.
pub trait WindowHost: Send + Sync {
    /// Open a new window at `url`. Returns `false` when the host refused.
    fn open_window(&self, url: &str, features: &str) -> bool;

    /// Close the calling window.
    fn close_window(&self);

    /// Show a notice to the user.
    fn notify(&self, notice: Notice);
}

/// Host that records every request, for tests and dry runs.
#[derive(Debug)]
pub struct RecordingHost {
    allow_open: AtomicBool,
    opened: Mutex<Vec<String>>,
    notices: Mutex<Vec<Notice>>,
    closed: AtomicBool,
}

impl Default for RecordingHost {
    fn default() -> Self {
        Self {
            allow_open: AtomicBool::new(true),
            opened: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `open_window` fail from now on.
    pub fn refuse_open(&self) {
        self.allow_open.store(false, Ordering::SeqCst);
    }

    /// URLs passed to `open_window`, including refused ones.
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Notices shown so far.
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Whether `close_window` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl WindowHost for RecordingHost {
    fn open_window(&self, url: &str, _features: &str) -> bool {
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(url.to_string());
        }
        self.allow_open.load(Ordering::SeqCst)
    }

    fn close_window(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn notify(&self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}
