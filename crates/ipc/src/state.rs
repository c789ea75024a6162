//! Replicated state owned by the base-main window.

use crate::client::ClientIdentity;
use paneweave_core_layout::Widget;
use serde::{Deserialize, Serialize};

/// Prefix of the client id of a window that is still being opened.
pub const OPENING_PREFIX: &str = "opening-";

/// Version every replica starts from before its first sync.
pub const REPLICA_VERSION: i64 = -1;

/// The widgets shown by one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLayout {
    pub client: ClientIdentity,
    #[serde(default)]
    pub widgets: Vec<Widget>,
}

impl WindowLayout {
    /// Create a window layout.
    pub fn new(client: ClientIdentity, widgets: Vec<Widget>) -> Self {
        Self { client, widgets }
    }

    /// Whether the window's first widget is a screencast.
    pub fn is_screencast(&self) -> bool {
        self.widgets
            .first()
            .map(|w| w.kind.is_screencast())
            .unwrap_or(false)
    }
}

/// Number of popouts that count as layout windows; screencasts don't.
pub fn layout_windows(popouts: &[WindowLayout]) -> usize {
    popouts.iter().filter(|p| !p.is_screencast()).count()
}

/// Id of the opening placeholder for a window.
pub fn opening_id(client_id: &str) -> String {
    format!("{}{}", OPENING_PREFIX, client_id)
}

/// Which widgets are open in which window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementState {
    pub version: i64,
    #[serde(default)]
    pub main: Option<WindowLayout>,
    #[serde(default)]
    pub widgets_of_base_main: Vec<Widget>,
    #[serde(default)]
    pub popouts: Vec<WindowLayout>,
    #[serde(default)]
    pub opening_popouts: Vec<WindowLayout>,
}

impl PlacementState {
    /// State of a window that owns a layout tree.
    pub fn for_main(version: i64, main: WindowLayout) -> Self {
        Self {
            version,
            main: Some(main),
            widgets_of_base_main: Vec::new(),
            popouts: Vec::new(),
            opening_popouts: Vec::new(),
        }
    }

    /// State of a popout before it has synced with main.
    pub fn for_popout(layout: WindowLayout) -> Self {
        Self {
            version: REPLICA_VERSION,
            main: None,
            widgets_of_base_main: Vec::new(),
            popouts: vec![layout],
            opening_popouts: Vec::new(),
        }
    }

    /// Widgets of the main window, empty when unknown.
    pub fn main_widgets(&self) -> &[Widget] {
        self.main.as_ref().map(|m| m.widgets.as_slice()).unwrap_or(&[])
    }

    /// Find a popout by client id.
    pub fn popout(&self, id: &str) -> Option<&WindowLayout> {
        self.popouts.iter().find(|p| p.client.id == id)
    }

    /// Whether any admitted popout shows the widget.
    pub fn in_popouts(&self, widget: &Widget) -> bool {
        self.popouts.iter().any(|p| p.widgets.contains(widget))
    }
}

/// Progress of an issue report shared between windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportIssueStatus {
    #[default]
    Idle,
    Reporting,
    Reported,
    Uploading,
}

/// Small property blob kept identical in every window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPropsState {
    pub version: i64,
    #[serde(default)]
    pub report_issue_status: ReportIssueStatus,
}

impl Default for SharedPropsState {
    fn default() -> Self {
        Self {
            version: REPLICA_VERSION,
            report_issue_status: ReportIssueStatus::Idle,
        }
    }
}
