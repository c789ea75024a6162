//! Messages exchanged between windows.
//!
//! Every message travels inside an [`Envelope`] naming its sender and the
//! filters recipients must match. On the wire the message is an object of the
//! form `{"type": "<kind>", "payload": ...}`.

use crate::client::ClientIdentity;
use crate::filter::MessageFilter;
use crate::state::{PlacementState, SharedPropsState};
use paneweave_core_layout::{Widget, WidgetKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Where a widget should be opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOptions {
    /// Open in a new popout window.
    #[serde(default)]
    pub popout: bool,
    /// Main window hosting the widget; `None` or empty means the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_id: Option<String>,
    /// Put the widget into the tabset of this widget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_tab_of: Option<Widget>,
}

impl OpenOptions {
    /// Open in a new popout.
    pub fn popout() -> Self {
        Self {
            popout: true,
            ..Default::default()
        }
    }

    /// Open in the main window with this id.
    pub fn in_main(main_id: impl Into<String>) -> Self {
        Self {
            main_id: Some(main_id.into()),
            ..Default::default()
        }
    }

    /// Target main id, with empty ids treated as absent.
    pub fn target_main(&self) -> Option<&str> {
        self.main_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// Payload of an `open_widget` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWidget {
    pub widget: Widget,
    #[serde(default)]
    pub options: OpenOptions,
}

/// Which widgets a close request targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum CloseSelector {
    /// Exactly these widgets.
    Widgets { widgets: Vec<Widget> },
    /// Every widget matching the given kind and/or room.
    Matching {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<WidgetKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
    },
}

impl CloseSelector {
    /// Select exactly these widgets.
    pub fn widgets(widgets: Vec<Widget>) -> Self {
        CloseSelector::Widgets { widgets }
    }

    /// Select every widget of a kind.
    pub fn kind(kind: impl Into<WidgetKind>) -> Self {
        CloseSelector::Matching {
            kind: Some(kind.into()),
            room_id: None,
        }
    }

    /// Check a widget against the selector.
    pub fn selects(&self, widget: &Widget) -> bool {
        match self {
            CloseSelector::Widgets { widgets } => widgets.contains(widget),
            CloseSelector::Matching { kind, room_id } => {
                kind.as_ref().map_or(true, |k| &widget.kind == k)
                    && room_id.as_ref().map_or(true, |r| &widget.room_id == r)
            }
        }
    }

    /// The subset of `candidates` selected.
    pub fn select(&self, candidates: &[Widget]) -> Vec<Widget> {
        candidates
            .iter()
            .filter(|w| self.selects(w))
            .cloned()
            .collect()
    }
}

/// Versions advertised by base-main in answer to `is_main_alive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MainIsAlive {
    pub version: i64,
    pub main_created_at: u64,
    pub shared_props_version: i64,
}

/// Application-defined command routed to registered listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCommand {
    pub command_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A message between windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Message {
    /// Ask main to open a widget.
    OpenWidget(OpenWidget),
    /// Close selected widgets in every receiving window.
    CloseWidgets(CloseSelector),
    /// Widgets were removed from a window's tree.
    WidgetsAreClosed { widgets: Vec<Widget> },
    /// Close the receiving windows.
    CloseWindows,
    /// Ask base-main for its placement state.
    PullState,
    /// Placement state snapshot from base-main.
    StateChanged(PlacementState),
    /// Heartbeat from a non-base-main window listing its widgets.
    PopoutIsAlive { widgets: Vec<Widget> },
    /// Ask base-main whether it is alive.
    IsMainAlive,
    /// Base-main heartbeat answer.
    MainIsAlive(MainIsAlive),
    /// Error shown by the receiver.
    GeneralError { message: String },
    /// Diagnostic message from a popout.
    GeneralPopoutMessage {
        message: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    /// Application-defined command.
    CustomCommand(CustomCommand),
    /// Ask base-main for its shared props.
    SharedPropsPull,
    /// Shared props snapshot from base-main.
    SharedPropsChanged(SharedPropsState),
    /// Ask base-main to change one shared property.
    SharedPropsUpdate {
        key: String,
        value: serde_json::Value,
    },
}

/// The closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    OpenWidget,
    CloseWidgets,
    WidgetsAreClosed,
    CloseWindows,
    PullState,
    StateChanged,
    PopoutIsAlive,
    IsMainAlive,
    MainIsAlive,
    GeneralError,
    GeneralPopoutMessage,
    CustomCommand,
    SharedPropsPull,
    SharedPropsChanged,
    SharedPropsUpdate,
}

impl MessageKind {
    /// Every kind.
    pub const ALL: [MessageKind; 15] = [
        MessageKind::OpenWidget,
        MessageKind::CloseWidgets,
        MessageKind::WidgetsAreClosed,
        MessageKind::CloseWindows,
        MessageKind::PullState,
        MessageKind::StateChanged,
        MessageKind::PopoutIsAlive,
        MessageKind::IsMainAlive,
        MessageKind::MainIsAlive,
        MessageKind::GeneralError,
        MessageKind::GeneralPopoutMessage,
        MessageKind::CustomCommand,
        MessageKind::SharedPropsPull,
        MessageKind::SharedPropsChanged,
        MessageKind::SharedPropsUpdate,
    ];

    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::OpenWidget => "open_widget",
            MessageKind::CloseWidgets => "close_widgets",
            MessageKind::WidgetsAreClosed => "widgets_are_closed",
            MessageKind::CloseWindows => "close_windows",
            MessageKind::PullState => "pull_state",
            MessageKind::StateChanged => "state_changed",
            MessageKind::PopoutIsAlive => "popout_is_alive",
            MessageKind::IsMainAlive => "is_main_alive",
            MessageKind::MainIsAlive => "main_is_alive",
            MessageKind::GeneralError => "general_error",
            MessageKind::GeneralPopoutMessage => "general_popout_message",
            MessageKind::CustomCommand => "custom_command",
            MessageKind::SharedPropsPull => "shared_props_pull",
            MessageKind::SharedPropsChanged => "shared_props_changed",
            MessageKind::SharedPropsUpdate => "shared_props_update",
        }
    }

    /// Heartbeat kinds are logged at trace level.
    pub fn is_heartbeat(self) -> bool {
        matches!(self, MessageKind::PopoutIsAlive | MessageKind::MainIsAlive)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

impl Message {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::OpenWidget(_) => MessageKind::OpenWidget,
            Message::CloseWidgets(_) => MessageKind::CloseWidgets,
            Message::WidgetsAreClosed { .. } => MessageKind::WidgetsAreClosed,
            Message::CloseWindows => MessageKind::CloseWindows,
            Message::PullState => MessageKind::PullState,
            Message::StateChanged(_) => MessageKind::StateChanged,
            Message::PopoutIsAlive { .. } => MessageKind::PopoutIsAlive,
            Message::IsMainAlive => MessageKind::IsMainAlive,
            Message::MainIsAlive(_) => MessageKind::MainIsAlive,
            Message::GeneralError { .. } => MessageKind::GeneralError,
            Message::GeneralPopoutMessage { .. } => MessageKind::GeneralPopoutMessage,
            Message::CustomCommand(_) => MessageKind::CustomCommand,
            Message::SharedPropsPull => MessageKind::SharedPropsPull,
            Message::SharedPropsChanged(_) => MessageKind::SharedPropsChanged,
            Message::SharedPropsUpdate { .. } => MessageKind::SharedPropsUpdate,
        }
    }

    /// Create a general error message.
    pub fn error(message: impl Into<String>) -> Self {
        Message::GeneralError {
            message: message.into(),
        }
    }
}

/// Errors decoding an envelope from the wire.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A message with its sender and recipient filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender: ClientIdentity,
    #[serde(default)]
    pub filters: Vec<MessageFilter>,
    pub message: Message,
}

impl Envelope {
    /// Wrap a message.
    pub fn new(sender: ClientIdentity, filters: Vec<MessageFilter>, message: Message) -> Self {
        Self {
            sender,
            filters,
            message,
        }
    }

    /// Kind of the wrapped message.
    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serialize to a JSON frame.
    pub fn to_json(&self) -> Result<String, DecodeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON frame, reporting unknown kinds separately from malformed frames.
    pub fn from_json(frame: &str) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_str(frame)?;
        if let Some(kind) = value
            .get("message")
            .and_then(|m| m.get("type"))
            .and_then(|t| t.as_str())
        {
            kind.parse::<MessageKind>()?;
        }
        Ok(serde_json::from_value(value)?)
    }
}
