//! Paneweave IPC Protocol
//!
//! Shared types for communication between the windows of one session:
//! client identities, recipient filters, the message envelope and the
//! replicated placement / shared-props state.

pub mod client;
pub mod filter;
pub mod message;
pub mod state;

pub use client::{ClientIdentity, Role, BASE_MAIN_ID};
pub use filter::{matches, FilterMode, FilterProperty, MessageFilter};
pub use message::{
    CloseSelector, CustomCommand, DecodeError, Envelope, MainIsAlive, Message, MessageKind,
    OpenOptions, OpenWidget,
};
pub use paneweave_core_layout::{Widget, WidgetKind};
pub use state::{PlacementState, ReportIssueStatus, SharedPropsState, WindowLayout};

/// Prefix of every session channel name.
pub const CHANNEL_PREFIX: &str = "paneweave-windows-channel-";

/// Name of the broadcast channel shared by the windows of a session.
pub fn channel_name(session_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, session_id)
}
