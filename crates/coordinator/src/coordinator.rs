//! The per-window widgets coordinator.
//!
//! One coordinator runs in every window of a session. Base-main owns the
//! authoritative placement and shared-props state; every other window keeps a
//! replica it replaces wholesale whenever base-main broadcasts. Windows talk
//! only through the session bus and the shared key/value store.
//!
//! The coordinator itself is synchronous. Timers (heartbeat interval, delayed
//! close, staggered sub-main launches) belong to the runtime driving it.

use crate::bus::{Bus, BusError, ChannelHub, Subscription};
use crate::clock::Clock;
use crate::config::Config;
use crate::delegate::{DelegatePolicy, LayoutDelegate};
use crate::host::{Notice, WindowHost};
use crate::launch::LaunchParams;
use crate::liveness::LivenessRegistry;
use crate::settings::{SettingsRequest, ALLOW_LIST_SETTING};
use crate::store::{
    KvStore, LayoutsBackup, Profile, Storage, StorageScope, StoreError, LAYOUTS_BACKUP_KEY,
    LAYOUTS_BACKUP_VERSION, POPOUTS_KEY, PROFILE_KEY, SESSION_KEY, SHARED_PROPS_KEY,
};
use paneweave_core_layout::{Action, LayoutTree, Widget, WidgetKind};
use paneweave_ipc::state::{layout_windows, opening_id};
use paneweave_ipc::{
    ClientIdentity, CloseSelector, CustomCommand, Envelope, MainIsAlive, Message,
    MessageFilter, OpenOptions, OpenWidget, PlacementState, Role, SharedPropsState,
    WindowLayout, BASE_MAIN_ID,
};
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Room id every room limit accepts.
const ALL_ROOMS: &str = "All";

/// Custom command carrying an issue report URL.
pub const REPORT_ISSUE_URL_COMMAND: &str = "SendReportIssueUrl";

/// Errors returned by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Too many widgets of kind {0}")]
    WidgetKindLimitReached(WidgetKind),

    #[error("Layout window limit of {limit} reached")]
    LayoutLimitReached { limit: usize },

    #[error("Shared property {0} is read-only")]
    ReadOnlyField(String),

    #[error("Unknown shared property: {0}")]
    UnknownField(String),

    #[error("Invalid value for shared property {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Window has been released")]
    Released,

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Structural role of a window, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowRole {
    /// The window with main id `main`. Owns the authoritative state.
    BaseMain,
    /// A main window with its own persisted layout.
    SubMain,
    /// A popout hosting a single window of widgets.
    Popout,
}

impl WindowRole {
    /// Whether the window owns a persisted layout.
    pub fn is_main(self) -> bool {
        !matches!(self, WindowRole::Popout)
    }
}

impl fmt::Display for WindowRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowRole::BaseMain => write!(f, "base-main"),
            WindowRole::SubMain => write!(f, "sub-main"),
            WindowRole::Popout => write!(f, "popout"),
        }
    }
}

/// What a window shares with the rest of its session.
#[derive(Clone)]
pub struct WindowDeps {
    pub hub: ChannelHub,
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub host: Arc<dyn WindowHost>,
    pub config: Arc<Config>,
}

/// Callback invoked with `(command_type, data, sender)`.
pub type CustomCommandListener = Box<dyn Fn(&str, &Value, &ClientIdentity) + Send>;

/// Returned by listener registration; pass it back to remove the listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    command_type: String,
    id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KindLimit {
    max: i64,
    default_room_id: Option<String>,
}

fn random_hex(len: usize) -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(len);
    id
}

/// Starting version of an authoritative state. Random so a restarted
/// base-main doesn't repeat a version a replica may still hold.
fn initial_version() -> i64 {
    rand::thread_rng().gen_range(10_000..=15_000)
}

/// Coordinator of one window.
pub struct Coordinator {
    launch: LaunchParams,
    role: WindowRole,
    main_id: String,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    host: Arc<dyn WindowHost>,
    storage: Storage,
    liveness: LivenessRegistry,
    delegate: LayoutDelegate,
    bus: Bus,
    subscription: Option<Subscription>,

    state: PlacementState,
    state_tx: Option<watch::Sender<PlacementState>>,
    shared_props: SharedPropsState,
    shared_props_tx: Option<watch::Sender<SharedPropsState>>,

    allow_listed: bool,
    main_updated_at: Option<u64>,
    popout_updated_at: Option<u64>,
    main_retries: u32,
    initialized: bool,
    heartbeat_active: bool,
    close_request: Option<Duration>,

    kind_limits: HashMap<WidgetKind, KindLimit>,
    room_limit: Option<Vec<String>>,
    exempt_rooms: Vec<Regex>,

    listeners: HashMap<String, Vec<(u64, CustomCommandListener)>>,
    next_listener: u64,
}

impl Coordinator {
    /// Start a window.
    ///
    /// Opens the liveness registry and the layout, joins the session bus and
    /// runs the first heartbeat. The settings fetch is left to the caller,
    /// which reports back through [`Coordinator::on_settings_loaded`].
    pub fn new(launch: LaunchParams, deps: WindowDeps) -> Result<Self, CoordinatorError> {
        let WindowDeps {
            hub,
            store,
            clock,
            host,
            config,
        } = deps;

        let role = if launch.popout {
            WindowRole::Popout
        } else if launch.is_base_main() {
            WindowRole::BaseMain
        } else {
            WindowRole::SubMain
        };
        let now = clock.now_ms();
        let storage = Storage::new(
            store,
            StorageScope::new(&launch.source_code, &launch.user_id),
            clock.clone(),
        );

        let client = match role {
            WindowRole::BaseMain => ClientIdentity::base_main(now),
            WindowRole::SubMain => ClientIdentity::new(launch.main_id(), Role::Popout, now),
            WindowRole::Popout => ClientIdentity::new(random_hex(8), Role::Popout, now),
        };
        let main_id = match role {
            WindowRole::Popout => client.id.clone(),
            _ => launch.main_id().to_string(),
        };
        info!("Starting {} window {} for user {}", role, main_id, launch.user_id);

        if role.is_main() {
            LivenessRegistry::erase(&storage, &main_id)?;
        }
        let liveness = LivenessRegistry::open(
            storage.clone(),
            clock.clone(),
            &client.id,
            role == WindowRole::BaseMain,
            config.rotten_after(),
        )?;

        let mut delegate = LayoutDelegate::new(
            storage.clone(),
            main_id.clone(),
            config.storage.layouts_version.clone(),
            DelegatePolicy::from_config(&config),
            role.is_main(),
        );
        if role != WindowRole::BaseMain {
            if let (Some(page), Some(room_id)) = (&launch.page, &launch.room_id) {
                delegate.add_widget(room_id, page, None);
            }
        }

        let bus = Bus::new(hub.open(&launch.user_id)?, client.clone());

        let layout = WindowLayout::new(client, delegate.widgets());
        let state = match role {
            WindowRole::Popout => PlacementState::for_popout(layout),
            _ => PlacementState::for_main(initial_version(), layout),
        };

        let shared_props = if role == WindowRole::BaseMain {
            let mut persisted = match storage
                .get::<SharedPropsState>(SHARED_PROPS_KEY, Some(&config.storage.layouts_version))
            {
                Ok(Some(persisted)) => persisted,
                Ok(None) => SharedPropsState::default(),
                Err(e) => {
                    warn!("Ignoring invalid persisted shared props: {}", e);
                    SharedPropsState::default()
                }
            };
            persisted.version = initial_version();
            persisted
        } else {
            SharedPropsState::default()
        };

        let subscription = bus.subscribe()?;
        let exempt_rooms = config.exempt_room_regexes();

        let mut coordinator = Self {
            launch,
            role,
            main_id,
            config,
            clock,
            host,
            storage,
            liveness,
            delegate,
            bus,
            subscription: Some(subscription),
            state_tx: Some(watch::channel(state.clone()).0),
            state,
            shared_props_tx: Some(watch::channel(shared_props.clone()).0),
            shared_props,
            allow_listed: false,
            main_updated_at: None,
            popout_updated_at: None,
            main_retries: 0,
            initialized: true,
            heartbeat_active: true,
            close_request: None,
            kind_limits: HashMap::new(),
            room_limit: None,
            exempt_rooms,
            listeners: HashMap::new(),
            next_listener: 1,
        };
        coordinator.tick();
        Ok(coordinator)
    }

    pub fn role(&self) -> WindowRole {
        self.role
    }

    pub fn is_base_main(&self) -> bool {
        self.role == WindowRole::BaseMain
    }

    pub fn is_popout(&self) -> bool {
        self.role == WindowRole::Popout
    }

    /// Main id of the window; a popout's main id is its client id.
    pub fn main_id(&self) -> &str {
        &self.main_id
    }

    /// Identity this window sends messages with.
    pub fn client(&self) -> &ClientIdentity {
        self.bus.client()
    }

    pub fn launch(&self) -> &LaunchParams {
        &self.launch
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Whether the user is exempt from limits and main-loss closing.
    pub fn is_allow_listed(&self) -> bool {
        self.allow_listed
    }

    /// Whether [`Coordinator::release`] has run.
    pub fn is_released(&self) -> bool {
        !self.initialized
    }

    // ---- startup ----

    /// Settings query to run once at startup, if the session is signed in.
    pub fn settings_request(&self) -> Option<SettingsRequest> {
        let session = self
            .storage
            .get::<String>(SESSION_KEY, None)
            .unwrap_or_else(|e| {
                warn!("Failed to read session: {}", e);
                None
            })?;
        let profile = self
            .storage
            .get::<Profile>(PROFILE_KEY, None)
            .unwrap_or_else(|e| {
                warn!("Failed to read profile: {}", e);
                None
            })?;
        Some(SettingsRequest {
            session,
            room_id: profile.default_room_id,
            names: vec![ALLOW_LIST_SETTING.to_string()],
        })
    }

    /// Finish startup once settings are known.
    ///
    /// Base-main closes popouts left over from a previous session. Other
    /// windows persist their layout and pull the current state from main.
    pub fn on_settings_loaded(&mut self, allow_list: Vec<String>) {
        if !self.initialized {
            return;
        }
        self.allow_listed = allow_list.contains(&self.launch.user_id);
        debug!("Allow-listed: {}", self.allow_listed);

        if self.is_base_main() {
            self.post(Message::CloseWindows, vec![MessageFilter::popouts_only()]);
            let empty: Vec<WindowLayout> = Vec::new();
            if let Err(e) = self.storage.set(
                POPOUTS_KEY,
                &empty,
                None,
                Some(&self.config.storage.layouts_version),
            ) {
                warn!("Failed to reset popouts: {}", e);
            }
        } else {
            self.main_updated_at = Some(self.clock.now_ms());
            self.on_state_changed(&[]);
            self.post(Message::PullState, vec![MessageFilter::main_only()]);
            self.post(Message::SharedPropsPull, vec![MessageFilter::main_only()]);
        }
    }

    // ---- event intake ----

    /// Hand the subscription to a runtime that receives on its own.
    pub fn take_subscription(&mut self) -> Option<Subscription> {
        self.subscription.take()
    }

    /// Handle every envelope already waiting on the subscription.
    pub fn pump(&mut self) -> Result<usize, CoordinatorError> {
        let mut handled = 0;
        loop {
            let Some(subscription) = self.subscription.as_mut() else {
                break;
            };
            match subscription.try_recv()? {
                Some(envelope) => {
                    self.handle(envelope);
                    handled += 1;
                }
                None => break,
            }
        }
        Ok(handled)
    }

    /// Apply one received envelope.
    pub fn handle(&mut self, envelope: Envelope) {
        if !self.initialized {
            trace!("Released, dropping {}", envelope.kind());
            return;
        }
        let Envelope {
            sender, message, ..
        } = envelope;

        match message {
            Message::OpenWidget(request) => self.recv_open_widget(&sender, request),
            Message::CloseWidgets(selector) => self.recv_close_widgets(&selector),
            Message::WidgetsAreClosed { widgets } => self.recv_widgets_are_closed(&widgets),
            Message::CloseWindows => self.recv_close_windows(),
            Message::PullState => {
                if self.is_base_main() {
                    self.post(
                        Message::StateChanged(self.state.clone()),
                        vec![MessageFilter::with_id(&sender.id)],
                    );
                }
            }
            Message::StateChanged(state) => self.recv_state_changed(&sender, state),
            Message::PopoutIsAlive { widgets } => self.recv_popout_is_alive(&sender, widgets),
            Message::IsMainAlive => {
                if self.is_base_main() {
                    let alive = MainIsAlive {
                        version: self.state.version,
                        main_created_at: self.client().created_at,
                        shared_props_version: self.shared_props.version,
                    };
                    let me = self.client().id.clone();
                    self.post(
                        Message::MainIsAlive(alive),
                        vec![MessageFilter::without_id(me)],
                    );
                }
            }
            Message::MainIsAlive(alive) => self.recv_main_is_alive(&sender, alive),
            Message::GeneralError { message } => self.host.notify(Notice::error(message)),
            Message::GeneralPopoutMessage { message, data } => {
                if self.is_base_main() && self.state.popout(&sender.id).is_some() {
                    debug!("Message from popout {}: {} {}", sender.id, message, data);
                }
            }
            Message::CustomCommand(command) => self.recv_custom_command(&sender, &command),
            Message::SharedPropsPull => {
                if self.is_base_main() {
                    self.post(
                        Message::SharedPropsChanged(self.shared_props.clone()),
                        vec![MessageFilter::with_id(&sender.id)],
                    );
                }
            }
            Message::SharedPropsChanged(props) => {
                if !self.is_base_main() {
                    self.shared_props = props;
                    self.notify_shared_props();
                }
            }
            Message::SharedPropsUpdate { key, value } => {
                if self.is_base_main() {
                    if let Err(e) = self.apply_shared_prop(&key, value) {
                        warn!("Rejected shared props update from {}: {}", sender.id, e);
                    }
                }
            }
        }
    }

    /// Run one heartbeat.
    pub fn tick(&mut self) {
        if !self.initialized || !self.heartbeat_active {
            return;
        }
        let id = self.client().id.clone();
        if let Err(e) = self.liveness.register(&id) {
            warn!("Failed to register heartbeat of {}: {}", id, e);
        }

        if self.is_base_main() {
            self.remove_expired_popouts();
        } else {
            self.send_popout_is_alive();
            self.check_main_alive();
        }
    }

    /// Stop the heartbeat job.
    pub fn clear_heartbeat(&mut self) {
        if self.heartbeat_active {
            debug!("Heartbeat of {} stopped", self.main_id);
            self.heartbeat_active = false;
        }
    }

    // ---- opening widgets ----

    /// Ask for a widget to be opened.
    ///
    /// Without a popout flag or a main id the widget opens in this window.
    /// Requests for another window go to base-main and count against the
    /// layout window limit.
    pub fn send_to_open_widget(
        &mut self,
        widget: Widget,
        options: OpenOptions,
    ) -> Result<(), CoordinatorError> {
        let mut options = options;
        let foreign = options.popout
            || options
                .target_main()
                .map(|id| id != self.main_id)
                .unwrap_or(false);

        if foreign {
            let popouts: Vec<WindowLayout> = self
                .storage
                .get(POPOUTS_KEY, Some(&self.config.storage.layouts_version))
                .unwrap_or_else(|e| {
                    warn!("Failed to read popouts: {}", e);
                    None
                })
                .unwrap_or_default();
            let next = layout_windows(&popouts) + 2;
            let limit = self.layouts_limit();
            debug!("Layout windows {}/{}", next, limit);
            if next > limit {
                self.host.notify(Notice::warning("Layout window limit reached"));
                return Err(CoordinatorError::LayoutLimitReached { limit });
            }
        }

        if !options.popout && options.target_main().is_none() {
            options.main_id = Some(self.main_id.clone());
        }

        let filters = if foreign {
            vec![MessageFilter::main_only()]
        } else {
            self.filter_me()
        };
        self.bus
            .publish(Message::OpenWidget(OpenWidget { widget, options }), filters)?;
        Ok(())
    }

    fn recv_open_widget(&mut self, sender: &ClientIdentity, request: OpenWidget) {
        if self.is_popout() {
            return;
        }
        let OpenWidget { widget, options } = request;
        let targets_me = options.target_main() == Some(self.main_id.as_str());

        if targets_me && self.state.main_widgets().contains(&widget) {
            self.delegate.add_widget(&widget.room_id, &widget.kind, None);
            return;
        }

        if let Err(e) = self.can_add_widget(&widget) {
            self.post(
                Message::error(e.to_string()),
                vec![MessageFilter::with_id(&sender.id)],
            );
            return;
        }

        if options.popout || !targets_me {
            let placeholder = ClientIdentity::new(
                opening_id(&random_hex(8)),
                Role::Popout,
                self.clock.now_ms(),
            );
            if let Err(e) = self.liveness.register(&placeholder.id) {
                warn!("Failed to register {}: {}", placeholder.id, e);
            }
            self.state
                .opening_popouts
                .push(WindowLayout::new(placeholder, vec![widget.clone()]));

            let params = LaunchParams {
                popout: options.popout,
                user_id: self.launch.user_id.clone(),
                source_code: self.launch.source_code.clone(),
                main_id: if options.popout {
                    None
                } else {
                    options.target_main().map(str::to_string)
                },
                page: Some(widget.kind.clone()),
                room_id: Some(widget.room_id.clone()),
            };
            let url = params.launch_url(&self.config.window.base_url);
            let features = if options.popout {
                &self.config.window.popout_features
            } else {
                &self.config.window.main_features
            };
            info!("Opening window for {} at {}", widget, url);
            if !self.host.open_window(&url, features) {
                warn!("Window for {} could not be opened", widget);
                self.host.notify(Notice::error("Failed to open a new window"));
            }
        } else {
            let to_tab_of = options.to_tab_of.as_ref().map(|w| &w.kind);
            self.delegate
                .add_widget(&widget.room_id, &widget.kind, to_tab_of);
            if let Some(main) = self.state.main.as_mut() {
                main.widgets.push(widget);
            }
        }

        self.on_state_changed(&[]);
    }

    // ---- closing ----

    /// Ask the receivers to close the selected widgets.
    pub fn send_to_close_widgets(
        &self,
        selector: CloseSelector,
        receivers: Vec<MessageFilter>,
    ) -> Result<(), CoordinatorError> {
        self.bus.publish(Message::CloseWidgets(selector), receivers)?;
        Ok(())
    }

    /// Ask popouts, or the window with `main_id`, to close.
    pub fn send_to_close_windows(&self, main_id: Option<&str>) -> Result<(), CoordinatorError> {
        let filters = match main_id {
            Some(id) => vec![MessageFilter::with_id(id)],
            None => vec![MessageFilter::popouts_only()],
        };
        self.bus.publish(Message::CloseWindows, filters)?;
        Ok(())
    }

    /// Remove widgets from this window's layout and report them closed.
    pub fn close_widgets_in_layout(&mut self, widgets: &[Widget]) {
        debug!("Closing {} widgets in layout of {}", widgets.len(), self.main_id);
        for widget in widgets {
            self.delegate.delete_widget(&widget.room_id, &widget.kind);
        }
        self.post(
            Message::WidgetsAreClosed {
                widgets: widgets.to_vec(),
            },
            self.filter_me(),
        );
    }

    /// Release the window and schedule it to close after `delay`.
    pub fn close_current_page(&mut self, delay: Duration, notice: Option<Notice>) {
        debug!("Closing window {} in {:?}", self.main_id, delay);
        self.release();
        if let Some(notice) = notice {
            self.host.notify(notice);
        }
        self.close_request = Some(delay);
    }

    /// Delay of a scheduled close, taken once by the runtime.
    pub fn take_close_request(&mut self) -> Option<Duration> {
        self.close_request.take()
    }

    /// Close the window now. Popouts empty their layout first.
    pub fn finish_close(&mut self) {
        if self.is_popout() {
            for widget in self.delegate.widgets() {
                self.delegate.delete_widget(&widget.room_id, &widget.kind);
            }
        }
        info!("Window {} closed", self.main_id);
        self.host.close_window();
    }

    fn recv_close_widgets(&mut self, selector: &CloseSelector) {
        let closing = selector.select(&self.delegate.widgets());
        if closing.is_empty() {
            return;
        }
        self.close_widgets_in_layout(&closing);
        if self.is_popout() {
            let delay = self.config.heartbeat.self_close();
            self.close_current_page(delay, None);
        }
    }

    fn recv_widgets_are_closed(&mut self, closed: &[Widget]) {
        if self.is_popout() {
            return;
        }
        let Some(main) = self.state.main.as_mut() else {
            return;
        };
        let before = main.widgets.len();
        main.widgets.retain(|w| !closed.contains(w));
        if main.widgets.len() != before {
            self.on_state_changed(&[]);
        }
    }

    fn recv_close_windows(&mut self) {
        if self.is_base_main() {
            return;
        }
        info!("Window {} asked to close", self.main_id);
        self.release();
        self.host.close_window();
    }

    // ---- heartbeats ----

    fn send_popout_is_alive(&mut self) {
        let widgets = self.delegate.widgets();
        if widgets.is_empty() {
            return;
        }
        self.post(
            Message::PopoutIsAlive { widgets },
            vec![MessageFilter::main_only()],
        );
        self.popout_updated_at = Some(self.clock.now_ms());
    }

    fn check_main_alive(&mut self) {
        if !self.liveness.is_main_rotten() {
            trace!("Main window is alive");
            self.main_retries = 0;
            return;
        }

        let diagnostics = json!({
            "mainUpdatedAt": self.main_updated_at,
            "popoutUpdatedAt": self.popout_updated_at,
            "retries": self.main_retries,
        });

        if self.main_retries < self.config.heartbeat.main_alive_retries {
            self.post(
                Message::GeneralPopoutMessage {
                    message: "main window is rotten, retrying".to_string(),
                    data: diagnostics,
                },
                vec![MessageFilter::main_only()],
            );
            self.post(Message::IsMainAlive, vec![MessageFilter::main_only()]);
            self.main_retries += 1;
            return;
        }

        if self.allow_listed {
            return;
        }

        self.post(
            Message::GeneralPopoutMessage {
                message: "main window is rotten, closing".to_string(),
                data: diagnostics,
            },
            vec![MessageFilter::main_only()],
        );
        warn!("Main window is gone, closing {}", self.main_id);
        let delay = self.config.heartbeat.close_grace();
        self.close_current_page(delay, Some(Notice::warning("main window is closed")));
    }

    fn recv_popout_is_alive(&mut self, sender: &ClientIdentity, widgets: Vec<Widget>) {
        if !self.is_base_main() {
            return;
        }
        let now = self.clock.now_ms();

        if let Some(popout) = self
            .state
            .popouts
            .iter_mut()
            .find(|p| p.client.id == sender.id)
        {
            popout.client.touch(now);
            if popout.widgets.len() != widgets.len() {
                popout.widgets = widgets;
                self.on_state_changed(&[]);
            }
            return;
        }

        self.state.opening_popouts.retain(|opening| {
            opening.client.id != sender.id && !opening.widgets.iter().all(|w| widgets.contains(w))
        });

        let mut client = sender.clone();
        client.created_at = now;
        client.updated_at = now;
        info!("Window {} joined with {} widgets", client.id, widgets.len());
        self.state.popouts.push(WindowLayout::new(client, widgets));
        self.on_state_changed(&[]);
    }

    fn recv_main_is_alive(&mut self, sender: &ClientIdentity, alive: MainIsAlive) {
        if sender.id == self.client().id {
            return;
        }
        if !self.is_base_main() {
            self.main_updated_at = Some(self.clock.now_ms());
        }
        if self.is_popout() {
            if alive.version != self.state.version {
                self.post(Message::PullState, vec![MessageFilter::main_only()]);
            }
            if alive.shared_props_version != self.shared_props.version {
                self.post(Message::SharedPropsPull, vec![MessageFilter::main_only()]);
            }
        }
    }

    fn remove_expired_popouts(&mut self) {
        if !self.is_base_main() {
            return;
        }
        let liveness = &self.liveness;
        let (popouts, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut self.state.popouts)
            .into_iter()
            .partition(|p| !liveness.is_rotten(&p.client.id));
        let (opening, expired_opening): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.state.opening_popouts)
                .into_iter()
                .partition(|p| !liveness.is_rotten(&p.client.id));
        self.state.popouts = popouts;
        self.state.opening_popouts = opening;

        if expired.is_empty() && expired_opening.is_empty() {
            return;
        }
        let expired_ids: Vec<String> = expired
            .iter()
            .chain(expired_opening.iter())
            .map(|p| p.client.id.clone())
            .collect();
        info!("Removed expired windows: {}", expired_ids.join(","));
        self.on_state_changed(&expired_ids);
    }

    // ---- state replication ----

    fn recv_state_changed(&mut self, sender: &ClientIdentity, state: PlacementState) {
        if self.is_base_main() || !sender.is_base_main() {
            return;
        }
        if self.role == WindowRole::SubMain {
            self.state.version += 1;
            self.state.widgets_of_base_main = state.main_widgets().to_vec();
            self.state.popouts = state.popouts;
        } else {
            self.state = state;
        }
        debug!("State of {} replaced, version {}", self.main_id, self.state.version);
        self.notify_state();
    }

    /// Record a state change: bump the version, persist the layout, and
    /// broadcast from base-main. Expired window ids lose their liveness stamp
    /// and persisted layout.
    fn on_state_changed(&mut self, expired: &[String]) {
        self.state.version += 1;
        debug!("State of {} changed to version {}", self.main_id, self.state.version);

        let version = self.config.storage.layouts_version.clone();
        let mut layouts = self.storage.layouts(&version);
        if self.role.is_main() {
            match serde_json::to_value(self.delegate.tree()) {
                Ok(json) => {
                    layouts.insert(self.main_id.clone(), json);
                }
                Err(e) => warn!("Failed to encode layout of {}: {}", self.main_id, e),
            }
        }

        if self.is_base_main() {
            if let Err(e) = self
                .storage
                .set(POPOUTS_KEY, &self.state.popouts, None, Some(&version))
            {
                warn!("Failed to persist popouts: {}", e);
            }
            self.post(
                Message::StateChanged(self.state.clone()),
                vec![MessageFilter::popouts_only()],
            );
        }

        for id in expired {
            if let Err(e) = self.liveness.renew(id) {
                warn!("Failed to erase liveness of {}: {}", id, e);
            }
            layouts.remove(id);
        }
        if let Err(e) = self.storage.set_layouts(&layouts, &version) {
            warn!("Failed to persist layouts: {}", e);
        }
        self.notify_state();
    }

    fn notify_state(&self) {
        if let Some(tx) = &self.state_tx {
            tx.send_replace(self.state.clone());
        }
    }

    fn notify_shared_props(&self) {
        if let Some(tx) = &self.shared_props_tx {
            tx.send_replace(self.shared_props.clone());
        }
    }

    /// Copy of the placement state.
    pub fn state_snapshot(&self) -> PlacementState {
        self.state.clone()
    }

    /// Watch the placement state. Closed once the window is released.
    pub fn watch_state(&self) -> watch::Receiver<PlacementState> {
        match &self.state_tx {
            Some(tx) => tx.subscribe(),
            None => watch::channel(self.state.clone()).1,
        }
    }

    /// Copy of the shared props.
    pub fn shared_props_snapshot(&self) -> SharedPropsState {
        self.shared_props.clone()
    }

    /// Watch the shared props. Closed once the window is released.
    pub fn watch_shared_props(&self) -> watch::Receiver<SharedPropsState> {
        match &self.shared_props_tx {
            Some(tx) => tx.subscribe(),
            None => watch::channel(self.shared_props.clone()).1,
        }
    }

    // ---- shared props ----

    /// Ask base-main to change a shared property.
    pub fn send_to_update_shared_props(
        &self,
        key: &str,
        value: Value,
    ) -> Result<(), CoordinatorError> {
        if key == "version" {
            return Err(CoordinatorError::ReadOnlyField(key.to_string()));
        }
        self.bus.publish(
            Message::SharedPropsUpdate {
                key: key.to_string(),
                value,
            },
            vec![MessageFilter::main_only()],
        )?;
        Ok(())
    }

    fn apply_shared_prop(&mut self, key: &str, value: Value) -> Result<(), CoordinatorError> {
        if key == "version" {
            return Err(CoordinatorError::ReadOnlyField(key.to_string()));
        }
        let invalid = |reason: String| CoordinatorError::InvalidValue {
            key: key.to_string(),
            reason,
        };
        let mut json =
            serde_json::to_value(&self.shared_props).map_err(|e| invalid(e.to_string()))?;
        let fields = json
            .as_object_mut()
            .ok_or_else(|| invalid("shared props are not an object".to_string()))?;
        if !fields.contains_key(key) {
            return Err(CoordinatorError::UnknownField(key.to_string()));
        }
        fields.insert(key.to_string(), value);

        let mut next: SharedPropsState =
            serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
        next.version = self.shared_props.version + 1;
        self.shared_props = next;
        debug!("Shared props changed to version {}", self.shared_props.version);

        self.post(
            Message::SharedPropsChanged(self.shared_props.clone()),
            vec![MessageFilter::popouts_only()],
        );
        if let Err(e) = self.storage.set(
            SHARED_PROPS_KEY,
            &self.shared_props,
            None,
            Some(&self.config.storage.layouts_version),
        ) {
            warn!("Failed to persist shared props: {}", e);
        }
        self.notify_shared_props();
        Ok(())
    }

    // ---- limits ----

    fn layouts_limit(&self) -> usize {
        if self.allow_listed {
            self.config.limits.allow_listed_max
        } else {
            self.config.limits.max_layouts
        }
    }

    fn main_widgets_of_kind(&self, kind: &WidgetKind) -> Vec<Widget> {
        self.state
            .main_widgets()
            .iter()
            .filter(|w| &w.kind == kind)
            .cloned()
            .collect()
    }

    fn slot_count(&self, kind: &WidgetKind) -> i64 {
        match self.kind_limits.get(kind) {
            Some(limit) => limit.max - self.main_widgets_of_kind(kind).len() as i64,
            None => self.config.limits.allow_listed_max as i64,
        }
    }

    /// Check the slot limit of the widget's kind.
    pub fn can_add_widget(&self, widget: &Widget) -> Result<(), CoordinatorError> {
        if self.slot_count(&widget.kind) <= 0 {
            return Err(CoordinatorError::WidgetKindLimitReached(widget.kind.clone()));
        }
        Ok(())
    }

    /// Limit how many widgets of a kind may be open, closing the surplus.
    ///
    /// A negative `max` lifts the limit. Surplus widgets in `default_room_id`
    /// are kept.
    pub fn set_widget_kind_limit(
        &mut self,
        kind: WidgetKind,
        max: i64,
        default_room_id: Option<String>,
    ) -> Result<(), CoordinatorError> {
        if !self.is_base_main() {
            return Ok(());
        }
        let max = if max < 0 || self.allow_listed {
            self.config.limits.allow_listed_max as i64
        } else {
            max
        };
        if self.kind_limits.get(&kind).map(|l| l.max) == Some(max) {
            return Ok(());
        }
        debug!("Limiting widgets of kind {} to {}", kind, max);
        self.kind_limits.insert(
            kind.clone(),
            KindLimit {
                max,
                default_room_id,
            },
        );

        if max == 0 {
            return self.send_to_close_widgets(CloseSelector::kind(kind), Vec::new());
        }

        let slots = self.slot_count(&kind);
        if slots < 0 {
            let overload = slots.unsigned_abs() as usize;
            let default_room = self
                .kind_limits
                .get(&kind)
                .and_then(|l| l.default_room_id.clone());
            let surplus: Vec<Widget> = self
                .main_widgets_of_kind(&kind)
                .into_iter()
                .filter(|w| Some(&w.room_id) != default_room.as_ref())
                .take(overload)
                .collect();
            debug!("Closing {} surplus widgets of kind {}", surplus.len(), kind);
            self.send_to_close_widgets(CloseSelector::widgets(surplus), Vec::new())?;
        }
        Ok(())
    }

    fn is_room_allowed(&self, room_id: &str) -> bool {
        match &self.room_limit {
            None => true,
            Some(ids) => {
                ids.iter().any(|id| id == room_id)
                    || self.exempt_rooms.iter().any(|re| re.is_match(room_id))
            }
        }
    }

    /// Only allow widgets of these rooms, closing the others.
    pub fn set_room_id_limit(
        &mut self,
        valid_room_ids: Vec<String>,
    ) -> Result<(), CoordinatorError> {
        if !self.is_base_main() {
            return Ok(());
        }
        let mut ids = valid_room_ids;
        if !ids.iter().any(|id| id == ALL_ROOMS) {
            ids.push(ALL_ROOMS.to_string());
        }
        debug!("Limiting rooms to {:?}", ids);
        self.room_limit = Some(ids);

        let mut invalid: Vec<String> = Vec::new();
        for widget in self.state.main_widgets() {
            if !self.is_room_allowed(&widget.room_id) && !invalid.contains(&widget.room_id) {
                invalid.push(widget.room_id.clone());
            }
        }
        for room_id in invalid {
            self.send_to_close_widgets(
                CloseSelector::Matching {
                    kind: None,
                    room_id: Some(room_id),
                },
                Vec::new(),
            )?;
        }
        Ok(())
    }

    // ---- custom commands ----

    /// Call `listener` for every custom command of `command_type`.
    pub fn register_custom_command_listener<F>(
        &mut self,
        command_type: &str,
        listener: F,
    ) -> ListenerHandle
    where
        F: Fn(&str, &Value, &ClientIdentity) + Send + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners
            .entry(command_type.to_string())
            .or_default()
            .push((id, Box::new(listener)));
        ListenerHandle {
            command_type: command_type.to_string(),
            id,
        }
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_custom_command_listener(&mut self, handle: &ListenerHandle) -> bool {
        let Some(listeners) = self.listeners.get_mut(&handle.command_type) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle.id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.listeners.remove(&handle.command_type);
        }
        removed
    }

    /// Send an application-defined command.
    pub fn send_custom_command(
        &self,
        command_type: &str,
        data: Value,
        receivers: Vec<MessageFilter>,
    ) -> Result<(), CoordinatorError> {
        self.bus.publish(
            Message::CustomCommand(CustomCommand {
                command_type: command_type.to_string(),
                data,
            }),
            receivers,
        )?;
        Ok(())
    }

    /// Share the URL of an issue report.
    pub fn send_report_issue_url(
        &self,
        url: &str,
        receivers: Vec<MessageFilter>,
    ) -> Result<(), CoordinatorError> {
        self.send_custom_command(REPORT_ISSUE_URL_COMMAND, json!({ "url": url }), receivers)
    }

    /// Call `callback` with every shared issue report URL.
    pub fn register_report_issue_url_listener<F>(&mut self, callback: F) -> ListenerHandle
    where
        F: Fn(&str) + Send + 'static,
    {
        self.register_custom_command_listener(REPORT_ISSUE_URL_COMMAND, move |_, data, _| {
            if let Some(url) = data.get("url").and_then(Value::as_str) {
                callback(url);
            }
        })
    }

    fn recv_custom_command(&self, sender: &ClientIdentity, command: &CustomCommand) {
        if let Some(listeners) = self.listeners.get(&command.command_type) {
            for (_, listener) in listeners {
                listener(&command.command_type, &command.data, sender);
            }
        }
    }

    // ---- window-level operations ----

    /// Close a widget hosted by this window. A popout closes itself too.
    pub fn close_my_widget(&mut self, widget: Widget) {
        if self.is_popout() {
            self.clear_heartbeat();
        }
        self.close_widgets_in_layout(&[widget]);
        if self.is_popout() {
            let delay = self.config.heartbeat.self_close();
            self.close_current_page(delay, None);
        }
    }

    /// Move a widget of this main window into a new popout.
    pub fn pop_out(&mut self, widget: Widget) -> Result<(), CoordinatorError> {
        if self.is_popout() {
            debug!("Popouts can't pop out widgets");
            return Ok(());
        }
        self.close_widgets_in_layout(&[widget.clone()]);
        self.send_to_open_widget(widget, OpenOptions::popout())
    }

    /// Move a widget of this main window to the main window `main_id`.
    pub fn pop_to_main(&mut self, widget: Widget, main_id: &str) -> Result<(), CoordinatorError> {
        if self.is_popout() {
            debug!("Popouts can't move widgets to a main window");
            return Ok(());
        }
        self.send_to_open_widget(widget.clone(), OpenOptions::in_main(main_id))?;
        self.close_widgets_in_layout(&[widget]);
        Ok(())
    }

    /// Store a layout under a fresh main id and open a window for it.
    ///
    /// `layout_json` is an object whose `layout` field holds the tree.
    /// Returns the new main id.
    pub fn popout_new_layout(&mut self, layout_json: &str) -> Result<String, CoordinatorError> {
        let object: Value = serde_json::from_str(layout_json)
            .map_err(|e| CoordinatorError::InvalidLayout(e.to_string()))?;
        let layout = object
            .get("layout")
            .cloned()
            .ok_or_else(|| CoordinatorError::InvalidLayout("missing layout field".to_string()))?;
        serde_json::from_value::<LayoutTree>(layout.clone())
            .map_err(|e| CoordinatorError::InvalidLayout(e.to_string()))?;

        let main_id = random_hex(4);
        let version = self.config.storage.layouts_version.clone();
        let mut layouts = self.storage.layouts(&version);
        layouts.insert(main_id.clone(), layout);
        self.storage.set_layouts(&layouts, &version)?;

        info!("Opening new layout as {}", main_id);
        self.open_sub_main(&main_id)?;
        Ok(main_id)
    }

    /// Main ids of persisted sub-main layouts. Empty outside base-main.
    pub fn sub_main_ids(&self) -> Vec<String> {
        if !self.is_base_main() {
            return Vec::new();
        }
        self.storage
            .layouts(&self.config.storage.layouts_version)
            .into_keys()
            .filter(|id| id != BASE_MAIN_ID)
            .collect()
    }

    /// Open the window of a persisted sub-main layout.
    pub fn open_sub_main(&mut self, main_id: &str) -> Result<(), CoordinatorError> {
        self.send_to_open_widget(
            Widget::new(WidgetKind::empty(), main_id),
            OpenOptions::in_main(main_id),
        )
    }

    /// Drop expired popouts and back up every layout.
    pub fn save_all_windows(&mut self) -> Result<(), CoordinatorError> {
        self.remove_expired_popouts();
        let backup = LayoutsBackup {
            updated_at: self.clock.now_ms(),
            uploaded_at: 0,
            version: LAYOUTS_BACKUP_VERSION,
            layouts: self.storage.layouts(&self.config.storage.layouts_version),
        };
        self.storage.set(LAYOUTS_BACKUP_KEY, &backup, None, None)?;
        Ok(())
    }

    /// Back up every layout, then close all popouts.
    pub fn save_and_close_all_windows(&mut self) -> Result<(), CoordinatorError> {
        self.save_all_windows()?;
        self.send_to_close_windows(None)
    }

    /// Apply a layout action from the user.
    pub fn do_layout_action(&mut self, action: Action) -> &LayoutTree {
        self.delegate.do_action(action)
    }

    pub fn layout_snapshot(&self) -> LayoutTree {
        self.delegate.snapshot()
    }

    pub fn watch_layout(&self) -> watch::Receiver<LayoutTree> {
        self.delegate.subscribe()
    }

    /// Room selected in the active tabset.
    pub fn selected_room(&self) -> Option<String> {
        self.delegate.selected_room()
    }

    /// Widgets in this window's layout.
    pub fn widgets_in_layout(&self) -> Vec<Widget> {
        self.delegate.widgets()
    }

    pub fn layout_widgets_count(&self) -> usize {
        self.delegate.widgets().len()
    }

    /// Whether the widget is open in main. Screencasts also count when a
    /// popout shows them.
    pub fn is_widget_opened(&self, widget: &Widget) -> bool {
        if !widget.kind.is_screencast() {
            return self.state.main_widgets().contains(widget);
        }
        let base_main = if self.is_base_main() {
            self.state.main_widgets()
        } else {
            self.state.widgets_of_base_main.as_slice()
        };
        base_main.contains(widget) || self.state.in_popouts(widget)
    }

    /// Leave the session: stamp a last heartbeat and release.
    pub fn leave(&mut self) {
        let id = self.client().id.clone();
        if let Err(e) = self.liveness.register(&id) {
            warn!("Failed to stamp {} on leave: {}", id, e);
        }
        self.release();
    }

    /// Stop handling messages, close watchers and stop the heartbeat.
    /// Safe to call more than once.
    pub fn release(&mut self) {
        if !self.initialized {
            return;
        }
        debug!("Releasing window {}", self.main_id);
        self.initialized = false;
        self.state_tx = None;
        self.shared_props_tx = None;
        self.clear_heartbeat();
        if let Some(mut subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
    }

    fn filter_me(&self) -> Vec<MessageFilter> {
        vec![MessageFilter::with_id(&self.client().id)]
    }

    fn post(&self, message: Message, filters: Vec<MessageFilter>) {
        if let Err(e) = self.bus.publish(message, filters) {
            warn!("Failed to publish from {}: {}", self.main_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::host::RecordingHost;
    use crate::store::MemoryStore;
    use paneweave_ipc::ReportIssueStatus;
    use std::sync::Mutex;

    struct Session {
        hub: ChannelHub,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
    }

    impl Session {
        fn new() -> Self {
            Self {
                hub: ChannelHub::new(),
                store: Arc::new(MemoryStore::new()),
                clock: Arc::new(ManualClock::new(1_000_000)),
            }
        }

        fn window(&self, launch: LaunchParams) -> (Coordinator, Arc<RecordingHost>) {
            let host = Arc::new(RecordingHost::new());
            let deps = WindowDeps {
                hub: self.hub.clone(),
                store: self.store.clone(),
                clock: self.clock.clone(),
                host: host.clone(),
                config: Arc::new(Config::default()),
            };
            (Coordinator::new(launch, deps).unwrap(), host)
        }

        fn base_main(&self) -> (Coordinator, Arc<RecordingHost>) {
            self.window(LaunchParams::base_main("u1", "NG"))
        }
    }

    fn popout_params(kind: &str, room: &str) -> LaunchParams {
        LaunchParams {
            popout: true,
            page: Some(WidgetKind::new(kind)),
            room_id: Some(room.to_string()),
            ..LaunchParams::base_main("u1", "NG")
        }
    }

    fn chat(room: &str) -> Widget {
        Widget::new("Chat", room)
    }

    #[test]
    fn test_roles_from_launch() {
        let session = Session::new();
        let (main, _) = session.base_main();
        assert_eq!(main.role(), WindowRole::BaseMain);
        assert_eq!(main.client().id, "main");
        assert!((10_000..=15_000).contains(&main.state_snapshot().version));

        let (popout, _) = session.window(popout_params("Chat", "r1"));
        assert_eq!(popout.role(), WindowRole::Popout);
        assert_eq!(popout.main_id(), popout.client().id);
        assert_eq!(popout.client().id.len(), 8);
        assert_eq!(popout.state_snapshot().version, -1);
        assert_eq!(popout.widgets_in_layout(), vec![chat("r1")]);

        let (sub, _) = session.window(LaunchParams {
            main_id: Some("ab12".into()),
            page: Some(WidgetKind::empty()),
            room_id: Some("ab12".into()),
            ..LaunchParams::base_main("u1", "NG")
        });
        assert_eq!(sub.role(), WindowRole::SubMain);
        assert_eq!(sub.client().id, "ab12");
        assert_eq!(sub.client().role, Role::Popout);
    }

    #[test]
    fn test_open_widget_locally_is_idempotent() {
        let session = Session::new();
        let (mut main, _) = session.base_main();
        let v0 = main.state_snapshot().version;

        main.send_to_open_widget(chat("r1"), OpenOptions::default())
            .unwrap();
        main.pump().unwrap();
        assert_eq!(main.state_snapshot().main_widgets(), &[chat("r1")]);
        assert_eq!(main.widgets_in_layout(), vec![chat("r1")]);
        assert!(main.is_widget_opened(&chat("r1")));
        let v1 = main.state_snapshot().version;
        assert!(v1 > v0);

        main.send_to_open_widget(chat("r1"), OpenOptions::default())
            .unwrap();
        main.pump().unwrap();
        assert_eq!(main.state_snapshot().main_widgets(), &[chat("r1")]);
        assert_eq!(main.state_snapshot().version, v1);
    }

    #[test]
    fn test_kind_limit_rejects_and_reports() {
        let session = Session::new();
        let (mut main, host) = session.base_main();
        main.set_widget_kind_limit(WidgetKind::new("Chat"), 1, None)
            .unwrap();
        main.send_to_open_widget(chat("r1"), OpenOptions::default())
            .unwrap();
        main.pump().unwrap();
        assert!(matches!(
            main.can_add_widget(&chat("r2")),
            Err(CoordinatorError::WidgetKindLimitReached(_))
        ));

        main.send_to_open_widget(chat("r2"), OpenOptions::default())
            .unwrap();
        main.pump().unwrap();
        assert_eq!(main.state_snapshot().main_widgets(), &[chat("r1")]);
        assert_eq!(host.notices().len(), 1);
        assert_eq!(host.notices()[0].level, crate::host::NoticeLevel::Error);
    }

    #[test]
    fn test_shared_props_update() {
        let session = Session::new();
        let (mut main, _) = session.base_main();
        let watcher = main.watch_shared_props();
        let v0 = main.shared_props_snapshot().version;

        assert!(matches!(
            main.send_to_update_shared_props("version", json!(1)),
            Err(CoordinatorError::ReadOnlyField(_))
        ));

        main.send_to_update_shared_props("reportIssueStatus", json!("uploading"))
            .unwrap();
        main.pump().unwrap();
        let props = main.shared_props_snapshot();
        assert_eq!(props.report_issue_status, ReportIssueStatus::Uploading);
        assert_eq!(props.version, v0 + 1);
        assert_eq!(watcher.borrow().version, v0 + 1);

        // Invalid values are rejected without a version bump
        main.send_to_update_shared_props("reportIssueStatus", json!("exploded"))
            .unwrap();
        main.pump().unwrap();
        assert_eq!(main.shared_props_snapshot().version, v0 + 1);
    }

    #[test]
    fn test_custom_command_listeners() {
        let session = Session::new();
        let (mut main, _) = session.base_main();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let handle = main.register_report_issue_url_listener(move |url| {
            sink.lock().unwrap().push(url.to_string());
        });
        main.send_report_issue_url("https://issues/1", vec![]).unwrap();
        main.pump().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["https://issues/1".to_string()]);

        assert!(main.remove_custom_command_listener(&handle));
        assert!(!main.remove_custom_command_listener(&handle));
        main.send_report_issue_url("https://issues/2", vec![]).unwrap();
        main.pump().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_release_is_idempotent_and_stops_handling() {
        let session = Session::new();
        let (mut main, _) = session.base_main();
        let watcher = main.watch_state();
        main.release();
        main.release();
        assert!(main.is_released());
        assert!(watcher.has_changed().is_err());
        assert_eq!(main.pump().unwrap(), 0);
    }

    #[test]
    fn test_layout_limit() {
        let session = Session::new();
        let (mut main, host) = session.base_main();
        main.on_settings_loaded(vec![]);
        let max = main.config().limits.max_layouts;

        // Persisted popouts count; screencasts don't
        let mut popouts: Vec<WindowLayout> = (0..max - 2)
            .map(|i| {
                WindowLayout::new(
                    ClientIdentity::new(format!("p{}", i), Role::Popout, 0),
                    vec![chat(&format!("r{}", i))],
                )
            })
            .collect();
        popouts.push(WindowLayout::new(
            ClientIdentity::new("cast", Role::Popout, 0),
            vec![Widget::new(WidgetKind::screencast(), "r")],
        ));
        main.storage
            .set(POPOUTS_KEY, &popouts, None, Some("1"))
            .unwrap();

        assert!(main
            .send_to_open_widget(chat("x"), OpenOptions::popout())
            .is_ok());

        popouts.push(WindowLayout::new(
            ClientIdentity::new("one-more", Role::Popout, 0),
            vec![chat("y")],
        ));
        main.storage
            .set(POPOUTS_KEY, &popouts, None, Some("1"))
            .unwrap();
        assert!(matches!(
            main.send_to_open_widget(chat("z"), OpenOptions::popout()),
            Err(CoordinatorError::LayoutLimitReached { .. })
        ));
        assert!(host
            .notices()
            .iter()
            .any(|n| n.level == crate::host::NoticeLevel::Warning));
    }

    #[test]
    fn test_popout_new_layout_rejects_garbage() {
        let session = Session::new();
        let (mut main, _) = session.base_main();
        assert!(matches!(
            main.popout_new_layout("not json"),
            Err(CoordinatorError::InvalidLayout(_))
        ));
        assert!(matches!(
            main.popout_new_layout(r#"{"charts": []}"#),
            Err(CoordinatorError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_save_all_windows_backs_up_layouts() {
        let session = Session::new();
        let (mut main, _) = session.base_main();
        main.send_to_open_widget(chat("r1"), OpenOptions::default())
            .unwrap();
        main.pump().unwrap();
        main.save_all_windows().unwrap();

        let backup: LayoutsBackup = main
            .storage
            .get(LAYOUTS_BACKUP_KEY, None)
            .unwrap()
            .unwrap();
        assert_eq!(backup.version, 2);
        assert_eq!(backup.uploaded_at, 0);
        assert!(backup.layouts.contains_key("main"));
    }
}
