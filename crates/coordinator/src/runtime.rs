//! Event loop driving one window's coordinator.
//!
//! Every input of a window (commands from its owner, bus traffic, heartbeat
//! ticks, timers) is funneled into one channel and applied to the
//! coordinator in order.

use crate::bus::BusError;
use crate::coordinator::{Coordinator, CoordinatorError, WindowDeps};
use crate::launch::LaunchParams;
use crate::settings::{allow_list, SettingsSource};
use paneweave_core_layout::{Action, LayoutTree, Widget, WidgetKind};
use paneweave_ipc::{
    CloseSelector, Envelope, MessageFilter, OpenOptions, PlacementState, SharedPropsState,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pending events a window may queue before senders wait.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Commands the owner of a window can send it.
#[derive(Debug, Clone)]
pub enum WindowCommand {
    OpenWidget {
        widget: Widget,
        options: OpenOptions,
    },
    CloseWidgets {
        selector: CloseSelector,
        receivers: Vec<MessageFilter>,
    },
    CloseWindows {
        main_id: Option<String>,
    },
    SetWidgetKindLimit {
        kind: WidgetKind,
        max: i64,
        default_room_id: Option<String>,
    },
    SetRoomIdLimit {
        room_ids: Vec<String>,
    },
    UpdateSharedProps {
        key: String,
        value: Value,
    },
    SendCustomCommand {
        command_type: String,
        data: Value,
        receivers: Vec<MessageFilter>,
    },
    LayoutAction(Action),
    CloseMyWidget(Widget),
    PopOut(Widget),
    PopToMain {
        widget: Widget,
        main_id: String,
    },
    PopoutNewLayout(String),
    /// Reopen every persisted sub-main layout, one at a time.
    OpenSubMains,
    SaveAllWindows,
    SaveAndCloseAllWindows,
    State,
    SharedProps,
    Layout,
    Leave,
}

impl WindowCommand {
    fn is_query(&self) -> bool {
        matches!(
            self,
            WindowCommand::State | WindowCommand::SharedProps | WindowCommand::Layout
        )
    }
}

/// Reply to a [`WindowCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum WindowResponse {
    Ok,
    State(PlacementState),
    SharedProps(SharedPropsState),
    Layout(LayoutTree),
    MainId(String),
    SubMains(Vec<String>),
}

/// Events processed by a window's loop.
enum WindowEvent {
    /// A command from the window's owner.
    Command {
        cmd: WindowCommand,
        responder: oneshot::Sender<Result<WindowResponse, CoordinatorError>>,
    },
    /// Traffic from the session bus.
    Bus(Result<Envelope, BusError>),
    /// Heartbeat interval elapsed.
    HeartbeatTick,
    /// Startup settings arrived.
    SettingsLoaded(Vec<String>),
    /// A scheduled close is due.
    CloseDue,
    /// Staggered launch of a sub-main window.
    OpenSubMain(String),
    /// Leave the session and stop.
    Shutdown,
}

/// Handle for sending commands to a running window.
#[derive(Debug, Clone)]
pub struct WindowHandle {
    main_id: String,
    tx: mpsc::Sender<WindowEvent>,
}

impl std::fmt::Debug for WindowEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowEvent::Command { cmd, .. } => write!(f, "Command({:?})", cmd),
            WindowEvent::Bus(Ok(envelope)) => write!(f, "Bus({})", envelope.kind()),
            WindowEvent::Bus(Err(e)) => write!(f, "Bus(error: {})", e),
            WindowEvent::HeartbeatTick => write!(f, "HeartbeatTick"),
            WindowEvent::SettingsLoaded(list) => write!(f, "SettingsLoaded({})", list.len()),
            WindowEvent::CloseDue => write!(f, "CloseDue"),
            WindowEvent::OpenSubMain(id) => write!(f, "OpenSubMain({})", id),
            WindowEvent::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl WindowHandle {
    /// Main id of the window.
    pub fn main_id(&self) -> &str {
        &self.main_id
    }

    /// Whether the window's loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send a command and wait for the reply.
    pub async fn request(&self, cmd: WindowCommand) -> Result<WindowResponse, CoordinatorError> {
        let (responder, reply) = oneshot::channel();
        self.tx
            .send(WindowEvent::Command { cmd, responder })
            .await
            .map_err(|_| CoordinatorError::Released)?;
        reply.await.map_err(|_| CoordinatorError::Released)?
    }

    pub async fn open_widget(
        &self,
        widget: Widget,
        options: OpenOptions,
    ) -> Result<(), CoordinatorError> {
        self.request(WindowCommand::OpenWidget { widget, options })
            .await
            .map(|_| ())
    }

    pub async fn close_widgets(
        &self,
        selector: CloseSelector,
        receivers: Vec<MessageFilter>,
    ) -> Result<(), CoordinatorError> {
        self.request(WindowCommand::CloseWidgets {
            selector,
            receivers,
        })
        .await
        .map(|_| ())
    }

    pub async fn update_shared_props(
        &self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), CoordinatorError> {
        self.request(WindowCommand::UpdateSharedProps {
            key: key.into(),
            value,
        })
        .await
        .map(|_| ())
    }

    /// Current placement state of the window.
    pub async fn state(&self) -> Result<PlacementState, CoordinatorError> {
        match self.request(WindowCommand::State).await? {
            WindowResponse::State(state) => Ok(state),
            other => unexpected(other),
        }
    }

    pub async fn shared_props(&self) -> Result<SharedPropsState, CoordinatorError> {
        match self.request(WindowCommand::SharedProps).await? {
            WindowResponse::SharedProps(props) => Ok(props),
            other => unexpected(other),
        }
    }

    pub async fn layout(&self) -> Result<LayoutTree, CoordinatorError> {
        match self.request(WindowCommand::Layout).await? {
            WindowResponse::Layout(tree) => Ok(tree),
            other => unexpected(other),
        }
    }

    /// Leave the session and stop the window's loop.
    pub async fn leave(&self) -> Result<(), CoordinatorError> {
        self.request(WindowCommand::Leave).await.map(|_| ())
    }

    /// Ask the loop to stop without waiting for a reply.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WindowEvent::Shutdown).await;
    }
}

fn unexpected<T>(response: WindowResponse) -> Result<T, CoordinatorError> {
    error!("Unexpected window response: {:?}", response);
    Err(CoordinatorError::Released)
}

/// Start a window and spawn its loop.
pub fn spawn_window(
    launch: LaunchParams,
    deps: WindowDeps,
    settings: Arc<dyn SettingsSource>,
) -> Result<(WindowHandle, JoinHandle<()>), CoordinatorError> {
    let coordinator = Coordinator::new(launch, deps)?;
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let handle = WindowHandle {
        main_id: coordinator.main_id().to_string(),
        tx: event_tx.clone(),
    };
    let task = tokio::spawn(run_window(coordinator, settings, event_tx, event_rx));
    Ok((handle, task))
}

/// Drive a coordinator until its window closes or leaves.
async fn run_window(
    mut coordinator: Coordinator,
    settings: Arc<dyn SettingsSource>,
    event_tx: mpsc::Sender<WindowEvent>,
    mut event_rx: mpsc::Receiver<WindowEvent>,
) {
    let main_id = coordinator.main_id().to_string();
    info!("Window {} ({}) running", main_id, coordinator.role());

    // Bus forwarding
    let bus_task = coordinator.take_subscription().map(|mut subscription| {
        let bus_tx = event_tx.clone();
        tokio::spawn(async move {
            loop {
                let event = match subscription.recv().await {
                    Ok(Some(envelope)) => WindowEvent::Bus(Ok(envelope)),
                    Ok(None) => break,
                    Err(e) => WindowEvent::Bus(Err(e)),
                };
                if bus_tx.send(event).await.is_err() {
                    break;
                }
            }
        })
    });

    // Heartbeat
    let period = coordinator.config().heartbeat.interval();
    let heartbeat_tx = event_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            if heartbeat_tx.send(WindowEvent::HeartbeatTick).await.is_err() {
                break;
            }
        }
    });

    // Settings
    match coordinator.settings_request() {
        Some(request) => {
            let settings_tx = event_tx.clone();
            tokio::spawn(async move {
                let list = match settings.fetch(request).await {
                    Ok(values) => allow_list(&values),
                    Err(e) => {
                        warn!("Failed to fetch settings: {}", e);
                        Vec::new()
                    }
                };
                let _ = settings_tx.send(WindowEvent::SettingsLoaded(list)).await;
            });
        }
        None => {
            debug!("No signed-in session, starting without settings");
            coordinator.on_settings_loaded(Vec::new());
        }
    }

    let mut close_timer: Option<JoinHandle<()>> = None;
    let mut sub_main_timers: Vec<JoinHandle<()>> = Vec::new();

    loop {
        if let Some(delay) = coordinator.take_close_request() {
            if let Some(handle) = close_timer.take() {
                handle.abort();
            }
            let close_tx = event_tx.clone();
            close_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = close_tx.send(WindowEvent::CloseDue).await;
            }));
        }
        if coordinator.is_released() && close_timer.is_none() {
            break;
        }

        let event = match event_rx.recv().await {
            Some(e) => e,
            None => break,
        };

        match event {
            WindowEvent::Command { cmd, responder } => {
                let leaving = matches!(cmd, WindowCommand::Leave);
                let response = if coordinator.is_released() && !cmd.is_query() {
                    Err(CoordinatorError::Released)
                } else if matches!(cmd, WindowCommand::OpenSubMains) {
                    let ids = coordinator.sub_main_ids();
                    let stagger =
                        Duration::from_millis(coordinator.config().heartbeat.sub_main_stagger_ms);
                    for (i, id) in ids.iter().enumerate() {
                        let open_tx = event_tx.clone();
                        let id = id.clone();
                        let delay = stagger * (i as u32 + 1);
                        sub_main_timers.push(tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = open_tx.send(WindowEvent::OpenSubMain(id)).await;
                        }));
                    }
                    Ok(WindowResponse::SubMains(ids))
                } else {
                    apply_command(&mut coordinator, cmd)
                };
                if responder.send(response).is_err() {
                    debug!("Owner of {} went away before the reply", main_id);
                }
                if leaving {
                    break;
                }
            }
            WindowEvent::Bus(Ok(envelope)) => coordinator.handle(envelope),
            WindowEvent::Bus(Err(BusError::UnknownKind(kind))) => {
                error!("Unknown message kind on the bus: {}", kind);
            }
            WindowEvent::Bus(Err(e)) => warn!("Bus error in {}: {}", main_id, e),
            WindowEvent::HeartbeatTick => coordinator.tick(),
            WindowEvent::SettingsLoaded(list) => coordinator.on_settings_loaded(list),
            WindowEvent::OpenSubMain(id) => {
                if let Err(e) = coordinator.open_sub_main(&id) {
                    warn!("Failed to open sub-main {}: {}", id, e);
                }
            }
            WindowEvent::CloseDue => {
                coordinator.finish_close();
                break;
            }
            WindowEvent::Shutdown => {
                info!("Window {} shutting down", main_id);
                coordinator.leave();
                break;
            }
        }
    }

    heartbeat_task.abort();
    if let Some(task) = bus_task {
        task.abort();
    }
    if let Some(task) = close_timer {
        task.abort();
    }
    for task in sub_main_timers {
        task.abort();
    }
    coordinator.release();
    info!("Window {} stopped", main_id);
}

fn apply_command(
    coordinator: &mut Coordinator,
    cmd: WindowCommand,
) -> Result<WindowResponse, CoordinatorError> {
    match cmd {
        WindowCommand::OpenWidget { widget, options } => {
            coordinator.send_to_open_widget(widget, options)?;
        }
        WindowCommand::CloseWidgets {
            selector,
            receivers,
        } => coordinator.send_to_close_widgets(selector, receivers)?,
        WindowCommand::CloseWindows { main_id } => {
            coordinator.send_to_close_windows(main_id.as_deref())?
        }
        WindowCommand::SetWidgetKindLimit {
            kind,
            max,
            default_room_id,
        } => coordinator.set_widget_kind_limit(kind, max, default_room_id)?,
        WindowCommand::SetRoomIdLimit { room_ids } => coordinator.set_room_id_limit(room_ids)?,
        WindowCommand::UpdateSharedProps { key, value } => {
            coordinator.send_to_update_shared_props(&key, value)?
        }
        WindowCommand::SendCustomCommand {
            command_type,
            data,
            receivers,
        } => coordinator.send_custom_command(&command_type, data, receivers)?,
        WindowCommand::LayoutAction(action) => {
            return Ok(WindowResponse::Layout(
                coordinator.do_layout_action(action).clone(),
            ));
        }
        WindowCommand::CloseMyWidget(widget) => coordinator.close_my_widget(widget),
        WindowCommand::PopOut(widget) => coordinator.pop_out(widget)?,
        WindowCommand::PopToMain { widget, main_id } => {
            coordinator.pop_to_main(widget, &main_id)?
        }
        WindowCommand::PopoutNewLayout(json) => {
            return Ok(WindowResponse::MainId(coordinator.popout_new_layout(&json)?));
        }
        WindowCommand::OpenSubMains => {
            return Ok(WindowResponse::SubMains(coordinator.sub_main_ids()));
        }
        WindowCommand::SaveAllWindows => coordinator.save_all_windows()?,
        WindowCommand::SaveAndCloseAllWindows => coordinator.save_and_close_all_windows()?,
        WindowCommand::State => return Ok(WindowResponse::State(coordinator.state_snapshot())),
        WindowCommand::SharedProps => {
            return Ok(WindowResponse::SharedProps(
                coordinator.shared_props_snapshot(),
            ))
        }
        WindowCommand::Layout => return Ok(WindowResponse::Layout(coordinator.layout_snapshot())),
        WindowCommand::Leave => coordinator.leave(),
    }
    Ok(WindowResponse::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::ChannelHub;
    use crate::clock::SystemClock;
    use crate::config::Config;
    use crate::host::RecordingHost;
    use crate::settings::StaticSettings;
    use crate::store::{
        MemoryStore, Profile, Storage, StorageScope, POPOUTS_KEY, PROFILE_KEY, SESSION_KEY,
    };

    struct Session {
        hub: ChannelHub,
        store: Arc<MemoryStore>,
    }

    impl Session {
        fn new() -> Self {
            Self {
                hub: ChannelHub::new(),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn deps(&self, host: Arc<RecordingHost>) -> WindowDeps {
            let mut config = Config::default();
            config.heartbeat.interval_ms = 50;
            config.heartbeat.self_close_ms = 10;
            config.heartbeat.close_grace_ms = 10;
            WindowDeps {
                hub: self.hub.clone(),
                store: self.store.clone(),
                clock: Arc::new(SystemClock),
                host,
                config: Arc::new(config),
            }
        }

        fn storage(&self) -> Storage {
            Storage::new(
                self.store.clone(),
                StorageScope::new("NG", "u1"),
                Arc::new(SystemClock),
            )
        }
    }

    fn popout_launch() -> LaunchParams {
        LaunchParams {
            popout: true,
            page: Some(WidgetKind::new("Chat")),
            room_id: Some("r1".into()),
            ..LaunchParams::base_main("u1", "NG")
        }
    }

    #[tokio::test]
    async fn test_commands_round_trip() {
        let session = Session::new();
        let host = Arc::new(RecordingHost::new());
        let (handle, task) = spawn_window(
            LaunchParams::base_main("u1", "NG"),
            session.deps(host),
            Arc::new(StaticSettings::default()),
        )
        .unwrap();
        assert_eq!(handle.main_id(), "main");

        handle
            .open_widget(Widget::new("Chat", "r1"), OpenOptions::default())
            .await
            .unwrap();
        // The open request travels through the bus before it lands
        let mut state = handle.state().await.unwrap();
        for _ in 0..50 {
            if !state.main_widgets().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            state = handle.state().await.unwrap();
        }
        assert_eq!(state.main_widgets(), &[Widget::new("Chat", "r1")]);

        let tree = handle.layout().await.unwrap();
        assert_eq!(tree.widgets(), vec![Widget::new("Chat", "r1")]);

        handle.leave().await.unwrap();
        task.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(
            handle.state().await,
            Err(CoordinatorError::Released)
        ));
    }

    #[tokio::test]
    async fn test_settings_fetched_for_signed_in_session() {
        let session = Session::new();
        let storage = session.storage();
        storage.set(SESSION_KEY, "token", None, None).unwrap();
        storage
            .set(
                PROFILE_KEY,
                &Profile {
                    default_room_id: "r1".into(),
                },
                None,
                None,
            )
            .unwrap();

        let (handle, task) = spawn_window(
            LaunchParams::base_main("u1", "NG"),
            session.deps(Arc::new(RecordingHost::new())),
            Arc::new(StaticSettings::with_allow_list(&["u1"])),
        )
        .unwrap();

        // Base-main resets the persisted popouts once settings are in
        let mut reset = false;
        for _ in 0..50 {
            if storage.get_value(POPOUTS_KEY, Some("1")).unwrap().is_some() {
                reset = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reset);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_popout_without_main_closes_itself() {
        let session = Session::new();
        let host = Arc::new(RecordingHost::new());
        let (handle, task) = spawn_window(
            popout_launch(),
            session.deps(host.clone()),
            Arc::new(StaticSettings::default()),
        )
        .unwrap();

        task.await.unwrap();
        assert!(host.is_closed());
        assert!(handle.is_closed());
        assert!(host
            .notices()
            .iter()
            .any(|n| n.message == "main window is closed"));
    }

    #[tokio::test]
    async fn test_popout_closes_after_its_last_widget() {
        let session = Session::new();
        let (main, main_task) = spawn_window(
            LaunchParams::base_main("u1", "NG"),
            session.deps(Arc::new(RecordingHost::new())),
            Arc::new(StaticSettings::default()),
        )
        .unwrap();
        // Startup closes leftover popouts, so wait for it before opening one
        main.state().await.unwrap();

        let host = Arc::new(RecordingHost::new());
        let (handle, task) = spawn_window(
            popout_launch(),
            session.deps(host.clone()),
            Arc::new(StaticSettings::default()),
        )
        .unwrap();

        handle
            .request(WindowCommand::CloseMyWidget(Widget::new("Chat", "r1")))
            .await
            .unwrap();
        task.await.unwrap();
        assert!(host.is_closed());
        assert!(host.notices().is_empty());

        main.shutdown().await;
        main_task.await.unwrap();
    }
}
