//! Integration tests for coordinated windows of one session.
//!
//! Windows run synchronously here: each test owns every coordinator of the
//! session, delivers bus traffic with `pump()` and moves time with a manual
//! clock. They cover:
//! - Popout admission and state replication
//! - Heartbeat expiry on both sides
//! - Widget limits
//! - Sub-main layouts

use paneweave_coordinator::store::{LAYOUTS_KEY, POPOUTS_KEY};
use paneweave_coordinator::{
    Bus, ChannelHub, Config, Coordinator, LaunchParams, ManualClock, MemoryStore, NoticeLevel,
    RecordingHost, Storage, StorageScope, WindowDeps, WindowRole,
};
use paneweave_core_layout::LayoutTree;
use paneweave_ipc::{
    ClientIdentity, CloseSelector, Message, OpenOptions, ReportIssueStatus, Widget, WidgetKind,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Session {
    hub: ChannelHub,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    config: Arc<Config>,
}

struct Window {
    coordinator: Coordinator,
    host: Arc<RecordingHost>,
}

impl Session {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        Self {
            hub: ChannelHub::new(),
            store: Arc::new(MemoryStore::new()),
            clock: Arc::new(ManualClock::new(1_700_000_000_000)),
            config: Arc::new(config),
        }
    }

    fn open(&self, launch: LaunchParams) -> Window {
        let host = Arc::new(RecordingHost::new());
        let deps = WindowDeps {
            hub: self.hub.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            host: host.clone(),
            config: self.config.clone(),
        };
        let coordinator = Coordinator::new(launch, deps).expect("window starts");
        Window { coordinator, host }
    }

    fn base_main(&self) -> Window {
        let mut main = self.open(LaunchParams::base_main("u1", "NG"));
        main.coordinator.on_settings_loaded(Vec::new());
        main
    }

    /// Start the window whose URL `opener` asked its host for last.
    fn open_requested(&self, opener: &Window) -> Window {
        let url = opener.host.opened().last().cloned().expect("a window was requested");
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        let launch = LaunchParams::from_query(query).expect("launch URL parses");
        self.open(launch)
    }

    fn storage(&self) -> Storage {
        Storage::new(
            self.store.clone(),
            StorageScope::new("NG", "u1"),
            self.clock.clone(),
        )
    }

    fn pump(&self, windows: &mut [&mut Window]) {
        // Replies can trigger further replies, so go round until quiet
        for _ in 0..8 {
            let mut handled = 0;
            for window in windows.iter_mut() {
                handled += window.coordinator.pump().expect("pump");
            }
            if handled == 0 {
                return;
            }
        }
    }
}

fn chat(room: &str) -> Widget {
    Widget::new("Chat", room)
}

/// Base-main plus one admitted popout showing a chart of `r1`.
fn session_with_popout(session: &Session) -> (Window, Window) {
    let mut main = session.base_main();
    main.coordinator
        .send_to_open_widget(Widget::new("Chart", "r1"), OpenOptions::popout())
        .unwrap();
    session.pump(&mut [&mut main]);

    let mut popout = session.open_requested(&main);
    popout.coordinator.on_settings_loaded(Vec::new());
    session.pump(&mut [&mut main, &mut popout]);
    (main, popout)
}

// ============================================================================
// Admission and Replication
// ============================================================================

#[test]
fn test_popout_is_admitted_and_replicates_state() {
    let session = Session::new();
    let (main, popout) = session_with_popout(&session);

    assert_eq!(popout.coordinator.role(), WindowRole::Popout);
    let state = main.coordinator.state_snapshot();
    assert_eq!(state.popouts.len(), 1);
    assert_eq!(state.popouts[0].client.id, popout.coordinator.client().id);
    assert_eq!(state.popouts[0].widgets, vec![Widget::new("Chart", "r1")]);
    // The placeholder made way for the real window
    assert!(state.opening_popouts.is_empty());

    assert_eq!(popout.coordinator.state_snapshot(), state);
    assert_eq!(
        popout.coordinator.shared_props_snapshot(),
        main.coordinator.shared_props_snapshot()
    );

    let persisted = session
        .storage()
        .get_value(POPOUTS_KEY, Some("1"))
        .unwrap()
        .unwrap();
    assert_eq!(persisted.as_array().map(|a| a.len()), Some(1));
}

#[test]
fn test_popout_launch_url() {
    let session = Session::new();
    let mut main = session.base_main();
    main.coordinator
        .send_to_open_widget(Widget::new("Chart", "r 1"), OpenOptions::popout())
        .unwrap();
    session.pump(&mut [&mut main]);

    let opened = main.host.opened();
    assert_eq!(opened.len(), 1);
    assert_eq!(
        opened[0],
        "http://localhost:3000/?popout=true&userId=u1&sourceCode=NG&page=Chart&roomId=r%201"
    );
    assert_eq!(main.coordinator.state_snapshot().opening_popouts.len(), 1);
}

#[test]
fn test_open_elsewhere_is_a_new_placement() {
    let session = Session::new();
    let mut main = session.base_main();
    let version = main.coordinator.state_snapshot().version;

    main.coordinator
        .send_to_open_widget(Widget::new("A", "r1"), OpenOptions::default())
        .unwrap();
    session.pump(&mut [&mut main]);
    let state = main.coordinator.state_snapshot();
    assert_eq!(state.main_widgets(), &[Widget::new("A", "r1")]);
    assert_eq!(state.version, version + 1);
    assert!(main.host.opened().is_empty());

    // Same widget, another main id: opened in a new window, not selected
    main.coordinator
        .send_to_open_widget(Widget::new("A", "r1"), OpenOptions::in_main("ab12"))
        .unwrap();
    session.pump(&mut [&mut main]);
    let opened = main.host.opened();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].contains("mainId=ab12"));
    assert!(opened[0].contains("popout=false"));
    assert_eq!(main.coordinator.state_snapshot().opening_popouts.len(), 1);
}

#[test]
fn test_refused_window_is_reported() {
    let session = Session::new();
    let mut main = session.base_main();
    main.host.refuse_open();
    main.coordinator
        .send_to_open_widget(Widget::new("Chart", "r1"), OpenOptions::popout())
        .unwrap();
    session.pump(&mut [&mut main]);

    let notices = main.host.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Error);
}

#[test]
fn test_versions_only_move_forward() {
    let session = Session::new();
    let mut main = session.base_main();
    let mut versions = vec![main.coordinator.state_snapshot().version];

    for room in ["r1", "r2", "r3"] {
        main.coordinator
            .send_to_open_widget(chat(room), OpenOptions::default())
            .unwrap();
        session.pump(&mut [&mut main]);
        versions.push(main.coordinator.state_snapshot().version);
    }
    main.coordinator.close_my_widget(chat("r2"));
    session.pump(&mut [&mut main]);
    versions.push(main.coordinator.state_snapshot().version);

    assert!(versions.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", versions);
}

#[test]
fn test_replica_takes_older_state_wholesale() {
    let session = Session::new();
    let (mut main, mut popout) = session_with_popout(&session);
    let older = main.coordinator.state_snapshot();

    main.coordinator
        .send_to_open_widget(chat("r1"), OpenOptions::default())
        .unwrap();
    session.pump(&mut [&mut main, &mut popout]);
    let newer = popout.coordinator.state_snapshot();
    assert!(newer.version > older.version);
    assert_eq!(newer.main_widgets(), &[chat("r1")]);

    // A base-main broadcast carrying an older version, e.g. after a reload
    let reloaded_main = Bus::new(
        session.hub.open("u1").unwrap(),
        ClientIdentity::base_main(0),
    );
    reloaded_main
        .publish(Message::StateChanged(older.clone()), Vec::new())
        .unwrap();
    session.pump(&mut [&mut popout]);

    assert_eq!(popout.coordinator.state_snapshot(), older);
}

#[test]
fn test_screencast_in_popout_counts_as_opened() {
    let session = Session::new();
    let mut main = session.base_main();
    let screencast = Widget::new(WidgetKind::screencast(), "r1");
    main.coordinator
        .send_to_open_widget(screencast.clone(), OpenOptions::popout())
        .unwrap();
    session.pump(&mut [&mut main]);
    assert!(!main.coordinator.is_widget_opened(&screencast));

    let mut popout = session.open_requested(&main);
    popout.coordinator.on_settings_loaded(Vec::new());
    session.pump(&mut [&mut main, &mut popout]);

    assert!(main.coordinator.is_widget_opened(&screencast));
    assert!(popout.coordinator.is_widget_opened(&screencast));

    // Other kinds only count when main shows them
    let chart = Widget::new("Chart", "r1");
    main.coordinator
        .send_to_open_widget(chart.clone(), OpenOptions::popout())
        .unwrap();
    session.pump(&mut [&mut main]);
    let mut chart_popout = session.open_requested(&main);
    chart_popout.coordinator.on_settings_loaded(Vec::new());
    session.pump(&mut [&mut main, &mut popout, &mut chart_popout]);
    assert!(!main.coordinator.is_widget_opened(&chart));
}

#[test]
fn test_shared_props_reach_popouts() {
    let session = Session::new();
    let (mut main, mut popout) = session_with_popout(&session);

    popout
        .coordinator
        .send_to_update_shared_props("reportIssueStatus", json!("reporting"))
        .unwrap();
    session.pump(&mut [&mut main, &mut popout]);

    let props = main.coordinator.shared_props_snapshot();
    assert_eq!(props.report_issue_status, ReportIssueStatus::Reporting);
    assert_eq!(popout.coordinator.shared_props_snapshot(), props);
}

// ============================================================================
// Heartbeats
// ============================================================================

#[test]
fn test_popout_closes_when_main_goes_silent() {
    let session = Session::new();
    let (_main, mut popout) = session_with_popout(&session);

    session
        .clock
        .advance(session.config.rotten_after() + Duration::from_millis(1));
    popout.coordinator.tick();

    assert!(popout.coordinator.is_released());
    assert_eq!(
        popout.coordinator.take_close_request(),
        Some(session.config.heartbeat.close_grace())
    );
    let notices = popout.host.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].level, NoticeLevel::Warning);
    assert_eq!(notices[0].message, "main window is closed");

    popout.coordinator.finish_close();
    assert!(popout.host.is_closed());
    assert!(popout.coordinator.widgets_in_layout().is_empty());
}

#[test]
fn test_main_alive_retries_before_closing() {
    let mut config = Config::default();
    config.heartbeat.main_alive_retries = 1;
    let session = Session::with_config(config);
    let (_main, mut popout) = session_with_popout(&session);

    session
        .clock
        .advance(session.config.rotten_after() + Duration::from_millis(1));
    popout.coordinator.tick();
    assert!(!popout.coordinator.is_released());

    popout.coordinator.tick();
    assert!(popout.coordinator.is_released());
}

#[test]
fn test_allow_listed_popout_outlives_main() {
    let session = Session::new();
    let (_main, mut popout) = session_with_popout(&session);
    popout.coordinator.on_settings_loaded(vec!["u1".to_string()]);
    assert!(popout.coordinator.is_allow_listed());

    session.clock.advance(Duration::from_secs(60));
    popout.coordinator.tick();
    assert!(!popout.coordinator.is_released());
}

#[test]
fn test_main_drops_silent_popouts() {
    let session = Session::new();
    let (mut main, popout) = session_with_popout(&session);
    let version = main.coordinator.state_snapshot().version;
    let popout_id = popout.coordinator.client().id.clone();

    session
        .clock
        .advance(session.config.rotten_after() + Duration::from_millis(1));
    main.coordinator.tick();

    let state = main.coordinator.state_snapshot();
    assert!(state.popouts.is_empty());
    assert!(state.version > version);

    let record = session
        .storage()
        .get_value("rottenWindows", None)
        .unwrap()
        .unwrap();
    assert!(record["windows"].get(&popout_id).is_none());
}

#[test]
fn test_close_windows_reaches_popouts() {
    let session = Session::new();
    let (main, mut popout) = session_with_popout(&session);

    main.coordinator.send_to_close_windows(None).unwrap();
    session.pump(&mut [&mut popout]);

    assert!(popout.coordinator.is_released());
    assert!(popout.host.is_closed());
}

#[test]
fn test_close_widgets_empties_popout() {
    let session = Session::new();
    let (mut main, mut popout) = session_with_popout(&session);

    main.coordinator
        .send_to_close_widgets(CloseSelector::kind("Chart"), Vec::new())
        .unwrap();
    session.pump(&mut [&mut main, &mut popout]);

    assert!(popout.coordinator.widgets_in_layout().is_empty());
    assert_eq!(
        popout.coordinator.take_close_request(),
        Some(session.config.heartbeat.self_close())
    );
}

// ============================================================================
// Limits
// ============================================================================

#[test]
fn test_kind_limit_sweep_keeps_default_room() {
    let session = Session::new();
    let mut main = session.base_main();
    for room in ["r1", "r2", "r3"] {
        main.coordinator
            .send_to_open_widget(chat(room), OpenOptions::default())
            .unwrap();
    }
    session.pump(&mut [&mut main]);
    assert_eq!(main.coordinator.state_snapshot().main_widgets().len(), 3);

    main.coordinator
        .set_widget_kind_limit(WidgetKind::new("Chat"), 1, Some("r2".to_string()))
        .unwrap();
    session.pump(&mut [&mut main]);

    assert_eq!(
        main.coordinator.state_snapshot().main_widgets(),
        &[chat("r2")]
    );
    assert_eq!(main.coordinator.widgets_in_layout(), vec![chat("r2")]);
}

#[test]
fn test_zero_limit_closes_every_widget_of_kind() {
    let session = Session::new();
    let mut main = session.base_main();
    main.coordinator
        .send_to_open_widget(chat("r1"), OpenOptions::default())
        .unwrap();
    main.coordinator
        .send_to_open_widget(Widget::new("News", "r1"), OpenOptions::default())
        .unwrap();
    session.pump(&mut [&mut main]);

    main.coordinator
        .set_widget_kind_limit(WidgetKind::new("Chat"), 0, None)
        .unwrap();
    session.pump(&mut [&mut main]);

    assert_eq!(
        main.coordinator.state_snapshot().main_widgets(),
        &[Widget::new("News", "r1")]
    );
}

#[test]
fn test_room_limit_spares_exempt_rooms() {
    let session = Session::new();
    let mut main = session.base_main();
    for room in ["r1", "Charting_x", "r2"] {
        main.coordinator
            .send_to_open_widget(chat(room), OpenOptions::default())
            .unwrap();
    }
    session.pump(&mut [&mut main]);

    main.coordinator
        .set_room_id_limit(vec!["r1".to_string()])
        .unwrap();
    session.pump(&mut [&mut main]);

    assert_eq!(
        main.coordinator.state_snapshot().main_widgets(),
        &[chat("r1"), chat("Charting_x")]
    );
}

// ============================================================================
// Sub-main Layouts
// ============================================================================

#[test]
fn test_new_layout_opens_sub_main() {
    let session = Session::new();
    let mut main = session.base_main();
    main.coordinator
        .send_to_open_widget(chat("r1"), OpenOptions::default())
        .unwrap();
    session.pump(&mut [&mut main]);

    let layout = json!({ "layout": LayoutTree::new() }).to_string();
    let main_id = main.coordinator.popout_new_layout(&layout).unwrap();
    assert_eq!(main_id.len(), 4);
    assert!(main.coordinator.sub_main_ids().contains(&main_id));
    session.pump(&mut [&mut main]);

    let mut sub = session.open_requested(&main);
    assert_eq!(sub.coordinator.role(), WindowRole::SubMain);
    assert_eq!(sub.coordinator.main_id(), main_id);
    sub.coordinator.on_settings_loaded(Vec::new());
    session.pump(&mut [&mut main, &mut sub]);

    let main_state = main.coordinator.state_snapshot();
    assert_eq!(main_state.popouts.len(), 1);
    assert_eq!(main_state.popouts[0].client.id, main_id);

    let sub_state = sub.coordinator.state_snapshot();
    assert_eq!(sub_state.popouts, main_state.popouts);
    assert_eq!(sub_state.widgets_of_base_main, vec![chat("r1")]);
    assert_eq!(
        sub_state.main.as_ref().map(|m| m.client.id.clone()),
        Some(main_id.clone())
    );

    let layouts = session
        .storage()
        .get_value(LAYOUTS_KEY, Some("1"))
        .unwrap()
        .unwrap();
    assert!(layouts.get("main").is_some());
    assert!(layouts.get(&main_id).is_some());
}

#[test]
fn test_layout_window_limit() {
    let mut config = Config::default();
    config.limits.max_layouts = 2;
    let session = Session::with_config(config);
    let (mut main, _popout) = session_with_popout(&session);

    // Main and one popout already fill the limit
    let result = main
        .coordinator
        .send_to_open_widget(Widget::new("Chart", "r2"), OpenOptions::popout());
    assert!(result.is_err());
    assert_eq!(main.host.notices()[0].level, NoticeLevel::Warning);
}
