//! Safe mutations of a window's layout tree.
//!
//! The delegate wraps a [`LayoutTree`] with the rules windows apply on top of
//! raw tree actions: adding an open widget selects it, some kinds become
//! closable when stacked, splits never shrink a pane below a minimum width,
//! and resized or moved layouts are persisted under the window's main id.

use crate::config::Config;
use crate::store::Storage;
use paneweave_core_layout::{
    build_node_id, Action, AdjustSplit, DockLocation, LayoutTree, NodeType, PlacementRule,
    TabNode, Widget, WidgetKind,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Rules the delegate enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct DelegatePolicy {
    /// Kinds that get a close button when stacked with another tab.
    pub closable_kinds: Vec<WidgetKind>,
    /// Kinds that can't be dragged around.
    pub protected_kinds: Vec<WidgetKind>,
    /// Narrowest pane, in pixels, a split may produce.
    pub min_width: f64,
    pub placement: PlacementRule,
}

impl DelegatePolicy {
    pub fn from_config(config: &Config) -> Self {
        let min_width = if config.window.mobile {
            config.layout.mobile_min_width
        } else {
            config.layout.desktop_min_width
        };
        Self {
            closable_kinds: config.layout.closable_kinds.clone(),
            protected_kinds: config.layout.protected_kinds.clone(),
            min_width,
            placement: PlacementRule::default(),
        }
    }

    fn is_closable(&self, kind: &WidgetKind) -> bool {
        self.closable_kinds.contains(kind)
    }

    fn is_protected(&self, kind: &WidgetKind) -> bool {
        self.protected_kinds.contains(kind)
    }
}

impl Default for DelegatePolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Tab title shown for a widget kind.
fn display_name(kind: &WidgetKind) -> String {
    match kind.as_str() {
        "PrivateChats" => "Private Chat".to_string(),
        other => other.to_string(),
    }
}

/// Make sure neither side of a split ends up narrower than `min_width`.
///
/// Moves the missing pixels, and the matching share of weight, from the wider
/// side to the narrower one. Returns whether the split was changed.
pub fn clamp_split(split: &mut AdjustSplit, min_width: f64) -> bool {
    let (p1, p2) = (split.pixel_width1, split.pixel_width2);
    if p1.min(p2) >= min_width {
        return false;
    }
    let total_pixels = p1 + p2;
    if total_pixels <= 0.0 {
        return false;
    }
    let total_weight = split.weight1 + split.weight2;

    if p1 > p2 {
        let diff = min_width - p2;
        let wdiff = diff * total_weight / total_pixels;
        split.pixel_width2 += diff;
        split.pixel_width1 -= diff;
        split.weight2 += wdiff;
        split.weight1 -= wdiff;
    } else {
        let diff = min_width - p1;
        let wdiff = diff * total_weight / total_pixels;
        split.pixel_width1 += diff;
        split.pixel_width2 -= diff;
        split.weight1 += wdiff;
        split.weight2 -= wdiff;
    }
    true
}

/// Owner of one window's layout tree.
pub struct LayoutDelegate {
    tree: LayoutTree,
    main_id: String,
    storage: Storage,
    layouts_version: String,
    policy: DelegatePolicy,
    watch_tx: watch::Sender<LayoutTree>,
}

impl LayoutDelegate {
    /// Create a delegate for `main_id`.
    ///
    /// With `load` set the persisted tree of that main id is used; a missing
    /// or unreadable tree starts empty.
    pub fn new(
        storage: Storage,
        main_id: impl Into<String>,
        layouts_version: impl Into<String>,
        policy: DelegatePolicy,
        load: bool,
    ) -> Self {
        let main_id = main_id.into();
        let layouts_version = layouts_version.into();

        let tree = if load {
            storage
                .layouts(&layouts_version)
                .get(&main_id)
                .map(|json| match serde_json::from_value::<LayoutTree>(json.clone()) {
                    Ok(tree) => tree,
                    Err(e) => {
                        warn!("Persisted layout of {} is invalid, starting empty: {}", main_id, e);
                        LayoutTree::new()
                    }
                })
                .unwrap_or_default()
        } else {
            LayoutTree::new()
        };

        let (watch_tx, _) = watch::channel(tree.clone());
        Self {
            tree,
            main_id,
            storage,
            layouts_version,
            policy,
            watch_tx,
        }
    }

    pub fn main_id(&self) -> &str {
        &self.main_id
    }

    pub fn tree(&self) -> &LayoutTree {
        &self.tree
    }

    /// Copy of the current tree.
    pub fn snapshot(&self) -> LayoutTree {
        self.tree.clone()
    }

    /// Watch every tree update.
    pub fn subscribe(&self) -> watch::Receiver<LayoutTree> {
        self.watch_tx.subscribe()
    }

    /// Widgets hosted by the tree.
    pub fn widgets(&self) -> Vec<Widget> {
        self.tree.widgets()
    }

    /// Room of the first tab in the active tabset, for room tabs.
    pub fn selected_room(&self) -> Option<String> {
        let tabset = self.tree.active_tabset()?;
        let id = &tabset.children.first()?.id;
        if id.starts_with("Room") {
            id.rsplit('_').next().map(str::to_string)
        } else {
            None
        }
    }

    /// Add a widget, or select it when it is already there.
    ///
    /// With `to_tab_of`, the widget is stacked into the tabset of the tab of
    /// that kind in the same room, if one exists. Otherwise a new tabset is
    /// placed by the placement rule.
    pub fn add_widget(
        &mut self,
        room_id: &str,
        kind: &WidgetKind,
        to_tab_of: Option<&WidgetKind>,
    ) -> &LayoutTree {
        let widget = Widget::new(kind.clone(), room_id);
        let node_id = widget.node_id();

        if self.tree.contains(&node_id) {
            return self.do_action(Action::select_tab(node_id));
        }

        let name = display_name(kind);
        let closable = self.policy.is_closable(kind);

        if let Some(sibling_kind) = to_tab_of {
            let sibling_id = build_node_id(sibling_kind, room_id);
            if let Some(tabset) = self.tree.tabset_of(&sibling_id) {
                let tabset_id = tabset.id.clone();
                let mut next = self.tree.clone();
                if closable {
                    apply(&mut next, &Action::set_enable_close(sibling_id, true));
                }
                apply(
                    &mut next,
                    &Action::AddNode {
                        tab: TabNode::for_widget(&widget, name, closable),
                        to_node: tabset_id,
                        location: DockLocation::Center,
                        index: Some(0),
                    },
                );
                return self.update(next);
            }
        }

        let target = self.tree.find_placement(&self.policy.placement);
        let mut next = self.tree.clone();
        apply(
            &mut next,
            &Action::AddNode {
                tab: TabNode::for_widget(&widget, name, false),
                to_node: target.to_node,
                location: target.location,
                index: None,
            },
        );
        if target.resize {
            if let Some(tabset_id) = next.tabset_of(&node_id).map(|ts| ts.id.clone()) {
                next.equalize_siblings(&tabset_id);
            }
        }
        self.update(next)
    }

    /// Remove a widget's tab. A tab left alone in its tabset loses its close
    /// button.
    pub fn delete_widget(&mut self, room_id: &str, kind: &WidgetKind) -> &LayoutTree {
        let node_id = build_node_id(kind, room_id);
        let Some(tabset) = self.tree.tabset_of(&node_id) else {
            return &self.tree;
        };
        let tabset_id = tabset.id.clone();

        let mut next = self.tree.clone();
        apply(&mut next, &Action::delete_tab(node_id));

        let survivor = next
            .tabsets()
            .into_iter()
            .find(|ts| ts.id == tabset_id)
            .filter(|ts| ts.children.len() == 1)
            .map(|ts| ts.children[0].id.clone());
        if let Some(survivor) = survivor {
            apply(&mut next, &Action::set_enable_close(survivor, false));
        }
        self.update(next)
    }

    /// Apply a user action with the window rules in force.
    pub fn do_action(&mut self, action: Action) -> &LayoutTree {
        let mut action = action;
        match &mut action {
            Action::RenameTab { node, .. } if !self.tree.contains(node) => {
                debug!("Ignoring rename of missing node {}", node);
                return &self.tree;
            }
            Action::AdjustSplit(split) => {
                if clamp_split(split, self.policy.min_width) {
                    debug!("Split clamped to minimum width: {:?}", split);
                }
            }
            Action::MoveNode {
                from_node,
                to_node,
                location,
                ..
            } => {
                if *location == DockLocation::Center
                    && self.tree.node_type(to_node) == Some(NodeType::Tabset)
                {
                    debug!("Ignoring center drop of {} onto tabset {}", from_node, to_node);
                    return &self.tree;
                }
                let protected = paneweave_core_layout::parse_node_id(from_node)
                    .map(|w| self.policy.is_protected(&w.kind))
                    .unwrap_or(false);
                if protected {
                    debug!("Ignoring move of protected node {}", from_node);
                    return &self.tree;
                }
            }
            _ => {}
        }

        let mut next = self.tree.clone();
        apply(&mut next, &action);

        if matches!(action, Action::AdjustSplit(_) | Action::MoveNode { .. }) {
            self.persist(&next);
        }
        self.update(next)
    }

    fn persist(&self, tree: &LayoutTree) {
        let json = match serde_json::to_value(tree) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode layout of {}: {}", self.main_id, e);
                return;
            }
        };
        let mut layouts = self.storage.layouts(&self.layouts_version);
        layouts.insert(self.main_id.clone(), json);
        if let Err(e) = self.storage.set_layouts(&layouts, &self.layouts_version) {
            warn!("Failed to persist layout of {}: {}", self.main_id, e);
        }
    }

    fn update(&mut self, tree: LayoutTree) -> &LayoutTree {
        self.tree = tree;
        self.watch_tx.send_replace(self.tree.clone());
        &self.tree
    }
}

fn apply(tree: &mut LayoutTree, action: &Action) {
    if let Err(e) = tree.do_action(action) {
        debug!("Layout action failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StorageScope};
    use paneweave_core_layout::Orientation;
    use std::sync::Arc;

    fn storage() -> Storage {
        Storage::new(
            Arc::new(MemoryStore::new()),
            StorageScope::new("NG", "u1"),
            Arc::new(ManualClock::new(0)),
        )
    }

    fn delegate() -> LayoutDelegate {
        LayoutDelegate::new(storage(), "main", "1", DelegatePolicy::default(), true)
    }

    fn kind(k: &str) -> WidgetKind {
        WidgetKind::new(k)
    }

    #[test]
    fn test_add_existing_selects() {
        let mut d = delegate();
        d.add_widget("r1", &kind("Chat"), None);
        d.add_widget("r1", &kind("Orders"), None);
        let before = d.widgets();
        d.add_widget("r1", &kind("Chat"), None);
        assert_eq!(d.widgets(), before);
        let active = d.tree().active_tabset().unwrap();
        assert_eq!(active.selected_tab().unwrap().id, "Chat_r1");
    }

    #[test]
    fn test_placement_splits_right_then_bottom() {
        let mut d = delegate();
        d.add_widget("r1", &kind("A"), None);
        d.add_widget("r1", &kind("B"), None);
        let root = d.tree().root();
        assert_eq!(root.orientation, Orientation::Horizontal);
        assert_eq!(root.children.len(), 2);
        assert!(root.children.iter().all(|c| c.weight() == 50.0));

        d.add_widget("r1", &kind("C"), None);
        assert_eq!(d.tree().tabsets().len(), 3);
    }

    #[test]
    fn test_stacking_makes_sibling_closable() {
        let mut d = delegate();
        d.add_widget("r1", &kind("Chat"), None);
        d.add_widget("r1", &kind("PrivateChats"), Some(&kind("Chat")));

        let tabset = d.tree().tabset_of("Chat_r1").unwrap();
        assert_eq!(tabset.children.len(), 2);
        assert_eq!(tabset.children[0].id, "PrivateChats_r1");
        assert_eq!(tabset.children[0].name, "Private Chat");
        assert!(tabset.children.iter().all(|t| t.enable_close));

        d.delete_widget("r1", &kind("PrivateChats"));
        let chat = d.tree().tab("Chat_r1").unwrap();
        assert!(!chat.enable_close);
    }

    #[test]
    fn test_stacking_without_sibling_places_normally() {
        let mut d = delegate();
        d.add_widget("r1", &kind("Chat"), None);
        d.add_widget("r2", &kind("Announcements"), Some(&kind("Chat")));
        assert_eq!(d.tree().tabsets().len(), 2);
        assert!(!d.tree().tab("Announcements_r2").unwrap().enable_close);
    }

    #[test]
    fn test_delete_missing_is_noop() {
        let mut d = delegate();
        d.add_widget("r1", &kind("Chat"), None);
        let before = d.snapshot();
        d.delete_widget("r9", &kind("Chat"));
        assert_eq!(d.snapshot(), before);
    }

    #[test]
    fn test_clamp_split_floor() {
        let mut split = AdjustSplit {
            node1: "#1".into(),
            weight1: 90.0,
            pixel_width1: 900.0,
            node2: "#2".into(),
            weight2: 10.0,
            pixel_width2: 100.0,
        };
        assert!(clamp_split(&mut split, 320.0));
        assert_eq!(split.pixel_width2, 320.0);
        assert_eq!(split.pixel_width1, 680.0);
        assert!((split.weight2 - 32.0).abs() < 1e-9);
        assert!((split.weight1 - 68.0).abs() < 1e-9);

        let mut wide = AdjustSplit {
            pixel_width1: 500.0,
            pixel_width2: 500.0,
            ..split.clone()
        };
        assert!(!clamp_split(&mut wide, 320.0));
    }

    #[test]
    fn test_adjust_split_persists() {
        let storage = storage();
        let mut d =
            LayoutDelegate::new(storage.clone(), "m2", "1", DelegatePolicy::default(), true);
        d.add_widget("r1", &kind("A"), None);
        d.add_widget("r1", &kind("B"), None);
        let ids: Vec<String> = d
            .tree()
            .root()
            .children
            .iter()
            .map(|c| c.id().to_string())
            .collect();

        d.do_action(Action::AdjustSplit(AdjustSplit {
            node1: ids[0].clone(),
            weight1: 95.0,
            pixel_width1: 950.0,
            node2: ids[1].clone(),
            weight2: 5.0,
            pixel_width2: 50.0,
        }));
        let weight2 = d.tree().root().children[1].weight();
        assert!((weight2 - 32.0).abs() < 1e-9);

        let layouts = storage.layouts("1");
        assert!(layouts.contains_key("m2"));
        let reloaded = LayoutDelegate::new(storage, "m2", "1", DelegatePolicy::default(), true);
        assert_eq!(reloaded.snapshot(), d.snapshot());
    }

    #[test]
    fn test_ignored_actions() {
        let mut d = delegate();
        d.add_widget("r1", &kind("Chat"), None);
        d.add_widget("r1", &kind("Announcements"), None);
        let before = d.snapshot();

        d.do_action(Action::RenameTab {
            node: "Nope_r1".into(),
            text: "x".into(),
        });
        let chat_tabset = d.tree().tabset_of("Chat_r1").unwrap().id.clone();
        d.do_action(Action::MoveNode {
            from_node: "Announcements_r1".into(),
            to_node: "Chat_r1".into(),
            location: DockLocation::Bottom,
            index: None,
        });
        d.do_action(Action::MoveNode {
            from_node: "Announcements_r1".into(),
            to_node: chat_tabset,
            location: DockLocation::Center,
            index: None,
        });
        assert_eq!(d.snapshot(), before);
    }

    #[test]
    fn test_invalid_persisted_tree_starts_empty() {
        let storage = storage();
        let mut layouts = storage.layouts("1");
        layouts.insert("main".into(), serde_json::json!({"bogus": true}));
        storage.set_layouts(&layouts, "1").unwrap();
        let d = LayoutDelegate::new(storage, "main", "1", DelegatePolicy::default(), true);
        assert!(d.tree().is_empty());
    }

    #[test]
    fn test_selected_room_and_watch() {
        let mut d = delegate();
        let rx = d.subscribe();
        d.add_widget("abc_42", &kind("Room"), None);
        assert_eq!(d.selected_room().as_deref(), Some("42"));
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow().contains("Room_abc_42"));

        d.add_widget("r1", &kind("Chat"), None);
        assert_eq!(d.selected_room(), None);
    }
}
