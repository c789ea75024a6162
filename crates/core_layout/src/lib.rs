//! Paneweave Core Layout
//!
//! Platform-agnostic layout tree for a single paneweave window.
//!
//! A window arranges its widgets in a tree where:
//! - Rows split their area between children by weight, horizontally or vertically
//! - Tabsets stack tabs and show the selected one
//! - Tabs host exactly one widget and are keyed by an id derived from it

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Identifier of a node in the layout tree.
pub type NodeId = String;

/// Id of the root row of every tree.
pub const ROOT_ID: &str = "#0";

/// Weight given to a node that has no siblings to share with.
pub const DEFAULT_WEIGHT: f64 = 100.0;

/// Errors that can occur during layout operations.
#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("Node {0} not found in layout")]
    NodeNotFound(NodeId),

    #[error("Node {0} already exists in layout")]
    DuplicateNode(NodeId),

    #[error("Node {0} is not a tab")]
    NotATab(NodeId),

    #[error("Nodes {0} and {1} are not siblings")]
    NotSiblings(NodeId, NodeId),
}

/// Kind of content a widget shows.
///
/// Kinds never contain `_`, which separates kind and room in node ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetKind(String);

impl WidgetKind {
    /// Placeholder kind used to open an empty layout window.
    pub const EMPTY: &'static str = "Empty";
    /// Screen sharing widget; its popouts don't count as layout windows.
    pub const SCREENCAST: &'static str = "Screencast";

    /// Create a widget kind from its name.
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    /// The empty-layout kind.
    pub fn empty() -> Self {
        Self::new(Self::EMPTY)
    }

    /// The screencast kind.
    pub fn screencast() -> Self {
        Self::new(Self::SCREENCAST)
    }

    /// Kind name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the screencast kind.
    pub fn is_screencast(&self) -> bool {
        self.0 == Self::SCREENCAST
    }
}

impl fmt::Display for WidgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WidgetKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

/// An addressable unit of content, identified by kind and room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    pub kind: WidgetKind,
    pub room_id: String,
}

impl Widget {
    /// Create a new widget.
    pub fn new(kind: impl Into<WidgetKind>, room_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            room_id: room_id.into(),
        }
    }

    /// Id of the tab node hosting this widget.
    pub fn node_id(&self) -> NodeId {
        build_node_id(&self.kind, &self.room_id)
    }
}

impl fmt::Display for Widget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.room_id)
    }
}

/// Build the tab node id for a widget.
pub fn build_node_id(kind: &WidgetKind, room_id: &str) -> NodeId {
    format!("{}_{}", kind, room_id)
}

/// Recover the widget encoded in a tab node id.
///
/// Structural ids (`#n`) and malformed ids yield `None`.
pub fn parse_node_id(id: &str) -> Option<Widget> {
    if id.starts_with('#') {
        return None;
    }
    let (kind, room_id) = id.split_once('_')?;
    if kind.is_empty() || room_id.is_empty() {
        return None;
    }
    Some(Widget::new(kind, room_id))
}

/// Direction in which a row lays out its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// Children side by side.
    #[default]
    Horizontal,
    /// Children stacked top to bottom.
    Vertical,
}

/// Where a node is dropped relative to a target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockLocation {
    Center,
    Top,
    Bottom,
    Left,
    Right,
}

impl DockLocation {
    /// Orientation of the split created by docking here; `None` for center.
    pub fn orientation(self) -> Option<Orientation> {
        match self {
            DockLocation::Center => None,
            DockLocation::Left | DockLocation::Right => Some(Orientation::Horizontal),
            DockLocation::Top | DockLocation::Bottom => Some(Orientation::Vertical),
        }
    }

    /// Whether the docked node goes after the target.
    pub fn is_after(self) -> bool {
        matches!(self, DockLocation::Right | DockLocation::Bottom)
    }

    /// The edge across the other axis.
    pub fn perpendicular(self) -> Self {
        match self {
            DockLocation::Right => DockLocation::Bottom,
            DockLocation::Bottom => DockLocation::Right,
            DockLocation::Left => DockLocation::Top,
            DockLocation::Top => DockLocation::Left,
            DockLocation::Center => DockLocation::Center,
        }
    }
}

/// A tab hosting one widget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabNode {
    pub id: NodeId,
    pub name: String,
    pub component: WidgetKind,
    #[serde(default)]
    pub enable_close: bool,
}

impl TabNode {
    /// Create a tab for a widget.
    pub fn for_widget(widget: &Widget, name: impl Into<String>, enable_close: bool) -> Self {
        Self {
            id: widget.node_id(),
            name: name.into(),
            component: widget.kind.clone(),
            enable_close,
        }
    }
}

/// A stack of tabs, one of them selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabSetNode {
    pub id: NodeId,
    pub weight: f64,
    #[serde(default)]
    pub selected: usize,
    pub children: Vec<TabNode>,
}

impl TabSetNode {
    /// The selected tab, if any.
    pub fn selected_tab(&self) -> Option<&TabNode> {
        self.children.get(self.selected)
    }

    fn position(&self, tab_id: &str) -> Option<usize> {
        self.children.iter().position(|t| t.id == tab_id)
    }

    fn remove_tab(&mut self, index: usize) -> TabNode {
        let tab = self.children.remove(index);
        if index < self.selected {
            self.selected -= 1;
        }
        if self.selected >= self.children.len() {
            self.selected = self.children.len().saturating_sub(1);
        }
        tab
    }
}

/// A child of a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowChild {
    Row(RowNode),
    Tabset(TabSetNode),
}

impl RowChild {
    /// Id of the child node.
    pub fn id(&self) -> &str {
        match self {
            RowChild::Row(row) => &row.id,
            RowChild::Tabset(tabset) => &tabset.id,
        }
    }

    /// Weight of the child within its row.
    pub fn weight(&self) -> f64 {
        match self {
            RowChild::Row(row) => row.weight,
            RowChild::Tabset(tabset) => tabset.weight,
        }
    }

    fn set_weight(&mut self, weight: f64) {
        match self {
            RowChild::Row(row) => row.weight = weight,
            RowChild::Tabset(tabset) => tabset.weight = weight,
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            RowChild::Row(row) => row.children.is_empty(),
            RowChild::Tabset(tabset) => tabset.children.is_empty(),
        }
    }
}

/// A row splitting its area between children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowNode {
    pub id: NodeId,
    pub weight: f64,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub children: Vec<RowChild>,
}

impl RowNode {
    fn collect_tabsets<'a>(&'a self, out: &mut Vec<&'a TabSetNode>) {
        for child in &self.children {
            match child {
                RowChild::Row(row) => row.collect_tabsets(out),
                RowChild::Tabset(tabset) => out.push(tabset),
            }
        }
    }

    fn find_row(&self, id: &str) -> Option<&RowNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| match child {
            RowChild::Row(row) => row.find_row(id),
            RowChild::Tabset(_) => None,
        })
    }

    fn find_row_mut(&mut self, id: &str) -> Option<&mut RowNode> {
        if self.id == id {
            return Some(self);
        }
        for child in &mut self.children {
            if let RowChild::Row(row) = child {
                if let Some(found) = row.find_row_mut(id) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn find_tabset_mut(&mut self, id: &str) -> Option<&mut TabSetNode> {
        for child in &mut self.children {
            match child {
                RowChild::Tabset(tabset) if tabset.id == id => return Some(tabset),
                RowChild::Tabset(_) => {}
                RowChild::Row(row) => {
                    if let Some(found) = row.find_tabset_mut(id) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    fn tabset_with_tab_mut(&mut self, tab_id: &str) -> Option<&mut TabSetNode> {
        for child in &mut self.children {
            match child {
                RowChild::Tabset(tabset) if tabset.position(tab_id).is_some() => {
                    return Some(tabset)
                }
                RowChild::Tabset(_) => {}
                RowChild::Row(row) => {
                    if let Some(found) = row.tabset_with_tab_mut(tab_id) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    fn parent_of(&self, id: &str) -> Option<&RowNode> {
        if self.children.iter().any(|c| c.id() == id) {
            return Some(self);
        }
        self.children.iter().find_map(|child| match child {
            RowChild::Row(row) => row.parent_of(id),
            RowChild::Tabset(_) => None,
        })
    }

    fn parent_of_mut(&mut self, id: &str) -> Option<&mut RowNode> {
        if self.children.iter().any(|c| c.id() == id) {
            return Some(self);
        }
        for child in &mut self.children {
            if let RowChild::Row(row) = child {
                if let Some(found) = row.parent_of_mut(id) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Drop empty tabsets and rows, and collapse single-child rows into their child.
    fn prune(&mut self) {
        for child in &mut self.children {
            if let RowChild::Row(row) = child {
                row.prune();
            }
        }
        self.children.retain(|child| !child.is_empty());

        for child in &mut self.children {
            let replacement = match child {
                RowChild::Row(row) if row.children.len() == 1 => {
                    let mut only = row.children.remove(0);
                    only.set_weight(row.weight);
                    Some(only)
                }
                _ => None,
            };
            if let Some(only) = replacement {
                *child = only;
            }
        }
    }

    fn average_child_weight(&self) -> f64 {
        if self.children.is_empty() {
            return DEFAULT_WEIGHT;
        }
        self.children.iter().map(RowChild::weight).sum::<f64>() / self.children.len() as f64
    }
}

/// Which kind of node an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Row,
    Tabset,
    Tab,
}

/// Ratio data for an adjust-split action between two adjacent siblings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustSplit {
    pub node1: NodeId,
    pub weight1: f64,
    pub pixel_width1: f64,
    pub node2: NodeId,
    pub weight2: f64,
    pub pixel_width2: f64,
}

/// Attribute changes applied by [`Action::UpdateNodeAttributes`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_close: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

/// Mutations a window applies to its layout tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Action {
    /// Add a tab relative to an existing node.
    AddNode {
        tab: TabNode,
        to_node: NodeId,
        location: DockLocation,
        #[serde(default)]
        index: Option<usize>,
    },
    /// Remove a tab.
    DeleteTab { node: NodeId },
    /// Move a tab relative to another node.
    MoveNode {
        from_node: NodeId,
        to_node: NodeId,
        location: DockLocation,
        #[serde(default)]
        index: Option<usize>,
    },
    /// Redistribute weight between two adjacent siblings.
    AdjustSplit(AdjustSplit),
    /// Change a tab's display name.
    RenameTab { node: NodeId, text: String },
    /// Select a tab and make its tabset active.
    SelectTab { node: NodeId },
    /// Change node attributes in place.
    UpdateNodeAttributes {
        node: NodeId,
        attributes: NodeAttributes,
    },
}

impl Action {
    /// Select the tab with the given id.
    pub fn select_tab(node: impl Into<NodeId>) -> Self {
        Action::SelectTab { node: node.into() }
    }

    /// Delete the tab with the given id.
    pub fn delete_tab(node: impl Into<NodeId>) -> Self {
        Action::DeleteTab { node: node.into() }
    }

    /// Set whether a tab shows its close button.
    pub fn set_enable_close(node: impl Into<NodeId>, enable_close: bool) -> Self {
        Action::UpdateNodeAttributes {
            node: node.into(),
            attributes: NodeAttributes {
                enable_close: Some(enable_close),
                ..Default::default()
            },
        }
    }
}

/// One step of the placement rule.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementStep {
    /// Edge at which the next tabset is docked.
    pub next_direction: DockLocation,
    /// Maximum children of a row running in that direction before switching.
    pub max: usize,
}

/// Deterministic binary space partition deciding where a new tabset goes.
///
/// Steps are looked up by the number of tabsets already in the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRule {
    pub steps: BTreeMap<usize, PlacementStep>,
    pub default: PlacementStep,
}

impl Default for PlacementRule {
    fn default() -> Self {
        let mut steps = BTreeMap::new();
        steps.insert(
            1,
            PlacementStep {
                next_direction: DockLocation::Right,
                max: 2,
            },
        );
        Self {
            steps,
            default: PlacementStep {
                next_direction: DockLocation::Bottom,
                max: 2,
            },
        }
    }
}

impl PlacementRule {
    /// Step applying to a tree with `tabsets` tabsets.
    pub fn step_for(&self, tabsets: usize) -> &PlacementStep {
        self.steps.get(&tabsets).unwrap_or(&self.default)
    }
}

/// Where a new tabset should be docked.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementTarget {
    pub to_node: NodeId,
    pub location: DockLocation,
    /// Whether siblings should be re-weighted equally after docking.
    pub resize: bool,
}

fn default_next_id() -> u64 {
    1
}

/// The layout tree of one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutTree {
    root: RowNode,
    #[serde(default)]
    active_tabset: Option<NodeId>,
    #[serde(default = "default_next_id")]
    next_id: u64,
}

impl Default for LayoutTree {
    fn default() -> Self {
        Self {
            root: RowNode {
                id: ROOT_ID.to_string(),
                weight: DEFAULT_WEIGHT,
                orientation: Orientation::Horizontal,
                children: Vec::new(),
            },
            active_tabset: None,
            next_id: default_next_id(),
        }
    }
}

impl LayoutTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// The root row.
    pub fn root(&self) -> &RowNode {
        &self.root
    }

    /// Check if the tree hosts no tabs.
    pub fn is_empty(&self) -> bool {
        self.root.children.is_empty()
    }

    /// Check if a node with this id exists.
    pub fn contains(&self, id: &str) -> bool {
        self.node_type(id).is_some()
    }

    /// Kind of node the id refers to.
    pub fn node_type(&self, id: &str) -> Option<NodeType> {
        if self.root.find_row(id).is_some() {
            return Some(NodeType::Row);
        }
        let tabsets = self.tabsets();
        if tabsets.iter().any(|ts| ts.id == id) {
            return Some(NodeType::Tabset);
        }
        if tabsets.iter().any(|ts| ts.position(id).is_some()) {
            return Some(NodeType::Tab);
        }
        None
    }

    /// All tabsets, depth first.
    pub fn tabsets(&self) -> Vec<&TabSetNode> {
        let mut out = Vec::new();
        self.root.collect_tabsets(&mut out);
        out
    }

    /// Find a tab by id.
    pub fn tab(&self, id: &str) -> Option<&TabNode> {
        self.tabsets()
            .into_iter()
            .find_map(|ts| ts.children.iter().find(|t| t.id == id))
    }

    /// Find the tabset holding a tab.
    pub fn tabset_of(&self, tab_id: &str) -> Option<&TabSetNode> {
        self.tabsets()
            .into_iter()
            .find(|ts| ts.position(tab_id).is_some())
    }

    /// Find the row directly containing a row or tabset.
    pub fn parent_row(&self, id: &str) -> Option<&RowNode> {
        self.root.parent_of(id)
    }

    /// Ids of every tab, depth first.
    pub fn tab_ids(&self) -> Vec<NodeId> {
        self.tabsets()
            .into_iter()
            .flat_map(|ts| ts.children.iter().map(|t| t.id.clone()))
            .collect()
    }

    /// Widgets hosted by the tree, depth first.
    pub fn widgets(&self) -> Vec<Widget> {
        self.tab_ids()
            .iter()
            .filter_map(|id| parse_node_id(id))
            .collect()
    }

    /// The tabset that received the last selection.
    pub fn active_tabset(&self) -> Option<&TabSetNode> {
        let id = self.active_tabset.as_deref()?;
        self.tabsets().into_iter().find(|ts| ts.id == id)
    }

    /// Apply an action to the tree.
    pub fn do_action(&mut self, action: &Action) -> Result<(), LayoutError> {
        match action {
            Action::AddNode {
                tab,
                to_node,
                location,
                index,
            } => self.add_node(tab.clone(), to_node, *location, *index),
            Action::DeleteTab { node } => self.delete_tab(node),
            Action::MoveNode {
                from_node,
                to_node,
                location,
                index,
            } => self.move_node(from_node, to_node, *location, *index),
            Action::AdjustSplit(split) => self.adjust_split(split),
            Action::RenameTab { node, text } => {
                let tabset = self
                    .root
                    .tabset_with_tab_mut(node)
                    .ok_or_else(|| LayoutError::NodeNotFound(node.clone()))?;
                if let Some(tab) = tabset.children.iter_mut().find(|t| &t.id == node) {
                    tab.name = text.clone();
                }
                Ok(())
            }
            Action::SelectTab { node } => self.select_tab(node),
            Action::UpdateNodeAttributes { node, attributes } => {
                self.update_attributes(node, attributes)
            }
        }
    }

    /// Decide where the next tabset goes according to the rule.
    pub fn find_placement(&self, rule: &PlacementRule) -> PlacementTarget {
        let Some((parent, last)) = last_tabset_with_parent(&self.root) else {
            return PlacementTarget {
                to_node: self.root.id.clone(),
                location: DockLocation::Center,
                resize: false,
            };
        };

        let step = rule.step_for(self.tabsets().len());
        let direction = step.next_direction;
        let runs_in_direction = direction.orientation() == Some(parent.orientation);

        if runs_in_direction && parent.children.len() < step.max {
            PlacementTarget {
                to_node: last.id.clone(),
                location: direction,
                resize: true,
            }
        } else if runs_in_direction {
            PlacementTarget {
                to_node: last.id.clone(),
                location: direction.perpendicular(),
                resize: false,
            }
        } else {
            PlacementTarget {
                to_node: last.id.clone(),
                location: direction,
                resize: false,
            }
        }
    }

    /// Give every sibling of `id` (and `id` itself) the same weight.
    pub fn equalize_siblings(&mut self, id: &str) -> bool {
        let Some(parent) = self.root.parent_of_mut(id) else {
            return false;
        };
        let weight = DEFAULT_WEIGHT / parent.children.len() as f64;
        for child in &mut parent.children {
            child.set_weight(weight);
        }
        true
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = format!("#{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn select_tab(&mut self, node: &str) -> Result<(), LayoutError> {
        let tabset = self
            .root
            .tabset_with_tab_mut(node)
            .ok_or_else(|| LayoutError::NodeNotFound(node.to_string()))?;
        if let Some(index) = tabset.position(node) {
            tabset.selected = index;
        }
        let tabset_id = tabset.id.clone();
        self.active_tabset = Some(tabset_id);
        Ok(())
    }

    fn add_node(
        &mut self,
        tab: TabNode,
        to_node: &str,
        location: DockLocation,
        index: Option<usize>,
    ) -> Result<(), LayoutError> {
        if self.contains(&tab.id) {
            return Err(LayoutError::DuplicateNode(tab.id));
        }

        let target = match self.node_type(to_node) {
            None => return Err(LayoutError::NodeNotFound(to_node.to_string())),
            Some(NodeType::Tab) => match self.tabset_of(to_node) {
                Some(tabset) => tabset.id.clone(),
                None => return Err(LayoutError::NodeNotFound(to_node.to_string())),
            },
            Some(_) => to_node.to_string(),
        };

        if location == DockLocation::Center {
            if let Some(tabset) = self.root.find_tabset_mut(&target) {
                let at = index
                    .unwrap_or(tabset.children.len())
                    .min(tabset.children.len());
                tabset.children.insert(at, tab);
                tabset.selected = at;
                self.active_tabset = Some(target);
                return Ok(());
            }

            let tabset_id = self.allocate_id();
            let row = self
                .root
                .find_row_mut(&target)
                .ok_or_else(|| LayoutError::NodeNotFound(target.clone()))?;
            let weight = row.average_child_weight();
            row.children.push(RowChild::Tabset(TabSetNode {
                id: tabset_id.clone(),
                weight,
                selected: 0,
                children: vec![tab],
            }));
            self.active_tabset = Some(tabset_id);
            return Ok(());
        }

        let tabset_id = self.allocate_id();
        let wrapper_id = self.allocate_id();
        let incoming = RowChild::Tabset(TabSetNode {
            id: tabset_id.clone(),
            weight: DEFAULT_WEIGHT,
            selected: 0,
            children: vec![tab],
        });

        if target == self.root.id {
            self.dock_at_root(incoming, location, wrapper_id);
        } else {
            self.dock_beside(&target, incoming, location, wrapper_id)?;
        }
        self.active_tabset = Some(tabset_id);
        Ok(())
    }

    fn dock_at_root(&mut self, mut incoming: RowChild, location: DockLocation, wrapper_id: NodeId) {
        let orientation = location.orientation().unwrap_or(self.root.orientation);
        let root = &mut self.root;

        if root.children.is_empty() {
            root.orientation = orientation;
            root.children.push(incoming);
            return;
        }

        if root.orientation == orientation {
            incoming.set_weight(root.average_child_weight());
            if location.is_after() {
                root.children.push(incoming);
            } else {
                root.children.insert(0, incoming);
            }
            return;
        }

        let wrapped = RowChild::Row(RowNode {
            id: wrapper_id,
            weight: DEFAULT_WEIGHT / 2.0,
            orientation: root.orientation,
            children: std::mem::take(&mut root.children),
        });
        incoming.set_weight(DEFAULT_WEIGHT / 2.0);
        root.orientation = orientation;
        root.children = if location.is_after() {
            vec![wrapped, incoming]
        } else {
            vec![incoming, wrapped]
        };
    }

    fn dock_beside(
        &mut self,
        target: &str,
        mut incoming: RowChild,
        location: DockLocation,
        wrapper_id: NodeId,
    ) -> Result<(), LayoutError> {
        let orientation = location.orientation().unwrap_or_default();
        let parent = self
            .root
            .parent_of_mut(target)
            .ok_or_else(|| LayoutError::NodeNotFound(target.to_string()))?;
        let index = parent
            .children
            .iter()
            .position(|c| c.id() == target)
            .ok_or_else(|| LayoutError::NodeNotFound(target.to_string()))?;

        if parent.orientation == orientation {
            let half = parent.children[index].weight() / 2.0;
            parent.children[index].set_weight(half);
            incoming.set_weight(half);
            let at = if location.is_after() { index + 1 } else { index };
            parent.children.insert(at, incoming);
            return Ok(());
        }

        let mut existing = parent.children.remove(index);
        let weight = existing.weight();
        existing.set_weight(DEFAULT_WEIGHT / 2.0);
        incoming.set_weight(DEFAULT_WEIGHT / 2.0);
        let children = if location.is_after() {
            vec![existing, incoming]
        } else {
            vec![incoming, existing]
        };
        parent.children.insert(
            index,
            RowChild::Row(RowNode {
                id: wrapper_id,
                weight,
                orientation,
                children,
            }),
        );
        Ok(())
    }

    fn take_tab(&mut self, node: &str) -> Result<TabNode, LayoutError> {
        match self.node_type(node) {
            Some(NodeType::Tab) => {}
            Some(_) => return Err(LayoutError::NotATab(node.to_string())),
            None => return Err(LayoutError::NodeNotFound(node.to_string())),
        }
        let tabset = self
            .root
            .tabset_with_tab_mut(node)
            .ok_or_else(|| LayoutError::NodeNotFound(node.to_string()))?;
        let index = tabset
            .position(node)
            .ok_or_else(|| LayoutError::NodeNotFound(node.to_string()))?;
        Ok(tabset.remove_tab(index))
    }

    fn delete_tab(&mut self, node: &str) -> Result<(), LayoutError> {
        self.take_tab(node)?;
        self.prune();
        Ok(())
    }

    fn move_node(
        &mut self,
        from_node: &str,
        to_node: &str,
        location: DockLocation,
        index: Option<usize>,
    ) -> Result<(), LayoutError> {
        if !self.contains(to_node) {
            return Err(LayoutError::NodeNotFound(to_node.to_string()));
        }
        if from_node == to_node {
            return Ok(());
        }

        let backup = self.clone();
        let result = self
            .take_tab(from_node)
            .and_then(|tab| self.add_node(tab, to_node, location, index));
        match result {
            Ok(()) => {
                self.prune();
                Ok(())
            }
            Err(e) => {
                *self = backup;
                Err(e)
            }
        }
    }

    fn adjust_split(&mut self, split: &AdjustSplit) -> Result<(), LayoutError> {
        let not_siblings = || LayoutError::NotSiblings(split.node1.clone(), split.node2.clone());
        let parent = self.root.parent_of_mut(&split.node1).ok_or_else(not_siblings)?;
        if !parent.children.iter().any(|c| c.id() == split.node2) {
            return Err(not_siblings());
        }
        for child in &mut parent.children {
            if child.id() == split.node1 {
                child.set_weight(split.weight1);
            } else if child.id() == split.node2 {
                child.set_weight(split.weight2);
            }
        }
        Ok(())
    }

    fn update_attributes(
        &mut self,
        node: &str,
        attributes: &NodeAttributes,
    ) -> Result<(), LayoutError> {
        if let Some(tabset) = self.root.tabset_with_tab_mut(node) {
            if let Some(tab) = tabset.children.iter_mut().find(|t| t.id == node) {
                if let Some(enable_close) = attributes.enable_close {
                    tab.enable_close = enable_close;
                }
                if let Some(name) = &attributes.name {
                    tab.name = name.clone();
                }
            }
            return Ok(());
        }

        if node == self.root.id {
            if let Some(weight) = attributes.weight {
                self.root.weight = weight;
            }
            return Ok(());
        }

        let parent = self
            .root
            .parent_of_mut(node)
            .ok_or_else(|| LayoutError::NodeNotFound(node.to_string()))?;
        if let Some(weight) = attributes.weight {
            if let Some(child) = parent.children.iter_mut().find(|c| c.id() == node) {
                child.set_weight(weight);
            }
        }
        Ok(())
    }

    fn prune(&mut self) {
        self.root.prune();

        // A root holding a single row takes over that row's children.
        if self.root.children.len() == 1 {
            if let RowChild::Row(_) = &self.root.children[0] {
                if let RowChild::Row(only) = self.root.children.remove(0) {
                    self.root.orientation = only.orientation;
                    self.root.children = only.children;
                }
            }
        }

        if self.active_tabset().is_none() {
            self.active_tabset = None;
        }
    }
}

fn last_tabset_with_parent(row: &RowNode) -> Option<(&RowNode, &TabSetNode)> {
    for child in row.children.iter().rev() {
        match child {
            RowChild::Tabset(tabset) => return Some((row, tabset)),
            RowChild::Row(inner) => {
                if let Some(found) = last_tabset_with_parent(inner) {
                    return Some(found);
                }
            }
        }
    }
    None
}
