//! Object tree: nodes with stable ids, ordered children and layout roles.
//!
//! The tree is a derived view. Collaborative state lives in
//! [`DocumentState`](crate::DocumentState); [`ObjectTree::materialize`]
//! rebuilds the tree from it.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::document::DocumentState;
use crate::keys;
use crate::layout::{AutoLayout, ChildSizing, Constraints, ParseRoleError};
use crate::value::{Paint, PropertyValue, ValueKind};
use crate::Rect;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    #[error("node {0} not found")]
    NodeNotFound(Uuid),
    #[error("node {0} already exists")]
    DuplicateNode(Uuid),
    #[error("node {0} cannot have children")]
    NotAContainer(Uuid),
    #[error("placing {node} under {parent} would make it its own ancestor")]
    Cycle { node: Uuid, parent: Uuid },
    #[error("property {0} describes structure and cannot be set on a node")]
    ReadOnly(String),
    #[error("property {key} expects {expected}, got {found}")]
    TypeMismatch { key: String, expected: ValueKind, found: ValueKind },
    #[error("invalid value for {key}: {source}")]
    InvalidValue { key: String, source: ParseRoleError },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Container,
    Text,
    #[default]
    Shape,
    ComponentTemplate,
    ComponentInstance,
}

impl NodeKind {
    pub fn is_container(&self) -> bool {
        matches!(self, NodeKind::Container | NodeKind::ComponentTemplate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Container => "container",
            NodeKind::Text => "text",
            NodeKind::Shape => "shape",
            NodeKind::ComponentTemplate => "component_template",
            NodeKind::ComponentInstance => "component_instance",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = ParseRoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" => Ok(NodeKind::Container),
            "text" => Ok(NodeKind::Text),
            "shape" => Ok(NodeKind::Shape),
            "component_template" => Ok(NodeKind::ComponentTemplate),
            "component_instance" => Ok(NodeKind::ComponentInstance),
            other => Err(ParseRoleError { kind: "node kind", value: other.to_string() }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub kind: NodeKind,
    pub name: String,
    pub bounds: Rect,
    pub fills: Vec<Paint>,
    /// Text content (text nodes).
    pub content: Option<String>,
    /// Referenced component definition (instance nodes).
    pub component: Option<Uuid>,
    /// Present when this node flows its children.
    pub auto_layout: Option<AutoLayout>,
    pub constraints: Constraints,
    pub sizing: ChildSizing,
    /// Property key → component parameter name. Template layers only.
    pub bindings: BTreeMap<String, String>,
    /// Properties without a dedicated field.
    pub extra: BTreeMap<String, PropertyValue>,
    children: Vec<Uuid>,
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        Self::with_id(Uuid::new_v4(), kind)
    }

    pub fn with_id(id: Uuid, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            name: String::new(),
            bounds: Rect::default(),
            fills: Vec::new(),
            content: None,
            component: None,
            auto_layout: None,
            constraints: Constraints::default(),
            sizing: ChildSizing::default(),
            bindings: BTreeMap::new(),
            extra: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bounds(mut self, bounds: Rect) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_fills(mut self, fills: Vec<Paint>) -> Self {
        self.fills = fills;
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_auto_layout(mut self, rule: AutoLayout) -> Self {
        self.auto_layout = Some(rule);
        self
    }

    pub fn with_constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_sizing(mut self, sizing: ChildSizing) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn with_binding(mut self, key: impl Into<String>, parameter: impl Into<String>) -> Self {
        self.bindings.insert(key.into(), parameter.into());
        self
    }

    pub fn children(&self) -> &[Uuid] {
        &self.children
    }

    /// Keys this node currently has a value for.
    pub fn property_keys(&self) -> Vec<String> {
        let mut out: Vec<String> = [
            keys::NAME,
            keys::X,
            keys::Y,
            keys::WIDTH,
            keys::HEIGHT,
            keys::FILLS,
            keys::CONSTRAINT_HORIZONTAL,
            keys::CONSTRAINT_VERTICAL,
            keys::SIZING_HORIZONTAL,
            keys::SIZING_VERTICAL,
        ]
        .iter()
        .map(|k| k.to_string())
        .collect();
        if self.content.is_some() {
            out.push(keys::CONTENT.to_string());
        }
        if self.component.is_some() {
            out.push(keys::COMPONENT.to_string());
        }
        if self.auto_layout.is_some() {
            out.extend(
                [
                    keys::LAYOUT_MODE,
                    keys::LAYOUT_DIRECTION,
                    keys::LAYOUT_GAP,
                    keys::LAYOUT_PADDING_TOP,
                    keys::LAYOUT_PADDING_RIGHT,
                    keys::LAYOUT_PADDING_BOTTOM,
                    keys::LAYOUT_PADDING_LEFT,
                    keys::LAYOUT_PRIMARY_SIZING,
                    keys::LAYOUT_COUNTER_SIZING,
                    keys::LAYOUT_ALIGN,
                ]
                .iter()
                .map(|k| k.to_string()),
            );
        }
        out.extend(self.extra.keys().filter(|k| !keys::is_component_meta(k)).cloned());
        out
    }

    /// Current value of `key`, or `None` when the node has no such
    /// property.
    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        let number = |v: f32| Some(PropertyValue::Number(f64::from(v)));
        let text = |s: &str| Some(PropertyValue::Text(s.to_string()));
        match key {
            keys::KIND => text(self.kind.as_str()),
            keys::NAME => text(&self.name),
            keys::X => number(self.bounds.x),
            keys::Y => number(self.bounds.y),
            keys::WIDTH => number(self.bounds.width),
            keys::HEIGHT => number(self.bounds.height),
            keys::FILLS => Some(PropertyValue::Fills(self.fills.clone())),
            keys::CONTENT => self.content.as_deref().and_then(text),
            keys::COMPONENT => self.component.map(PropertyValue::Id),
            keys::CONSTRAINT_HORIZONTAL => text(self.constraints.horizontal.as_str()),
            keys::CONSTRAINT_VERTICAL => text(self.constraints.vertical.as_str()),
            keys::SIZING_HORIZONTAL => text(self.sizing.horizontal.as_str()),
            keys::SIZING_VERTICAL => text(self.sizing.vertical.as_str()),
            k if k.starts_with("layout.") => {
                let rule = self.auto_layout.as_ref()?;
                match k {
                    keys::LAYOUT_MODE => text("auto"),
                    keys::LAYOUT_DIRECTION => text(rule.direction.as_str()),
                    keys::LAYOUT_GAP => number(rule.gap),
                    keys::LAYOUT_PADDING_TOP => number(rule.padding.top),
                    keys::LAYOUT_PADDING_RIGHT => number(rule.padding.right),
                    keys::LAYOUT_PADDING_BOTTOM => number(rule.padding.bottom),
                    keys::LAYOUT_PADDING_LEFT => number(rule.padding.left),
                    keys::LAYOUT_PRIMARY_SIZING => text(rule.primary_sizing.as_str()),
                    keys::LAYOUT_COUNTER_SIZING => text(rule.counter_sizing.as_str()),
                    keys::LAYOUT_ALIGN => text(rule.align.as_str()),
                    _ => self.extra.get(k).cloned(),
                }
            }
            k if k.starts_with(keys::BIND_PREFIX) => {
                self.bindings.get(&k[keys::BIND_PREFIX.len()..]).map(|p| PropertyValue::Text(p.clone()))
            }
            other => self.extra.get(other).cloned(),
        }
    }

    /// Set one property, type-checked against the key's expected kind.
    ///
    /// Structural keys (`kind`, `parent`, `index`, `deleted`) belong to the
    /// tree and are rejected here.
    pub fn set_property(&mut self, key: &str, value: PropertyValue) -> Result<(), TreeError> {
        if keys::STRUCTURAL.contains(&key) {
            return Err(TreeError::ReadOnly(key.to_string()));
        }
        let expected = keys::expected_kind(key)
            .or_else(|| self.extra.get(key).map(PropertyValue::kind));
        if let Some(expected) = expected {
            if expected != value.kind() {
                return Err(TreeError::TypeMismatch {
                    key: key.to_string(),
                    expected,
                    found: value.kind(),
                });
            }
        }

        fn parse<T: FromStr<Err = ParseRoleError>>(key: &str, v: &PropertyValue) -> Result<T, TreeError> {
            v.as_text()
                .unwrap_or_default()
                .parse()
                .map_err(|source| TreeError::InvalidValue { key: key.to_string(), source })
        }
        let num = |v: &PropertyValue| v.as_f32().unwrap_or_default();

        match key {
            keys::NAME => self.name = value.as_text().unwrap_or_default().to_string(),
            keys::X => self.bounds.x = num(&value),
            keys::Y => self.bounds.y = num(&value),
            keys::WIDTH => self.bounds.width = num(&value),
            keys::HEIGHT => self.bounds.height = num(&value),
            keys::FILLS => self.fills = value.as_fills().map(<[Paint]>::to_vec).unwrap_or_default(),
            keys::CONTENT => self.content = value.as_text().map(str::to_string),
            keys::COMPONENT => self.component = value.as_id(),
            keys::CONSTRAINT_HORIZONTAL => self.constraints.horizontal = parse(key, &value)?,
            keys::CONSTRAINT_VERTICAL => self.constraints.vertical = parse(key, &value)?,
            keys::SIZING_HORIZONTAL => self.sizing.horizontal = parse(key, &value)?,
            keys::SIZING_VERTICAL => self.sizing.vertical = parse(key, &value)?,
            keys::LAYOUT_MODE => match value.as_text() {
                Some("auto") => {
                    self.auto_layout.get_or_insert_with(AutoLayout::default);
                }
                Some("none") => self.auto_layout = None,
                other => {
                    return Err(TreeError::InvalidValue {
                        key: key.to_string(),
                        source: ParseRoleError {
                            kind: "layout mode",
                            value: other.unwrap_or_default().to_string(),
                        },
                    })
                }
            },
            k if k.starts_with("layout.") && keys::expected_kind(k).is_some() => {
                let rule = self.auto_layout.get_or_insert_with(AutoLayout::default);
                match k {
                    keys::LAYOUT_DIRECTION => rule.direction = parse(k, &value)?,
                    keys::LAYOUT_GAP => rule.gap = num(&value),
                    keys::LAYOUT_PADDING_TOP => rule.padding.top = num(&value),
                    keys::LAYOUT_PADDING_RIGHT => rule.padding.right = num(&value),
                    keys::LAYOUT_PADDING_BOTTOM => rule.padding.bottom = num(&value),
                    keys::LAYOUT_PADDING_LEFT => rule.padding.left = num(&value),
                    keys::LAYOUT_PRIMARY_SIZING => rule.primary_sizing = parse(k, &value)?,
                    keys::LAYOUT_COUNTER_SIZING => rule.counter_sizing = parse(k, &value)?,
                    _ => rule.align = parse(k, &value)?,
                }
            }
            k if k.starts_with(keys::BIND_PREFIX) => {
                let target = k[keys::BIND_PREFIX.len()..].to_string();
                match value.as_text() {
                    Some("") | None => self.bindings.remove(&target),
                    Some(parameter) => self.bindings.insert(target, parameter.to_string()),
                };
            }
            other => {
                self.extra.insert(other.to_string(), value);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObjectTree {
    nodes: HashMap<Uuid, Node>,
    parents: HashMap<Uuid, Uuid>,
    roots: Vec<Uuid>,
}

impl ObjectTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `node` as the last child of `parent` (or as a root).
    pub fn insert(&mut self, parent: Option<Uuid>, node: Node) -> Result<Uuid, TreeError> {
        self.insert_at(parent, usize::MAX, node)
    }

    /// Insert `node` at `index` among `parent`'s children. Children the
    /// node carried are dropped; descendants are inserted separately.
    pub fn insert_at(
        &mut self,
        parent: Option<Uuid>,
        index: usize,
        mut node: Node,
    ) -> Result<Uuid, TreeError> {
        let id = node.id;
        if self.nodes.contains_key(&id) {
            return Err(TreeError::DuplicateNode(id));
        }
        if let Some(parent_id) = parent {
            self.check_parent(id, parent_id)?;
        }
        node.children.clear();
        self.nodes.insert(id, node);
        self.link(id, parent, index);
        Ok(id)
    }

    /// Move an existing node under `new_parent` at `index`.
    pub fn move_node(
        &mut self,
        id: Uuid,
        new_parent: Option<Uuid>,
        index: usize,
    ) -> Result<(), TreeError> {
        if !self.nodes.contains_key(&id) {
            return Err(TreeError::NodeNotFound(id));
        }
        if let Some(parent_id) = new_parent {
            self.check_parent(id, parent_id)?;
        }
        self.unlink(id);
        self.link(id, new_parent, index);
        Ok(())
    }

    /// Remove a node and its whole subtree. Removing an absent node is not
    /// an error and returns `Ok(false)`.
    pub fn remove(&mut self, id: Uuid) -> Result<bool, TreeError> {
        if !self.nodes.contains_key(&id) {
            return Ok(false);
        }
        self.unlink(id);
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children);
            }
            self.parents.remove(&current);
        }
        Ok(true)
    }

    pub fn get(&self, id: Uuid) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Mutable access to a node's attributes. Structure is changed through
    /// [`insert`](Self::insert), [`move_node`](Self::move_node) and
    /// [`remove`](Self::remove).
    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn children(&self, id: Uuid) -> &[Uuid] {
        self.nodes.get(&id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn parent(&self, id: Uuid) -> Option<Uuid> {
        self.parents.get(&id).copied()
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut current = self.parent(id);
        while let Some(p) = current {
            out.push(p);
            current = self.parent(p);
        }
        out
    }

    /// Depth-first search for `target` below (and including) `root`.
    pub fn find_by_id(&self, root: Uuid, target: Uuid) -> Option<&Node> {
        let node = self.nodes.get(&root)?;
        if node.id == target {
            return Some(node);
        }
        node.children.iter().find_map(|child| self.find_by_id(*child, target))
    }

    /// `id` and every node below it, pre-order.
    pub fn descendants(&self, id: Uuid) -> Vec<Uuid> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(&current) {
                out.push(current);
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    pub fn roots(&self) -> &[Uuid] {
        &self.roots
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Copy of `root` and everything below it, with `root` as the only
    /// root.
    pub fn subtree(&self, root: Uuid) -> Result<ObjectTree, TreeError> {
        if !self.contains(root) {
            return Err(TreeError::NodeNotFound(root));
        }
        let mut out = ObjectTree::new();
        // pre-order: every parent is copied before its children
        for id in self.descendants(root) {
            let Some(node) = self.nodes.get(&id) else { continue };
            let parent = if id == root { None } else { self.parent(id) };
            out.insert(parent, node.clone())?;
        }
        Ok(out)
    }

    pub fn set_property(&mut self, id: Uuid, key: &str, value: PropertyValue) -> Result<(), TreeError> {
        self.nodes
            .get_mut(&id)
            .ok_or(TreeError::NodeNotFound(id))?
            .set_property(key, value)
    }

    /// Build a tree from flat document properties.
    ///
    /// Every object id with at least one property becomes a node unless it,
    /// or one of its ancestors, carries `deleted = true`. Siblings are
    /// ordered by `(index, id)`. A `parent` edge that points at a missing
    /// node, a non-container or a descendant is dropped and the node
    /// becomes a root.
    pub fn materialize(state: &DocumentState) -> Self {
        let parent_of: HashMap<Uuid, Uuid> = state
            .objects()
            .filter_map(|(id, props)| {
                let parent = props.get(keys::PARENT)?.value.as_id()?;
                Some((*id, parent))
            })
            .collect();

        let mut removed: HashSet<Uuid> = state
            .objects()
            .filter(|(_, props)| {
                props.get(keys::DELETED).and_then(|e| e.value.as_bool()).unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();
        loop {
            let newly: Vec<Uuid> = parent_of
                .iter()
                .filter(|(child, parent)| removed.contains(parent) && !removed.contains(child))
                .map(|(child, _)| *child)
                .collect();
            if newly.is_empty() {
                break;
            }
            removed.extend(newly);
        }

        let mut order: Vec<(f64, Uuid)> = state
            .objects()
            .filter(|(id, _)| !removed.contains(id))
            .map(|(id, props)| {
                let index = props.get(keys::INDEX).and_then(|e| e.value.as_number()).unwrap_or(0.0);
                (index, *id)
            })
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut tree = ObjectTree::new();
        for (_, id) in &order {
            let Some(props) = state.object(*id) else { continue };
            let kind = props
                .get(keys::KIND)
                .and_then(|e| e.value.as_text())
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let mut node = Node::with_id(*id, kind);
            let mut sorted: Vec<_> = props.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            for (key, entry) in sorted {
                if keys::STRUCTURAL.contains(&key.as_str()) {
                    continue;
                }
                if let Err(e) = node.set_property(key, entry.value.clone()) {
                    warn!("Ignoring property {} on {}: {}", key, id, e);
                }
            }
            node.bounds = node.bounds.clamped();
            tree.nodes.insert(*id, node);
            tree.roots.push(*id);
        }

        for (_, id) in &order {
            let Some(parent) = parent_of.get(id) else { continue };
            if let Err(e) = tree.move_node(*id, Some(*parent), usize::MAX) {
                warn!("Dropping parent edge {} -> {}: {}", id, parent, e);
            }
        }
        tree
    }

    fn check_parent(&self, id: Uuid, parent_id: Uuid) -> Result<(), TreeError> {
        let parent = self.nodes.get(&parent_id).ok_or(TreeError::NodeNotFound(parent_id))?;
        if !parent.kind.is_container() {
            return Err(TreeError::NotAContainer(parent_id));
        }
        if parent_id == id || self.ancestors(parent_id).contains(&id) {
            return Err(TreeError::Cycle { node: id, parent: parent_id });
        }
        Ok(())
    }

    fn link(&mut self, id: Uuid, parent: Option<Uuid>, index: usize) {
        let siblings = match parent {
            Some(p) => match self.nodes.get_mut(&p) {
                Some(node) => &mut node.children,
                None => return,
            },
            None => &mut self.roots,
        };
        let at = index.min(siblings.len());
        siblings.insert(at, id);
        if let Some(p) = parent {
            self.parents.insert(id, p);
        }
    }

    fn unlink(&mut self, id: Uuid) {
        match self.parents.remove(&id) {
            Some(p) => {
                if let Some(parent) = self.nodes.get_mut(&p) {
                    parent.children.retain(|c| *c != id);
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
    }
}
