use log::trace;
use rustc_hash::FxHashMap;
use taffy::{TaffyError, TaffyTree};
use thiserror::Error;
use uuid::Uuid;

use loom_core::{Node, ObjectTree, Rect, Size, SizingMode};

use crate::constraints::apply_constraints;
use crate::flow::{flow, FlowItem};

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("Taffy error: {0}")]
    Taffy(#[from] TaffyError),
    #[error("Node not found: {0}")]
    NodeNotFound(Uuid),
}

/// Computed geometry, parent-relative, keyed by node id.
pub type Geometry = FxHashMap<Uuid, Rect>;

/// Sizes nodes had before an in-place resize.
pub type PreviousSizes = FxHashMap<Uuid, Size>;

/// Derives node geometry from layout rules.
///
/// Auto-layout containers flow their children through Taffy; any other
/// container moves and resizes its children by their constraints. The
/// engine never mutates the tree it reads; callers write results back with
/// [`apply_geometry`].
pub struct LayoutEngine {
    /// Scratch Taffy tree, cleared before every flow pass
    taffy: TaffyTree<()>,

    /// Number of containers arranged over the engine's lifetime
    arranged: u64,
}

impl Default for LayoutEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutEngine {
    pub fn new() -> Self {
        let mut taffy = TaffyTree::new();
        taffy.disable_rounding();
        Self { taffy, arranged: 0 }
    }

    /// Resize `container` to `new_size` and recompute its subtree.
    ///
    /// The result holds the container's own new rect plus every descendant
    /// that was laid out. A hugging auto-layout container ignores
    /// `new_size` on its hug axes.
    pub fn resize(
        &mut self,
        tree: &ObjectTree,
        container: Uuid,
        new_size: Size,
    ) -> Result<Geometry, LayoutError> {
        let node = tree.get(container).ok_or(LayoutError::NodeNotFound(container))?;
        let mut geometry = Geometry::default();
        let none = PreviousSizes::default();
        let size = self.arrange(tree, node, node.bounds.size(), new_size, &none, &mut geometry)?;
        geometry.insert(container, node.bounds.with_size(size));
        Ok(geometry)
    }

    /// Recompute the subtree below `root` at its current size.
    pub fn layout(&mut self, tree: &ObjectTree, root: Uuid) -> Result<Geometry, LayoutError> {
        self.relayout(tree, root, &PreviousSizes::default())
    }

    /// Recompute the subtree below `root` after some of its nodes were
    /// resized in place.
    ///
    /// `tree` already holds the new sizes; `previous` holds the sizes those
    /// nodes had before, so constrained children follow the change. Nodes
    /// missing from `previous` are treated as unchanged.
    pub fn relayout(
        &mut self,
        tree: &ObjectTree,
        root: Uuid,
        previous: &PreviousSizes,
    ) -> Result<Geometry, LayoutError> {
        let node = tree.get(root).ok_or(LayoutError::NodeNotFound(root))?;
        let mut geometry = Geometry::default();
        let size = node.bounds.size();
        let old = previous.get(&root).copied().unwrap_or(size);
        let settled = self.arrange(tree, node, old, size, previous, &mut geometry)?;
        if settled != size {
            geometry.insert(root, node.bounds.with_size(settled));
        }
        Ok(geometry)
    }

    pub fn arranged_count(&self) -> u64 {
        self.arranged
    }

    /// Lay out the children of `node`, which went from `old` to `new`.
    /// Returns the node's final size.
    fn arrange(
        &mut self,
        tree: &ObjectTree,
        node: &Node,
        old: Size,
        new: Size,
        previous: &PreviousSizes,
        geometry: &mut Geometry,
    ) -> Result<Size, LayoutError> {
        let children: Vec<&Node> = tree.children(node.id).iter().filter_map(|c| tree.get(*c)).collect();
        self.arranged += 1;
        let before = |child: &Node| previous.get(&child.id).copied().unwrap_or(child.bounds.size());

        let Some(rule) = node.auto_layout else {
            for child in children {
                let rect = apply_constraints(child.bounds, child.constraints, old, new);
                trace!("Constraint {} -> {:?}", child.id, rect);
                geometry.insert(child.id, rect);
                self.arrange(tree, child, before(child), rect.size(), previous, geometry)?;
            }
            return Ok(new);
        };

        let items = children
            .iter()
            .map(|child| {
                Ok(FlowItem { id: child.id, size: self.measure(tree, child)?, sizing: child.sizing })
            })
            .collect::<Result<Vec<_>, LayoutError>>()?;
        let result = flow(&mut self.taffy, &rule, new, &items)?;

        for (child, (id, rect)) in children.iter().zip(result.children) {
            trace!("Flow {} -> {:?}", id, rect);
            geometry.insert(id, rect);
            self.arrange(tree, child, before(child), rect.size(), previous, geometry)?;
        }
        Ok(result.container)
    }

    /// Size a node contributes to its parent's flow: its content size on
    /// hug axes, its own size otherwise.
    fn measure(&mut self, tree: &ObjectTree, node: &Node) -> Result<Size, LayoutError> {
        let Some(rule) = node.auto_layout else {
            return Ok(node.bounds.size());
        };
        if rule.primary_sizing != SizingMode::Hug && rule.counter_sizing != SizingMode::Hug {
            return Ok(node.bounds.size());
        }
        let items = tree
            .children(node.id)
            .iter()
            .filter_map(|c| tree.get(*c))
            .map(|child| {
                Ok(FlowItem { id: child.id, size: self.measure(tree, child)?, sizing: child.sizing })
            })
            .collect::<Result<Vec<_>, LayoutError>>()?;
        Ok(flow(&mut self.taffy, &rule, node.bounds.size(), &items)?.container)
    }
}

/// Write computed geometry back into the tree. Unknown ids are skipped.
pub fn apply_geometry(tree: &mut ObjectTree, geometry: &Geometry) -> usize {
    let mut applied = 0;
    for (id, rect) in geometry {
        if let Some(node) = tree.get_mut(*id) {
            node.bounds = rect.clamped();
            applied += 1;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::{Anchor, AutoLayout, ChildSizing, Constraints, NodeKind};

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn test_resize_scales_constrained_child() {
        let mut tree = ObjectTree::new();
        let parent = tree
            .insert(None, Node::new(NodeKind::Container).with_bounds(Rect::new(0.0, 0.0, 100.0, 100.0)))
            .unwrap();
        let child = tree
            .insert(
                Some(parent),
                Node::new(NodeKind::Shape)
                    .with_bounds(Rect::new(10.0, 10.0, 20.0, 20.0))
                    .with_constraints(Constraints::new(Anchor::Scale, Anchor::Leading)),
            )
            .unwrap();

        let mut engine = LayoutEngine::new();
        let geometry = engine.resize(&tree, parent, Size::new(200.0, 100.0)).unwrap();
        assert_eq!(geometry[&child], Rect::new(20.0, 10.0, 40.0, 20.0));
        assert_eq!(geometry[&parent], Rect::new(0.0, 0.0, 200.0, 100.0));
    }

    #[test]
    fn test_resize_reflows_auto_layout() {
        let mut tree = ObjectTree::new();
        let row = tree
            .insert(
                None,
                Node::new(NodeKind::Container)
                    .with_bounds(Rect::new(0.0, 0.0, 220.0, 40.0))
                    .with_auto_layout(AutoLayout::horizontal(10.0)),
            )
            .unwrap();
        let a = tree
            .insert(Some(row), Node::new(NodeKind::Shape).with_bounds(Rect::new(0.0, 0.0, 50.0, 40.0)))
            .unwrap();
        let b = tree
            .insert(Some(row), Node::new(NodeKind::Shape).with_bounds(Rect::new(0.0, 0.0, 50.0, 40.0)))
            .unwrap();
        let flex = tree
            .insert(
                Some(row),
                Node::new(NodeKind::Shape)
                    .with_bounds(Rect::new(0.0, 0.0, 0.0, 40.0))
                    .with_sizing(ChildSizing::new(SizingMode::Fill, SizingMode::Fixed)),
            )
            .unwrap();

        let mut engine = LayoutEngine::new();
        let geometry = engine.resize(&tree, row, Size::new(320.0, 40.0)).unwrap();
        assert!(close(geometry[&a].x, 0.0));
        assert!(close(geometry[&b].x, 60.0));
        assert!(close(geometry[&flex].x, 120.0));
        assert!(close(geometry[&flex].width, 200.0));
    }

    #[test]
    fn test_nested_containers_follow_parent() {
        let mut tree = ObjectTree::new();
        let outer = tree
            .insert(None, Node::new(NodeKind::Container).with_bounds(Rect::new(0.0, 0.0, 100.0, 100.0)))
            .unwrap();
        let inner = tree
            .insert(
                Some(outer),
                Node::new(NodeKind::Container)
                    .with_bounds(Rect::new(0.0, 0.0, 100.0, 100.0))
                    .with_constraints(Constraints::new(Anchor::Scale, Anchor::Scale)),
            )
            .unwrap();
        let leaf = tree
            .insert(
                Some(inner),
                Node::new(NodeKind::Shape)
                    .with_bounds(Rect::new(80.0, 80.0, 10.0, 10.0))
                    .with_constraints(Constraints::new(Anchor::Trailing, Anchor::Trailing)),
            )
            .unwrap();

        let mut engine = LayoutEngine::new();
        let geometry = engine.resize(&tree, outer, Size::new(200.0, 150.0)).unwrap();
        assert_eq!(geometry[&inner], Rect::new(0.0, 0.0, 200.0, 150.0));
        assert_eq!(geometry[&leaf], Rect::new(180.0, 130.0, 10.0, 10.0));
    }

    #[test]
    fn test_hug_child_is_measured() {
        let mut tree = ObjectTree::new();
        let column = tree
            .insert(
                None,
                Node::new(NodeKind::Container)
                    .with_bounds(Rect::new(0.0, 0.0, 100.0, 300.0))
                    .with_auto_layout(AutoLayout::vertical(0.0)),
            )
            .unwrap();
        let mut hug_rule = AutoLayout::horizontal(0.0);
        hug_rule.primary_sizing = SizingMode::Hug;
        let chip = tree
            .insert(
                Some(column),
                Node::new(NodeKind::Container)
                    .with_bounds(Rect::new(0.0, 0.0, 999.0, 20.0))
                    .with_auto_layout(hug_rule),
            )
            .unwrap();
        tree.insert(Some(chip), Node::new(NodeKind::Shape).with_bounds(Rect::new(0.0, 0.0, 30.0, 20.0)))
            .unwrap();

        let mut engine = LayoutEngine::new();
        let geometry = engine.layout(&tree, column).unwrap();
        assert!(close(geometry[&chip].width, 30.0));
    }

    #[test]
    fn test_empty_container_has_no_changes() {
        let mut tree = ObjectTree::new();
        let row = tree
            .insert(
                None,
                Node::new(NodeKind::Container)
                    .with_bounds(Rect::new(0.0, 0.0, 100.0, 40.0))
                    .with_auto_layout(AutoLayout::horizontal(4.0)),
            )
            .unwrap();
        let mut engine = LayoutEngine::new();
        assert!(engine.layout(&tree, row).unwrap().is_empty());
    }

    #[test]
    fn test_missing_node_errors() {
        let tree = ObjectTree::new();
        let mut engine = LayoutEngine::new();
        assert!(matches!(
            engine.layout(&tree, Uuid::new_v4()),
            Err(LayoutError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_apply_geometry_writes_back() {
        let mut tree = ObjectTree::new();
        let id = tree.insert(None, Node::new(NodeKind::Shape)).unwrap();
        let mut geometry = Geometry::default();
        geometry.insert(id, Rect::new(1.0, 2.0, 3.0, 4.0));
        geometry.insert(Uuid::new_v4(), Rect::default());

        assert_eq!(apply_geometry(&mut tree, &geometry), 1);
        assert_eq!(tree.get(id).unwrap().bounds, Rect::new(1.0, 2.0, 3.0, 4.0));
    }
}
