//! Auto-layout flow on top of Taffy flexbox.
//!
//! Children that `Fill` the flow axis get `flex-basis: 0; flex-grow: 1`, so
//! whatever is left after fixed children and gaps is split evenly between
//! them and never goes below zero. Fixed and hug children keep their length
//! and never shrink.

use taffy::prelude::TaffyMaxContent;
use taffy::{
    AlignItems, Dimension, Display, FlexDirection, JustifyContent,
    LengthPercentage, NodeId, Style, TaffyError, TaffyTree,
};
use uuid::Uuid;

use loom_core::{AutoLayout, ChildSizing, CrossAlign, FlowDirection, Rect, Size, SizingMode};

/// One child to be flowed: its id, intrinsic size and sizing modes.
#[derive(Clone, Copy, Debug)]
pub struct FlowItem {
    pub id: Uuid,
    pub size: Size,
    pub sizing: ChildSizing,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowResult {
    /// Container size after hugging; equals the input size on fixed axes.
    pub container: Size,
    /// Child geometry relative to the container, in flow order.
    pub children: Vec<(Uuid, Rect)>,
}

fn dimension(length: f32, hug: bool) -> Dimension {
    if hug {
        Dimension::auto()
    } else {
        Dimension::length(length)
    }
}

fn container_style(rule: &AutoLayout, size: Size) -> Style {
    let (hug_width, hug_height) = match rule.direction {
        FlowDirection::Horizontal => (
            rule.primary_sizing == SizingMode::Hug,
            rule.counter_sizing == SizingMode::Hug,
        ),
        FlowDirection::Vertical => (
            rule.counter_sizing == SizingMode::Hug,
            rule.primary_sizing == SizingMode::Hug,
        ),
    };
    Style {
        display: Display::Flex,
        flex_direction: match rule.direction {
            FlowDirection::Horizontal => FlexDirection::Row,
            FlowDirection::Vertical => FlexDirection::Column,
        },
        gap: taffy::Size {
            width: LengthPercentage::length(rule.gap),
            height: LengthPercentage::length(rule.gap),
        },
        padding: taffy::Rect {
            left: LengthPercentage::length(rule.padding.left),
            right: LengthPercentage::length(rule.padding.right),
            top: LengthPercentage::length(rule.padding.top),
            bottom: LengthPercentage::length(rule.padding.bottom),
        },
        size: taffy::Size {
            width: dimension(size.width, hug_width),
            height: dimension(size.height, hug_height),
        },
        align_items: Some(match rule.align {
            CrossAlign::Start => AlignItems::Start,
            CrossAlign::Center => AlignItems::Center,
            CrossAlign::End => AlignItems::End,
            CrossAlign::Stretch => AlignItems::Stretch,
        }),
        justify_content: Some(JustifyContent::Start),
        ..Style::default()
    }
}

fn child_style(rule: &AutoLayout, item: &FlowItem) -> Style {
    let (primary, counter) = item.sizing.along(rule.direction);
    let (main_len, cross_len) = match rule.direction {
        FlowDirection::Horizontal => (item.size.width, item.size.height),
        FlowDirection::Vertical => (item.size.height, item.size.width),
    };

    let fill_main = primary == SizingMode::Fill;
    let stretch_cross = rule.align == CrossAlign::Stretch || counter == SizingMode::Fill;

    let main = if fill_main { Dimension::auto() } else { Dimension::length(main_len) };
    let cross = if stretch_cross { Dimension::auto() } else { Dimension::length(cross_len) };
    let size = match rule.direction {
        FlowDirection::Horizontal => taffy::Size { width: main, height: cross },
        FlowDirection::Vertical => taffy::Size { width: cross, height: main },
    };

    Style {
        size,
        flex_basis: if fill_main { Dimension::length(0.0) } else { Dimension::auto() },
        flex_grow: if fill_main { 1.0 } else { 0.0 },
        flex_shrink: 0.0,
        align_self: if stretch_cross { Some(AlignItems::Stretch) } else { None },
        ..Style::default()
    }
}

/// Flow `items` inside a container of `size` following `rule`.
///
/// The Taffy tree is scratch space and is cleared first. A container
/// without children produces no child geometry.
pub fn flow(
    taffy: &mut TaffyTree<()>,
    rule: &AutoLayout,
    size: Size,
    items: &[FlowItem],
) -> Result<FlowResult, TaffyError> {
    if items.is_empty() {
        return Ok(FlowResult { container: size, children: Vec::new() });
    }
    taffy.clear();

    let nodes: Vec<NodeId> = items
        .iter()
        .map(|item| taffy.new_leaf(child_style(rule, item)))
        .collect::<Result<_, _>>()?;
    let root = taffy.new_with_children(container_style(rule, size), &nodes)?;
    taffy.compute_layout(root, taffy::Size::MAX_CONTENT)?;

    let root_layout = taffy.layout(root)?;
    let container = Size::new(root_layout.size.width, root_layout.size.height);

    let mut children = Vec::with_capacity(items.len());
    for (item, node) in items.iter().zip(&nodes) {
        let layout = taffy.layout(*node)?;
        children.push((
            item.id,
            Rect::new(
                layout.location.x,
                layout.location.y,
                layout.size.width.max(0.0),
                layout.size.height.max(0.0),
            ),
        ));
    }
    Ok(FlowResult { container, children })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::Padding;

    fn scratch() -> TaffyTree<()> {
        let mut taffy = TaffyTree::new();
        taffy.disable_rounding();
        taffy
    }

    fn fixed(w: f32, h: f32) -> FlowItem {
        FlowItem { id: Uuid::new_v4(), size: Size::new(w, h), sizing: ChildSizing::default() }
    }

    fn fill(h: f32) -> FlowItem {
        FlowItem {
            id: Uuid::new_v4(),
            size: Size::new(0.0, h),
            sizing: ChildSizing::new(SizingMode::Fill, SizingMode::Fixed),
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn test_fixed_fixed_fill() {
        let mut taffy = scratch();
        let rule = AutoLayout::horizontal(10.0);
        let items = [fixed(50.0, 20.0), fixed(50.0, 20.0), fill(20.0)];
        let out = flow(&mut taffy, &rule, Size::new(320.0, 40.0), &items).unwrap();

        let xs: Vec<f32> = out.children.iter().map(|(_, r)| r.x).collect();
        assert!(close(xs[0], 0.0) && close(xs[1], 60.0) && close(xs[2], 120.0), "{xs:?}");
        assert!(close(out.children[2].1.width, 200.0));
    }

    #[test]
    fn test_vertical_is_axis_swap() {
        let mut taffy = scratch();
        let rule = AutoLayout::vertical(10.0);
        let items = [
            fixed(20.0, 50.0),
            fixed(20.0, 50.0),
            FlowItem {
                id: Uuid::new_v4(),
                size: Size::new(20.0, 0.0),
                sizing: ChildSizing::new(SizingMode::Fixed, SizingMode::Fill),
            },
        ];
        let out = flow(&mut taffy, &rule, Size::new(40.0, 320.0), &items).unwrap();

        let ys: Vec<f32> = out.children.iter().map(|(_, r)| r.y).collect();
        assert!(close(ys[0], 0.0) && close(ys[1], 60.0) && close(ys[2], 120.0), "{ys:?}");
        assert!(close(out.children[2].1.height, 200.0));
    }

    #[test]
    fn test_padding_and_stretch() {
        let mut taffy = scratch();
        let rule = AutoLayout::horizontal(0.0)
            .with_padding(Padding::uniform(8.0))
            .with_align(CrossAlign::Stretch);
        let out = flow(&mut taffy, &rule, Size::new(100.0, 60.0), &[fixed(30.0, 10.0)]).unwrap();

        let rect = out.children[0].1;
        assert!(close(rect.x, 8.0) && close(rect.y, 8.0));
        assert!(close(rect.height, 44.0));
        assert!(close(rect.width, 30.0));
    }

    #[test]
    fn test_non_stretch_keeps_cross_size() {
        let mut taffy = scratch();
        let rule = AutoLayout::horizontal(0.0).with_align(CrossAlign::End);
        let out = flow(&mut taffy, &rule, Size::new(100.0, 60.0), &[fixed(30.0, 10.0)]).unwrap();
        let rect = out.children[0].1;
        assert!(close(rect.height, 10.0));
        assert!(close(rect.y, 50.0));
    }

    #[test]
    fn test_overflow_clamps_fill_to_zero() {
        let mut taffy = scratch();
        let rule = AutoLayout::horizontal(10.0);
        let items = [fixed(80.0, 10.0), fill(10.0), fixed(80.0, 10.0)];
        let out = flow(&mut taffy, &rule, Size::new(100.0, 10.0), &items).unwrap();
        assert!(close(out.children[1].1.width, 0.0));
        assert!(close(out.children[0].1.width, 80.0));
    }

    #[test]
    fn test_all_fill_split_evenly() {
        let mut taffy = scratch();
        let rule = AutoLayout::horizontal(0.0);
        let items = [fill(10.0), fill(10.0), fill(10.0), fill(10.0)];
        let out = flow(&mut taffy, &rule, Size::new(200.0, 10.0), &items).unwrap();
        for (_, rect) in &out.children {
            assert!(close(rect.width, 50.0));
        }
    }

    #[test]
    fn test_zero_children() {
        let mut taffy = scratch();
        let out = flow(&mut taffy, &AutoLayout::default(), Size::new(10.0, 10.0), &[]).unwrap();
        assert!(out.children.is_empty());
    }

    #[test]
    fn test_hug_sizes_to_content() {
        let mut taffy = scratch();
        let mut rule = AutoLayout::horizontal(5.0).with_padding(Padding::uniform(2.0));
        rule.primary_sizing = SizingMode::Hug;
        let out = flow(&mut taffy, &rule, Size::new(500.0, 30.0), &[fixed(10.0, 10.0), fixed(20.0, 10.0)])
            .unwrap();
        assert!(close(out.container.width, 39.0));
        assert!(close(out.container.height, 30.0));
    }
}
