//! Constraint resolution for children of free-form containers.
//!
//! Each axis is resolved on its own from the child's position and length,
//! the parent's old and new length on that axis, and the axis anchor.

use loom_core::{Anchor, Constraints, Rect, Size};

/// New `(position, length)` on one axis.
pub fn resolve_axis(anchor: Anchor, position: f32, length: f32, old: f32, new: f32) -> (f32, f32) {
    let delta = new - old;
    match anchor {
        Anchor::Leading => (position, length),
        Anchor::Trailing => (position + delta, length),
        // keeps the child's offset from the parent's centre
        Anchor::Center => (position + delta / 2.0, length),
        Anchor::Scale => {
            if old == 0.0 {
                return (position, length);
            }
            let ratio = new / old;
            (position * ratio, length * ratio)
        }
    }
}

/// Child geometry after its parent went from `old` to `new`.
pub fn apply_constraints(child: Rect, constraints: Constraints, old: Size, new: Size) -> Rect {
    let (x, width) = resolve_axis(constraints.horizontal, child.x, child.width, old.width, new.width);
    let (y, height) =
        resolve_axis(constraints.vertical, child.y, child.height, old.height, new.height);
    Rect::new(x, y, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_scenario() {
        assert_eq!(resolve_axis(Anchor::Scale, 10.0, 20.0, 100.0, 200.0), (20.0, 40.0));
    }

    #[test]
    fn test_leading_is_unchanged() {
        assert_eq!(resolve_axis(Anchor::Leading, 10.0, 20.0, 100.0, 250.0), (10.0, 20.0));
    }

    #[test]
    fn test_trailing_keeps_right_margin() {
        let (x, w) = resolve_axis(Anchor::Trailing, 70.0, 20.0, 100.0, 160.0);
        assert_eq!((x, w), (130.0, 20.0));
        // right margin 10 before and after
        assert_eq!(100.0 - (70.0 + 20.0), 160.0 - (x + w));
    }

    #[test]
    fn test_center_stays_centered() {
        // centred child: 40 wide in 100 at x 30
        let (x, w) = resolve_axis(Anchor::Center, 30.0, 40.0, 100.0, 200.0);
        assert_eq!((x, w), (80.0, 40.0));
        assert_eq!(x + w / 2.0, 100.0);
    }

    #[test]
    fn test_scale_from_zero_is_unchanged() {
        assert_eq!(resolve_axis(Anchor::Scale, 5.0, 5.0, 0.0, 300.0), (5.0, 5.0));
    }

    #[test]
    fn test_axes_are_independent() {
        let child = Rect::new(10.0, 10.0, 20.0, 20.0);
        let out = apply_constraints(
            child,
            Constraints::new(Anchor::Scale, Anchor::Trailing),
            Size::new(100.0, 100.0),
            Size::new(200.0, 150.0),
        );
        assert_eq!(out, Rect::new(20.0, 60.0, 40.0, 20.0));
    }
}
