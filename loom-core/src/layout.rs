//! Layout roles a node can carry: an auto-layout rule when it is a flow
//! container, constraints and sizing when it is a child.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} {value:?}")]
pub struct ParseRoleError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseRoleError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ParseRoleError { kind: $label, value: other.to_string() }),
                }
            }
        }
    };
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowDirection {
    #[default]
    Horizontal,
    Vertical,
}

string_enum!(FlowDirection, "direction", {
    Horizontal => "horizontal",
    Vertical => "vertical",
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMode {
    #[default]
    Fixed,
    Fill,
    Hug,
}

string_enum!(SizingMode, "sizing", {
    Fixed => "fixed",
    Fill => "fill",
    Hug => "hug",
});

/// Cross-axis alignment of children in an auto-layout container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CrossAlign {
    #[default]
    Start,
    Center,
    End,
    Stretch,
}

string_enum!(CrossAlign, "alignment", {
    Start => "start",
    Center => "center",
    End => "end",
    Stretch => "stretch",
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Padding {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl Padding {
    pub fn uniform(value: f32) -> Self {
        Self { top: value, right: value, bottom: value, left: value }
    }

    pub fn horizontal(&self) -> f32 {
        self.left + self.right
    }

    pub fn vertical(&self) -> f32 {
        self.top + self.bottom
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoLayout {
    pub direction: FlowDirection,
    pub gap: f32,
    pub padding: Padding,
    /// Container sizing along the flow axis.
    pub primary_sizing: SizingMode,
    /// Container sizing across the flow axis.
    pub counter_sizing: SizingMode,
    pub align: CrossAlign,
}

impl AutoLayout {
    pub fn horizontal(gap: f32) -> Self {
        Self { direction: FlowDirection::Horizontal, gap, ..Self::default() }
    }

    pub fn vertical(gap: f32) -> Self {
        Self { direction: FlowDirection::Vertical, gap, ..Self::default() }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_align(mut self, align: CrossAlign) -> Self {
        self.align = align;
        self
    }
}

/// How a child of a free-form container follows a parent resize on one
/// axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Anchor {
    #[default]
    Leading,
    Trailing,
    Center,
    Scale,
}

string_enum!(Anchor, "constraint", {
    Leading => "leading",
    Trailing => "trailing",
    Center => "center",
    Scale => "scale",
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub horizontal: Anchor,
    pub vertical: Anchor,
}

impl Constraints {
    pub fn new(horizontal: Anchor, vertical: Anchor) -> Self {
        Self { horizontal, vertical }
    }
}

/// Per-axis sizing of a child inside an auto-layout container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSizing {
    pub horizontal: SizingMode,
    pub vertical: SizingMode,
}

impl ChildSizing {
    pub fn new(horizontal: SizingMode, vertical: SizingMode) -> Self {
        Self { horizontal, vertical }
    }

    /// `(flow axis, cross axis)` sizing for a container flowing in
    /// `direction`.
    pub fn along(&self, direction: FlowDirection) -> (SizingMode, SizingMode) {
        match direction {
            FlowDirection::Horizontal => (self.horizontal, self.vertical),
            FlowDirection::Vertical => (self.vertical, self.horizontal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_roundtrip() {
        for anchor in [Anchor::Leading, Anchor::Trailing, Anchor::Center, Anchor::Scale] {
            assert_eq!(anchor.as_str().parse::<Anchor>(), Ok(anchor));
        }
        assert_eq!("stretch".parse::<CrossAlign>(), Ok(CrossAlign::Stretch));
    }

    #[test]
    fn test_unknown_value_is_error() {
        let err = "diagonal".parse::<FlowDirection>().unwrap_err();
        assert_eq!(err.kind, "direction");
        assert_eq!(err.to_string(), "unknown direction \"diagonal\"");
    }

    #[test]
    fn test_sizing_along_axis() {
        let sizing = ChildSizing::new(SizingMode::Fill, SizingMode::Hug);
        assert_eq!(sizing.along(FlowDirection::Horizontal), (SizingMode::Fill, SizingMode::Hug));
        assert_eq!(sizing.along(FlowDirection::Vertical), (SizingMode::Hug, SizingMode::Fill));
    }
}
