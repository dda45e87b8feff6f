//! Well-known property keys.
//!
//! Layout rules are flattened into one key per field so every field is an
//! independent last-writer-wins register.

use crate::value::ValueKind;

pub const KIND: &str = "kind";
pub const PARENT: &str = "parent";
pub const INDEX: &str = "index";
pub const DELETED: &str = "deleted";
pub const NAME: &str = "name";

pub const X: &str = "x";
pub const Y: &str = "y";
pub const WIDTH: &str = "width";
pub const HEIGHT: &str = "height";

pub const FILLS: &str = "fills";
pub const CONTENT: &str = "content";
pub const COMPONENT: &str = "component";

pub const LAYOUT_MODE: &str = "layout.mode";
pub const LAYOUT_DIRECTION: &str = "layout.direction";
pub const LAYOUT_GAP: &str = "layout.gap";
pub const LAYOUT_PADDING_TOP: &str = "layout.padding.top";
pub const LAYOUT_PADDING_RIGHT: &str = "layout.padding.right";
pub const LAYOUT_PADDING_BOTTOM: &str = "layout.padding.bottom";
pub const LAYOUT_PADDING_LEFT: &str = "layout.padding.left";
pub const LAYOUT_PRIMARY_SIZING: &str = "layout.sizing.primary";
pub const LAYOUT_COUNTER_SIZING: &str = "layout.sizing.counter";
pub const LAYOUT_ALIGN: &str = "layout.align";

pub const CONSTRAINT_HORIZONTAL: &str = "constraint.horizontal";
pub const CONSTRAINT_VERTICAL: &str = "constraint.vertical";

pub const SIZING_HORIZONTAL: &str = "sizing.horizontal";
pub const SIZING_VERTICAL: &str = "sizing.vertical";

/// `param.<name>` on a component template: the parameter's current value.
pub const PARAM_PREFIX: &str = "param.";
/// `options.<name>` on a component template: comma-separated choices,
/// which make `param.<name>` a choice parameter.
pub const OPTIONS_PREFIX: &str = "options.";
/// `bind.<key>` on a template layer: the parameter that supplies `<key>`.
pub const BIND_PREFIX: &str = "bind.";
/// `override.<layer id>.<key>` on a component instance.
pub const OVERRIDE_PREFIX: &str = "override.";

/// Keys that describe tree structure rather than node attributes.
pub const STRUCTURAL: &[&str] = &[KIND, PARENT, INDEX, DELETED];

/// Expected value kind for a well-known key. `None` for free-form keys,
/// which are type-matched against their current value instead.
pub fn expected_kind(key: &str) -> Option<ValueKind> {
    match key {
        KIND | NAME | CONTENT => Some(ValueKind::Text),
        PARENT | COMPONENT => Some(ValueKind::Id),
        DELETED => Some(ValueKind::Bool),
        INDEX | X | Y | WIDTH | HEIGHT => Some(ValueKind::Number),
        FILLS => Some(ValueKind::Fills),
        LAYOUT_GAP | LAYOUT_PADDING_TOP | LAYOUT_PADDING_RIGHT | LAYOUT_PADDING_BOTTOM
        | LAYOUT_PADDING_LEFT => Some(ValueKind::Number),
        LAYOUT_MODE | LAYOUT_DIRECTION | LAYOUT_PRIMARY_SIZING | LAYOUT_COUNTER_SIZING
        | LAYOUT_ALIGN | CONSTRAINT_HORIZONTAL | CONSTRAINT_VERTICAL | SIZING_HORIZONTAL
        | SIZING_VERTICAL => Some(ValueKind::Text),
        k if k.starts_with(BIND_PREFIX) || k.starts_with(OPTIONS_PREFIX) => Some(ValueKind::Text),
        _ => None,
    }
}

/// Component bookkeeping keys: they describe a template or instance, not
/// a property a layer resolves.
pub fn is_component_meta(key: &str) -> bool {
    [PARAM_PREFIX, OPTIONS_PREFIX, BIND_PREFIX, OVERRIDE_PREFIX]
        .iter()
        .any(|prefix| key.starts_with(prefix))
}

/// Whether a change to `key` can move or resize anything.
pub fn affects_layout(key: &str) -> bool {
    matches!(key, KIND | PARENT | INDEX | DELETED | X | Y | WIDTH | HEIGHT)
        || key.starts_with("layout.")
        || key.starts_with("constraint.")
        || key.starts_with("sizing.")
}
