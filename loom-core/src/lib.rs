//! # loom-core: shared document model for Loom
//!
//! Everything the synchronization, persistence and layout layers agree on:
//!
//! ```text
//! PropertyEdit ──apply──▸ DocumentState ──materialize──▸ ObjectTree
//!  (object, key, value,     (object → key →               (nodes, children,
//!   client, sequence)        value + sequence)              layout roles)
//!                                                              │
//!                                      ComponentResolver ◂─────┘
//!                                      (template + overrides)
//! ```
//!
//! The document state is a flat map of last-writer-wins registers keyed by
//! `(object id, property key)`; the server-assigned sequence number is the
//! only ordering key. The tree is a derived view rebuilt from that map.

use serde::{Deserialize, Serialize};

pub mod component;
pub mod document;
pub mod edit;
pub mod keys;
pub mod layout;
pub mod tree;
pub mod value;

pub use component::{
    ComponentDefinition, ComponentInstance, ComponentResolver, Parameter, ParameterKind,
    ResolveError, ResolvedInstance,
};
pub use document::{ApplyOutcome, ChangeOrigin, DocumentState, Entry, StateChange};
pub use edit::{now_millis, ClientId, DocumentId, ObjectId, PropertyEdit, PropertyRef};
pub use layout::{
    Anchor, AutoLayout, ChildSizing, Constraints, CrossAlign, FlowDirection, Padding,
    SizingMode,
};
pub use tree::{Node, NodeKind, ObjectTree, TreeError};
pub use value::{Color, Paint, PropertyValue, ValueKind};

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Size {
    pub width: f32,
    pub height: f32,
}

impl Size {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn origin(&self) -> Point {
        Point { x: self.x, y: self.y }
    }

    pub fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    /// Same origin, different extent.
    pub fn with_size(&self, size: Size) -> Self {
        Self { width: size.width, height: size.height, ..*self }
    }

    /// Positional attributes are non-negative in a materialized tree.
    pub fn clamped(&self) -> Self {
        Self {
            x: self.x.max(0.0),
            y: self.y.max(0.0),
            width: self.width.max(0.0),
            height: self.height.max(0.0),
        }
    }
}
