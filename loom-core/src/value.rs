//! Typed property values.
//!
//! Values travel through bincode (wire, journal, checkpoints), so the enum
//! is self-describing and never relies on `deserialize_any`.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const BLACK: Color = Color { r: 0.0, g: 0.0, b: 0.0, a: 1.0 };
    pub const WHITE: Color = Color { r: 1.0, g: 1.0, b: 1.0, a: 1.0 };

    pub fn rgba(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }
}

impl Default for Color {
    fn default() -> Self {
        Self::BLACK
    }
}

/// One entry of a node's fill list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paint {
    pub color: Color,
    pub opacity: f32,
    pub visible: bool,
}

impl Paint {
    pub fn solid(color: Color) -> Self {
        Self { color, opacity: 1.0, visible: true }
    }
}

/// The value carried by a property edit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Bool(bool),
    Number(f64),
    Text(String),
    Color(Color),
    Id(Uuid),
    Fills(Vec<Paint>),
}

/// Discriminant of a [`PropertyValue`], used for type matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Number,
    Text,
    Color,
    Id,
    Fills,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::Color => "color",
            ValueKind::Id => "id",
            ValueKind::Fills => "fills",
        };
        f.write_str(name)
    }
}

impl PropertyValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            PropertyValue::Bool(_) => ValueKind::Bool,
            PropertyValue::Number(_) => ValueKind::Number,
            PropertyValue::Text(_) => ValueKind::Text,
            PropertyValue::Color(_) => ValueKind::Color,
            PropertyValue::Id(_) => ValueKind::Id,
            PropertyValue::Fills(_) => ValueKind::Fills,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Geometry is stored as `f32`; numbers are narrowed on read.
    pub fn as_f32(&self) -> Option<f32> {
        self.as_number().map(|n| n as f32)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_id(&self) -> Option<Uuid> {
        match self {
            PropertyValue::Id(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_color(&self) -> Option<Color> {
        match self {
            PropertyValue::Color(c) => Some(*c),
            _ => None,
        }
    }

    pub fn as_fills(&self) -> Option<&[Paint]> {
        match self {
            PropertyValue::Fills(f) => Some(f.as_slice()),
            _ => None,
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Number(v)
    }
}

impl From<f32> for PropertyValue {
    fn from(v: f32) -> Self {
        PropertyValue::Number(f64::from(v))
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::Text(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::Text(v)
    }
}

impl From<Uuid> for PropertyValue {
    fn from(v: Uuid) -> Self {
        PropertyValue::Id(v)
    }
}

impl From<Color> for PropertyValue {
    fn from(v: Color) -> Self {
        PropertyValue::Color(v)
    }
}

impl From<Vec<Paint>> for PropertyValue {
    fn from(v: Vec<Paint>) -> Self {
        PropertyValue::Fills(v)
    }
}
