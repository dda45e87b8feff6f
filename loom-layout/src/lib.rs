//! # loom-layout
//!
//! Geometry for the Loom object tree. Two algorithms, both pure functions
//! of the tree and a container size:
//!
//! - **flow**: auto-layout containers place children sequentially along
//!   one axis, splitting leftover space between `Fill` children (Taffy
//!   flexbox underneath).
//! - **constraints**: children of free-form containers follow a parent
//!   resize per axis: leading, trailing, center or scale.
//!
//! [`LayoutEngine`] walks a subtree applying whichever rule each container
//! carries; [`LayoutBridge`] turns document changes into the set of
//! containers to recompute.

pub mod bridge;
pub mod constraints;
pub mod engine;
pub mod flow;

pub use bridge::{FlushResult, LayoutBridge};
pub use constraints::{apply_constraints, resolve_axis};
pub use engine::{apply_geometry, Geometry, LayoutEngine, LayoutError, PreviousSizes};
pub use flow::{FlowItem, FlowResult};
