//! UI glue for host key decisions
//!
//! Rendering is up to the frontend; this module only holds the prompt queue
//! and turns operator input into decisions.

pub mod decision_surface;

pub use decision_surface::{DecisionSurface, SurfaceState};
