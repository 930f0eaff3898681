//! User interface rendering and input handling.
//!
//! - **renderer**: coalescing render thread with terminal and memory canvases
//! - **keymapper**: keyboard events to editor actions

pub mod keymapper;
pub mod renderer;

pub use keymapper::*;
pub use renderer::*;
