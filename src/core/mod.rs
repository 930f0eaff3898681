//! Core shell terminal components.
//!
//! - **screen**: shared sequential screen buffer and its lock
//! - **decoder**: output decoder for program writes (control functions, SGR)
//! - **input**: input buffer reconciling keystrokes with the live screen
//! - **intake**: queue of completed lines waiting for execution
//! - **completer**: tab completion providers
//! - **worker**: cancellable worker threads arranged in a tree
//! - **runtime**: builtin commands, pipelines, foreground line and interrupt
//! - **session**: one screen, renderer, input buffer and runtime wired together
//!
//! # Architecture
//!
//! ```text
//! Session
//! ├── Screen (Mutex<ScreenState>)
//! ├── InputBuffer ── ExecutionIntake ── Runtime
//! │                                      └── Worker
//! │                                          └── Worker (pipeline stage)
//! └── ScreenRenderer
//! ```

pub mod completer;
pub mod decoder;
pub mod input;
pub mod intake;
pub mod runtime;
pub mod screen;
pub mod session;
pub mod worker;
