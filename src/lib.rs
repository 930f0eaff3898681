//! shterm - an embeddable interactive shell terminal
//!
//! Keystrokes and command output share one sequential screen. Typed text
//! is reconciled against whatever commands printed in the meantime, and
//! running commands can be cancelled from the keyboard at any time.
//!
//! ```text
//! keys -> InputBuffer -> Screen <- OutputDecoder <- Worker (Runtime)
//!              |           |
//!              v           v
//!       ExecutionIntake  ScreenRenderer -> Canvas
//! ```

pub mod config;
pub mod core;
pub mod ui;

pub use crate::config::Config;
pub use crate::core::session::{Session, SessionControl, SessionOptions};
