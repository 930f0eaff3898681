//! Session management
//!
//! A session wires one screen, renderer, input buffer and runtime together
//! and applies editor actions coming from the host.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::completer::TabHandlers;
use super::input::{EditRange, InputBuffer, Whence, DEFAULT_COMPLETION_MAX};
use super::intake::{ExecutionIntake, EOF_MARKER};
use super::runtime::{Runtime, RuntimeSettings, DEFAULT_PROMPT};
use super::screen::{Render, Screen, DEFAULT_BUFFER_MAX};
use super::worker::CancelStrategy;
use crate::config::Config;
use crate::ui::keymapper::EditorAction;
use crate::ui::renderer::{Canvas, ScreenRenderer, DEFAULT_RENDER_INTERVAL};

/// Session settings
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub prompt: String,
    pub strategy: CancelStrategy,
    pub buffer_max: usize,
    pub render_interval: Duration,
    pub completion_max: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            strategy: CancelStrategy::default(),
            buffer_max: DEFAULT_BUFFER_MAX,
            render_interval: DEFAULT_RENDER_INTERVAL,
            completion_max: DEFAULT_COMPLETION_MAX,
        }
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            prompt: config.prompt.clone(),
            strategy: config.system.cancel_strategy,
            buffer_max: config.display.buffer_max,
            render_interval: config.display.render_interval(),
            completion_max: config.display.auto_completion_max,
        }
    }
}

/// What the host loop should do after an action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Quit,
}

/// An interactive shell session
pub struct Session {
    screen: Arc<Screen>,
    renderer: Arc<ScreenRenderer>,
    intake: Arc<ExecutionIntake>,
    tab: Arc<TabHandlers>,
    input: InputBuffer,
    runtime: Arc<Runtime>,
}

impl Session {
    pub fn new(options: &SessionOptions, canvas: Box<dyn Canvas>) -> io::Result<Self> {
        let screen = Arc::new(Screen::new(options.buffer_max));
        let renderer = ScreenRenderer::spawn(screen.clone(), canvas, options.render_interval)?;
        let intake = Arc::new(ExecutionIntake::new());
        let tab = Arc::new(TabHandlers::default());

        let input = InputBuffer::new(
            screen.clone(),
            renderer.clone(),
            renderer.clone(),
            intake.clone(),
            tab.clone(),
        )
        .with_prompt(options.prompt.clone())
        .with_completion_max(options.completion_max);

        let runtime = Runtime::new(
            screen.clone(),
            renderer.clone(),
            intake.clone(),
            input.line_ready_hook(),
            tab.clone(),
            RuntimeSettings {
                prompt: options.prompt.clone(),
                strategy: options.strategy,
            },
        );

        Ok(Self {
            screen,
            renderer,
            intake,
            tab,
            input,
            runtime,
        })
    }

    /// Write the banner and the first prompt, then wait for input.
    pub fn start(&self) {
        info!("Session started");
        self.runtime
            .write(&format!("shterm {}\n", env!("CARGO_PKG_VERSION")));
        self.runtime.write_prompt();
        self.runtime.arm();
    }

    pub fn screen(&self) -> &Arc<Screen> {
        &self.screen
    }

    pub fn renderer(&self) -> &Arc<ScreenRenderer> {
        &self.renderer
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn intake(&self) -> &Arc<ExecutionIntake> {
        &self.intake
    }

    pub fn tab_handlers(&self) -> &Arc<TabHandlers> {
        &self.tab
    }

    pub fn input(&mut self) -> &mut InputBuffer {
        &mut self.input
    }

    /// Apply one editor action.
    pub fn apply(&mut self, action: &EditorAction) -> SessionControl {
        match action {
            EditorAction::Insert(text) => self.insert_at_cursor(text),
            EditorAction::Submit => self.insert_at_cursor("\n"),
            EditorAction::Complete => self.insert_at_cursor("\t"),
            EditorAction::Backspace => {
                let cursor = self.sync_cursor();
                if cursor > 0 {
                    self.input.feed(
                        EditRange::Visible {
                            start: cursor - 1,
                            end: cursor,
                        },
                        "",
                    );
                }
            }
            EditorAction::Delete => {
                let cursor = self.sync_cursor();
                self.input.feed(
                    EditRange::Visible {
                        start: cursor,
                        end: cursor + 1,
                    },
                    "",
                );
            }
            EditorAction::MoveLeft => self.input.set_cursor(-1, Whence::Current),
            EditorAction::MoveRight => self.input.set_cursor(1, Whence::Current),
            EditorAction::Home => self.input.set_cursor(0, Whence::Start),
            EditorAction::End => self.input.set_cursor(0, Whence::End),
            EditorAction::DeleteWord => {
                let cursor = self.sync_cursor();
                self.input.delete_word(cursor, cursor);
            }
            EditorAction::ClearLine => self.input.feed(EditRange::Modifiable, ""),
            EditorAction::EndOfInput => self
                .input
                .feed(EditRange::BufferEnd, &EOF_MARKER.to_string()),
            EditorAction::Interrupt => self.interrupt(),
            EditorAction::Paste => {}
            EditorAction::Quit => return SessionControl::Quit,
        }
        SessionControl::Continue
    }

    /// Insert pasted text, possibly spanning several lines.
    pub fn paste(&mut self, text: &str) {
        self.insert_at_cursor(text);
    }

    /// Feed a line as if typed and wait for it to finish running.
    pub fn execute_blocking(&mut self, line: &str, timeout: Duration) -> bool {
        self.input.feed(EditRange::BufferEnd, &format!("{}\n", line));
        self.runtime.wait_idle(timeout)
    }

    /// Cancel whatever runs and stop painting.
    pub fn shutdown(&self, grace: Duration) {
        if let Err(e) = self.runtime.interrupt() {
            warn!("Interrupt on shutdown failed: {}", e);
        }
        if !self.runtime.wait_idle(grace) {
            warn!("Foreground command still running at shutdown");
        }
        self.renderer.shutdown();
        info!("Session closed");
    }

    fn interrupt(&mut self) {
        match self.runtime.interrupt() {
            Ok(true) => {}
            Ok(false) => {
                // Nothing running: abandon the pending line
                self.runtime.write("^C\n");
                self.runtime.write_prompt();
            }
            Err(e) => warn!("Interrupt failed: {}", e),
        }
    }

    fn insert_at_cursor(&mut self, text: &str) {
        let cursor = self.sync_cursor();
        self.input.feed(
            EditRange::Visible {
                start: cursor,
                end: cursor,
            },
            text,
        );
    }

    /// Bring the painted view up to date and return its cursor.
    ///
    /// Edits are captured in painted coordinates, like a widget reporting
    /// a selection.
    fn sync_cursor(&self) -> usize {
        self.renderer.render(false);
        self.renderer.cursor_x()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.renderer.shutdown();
    }
}
