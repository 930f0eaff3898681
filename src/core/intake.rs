//! Execution intake
//!
//! Completed input lines travel from the input buffer to command execution
//! through an [`ExecutionIntake`]. A worker blocked on input waits on the
//! intake; an idle runtime registers a one-shot [`LineReadyHook`] instead.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::worker::{WorkerContext, WorkerError};

/// End-of-input marker
pub const EOF_MARKER: char = '\0';

/// How long a blocked reader sleeps between cancellation checkpoints
const READ_POLL: Duration = Duration::from_millis(20);

type LineReadyCallback = Box<dyn FnOnce() + Send>;

/// Slot for a callback fired once when the next complete line arrives.
#[derive(Clone, Default)]
pub struct LineReadyHook {
    slot: Arc<Mutex<Option<LineReadyCallback>>>,
}

impl LineReadyHook {
    /// Register a callback, replacing any previous one
    pub fn register(&self, callback: impl FnOnce() + Send + 'static) {
        *self.lock() = Some(Box::new(callback));
    }

    /// Remove and return the registered callback
    pub fn take(&self) -> Option<LineReadyCallback> {
        self.lock().take()
    }

    pub fn is_registered(&self) -> bool {
        self.lock().is_some()
    }

    /// Fire the callback, if any; it is cleared before it runs
    pub fn fire(&self) -> bool {
        match self.take() {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<LineReadyCallback>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// One unit read from the intake
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntakeLine {
    /// A line including its trailing `\n`
    Line(String),
    /// End of input
    Eof,
}

/// Queue of completed input handed to command execution
#[derive(Default)]
pub struct ExecutionIntake {
    buffer: Mutex<String>,
    ready: Condvar,
}

impl ExecutionIntake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand a terminator-ended chunk to execution
    pub fn push(&self, text: &str) {
        self.lock().push_str(text);
        self.ready.notify_all();
    }

    /// Whether a complete line or end-of-input is pending
    pub fn has_line(&self) -> bool {
        self.lock().contains(['\n', EOF_MARKER])
    }

    /// Take the next complete line without blocking
    pub fn take_line(&self) -> Option<IntakeLine> {
        take_line(&mut self.lock())
    }

    /// Take everything that is pending
    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.lock())
    }

    /// Block until a line is available, checking for cancellation meanwhile.
    pub fn read_line(&self, ctx: &WorkerContext) -> Result<IntakeLine, WorkerError> {
        loop {
            {
                let mut buffer = self.lock();
                if let Some(line) = take_line(&mut buffer) {
                    return Ok(line);
                }
                let (mut buffer, _) = self
                    .ready
                    .wait_timeout(buffer, READ_POLL)
                    .unwrap_or_else(|p| p.into_inner());
                if let Some(line) = take_line(&mut buffer) {
                    return Ok(line);
                }
            }
            ctx.checkpoint()?;
        }
    }

    fn lock(&self) -> MutexGuard<'_, String> {
        self.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn take_line(buffer: &mut String) -> Option<IntakeLine> {
    let idx = buffer.find(['\n', EOF_MARKER])?;
    let line: String = buffer.drain(..=idx).collect();
    if line.ends_with(EOF_MARKER) {
        // Anything typed before the marker on the same line is discarded
        Some(IntakeLine::Eof)
    } else {
        Some(IntakeLine::Line(line))
    }
}
