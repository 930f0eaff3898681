//! Screen renderer
//!
//! Paints the shared screen on a dedicated thread. Requests are coalesced:
//! any number of `render(true)` calls between two paints produce one paint,
//! and deferred paints are throttled to one per render interval. A
//! `render(false)` call skips the throttle and waits for its paint.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    execute, queue,
    style::{Attribute, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen, LeaveAlternateScreen},
};
use tracing::{debug, error};
use unicode_width::UnicodeWidthChar;

use crate::core::screen::{AttrFlags, CellAttrs, Color, Render, Screen, ScreenChar, VisibleText};

/// Default throttle between deferred paints
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_millis(100);

/// What a canvas is asked to show
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    pub chars: Vec<ScreenChar>,
    pub cursor_x: usize,
}

impl Frame {
    pub fn text(&self) -> String {
        self.chars.iter().map(|c| c.ch).collect()
    }
}

/// Paint target
pub trait Canvas: Send {
    fn paint(&mut self, frame: &Frame) -> io::Result<()>;
}

#[derive(Default)]
struct RenderControl {
    requested: u64,
    completed: u64,
    /// A blocking request is waiting; skip the throttle
    urgent: bool,
    shutdown: bool,
}

struct RendererShared {
    screen: Arc<Screen>,
    control: Mutex<RenderControl>,
    wake: Condvar,
    done: Condvar,
    /// Text as last painted
    view: Mutex<Frame>,
    interval: Duration,
}

impl RendererShared {
    fn control(&self) -> MutexGuard<'_, RenderControl> {
        self.control.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn view(&self) -> MutexGuard<'_, Frame> {
        self.view.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Wait for the next batch of requests. `None` on shutdown.
    fn next_request(&self, last_paint: Option<Instant>) -> Option<u64> {
        let mut control = self.control();
        while control.requested == control.completed && !control.shutdown {
            control = self.wake.wait(control).unwrap_or_else(|p| p.into_inner());
        }

        if let Some(last) = last_paint {
            let due = last + self.interval;
            loop {
                let now = Instant::now();
                if control.shutdown || control.urgent || now >= due {
                    break;
                }
                control = self
                    .wake
                    .wait_timeout(control, due - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|p| p.into_inner().0);
            }
        }

        if control.shutdown {
            return None;
        }
        control.urgent = false;
        Some(control.requested)
    }

    /// Bring the view up to date with the screen.
    fn refresh_view(&self) -> Frame {
        let (left_trim, right_bound, tail, cursor_x) = {
            let mut screen = self.screen.acquire_lock();
            let (left_trim, right_bound) = screen.get_bounds();
            let tail = screen.renderable_chars();
            let cursor_x = screen.cursor_x;
            screen.clean();
            (left_trim, right_bound, tail, cursor_x)
        };

        let mut view = self.view();
        let trim = left_trim.min(view.chars.len());
        view.chars.drain(..trim);
        view.chars.truncate(right_bound);
        view.chars.extend(tail);
        view.cursor_x = cursor_x;
        view.clone()
    }

    fn finish(&self, target: u64) {
        let mut control = self.control();
        control.completed = control.completed.max(target);
        self.done.notify_all();
    }

    fn run(&self, mut canvas: Box<dyn Canvas>) {
        let mut last_paint = None;
        while let Some(target) = self.next_request(last_paint) {
            let frame = self.refresh_view();
            if let Err(e) = canvas.paint(&frame) {
                error!("Paint failed: {}", e);
            }
            last_paint = Some(Instant::now());
            self.finish(target);
        }

        // Release anyone still waiting on a paint that will never happen
        let mut control = self.control();
        control.completed = control.requested;
        self.done.notify_all();
        debug!("Renderer stopped");
    }
}

/// Renders the shared screen onto a [`Canvas`] from its own thread.
pub struct ScreenRenderer {
    shared: Arc<RendererShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ScreenRenderer {
    pub fn spawn(screen: Arc<Screen>, canvas: Box<dyn Canvas>, interval: Duration) -> io::Result<Arc<Self>> {
        let shared = Arc::new(RendererShared {
            screen,
            control: Mutex::new(RenderControl::default()),
            wake: Condvar::new(),
            done: Condvar::new(),
            view: Mutex::new(Frame::default()),
            interval,
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("renderer".to_string())
            .spawn(move || thread_shared.run(canvas))?;

        Ok(Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }))
    }

    /// Stop the render thread after its current paint.
    pub fn shutdown(&self) {
        {
            let mut control = self.shared.control();
            control.shutdown = true;
            self.shared.wake.notify_all();
        }
        let handle = self.thread.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Renderer thread panicked");
            }
        }
    }

    /// Cursor position as last painted
    pub fn cursor_x(&self) -> usize {
        self.shared.view().cursor_x
    }
}

impl Render for ScreenRenderer {
    fn render(&self, no_wait: bool) {
        let mut control = self.shared.control();
        if control.shutdown {
            return;
        }
        control.requested += 1;
        let target = control.requested;
        if !no_wait {
            control.urgent = true;
        }
        self.shared.wake.notify_all();

        if no_wait {
            return;
        }
        while control.completed < target && !control.shutdown {
            control = self.shared.done.wait(control).unwrap_or_else(|p| p.into_inner());
        }
    }
}

impl VisibleText for ScreenRenderer {
    fn visible_text(&self) -> String {
        self.shared.view().text()
    }
}

impl Drop for ScreenRenderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Keeps the last painted frame in memory. Clones share the same frame.
#[derive(Clone, Default)]
pub struct MemoryCanvas {
    last: Arc<Mutex<Frame>>,
    paints: Arc<Mutex<usize>>,
}

impl MemoryCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> String {
        self.last.lock().unwrap_or_else(|p| p.into_inner()).text()
    }

    pub fn frame(&self) -> Frame {
        self.last.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn paints(&self) -> usize {
        *self.paints.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Canvas for MemoryCanvas {
    fn paint(&mut self, frame: &Frame) -> io::Result<()> {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = frame.clone();
        *self.paints.lock().unwrap_or_else(|p| p.into_inner()) += 1;
        Ok(())
    }
}

/// The part of a frame that fits the window
#[derive(Debug, PartialEq, Eq)]
pub struct Layout {
    pub rows: Vec<Vec<ScreenChar>>,
    /// `(col, row)` of the cursor within `rows`
    pub cursor: (u16, u16),
}

/// Wrap a frame into window rows, keeping the bottom `height` rows.
pub fn layout(frame: &Frame, width: u16, height: u16) -> Layout {
    let width = width.max(1) as usize;
    let height = height.max(1) as usize;

    let mut rows: Vec<Vec<ScreenChar>> = vec![Vec::new()];
    let mut col = 0usize;
    let mut cursor = None;

    for (idx, c) in frame.chars.iter().enumerate() {
        if idx == frame.cursor_x {
            cursor = Some((col, rows.len() - 1));
        }
        if c.ch == '\n' {
            rows.push(Vec::new());
            col = 0;
            continue;
        }
        let w = c.ch.width().unwrap_or(0);
        if col + w > width {
            rows.push(Vec::new());
            col = 0;
            if idx == frame.cursor_x {
                cursor = Some((0, rows.len() - 1));
            }
        }
        if let Some(row) = rows.last_mut() {
            row.push(*c);
        }
        col += w;
    }

    let (cursor_col, cursor_row) = cursor.unwrap_or_else(|| {
        if col >= width {
            rows.push(Vec::new());
            (0, rows.len() - 1)
        } else {
            (col, rows.len() - 1)
        }
    });

    let first = rows.len().saturating_sub(height);
    let rows = rows.split_off(first);
    Layout {
        rows,
        cursor: (cursor_col as u16, cursor_row.saturating_sub(first) as u16),
    }
}

/// Paints into the controlling terminal (alternate screen, raw mode).
pub struct TerminalCanvas {
    initialized: bool,
}

impl TerminalCanvas {
    pub fn new() -> io::Result<Self> {
        let mut canvas = Self { initialized: false };
        canvas.init()?;
        Ok(canvas)
    }

    fn init(&mut self) -> io::Result<()> {
        terminal::enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, DisableLineWrap, Clear(ClearType::All), MoveTo(0, 0))?;
        self.initialized = true;
        Ok(())
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;

        let mut stdout = io::stdout();
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset), Show, EnableLineWrap);
        let _ = execute!(stdout, LeaveAlternateScreen);
        let _ = stdout.flush();
        terminal::disable_raw_mode()?;
        Ok(())
    }

    fn apply_attrs<W: Write>(out: &mut W, attrs: &CellAttrs) -> io::Result<()> {
        queue!(out, SetAttribute(Attribute::Reset))?;

        if attrs.flags.contains(AttrFlags::BOLD) {
            queue!(out, SetAttribute(Attribute::Bold))?;
        }
        if attrs.flags.contains(AttrFlags::ITALIC) {
            queue!(out, SetAttribute(Attribute::Italic))?;
        }
        if attrs.flags.contains(AttrFlags::UNDERLINE) {
            queue!(out, SetAttribute(Attribute::Underlined))?;
        }
        if attrs.flags.contains(AttrFlags::REVERSE) {
            queue!(out, SetAttribute(Attribute::Reverse))?;
        }
        if attrs.flags.contains(AttrFlags::STRIKETHROUGH) {
            queue!(out, SetAttribute(Attribute::CrossedOut))?;
        }

        if attrs.fg != Color::Default {
            queue!(out, SetForegroundColor(attrs.fg.to_crossterm()))?;
        }
        if attrs.bg != Color::Default {
            queue!(out, SetBackgroundColor(attrs.bg.to_crossterm()))?;
        }
        Ok(())
    }
}

impl Canvas for TerminalCanvas {
    fn paint(&mut self, frame: &Frame) -> io::Result<()> {
        let (cols, rows) = terminal::size()?;
        let layout = layout(frame, cols, rows);

        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());

        // Synchronized update
        write!(out, "\x1b[?2026h")?;
        queue!(out, Hide)?;

        for (row_idx, row) in layout.rows.iter().enumerate() {
            queue!(out, MoveTo(0, row_idx as u16), Clear(ClearType::CurrentLine))?;

            let mut run = String::new();
            let mut run_attrs = CellAttrs::default();
            for c in row {
                if c.attrs != run_attrs && !run.is_empty() {
                    Self::apply_attrs(&mut out, &run_attrs)?;
                    queue!(out, Print(&run))?;
                    run.clear();
                }
                run_attrs = c.attrs;
                run.push(c.ch);
            }
            if !run.is_empty() {
                Self::apply_attrs(&mut out, &run_attrs)?;
                queue!(out, Print(&run))?;
            }
            queue!(out, ResetColor, SetAttribute(Attribute::Reset))?;
        }

        if (layout.rows.len() as u16) < rows {
            queue!(out, MoveTo(0, layout.rows.len() as u16), Clear(ClearType::FromCursorDown))?;
        }

        let (col, row) = layout.cursor;
        queue!(out, MoveTo(col, row), Show)?;
        write!(out, "\x1b[?2026l")?;
        out.flush()
    }
}

impl Drop for TerminalCanvas {
    fn drop(&mut self) {
        let _ = self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decoder::OutputDecoder;

    fn frame(text: &str, cursor_x: usize) -> Frame {
        Frame {
            chars: text.chars().map(ScreenChar::plain).collect(),
            cursor_x,
        }
    }

    fn row_text(row: &[ScreenChar]) -> String {
        row.iter().map(|c| c.ch).collect()
    }

    #[test]
    fn test_layout_wraps_and_keeps_bottom_rows() {
        let l = layout(&frame("abcdef\ngh", 9), 4, 2);
        let rows: Vec<String> = l.rows.iter().map(|r| row_text(r)).collect();
        assert_eq!(rows, vec!["ef", "gh"]);
        assert_eq!(l.cursor, (2, 1));
    }

    #[test]
    fn test_layout_cursor_inside_text() {
        let l = layout(&frame("$ hello", 3), 80, 24);
        assert_eq!(l.cursor, (3, 0));
    }

    #[test]
    fn test_layout_wide_chars() {
        let l = layout(&frame("日本語", 3), 4, 5);
        let rows: Vec<String> = l.rows.iter().map(|r| row_text(r)).collect();
        assert_eq!(rows, vec!["日本", "語"]);
        assert_eq!(l.cursor, (2, 1));
    }

    #[test]
    fn test_layout_cursor_after_full_row() {
        let l = layout(&frame("abcd", 4), 4, 5);
        assert_eq!(l.rows.len(), 2);
        assert_eq!(l.cursor, (0, 1));
    }

    fn wait_for(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_blocking_render_paints_current_screen() {
        let screen = Arc::new(Screen::new(10));
        let canvas = MemoryCanvas::new();
        let renderer =
            ScreenRenderer::spawn(screen.clone(), Box::new(canvas.clone()), Duration::from_secs(60)).unwrap();

        let mut decoder = OutputDecoder::new(screen.clone(), renderer.clone());
        decoder.feed("hello\n");
        renderer.render(false);
        assert_eq!(canvas.text(), "hello\n");
        assert_eq!(renderer.visible_text(), "hello\n");

        // The throttle is skipped for blocking requests
        screen.acquire_lock().replace_in_range(None, "ab", false);
        renderer.render(false);
        assert_eq!(canvas.text(), "hello\nab");
        assert_eq!(renderer.cursor_x(), 8);
    }

    #[test]
    fn test_deferred_requests_coalesce() {
        let screen = Arc::new(Screen::new(10));
        let canvas = MemoryCanvas::new();
        let renderer =
            ScreenRenderer::spawn(screen.clone(), Box::new(canvas.clone()), Duration::from_millis(200)).unwrap();

        renderer.render(false);
        let base = canvas.paints();
        for ch in "abc".chars() {
            screen.acquire_lock().draw(ch);
            renderer.render(true);
        }

        assert!(wait_for(|| canvas.text() == "abc"));
        assert_eq!(canvas.paints(), base + 1);
    }

    #[test]
    fn test_view_follows_trimmed_lines() {
        let screen = Arc::new(Screen::new(2));
        let canvas = MemoryCanvas::new();
        let renderer = ScreenRenderer::spawn(screen.clone(), Box::new(canvas.clone()), Duration::ZERO).unwrap();

        let mut decoder = OutputDecoder::new(screen.clone(), renderer.clone());
        decoder.feed_with("one\ntwo\n", crate::core::decoder::RenderMode::Blocking);
        decoder.feed_with("three\n", crate::core::decoder::RenderMode::Blocking);

        assert_eq!(renderer.visible_text(), "two\nthree\n");
        assert_eq!(renderer.visible_text(), screen.text());
    }

    #[test]
    fn test_shutdown_releases_waiters() {
        let screen = Arc::new(Screen::new(10));
        let renderer =
            ScreenRenderer::spawn(screen, Box::new(MemoryCanvas::new()), Duration::from_millis(10)).unwrap();
        renderer.shutdown();
        // Returns immediately once stopped
        renderer.render(false);
    }
}
