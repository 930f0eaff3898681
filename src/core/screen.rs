//! Sequential screen
//!
//! The in-memory screen shared by the input path, every command output path
//! and the renderer. Running commands can only append characters at the end
//! of the buffer; the user may only edit the trailing modifiable region.
//! All access goes through [`Screen::acquire_lock`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;
use thiserror::Error;

/// Default number of lines kept in the screen buffer
pub const DEFAULT_BUFFER_MAX: usize = 150;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScreenError {
    #[error("extended colour sequence {0} is missing parameters")]
    TruncatedColor(u16),

    #[error("unsupported extended colour mode {0}")]
    UnsupportedColorMode(u16),
}

/// Anything that can repaint the screen.
///
/// `no_wait = true` enqueues a coalesced request and returns immediately;
/// `no_wait = false` blocks until a paint covering the request has finished.
/// Never call the blocking form while holding the screen lock.
pub trait Render: Send + Sync {
    fn render(&self, no_wait: bool);
}

/// The text currently shown by the host widget, which may lag the screen.
pub trait VisibleText: Send + Sync {
    fn visible_text(&self) -> String;
}

/// Color definition
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

impl Color {
    /// Convert to crossterm color
    pub fn to_crossterm(&self) -> crossterm::style::Color {
        match self {
            Color::Default => crossterm::style::Color::Reset,
            Color::Indexed(n) => crossterm::style::Color::AnsiValue(*n),
            Color::Rgb(r, g, b) => crossterm::style::Color::Rgb {
                r: *r,
                g: *g,
                b: *b,
            },
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AttrFlags: u8 {
        const BOLD          = 0b0000_0001;
        const ITALIC        = 0b0000_0010;
        const UNDERLINE     = 0b0000_0100;
        const REVERSE       = 0b0000_1000;
        const STRIKETHROUGH = 0b0001_0000;
    }
}

/// Character attributes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellAttrs {
    pub fg: Color,
    pub bg: Color,
    pub flags: AttrFlags,
}

impl CellAttrs {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// A single attributed character
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScreenChar {
    pub ch: char,
    pub attrs: CellAttrs,
}

impl ScreenChar {
    pub fn plain(ch: char) -> Self {
        Self {
            ch,
            attrs: CellAttrs::default(),
        }
    }
}

/// The shared screen: one buffer behind one lock.
pub struct Screen {
    state: Mutex<ScreenState>,
}

impl Default for Screen {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_MAX)
    }
}

impl Screen {
    pub fn new(nlines_max: usize) -> Self {
        Self {
            state: Mutex::new(ScreenState::new(nlines_max)),
        }
    }

    /// Lock the screen for modification.
    ///
    /// The guard releases the lock on every exit path, including a worker
    /// unwinding after cancellation. A poisoned lock is recovered: the buffer
    /// holds plain characters, so a panicking writer cannot leave it in a
    /// state worse than a half-written line.
    pub fn acquire_lock(&self) -> MutexGuard<'_, ScreenState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the whole buffer text
    pub fn text(&self) -> String {
        self.acquire_lock().text()
    }
}

/// Screen contents. Only reachable through a [`Screen`] lock guard.
pub struct ScreenState {
    buffer: VecDeque<ScreenChar>,
    attrs: CellAttrs,
    /// Cursor position, relative to the start of the buffer
    pub cursor_x: usize,
    /// Where the latest program write ended
    x_drawend: usize,
    /// Chars before this bound must be removed from the painted text
    intact_left_bound: usize,
    /// Chars from this bound on must be repainted; negative after the whole
    /// painted region has been trimmed away
    intact_right_bound: isize,
    nlines: usize,
    nlines_max: usize,
}

impl ScreenState {
    fn new(nlines_max: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            attrs: CellAttrs::default(),
            cursor_x: 0,
            x_drawend: 0,
            intact_left_bound: 0,
            intact_right_bound: 0,
            nlines: 0,
            nlines_max: nlines_max.max(1),
        }
    }

    /// Clear the screen and all positions. Current attributes are kept.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.cursor_x = 0;
        self.x_drawend = 0;
        self.intact_left_bound = 0;
        self.intact_right_bound = 0;
        self.nlines = 0;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn text(&self) -> String {
        self.buffer.iter().map(|c| c.ch).collect()
    }

    pub fn chars(&self) -> impl Iterator<Item = &ScreenChar> {
        self.buffer.iter()
    }

    pub fn current_attrs(&self) -> CellAttrs {
        self.attrs
    }

    pub fn line_count(&self) -> usize {
        self.nlines
    }

    /// Index from which characters are user-editable.
    ///
    /// Either the end of the latest program write or the position after the
    /// last line break written since, whichever is larger.
    pub fn x_modifiable(&self) -> usize {
        let drawend = self.x_drawend.min(self.buffer.len());
        (drawend..self.buffer.len())
            .rev()
            .find(|&idx| self.buffer[idx].ch == '\n')
            .map(|idx| idx + 1)
            .unwrap_or(drawend)
    }

    pub fn modifiable_chars(&self) -> String {
        self.buffer
            .range(self.x_modifiable()..)
            .map(|c| c.ch)
            .collect()
    }

    pub fn set_modifiable_chars(&mut self, s: &str) {
        let range = (self.x_modifiable(), self.buffer.len());
        self.replace_in_range(Some(range), s, false);
    }

    /// Append a character with the current attributes. Output path only.
    pub fn draw(&mut self, ch: char) {
        self.lower_right_bound(self.buffer.len());
        self.buffer.push_back(ScreenChar {
            ch,
            attrs: self.attrs,
        });
        self.x_drawend = self.buffer.len();
        self.cursor_x = self.x_drawend;

        if ch == '\n' {
            self.nlines += 1;
            self.ensure_nlines_max();
        }
    }

    /// Replace the chars in `range` with default-attributed `s`. Input path only.
    ///
    /// `None` means the end of the buffer. With `relative_to_modifiable` the
    /// range is an offset from [`x_modifiable`](Self::x_modifiable). The cursor
    /// ends up right after the inserted text.
    pub fn replace_in_range(
        &mut self,
        range: Option<(usize, usize)>,
        s: &str,
        relative_to_modifiable: bool,
    ) {
        let len = self.buffer.len();
        let (start, end) = match range {
            None => (len, len),
            Some((start, end)) if relative_to_modifiable => {
                let x = self.x_modifiable();
                (start + x, end + x)
            }
            Some(r) => r,
        };
        let start = start.min(len);
        let end = end.clamp(start, len);

        self.lower_right_bound(start);

        let removed_lf = self.buffer.range(start..end).filter(|c| c.ch == '\n').count();
        let mut tail = self.buffer.split_off(end);
        self.buffer.truncate(start);
        self.buffer.extend(s.chars().map(ScreenChar::plain));
        self.buffer.append(&mut tail);

        self.cursor_x = start + s.chars().count();

        self.nlines = self.nlines.saturating_sub(removed_lf);
        let added_lf = s.chars().filter(|&c| c == '\n').count();
        if added_lf > 0 {
            self.nlines += added_lf;
            self.ensure_nlines_max();
        }
    }

    /// Freeze everything typed so far, as if it had been written by a program.
    pub fn close_modifiable(&mut self) {
        self.x_drawend = self.buffer.len();
        self.cursor_x = self.x_drawend;
    }

    pub fn ensure_cursor_in_modifiable_range(&mut self) {
        if self.cursor_x > self.buffer.len() {
            self.cursor_x = self.buffer.len();
        } else if self.cursor_x < self.x_modifiable() {
            self.cursor_x = self.x_modifiable();
        }
    }

    /// Apply SGR parameters to the attributes used by subsequent draws.
    pub fn select_graphic_rendition(&mut self, params: &[u16]) -> Result<(), ScreenError> {
        if params.is_empty() {
            self.attrs.reset();
            return Ok(());
        }

        let mut attrs = self.attrs;
        let mut iter = params.iter().copied();

        while let Some(param) = iter.next() {
            match param {
                0 => attrs.reset(),
                1 => attrs.flags |= AttrFlags::BOLD,
                3 => attrs.flags |= AttrFlags::ITALIC,
                4 => attrs.flags |= AttrFlags::UNDERLINE,
                7 => attrs.flags |= AttrFlags::REVERSE,
                9 => attrs.flags |= AttrFlags::STRIKETHROUGH,

                22 => attrs.flags &= !AttrFlags::BOLD,
                23 => attrs.flags &= !AttrFlags::ITALIC,
                24 => attrs.flags &= !AttrFlags::UNDERLINE,
                27 => attrs.flags &= !AttrFlags::REVERSE,
                29 => attrs.flags &= !AttrFlags::STRIKETHROUGH,

                30..=37 => attrs.fg = Color::Indexed((param - 30) as u8),
                38 => attrs.fg = extended_color(param, &mut iter)?,
                39 => attrs.fg = Color::Default,

                40..=47 => attrs.bg = Color::Indexed((param - 40) as u8),
                48 => attrs.bg = extended_color(param, &mut iter)?,
                49 => attrs.bg = Color::Default,

                90..=97 => attrs.fg = Color::Indexed((param - 90 + 8) as u8),
                100..=107 => attrs.bg = Color::Indexed((param - 100 + 8) as u8),

                _ => {}
            }
        }

        // Only commit a fully parsed sequence
        self.attrs = attrs;
        Ok(())
    }

    /// Painting bounds as `(left_trim, right_bound)`.
    pub fn get_bounds(&self) -> (usize, usize) {
        let rbound = self.intact_right_bound.max(0) as usize;
        let lbound = if rbound > 0 { self.intact_left_bound } else { 0 };
        (lbound, rbound)
    }

    /// Trailing characters that need to be repainted
    pub fn renderable_chars(&self) -> Vec<ScreenChar> {
        let (_, rbound) = self.get_bounds();
        self.buffer.range(rbound.min(self.buffer.len())..).copied().collect()
    }

    /// Mark everything as painted
    pub fn clean(&mut self) {
        self.intact_left_bound = 0;
        self.intact_right_bound = self.buffer.len() as isize;
    }

    fn lower_right_bound(&mut self, idx: usize) {
        if (idx as isize) < self.intact_right_bound {
            self.intact_right_bound = idx as isize;
        }
    }

    /// Drop the oldest lines until at most `nlines_max` remain.
    fn ensure_nlines_max(&mut self) {
        let mut char_count = 0;
        while self.nlines > self.nlines_max {
            while let Some(c) = self.buffer.pop_front() {
                char_count += 1;
                if c.ch == '\n' {
                    break;
                }
            }
            self.nlines -= 1;
        }

        if char_count > 0 {
            self.intact_left_bound += char_count;
            self.intact_right_bound -= char_count as isize;
            self.cursor_x = self.cursor_x.saturating_sub(char_count);
            self.x_drawend = self.x_drawend.saturating_sub(char_count);
        }
    }
}

/// Parse the `5;n` or `2;r;g;b` tail of an SGR 38/48 parameter.
fn extended_color(
    param: u16,
    iter: &mut impl Iterator<Item = u16>,
) -> Result<Color, ScreenError> {
    let mut next = || iter.next().ok_or(ScreenError::TruncatedColor(param));
    match next()? {
        5 => Ok(Color::Indexed(next()?.min(255) as u8)),
        2 => {
            let r = next()?.min(255) as u8;
            let g = next()?.min(255) as u8;
            let b = next()?.min(255) as u8;
            Ok(Color::Rgb(r, g, b))
        }
        mode => Err(ScreenError::UnsupportedColorMode(mode)),
    }
}
