//! Input buffer
//!
//! Reconciles edit events coming from the host widget with the shared
//! screen. The buffer keeps its own copy of the pending input line; the
//! screen may have moved on (a command printed something) between the moment
//! an edit was captured and the moment it is applied, so every edit first
//! resynchronises with the live screen under the screen lock.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use super::completer::{Completion, CompletionError, TabHandlers};
use super::decoder::OutputDecoder;
use super::intake::{ExecutionIntake, LineReadyHook, EOF_MARKER};
use super::screen::{Render, Screen, ScreenState, VisibleText};

/// Default cap on listed completion candidates
pub const DEFAULT_COMPLETION_MAX: usize = 50;

/// Range an edit applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditRange {
    /// The whole modifiable region
    Modifiable,
    /// An empty range at the end of the buffer
    BufferEnd,
    /// `start..end` in coordinates of the visible text, which may be stale
    Visible { start: usize, end: usize },
}

/// Reference point for [`InputBuffer::set_cursor`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Keystroke-side owner of the pending input line
pub struct InputBuffer {
    /// Pending input; everything through the last terminator is handed off
    line: Vec<char>,
    screen: Arc<Screen>,
    renderer: Arc<dyn Render>,
    view: Arc<dyn VisibleText>,
    intake: Arc<ExecutionIntake>,
    /// Writes inline messages (completion listings, errors)
    decoder: OutputDecoder,
    tab: Arc<TabHandlers>,
    hook: LineReadyHook,
    prompt: String,
    completion_max: usize,
}

impl InputBuffer {
    pub fn new(
        screen: Arc<Screen>,
        renderer: Arc<dyn Render>,
        view: Arc<dyn VisibleText>,
        intake: Arc<ExecutionIntake>,
        tab: Arc<TabHandlers>,
    ) -> Self {
        let decoder = OutputDecoder::new(screen.clone(), renderer.clone());
        Self {
            line: Vec::new(),
            screen,
            renderer,
            view,
            intake,
            decoder,
            tab,
            hook: LineReadyHook::default(),
            prompt: String::new(),
            completion_max: DEFAULT_COMPLETION_MAX,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_completion_max(mut self, max: usize) -> Self {
        self.completion_max = max.max(1);
        self
    }

    pub fn with_hook(mut self, hook: LineReadyHook) -> Self {
        self.hook = hook;
        self
    }

    /// Shared handle to the "next line ready" slot
    pub fn line_ready_hook(&self) -> LineReadyHook {
        self.hook.clone()
    }

    /// Register the one-shot callback fired when the next line is handed off
    pub fn config_runtime_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.hook.register(callback);
    }

    /// Pending input, terminators included
    pub fn pending(&self) -> String {
        self.line.iter().collect()
    }

    pub fn modifiable_chars(&self) -> String {
        self.line[self.x_modifiable()..].iter().collect()
    }

    /// Replace `range` with `replacement`.
    pub fn feed(&mut self, range: EditRange, replacement: &str) {
        let visible = match range {
            EditRange::Visible { .. } => Some(self.view.visible_text()),
            _ => None,
        };

        let start = {
            let screen = Arc::clone(&self.screen);
            let mut screen = screen.acquire_lock();
            self.ensure_screen_consistency(&screen);

            let (start, end) = self.adjust_range(range, visible.as_deref());
            if start != end {
                debug!(start, end, "deleting input range");
                self.line.drain(start..end);
                let x = self.x_modifiable();
                screen.replace_in_range(Some((start - x, end - x)), "", true);
            }
            start
        };

        match replacement {
            "" => self.renderer.render(true),
            "\t" => self.complete(start),
            text => self.insert_lines(start, text),
        }
    }

    /// Move the cursor within the modifiable region.
    pub fn set_cursor(&mut self, offset: isize, whence: Whence) {
        {
            let screen = Arc::clone(&self.screen);
            let mut screen = screen.acquire_lock();
            self.ensure_screen_consistency(&screen);
            self.place_cursor(&mut screen, offset, whence);
        }
        self.renderer.render(true);
    }

    /// Delete the word before an empty visible range.
    ///
    /// Trailing whitespace before the edit point goes first, then the run
    /// of non-whitespace before it. Text after the edit point is kept.
    pub fn delete_word(&mut self, start: usize, end: usize) {
        if start != end {
            return;
        }
        let visible = self.view.visible_text();

        {
            let screen = Arc::clone(&self.screen);
            let mut screen = screen.acquire_lock();
            self.ensure_screen_consistency(&screen);

            let x = self.x_modifiable();
            if self.line.len() == x {
                return;
            }

            let (at, _) = self.adjust_range(EditRange::Visible { start, end }, Some(&visible));
            let before = &self.line[x..at];
            let kept = trim_last_word(before);
            let removed = before.len() - kept;
            if removed == 0 {
                return;
            }

            self.line.drain(x + kept..at);
            screen.set_modifiable_chars(&self.modifiable_chars());
            self.place_cursor(&mut screen, kept as isize, Whence::Start);
        }
        self.renderer.render(true);
    }

    /// Index after the last terminator in the pending line
    fn x_modifiable(&self) -> usize {
        self.line
            .iter()
            .rposition(|&c| is_terminator(c))
            .map_or(0, |idx| idx + 1)
    }

    fn set_modifiable(&mut self, chars: &str) {
        let x = self.x_modifiable();
        self.line.truncate(x);
        self.line.extend(chars.chars());
    }

    /// Adopt the screen's modifiable chars when they differ from ours.
    ///
    /// Output appended since the last edit moves the screen's modifiable
    /// region; the live screen wins over the cached copy.
    fn ensure_screen_consistency(&mut self, screen: &ScreenState) {
        let live = screen.modifiable_chars();
        let cached = self.modifiable_chars();
        if live != cached {
            debug!(%cached, %live, "input cache out of sync with screen");
            self.set_modifiable(&live);
        }
    }

    /// Convert `range` into pending-line coordinates.
    fn adjust_range(&self, range: EditRange, visible: Option<&str>) -> (usize, usize) {
        let length = self.line.len();
        let x = self.x_modifiable();

        let (start, end, visible) = match (range, visible) {
            (EditRange::Modifiable, _) => return (x, length),
            (EditRange::Visible { start, end }, Some(visible)) => (start, end.max(start), visible),
            _ => return (length, length),
        };

        let modifiable = &self.line[x..];
        let visible_len = visible.chars().count();
        if !modifiable.is_empty() {
            let tail_start = visible_len.saturating_sub(modifiable.len());
            let stale = visible_len < modifiable.len()
                || !visible.chars().skip(tail_start).eq(modifiable.iter().copied());
            if stale {
                warn!("stale edit range {start}..{end}, inserting at end");
                return (length, length);
            }
        }

        let from_end = visible_len as isize - start as isize;
        let adjusted = length as isize - from_end;
        if adjusted < x as isize || adjusted > length as isize {
            debug!(start, end, "edit outside modifiable region, inserting at end");
            return (length, length);
        }
        let adjusted = adjusted as usize;
        (adjusted, (adjusted + (end - start)).min(length))
    }

    fn place_cursor(&self, screen: &mut ScreenState, offset: isize, whence: Whence) {
        let base = screen.x_modifiable() as isize;
        let target = match whence {
            Whence::Start => base + offset,
            Whence::Current => screen.cursor_x as isize + offset,
            Whence::End => base + (self.line.len() - self.x_modifiable()) as isize + offset,
        };
        screen.cursor_x = target.max(0) as usize;
        screen.ensure_cursor_in_modifiable_range();
    }

    fn complete(&mut self, at: usize) {
        let Some(provider) = self.tab.active() else {
            debug!("no completion handler active");
            return;
        };

        let x = self.x_modifiable();
        let before = self.modifiable_chars();
        let incomplete: String = self.line[x..at].iter().collect();
        let incomplete_len = at - x;

        // No screen lock is held while the provider runs
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| provider.complete(&incomplete)))
            .unwrap_or_else(|payload| Err(CompletionError::Panicked(panic_message(payload.as_ref()))));

        {
            let screen = Arc::clone(&self.screen);
            let mut screen = screen.acquire_lock();
            self.ensure_screen_consistency(&screen);

            if self.modifiable_chars() != before {
                debug!("input changed while completing, result dropped");
                screen.ensure_cursor_in_modifiable_range();
            } else {
                match outcome {
                    Ok(Completion { completed, .. }) if completed != incomplete => {
                        let rest: String = self.line[at..].iter().collect();
                        let completed_len = completed.chars().count();
                        self.set_modifiable(&format!("{}{}", completed, rest));
                        screen.set_modifiable_chars(&self.modifiable_chars());
                        screen.cursor_x = screen.x_modifiable() + completed_len;
                    }
                    Ok(Completion { candidates, .. }) if !candidates.is_empty() => {
                        let mut listing = candidates
                            .iter()
                            .take(self.completion_max)
                            .map(String::as_str)
                            .collect::<Vec<_>>()
                            .join("  ");
                        if candidates.len() > self.completion_max {
                            listing.push_str(&format!("  ... ({} more)", candidates.len() - self.completion_max));
                        }
                        self.print_inline(&mut screen, &listing);
                        self.restore_after_inline(&mut screen, incomplete_len);
                    }
                    Ok(_) => self.restore_after_inline(&mut screen, incomplete_len),
                    Err(e) => {
                        warn!("completion failed: {}", e);
                        self.print_inline(&mut screen, &completion_error_message(&e));
                        self.restore_after_inline(&mut screen, incomplete_len);
                    }
                }
            }
        }

        self.renderer.render(true);
    }

    /// Write a message on its own line followed by a fresh prompt.
    fn print_inline(&mut self, screen: &mut ScreenState, message: &str) {
        let text = format!("\n{}\n{}", message, self.prompt);
        self.decoder.feed_locked(screen, &text);
    }

    /// Put the pending modifiable chars back on screen with the cursor after
    /// the completed token.
    fn restore_after_inline(&self, screen: &mut ScreenState, cursor_offset: usize) {
        screen.set_modifiable_chars(&self.modifiable_chars());
        screen.cursor_x = screen.x_modifiable() + cursor_offset;
    }

    fn insert_lines(&mut self, start: usize, text: &str) {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let mut x = start;

        for segment in text.split_inclusive(is_terminator) {
            {
                let screen = Arc::clone(&self.screen);
                let mut screen = screen.acquire_lock();
                self.ensure_screen_consistency(&screen);
                x = x.clamp(self.x_modifiable(), self.line.len());
                let offset = x - self.x_modifiable();

                let (body, terminator) = split_terminator(segment);
                if !body.is_empty() {
                    screen.replace_in_range(Some((offset, offset)), body, true);
                }

                let tail = self.line.split_off(x);
                self.line.extend(body.chars());
                self.line.extend(tail);
                match terminator {
                    Some('\n') => {
                        // The line break always goes to the end
                        screen.replace_in_range(None, "\n", false);
                        self.line.push('\n');
                    }
                    Some(_) => {
                        // The marker is never drawn; the line typed before it
                        // is submitted with it and leaves the editable region
                        screen.close_modifiable();
                        self.line.push(EOF_MARKER);
                    }
                    None => {}
                }
            }

            x = self.line.len();
            self.renderer.render(true);
        }

        self.hand_off_complete_lines();
    }

    /// Push everything through the last terminator to the intake.
    fn hand_off_complete_lines(&mut self) {
        let Some(idx) = self.line.iter().rposition(|&c| is_terminator(c)) else {
            return;
        };

        let rest = self.line.split_off(idx + 1);
        let complete: String = std::mem::replace(&mut self.line, rest).into_iter().collect();
        debug!(len = complete.len(), "handing input to execution");
        self.intake.push(&complete);
        self.hook.fire();
    }
}

fn is_terminator(c: char) -> bool {
    c == '\n' || c == EOF_MARKER
}

/// Split a trailing terminator off `segment`.
fn split_terminator(segment: &str) -> (&str, Option<char>) {
    match segment.chars().next_back() {
        Some(c) if is_terminator(c) => (&segment[..segment.len() - c.len_utf8()], Some(c)),
        _ => (segment, None),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn completion_error_message(e: &CompletionError) -> String {
    format!("auto-completion error: {}", e)
}

/// Length of `chars` once its last word (and the whitespace after it) is removed.
fn trim_last_word(chars: &[char]) -> usize {
    let mut end = chars.len();
    while end > 0 && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    while end > 0 && !chars[end - 1].is_whitespace() {
        end -= 1;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::completer::{CompletionProvider, WordCompleter};
    use crate::core::intake::IntakeLine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingRenderer {
        calls: AtomicUsize,
    }

    impl Render for CountingRenderer {
        fn render(&self, _no_wait: bool) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Always shows exactly what the screen holds
    struct LiveView(Arc<Screen>);

    impl VisibleText for LiveView {
        fn visible_text(&self) -> String {
            self.0.text()
        }
    }

    /// Shows whatever the test last froze
    #[derive(Default)]
    struct FrozenView(Mutex<String>);

    impl FrozenView {
        fn freeze(&self, text: String) {
            *self.0.lock().unwrap() = text;
        }
    }

    impl VisibleText for FrozenView {
        fn visible_text(&self) -> String {
            self.0.lock().unwrap().clone()
        }
    }

    struct Fixture {
        screen: Arc<Screen>,
        renderer: Arc<CountingRenderer>,
        intake: Arc<ExecutionIntake>,
        tab: Arc<TabHandlers>,
        input: InputBuffer,
    }

    fn fixture_with_view(view: Option<Arc<dyn VisibleText>>) -> Fixture {
        let screen = Arc::new(Screen::new(100));
        let renderer = Arc::new(CountingRenderer::default());
        let intake = Arc::new(ExecutionIntake::new());
        let tab = Arc::new(TabHandlers::new(Some(Arc::new(WordCompleter::new([
            "echo", "exit", "cat",
        ])))));
        let view = view.unwrap_or_else(|| Arc::new(LiveView(screen.clone())));

        let mut decoder = OutputDecoder::new(screen.clone(), renderer.clone());
        decoder.feed("$ ");

        let input = InputBuffer::new(
            screen.clone(),
            renderer.clone(),
            view,
            intake.clone(),
            tab.clone(),
        )
        .with_prompt("$ ");

        Fixture {
            screen,
            renderer,
            intake,
            tab,
            input,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_view(None)
    }

    fn lines(intake: &ExecutionIntake) -> Vec<IntakeLine> {
        std::iter::from_fn(|| intake.take_line()).collect()
    }

    #[test]
    fn test_split_feed_matches_single_feed() {
        let mut split = fixture();
        let pushes = Arc::new(AtomicUsize::new(0));
        let p = pushes.clone();
        split.input.config_runtime_callback(move || {
            p.fetch_add(1, Ordering::SeqCst);
        });
        split.input.feed(EditRange::BufferEnd, "a");
        split.input.feed(EditRange::BufferEnd, "b");
        split.input.feed(EditRange::BufferEnd, "\n");

        let mut whole = fixture();
        whole.input.feed(EditRange::BufferEnd, "ab\n");

        assert_eq!(split.screen.text(), whole.screen.text());
        assert_eq!(split.screen.text(), "$ ab\n");
        assert_eq!(split.input.pending(), whole.input.pending());
        assert_eq!(lines(&split.intake), vec![IntakeLine::Line("ab\n".into())]);
        assert_eq!(lines(&whole.intake), vec![IntakeLine::Line("ab\n".into())]);
        assert_eq!(pushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_eof_marker_is_not_drawn() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "\0");

        assert_eq!(f.screen.text(), "$ ");
        assert_eq!(lines(&f.intake), vec![IntakeLine::Eof]);
        assert!(f.input.pending().is_empty());
    }

    #[test]
    fn test_multiline_paste_renders_each_line() {
        let mut f = fixture();
        let before = f.renderer.calls.load(Ordering::SeqCst);
        f.input.feed(EditRange::BufferEnd, "one\r\ntwo\nthr");

        assert_eq!(f.screen.text(), "$ one\ntwo\nthr");
        assert_eq!(f.input.pending(), "thr");
        assert_eq!(f.renderer.calls.load(Ordering::SeqCst) - before, 3);
        assert_eq!(
            lines(&f.intake),
            vec![
                IntakeLine::Line("one\n".into()),
                IntakeLine::Line("two\n".into())
            ]
        );
    }

    #[test]
    fn test_visible_range_edit_in_place() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "helo");

        // Insert 'l' between "hel" and "o"
        f.input.feed(EditRange::Visible { start: 5, end: 5 }, "l");
        assert_eq!(f.screen.text(), "$ hello");
        assert_eq!(f.screen.acquire_lock().cursor_x, 6);

        // Replace "ll" with "y"
        f.input.feed(EditRange::Visible { start: 4, end: 6 }, "y");
        assert_eq!(f.screen.text(), "$ heyo");
        assert_eq!(f.input.modifiable_chars(), "heyo");
    }

    #[test]
    fn test_stale_edit_goes_to_end() {
        let view = Arc::new(FrozenView::default());
        let mut f = fixture_with_view(Some(view.clone()));
        f.input.feed(EditRange::BufferEnd, "ab");
        view.freeze(f.screen.text());

        // A command prints after the edit was captured
        let mut out = OutputDecoder::new(f.screen.clone(), f.renderer.clone());
        out.feed("OUT");

        f.input.feed(EditRange::Visible { start: 3, end: 3 }, "X");
        assert_eq!(f.screen.text(), "$ abOUTX");
        assert_eq!(f.input.modifiable_chars(), "X");
    }

    #[test]
    fn test_edit_before_modifiable_region_goes_to_end() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "ab");
        f.input.feed(EditRange::Visible { start: 0, end: 1 }, "X");
        assert_eq!(f.screen.text(), "$ abX");
    }

    #[test]
    fn test_live_screen_wins_over_cache() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "ab");
        f.screen.acquire_lock().set_modifiable_chars("zz");

        f.input.feed(EditRange::BufferEnd, "c");
        assert_eq!(f.input.modifiable_chars(), "zzc");
        assert_eq!(f.screen.text(), "$ zzc");
    }

    #[test]
    fn test_pure_deletion() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "abc");
        f.input.feed(EditRange::Visible { start: 3, end: 4 }, "");
        assert_eq!(f.screen.text(), "$ ac");

        f.input.feed(EditRange::Modifiable, "");
        assert_eq!(f.screen.text(), "$ ");
        assert!(f.input.pending().is_empty());
    }

    #[test]
    fn test_tab_completes_unambiguous_token() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "ca");
        f.input.feed(EditRange::BufferEnd, "\t");

        assert_eq!(f.screen.text(), "$ cat ");
        assert_eq!(f.screen.acquire_lock().cursor_x, 6);
    }

    #[test]
    fn test_tab_lists_candidates_and_restores_line() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "e");
        f.input.feed(EditRange::BufferEnd, "\t");

        assert_eq!(f.screen.text(), "$ e\necho  exit\n$ e");
        let state = f.screen.acquire_lock();
        assert_eq!(state.cursor_x, state.len());
        assert_eq!(state.modifiable_chars(), "e");
    }

    #[test]
    fn test_tab_without_match_changes_nothing() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "zz");
        f.input.feed(EditRange::Visible { start: 3, end: 3 }, "\t");

        assert_eq!(f.screen.text(), "$ zz");
        assert_eq!(f.screen.acquire_lock().cursor_x, 3);
    }

    #[test]
    fn test_tab_provider_error_is_reported_inline() {
        struct Failing;
        impl CompletionProvider for Failing {
            fn complete(&self, _: &str) -> Result<Completion, CompletionError> {
                Err(CompletionError::Provider("boom".into()))
            }
        }

        let mut f = fixture();
        f.tab.claim_input(true);
        f.tab.set_external(Some(Arc::new(Failing)));
        f.input.feed(EditRange::BufferEnd, "x");
        f.input.feed(EditRange::BufferEnd, "\t");

        let text = f.screen.text();
        assert!(text.contains("auto-completion error: completion provider failed: boom"));
        assert!(text.ends_with("\n$ x"));
        let state = f.screen.acquire_lock();
        assert_eq!(state.cursor_x, state.len());
    }

    #[test]
    fn test_tab_provider_panic_is_reported_inline() {
        struct Panicking;
        impl CompletionProvider for Panicking {
            fn complete(&self, _: &str) -> Result<Completion, CompletionError> {
                panic!("boom")
            }
        }

        let mut f = fixture();
        f.tab.claim_input(true);
        f.tab.set_external(Some(Arc::new(Panicking)));
        f.input.feed(EditRange::BufferEnd, "x");
        f.input.feed(EditRange::BufferEnd, "\t");

        let text = f.screen.text();
        assert!(text.contains("auto-completion error: completion provider panicked: boom"));
        assert!(text.ends_with("\n$ x"));
        assert_eq!(f.input.modifiable_chars(), "x");

        // Still editable afterwards
        f.input.feed(EditRange::BufferEnd, "y");
        assert_eq!(f.screen.acquire_lock().modifiable_chars(), "xy");
    }

    #[test]
    fn test_completion_dropped_when_line_changes_meanwhile() {
        /// Rewrites the line on screen while it computes
        struct Racing(Arc<Screen>);
        impl CompletionProvider for Racing {
            fn complete(&self, _: &str) -> Result<Completion, CompletionError> {
                self.0.acquire_lock().set_modifiable_chars("zz");
                Ok(Completion {
                    completed: "cat ".into(),
                    candidates: vec!["cat".into()],
                })
            }
        }

        let mut f = fixture();
        f.tab.claim_input(true);
        f.tab.set_external(Some(Arc::new(Racing(f.screen.clone()))));
        f.input.feed(EditRange::BufferEnd, "ca");
        f.input.feed(EditRange::BufferEnd, "\t");

        assert_eq!(f.screen.text(), "$ zz");
        assert_eq!(f.input.modifiable_chars(), "zz");
        let state = f.screen.acquire_lock();
        assert!(state.cursor_x >= state.x_modifiable());
        assert!(state.cursor_x <= state.len());
    }

    #[test]
    fn test_stale_edit_with_pending_text_goes_to_end() {
        let view = Arc::new(FrozenView::default());
        let mut f = fixture_with_view(Some(view.clone()));
        f.input.feed(EditRange::BufferEnd, "ab");
        view.freeze(f.screen.text());

        let mut out = OutputDecoder::new(f.screen.clone(), f.renderer.clone());
        out.feed("OUT");
        f.input.feed(EditRange::BufferEnd, "cd");
        assert_eq!(f.input.modifiable_chars(), "cd");

        // The view still shows "$ ab", whose tail does not match "cd"
        f.input.feed(EditRange::Visible { start: 3, end: 3 }, "X");
        assert_eq!(f.screen.text(), "$ abOUTcdX");
        assert_eq!(f.input.modifiable_chars(), "cdX");
    }

    #[test]
    fn test_eof_after_pending_text_submits_it_once() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "ab");
        f.input.feed(EditRange::BufferEnd, "\0");

        assert_eq!(lines(&f.intake), vec![IntakeLine::Eof]);
        assert!(f.input.pending().is_empty());
        assert_eq!(f.screen.acquire_lock().modifiable_chars(), "");

        f.input.feed(EditRange::BufferEnd, "\n");
        assert_eq!(lines(&f.intake), vec![IntakeLine::Line("\n".into())]);
        assert_eq!(f.screen.text(), "$ ab\n");
        assert!(f.input.pending().is_empty());
    }

    #[test]
    fn test_eof_mid_line_submits_whole_line() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "abcd");
        f.input.feed(EditRange::Visible { start: 4, end: 4 }, "\0");

        assert_eq!(f.screen.text(), "$ abcd");
        assert_eq!(lines(&f.intake), vec![IntakeLine::Eof]);

        f.input.feed(EditRange::BufferEnd, "x");
        assert_eq!(f.input.modifiable_chars(), "x");
        assert_eq!(f.screen.text(), "$ abcdx");
    }

    #[test]
    fn test_set_cursor_clamps_to_modifiable() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "abc");

        f.input.set_cursor(1, Whence::Start);
        assert_eq!(f.screen.acquire_lock().cursor_x, 3);

        f.input.set_cursor(-1, Whence::End);
        assert_eq!(f.screen.acquire_lock().cursor_x, 4);

        f.input.set_cursor(-10, Whence::Current);
        assert_eq!(f.screen.acquire_lock().cursor_x, 2);

        f.input.set_cursor(10, Whence::Current);
        assert_eq!(f.screen.acquire_lock().cursor_x, 5);
    }

    #[test]
    fn test_delete_word() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "echo foo  ");

        f.input.delete_word(12, 12);
        assert_eq!(f.screen.text(), "$ echo ");
        assert_eq!(f.screen.acquire_lock().cursor_x, 7);

        f.input.delete_word(7, 7);
        assert_eq!(f.screen.text(), "$ ");
        assert!(f.input.modifiable_chars().is_empty());
    }

    #[test]
    fn test_delete_word_keeps_text_after_cursor() {
        let mut f = fixture();
        f.input.feed(EditRange::BufferEnd, "  ab cd");

        // Edit point right after "ab"
        f.input.delete_word(6, 6);
        assert_eq!(f.input.modifiable_chars(), "   cd");
        assert_eq!(f.screen.acquire_lock().cursor_x, 4);
    }

    #[test]
    fn test_delete_word_ignores_selection_and_empty_line() {
        let mut f = fixture();
        f.input.delete_word(2, 2);
        assert_eq!(f.screen.text(), "$ ");

        f.input.feed(EditRange::BufferEnd, "abc");
        f.input.delete_word(2, 4);
        assert_eq!(f.screen.text(), "$ abc");
    }

    #[test]
    fn test_trim_last_word_edges() {
        let chars = |s: &str| s.chars().collect::<Vec<_>>();
        assert_eq!(trim_last_word(&chars("")), 0);
        assert_eq!(trim_last_word(&chars("   ")), 0);
        assert_eq!(trim_last_word(&chars("word")), 0);
        assert_eq!(trim_last_word(&chars("a b")), 2);
        assert_eq!(trim_last_word(&chars("a b \t")), 2);
    }
}
