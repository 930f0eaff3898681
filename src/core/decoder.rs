//! Output decoder
//!
//! Turns the character stream written by running commands into screen
//! updates. The grammar is deliberately small: literal text, `ESC [` (or the
//! 8-bit CSI) followed by `;`-separated decimal parameters and a terminator.
//! Terminators are bound to [`ControlFunction`]s through a
//! [`ControlRegistry`], so new functions can be wired in without touching the
//! state machine.
//!
//! Malformed input never stops the stream: any fault resets the decoder to
//! [`DecoderState::Ground`] and decoding resumes with the next character.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::screen::{Render, Screen, ScreenError, ScreenState};

pub const NUL: char = '\x00';
pub const ESC: char = '\x1b';
pub const DEL: char = '\x7f';
/// 8-bit control sequence introducer
pub const CSI: char = '\u{9b}';

/// Largest accepted parameter value; larger values are clamped.
pub const MAX_PARAM: u16 = 9999;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFault {
    #[error("no control function bound to terminator {0:?}")]
    UnboundTerminator(char),

    #[error("control function failed: {0}")]
    Handler(#[from] ScreenError),
}

/// Control functions a terminator can be bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ControlFunction {
    /// Full reset of the screen
    Reset,
    /// SGR - Select Graphic Rendition
    SelectGraphicRendition,
}

/// Events the decoder dispatches
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// Print one character at the cursor
    Draw(char),
    /// A parameterised control function
    Control(ControlFunction),
}

/// Receiver of decoded events.
///
/// Implemented by [`ScreenState`]; tests use recording sinks.
pub trait ControlSink {
    fn draw(&mut self, ch: char);
    fn reset(&mut self);
    fn select_graphic_rendition(&mut self, params: &[u16]) -> Result<(), ScreenError>;
}

impl ControlSink for ScreenState {
    fn draw(&mut self, ch: char) {
        ScreenState::draw(self, ch);
    }

    fn reset(&mut self) {
        ScreenState::reset(self);
    }

    fn select_graphic_rendition(&mut self, params: &[u16]) -> Result<(), ScreenError> {
        ScreenState::select_graphic_rendition(self, params)
    }
}

/// Terminator -> control function bindings
#[derive(Clone, Debug)]
pub struct ControlRegistry {
    bindings: HashMap<char, ControlFunction>,
}

impl Default for ControlRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.bind('c', ControlFunction::Reset);
        registry.bind('m', ControlFunction::SelectGraphicRendition);
        registry
    }
}

impl ControlRegistry {
    pub fn empty() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Bind a terminator, returning the previous binding
    pub fn bind(&mut self, terminator: char, function: ControlFunction) -> Option<ControlFunction> {
        self.bindings.insert(terminator, function)
    }

    pub fn unbind(&mut self, terminator: char) -> Option<ControlFunction> {
        self.bindings.remove(&terminator)
    }

    pub fn lookup(&self, terminator: char) -> Option<ControlFunction> {
        self.bindings.get(&terminator).copied()
    }
}

/// Parser state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecoderState {
    #[default]
    Ground,
    Escape,
    Arguments,
}

/// The decoding state machine, independent of any screen.
#[derive(Debug, Default)]
pub struct ControlParser {
    state: DecoderState,
    params: Vec<u16>,
    current: String,
    registry: ControlRegistry,
}

impl ControlParser {
    pub fn new() -> Self {
        Self::with_registry(ControlRegistry::default())
    }

    pub fn with_registry(registry: ControlRegistry) -> Self {
        Self {
            state: DecoderState::Ground,
            params: Vec::with_capacity(8),
            current: String::new(),
            registry,
        }
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Parameters closed so far in the sequence being decoded
    pub fn params(&self) -> &[u16] {
        &self.params
    }

    /// Digits of the parameter currently being accumulated
    pub fn current_param(&self) -> &str {
        &self.current
    }

    pub fn registry(&self) -> &ControlRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ControlRegistry {
        &mut self.registry
    }

    /// Back to ground with no parameters
    pub fn reset(&mut self) {
        self.state = DecoderState::Ground;
        self.params.clear();
        self.current.clear();
    }

    /// Consume one character. A fault resynchronises the parser.
    pub fn consume<S: ControlSink + ?Sized>(&mut self, ch: char, sink: &mut S) {
        let result = match self.state {
            DecoderState::Ground => self.ground(ch, sink),
            DecoderState::Escape => self.escape(ch, sink),
            DecoderState::Arguments => self.arguments(ch, sink),
        };

        if let Err(fault) = result {
            tracing::debug!("Decode fault, resetting: {}", fault);
            self.reset();
        }
    }

    /// Dispatch an event and reset the parser afterwards.
    pub fn dispatch<S: ControlSink + ?Sized>(
        &mut self,
        sink: &mut S,
        event: Event,
        args: &[u16],
    ) -> Result<(), DecodeFault> {
        self.dispatch_with(sink, event, args, true)
    }

    /// Dispatch an event; `reset` controls whether the parser returns to
    /// ground afterwards. A failing handler leaves the reset to the caller.
    pub fn dispatch_with<S: ControlSink + ?Sized>(
        &mut self,
        sink: &mut S,
        event: Event,
        args: &[u16],
        reset: bool,
    ) -> Result<(), DecodeFault> {
        match event {
            Event::Draw(ch) => sink.draw(ch),
            Event::Control(ControlFunction::Reset) => sink.reset(),
            Event::Control(ControlFunction::SelectGraphicRendition) => {
                sink.select_graphic_rendition(args)?
            }
        }

        if reset {
            self.reset();
        }
        Ok(())
    }

    fn ground<S: ControlSink + ?Sized>(&mut self, ch: char, sink: &mut S) -> Result<(), DecodeFault> {
        match ch {
            ESC => self.state = DecoderState::Escape,
            CSI => self.state = DecoderState::Arguments,
            NUL | DEL => {}
            // Draws are the hot path; no reset needed
            _ => self.dispatch_with(sink, Event::Draw(ch), &[], false)?,
        }
        Ok(())
    }

    fn escape<S: ControlSink + ?Sized>(&mut self, ch: char, sink: &mut S) -> Result<(), DecodeFault> {
        if ch == '[' {
            self.state = DecoderState::Arguments;
            Ok(())
        } else {
            // Other escapes are not supported; show the char literally
            self.dispatch(sink, Event::Draw(ch), &[])
        }
    }

    fn arguments<S: ControlSink + ?Sized>(&mut self, ch: char, sink: &mut S) -> Result<(), DecodeFault> {
        if ch.is_ascii_digit() {
            self.current.push(ch);
            return Ok(());
        }

        let param = parse_param(&self.current);
        self.params.push(param);

        if ch == ';' {
            self.current.clear();
            return Ok(());
        }

        let function = self
            .registry
            .lookup(ch)
            .ok_or(DecodeFault::UnboundTerminator(ch))?;
        let params = std::mem::take(&mut self.params);
        let result = self.dispatch(sink, Event::Control(function), &params);
        // Keep the allocation for the next sequence
        self.params = params;
        self.params.clear();
        result
    }
}

/// Unsigned decimal, 0 when empty, clamped to [`MAX_PARAM`].
fn parse_param(digits: &str) -> u16 {
    if digits.is_empty() {
        return 0;
    }
    // Only ASCII digits are accumulated, so a parse error means overflow
    digits
        .parse::<u32>()
        .map(|n| n.min(MAX_PARAM as u32) as u16)
        .unwrap_or(MAX_PARAM)
}

/// Decode UTF-8, dropping invalid sequences instead of failing.
pub fn decode_utf8_dropping_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                match e.error_len() {
                    Some(n) => rest = &after[n..],
                    // Truncated sequence at the end of the chunk
                    None => break,
                }
            }
        }
    }

    out
}

/// How a decoder asks for a repaint after a chunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderMode {
    /// Enqueue a coalesced, non-blocking render
    #[default]
    Deferred,
    /// Wait for the render to complete
    Blocking,
    /// Do not render
    Skip,
}

/// Decoder bound to the shared screen.
///
/// One instance per output-producing thread; the parser state is not shared.
pub struct OutputDecoder {
    parser: ControlParser,
    screen: Arc<Screen>,
    renderer: Arc<dyn Render>,
    render_mode: RenderMode,
}

impl OutputDecoder {
    pub fn new(screen: Arc<Screen>, renderer: Arc<dyn Render>) -> Self {
        Self {
            parser: ControlParser::new(),
            screen,
            renderer,
            render_mode: RenderMode::default(),
        }
    }

    pub fn with_render_mode(mut self, mode: RenderMode) -> Self {
        self.render_mode = mode;
        self
    }

    pub fn parser(&self) -> &ControlParser {
        &self.parser
    }

    pub fn parser_mut(&mut self) -> &mut ControlParser {
        &mut self.parser
    }

    /// Decode under a screen guard the caller already holds. Never renders.
    pub fn feed_locked(&mut self, screen: &mut ScreenState, text: &str) {
        for ch in text.chars() {
            self.parser.consume(ch, screen);
        }
    }

    /// Feed a chunk using the decoder's render mode
    pub fn feed(&mut self, text: &str) {
        self.feed_with(text, self.render_mode);
    }

    /// Feed raw bytes; invalid UTF-8 is dropped
    pub fn feed_bytes(&mut self, bytes: &[u8]) {
        let text = decode_utf8_dropping_invalid(bytes);
        self.feed(&text);
    }

    /// Decode the whole chunk under one screen lock, then render once.
    pub fn feed_with(&mut self, text: &str, mode: RenderMode) {
        {
            let screen = Arc::clone(&self.screen);
            let mut screen = screen.acquire_lock();
            self.feed_locked(&mut screen, text);
        }

        match mode {
            RenderMode::Deferred => self.renderer.render(true),
            RenderMode::Blocking => self.renderer.render(false),
            RenderMode::Skip => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq)]
    enum Recorded {
        Draw(char),
        Reset,
        Sgr(Vec<u16>),
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<Recorded>,
        fail_sgr: bool,
    }

    impl ControlSink for RecordingSink {
        fn draw(&mut self, ch: char) {
            self.events.push(Recorded::Draw(ch));
        }

        fn reset(&mut self) {
            self.events.push(Recorded::Reset);
        }

        fn select_graphic_rendition(&mut self, params: &[u16]) -> Result<(), ScreenError> {
            if self.fail_sgr {
                return Err(ScreenError::TruncatedColor(38));
            }
            self.events.push(Recorded::Sgr(params.to_vec()));
            Ok(())
        }
    }

    fn feed(parser: &mut ControlParser, sink: &mut RecordingSink, text: &str) {
        for ch in text.chars() {
            parser.consume(ch, sink);
        }
    }

    #[derive(Default)]
    struct CountingRenderer {
        deferred: AtomicUsize,
        blocking: AtomicUsize,
    }

    impl Render for CountingRenderer {
        fn render(&self, no_wait: bool) {
            if no_wait {
                self.deferred.fetch_add(1, Ordering::SeqCst);
            } else {
                self.blocking.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_sgr_params_are_clamped() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\x1b[1;9999999m");

        assert_eq!(sink.events, vec![Recorded::Sgr(vec![1, 9999])]);
        assert_eq!(parser.state(), DecoderState::Ground);
    }

    #[test]
    fn test_empty_params_default_to_zero() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\x1b[;5;m\x1b[m");

        assert_eq!(
            sink.events,
            vec![Recorded::Sgr(vec![0, 5, 0]), Recorded::Sgr(vec![0])]
        );
    }

    #[test]
    fn test_eight_bit_csi_and_reset() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\u{9b}c");

        assert_eq!(sink.events, vec![Recorded::Reset]);
    }

    #[test]
    fn test_plain_text_draws_in_order() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "héllo\n");

        let expected: Vec<Recorded> = "héllo\n".chars().map(Recorded::Draw).collect();
        assert_eq!(sink.events, expected);
        assert_eq!(parser.state(), DecoderState::Ground);
    }

    #[test]
    fn test_nul_and_del_are_ignored() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "a\0\x7fb");

        assert_eq!(sink.events, vec![Recorded::Draw('a'), Recorded::Draw('b')]);
    }

    #[test]
    fn test_unsupported_escape_draws_literally() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\x1b7x");

        assert_eq!(sink.events, vec![Recorded::Draw('7'), Recorded::Draw('x')]);
        assert_eq!(parser.state(), DecoderState::Ground);
    }

    #[test]
    fn test_unterminated_sequence_is_inspectable() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "ab\x1b");
        assert_eq!(parser.state(), DecoderState::Escape);

        feed(&mut parser, &mut sink, "[12;3");
        assert_eq!(parser.state(), DecoderState::Arguments);
        assert_eq!(parser.params(), &[12]);
        assert_eq!(parser.current_param(), "3");
        assert_eq!(sink.events, vec![Recorded::Draw('a'), Recorded::Draw('b')]);

        // The sequence completes in the next chunk
        feed(&mut parser, &mut sink, "m");
        assert_eq!(sink.events.last(), Some(&Recorded::Sgr(vec![12, 3])));
    }

    #[test]
    fn test_unbound_terminator_resynchronises() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\x1b[12;7zX\x1b[4m");

        assert_eq!(
            sink.events,
            vec![Recorded::Draw('X'), Recorded::Sgr(vec![4])]
        );
        assert!(parser.params().is_empty());
    }

    #[test]
    fn test_handler_fault_does_not_leak_params() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink {
            fail_sgr: true,
            ..Default::default()
        };

        feed(&mut parser, &mut sink, "\x1b[38;5m");
        assert_eq!(parser.state(), DecoderState::Ground);
        assert!(parser.params().is_empty());

        sink.fail_sgr = false;
        feed(&mut parser, &mut sink, "\x1b[2m");
        assert_eq!(sink.events, vec![Recorded::Sgr(vec![2])]);
    }

    #[test]
    fn test_registry_is_extensible() {
        let mut registry = ControlRegistry::default();
        registry.bind('J', ControlFunction::Reset);
        assert_eq!(registry.unbind('c'), Some(ControlFunction::Reset));

        let mut parser = ControlParser::with_registry(registry);
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\x1b[2J\x1b[c");

        assert_eq!(sink.events, vec![Recorded::Reset]);
    }

    #[test]
    fn test_dispatch_without_reset_keeps_state() {
        let mut parser = ControlParser::new();
        let mut sink = RecordingSink::default();

        feed(&mut parser, &mut sink, "\x1b[1;");
        parser
            .dispatch_with(&mut sink, Event::Draw('q'), &[], false)
            .unwrap();
        assert_eq!(parser.state(), DecoderState::Arguments);
        assert_eq!(parser.params(), &[1]);

        parser.dispatch(&mut sink, Event::Draw('r'), &[]).unwrap();
        assert_eq!(parser.state(), DecoderState::Ground);
    }

    #[test]
    fn test_feed_renders_once_per_chunk() {
        let screen = Arc::new(Screen::default());
        let renderer = Arc::new(CountingRenderer::default());
        let mut decoder = OutputDecoder::new(screen.clone(), renderer.clone());

        decoder.feed("\x1b[31mred\x1b[0m plain\n");
        assert_eq!(screen.text(), "red plain\n");
        assert_eq!(renderer.deferred.load(Ordering::SeqCst), 1);

        decoder.feed_with("x", RenderMode::Blocking);
        decoder.feed_with("y", RenderMode::Skip);
        assert_eq!(renderer.blocking.load(Ordering::SeqCst), 1);
        assert_eq!(renderer.deferred.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_feed_bytes_drops_invalid_utf8() {
        let screen = Arc::new(Screen::default());
        let renderer = Arc::new(CountingRenderer::default());
        let mut decoder = OutputDecoder::new(screen.clone(), renderer);

        decoder.feed_bytes(b"a\xc2b\xff\xe2\x82\xacc");
        assert_eq!(screen.text(), "ab\u{20ac}c");
    }

    #[test]
    fn test_reset_sequence_clears_screen() {
        let screen = Arc::new(Screen::default());
        let renderer = Arc::new(CountingRenderer::default());
        let mut decoder = OutputDecoder::new(screen.clone(), renderer);

        decoder.feed("old output\n\x1b[cnew");
        assert_eq!(screen.text(), "new");
    }
}
