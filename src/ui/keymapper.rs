//! Key mapping for line editing
//!
//! Converts key events to editor actions applied to the input buffer.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const CTRL  = 0b0010;
        const ALT   = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        if mods.contains(KeyModifiers::SHIFT) {
            result |= Modifiers::SHIFT;
        }
        if mods.contains(KeyModifiers::CONTROL) {
            result |= Modifiers::CTRL;
        }
        if mods.contains(KeyModifiers::ALT) {
            result |= Modifiers::ALT;
        }
        result
    }
}

/// An edit requested by the user
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EditorAction {
    /// Insert text at the cursor
    Insert(String),
    /// End the current line
    Submit,
    /// Delete the char before the cursor
    Backspace,
    /// Delete the char under the cursor
    Delete,
    MoveLeft,
    MoveRight,
    Home,
    End,
    /// Tab completion
    Complete,
    /// Delete the word before the cursor
    DeleteWord,
    /// Discard the whole modifiable region
    ClearLine,
    /// Send the end-of-input marker
    EndOfInput,
    /// Cancel the foreground command
    Interrupt,
    /// Insert the clipboard contents
    Paste,
    Quit,
}

/// Key mapper for converting key events to editor actions
pub struct KeyMapper;

impl KeyMapper {
    /// Map a crossterm KeyEvent to an editor action
    pub fn map(event: &KeyEvent) -> Option<EditorAction> {
        if event.kind == KeyEventKind::Release {
            return None;
        }
        let mods = Modifiers::from(event.modifiers);

        match event.code {
            KeyCode::Char(ch) if mods.contains(Modifiers::CTRL) => Self::map_ctrl(ch),
            KeyCode::Char(_) if mods.contains(Modifiers::ALT) => None,
            KeyCode::Char(ch) => Some(EditorAction::Insert(ch.to_string())),

            KeyCode::Enter => Some(EditorAction::Submit),
            KeyCode::Backspace if mods.contains(Modifiers::ALT) => Some(EditorAction::DeleteWord),
            KeyCode::Backspace => Some(EditorAction::Backspace),
            KeyCode::Delete => Some(EditorAction::Delete),
            KeyCode::Tab => Some(EditorAction::Complete),

            KeyCode::Left => Some(EditorAction::MoveLeft),
            KeyCode::Right => Some(EditorAction::MoveRight),
            KeyCode::Home => Some(EditorAction::Home),
            KeyCode::End => Some(EditorAction::End),

            _ => None,
        }
    }

    /// Ctrl + key
    fn map_ctrl(ch: char) -> Option<EditorAction> {
        match ch.to_ascii_lowercase() {
            'a' => Some(EditorAction::Home),
            'e' => Some(EditorAction::End),
            'b' => Some(EditorAction::MoveLeft),
            'f' => Some(EditorAction::MoveRight),
            'h' => Some(EditorAction::Backspace),
            'w' => Some(EditorAction::DeleteWord),
            'u' => Some(EditorAction::ClearLine),
            'd' => Some(EditorAction::EndOfInput),
            'c' => Some(EditorAction::Interrupt),
            'v' => Some(EditorAction::Paste),
            'q' => Some(EditorAction::Quit),
            'i' => Some(EditorAction::Complete),
            'j' | 'm' => Some(EditorAction::Submit),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_event(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    #[test]
    fn test_char_keys() {
        let event = key_event(KeyCode::Char('a'), KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), Some(EditorAction::Insert("a".into())));

        let event = key_event(KeyCode::Char('A'), KeyModifiers::SHIFT);
        assert_eq!(KeyMapper::map(&event), Some(EditorAction::Insert("A".into())));

        let event = key_event(KeyCode::Char('x'), KeyModifiers::ALT);
        assert_eq!(KeyMapper::map(&event), None);
    }

    #[test]
    fn test_ctrl_keys() {
        let cases = [
            ('c', EditorAction::Interrupt),
            ('d', EditorAction::EndOfInput),
            ('w', EditorAction::DeleteWord),
            ('v', EditorAction::Paste),
            ('q', EditorAction::Quit),
            ('U', EditorAction::ClearLine),
        ];
        for (ch, action) in cases {
            let event = key_event(KeyCode::Char(ch), KeyModifiers::CONTROL);
            assert_eq!(KeyMapper::map(&event), Some(action));
        }

        let event = key_event(KeyCode::Char('z'), KeyModifiers::CONTROL);
        assert_eq!(KeyMapper::map(&event), None);
    }

    #[test]
    fn test_editing_keys() {
        let event = key_event(KeyCode::Enter, KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), Some(EditorAction::Submit));

        let event = key_event(KeyCode::Tab, KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), Some(EditorAction::Complete));

        let event = key_event(KeyCode::Backspace, KeyModifiers::ALT);
        assert_eq!(KeyMapper::map(&event), Some(EditorAction::DeleteWord));

        let event = key_event(KeyCode::Left, KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), Some(EditorAction::MoveLeft));

        let event = key_event(KeyCode::F(5), KeyModifiers::NONE);
        assert_eq!(KeyMapper::map(&event), None);
    }

    #[test]
    fn test_modifiers_from_crossterm() {
        let mods = Modifiers::from(KeyModifiers::CONTROL | KeyModifiers::SHIFT);
        assert!(mods.contains(Modifiers::CTRL | Modifiers::SHIFT));
        assert!(!mods.contains(Modifiers::ALT));
    }
}
