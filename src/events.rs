//! Input events delivered by the terminal to the navigation state machine.
//!
//! The navigator only needs two things from the terminal: the next key press,
//! and the index picked from a list of choices. Both can carry an interrupt
//! request (Ctrl-C) that bypasses normal navigation.

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// A key press, reduced to what navigation cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// A printable character.
    Char(char),
    Enter,
    Escape,
    Up,
    Down,
    /// Ctrl-C: leave immediately.
    Interrupt,
    /// Anything else.
    Other,
}

impl Key {
    /// Converts a crossterm key event. Key releases and repeats map to `None`.
    pub fn from_event(event: KeyEvent) -> Option<Self> {
        if event.kind != KeyEventKind::Press {
            return None;
        }
        let key = match event.code {
            KeyCode::Char('c') if event.modifiers.contains(KeyModifiers::CONTROL) => Key::Interrupt,
            KeyCode::Char(c) => Key::Char(c),
            KeyCode::Enter => Key::Enter,
            KeyCode::Esc => Key::Escape,
            KeyCode::Up => Key::Up,
            KeyCode::Down => Key::Down,
            _ => Key::Other,
        };
        Some(key)
    }
}

/// The outcome of presenting a list of choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Index into the presented options.
    Selected(usize),
    /// The user asked to quit instead of choosing.
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctrl_c_is_interrupt() {
        let event = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(Key::from_event(event), Some(Key::Interrupt));
        let plain = KeyEvent::new(KeyCode::Char('c'), KeyModifiers::NONE);
        assert_eq!(Key::from_event(plain), Some(Key::Char('c')));
    }

    #[test]
    fn releases_are_ignored() {
        let mut event = KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        event.kind = KeyEventKind::Release;
        assert_eq!(Key::from_event(event), None);
    }
}
