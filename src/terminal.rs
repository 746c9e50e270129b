//! Terminal input and output.
//!
//! This module puts the terminal in raw mode, forwards key presses from a
//! background thread, renders the inline choice prompt, and provides a writer
//! that keeps line breaks intact while raw mode is on.

use std::io::{self, Stdout, Write};
use std::time::Duration;

use crossterm::cursor::{Hide, MoveToColumn, MoveUp, Show};
use crossterm::style::{Print, PrintStyledContent, Stylize};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, Clear, ClearType};
use crossterm::{execute, queue};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::mpsc;

use crate::events::{Choice, Key};
use crate::nav::Input;

/// Enables raw mode so single key presses reach the navigator.
pub fn init_terminal() -> io::Result<()> {
    enable_raw_mode()
}

/// Restores the terminal to its original state.
pub fn restore_terminal() -> io::Result<()> {
    disable_raw_mode()?;
    execute!(io::stdout(), Show)?;
    Ok(())
}

/// Writes to the wrapped stream, turning `\n` into `\r\n`.
pub struct RawWriter<W>(pub W);

impl<W: Write> Write for RawWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut start = 0;
        for (idx, byte) in buf.iter().enumerate() {
            if *byte == b'\n' {
                self.0.write_all(&buf[start..idx])?;
                self.0.write_all(b"\r\n")?;
                start = idx + 1;
            }
        }
        self.0.write_all(&buf[start..])?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Prints one line of followed log output.
pub fn print_line(line: &str) {
    let mut out = RawWriter(io::stdout());
    let _ = writeln!(out, "{}", line);
    let _ = out.flush();
}

/// Forwards key presses from a background thread.
pub fn spawn_input_listener(tx: mpsc::Sender<Key>) {
    std::thread::spawn(move || loop {
        if tx.is_closed() {
            break;
        }
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            if let Ok(crossterm::event::Event::Key(event)) = crossterm::event::read() {
                if let Some(key) = Key::from_event(event) {
                    if tx.blocking_send(key).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// [`Input`] backed by the real terminal.
pub struct TerminalInput {
    keys: mpsc::Receiver<Key>,
}

impl TerminalInput {
    /// Starts listening for keys.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(64);
        spawn_input_listener(tx);
        Self { keys: rx }
    }

    async fn key(&mut self) -> Key {
        // A closed channel means the listener is gone; treat it as a request to leave.
        self.keys.recv().await.unwrap_or(Key::Interrupt)
    }
}

impl Input for TerminalInput {
    fn present_choice<'a>(&'a mut self, prompt: &'a str, options: &'a [String]) -> BoxFuture<'a, Choice> {
        async move {
            let mut out = io::stdout();
            let mut selected = 0;
            let _ = draw_menu(&mut out, prompt, options, selected, false);
            loop {
                match menu_step(selected, options.len(), self.key().await) {
                    MenuStep::Move(next) => {
                        selected = next;
                        let _ = draw_menu(&mut out, prompt, options, selected, true);
                    }
                    MenuStep::Select(idx) => {
                        let _ = clear_menu(&mut out, options.len());
                        print_line(&format!("{} › {}", prompt, options[idx]));
                        return Choice::Selected(idx);
                    }
                    MenuStep::Interrupt => {
                        let _ = clear_menu(&mut out, options.len());
                        return Choice::Interrupted;
                    }
                    MenuStep::Ignore => {}
                }
            }
        }
        .boxed()
    }

    fn next_key(&mut self) -> BoxFuture<'_, Key> {
        self.key().boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MenuStep {
    Move(usize),
    Select(usize),
    Interrupt,
    Ignore,
}

fn menu_step(selected: usize, len: usize, key: Key) -> MenuStep {
    if len == 0 {
        return match key {
            Key::Interrupt => MenuStep::Interrupt,
            _ => MenuStep::Ignore,
        };
    }
    match key {
        Key::Interrupt => MenuStep::Interrupt,
        Key::Enter => MenuStep::Select(selected),
        Key::Up | Key::Char('k') => MenuStep::Move((selected + len - 1) % len),
        Key::Down | Key::Char('j') => MenuStep::Move((selected + 1) % len),
        Key::Char(c) => match c.to_digit(10) {
            Some(digit) if digit >= 1 && (digit as usize) <= len => MenuStep::Select(digit as usize - 1),
            _ => MenuStep::Ignore,
        },
        Key::Escape | Key::Other => MenuStep::Ignore,
    }
}

fn menu_lines(options: &[String], selected: usize) -> Vec<(bool, String)> {
    options
        .iter()
        .enumerate()
        .map(|(idx, option)| {
            let marker = if idx == selected { "❯" } else { " " };
            (idx == selected, format!("{} {}. {}", marker, idx + 1, option))
        })
        .collect()
}

fn draw_menu(
    out: &mut Stdout,
    prompt: &str,
    options: &[String],
    selected: usize,
    redraw: bool,
) -> io::Result<()> {
    if redraw {
        queue!(out, MoveUp(options.len() as u16 + 1))?;
    }
    queue!(
        out,
        Hide,
        MoveToColumn(0),
        Clear(ClearType::FromCursorDown),
        PrintStyledContent(prompt.to_string().cyan().bold()),
        Print("\r\n")
    )?;
    for (active, line) in menu_lines(options, selected) {
        if active {
            queue!(out, PrintStyledContent(line.green()), Print("\r\n"))?;
        } else {
            queue!(out, Print(line), Print("\r\n"))?;
        }
    }
    out.flush()
}

fn clear_menu(out: &mut Stdout, len: usize) -> io::Result<()> {
    queue!(
        out,
        MoveUp(len as u16 + 1),
        MoveToColumn(0),
        Clear(ClearType::FromCursorDown),
        Show
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_writer_inserts_carriage_returns() {
        let mut out = RawWriter(Vec::new());
        write!(out, "a\nb\n").unwrap();
        assert_eq!(out.0, b"a\r\nb\r\n");
    }

    #[test]
    fn menu_keys_move_and_select() {
        assert_eq!(menu_step(0, 3, Key::Down), MenuStep::Move(1));
        assert_eq!(menu_step(0, 3, Key::Up), MenuStep::Move(2));
        assert_eq!(menu_step(2, 3, Key::Down), MenuStep::Move(0));
        assert_eq!(menu_step(1, 3, Key::Enter), MenuStep::Select(1));
        assert_eq!(menu_step(0, 3, Key::Char('3')), MenuStep::Select(2));
        assert_eq!(menu_step(0, 3, Key::Char('4')), MenuStep::Ignore);
        assert_eq!(menu_step(0, 3, Key::Char('0')), MenuStep::Ignore);
        assert_eq!(menu_step(0, 3, Key::Interrupt), MenuStep::Interrupt);
        assert_eq!(menu_step(0, 0, Key::Enter), MenuStep::Ignore);
    }

    #[test]
    fn menu_marks_selected_line() {
        let options = vec!["api".to_string(), "quit".to_string()];
        let lines = menu_lines(&options, 1);
        assert_eq!(lines[0], (false, "  1. api".to_string()));
        assert_eq!(lines[1], (true, "❯ 2. quit".to_string()));
    }
}
