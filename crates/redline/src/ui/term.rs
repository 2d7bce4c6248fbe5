//! Terminal custody. The keystroke listener needs the terminal in raw mode
//! to read single unechoed keys, the editor needs it back in canonical mode
//! and untouched, and both must never fight over stdin. One lock arbitrates;
//! raw mode is flipped only while that lock is held.

use std::io::{self, Read, Write};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal;

use super::{Intercept, UiConfig};

pub struct Terminal {
    stdin_lock: Mutex<()>,
}

impl Terminal {
    /// Take the terminal into raw mode for keystroke capture.
    pub fn new() -> Terminal {
        if let Err(error) = terminal::enable_raw_mode() {
            tracing::warn!(%error, "could not enable raw terminal mode; toggles disabled");
        }
        Terminal {
            stdin_lock: Mutex::new(()),
        }
    }

    fn lock_stdin(&self) -> MutexGuard<'_, ()> {
        self.stdin_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Print a message payload to stdout in the given colour.
    pub fn print_payload(&self, text: &str, color: u8) {
        let mut out = io::stdout().lock();
        let _ = write_colored(&mut out, text, color);
        let _ = out.flush();
    }

    /// Print an error (summary plus indented detail) to stderr.
    pub fn print_error(&self, summary: &str, detail: &str, color: u8) {
        let mut text = String::from(summary);
        text.push('\n');
        for line in detail.lines() {
            text.push('\t');
            text.push_str(line);
            text.push('\n');
        }
        let mut err = io::stderr().lock();
        let _ = write_colored(&mut err, &text, color);
        let _ = err.flush();
    }

    /// Print a notification to stderr.
    pub fn print_note(&self, text: &str, color: u8) {
        let mut err = io::stderr().lock();
        let _ = write_colored(&mut err, text, color);
        let _ = err.flush();
    }

    /// Hand the terminal to `<editor> <tmpfile>` and return the edited
    /// text. Keystroke capture is paused for the duration: we hold the
    /// stdin lock and restore canonical mode so the editor sees a normal
    /// terminal.
    pub fn edit_text(&self, editor: &str, text: &str) -> io::Result<String> {
        let _guard = self.lock_stdin();
        let _ = terminal::disable_raw_mode();
        let result = run_editor(editor, text);
        let _ = terminal::enable_raw_mode();
        result
    }
}

fn run_editor(editor: &str, text: &str) -> io::Result<String> {
    let mut tmpfile = tempfile::NamedTempFile::new()?;
    tmpfile.write_all(text.as_bytes())?;
    tmpfile.flush()?;

    let status = Command::new(editor).arg(tmpfile.path()).status()?;
    if !status.success() {
        return Err(io::Error::other(format!("editor exited with {status}")));
    }

    let mut edited = String::new();
    tmpfile.reopen()?.read_to_string(&mut edited)?;
    Ok(edited)
}

/// Restore canonical terminal mode. Safe to call at any time, from any
/// thread, including a signal path about to end the process.
pub fn restore_terminal() {
    let _ = terminal::disable_raw_mode();
}

// SGR 256-colour wrapping. Raw mode disables output post-processing, so
// bare newlines would stairstep; emit explicit carriage returns.
fn write_colored(out: &mut impl Write, text: &str, color: u8) -> io::Result<()> {
    write!(out, "\x1b[38;5;{color}m")?;
    let mut first = true;
    for line in text.split('\n') {
        if !first {
            out.write_all(b"\r\n")?;
        }
        out.write_all(line.as_bytes())?;
        first = false;
    }
    out.write_all(b"\x1b[0m\r\n")
}

/// Run the keystroke listener: single raw keys toggle interception per
/// side, and any key echoes the current state as a notification. Polling
/// under the stdin lock keeps this thread parked while an editor owns the
/// terminal.
pub fn spawn_key_thread(
    term: Arc<Terminal>,
    intercept: Arc<Mutex<Intercept>>,
    cfg: UiConfig,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || loop {
        let key = {
            let _guard = term.lock_stdin();
            match event::poll(Duration::from_millis(100)) {
                Ok(true) => match event::read() {
                    Ok(Event::Key(key)) => Some(key),
                    Ok(_) => None,
                    Err(_) => None,
                },
                Ok(false) => None,
                Err(_) => return,
            }
        };
        let Some(KeyEvent {
            code: KeyCode::Char(c),
            modifiers,
            ..
        }) = key
        else {
            continue;
        };

        // Raw mode swallows the usual interrupt; honour it by hand.
        if modifiers.contains(KeyModifiers::CONTROL) && c == 'c' {
            restore_terminal();
            std::process::exit(0);
        }

        let state = {
            let mut state = intercept.lock().unwrap_or_else(|e| e.into_inner());
            if c == cfg.client_keypress {
                state.client = !state.client;
            } else if c == cfg.server_keypress {
                state.server = !state.server;
            }
            *state
        };
        let mut sides = Vec::new();
        if state.client {
            sides.push("client");
        }
        if state.server {
            sides.push("server");
        }
        term.print_note(
            &format!(
                "Currently intercepting messages from {}",
                sides.join(", ")
            ),
            cfg.notification_color,
        );
    })
}
