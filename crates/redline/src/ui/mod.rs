//! The UI coordinator: a single thread that owns the terminal and the
//! editor, consuming tagged messages from every connection over one
//! channel. Serializing all interaction here means at most one edit
//! session ever exists, no matter how many connections are in flight.

mod term;

pub use term::restore_terminal;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio::sync::mpsc;

use crate::display::{DisplayMsg, QueueKey, Side};
use crate::Cli;

#[derive(Debug, Clone)]
pub struct UiConfig {
    pub intercept_client: bool,
    pub intercept_server: bool,
    pub client_keypress: char,
    pub server_keypress: char,
    pub editor: String,
    pub client_color: u8,
    pub server_color: u8,
    pub error_color: u8,
    pub notification_color: u8,
}

impl UiConfig {
    pub fn from_cli(cli: &Cli) -> UiConfig {
        UiConfig {
            intercept_client: !cli.pass_client,
            intercept_server: cli.intercept_server,
            client_keypress: cli.intercept_client_keypress,
            server_keypress: cli.intercept_server_keypress,
            editor: cli.editor.clone(),
            client_color: cli.client_color,
            server_color: cli.server_color,
            error_color: cli.error_color,
            notification_color: cli.notification_color,
        }
    }
}

/// Which sides are currently intercepted for editing. Written only by the
/// keystroke thread, read only by the coordinator, both under the mutex.
#[derive(Debug, Copy, Clone)]
pub struct Intercept {
    pub client: bool,
    pub server: bool,
}

/// Start the coordinator on its own OS thread. It blocks on the terminal
/// and the editor, so it deliberately lives outside the async runtime; the
/// display channel's blocking APIs bridge the two worlds. The thread exits
/// when every sender of `rx` is gone.
pub fn spawn(cfg: UiConfig, rx: mpsc::Receiver<DisplayMsg>) -> thread::JoinHandle<()> {
    thread::spawn(move || run(cfg, rx))
}

fn run(cfg: UiConfig, mut rx: mpsc::Receiver<DisplayMsg>) {
    let term = Arc::new(term::Terminal::new());
    let intercept = Arc::new(Mutex::new(Intercept {
        client: cfg.intercept_client,
        server: cfg.intercept_server,
    }));
    term::spawn_key_thread(term.clone(), intercept.clone(), cfg.clone());

    let mut return_channels: HashMap<QueueKey, mpsc::Sender<String>> = HashMap::new();

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            DisplayMsg::Register(key, tx) => {
                return_channels.insert(key, tx);
            }
            DisplayMsg::Kill(key) => {
                return_channels.remove(&key);
            }
            DisplayMsg::Err(summary, detail) => {
                term.print_error(&summary, &detail, cfg.error_color);
            }
            DisplayMsg::Note(text) => {
                term.print_note(&text, cfg.notification_color);
            }
            DisplayMsg::Payload(key, text) => {
                let (edit, color) = {
                    let state = intercept.lock().unwrap_or_else(|e| e.into_inner());
                    match key.side {
                        Side::Client => (state.client, cfg.client_color),
                        Side::Server => (state.server, cfg.server_color),
                    }
                };

                term.print_payload(&text, color);
                let result = if edit {
                    match term.edit_text(&cfg.editor, &text) {
                        Ok(edited) => edited,
                        Err(error) => {
                            // A broken editor should not break the proxy;
                            // the message goes through unedited.
                            term.print_error(
                                "Error in printing/editing.",
                                &error.to_string(),
                                cfg.error_color,
                            );
                            text
                        }
                    }
                } else {
                    text
                };

                // A direction that died while we were editing simply loses
                // its result.
                if let Some(tx) = return_channels.get(&key) {
                    let _ = tx.blocking_send(result);
                }
            }
        }
    }

    restore_terminal();
}
