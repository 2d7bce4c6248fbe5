//! The message protocol between the per-connection tasks and the UI
//! coordinator. Everything user-visible flows through one channel of
//! [`DisplayMsg`], so the terminal has exactly one owner.

use std::fmt;

use tokio::sync::mpsc;

/// One side of a proxied connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one direction of one connection, e.g. `7client` is the
/// client-to-server direction of connection 7.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    pub cnxn_id: u64,
    pub side: Side,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.cnxn_id, self.side)
    }
}

/// Messages accepted by the UI coordinator.
#[derive(Debug)]
pub enum DisplayMsg {
    /// Register the return channel for a direction. Sent once, before any
    /// payload for that direction.
    Register(QueueKey, mpsc::Sender<String>),
    /// A printable message from this direction wants display and possibly
    /// an edit. The (edited or original) text comes back on the registered
    /// return channel.
    Payload(QueueKey, String),
    /// The direction died; forget its return channel.
    Kill(QueueKey),
    /// An error report: short summary plus detail.
    Err(String, String),
    /// A plain notification.
    Note(String),
}

pub type DisplayTx = mpsc::Sender<DisplayMsg>;

/// Post an error report, ignoring a UI that has already gone away.
pub async fn post_error(tx: &DisplayTx, summary: &str, detail: impl fmt::Display) {
    let _ = tx
        .send(DisplayMsg::Err(summary.to_string(), detail.to_string()))
        .await;
}
