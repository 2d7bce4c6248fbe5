//! An interactive TCP proxy. Every message crossing it is decoded by a
//! configurable handler pipeline into an editable text form, shown on the
//! operator's terminal, optionally opened in an external editor for
//! tampering, then re-encoded and forwarded. TLS connections are terminated
//! on the fly with per-hostname leaf certificates minted from an
//! operator-supplied CA, keyed by the client's SNI.

pub mod acceptor;
pub mod ca;
pub mod config;
pub mod connection;
pub mod display;
pub mod handlers;
pub mod logging;
pub mod ui;

pub use config::Cli;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io operation error")]
    Io(#[from] std::io::Error),

    #[error("TLS error")]
    Tls(#[from] rustls::Error),

    #[error("'{0}' is not a valid TLS server name")]
    InvalidServerName(String),

    #[error("openssl error")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("BER codec error")]
    Ber(#[from] ldap_ber::Error),

    #[error("JSON error")]
    Json(#[from] serde_json::Error),

    #[error("the {0} handler does not produce printable messages")]
    NotPrintable(&'static str),

    #[error("unusable printable form: {0}")]
    Printable(String),

    #[error("{0}")]
    Config(String),
}
