//! Command-line configuration. Handler-specific flags live in flattened
//! argument groups so `--help` shows everything in one place; the handler
//! registry turns `--handlers` names into the configured pipeline.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser};

use crate::handlers::ldap::LdapHandler;
use crate::handlers::rawbytes::RawBytes;
use crate::handlers::tls::TlsHandler;
use crate::handlers::{Handler, HandlerStack};
use crate::logging::LogArgs;
use crate::Error;

/// An interactive TCP proxy for inspecting and tampering with traffic.
#[derive(Debug, Parser)]
#[command(name = "redline", version, about, rename_all = "snake_case")]
pub struct Cli {
    /// Protocol and message handlers to apply, outermost transport first.
    /// The default of 'tls rawbytes' terminates TLS and then shows you the
    /// raw bytes inside it. The last handler renders messages for editing.
    #[arg(long, num_args = 1.., default_values = ["tls", "rawbytes"])]
    pub handlers: Vec<String>,

    /// IP address of a local interface to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_ip: Ipv4Addr,

    /// TCP port to listen for incoming connections on.
    #[arg(long, default_value_t = 3125)]
    pub listen_port: u16,

    /// The IP address of the server where traffic will be forwarded.
    #[arg(long, default_value = "127.0.0.1")]
    pub server_ip: Ipv4Addr,

    /// TCP port on the remote server to send traffic to; probably the same
    /// as listen_port.
    #[arg(long, default_value_t = 3125)]
    pub server_port: u16,

    /// Max number of simultaneous connections supported.
    #[arg(long, default_value_t = 5)]
    pub max_connections: usize,

    /// Number of bytes per read from the wire.
    #[arg(long, default_value_t = 4096)]
    pub read_size: usize,

    /// Do not intercept client traffic for editing (it is intercepted by
    /// default).
    #[arg(long)]
    pub pass_client: bool,

    /// Intercept server traffic for editing (it passes through by default).
    #[arg(long)]
    pub intercept_server: bool,

    /// Key which toggles interception of client traffic. Case sensitive.
    #[arg(long, default_value_t = 'c')]
    pub intercept_client_keypress: char,

    /// Key which toggles interception of server traffic. Case sensitive.
    #[arg(long, default_value_t = 's')]
    pub intercept_server_keypress: char,

    /// Command used to launch the editor.
    #[arg(long, default_value = "nano")]
    pub editor: String,

    /// 8-bit color code for client-sent messages.
    #[arg(long, default_value_t = 13)]
    pub client_color: u8,

    /// 8-bit color code for server-sent messages.
    #[arg(long, default_value_t = 14)]
    pub server_color: u8,

    /// 8-bit color code for error messages.
    #[arg(long, default_value_t = 9)]
    pub error_color: u8,

    /// 8-bit color code for non-error notifications.
    #[arg(long, default_value_t = 11)]
    pub notification_color: u8,

    #[command(flatten)]
    pub tls: TlsArgs,

    #[command(flatten)]
    pub ldap: LdapArgs,

    #[command(flatten)]
    pub log: LogArgs,
}

#[derive(Debug, Clone, Args)]
#[command(rename_all = "snake_case")]
pub struct TlsArgs {
    /// Path to a TLS certificate trusted by the software that produces
    /// your traffic. Used as the signing CA for minted leaves.
    #[arg(long, default_value = "./tls_cert.pem")]
    pub serv_cert: PathBuf,

    /// Path to the private key corresponding to --serv_cert.
    #[arg(long, default_value = "./tls_key.pem")]
    pub serv_key: PathBuf,

    /// A client certificate offered to the real server for mTLS. Only
    /// effective together with --client_key.
    #[arg(long, requires = "client_key")]
    pub client_cert: Option<PathBuf>,

    /// The private key corresponding to --client_cert.
    #[arg(long, requires = "client_cert")]
    pub client_key: Option<PathBuf>,

    /// Hostname used for leaf certificates when the client does not send
    /// SNI.
    #[arg(long, default_value = "example.com")]
    pub server_name: String,

    /// Present --serv_cert/--serv_key as-is instead of minting per-SNI
    /// leaf certificates.
    #[arg(long)]
    pub static_servername: bool,

    /// Directory where minted leaf certificates are cached.
    #[arg(long, default_value = "certs")]
    pub cert_dir: PathBuf,
}

#[derive(Debug, Clone, Args)]
#[command(rename_all = "snake_case")]
pub struct LdapArgs {
    /// Minimum line width to pad the LDAP display out to.
    #[arg(long, default_value_t = 60)]
    pub ldap_min_width: usize,

    /// Maximum line width to pad the LDAP display out to. Genuinely longer
    /// lines are shown in full but do not add padding to shorter ones.
    #[arg(long, default_value_t = 120)]
    pub ldap_max_width: usize,
}

/// Build the configured handler pipeline. Unknown names fail here, at
/// startup, rather than on the first connection.
pub fn build_stack(cli: &Cli) -> Result<HandlerStack, Error> {
    let mut handlers: Vec<Arc<dyn Handler>> = Vec::new();
    let mut tls: Option<Arc<TlsHandler>> = None;

    for name in &cli.handlers {
        match name.as_str() {
            "rawbytes" => handlers.push(Arc::new(RawBytes::new(cli.read_size))),
            "tls" => {
                let handler = Arc::new(TlsHandler::new(&cli.tls)?);
                tls = Some(handler.clone());
                handlers.push(handler);
            }
            "ldap" => {
                // StartTLS upgrades reuse the TLS handler already in the
                // stack when there is one; otherwise the ldap handler gets
                // its own, configured from the same flags.
                let tls_below = tls.is_some();
                let tls = match &tls {
                    Some(tls) => tls.clone(),
                    None => Arc::new(TlsHandler::new(&cli.tls)?),
                };
                handlers.push(Arc::new(LdapHandler::new(
                    &cli.ldap,
                    tls,
                    cli.read_size,
                    tls_below,
                )));
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown handler '{other}' (known handlers: ldap, rawbytes, tls)"
                )))
            }
        }
    }

    HandlerStack::new(handlers)
}
