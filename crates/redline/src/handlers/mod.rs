//! The protocol handler pipeline.
//!
//! A handler stack is an ordered list of handlers configured once at
//! startup. Per connection, each handler wraps the socket produced by the
//! handler below it: transport handlers (tls) map a byte stream to another
//! byte stream, and the topmost handler frames the stream into whole
//! protocol messages. Only the topmost handler converts messages to and
//! from the printable form the operator edits.

pub mod ldap;
pub mod rawbytes;
pub mod tls;

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::Error;

/// A duplex byte transport. The bottom of every stack is a TCP stream;
/// transport handlers replace it with e.g. a TLS stream.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxIo = Box<dyn Io>;

/// One whole protocol message. Its concrete shape is opaque outside the
/// handler that produced it.
#[derive(Debug, Clone)]
pub enum Message {
    Raw(Vec<u8>),
    Ldap(ldap_ber::Element),
}

/// Parts of a message that cannot round-trip through its printable text,
/// keyed however the producing handler likes. Passed back verbatim to
/// `printable_to_message`.
#[derive(Debug, Clone, Default)]
pub enum Unprintable {
    #[default]
    None,
    /// Raw values elided from the LDAP printable form, keyed by the
    /// child-index path of the element they belong to.
    Ldap(BTreeMap<Vec<usize>, Vec<u8>>),
}

/// A message rendered for the operator, plus its unprintable remainder.
#[derive(Debug)]
pub struct Printable {
    pub text: String,
    pub state: Unprintable,
}

/// Receive half of a message-granular socket.
#[async_trait]
pub trait MessageRecv: Send {
    /// One complete message, or None once the remote has closed.
    async fn recv(&mut self) -> Result<Option<Message>, Error>;
}

/// Send half of a message-granular socket.
#[async_trait]
pub trait MessageSend: Send {
    async fn send(&mut self, msg: &Message) -> Result<(), Error>;
}

pub struct MessagePair {
    pub recv: Box<dyn MessageRecv>,
    pub send: Box<dyn MessageSend>,
}

/// What a handler hands to the handler above it.
pub enum Layer {
    Transport(BoxIo),
    Messages(MessagePair),
}

impl Layer {
    pub fn into_transport(self) -> Result<BoxIo, Error> {
        match self {
            Layer::Transport(io) => Ok(io),
            Layer::Messages(_) => Err(Error::Config(
                "handler ordering is wrong: a message-framing handler may only be last".into(),
            )),
        }
    }

    fn into_messages(self) -> Result<MessagePair, Error> {
        match self {
            Layer::Messages(pair) => Ok(pair),
            Layer::Transport(_) => Err(Error::Config(
                "the last handler must frame messages (tls cannot be last)".into(),
            )),
        }
    }
}

/// Per-connection scratch shared by the handlers on that connection.
#[derive(Clone)]
pub struct ConnLocals {
    pub cnxn_id: u64,
    /// The SNI hostname recorded during the client-facing TLS handshake,
    /// reused by the server-facing handshake and for leaf minting.
    pub sni_hostname: Arc<Mutex<Option<String>>>,
}

impl ConnLocals {
    pub fn new(cnxn_id: u64) -> ConnLocals {
        ConnLocals {
            cnxn_id,
            sni_hostname: Arc::new(Mutex::new(None)),
        }
    }
}

/// A protocol handler. Configured once at startup; `setup_*` runs once per
/// connection and side, before any bytes flow in that direction.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this handler's sockets speak whole messages (true) or bytes.
    fn frames_messages(&self) -> bool;

    /// Error kinds from the layers below that mean "incomplete, try again".
    /// The forwarder loops instead of surfacing these.
    fn retry_errors(&self) -> &'static [io::ErrorKind] {
        &[]
    }

    /// Wrap the socket facing the connecting client.
    async fn setup_client_facing(&self, lower: Layer, locals: &ConnLocals) -> Result<Layer, Error>;

    /// Wrap the socket facing the real server. Called lazily, after the
    /// client's first message has been seen, so protocol details gleaned
    /// from it (SNI, StartTLS) can steer the outbound side.
    async fn setup_server_facing(&self, lower: Layer, locals: &ConnLocals) -> Result<Layer, Error>;

    fn message_to_printable(&self, _msg: &Message) -> Result<Printable, Error> {
        Err(Error::NotPrintable(self.name()))
    }

    fn printable_to_message(&self, _text: &str, _state: &Unprintable) -> Result<Message, Error> {
        Err(Error::NotPrintable(self.name()))
    }
}

/// The configured, validated pipeline.
pub struct HandlerStack {
    handlers: Vec<Arc<dyn Handler>>,
    retry: Vec<io::ErrorKind>,
}

impl std::fmt::Debug for HandlerStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerStack")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl HandlerStack {
    pub fn new(handlers: Vec<Arc<dyn Handler>>) -> Result<HandlerStack, Error> {
        let Some(top) = handlers.last() else {
            return Err(Error::Config("at least one handler is required".into()));
        };
        if !top.frames_messages() {
            return Err(Error::Config(format!(
                "the last handler must convert messages for display, and '{}' does not",
                top.name()
            )));
        }
        for h in &handlers[..handlers.len() - 1] {
            if h.frames_messages() {
                return Err(Error::Config(format!(
                    "handler '{}' frames messages and may only appear last",
                    h.name()
                )));
            }
        }
        let retry = handlers
            .iter()
            .flat_map(|h| h.retry_errors().iter().copied())
            .collect();
        Ok(HandlerStack { handlers, retry })
    }

    /// The handler whose printable conversion the engine uses.
    pub fn top(&self) -> &dyn Handler {
        &**self.handlers.last().expect("stack is never empty")
    }

    pub fn retry_kinds(&self) -> &[io::ErrorKind] {
        &self.retry
    }

    pub async fn setup_client_facing(
        &self,
        io: BoxIo,
        locals: &ConnLocals,
    ) -> Result<MessagePair, Error> {
        let mut layer = Layer::Transport(io);
        for handler in &self.handlers {
            layer = handler.setup_client_facing(layer, locals).await?;
        }
        layer.into_messages()
    }

    pub async fn setup_server_facing(
        &self,
        io: BoxIo,
        locals: &ConnLocals,
    ) -> Result<MessagePair, Error> {
        let mut layer = Layer::Transport(io);
        for handler in &self.handlers {
            layer = handler.setup_server_facing(layer, locals).await?;
        }
        layer.into_messages()
    }
}
