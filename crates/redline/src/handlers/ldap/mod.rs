//! The LDAP handler: frames BER-encoded LDAP PDUs out of the byte stream,
//! renders them as an editable three-column document, and upgrades the
//! connection in place when it observes a successful StartTLS exchange.

mod edit;
mod printable;

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex, Notify};

use super::tls::TlsHandler;
use super::{
    BoxIo, ConnLocals, Handler, Layer, Message, MessagePair, MessageRecv, MessageSend, Printable,
    Unprintable,
};
use crate::config::LdapArgs;
use crate::display::Side;
use crate::Error;

/// The StartTLS extended operation, RFC 4511 §4.14.
const STARTTLS_OID: &[u8] = b"1.3.6.1.4.1.1466.20037";

const EXTENDED_REQUEST: u8 = 23;
const EXTENDED_RESPONSE: u8 = 24;

pub struct LdapHandler {
    min_width: usize,
    max_width: usize,
    read_size: usize,
    tls: Arc<TlsHandler>,
    /// True when a tls handler already sits below this one in the stack;
    /// the stream is encrypted from byte zero and StartTLS upgrades do not
    /// apply.
    tls_below: bool,
}

impl LdapHandler {
    pub fn new(
        args: &LdapArgs,
        tls: Arc<TlsHandler>,
        read_size: usize,
        tls_below: bool,
    ) -> LdapHandler {
        LdapHandler {
            min_width: args.ldap_min_width,
            max_width: args.ldap_max_width,
            read_size,
            tls,
            tls_below,
        }
    }

    fn wrap(&self, lower: Layer, facing: Side, locals: &ConnLocals) -> Result<Layer, Error> {
        let (rd, wr) = tokio::io::split(lower.into_transport()?);
        let shared = Arc::new(Shared {
            facing,
            tls: self.tls.clone(),
            locals: locals.clone(),
            tls_active: AtomicBool::new(self.tls_below),
            wr_slot: Mutex::new(Some(wr)),
            gate: Gate::new(),
        });
        Ok(Layer::Messages(MessagePair {
            recv: Box::new(LdapRecv {
                rd: Some(rd),
                buf: Vec::new(),
                read_size: self.read_size,
                shared: shared.clone(),
            }),
            send: Box::new(LdapSend { shared }),
        }))
    }
}

#[async_trait]
impl Handler for LdapHandler {
    fn name(&self) -> &'static str {
        "ldap"
    }

    fn frames_messages(&self) -> bool {
        true
    }

    async fn setup_client_facing(&self, lower: Layer, locals: &ConnLocals) -> Result<Layer, Error> {
        self.wrap(lower, Side::Client, locals)
    }

    async fn setup_server_facing(&self, lower: Layer, locals: &ConnLocals) -> Result<Layer, Error> {
        self.wrap(lower, Side::Server, locals)
    }

    fn message_to_printable(&self, msg: &Message) -> Result<Printable, Error> {
        let Message::Ldap(el) = msg else {
            return Err(Error::Printable(
                "ldap received a message from a different handler".into(),
            ));
        };
        let (doc, elided) = printable::element_to_document(el);
        let json = serde_json::to_string_pretty(&doc)?;
        Ok(Printable {
            text: edit::raw_to_editable(&json, self.min_width, self.max_width),
            state: Unprintable::Ldap(elided),
        })
    }

    fn printable_to_message(&self, text: &str, state: &Unprintable) -> Result<Message, Error> {
        let empty = printable::ElidedValues::new();
        let elided = match state {
            Unprintable::Ldap(map) => map,
            Unprintable::None => &empty,
        };
        let lines = edit::editable_to_raw(text)?;
        let doc: serde_json::Value = serde_json::from_str(&lines.join("\n"))?;
        Ok(Message::Ldap(printable::document_to_element(&doc, elided)?))
    }
}

/// State both halves of one LDAP socket share. `facing` says which peer the
/// socket talks to, which decides the direction of a StartTLS upgrade:
/// client-facing sockets re-handshake as a TLS server, server-facing ones
/// as a TLS client.
struct Shared {
    facing: Side,
    tls: Arc<TlsHandler>,
    locals: ConnLocals,
    tls_active: AtomicBool,
    /// The write half, checked out per send. Also the rendezvous the
    /// server-facing upgrade uses to take both halves out of service.
    wr_slot: Mutex<Option<WriteHalf<BoxIo>>>,
    gate: Gate,
}

/// The client-facing StartTLS rendezvous. After the client's StartTLS
/// request is observed, the gate closes: the receive half parks its read
/// half here and waits, keeping the plaintext stream quiet while the
/// response travels back. The send half, having forwarded a success
/// response, is the one authoritative upgrader: it collects both halves,
/// runs the server-side handshake, reinstalls the new halves, and reopens
/// the gate.
struct Gate {
    parked: std::sync::Mutex<Option<ReadHalf<BoxIo>>>,
    parked_notify: Notify,
    open: watch::Sender<bool>,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            parked: std::sync::Mutex::new(None),
            parked_notify: Notify::new(),
            open: watch::channel(true).0,
        }
    }

    fn is_closed(&self) -> bool {
        !*self.open.borrow()
    }

    fn close(&self) {
        self.open.send_replace(false);
    }

    fn reopen(&self) {
        self.open.send_replace(true);
    }
}

struct LdapRecv {
    rd: Option<ReadHalf<BoxIo>>,
    buf: Vec<u8>,
    read_size: usize,
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageRecv for LdapRecv {
    async fn recv(&mut self) -> Result<Option<Message>, Error> {
        self.wait_for_gate().await;
        let Some(rd) = self.rd.as_mut() else {
            // The upgrade path never returned our read half; the stream is
            // effectively gone.
            return Ok(None);
        };

        let element = loop {
            match ldap_ber::decode(&self.buf) {
                Ok((element, used)) => {
                    self.buf.drain(..used);
                    break element;
                }
                Err(ldap_ber::Error::Incomplete) => {
                    let mut chunk = vec![0u8; self.read_size];
                    let n = match rd.read(&mut chunk).await {
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(None),
                        Err(e) => return Err(e.into()),
                    };
                    if n == 0 {
                        if !self.buf.is_empty() {
                            tracing::warn!(
                                facing = %self.shared.facing,
                                pending = self.buf.len(),
                                "peer closed mid-message"
                            );
                        }
                        return Ok(None);
                    }
                    self.buf.extend_from_slice(&chunk[..n]);
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.after_recv(&element).await?;
        Ok(Some(Message::Ldap(element)))
    }
}

impl LdapRecv {
    /// While a client-side StartTLS upgrade is pending, park the read half
    /// where the upgrading send path can reach it and wait for the new one.
    async fn wait_for_gate(&mut self) {
        let mut rx = self.shared.gate.open.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        if let Some(rd) = self.rd.take() {
            *lock(&self.shared.gate.parked) = Some(rd);
            self.shared.gate.parked_notify.notify_one();
        }
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
        self.rd = lock(&self.shared.gate.parked).take();
    }

    async fn after_recv(&mut self, element: &ldap_ber::Element) -> Result<(), Error> {
        if self.shared.tls_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        match self.shared.facing {
            // A successful StartTLS response from the real server: upgrade
            // our side of that conversation before anyone reads further.
            Side::Server if starttls_success_response(element) => self.upgrade_server().await,
            // The client asked for StartTLS. Stop reading from it until the
            // send path has forwarded the server's answer and (on success)
            // upgraded the stream underneath us.
            Side::Client if starttls_request(element) => {
                tracing::debug!(cnxn_id = self.shared.locals.cnxn_id, "client sent StartTLS");
                self.shared.gate.close();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn upgrade_server(&mut self) -> Result<(), Error> {
        tracing::info!(
            cnxn_id = self.shared.locals.cnxn_id,
            "upgrading server-facing socket after StartTLS"
        );
        let mut slot = self.shared.wr_slot.lock().await;
        let (Some(rd), Some(wr)) = (self.rd.take(), slot.take()) else {
            return Err(broken("socket halves unavailable for StartTLS upgrade"));
        };
        let io = rd.unsplit(wr);
        let upgraded = self.shared.tls.connect_server(io, &self.shared.locals).await?;
        let (rd, wr) = tokio::io::split(upgraded);
        self.rd = Some(rd);
        *slot = Some(wr);
        self.shared.tls_active.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct LdapSend {
    shared: Arc<Shared>,
}

#[async_trait]
impl MessageSend for LdapSend {
    async fn send(&mut self, msg: &Message) -> Result<(), Error> {
        let Message::Ldap(element) = msg else {
            return Err(Error::Printable(
                "ldap asked to send a message from a different handler".into(),
            ));
        };
        let bytes = element.to_vec();
        {
            let mut slot = self.shared.wr_slot.lock().await;
            let Some(wr) = slot.as_mut() else {
                return Err(broken("write half unavailable"));
            };
            wr.write_all(&bytes).await?;
            wr.flush().await?;
        }

        // Forwarding an extended response to a client that asked for
        // StartTLS settles the pending upgrade one way or the other.
        if self.shared.facing == Side::Client
            && self.shared.gate.is_closed()
            && !self.shared.tls_active.load(Ordering::SeqCst)
            && extended_response(element).is_some()
        {
            if starttls_success_response(element) {
                self.upgrade_client().await?;
            } else {
                tracing::debug!(
                    cnxn_id = self.shared.locals.cnxn_id,
                    "StartTLS refused; resuming plaintext reads"
                );
                self.shared.gate.reopen();
            }
        }
        Ok(())
    }
}

impl LdapSend {
    async fn upgrade_client(&self) -> Result<(), Error> {
        tracing::info!(
            cnxn_id = self.shared.locals.cnxn_id,
            "upgrading client-facing socket after StartTLS"
        );
        // The receive half parks as soon as it next checks the gate; wait
        // for it rather than racing it for the stream.
        let rd = loop {
            if let Some(rd) = lock(&self.shared.gate.parked).take() {
                break rd;
            }
            self.shared.gate.parked_notify.notified().await;
        };
        let mut slot = self.shared.wr_slot.lock().await;
        let Some(wr) = slot.take() else {
            return Err(broken("write half unavailable for StartTLS upgrade"));
        };
        let io = rd.unsplit(wr);
        let upgraded = self.shared.tls.accept_client(io, &self.shared.locals).await?;
        let (rd, wr) = tokio::io::split(upgraded);
        *slot = Some(wr);
        *lock(&self.shared.gate.parked) = Some(rd);
        self.shared.tls_active.store(true, Ordering::SeqCst);
        self.shared.gate.reopen();
        Ok(())
    }
}

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn broken(msg: &str) -> Error {
    Error::Io(io::Error::new(ErrorKind::BrokenPipe, msg.to_string()))
}

fn protocol_op(message: &ldap_ber::Element) -> Option<&ldap_ber::Element> {
    message
        .children()
        .iter()
        .find(|c| c.tag.class == ldap_ber::Class::Application)
}

/// An ExtendedRequest naming the StartTLS OID.
fn starttls_request(message: &ldap_ber::Element) -> bool {
    let Some(op) = protocol_op(message) else {
        return false;
    };
    op.tag.number == EXTENDED_REQUEST
        && op.children().iter().any(|c| {
            c.tag.class == ldap_ber::Class::Context
                && c.tag.number == 0
                && c.content() == Some(STARTTLS_OID)
        })
}

fn extended_response(message: &ldap_ber::Element) -> Option<&ldap_ber::Element> {
    protocol_op(message).filter(|op| op.tag.number == EXTENDED_RESPONSE)
}

/// An ExtendedResponse with resultCode success and the StartTLS OID as its
/// responseName.
fn starttls_success_response(message: &ldap_ber::Element) -> bool {
    let Some(op) = extended_response(message) else {
        return false;
    };
    let success = op
        .children()
        .iter()
        .find(|c| {
            c.tag.class == ldap_ber::Class::Universal && c.tag.number == ldap_ber::TAG_ENUMERATED
        })
        .and_then(|c| c.as_i64())
        == Some(0);
    let named = op.children().iter().any(|c| {
        c.tag.class == ldap_ber::Class::Context
            && c.tag.number == 10
            && c.content() == Some(STARTTLS_OID)
    });
    success && named
}
