//! Per-connection supervision. Each accepted socket gets one connection
//! manager, which runs two forwarders: client→server and server→client.
//! The outbound socket is created lazily by the client→server forwarder
//! after the client's first message, because that message can carry the
//! protocol details (SNI, StartTLS) the server-facing handshake needs; the
//! server→client forwarder only starts once the outbound side exists.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::display::{post_error, DisplayMsg, DisplayTx, QueueKey, Side};
use crate::handlers::{ConnLocals, HandlerStack, Message, MessagePair, MessageRecv, MessageSend};
use crate::Error;

pub async fn manage_connection(
    client: TcpStream,
    cnxn_id: u64,
    stack: Arc<HandlerStack>,
    server_addr: SocketAddr,
    display: DisplayTx,
    shutdown: CancellationToken,
) {
    let locals = ConnLocals::new(cnxn_id);
    let client_key = QueueKey {
        cnxn_id,
        side: Side::Client,
    };
    let server_key = QueueKey {
        cnxn_id,
        side: Side::Server,
    };

    // Register both result channels before any payload can reach the UI.
    let (client_result_tx, client_result_rx) = mpsc::channel(1);
    let (server_result_tx, server_result_rx) = mpsc::channel(1);
    if display
        .send(DisplayMsg::Register(client_key, client_result_tx))
        .await
        .is_err()
        || display
            .send(DisplayMsg::Register(server_key, server_result_tx))
            .await
            .is_err()
    {
        return;
    }

    run_forwarders(
        client,
        cnxn_id,
        stack,
        server_addr,
        &display,
        &shutdown,
        locals,
        client_result_rx,
        server_result_rx,
    )
    .await;

    // Release the UI's channel registrations whichever way we went down.
    let _ = display.send(DisplayMsg::Kill(client_key)).await;
    let _ = display.send(DisplayMsg::Kill(server_key)).await;
    tracing::debug!(cnxn_id, "connection closed");
}

#[allow(clippy::too_many_arguments)]
async fn run_forwarders(
    client: TcpStream,
    cnxn_id: u64,
    stack: Arc<HandlerStack>,
    server_addr: SocketAddr,
    display: &DisplayTx,
    shutdown: &CancellationToken,
    locals: ConnLocals,
    client_result_rx: mpsc::Receiver<String>,
    server_result_rx: mpsc::Receiver<String>,
) {
    let pair = match stack.setup_client_facing(Box::new(client), &locals).await {
        Ok(pair) => pair,
        Err(e) => {
            post_error(display, "Error setting up listener.", e).await;
            return;
        }
    };
    let MessagePair {
        recv: client_recv,
        send: client_send,
    } = pair;

    let (connected_tx, connected_rx) = oneshot::channel();

    let client_to_server = Forwarder {
        cnxn_id,
        listen: Side::Client,
        recv: client_recv,
        send: None,
        upstream: Some(Upstream {
            addr: server_addr,
            locals,
            stack: stack.clone(),
            connected: connected_tx,
        }),
        display: display.clone(),
        result_rx: client_result_rx,
        stack: stack.clone(),
        shutdown: shutdown.clone(),
    };
    let client_task = tokio::spawn(client_to_server.run());

    // Hold the server→client direction until the outbound socket exists.
    // If the client→server forwarder dies first, its Upstream (and with it
    // the oneshot sender) drops and we skip the second direction entirely.
    let server_recv = tokio::select! {
        _ = shutdown.cancelled() => None,
        received = connected_rx => received.ok(),
    };

    let server_task = server_recv.map(|recv| {
        let server_to_client = Forwarder {
            cnxn_id,
            listen: Side::Server,
            recv,
            send: Some(client_send),
            upstream: None,
            display: display.clone(),
            result_rx: server_result_rx,
            stack,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(server_to_client.run())
    });

    let _ = client_task.await;
    if let Some(task) = server_task {
        let _ = task.await;
    }
}

/// Everything the client→server forwarder needs to build the outbound
/// socket on first use.
struct Upstream {
    addr: SocketAddr,
    locals: ConnLocals,
    stack: Arc<HandlerStack>,
    connected: oneshot::Sender<Box<dyn MessageRecv>>,
}

/// One direction of one connection.
struct Forwarder {
    cnxn_id: u64,
    listen: Side,
    recv: Box<dyn MessageRecv>,
    send: Option<Box<dyn MessageSend>>,
    upstream: Option<Upstream>,
    display: DisplayTx,
    result_rx: mpsc::Receiver<String>,
    stack: Arc<HandlerStack>,
    shutdown: CancellationToken,
}

impl Forwarder {
    async fn run(mut self) {
        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = self.recv.recv() => received,
            };
            let msg = match received {
                Ok(Some(msg)) => msg,
                // Remote closed; this direction is done.
                Ok(None) => return,
                Err(Error::Io(e)) if self.stack.retry_kinds().contains(&e.kind()) => continue,
                Err(e) => {
                    Self::report(&self.display, "Error in forwarder.", &e).await;
                    return;
                }
            };

            let printable = match self.stack.top().message_to_printable(&msg) {
                Ok(printable) => printable,
                Err(e) => {
                    Self::report(&self.display, "Error decoding message for display.", &e).await;
                    continue;
                }
            };

            let key = QueueKey {
                cnxn_id: self.cnxn_id,
                side: self.listen,
            };
            if self
                .display
                .send(DisplayMsg::Payload(key, printable.text))
                .await
                .is_err()
            {
                return;
            }
            let edited = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                edited = self.result_rx.recv() => match edited {
                    Some(text) => text,
                    None => return,
                },
            };

            let outgoing = match self
                .stack
                .top()
                .printable_to_message(&edited, &printable.state)
            {
                Ok(msg) => msg,
                Err(e) => {
                    // The edit broke the encoding; forward what we received.
                    Self::report(&self.display, "Error re-encoding edited message; forwarding the original.", &e)
                        .await;
                    msg.clone()
                }
            };

            if self.send.is_none() && !self.connect_upstream().await {
                return;
            }
            if !self.send_message(&outgoing).await {
                return;
            }
        }
    }

    /// Build the server-facing socket, hand its receive half to the
    /// connection manager, and keep the send half. True on success.
    async fn connect_upstream(&mut self) -> bool {
        let Some(upstream) = self.upstream.take() else {
            // The server→client direction starts with its send half present
            // and never lands here.
            return false;
        };
        tracing::debug!(cnxn_id = self.cnxn_id, addr = %upstream.addr, "connecting to server");
        let result = async {
            let socket = TcpStream::connect(upstream.addr).await?;
            upstream
                .stack
                .setup_server_facing(Box::new(socket), &upstream.locals)
                .await
        }
        .await;
        match result {
            Ok(MessagePair { recv, send }) => {
                self.send = Some(send);
                let _ = upstream.connected.send(recv);
                true
            }
            Err(e) => {
                Self::report(&self.display, "Error setting up sender.", &e).await;
                false
            }
        }
    }

    /// True on success; on an unrecoverable send error both directions are
    /// torn down, since a connection with a dead half is useless.
    async fn send_message(&mut self, msg: &Message) -> bool {
        let Some(send) = self.send.as_mut() else {
            return false;
        };
        loop {
            match send.send(msg).await {
                Ok(()) => return true,
                Err(Error::Io(e)) if self.stack.retry_kinds().contains(&e.kind()) => continue,
                Err(e) => {
                    Self::report(&self.display, "Error sending data.", &e).await;
                    self.shutdown.cancel();
                    return false;
                }
            }
        }
    }

    async fn report(display: &DisplayTx, summary: &str, error: &Error) {
        post_error(display, summary, error).await;
    }
}
