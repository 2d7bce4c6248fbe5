//! The accept loop: binds the listening socket, assigns connection ids,
//! and spawns a connection manager per accepted socket. Connection count is
//! bounded by a semaphore; the listener's backlog matches so waiting
//! clients queue in the kernel until a slot frees up.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::connection::manage_connection;
use crate::display::{post_error, DisplayTx};
use crate::handlers::HandlerStack;

/// Bind the listening socket with address reuse, so a restart does not
/// trip over the previous run's TIME_WAIT sockets.
pub fn bind_listener(ip: IpAddr, port: u16, backlog: i32) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::new(ip, port).into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

pub async fn serve(
    listener: TcpListener,
    stack: Arc<HandlerStack>,
    server_addr: SocketAddr,
    max_connections: usize,
    display: DisplayTx,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let limit = Arc::new(Semaphore::new(max_connections));
    let mut next_id: u64 = 0;

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            },
        };

        let (socket, addr) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    post_error(&display, "Listener dying, shutting down.", &e).await;
                    // Give the UI a moment to print before the process goes.
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    shutdown.cancel();
                    return Err(e).context("accepting connections");
                }
            },
        };

        let cnxn_id = next_id;
        next_id += 1;
        tracing::info!(cnxn_id, %addr, "accepted client connection");

        let stack = stack.clone();
        let display = display.clone();
        let connection_shutdown = shutdown.child_token();
        tokio::spawn(async move {
            manage_connection(
                socket,
                cnxn_id,
                stack,
                server_addr,
                display,
                connection_shutdown,
            )
            .await;
            drop(permit);
        });
    }
}
