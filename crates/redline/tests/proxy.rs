//! End-to-end tests over real localhost sockets. The terminal UI is
//! decoupled from the engine by the display-channel protocol, so these
//! tests stand in a scripted driver for it: every payload is answered
//! through the registered return channel, optionally "edited" first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use redline::config::{self, Cli};
use redline::display::DisplayMsg;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type EditFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

fn passthrough() -> EditFn {
    Arc::new(|text| text.to_string())
}

/// Stand-in for the terminal UI: registers return channels and answers
/// every payload with `edit(text)`.
async fn scripted_ui(mut rx: mpsc::Receiver<DisplayMsg>, edit: EditFn) {
    let mut channels = HashMap::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            DisplayMsg::Register(key, tx) => {
                channels.insert(key, tx);
            }
            DisplayMsg::Payload(key, text) => {
                if let Some(tx) = channels.get(&key) {
                    let _ = tx.send(edit(&text)).await;
                }
            }
            DisplayMsg::Kill(key) => {
                channels.remove(&key);
            }
            DisplayMsg::Err(summary, detail) => {
                eprintln!("proxy reported: {summary}\n{detail}");
            }
            DisplayMsg::Note(_) => {}
        }
    }
}

/// Start a proxy for `args` (less the addressing flags, which are filled
/// in here), forwarding to `upstream`. Returns its listening address.
fn start_proxy(
    extra_args: &[&str],
    upstream: SocketAddr,
    edit: EditFn,
    shutdown: &CancellationToken,
) -> SocketAddr {
    let mut argv = vec!["redline".to_string()];
    argv.extend(extra_args.iter().map(|s| s.to_string()));
    argv.extend([
        "--server_ip".to_string(),
        "127.0.0.1".to_string(),
        "--server_port".to_string(),
        upstream.port().to_string(),
    ]);
    let cli = Cli::parse_from(argv);

    let stack = Arc::new(config::build_stack(&cli).expect("handler stack builds"));
    let listener =
        redline::acceptor::bind_listener("127.0.0.1".parse().unwrap(), 0, 16).expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let (display_tx, display_rx) = mpsc::channel(64);
    tokio::spawn(scripted_ui(display_rx, edit));
    tokio::spawn(redline::acceptor::serve(
        listener,
        stack,
        upstream,
        cli.max_connections,
        display_tx,
        shutdown.clone(),
    ));
    addr
}

/// A one-connection-at-a-time upstream that records what it reads and
/// answers each read with `reply`.
async fn spawn_echo_upstream(reply: &'static [u8]) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let _ = seen_tx.send(buf[..n].to_vec());
                            if socket.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, seen_rx)
}

#[tokio::test]
async fn raw_pass_through() {
    let shutdown = CancellationToken::new();
    let (upstream, mut seen) = spawn_echo_upstream(b"pong\n").await;
    let proxy = start_proxy(&["--handlers", "rawbytes"], upstream, passthrough(), &shutdown);

    let mut client = TcpStream::connect(proxy).await.expect("connect");
    client.write_all(b"ping\n").await.expect("write");

    assert_eq!(seen.recv().await.expect("upstream saw data"), b"ping\n");

    let mut reply = vec![0u8; 5];
    client.read_exact(&mut reply).await.expect("read");
    assert_eq!(reply, b"pong\n");

    shutdown.cancel();
}

#[tokio::test]
async fn edited_messages_reach_the_server() {
    let shutdown = CancellationToken::new();
    let (upstream, mut seen) = spawn_echo_upstream(b"pong\n").await;
    // The operator upper-cases the request in their "editor".
    let edit: EditFn = Arc::new(|text| text.replace("ping", "PING"));
    let proxy = start_proxy(&["--handlers", "rawbytes"], upstream, edit, &shutdown);

    let mut client = TcpStream::connect(proxy).await.expect("connect");
    client.write_all(b"ping\n").await.expect("write");

    assert_eq!(seen.recv().await.expect("upstream saw data"), b"PING\n");
    shutdown.cancel();
}

#[tokio::test]
async fn broken_edits_fall_back_to_the_original() {
    let shutdown = CancellationToken::new();
    let (upstream, mut seen) = spawn_echo_upstream(b"pong\n").await;
    // An edit that destroys the byte literal entirely.
    let edit: EditFn = Arc::new(|_| "not a literal at all".to_string());
    let proxy = start_proxy(&["--handlers", "rawbytes"], upstream, edit, &shutdown);

    let mut client = TcpStream::connect(proxy).await.expect("connect");
    client.write_all(b"ping\n").await.expect("write");

    assert_eq!(seen.recv().await.expect("upstream saw data"), b"ping\n");
    shutdown.cancel();
}

#[tokio::test]
async fn concurrent_connections_stay_isolated() {
    let shutdown = CancellationToken::new();
    let (upstream, mut seen) = spawn_echo_upstream(b"ack").await;
    let proxy = start_proxy(&["--handlers", "rawbytes"], upstream, passthrough(), &shutdown);

    let mut a = TcpStream::connect(proxy).await.expect("connect a");
    let mut b = TcpStream::connect(proxy).await.expect("connect b");

    a.write_all(b"from-a").await.expect("write a");
    b.write_all(b"from-b").await.expect("write b");

    let mut observed = vec![
        seen.recv().await.expect("first"),
        seen.recv().await.expect("second"),
    ];
    observed.sort();
    assert_eq!(observed, vec![b"from-a".to_vec(), b"from-b".to_vec()]);

    let (mut ra, mut rb) = (vec![0u8; 3], vec![0u8; 3]);
    a.read_exact(&mut ra).await.expect("read a");
    b.read_exact(&mut rb).await.expect("read b");
    assert_eq!(ra, b"ack");
    assert_eq!(rb, b"ack");
    shutdown.cancel();
}

/// An upstream that answers one read per connection, then closes. Both
/// directions of a proxied connection reach EOF, which is what releases
/// its connection slot.
async fn spawn_oneshot_upstream(
    reply: &'static [u8],
) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                if let Ok(n) = socket.read(&mut buf).await {
                    let _ = seen_tx.send(buf[..n].to_vec());
                    let _ = socket.write_all(reply).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, seen_rx)
}

#[tokio::test]
async fn connection_slots_are_reusable() {
    let shutdown = CancellationToken::new();
    let (upstream, mut seen) = spawn_oneshot_upstream(b"ack").await;
    let proxy = start_proxy(
        &["--handlers", "rawbytes", "--max_connections", "1"],
        upstream,
        passthrough(),
        &shutdown,
    );

    for round in 0..3u8 {
        let mut client = TcpStream::connect(proxy).await.expect("connect");
        client.write_all(&[round]).await.expect("write");
        assert_eq!(seen.recv().await.expect("seen"), vec![round]);
        let mut reply = vec![0u8; 3];
        client.read_exact(&mut reply).await.expect("read");
        // Close our side too; with both directions at EOF the slot frees
        // for the next round.
        drop(client);
    }
    shutdown.cancel();
}

mod tls_mitm {
    use super::*;
    use redline::ca::{generate_test_ca, LeafAuthority};
    use redline::handlers::tls::AcceptAnyServerCert;
    use rustls::pki_types::ServerName;
    use tokio_rustls::{TlsAcceptor, TlsConnector};

    fn no_verify_client() -> TlsConnector {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// A TLS upstream serving a leaf minted from the same test CA.
    async fn spawn_tls_upstream(
        authority: &LeafAuthority,
        reply: &'static [u8],
    ) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
        let paths = authority.leaf_for(Some("upstream.test")).expect("mint leaf");
        let certs = redline::handlers::tls::load_certs(&paths.cert).expect("certs");
        let key = redline::handlers::tls::load_key(&paths.key).expect("key");
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .expect("server config");
        let acceptor = TlsAcceptor::from(Arc::new(config));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut tls) = acceptor.accept(socket).await else {
                    continue;
                };
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match tls.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                let _ = seen_tx.send(buf[..n].to_vec());
                                if tls.write_all(reply).await.is_err() {
                                    return;
                                }
                                let _ = tls.flush().await;
                            }
                        }
                    }
                });
            }
        });
        (addr, seen_rx)
    }

    #[tokio::test]
    async fn sni_drives_leaf_minting() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let dir = tempfile::tempdir().expect("tempdir");
        let ca_cert = dir.path().join("ca.pem");
        let ca_key = dir.path().join("ca.key");
        generate_test_ca(&ca_cert, &ca_key).expect("test CA");

        let authority = LeafAuthority::new(&ca_cert, &ca_key, "example.com", dir.path().join("up"))
            .with_key_bits(2048);
        let (upstream, mut seen) = spawn_tls_upstream(&authority, b"ok").await;

        let cert_dir = dir.path().join("certs");
        let shutdown = CancellationToken::new();
        let proxy = start_proxy(
            &[
                "--handlers",
                "tls",
                "rawbytes",
                "--serv_cert",
                ca_cert.to_str().unwrap(),
                "--serv_key",
                ca_key.to_str().unwrap(),
                "--cert_dir",
                cert_dir.to_str().unwrap(),
            ],
            upstream,
            passthrough(),
            &shutdown,
        );

        let socket = TcpStream::connect(proxy).await.expect("connect");
        let name = ServerName::try_from("example.test".to_string()).expect("name");
        let mut tls = no_verify_client()
            .connect(name, socket)
            .await
            .expect("client handshake against the minted leaf");

        tls.write_all(b"hello").await.expect("write");
        tls.flush().await.expect("flush");
        assert_eq!(seen.recv().await.expect("upstream"), b"hello");

        let mut reply = vec![0u8; 2];
        tls.read_exact(&mut reply).await.expect("read");
        assert_eq!(reply, b"ok");

        // The handshake left a cached leaf for the SNI hostname behind,
        // signed by the operator CA and naming the host and its wildcard.
        let leaf_path = cert_dir.join("example.test/example.test.cert");
        assert!(leaf_path.is_file(), "missing {leaf_path:?}");
        let leaf =
            openssl::x509::X509::from_pem(&std::fs::read(&leaf_path).unwrap()).expect("leaf pem");
        let sans: Vec<String> = leaf
            .subject_alt_names()
            .expect("sans")
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(sans, vec!["example.test", "*.example.test"]);

        let ca = openssl::x509::X509::from_pem(&std::fs::read(&ca_cert).unwrap()).expect("ca pem");
        assert!(leaf.verify(&ca.public_key().unwrap()).unwrap());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn static_servername_skips_minting() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let dir = tempfile::tempdir().expect("tempdir");
        let ca_cert = dir.path().join("ca.pem");
        let ca_key = dir.path().join("ca.key");
        generate_test_ca(&ca_cert, &ca_key).expect("test CA");

        let authority = LeafAuthority::new(&ca_cert, &ca_key, "example.com", dir.path().join("up"))
            .with_key_bits(2048);
        let (upstream, mut seen) = spawn_tls_upstream(&authority, b"ok").await;

        let cert_dir = dir.path().join("certs");
        let shutdown = CancellationToken::new();
        let proxy = start_proxy(
            &[
                "--handlers",
                "tls",
                "rawbytes",
                "--static_servername",
                "--serv_cert",
                ca_cert.to_str().unwrap(),
                "--serv_key",
                ca_key.to_str().unwrap(),
                "--cert_dir",
                cert_dir.to_str().unwrap(),
            ],
            upstream,
            passthrough(),
            &shutdown,
        );

        let socket = TcpStream::connect(proxy).await.expect("connect");
        let name = ServerName::try_from("example.test".to_string()).expect("name");
        let mut tls = no_verify_client()
            .connect(name, socket)
            .await
            .expect("client handshake against the static cert");

        tls.write_all(b"hello").await.expect("write");
        tls.flush().await.expect("flush");
        assert_eq!(seen.recv().await.expect("upstream"), b"hello");

        // No leaf was minted: the operator cert was presented as-is.
        assert!(!cert_dir.join("example.test").exists());

        shutdown.cancel();
    }
}
