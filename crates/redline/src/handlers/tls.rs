//! The TLS handler. The client-facing side terminates TLS with either the
//! operator CA's own certificate (`--static_servername`) or a per-hostname
//! leaf minted from the client's SNI during the handshake. The server-facing
//! side re-originates TLS toward the real server without verifying anything
//! it presents, optionally offering a client certificate for mTLS.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::{BoxIo, ConnLocals, Handler, Layer};
use crate::ca::{LeafAuthority, LeafPaths};
use crate::config::TlsArgs;
use crate::Error;

enum ServingMode {
    /// `--static_servername`: the operator cert pair is presented as-is
    /// for every client-facing handshake, regardless of SNI.
    Static(Arc<ServerConfig>),
    /// Default: leaves are minted per SNI hostname.
    Dynamic(Arc<LeafAuthority>),
}

pub struct TlsHandler {
    default_server_name: String,
    client_cert: Option<PathBuf>,
    client_key: Option<PathBuf>,
    mode: ServingMode,
}

impl TlsHandler {
    pub fn new(args: &TlsArgs) -> Result<TlsHandler, Error> {
        // The process-wide provider may already be installed by main or by
        // another handler; either way is fine.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mode = if args.static_servername {
            let certs = load_certs(&args.serv_cert)?;
            let key = load_key(&args.serv_key)?;
            let config = ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(certs, key)?;
            ServingMode::Static(Arc::new(config))
        } else {
            ServingMode::Dynamic(Arc::new(LeafAuthority::new(
                &args.serv_cert,
                &args.serv_key,
                &args.server_name,
                &args.cert_dir,
            )))
        };

        Ok(TlsHandler {
            default_server_name: args.server_name.clone(),
            client_cert: args.client_cert.clone(),
            client_key: args.client_key.clone(),
            mode,
        })
    }

    /// Terminate TLS on a client-facing transport.
    pub async fn accept_client(&self, io: BoxIo, locals: &ConnLocals) -> Result<BoxIo, Error> {
        let config = match &self.mode {
            ServingMode::Static(config) => config.clone(),
            ServingMode::Dynamic(authority) => {
                let resolver = LeafResolver {
                    authority: authority.clone(),
                    hostname: locals.sni_hostname.clone(),
                };
                Arc::new(
                    ServerConfig::builder()
                        .with_no_client_auth()
                        .with_cert_resolver(Arc::new(resolver)),
                )
            }
        };
        let stream = TlsAcceptor::from(config).accept(io).await?;
        Ok(Box::new(stream))
    }

    /// Originate TLS on a server-facing transport. Uses the hostname the
    /// client asked for (recorded by the SNI callback) so the real server
    /// sees the same name the client intended.
    pub async fn connect_server(&self, io: BoxIo, locals: &ConnLocals) -> Result<BoxIo, Error> {
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()));
        let config = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                builder.with_client_auth_cert(load_certs(cert)?, load_key(key)?)?
            }
            _ => builder.with_no_client_auth(),
        };

        let hostname = locals
            .sni_hostname
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| self.default_server_name.clone());
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|_| Error::InvalidServerName(hostname))?;

        let stream = TlsConnector::from(Arc::new(config))
            .connect(server_name, io)
            .await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Handler for TlsHandler {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn frames_messages(&self) -> bool {
        false
    }

    fn retry_errors(&self) -> &'static [ErrorKind] {
        // tokio-rustls retries handshake WANT_READ/WANT_WRITE internally,
        // but the layers below can still surface these.
        &[ErrorKind::WouldBlock, ErrorKind::Interrupted]
    }

    async fn setup_client_facing(&self, lower: Layer, locals: &ConnLocals) -> Result<Layer, Error> {
        let io = self.accept_client(lower.into_transport()?, locals).await?;
        Ok(Layer::Transport(io))
    }

    async fn setup_server_facing(&self, lower: Layer, locals: &ConnLocals) -> Result<Layer, Error> {
        let io = self.connect_server(lower.into_transport()?, locals).await?;
        Ok(Layer::Transport(io))
    }
}

/// Resolves the serving certificate during the client-facing handshake:
/// records the client's SNI for the server-facing side, then asks the leaf
/// authority for a certificate to present under that name.
struct LeafResolver {
    authority: Arc<LeafAuthority>,
    hostname: Arc<Mutex<Option<String>>>,
}

impl ResolvesServerCert for LeafResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().map(str::to_owned);
        if let Some(name) = &name {
            *self.hostname.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.clone());
        }

        let paths = match self.authority.leaf_for(name.as_deref()) {
            Ok(paths) => paths,
            Err(error) => {
                tracing::error!(?name, %error, "failed to mint a leaf certificate");
                return None;
            }
        };
        match load_certified_key(&paths) {
            Ok(key) => Some(Arc::new(key)),
            Err(error) => {
                tracing::error!(?name, %error, "failed to load the minted leaf");
                None
            }
        }
    }
}

impl std::fmt::Debug for LeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafResolver")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

fn load_certified_key(paths: &LeafPaths) -> Result<CertifiedKey, Error> {
    let certs = load_certs(&paths.cert)?;
    let key = load_key(&paths.key)?;
    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)?;
    Ok(CertifiedKey::new(certs, signing_key))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut BufReader::new(File::open(path)?))?.ok_or_else(|| {
        Error::Io(io::Error::new(
            ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        ))
    })
}

/// The server-facing side deliberately skips certificate validation: the
/// whole point is to sit between a client we control and a server we do
/// not necessarily trust to have honest paperwork.
#[derive(Debug)]
pub struct AcceptAnyServerCert {
    provider: CryptoProvider,
}

impl AcceptAnyServerCert {
    pub fn new() -> AcceptAnyServerCert {
        AcceptAnyServerCert {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl Default for AcceptAnyServerCert {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
