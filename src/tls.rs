//! Mutual TLS for control sessions
//!
//! Both ends present a certificate signed by the configured CA. Without a
//! [`SecureContext`] sessions run over plain TCP.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pemfile::{certs, private_key};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::config::SslConfig;
use crate::error::{Error, Result};
use crate::net::Destination;
use crate::session::ControlSession;

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

/// Load private key from a PEM file
pub fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Client and server TLS configuration sharing one CA and one identity.
#[derive(Clone)]
pub struct SecureContext {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl SecureContext {
    pub fn new(
        ca: Vec<CertificateDer<'static>>,
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in ca {
            roots.add(cert)?;
        }
        let roots = Arc::new(roots);

        let client = ClientConfig::builder()
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(chain.clone(), key.clone_key())?;

        let verifier = WebPkiClientVerifier::builder(roots)
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;
        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    /// Build a context from PEM files. Returns `None` when no TLS material
    /// is configured.
    pub fn from_config(ssl: &SslConfig) -> anyhow::Result<Option<Self>> {
        let (Some(cacert), Some(cert), Some(key)) = (&ssl.cacert, &ssl.cert, &ssl.key) else {
            if ssl.cacert.is_some() || ssl.cert.is_some() || ssl.key.is_some() {
                warn!("Incomplete TLS configuration (need cacert, cert and key), using plain sessions");
            }
            return Ok(None);
        };

        let ca = load_certs(cacert)?;
        let chain = load_certs(cert)?;
        let key = load_private_key(key)?;
        Ok(Some(Self::new(ca, chain, key)?))
    }
}

impl std::fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureContext").finish_non_exhaustive()
    }
}

/// Wrap an outgoing connection, checking the server certificate against
/// the destination's canonical name.
pub async fn upgrade_client(
    context: Option<&SecureContext>,
    stream: TcpStream,
    destination: &Destination,
) -> Result<ControlSession> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr().ok();

    let Some(context) = context else {
        return Ok(ControlSession::new(stream, peer, local, false));
    };

    let name = ServerName::try_from(destination.canonical_name.clone())
        .map_err(|e| Error::Tls(format!("invalid server name: {}", e)))?;

    let connector = TlsConnector::from(context.client.clone());
    let tls = connector.connect(name, stream).await.map_err(|e| {
        Error::Tls(format!(
            "handshake with {} failed: {}",
            destination.canonical_name, e
        ))
    })?;

    let (_, connection) = tls.get_ref();
    if connection.peer_certificates().is_none_or(|c| c.is_empty()) {
        return Err(Error::Tls(format!(
            "no certificate presented by {}",
            destination.canonical_name
        )));
    }

    debug!("Established TLS session with {}", destination);
    Ok(ControlSession::new(tls, peer, local, true))
}

/// Wrap an accepted connection, requiring a client certificate from the CA.
pub async fn upgrade_server(
    context: Option<&SecureContext>,
    stream: TcpStream,
) -> Result<ControlSession> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr().ok();

    let Some(context) = context else {
        return Ok(ControlSession::new(stream, peer, local, false));
    };

    let acceptor = TlsAcceptor::from(context.server.clone());
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", peer, e)))?;

    debug!("Accepted TLS session from {}", peer);
    Ok(ControlSession::new(tls, peer, local, true))
}
