//! Established control sessions.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::{read_message, write_message};
use crate::error::Result;
use crate::protocol::ControlMessage;

/// A byte stream a control session can run over: plain TCP, TLS, or an
/// in-memory pipe in tests.
pub trait ControlStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ControlStream for T {}

/// A control channel and the address of the peer at the other end.
///
/// Dropping the session closes the underlying socket.
pub struct ControlSession {
    stream: Box<dyn ControlStream>,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    secure: bool,
}

impl ControlSession {
    pub fn new(
        stream: impl ControlStream + 'static,
        peer: SocketAddr,
        local: Option<SocketAddr>,
        secure: bool,
    ) -> Self {
        Self {
            stream: Box::new(stream),
            peer,
            local,
            secure,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Local address of the control socket, when known
    pub fn local(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        write_message(&mut self.stream, message).await
    }

    pub async fn recv(&mut self) -> Result<ControlMessage> {
        read_message(&mut self.stream).await
    }

    /// Shut down the write side and drop the session.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            debug!("Error shutting down control session with {}: {}", self.peer, e);
        }
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("secure", &self.secure)
            .finish()
    }
}
