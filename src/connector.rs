//! Outgoing control connections with fixed-delay retry.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::{Destination, Family};
use crate::protocol::{CONTROL_CONNECT_DELAY, MAX_CONNECT_ATTEMPTS};
use crate::sockopt::{SocketConfig, SocketKind, bind_to_device, configure_socket, open_socket};

/// How many times to try a connection and how long to wait between tries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_CONNECT_ATTEMPTS,
            delay: CONTROL_CONNECT_DELAY,
        }
    }
}

/// Why a single connection attempt failed
#[derive(Debug)]
pub enum AttemptError {
    /// Opening, binding or configuring the socket failed; retrying won't help
    Setup(Error),
    /// The connect itself failed
    Connect(io::Error),
}

/// Run `attempt` until it succeeds, fails during setup, or
/// `policy.max_attempts` connects have failed.
///
/// Returns the last error together with the number of attempts made.
pub async fn retry_connect<T, F, Fut>(
    policy: RetryPolicy,
    mut attempt: F,
) -> std::result::Result<T, (u32, AttemptError)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match attempt(attempts).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Connect(e)) if attempts < max_attempts => {
                warn!(
                    "Connection attempt {}/{} failed: {}, retrying in {:?}",
                    attempts, max_attempts, e, policy.delay
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err((attempts, e)),
        }
    }
}

/// Connect a stream socket to `destination` on `port`.
///
/// Only the connect is retried. Every attempt opens a fresh socket and binds
/// it the same way; a socket that can't be opened or bound fails the call
/// straight away. A source address from `config` is only used when it
/// matches the destination's family.
pub async fn connect_to_server(
    destination: &Destination,
    port: u16,
    config: &SocketConfig,
    policy: RetryPolicy,
) -> Result<TcpStream> {
    let remote = destination.with_port(port);
    let family = destination.family();
    let source = config.source_for(family, 0);

    let stream_config = SocketConfig {
        kind: SocketKind::Stream,
        ..config.clone()
    };
    let stream_config = &stream_config;

    let result = retry_connect(policy, move |attempt| async move {
        debug!(
            "Connecting to {} on port {} (attempt {})",
            destination.canonical_name, port, attempt
        );
        let socket =
            prepare_socket(family, source, stream_config).map_err(AttemptError::Setup)?;
        connect_socket(socket, remote)
            .await
            .map_err(AttemptError::Connect)
    })
    .await;

    match result {
        Ok(stream) => {
            info!("Connected to {} ({})", destination.canonical_name, remote);
            Ok(stream)
        }
        Err((_, AttemptError::Setup(e))) => Err(e),
        Err((attempts, AttemptError::Connect(source))) => Err(Error::ConnectFailed {
            name: destination.canonical_name.clone(),
            addr: remote,
            attempts,
            source,
        }),
    }
}

/// Open, configure and bind a stream socket ready for a non-blocking connect.
fn prepare_socket(
    family: Family,
    source: Option<SocketAddr>,
    config: &SocketConfig,
) -> Result<Socket> {
    let socket = open_socket(family, SocketKind::Stream)?;
    configure_socket(&socket, family, config);

    if let Some(device) = &config.device {
        bind_to_device(&socket, device)?;
    }

    if let Some(local) = source {
        debug!("Binding to local address {}", local);
        socket
            .bind(&SockAddr::from(local))
            .map_err(|source| Error::Bind {
                addr: local,
                source,
            })?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket)
}

async fn connect_socket(socket: Socket, remote: SocketAddr) -> io::Result<TcpStream> {
    match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.raw_os_error() == Some(libc::EALREADY)
                || e.raw_os_error() == Some(libc::EWOULDBLOCK) => {}
        #[cfg(windows)]
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    Ok(stream)
}
