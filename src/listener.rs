//! Dual-stack listening sockets.
//!
//! IPv4 and IPv6 each get their own socket (IPv6 is always V6ONLY) so both
//! families can hold the same port independently. A port that is taken in
//! either family is reported as [`Error::AddrInUse`] with nothing left open.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use socket2::{SockAddr, Socket};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::net::Family;
use crate::sockopt::{SocketConfig, SocketKind, bind_to_device, configure_socket, open_socket};

/// Backlog for single-connection test listeners
pub const SINGLE_BACKLOG: i32 = 1;

/// Up to one socket per address family.
#[derive(Debug, Default)]
pub struct SocketPair {
    pub v4: Option<Socket>,
    pub v6: Option<Socket>,
}

impl SocketPair {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }

    pub fn get(&self, family: Family) -> Option<&Socket> {
        match family {
            Family::V4 => self.v4.as_ref(),
            Family::V6 => self.v6.as_ref(),
        }
    }

    fn set(&mut self, family: Family, socket: Socket) {
        match family {
            Family::V4 => self.v4 = Some(socket),
            Family::V6 => self.v6 = Some(socket),
        }
    }

    /// Remove one family's socket from the pair
    pub fn take(&mut self, family: Family) -> Option<Socket> {
        match family {
            Family::V4 => self.v4.take(),
            Family::V6 => self.v6.take(),
        }
    }

    /// Close one family's socket, leaving the other untouched
    pub fn close(&mut self, family: Family) {
        if self.take(family).is_some() {
            debug!("Closed {} socket", family);
        }
    }

    /// Families that currently hold a socket, IPv4 first
    pub fn families(&self) -> Vec<Family> {
        let mut families = Vec::with_capacity(2);
        if self.v4.is_some() {
            families.push(Family::V4);
        }
        if self.v6.is_some() {
            families.push(Family::V6);
        }
        families
    }
}

/// Open, configure and bind (and for streams, listen on) `port` in every
/// family `config` has a source address for. Stream sockets get a backlog
/// of one.
pub fn start_listening(port: u16, config: &SocketConfig) -> Result<SocketPair> {
    start_listening_with_backlog(port, config, SINGLE_BACKLOG)
}

pub fn start_listening_with_backlog(
    port: u16,
    config: &SocketConfig,
    backlog: i32,
) -> Result<SocketPair> {
    let mut pair = SocketPair::default();

    for family in [Family::V4, Family::V6] {
        if config.source_for(family, port).is_none() {
            continue;
        }
        match open_socket(family, config.kind) {
            Ok(socket) => pair.set(family, socket),
            Err(e) => warn!("Failed to open {} {} socket: {}", family, config.kind, e),
        }
    }

    if pair.is_empty() {
        return Err(Error::NoSockets("could not open any socket"));
    }

    for family in pair.families() {
        if let Some(socket) = pair.get(family) {
            configure_socket(socket, family, config);
        }
    }

    if let Some(socket) = &pair.v6
        && let Err(e) = socket.set_only_v6(true)
    {
        warn!("Failed to set IPV6_V6ONLY: {}", e);
    }

    if let Some(device) = &config.device {
        for family in pair.families() {
            if let Some(socket) = pair.get(family) {
                bind_to_device(socket, device)?;
            }
        }
    }

    for family in pair.families() {
        let (Some(socket), Some(addr)) = (pair.get(family), config.source_for(family, port))
        else {
            continue;
        };
        debug!("Binding {} socket to {}", family, addr);
        if let Err(source) = socket.bind(&SockAddr::from(addr)) {
            if source.kind() == io::ErrorKind::AddrInUse {
                debug!("{} port {} in use", family, port);
                return Err(Error::AddrInUse);
            }
            return Err(Error::Bind { addr, source });
        }
    }

    if config.kind == SocketKind::Stream {
        listen_pair(&mut pair, port, backlog)?;
    }

    if pair.is_empty() {
        return Err(Error::NoSockets("could not listen on any socket"));
    }

    Ok(pair)
}

/// Put every bound socket in `pair` into the listening state, IPv4 first.
///
/// EADDRINUSE on the first family to listen closes the whole pair and
/// reports [`Error::AddrInUse`]. Any later failure only drops that family.
fn listen_pair(pair: &mut SocketPair, port: u16, backlog: i32) -> Result<()> {
    let mut listening = false;
    for family in pair.families() {
        let Some(socket) = pair.get(family) else {
            continue;
        };
        match socket.listen(backlog) {
            Ok(()) => {
                debug!("Listening on {} port {}", family, port);
                listening = true;
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && !listening => {
                debug!("{} port {} in use at listen", family, port);
                for family in pair.families() {
                    pair.close(family);
                }
                return Err(Error::AddrInUse);
            }
            Err(e) => {
                warn!("Failed to listen on {} port {}: {}", family, port, e);
                pair.close(family);
            }
        }
    }
    Ok(())
}

/// Try each port from `port` up to and including `port_max` until one is
/// free in every requested family.
pub fn listen_on_port_range(
    port: u16,
    port_max: u16,
    config: &SocketConfig,
) -> Result<(SocketPair, u16)> {
    let mut port = port;
    loop {
        match start_listening(port, config) {
            Ok(pair) => {
                info!("Listening on port {}", port);
                return Ok((pair, port));
            }
            Err(e) if e.is_addr_in_use() && port < port_max => {
                debug!("Port {} in use, trying {}", port, port + 1);
                port += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// An accepted control connection
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub family: Family,
}

/// Listening stream sockets handed over to tokio.
#[derive(Debug)]
pub struct ControlListener {
    v4: Option<TcpListener>,
    v6: Option<TcpListener>,
}

impl ControlListener {
    pub fn from_pair(pair: SocketPair) -> Result<Self> {
        let v4 = pair.v4.map(into_listener).transpose()?;
        let v6 = pair.v6.map(into_listener).transpose()?;
        if v4.is_none() && v6.is_none() {
            return Err(Error::NoSockets("no listening sockets"));
        }
        Ok(Self { v4, v6 })
    }

    /// Local address of the first listening family
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match (&self.v4, &self.v6) {
            (Some(l), _) | (None, Some(l)) => l.local_addr(),
            (None, None) => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }

    /// Accept from whichever family connects first
    pub async fn accept(&self) -> io::Result<Accepted> {
        let (family, result) = tokio::select! {
            r = accept_on(self.v4.as_ref()) => (Family::V4, r),
            r = accept_on(self.v6.as_ref()) => (Family::V6, r),
        };
        let (stream, peer) = result?;
        Ok(Accepted {
            stream,
            peer,
            family,
        })
    }

    /// Wait up to `max_wait` for a single connection, then close both
    /// listeners.
    ///
    /// The remaining budget is reduced by the real time spent on every
    /// interrupted wait.
    pub async fn wait_for_connection(self, max_wait: Duration) -> Result<Accepted> {
        let mut remaining = max_wait;

        loop {
            let started = Instant::now();
            match tokio::time::timeout(remaining, self.accept()).await {
                Err(_) => {
                    warn!("Timed out after {:?} waiting for control connection", max_wait);
                    return Err(Error::Timeout);
                }
                Ok(Ok(accepted)) => {
                    debug!(
                        "Got {} control connection from {}, closing listeners",
                        accepted.family, accepted.peer
                    );
                    return Ok(accepted);
                }
                Ok(Err(e)) if is_transient_accept_error(&e) => {
                    debug!("Accept interrupted: {}", e);
                    remaining = remaining.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(Error::Timeout);
                    }
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

pub(crate) fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
    )
}

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

fn into_listener(socket: Socket) -> io::Result<TcpListener> {
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}
