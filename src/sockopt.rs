//! Socket configuration and verified socket options.
//!
//! Options are set with `setsockopt` and immediately read back with
//! `getsockopt`; a read-back that disagrees with the request is an error.
//! Buffer sizes may read back doubled, which is how Linux reports them.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::net::Family;

/// Stream (TCP) or datagram (UDP) sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketKind {
    #[default]
    Stream,
    Datagram,
}

impl SocketKind {
    pub fn socket_type(&self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            SocketKind::Stream => Protocol::TCP,
            SocketKind::Datagram => Protocol::UDP,
        }
    }
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketKind::Stream => write!(f, "stream"),
            SocketKind::Datagram => write!(f, "datagram"),
        }
    }
}

/// Everything needed to open, tune and bind a socket.
///
/// A family only takes part in listening when it has a source address.
/// For outgoing connections a source address is optional and only used when
/// it matches the destination family.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SocketConfig {
    pub kind: SocketKind,
    pub source_v4: Option<SocketAddrV4>,
    pub source_v6: Option<SocketAddrV6>,
    /// Interface name for SO_BINDTODEVICE
    pub device: Option<String>,
    pub recv_buffer: Option<u32>,
    pub send_buffer: Option<u32>,
    /// TCP maximum segment size
    pub mss: Option<u32>,
    pub disable_nagle: bool,
    pub reuse_addr: bool,
    /// 6-bit DSCP value
    pub dscp: Option<u8>,
}

impl SocketConfig {
    /// Stream sockets with address reuse, listening on any address of both families
    pub fn control() -> Self {
        Self {
            kind: SocketKind::Stream,
            source_v4: Some(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            source_v6: Some(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)),
            reuse_addr: true,
            ..Default::default()
        }
    }

    /// Replace the source address of the family `addr` belongs to.
    pub fn set_source(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(v4) => self.source_v4 = Some(v4),
            SocketAddr::V6(v6) => self.source_v6 = Some(v6),
        }
    }

    /// Source address for `family` with the port replaced.
    pub fn source_for(&self, family: Family, port: u16) -> Option<SocketAddr> {
        match family {
            Family::V4 => self.source_v4.map(|mut a| {
                a.set_port(port);
                SocketAddr::V4(a)
            }),
            Family::V6 => self.source_v6.map(|mut a| {
                a.set_port(port);
                SocketAddr::V6(a)
            }),
        }
    }

    /// Keep only `family`'s source address, set to `local`.
    ///
    /// Used once a control connection has arrived so later test sockets
    /// stay on the address the peer reached us on.
    pub fn pin_to_local(&mut self, local: SocketAddr) {
        match local {
            SocketAddr::V4(v4) => {
                self.source_v4 = Some(v4);
                self.source_v6 = None;
            }
            SocketAddr::V6(v6) => {
                self.source_v6 = Some(v6);
                self.source_v4 = None;
            }
        }
    }
}

/// Options the applier knows how to set and verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    RecvBuffer,
    SendBuffer,
    /// SO_RCVBUFFORCE, ignores the system maximum with CAP_NET_ADMIN
    RecvBufferForce,
    SendBufferForce,
    MaxSegment,
    NoDelay,
    ReuseAddr,
}

impl SockOpt {
    pub fn name(&self) -> &'static str {
        match self {
            SockOpt::RecvBuffer => "SO_RCVBUF",
            SockOpt::SendBuffer => "SO_SNDBUF",
            SockOpt::RecvBufferForce => "SO_RCVBUFFORCE",
            SockOpt::SendBufferForce => "SO_SNDBUFFORCE",
            SockOpt::MaxSegment => "TCP_MAXSEG",
            SockOpt::NoDelay => "TCP_NODELAY",
            SockOpt::ReuseAddr => "SO_REUSEADDR",
        }
    }

    pub fn is_buffer_size(&self) -> bool {
        matches!(
            self,
            SockOpt::RecvBuffer
                | SockOpt::SendBuffer
                | SockOpt::RecvBufferForce
                | SockOpt::SendBufferForce
        )
    }

    /// The privileged variant to fall back to, for buffer sizes
    pub fn force_variant(&self) -> Option<SockOpt> {
        match self {
            SockOpt::RecvBuffer => Some(SockOpt::RecvBufferForce),
            SockOpt::SendBuffer => Some(SockOpt::SendBufferForce),
            _ => None,
        }
    }

    /// `(level, name)` for setsockopt, or None if this platform lacks it
    #[cfg(unix)]
    fn level_and_name(&self) -> Option<(libc::c_int, libc::c_int)> {
        match self {
            SockOpt::RecvBuffer => Some((libc::SOL_SOCKET, libc::SO_RCVBUF)),
            SockOpt::SendBuffer => Some((libc::SOL_SOCKET, libc::SO_SNDBUF)),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            SockOpt::RecvBufferForce => Some((libc::SOL_SOCKET, libc::SO_RCVBUFFORCE)),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            SockOpt::SendBufferForce => Some((libc::SOL_SOCKET, libc::SO_SNDBUFFORCE)),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            SockOpt::RecvBufferForce | SockOpt::SendBufferForce => None,
            SockOpt::MaxSegment => Some((libc::IPPROTO_TCP, libc::TCP_MAXSEG)),
            SockOpt::NoDelay => Some((libc::IPPROTO_TCP, libc::TCP_NODELAY)),
            SockOpt::ReuseAddr => Some((libc::SOL_SOCKET, libc::SO_REUSEADDR)),
        }
    }
}

impl std::fmt::Display for SockOpt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a read-back value confirms the requested one.
///
/// Buffer sizes are accepted as requested or exactly doubled.
pub fn readback_matches(option: SockOpt, requested: i32, actual: i32) -> bool {
    if option.is_buffer_size() {
        let requested = requested as i64;
        let actual = actual as i64;
        actual == requested || actual == requested * 2
    } else {
        actual == requested
    }
}

#[cfg(unix)]
fn set_int(socket: &Socket, level: libc::c_int, name: libc::c_int, value: i32) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let value = value as libc::c_int;
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // the option value is a correctly sized c_int.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn get_int(socket: &Socket, level: libc::c_int, name: libc::c_int) -> io::Result<i32> {
    use std::os::unix::io::AsRawFd;

    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: value and len point to valid stack storage of the advertised size.
    let ret = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value as i32)
}

/// Set an option and verify it by reading it back.
///
/// Options this platform does not define are logged and skipped.
#[cfg(unix)]
pub fn apply_option(socket: &Socket, option: SockOpt, value: i32) -> Result<(), Error> {
    let Some((level, name)) = option.level_and_name() else {
        warn!("{} undefined, can not set it", option);
        return Ok(());
    };

    set_int(socket, level, name, value).map_err(|e| Error::SocketOption {
        option: option.name(),
        reason: format!("setsockopt failed to set {}: {}", value, e),
    })?;

    let actual = get_int(socket, level, name).map_err(|e| Error::SocketOption {
        option: option.name(),
        reason: format!("getsockopt failed: {}", e),
    })?;

    if !readback_matches(option, value, actual) {
        return Err(Error::SocketOption {
            option: option.name(),
            reason: format!("read back {} after setting, expected {}", actual, value),
        });
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn apply_option(_socket: &Socket, option: SockOpt, _value: i32) -> Result<(), Error> {
    warn!("{} undefined, can not set it", option);
    Ok(())
}

/// Set a buffer size, falling back to the force variant when refused.
fn apply_buffer_size(socket: &Socket, option: SockOpt, size: u32) {
    let value = i32::try_from(size).unwrap_or(i32::MAX);
    debug!("Setting {} to {}", option, value);

    if let Err(e) = apply_option(socket, option, value) {
        warn!("{}", e);
        if let Some(force) = option.force_variant()
            && let Err(e) = apply_option(socket, force, value)
        {
            warn!("{}", e);
        }
    }
}

/// Write a DSCP value into IP_TOS or IPV6_TCLASS.
#[cfg(unix)]
pub fn set_dscp(socket: &Socket, family: Family, dscp: u8) -> Result<(), Error> {
    // DSCP is the upper 6 bits of the traffic class byte
    let value = ((dscp & 0x3f) as i32) << 2;
    debug!("Setting DSCP value to {} ({})", dscp, value);

    match family {
        Family::V4 => set_int(socket, libc::IPPROTO_IP, libc::IP_TOS, value).map_err(|e| {
            Error::SocketOption {
                option: "IP_TOS",
                reason: format!("failed to set IPv4 DSCP to {}: {}", value, e),
            }
        }),
        Family::V6 => match set_int(socket, libc::IPPROTO_IPV6, libc::IPV6_TCLASS, value) {
            Ok(()) => Ok(()),
            // Some emulated environments lack IPV6_TCLASS entirely
            Err(e) if e.raw_os_error() == Some(libc::ENOPROTOOPT) => {
                warn!("Failed to set IPv6 DSCP to {}: {}", value, e);
                Ok(())
            }
            Err(e) => Err(Error::SocketOption {
                option: "IPV6_TCLASS",
                reason: format!("failed to set IPv6 DSCP to {}: {}", value, e),
            }),
        },
    }
}

#[cfg(not(unix))]
pub fn set_dscp(_socket: &Socket, _family: Family, _dscp: u8) -> Result<(), Error> {
    warn!("IP_TOS undefined, can not set DSCP");
    Ok(())
}

/// Apply every option `config` asks for. Failures are logged, never fatal.
pub fn configure_socket(socket: &Socket, family: Family, config: &SocketConfig) {
    if let Some(mss) = config.mss {
        debug!("Setting TCP_MAXSEG to {}", mss);
        let value = i32::try_from(mss).unwrap_or(i32::MAX);
        if let Err(e) = apply_option(socket, SockOpt::MaxSegment, value) {
            warn!("{}", e);
        }
    }

    if config.disable_nagle {
        debug!("Setting TCP_NODELAY to 1");
        if let Err(e) = apply_option(socket, SockOpt::NoDelay, 1) {
            warn!("{}", e);
        }
    }

    if let Some(size) = config.recv_buffer {
        apply_buffer_size(socket, SockOpt::RecvBuffer, size);
    }

    if let Some(size) = config.send_buffer {
        apply_buffer_size(socket, SockOpt::SendBuffer, size);
    }

    if config.reuse_addr {
        debug!("Setting SO_REUSEADDR to 1");
        if let Err(e) = apply_option(socket, SockOpt::ReuseAddr, 1) {
            warn!("{}", e);
        }
    }

    if let Some(dscp) = config.dscp
        && dscp != 0
        && let Err(e) = set_dscp(socket, family, dscp)
    {
        error!("Failed to set DSCP socket options: {}", e);
    }
}

/// Open an unconfigured socket of `kind` for `family`.
pub fn open_socket(family: Family, kind: SocketKind) -> io::Result<Socket> {
    let domain = match family {
        Family::V4 => Domain::IPV4,
        Family::V6 => Domain::IPV6,
    };
    Socket::new(domain, kind.socket_type(), Some(kind.protocol()))
}

/// Bind a socket to a network interface by name.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
pub fn bind_to_device(socket: &Socket, device: &str) -> Result<(), Error> {
    debug!("Trying to bind socket to device '{}'", device);
    socket
        .bind_device(Some(device.as_bytes()))
        .map_err(|source| Error::BindDevice {
            device: device.to_string(),
            source,
        })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
pub fn bind_to_device(_socket: &Socket, device: &str) -> Result<(), Error> {
    warn!(
        "Failed to bind to device {}: SO_BINDTODEVICE undefined",
        device
    );
    Ok(())
}
