//! Test module abstraction.
//!
//! A module runs a measurement locally, prints results that came back from a
//! remote run, and optionally provides the server half of a two-party test.

mod skeleton;

pub use skeleton::Skeleton;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use socket2::Socket;
use tokio::net::{TcpListener, UdpSocket};

use crate::protocol::TestType;
use crate::sockopt::SocketKind;

/// Parameters a test server takes from HELLO
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelloParams {
    /// First port to try for test traffic
    pub test_port: u16,
}

/// The socket test traffic flows over on the server side
#[derive(Debug)]
pub enum TestSocket {
    Datagram(UdpSocket),
    Stream(TcpListener),
}

impl TestSocket {
    /// Hand a bound (and for streams, listening) socket over to tokio
    pub fn from_socket(socket: Socket, kind: SocketKind) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        match kind {
            SocketKind::Datagram => {
                let std_socket: std::net::UdpSocket = socket.into();
                Ok(TestSocket::Datagram(UdpSocket::from_std(std_socket)?))
            }
            SocketKind::Stream => {
                let std_listener: std::net::TcpListener = socket.into();
                Ok(TestSocket::Stream(TcpListener::from_std(std_listener)?))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TestSocket::Datagram(s) => s.local_addr(),
            TestSocket::Stream(l) => l.local_addr(),
        }
    }
}

/// Server half of a test, driven by SEND and RECEIVE commands
#[async_trait]
pub trait TestServer: Send {
    fn test_type(&self) -> TestType;

    /// Kind of socket to open for test traffic
    fn socket_kind(&self) -> SocketKind;

    /// Parse the HELLO options
    fn hello(&mut self, options: &[u8]) -> anyhow::Result<HelloParams>;

    /// Send test traffic to `peer`, returning the result to report
    async fn send(
        &mut self,
        socket: &TestSocket,
        peer: SocketAddr,
        options: &[u8],
    ) -> anyhow::Result<Vec<u8>>;

    /// Receive test traffic, returning the result to report
    async fn receive(&mut self, socket: &TestSocket, options: &[u8]) -> anyhow::Result<Vec<u8>>;
}

#[async_trait]
pub trait TestModule: Send + Sync {
    fn id(&self) -> TestType;

    fn name(&self) -> &'static str;

    /// Run the test against `targets`, returning opaque result bytes
    async fn run(&self, params: Option<&str>, targets: &[String]) -> anyhow::Result<Vec<u8>>;

    /// Print result bytes produced by `run`, possibly on another host
    fn print(&self, result: &[u8]) -> anyhow::Result<()>;

    /// A fresh server for one control session, if this test has one
    fn server(&self, _params: Option<&str>) -> Option<Box<dyn TestServer>> {
        None
    }
}

/// The set of test modules known to this process
#[derive(Clone, Default)]
pub struct Registry {
    modules: Vec<Arc<dyn TestModule>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the modules compiled into this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Skeleton));
        registry
    }

    /// Add a module, replacing any module with the same id
    pub fn register(&mut self, module: Arc<dyn TestModule>) {
        self.modules.retain(|m| m.id() != module.id());
        self.modules.push(module);
    }

    pub fn by_id(&self, id: TestType) -> Option<Arc<dyn TestModule>> {
        self.modules.iter().find(|m| m.id() == id).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<dyn TestModule>> {
        self.modules
            .iter()
            .find(|m| m.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn list(&self) -> impl Iterator<Item = &Arc<dyn TestModule>> {
        self.modules.iter()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.modules.iter().map(|m| (m.id(), m.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(TestType);

    #[async_trait]
    impl TestModule for Dummy {
        fn id(&self) -> TestType {
            self.0
        }

        fn name(&self) -> &'static str {
            "dummy"
        }

        async fn run(&self, _params: Option<&str>, _targets: &[String]) -> anyhow::Result<Vec<u8>> {
            Ok(vec![self.0 as u8])
        }

        fn print(&self, _result: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_builtin_has_skeleton() {
        let registry = Registry::builtin();
        assert_eq!(registry.by_id(0).unwrap().name(), "skeleton");
        assert!(registry.by_name("SKELETON").is_some());
        assert!(registry.by_id(99).is_none());
    }

    #[test]
    fn test_register_replaces_same_id() {
        let mut registry = Registry::new();
        registry.register(Arc::new(Dummy(5)));
        registry.register(Arc::new(Dummy(5)));
        registry.register(Arc::new(Dummy(6)));
        assert_eq!(registry.list().count(), 2);
        assert!(registry.by_id(5).unwrap().server(None).is_none());
    }
}
