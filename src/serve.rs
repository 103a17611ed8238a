//! Responder side of the control protocol
//!
//! A standalone test server waits for one control connection on the control
//! port range and then serves a single test. The control daemon accepts
//! connections on a fixed port and handles one SERVER or TEST request on
//! each.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::listener::{
    ControlListener, is_transient_accept_error, listen_on_port_range,
    start_listening_with_backlog,
};
use crate::module::{Registry, TestServer, TestSocket};
use crate::net::{Family, normalize_addr};
use crate::protocol::{
    ControlMessage, DEFAULT_TEST_PORT, MAX_TEST_PORT, RESERVED_PORT_LIMIT, Ready, ResponseCode,
    TestRequest,
};
use crate::session::ControlSession;
use crate::sockopt::{SocketConfig, SocketKind};
use crate::tls::{SecureContext, upgrade_server};

/// Backlog for the control daemon's listening sockets
const DAEMON_BACKLOG: i32 = 128;

/// Pause after an accept failure that will not clear on its own (EMFILE)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before accepting again after `e`.
fn accept_error_delay(e: &io::Error) -> Option<Duration> {
    if is_transient_accept_error(e) {
        None
    } else {
        Some(ACCEPT_ERROR_BACKOFF)
    }
}

/// A control listener bound somewhere in a port range, not yet accepting.
#[derive(Debug)]
pub struct ControlServer {
    listener: ControlListener,
    port: u16,
}

impl ControlServer {
    /// Listen for a control connection on the first free port in
    /// `port..=port_max`.
    pub fn bind(port: u16, port_max: u16, config: &SocketConfig) -> Result<Self> {
        let config = SocketConfig {
            kind: SocketKind::Stream,
            ..config.clone()
        };
        let (pair, port) = listen_on_port_range(port, port_max, &config)?;
        Ok(Self {
            listener: ControlListener::from_pair(pair)?,
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the control connection and upgrade it.
    ///
    /// `config` is pinned to the local address of the accepted connection
    /// so test traffic uses the same address family and interface.
    pub async fn accept(
        self,
        config: &mut SocketConfig,
        context: Option<&SecureContext>,
        max_wait: Duration,
    ) -> Result<ControlSession> {
        let accepted = self.listener.wait_for_connection(max_wait).await?;
        let local = accepted.stream.local_addr()?;
        info!(
            "Control connection from {} on {}",
            normalize_addr(accepted.peer),
            local
        );
        config.pin_to_local(local);
        upgrade_server(context, accepted.stream).await
    }
}

/// Listen on a control port range and return the first upgraded session.
pub async fn listen_control_server(
    port: u16,
    port_max: u16,
    config: &mut SocketConfig,
    context: Option<&SecureContext>,
    max_wait: Duration,
) -> Result<ControlSession> {
    let server = ControlServer::bind(port, port_max, config)?;
    server.accept(config, context, max_wait).await
}

/// Open the test socket for the port HELLO asked for.
///
/// The default test port means "anywhere in the test port range"; any other
/// port is tried alone.
fn open_test_socket(
    test_port: u16,
    kind: SocketKind,
    config: &SocketConfig,
    peer_family: Family,
) -> Result<(TestSocket, u16)> {
    let port_max = if test_port == DEFAULT_TEST_PORT {
        MAX_TEST_PORT
    } else {
        test_port
    };
    let test_config = SocketConfig {
        kind,
        reuse_addr: false,
        ..config.clone()
    };

    let (mut pair, port) = listen_on_port_range(test_port, port_max, &test_config)?;
    let socket = match pair.take(peer_family) {
        Some(socket) => socket,
        None => {
            let other = match peer_family {
                Family::V4 => Family::V6,
                Family::V6 => Family::V4,
            };
            pair.take(other)
                .ok_or(Error::NoSockets("no test socket available"))?
        }
    };

    debug!("Test {} socket ready on port {}", kind, port);
    Ok((TestSocket::from_socket(socket, kind)?, port))
}

async fn reject(session: &mut ControlSession, code: ResponseCode, message: String) -> Error {
    warn!("Rejecting request from {}: {}", session.peer(), message);
    if let Err(e) = session
        .send(&ControlMessage::response(code, message.clone()))
        .await
    {
        debug!("Failed to send rejection: {}", e);
    }
    Error::Protocol(message)
}

/// Serve one test over an established control session.
///
/// Reads HELLO, opens the test socket, then answers SEND and RECEIVE
/// commands until the peer closes the session.
pub async fn serve_test(
    session: &mut ControlSession,
    server: &mut dyn TestServer,
    config: &SocketConfig,
) -> Result<()> {
    let test_type = server.test_type();

    let hello = match session.recv().await?.into_hello(test_type) {
        Ok(hello) => hello,
        Err(e) => {
            return Err(reject(session, ResponseCode::BAD_REQUEST, format!("bad HELLO: {}", e)).await);
        }
    };

    let params = match server.hello(&hello.options) {
        Ok(params) => params,
        Err(e) => {
            return Err(reject(
                session,
                ResponseCode::BAD_REQUEST,
                format!("failed to parse HELLO options: {:#}", e),
            )
            .await);
        }
    };

    if params.test_port < RESERVED_PORT_LIMIT {
        return Err(reject(
            session,
            ResponseCode::BAD_REQUEST,
            format!("test port {} is reserved", params.test_port),
        )
        .await);
    }

    let peer = normalize_addr(session.peer());
    let (socket, test_port) =
        open_test_socket(params.test_port, server.socket_kind(), config, Family::of(&peer))?;

    loop {
        let message = match session.recv().await {
            Ok(message) => message,
            Err(Error::ConnectionClosed) => {
                debug!("Control session with {} closed", peer);
                break;
            }
            Err(e) => return Err(e),
        };

        match message {
            ControlMessage::Receive(cmd) => {
                if cmd.test_type != test_type {
                    return Err(crate::error::CodecError::TestTypeMismatch {
                        expected: test_type,
                        got: cmd.test_type,
                    }
                    .into());
                }
                session
                    .send(&ControlMessage::Ready(Ready {
                        test_type,
                        test_port,
                    }))
                    .await?;
                let result = server.receive(&socket, &cmd.options).await;
                send_result(session, test_type, result).await?;
            }
            ControlMessage::Send(cmd) => {
                if cmd.test_type != test_type {
                    return Err(crate::error::CodecError::TestTypeMismatch {
                        expected: test_type,
                        got: cmd.test_type,
                    }
                    .into());
                }
                let target = SocketAddr::new(peer.ip(), cmd.test_port);
                debug!("Sending test traffic to {}", target);
                let result = server.send(&socket, target, &cmd.options).await;
                send_result(session, test_type, result).await?;
            }
            other => {
                warn!("Ignoring unexpected {} message from {}", other.kind(), peer);
            }
        }
    }

    Ok(())
}

async fn send_result(
    session: &mut ControlSession,
    test_type: u64,
    result: anyhow::Result<Vec<u8>>,
) -> Result<()> {
    match result {
        Ok(bytes) => session.send(&ControlMessage::result(test_type, bytes)).await,
        Err(e) => {
            error!("Test {} failed: {:#}", test_type, e);
            session
                .send(&ControlMessage::response(
                    ResponseCode::INTERNAL_ERROR,
                    format!("{:#}", e),
                ))
                .await
        }
    }
}

/// Accepts control connections and runs SERVER and TEST requests.
pub struct Daemon {
    registry: Arc<Registry>,
    context: Option<SecureContext>,
    config: SocketConfig,
    one_off: bool,
}

impl Daemon {
    pub fn new(registry: Registry, context: Option<SecureContext>, config: SocketConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            context,
            config,
            one_off: false,
        }
    }

    /// Exit after the first connection has been handled
    pub fn one_off(mut self, one_off: bool) -> Self {
        self.one_off = one_off;
        self
    }

    /// Bind the daemon's listening sockets on `port`
    pub fn listen(&self, port: u16) -> Result<ControlListener> {
        let config = SocketConfig {
            kind: SocketKind::Stream,
            reuse_addr: true,
            ..self.config.clone()
        };
        let pair = start_listening_with_backlog(port, &config, DAEMON_BACKLOG)?;
        ControlListener::from_pair(pair)
    }

    pub async fn run(self, port: u16) -> Result<()> {
        let listener = self.listen(port)?;
        info!("Control daemon listening on port {}", port);
        Arc::new(self).serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: ControlListener) -> Result<()> {
        if self.context.is_some() {
            info!("TLS enabled");
        }

        loop {
            let accepted = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept control connection: {}", e);
                    if let Some(delay) = accept_error_delay(&e) {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            };
            let peer = normalize_addr(accepted.peer);
            info!("Control connection from {}", peer);

            let daemon = self.clone();
            let handle = tokio::spawn(async move {
                if let Err(e) = daemon.handle_connection(accepted.stream).await {
                    error!("Control session with {} failed: {}", peer, e);
                }
            });

            if self.one_off {
                if let Err(e) = handle.await {
                    error!("Control session with {} did not finish: {}", peer, e);
                    return Err(Error::Io(io::Error::other(e)));
                }
                break;
            }
        }

        Ok(())
    }

    async fn handle_connection(&self, stream: tokio::net::TcpStream) -> Result<()> {
        let local = stream.local_addr()?;
        let mut session = upgrade_server(self.context.as_ref(), stream).await?;

        let result = match session.recv().await? {
            ControlMessage::Server(request) => {
                let Some(module) = self.registry.by_id(request.test_type) else {
                    session
                        .send(&ControlMessage::response(
                            ResponseCode::NOT_FOUND,
                            format!("unknown test type {}", request.test_type),
                        ))
                        .await?;
                    return Ok(());
                };
                let Some(mut server) = module.server(request.params.as_deref()) else {
                    session
                        .send(&ControlMessage::response(
                            ResponseCode::NOT_IMPLEMENTED,
                            format!("{} has no server", module.name()),
                        ))
                        .await?;
                    return Ok(());
                };

                info!("Starting {} server for {}", module.name(), session.peer());
                session.send(&ControlMessage::ok()).await?;
                let mut config = self.config.clone();
                config.pin_to_local(local);
                serve_test(&mut session, server.as_mut(), &config).await
            }
            ControlMessage::Test(request) => self.run_test(&mut session, request).await,
            other => {
                session
                    .send(&ControlMessage::response(
                        ResponseCode::BAD_REQUEST,
                        format!("unexpected {} message", other.kind()),
                    ))
                    .await
            }
        };

        session.close().await;
        result
    }

    async fn run_test(&self, session: &mut ControlSession, request: TestRequest) -> Result<()> {
        let Some(module) = self.registry.by_id(request.test_type) else {
            return session
                .send(&ControlMessage::response(
                    ResponseCode::NOT_FOUND,
                    format!("unknown test type {}", request.test_type),
                ))
                .await;
        };

        info!(
            "Running {} test for {} against {} target(s)",
            module.name(),
            session.peer(),
            request.targets.len()
        );
        session.send(&ControlMessage::ok()).await?;

        match module.run(request.params.as_deref(), &request.targets).await {
            Ok(result) => {
                session
                    .send(&ControlMessage::result(request.test_type, result))
                    .await
            }
            Err(e) => {
                error!("{} test failed: {:#}", module.name(), e);
                session
                    .send(&ControlMessage::response(
                        ResponseCode::INTERNAL_ERROR,
                        format!("{:#}", e),
                    ))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{HelloParams, Skeleton, TestModule};
    use crate::protocol::Hello;
    use async_trait::async_trait;

    fn pipe() -> (ControlSession, ControlSession) {
        let (a, b) = tokio::io::duplex(4096);
        let addr = "127.0.0.1:8815".parse().unwrap();
        (
            ControlSession::new(a, addr, None, false),
            ControlSession::new(b, addr, None, false),
        )
    }

    struct ReservedPortServer;

    #[async_trait]
    impl TestServer for ReservedPortServer {
        fn test_type(&self) -> u64 {
            3
        }

        fn socket_kind(&self) -> SocketKind {
            SocketKind::Datagram
        }

        fn hello(&mut self, _options: &[u8]) -> anyhow::Result<HelloParams> {
            Ok(HelloParams { test_port: 80 })
        }

        async fn send(
            &mut self,
            _socket: &TestSocket,
            _peer: SocketAddr,
            _options: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn receive(
            &mut self,
            _socket: &TestSocket,
            _options: &[u8],
        ) -> anyhow::Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_wrong_first_message_gets_bad_request() {
        let (mut local, mut remote) = pipe();
        let mut server = Skeleton.server(None).unwrap();

        remote.send(&ControlMessage::ok()).await.unwrap();
        let err = serve_test(&mut local, server.as_mut(), &SocketConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        let response = remote.recv().await.unwrap().into_response().unwrap();
        assert_eq!(response.code, ResponseCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_reserved_test_port_rejected() {
        let (mut local, mut remote) = pipe();
        remote
            .send(&ControlMessage::Hello(Hello {
                test_type: 3,
                options: vec![],
            }))
            .await
            .unwrap();

        let err = serve_test(&mut local, &mut ReservedPortServer, &SocketConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        let response = remote.recv().await.unwrap().into_response().unwrap();
        assert_eq!(response.code, ResponseCode::BAD_REQUEST);
        assert!(response.message.contains("reserved"));
    }

    #[tokio::test]
    async fn test_daemon_rejects_unknown_test() {
        let (mut local, mut remote) = pipe();
        let daemon = Daemon::new(Registry::builtin(), None, SocketConfig::default());

        let request = TestRequest {
            test_type: 42,
            params: None,
            targets: vec![],
        };
        daemon.run_test(&mut local, request).await.unwrap();
        let response = remote.recv().await.unwrap().into_response().unwrap();
        assert_eq!(response.code, ResponseCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_daemon_runs_test() {
        let (mut local, mut remote) = pipe();
        let daemon = Daemon::new(Registry::builtin(), None, SocketConfig::default());

        let request = TestRequest {
            test_type: 0,
            params: Some("-a".to_string()),
            targets: vec!["192.0.2.1".to_string()],
        };
        daemon.run_test(&mut local, request).await.unwrap();
        assert!(remote.recv().await.unwrap().into_response().unwrap().code.is_ok());
        let result = remote.recv().await.unwrap().into_result(0).unwrap();
        assert!(Skeleton.print(&result.result).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_accept_backoff_only_for_lasting_errors() {
        assert_eq!(
            accept_error_delay(&io::Error::from(io::ErrorKind::Interrupted)),
            None
        );
        assert_eq!(
            accept_error_delay(&io::Error::from(io::ErrorKind::ConnectionAborted)),
            None
        );
        assert_eq!(
            accept_error_delay(&io::Error::from_raw_os_error(libc::EMFILE)),
            Some(ACCEPT_ERROR_BACKOFF)
        );
    }
}
