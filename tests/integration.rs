//! Integration tests for probectl

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use probectl::client::{
    RemoteOutcome, TestClient, connect_control, run_remote_test, start_remote_server,
};
use probectl::connector::RetryPolicy;
use probectl::listener::{listen_on_port_range, start_listening};
use probectl::module::{Registry, Skeleton, TestModule};
use probectl::net::Destination;
use probectl::protocol::{ControlMessage, TestRequest, TestType};
use probectl::serve::{ControlServer, Daemon};
use probectl::session::ControlSession;
use probectl::sockopt::SocketConfig;
use probectl::tls::{SecureContext, upgrade_client};
use probectl::{Error, ResponseCode};

// Use different ports for each test to avoid conflicts
static PORT_COUNTER: AtomicU16 = AtomicU16::new(18000);

fn get_test_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

fn loopback_config() -> SocketConfig {
    SocketConfig {
        source_v4: Some(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
        reuse_addr: true,
        ..Default::default()
    }
}

fn localhost(port: u16) -> Destination {
    Destination::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), "localhost")
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(10),
    }
}

fn tls_context() -> SecureContext {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivateKeyDer::Pkcs8(cert.signing_key.serialize_der().into());
    let cert_der = CertificateDer::from(cert.cert);
    SecureContext::new(vec![cert_der.clone()], vec![cert_der], key).unwrap()
}

/// Keeps whatever it is asked to print
struct RecordingModule {
    id: TestType,
    printed: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl TestModule for RecordingModule {
    fn id(&self) -> TestType {
        self.id
    }

    fn name(&self) -> &'static str {
        "recording"
    }

    async fn run(&self, _params: Option<&str>, _targets: &[String]) -> anyhow::Result<Vec<u8>> {
        Ok(vec![])
    }

    fn print(&self, result: &[u8]) -> anyhow::Result<()> {
        self.printed.lock().push(result.to_vec());
        Ok(())
    }
}

/// Panics instead of running
struct PanickingModule;

#[async_trait]
impl TestModule for PanickingModule {
    fn id(&self) -> TestType {
        9
    }

    fn name(&self) -> &'static str {
        "panicking"
    }

    async fn run(&self, _params: Option<&str>, _targets: &[String]) -> anyhow::Result<Vec<u8>> {
        panic!("test module failed");
    }

    fn print(&self, _result: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn start_daemon() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let daemon = Daemon::new(Registry::builtin(), None, loopback_config());
    let listener = daemon.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = Arc::new(daemon).serve(listener).await;
    });
    (addr, handle)
}

#[tokio::test]
async fn test_listener_skips_busy_port() {
    let port = get_test_port();
    let _held = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();

    let (pair, used) = listen_on_port_range(port, port + 5, &loopback_config()).unwrap();
    assert_eq!(used, port + 1);
    assert!(pair.v4.is_some());
    assert!(pair.v6.is_none());
}

#[tokio::test]
async fn test_busy_port_leaves_nothing_open() {
    let port = get_test_port();
    let held = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();

    let err = start_listening(port, &loopback_config()).unwrap_err();
    assert!(err.is_addr_in_use());

    // Once released the port can be listened on again straight away
    drop(held);
    assert!(start_listening(port, &loopback_config()).is_ok());
}

#[tokio::test]
async fn test_remote_result_reaches_printer() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let responder = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut session = ControlSession::new(stream, peer, None, false);
        let request = match session.recv().await.unwrap() {
            ControlMessage::Test(request) => request,
            other => panic!("expected TEST, got {}", other.kind()),
        };
        assert_eq!(request.test_type, 7);
        assert_eq!(request.targets, vec!["10.0.0.1".to_string()]);

        session.send(&ControlMessage::ok()).await.unwrap();
        session
            .send(&ControlMessage::result(7, vec![0x01, 0x02]))
            .await
            .unwrap();
    });

    let printed = Arc::new(Mutex::new(Vec::new()));
    let module = RecordingModule {
        id: 7,
        printed: printed.clone(),
    };

    let mut session = connect_control(
        &localhost(0),
        port,
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap();
    let outcome = run_remote_test(&mut session, &module, None, &["10.0.0.1".to_string()])
        .await
        .unwrap();

    assert_eq!(outcome, RemoteOutcome::Printed);
    assert_eq!(*printed.lock(), vec![vec![0x01, 0x02]]);
    responder.await.unwrap();
}

#[tokio::test]
async fn test_remote_error_after_ok() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let mut session = ControlSession::new(stream, peer, None, false);
        session.recv().await.unwrap();
        session.send(&ControlMessage::ok()).await.unwrap();
        session
            .send(&ControlMessage::response(
                ResponseCode::INTERNAL_ERROR,
                "test crashed",
            ))
            .await
            .unwrap();
    });

    let printed = Arc::new(Mutex::new(Vec::new()));
    let module = RecordingModule {
        id: 7,
        printed: printed.clone(),
    };
    let mut session = connect_control(
        &localhost(0),
        port,
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap();
    let outcome = run_remote_test(&mut session, &module, None, &[])
        .await
        .unwrap();

    assert_eq!(
        outcome,
        RemoteOutcome::Failed {
            code: ResponseCode::INTERNAL_ERROR,
            message: "test crashed".to_string()
        }
    );
    assert!(printed.lock().is_empty());
}

#[tokio::test]
async fn test_daemon_runs_skeleton() {
    let (addr, _daemon) = start_daemon().await;

    let mut session = connect_control(
        &localhost(0),
        addr.port(),
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap();
    let outcome = timeout(
        Duration::from_secs(10),
        run_remote_test(&mut session, &Skeleton, Some("-v"), &["192.0.2.1".to_string()]),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(outcome, RemoteOutcome::Printed);
}

#[tokio::test]
async fn test_daemon_rejects_unknown_server() {
    let (addr, _daemon) = start_daemon().await;

    let mut session = connect_control(
        &localhost(0),
        addr.port(),
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap();
    let err = start_remote_server(&mut session, 99, None).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Remote {
            code: ResponseCode::NOT_FOUND,
            ..
        }
    ));
}

#[tokio::test]
async fn test_daemon_serves_skeleton_exchange() {
    let (addr, _daemon) = start_daemon().await;
    let test_port = get_test_port();

    let mut session = connect_control(
        &localhost(0),
        addr.port(),
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap();
    start_remote_server(&mut session, 0, None).await.unwrap();

    let mut client = TestClient::new(&mut session, 0);
    client
        .hello(format!("{{\"test_port\":{}}}", test_port).into_bytes())
        .await
        .unwrap();

    // RECEIVE: the server waits for our datagram
    let ready_port = client.request_receive(vec![]).await.unwrap();
    assert_eq!(ready_port, test_port);

    let local = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    local
        .send_to(b"hello", (Ipv4Addr::LOCALHOST, ready_port))
        .await
        .unwrap();
    let result = timeout(Duration::from_secs(10), client.read_result())
        .await
        .unwrap()
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(report["bytes"], 5);

    // SEND: the server sends a datagram back to us
    let our_port = local.local_addr().unwrap().port();
    client.request_send(our_port, b"pong!".to_vec()).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(10), local.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"pong!");
    let result = client.read_result().await.unwrap();
    let report: serde_json::Value = serde_json::from_slice(&result).unwrap();
    assert_eq!(report["bytes"], 5);
}

#[tokio::test]
async fn test_control_server_times_out() {
    let port = get_test_port();
    let mut config = loopback_config();
    let server = ControlServer::bind(port, port + 5, &config).unwrap();

    let err = server
        .accept(&mut config, None, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
}

#[tokio::test]
async fn test_control_server_over_tls() {
    let port = get_test_port();
    let context = tls_context();
    let server_context = context.clone();

    let mut config = loopback_config();
    let server = ControlServer::bind(port, port + 5, &config).unwrap();
    let bound = server.port();

    let accept = tokio::spawn(async move {
        let mut session = server
            .accept(&mut config, Some(&server_context), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(session.is_secure());
        let msg = session.recv().await.unwrap();
        assert_eq!(msg.kind(), "hello");
        config
    });

    let stream = probectl::connector::connect_to_server(
        &localhost(0),
        bound,
        &SocketConfig::default(),
        quick_retry(),
    )
    .await
    .unwrap();
    let mut session = upgrade_client(Some(&context), stream, &localhost(bound))
        .await
        .unwrap();
    assert!(session.is_secure());
    TestClient::new(&mut session, 0).hello(vec![]).await.unwrap();

    // The server now only uses the address the connection arrived on
    let pinned = accept.await.unwrap();
    assert_eq!(pinned.source_v4.unwrap().ip(), &Ipv4Addr::LOCALHOST);
    assert!(pinned.source_v6.is_none());
}

#[tokio::test]
async fn test_tls_name_mismatch_fails() {
    let context = tls_context();
    let server_context = context.clone();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        probectl::tls::upgrade_server(Some(&server_context), stream).await
    });

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let wrong_name = Destination::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), "remote.example");
    let err = upgrade_client(Some(&context), stream, &wrong_name)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Tls(_)));

    // The server side sees the handshake fail too
    let server_result = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
    assert!(server_result.is_err());
}

#[tokio::test]
async fn test_connect_gives_up_after_attempts() {
    let port = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let err = connect_control(
        &localhost(0),
        port,
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::ConnectFailed { attempts: 3, .. }));
}

#[tokio::test]
async fn test_one_off_daemon_reports_crashed_session() {
    let mut registry = Registry::new();
    registry.register(Arc::new(PanickingModule));
    let daemon = Daemon::new(registry, None, loopback_config()).one_off(true);
    let listener = daemon.listen(0).unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(Arc::new(daemon).serve(listener));

    let mut session = connect_control(
        &localhost(0),
        addr.port(),
        &SocketConfig::default(),
        None,
        quick_retry(),
    )
    .await
    .unwrap();
    session
        .send(&ControlMessage::Test(TestRequest {
            test_type: 9,
            params: None,
            targets: vec![],
        }))
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(Error::Io(_))));
}

