//! Initiator side of the control protocol
//!
//! Asks a remote host to run a test and prints what comes back, or starts
//! the server half of a test remotely and drives it with [`TestClient`].

use tracing::{debug, error, info, warn};

use crate::connector::{RetryPolicy, connect_to_server};
use crate::error::{Error, Result};
use crate::module::TestModule;
use crate::net::Destination;
use crate::protocol::{
    ControlMessage, Hello, ReceiveCommand, ResponseCode, SendCommand, ServerRequest, TestRequest,
    TestType,
};
use crate::session::ControlSession;
use crate::sockopt::SocketConfig;
use crate::tls::{SecureContext, upgrade_client};

/// How a remote test run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// A result arrived and was handed to the module's printer
    Printed,
    /// The remote accepted the test but reported an error instead of a result
    Failed { code: ResponseCode, message: String },
    /// The remote refused the test
    Rejected { code: ResponseCode, message: String },
    /// Something other than a result or response arrived
    Unexpected(&'static str),
}

/// Connect to a control port and upgrade the connection.
pub async fn connect_control(
    destination: &Destination,
    port: u16,
    config: &SocketConfig,
    context: Option<&SecureContext>,
    policy: RetryPolicy,
) -> Result<ControlSession> {
    let stream = connect_to_server(destination, port, config, policy).await?;
    upgrade_client(context, stream, destination).await
}

/// Ask the remote end to run `module` against `targets` and print the result.
pub async fn run_remote_test(
    session: &mut ControlSession,
    module: &dyn TestModule,
    params: Option<&str>,
    targets: &[String],
) -> Result<RemoteOutcome> {
    let test_type = module.id();
    session
        .send(&ControlMessage::Test(TestRequest {
            test_type,
            params: params.map(str::to_string),
            targets: targets.to_vec(),
        }))
        .await?;
    debug!("Sent TEST {} to {}", module.name(), session.peer());

    let response = session.recv().await?.into_response()?;
    if !response.code.is_ok() {
        error!(
            "Failed to start {} test on {}: {} {}",
            module.name(),
            session.peer(),
            response.code,
            response.message
        );
        return Ok(RemoteOutcome::Rejected {
            code: response.code,
            message: response.message,
        });
    }

    match session.recv().await? {
        ControlMessage::Result(report) => {
            if report.test_type != test_type {
                return Err(crate::error::CodecError::TestTypeMismatch {
                    expected: test_type,
                    got: report.test_type,
                }
                .into());
            }
            info!(
                "Received {} byte result from {}",
                report.result.len(),
                session.peer()
            );
            module
                .print(&report.result)
                .map_err(|e| Error::Module(format!("{:#}", e)))?;
            Ok(RemoteOutcome::Printed)
        }
        ControlMessage::Response(response) => {
            error!(
                "Remote {} test failed: {} {}",
                module.name(),
                response.code,
                response.message
            );
            Ok(RemoteOutcome::Failed {
                code: response.code,
                message: response.message,
            })
        }
        other => {
            warn!("Unexpected {} message after TEST, no result", other.kind());
            Ok(RemoteOutcome::Unexpected(other.kind()))
        }
    }
}

/// Ask the remote control daemon to start the server half of a test.
pub async fn start_remote_server(
    session: &mut ControlSession,
    test_type: TestType,
    params: Option<&str>,
) -> Result<()> {
    session
        .send(&ControlMessage::Server(ServerRequest {
            test_type,
            params: params.map(str::to_string),
        }))
        .await?;

    let response = session.recv().await?.into_response()?;
    if !response.code.is_ok() {
        return Err(Error::Remote {
            code: response.code,
            message: response.message,
        });
    }

    debug!("Remote server for test {} started", test_type);
    Ok(())
}

/// Drives a remote test server over an established control session.
#[derive(Debug)]
pub struct TestClient<'a> {
    session: &'a mut ControlSession,
    test_type: TestType,
}

impl<'a> TestClient<'a> {
    pub fn new(session: &'a mut ControlSession, test_type: TestType) -> Self {
        Self { session, test_type }
    }

    pub fn session(&self) -> &ControlSession {
        self.session
    }

    pub async fn hello(&mut self, options: Vec<u8>) -> Result<()> {
        self.session
            .send(&ControlMessage::Hello(Hello {
                test_type: self.test_type,
                options,
            }))
            .await
    }

    /// Ask the server to receive; returns the port it is waiting on.
    pub async fn request_receive(&mut self, options: Vec<u8>) -> Result<u16> {
        self.session
            .send(&ControlMessage::Receive(ReceiveCommand {
                test_type: self.test_type,
                options,
            }))
            .await?;

        match self.session.recv().await? {
            ControlMessage::Response(r) if !r.code.is_ok() => Err(Error::Remote {
                code: r.code,
                message: r.message,
            }),
            other => Ok(other.into_ready(self.test_type)?.test_port),
        }
    }

    /// Ask the server to send test traffic to us on `test_port`.
    pub async fn request_send(&mut self, test_port: u16, options: Vec<u8>) -> Result<()> {
        self.session
            .send(&ControlMessage::Send(SendCommand {
                test_type: self.test_type,
                test_port,
                options,
            }))
            .await
    }

    /// Wait for the result of the last SEND or RECEIVE.
    pub async fn read_result(&mut self) -> Result<Vec<u8>> {
        match self.session.recv().await? {
            ControlMessage::Response(r) if !r.code.is_ok() => Err(Error::Remote {
                code: r.code,
                message: r.message,
            }),
            other => Ok(other.into_result(self.test_type)?.result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Skeleton;
    use crate::protocol::Ready;

    fn pipe() -> (ControlSession, ControlSession) {
        let (a, b) = tokio::io::duplex(4096);
        let addr = "127.0.0.1:8869".parse().unwrap();
        (
            ControlSession::new(a, addr, None, false),
            ControlSession::new(b, addr, None, false),
        )
    }

    #[tokio::test]
    async fn test_rejected_test() {
        let (mut local, mut remote) = pipe();
        let responder = tokio::spawn(async move {
            let msg = remote.recv().await.unwrap();
            assert_eq!(msg.kind(), "test");
            remote
                .send(&ControlMessage::response(ResponseCode::NOT_FOUND, "no such test"))
                .await
                .unwrap();
        });

        let outcome = run_remote_test(&mut local, &Skeleton, None, &[])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RemoteOutcome::Rejected {
                code: ResponseCode::NOT_FOUND,
                message: "no such test".to_string()
            }
        );
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_second_message() {
        let (mut local, mut remote) = pipe();
        let responder = tokio::spawn(async move {
            remote.recv().await.unwrap();
            remote.send(&ControlMessage::ok()).await.unwrap();
            remote
                .send(&ControlMessage::Ready(Ready {
                    test_type: 0,
                    test_port: 8826,
                }))
                .await
                .unwrap();
        });

        let outcome = run_remote_test(&mut local, &Skeleton, None, &[])
            .await
            .unwrap();
        assert_eq!(outcome, RemoteOutcome::Unexpected("ready"));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_remote_server_error() {
        let (mut local, mut remote) = pipe();
        let responder = tokio::spawn(async move {
            let msg = remote.recv().await.unwrap();
            assert_eq!(msg.test_type(), Some(4));
            remote
                .send(&ControlMessage::response(
                    ResponseCode::NOT_IMPLEMENTED,
                    "no server",
                ))
                .await
                .unwrap();
        });

        let err = start_remote_server(&mut local, 4, None).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Remote {
                code: ResponseCode::NOT_IMPLEMENTED,
                ..
            }
        ));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_ready_type_checked() {
        let (mut local, mut remote) = pipe();
        let responder = tokio::spawn(async move {
            remote.recv().await.unwrap();
            remote
                .send(&ControlMessage::Ready(Ready {
                    test_type: 9,
                    test_port: 8826,
                }))
                .await
                .unwrap();
        });

        let mut client = TestClient::new(&mut local, 0);
        let err = client.request_receive(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
        responder.await.unwrap();
    }
}
