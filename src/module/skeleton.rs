//! Minimal test module that exercises the control protocol without
//! measuring anything.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{HelloParams, TestModule, TestServer, TestSocket};
use crate::protocol::{DEFAULT_TEST_PORT, TestType};
use crate::sockopt::SocketKind;

const SKELETON_ID: TestType = 0;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PAYLOAD: &[u8] = b"skeleton";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonReport {
    pub args: Option<String>,
    pub targets: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkeletonHello {
    #[serde(default = "default_test_port")]
    pub test_port: u16,
}

fn default_test_port() -> u16 {
    DEFAULT_TEST_PORT
}

/// What the server side saw during one SEND or RECEIVE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub bytes: usize,
    pub peer: SocketAddr,
}

pub struct Skeleton;

#[async_trait]
impl TestModule for Skeleton {
    fn id(&self) -> TestType {
        SKELETON_ID
    }

    fn name(&self) -> &'static str {
        "skeleton"
    }

    async fn run(&self, params: Option<&str>, targets: &[String]) -> anyhow::Result<Vec<u8>> {
        let report = SkeletonReport {
            args: params.map(str::to_string),
            targets: targets.len(),
        };
        Ok(serde_json::to_vec(&report)?)
    }

    fn print(&self, result: &[u8]) -> anyhow::Result<()> {
        let report: SkeletonReport =
            serde_json::from_slice(result).context("invalid skeleton result")?;
        println!(
            "skeleton: args={} targets={}",
            report.args.as_deref().unwrap_or("-"),
            report.targets
        );
        Ok(())
    }

    fn server(&self, params: Option<&str>) -> Option<Box<dyn TestServer>> {
        debug!("Creating skeleton server (params: {:?})", params);
        Some(Box::new(SkeletonServer))
    }
}

/// Exchanges single datagrams with the initiator
pub struct SkeletonServer;

#[async_trait]
impl TestServer for SkeletonServer {
    fn test_type(&self) -> TestType {
        SKELETON_ID
    }

    fn socket_kind(&self) -> SocketKind {
        SocketKind::Datagram
    }

    fn hello(&mut self, options: &[u8]) -> anyhow::Result<HelloParams> {
        if options.is_empty() {
            return Ok(HelloParams {
                test_port: DEFAULT_TEST_PORT,
            });
        }
        let hello: SkeletonHello =
            serde_json::from_slice(options).context("invalid skeleton hello")?;
        Ok(HelloParams {
            test_port: hello.test_port,
        })
    }

    async fn send(
        &mut self,
        socket: &TestSocket,
        peer: SocketAddr,
        options: &[u8],
    ) -> anyhow::Result<Vec<u8>> {
        let TestSocket::Datagram(socket) = socket else {
            bail!("skeleton only sends datagrams");
        };
        let payload = if options.is_empty() {
            DEFAULT_PAYLOAD
        } else {
            options
        };
        let bytes = socket.send_to(payload, peer).await?;
        debug!("Sent {} bytes to {}", bytes, peer);
        Ok(serde_json::to_vec(&TransferReport { bytes, peer })?)
    }

    async fn receive(&mut self, socket: &TestSocket, _options: &[u8]) -> anyhow::Result<Vec<u8>> {
        let TestSocket::Datagram(socket) = socket else {
            bail!("skeleton only receives datagrams");
        };
        let mut buf = [0u8; 2048];
        let (bytes, peer) = tokio::time::timeout(RECEIVE_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .context("timed out waiting for test datagram")??;
        debug!("Received {} bytes from {}", bytes, peer);
        Ok(serde_json::to_vec(&TransferReport { bytes, peer })?)
    }
}
