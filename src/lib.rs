//! probectl - control channel for remote network measurement tests
//!
//! One host asks another to run a test, or to start the server half of a
//! test, over a length-prefixed control protocol that can run over mutual
//! TLS. Listening and connecting handle IPv4 and IPv6 independently, retry
//! busy ports across a range and verify every socket option they set.
//!
//! # Library Usage
//!
//! ```ignore
//! use probectl::client::{connect_control, run_remote_test};
//! use probectl::connector::RetryPolicy;
//! use probectl::module::{Registry, Skeleton};
//! use probectl::net::{AddressFamily, resolve_destination};
//! use probectl::protocol::DEFAULT_DAEMON_PORT;
//! use probectl::sockopt::SocketConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dest = resolve_destination("remote.example", DEFAULT_DAEMON_PORT, AddressFamily::Any)?
//!         .remove(0);
//!     let mut session = connect_control(
//!         &dest,
//!         DEFAULT_DAEMON_PORT,
//!         &SocketConfig::default(),
//!         None,
//!         RetryPolicy::default(),
//!     )
//!     .await?;
//!     run_remote_test(&mut session, &Skeleton, None, &["192.0.2.1".to_string()]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`sockopt`] - Socket configuration and verified options
//! - [`listener`], [`connector`] - Dual-stack listening and connecting
//! - [`tls`], [`session`] - Secure session upgrade
//! - [`protocol`], [`codec`] - Control messages and framing
//! - [`client`], [`serve`] - Initiator and responder state machines
//! - [`module`] - Test module interface

pub mod client;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod listener;
pub mod module;
pub mod net;
pub mod protocol;
pub mod serve;
pub mod session;
pub mod sockopt;
pub mod tls;

pub use client::{RemoteOutcome, TestClient, run_remote_test, start_remote_server};
pub use error::{CodecError, Error, Result};
pub use protocol::{ControlMessage, ResponseCode, TestType};
pub use serve::{Daemon, listen_control_server, serve_test};
pub use session::ControlSession;
