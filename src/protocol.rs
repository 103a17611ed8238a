use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Identifier of a test module, shared by both ends of a control session.
pub type TestType = u64;

/// Port the control daemon listens on.
pub const DEFAULT_DAEMON_PORT: u16 = 8869;
/// First port a standalone test server tries for its control connection.
pub const DEFAULT_CONTROL_PORT: u16 = 8815;
pub const MAX_CONTROL_PORT: u16 = 8825;
/// First port tried for test traffic when HELLO asks for the default.
pub const DEFAULT_TEST_PORT: u16 = 8826;
pub const MAX_TEST_PORT: u16 = 8836;
/// Ports below this are never used for test traffic.
pub const RESERVED_PORT_LIMIT: u16 = 1024;

/// How long a standalone server waits for its control connection.
pub const MAXIMUM_SERVER_WAIT_TIME: Duration = Duration::from_secs(60);
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;
pub const CONTROL_CONNECT_DELAY: Duration = Duration::from_secs(2);

/// Largest control frame body accepted from a peer (16 MiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Status code carried by a RESPONSE message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub const OK: ResponseCode = ResponseCode(200);
    pub const BAD_REQUEST: ResponseCode = ResponseCode(400);
    pub const FORBIDDEN: ResponseCode = ResponseCode(403);
    pub const NOT_FOUND: ResponseCode = ResponseCode(404);
    pub const INTERNAL_ERROR: ResponseCode = ResponseCode(500);
    pub const NOT_IMPLEMENTED: ResponseCode = ResponseCode(501);

    pub fn is_ok(&self) -> bool {
        *self == Self::OK
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ask the remote control daemon to start the server half of a test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerRequest {
    pub test_type: TestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
}

/// Ask the remote control daemon to run a test and report the result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestRequest {
    pub test_type: TestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    #[serde(default)]
    pub message: String,
}

/// Opaque, test-defined result bytes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultReport {
    pub test_type: TestType,
    #[serde(with = "hex_bytes")]
    pub result: Vec<u8>,
}

/// Global parameters for a test server, sent once per session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub test_type: TestType,
    #[serde(default, with = "hex_bytes")]
    pub options: Vec<u8>,
}

/// The test server is waiting for traffic on `test_port`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ready {
    pub test_type: TestType,
    pub test_port: u16,
}

/// Tell the test server to send traffic to the initiator on `test_port`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendCommand {
    pub test_type: TestType,
    pub test_port: u16,
    #[serde(default, with = "hex_bytes")]
    pub options: Vec<u8>,
}

/// Tell the test server to receive traffic from the initiator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiveCommand {
    pub test_type: TestType,
    #[serde(default, with = "hex_bytes")]
    pub options: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Server(ServerRequest),
    Test(TestRequest),
    Response(Response),
    Result(ResultReport),
    Hello(Hello),
    Ready(Ready),
    Send(SendCommand),
    Receive(ReceiveCommand),
}

impl ControlMessage {
    pub fn ok() -> Self {
        Self::response(ResponseCode::OK, "OK")
    }

    pub fn response(code: ResponseCode, message: impl Into<String>) -> Self {
        ControlMessage::Response(Response {
            code,
            message: message.into(),
        })
    }

    pub fn result(test_type: TestType, result: Vec<u8>) -> Self {
        ControlMessage::Result(ResultReport { test_type, result })
    }

    /// Wire name of the message type, used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Server(_) => "server",
            ControlMessage::Test(_) => "test",
            ControlMessage::Response(_) => "response",
            ControlMessage::Result(_) => "result",
            ControlMessage::Hello(_) => "hello",
            ControlMessage::Ready(_) => "ready",
            ControlMessage::Send(_) => "send",
            ControlMessage::Receive(_) => "receive",
        }
    }

    /// The test this message belongs to, if it is test-scoped
    pub fn test_type(&self) -> Option<TestType> {
        match self {
            ControlMessage::Server(m) => Some(m.test_type),
            ControlMessage::Test(m) => Some(m.test_type),
            ControlMessage::Response(_) => None,
            ControlMessage::Result(m) => Some(m.test_type),
            ControlMessage::Hello(m) => Some(m.test_type),
            ControlMessage::Ready(m) => Some(m.test_type),
            ControlMessage::Send(m) => Some(m.test_type),
            ControlMessage::Receive(m) => Some(m.test_type),
        }
    }

    pub fn into_response(self) -> Result<Response, CodecError> {
        match self {
            ControlMessage::Response(r) => Ok(r),
            other => Err(unexpected("response", &other)),
        }
    }

    pub fn into_hello(self, expected: TestType) -> Result<Hello, CodecError> {
        match self {
            ControlMessage::Hello(h) => check_test_type(expected, h.test_type).map(|_| h),
            other => Err(unexpected("hello", &other)),
        }
    }

    pub fn into_ready(self, expected: TestType) -> Result<Ready, CodecError> {
        match self {
            ControlMessage::Ready(r) => check_test_type(expected, r.test_type).map(|_| r),
            other => Err(unexpected("ready", &other)),
        }
    }

    pub fn into_result(self, expected: TestType) -> Result<ResultReport, CodecError> {
        match self {
            ControlMessage::Result(r) => check_test_type(expected, r.test_type).map(|_| r),
            other => Err(unexpected("result", &other)),
        }
    }
}

fn unexpected(expected: &'static str, got: &ControlMessage) -> CodecError {
    CodecError::UnexpectedType {
        expected,
        got: got.kind(),
    }
}

fn check_test_type(expected: TestType, got: TestType) -> Result<(), CodecError> {
    if expected == got {
        Ok(())
    } else {
        Err(CodecError::TestTypeMismatch { expected, got })
    }
}

/// Byte blobs travel as lowercase hex strings
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
