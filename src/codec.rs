//! Length-prefixed framing for control messages.
//!
//! Every frame is a 4-byte big-endian body length followed by the serialized
//! [`ControlMessage`]. Frames are limited to [`MAX_MESSAGE_SIZE`] bytes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::{CodecError, Error};
use crate::protocol::{ControlMessage, MAX_MESSAGE_SIZE};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX: usize = 4;

/// Serialize a message into a complete frame, prefix included.
pub fn encode(message: &ControlMessage) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: body.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a complete frame, prefix included.
///
/// Trailing bytes past the declared length are ignored.
pub fn decode(frame: &[u8]) -> Result<ControlMessage, CodecError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(CodecError::Truncated {
            expected: LENGTH_PREFIX,
            actual: frame.len(),
        });
    }

    let len = body_length([frame[0], frame[1], frame[2], frame[3]])?;
    let body = &frame[LENGTH_PREFIX..];
    if body.len() < len {
        return Err(CodecError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }

    decode_body(&body[..len])
}

/// Decode a frame body (no prefix).
pub fn decode_body(body: &[u8]) -> Result<ControlMessage, CodecError> {
    Ok(serde_json::from_slice(body)?)
}

fn body_length(prefix: [u8; LENGTH_PREFIX]) -> Result<usize, CodecError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(CodecError::EmptyFrame);
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(len)
}

/// Write one message to the stream and flush it.
pub async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode(message)?;
    trace!("Writing {} frame ({} bytes)", message.kind(), frame.len());
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message from the stream.
///
/// A clean close before the first prefix byte is `Error::ConnectionClosed`;
/// a close anywhere later is an I/O error.
pub async fn read_message<R>(reader: &mut R) -> Result<ControlMessage, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Err(Error::ConnectionClosed);
    }
    if first < LENGTH_PREFIX {
        reader.read_exact(&mut prefix[first..]).await?;
    }

    let len = body_length(prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    let message = decode_body(&body)?;
    debug!("Received {} message ({} bytes)", message.kind(), len);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Response, ResponseCode, TestRequest};

    #[test]
    fn test_encode_prefix_matches_body() {
        let frame = encode(&ControlMessage::ok()).unwrap();
        let len = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(len, frame.len() - LENGTH_PREFIX);
    }

    #[test]
    fn test_decode_truncated_prefix() {
        assert!(matches!(
            decode(&[0, 0]),
            Err(CodecError::Truncated {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_decode_every_truncation_fails() {
        let frame = encode(&ControlMessage::Test(TestRequest {
            test_type: 7,
            params: Some("-s 100".to_string()),
            targets: vec!["10.0.0.1".to_string()],
        }))
        .unwrap();

        for cut in 0..frame.len() {
            assert!(decode(&frame[..cut]).is_err(), "cut at {} decoded", cut);
        }
        assert!(decode(&frame).is_ok());
    }

    #[test]
    fn test_decode_empty_frame() {
        assert!(matches!(decode(&[0, 0, 0, 0]), Err(CodecError::EmptyFrame)));
    }

    #[test]
    fn test_decode_oversized_frame() {
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(
            decode(&prefix),
            Err(CodecError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_response_without_code_is_malformed() {
        let body = br#"{"type":"response","message":"hi"}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        assert!(matches!(decode(&frame), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let body = br#"{"type":"schedule","test_type":1}"#;
        let mut frame = (body.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(body);
        assert!(matches!(decode(&frame), Err(CodecError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = ControlMessage::Response(Response {
            code: ResponseCode::NOT_FOUND,
            message: "unknown test".to_string(),
        });
        write_message(&mut a, &msg).await.unwrap();
        let got = read_message(&mut b).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_read_after_close() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_partial_frame_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0, 0, 10, b'{']).await.unwrap();
        drop(a);
        assert!(matches!(read_message(&mut b).await, Err(Error::Io(_))));
    }
}
