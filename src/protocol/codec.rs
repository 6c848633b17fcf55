// src/protocol/codec.rs
//! Wire encoding for frames.
//!
//! Transport framing is a 4-byte big-endian length prefix
//! ([`LengthDelimitedCodec`]), one frame per message, on both the client
//! socket and the worker channel. The frame body starts with a tag byte:
//!
//! - `0x00`: structured form, a JSON object with a `kind` field.
//! - `0x01`: compact binary form, used only for byte-stream frames so
//!   artifact payloads are never re-encoded:
//!   `[kind_len: u8][kind][id_len: u8][id][payload...]`
//!
//! Both forms are produced symmetrically by the broker, the worker driver
//! and clients.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::LengthDelimitedCodec;

use crate::utils::errors::{CillowError, Result};

use super::frames::{ByteStreamKind, DriverOp, Request, ResponseFrame, WorkerFrame};

/// Tag byte for the structured (JSON) form.
pub const TAG_STRUCTURED: u8 = 0x00;
/// Tag byte for the compact binary form.
pub const TAG_BINARY: u8 = 0x01;

/// Upper bound on a single frame; large enough for rendered figures.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// The transport codec shared by socket and worker channels.
pub fn length_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

fn encode_structured<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    let body = serde_json::to_vec(value)?;
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_u8(TAG_STRUCTURED);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Encode a client request.
pub fn encode_request(request: &Request) -> Result<Bytes> {
    encode_structured(request)
}

/// Decode a client request.
pub fn decode_request(frame: &[u8]) -> Result<Request> {
    match frame.split_first() {
        Some((&TAG_STRUCTURED, body)) => Ok(serde_json::from_slice(body)?),
        Some((&tag, _)) => Err(CillowError::MalformedFrame(format!(
            "unexpected request tag {:#04x}",
            tag
        ))),
        None => Err(CillowError::MalformedFrame("empty frame".to_string())),
    }
}

/// Encode a response frame, choosing the binary form for byte streams.
pub fn encode_response(frame: &ResponseFrame) -> Result<Bytes> {
    match frame {
        ResponseFrame::ByteStream { stream, bytes, id } => {
            let kind = stream.as_str().as_bytes();
            let id = id.as_deref().unwrap_or("").as_bytes();
            let mut buf = BytesMut::with_capacity(3 + kind.len() + id.len() + bytes.len());
            buf.put_u8(TAG_BINARY);
            buf.put_u8(kind.len() as u8);
            buf.put_slice(kind);
            buf.put_u8(id.len() as u8);
            buf.put_slice(id);
            buf.put_slice(bytes);
            Ok(buf.freeze())
        }
        other => encode_structured(other),
    }
}

fn decode_binary_body(body: &[u8]) -> Result<ResponseFrame> {
    let malformed = |msg: &str| CillowError::MalformedFrame(msg.to_string());

    let (&kind_len, rest) = body
        .split_first()
        .ok_or_else(|| malformed("truncated binary frame"))?;
    if rest.len() < kind_len as usize {
        return Err(malformed("truncated byte-stream kind"));
    }
    let (kind, rest) = rest.split_at(kind_len as usize);
    let kind = std::str::from_utf8(kind).map_err(|_| malformed("byte-stream kind not utf-8"))?;
    let stream = ByteStreamKind::from_str(kind)
        .ok_or_else(|| CillowError::MalformedFrame(format!("unknown byte-stream kind {:?}", kind)))?;

    let (&id_len, rest) = rest
        .split_first()
        .ok_or_else(|| malformed("truncated binary frame"))?;
    if rest.len() < id_len as usize {
        return Err(malformed("truncated byte-stream id"));
    }
    let (id, payload) = rest.split_at(id_len as usize);
    let id = if id.is_empty() {
        None
    } else {
        Some(
            std::str::from_utf8(id)
                .map_err(|_| malformed("byte-stream id not utf-8"))?
                .to_string(),
        )
    };

    Ok(ResponseFrame::ByteStream {
        stream,
        bytes: payload.to_vec(),
        id,
    })
}

/// Decode a response frame from either wire form.
pub fn decode_response(frame: &[u8]) -> Result<ResponseFrame> {
    match frame.split_first() {
        Some((&TAG_STRUCTURED, body)) => Ok(serde_json::from_slice(body)?),
        Some((&TAG_BINARY, body)) => decode_binary_body(body),
        Some((&tag, _)) => Err(CillowError::MalformedFrame(format!(
            "unexpected response tag {:#04x}",
            tag
        ))),
        None => Err(CillowError::MalformedFrame("empty frame".to_string())),
    }
}

/// Decode a frame arriving on the worker channel.
pub fn decode_worker_frame(frame: &[u8]) -> Result<WorkerFrame> {
    match frame.split_first() {
        Some((&TAG_BINARY, body)) => Ok(WorkerFrame::Frame(decode_binary_body(body)?)),
        Some((&TAG_STRUCTURED, body)) => {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            match value.get("kind").and_then(|k| k.as_str()) {
                Some("ready") => Ok(WorkerFrame::Ready),
                Some("requires") => {
                    let names = value
                        .get("names")
                        .and_then(|n| n.as_array())
                        .map(|names| {
                            names
                                .iter()
                                .filter_map(|n| n.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    Ok(WorkerFrame::Requires { names })
                }
                _ => Ok(WorkerFrame::Frame(serde_json::from_value(value)?)),
            }
        }
        Some((&tag, _)) => Err(CillowError::MalformedFrame(format!(
            "unexpected worker tag {:#04x}",
            tag
        ))),
        None => Err(CillowError::MalformedFrame("empty frame".to_string())),
    }
}

/// Encode an operation for the worker driver.
pub fn encode_driver_op(op: &DriverOp) -> Result<Bytes> {
    encode_structured(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frames::{ExceptionKind, StreamKind};

    #[test]
    fn test_structured_response_round_trip() {
        let frame = ResponseFrame::Stream {
            stream: StreamKind::Stdout,
            text: "hi\n".to_string(),
        };
        let encoded = encode_response(&frame).unwrap();
        assert_eq!(encoded[0], TAG_STRUCTURED);
        match decode_response(&encoded).unwrap() {
            ResponseFrame::Stream { stream, text } => {
                assert_eq!(stream, StreamKind::Stdout);
                assert_eq!(text, "hi\n");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_byte_stream_payload_is_not_reencoded() {
        let payload = vec![0x89, 0x50, 0x4e, 0x47, 0x00, 0xff];
        let frame = ResponseFrame::ByteStream {
            stream: ByteStreamKind::Image,
            bytes: payload.clone(),
            id: None,
        };
        let encoded = encode_response(&frame).unwrap();
        assert_eq!(encoded[0], TAG_BINARY);
        // Raw payload bytes appear verbatim at the tail of the frame.
        assert_eq!(&encoded[encoded.len() - payload.len()..], &payload[..]);
        match decode_response(&encoded).unwrap() {
            ResponseFrame::ByteStream { stream, bytes, id } => {
                assert_eq!(stream, ByteStreamKind::Image);
                assert_eq!(bytes, payload);
                assert!(id.is_none());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_byte_stream_with_id() {
        let frame = ResponseFrame::ByteStream {
            stream: ByteStreamKind::Figure,
            bytes: vec![1, 2, 3],
            id: Some("fig-1".to_string()),
        };
        let encoded = encode_response(&frame).unwrap();
        match decode_response(&encoded).unwrap() {
            ResponseFrame::ByteStream { id, .. } => assert_eq!(id.as_deref(), Some("fig-1")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_worker_handshake_frames() {
        let ready = decode_worker_frame(br#"{"kind":"ready"}"#.to_vec().as_slice());
        assert!(ready.is_err()); // missing tag byte

        let mut tagged = vec![TAG_STRUCTURED];
        tagged.extend_from_slice(br#"{"kind":"ready"}"#);
        assert!(matches!(
            decode_worker_frame(&tagged).unwrap(),
            WorkerFrame::Ready
        ));

        let mut tagged = vec![TAG_STRUCTURED];
        tagged.extend_from_slice(br#"{"kind":"requires","names":["numpy","PIL"]}"#);
        match decode_worker_frame(&tagged).unwrap() {
            WorkerFrame::Requires { names } => assert_eq!(names, vec!["numpy", "PIL"]),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_exception_frame_passes_through_worker_channel() {
        let frame = ResponseFrame::exception(ExceptionKind::UserCodeError, "NameError: x");
        let encoded = encode_response(&frame).unwrap();
        match decode_worker_frame(&encoded).unwrap() {
            WorkerFrame::Frame(ResponseFrame::Exception { error, .. }) => {
                assert_eq!(error, ExceptionKind::UserCodeError);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_rejected() {
        assert!(decode_request(&[]).is_err());
        assert!(decode_request(&[0x07, b'{']).is_err());
        assert!(decode_response(&[TAG_STRUCTURED, b'{']).is_err());
    }
}
