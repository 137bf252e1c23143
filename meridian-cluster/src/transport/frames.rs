//! Wire framing for inter-node messages.
//!
//! ```text
//! frame   := length u32 | request-id u64 | flags u8 | version u32 | rest
//! rest    := action string | payload      (requests)
//!          | payload                      (responses, flags tell error)
//! ```
//!
//! Flags: bit 0 request, bit 1 error, bit 2 compressed. Payloads above the
//! compression threshold are zstd-compressed; the flag tells the receiver.

use crate::error::{ClusterError, Result};
use crate::wire;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Highest protocol version this build speaks.
pub const PROTOCOL_VERSION: u32 = 2;
/// Oldest peer version this build still understands.
pub const MIN_COMPATIBLE_VERSION: u32 = 1;

const FLAG_REQUEST: u8 = 0x01;
const FLAG_ERROR: u8 = 0x02;
const FLAG_COMPRESSED: u8 = 0x04;

const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameKind {
    Request { action: String },
    Response,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: u64,
    pub version: u32,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(request_id: u64, action: impl Into<String>, payload: Vec<u8>) -> Frame {
        Frame {
            request_id,
            version: PROTOCOL_VERSION,
            kind: FrameKind::Request {
                action: action.into(),
            },
            payload: payload.into(),
        }
    }

    pub fn response(request_id: u64, payload: Vec<u8>) -> Frame {
        Frame {
            request_id,
            version: PROTOCOL_VERSION,
            kind: FrameKind::Response,
            payload: payload.into(),
        }
    }

    pub fn error(request_id: u64, error: &ClusterError) -> Frame {
        let payload = bincode::serialize(error).unwrap_or_default();
        Frame {
            request_id,
            version: PROTOCOL_VERSION,
            kind: FrameKind::Error,
            payload: payload.into(),
        }
    }
}

pub struct FrameCodec {
    /// Compress payloads larger than this many bytes.
    pub compress_threshold: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            compress_threshold: 8 * 1024,
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> std::io::Result<()> {
        let mut flags = 0u8;
        let mut payload: Vec<u8> = frame.payload.to_vec();
        if payload.len() > self.compress_threshold {
            payload = zstd::stream::encode_all(&payload[..], 0)?;
            flags |= FLAG_COMPRESSED;
        }

        let mut body = BytesMut::new();
        body.put_u64(frame.request_id);
        match &frame.kind {
            FrameKind::Request { action } => {
                flags |= FLAG_REQUEST;
                body.put_u8(flags);
                body.put_u32(frame.version);
                wire::write_string(&mut body, action);
            }
            FrameKind::Response => {
                body.put_u8(flags);
                body.put_u32(frame.version);
            }
            FrameKind::Error => {
                flags |= FLAG_ERROR;
                body.put_u8(flags);
                body.put_u32(frame.version);
            }
        }
        body.put_slice(&payload);

        if body.len() > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds maximum size",
            ));
        }
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_BYTES {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "frame exceeds maximum size",
            ));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(length).freeze();

        if body.remaining() < 13 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "truncated frame header",
            ));
        }
        let request_id = body.get_u64();
        let flags = body.get_u8();
        let version = body.get_u32();

        let kind = if flags & FLAG_REQUEST != 0 {
            let action = wire::read_string(&mut body).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            })?;
            FrameKind::Request { action }
        } else if flags & FLAG_ERROR != 0 {
            FrameKind::Error
        } else {
            FrameKind::Response
        };

        let payload = if flags & FLAG_COMPRESSED != 0 {
            let decompressed = zstd::stream::decode_all(&body[..])?;
            Bytes::from(decompressed)
        } else {
            body
        };

        Ok(Some(Frame {
            request_id,
            version,
            kind,
            payload,
        }))
    }
}

/// Decode the payload of an error frame back into the remote error.
pub fn decode_error(payload: &[u8]) -> ClusterError {
    bincode::deserialize(payload)
        .unwrap_or_else(|_| ClusterError::Transport("undecodable remote error".to_string()))
}

/// Encode/decode helpers for typed payload bodies.
pub fn encode_payload<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) -> Frame {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = Frame::request(7, "indices:data/write", b"payload".to_vec());
        let decoded = roundtrip(frame.clone());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_response_and_error_frames() {
        let response = roundtrip(Frame::response(9, b"ok".to_vec()));
        assert_eq!(response.kind, FrameKind::Response);
        assert_eq!(&response.payload[..], b"ok");

        let error = roundtrip(Frame::error(
            9,
            &ClusterError::Validation("nope".to_string()),
        ));
        assert_eq!(error.kind, FrameKind::Error);
        let remote = decode_error(&error.payload);
        assert_eq!(remote.error_type(), "validation");
    }

    #[test]
    fn test_partial_input_waits_for_more() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::request(1, "a", vec![0u8; 64]), &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_large_payload_is_compressed_on_the_wire() {
        let mut codec = FrameCodec {
            compress_threshold: 128,
        };
        // Highly compressible payload well over the threshold.
        let payload = vec![b'z'; 100_000];
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::request(3, "bulk", payload.clone()), &mut buf)
            .unwrap();
        assert!(
            buf.len() < payload.len() / 2,
            "wire bytes should be much smaller than the payload"
        );
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded.payload[..], &payload[..]);
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Frame::request(1, "a", b"1".to_vec()), &mut buf).unwrap();
        codec.encode(Frame::request(2, "b", b"2".to_vec()), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.request_id, 1);
        assert_eq!(second.request_id, 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_typed_payload_helpers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Ping {
            node: String,
        }
        let bytes = encode_payload(&Ping { node: "n1".into() }).unwrap();
        let back: Ping = decode_payload(&bytes).unwrap();
        assert_eq!(back.node, "n1");
    }
}
