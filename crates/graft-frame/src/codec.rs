use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::channel::{Origin, ROOT};
use crate::error::{FrameError, Result};

/// Frame header: magic (2) + length (4) + kind (1) + flags (1) + channel (4) = 12 bytes.
pub const HEADER_SIZE: usize = 12;

/// Magic bytes: "GF" (0x47 0x46).
pub const MAGIC: [u8; 2] = [0x47, 0x46];

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Flag bit set when the channel ID was allocated by the frame's receiver.
pub const FLAG_RECEIVER_ORIGIN: u8 = 0x01;

const KNOWN_FLAGS: u8 = FLAG_RECEIVER_ORIGIN;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A complete session-level message.
    Message = 0,
    /// One chunk of an embedded channel.
    Data = 1,
    /// A lifecycle or flow-control signal for an embedded channel.
    Control = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Message),
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Control),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A frame with its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the payload holds.
    pub kind: FrameKind,
    /// Which side allocated `channel`.
    pub origin: Origin,
    /// The channel this frame belongs to.
    pub channel: u32,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, origin: Origin, channel: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            origin,
            channel,
            payload: payload.into(),
        }
    }

    /// A session-level message on the root channel.
    pub fn message(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Message, Origin::Sender, ROOT, payload)
    }

    /// A data chunk for an embedded channel.
    pub fn data(origin: Origin, channel: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Data, origin, channel, payload)
    }

    /// A control signal for an embedded channel.
    pub fn control(origin: Origin, channel: u32, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Control, origin, channel, payload)
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────┬──────┬───────┬──────────┬────────────────┐
/// │ Magic (2B) │ Length   │ Kind │ Flags │ Channel  │ Payload        │
/// │ 0x47 0x46  │ (4B LE)  │ (1B) │ (1B)  │ (4B LE)  │ (Length bytes) │
/// │ "GF"       │          │      │       │          │                │
/// └────────────┴──────────┴──────┴───────┴──────────┴────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    let len = frame.payload.len();
    if len > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: u32::MAX as usize,
        });
    }
    let flags = match frame.origin {
        Origin::Sender => 0,
        Origin::Receiver => FLAG_RECEIVER_ORIGIN,
    };
    dst.reserve(HEADER_SIZE + len);
    dst.put_slice(&MAGIC);
    dst.put_u32_le(len as u32);
    dst.put_u8(frame.kind as u8);
    dst.put_u8(flags);
    dst.put_u32_le(frame.channel);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer. A malformed header
/// is rejected before any payload is consumed.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(FrameError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let kind = FrameKind::try_from(src[6])?;
    let flags = src[7];
    let channel = u32::from_le_bytes([src[8], src[9], src[10], src[11]]);

    if flags & !KNOWN_FLAGS != 0 {
        return Err(FrameError::UnknownFlags(flags));
    }

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    let origin = if flags & FLAG_RECEIVER_ORIGIN != 0 {
        Origin::Receiver
    } else {
        Origin::Sender
    };

    Ok(Some(Frame {
        kind,
        origin,
        channel,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// `tokio_util` codec for graft frames.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: FrameConfig,
}

impl FrameCodec {
    /// Create a codec with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with explicit configuration.
    pub fn with_config(config: FrameConfig) -> Self {
        Self { config }
    }

    /// Current codec configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        decode_frame(src, self.config.max_payload_size)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                tracing::debug!(buffered = src.len(), "stream ended mid-frame");
                Err(FrameError::ConnectionClosed)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(&frame, dst)
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let frame = Frame::data(Origin::Receiver, 9, Bytes::from_static(b"hello, graft!"));

        encode_frame(&frame, &mut buf).unwrap();
        assert_eq!(buf.len(), frame.wire_size());

        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();

        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame::control(Origin::Receiver, 0x0102_0304, Bytes::from_static(b"x")),
            &mut buf,
        )
        .unwrap();

        assert_eq!(&buf[0..2], b"GF");
        assert_eq!(&buf[2..6], &[1, 0, 0, 0]);
        assert_eq!(buf[6], FrameKind::Control as u8);
        assert_eq!(buf[7], FLAG_RECEIVER_ORIGIN);
        assert_eq!(&buf[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[12..], b"x");
    }

    #[test]
    fn test_decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x47, 0x46, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::message(Bytes::from_static(b"hello")), &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::InvalidMagic)));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::message(Bytes::new()), &mut buf).unwrap();
        buf[6] = 9;

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::UnknownKind(9))));
    }

    #[test]
    fn test_decode_unknown_flags() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::message(Bytes::new()), &mut buf).unwrap();
        buf[7] = 0x80;

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::UnknownFlags(0x80))));
    }

    #[test]
    fn test_decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024 * 1024 * 32);
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u32_le(1);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn test_multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data(Origin::Sender, 1, "first"), &mut buf).unwrap();
        encode_frame(&Frame::data(Origin::Sender, 2, "second"), &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f1.channel, 1);
        assert_eq!(f1.payload.as_ref(), b"first");

        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f2.channel, 2);
        assert_eq!(f2.payload.as_ref(), b"second");

        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::message(Bytes::new()), &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Message);
        assert_eq!(frame.channel, ROOT);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_encoder_enforces_max_payload() {
        let mut codec = FrameCodec::with_config(FrameConfig {
            max_payload_size: 4,
        });
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Frame::data(Origin::Sender, 1, "oversized"), &mut buf)
            .unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_eof_with_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        encode_frame(&Frame::data(Origin::Sender, 3, "partial"), &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 1);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
        assert!(codec.decode_eof(&mut BytesMut::new()).unwrap().is_none());
    }

    #[test]
    fn test_malformed_classification() {
        assert!(FrameError::InvalidMagic.is_malformed());
        assert!(FrameError::UnknownKind(7).is_malformed());
        assert!(!FrameError::ConnectionClosed.is_malformed());
    }

    #[tokio::test]
    async fn framed_roundtrip_over_pipe() {
        let (left, right) = graft_transport::pipe();
        let mut writer = FramedWrite::new(left, FrameCodec::new());
        let mut reader = FramedRead::new(right, FrameCodec::new());

        writer.send(Frame::message("hello")).await.unwrap();
        writer
            .send(Frame::data(Origin::Receiver, 4, "chunk"))
            .await
            .unwrap();
        writer
            .send(Frame::control(Origin::Sender, 4, "{\"op\":\"end\"}"))
            .await
            .unwrap();
        drop(writer);

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Message);
        assert_eq!(first.payload.as_ref(), b"hello");

        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(
            (second.kind, second.origin, second.channel),
            (FrameKind::Data, Origin::Receiver, 4)
        );

        let third = reader.next().await.unwrap().unwrap();
        assert_eq!(third.kind, FrameKind::Control);

        assert!(reader.next().await.is_none());
    }

    #[tokio::test]
    async fn framed_reader_reports_truncated_stream() {
        let (mut left, right) = graft_transport::pipe();
        let mut wire = BytesMut::new();
        encode_frame(&Frame::data(Origin::Sender, 1, "truncated"), &mut wire).unwrap();
        wire.truncate(HEADER_SIZE + 3);

        tokio::io::AsyncWriteExt::write_all(&mut left, &wire)
            .await
            .unwrap();
        drop(left);

        let mut reader = FramedRead::new(right, FrameCodec::new());
        let err = reader.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }
}
