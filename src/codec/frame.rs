//! Length-prefixed wire framing.
//!
//! Every TCP message is a length header followed by exactly that many
//! payload bytes:
//!
//! ```text
//! ┌───────────────┬──────────────────┐
//! │ Length        │ Payload          │
//! │ 1/2/4 bytes   │ `Length` bytes   │
//! │ BE or LE      │                  │
//! └───────────────┴──────────────────┘
//! ```
//!
//! Framing parameters are a per-server/per-client setting and must match on
//! both ends. Bounds are validated before any byte is read or written.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Width of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LenWidth {
    /// One byte, messages up to 255 bytes.
    U8,
    /// Two bytes, messages up to 65535 bytes.
    U16,
    /// Four bytes, messages up to ~4 GiB.
    U32,
}

impl LenWidth {
    /// Number of bytes the length field occupies.
    #[inline]
    pub fn size(self) -> usize {
        match self {
            LenWidth::U8 => 1,
            LenWidth::U16 => 2,
            LenWidth::U32 => 4,
        }
    }

    /// Largest length the field can represent.
    #[inline]
    pub fn max_len(self) -> u32 {
        match self {
            LenWidth::U8 => u8::MAX as u32,
            LenWidth::U16 => u16::MAX as u32,
            LenWidth::U32 => u32::MAX,
        }
    }
}

/// Byte order of the length field (and of processor message ids).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Network byte order. The default.
    #[default]
    Big,
    /// Little-endian.
    Little,
}

/// Length-prefix codec configuration.
///
/// Pure value type; cheap to copy into every connection. Bounds are clamped
/// to what the length field can represent, mirroring the admission rules of
/// the wire format.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    width: LenWidth,
    min_msg_len: u32,
    max_msg_len: u32,
    order: ByteOrder,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(LenWidth::U16, 1, 4096, ByteOrder::Big)
    }
}

impl FrameCodec {
    /// Create a codec, clamping `min`/`max` to the width's representable
    /// maximum. A zero `min` or `max` keeps the defaults (1 and 4096).
    pub fn new(width: LenWidth, min_msg_len: u32, max_msg_len: u32, order: ByteOrder) -> Self {
        let mut min = if min_msg_len == 0 { 1 } else { min_msg_len };
        let mut max = if max_msg_len == 0 { 4096 } else { max_msg_len };

        let limit = width.max_len();
        min = min.min(limit);
        max = max.min(limit);

        Self {
            width,
            min_msg_len: min,
            max_msg_len: max,
            order,
        }
    }

    /// Width of the length field in bytes.
    #[inline]
    pub fn header_len(&self) -> usize {
        self.width.size()
    }

    /// Configured minimum message length.
    #[inline]
    pub fn min_msg_len(&self) -> u32 {
        self.min_msg_len
    }

    /// Configured maximum message length.
    #[inline]
    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    fn check_len(&self, len: u32) -> Result<()> {
        if len > self.max_msg_len {
            return Err(Error::MessageTooLong {
                len,
                max: self.max_msg_len,
            });
        }
        if len < self.min_msg_len {
            return Err(Error::MessageTooShort {
                len,
                min: self.min_msg_len,
            });
        }
        Ok(())
    }

    /// Read one message: the length header, then exactly that many bytes.
    ///
    /// Fails with [`Error::MessageTooLong`] / [`Error::MessageTooShort`]
    /// before the payload is consumed.
    pub async fn read<R>(&self, r: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 4];
        let head = &mut head[..self.width.size()];
        r.read_exact(head).await?;

        let len = match self.width {
            LenWidth::U8 => head[0] as u32,
            LenWidth::U16 => match self.order {
                ByteOrder::Big => u16::from_be_bytes([head[0], head[1]]) as u32,
                ByteOrder::Little => u16::from_le_bytes([head[0], head[1]]) as u32,
            },
            LenWidth::U32 => match self.order {
                ByteOrder::Big => u32::from_be_bytes([head[0], head[1], head[2], head[3]]),
                ByteOrder::Little => u32::from_le_bytes([head[0], head[1], head[2], head[3]]),
            },
        };

        self.check_len(len)?;

        let mut data = vec![0u8; len as usize];
        r.read_exact(&mut data).await?;
        Ok(Bytes::from(data))
    }

    /// Build one framed buffer from message parts.
    ///
    /// The total part length is validated against the bounds; nothing is
    /// allocated on failure. Parts must not be mutated concurrently.
    pub fn encode(&self, parts: &[&[u8]]) -> Result<Bytes> {
        let len: u32 = parts.iter().map(|p| p.len() as u32).sum();
        self.check_len(len)?;

        let mut buf = BytesMut::with_capacity(self.width.size() + len as usize);
        match self.width {
            LenWidth::U8 => buf.put_u8(len as u8),
            LenWidth::U16 => match self.order {
                ByteOrder::Big => buf.put_u16(len as u16),
                ByteOrder::Little => buf.put_u16_le(len as u16),
            },
            LenWidth::U32 => match self.order {
                ByteOrder::Big => buf.put_u32(len),
                ByteOrder::Little => buf.put_u32_le(len),
            },
        }
        for part in parts {
            buf.put_slice(part);
        }
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(codec: FrameCodec, payload: &[u8]) -> Bytes {
        let framed = codec.encode(&[payload]).unwrap();
        let mut cursor = std::io::Cursor::new(framed.to_vec());
        codec.read(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn test_roundtrip_all_widths_and_orders() {
        let payload = b"the quick brown fox";
        for width in [LenWidth::U8, LenWidth::U16, LenWidth::U32] {
            for order in [ByteOrder::Big, ByteOrder::Little] {
                let codec = FrameCodec::new(width, 1, 200, order);
                let back = roundtrip(codec, payload).await;
                assert_eq!(&back[..], payload, "{width:?}/{order:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_wire_bytes_u16_big_endian() {
        // "hello" framed with a 2-byte BE prefix: 00 05 68 65 6c 6c 6f
        let codec = FrameCodec::default();
        let framed = codec.encode(&[b"hello"]).unwrap();
        assert_eq!(&framed[..], &[0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f]);
    }

    #[tokio::test]
    async fn test_wire_bytes_u16_little_endian() {
        let codec = FrameCodec::new(LenWidth::U16, 1, 4096, ByteOrder::Little);
        let framed = codec.encode(&[b"hello"]).unwrap();
        assert_eq!(&framed[..2], &[0x05, 0x00]);
    }

    #[test]
    fn test_encode_multiple_parts_concatenated() {
        let codec = FrameCodec::default();
        let framed = codec.encode(&[&[0x00, 0x01], b"payload"]).unwrap();
        assert_eq!(&framed[..], &[0, 9, 0, 1, b'p', b'a', b'y', b'l', b'o', b'a', b'd']);
    }

    #[test]
    fn test_encode_too_long_transmits_nothing() {
        let codec = FrameCodec::new(LenWidth::U16, 1, 4, ByteOrder::Big);
        let err = codec.encode(&[b"hello"]).unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { len: 5, max: 4 }));
    }

    #[test]
    fn test_encode_too_short() {
        let codec = FrameCodec::new(LenWidth::U16, 3, 4096, ByteOrder::Big);
        let err = codec.encode(&[b"hi"]).unwrap_err();
        assert!(matches!(err, Error::MessageTooShort { len: 2, min: 3 }));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_header_before_payload() {
        let codec = FrameCodec::new(LenWidth::U16, 1, 16, ByteOrder::Big);
        // Header claims 1000 bytes; no payload follows.
        let mut cursor = std::io::Cursor::new(vec![0x03, 0xE8]);
        let err = codec.read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { len: 1000, .. }));
    }

    #[tokio::test]
    async fn test_read_rejects_undersized() {
        let codec = FrameCodec::new(LenWidth::U16, 4, 4096, ByteOrder::Big);
        let mut cursor = std::io::Cursor::new(vec![0x00, 0x02, 0xAA, 0xBB]);
        let err = codec.read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooShort { len: 2, min: 4 }));
    }

    #[tokio::test]
    async fn test_read_truncated_payload_is_io_error() {
        let codec = FrameCodec::default();
        let mut cursor = std::io::Cursor::new(vec![0x00, 0x05, b'h', b'i']);
        let err = codec.read(&mut cursor).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_bounds_clamped_to_width() {
        let codec = FrameCodec::new(LenWidth::U8, 1, 100_000, ByteOrder::Big);
        assert_eq!(codec.max_msg_len(), u8::MAX as u32);

        let codec = FrameCodec::new(LenWidth::U16, 1, 100_000, ByteOrder::Big);
        assert_eq!(codec.max_msg_len(), u16::MAX as u32);
    }

    #[test]
    fn test_zero_bounds_keep_defaults() {
        let codec = FrameCodec::new(LenWidth::U16, 0, 0, ByteOrder::Big);
        assert_eq!(codec.min_msg_len(), 1);
        assert_eq!(codec.max_msg_len(), 4096);
    }

    #[tokio::test]
    async fn test_two_messages_back_to_back() {
        let codec = FrameCodec::default();
        let mut wire = codec.encode(&[b"first"]).unwrap().to_vec();
        wire.extend_from_slice(&codec.encode(&[b"second"]).unwrap());

        let mut cursor = std::io::Cursor::new(wire);
        assert_eq!(&codec.read(&mut cursor).await.unwrap()[..], b"first");
        assert_eq!(&codec.read(&mut cursor).await.unwrap()[..], b"second");
    }

    #[tokio::test]
    async fn test_max_len_payload_roundtrips() {
        let codec = FrameCodec::new(LenWidth::U8, 1, 255, ByteOrder::Big);
        let payload = vec![0xAB; 255];
        let back = roundtrip(codec, &payload).await;
        assert_eq!(back.len(), 255);
    }
}
