//! Protocol frames.
//!
//! A frame is an application-level message with a creation timestamp and a
//! transaction id, possibly correlated with a reply. On the wire a frame
//! is cut into transport segments; this module only defines the frame
//! header and the typed bodies, the segmentation lives in
//! `wuild-transport`.
//!
//! Frame body layout (after the segment type and segment length):
//! `u32 body_length, i64 created_us, u64 transaction_id,
//! u64 reply_to_transaction_id`, then the type-specific body.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::wire::{WireError, WireReader, WireWriter};

pub mod coordinator;
pub mod proxy;
pub mod tool;

/// First frame type id available to applications. Everything below is
/// reserved for transport service segments.
pub const MIN_USER_FRAME_ID: u8 = 0x10;

/// Service segment ids (fixed payloads, no frame header).
pub const SEG_ACK: u8 = 0x01;
pub const SEG_LINE_TEST: u8 = 0x02;
pub const SEG_CONN_OPTIONS: u8 = 0x03;

/// `reply_to_transaction_id` value meaning "not a reply".
pub const NO_REPLY: u64 = u64::MAX;

/// Size of the frame header preceding the type-specific body.
pub const FRAME_HEADER_LEN: usize = 4 + 8 + 8 + 8;

/// Microseconds since the unix epoch; the session-id and frame-timestamp
/// clock.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

pub(crate) fn duration_to_micros(d: Duration) -> i64 {
    d.as_micros() as i64
}

pub(crate) fn duration_from_micros(us: i64) -> Duration {
    Duration::from_micros(us.max(0) as u64)
}

/// A typed frame body. `TYPE_ID` must be in the user range (>= 0x10) and
/// unique per connection class.
pub trait FrameBody: fmt::Debug + Send + Sync + Sized + 'static {
    const TYPE_ID: u8;

    fn write_body(&self, writer: &mut WireWriter);
    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// A frame with its header decoded and its body still opaque. This is the
/// unit the transport moves; typed encode/decode happens at the edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub type_id: u8,
    pub created_us: i64,
    pub transaction_id: u64,
    pub reply_to: u64,
    pub body: Bytes,
}

impl RawFrame {
    /// Wrap a typed message. Transaction ids are assigned by the handler
    /// at queue time; 0 means "no correlation required".
    pub fn from_body<T: FrameBody>(message: &T) -> Self {
        let mut writer = WireWriter::new();
        message.write_body(&mut writer);
        Self {
            type_id: T::TYPE_ID,
            created_us: now_micros(),
            transaction_id: 0,
            reply_to: NO_REPLY,
            body: writer.into_bytes(),
        }
    }

    /// Decode the typed body, checking the frame type first.
    pub fn to_body<T: FrameBody>(&self) -> Result<T, WireError> {
        if self.type_id != T::TYPE_ID {
            return Err(WireError::InvalidValue {
                value: u64::from(self.type_id),
                field: "frame type id",
            });
        }
        let mut reader = WireReader::new(&self.body);
        T::read_body(&mut reader)
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to != NO_REPLY
    }

    /// Header + body, ready to be segmented.
    pub fn encode(&self) -> Bytes {
        let mut writer = WireWriter::new();
        writer.write_u32(self.body.len() as u32);
        writer.write_i64(self.created_us);
        writer.write_u64(self.transaction_id);
        writer.write_u64(self.reply_to);
        let mut buf = writer.into_bytes().to_vec();
        buf.extend_from_slice(&self.body);
        Bytes::from(buf)
    }

    /// Total encoded size once the first four length bytes are visible.
    /// `None` until enough bytes accumulated to read the length prefix.
    pub fn required_len(accumulated: &[u8]) -> Option<usize> {
        if accumulated.len() < 4 {
            return None;
        }
        let body_len =
            u32::from_be_bytes([accumulated[0], accumulated[1], accumulated[2], accumulated[3]])
                as usize;
        Some(FRAME_HEADER_LEN + body_len)
    }

    /// Decode one frame from a complete accumulation buffer.
    pub fn decode(type_id: u8, data: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(data);
        let body_len = reader.read_u32()? as usize;
        let created_us = reader.read_i64()?;
        let transaction_id = reader.read_u64()?;
        let reply_to = reader.read_u64()?;
        if reader.remaining() < body_len {
            return Err(WireError::Truncated {
                needed: body_len - reader.remaining(),
            });
        }
        let start = reader.position();
        Ok(Self {
            type_id,
            created_us,
            transaction_id,
            reply_to,
            body: Bytes::copy_from_slice(&data[start..start + body_len]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_frame_header_round_trips() {
        let frame = RawFrame {
            type_id: 0x11,
            created_us: now_micros(),
            transaction_id: 7,
            reply_to: NO_REPLY,
            body: Bytes::from_static(b"payload"),
        };
        let encoded = frame.encode();
        assert_eq!(
            RawFrame::required_len(&encoded),
            Some(FRAME_HEADER_LEN + 7)
        );
        let decoded = RawFrame::decode(0x11, &encoded).unwrap();
        assert_eq!(decoded.transaction_id, 7);
        assert_eq!(decoded.reply_to, NO_REPLY);
        assert_eq!(decoded.created_us, frame.created_us);
        assert_eq!(decoded.body, frame.body);
        assert!(!decoded.is_reply());
    }

    #[test]
    fn required_len_waits_for_the_prefix() {
        assert_eq!(RawFrame::required_len(&[0, 0, 1]), None);
        assert_eq!(
            RawFrame::required_len(&[0, 0, 0, 5]),
            Some(FRAME_HEADER_LEN + 5)
        );
    }

    #[test]
    fn decode_of_truncated_body_is_an_error() {
        let frame = RawFrame {
            type_id: 0x12,
            created_us: 0,
            transaction_id: 1,
            reply_to: 0,
            body: Bytes::from_static(&[0xAA; 16]),
        };
        let encoded = frame.encode();
        let cut = &encoded[..encoded.len() - 4];
        assert!(matches!(
            RawFrame::decode(0x12, cut),
            Err(WireError::Truncated { .. })
        ));
    }
}
