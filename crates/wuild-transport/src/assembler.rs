//! Pure read-path state machine: raw bytes in, protocol events out.
//!
//! Keeping this free of sockets makes the tricky part of the transport —
//! reassembly of frames from arbitrarily split segments with service
//! messages interleaved — testable byte by byte.

use bytes::{Buf, BytesMut};
use tracing::error;

use wuild_core::protocol::{RawFrame, MIN_USER_FRAME_ID, SEG_ACK, SEG_CONN_OPTIONS, SEG_LINE_TEST};

/// Something the peer said.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    Ack(u32),
    LineTest,
    ConnOptions {
        receive_buffer: u32,
        protocol_version: u32,
        timestamp_us: i64,
    },
    Frame(RawFrame),
}

/// Reassembles segments into events. Incomplete input is simply retained
/// until more bytes arrive; malformed input drains all buffered state and
/// reports an error string (the connection itself survives).
#[derive(Default)]
pub struct SegmentAssembler {
    read_buf: BytesMut,
    frame_buf: BytesMut,
    pending_user_type: Option<u8>,
    max_segment_size: usize,
}

impl SegmentAssembler {
    pub fn new(max_segment_size: usize) -> Self {
        Self {
            max_segment_size,
            ..Self::default()
        }
    }

    /// Buffer handed to the socket reader.
    pub fn read_buffer(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Parse whatever is currently buffered. On malformed input every
    /// buffer is drained and `Err` carries the description.
    pub fn drain_events(&mut self) -> Result<Vec<SegmentEvent>, String> {
        let mut events = Vec::new();
        loop {
            let progress_marker = (self.read_buf.len(), self.frame_buf.len());
            match self.next_event() {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {
                    // A user segment may have been folded into the frame
                    // buffer without completing a frame; keep going until
                    // nothing was consumed at all.
                    if (self.read_buf.len(), self.frame_buf.len()) == progress_marker {
                        return Ok(events);
                    }
                }
                Err(message) => {
                    error!("malformed channel input: {message}");
                    self.read_buf.clear();
                    self.frame_buf.clear();
                    self.pending_user_type = None;
                    return Err(message);
                }
            }
        }
    }

    fn next_event(&mut self) -> Result<Option<SegmentEvent>, String> {
        // A frame may already be complete from previously buffered
        // segments.
        if let Some(frame) = self.try_take_frame()? {
            return Ok(Some(SegmentEvent::Frame(frame)));
        }

        if self.read_buf.is_empty() {
            return Ok(None);
        }
        let seg_type = self.read_buf[0];
        match seg_type {
            SEG_ACK => {
                if self.read_buf.len() < 5 {
                    return Ok(None);
                }
                self.read_buf.advance(1);
                Ok(Some(SegmentEvent::Ack(self.read_buf.get_u32())))
            }
            SEG_LINE_TEST => {
                self.read_buf.advance(1);
                Ok(Some(SegmentEvent::LineTest))
            }
            SEG_CONN_OPTIONS => {
                if self.read_buf.len() < 1 + 4 + 4 + 8 {
                    return Ok(None);
                }
                self.read_buf.advance(1);
                Ok(Some(SegmentEvent::ConnOptions {
                    receive_buffer: self.read_buf.get_u32(),
                    protocol_version: self.read_buf.get_u32(),
                    timestamp_us: self.read_buf.get_i64(),
                }))
            }
            t if t >= MIN_USER_FRAME_ID => {
                if self.read_buf.len() < 5 {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([
                    self.read_buf[1],
                    self.read_buf[2],
                    self.read_buf[3],
                    self.read_buf[4],
                ]) as usize;
                if self.max_segment_size != 0 && len > self.max_segment_size {
                    return Err(format!("segment length {len} exceeds the configured maximum"));
                }
                if self.read_buf.len() < 5 + len {
                    return Ok(None); // incomplete segment
                }
                match self.pending_user_type {
                    Some(pending) if pending != t => {
                        return Err(format!(
                            "segment type 0x{t:02x} interleaved into a frame of type 0x{pending:02x}"
                        ));
                    }
                    _ => self.pending_user_type = Some(t),
                }
                self.read_buf.advance(5);
                self.frame_buf.extend_from_slice(&self.read_buf[..len]);
                self.read_buf.advance(len);
                Ok(self.try_take_frame()?.map(SegmentEvent::Frame))
            }
            t => Err(format!("unknown segment type 0x{t:02x}")),
        }
    }

    fn try_take_frame(&mut self) -> Result<Option<RawFrame>, String> {
        let Some(type_id) = self.pending_user_type else {
            return Ok(None);
        };
        let Some(required) = RawFrame::required_len(&self.frame_buf) else {
            return Ok(None);
        };
        if self.frame_buf.len() < required {
            return Ok(None);
        }
        let frame = RawFrame::decode(type_id, &self.frame_buf[..required])
            .map_err(|e| format!("broken frame of type 0x{type_id:02x}: {e}"))?;
        self.frame_buf.advance(required);
        if self.frame_buf.is_empty() {
            self.pending_user_type = None;
        }
        Ok(Some(frame))
    }
}

/// Write-path counterpart: cut one encoded frame into wire segments.
pub fn segmentize(type_id: u8, encoded_frame: &[u8], segment_size: usize) -> Vec<Vec<u8>> {
    let segment_size = segment_size.max(1);
    let mut segments = Vec::with_capacity(encoded_frame.len() / segment_size + 1);
    for chunk in encoded_frame.chunks(segment_size) {
        let mut segment = Vec::with_capacity(5 + chunk.len());
        segment.push(type_id);
        segment.extend_from_slice(&(chunk.len() as u32).to_be_bytes());
        segment.extend_from_slice(chunk);
        segments.push(segment);
    }
    segments
}

/// Encode an `Ack` service segment.
pub fn ack_segment(bytes_received: u32) -> Vec<u8> {
    let mut segment = Vec::with_capacity(5);
    segment.push(SEG_ACK);
    segment.extend_from_slice(&bytes_received.to_be_bytes());
    segment
}

/// Encode a `LineTest` service segment.
pub fn line_test_segment() -> Vec<u8> {
    vec![SEG_LINE_TEST]
}

/// Encode a `ConnOptions` service segment.
pub fn conn_options_segment(receive_buffer: u32, protocol_version: u32, timestamp_us: i64) -> Vec<u8> {
    let mut segment = Vec::with_capacity(1 + 4 + 4 + 8);
    segment.push(SEG_CONN_OPTIONS);
    segment.extend_from_slice(&receive_buffer.to_be_bytes());
    segment.extend_from_slice(&protocol_version.to_be_bytes());
    segment.extend_from_slice(&timestamp_us.to_be_bytes());
    segment
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use wuild_core::protocol::NO_REPLY;

    fn sample_frame(payload: &[u8]) -> RawFrame {
        RawFrame {
            type_id: 0x11,
            created_us: 123_456,
            transaction_id: 42,
            reply_to: NO_REPLY,
            body: Bytes::copy_from_slice(payload),
        }
    }

    fn feed(assembler: &mut SegmentAssembler, bytes: &[u8]) -> Vec<SegmentEvent> {
        assembler.read_buffer().extend_from_slice(bytes);
        assembler.drain_events().unwrap()
    }

    #[test]
    fn frame_round_trips_for_every_segment_size() {
        let frame = sample_frame(b"a reasonably sized frame body for splitting");
        let encoded = frame.encode();

        for segment_size in 1..=encoded.len() + 3 {
            let mut assembler = SegmentAssembler::new(segment_size);
            let mut events = Vec::new();
            for segment in segmentize(frame.type_id, &encoded, segment_size) {
                events.extend(feed(&mut assembler, &segment));
            }
            assert_eq!(events.len(), 1, "segment_size={segment_size}");
            match &events[0] {
                SegmentEvent::Frame(decoded) => {
                    assert_eq!(decoded.transaction_id, frame.transaction_id);
                    assert_eq!(decoded.body, frame.body);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn byte_at_a_time_delivery_works() {
        let frame = sample_frame(b"dribble");
        let encoded = frame.encode();
        let wire: Vec<u8> = segmentize(frame.type_id, &encoded, 16)
            .into_iter()
            .flatten()
            .collect();

        let mut assembler = SegmentAssembler::new(16);
        let mut events = Vec::new();
        for byte in wire {
            events.extend(feed(&mut assembler, &[byte]));
        }
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn acks_interleave_between_segments_of_one_frame() {
        let frame = sample_frame(&[0xAB; 100]);
        let encoded = frame.encode();
        let segments = segmentize(frame.type_id, &encoded, 32);
        assert!(segments.len() > 2);

        let mut assembler = SegmentAssembler::new(32);
        let mut events = Vec::new();
        for (i, segment) in segments.iter().enumerate() {
            if i == 1 {
                events.extend(feed(&mut assembler, &ack_segment(64)));
            }
            events.extend(feed(&mut assembler, segment));
        }
        assert!(matches!(events[0], SegmentEvent::Ack(64)));
        assert!(matches!(events.last(), Some(SegmentEvent::Frame(_))));
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn service_segments_parse() {
        let mut assembler = SegmentAssembler::new(240);
        let events = feed(&mut assembler, &line_test_segment());
        assert_eq!(events, vec![SegmentEvent::LineTest]);

        let events = feed(&mut assembler, &conn_options_segment(4096, 3, 777));
        assert_eq!(
            events,
            vec![SegmentEvent::ConnOptions {
                receive_buffer: 4096,
                protocol_version: 3,
                timestamp_us: 777,
            }]
        );
    }

    #[test]
    fn two_frames_back_to_back_yield_two_events() {
        let first = sample_frame(b"first");
        let second = sample_frame(b"second frame");
        let mut wire = Vec::new();
        for frame in [&first, &second] {
            for segment in segmentize(frame.type_id, &frame.encode(), 240) {
                wire.extend_from_slice(&segment);
            }
        }
        let mut assembler = SegmentAssembler::new(240);
        let events = feed(&mut assembler, &wire);
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn oversize_segment_drains_everything() {
        let mut assembler = SegmentAssembler::new(16);
        let frame = sample_frame(b"x");
        // Legitimate leading segment, then a lying length prefix.
        let mut wire: Vec<u8> = segmentize(frame.type_id, &frame.encode(), 16)
            .into_iter()
            .flatten()
            .collect();
        wire.extend_from_slice(&[0x11, 0xFF, 0xFF, 0xFF, 0xFF]);

        assembler.read_buffer().extend_from_slice(&wire);
        assert!(assembler.drain_events().is_err());
        // State was drained; fresh input parses again.
        let events = feed(&mut assembler, &line_test_segment());
        assert_eq!(events, vec![SegmentEvent::LineTest]);
    }

    #[test]
    fn unknown_segment_type_is_malformed() {
        let mut assembler = SegmentAssembler::new(240);
        assembler.read_buffer().extend_from_slice(&[0x0E, 0, 0]);
        assert!(assembler.drain_events().is_err());
    }

    #[test]
    fn interleaved_foreign_user_type_is_malformed() {
        let frame = sample_frame(&[1; 64]);
        let segments = segmentize(frame.type_id, &frame.encode(), 32);
        let mut assembler = SegmentAssembler::new(32);
        assert!(feed(&mut assembler, &segments[0]).is_empty());

        // A different user frame type may not appear mid-frame.
        let mut foreign = segments[1].clone();
        foreign[0] = 0x12;
        assembler.read_buffer().extend_from_slice(&foreign);
        assert!(assembler.drain_events().is_err());
    }
}
