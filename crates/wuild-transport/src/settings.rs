//! Tunables of one frame handler. These shape the channel behavior, not
//! the protocol's identity: peers with different segment sizes or ack
//! thresholds still interoperate.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FrameHandlerSettings {
    /// Channel protocol version; client and server must agree or the
    /// connection is dropped during the handshake.
    pub protocol_version: u32,

    /// Maximal payload length of one channel segment.
    pub segment_size: usize,

    /// Minimal bytes read without sending an acknowledge. Must exceed the
    /// largest service segment (5 bytes).
    pub acknowledge_minimal_read_size: usize,

    /// Advertised in `ConnOptions`; the peer sizes its unacknowledged
    /// window from it.
    pub recommended_receive_buffer_size: usize,
    pub recommended_send_buffer_size: usize,

    /// A channel with no read event for this long is declared dead.
    /// Zero disables the check.
    pub channel_activity_timeout: Duration,

    /// Waiting for an acknowledge longer than this is fatal for the
    /// connection.
    pub acknowledge_timeout: Duration,

    /// When nothing moved for this long, a line test frame is sent.
    pub line_test_interval: Duration,

    /// Client handlers wait this long before a reconnect attempt.
    pub after_disconnect_wait: Duration,

    /// TCP connect timeout for client handlers.
    pub connect_timeout: Duration,

    /// Upper bound between two reply-deadline checks when no closer
    /// deadline is pending.
    pub reply_timeout_check_interval: Duration,

    // Channel features. All on in normal operation; tests switch
    // individual ones off to isolate behavior.
    pub has_acknowledges: bool,
    pub has_line_test: bool,
    pub has_conn_options: bool,
}

impl Default for FrameHandlerSettings {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            segment_size: 240,
            acknowledge_minimal_read_size: 100,
            recommended_receive_buffer_size: 4 * 1024,
            recommended_send_buffer_size: 4 * 1024,
            channel_activity_timeout: Duration::from_secs(10),
            acknowledge_timeout: Duration::from_secs(10),
            line_test_interval: Duration::from_secs(3),
            after_disconnect_wait: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(1),
            reply_timeout_check_interval: Duration::from_secs(1),
            has_acknowledges: true,
            has_line_test: true,
            has_conn_options: true,
        }
    }
}

impl FrameHandlerSettings {
    /// Settings used by the bulk-payload connections (client ↔ tool
    /// server): bigger segments and buffers than the chatty default.
    pub fn bulk(protocol_version: u32) -> Self {
        Self {
            protocol_version,
            segment_size: 8192,
            recommended_receive_buffer_size: 64 * 1024,
            recommended_send_buffer_size: 64 * 1024,
            ..Self::default()
        }
    }

    /// Initial unacknowledged-byte window, before the handshake reveals
    /// the peer's receive buffer. 4 KiB is the minimal socket buffer.
    pub fn initial_max_unacked(&self) -> usize {
        4 * 1024 * 8 / 10
    }

    /// Window once the peer's receive buffer is known.
    pub fn negotiated_max_unacked(&self, peer_receive_buffer: usize) -> usize {
        self.recommended_send_buffer_size.min(peer_receive_buffer) * 8 / 10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_eighty_percent_of_the_smaller_buffer() {
        let settings = FrameHandlerSettings::default();
        assert_eq!(settings.initial_max_unacked(), 3276);
        assert_eq!(settings.negotiated_max_unacked(2048), 1638);
        assert_eq!(settings.negotiated_max_unacked(1 << 20), 3276);
    }
}
