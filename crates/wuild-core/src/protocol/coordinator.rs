//! Frames on the peer ↔ coordinator connection, and the wire codecs for
//! the fleet-state types they carry.

use super::{duration_from_micros, duration_to_micros, FrameBody, MIN_USER_FRAME_ID};
use crate::types::server::{ConnectedClientInfo, ToolServerInfo, ToolServerSessionInfo};
use crate::wire::{WireError, WireRead, WireReader, WireWrite, WireWriter};

/// Version of this connection class; both ends must agree.
pub const CHANNEL_PROTOCOL_VERSION: u32 = 4;

impl WireRead for ConnectedClientInfo {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            used_threads: reader.read_u16()?,
            client_id: reader.read_pstr()?,
            session_id: reader.read_u64()? as i64,
        })
    }
}

impl WireWrite for ConnectedClientInfo {
    fn wire_write(&self, writer: &mut WireWriter) {
        writer.write_u16(self.used_threads);
        writer.write_pstr(&self.client_id);
        writer.write_u64(self.session_id as u64);
    }
}

impl WireRead for ToolServerInfo {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            server_id: reader.read_pstr()?,
            host: reader.read_pstr()?,
            port: reader.read_u16()?,
            tool_ids: reader.read_vec::<String>()?,
            total_threads: reader.read_u16()?,
            running_tasks: reader.read_u16()?,
            queued_tasks: reader.read_u16()?,
            connected_clients: reader.read_vec::<ConnectedClientInfo>()?,
        })
    }
}

impl WireWrite for ToolServerInfo {
    fn wire_write(&self, writer: &mut WireWriter) {
        writer.write_pstr(&self.server_id);
        writer.write_pstr(&self.host);
        writer.write_u16(self.port);
        writer.write_vec(&self.tool_ids);
        writer.write_u16(self.total_threads);
        writer.write_u16(self.running_tasks);
        writer.write_u16(self.queued_tasks);
        writer.write_vec(&self.connected_clients);
    }
}

impl WireRead for ToolServerSessionInfo {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            client_id: reader.read_pstr()?,
            session_id: reader.read_u64()? as i64,
            tasks_count: reader.read_u32()?,
            failures_count: reader.read_u32()?,
            total_network_time: duration_from_micros(reader.read_i64()?),
            total_execution_time: duration_from_micros(reader.read_i64()?),
            elapsed_time: duration_from_micros(reader.read_i64()?),
            current_used_threads: reader.read_u32()?,
            max_used_threads: reader.read_u32()?,
        })
    }
}

impl WireWrite for ToolServerSessionInfo {
    fn wire_write(&self, writer: &mut WireWriter) {
        writer.write_pstr(&self.client_id);
        writer.write_u64(self.session_id as u64);
        writer.write_u32(self.tasks_count);
        writer.write_u32(self.failures_count);
        writer.write_i64(duration_to_micros(self.total_network_time));
        writer.write_i64(duration_to_micros(self.total_execution_time));
        writer.write_i64(duration_to_micros(self.elapsed_time));
        writer.write_u32(self.current_used_threads);
        writer.write_u32(self.max_used_threads);
    }
}

/// Explicit request for the current fleet snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListRequest;

impl FrameBody for ListRequest {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 1; // 0x11

    fn write_body(&self, _writer: &mut WireWriter) {}

    fn read_body(_reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

/// Fleet snapshot broadcast by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListResponse {
    pub tool_servers: Vec<ToolServerInfo>,
}

impl FrameBody for ListResponse {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 2; // 0x12

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_vec(&self.tool_servers);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            tool_servers: reader.read_vec::<ToolServerInfo>()?,
        })
    }
}

/// Periodic self-description published by a tool server.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolServerStatus {
    pub info: ToolServerInfo,
}

impl FrameBody for ToolServerStatus {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 3; // 0x13

    fn write_body(&self, writer: &mut WireWriter) {
        self.info.wire_write(writer);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            info: ToolServerInfo::wire_read(reader)?,
        })
    }
}

/// Session usage counters reported by a build client; `is_finished` marks
/// the final report of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolServerSession {
    pub is_finished: bool,
    pub session: ToolServerSessionInfo,
}

impl FrameBody for ToolServerSession {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 4; // 0x14

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_u8(u8::from(self.is_finished));
        self.session.wire_write(writer);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            is_finished: reader.read_u8()? != 0,
            session: ToolServerSessionInfo::wire_read(reader)?,
        })
    }
}
