//! Frames on the client ↔ tool server connection.

use std::time::Duration;

use bytes::Bytes;

use super::{duration_from_micros, duration_to_micros, FrameBody, MIN_USER_FRAME_ID};
use crate::types::compression::CompressionInfo;
use crate::wire::{WireError, WireRead, WireReader, WireWrite, WireWriter};

/// Version of this connection class; both ends must agree.
pub const CHANNEL_PROTOCOL_VERSION: u32 = 2;

/// One compile task shipped to a tool server. `file_data` carries the
/// preprocessed source, compressed as described by `compression`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolRequest {
    pub client_id: String,
    pub session_id: i64,
    pub file_data: Bytes,
    pub args: Vec<String>,
    pub tool_id: String,
    pub compression: CompressionInfo,
}

impl FrameBody for ToolRequest {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 1; // 0x11

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_pstr(&self.client_id);
        writer.write_u64(self.session_id as u64);
        writer.write_blob(&self.file_data);
        writer.write_vec(&self.args);
        writer.write_pstr(&self.tool_id);
        self.compression.wire_write(writer);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            client_id: reader.read_pstr()?,
            session_id: reader.read_u64()? as i64,
            file_data: reader.read_blob()?,
            args: reader.read_vec::<String>()?,
            tool_id: reader.read_pstr()?,
            compression: CompressionInfo::wire_read(reader)?,
        })
    }
}

/// Result of a remote execution. `file_data` is the produced object file,
/// compressed as described by `compression`; `std_out` carries whatever
/// the compiler printed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolResponse {
    pub result: bool,
    pub file_data: Bytes,
    pub std_out: String,
    pub execution_time: Duration,
    pub compression: CompressionInfo,
}

impl FrameBody for ToolResponse {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 2; // 0x12

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_u8(u8::from(self.result));
        writer.write_blob(&self.file_data);
        writer.write_pstr(&self.std_out);
        writer.write_i64(duration_to_micros(self.execution_time));
        self.compression.wire_write(writer);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            result: reader.read_u8()? != 0,
            file_data: reader.read_blob()?,
            std_out: reader.read_pstr()?,
            execution_time: duration_from_micros(reader.read_i64()?),
            compression: CompressionInfo::wire_read(reader)?,
        })
    }
}

/// Probe asking a tool server for the versions of its configured tools.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolsVersionRequest;

impl FrameBody for ToolsVersionRequest {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 3; // 0x13

    fn write_body(&self, _writer: &mut WireWriter) {}

    fn read_body(_reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolVersionEntry {
    pub tool_id: String,
    pub version: String,
}

impl WireRead for ToolVersionEntry {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            tool_id: reader.read_pstr()?,
            version: reader.read_pstr()?,
        })
    }
}

impl WireWrite for ToolVersionEntry {
    fn wire_write(&self, writer: &mut WireWriter) {
        writer.write_pstr(&self.tool_id);
        writer.write_pstr(&self.version);
    }
}

/// Reply to [`ToolsVersionRequest`]: one entry per advertised tool.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ToolsVersionResponse {
    pub versions: Vec<ToolVersionEntry>,
}

impl FrameBody for ToolsVersionResponse {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 4; // 0x14

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_vec(&self.versions);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            versions: reader.read_vec::<ToolVersionEntry>()?,
        })
    }
}
