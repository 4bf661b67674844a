//! Frames on the proxy client ↔ proxy daemon loopback connection.

use super::{FrameBody, MIN_USER_FRAME_ID};
use crate::types::invocation::{ToolCommandline, ToolId};
use crate::wire::{WireError, WireReader, WireWriter};

/// Version of this connection class; both ends must agree.
pub const CHANNEL_PROTOCOL_VERSION: u32 = 3;

/// One compiler invocation forwarded by the proxy client, verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyRequest {
    pub cwd: String,
    pub tool_id: String,
    pub executable: String,
    pub args: Vec<String>,
}

impl ProxyRequest {
    pub fn to_commandline(&self) -> ToolCommandline {
        ToolCommandline::new(
            ToolId {
                tool_id: self.tool_id.clone(),
                executable: self.executable.clone(),
            },
            self.args.clone(),
        )
    }
}

impl FrameBody for ProxyRequest {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 1; // 0x11

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_pstr(&self.cwd);
        writer.write_pstr(&self.tool_id);
        writer.write_pstr(&self.executable);
        writer.write_vec(&self.args);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            cwd: reader.read_pstr()?,
            tool_id: reader.read_pstr()?,
            executable: reader.read_pstr()?,
            args: reader.read_vec::<String>()?,
        })
    }
}

/// Outcome relayed back to the proxy client; `std_out` is printed
/// verbatim and `result` becomes the exit code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyResponse {
    pub result: bool,
    pub std_out: String,
}

impl ProxyResponse {
    pub fn new(result: bool, std_out: impl Into<String>) -> Self {
        Self {
            result,
            std_out: std_out.into(),
        }
    }
}

impl FrameBody for ProxyResponse {
    const TYPE_ID: u8 = MIN_USER_FRAME_ID + 2; // 0x12

    fn write_body(&self, writer: &mut WireWriter) {
        writer.write_u8(u8::from(self.result));
        writer.write_pstr(&self.std_out);
    }

    fn read_body(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            result: reader.read_u8()? != 0,
            std_out: reader.read_pstr()?,
        })
    }
}
