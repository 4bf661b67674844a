//! Payload compression as a negotiable capability.
//!
//! The descriptor travels inside every payload frame, so the receiver
//! decodes whatever the sender wrote regardless of its own configuration.
//! `None` is always supported.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{WuildError, WuildResult};
use crate::wire::{WireError, WireRead, WireReader, WireWrite, WireWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
}

impl CompressionType {
    fn to_wire(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }

    fn from_wire(value: u32) -> Result<Self, WireError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(WireError::InvalidValue {
                value: u64::from(other),
                field: "compression type",
            }),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "None" | "none" => Some(Self::None),
            "Gzip" | "gzip" => Some(Self::Gzip),
            _ => None,
        }
    }
}

/// On-wire compression descriptor: `u32 type, u32 level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub compression_type: CompressionType,
    pub level: u32,
}

impl Default for CompressionInfo {
    fn default() -> Self {
        Self {
            compression_type: CompressionType::None,
            level: 3,
        }
    }
}

impl CompressionInfo {
    pub fn gzip(level: u32) -> Self {
        Self {
            compression_type: CompressionType::Gzip,
            level,
        }
    }

    /// Compress `data` according to this descriptor.
    pub fn compress(&self, data: &[u8]) -> WuildResult<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Gzip => {
                let mut encoder =
                    GzEncoder::new(Vec::new(), Compression::new(self.level.min(9)));
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| WuildError::compression(format!("gzip encode: {e}")))
            }
        }
    }

    /// Decompress `data` that was produced with this descriptor.
    pub fn decompress(&self, data: &[u8]) -> WuildResult<Vec<u8>> {
        match self.compression_type {
            CompressionType::None => Ok(data.to_vec()),
            CompressionType::Gzip => {
                let mut out = Vec::new();
                GzDecoder::new(data)
                    .read_to_end(&mut out)
                    .map_err(|e| WuildError::compression(format!("gzip decode: {e}")))?;
                Ok(out)
            }
        }
    }
}

impl WireRead for CompressionInfo {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let compression_type = CompressionType::from_wire(reader.read_u32()?)?;
        let level = reader.read_u32()?;
        Ok(Self {
            compression_type,
            level,
        })
    }
}

impl WireWrite for CompressionInfo {
    fn wire_write(&self, writer: &mut WireWriter) {
        writer.write_u32(self.compression_type.to_wire());
        writer.write_u32(self.level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let info = CompressionInfo::default();
        let data = b"int main() { return 0; }".to_vec();
        assert_eq!(info.compress(&data).unwrap(), data);
        assert_eq!(info.decompress(&data).unwrap(), data);
    }

    #[test]
    fn gzip_round_trips_and_shrinks_repetitive_input() {
        let info = CompressionInfo::gzip(6);
        let data = vec![b'x'; 64 * 1024];
        let packed = info.compress(&data).unwrap();
        assert!(packed.len() < data.len() / 10);
        assert_eq!(info.decompress(&packed).unwrap(), data);
    }

    #[test]
    fn descriptor_round_trips_on_wire() {
        let info = CompressionInfo::gzip(9);
        let mut w = WireWriter::new();
        info.wire_write(&mut w);
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert_eq!(CompressionInfo::wire_read(&mut r).unwrap(), info);
    }

    #[test]
    fn unknown_descriptor_is_rejected() {
        let mut w = WireWriter::new();
        w.write_u32(7);
        w.write_u32(1);
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert!(CompressionInfo::wire_read(&mut r).is_err());
    }
}
