//! # Wuild Core
//!
//! Core building blocks shared by every Wuild crate: the data model
//! (tool ids, command lines, tool server state, coordinator state), the
//! big-endian wire codec, the protocol frame definitions for the three
//! connection classes (tool, coordinator, proxy), payload compression,
//! configuration loading and the common error type.
//!
//! The crate is transport-agnostic: it defines *what* travels on the wire
//! and how it is encoded, while `wuild-transport` defines how the bytes
//! move.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
pub mod wire;

pub use config::WuildConfig;
pub use error::{WuildError, WuildResult};
pub use types::compression::{CompressionInfo, CompressionType};
pub use types::invocation::{InvokeType, ToolCommandline, ToolId};
pub use types::server::{
    ConnectedClientInfo, CoordinatorInfo, ToolServerInfo, ToolServerSessionInfo,
};
pub use types::tool::{ToolVersion, ToolchainKind, VersionMap, VERSION_NO_CHECK};
