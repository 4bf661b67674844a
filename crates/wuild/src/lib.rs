//! # Wuild
//!
//! Distributed C/C++ compilation: a local client preprocesses source
//! files and farms the compile step out to a pool of tool servers, with
//! a coordinator publishing the live fleet view. This facade crate
//! re-exports the public API of the layer crates.
//!
//! ## Crates
//!
//! - [`core`](wuild_core) — data model, wire codec, frames, config
//! - [`transport`](wuild_transport) — framed, acknowledged RPC channel
//! - [`invocation`](wuild_invocation) — compiler command-line rewriting
//! - [`executor`](wuild_executor) — bounded local process pool
//! - [`coordinator`](wuild_coordinator) — fleet registry and client
//! - [`client`](wuild_client) — balancer and remote tool client
//! - [`server`](wuild_server) — the worker service
//! - [`proxy`](wuild_proxy) — synchronous-compiler façade

pub use wuild_client::{
    BalancerEntry, BuildExecutor, ClientStatus, CommandOutcome, InvokeCallback, RemoteToolClient,
    RemoteToolClientConfig, SplitRules, TaskExecutionInfo, ToolBalancer,
};
pub use wuild_coordinator::{CoordinatorClient, CoordinatorServer, Redundancy};
pub use wuild_core::{
    CompressionInfo, CompressionType, ConnectedClientInfo, CoordinatorInfo, InvokeType,
    ToolCommandline, ToolId, ToolServerInfo, ToolServerSessionInfo, ToolVersion, ToolchainKind,
    VersionMap, WuildConfig, WuildError, WuildResult,
};
pub use wuild_executor::{
    LocalExecutor, LocalExecutorResult, LocalExecutorTask, ProcessExecutor, VersionChecker,
};
pub use wuild_invocation::{InvocationToolProvider, SplitInvocation};
pub use wuild_proxy::{proxy_client_run, ProxyServer, ProxyServerConfig};
pub use wuild_server::{RemoteToolServer, RemoteToolServerConfig};
pub use wuild_transport::{FrameHandler, FrameHandlerSettings, FrameService};
