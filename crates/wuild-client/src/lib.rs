//! # Wuild Client
//!
//! The build-driver side of the distributed pipeline: a load balancer
//! over the fleet of tool servers and the remote tool client that ships
//! compile stages to them. Fleet discovery comes from
//! `wuild-coordinator`; the compile itself from `wuild-invocation` and
//! the transport from `wuild-transport`.

mod balancer;
mod client;
mod driver;

pub use balancer::{BalancerEntry, ClientStatus, ToolBalancer};
pub use client::{InvokeCallback, RemoteToolClient, RemoteToolClientConfig, TaskExecutionInfo};
pub use driver::{BuildExecutor, CommandOutcome, SplitRules};
