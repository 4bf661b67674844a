//! # Wuild Coordinator
//!
//! The coordinator keeps the live census of tool servers and relays it to
//! everyone connected. Tool servers push `ToolServerStatus`, build
//! clients receive `ListResponse` snapshots whenever the fleet view
//! changes.
//!
//! [`CoordinatorServer`] is the registry service; [`CoordinatorClient`]
//! is the subscription/publication side embedded in tool servers and
//! build clients, able to talk to several coordinators at once.

mod client;
mod server;

pub use client::{CoordinatorClient, InfoArrivedCallback, Redundancy};
pub use server::CoordinatorServer;
