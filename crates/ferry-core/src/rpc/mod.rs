//! Minimal call/reply transport over TCP with `<endpoint>.<method>` routing.

pub mod client;
pub mod frame;
pub mod server;

pub use client::RpcClient;
pub use frame::Empty;
pub use server::{Registry, ServerHandle, Service};
