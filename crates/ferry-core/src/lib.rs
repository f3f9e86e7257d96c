//! Host/plugin RPC bridge.
//!
//! Capabilities defined in `ferry-plugin-sdk` are exposed by a plugin through
//! skeletons served by [`plugin::PluginServer`] and reached from the host
//! through stubs handed out by [`plugin::PluginClient`]. Values cross the
//! boundary through the per-connection [`codec`]; errors cross it as
//! [`envelope::ErrorEnvelope`]s.

pub mod builder;
pub mod callback;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod datasource;
pub mod envelope;
pub mod error;
pub mod plugin;
pub mod rpc;
pub mod sink;
mod stub;

pub use builder::{BuilderSkeleton, BuilderStub};
pub use callback::CallbackServer;
pub use datasource::{DatasourceSkeleton, DatasourceStub};
pub use envelope::{ErrorEnvelope, ErrorKind, RemoteError};
pub use error::{BridgeError, CodecError, TransportError};
pub use plugin::{PluginClient, PluginServer};

/// Returns the crate version baked in at compile time.
pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
