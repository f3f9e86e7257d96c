use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{schema::ObjectSpec, value::Value};

/// Capabilities a plugin process can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Builder,
    Datasource,
}

impl CapabilityKind {
    /// Endpoint name used when a plugin exposes a single instance.
    pub const fn default_endpoint(self) -> &'static str {
        match self {
            CapabilityKind::Builder => "Builder",
            CapabilityKind::Datasource => "Datasource",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityKind::Builder => f.write_str("builder"),
            CapabilityKind::Datasource => f.write_str("datasource"),
        }
    }
}

/// Serialization generation spoken on one connection. Fixed for the lifetime
/// of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Registration-based binary encoding kept for older plugins.
    Legacy,
    /// Self-describing encoding.
    #[default]
    Current,
}

impl Mode {
    pub const fn from_flag(use_current: bool) -> Self {
        if use_current {
            Mode::Current
        } else {
            Mode::Legacy
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Legacy => f.write_str("legacy"),
            Mode::Current => f.write_str("current"),
        }
    }
}

/// Produces artifacts. `run` may call back into `build` and `ui` any number
/// of times before it returns.
#[async_trait]
pub trait Builder: Send + Sync + 'static {
    async fn prepare(&self, config: Value) -> anyhow::Result<()>;
    async fn run(&self, build: Arc<dyn Build>, ui: Arc<dyn Ui>) -> anyhow::Result<()>;
}

/// Progress sink owned by whoever drives a [`Builder`].
#[async_trait]
pub trait Build: Send + Sync + 'static {
    async fn name(&self) -> anyhow::Result<String>;
    async fn progress(&self, step: &str) -> anyhow::Result<()>;
}

/// Line-oriented output owned by whoever drives a [`Builder`].
#[async_trait]
pub trait Ui: Send + Sync + 'static {
    async fn say(&self, message: &str) -> anyhow::Result<()>;
    async fn message(&self, message: &str) -> anyhow::Result<()>;
    async fn error(&self, message: &str) -> anyhow::Result<()>;
}

/// Resolves external data.
#[async_trait]
pub trait Datasource: Send + Sync + 'static {
    async fn configure(&self, configs: Vec<Value>) -> anyhow::Result<()>;

    /// Schema of the value `execute` produces. Infallible by contract.
    async fn output_spec(&self) -> ObjectSpec;

    async fn execute(&self) -> anyhow::Result<Value>;

    /// Best-effort request to abandon an in-flight `execute`.
    async fn cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_flag_selects_generation() {
        assert_eq!(Mode::from_flag(true), Mode::Current);
        assert_eq!(Mode::from_flag(false), Mode::Legacy);
        assert_eq!(serde_json::to_string(&Mode::Legacy).unwrap(), "\"legacy\"");
    }

    #[test]
    fn capability_kinds_have_stable_endpoints() {
        assert_eq!(CapabilityKind::Builder.default_endpoint(), "Builder");
        let kind: CapabilityKind = serde_json::from_str("\"datasource\"").unwrap();
        assert_eq!(kind, CapabilityKind::Datasource);
    }
}
