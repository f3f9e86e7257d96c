//! Capability implementations bundled with the binary so `ferry serve` has
//! something to expose.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use ferry_core::config::Endpoint;
use ferry_plugin_sdk::{Build, Builder, CapabilityKind, Datasource, ObjectSpec, Type, Ui, Value};
use parking_lot::Mutex;

pub const DATASOURCE_IMPLEMENTATIONS: &[&str] = &["static"];
pub const BUILDER_IMPLEMENTATIONS: &[&str] = &["echo"];

pub enum Sample {
    Datasource(Arc<dyn Datasource>),
    Builder(Arc<dyn Builder>),
}

/// Instantiates the implementation an endpoint names.
pub fn instantiate(endpoint: &Endpoint) -> Result<Sample> {
    match (endpoint.capability, endpoint.implementation.as_str()) {
        (CapabilityKind::Datasource, "static") => {
            Ok(Sample::Datasource(Arc::new(StaticDatasource::default())))
        }
        (CapabilityKind::Builder, "echo") => Ok(Sample::Builder(Arc::new(EchoBuilder::default()))),
        (kind, other) => bail!(
            "endpoint `{}`: no {kind} implementation named `{other}`",
            endpoint.name
        ),
    }
}

/// Merges object values left to right; later attributes win.
fn merge(configs: Vec<Value>) -> Result<BTreeMap<String, Value>> {
    let mut merged = BTreeMap::new();
    for (index, config) in configs.into_iter().enumerate() {
        match config {
            Value::Object(attrs) | Value::Map(attrs) => merged.extend(attrs),
            Value::Null => {}
            other => bail!("configuration {index} must be an object, got {}", other.ty()),
        }
    }
    Ok(merged)
}

/// Answers from its own configuration.
///
/// With `lookup` and `name` set it returns `lookup[name]`, with `value` set it
/// returns that, otherwise the merged configuration itself. `delay_ms` holds
/// the answer back, which leaves room for a cancel.
#[derive(Default)]
pub struct StaticDatasource {
    config: Mutex<BTreeMap<String, Value>>,
}

#[async_trait]
impl Datasource for StaticDatasource {
    async fn configure(&self, configs: Vec<Value>) -> Result<()> {
        let merged = merge(configs)?;
        let spec = self.output_spec().await;
        for (name, value) in &merged {
            if let Some(ferry_plugin_sdk::Spec::Attr { ty, .. }) = spec.get(name) {
                if !value.conforms_to(ty) {
                    bail!("attribute `{name}` must be {ty}, got {}", value.ty());
                }
            }
        }
        *self.config.lock() = merged;
        Ok(())
    }

    async fn output_spec(&self) -> ObjectSpec {
        ObjectSpec::new()
            .attr("name", Type::String, false)
            .attr("lookup", Type::Dynamic, false)
            .attr("value", Type::Dynamic, false)
            .attr("delay_ms", Type::Number, false)
    }

    async fn execute(&self) -> Result<Value> {
        let config = self.config.lock().clone();
        if let Some(delay) = config.get("delay_ms").and_then(|v| match v {
            Value::Number(ms) if *ms > 0.0 => Some(Duration::from_millis(*ms as u64)),
            _ => None,
        }) {
            tokio::time::sleep(delay).await;
        }

        if let (Some(lookup), Some(name)) = (config.get("lookup"), config.get("name")) {
            let Some(name) = name.as_str() else {
                bail!("attribute `name` must be a string");
            };
            return match lookup.get(name) {
                Some(value) => Ok(value.clone()),
                None => bail!("no record for `{name}`"),
            };
        }
        if let Some(value) = config.get("value") {
            return Ok(value.clone());
        }
        Ok(Value::Object(config))
    }

    async fn cancel(&self) {
        tracing::info!("static datasource cancelled");
    }
}

/// Walks the configured `steps`, narrating each through the host's sinks.
#[derive(Default)]
pub struct EchoBuilder {
    target: Mutex<String>,
    steps: Mutex<Vec<String>>,
}

#[async_trait]
impl Builder for EchoBuilder {
    async fn prepare(&self, config: Value) -> Result<()> {
        let Some(target) = config.get("target").and_then(Value::as_str) else {
            bail!("missing field: target");
        };
        let steps = match config.get("steps") {
            None => vec!["compile".to_string()],
            Some(Value::List(items) | Value::Tuple(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| anyhow::anyhow!("steps must be strings"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => bail!("steps must be a list, got {}", other.ty()),
        };
        *self.target.lock() = target.to_string();
        *self.steps.lock() = steps;
        Ok(())
    }

    async fn run(&self, build: Arc<dyn Build>, ui: Arc<dyn Ui>) -> Result<()> {
        let target = self.target.lock().clone();
        if target.is_empty() {
            ui.error("builder was not prepared").await?;
            bail!("run called before prepare");
        }
        let steps = self.steps.lock().clone();
        let name = build.name().await?;
        ui.say(&format!("building {name} for {target}")).await?;
        for step in &steps {
            build.progress(step).await?;
            ui.message(&format!("{step}: done")).await?;
        }
        ui.say(&format!("{name}: {} steps finished", steps.len())).await
    }
}
