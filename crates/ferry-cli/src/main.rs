mod console;
mod samples;

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ferry_core::{
    codec,
    config::{Config, Endpoint},
    PluginClient, PluginServer,
};
use ferry_plugin_sdk::{Builder, CapabilityKind, Datasource, PluginManifest, Value};
use regex::Regex;
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    console::{ConsoleBuild, ConsoleUi},
    samples::Sample,
};

const DEFAULT_CONFIG: &str = "demos/config/minimal.ferry.toml";

#[derive(Parser, Debug)]
#[command(name = "ferry", author, version, about = "Host/plugin RPC bridge")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the configured endpoints as a plugin process.
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Configure and execute a datasource, printing its schema and result.
    Query {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Endpoint to call; defaults to the first datasource.
        #[arg(long)]
        endpoint: Option<String>,
        /// Extra configuration attribute, `key=value`. Values parse as JSON
        /// when they can.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Sends Cancel when execution takes longer than this.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },
    /// Prepare and run a builder, serving build/ui callbacks to the console.
    Build {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Endpoint to call; defaults to the first builder.
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Build name reported to the plugin.
        #[arg(long, default_value = "ferry")]
        name: String,
    },
    /// Interact with configuration files (validate, sample output, etc.)
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect plugin manifests.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Dump the resolved configuration and bridge capabilities as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled minimal example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists manifests found in a directory.
    List {
        #[arg(long, value_name = "DIR", default_value = "demos/plugins")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    codec::register_builtin_types();
    match cli.command {
        Commands::Serve { config } => handle_serve(config).await,
        Commands::Query {
            config,
            endpoint,
            set,
            timeout_ms,
        } => handle_query(config, endpoint, set, timeout_ms).await,
        Commands::Build {
            config,
            endpoint,
            set,
            name,
        } => handle_build(config, endpoint, set, name).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Diag { config } => handle_diag(config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

async fn handle_serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    let resolved = config.resolved_server()?;
    let server = plugin_server(&config, resolved.mode)?;
    server
        .run_until(resolved.addr, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}

/// Instantiates every configured endpoint's sample implementation.
fn plugin_server(config: &Config, mode: ferry_plugin_sdk::Mode) -> Result<PluginServer> {
    let mut server = PluginServer::new(mode);
    for endpoint in &config.endpoints {
        match samples::instantiate(endpoint)? {
            Sample::Datasource(datasource) => {
                server.serve_datasource(endpoint.name.as_str(), datasource)?;
            }
            Sample::Builder(builder) => {
                server.serve_builder(endpoint.name.as_str(), builder)?;
            }
        }
    }
    Ok(server)
}

fn pick_endpoint<'a>(
    config: &'a Config,
    name: Option<&str>,
    kind: CapabilityKind,
) -> Result<&'a Endpoint> {
    let endpoint = match name {
        Some(name) => config
            .endpoint(name)
            .with_context(|| format!("no endpoint named `{name}`"))?,
        None => config
            .first_endpoint(kind)
            .with_context(|| format!("configuration declares no {kind} endpoint"))?,
    };
    if endpoint.capability != kind {
        bail!("endpoint `{}` is a {}, not a {kind}", endpoint.name, endpoint.capability);
    }
    Ok(endpoint)
}

async fn connect(config: &Config) -> Result<PluginClient> {
    let host = config.resolved_host()?;
    let client = PluginClient::connect(host.connect, host.mode)
        .await
        .with_context(|| format!("failed to reach plugin at {}", host.connect))?;
    Ok(client.with_callback_bind(host.callback_bind))
}

async fn handle_query(
    config_path: PathBuf,
    endpoint: Option<String>,
    set: Vec<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    let endpoint = pick_endpoint(&config, endpoint.as_deref(), CapabilityKind::Datasource)?;
    let overrides = parse_overrides(&set)?;

    let client = connect(&config).await?;
    let datasource = client.datasource(endpoint.name.as_str());
    let output = query(&datasource, endpoint, overrides, timeout_ms.map(Duration::from_millis)).await;
    client.close().await;
    println!("{}", serde_json::to_string_pretty(&output?)?);
    Ok(())
}

/// Configure, OutputSpec, Execute. Endpoint configuration and overrides are
/// sent as two separate configuration values.
async fn query(
    datasource: &ferry_core::DatasourceStub,
    endpoint: &Endpoint,
    overrides: Value,
    timeout: Option<Duration>,
) -> Result<serde_json::Value> {
    datasource
        .configure(vec![endpoint.config_value(), overrides])
        .await
        .with_context(|| format!("configuring `{}`", endpoint.name))?;
    let spec = datasource.try_output_spec().await?;
    tracing::debug!(endpoint = %endpoint.name, attributes = spec.len(), "fetched output spec");

    let execute = datasource.execute();
    tokio::pin!(execute);
    let value = match timeout {
        None => execute.await?,
        Some(timeout) => tokio::select! {
            result = &mut execute => result?,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(endpoint = %endpoint.name, ?timeout, "execute timed out, cancelling");
                datasource.cancel().await;
                execute.await?
            }
        },
    };
    Ok(serde_json::json!({
        "endpoint": endpoint.name,
        "output_spec": spec,
        "value": value.to_json(),
    }))
}

async fn handle_build(
    config_path: PathBuf,
    endpoint: Option<String>,
    set: Vec<String>,
    name: String,
) -> Result<()> {
    let config = load_config(&config_path)?;
    config.validate()?;
    let endpoint = pick_endpoint(&config, endpoint.as_deref(), CapabilityKind::Builder)?;
    let prepared = merge_values(endpoint.config_value(), parse_overrides(&set)?);

    let client = connect(&config).await?;
    let builder = client.builder(endpoint.name.as_str());
    let result = async {
        builder
            .prepare(prepared)
            .await
            .with_context(|| format!("preparing `{}`", endpoint.name))?;
        builder
            .run(Arc::new(ConsoleBuild::new(name)), Arc::new(ConsoleUi))
            .await
            .with_context(|| format!("running `{}`", endpoint.name))
    }
    .await;
    client.close().await;
    result
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            for endpoint in &cfg.endpoints {
                samples::instantiate(endpoint)?;
            }
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../demos/config/minimal.ferry.toml"));
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { dir } => {
            let manifests = discover_plugins(&dir)?;
            if manifests.is_empty() {
                println!("no plugin manifests found under {}", dir.display());
            } else {
                let api = ferry_plugin_sdk::api_version();
                for manifest in manifests {
                    println!(
                        "- {} v{} [{}]{}{}",
                        manifest.name,
                        manifest.version,
                        manifest.mode,
                        manifest
                            .description
                            .as_ref()
                            .map(|d| format!(": {d}"))
                            .unwrap_or_default(),
                        if manifest.is_compatible_with(&api) {
                            String::new()
                        } else {
                            format!(" (incompatible with host API {api})")
                        }
                    );
                    for decl in &manifest.capabilities {
                        println!("    {} at {}", decl.kind, decl.endpoint());
                    }
                }
            }
        }
    }
    Ok(())
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = load_config(&path)?;
    let json = serde_json::json!({
        "version": ferry_core::version(),
        "api_version": ferry_plugin_sdk::api_version().to_string(),
        "codecs": {
            "legacy": codec::for_mode(ferry_plugin_sdk::Mode::Legacy).name(),
            "current": codec::for_mode(ferry_plugin_sdk::Mode::Current).name(),
        },
        "implementations": {
            "datasource": samples::DATASOURCE_IMPLEMENTATIONS,
            "builder": samples::BUILDER_IMPLEMENTATIONS,
        },
        "config": cfg,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

fn interpolate_env(input: &str) -> Result<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let regex = RE.get_or_init(|| Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}").unwrap());
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

/// Turns `key=value` pairs into an object value.
fn parse_overrides(pairs: &[String]) -> Result<Value> {
    let mut attrs = BTreeMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got `{pair}`");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("empty key in `{pair}`");
        }
        let value = serde_json::from_str::<serde_json::Value>(raw)
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(raw));
        attrs.insert(key.to_string(), value);
    }
    Ok(Value::Object(attrs))
}

/// Shallow merge of two object values; attributes of `top` win.
fn merge_values(base: Value, top: Value) -> Value {
    match (base, top) {
        (Value::Object(mut base), Value::Object(top)) => {
            base.extend(top);
            Value::Object(base)
        }
        (base, Value::Object(top)) if top.is_empty() => base,
        (_, top) => top,
    }
}

fn discover_plugins(dir: &Path) -> Result<Vec<PluginManifest>> {
    let mut manifests = Vec::new();
    if !dir.exists() {
        return Ok(manifests);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let data = fs::read_to_string(&path)?;
        let manifest: PluginManifest = serde_json::from_str(&data)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;
        manifests.push(manifest);
    }
    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ferry_plugin_sdk::Mode;

    use super::*;

    const EXAMPLE: &str = include_str!("../../../demos/config/minimal.ferry.toml");

    fn example() -> Config {
        toml::from_str(&interpolate_env(EXAMPLE).unwrap()).unwrap()
    }

    #[test]
    fn interpolation_falls_back_to_defaults() {
        let out = interpolate_env("listen = \"${FERRY_TEST_UNSET_VAR:127.0.0.1:9}\"").unwrap();
        assert_eq!(out, "listen = \"127.0.0.1:9\"");
    }

    #[test]
    fn bundled_example_is_valid() {
        let config = example();
        config.validate().unwrap();
        for endpoint in &config.endpoints {
            samples::instantiate(endpoint).unwrap();
        }
        assert_eq!(config.resolved_host().unwrap().mode, Mode::Current);
    }

    #[test]
    fn load_config_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[host]
connect = ":7411"
mode = "legacy"

[[endpoints]]
name = "Lookup"
capability = "datasource"
implementation = "static"
config = {{ value = 3 }}
"#
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        config.validate().unwrap();
        let endpoint = config.endpoint("Lookup").unwrap();
        assert_eq!(endpoint.config_value().get("value"), Some(&Value::Number(3.0)));
        assert_eq!(config.resolved_host().unwrap().mode, Mode::Legacy);
    }

    #[test]
    fn overrides_parse_json_with_string_fallback() {
        let value = parse_overrides(&["name=foo".into(), "count=2".into(), "on=true".into()])
            .unwrap();
        assert_eq!(value.get("name"), Some(&Value::from("foo")));
        assert_eq!(value.get("count"), Some(&Value::Number(2.0)));
        assert_eq!(value.get("on"), Some(&Value::Bool(true)));
        assert!(parse_overrides(&["novalue".into()]).is_err());
    }

    #[test]
    fn overrides_win_when_merging() {
        let merged = merge_values(
            Value::object([("target", Value::from("a")), ("keep", Value::Bool(true))]),
            Value::object([("target", Value::from("b"))]),
        );
        assert_eq!(merged.get("target"), Some(&Value::from("b")));
        assert_eq!(merged.get("keep"), Some(&Value::Bool(true)));
    }

    #[test]
    fn discovers_bundled_manifest() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/plugins");
        let manifests = discover_plugins(&dir).unwrap();
        assert_eq!(manifests.len(), 1);
        assert!(manifests[0].provides(CapabilityKind::Builder));
        assert!(manifests[0].is_compatible_with(&ferry_plugin_sdk::api_version()));
    }

    #[tokio::test]
    async fn query_and_build_against_served_samples() {
        codec::register_builtin_types();
        let config = example();
        for mode in [Mode::Legacy, Mode::Current] {
            let handle = plugin_server(&config, mode)
                .unwrap()
                .spawn("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            let client = PluginClient::connect(handle.local_addr(), mode).await.unwrap();

            let endpoint = pick_endpoint(&config, None, CapabilityKind::Datasource).unwrap();
            let datasource = client.datasource(endpoint.name.as_str());
            let overrides = parse_overrides(&["name=foo".into()]).unwrap();
            let output = query(&datasource, endpoint, overrides, None).await.unwrap();
            assert_eq!(output["value"], serde_json::json!("bar"));

            let endpoint = pick_endpoint(&config, None, CapabilityKind::Builder).unwrap();
            let builder = client.builder(endpoint.name.as_str());
            builder.prepare(endpoint.config_value()).await.unwrap();
            builder
                .run(Arc::new(ConsoleBuild::new("test")), Arc::new(ConsoleUi))
                .await
                .unwrap();

            client.close().await;
            handle.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn query_timeout_cancels_slow_execute() {
        let config = example();
        let handle = plugin_server(&config, Mode::Current)
            .unwrap()
            .spawn("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let client = PluginClient::connect(handle.local_addr(), Mode::Current)
            .await
            .unwrap();
        let endpoint = pick_endpoint(&config, None, CapabilityKind::Datasource).unwrap();
        let datasource = client.datasource(endpoint.name.as_str());
        let overrides = parse_overrides(&["delay_ms=60000".into()]).unwrap();

        let err = query(&datasource, endpoint, overrides, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "execution cancelled");
        client.close().await;
    }

    #[test]
    fn wrong_capability_is_rejected() {
        let config = example();
        let err = pick_endpoint(&config, Some("Builder"), CapabilityKind::Datasource).unwrap_err();
        assert_eq!(
            err.to_string(),
            "endpoint `Builder` is a builder, not a datasource"
        );
    }
}
