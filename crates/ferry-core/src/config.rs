use std::{collections::HashSet, net::SocketAddr, str::FromStr};

use anyhow::{bail, Context, Result};
use ferry_plugin_sdk::{CapabilityKind, Mode, Value};
use serde::{Deserialize, Serialize};

/// Root configuration structure deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: Option<Server>,
    pub host: Option<Host>,
    pub endpoints: Vec<Endpoint>,
    pub plugins: Option<Plugins>,
}

/// Plugin role: where capabilities are served.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Server {
    pub listen: String,
    pub mode: Mode,
}

/// Host role: which plugin to dial and where callbacks are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub connect: String,
    pub callback_bind: String,
    pub mode: Mode,
}

impl Default for Host {
    fn default() -> Self {
        Self {
            connect: String::new(),
            callback_bind: "127.0.0.1:0".into(),
            mode: Mode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub capability: CapabilityKind,
    pub implementation: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Plugins {
    pub search_paths: Vec<String>,
}

impl Config {
    /// Validates structural invariants and provides actionable error messages.
    pub fn validate(&self) -> Result<()> {
        if self.server.is_none() && self.host.is_none() {
            bail!("configuration needs a [server] or a [host] section");
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(host) = &self.host {
            host.validate()?;
        }
        if let (Some(server), Some(host)) = (&self.server, &self.host) {
            if server.mode != host.mode {
                bail!(
                    "server speaks {} but host expects {}; both ends of a connection must agree",
                    server.mode,
                    host.mode
                );
            }
        }

        if self.endpoints.is_empty() {
            bail!("at least one endpoint is required");
        }
        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint.validate()?;
            if !names.insert(endpoint.name.as_str()) {
                bail!("duplicate endpoint name `{}`", endpoint.name);
            }
        }
        Ok(())
    }

    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    /// First endpoint providing `kind`, used when none is named explicitly.
    pub fn first_endpoint(&self, kind: CapabilityKind) -> Option<&Endpoint> {
        self.endpoints.iter().find(|endpoint| endpoint.capability == kind)
    }

    pub fn resolved_server(&self) -> Result<ResolvedServer> {
        let server = self.server.as_ref().context("missing [server] section")?;
        Ok(ResolvedServer {
            addr: parse_bind_addr(&server.listen)
                .with_context(|| format!("invalid server listen address `{}`", server.listen))?,
            mode: server.mode,
        })
    }

    pub fn resolved_host(&self) -> Result<ResolvedHost> {
        let host = self.host.as_ref().context("missing [host] section")?;
        Ok(ResolvedHost {
            connect: parse_connect_addr(&host.connect)
                .with_context(|| format!("invalid host connect address `{}`", host.connect))?,
            callback_bind: parse_bind_addr(&host.callback_bind).with_context(|| {
                format!("invalid callback bind address `{}`", host.callback_bind)
            })?,
            mode: host.mode,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedServer {
    pub addr: SocketAddr,
    pub mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedHost {
    pub connect: SocketAddr,
    pub callback_bind: SocketAddr,
    pub mode: Mode,
}

impl Server {
    pub fn validate(&self) -> Result<()> {
        parse_bind_addr(&self.listen)
            .with_context(|| format!("invalid server listen address `{}`", self.listen))?;
        Ok(())
    }
}

impl Host {
    pub fn validate(&self) -> Result<()> {
        parse_connect_addr(&self.connect)
            .with_context(|| format!("invalid host connect address `{}`", self.connect))?;
        parse_bind_addr(&self.callback_bind)
            .with_context(|| format!("invalid callback bind address `{}`", self.callback_bind))?;
        Ok(())
    }
}

impl Endpoint {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("endpoint name must not be empty");
        }
        if self.name.contains('.') {
            bail!("endpoint name `{}` must not contain `.`", self.name);
        }
        if self.implementation.trim().is_empty() {
            bail!("endpoint `{}` must name an implementation", self.name);
        }
        if !(self.config.is_null() || self.config.is_object()) {
            bail!("endpoint `{}` config must be a table", self.name);
        }
        Ok(())
    }

    /// Endpoint configuration as a dynamic value; absent config is an empty
    /// object.
    pub fn config_value(&self) -> Value {
        if self.config.is_null() {
            Value::object::<String, _>([])
        } else {
            Value::from(self.config.clone())
        }
    }
}

/// Parses a socket address, accepting `:port` as shorthand for all
/// interfaces.
pub fn parse_bind_addr(bind: &str) -> Result<SocketAddr> {
    if bind.starts_with(':') {
        let addr = format!("0.0.0.0{bind}");
        Ok(SocketAddr::from_str(&addr)?)
    } else {
        Ok(SocketAddr::from_str(bind)?)
    }
}

/// Like [`parse_bind_addr`], but `:port` means loopback.
pub fn parse_connect_addr(connect: &str) -> Result<SocketAddr> {
    if connect.starts_with(':') {
        let addr = format!("127.0.0.1{connect}");
        Ok(SocketAddr::from_str(&addr)?)
    } else {
        Ok(SocketAddr::from_str(connect)?)
    }
}
