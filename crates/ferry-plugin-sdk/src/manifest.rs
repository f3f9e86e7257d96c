use serde::{Deserialize, Serialize};

use crate::capability::{CapabilityKind, Mode};

/// On-disk JSON manifest located next to each plugin binary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    /// Host API versions this plugin was built against.
    pub api_version: Option<semver::VersionReq>,
    pub mode: Mode,
    pub capabilities: Vec<CapabilityDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityDecl {
    pub kind: CapabilityKind,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl CapabilityDecl {
    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.kind.default_endpoint())
    }
}

impl PluginManifest {
    pub fn provides(&self, kind: CapabilityKind) -> bool {
        self.capabilities.iter().any(|c| c.kind == kind)
    }

    /// Endpoint names the plugin registers for `kind`.
    pub fn endpoints(&self, kind: CapabilityKind) -> impl Iterator<Item = &str> {
        self.capabilities
            .iter()
            .filter(move |c| c.kind == kind)
            .map(CapabilityDecl::endpoint)
    }

    pub fn is_compatible_with(&self, host: &semver::Version) -> bool {
        self.api_version
            .as_ref()
            .map_or(true, |req| req.matches(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_capabilities_and_defaults_endpoints() {
        let manifest: PluginManifest = serde_json::from_value(serde_json::json!({
            "name": "amazon",
            "version": "1.2.0",
            "api_version": "^0.1",
            "mode": "legacy",
            "capabilities": [
                { "kind": "datasource", "endpoint": "Ami" },
                { "kind": "builder" }
            ]
        }))
        .unwrap();
        assert_eq!(manifest.mode, Mode::Legacy);
        assert!(manifest.provides(CapabilityKind::Builder));
        assert_eq!(
            manifest.endpoints(CapabilityKind::Datasource).collect::<Vec<_>>(),
            vec!["Ami"]
        );
        assert_eq!(
            manifest.endpoints(CapabilityKind::Builder).collect::<Vec<_>>(),
            vec!["Builder"]
        );
        assert!(manifest.is_compatible_with(&semver::Version::new(0, 1, 4)));
        assert!(!manifest.is_compatible_with(&semver::Version::new(1, 0, 0)));
    }
}
