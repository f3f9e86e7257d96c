pub mod capability;
pub mod manifest;
pub mod schema;
pub mod value;

pub use capability::{Build, Builder, CapabilityKind, Datasource, Mode, Ui};
pub use manifest::{CapabilityDecl, PluginManifest};
pub use schema::{ObjectSpec, SchemaError, Spec};
pub use value::{Type, TypeParseError, Value};

/// Host API version plugins are checked against.
pub fn api_version() -> semver::Version {
    semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .unwrap_or_else(|_| semver::Version::new(0, 0, 0))
}
