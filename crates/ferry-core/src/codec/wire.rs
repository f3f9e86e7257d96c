//! Fixed schema-description message used by the current codec.
//!
//! `Spec` trees are flattened into a single message shape with a numeric kind
//! and optional fields, and types are written as type expressions, so the wire
//! form does not depend on how the SDK happens to lay out its enums.

use ferry_plugin_sdk::{ObjectSpec, Spec, Value};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

pub const WIRE_VERSION: u32 = 1;

const KIND_OBJECT: u8 = 1;
const KIND_ATTR: u8 = 2;
const KIND_BLOCK: u8 = 3;
const KIND_BLOCK_LIST: u8 = 4;
const KIND_LITERAL: u8 = 5;
const KIND_DEFAULT: u8 = 6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDocument {
    pub version: u32,
    pub root: Vec<WireEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEntry {
    pub key: String,
    pub spec: WireSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireSpec {
    pub kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_expr: Option<String>,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<WireSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<Box<WireSpec>>,
    pub min_items: u32,
    pub max_items: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub literal: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attrs: Vec<WireEntry>,
}

pub fn to_wire(spec: &ObjectSpec) -> WireDocument {
    WireDocument {
        version: WIRE_VERSION,
        root: entries_to_wire(spec),
    }
}

pub fn from_wire(doc: WireDocument) -> Result<ObjectSpec, CodecError> {
    if doc.version != WIRE_VERSION {
        return Err(CodecError::MalformedSpec(format!(
            "unsupported version {}",
            doc.version
        )));
    }
    entries_from_wire(doc.root)
}

fn entries_to_wire(spec: &ObjectSpec) -> Vec<WireEntry> {
    spec.iter()
        .map(|(key, spec)| WireEntry {
            key: key.clone(),
            spec: spec_to_wire(spec),
        })
        .collect()
}

fn entries_from_wire(entries: Vec<WireEntry>) -> Result<ObjectSpec, CodecError> {
    entries
        .into_iter()
        .map(|entry| spec_from_wire(entry.spec).map(|spec| (entry.key, spec)))
        .collect()
}

fn spec_to_wire(spec: &Spec) -> WireSpec {
    match spec {
        Spec::Object(nested) => WireSpec {
            kind: KIND_OBJECT,
            attrs: entries_to_wire(nested),
            ..WireSpec::default()
        },
        Spec::Attr { name, ty, required } => WireSpec {
            kind: KIND_ATTR,
            name: Some(name.clone()),
            type_expr: Some(ty.to_string()),
            required: *required,
            ..WireSpec::default()
        },
        Spec::Block {
            type_name,
            nested,
            required,
        } => WireSpec {
            kind: KIND_BLOCK,
            name: Some(type_name.clone()),
            nested: Some(Box::new(spec_to_wire(nested))),
            required: *required,
            ..WireSpec::default()
        },
        Spec::BlockList {
            type_name,
            nested,
            min_items,
            max_items,
        } => WireSpec {
            kind: KIND_BLOCK_LIST,
            name: Some(type_name.clone()),
            nested: Some(Box::new(spec_to_wire(nested))),
            min_items: *min_items,
            max_items: *max_items,
            ..WireSpec::default()
        },
        Spec::Literal(value) => WireSpec {
            kind: KIND_LITERAL,
            literal: Some(value.clone()),
            ..WireSpec::default()
        },
        Spec::Default { primary, default } => WireSpec {
            kind: KIND_DEFAULT,
            nested: Some(Box::new(spec_to_wire(primary))),
            fallback: Some(Box::new(spec_to_wire(default))),
            ..WireSpec::default()
        },
    }
}

fn spec_from_wire(wire: WireSpec) -> Result<Spec, CodecError> {
    let spec = match wire.kind {
        KIND_OBJECT => Spec::Object(entries_from_wire(wire.attrs)?),
        KIND_ATTR => Spec::Attr {
            name: required_field(wire.name, "attr", "name")?,
            ty: required_field(wire.type_expr, "attr", "type_expr")?.parse()?,
            required: wire.required,
        },
        KIND_BLOCK => Spec::Block {
            type_name: required_field(wire.name, "block", "name")?,
            nested: Box::new(spec_from_wire(*required_field(wire.nested, "block", "nested")?)?),
            required: wire.required,
        },
        KIND_BLOCK_LIST => Spec::BlockList {
            type_name: required_field(wire.name, "block_list", "name")?,
            nested: Box::new(spec_from_wire(*required_field(
                wire.nested,
                "block_list",
                "nested",
            )?)?),
            min_items: wire.min_items,
            max_items: wire.max_items,
        },
        KIND_LITERAL => Spec::Literal(required_field(wire.literal, "literal", "literal")?),
        KIND_DEFAULT => Spec::Default {
            primary: Box::new(spec_from_wire(*required_field(wire.nested, "default", "nested")?)?),
            default: Box::new(spec_from_wire(*required_field(
                wire.fallback,
                "default",
                "fallback",
            )?)?),
        },
        other => {
            return Err(CodecError::MalformedSpec(format!("unknown spec kind {other}")));
        }
    };
    Ok(spec)
}

fn required_field<T>(field: Option<T>, kind: &str, name: &str) -> Result<T, CodecError> {
    field.ok_or_else(|| CodecError::MalformedSpec(format!("{kind} spec without `{name}`")))
}
