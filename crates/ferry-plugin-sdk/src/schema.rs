use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{Type, Value};

/// Declarative description of one output key of a configuration body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Spec {
    /// Nested object decoded from the same body.
    Object(ObjectSpec),
    Attr {
        name: String,
        ty: Type,
        required: bool,
    },
    Block {
        type_name: String,
        nested: Box<Spec>,
        required: bool,
    },
    /// Repeated block; `max_items == 0` means unbounded.
    BlockList {
        type_name: String,
        nested: Box<Spec>,
        min_items: u32,
        max_items: u32,
    },
    Literal(Value),
    Default {
        primary: Box<Spec>,
        default: Box<Spec>,
    },
}

/// Schema of the configuration a capability accepts, keyed by output name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ObjectSpec {
    entries: BTreeMap<String, Spec>,
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("missing required attribute `{0}`")]
    MissingAttribute(String),
    #[error("attribute `{name}` must be {expected}, found {found}")]
    TypeMismatch {
        name: String,
        expected: Type,
        found: Type,
    },
    #[error("expected an object body, found {0}")]
    NotAnObject(Type),
    #[error("block `{type_name}` appears {count} times, expected between {min} and {max}")]
    BlockCount {
        type_name: String,
        count: usize,
        min: u32,
        max: u32,
    },
}

impl ObjectSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, spec: Spec) -> Self {
        self.entries.insert(key.into(), spec);
        self
    }

    /// Adds an attribute whose output key equals its attribute name.
    pub fn attr(self, name: impl Into<String>, ty: Type, required: bool) -> Self {
        let name = name.into();
        self.with(
            name.clone(),
            Spec::Attr {
                name,
                ty,
                required,
            },
        )
    }

    pub fn get(&self, key: &str) -> Option<&Spec> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Spec)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks a raw configuration body against this schema without involving
    /// the plugin that produced it.
    pub fn validate(&self, body: &Value) -> Result<(), SchemaError> {
        let attrs = body
            .attributes()
            .ok_or_else(|| SchemaError::NotAnObject(body.ty()))?;
        self.validate_attrs(attrs)
    }

    fn validate_attrs(&self, attrs: &BTreeMap<String, Value>) -> Result<(), SchemaError> {
        self.entries
            .values()
            .try_for_each(|spec| validate_spec(spec, attrs))
    }
}

impl FromIterator<(String, Spec)> for ObjectSpec {
    fn from_iter<I: IntoIterator<Item = (String, Spec)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

fn validate_spec(spec: &Spec, attrs: &BTreeMap<String, Value>) -> Result<(), SchemaError> {
    match spec {
        Spec::Object(nested) => nested.validate_attrs(attrs),
        Spec::Attr { name, ty, required } => match attrs.get(name) {
            None | Some(Value::Null) if *required => {
                Err(SchemaError::MissingAttribute(name.clone()))
            }
            Some(value) if !value.conforms_to(ty) => Err(SchemaError::TypeMismatch {
                name: name.clone(),
                expected: ty.clone(),
                found: value.ty(),
            }),
            _ => Ok(()),
        },
        Spec::Block {
            type_name,
            nested,
            required,
        } => match attrs.get(type_name) {
            None | Some(Value::Null) if *required => {
                Err(SchemaError::MissingAttribute(type_name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(block) => validate_block(nested, block),
        },
        Spec::BlockList {
            type_name,
            nested,
            min_items,
            max_items,
        } => {
            let blocks: &[Value] = match attrs.get(type_name) {
                None | Some(Value::Null) => &[],
                Some(Value::List(items)) | Some(Value::Tuple(items)) => items.as_slice(),
                Some(single) => std::slice::from_ref(single),
            };
            let count = blocks.len();
            let too_many = *max_items > 0 && count > *max_items as usize;
            if count < *min_items as usize || too_many {
                return Err(SchemaError::BlockCount {
                    type_name: type_name.clone(),
                    count,
                    min: *min_items,
                    max: *max_items,
                });
            }
            blocks
                .iter()
                .try_for_each(|block| validate_block(nested, block))
        }
        Spec::Literal(_) => Ok(()),
        Spec::Default { primary, .. } => match validate_spec(primary, attrs) {
            Err(SchemaError::MissingAttribute(_)) => Ok(()),
            other => other,
        },
    }
}

fn validate_block(nested: &Spec, block: &Value) -> Result<(), SchemaError> {
    let attrs = block
        .attributes()
        .ok_or_else(|| SchemaError::NotAnObject(block.ty()))?;
    validate_spec(nested, attrs)
}
