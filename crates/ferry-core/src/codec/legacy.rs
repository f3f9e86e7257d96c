//! Registration-based binary codec spoken by older plugins.
//!
//! Dynamically typed results are written as `{ type_name, payload }`. The
//! receiver can only rehydrate a payload whose type name was registered in its
//! process beforehand; call [`register_builtin_types`] once at startup.

use std::{
    any::{type_name, TypeId},
    collections::HashMap,
};

use ferry_plugin_sdk::{ObjectSpec, Value};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::Codec;
use crate::error::CodecError;

/// Name under which [`Value`] itself is registered.
pub const VALUE_TYPE_NAME: &str = "ferry.Value";

type DecodeFn = fn(&[u8]) -> Result<Value, CodecError>;

#[derive(Default)]
struct Registry {
    decoders: HashMap<String, DecodeFn>,
    names: HashMap<TypeId, String>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| RwLock::new(Registry::default()));

#[derive(Serialize, Deserialize)]
struct TypedBlob {
    type_name: String,
    payload: Vec<u8>,
}

/// Makes `T` encodable and decodable as a legacy result under `name`.
/// Registering the same type again replaces the previous entry.
pub fn register_legacy_type<T>(name: &str)
where
    T: Serialize + DeserializeOwned + Into<Value> + 'static,
{
    let mut registry = REGISTRY.write();
    registry.decoders.insert(name.to_string(), decode_as::<T>);
    registry.names.insert(TypeId::of::<T>(), name.to_string());
    tracing::debug!(name, rust_type = type_name::<T>(), "registered legacy type");
}

pub fn register_builtin_types() {
    register_legacy_type::<Value>(VALUE_TYPE_NAME);
}

pub fn is_registered(name: &str) -> bool {
    REGISTRY.read().decoders.contains_key(name)
}

fn decode_as<T>(raw: &[u8]) -> Result<Value, CodecError>
where
    T: DeserializeOwned + Into<Value>,
{
    Ok(postcard::from_bytes::<T>(raw)?.into())
}

/// Encodes a registered value together with its type name.
pub fn encode_registered<T: Serialize + 'static>(value: &T) -> Result<Vec<u8>, CodecError> {
    let name = REGISTRY
        .read()
        .names
        .get(&TypeId::of::<T>())
        .cloned()
        .ok_or_else(|| CodecError::Unregistered(type_name::<T>().to_string()))?;
    let blob = TypedBlob {
        type_name: name,
        payload: postcard::to_stdvec(value)?,
    };
    Ok(postcard::to_stdvec(&blob)?)
}

pub fn decode_registered(raw: &[u8]) -> Result<Value, CodecError> {
    let blob: TypedBlob = postcard::from_bytes(raw)?;
    let decode = REGISTRY
        .read()
        .decoders
        .get(&blob.type_name)
        .copied()
        .ok_or(CodecError::Unregistered(blob.type_name))?;
    decode(&blob.payload)
}

pub struct LegacyCodec;

impl Codec for LegacyCodec {
    fn name(&self) -> &'static str {
        "postcard"
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_stdvec(value)?)
    }

    fn decode_value(&self, raw: &[u8]) -> Result<Value, CodecError> {
        Ok(postcard::from_bytes(raw)?)
    }

    fn encode_result(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        encode_registered(value)
    }

    fn decode_result(&self, raw: &[u8]) -> Result<Value, CodecError> {
        decode_registered(raw)
    }

    fn encode_spec(&self, spec: &ObjectSpec) -> Result<Vec<u8>, CodecError> {
        Ok(postcard::to_stdvec(spec)?)
    }

    fn decode_spec(&self, raw: &[u8]) -> Result<ObjectSpec, CodecError> {
        Ok(postcard::from_bytes(raw)?)
    }
}
