use ferry_plugin_sdk::{ObjectSpec, Type, Value};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{wire, Codec};
use crate::error::CodecError;

/// Self-describing CBOR codec. Needs no registration on either side.
pub struct CurrentCodec;

#[derive(Serialize)]
struct TypedValueRef<'a> {
    ty: String,
    value: &'a Value,
}

#[derive(Deserialize)]
struct TypedValue {
    ty: String,
    value: Value,
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CodecError> {
    Ok(ciborium::from_reader(raw)?)
}

impl Codec for CurrentCodec {
    fn name(&self) -> &'static str {
        "cbor"
    }

    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        to_cbor(value)
    }

    fn decode_value(&self, raw: &[u8]) -> Result<Value, CodecError> {
        from_cbor(raw)
    }

    fn encode_result(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        to_cbor(&TypedValueRef {
            ty: value.ty().to_string(),
            value,
        })
    }

    fn decode_result(&self, raw: &[u8]) -> Result<Value, CodecError> {
        let TypedValue { ty, value } = from_cbor(raw)?;
        let expected: Type = ty.parse()?;
        let found = value.ty();
        if found != expected {
            return Err(CodecError::TypeMismatch { expected, found });
        }
        Ok(value)
    }

    fn encode_spec(&self, spec: &ObjectSpec) -> Result<Vec<u8>, CodecError> {
        to_cbor(&wire::to_wire(spec))
    }

    fn decode_spec(&self, raw: &[u8]) -> Result<ObjectSpec, CodecError> {
        wire::from_wire(from_cbor(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_type_must_match_payload() {
        let forged = to_cbor(&TypedValueRef {
            ty: "number".into(),
            value: &Value::from("bar"),
        })
        .unwrap();
        assert!(matches!(
            CurrentCodec.decode_result(&forged),
            Err(CodecError::TypeMismatch {
                expected: Type::Number,
                found: Type::String
            })
        ));
    }

    #[test]
    fn tuples_and_lists_stay_distinct() {
        let tuple = Value::Tuple(vec![Value::from("a")]);
        let raw = CurrentCodec.encode_result(&tuple).unwrap();
        assert_eq!(CurrentCodec.decode_result(&raw).unwrap(), tuple);
    }

    #[test]
    fn punctuated_and_empty_keys_keep_their_type() {
        let value = Value::object([
            ("image.id", Value::from("ami-1")),
            ("a b", Value::Number(2.0)),
            ("", Value::Bool(true)),
            ("quote\"d", Value::Null),
        ]);
        let raw = CurrentCodec.encode_result(&value).unwrap();
        assert_eq!(CurrentCodec.decode_result(&raw).unwrap(), value);

        let tags = Type::Object(
            [("k.v", Type::String), ("", Type::Number)]
                .into_iter()
                .map(|(name, ty)| (name.to_string(), ty))
                .collect(),
        );
        let spec = ObjectSpec::new()
            .attr("tags", tags, true)
            .attr("image.id", Type::String, false);
        let raw = CurrentCodec.encode_spec(&spec).unwrap();
        assert_eq!(CurrentCodec.decode_spec(&raw).unwrap(), spec);
    }
}
