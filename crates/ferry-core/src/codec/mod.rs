//! Encoding of values and schemas carried inside RPC payloads.
//!
//! Every connection speaks exactly one [`Mode`]. Both generations sit behind
//! the [`Codec`] trait so call sites never branch on the mode themselves.

pub mod current;
pub mod legacy;
pub mod wire;

use ferry_plugin_sdk::{ObjectSpec, Value};

pub use ferry_plugin_sdk::Mode;

use crate::error::CodecError;

pub use current::CurrentCodec;
pub use legacy::{register_builtin_types, register_legacy_type, LegacyCodec};

pub trait Codec: Send + Sync {
    /// Short label used in diagnostics.
    fn name(&self) -> &'static str;

    /// Configuration value path.
    fn encode_value(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode_value(&self, raw: &[u8]) -> Result<Value, CodecError>;

    /// Result value path; the runtime type travels with the payload.
    fn encode_result(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode_result(&self, raw: &[u8]) -> Result<Value, CodecError>;

    fn encode_spec(&self, spec: &ObjectSpec) -> Result<Vec<u8>, CodecError>;
    fn decode_spec(&self, raw: &[u8]) -> Result<ObjectSpec, CodecError>;
}

pub fn for_mode(mode: Mode) -> &'static dyn Codec {
    match mode {
        Mode::Legacy => &LegacyCodec,
        Mode::Current => &CurrentCodec,
    }
}

#[cfg(test)]
mod tests {
    use ferry_plugin_sdk::{Spec, Type};

    use super::*;

    fn config() -> Value {
        Value::object([
            ("name", Value::from("foo")),
            ("count", Value::Number(3.0)),
            ("tags", Value::Set(vec![Value::from("a"), Value::from("b")])),
            ("pair", Value::Tuple(vec![Value::Bool(true), Value::Null])),
        ])
    }

    fn spec() -> ObjectSpec {
        ObjectSpec::new()
            .attr("name", Type::String, true)
            .with(
                "image",
                Spec::Default {
                    primary: Box::new(Spec::Attr {
                        name: "image".into(),
                        ty: Type::String,
                        required: false,
                    }),
                    default: Box::new(Spec::Literal(Value::from("ubuntu"))),
                },
            )
            .with(
                "mount",
                Spec::Block {
                    type_name: "mount".into(),
                    nested: Box::new(Spec::Object(
                        ObjectSpec::new().attr("path", Type::String, true),
                    )),
                    required: false,
                },
            )
    }

    #[test]
    fn configuration_values_survive_both_modes() {
        register_builtin_types();
        for mode in [Mode::Legacy, Mode::Current] {
            let codec = for_mode(mode);
            let raw = codec.encode_value(&config()).unwrap();
            assert_eq!(codec.decode_value(&raw).unwrap(), config(), "{mode}");
        }
    }

    #[test]
    fn result_values_keep_their_type_in_both_modes() {
        register_builtin_types();
        let value = Value::List(vec![Value::from("bar")]);
        for mode in [Mode::Legacy, Mode::Current] {
            let codec = for_mode(mode);
            let decoded = codec.decode_result(&codec.encode_result(&value).unwrap()).unwrap();
            assert_eq!(decoded.ty(), Type::List(Box::new(Type::String)), "{mode}");
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn output_specs_survive_both_modes() {
        for mode in [Mode::Legacy, Mode::Current] {
            let codec = for_mode(mode);
            let raw = codec.encode_spec(&spec()).unwrap();
            assert_eq!(codec.decode_spec(&raw).unwrap(), spec(), "{mode}");
        }
    }

    #[test]
    fn modes_do_not_understand_each_other() {
        register_builtin_types();
        let raw = CurrentCodec.encode_result(&Value::from("bar")).unwrap();
        assert!(LegacyCodec.decode_result(&raw).is_err());
    }
}
