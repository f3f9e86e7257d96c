use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Runtime-typed value exchanged between host and plugin.
///
/// The variant is part of the serialized form, so a receiver can rehydrate the
/// value without knowing its shape ahead of time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Set(Vec<Value>),
    Tuple(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn string(value: impl Into<String>) -> Self {
        Value::String(value.into())
    }

    /// Builds an object value from `(attribute, value)` pairs.
    pub fn object<K, I>(attrs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Object(attrs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Attribute lookup for objects and maps.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(attrs) | Value::Map(attrs) => attrs.get(key),
            _ => None,
        }
    }

    pub fn attributes(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(attrs) | Value::Map(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// Infers the type carried by this value.
    pub fn ty(&self) -> Type {
        match self {
            Value::Null => Type::Dynamic,
            Value::Bool(_) => Type::Bool,
            Value::Number(_) => Type::Number,
            Value::String(_) => Type::String,
            Value::List(items) => Type::List(Box::new(element_type(items.iter()))),
            Value::Set(items) => Type::Set(Box::new(element_type(items.iter()))),
            Value::Map(entries) => Type::Map(Box::new(element_type(entries.values()))),
            Value::Tuple(items) => Type::Tuple(items.iter().map(Value::ty).collect()),
            Value::Object(attrs) => Type::Object(
                attrs
                    .iter()
                    .map(|(name, value)| (name.clone(), value.ty()))
                    .collect(),
            ),
        }
    }

    /// Reports whether this value is acceptable where `ty` is expected.
    ///
    /// `Null` conforms to every type.
    pub fn conforms_to(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Value::Null, _) | (_, Type::Dynamic) => true,
            (Value::Bool(_), Type::Bool)
            | (Value::Number(_), Type::Number)
            | (Value::String(_), Type::String) => true,
            (Value::List(items), Type::List(elem)) | (Value::Set(items), Type::Set(elem)) => {
                items.iter().all(|item| item.conforms_to(elem))
            }
            (Value::Map(entries), Type::Map(elem)) => {
                entries.values().all(|value| value.conforms_to(elem))
            }
            (Value::Tuple(items), Type::Tuple(types)) => {
                items.len() == types.len()
                    && items.iter().zip(types).all(|(item, ty)| item.conforms_to(ty))
            }
            (Value::Object(attrs), Type::Object(types)) => {
                attrs.len() == types.len()
                    && types.iter().all(|(name, ty)| {
                        attrs.get(name).is_some_and(|value| value.conforms_to(ty))
                    })
            }
            _ => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) | Value::Set(items) | Value::Tuple(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(attrs) | Value::Object(attrs) => serde_json::Value::Object(
                attrs
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

fn element_type<'a>(mut items: impl Iterator<Item = &'a Value>) -> Type {
    let Some(first) = items.next() else {
        return Type::Dynamic;
    };
    let ty = first.ty();
    if items.all(|item| item.ty() == ty) {
        ty
    } else {
        Type::Dynamic
    }
}

/// JSON arrays become tuples and JSON objects become objects, matching the
/// types a JSON document implies.
impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Tuple(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(attrs) => Value::Object(
                attrs
                    .into_iter()
                    .map(|(name, value)| (name, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

/// Type descriptor for [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Type {
    Dynamic,
    Bool,
    Number,
    String,
    List(Box<Type>),
    Set(Box<Type>),
    Map(Box<Type>),
    Tuple(Vec<Type>),
    Object(BTreeMap<String, Type>),
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Dynamic => f.write_str("any"),
            Type::Bool => f.write_str("bool"),
            Type::Number => f.write_str("number"),
            Type::String => f.write_str("string"),
            Type::List(elem) => write!(f, "list({elem})"),
            Type::Set(elem) => write!(f, "set({elem})"),
            Type::Map(elem) => write!(f, "map({elem})"),
            Type::Tuple(types) => {
                f.write_str("tuple([")?;
                for (i, ty) in types.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{ty}")?;
                }
                f.write_str("])")
            }
            Type::Object(attrs) => {
                f.write_str("object({")?;
                for (i, (name, ty)) in attrs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write_attribute_name(f, name)?;
                    write!(f, "={ty}")?;
                }
                f.write_str("})")
            }
        }
    }
}

fn is_bare_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Attribute names outside `[A-Za-z0-9_-]+` are written as quoted strings
/// with `"` and `\` escaped.
fn write_attribute_name(f: &mut fmt::Formatter<'_>, name: &str) -> fmt::Result {
    if is_bare_name(name) {
        return f.write_str(name);
    }
    f.write_str("\"")?;
    for c in name.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid type expression at offset {offset}: {reason}")]
pub struct TypeParseError {
    pub offset: usize,
    pub reason: String,
}

impl FromStr for Type {
    type Err = TypeParseError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let mut parser = TypeParser { input: expr, pos: 0 };
        let ty = parser.parse_type()?;
        parser.skip_ws();
        if parser.pos != expr.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(ty)
    }
}

struct TypeParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> TypeParser<'a> {
    fn parse_type(&mut self) -> Result<Type, TypeParseError> {
        self.skip_ws();
        let keyword = self.ident();
        match keyword {
            "any" => Ok(Type::Dynamic),
            "bool" => Ok(Type::Bool),
            "number" => Ok(Type::Number),
            "string" => Ok(Type::String),
            "list" | "set" | "map" => {
                self.expect('(')?;
                let elem = Box::new(self.parse_type()?);
                self.expect(')')?;
                Ok(match keyword {
                    "list" => Type::List(elem),
                    "set" => Type::Set(elem),
                    _ => Type::Map(elem),
                })
            }
            "tuple" => {
                self.expect('(')?;
                self.expect('[')?;
                let mut types = Vec::new();
                if !self.eat(']') {
                    loop {
                        types.push(self.parse_type()?);
                        if self.eat(']') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                self.expect(')')?;
                Ok(Type::Tuple(types))
            }
            "object" => {
                self.expect('(')?;
                self.expect('{')?;
                let mut attrs = BTreeMap::new();
                if !self.eat('}') {
                    loop {
                        let name = self.attribute_name()?;
                        self.expect('=')?;
                        let ty = self.parse_type()?;
                        attrs.insert(name, ty);
                        if self.eat('}') {
                            break;
                        }
                        self.expect(',')?;
                    }
                }
                self.expect(')')?;
                Ok(Type::Object(attrs))
            }
            "" => Err(self.error("expected type keyword")),
            other => Err(self.error(&format!("unknown type `{other}`"))),
        }
    }

    fn ident(&mut self) -> &'a str {
        let input = self.input;
        let start = self.pos;
        let len = input[start..]
            .find(|c: char| !is_name_char(c))
            .unwrap_or(input.len() - start);
        self.pos += len;
        &input[start..self.pos]
    }

    fn attribute_name(&mut self) -> Result<String, TypeParseError> {
        if !self.eat('"') {
            let name = self.ident();
            if name.is_empty() {
                return Err(self.error("expected attribute name"));
            }
            return Ok(name.to_string());
        }
        let mut name = String::new();
        let mut chars = self.input[self.pos..].char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += i + 1;
                    return Ok(name);
                }
                '\\' => match chars.next() {
                    Some((_, escaped)) => name.push(escaped),
                    None => break,
                },
                c => name.push(c),
            }
        }
        self.pos = self.input.len();
        Err(self.error("unterminated attribute name"))
    }

    fn skip_ws(&mut self) {
        let rest = &self.input[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.input[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), TypeParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(&format!("expected `{c}`")))
        }
    }

    fn error(&self, reason: &str) -> TypeParseError {
        TypeParseError {
            offset: self.pos,
            reason: reason.to_string(),
        }
    }
}
