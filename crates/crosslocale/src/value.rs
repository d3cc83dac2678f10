//! Tagged value: the recursive, schema-less payload crossing the boundary.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{self, Serialize, SerializeMap, SerializeSeq, Serializer};

/// Wire tag of a [`Value`], as laid out in `crosslocale_message_type`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Nil = 0,
    Bool = 1,
    I64 = 2,
    F64 = 3,
    Str = 4,
    List = 5,
    Dict = 6,
    Invalid = -1,
}

impl MessageType {
    /// Unknown tags map to [`MessageType::Invalid`].
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Nil,
            1 => Self::Bool,
            2 => Self::I64,
            3 => Self::F64,
            4 => Self::Str,
            5 => Self::List,
            6 => Self::Dict,
            _ => Self::Invalid,
        }
    }
}

/// A dynamically-typed message payload.
///
/// `Dict` is an ordered list of pairs rather than a map: keys may repeat and
/// their encounter order survives every codec.
///
/// `Invalid` marks a host value with no representation. It is only produced
/// while converting host values; codecs omit it below a `List`/`Dict` and
/// reject it at the top level.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Str(String),
    List(Vec<Value>),
    Dict(Vec<(String, Value)>),
    Invalid,
}

/// 2^63, the first double past the end of the i64 range.
const I64_END: f64 = 9_223_372_036_854_775_808.0;

impl Value {
    /// Classify a host number.
    ///
    /// Integral doubles that survive an i64 round trip become `Int64`, every
    /// other double (fractions, NaN, infinities, out of range) is `Float64`.
    pub fn from_f64(number: f64) -> Self {
        if (-I64_END..I64_END).contains(&number) {
            let integer = number as i64;
            if integer as f64 == number {
                return Self::Int64(integer);
            }
        }
        Self::Float64(number)
    }

    pub fn dict<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Dict(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn tag(&self) -> MessageType {
        match self {
            Self::Nil => MessageType::Nil,
            Self::Bool(_) => MessageType::Bool,
            Self::Int64(_) => MessageType::I64,
            Self::Float64(_) => MessageType::F64,
            Self::Str(_) => MessageType::Str,
            Self::List(_) => MessageType::List,
            Self::Dict(_) => MessageType::Dict,
            Self::Invalid => MessageType::Invalid,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid)
    }

    /// Drop every `Invalid` below a container, preserving the order of the
    /// rest. Returns `None` when `self` is itself `Invalid`.
    pub fn prune(self) -> Option<Self> {
        match self {
            Self::Invalid => None,
            Self::List(items) => Some(Self::List(items.into_iter().filter_map(Self::prune).collect())),
            Self::Dict(entries) => Some(Self::Dict(
                entries
                    .into_iter()
                    .filter_map(|(key, value)| value.prune().map(|value| (key, value)))
                    .collect(),
            )),
            other => Some(other),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int64(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(String, Value)]> {
        match self {
            Self::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// First value stored under `key` in a `Dict`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int64(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int64(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Float64(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Nil, Into::into)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int64(n) => write!(f, "{n}"),
            Self::Float64(n) => write!(f, "{n:?}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Dict(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Invalid => f.write_str("<invalid>"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Nil => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Int64(n) => serializer.serialize_i64(*n),
            Self::Float64(n) => serializer.serialize_f64(*n),
            Self::Str(s) => serializer.serialize_str(s),
            Self::List(items) => {
                let kept = items.iter().filter(|v| !v.is_invalid());
                let mut seq = serializer.serialize_seq(None)?;
                for item in kept {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Dict(entries) => {
                let kept = entries.iter().filter(|(_, v)| !v.is_invalid());
                let mut map = serializer.serialize_map(None)?;
                for (key, value) in kept {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            Self::Invalid => Err(ser::Error::custom("top-level value is not representable")),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a null, bool, number, string, list or dict")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Nil)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        Value::deserialize(deserializer)
    }

    fn visit_bool<E: de::Error>(self, b: bool) -> Result<Value, E> {
        Ok(Value::Bool(b))
    }

    fn visit_i64<E: de::Error>(self, n: i64) -> Result<Value, E> {
        Ok(Value::Int64(n))
    }

    fn visit_u64<E: de::Error>(self, n: u64) -> Result<Value, E> {
        Ok(i64::try_from(n).map_or(Value::Float64(n as f64), Value::Int64))
    }

    fn visit_f64<E: de::Error>(self, n: f64) -> Result<Value, E> {
        Ok(Value::Float64(n))
    }

    fn visit_str<E: de::Error>(self, s: &str) -> Result<Value, E> {
        Ok(Value::Str(s.to_owned()))
    }

    fn visit_string<E: de::Error>(self, s: String) -> Result<Value, E> {
        Ok(Value::Str(s))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::List(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            entries.push((key, value));
        }
        Ok(Value::Dict(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}
