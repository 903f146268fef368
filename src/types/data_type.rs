//! Flight software data type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{GdsError, Result};

/// Fixed-width scalar types used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    Bool,
}

impl ScalarType {
    /// Returns the size in bytes of this scalar.
    pub const fn size(&self) -> usize {
        match self {
            ScalarType::U8 | ScalarType::I8 | ScalarType::Bool => 1,
            ScalarType::U16 | ScalarType::I16 => 2,
            ScalarType::U32 | ScalarType::I32 | ScalarType::F32 => 4,
            ScalarType::U64 | ScalarType::I64 | ScalarType::F64 => 8,
        }
    }

    /// Whether this scalar can carry enum values.
    pub const fn is_integer(&self) -> bool {
        !matches!(self, ScalarType::F32 | ScalarType::F64 | ScalarType::Bool)
    }

    const fn as_str(&self) -> &'static str {
        match self {
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
            ScalarType::Bool => "bool",
        }
    }

    pub const ALL: [ScalarType; 11] = [
        ScalarType::U8,
        ScalarType::U16,
        ScalarType::U32,
        ScalarType::U64,
        ScalarType::I8,
        ScalarType::I16,
        ScalarType::I32,
        ScalarType::I64,
        ScalarType::F32,
        ScalarType::F64,
        ScalarType::Bool,
    ];
}

/// Datatype of a telemetry channel, event argument or command argument.
///
/// Written in data standards files as `u8`, `f64`, `enum<u8>` or `string`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataType {
    Scalar(ScalarType),
    /// Enumeration carried as the given integer scalar.
    Enum(ScalarType),
    /// u16 length-prefixed UTF-8.
    String,
}

impl DataType {
    /// Size in bytes, or `None` for variable-length strings.
    pub const fn size(&self) -> Option<usize> {
        match self {
            DataType::Scalar(s) | DataType::Enum(s) => Some(s.size()),
            DataType::String => None,
        }
    }

    pub const fn is_enum(&self) -> bool {
        matches!(self, DataType::Enum(_))
    }

    /// Whether values of this type can be averaged.
    pub const fn is_numeric(&self) -> bool {
        matches!(self, DataType::Scalar(s) if !matches!(s, ScalarType::Bool))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Scalar(s) => f.write_str(s.as_str()),
            DataType::Enum(s) => write!(f, "enum<{}>", s.as_str()),
            DataType::String => f.write_str("string"),
        }
    }
}

impl FromStr for DataType {
    type Err = GdsError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "string" {
            return Ok(DataType::String);
        }
        let scalar = |name: &str| {
            ScalarType::ALL.into_iter().find(|t| t.as_str() == name).ok_or_else(|| {
                GdsError::schema("datatype", format!("unknown scalar type '{name}'"))
            })
        };
        if let Some(inner) = s.strip_prefix("enum<").and_then(|rest| rest.strip_suffix('>')) {
            let underlying = scalar(inner)?;
            if !underlying.is_integer() {
                return Err(GdsError::schema(
                    "datatype",
                    format!("enum must be backed by an integer, got '{inner}'"),
                ));
            }
            return Ok(DataType::Enum(underlying));
        }
        scalar(s).map(DataType::Scalar)
    }
}

impl TryFrom<String> for DataType {
    type Error = GdsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DataType> for String {
    fn from(value: DataType) -> Self {
        value.to_string()
    }
}

/// Serde form for floats that keeps NaN and the infinities, which JSON
/// numbers cannot carry: finite values stay numbers, the rest become
/// `"NaN"`, `"inf"` or `"-inf"`.
macro_rules! lossless_float {
    ($module:ident, $t:ty) => {
        pub(crate) mod $module {
            use serde::de::Error;
            use serde::{Deserialize, Deserializer, Serialize, Serializer};

            #[derive(Deserialize)]
            #[serde(untagged)]
            enum Repr {
                Num($t),
                Token(String),
            }

            pub fn serialize<S: Serializer>(v: &$t, s: S) -> Result<S::Ok, S::Error> {
                match *v {
                    v if v.is_nan() => s.serialize_str("NaN"),
                    v if v == <$t>::INFINITY => s.serialize_str("inf"),
                    v if v == <$t>::NEG_INFINITY => s.serialize_str("-inf"),
                    v => v.serialize(s),
                }
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<$t, D::Error> {
                match Repr::deserialize(d)? {
                    Repr::Num(v) => Ok(v),
                    Repr::Token(token) => match token.as_str() {
                        "NaN" => Ok(<$t>::NAN),
                        "inf" => Ok(<$t>::INFINITY),
                        "-inf" => Ok(<$t>::NEG_INFINITY),
                        other => Err(D::Error::custom(format!("'{other}' is not a float"))),
                    },
                }
            }
        }
    };
}

lossless_float!(lossless_f32, f32);
lossless_float!(lossless_f64, f64);

/// Runtime value of a channel or argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(#[serde(with = "lossless_f32")] f32),
    F64(#[serde(with = "lossless_f64")] f64),
    Bool(bool),
    /// Resolved enum member.
    Enum { name: String, value: i64 },
    Str(String),
}

impl Value {
    /// Numeric view used by averaging queries. Enums and strings are not numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::U8(v) => Some(v as f64),
            Value::U16(v) => Some(v as f64),
            Value::U32(v) => Some(v as f64),
            Value::U64(v) => Some(v as f64),
            Value::I8(v) => Some(v as f64),
            Value::I16(v) => Some(v as f64),
            Value::I32(v) => Some(v as f64),
            Value::I64(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            Value::Bool(_) | Value::Enum { .. } | Value::Str(_) => None,
        }
    }

    /// Integer view used for enum encoding.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::U8(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::U64(v) => i64::try_from(v).ok(),
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::Bool(v) => Some(v as i64),
            Value::Enum { value, .. } => Some(value),
            Value::F32(_) | Value::F64(_) | Value::Str(_) => None,
        }
    }

    /// Builds the scalar value of `ty` holding `raw`, failing when it doesn't fit.
    pub fn from_i64(ty: ScalarType, raw: i64) -> Result<Self> {
        let range = |_| GdsError::ValueRange {
            data_type: ty.as_str().to_string(),
            details: format!("{raw} does not fit"),
        };
        Ok(match ty {
            ScalarType::U8 => Value::U8(u8::try_from(raw).map_err(range)?),
            ScalarType::U16 => Value::U16(u16::try_from(raw).map_err(range)?),
            ScalarType::U32 => Value::U32(u32::try_from(raw).map_err(range)?),
            ScalarType::U64 => Value::U64(u64::try_from(raw).map_err(range)?),
            ScalarType::I8 => Value::I8(i8::try_from(raw).map_err(range)?),
            ScalarType::I16 => Value::I16(i16::try_from(raw).map_err(range)?),
            ScalarType::I32 => Value::I32(i32::try_from(raw).map_err(range)?),
            ScalarType::I64 => Value::I64(raw),
            ScalarType::F32 => Value::F32(raw as f32),
            ScalarType::F64 => Value::F64(raw as f64),
            ScalarType::Bool => Value::Bool(raw != 0),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Enum { name, value } => write!(f, "{name}[{value:#x}]"),
            Value::Str(v) => write!(f, "{v:?}"),
        }
    }
}
