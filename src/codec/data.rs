//! Wire encoding of individual typed values.
//!
//! Everything is big-endian. Reads are bounds checked against the remaining
//! bytes; running off the end is reported as a payload decoding error at the
//! offending offset so callers can flag the packet as possibly corrupt.

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::standards::EnumMember;
use crate::types::{DataType, ScalarType, Value};
use crate::{GdsError, Result};

/// Bounds-checked reader over a byte slice.
#[derive(Debug, Clone)]
pub struct WireCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset from the start of the slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos + n).ok_or_else(|| {
            GdsError::payload_decoding(
                self.pos,
                format!("needed {n} bytes, {} remain", self.remaining()),
            )
        })?;
        self.pos += n;
        Ok(bytes)
    }

    /// Takes everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }

    pub fn read<T: WireData>(&mut self) -> Result<T> {
        T::read(self)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}

/// Types that have a fixed big-endian wire representation.
pub trait WireData: Sized {
    const SCALAR: ScalarType;

    fn read(cursor: &mut WireCursor<'_>) -> Result<Self>;

    fn write(&self, out: &mut BytesMut);
}

macro_rules! wire_number {
    ($ty:ty, $scalar:expr, $put:ident) => {
        impl WireData for $ty {
            const SCALAR: ScalarType = $scalar;

            fn read(cursor: &mut WireCursor<'_>) -> Result<Self> {
                Ok(<$ty>::from_be_bytes(cursor.array()?))
            }

            fn write(&self, out: &mut BytesMut) {
                out.$put(*self);
            }
        }
    };
}

wire_number!(u8, ScalarType::U8, put_u8);
wire_number!(u16, ScalarType::U16, put_u16);
wire_number!(u32, ScalarType::U32, put_u32);
wire_number!(u64, ScalarType::U64, put_u64);
wire_number!(i8, ScalarType::I8, put_i8);
wire_number!(i16, ScalarType::I16, put_i16);
wire_number!(i32, ScalarType::I32, put_i32);
wire_number!(i64, ScalarType::I64, put_i64);
wire_number!(f32, ScalarType::F32, put_f32);
wire_number!(f64, ScalarType::F64, put_f64);

impl WireData for bool {
    const SCALAR: ScalarType = ScalarType::Bool;

    fn read(cursor: &mut WireCursor<'_>) -> Result<Self> {
        Ok(cursor.read::<u8>()? != 0)
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_u8(u8::from(*self));
    }
}

/// Reads a u16 length-prefixed UTF-8 string.
pub fn read_string(cursor: &mut WireCursor<'_>) -> Result<String> {
    let start = cursor.position();
    let len = cursor.read::<u16>()? as usize;
    let bytes = cursor.take(len).map_err(|_| {
        GdsError::payload_decoding(start, format!("string length {len} runs past the VLP"))
    })?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| GdsError::payload_decoding(start, format!("string is not UTF-8: {e}")))
}

/// Writes a u16 length-prefixed UTF-8 string.
pub fn write_string(value: &str, out: &mut BytesMut) -> Result<()> {
    let len = u16::try_from(value.len()).map_err(|_| GdsError::ValueRange {
        data_type: "string".into(),
        details: format!("{} bytes exceeds the u16 length prefix", value.len()),
    })?;
    out.put_u16(len);
    out.put_slice(value.as_bytes());
    Ok(())
}

fn read_scalar(cursor: &mut WireCursor<'_>, ty: ScalarType) -> Result<Value> {
    Ok(match ty {
        ScalarType::U8 => Value::U8(cursor.read()?),
        ScalarType::U16 => Value::U16(cursor.read()?),
        ScalarType::U32 => Value::U32(cursor.read()?),
        ScalarType::U64 => Value::U64(cursor.read()?),
        ScalarType::I8 => Value::I8(cursor.read()?),
        ScalarType::I16 => Value::I16(cursor.read()?),
        ScalarType::I32 => Value::I32(cursor.read()?),
        ScalarType::I64 => Value::I64(cursor.read()?),
        ScalarType::F32 => Value::F32(cursor.read()?),
        ScalarType::F64 => Value::F64(cursor.read()?),
        ScalarType::Bool => Value::Bool(cursor.read()?),
    })
}

fn write_scalar(value: &Value, ty: ScalarType, out: &mut BytesMut) -> Result<()> {
    let mismatch = || GdsError::ValueRange {
        data_type: format!("{ty:?}"),
        details: format!("cannot encode {value:?}"),
    };
    match (ty, value) {
        (ScalarType::U8, Value::U8(v)) => v.write(out),
        (ScalarType::U16, Value::U16(v)) => v.write(out),
        (ScalarType::U32, Value::U32(v)) => v.write(out),
        (ScalarType::U64, Value::U64(v)) => v.write(out),
        (ScalarType::I8, Value::I8(v)) => v.write(out),
        (ScalarType::I16, Value::I16(v)) => v.write(out),
        (ScalarType::I32, Value::I32(v)) => v.write(out),
        (ScalarType::I64, Value::I64(v)) => v.write(out),
        (ScalarType::F32, Value::F32(v)) => v.write(out),
        (ScalarType::F64, Value::F64(v)) => v.write(out),
        (ScalarType::Bool, Value::Bool(v)) => v.write(out),
        // Integers of another width are accepted when they fit.
        (ty, other) if ty.is_integer() => {
            let raw = other.as_i64().ok_or_else(mismatch)?;
            let coerced = Value::from_i64(ty, raw)?;
            return write_scalar(&coerced, ty, out);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

/// Decodes one value of `datatype`.
///
/// Enum scalars that match no member are surfaced as the raw scalar with a warning.
pub fn decode_value(
    cursor: &mut WireCursor<'_>,
    datatype: DataType,
    members: &[EnumMember],
) -> Result<Value> {
    match datatype {
        DataType::Scalar(ty) => read_scalar(cursor, ty),
        DataType::String => read_string(cursor).map(Value::Str),
        DataType::Enum(ty) => {
            let raw = read_scalar(cursor, ty)?;
            // Members are i64, so a u64 above i64::MAX can match none of them.
            let member = raw.as_i64().and_then(|value| members.iter().find(|m| m.value == value));
            match member {
                Some(member) => Ok(Value::Enum { name: member.name.clone(), value: member.value }),
                None => {
                    warn!("Enum value {raw} matches no member, keeping raw scalar");
                    Ok(raw)
                }
            }
        }
    }
}

/// Encodes one value of `datatype`.
pub fn encode_value(
    value: &Value,
    datatype: DataType,
    members: &[EnumMember],
    out: &mut BytesMut,
) -> Result<()> {
    match (datatype, value) {
        (DataType::String, Value::Str(s)) => write_string(s, out),
        (DataType::String, other) => Err(GdsError::ValueRange {
            data_type: "string".into(),
            details: format!("cannot encode {other:?}"),
        }),
        (DataType::Enum(ty), Value::Enum { name, .. }) => {
            let member = members.iter().find(|m| &m.name == name).ok_or_else(|| {
                GdsError::ValueRange {
                    data_type: datatype.to_string(),
                    details: format!("'{name}' is not a member"),
                }
            })?;
            write_scalar(&Value::from_i64(ty, member.value)?, ty, out)
        }
        (DataType::Enum(ty), Value::Str(name)) => {
            encode_value(&Value::Enum { name: name.clone(), value: 0 }, DataType::Enum(ty), members, out)
        }
        (DataType::Enum(ty), raw) | (DataType::Scalar(ty), raw) => write_scalar(raw, ty, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(value: &Value, ty: DataType, members: &[EnumMember]) -> Value {
        let mut out = BytesMut::new();
        encode_value(value, ty, members, &mut out).unwrap();
        if let Some(size) = ty.size() {
            assert_eq!(out.len(), size);
        }
        let mut cursor = WireCursor::new(&out);
        let decoded = decode_value(&mut cursor, ty, members).unwrap();
        assert!(cursor.is_empty());
        decoded
    }

    #[test]
    fn huge_enum_u64_stays_raw() {
        let members = [EnumMember { name: "ZERO".into(), value: 0, comment: None }];
        let wire = u64::MAX.to_be_bytes();
        let mut cursor = WireCursor::new(&wire);
        let value = decode_value(&mut cursor, DataType::Enum(ScalarType::U64), &members).unwrap();
        assert_eq!(value, Value::U64(u64::MAX));
    }

    fn arb_value() -> impl Strategy<Value = (Value, DataType)> {
        prop_oneof![
            any::<u8>().prop_map(|v| (Value::U8(v), DataType::Scalar(ScalarType::U8))),
            any::<u16>().prop_map(|v| (Value::U16(v), DataType::Scalar(ScalarType::U16))),
            any::<u32>().prop_map(|v| (Value::U32(v), DataType::Scalar(ScalarType::U32))),
            any::<u64>().prop_map(|v| (Value::U64(v), DataType::Scalar(ScalarType::U64))),
            any::<i8>().prop_map(|v| (Value::I8(v), DataType::Scalar(ScalarType::I8))),
            any::<i16>().prop_map(|v| (Value::I16(v), DataType::Scalar(ScalarType::I16))),
            any::<i32>().prop_map(|v| (Value::I32(v), DataType::Scalar(ScalarType::I32))),
            any::<i64>().prop_map(|v| (Value::I64(v), DataType::Scalar(ScalarType::I64))),
            any::<f64>()
                .prop_filter("NaN never compares equal", |v| !v.is_nan())
                .prop_map(|v| (Value::F64(v), DataType::Scalar(ScalarType::F64))),
            any::<bool>().prop_map(|v| (Value::Bool(v), DataType::Scalar(ScalarType::Bool))),
            ".{0,64}".prop_map(|s| (Value::Str(s), DataType::String)),
        ]
    }

    proptest! {
        #[test]
        fn prop_value_codec_roundtrips((value, ty) in arb_value()) {
            prop_assert_eq!(roundtrip(&value, ty, &[]), value);
        }

        #[test]
        fn prop_truncated_input_never_panics(data in prop::collection::vec(any::<u8>(), 0..8)) {
            for ty in ScalarType::ALL {
                let mut cursor = WireCursor::new(&data);
                let result = decode_value(&mut cursor, DataType::Scalar(ty), &[]);
                prop_assert_eq!(result.is_ok(), data.len() >= ty.size());
            }
            let mut cursor = WireCursor::new(&data);
            let _ = decode_value(&mut cursor, DataType::String, &[]);
        }
    }

    #[test]
    fn enum_members_roundtrip_and_unknown_stays_raw() {
        let members = vec![EnumMember::new("IDLE", 0), EnumMember::new("ACTIVE", 7)];
        let ty = DataType::Enum(ScalarType::U8);
        let active = Value::Enum { name: "ACTIVE".into(), value: 7 };
        assert_eq!(roundtrip(&active, ty, &members), active);

        let mut cursor = WireCursor::new(&[0x09]);
        assert_eq!(decode_value(&mut cursor, ty, &members).unwrap(), Value::U8(9));

        let mut out = BytesMut::new();
        assert!(encode_value(&Value::Enum { name: "NOPE".into(), value: 1 }, ty, &members, &mut out).is_err());
    }

    #[test]
    fn string_length_overrun_is_reported() {
        let data = [0x00, 0x05, b'a', b'b'];
        let mut cursor = WireCursor::new(&data);
        let err = read_string(&mut cursor).unwrap_err();
        assert!(matches!(err, GdsError::PayloadDecoding { offset: 0, .. }));
    }

    #[test]
    fn narrower_integers_are_widened_on_encode() {
        let mut out = BytesMut::new();
        encode_value(&Value::U8(5), DataType::Scalar(ScalarType::U32), &[], &mut out).unwrap();
        assert_eq!(&out[..], &[0, 0, 0, 5]);
        let mut out = BytesMut::new();
        assert!(encode_value(&Value::I16(-1), DataType::Scalar(ScalarType::U8), &[], &mut out).is_err());
    }
}
