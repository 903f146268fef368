//! Core value and metadata types.
//!
//! - [`DataType`] / [`ScalarType`] describe how a channel or argument is laid
//!   out on the wire and know their byte size.
//! - [`Value`] holds a decoded runtime value.
//! - [`DownlinkTimes`], [`DataPathway`] and [`DataSource`] are the metadata
//!   every downlinked payload carries.
//!
//! ## Usage Example
//!
//! ```rust
//! use iris_gds::types::{DataType, ScalarType, Value};
//!
//! let ty: DataType = "enum<u8>".parse().unwrap();
//! assert_eq!(ty, DataType::Enum(ScalarType::U8));
//! assert_eq!(ty.size(), Some(1));
//! assert_eq!(Value::U16(4500).as_f64(), Some(4500.0));
//! ```

mod data_type;
mod metadata;

pub use data_type::{DataType, ScalarType, Value};
pub use metadata::{DataPathway, DataSource, DownlinkStage, DownlinkTimes};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_scalar() -> impl Strategy<Value = ScalarType> {
        prop::sample::select(ScalarType::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_datatype_text_form_roundtrips(scalar in arb_scalar(), kind in 0u8..3) {
            let ty = match kind {
                0 => DataType::Scalar(scalar),
                1 if scalar.is_integer() => DataType::Enum(scalar),
                _ => DataType::String,
            };
            let parsed: DataType = ty.to_string().parse().unwrap();
            prop_assert_eq!(parsed, ty);
        }

        #[test]
        fn prop_scalar_sizes_are_powers_of_two(scalar in arb_scalar()) {
            let size = scalar.size();
            prop_assert!(size.is_power_of_two());
            prop_assert!(size <= 8);
            prop_assert_eq!(DataType::Scalar(scalar).size(), Some(size));
        }

        #[test]
        fn prop_from_i64_respects_ranges(raw in any::<i64>()) {
            let fits_u8 = (0..=255).contains(&raw);
            prop_assert_eq!(Value::from_i64(ScalarType::U8, raw).is_ok(), fits_u8);
            prop_assert_eq!(Value::from_i64(ScalarType::I64, raw).unwrap(), Value::I64(raw));
        }
    }

    #[test]
    fn datatype_parse_rejects_bad_forms() {
        assert!("u128".parse::<DataType>().is_err());
        assert!("enum<f32>".parse::<DataType>().is_err());
        assert!("enum<bool>".parse::<DataType>().is_err());
        assert_eq!("string".parse::<DataType>().unwrap().size(), None);
    }

    #[test]
    fn datatype_serde_uses_text_form() {
        let ty = DataType::Enum(ScalarType::U16);
        assert_eq!(serde_json::to_string(&ty).unwrap(), "\"enum<u16>\"");
        let back: DataType = serde_json::from_str("\"i32\"").unwrap();
        assert_eq!(back, DataType::Scalar(ScalarType::I32));
    }

    #[test]
    fn numeric_views() {
        assert_eq!(Value::Bool(true).as_f64(), None);
        assert_eq!(Value::Enum { name: "ON".into(), value: 1 }.as_i64(), Some(1));
        assert_eq!(Value::F32(1.5).as_f64(), Some(1.5));
        assert!(DataType::Scalar(ScalarType::F64).is_numeric());
        assert!(!DataType::Scalar(ScalarType::Bool).is_numeric());
    }

    #[test]
    fn non_finite_floats_survive_json() {
        let values = [Value::F32(f32::NAN), Value::F32(f32::NEG_INFINITY), Value::F64(f64::INFINITY), Value::F64(-0.25)];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, r#"[{"F32":"NaN"},{"F32":"-inf"},{"F64":"inf"},{"F64":-0.25}]"#);
        let back: Vec<Value> = serde_json::from_str(&json).unwrap();
        assert!(matches!(back[0], Value::F32(v) if v.is_nan()));
        assert_eq!(&back[1..], &values[1..]);
        assert!(serde_json::from_str::<Value>(r#"{"F64":"huge"}"#).is_err());
    }
}
