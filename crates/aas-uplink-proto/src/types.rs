//! Sparkplug B datatype discriminants and XSD-type mapping.

use aas_uplink_core::MetricValue;

/// Sparkplug B datatypes (specification section 6.4.16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum DataType {
    Unknown = 0,
    Int8 = 1,
    Int16 = 2,
    Int32 = 3,
    Int64 = 4,
    UInt8 = 5,
    UInt16 = 6,
    UInt32 = 7,
    UInt64 = 8,
    Float = 9,
    Double = 10,
    Boolean = 11,
    String = 12,
    DateTime = 13,
    Text = 14,
    Uuid = 15,
    DataSet = 16,
    Bytes = 17,
    File = 18,
}

impl DataType {
    /// Wire discriminant.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire discriminant; unknown values map to [`DataType::Unknown`].
    #[must_use]
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            1 => DataType::Int8,
            2 => DataType::Int16,
            3 => DataType::Int32,
            4 => DataType::Int64,
            5 => DataType::UInt8,
            6 => DataType::UInt16,
            7 => DataType::UInt32,
            8 => DataType::UInt64,
            9 => DataType::Float,
            10 => DataType::Double,
            11 => DataType::Boolean,
            12 => DataType::String,
            13 => DataType::DateTime,
            14 => DataType::Text,
            15 => DataType::Uuid,
            16 => DataType::DataSet,
            17 => DataType::Bytes,
            18 => DataType::File,
            _ => DataType::Unknown,
        }
    }
}

/// Map an XSD type name to the Sparkplug datatype.
///
/// Unrecognised types fall back to `String`, matching how untyped AAS values
/// are carried.
#[must_use]
pub fn xsd_to_datatype(xsd_type: &str) -> DataType {
    match xsd_type.to_ascii_lowercase().as_str() {
        "xs:boolean" => DataType::Boolean,
        "xs:byte" => DataType::Int8,
        "xs:short" => DataType::Int16,
        "xs:int" => DataType::Int32,
        "xs:integer" | "xs:long" => DataType::Int64,
        "xs:unsignedbyte" => DataType::UInt8,
        "xs:unsignedshort" => DataType::UInt16,
        "xs:unsignedint" => DataType::UInt32,
        "xs:unsignedlong" => DataType::UInt64,
        "xs:float" => DataType::Float,
        "xs:double" | "xs:decimal" => DataType::Double,
        "xs:datetime" | "xs:date" | "xs:time" => DataType::DateTime,
        "xs:base64binary" | "xs:hexbinary" => DataType::Bytes,
        _ => DataType::String,
    }
}

/// Infer the Sparkplug datatype from a value when no XSD type is available.
#[must_use]
pub fn value_to_datatype(value: &MetricValue) -> DataType {
    match value {
        MetricValue::Null => DataType::Unknown,
        MetricValue::Bool(_) => DataType::Boolean,
        MetricValue::Int(v) => {
            if i32::try_from(*v).is_ok() {
                DataType::Int32
            } else {
                DataType::Int64
            }
        }
        MetricValue::Float(_) => DataType::Double,
        MetricValue::Text(_) => DataType::String,
        MetricValue::Bytes(_) => DataType::Bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xsd_mapping_covers_common_types() {
        assert_eq!(xsd_to_datatype("xs:string"), DataType::String);
        assert_eq!(xsd_to_datatype("xs:boolean"), DataType::Boolean);
        assert_eq!(xsd_to_datatype("xs:int"), DataType::Int32);
        assert_eq!(xsd_to_datatype("xs:long"), DataType::Int64);
        assert_eq!(xsd_to_datatype("xs:double"), DataType::Double);
        assert_eq!(xsd_to_datatype("xs:anyURI"), DataType::String);
    }

    #[test]
    fn discriminant_roundtrip() {
        for dt in [
            DataType::Int32,
            DataType::Double,
            DataType::Boolean,
            DataType::String,
            DataType::Bytes,
        ] {
            assert_eq!(DataType::from_u32(dt.as_u32()), dt);
        }
        assert_eq!(DataType::from_u32(999), DataType::Unknown);
    }

    #[test]
    fn value_inference() {
        assert_eq!(value_to_datatype(&MetricValue::Int(1)), DataType::Int32);
        assert_eq!(
            value_to_datatype(&MetricValue::Int(i64::from(i32::MAX) + 1)),
            DataType::Int64
        );
        assert_eq!(value_to_datatype(&MetricValue::Float(1.0)), DataType::Double);
    }
}
