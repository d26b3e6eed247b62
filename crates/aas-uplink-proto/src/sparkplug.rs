//! Sparkplug B protobuf messages.
//!
//! Hand-annotated prost messages matching the Eclipse Tahu
//! `sparkplug_b.proto` field tags for the subset this daemon exchanges:
//! payload envelope, metrics with scalar values, and property sets. DataSet
//! and Template metrics are not produced or consumed.

/// Payload envelope: `{timestamp, metrics[], seq, uuid?, body?}`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    /// Milliseconds since epoch for the whole payload
    #[prost(uint64, optional, tag = "1")]
    pub timestamp: ::core::option::Option<u64>,
    /// Metrics carried by this message
    #[prost(message, repeated, tag = "2")]
    pub metrics: ::prost::alloc::vec::Vec<Metric>,
    /// Session sequence number (0-255)
    #[prost(uint64, optional, tag = "3")]
    pub seq: ::core::option::Option<u64>,
    /// Optional payload UUID
    #[prost(string, optional, tag = "4")]
    pub uuid: ::core::option::Option<::prost::alloc::string::String>,
    /// Optional opaque body
    #[prost(bytes = "vec", optional, tag = "5")]
    pub body: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// A single metric.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metric {
    /// Metric name; may be omitted after birth when an alias is set
    #[prost(string, optional, tag = "1")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    /// Numeric alias announced at birth
    #[prost(uint64, optional, tag = "2")]
    pub alias: ::core::option::Option<u64>,
    /// Milliseconds since epoch for this metric
    #[prost(uint64, optional, tag = "3")]
    pub timestamp: ::core::option::Option<u64>,
    /// Sparkplug datatype discriminant
    #[prost(uint32, optional, tag = "4")]
    pub datatype: ::core::option::Option<u32>,
    /// Historical flag
    #[prost(bool, optional, tag = "5")]
    pub is_historical: ::core::option::Option<bool>,
    /// Transient flag
    #[prost(bool, optional, tag = "6")]
    pub is_transient: ::core::option::Option<bool>,
    /// Null-value flag
    #[prost(bool, optional, tag = "7")]
    pub is_null: ::core::option::Option<bool>,
    /// Property set with key/value metadata
    #[prost(message, optional, tag = "9")]
    pub properties: ::core::option::Option<PropertySet>,
    /// The value, dispatched on the datatype
    #[prost(oneof = "metric::Value", tags = "10, 11, 12, 13, 14, 15, 16")]
    pub value: ::core::option::Option<metric::Value>,
}

/// Nested types for [`Metric`].
pub mod metric {
    /// Scalar value choice of a metric.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// 8/16/32-bit integers
        #[prost(uint32, tag = "10")]
        IntValue(u32),
        /// 64-bit integers and datetimes
        #[prost(uint64, tag = "11")]
        LongValue(u64),
        /// Single-precision float
        #[prost(float, tag = "12")]
        FloatValue(f32),
        /// Double-precision float
        #[prost(double, tag = "13")]
        DoubleValue(f64),
        /// Boolean
        #[prost(bool, tag = "14")]
        BooleanValue(bool),
        /// Text
        #[prost(string, tag = "15")]
        StringValue(::prost::alloc::string::String),
        /// Raw bytes
        #[prost(bytes, tag = "16")]
        BytesValue(::prost::alloc::vec::Vec<u8>),
    }
}

/// Parallel key/value property lists attached to a metric.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertySet {
    /// Property keys
    #[prost(string, repeated, tag = "1")]
    pub keys: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    /// Property values, parallel to `keys`
    #[prost(message, repeated, tag = "2")]
    pub values: ::prost::alloc::vec::Vec<PropertyValue>,
}

/// One property value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PropertyValue {
    /// Sparkplug datatype discriminant
    #[prost(uint32, optional, tag = "1")]
    pub r#type: ::core::option::Option<u32>,
    /// Null flag
    #[prost(bool, optional, tag = "2")]
    pub is_null: ::core::option::Option<bool>,
    /// The value
    #[prost(oneof = "property_value::Value", tags = "3, 4, 5, 6, 7, 8")]
    pub value: ::core::option::Option<property_value::Value>,
}

/// Nested types for [`PropertyValue`].
pub mod property_value {
    /// Scalar value choice of a property.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        /// 32-bit integer
        #[prost(uint32, tag = "3")]
        IntValue(u32),
        /// 64-bit integer
        #[prost(uint64, tag = "4")]
        LongValue(u64),
        /// Single-precision float
        #[prost(float, tag = "5")]
        FloatValue(f32),
        /// Double-precision float
        #[prost(double, tag = "6")]
        DoubleValue(f64),
        /// Boolean
        #[prost(bool, tag = "7")]
        BooleanValue(bool),
        /// Text
        #[prost(string, tag = "8")]
        StringValue(::prost::alloc::string::String),
    }
}
