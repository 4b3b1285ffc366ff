//! Message types for the `io.prometheus.client` exposition protocol.
//!
//! These mirror the `MetricFamily` protobuf schema used by the
//! delimited-protobuf exposition format. The text decoder produces the same
//! types, so both wire formats flow through one flattening path.

/// A single label name/value pair.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LabelPair {
    /// The label name.
    #[prost(string, optional, tag = "1")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    /// The label value.
    #[prost(string, optional, tag = "2")]
    pub value: ::core::option::Option<::prost::alloc::string::String>,
}

/// A gauge value.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Gauge {
    /// The point-in-time value.
    #[prost(double, optional, tag = "1")]
    pub value: ::core::option::Option<f64>,
}

/// A counter value.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Counter {
    /// The cumulative value.
    #[prost(double, optional, tag = "1")]
    pub value: ::core::option::Option<f64>,
}

/// A value for a metric whose type is not known to the source.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Untyped {
    /// The value.
    #[prost(double, optional, tag = "1")]
    pub value: ::core::option::Option<f64>,
}

/// One quantile of a summary.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Quantile {
    /// The quantile rank, in `[0, 1]`.
    #[prost(double, optional, tag = "1")]
    pub quantile: ::core::option::Option<f64>,
    /// The value at that rank.
    #[prost(double, optional, tag = "2")]
    pub value: ::core::option::Option<f64>,
}

/// A summary of observed samples.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Summary {
    /// The number of observed samples.
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: ::core::option::Option<u64>,
    /// The sum of observed samples.
    #[prost(double, optional, tag = "2")]
    pub sample_sum: ::core::option::Option<f64>,
    /// The quantiles of observed samples.
    #[prost(message, repeated, tag = "3")]
    pub quantile: ::prost::alloc::vec::Vec<Quantile>,
}

/// One bucket of a histogram.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct Bucket {
    /// Count of samples at or below `upper_bound`.
    #[prost(uint64, optional, tag = "1")]
    pub cumulative_count: ::core::option::Option<u64>,
    /// The inclusive upper bound of the bucket.
    #[prost(double, optional, tag = "2")]
    pub upper_bound: ::core::option::Option<f64>,
}

/// A histogram of observed samples.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Histogram {
    /// The number of observed samples.
    #[prost(uint64, optional, tag = "1")]
    pub sample_count: ::core::option::Option<u64>,
    /// The sum of observed samples.
    #[prost(double, optional, tag = "2")]
    pub sample_sum: ::core::option::Option<f64>,
    /// The histogram buckets.
    #[prost(message, repeated, tag = "3")]
    pub bucket: ::prost::alloc::vec::Vec<Bucket>,
}

/// One metric within a family: a label set and a value of the family's type.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metric {
    /// The labels identifying this metric within its family.
    #[prost(message, repeated, tag = "1")]
    pub label: ::prost::alloc::vec::Vec<LabelPair>,
    /// Set when the family is a gauge.
    #[prost(message, optional, tag = "2")]
    pub gauge: ::core::option::Option<Gauge>,
    /// Set when the family is a counter.
    #[prost(message, optional, tag = "3")]
    pub counter: ::core::option::Option<Counter>,
    /// Set when the family is a summary.
    #[prost(message, optional, tag = "4")]
    pub summary: ::core::option::Option<Summary>,
    /// Set when the family is untyped.
    #[prost(message, optional, tag = "5")]
    pub untyped: ::core::option::Option<Untyped>,
    /// The timestamp of the metric in milliseconds past the epoch, if the
    /// source reported one.
    #[prost(int64, optional, tag = "6")]
    pub timestamp_ms: ::core::option::Option<i64>,
    /// Set when the family is a histogram.
    #[prost(message, optional, tag = "7")]
    pub histogram: ::core::option::Option<Histogram>,
}

/// A named family of metrics of one type.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricFamily {
    /// The family name.
    #[prost(string, optional, tag = "1")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    /// The family's help text.
    #[prost(string, optional, tag = "2")]
    pub help: ::core::option::Option<::prost::alloc::string::String>,
    /// The family's [`MetricType`].
    #[prost(enumeration = "MetricType", optional, tag = "3")]
    pub r#type: ::core::option::Option<i32>,
    /// The metrics of this family.
    #[prost(message, repeated, tag = "4")]
    pub metric: ::prost::alloc::vec::Vec<Metric>,
}

/// The type of every metric in a [`MetricFamily`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
    /// A cumulative, monotonically increasing value.
    Counter = 0,
    /// A point-in-time value.
    Gauge = 1,
    /// A summary of observed samples.
    Summary = 2,
    /// A value of a type unknown to the source.
    Untyped = 3,
    /// A histogram of observed samples.
    Histogram = 4,
}

impl MetricFamily {
    /// The family's type, untyped when absent or out of range.
    #[must_use]
    pub fn kind(&self) -> MetricType {
        self.r#type
            .and_then(|raw| MetricType::try_from(raw).ok())
            .unwrap_or(MetricType::Untyped)
    }
}

/// Decode a buffer holding length-delimited [`MetricFamily`] records, read
/// until the buffer is exhausted.
///
/// # Errors
///
/// Returns an error if any record fails to decode, including a truncated
/// final record.
pub fn decode_delimited(mut buf: &[u8]) -> Result<Vec<MetricFamily>, ::prost::DecodeError> {
    use ::prost::Message;

    let mut families = Vec::new();
    while !buf.is_empty() {
        families.push(MetricFamily::decode_length_delimited(&mut buf)?);
    }
    Ok(families)
}
