use std::collections::BTreeMap;
use std::num::ParseIntError;

use serde::{Deserialize, Serialize};

/// Label name-value pairs identifying a stream or series
pub type LabelSet = BTreeMap<String, String>;

/// Response of GET /loki/api/v1/query and /loki/api/v1/query_range
///
/// See <https://grafana.com/docs/loki/latest/reference/loki-http-api/#query-logs-at-a-single-point-in-time>
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub status: String,
    pub data: QueryResponseData,
}

impl QueryResponse {
    pub fn success(data: QueryResponseData) -> Self {
        Self {
            status: String::from("success"),
            data,
        }
    }
}

/// Query result payload, tagged by `resultType`
///
/// Example:
/// {
///   "resultType": "matrix",
///   "result": [
///     {
///       "metric": {"container": "api"},
///       "values": [[1700000001, "3"], [1700000002, "5"]]
///     }
///   ]
/// }
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
pub enum QueryResponseData {
    Streams(Vec<Stream>),
    Vector(Vec<VectorSample>),
    Matrix(Vec<Series>),
    Scalar(FPoint),
}

impl QueryResponseData {
    pub fn result_type(&self) -> &'static str {
        match self {
            Self::Streams(_) => "streams",
            Self::Vector(_) => "vector",
            Self::Matrix(_) => "matrix",
            Self::Scalar(_) => "scalar",
        }
    }
}

/// A log stream: a label set and its entries in arrival order
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Stream {
    pub stream: LabelSet,
    pub values: Vec<LogEntry>,
}

/// A log line, serialized as `["<unix nanoseconds>", "<line>"]`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "(String, String)", into = "(String, String)")]
pub struct LogEntry {
    /// Unix timestamp in nanoseconds
    pub t: u64,
    /// Log line
    pub v: String,
}

impl TryFrom<(String, String)> for LogEntry {
    type Error = ParseIntError;

    fn try_from((t, v): (String, String)) -> Result<Self, Self::Error> {
        Ok(Self { t: t.parse()?, v })
    }
}

impl From<LogEntry> for (String, String) {
    fn from(entry: LogEntry) -> Self {
        (entry.t.to_string(), entry.v)
    }
}

/// A single sample of an instant vector
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VectorSample {
    pub metric: LabelSet,
    pub value: FPoint,
}

/// A time series of a range query result
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Series {
    pub metric: LabelSet,
    pub values: Vec<FPoint>,
}

/// A float sample, serialized as `[<unix seconds>, "<value>"]`
///
/// The value is kept as its decimal string form so that it round-trips
/// without precision drift.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "(f64, String)", into = "(i64, String)")]
pub struct FPoint {
    /// Unix timestamp in whole seconds
    pub t: i64,
    pub v: String,
}

impl FPoint {
    pub fn new(t: i64, value: f64) -> Self {
        Self {
            t,
            v: format_sample_value(value),
        }
    }
}

impl From<(f64, String)> for FPoint {
    fn from((t, v): (f64, String)) -> Self {
        Self { t: t as i64, v }
    }
}

impl From<FPoint> for (i64, String) {
    fn from(point: FPoint) -> Self {
        (point.t, point.v)
    }
}

/// Format a sample value the way Prometheus-compatible APIs do.
///
/// Finite values use the shortest representation that round-trips, in
/// exponent form (`1e+300`, `1.5e-07`) when the magnitude is below `1e-4` or
/// at least `1e21`; non-finite values are rendered as `NaN`, `+Inf` and `-Inf`.
pub fn format_sample_value(value: f64) -> String {
    if value.is_nan() {
        String::from("NaN")
    } else if value == f64::INFINITY {
        String::from("+Inf")
    } else if value == f64::NEG_INFINITY {
        String::from("-Inf")
    } else if value != 0.0 && !(1e-4..1e21).contains(&value.abs()) {
        format_exponent(value)
    } else {
        value.to_string()
    }
}

/// `{:e}` renders `1e300`; clients expect a signed, two-digit exponent.
fn format_exponent(value: f64) -> String {
    let formatted = format!("{value:e}");
    match formatted.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exp),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => formatted,
    }
}
