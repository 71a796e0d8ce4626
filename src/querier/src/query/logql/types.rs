//! LogQL operator and matcher types

use std::fmt;

use regex::Regex;

/// Label matcher types matching Prometheus semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatcherOp {
    /// Exact string match (=)
    Equal,
    /// Not equal (!=)
    NotEqual,
    /// Regex match (=~)
    RegexMatch,
    /// Regex not match (!~)
    RegexNotMatch,
}

impl MatcherOp {
    pub const ALL: [MatcherOp; 4] = [
        Self::Equal,
        Self::NotEqual,
        Self::RegexMatch,
        Self::RegexNotMatch,
    ];

    pub fn is_regex(self) -> bool {
        matches!(self, Self::RegexMatch | Self::RegexNotMatch)
    }
}

impl fmt::Display for MatcherOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::RegexMatch => write!(f, "=~"),
            Self::RegexNotMatch => write!(f, "!~"),
        }
    }
}

/// A single label matcher
///
/// Regex matchers are compiled when the matcher is built and are anchored
/// at both ends, so `=~"api"` does not match `"api-gateway"`.
#[derive(Debug, Clone)]
pub struct LabelMatcher {
    /// Label name
    pub label: String,
    /// Match operation
    pub op: MatcherOp,
    /// Value or pattern to match against
    pub value: String,
    re: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(
        label: impl Into<String>,
        op: MatcherOp,
        value: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        let value = value.into();
        let re = if op.is_regex() {
            Some(Regex::new(&format!("^(?:{value})$"))?)
        } else {
            None
        };
        Ok(Self {
            label: label.into(),
            op,
            value,
            re,
        })
    }

    /// Create a new equality matcher
    pub fn equal(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            op: MatcherOp::Equal,
            value: value.to_string(),
            re: None,
        }
    }

    /// Create a new not-equal matcher
    pub fn not_equal(label: &str, value: &str) -> Self {
        Self {
            label: label.to_string(),
            op: MatcherOp::NotEqual,
            value: value.to_string(),
            re: None,
        }
    }

    /// Check a label value against this matcher.
    ///
    /// A missing label should be passed as the empty string.
    pub fn matches(&self, value: &str) -> bool {
        match (self.op, &self.re) {
            (MatcherOp::Equal, _) => value == self.value,
            (MatcherOp::NotEqual, _) => value != self.value,
            (MatcherOp::RegexMatch, Some(re)) => re.is_match(value),
            (MatcherOp::RegexNotMatch, Some(re)) => !re.is_match(value),
            (MatcherOp::RegexMatch | MatcherOp::RegexNotMatch, None) => false,
        }
    }
}

impl PartialEq for LabelMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.label, self.op, self.value)
    }
}

/// Binary arithmetic operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl BinOp {
    /// Binding power; higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Add | Self::Sub => 1,
            Self::Mul | Self::Div | Self::Mod => 2,
            Self::Pow => 3,
        }
    }

    pub fn is_right_assoc(self) -> bool {
        matches!(self, Self::Pow)
    }

    /// Apply the operator with IEEE-754 double semantics.
    pub fn apply(self, left: f64, right: f64) -> f64 {
        match self {
            Self::Add => left + right,
            Self::Sub => left - right,
            Self::Mul => left * right,
            Self::Div => left / right,
            Self::Mod => left % right,
            Self::Pow => left.powf(right),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Pow => "^",
        };
        f.write_str(op)
    }
}

/// Range aggregations over log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    CountOverTime,
    Rate,
    BytesOverTime,
    BytesRate,
}

impl RangeOp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "count_over_time" => Some(Self::CountOverTime),
            "rate" => Some(Self::Rate),
            "bytes_over_time" => Some(Self::BytesOverTime),
            "bytes_rate" => Some(Self::BytesRate),
            _ => None,
        }
    }
}

impl fmt::Display for RangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CountOverTime => write!(f, "count_over_time"),
            Self::Rate => write!(f, "rate"),
            Self::BytesOverTime => write!(f, "bytes_over_time"),
            Self::BytesRate => write!(f, "bytes_rate"),
        }
    }
}

/// Aggregation operators over instant vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregationOp {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sum" => Some(Self::Sum),
            "avg" => Some(Self::Avg),
            "min" => Some(Self::Min),
            "max" => Some(Self::Max),
            "count" => Some(Self::Count),
            _ => None,
        }
    }
}

impl fmt::Display for AggregationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Avg => write!(f, "avg"),
            Self::Min => write!(f, "min"),
            Self::Max => write!(f, "max"),
            Self::Count => write!(f, "count"),
        }
    }
}

/// Numeric comparison used by label filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn apply(self, left: f64, right: f64) -> bool {
        match self {
            Self::Eq => left == right,
            Self::Ne => left != right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Lt => left < right,
            Self::Le => left <= right,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        };
        f.write_str(op)
    }
}
