//! Abstract syntax tree of a parsed LogQL query

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use regex::Regex;

use super::types::{AggregationOp, BinOp, CmpOp, LabelMatcher, RangeOp};

/// A parsed query: either a log selection or a metric expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Log(LogExpr),
    Metric(MetricExpr),
}

/// Stream selector followed by its processing stages
#[derive(Debug, Clone, PartialEq)]
pub struct LogExpr {
    pub selector: Selector,
    pub pipeline: Vec<PipelineStage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub matchers: Vec<LabelMatcher>,
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, matcher) in self.matchers.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{matcher}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    LineFilter(LineFilter),
    Json,
    Regexp(RegexpStage),
    LabelFilter(LabelPredicate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFilterOp {
    /// `|=`
    Contains,
    /// `!=`
    NotContains,
    /// `|~`
    Match,
    /// `!~`
    NotMatch,
}

/// Keeps or drops a line by substring or regex
#[derive(Debug, Clone)]
pub struct LineFilter {
    pub op: LineFilterOp,
    pub value: String,
    re: Option<Regex>,
}

impl LineFilter {
    pub fn new(op: LineFilterOp, value: impl Into<String>) -> Result<Self, regex::Error> {
        let value = value.into();
        let re = match op {
            LineFilterOp::Match | LineFilterOp::NotMatch => Some(Regex::new(&value)?),
            LineFilterOp::Contains | LineFilterOp::NotContains => None,
        };
        Ok(Self { op, value, re })
    }

    pub fn matches(&self, line: &str) -> bool {
        match (self.op, &self.re) {
            (LineFilterOp::Contains, _) => line.contains(&self.value),
            (LineFilterOp::NotContains, _) => !line.contains(&self.value),
            (LineFilterOp::Match, Some(re)) => re.is_match(line),
            (LineFilterOp::NotMatch, Some(re)) => !re.is_match(line),
            (LineFilterOp::Match | LineFilterOp::NotMatch, None) => false,
        }
    }
}

impl PartialEq for LineFilter {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op && self.value == other.value
    }
}

/// `| regexp "<pattern>"`: copies named capture groups into labels.
#[derive(Debug, Clone)]
pub struct RegexpStage {
    pub regex: Regex,
    /// Capture group index to label name
    pub mapping: BTreeMap<usize, String>,
}

impl PartialEq for RegexpStage {
    fn eq(&self, other: &Self) -> bool {
        self.regex.as_str() == other.regex.as_str() && self.mapping == other.mapping
    }
}

/// Condition on a label value
#[derive(Debug, Clone, PartialEq)]
pub enum LabelPredicate {
    Matcher(LabelMatcher),
    Number {
        label: String,
        op: CmpOp,
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetricExpr {
    Literal(f64),
    /// `vector(<number>)`: a single sample with no labels
    Vector(f64),
    Binary(BinaryExpr),
    RangeAggregation(RangeAggregation),
    VectorAggregation(VectorAggregation),
}

impl MetricExpr {
    pub fn binary(op: BinOp, lhs: MetricExpr, rhs: MetricExpr) -> Self {
        Self::Binary(BinaryExpr {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinOp,
    pub lhs: Box<MetricExpr>,
    pub rhs: Box<MetricExpr>,
}

/// `op(<log expr> [range])`
#[derive(Debug, Clone, PartialEq)]
pub struct RangeAggregation {
    pub op: RangeOp,
    pub range: Duration,
    pub expr: LogExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorAggregation {
    pub op: AggregationOp,
    pub grouping: Option<Grouping>,
    pub expr: Box<MetricExpr>,
}

/// `by (...)` or `without (...)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grouping {
    pub without: bool,
    pub labels: Vec<String>,
}
