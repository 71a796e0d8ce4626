//! Evaluation of metric expressions over a grid of instants

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use common::model::Timestamp;
use loki_api::{FPoint, QueryResponseData, Series, VectorSample};

use super::error::EngineError;
use super::label_set::LabelSet;
use super::logs::{SeriesSamples, check_series_limit};
use crate::query::logql::ast::{Grouping, MetricExpr, RangeAggregation};
use crate::query::logql::{AggregationOp, BinOp, RangeOp};

/// Upper bound on the number of instants of a range query.
pub const MAX_STEPS: u64 = 11_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Scalar,
    Vector,
}

/// Type-check an expression before any data is fetched.
pub(crate) fn check(expr: &MetricExpr) -> Result<Kind, EngineError> {
    match expr {
        MetricExpr::Literal(_) => Ok(Kind::Scalar),
        MetricExpr::Vector(_) | MetricExpr::RangeAggregation(_) => Ok(Kind::Vector),
        MetricExpr::Binary(bin) => {
            let lhs = check(&bin.lhs)?;
            let rhs = check(&bin.rhs)?;
            if lhs == Kind::Scalar && rhs == Kind::Scalar {
                Ok(Kind::Scalar)
            } else {
                Ok(Kind::Vector)
            }
        }
        MetricExpr::VectorAggregation(agg) => match check(&agg.expr)? {
            Kind::Vector => Ok(Kind::Vector),
            Kind::Scalar => Err(EngineError::semantic(format!(
                "{} expects an instant vector, got a scalar",
                agg.op
            ))),
        },
    }
}

/// Range aggregations of `expr` in evaluation order.
pub(crate) fn range_aggregations<'a>(expr: &'a MetricExpr, out: &mut Vec<&'a RangeAggregation>) {
    match expr {
        MetricExpr::Literal(_) | MetricExpr::Vector(_) => {}
        MetricExpr::Binary(bin) => {
            range_aggregations(&bin.lhs, out);
            range_aggregations(&bin.rhs, out);
        }
        MetricExpr::RangeAggregation(range) => out.push(range),
        MetricExpr::VectorAggregation(agg) => range_aggregations(&agg.expr, out),
    }
}

/// An expression with the data of its range aggregations attached.
pub(crate) enum Plan {
    Literal(f64),
    Vector(f64),
    Binary {
        op: BinOp,
        lhs: Box<Plan>,
        rhs: Box<Plan>,
    },
    Range {
        op: RangeOp,
        range: Duration,
        series: Vec<SeriesSamples>,
    },
    Aggregate {
        op: AggregationOp,
        grouping: Option<Grouping>,
        inner: Box<Plan>,
    },
}

impl Plan {
    /// Build a plan, taking fetched series in the order of
    /// [`range_aggregations`].
    pub fn build(expr: &MetricExpr, fetched: &mut impl Iterator<Item = Vec<SeriesSamples>>) -> Self {
        match expr {
            MetricExpr::Literal(v) => Plan::Literal(*v),
            MetricExpr::Vector(v) => Plan::Vector(*v),
            MetricExpr::Binary(bin) => {
                let lhs = Plan::build(&bin.lhs, fetched);
                let rhs = Plan::build(&bin.rhs, fetched);
                Plan::Binary {
                    op: bin.op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            MetricExpr::RangeAggregation(range) => Plan::Range {
                op: range.op,
                range: range.range,
                series: fetched.next().unwrap_or_default(),
            },
            MetricExpr::VectorAggregation(agg) => Plan::Aggregate {
                op: agg.op,
                grouping: agg.grouping.clone(),
                inner: Box::new(Plan::build(&agg.expr, fetched)),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sample {
    pub labels: LabelSet,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    Scalar(f64),
    Vector(Vec<Sample>),
}

impl Plan {
    /// Evaluate the plan at instant `t`.
    pub fn eval_at(&self, t: Timestamp) -> Value {
        match self {
            Plan::Literal(v) => Value::Scalar(*v),
            Plan::Vector(v) => Value::Vector(vec![Sample {
                labels: LabelSet::new(),
                value: *v,
            }]),
            Plan::Binary { op, lhs, rhs } => binary(*op, lhs.eval_at(t), rhs.eval_at(t)),
            Plan::Range { op, range, series } => Value::Vector(range_samples(*op, *range, series, t)),
            Plan::Aggregate {
                op,
                grouping,
                inner,
            } => match inner.eval_at(t) {
                Value::Vector(samples) => Value::Vector(aggregate(*op, grouping.as_ref(), samples)),
                // Rejected by `check` before evaluation.
                Value::Scalar(v) => Value::Scalar(v),
            },
        }
    }
}

fn binary(op: BinOp, lhs: Value, rhs: Value) -> Value {
    match (lhs, rhs) {
        (Value::Scalar(l), Value::Scalar(r)) => Value::Scalar(op.apply(l, r)),
        (Value::Vector(mut samples), Value::Scalar(r)) => {
            for s in &mut samples {
                s.value = op.apply(s.value, r);
            }
            Value::Vector(samples)
        }
        (Value::Scalar(l), Value::Vector(mut samples)) => {
            for s in &mut samples {
                s.value = op.apply(l, s.value);
            }
            Value::Vector(samples)
        }
        (Value::Vector(lhs), Value::Vector(rhs)) => {
            let rhs: HashMap<LabelSet, f64> = rhs.into_iter().map(|s| (s.labels, s.value)).collect();
            let samples = lhs
                .into_iter()
                .filter_map(|s| {
                    let r = rhs.get(&s.labels)?;
                    Some(Sample {
                        value: op.apply(s.value, *r),
                        labels: s.labels,
                    })
                })
                .collect();
            Value::Vector(samples)
        }
    }
}

/// Apply a range aggregation over the window `(t - range, t]`.
fn range_samples(op: RangeOp, range: Duration, series: &[SeriesSamples], t: Timestamp) -> Vec<Sample> {
    let lower = t.saturating_sub(range);
    let seconds = range.as_secs_f64();

    series
        .iter()
        .filter_map(|s| {
            let lo = s.samples.partition_point(|sample| sample.ts <= lower);
            let hi = s.samples.partition_point(|sample| sample.ts <= t);
            if lo >= hi {
                return None;
            }
            let window = &s.samples[lo..hi];
            let count = window.len() as f64;
            let bytes = window.iter().map(|sample| sample.bytes as f64).sum::<f64>();
            let value = match op {
                RangeOp::CountOverTime => count,
                RangeOp::Rate => count / seconds,
                RangeOp::BytesOverTime => bytes,
                RangeOp::BytesRate => bytes / seconds,
            };
            Some(Sample {
                labels: s.labels.clone(),
                value,
            })
        })
        .collect()
}

fn group_labels(labels: &LabelSet, grouping: Option<&Grouping>) -> LabelSet {
    match grouping {
        None => LabelSet::new(),
        Some(Grouping {
            without: true,
            labels: names,
        }) => {
            let mut kept = labels.clone();
            kept.retain(|name| !names.iter().any(|n| n == name));
            kept
        }
        Some(Grouping {
            without: false,
            labels: names,
        }) => names
            .iter()
            .filter_map(|name| labels.get(name).map(|value| (name.as_str(), value)))
            .collect(),
    }
}

struct Accumulator {
    sum: f64,
    min: f64,
    max: f64,
    count: usize,
}

fn aggregate(op: AggregationOp, grouping: Option<&Grouping>, samples: Vec<Sample>) -> Vec<Sample> {
    let mut groups: BTreeMap<LabelSet, Accumulator> = BTreeMap::new();
    for sample in samples {
        let key = group_labels(&sample.labels, grouping);
        let acc = groups.entry(key).or_insert(Accumulator {
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
        });
        acc.sum += sample.value;
        acc.min = acc.min.min(sample.value);
        acc.max = acc.max.max(sample.value);
        acc.count += 1;
    }

    groups
        .into_iter()
        .map(|(labels, acc)| {
            let value = match op {
                AggregationOp::Sum => acc.sum,
                AggregationOp::Avg => acc.sum / acc.count as f64,
                AggregationOp::Min => acc.min,
                AggregationOp::Max => acc.max,
                AggregationOp::Count => acc.count as f64,
            };
            Sample { labels, value }
        })
        .collect()
}

/// Evaluation instants `start, start + step, ..., <= end`.
///
/// `start == end` is an instant query with a single step, whatever `step` is.
pub(crate) fn steps(
    start: Timestamp,
    end: Timestamp,
    step: Duration,
) -> Result<Vec<Timestamp>, EngineError> {
    if start > end {
        return Err(EngineError::InvalidParams(format!(
            "end ({end}) is before start ({start})"
        )));
    }
    if start == end {
        return Ok(vec![start]);
    }
    let step_nanos = u64::try_from(step.as_nanos()).unwrap_or(u64::MAX);
    if step_nanos == 0 {
        return Err(EngineError::InvalidParams(
            "step must be greater than zero for a range query".to_string(),
        ));
    }

    let count = (end.as_nanos() - start.as_nanos()) / step_nanos + 1;
    if count > MAX_STEPS {
        return Err(EngineError::InvalidParams(format!(
            "range query would produce {count} steps, more than the maximum of {MAX_STEPS}"
        )));
    }
    Ok((0..count)
        .map(|i| Timestamp::from_nanos(start.as_nanos() + i * step_nanos))
        .collect())
}

/// Evaluate `plan` on every instant and shape the result.
///
/// An instant query (`start == end`) yields a scalar or a vector; a range
/// query always yields a matrix, even when the grid holds a single step.
pub(crate) fn evaluate(
    plan: &Plan,
    kind: Kind,
    steps: &[Timestamp],
    instant: bool,
    max_series: usize,
) -> Result<QueryResponseData, EngineError> {
    if let (true, [t]) = (instant, steps) {
        let t = *t;
        return Ok(match plan.eval_at(t) {
            Value::Scalar(v) => QueryResponseData::Scalar(FPoint::new(t.unix_seconds(), v)),
            Value::Vector(mut samples) => {
                check_series_limit(samples.len(), max_series)?;
                samples.sort_by(|a, b| a.labels.cmp(&b.labels));
                QueryResponseData::Vector(
                    samples
                        .into_iter()
                        .map(|s| VectorSample {
                            metric: s.labels.into_map(),
                            value: FPoint::new(t.unix_seconds(), s.value),
                        })
                        .collect(),
                )
            }
        });
    }

    let mut series: BTreeMap<LabelSet, Vec<FPoint>> = BTreeMap::new();
    if kind == Kind::Scalar {
        series.insert(LabelSet::new(), Vec::with_capacity(steps.len()));
    }
    for &t in steps {
        match plan.eval_at(t) {
            Value::Scalar(v) => series
                .entry(LabelSet::new())
                .or_default()
                .push(FPoint::new(t.unix_seconds(), v)),
            Value::Vector(samples) => {
                for s in samples {
                    series
                        .entry(s.labels)
                        .or_default()
                        .push(FPoint::new(t.unix_seconds(), s.value));
                }
                check_series_limit(series.len(), max_series)?;
            }
        }
    }

    Ok(QueryResponseData::Matrix(
        series
            .into_iter()
            .map(|(labels, values)| Series {
                metric: labels.into_map(),
                values,
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::engine::logs::LineSample;
    use crate::query::logql::{Expr, ParseOptions, parse};

    fn metric(query: &str) -> MetricExpr {
        match parse(query, ParseOptions::default()).unwrap() {
            Expr::Metric(expr) => expr,
            Expr::Log(_) => panic!("expected metric query"),
        }
    }

    fn scalar(query: &str) -> f64 {
        let expr = metric(query);
        let plan = Plan::build(&expr, &mut std::iter::empty());
        match plan.eval_at(Timestamp::from_secs(1)) {
            Value::Scalar(v) => v,
            Value::Vector(_) => panic!("expected scalar"),
        }
    }

    fn secs(s: u64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn series(labels: &[(&str, &str)], at_secs: &[u64]) -> SeriesSamples {
        SeriesSamples {
            labels: labels.iter().copied().collect(),
            samples: at_secs
                .iter()
                .map(|s| LineSample {
                    ts: secs(*s),
                    bytes: 10,
                })
                .collect(),
        }
    }

    #[test]
    fn test_scalar_precedence() {
        let cases = [
            ("2+3*4", 14.0),
            ("2*3+4", 10.0),
            ("2+3*4+5", 19.0),
            ("2+3^2", 11.0),
            ("2*3^2", 18.0),
            ("2^3*2", 16.0),
            ("2^3^2", 512.0),
            ("(2^3)^2", 64.0),
            ("-2^2", -4.0),
            ("7 % 4 - 10 / 4", 0.5),
        ];
        for (query, want) in cases {
            assert_eq!(scalar(query), want, "{query}");
        }
    }

    #[test]
    fn test_non_finite_values_propagate() {
        assert!(scalar("1/0").is_infinite());
        assert!(scalar("0/0").is_nan());
        assert!(scalar("NaN + 1").is_nan());
    }

    #[test]
    fn test_check_rejects_aggregation_of_scalar() {
        let err = check(&metric("sum(1 + 2)")).unwrap_err();
        assert!(matches!(err, EngineError::Semantic(_)));
        assert_eq!(check(&metric("2 * vector(1)")).unwrap(), Kind::Vector);
        assert_eq!(check(&metric("2 * 3")).unwrap(), Kind::Scalar);
    }

    #[test]
    fn test_steps() {
        assert_eq!(
            steps(secs(10), secs(10), Duration::ZERO).unwrap(),
            vec![secs(10)]
        );
        assert_eq!(
            steps(secs(10), secs(20), Duration::from_secs(4)).unwrap(),
            vec![secs(10), secs(14), secs(18)]
        );
        assert_eq!(
            steps(secs(10), secs(20), Duration::from_secs(5))
                .unwrap()
                .len(),
            3
        );
        assert!(matches!(
            steps(secs(10), secs(20), Duration::ZERO),
            Err(EngineError::InvalidParams(_))
        ));
        assert!(matches!(
            steps(secs(20), secs(10), Duration::from_secs(1)),
            Err(EngineError::InvalidParams(_))
        ));
        assert!(steps(secs(0), secs(100_000), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_range_window_is_left_open() {
        let data = vec![series(&[("app", "web")], &[1, 2, 3, 4])];
        let plan = Plan::Range {
            op: RangeOp::CountOverTime,
            range: Duration::from_secs(2),
            series: data,
        };

        // (2, 4] holds 3 and 4
        let Value::Vector(samples) = plan.eval_at(secs(4)) else {
            panic!("expected vector");
        };
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 2.0);

        // Nothing in (10, 12]: the series is absent, not zero.
        let Value::Vector(samples) = plan.eval_at(secs(12)) else {
            panic!("expected vector");
        };
        assert!(samples.is_empty());
    }

    #[test]
    fn test_rate_and_bytes() {
        let data = vec![series(&[("app", "web")], &[1, 2, 3, 4])];
        let at = |op| {
            let plan = Plan::Range {
                op,
                range: Duration::from_secs(4),
                series: data.clone(),
            };
            match plan.eval_at(secs(4)) {
                Value::Vector(samples) => samples[0].value,
                Value::Scalar(_) => panic!("expected vector"),
            }
        };
        assert_eq!(at(RangeOp::CountOverTime), 4.0);
        assert_eq!(at(RangeOp::Rate), 1.0);
        assert_eq!(at(RangeOp::BytesOverTime), 40.0);
        assert_eq!(at(RangeOp::BytesRate), 10.0);
    }

    #[test]
    fn test_vector_binary_matches_identical_labels() {
        let lhs = Value::Vector(vec![
            Sample {
                labels: [("app", "web")].into_iter().collect(),
                value: 6.0,
            },
            Sample {
                labels: [("app", "api")].into_iter().collect(),
                value: 1.0,
            },
        ]);
        let rhs = Value::Vector(vec![Sample {
            labels: [("app", "web")].into_iter().collect(),
            value: 3.0,
        }]);

        let Value::Vector(out) = binary(BinOp::Div, lhs, rhs) else {
            panic!("expected vector");
        };
        assert_eq!(
            out,
            vec![Sample {
                labels: [("app", "web")].into_iter().collect(),
                value: 2.0,
            }]
        );
    }

    #[test]
    fn test_scalar_broadcasts_over_vector() {
        let v = Value::Vector(vec![
            Sample {
                labels: [("app", "web")].into_iter().collect(),
                value: 4.0,
            },
            Sample {
                labels: [("app", "api")].into_iter().collect(),
                value: 1.0,
            },
        ]);
        let Value::Vector(out) = binary(BinOp::Sub, Value::Scalar(10.0), v) else {
            panic!("expected vector");
        };
        let values: Vec<f64> = out.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![6.0, 9.0]);
    }

    #[test]
    fn test_aggregate_grouping() {
        let samples = vec![
            Sample {
                labels: [("app", "web"), ("pod", "a")].into_iter().collect(),
                value: 1.0,
            },
            Sample {
                labels: [("app", "web"), ("pod", "b")].into_iter().collect(),
                value: 3.0,
            },
            Sample {
                labels: [("app", "api"), ("pod", "c")].into_iter().collect(),
                value: 5.0,
            },
        ];

        let all = aggregate(AggregationOp::Sum, None, samples.clone());
        assert_eq!(all.len(), 1);
        assert!(all[0].labels.is_empty());
        assert_eq!(all[0].value, 9.0);

        let by_app = Grouping {
            without: false,
            labels: vec!["app".to_string()],
        };
        let avg = aggregate(AggregationOp::Avg, Some(&by_app), samples.clone());
        let got: Vec<(Option<&str>, f64)> =
            avg.iter().map(|s| (s.labels.get("app"), s.value)).collect();
        assert_eq!(got, vec![(Some("api"), 5.0), (Some("web"), 2.0)]);

        let without_pod = Grouping {
            without: true,
            labels: vec!["pod".to_string()],
        };
        let count = aggregate(AggregationOp::Count, Some(&without_pod), samples.clone());
        assert_eq!(count.len(), 2);
        assert_eq!(count[1].value, 2.0);

        let max = aggregate(AggregationOp::Max, Some(&by_app), samples.clone());
        assert_eq!(max[1].value, 3.0);
        let min = aggregate(AggregationOp::Min, Some(&by_app), samples);
        assert_eq!(min[1].value, 1.0);
    }

    #[test]
    fn test_evaluate_series_limit() {
        let data = vec![
            series(&[("app", "a")], &[1]),
            series(&[("app", "b")], &[1]),
        ];
        let plan = Plan::Range {
            op: RangeOp::CountOverTime,
            range: Duration::from_secs(10),
            series: data,
        };
        let err = evaluate(&plan, Kind::Vector, &[secs(5), secs(6)], false, 1).unwrap_err();
        assert!(matches!(err, EngineError::SeriesLimit { limit: 1 }));
        assert!(evaluate(&plan, Kind::Vector, &[secs(5), secs(6)], false, 2).is_ok());
    }

    #[test]
    fn test_evaluate_single_step_range_is_matrix() {
        let plan = Plan::Literal(2.0);

        let got = evaluate(&plan, Kind::Scalar, &[secs(5)], false, 0).unwrap();
        assert_eq!(
            got,
            QueryResponseData::Matrix(vec![Series {
                metric: Default::default(),
                values: vec![FPoint::new(5, 2.0)],
            }])
        );

        let got = evaluate(&plan, Kind::Scalar, &[secs(5)], true, 0).unwrap();
        assert_eq!(got, QueryResponseData::Scalar(FPoint::new(5, 2.0)));
    }
}
