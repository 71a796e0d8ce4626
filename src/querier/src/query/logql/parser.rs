//! Recursive descent parser for the supported LogQL subset
//!
//! Binary operators are parsed by precedence climbing: `^` binds tightest and
//! is right-associative, then `* / %`, then `+ -`. Unary minus binds looser
//! than `^`, so `-2^2` is `-(2^2)`.

use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;

use super::ast::{
    Expr, Grouping, LabelPredicate, LineFilter, LineFilterOp, LogExpr, MetricExpr,
    PipelineStage, RangeAggregation, RegexpStage, Selector, VectorAggregation,
};
use super::error::{ParseError, Position};
use super::lexer::{Token, TokenKind, tokenize};
use super::types::{AggregationOp, BinOp, CmpOp, LabelMatcher, MatcherOp, RangeOp};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Accept `.` inside label names (`service.name`).
    pub allow_dots: bool,
}

/// Parse a query string into an AST expression
///
/// # Examples
/// ```ignore
/// use querier::query::logql::{parse, ParseOptions};
///
/// let expr = parse(r#"{container="api"} |= "error""#, ParseOptions::default()).unwrap();
/// let expr = parse(r#"sum by (level) (rate({app="web"}[5m]))"#, ParseOptions::default()).unwrap();
/// ```
pub fn parse(input: &str, opts: ParseOptions) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        opts,
    };

    let expr = if parser.peek_kind() == &TokenKind::LBrace {
        Expr::Log(parser.log_expr()?)
    } else {
        Expr::Metric(parser.metric_expr(0)?)
    };
    parser.expect(TokenKind::Eof)?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    cursor: usize,
    opts: ParseOptions,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The token list always ends with Eof and the cursor never moves past it.
        &self.tokens[self.cursor.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_nth_kind(&self, n: usize) -> &TokenKind {
        let idx = (self.cursor + n).min(self.tokens.len() - 1);
        &self.tokens[idx].kind
    }

    fn pos(&self) -> Position {
        self.peek().pos
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.cursor += 1;
        }
        token
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let token = self.peek();
        ParseError::new(
            token.pos,
            format!("unexpected {}, expected {expected}", token.kind),
        )
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        if self.peek_kind() == &kind {
            Ok(self.advance())
        } else {
            Err(self.unexpected(&kind.to_string()))
        }
    }

    fn string(&mut self) -> Result<(String, Position), ParseError> {
        let token = self.peek();
        if let TokenKind::Str(value) = &token.kind {
            let found = (value.clone(), token.pos);
            self.advance();
            return Ok(found);
        }
        Err(self.unexpected("string"))
    }

    fn number(&mut self, after: CmpOp) -> Result<f64, ParseError> {
        if let TokenKind::Number(value) = *self.peek_kind() {
            self.advance();
            return Ok(value);
        }
        Err(self.unexpected(&format!("number after '{after}'")))
    }

    fn label_name(&mut self) -> Result<String, ParseError> {
        let pos = self.pos();
        let TokenKind::Ident(name) = self.peek_kind() else {
            return Err(self.unexpected("label name"));
        };
        if name.contains('.') && !self.opts.allow_dots {
            return Err(ParseError::new(
                pos,
                format!("label name {name:?} must not contain '.'"),
            ));
        }
        let name = name.clone();
        self.advance();
        Ok(name)
    }

    // ---- log expressions ----

    fn log_expr(&mut self) -> Result<LogExpr, ParseError> {
        let selector = self.selector()?;
        let pipeline = self.pipeline()?;
        Ok(LogExpr { selector, pipeline })
    }

    fn selector(&mut self) -> Result<Selector, ParseError> {
        let open = self.expect(TokenKind::LBrace)?;
        let mut matchers = Vec::new();
        while self.peek_kind() != &TokenKind::RBrace {
            matchers.push(self.matcher()?);
            if self.peek_kind() == &TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;

        if matchers.is_empty() {
            return Err(ParseError::new(
                open.pos,
                "selector must contain at least one label matcher",
            ));
        }
        Ok(Selector { matchers })
    }

    fn matcher(&mut self) -> Result<LabelMatcher, ParseError> {
        let label = self.label_name()?;
        let op = match self.peek_kind() {
            TokenKind::Eq => MatcherOp::Equal,
            TokenKind::Neq => MatcherOp::NotEqual,
            TokenKind::Re => MatcherOp::RegexMatch,
            TokenKind::Nre => MatcherOp::RegexNotMatch,
            _ => return Err(self.unexpected("one of '=', '!=', '=~', '!~'")),
        };
        self.advance();
        let (value, pos) = self.string()?;
        LabelMatcher::new(label, op, value)
            .map_err(|e| ParseError::new(pos, format!("invalid regex in label matcher: {e}")))
    }

    fn pipeline(&mut self) -> Result<Vec<PipelineStage>, ParseError> {
        let mut stages = Vec::new();
        loop {
            let filter_op = match self.peek_kind() {
                TokenKind::PipeExact => LineFilterOp::Contains,
                TokenKind::Neq => LineFilterOp::NotContains,
                TokenKind::PipeMatch => LineFilterOp::Match,
                TokenKind::Nre => LineFilterOp::NotMatch,
                TokenKind::Pipe => {
                    self.advance();
                    stages.push(self.pipe_stage()?);
                    continue;
                }
                _ => return Ok(stages),
            };
            self.advance();
            let (value, pos) = self.string()?;
            let filter = LineFilter::new(filter_op, value)
                .map_err(|e| ParseError::new(pos, format!("invalid regex in line filter: {e}")))?;
            stages.push(PipelineStage::LineFilter(filter));
        }
    }

    fn pipe_stage(&mut self) -> Result<PipelineStage, ParseError> {
        let next_is_comparison = matches!(
            self.peek_nth_kind(1),
            TokenKind::Eq
                | TokenKind::Neq
                | TokenKind::Re
                | TokenKind::Nre
                | TokenKind::CmpEq
                | TokenKind::Gt
                | TokenKind::Gte
                | TokenKind::Lt
                | TokenKind::Lte
        );
        let keyword = match self.peek_kind() {
            TokenKind::Ident(name) if !next_is_comparison => name.clone(),
            TokenKind::Ident(_) => return self.label_filter().map(PipelineStage::LabelFilter),
            _ => return Err(self.unexpected("'json', 'regexp' or a label filter")),
        };
        match keyword.as_str() {
            "json" => {
                self.advance();
                Ok(PipelineStage::Json)
            }
            "regexp" => {
                self.advance();
                self.regexp_stage().map(PipelineStage::Regexp)
            }
            _ => self.label_filter().map(PipelineStage::LabelFilter),
        }
    }

    fn regexp_stage(&mut self) -> Result<RegexpStage, ParseError> {
        let (pattern, pos) = self.string()?;
        let regex = Regex::new(&pattern)
            .map_err(|e| ParseError::new(pos, format!("invalid regexp stage: {e}")))?;

        let mapping: BTreeMap<usize, String> = regex
            .capture_names()
            .enumerate()
            .filter_map(|(idx, name)| name.map(|name| (idx, name.to_string())))
            .collect();
        if mapping.is_empty() {
            return Err(ParseError::new(
                pos,
                "regexp stage must contain at least one named capture group",
            ));
        }
        Ok(RegexpStage { regex, mapping })
    }

    fn label_filter(&mut self) -> Result<LabelPredicate, ParseError> {
        let label = self.label_name()?;
        let op_pos = self.pos();
        let op = self.peek_kind().clone();
        self.advance();

        let predicate = match op {
            TokenKind::CmpEq | TokenKind::Gt | TokenKind::Gte | TokenKind::Lt | TokenKind::Lte => {
                let cmp = match op {
                    TokenKind::CmpEq => CmpOp::Eq,
                    TokenKind::Gt => CmpOp::Gt,
                    TokenKind::Gte => CmpOp::Ge,
                    TokenKind::Lt => CmpOp::Lt,
                    _ => CmpOp::Le,
                };
                LabelPredicate::Number {
                    label,
                    op: cmp,
                    value: self.number(cmp)?,
                }
            }
            TokenKind::Neq if matches!(self.peek_kind(), TokenKind::Number(_)) => {
                LabelPredicate::Number {
                    label,
                    op: CmpOp::Ne,
                    value: self.number(CmpOp::Ne)?,
                }
            }
            TokenKind::Eq | TokenKind::Neq | TokenKind::Re | TokenKind::Nre => {
                let matcher_op = match op {
                    TokenKind::Eq => MatcherOp::Equal,
                    TokenKind::Neq => MatcherOp::NotEqual,
                    TokenKind::Re => MatcherOp::RegexMatch,
                    _ => MatcherOp::RegexNotMatch,
                };
                let (value, pos) = self.string()?;
                let matcher = LabelMatcher::new(label, matcher_op, value).map_err(|e| {
                    ParseError::new(pos, format!("invalid regex in label filter: {e}"))
                })?;
                LabelPredicate::Matcher(matcher)
            }
            other => {
                return Err(ParseError::new(
                    op_pos,
                    format!("unexpected {other}, expected a comparison operator"),
                ));
            }
        };
        Ok(predicate)
    }

    // ---- metric expressions ----

    fn binary_op(&self) -> Option<BinOp> {
        match self.peek_kind() {
            TokenKind::Add => Some(BinOp::Add),
            TokenKind::Sub => Some(BinOp::Sub),
            TokenKind::Mul => Some(BinOp::Mul),
            TokenKind::Div => Some(BinOp::Div),
            TokenKind::Mod => Some(BinOp::Mod),
            TokenKind::Pow => Some(BinOp::Pow),
            _ => None,
        }
    }

    fn metric_expr(&mut self, min_prec: u8) -> Result<MetricExpr, ParseError> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.binary_op() {
            let prec = op.precedence();
            if prec < min_prec {
                break;
            }
            self.advance();
            let next_min = if op.is_right_assoc() { prec } else { prec + 1 };
            let rhs = self.metric_expr(next_min)?;
            lhs = MetricExpr::binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<MetricExpr, ParseError> {
        match self.peek_kind() {
            TokenKind::Sub => {
                self.advance();
                let operand = self.metric_expr(BinOp::Pow.precedence())?;
                Ok(match operand {
                    MetricExpr::Literal(value) => MetricExpr::Literal(-value),
                    other => MetricExpr::binary(BinOp::Mul, MetricExpr::Literal(-1.0), other),
                })
            }
            TokenKind::Add => {
                self.advance();
                self.metric_expr(BinOp::Pow.precedence())
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<MetricExpr, ParseError> {
        let pos = self.pos();
        match self.peek_kind().clone() {
            TokenKind::Number(value) => {
                self.advance();
                Ok(MetricExpr::Literal(value))
            }
            TokenKind::LParen => {
                self.advance();
                let expr = self.metric_expr(0)?;
                self.expect(TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Ident(name) => {
                if let Some(value) = special_float(&name) {
                    self.advance();
                    return Ok(MetricExpr::Literal(value));
                }
                if name == "vector" {
                    self.advance();
                    return self.vector_literal();
                }
                if let Some(op) = RangeOp::from_name(&name) {
                    self.advance();
                    return self.range_aggregation(op);
                }
                if let Some(op) = AggregationOp::from_name(&name) {
                    self.advance();
                    return self.vector_aggregation(op);
                }
                Err(ParseError::new(pos, format!("unknown function {name:?}")))
            }
            TokenKind::LBrace => Err(ParseError::new(
                pos,
                "log selector is only allowed at the top level or inside a range aggregation",
            )),
            _ => Err(self.unexpected("number, '(' or function")),
        }
    }

    fn vector_literal(&mut self) -> Result<MetricExpr, ParseError> {
        self.expect(TokenKind::LParen)?;
        let pos = self.pos();
        let value = match self.metric_expr(0)? {
            MetricExpr::Literal(value) => value,
            _ => return Err(ParseError::new(pos, "vector() expects a number")),
        };
        self.expect(TokenKind::RParen)?;
        Ok(MetricExpr::Vector(value))
    }

    fn range(&mut self) -> Result<Duration, ParseError> {
        self.expect(TokenKind::LBracket)?;
        let pos = self.pos();
        let TokenKind::Duration(range) = *self.peek_kind() else {
            return Err(self.unexpected("duration"));
        };
        self.advance();
        self.expect(TokenKind::RBracket)?;
        if range.is_zero() {
            return Err(ParseError::new(pos, "range must be greater than zero"));
        }
        Ok(range)
    }

    fn range_aggregation(&mut self, op: RangeOp) -> Result<MetricExpr, ParseError> {
        self.expect(TokenKind::LParen)?;
        let selector = self.selector()?;

        // The range may follow the selector or close the pipeline.
        let mut range = None;
        if self.peek_kind() == &TokenKind::LBracket {
            range = Some(self.range()?);
        }
        let pipeline = self.pipeline()?;
        if self.peek_kind() == &TokenKind::LBracket {
            if range.is_some() {
                return Err(ParseError::new(self.pos(), "range specified twice"));
            }
            range = Some(self.range()?);
        }
        let Some(range) = range else {
            return Err(self.unexpected("range such as [5m]"));
        };
        self.expect(TokenKind::RParen)?;

        Ok(MetricExpr::RangeAggregation(RangeAggregation {
            op,
            range,
            expr: LogExpr { selector, pipeline },
        }))
    }

    fn grouping(&mut self) -> Result<Option<Grouping>, ParseError> {
        let without = match self.peek_kind() {
            TokenKind::Ident(name) if name == "by" => false,
            TokenKind::Ident(name) if name == "without" => true,
            _ => return Ok(None),
        };
        self.advance();
        self.expect(TokenKind::LParen)?;
        let mut labels = Vec::new();
        while self.peek_kind() != &TokenKind::RParen {
            labels.push(self.label_name()?);
            if self.peek_kind() == &TokenKind::Comma {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;
        Ok(Some(Grouping { without, labels }))
    }

    fn vector_aggregation(&mut self, op: AggregationOp) -> Result<MetricExpr, ParseError> {
        let mut grouping = self.grouping()?;
        self.expect(TokenKind::LParen)?;
        let expr = self.metric_expr(0)?;
        self.expect(TokenKind::RParen)?;

        let pos = self.pos();
        if let Some(trailing) = self.grouping()? {
            if grouping.is_some() {
                return Err(ParseError::new(pos, "grouping specified twice"));
            }
            grouping = Some(trailing);
        }

        Ok(MetricExpr::VectorAggregation(VectorAggregation {
            op,
            grouping,
            expr: Box::new(expr),
        }))
    }
}

fn special_float(name: &str) -> Option<f64> {
    match name.to_ascii_lowercase().as_str() {
        "inf" => Some(f64::INFINITY),
        "nan" => Some(f64::NAN),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_default(input: &str) -> Result<Expr, ParseError> {
        parse(input, ParseOptions::default())
    }

    fn metric(input: &str) -> MetricExpr {
        match parse_default(input).unwrap() {
            Expr::Metric(expr) => expr,
            Expr::Log(_) => panic!("expected metric expression for {input}"),
        }
    }

    fn lit(value: f64) -> MetricExpr {
        MetricExpr::Literal(value)
    }

    #[test]
    fn test_precedence() {
        assert_eq!(
            metric("2+3*4"),
            MetricExpr::binary(
                BinOp::Add,
                lit(2.0),
                MetricExpr::binary(BinOp::Mul, lit(3.0), lit(4.0))
            )
        );
        assert_eq!(
            metric("2^3^2"),
            MetricExpr::binary(
                BinOp::Pow,
                lit(2.0),
                MetricExpr::binary(BinOp::Pow, lit(3.0), lit(2.0))
            )
        );
        assert_eq!(
            metric("(2^3)^2"),
            MetricExpr::binary(
                BinOp::Pow,
                MetricExpr::binary(BinOp::Pow, lit(2.0), lit(3.0)),
                lit(2.0)
            )
        );
        assert_eq!(
            metric("8-2-1"),
            MetricExpr::binary(
                BinOp::Sub,
                MetricExpr::binary(BinOp::Sub, lit(8.0), lit(2.0)),
                lit(1.0)
            )
        );
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(metric("-3"), lit(-3.0));
        assert_eq!(
            metric("-2^2"),
            MetricExpr::binary(
                BinOp::Mul,
                lit(-1.0),
                MetricExpr::binary(BinOp::Pow, lit(2.0), lit(2.0))
            )
        );
        assert_eq!(
            metric("2^-1"),
            MetricExpr::binary(BinOp::Pow, lit(2.0), lit(-1.0))
        );
        assert_eq!(metric("vector(-1)"), MetricExpr::Vector(-1.0));
    }

    #[test]
    fn test_special_floats() {
        assert_eq!(metric("Inf"), lit(f64::INFINITY));
        assert_eq!(metric("-inf"), lit(f64::NEG_INFINITY));
        assert!(matches!(metric("NaN"), MetricExpr::Literal(v) if v.is_nan()));
    }

    #[test]
    fn test_log_query() {
        let expr = parse_default(
            r#"{container="api", level=~"warn|error"} |= "timeout" | json | status >= 500"#,
        )
        .unwrap();
        let Expr::Log(log) = expr else {
            panic!("expected log query");
        };

        assert_eq!(
            log.selector.matchers,
            vec![
                LabelMatcher::equal("container", "api"),
                LabelMatcher::new("level", MatcherOp::RegexMatch, "warn|error").unwrap(),
            ]
        );
        assert_eq!(
            log.pipeline,
            vec![
                PipelineStage::LineFilter(
                    LineFilter::new(LineFilterOp::Contains, "timeout").unwrap()
                ),
                PipelineStage::Json,
                PipelineStage::LabelFilter(LabelPredicate::Number {
                    label: "status".to_string(),
                    op: CmpOp::Ge,
                    value: 500.0,
                }),
            ]
        );
    }

    #[test]
    fn test_label_filter_string_and_numeric_not_equal() {
        let Expr::Log(log) =
            parse_default(r#"{app="web"} | level != "debug" | code != 404"#).unwrap()
        else {
            panic!("expected log query");
        };
        assert_eq!(
            log.pipeline,
            vec![
                PipelineStage::LabelFilter(LabelPredicate::Matcher(LabelMatcher::not_equal(
                    "level", "debug"
                ))),
                PipelineStage::LabelFilter(LabelPredicate::Number {
                    label: "code".to_string(),
                    op: CmpOp::Ne,
                    value: 404.0,
                }),
            ]
        );
    }

    #[test]
    fn test_regexp_stage_maps_named_groups() {
        let Expr::Log(log) =
            parse_default(r#"{app="web"} | regexp `(?P<method>\w+) (\S+) (?P<status>\d+)`"#)
                .unwrap()
        else {
            panic!("expected log query");
        };
        let PipelineStage::Regexp(stage) = &log.pipeline[0] else {
            panic!("expected regexp stage");
        };
        assert_eq!(
            stage.mapping,
            BTreeMap::from([(1, "method".to_string()), (3, "status".to_string())])
        );
    }

    #[test]
    fn test_regexp_stage_requires_named_group() {
        let err = parse_default(r#"{app="web"} | regexp "(\\d+)""#).unwrap_err();
        assert!(err.msg.contains("named capture group"), "{err}");
    }

    #[test]
    fn test_range_aggregation() {
        let expected = MetricExpr::RangeAggregation(RangeAggregation {
            op: RangeOp::CountOverTime,
            range: Duration::from_secs(300),
            expr: LogExpr {
                selector: Selector {
                    matchers: vec![LabelMatcher::equal("app", "web")],
                },
                pipeline: vec![PipelineStage::LineFilter(
                    LineFilter::new(LineFilterOp::Contains, "GET").unwrap(),
                )],
            },
        });
        assert_eq!(
            metric(r#"count_over_time({app="web"} |= "GET" [5m])"#),
            expected
        );
        assert_eq!(
            metric(r#"count_over_time({app="web"}[5m] |= "GET")"#),
            expected
        );
    }

    #[test]
    fn test_range_errors() {
        let err = parse_default(r#"rate({app="web"})"#).unwrap_err();
        assert!(err.msg.contains("range"), "{err}");

        let err = parse_default(r#"rate({app="web"}[0s])"#).unwrap_err();
        assert_eq!(err.msg, "range must be greater than zero");

        let err = parse_default(r#"rate({app="web"}[1m] [1m])"#).unwrap_err();
        assert_eq!(err.msg, "range specified twice");
    }

    #[test]
    fn test_vector_aggregation_grouping() {
        let inner = metric(r#"rate({app="web"}[1m])"#);
        let expected = MetricExpr::VectorAggregation(VectorAggregation {
            op: AggregationOp::Sum,
            grouping: Some(Grouping {
                without: false,
                labels: vec!["level".to_string()],
            }),
            expr: Box::new(inner),
        });

        assert_eq!(metric(r#"sum by (level) (rate({app="web"}[1m]))"#), expected);
        assert_eq!(metric(r#"sum(rate({app="web"}[1m])) by (level)"#), expected);

        let MetricExpr::VectorAggregation(agg) =
            metric(r#"max without (pod, node) (rate({app="web"}[1m]))"#)
        else {
            panic!("expected aggregation");
        };
        assert_eq!(
            agg.grouping,
            Some(Grouping {
                without: true,
                labels: vec!["pod".to_string(), "node".to_string()],
            })
        );

        let err = parse_default(r#"sum by (a) (vector(1)) by (b)"#).unwrap_err();
        assert_eq!(err.msg, "grouping specified twice");
    }

    #[test]
    fn test_dotted_label_names() {
        let query = r#"{service.name="checkout"}"#;
        let err = parse_default(query).unwrap_err();
        assert_eq!(err.pos.column, 2);

        let expr = parse(query, ParseOptions { allow_dots: true }).unwrap();
        let Expr::Log(log) = expr else {
            panic!("expected log query");
        };
        assert_eq!(log.selector.matchers[0].label, "service.name");
    }

    #[test]
    fn test_errors_carry_position() {
        let err = parse_default(r#"{app="web"} |= "a" +"#).unwrap_err();
        assert_eq!(err.pos.column, 20);

        let err = parse_default("2 +\n  )").unwrap_err();
        assert_eq!((err.pos.line, err.pos.column), (2, 3));
        assert_eq!(err.to_string(), "2:3: unexpected ')', expected number, '(' or function");

        let err = parse_default("{}").unwrap_err();
        assert_eq!(err.msg, "selector must contain at least one label matcher");

        let err = parse_default(r#"{app=~"(api"}"#).unwrap_err();
        assert_eq!(err.pos.column, 7);
        assert!(err.msg.starts_with("invalid regex"));

        let err = parse_default("rate(1)").unwrap_err();
        assert_eq!(err.pos.column, 6);

        let err = parse_default("foo(1)").unwrap_err();
        assert_eq!(err.msg, r#"unknown function "foo""#);
    }
}
