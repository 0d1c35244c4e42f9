//! PromQL parser.
//!
//! Parses the accepted PromQL subset into a [`LogicalPlan`] against the
//! query's `(start, step, end)` grid:
//!
//! ```promql
//! # Selectors
//! http_requests_total
//! http_requests_total{job="api", instance=~"h.*"}
//!
//! # Range functions and aggregation
//! rate(http_requests_total[5m])
//! sum by (job) (rate(http_requests_total[5m] offset 1h))
//!
//! # Binary operators, set operators, subqueries
//! a / on(host) group_left(role) b
//! up and errors
//! max_over_time(rate(reqs[1m])[10m:30s])
//! ```
//!
//! The `@` modifier is rejected. Parse failures surface as
//! [`QueryError::BadQuery`].

use crate::error::QueryError;
use crate::query::filter::{ColumnFilter, Filter};
use crate::query::logical::{
    AggParam, AggregationOperator, BinaryOperator, Cardinality, InstantFunctionId, LogicalPlan,
    RangeFunctionId, SetOperator,
};
use crate::types::{TimeRange, METRIC_COLUMN, PROM_METRIC_LABEL};
use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt, value},
    multi::{many0, separated_list0, separated_list1},
    number::complete::double,
    sequence::{delimited, preceded},
    IResult, Parser,
};

/// Query grid the plan evaluates on.
#[derive(Debug, Clone, Copy)]
pub struct QueryParams {
    /// Grid start, epoch seconds.
    pub start_secs: i64,
    /// Grid step, seconds. Zero for instant queries.
    pub step_secs: i64,
    /// Grid end, epoch seconds.
    pub end_secs: i64,
}

impl QueryParams {
    fn start_ms(&self) -> i64 {
        self.start_secs * 1000
    }
    fn step_ms(&self) -> i64 {
        self.step_secs * 1000
    }
    fn end_ms(&self) -> i64 {
        self.end_secs * 1000
    }
}

/// Parse a PromQL query into a logical plan.
pub fn parse_promql(query: &str, params: QueryParams) -> Result<LogicalPlan, QueryError> {
    let expr = match parse_expr(query.trim()) {
        Ok((rest, expr)) if rest.trim().is_empty() => expr,
        Ok((rest, _)) => {
            return Err(QueryError::bad_query(format!(
                "unexpected trailing input: '{}'",
                rest.trim()
            )))
        }
        Err(e) => return Err(QueryError::bad_query(format!("parse error: {e:?}"))),
    };
    to_logical(expr, params)
}

// ============================================================================
// Expression AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum MatchOp {
    Eq,
    Neq,
    Re,
    NotRe,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Str(String),
    Selector {
        metric: Option<String>,
        matchers: Vec<(String, MatchOp, String)>,
        window_ms: Option<i64>,
        offset_ms: Option<i64>,
    },
    Call {
        func: String,
        args: Vec<Expr>,
    },
    Aggregate {
        op: String,
        by: Vec<String>,
        without: Vec<String>,
        args: Vec<Expr>,
    },
    Binary {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        on: Vec<String>,
        ignoring: Vec<String>,
        group_left: Option<Vec<String>>,
        group_right: Option<Vec<String>>,
    },
    Subquery {
        expr: Box<Expr>,
        window_ms: i64,
        step_ms: i64,
        offset_ms: Option<i64>,
    },
}

// ============================================================================
// Lexical helpers
// ============================================================================

fn ws<'a, O>(
    inner: impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>>,
) -> impl Parser<&'a str, Output = O, Error = nom::error::Error<&'a str>> {
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ':').parse(input)
}

fn label_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_').parse(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
    map(
        delimited(char('"'), take_while(|c| c != '"'), char('"')),
        |s: &str| s.to_string(),
    )
    .parse(input)
}

/// A single-unit duration like `5m`, `90s` or `1d`.
fn duration_ms(input: &str) -> IResult<&str, i64> {
    let (input, n) = take_while1(|c: char| c.is_ascii_digit()).parse(input)?;
    let (input, unit) = alt((
        tag("ms"),
        tag("s"),
        tag("m"),
        tag("h"),
        tag("d"),
        tag("w"),
        tag("y"),
    ))
    .parse(input)?;
    let n: i64 = n.parse().map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Digit))
    })?;
    let ms = match unit {
        "ms" => n,
        "s" => n * 1_000,
        "m" => n * 60_000,
        "h" => n * 3_600_000,
        "d" => n * 86_400_000,
        "w" => n * 7 * 86_400_000,
        "y" => n * 365 * 86_400_000,
        _ => unreachable!(),
    };
    Ok((input, ms))
}

fn label_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), map(label_name, String::from)),
        ws(char(')')),
    )
    .parse(input)
}

// ============================================================================
// Selector
// ============================================================================

fn match_op(input: &str) -> IResult<&str, MatchOp> {
    alt((
        value(MatchOp::Re, tag("=~")),
        value(MatchOp::NotRe, tag("!~")),
        value(MatchOp::Neq, tag("!=")),
        value(MatchOp::Eq, tag("=")),
    ))
    .parse(input)
}

fn matcher(input: &str) -> IResult<&str, (String, MatchOp, String)> {
    let (input, name) = ws(label_name).parse(input)?;
    let (input, op) = ws(match_op).parse(input)?;
    let (input, value) = ws(string_literal).parse(input)?;
    Ok((input, (name.to_string(), op, value)))
}

fn matcher_block(input: &str) -> IResult<&str, Vec<(String, MatchOp, String)>> {
    delimited(
        char('{'),
        separated_list0(ws(char(',')), matcher),
        ws(char('}')),
    )
    .parse(input)
}

fn offset_modifier(input: &str) -> IResult<&str, i64> {
    preceded((multispace0, tag("offset"), multispace0), duration_ms).parse(input)
}

#[derive(Debug, Clone, Copy)]
enum BracketSuffix {
    Window(i64),
    Subquery(i64, i64),
}

fn bracket_suffix(input: &str) -> IResult<&str, BracketSuffix> {
    let (input, _) = char('[').parse(input)?;
    let (input, window_ms) = duration_ms(input)?;
    let (input, step_ms) = opt(preceded(char(':'), duration_ms)).parse(input)?;
    let (input, _) = char(']').parse(input)?;
    Ok((
        input,
        match step_ms {
            Some(step_ms) => BracketSuffix::Subquery(window_ms, step_ms),
            None => BracketSuffix::Window(window_ms),
        },
    ))
}

fn selector(input: &str) -> IResult<&str, Expr> {
    let (input, metric) = opt(identifier).parse(input)?;
    let (input, matchers) = if metric.is_some() {
        opt(matcher_block).parse(input)?
    } else {
        map(matcher_block, Some).parse(input)?
    };
    let (input, suffix) = opt(bracket_suffix).parse(input)?;
    let (input, offset_ms) = opt(offset_modifier).parse(input)?;
    let expr = match suffix {
        Some(BracketSuffix::Subquery(window_ms, step_ms)) => Expr::Subquery {
            expr: Box::new(Expr::Selector {
                metric: metric.map(String::from),
                matchers: matchers.unwrap_or_default(),
                window_ms: None,
                offset_ms: None,
            }),
            window_ms,
            step_ms,
            offset_ms,
        },
        Some(BracketSuffix::Window(window_ms)) => Expr::Selector {
            metric: metric.map(String::from),
            matchers: matchers.unwrap_or_default(),
            window_ms: Some(window_ms),
            offset_ms,
        },
        None => Expr::Selector {
            metric: metric.map(String::from),
            matchers: matchers.unwrap_or_default(),
            window_ms: None,
            offset_ms,
        },
    };
    Ok((input, expr))
}

// ============================================================================
// Calls and aggregations
// ============================================================================

const AGGREGATION_OPS: &[&str] = &[
    "sum",
    "avg",
    "count_values",
    "count",
    "group",
    "min",
    "max",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "quantile",
];

fn call_args(input: &str) -> IResult<&str, Vec<Expr>> {
    delimited(
        ws(char('(')),
        separated_list1(ws(char(',')), alt((map(string_literal, Expr::Str), parse_expr))),
        ws(char(')')),
    )
    .parse(input)
}

fn aggregate_expr(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    if !AGGREGATION_OPS.contains(&name) {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }
    // Grouping may appear before or after the argument list.
    let (rest, pre_by) = opt(preceded(ws(tag("by")), label_list)).parse(rest)?;
    let (rest, pre_without) = opt(preceded(ws(tag("without")), label_list)).parse(rest)?;
    let (rest, args) = call_args(rest)?;
    let (rest, post_by) = opt(preceded(ws(tag("by")), label_list)).parse(rest)?;
    let (rest, post_without) = opt(preceded(ws(tag("without")), label_list)).parse(rest)?;
    Ok((
        rest,
        Expr::Aggregate {
            op: name.to_string(),
            by: pre_by.or(post_by).unwrap_or_default(),
            without: pre_without.or(post_without).unwrap_or_default(),
            args,
        },
    ))
}

fn function_call(input: &str) -> IResult<&str, Expr> {
    let (rest, name) = identifier(input)?;
    let (rest, args) = call_args(rest)?;
    // A call result can be a subquery body: f(...)[10m:30s]
    let (rest, sub) = opt(subquery_suffix).parse(rest)?;
    let call = Expr::Call {
        func: name.to_string(),
        args,
    };
    Ok((
        rest,
        match sub {
            Some((window_ms, step_ms, offset_ms)) => Expr::Subquery {
                expr: Box::new(call),
                window_ms,
                step_ms,
                offset_ms,
            },
            None => call,
        },
    ))
}

fn subquery_suffix(input: &str) -> IResult<&str, (i64, i64, Option<i64>)> {
    let (input, _) = char('[').parse(input)?;
    let (input, window_ms) = duration_ms(input)?;
    let (input, _) = char(':').parse(input)?;
    let (input, step_ms) = duration_ms(input)?;
    let (input, _) = char(']').parse(input)?;
    let (input, offset_ms) = opt(offset_modifier).parse(input)?;
    Ok((input, (window_ms, step_ms, offset_ms)))
}

fn paren_expr(input: &str) -> IResult<&str, Expr> {
    delimited(ws(char('(')), parse_expr, ws(char(')'))).parse(input)
}

fn atom(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            paren_expr,
            aggregate_expr,
            function_call,
            map(double_literal, Expr::Number),
            selector,
        )),
    )
    .parse(input)
}

/// A numeric literal that is not the start of a duration or identifier.
fn double_literal(input: &str) -> IResult<&str, f64> {
    let (rest, n) = double(input)?;
    if rest
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic())
        .unwrap_or(false)
    {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Float,
        )));
    }
    Ok((rest, n))
}

// ============================================================================
// Binary operators with precedence
// ============================================================================

#[derive(Debug, Default)]
struct BinModifiers {
    on: Vec<String>,
    ignoring: Vec<String>,
    group_left: Option<Vec<String>>,
    group_right: Option<Vec<String>>,
}

fn bin_modifiers(input: &str) -> IResult<&str, BinModifiers> {
    let (input, on) = opt(preceded(ws(tag("on")), label_list)).parse(input)?;
    let (input, ignoring) = opt(preceded(ws(tag("ignoring")), label_list)).parse(input)?;
    let (input, group_left) = opt(preceded(
        ws(tag("group_left")),
        opt(label_list),
    ))
    .parse(input)?;
    let (input, group_right) = opt(preceded(
        ws(tag("group_right")),
        opt(label_list),
    ))
    .parse(input)?;
    Ok((
        input,
        BinModifiers {
            on: on.unwrap_or_default(),
            ignoring: ignoring.unwrap_or_default(),
            group_left: group_left.map(|l| l.unwrap_or_default()),
            group_right: group_right.map(|l| l.unwrap_or_default()),
        },
    ))
}

fn binary_level<'a>(
    ops: &'static [&'static str],
    next: fn(&'a str) -> IResult<&'a str, Expr>,
) -> impl Parser<&'a str, Output = Expr, Error = nom::error::Error<&'a str>> {
    map(
        (
            next,
            many0((
                ws(move |i: &'a str| {
                    for op in ops {
                        if let Some(rest) = i.strip_prefix(op) {
                            return Ok((rest, *op));
                        }
                    }
                    Err(nom::Err::Error(nom::error::Error::new(
                        i,
                        nom::error::ErrorKind::Tag,
                    )))
                }),
                bin_modifiers,
                next,
            )),
        ),
        |(first, rest)| {
            rest.into_iter().fold(first, |lhs, (op, mods, rhs)| Expr::Binary {
                op: op.to_string(),
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                on: mods.on,
                ignoring: mods.ignoring,
                group_left: mods.group_left,
                group_right: mods.group_right,
            })
        },
    )
}

fn pow_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(&["^"], atom).parse(input)
}

fn muldiv_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(&["*", "/", "%"], pow_expr).parse(input)
}

fn addsub_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(&["+", "-"], muldiv_expr).parse(input)
}

fn compare_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(&["==", "!=", ">=", "<=", ">", "<"], addsub_expr).parse(input)
}

fn and_unless_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(&["and", "unless"], compare_expr).parse(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    binary_level(&["or"], and_unless_expr).parse(input)
}

fn parse_expr(input: &str) -> IResult<&str, Expr> {
    or_expr(input)
}

// ============================================================================
// AST to logical plan
// ============================================================================

fn range_function(name: &str) -> Option<RangeFunctionId> {
    Some(match name {
        "rate" => RangeFunctionId::Rate,
        "increase" => RangeFunctionId::Increase,
        "delta" => RangeFunctionId::Delta,
        "avg_over_time" => RangeFunctionId::AvgOverTime,
        "min_over_time" => RangeFunctionId::MinOverTime,
        "max_over_time" => RangeFunctionId::MaxOverTime,
        "sum_over_time" => RangeFunctionId::SumOverTime,
        "count_over_time" => RangeFunctionId::CountOverTime,
        "stddev_over_time" => RangeFunctionId::StddevOverTime,
        "last_over_time" => RangeFunctionId::LastOverTime,
        "quantile_over_time" => RangeFunctionId::QuantileOverTime,
        "holt_winters" => RangeFunctionId::HoltWinters,
        "predict_linear" => RangeFunctionId::PredictLinear,
        "deriv" => RangeFunctionId::Deriv,
        "changes" => RangeFunctionId::Changes,
        "resets" => RangeFunctionId::Resets,
        "absent_over_time" => RangeFunctionId::AbsentOverTime,
        _ => return None,
    })
}

fn instant_function(name: &str) -> Option<InstantFunctionId> {
    Some(match name {
        "abs" => InstantFunctionId::Abs,
        "ceil" => InstantFunctionId::Ceil,
        "floor" => InstantFunctionId::Floor,
        "exp" => InstantFunctionId::Exp,
        "ln" => InstantFunctionId::Ln,
        "log2" => InstantFunctionId::Log2,
        "log10" => InstantFunctionId::Log10,
        "sqrt" => InstantFunctionId::Sqrt,
        "round" => InstantFunctionId::Round,
        "sgn" => InstantFunctionId::Sgn,
        "clamp_min" => InstantFunctionId::ClampMin,
        "clamp_max" => InstantFunctionId::ClampMax,
        "histogram_quantile" => InstantFunctionId::HistogramQuantile,
        "histogram_max_quantile" => InstantFunctionId::HistogramMaxQuantile,
        "histogram_bucket" => InstantFunctionId::HistogramBucket,
        "hour" => InstantFunctionId::Hour,
        "minute" => InstantFunctionId::Minute,
        "day_of_month" => InstantFunctionId::DayOfMonth,
        "day_of_week" => InstantFunctionId::DayOfWeek,
        "day_of_year" => InstantFunctionId::DayOfYear,
        "month" => InstantFunctionId::Month,
        "year" => InstantFunctionId::Year,
        "days_in_month" => InstantFunctionId::DaysInMonth,
        _ => return None,
    })
}

fn aggregation_operator(name: &str) -> Result<AggregationOperator, QueryError> {
    Ok(match name {
        "sum" => AggregationOperator::Sum,
        "avg" => AggregationOperator::Avg,
        "count" => AggregationOperator::Count,
        "group" => AggregationOperator::Group,
        "min" => AggregationOperator::Min,
        "max" => AggregationOperator::Max,
        "stddev" => AggregationOperator::Stddev,
        "stdvar" => AggregationOperator::Stdvar,
        "topk" => AggregationOperator::TopK,
        "bottomk" => AggregationOperator::BottomK,
        "count_values" => AggregationOperator::CountValues,
        "quantile" => AggregationOperator::Quantile,
        other => return Err(QueryError::bad_query(format!("unknown aggregation '{other}'"))),
    })
}

fn binary_operator(op: &str) -> Option<BinaryOperator> {
    Some(match op {
        "+" => BinaryOperator::Add,
        "-" => BinaryOperator::Sub,
        "*" => BinaryOperator::Mul,
        "/" => BinaryOperator::Div,
        "%" => BinaryOperator::Mod,
        "^" => BinaryOperator::Pow,
        "==" => BinaryOperator::Eql,
        "!=" => BinaryOperator::Neq,
        ">" => BinaryOperator::Gtr,
        "<" => BinaryOperator::Lss,
        ">=" => BinaryOperator::Gte,
        "<=" => BinaryOperator::Lte,
        _ => return None,
    })
}

fn selector_filters(
    metric: Option<String>,
    matchers: Vec<(String, MatchOp, String)>,
) -> Result<Vec<ColumnFilter>, QueryError> {
    let mut filters = Vec::new();
    if let Some(metric) = metric {
        filters.push(ColumnFilter::equals(METRIC_COLUMN, metric));
    }
    for (name, op, value) in matchers {
        let column = if name == PROM_METRIC_LABEL {
            METRIC_COLUMN.to_string()
        } else {
            name
        };
        let filter = match op {
            MatchOp::Eq => Filter::Equals(value),
            MatchOp::Neq => Filter::NotEquals(value),
            MatchOp::Re => Filter::EqualsRegex(value),
            MatchOp::NotRe => Filter::NotEqualsRegex(value),
        };
        filters.push(ColumnFilter::new(column, filter));
    }
    if filters.is_empty() {
        return Err(QueryError::bad_query(
            "selector needs a metric name or at least one matcher",
        ));
    }
    Ok(filters)
}

fn to_logical(expr: Expr, params: QueryParams) -> Result<LogicalPlan, QueryError> {
    if let Some(plan) = to_vector_plan(&expr, params)? {
        return Ok(plan);
    }
    Err(QueryError::bad_query(format!(
        "expression does not produce an instant vector: {expr:?}"
    )))
}

/// Convert an expression into a periodic plan; `None` for scalar leaves,
/// which only make sense as binary operands.
fn to_vector_plan(expr: &Expr, params: QueryParams) -> Result<Option<LogicalPlan>, QueryError> {
    match expr {
        Expr::Number(_) | Expr::Str(_) => Ok(None),
        Expr::Selector {
            metric,
            matchers,
            window_ms,
            offset_ms,
        } => {
            if window_ms.is_some() {
                return Err(QueryError::bad_query(
                    "range vector selector needs a range function around it",
                ));
            }
            let filters = selector_filters(metric.clone(), matchers.clone())?;
            Ok(Some(LogicalPlan::PeriodicSeries {
                raw: Box::new(LogicalPlan::RawSeries {
                    filters,
                    range: TimeRange::new(params.start_ms(), params.end_ms()),
                    column: None,
                }),
                start_ms: params.start_ms(),
                step_ms: params.step_ms(),
                end_ms: params.end_ms(),
                offset_ms: *offset_ms,
            }))
        }
        Expr::Call { func, args } => to_call_plan(func, args, params).map(Some),
        Expr::Aggregate {
            op,
            by,
            without,
            args,
        } => {
            let operator = aggregation_operator(op)?;
            let (params_exprs, vector_expr) = match args.split_last() {
                Some((last, rest)) => (rest, last),
                None => return Err(QueryError::bad_query("aggregation needs an argument")),
            };
            let agg_params = params_exprs
                .iter()
                .map(|e| match e {
                    Expr::Number(n) => Ok(AggParam::Number(*n)),
                    Expr::Str(s) => Ok(AggParam::Text(s.clone())),
                    other => Err(QueryError::bad_query(format!(
                        "aggregation parameter must be a literal, got {other:?}"
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let inner = to_vector_plan(vector_expr, params)?.ok_or_else(|| {
                QueryError::bad_query("aggregation argument must be an instant vector")
            })?;
            Ok(Some(LogicalPlan::Aggregate {
                operator,
                inner: Box::new(inner),
                params: agg_params,
                by: by.clone(),
                without: without.clone(),
            }))
        }
        Expr::Binary {
            op,
            lhs,
            rhs,
            on,
            ignoring,
            group_left,
            group_right,
        } => {
            let lhs_plan = to_vector_plan(lhs, params)?;
            let rhs_plan = to_vector_plan(rhs, params)?;
            if let Some(set_op) = match op.as_str() {
                "and" => Some(SetOperator::And),
                "or" => Some(SetOperator::Or),
                "unless" => Some(SetOperator::Unless),
                _ => None,
            } {
                let (Some(l), Some(r)) = (lhs_plan, rhs_plan) else {
                    return Err(QueryError::bad_query("set operands must be vectors"));
                };
                return Ok(Some(LogicalPlan::SetOp {
                    lhs: Box::new(l),
                    rhs: Box::new(r),
                    operator: set_op,
                    on: on.clone(),
                    ignoring: ignoring.clone(),
                }));
            }
            let operator = binary_operator(op)
                .ok_or_else(|| QueryError::bad_query(format!("unknown operator '{op}'")))?;
            match (lhs_plan, rhs_plan) {
                (Some(l), Some(r)) => {
                    let (cardinality, include) = match (group_left, group_right) {
                        (Some(include), None) => (Cardinality::ManyToOne, include.clone()),
                        (None, Some(include)) => (Cardinality::OneToMany, include.clone()),
                        (None, None) => (Cardinality::OneToOne, Vec::new()),
                        _ => {
                            return Err(QueryError::bad_query(
                                "group_left and group_right are mutually exclusive",
                            ))
                        }
                    };
                    Ok(Some(LogicalPlan::BinaryJoin {
                        lhs: Box::new(l),
                        rhs: Box::new(r),
                        operator,
                        cardinality,
                        on: on.clone(),
                        ignoring: ignoring.clone(),
                        include,
                    }))
                }
                (Some(vector), None) => {
                    let Expr::Number(scalar) = **rhs else {
                        return Err(QueryError::bad_query("scalar operand must be a number"));
                    };
                    Ok(Some(LogicalPlan::ScalarVectorBinaryOperation {
                        scalar,
                        vector: Box::new(vector),
                        operator,
                        scalar_is_lhs: false,
                    }))
                }
                (None, Some(vector)) => {
                    let Expr::Number(scalar) = **lhs else {
                        return Err(QueryError::bad_query("scalar operand must be a number"));
                    };
                    Ok(Some(LogicalPlan::ScalarVectorBinaryOperation {
                        scalar,
                        vector: Box::new(vector),
                        operator,
                        scalar_is_lhs: true,
                    }))
                }
                (None, None) => Err(QueryError::bad_query(
                    "scalar-scalar arithmetic is not a vector expression",
                )),
            }
        }
        Expr::Subquery { .. } => Err(QueryError::bad_query(
            "subquery needs a range function around it",
        )),
    }
}

fn split_call_args(args: &[Expr]) -> (Vec<f64>, Option<&Expr>) {
    let mut scalars = Vec::new();
    let mut vector = None;
    for arg in args {
        match arg {
            Expr::Number(n) => scalars.push(*n),
            other => vector = Some(other),
        }
    }
    (scalars, vector)
}

fn to_call_plan(func: &str, args: &[Expr], params: QueryParams) -> Result<LogicalPlan, QueryError> {
    let (scalar_args, vector_arg) = split_call_args(args);

    if let Some(function) = range_function(func) {
        let arg = vector_arg
            .ok_or_else(|| QueryError::bad_query(format!("{func} needs a range argument")))?;
        match arg {
            Expr::Selector {
                metric,
                matchers,
                window_ms: Some(window_ms),
                offset_ms,
            } => {
                let filters = selector_filters(metric.clone(), matchers.clone())?;
                return Ok(LogicalPlan::PeriodicSeriesWithWindowing {
                    raw: Box::new(LogicalPlan::RawSeries {
                        filters,
                        range: TimeRange::new(params.start_ms(), params.end_ms()),
                        column: None,
                    }),
                    start_ms: params.start_ms(),
                    step_ms: params.step_ms(),
                    end_ms: params.end_ms(),
                    window_ms: *window_ms,
                    function,
                    function_args: scalar_args,
                    offset_ms: *offset_ms,
                });
            }
            Expr::Subquery {
                expr,
                window_ms,
                step_ms,
                offset_ms,
            } => {
                let inner = to_vector_plan(expr, params)?.ok_or_else(|| {
                    QueryError::bad_query("subquery body must be an instant vector")
                })?;
                return Ok(LogicalPlan::SubqueryWithWindowing {
                    inner: Box::new(inner),
                    function,
                    function_args: scalar_args,
                    window_ms: *window_ms,
                    step_ms: *step_ms,
                    offset_ms: *offset_ms,
                });
            }
            other => {
                return Err(QueryError::bad_query(format!(
                    "{func} needs a range vector, got {other:?}"
                )))
            }
        }
    }

    if func == "absent" {
        let arg = vector_arg
            .ok_or_else(|| QueryError::bad_query("absent needs a vector argument"))?;
        let inner = to_vector_plan(arg, params)?
            .ok_or_else(|| QueryError::bad_query("absent argument must be a vector"))?;
        let filters = inner.leaf_filters();
        return Ok(LogicalPlan::ApplyAbsentFunction {
            vectors: Box::new(inner),
            filters,
            start_ms: params.start_ms(),
            step_ms: params.step_ms(),
            end_ms: params.end_ms(),
        });
    }

    if let Some(function) = instant_function(func) {
        let arg = vector_arg
            .ok_or_else(|| QueryError::bad_query(format!("{func} needs a vector argument")))?;
        let inner = to_vector_plan(arg, params)?
            .ok_or_else(|| QueryError::bad_query(format!("{func} argument must be a vector")))?;
        return Ok(LogicalPlan::ApplyInstantFunction {
            vectors: Box::new(inner),
            function,
            args: scalar_args,
        });
    }

    Err(QueryError::bad_query(format!("unknown function '{func}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> QueryParams {
        QueryParams {
            start_secs: 1000,
            step_secs: 10,
            end_secs: 2000,
        }
    }

    #[test]
    fn test_plain_selector() {
        let plan = parse_promql("http_requests_total{job=\"api\"}", params()).unwrap();
        match plan {
            LogicalPlan::PeriodicSeries { raw, start_ms, end_ms, .. } => {
                assert_eq!(start_ms, 1_000_000);
                assert_eq!(end_ms, 2_000_000);
                let filters = raw.leaf_filters();
                assert!(filters.contains(&ColumnFilter::equals(METRIC_COLUMN, "http_requests_total")));
                assert!(filters.contains(&ColumnFilter::equals("job", "api")));
            }
            other => panic!("expected periodic series, got {other:?}"),
        }
    }

    #[test]
    fn test_name_matcher_canonicalized() {
        let plan = parse_promql("{__name__=\"foo\", _ws_=\"demo\"}", params()).unwrap();
        let filters = plan.leaf_filters();
        assert!(filters.contains(&ColumnFilter::equals(METRIC_COLUMN, "foo")));
    }

    #[test]
    fn test_rate_with_window_and_offset() {
        let plan = parse_promql("rate(reqs[5m] offset 1h)", params()).unwrap();
        match plan {
            LogicalPlan::PeriodicSeriesWithWindowing {
                window_ms,
                function,
                offset_ms,
                ..
            } => {
                assert_eq!(window_ms, 300_000);
                assert_eq!(function, RangeFunctionId::Rate);
                assert_eq!(offset_ms, Some(3_600_000));
            }
            other => panic!("expected windowed plan, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_with_by() {
        let plan = parse_promql("sum by (job) (rate(reqs[5m]))", params()).unwrap();
        match plan {
            LogicalPlan::Aggregate { operator, by, .. } => {
                assert_eq!(operator, AggregationOperator::Sum);
                assert_eq!(by, vec!["job".to_string()]);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_topk_parameter() {
        let plan = parse_promql("topk(5, reqs)", params()).unwrap();
        match plan {
            LogicalPlan::Aggregate { operator, params, .. } => {
                assert_eq!(operator, AggregationOperator::TopK);
                assert_eq!(params, vec![AggParam::Number(5.0)]);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_binary_join_with_modifiers() {
        let plan = parse_promql("a / on(host) group_left(role) b", params()).unwrap();
        match plan {
            LogicalPlan::BinaryJoin {
                operator,
                cardinality,
                on,
                include,
                ..
            } => {
                assert_eq!(operator, BinaryOperator::Div);
                assert_eq!(cardinality, Cardinality::ManyToOne);
                assert_eq!(on, vec!["host".to_string()]);
                assert_eq!(include, vec!["role".to_string()]);
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn test_set_operator() {
        let plan = parse_promql("up and errors", params()).unwrap();
        assert!(matches!(
            plan,
            LogicalPlan::SetOp {
                operator: SetOperator::And,
                ..
            }
        ));
    }

    #[test]
    fn test_scalar_vector_operation() {
        let plan = parse_promql("reqs * 2", params()).unwrap();
        match plan {
            LogicalPlan::ScalarVectorBinaryOperation {
                scalar,
                operator,
                scalar_is_lhs,
                ..
            } => {
                assert_eq!(scalar, 2.0);
                assert_eq!(operator, BinaryOperator::Mul);
                assert!(!scalar_is_lhs);
            }
            other => panic!("expected scalar operation, got {other:?}"),
        }
    }

    #[test]
    fn test_subquery() {
        let plan = parse_promql("max_over_time(rate(reqs[1m])[10m:30s])", params()).unwrap();
        match plan {
            LogicalPlan::SubqueryWithWindowing {
                function,
                window_ms,
                step_ms,
                ..
            } => {
                assert_eq!(function, RangeFunctionId::MaxOverTime);
                assert_eq!(window_ms, 600_000);
                assert_eq!(step_ms, 30_000);
            }
            other => panic!("expected subquery, got {other:?}"),
        }
    }

    #[test]
    fn test_histogram_quantile() {
        let plan = parse_promql("histogram_quantile(0.9, lat_bucket)", params()).unwrap();
        match plan {
            LogicalPlan::ApplyInstantFunction { function, args, .. } => {
                assert_eq!(function, InstantFunctionId::HistogramQuantile);
                assert_eq!(args, vec![0.9]);
            }
            other => panic!("expected instant function, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_failures_are_bad_query() {
        for bad in [
            "sum(",
            "reqs[5m]",
            "unknown_fn(reqs)",
            "5 + 5",
            "",
        ] {
            let err = parse_promql(bad, params()).unwrap_err();
            assert!(
                matches!(err, QueryError::BadQuery(_)),
                "query '{bad}' gave {err:?}"
            );
        }
    }

    #[test]
    fn test_subquery_over_bare_selector() {
        let plan = parse_promql("max_over_time(up[10m:30s])", params()).unwrap();
        match plan {
            LogicalPlan::SubqueryWithWindowing { inner, window_ms, .. } => {
                assert_eq!(window_ms, 600_000);
                assert!(matches!(*inner, LogicalPlan::PeriodicSeries { .. }));
            }
            other => panic!("expected subquery, got {other:?}"),
        }
    }

    #[test]
    fn test_at_modifier_rejected() {
        let err = parse_promql("foo @ 1609746000", params()).unwrap_err();
        assert!(matches!(err, QueryError::BadQuery(_)));
    }

    #[test]
    fn test_count_values_label_param() {
        let plan = parse_promql("count_values(\"code\", reqs)", params()).unwrap();
        match plan {
            LogicalPlan::Aggregate { operator, params, .. } => {
                assert_eq!(operator, AggregationOperator::CountValues);
                assert_eq!(params, vec![AggParam::Text("code".to_string())]);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }
}
