//! Filter predicates evaluated in memory against a fact's JSON view.
//!
//! Filters use SQL `WHERE` syntax and are parsed with `sqlparser`, then
//! compiled into a predicate tree. Columns are paths rooted at `header` or
//! `payload`:
//!
//! ```text
//! payload.amount > 100 AND header.meta.region LIKE 'eu-%'
//! NOT payload.gift OR payload.items[0] IN ('a', 'b')
//! header.type REGEXP '^Order(Placed|Paid)$'
//! payload.note IS NULL
//! ```
//!
//! A bare path is true when it exists and is neither `null` nor `false`.

use crate::error::{Result, StoreError};
use regex::Regex;
use serde_json::Value;
use sqlparser::ast::{
    AccessExpr, BinaryOperator, Expr as SqlExpr, Subscript, UnaryOperator, Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use std::cmp::Ordering;

/// A parsed filter predicate.
#[derive(Clone, Debug)]
pub struct FilterExpr {
    source: String,
    root: Predicate,
}

impl FilterExpr {
    /// Parse a predicate. Malformed input is an `InvalidFilter` error.
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: String| StoreError::InvalidFilter {
            filter: source.to_string(),
            reason,
        };

        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(source)
            .map_err(|e| invalid(e.to_string()))?;
        let expr = parser.parse_expr().map_err(|e| invalid(e.to_string()))?;
        let trailing = parser.peek_token();
        if trailing.token != Token::EOF {
            return Err(invalid(format!("unexpected trailing token {}", trailing.token)));
        }

        let root = compile(&expr).map_err(invalid)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against `{ "header": .., "payload": .. }`.
    pub fn evaluate(&self, view: &Value) -> bool {
        self.root.eval(view)
    }
}

#[derive(Clone, Debug)]
enum Predicate {
    Or(Box<Predicate>, Box<Predicate>),
    And(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Truthy(Path),
    IsNull(Path),
    Compare { path: Path, op: CmpOp, literal: Value },
    InList { path: Path, list: Vec<Value> },
    Between { path: Path, low: Value, high: Value },
    Matches { path: Path, regex: Regex },
}

impl Predicate {
    fn eval(&self, view: &Value) -> bool {
        match self {
            Predicate::Or(a, b) => a.eval(view) || b.eval(view),
            Predicate::And(a, b) => a.eval(view) && b.eval(view),
            Predicate::Not(inner) => !inner.eval(view),
            Predicate::Truthy(path) => !matches!(
                path.resolve(view),
                None | Some(Value::Null) | Some(Value::Bool(false))
            ),
            Predicate::IsNull(path) => matches!(path.resolve(view), None | Some(Value::Null)),
            Predicate::Compare { path, op, literal } => op.apply(path.resolve(view), literal),
            Predicate::InList { path, list } => {
                let value = path.resolve(view).unwrap_or(&Value::Null);
                list.iter().any(|item| json_eq(value, item))
            }
            Predicate::Between { path, low, high } => {
                let value = path.resolve(view);
                CmpOp::Ge.apply(value, low) && CmpOp::Le.apply(value, high)
            }
            Predicate::Matches { path, regex } => match path.resolve(view) {
                Some(Value::String(s)) => regex.is_match(s),
                _ => false,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn from_sql(op: &BinaryOperator) -> Option<Self> {
        match op {
            BinaryOperator::Eq => Some(CmpOp::Eq),
            BinaryOperator::NotEq => Some(CmpOp::Ne),
            BinaryOperator::Lt => Some(CmpOp::Lt),
            BinaryOperator::LtEq => Some(CmpOp::Le),
            BinaryOperator::Gt => Some(CmpOp::Gt),
            BinaryOperator::GtEq => Some(CmpOp::Ge),
            _ => None,
        }
    }

    /// Operator for reversed operands (`100 < payload.x` is `payload.x > 100`).
    fn swap(self) -> Self {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
            other => other,
        }
    }

    fn apply(self, value: Option<&Value>, literal: &Value) -> bool {
        match self {
            CmpOp::Eq => json_eq(value.unwrap_or(&Value::Null), literal),
            CmpOp::Ne => !json_eq(value.unwrap_or(&Value::Null), literal),
            _ => {
                let ordering = match value.and_then(|v| json_cmp(v, literal)) {
                    Some(ordering) => ordering,
                    None => return false,
                };
                match self {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    CmpOp::Ge => ordering != Ordering::Less,
                    CmpOp::Eq | CmpOp::Ne => false,
                }
            }
        }
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Clone, Debug, PartialEq)]
struct Path(Vec<Segment>);

impl Path {
    fn resolve<'v>(&self, view: &'v Value) -> Option<&'v Value> {
        self.0.iter().try_fold(view, |current, segment| match segment {
            Segment::Key(key) => current.get(key.as_str()),
            Segment::Index(i) => current.get(*i),
        })
    }
}

type CompileResult<T> = std::result::Result<T, String>;

fn compile(expr: &SqlExpr) -> CompileResult<Predicate> {
    match expr {
        SqlExpr::Nested(inner) => compile(inner),
        SqlExpr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => Ok(Predicate::And(
                Box::new(compile(left)?),
                Box::new(compile(right)?),
            )),
            BinaryOperator::Or => Ok(Predicate::Or(
                Box::new(compile(left)?),
                Box::new(compile(right)?),
            )),
            BinaryOperator::PGRegexMatch => regex_match(left, right, false),
            BinaryOperator::PGRegexNotMatch => regex_match(left, right, true),
            other => {
                let op = CmpOp::from_sql(other)
                    .ok_or_else(|| format!("unsupported operator {}", other))?;
                compare(left, op, right)
            }
        },
        SqlExpr::UnaryOp {
            op: UnaryOperator::Not,
            expr,
        } => Ok(Predicate::Not(Box::new(compile(expr)?))),
        SqlExpr::IsNull(inner) => Ok(Predicate::IsNull(path(inner)?)),
        SqlExpr::IsNotNull(inner) => Ok(negate(Predicate::IsNull(path(inner)?), true)),
        SqlExpr::IsTrue(inner) => Ok(Predicate::Compare {
            path: path(inner)?,
            op: CmpOp::Eq,
            literal: Value::Bool(true),
        }),
        SqlExpr::IsFalse(inner) => Ok(Predicate::Compare {
            path: path(inner)?,
            op: CmpOp::Eq,
            literal: Value::Bool(false),
        }),
        SqlExpr::InList {
            expr,
            list,
            negated,
        } => {
            let list = list.iter().map(literal).collect::<CompileResult<Vec<_>>>()?;
            Ok(negate(
                Predicate::InList {
                    path: path(expr)?,
                    list,
                },
                *negated,
            ))
        }
        SqlExpr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(negate(
            Predicate::Between {
                path: path(expr)?,
                low: literal(low)?,
                high: literal(high)?,
            },
            *negated,
        )),
        SqlExpr::Like {
            negated,
            expr,
            pattern,
            ..
        } => like(expr, pattern, *negated, false),
        SqlExpr::ILike {
            negated,
            expr,
            pattern,
            ..
        } => like(expr, pattern, *negated, true),
        SqlExpr::RLike {
            negated,
            expr,
            pattern,
            ..
        } => regex_match(expr, pattern, *negated),
        other => Ok(Predicate::Truthy(path(other)?)),
    }
}

fn negate(predicate: Predicate, negated: bool) -> Predicate {
    if negated {
        Predicate::Not(Box::new(predicate))
    } else {
        predicate
    }
}

fn compare(left: &SqlExpr, op: CmpOp, right: &SqlExpr) -> CompileResult<Predicate> {
    if let Ok(path) = path(left) {
        return Ok(Predicate::Compare {
            path,
            op,
            literal: literal(right)?,
        });
    }
    Ok(Predicate::Compare {
        path: path(right)?,
        op: op.swap(),
        literal: literal(left)?,
    })
}

fn regex_match(expr: &SqlExpr, pattern: &SqlExpr, negated: bool) -> CompileResult<Predicate> {
    let regex = Regex::new(&string_literal(pattern)?).map_err(|e| e.to_string())?;
    Ok(negate(
        Predicate::Matches {
            path: path(expr)?,
            regex,
        },
        negated,
    ))
}

fn like(
    expr: &SqlExpr,
    pattern: &SqlExpr,
    negated: bool,
    case_insensitive: bool,
) -> CompileResult<Predicate> {
    let pattern = string_literal(pattern)?;
    let mut source = String::from(if case_insensitive { "(?is)^" } else { "(?s)^" });
    for c in pattern.chars() {
        match c {
            '%' => source.push_str(".*"),
            '_' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');

    let regex = Regex::new(&source).map_err(|e| e.to_string())?;
    Ok(negate(
        Predicate::Matches {
            path: path(expr)?,
            regex,
        },
        negated,
    ))
}

/// Resolve a column expression to a path rooted at `header` or `payload`.
fn path(expr: &SqlExpr) -> CompileResult<Path> {
    let mut segments = Vec::new();
    push_segments(expr, &mut segments)?;

    match segments.first() {
        Some(Segment::Key(root)) if root == "header" || root == "payload" => Ok(Path(segments)),
        _ => Err(format!(
            "expected a path rooted at 'header' or 'payload', found {}",
            expr
        )),
    }
}

fn push_segments(expr: &SqlExpr, segments: &mut Vec<Segment>) -> CompileResult<()> {
    match expr {
        SqlExpr::Identifier(ident) => segments.push(Segment::Key(ident.value.clone())),
        SqlExpr::CompoundIdentifier(idents) => {
            segments.extend(idents.iter().map(|i| Segment::Key(i.value.clone())))
        }
        SqlExpr::Nested(inner) => push_segments(inner, segments)?,
        SqlExpr::CompoundFieldAccess { root, access_chain } => {
            push_segments(root, segments)?;
            for access in access_chain {
                match access {
                    AccessExpr::Dot(field) => push_segments(field, segments)?,
                    AccessExpr::Subscript(Subscript::Index { index }) => {
                        segments.push(Segment::Index(array_index(index)?))
                    }
                    AccessExpr::Subscript(other) => {
                        return Err(format!("unsupported subscript {}", other))
                    }
                }
            }
        }
        other => return Err(format!("expected a path, found {}", other)),
    }
    Ok(())
}

fn array_index(expr: &SqlExpr) -> CompileResult<usize> {
    match literal(expr)? {
        Value::Number(n) => n
            .as_u64()
            .map(|i| i as usize)
            .ok_or_else(|| format!("invalid index {}", n)),
        other => Err(format!("invalid index {}", other)),
    }
}

fn string_literal(expr: &SqlExpr) -> CompileResult<String> {
    match literal(expr)? {
        Value::String(s) => Ok(s),
        other => Err(format!("expected a string pattern, found {}", other)),
    }
}

fn literal(expr: &SqlExpr) -> CompileResult<Value> {
    match expr {
        SqlExpr::Value(v) => match &v.value {
            SqlValue::Number(n, _) => number(n),
            SqlValue::SingleQuotedString(s) => Ok(Value::String(s.clone())),
            SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
            SqlValue::Null => Ok(Value::Null),
            other => Err(format!("unsupported literal {}", other)),
        },
        SqlExpr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Value::Number(n) => number(&format!("-{}", n)),
            other => Err(format!("cannot negate {}", other)),
        },
        SqlExpr::Nested(inner) => literal(inner),
        other => Err(format!("expected a literal, found {}", other)),
    }
}

fn number(text: &str) -> CompileResult<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Ok(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("invalid number {}", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn view() -> Value {
        json!({
            "header": { "ns": "orders", "type": "Placed", "meta": { "region": "eu-west" } },
            "payload": { "amount": 120, "rate": 0.5, "items": ["a", "b"], "gift": false, "note": null }
        })
    }

    fn eval(src: &str) -> bool {
        FilterExpr::parse(src).unwrap().evaluate(&view())
    }

    #[test]
    fn test_comparisons() {
        assert!(eval("payload.amount > 100"));
        assert!(eval("payload.amount >= 120.0"));
        assert!(!eval("payload.amount < 120"));
        assert!(eval("100 < payload.amount"));
        assert!(eval("payload.rate = 0.5"));
        assert!(eval("payload.amount > -5"));
        assert!(eval("header.type = 'Placed'"));
        assert!(eval("header.type <> 'Cancelled'"));
        assert!(eval("payload.items[1] = 'b'"));
        assert!(eval("payload.amount BETWEEN 100 AND 200"));
        assert!(eval("header.type IN ('Placed', 'Paid')"));
        assert!(!eval("header.type NOT IN ('Placed', 'Paid')"));
    }

    #[test]
    fn test_boolean_structure() {
        assert!(eval("header.ns = 'orders' AND (payload.amount < 10 OR payload.items[0] = 'a')"));
        assert!(eval("NOT payload.gift"));
        assert!(!eval("payload.note"));
        assert!(eval("payload.items"));
        assert!(!eval("payload.amount > 1 AND payload.gift"));
        assert!(eval("payload.note IS NULL"));
        assert!(eval("payload.missing IS NULL"));
        assert!(eval("payload.rate IS NOT NULL"));
        assert!(eval("payload.gift IS FALSE"));
    }

    #[test]
    fn test_pattern_matching() {
        assert!(eval("header.meta.region REGEXP '^eu-'"));
        assert!(!eval("payload.amount REGEXP '1'"));
        assert!(eval("header.meta.region LIKE 'eu-%'"));
        assert!(eval("header.type LIKE 'Pl_ced'"));
        assert!(!eval("header.type LIKE 'placed'"));
        assert!(eval("header.type ILIKE 'placed'"));
        assert!(eval("header.type NOT LIKE 'Paid%'"));
        // LIKE treats regex metacharacters literally.
        assert!(!eval("header.type LIKE 'P.aced'"));
    }

    #[test]
    fn test_malformed_filters_are_rejected() {
        for src in [
            "",
            "amount > 1",
            "other.amount > 1",
            "payload.amount >",
            "payload.amount > 1 AND",
            "(payload.a = 1",
            "payload.a = 'open",
            "payload.a REGEXP '('",
            "payload.a = 1 payload.b",
            "payload.a = payload.b",
            "payload.a LIKE 1",
        ] {
            let err = FilterExpr::parse(src).unwrap_err();
            assert!(matches!(err, StoreError::InvalidFilter { .. }), "{src}: {err:?}");
        }
    }
}
