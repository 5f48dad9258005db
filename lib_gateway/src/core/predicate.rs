//! # Query Predicates
//!
//! A subscription topic may end in `?query`. The broker hands the query to a
//! `PredicateCompiler` once, at subscribe time, and evaluates the compiled
//! `Predicate` against every matching event payload. A predicate returns the
//! (possibly reshaped) payload to deliver, or `None` to skip the event.
//!
//! `SimpleQueryCompiler` understands conjunctions of comparisons:
//!
//! ```text
//! value > 3 && meta.unit == "lux" && state != off
//! ```
//!
//! Paths are dotted lookups into the payload object. Literals are JSON
//! scalars; anything else is taken as a bare string.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Compiled event filter.
pub type Predicate = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// Query compilation failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PredicateError {
    /// The query text is blank.
    #[error("query is empty")]
    Empty,

    /// A clause has no comparison operator.
    #[error("clause '{0}' has no comparison operator")]
    MissingOperator(String),

    /// A clause has an empty path or literal.
    #[error("clause '{0}' is incomplete")]
    Incomplete(String),
}

/// Turns a query string into a `Predicate`.
pub trait PredicateCompiler: Send + Sync {
    /// Compiles `query`.
    fn compile(&self, query: &str) -> Result<Predicate, PredicateError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

// Two-character operators first so `>=` is not read as `>`.
const OPERATORS: [(&str, Op); 6] = [
    (">=", Op::Ge),
    ("<=", Op::Le),
    ("==", Op::Eq),
    ("!=", Op::Ne),
    (">", Op::Gt),
    ("<", Op::Lt),
];

#[derive(Debug, Clone)]
struct Clause {
    path: Vec<String>,
    op: Op,
    literal: Value,
}

impl Clause {
    fn parse(text: &str) -> Result<Self, PredicateError> {
        let (index, token, op) = OPERATORS
            .iter()
            .filter_map(|(token, op)| text.find(token).map(|i| (i, *token, *op)))
            .min_by_key(|(i, token, _)| (*i, std::cmp::Reverse(token.len())))
            .ok_or_else(|| PredicateError::MissingOperator(text.to_string()))?;

        let path = text[..index].trim();
        let literal = text[index + token.len()..].trim();
        if path.is_empty() || literal.is_empty() {
            return Err(PredicateError::Incomplete(text.to_string()));
        }

        Ok(Self {
            path: path.split('.').map(str::to_string).collect(),
            op,
            literal: serde_json::from_str(literal)
                .unwrap_or_else(|_| Value::String(literal.to_string())),
        })
    }

    fn eval(&self, payload: &Value) -> bool {
        let Some(value) = self.path.iter().try_fold(payload, |v, key| v.get(key)) else {
            return false;
        };
        let ordering = compare(value, &self.literal);
        match self.op {
            Op::Eq => ordering == Some(Ordering::Equal),
            Op::Ne => ordering != Some(Ordering::Equal),
            Op::Gt => ordering == Some(Ordering::Greater),
            Op::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            Op::Lt => ordering == Some(Ordering::Less),
            Op::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        }
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Default compiler for `path op literal && ...` queries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleQueryCompiler;

impl PredicateCompiler for SimpleQueryCompiler {
    fn compile(&self, query: &str) -> Result<Predicate, PredicateError> {
        if query.trim().is_empty() {
            return Err(PredicateError::Empty);
        }
        let clauses = query
            .split("&&")
            .map(|c| Clause::parse(c.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Arc::new(move |payload: &Value| {
            clauses
                .iter()
                .all(|c| c.eval(payload))
                .then(|| payload.clone())
        }))
    }
}
