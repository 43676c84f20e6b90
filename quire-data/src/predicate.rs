use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::value::{Column, Value};

/// Comparison operator applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Equality; `Eq(Value::Null)` renders as `IS NULL`.
    Eq(Value),
    /// Inequality; `Neq(Value::Null)` renders as `IS NOT NULL`.
    Neq(Value),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    /// Inclusive on both ends.
    Between(Value, Value),
    /// Set membership. An empty set matches nothing.
    In(Vec<Value>),
    /// Array field holds every listed element (order-independent).
    ContainsAll(Vec<Value>),
    /// Array field holds at least one listed element.
    ContainsAny(Vec<Value>),
    /// Object field contains the given JSON structure.
    JsonContains(serde_json::Value),
    Not(Box<Op>),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Eq(_) => "eq",
            Op::Neq(_) => "neq",
            Op::Lt(_) => "lt",
            Op::Lte(_) => "lte",
            Op::Gt(_) => "gt",
            Op::Gte(_) => "gte",
            Op::Between(..) => "between",
            Op::In(_) => "in",
            Op::ContainsAll(_) => "containsAll",
            Op::ContainsAny(_) => "containsAny",
            Op::JsonContains(_) => "jsonContains",
            Op::Not(_) => "not",
        }
    }

    /// Whether the operator can never match, independent of row contents.
    pub fn is_unsatisfiable(&self) -> bool {
        match self {
            Op::In(values) | Op::ContainsAny(values) => values.is_empty(),
            _ => false,
        }
    }
}

impl From<Value> for Op {
    fn from(value: Value) -> Self {
        Op::Eq(value)
    }
}

macro_rules! op_from_value {
    ( $( $ty:ty ),* $(,)? ) => {
        $(
            impl From<$ty> for Op {
                fn from(value: $ty) -> Self {
                    Op::Eq(Value::from(value))
                }
            }
        )*
    };
}

op_from_value!(bool, i32, i64, u32, f64, String, &str, &String, Uuid, DateTime<Utc>);

impl<T: Into<Value>> From<Option<T>> for Op {
    fn from(value: Option<T>) -> Self {
        Op::Eq(Value::from(value))
    }
}

/// One `field <op>` pair of a predicate literal.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub field: String,
    pub op: Op,
}

impl Clause {
    pub fn new(field: impl Into<String>, op: impl Into<Op>) -> Self {
        Self {
            field: field.into(),
            op: op.into(),
        }
    }
}

/// A predicate literal: field → value/operator pairs, combined with AND.
///
/// ```ignore
/// let p = Predicate::new()
///     .field("label", "x")
///     .field("score", ops::between(5, 10));
/// let p: Predicate = [("label", Op::from("x"))].into();
/// let p = predicate! { "label" => "x", "score" => ops::gt(3) };
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate {
    clauses: Vec<Clause>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, field: impl Into<String>, op: impl Into<Op>) -> Self {
        self.clauses.push(Clause::new(field, op));
        self
    }

    pub fn clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn into_clauses(self) -> Vec<Clause> {
        self.clauses
    }
}

impl From<Clause> for Predicate {
    fn from(clause: Clause) -> Self {
        Predicate {
            clauses: vec![clause],
        }
    }
}

impl<K: Into<String>, O: Into<Op>, const N: usize> From<[(K, O); N]> for Predicate {
    fn from(pairs: [(K, O); N]) -> Self {
        pairs
            .into_iter()
            .fold(Predicate::new(), |p, (k, o)| p.field(k, o))
    }
}

impl<T: Into<Value>> Column<T> {
    /// Equality clause on this column.
    pub fn eq(&self, value: impl Into<T>) -> Clause {
        let value: T = value.into();
        Clause::new(self.name(), Op::Eq(value.into()))
    }

    /// Clause on this column with an arbitrary operator.
    pub fn op(&self, op: Op) -> Clause {
        Clause::new(self.name(), op)
    }
}

/// Build a [`Predicate`] from `field => value_or_op` pairs.
///
/// ```ignore
/// let p = quire_data::predicate! {
///     "label" => "x",
///     "score" => ops::between(5, 10),
/// };
/// ```
#[macro_export]
macro_rules! predicate {
    () => { $crate::Predicate::new() };
    ( $( $field:expr => $op:expr ),+ $(,)? ) => {
        $crate::Predicate::new()$( .field($field, $op) )+
    };
}
