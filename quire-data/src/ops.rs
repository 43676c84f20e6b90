//! The operator bag used inside predicate literals.
//!
//! ```ignore
//! use quire_data::ops;
//! things.filter_where(predicate! {
//!     "score" => ops::between(5, 10),
//!     "tags" => ops::contains_any(["a"]),
//!     "status" => ops::not(ops::is_in(["draft", "hidden"])),
//! });
//! ```

use crate::predicate::Op;
use crate::value::Value;

fn values<I, V>(values: I) -> Vec<Value>
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    values.into_iter().map(Into::into).collect()
}

pub fn eq(value: impl Into<Value>) -> Op {
    Op::Eq(value.into())
}

pub fn neq(value: impl Into<Value>) -> Op {
    Op::Neq(value.into())
}

pub fn lt(value: impl Into<Value>) -> Op {
    Op::Lt(value.into())
}

pub fn lte(value: impl Into<Value>) -> Op {
    Op::Lte(value.into())
}

pub fn gt(value: impl Into<Value>) -> Op {
    Op::Gt(value.into())
}

pub fn gte(value: impl Into<Value>) -> Op {
    Op::Gte(value.into())
}

/// Inclusive range: `low <= field <= high`.
pub fn between(low: impl Into<Value>, high: impl Into<Value>) -> Op {
    Op::Between(low.into(), high.into())
}

/// Set membership (`in` in predicate literals). An empty set matches no rows.
pub fn is_in<I, V>(set: I) -> Op
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Op::In(values(set))
}

pub fn contains_all<I, V>(elements: I) -> Op
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Op::ContainsAll(values(elements))
}

pub fn contains_any<I, V>(elements: I) -> Op
where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
{
    Op::ContainsAny(values(elements))
}

/// Negate an operator. A raw value negates equality: `not(true)` matches
/// rows where the field is not `true`.
pub fn not(op: impl Into<Op>) -> Op {
    Op::Not(Box::new(op.into()))
}

pub fn json_contains(probe: serde_json::Value) -> Op {
    Op::JsonContains(probe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators_capture_values() {
        assert_eq!(between(5, 10), Op::Between(Value::Int(5), Value::Int(10)));
        assert_eq!(
            is_in(["a", "b"]),
            Op::In(vec![Value::Text("a".into()), Value::Text("b".into())])
        );
        assert_eq!(not(true), Op::Not(Box::new(Op::Eq(Value::Bool(true)))));
        assert_eq!(
            not(lt(3)),
            Op::Not(Box::new(Op::Lt(Value::Int(3))))
        );
    }
}
