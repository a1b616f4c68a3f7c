use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::parser::{BinOp, Expr};
use super::{Context, ExprError};

enum Num {
    Int(i64),
    Float(f64),
}

fn num(value: &Value) -> Option<Num> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(Num::Int)
            .or_else(|| n.as_f64().map(Num::Float)),
        Value::Bool(b) => Some(Num::Int(i64::from(*b))),
        _ => None,
    }
}

fn float_value(f: f64) -> Result<Value, ExprError> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Type(format!("{f} is not a finite number")))
}

/// Python truthiness over JSON values.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn eval(expr: &Expr, ctx: &Context) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Name(name) => ctx
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownName(name.clone())),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Dict(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                let key = match eval(key, ctx)? {
                    Value::String(s) => s,
                    other => return Err(ExprError::Type(format!("dict keys must be strings, got {other}"))),
                };
                map.insert(key, eval(value, ctx)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Attr(target, name) => match eval(target, ctx)? {
            Value::Object(map) => map
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::MissingKey(name.clone())),
            other => Err(ExprError::Type(format!("cannot read `{name}` of {other}"))),
        },
        Expr::Index(target, index) => index_value(eval(target, ctx)?, eval(index, ctx)?),
        Expr::Get {
            target,
            key,
            default,
        } => {
            let Value::Object(map) = eval(target, ctx)? else {
                return Err(ExprError::Type("get() requires a mapping".into()));
            };
            let key = match eval(key, ctx)? {
                Value::String(s) => s,
                other => return Err(ExprError::Type(format!("get() key must be a string, got {other}"))),
            };
            match map.get(&key) {
                Some(found) => Ok(found.clone()),
                None => match default {
                    Some(default) => eval(default, ctx),
                    None => Ok(Value::Null),
                },
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&eval(inner, ctx)?))),
        Expr::Neg(inner) => match num(&eval(inner, ctx)?) {
            Some(Num::Int(i)) => i
                .checked_neg()
                .map(Value::from)
                .ok_or_else(|| ExprError::Type("integer overflow".into())),
            Some(Num::Float(f)) => float_value(-f),
            None => Err(ExprError::Type("unary - requires a number".into())),
        },
        Expr::And(left, right) => {
            let left = eval(left, ctx)?;
            if is_truthy(&left) { eval(right, ctx) } else { Ok(left) }
        }
        Expr::Or(left, right) => {
            let left = eval(left, ctx)?;
            if is_truthy(&left) { Ok(left) } else { eval(right, ctx) }
        }
        Expr::Binary(op, left, right) => binary(*op, eval(left, ctx)?, eval(right, ctx)?),
    }
}

fn index_value(target: Value, index: Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::Object(map), Value::String(key)) => {
            map.get(&key).cloned().ok_or(ExprError::MissingKey(key))
        }
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_i64()
                .ok_or_else(|| ExprError::Type(format!("list index must be an integer, got {n}")))?;
            let len = items.len() as i64;
            let resolved = if i < 0 { i + len } else { i };
            usize::try_from(resolved)
                .ok()
                .and_then(|idx| items.get(idx).cloned())
                .ok_or_else(|| ExprError::MissingKey(i.to_string()))
        }
        (target, index) => Err(ExprError::Type(format!("cannot index {target} with {index}"))),
    }
}

fn equals(left: &Value, right: &Value) -> bool {
    match (num(left), num(right)) {
        (Some(l), Some(r)) if !left.is_boolean() || !right.is_boolean() => {
            compare_nums(&l, &r) == Some(Ordering::Equal)
        }
        _ => left == right,
    }
}

fn compare_nums(left: &Num, right: &Num) -> Option<Ordering> {
    match (left, right) {
        (Num::Int(l), Num::Int(r)) => Some(l.cmp(r)),
        (Num::Int(l), Num::Float(r)) => (*l as f64).partial_cmp(r),
        (Num::Float(l), Num::Int(r)) => l.partial_cmp(&(*r as f64)),
        (Num::Float(l), Num::Float(r)) => l.partial_cmp(r),
    }
}

fn order(left: &Value, right: &Value) -> Result<Ordering, ExprError> {
    if let (Value::String(l), Value::String(r)) = (left, right) {
        return Ok(l.cmp(r));
    }
    match (num(left), num(right)) {
        (Some(l), Some(r)) => compare_nums(&l, &r)
            .ok_or_else(|| ExprError::Type("cannot order NaN".into())),
        _ => Err(ExprError::Type(format!("cannot compare {left} with {right}"))),
    }
}

fn contains(container: &Value, item: &Value) -> Result<bool, ExprError> {
    match (container, item) {
        (Value::Array(items), item) => Ok(items.iter().any(|v| equals(v, item))),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (Value::String(haystack), Value::String(needle)) => Ok(haystack.contains(needle.as_str())),
        (container, item) => Err(ExprError::Type(format!("cannot test {item} in {container}"))),
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(equals(&left, &right))),
        BinOp::Ne => Ok(Value::Bool(!equals(&left, &right))),
        BinOp::Lt => Ok(Value::Bool(order(&left, &right)? == Ordering::Less)),
        BinOp::Le => Ok(Value::Bool(order(&left, &right)? != Ordering::Greater)),
        BinOp::Gt => Ok(Value::Bool(order(&left, &right)? == Ordering::Greater)),
        BinOp::Ge => Ok(Value::Bool(order(&left, &right)? != Ordering::Less)),
        BinOp::In => Ok(Value::Bool(contains(&right, &left)?)),
        BinOp::NotIn => Ok(Value::Bool(!contains(&right, &left)?)),
        BinOp::Add => match (left, right) {
            (Value::String(l), Value::String(r)) => Ok(Value::String(l + &r)),
            (Value::Array(mut l), Value::Array(r)) => {
                l.extend(r);
                Ok(Value::Array(l))
            }
            (l, r) => arithmetic(op, &l, &r),
        },
        _ => arithmetic(op, &left, &right),
    }
}

fn arithmetic(op: BinOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    let (Some(l), Some(r)) = (num(left), num(right)) else {
        return Err(ExprError::Type(format!("unsupported operands {left} and {right}")));
    };
    let overflow = || ExprError::Type("integer overflow".into());
    match (op, l, r) {
        (BinOp::Div | BinOp::Rem, _, Num::Int(0)) => Err(ExprError::DivisionByZero),
        (BinOp::Div | BinOp::Rem, _, Num::Float(f)) if f == 0.0 => Err(ExprError::DivisionByZero),
        (BinOp::Add, Num::Int(a), Num::Int(b)) => a.checked_add(b).map(Value::from).ok_or_else(overflow),
        (BinOp::Sub, Num::Int(a), Num::Int(b)) => a.checked_sub(b).map(Value::from).ok_or_else(overflow),
        (BinOp::Mul, Num::Int(a), Num::Int(b)) => a.checked_mul(b).map(Value::from).ok_or_else(overflow),
        (BinOp::Rem, Num::Int(a), Num::Int(b)) => {
            let m = a.checked_rem_euclid(b).ok_or_else(overflow)?;
            // Python's modulo takes the sign of the divisor.
            if m != 0 && b < 0 {
                Ok(Value::from(m + b))
            } else {
                Ok(Value::from(m))
            }
        }
        (op, l, r) => {
            let a = as_f64(&l);
            let b = as_f64(&r);
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                BinOp::Rem => a - b * (a / b).floor(),
                _ => return Err(ExprError::Type(format!("{op:?} is not arithmetic"))),
            };
            float_value(result)
        }
    }
}

fn as_f64(n: &Num) -> f64 {
    match n {
        Num::Int(i) => *i as f64,
        Num::Float(f) => *f,
    }
}
