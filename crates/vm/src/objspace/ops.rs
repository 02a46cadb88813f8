//! Numeric, sequence and comparison operators of the reference object space.

use super::{SimpleSpace, Value};
use crate::{
    exceptions::{ExceptionKind, OpResult},
    space::ObjectSpace,
};
use std::cmp::Ordering;
use tinypy_bytecode::{BinaryOperator, ComparisonOperator, UnaryOperator};

type ValueResult<T = Value> = OpResult<T, Value>;

#[derive(Debug, Copy, Clone)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn of(value: &Value) -> Option<Self> {
        match *value {
            Value::Bool(b) => Some(Self::Int(b.into())),
            Value::Int(i) => Some(Self::Int(i)),
            Value::Float(f) => Some(Self::Float(f)),
            _ => None,
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }
}

fn overflow(space: &SimpleSpace) -> crate::OperationError<Value> {
    space.new_exception(ExceptionKind::OverflowError, "integer overflow".to_owned())
}

fn zero_division(space: &SimpleSpace, float: bool) -> crate::OperationError<Value> {
    let msg = if float {
        "float division by zero"
    } else {
        "integer division or modulo by zero"
    };
    space.new_exception(ExceptionKind::ZeroDivisionError, msg.to_owned())
}

fn checked(space: &SimpleSpace, result: Option<i64>) -> ValueResult {
    result.map(Value::Int).ok_or_else(|| overflow(space))
}

fn floor_div(space: &SimpleSpace, a: i64, b: i64) -> ValueResult<i64> {
    if b == 0 {
        return Err(zero_division(space, false));
    }
    let q = a.checked_div(b).ok_or_else(|| overflow(space))?;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn int_mod(space: &SimpleSpace, a: i64, b: i64) -> ValueResult<i64> {
    if b == 0 {
        return Err(zero_division(space, false));
    }
    let r = a.checked_rem(b).unwrap_or(0);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn float_mod(space: &SimpleSpace, a: f64, b: f64) -> ValueResult<f64> {
    if b == 0.0 {
        return Err(space.new_exception(
            ExceptionKind::ZeroDivisionError,
            "float modulo".to_owned(),
        ));
    }
    let r = a % b;
    if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

fn int_pow(space: &SimpleSpace, base: i64, exp: i64) -> ValueResult {
    if exp < 0 {
        if base == 0 {
            return Err(space.new_exception(
                ExceptionKind::ZeroDivisionError,
                "0.0 cannot be raised to a negative power".to_owned(),
            ));
        }
        return Ok(Value::Float((base as f64).powf(exp as f64)));
    }
    let exp = u32::try_from(exp).map_err(|_| overflow(space))?;
    checked(space, base.checked_pow(exp))
}

fn shift(space: &SimpleSpace, op: BinaryOperator, a: i64, b: i64) -> ValueResult {
    if b < 0 {
        return Err(space.new_exception(
            ExceptionKind::ValueError,
            "negative shift count".to_owned(),
        ));
    }
    if op == BinaryOperator::Rshift {
        let shifted = if b >= 64 {
            if a < 0 { -1 } else { 0 }
        } else {
            a >> b
        };
        return Ok(Value::Int(shifted));
    }
    if a == 0 {
        return Ok(Value::Int(0));
    }
    if b >= 64 {
        return Err(overflow(space));
    }
    let shifted = a << b;
    if shifted >> b != a {
        return Err(overflow(space));
    }
    Ok(Value::Int(shifted))
}

fn int_op(space: &SimpleSpace, op: BinaryOperator, a: i64, b: i64) -> ValueResult {
    use BinaryOperator::*;
    match op {
        Add => checked(space, a.checked_add(b)),
        Subtract => checked(space, a.checked_sub(b)),
        Multiply => checked(space, a.checked_mul(b)),
        Divide | FloorDivide => floor_div(space, a, b).map(Value::Int),
        TrueDivide => {
            if b == 0 {
                Err(space.new_exception(
                    ExceptionKind::ZeroDivisionError,
                    "division by zero".to_owned(),
                ))
            } else {
                Ok(Value::Float(a as f64 / b as f64))
            }
        }
        Modulo => int_mod(space, a, b).map(Value::Int),
        Power => int_pow(space, a, b),
        Lshift | Rshift => shift(space, op, a, b),
        And => Ok(Value::Int(a & b)),
        Xor => Ok(Value::Int(a ^ b)),
        Or => Ok(Value::Int(a | b)),
    }
}

fn float_op(space: &SimpleSpace, op: BinaryOperator, a: f64, b: f64) -> Option<ValueResult> {
    use BinaryOperator::*;
    let result = match op {
        Add => a + b,
        Subtract => a - b,
        Multiply => a * b,
        Divide | TrueDivide => {
            if b == 0.0 {
                return Some(Err(zero_division(space, true)));
            }
            a / b
        }
        FloorDivide => {
            if b == 0.0 {
                return Some(Err(zero_division(space, true)));
            }
            (a / b).floor()
        }
        Modulo => return Some(float_mod(space, a, b).map(Value::Float)),
        Power => a.powf(b),
        Lshift | Rshift | And | Xor | Or => return None,
    };
    Some(Ok(Value::Float(result)))
}

fn repeat_count(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

fn sequence_op(op: BinaryOperator, a: &Value, b: &Value) -> Option<Value> {
    use BinaryOperator::{Add, Multiply};
    let value = match (op, a, b) {
        (Add, Value::Str(a), Value::Str(b)) => Value::str(&format!("{a}{b}")),
        (Add, Value::Tuple(a), Value::Tuple(b)) => {
            Value::tuple(a.iter().chain(b.iter()).cloned().collect())
        }
        (Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Value::list(items)
        }
        (Multiply, seq, n) | (Multiply, n, seq) if n.as_int().is_some() => {
            let count = repeat_count(n.as_int()?);
            match seq {
                Value::Str(s) => Value::str(&s.repeat(count)),
                Value::Tuple(items) => Value::tuple(repeat(items, count)),
                Value::List(items) => Value::list(repeat(&items.borrow(), count)),
                _ => return None,
            }
        }
        _ => return None,
    };
    Some(value)
}

fn repeat(items: &[Value], count: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * count);
    for _ in 0..count {
        out.extend(items.iter().cloned());
    }
    out
}

pub(super) fn binary_op(
    space: &SimpleSpace,
    op: BinaryOperator,
    a: &Value,
    b: &Value,
) -> ValueResult {
    match (Number::of(a), Number::of(b)) {
        (Some(Number::Int(x)), Some(Number::Int(y))) => {
            let result = int_op(space, op, x, y)?;
            // bitwise operators on two bools stay bool
            if let (Value::Bool(_), Value::Bool(_), Value::Int(i)) = (a, b, &result) {
                if matches!(op, BinaryOperator::And | BinaryOperator::Xor | BinaryOperator::Or) {
                    return Ok(Value::Bool(*i != 0));
                }
            }
            return Ok(result);
        }
        (Some(x), Some(y)) => {
            if let Some(result) = float_op(space, op, x.to_f64(), y.to_f64()) {
                return result;
            }
        }
        _ => {
            if let Some(result) = sequence_op(op, a, b) {
                return Ok(result);
            }
        }
    }
    Err(space.new_exception(
        ExceptionKind::TypeError,
        format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            a.type_name(),
            b.type_name()
        ),
    ))
}

/// In-place operators only differ from the binary ones for lists, which
/// are extended where they stand.
pub(super) fn inplace_op(
    space: &SimpleSpace,
    op: BinaryOperator,
    a: &Value,
    b: &Value,
) -> ValueResult {
    if let (BinaryOperator::Add, Value::List(list)) = (op, a) {
        let items = space.iterate(b)?;
        list.borrow_mut().extend(items);
        return Ok(a.clone());
    }
    binary_op(space, op, a, b)
}

pub(super) fn unary_op(space: &SimpleSpace, op: UnaryOperator, operand: &Value) -> ValueResult {
    let result = match (op, Number::of(operand)) {
        (UnaryOperator::Convert, _) => return Ok(Value::str(&operand.repr())),
        (UnaryOperator::Positive, Some(Number::Int(i))) => Value::Int(i),
        (UnaryOperator::Positive, Some(Number::Float(f))) => Value::Float(f),
        (UnaryOperator::Negative, Some(Number::Int(i))) => checked(space, i.checked_neg())?,
        (UnaryOperator::Negative, Some(Number::Float(f))) => Value::Float(-f),
        (UnaryOperator::Invert, Some(Number::Int(i))) => Value::Int(!i),
        _ => {
            return Err(space.new_exception(
                ExceptionKind::TypeError,
                format!(
                    "bad operand type for unary {}: '{}'",
                    op.symbol(),
                    operand.type_name()
                ),
            ));
        }
    };
    Ok(result)
}

pub(super) fn abs(space: &SimpleSpace, value: &Value) -> ValueResult {
    match Number::of(value) {
        Some(Number::Int(i)) => checked(space, i.checked_abs()),
        Some(Number::Float(f)) => Ok(Value::Float(f.abs())),
        None => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!("bad operand type for abs(): '{}'", value.type_name()),
        )),
    }
}

/// `a == b`
pub(super) fn equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (Number::of(a), Number::of(b)) {
        return match (x, y) {
            (Number::Int(x), Number::Int(y)) => x == y,
            (x, y) => x.to_f64() == y.to_f64(),
        };
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Tuple(x), Value::Tuple(y)) => sequence_equal(x, y),
        (Value::List(x), Value::List(y)) => {
            std::rc::Rc::ptr_eq(x, y) || sequence_equal(&x.borrow(), &y.borrow())
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if std::rc::Rc::ptr_eq(x, y) {
                return true;
            }
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter().all(|(key, (_, value))| {
                    y.get(key)
                        .is_some_and(|(_, other)| equal(value, other))
                })
        }
        _ => a.is(b),
    }
}

fn sequence_equal(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| equal(x, y))
}

fn ordering(space: &SimpleSpace, op: ComparisonOperator, a: &Value, b: &Value) -> ValueResult<Ordering> {
    if let (Some(x), Some(y)) = (Number::of(a), Number::of(b)) {
        let ord = match (x, y) {
            (Number::Int(x), Number::Int(y)) => Some(x.cmp(&y)),
            (x, y) => x.to_f64().partial_cmp(&y.to_f64()),
        };
        // NaN is unordered, and every ordering test on it is false
        return Ok(ord.unwrap_or(Ordering::Equal));
    }
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::Tuple(x), Value::Tuple(y)) => sequence_ordering(space, op, x, y),
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow().clone(), y.borrow().clone());
            sequence_ordering(space, op, &x, &y)
        }
        _ => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "unorderable types: {}() {} {}()",
                a.type_name(),
                op.symbol(),
                b.type_name()
            ),
        )),
    }
}

fn sequence_ordering(
    space: &SimpleSpace,
    op: ComparisonOperator,
    a: &[Value],
    b: &[Value],
) -> ValueResult<Ordering> {
    for (x, y) in a.iter().zip(b) {
        if !equal(x, y) {
            return ordering(space, op, x, y);
        }
    }
    Ok(a.len().cmp(&b.len()))
}

fn is_nan(value: &Value) -> bool {
    matches!(value, Value::Float(f) if f.is_nan())
}

pub(super) fn contains(space: &SimpleSpace, container: &Value, item: &Value) -> ValueResult<bool> {
    match container {
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            _ => Err(space.new_exception(
                ExceptionKind::TypeError,
                "'in <string>' requires string as left operand".to_owned(),
            )),
        },
        Value::Tuple(items) => Ok(items.iter().any(|x| equal(x, item))),
        Value::List(items) => Ok(items.borrow().iter().any(|x| equal(x, item))),
        Value::Dict(dict) => {
            let key = super::hash_key(space, item)?;
            Ok(dict.borrow().contains_key(&key))
        }
        Value::Iterator(_) | Value::Generator(_) => {
            let iterator = space.get_iter(container)?;
            while let Some(x) = space.iter_next(&iterator)? {
                if equal(&x, item) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "argument of type '{}' is not iterable",
                container.type_name()
            ),
        )),
    }
}

pub(super) fn compare(
    space: &SimpleSpace,
    op: ComparisonOperator,
    a: &Value,
    b: &Value,
) -> ValueResult {
    use ComparisonOperator::*;
    let result = match op {
        Equal => equal(a, b),
        NotEqual => !equal(a, b),
        Less | LessOrEqual | Greater | GreaterOrEqual => {
            if is_nan(a) || is_nan(b) {
                false
            } else {
                let ord = ordering(space, op, a, b)?;
                match op {
                    Less => ord == Ordering::Less,
                    LessOrEqual => ord != Ordering::Greater,
                    Greater => ord == Ordering::Greater,
                    _ => ord != Ordering::Less,
                }
            }
        }
        In => contains(space, b, a)?,
        NotIn => !contains(space, b, a)?,
        Is => a.is(b),
        IsNot => !a.is(b),
        ExceptionMatch => space.exception_matches(a, b)?,
    };
    Ok(Value::Bool(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binop(op: BinaryOperator, a: Value, b: Value) -> String {
        let space = SimpleSpace::new();
        match binary_op(&space, op, &a, &b) {
            Ok(value) => value.repr(),
            Err(err) => err.to_string(),
        }
    }

    #[test]
    fn classic_division_floors() {
        use BinaryOperator::*;
        assert_eq!(binop(Divide, Value::Int(7), Value::Int(2)), "3");
        assert_eq!(binop(Divide, Value::Int(-7), Value::Int(2)), "-4");
        assert_eq!(binop(Modulo, Value::Int(-7), Value::Int(2)), "1");
        assert_eq!(binop(Modulo, Value::Int(7), Value::Int(-2)), "-1");
        assert_eq!(binop(TrueDivide, Value::Int(7), Value::Int(2)), "3.5");
        assert_eq!(binop(Divide, Value::Float(7.0), Value::Int(2)), "3.5");
        assert_eq!(
            binop(Divide, Value::Int(1), Value::Int(0)),
            "ZeroDivisionError: integer division or modulo by zero"
        );
        assert_eq!(
            binop(Divide, Value::Float(1.0), Value::Int(0)),
            "ZeroDivisionError: float division by zero"
        );
    }

    #[test]
    fn overflow_is_an_exception() {
        use BinaryOperator::*;
        assert_eq!(
            binop(Add, Value::Int(i64::MAX), Value::Int(1)),
            "OverflowError: integer overflow"
        );
        assert_eq!(
            binop(Lshift, Value::Int(1), Value::Int(63)),
            "OverflowError: integer overflow"
        );
        assert_eq!(binop(Power, Value::Int(2), Value::Int(10)), "1024");
        assert_eq!(binop(Power, Value::Int(2), Value::Int(-1)), "0.5");
    }

    #[test]
    fn sequences() {
        use BinaryOperator::*;
        assert_eq!(binop(Add, Value::str("ab"), Value::str("cd")), "'abcd'");
        assert_eq!(binop(Multiply, Value::Int(2), Value::str("ab")), "'abab'");
        assert_eq!(
            binop(Add, Value::tuple(vec![Value::Int(1)]), Value::tuple(vec![])),
            "(1,)"
        );
        assert_eq!(
            binop(Add, Value::Int(1), Value::str("a")),
            "TypeError: unsupported operand type(s) for +: 'int' and 'str'"
        );
    }

    #[test]
    fn comparisons() {
        let space = SimpleSpace::new();
        let cmp = |op, a: Value, b: Value| compare(&space, op, &a, &b).unwrap().repr();
        use ComparisonOperator::*;
        assert_eq!(cmp(Equal, Value::Int(1), Value::Float(1.0)), "True");
        assert_eq!(cmp(Less, Value::str("a"), Value::str("b")), "True");
        let pair = |a, b| Value::tuple(vec![Value::Int(a), Value::Int(b)]);
        assert_eq!(cmp(Less, pair(1, 2), pair(1, 3)), "True");
        assert_eq!(cmp(In, Value::Int(2), pair(1, 2)), "True");
        assert_eq!(cmp(NotIn, Value::str("z"), Value::str("abc")), "True");
        assert_eq!(cmp(Less, Value::Float(f64::NAN), Value::Int(1)), "False");
        let list = Value::list(vec![]);
        assert_eq!(cmp(Is, list.clone(), list), "True");
        assert_eq!(cmp(Is, Value::list(vec![]), Value::list(vec![])), "False");
        assert!(compare(&space, Less, &Value::Int(1), &Value::str("a")).is_err());
    }
}
