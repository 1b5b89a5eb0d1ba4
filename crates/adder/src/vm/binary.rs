//! Unary, binary, and comparison operator evaluation.
//!
//! Helpers here are pure over values; failures are returned as
//! [`SimpleException`]s and materialized into exception instances by the VM.

use std::cmp::Ordering;
use std::rc::Rc;

use crate::bytecode::op::{Cmp, Op};
use crate::value::{ClassObject, DictKey, Value};
use crate::vm::exc::{ExcType, SimpleException};

fn type_error(message: String) -> SimpleException {
    SimpleException::new(ExcType::TypeError, message)
}

fn unsupported(op_symbol: &str, left: &Value, right: &Value) -> SimpleException {
    type_error(format!(
        "unsupported operand type(s) for {op_symbol}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

pub fn unary_op(op: Op, operand: Value) -> Result<Value, SimpleException> {
    match op {
        Op::UnaryPositive => match operand {
            Value::Int(_) | Value::Float(_) => Ok(operand),
            Value::Bool(flag) => Ok(Value::Int(i64::from(flag))),
            _ => Err(type_error(format!(
                "bad operand type for unary +: '{}'",
                operand.type_name()
            ))),
        },
        Op::UnaryNegative => match operand {
            Value::Int(number) => number
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| SimpleException::new(ExcType::OverflowError, "integer negation overflow".to_owned())),
            Value::Float(number) => Ok(Value::Float(-number)),
            Value::Bool(flag) => Ok(Value::Int(-i64::from(flag))),
            _ => Err(type_error(format!(
                "bad operand type for unary -: '{}'",
                operand.type_name()
            ))),
        },
        Op::UnaryNot => Ok(Value::Bool(!operand.is_truthy())),
        Op::UnaryInvert => match operand {
            Value::Int(number) => Ok(Value::Int(!number)),
            Value::Bool(flag) => Ok(Value::Int(!i64::from(flag))),
            _ => Err(type_error(format!(
                "bad operand type for unary ~: '{}'",
                operand.type_name()
            ))),
        },
        _ => unreachable!("not a unary opcode: {op}"),
    }
}

/// Widens bools to ints so arithmetic treats `True` as 1.
fn numeric(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(flag) => Some(Value::Int(i64::from(*flag))),
        Value::Int(_) | Value::Float(_) => Some(value.clone()),
        _ => None,
    }
}

pub fn binary_op(op: Op, left: Value, right: Value) -> Result<Value, SimpleException> {
    match op {
        Op::BinaryAdd => add(left, right),
        Op::BinarySubtract => arith(left, right, "-", i64::checked_sub, |a, b| a - b),
        Op::BinaryMultiply => multiply(left, right),
        Op::BinaryTrueDivide => true_divide(left, right),
        Op::BinaryFloorDivide => floor_divide(left, right),
        Op::BinaryModulo => modulo(left, right),
        Op::BinaryPower => power(left, right),
        Op::BinaryLshift => shift(left, right, true),
        Op::BinaryRshift => shift(left, right, false),
        Op::BinaryAnd => bitwise(left, right, "&", |a, b| a & b),
        Op::BinaryOr => bitwise(left, right, "|", |a, b| a | b),
        Op::BinaryXor => bitwise(left, right, "^", |a, b| a ^ b),
        _ => unreachable!("not a binary opcode: {op}"),
    }
}

fn add(left: Value, right: Value) -> Result<Value, SimpleException> {
    match (&left, &right) {
        (Value::Str(a), Value::Str(b)) => {
            let mut joined = a.to_string();
            joined.push_str(b);
            Ok(Value::str(joined))
        }
        (Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(Value::List(Rc::new(std::cell::RefCell::new(items))))
        }
        (Value::Tuple(a), Value::Tuple(b)) => {
            let mut items = a.as_ref().clone();
            items.extend(b.iter().cloned());
            Ok(Value::Tuple(Rc::new(items)))
        }
        _ => arith(left, right, "+", i64::checked_add, |a, b| a + b),
    }
}

fn multiply(left: Value, right: Value) -> Result<Value, SimpleException> {
    match (&left, &right) {
        (Value::Str(text), Value::Int(count)) | (Value::Int(count), Value::Str(text)) => {
            Ok(Value::str(text.repeat((*count).max(0) as usize)))
        }
        (Value::List(items), Value::Int(count)) | (Value::Int(count), Value::List(items)) => {
            let items = items.borrow();
            let mut repeated = Vec::with_capacity(items.len() * (*count).max(0) as usize);
            for _ in 0..(*count).max(0) {
                repeated.extend(items.iter().cloned());
            }
            Ok(Value::List(Rc::new(std::cell::RefCell::new(repeated))))
        }
        _ => arith(left, right, "*", i64::checked_mul, |a, b| a * b),
    }
}

/// Numeric arithmetic with int/float promotion; integer overflow raises.
fn arith(
    left: Value,
    right: Value,
    symbol: &str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, SimpleException> {
    let (Some(a), Some(b)) = (numeric(&left), numeric(&right)) else {
        return Err(unsupported(symbol, &left, &right));
    };
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => int_op(a, b).map(Value::Int).ok_or_else(|| {
            SimpleException::new(ExcType::OverflowError, "integer overflow".to_owned())
        }),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(a as f64, b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(a, b as f64))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(a, b))),
        _ => unreachable!("numeric() returns ints and floats only"),
    }
}

fn true_divide(left: Value, right: Value) -> Result<Value, SimpleException> {
    let (Some(a), Some(b)) = (numeric(&left), numeric(&right)) else {
        return Err(unsupported("/", &left, &right));
    };
    let (a, b) = (as_f64(&a), as_f64(&b));
    if b == 0.0 {
        return Err(SimpleException::new(
            ExcType::ZeroDivisionError,
            "division by zero".to_owned(),
        ));
    }
    Ok(Value::Float(a / b))
}

fn floor_divide(left: Value, right: Value) -> Result<Value, SimpleException> {
    let (Some(a), Some(b)) = (numeric(&left), numeric(&right)) else {
        return Err(unsupported("//", &left, &right));
    };
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => {
            if b == 0 {
                Err(SimpleException::new(
                    ExcType::ZeroDivisionError,
                    "integer division or modulo by zero".to_owned(),
                ))
            } else {
                Ok(Value::Int(floor_div_i64(a, b)))
            }
        }
        (a, b) => {
            let (a, b) = (as_f64(&a), as_f64(&b));
            if b == 0.0 {
                Err(SimpleException::new(
                    ExcType::ZeroDivisionError,
                    "float floor division by zero".to_owned(),
                ))
            } else {
                Ok(Value::Float((a / b).floor()))
            }
        }
    }
}

fn modulo(left: Value, right: Value) -> Result<Value, SimpleException> {
    let (Some(a), Some(b)) = (numeric(&left), numeric(&right)) else {
        return Err(unsupported("%", &left, &right));
    };
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => {
            if b == 0 {
                Err(SimpleException::new(
                    ExcType::ZeroDivisionError,
                    "integer division or modulo by zero".to_owned(),
                ))
            } else {
                Ok(Value::Int(a - floor_div_i64(a, b) * b))
            }
        }
        (a, b) => {
            let (a, b) = (as_f64(&a), as_f64(&b));
            if b == 0.0 {
                Err(SimpleException::new(
                    ExcType::ZeroDivisionError,
                    "float modulo".to_owned(),
                ))
            } else {
                Ok(Value::Float(a - (a / b).floor() * b))
            }
        }
    }
}

fn power(left: Value, right: Value) -> Result<Value, SimpleException> {
    let (Some(a), Some(b)) = (numeric(&left), numeric(&right)) else {
        return Err(unsupported("**", &left, &right));
    };
    match (a, b) {
        (Value::Int(a), Value::Int(b)) if b >= 0 => {
            let exponent = u32::try_from(b).ok();
            exponent
                .and_then(|exponent| a.checked_pow(exponent))
                .map(Value::Int)
                .ok_or_else(|| {
                    SimpleException::new(ExcType::OverflowError, "integer power overflow".to_owned())
                })
        }
        (a, b) => Ok(Value::Float(as_f64(&a).powf(as_f64(&b)))),
    }
}

fn shift(left: Value, right: Value, is_left: bool) -> Result<Value, SimpleException> {
    let symbol = if is_left { "<<" } else { ">>" };
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => {
            if *b < 0 {
                return Err(SimpleException::new(
                    ExcType::ValueError,
                    "negative shift count".to_owned(),
                ));
            }
            let amount = u32::try_from(*b).unwrap_or(u32::MAX);
            if is_left {
                a.checked_shl(amount).map(Value::Int).ok_or_else(|| {
                    SimpleException::new(ExcType::OverflowError, "shift overflow".to_owned())
                })
            } else {
                Ok(Value::Int(a.checked_shr(amount).unwrap_or(if *a < 0 {
                    -1
                } else {
                    0
                })))
            }
        }
        _ => Err(unsupported(symbol, &left, &right)),
    }
}

fn bitwise(
    left: Value,
    right: Value,
    symbol: &str,
    op: fn(i64, i64) -> i64,
) -> Result<Value, SimpleException> {
    match (&left, &right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(op(*a, *b))),
        (Value::Bool(a), Value::Bool(b)) => {
            Ok(Value::Bool(op(i64::from(*a), i64::from(*b)) != 0))
        }
        _ => Err(unsupported(symbol, &left, &right)),
    }
}

fn floor_div_i64(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    let remainder = a % b;
    if remainder != 0 && (remainder < 0) != (b < 0) {
        quotient - 1
    } else {
        quotient
    }
}

fn as_f64(value: &Value) -> f64 {
    match value {
        Value::Int(number) => *number as f64,
        Value::Float(number) => *number,
        _ => unreachable!("numeric() returns ints and floats only"),
    }
}

/// Ordering for `<`, `<=`, `>`, `>=`; `None` when the types don't order.
fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match ordering(x, y)? {
                    Ordering::Equal => continue,
                    unequal => return Some(unequal),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => {
            let (a, b) = (numeric(left)?, numeric(right)?);
            as_f64(&a).partial_cmp(&as_f64(&b))
        }
    }
}

/// Membership test for `in` / `not in`.
fn contains(needle: &Value, haystack: &Value) -> Result<bool, SimpleException> {
    match haystack {
        Value::List(items) => Ok(items.borrow().iter().any(|item| item.py_eq(needle))),
        Value::Tuple(items) => Ok(items.iter().any(|item| item.py_eq(needle))),
        Value::Dict(entries) => Ok(DictKey::from_value(needle)
            .map(|key| entries.borrow().contains_key(&key))
            .unwrap_or(false)),
        Value::Str(text) => match needle {
            Value::Str(sub) => Ok(text.contains(sub.as_ref())),
            _ => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                needle.type_name()
            ))),
        },
        _ => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            haystack.type_name()
        ))),
    }
}

/// Evaluates a `COMPARE_OP`; `base_exception` anchors the exception-match
/// subclass test.
pub fn compare(
    cmp: Cmp,
    left: Value,
    right: Value,
    base_exception: &Rc<ClassObject>,
) -> Result<Value, SimpleException> {
    let outcome = match cmp {
        Cmp::Eq => left.py_eq(&right),
        Cmp::Ne => !left.py_eq(&right),
        Cmp::Lt | Cmp::Le | Cmp::Gt | Cmp::Ge => {
            let Some(order) = ordering(&left, &right) else {
                return Err(type_error(format!(
                    "'{cmp}' not supported between instances of '{}' and '{}'",
                    left.type_name(),
                    right.type_name()
                )));
            };
            match cmp {
                Cmp::Lt => order == Ordering::Less,
                Cmp::Le => order != Ordering::Greater,
                Cmp::Gt => order == Ordering::Greater,
                Cmp::Ge => order != Ordering::Less,
                _ => unreachable!(),
            }
        }
        Cmp::In => contains(&left, &right)?,
        Cmp::NotIn => !contains(&left, &right)?,
        Cmp::Is => left.is(&right),
        Cmp::IsNot => !left.is(&right),
        Cmp::ExcMatch => exception_match(&left, &right, base_exception)?,
    };
    Ok(Value::Bool(outcome))
}

/// The handler-dispatch test: is the raised class a subclass of the handler
/// class (or of any class in a tuple of them)?
fn exception_match(
    raised: &Value,
    handler: &Value,
    base_exception: &Rc<ClassObject>,
) -> Result<bool, SimpleException> {
    let Value::Class(raised) = raised else {
        return Ok(false);
    };
    if !raised.is_subclass_of(base_exception) {
        return Ok(false);
    }
    match handler {
        Value::Class(handler) => Ok(raised.is_subclass_of(handler)),
        Value::Tuple(handlers) => {
            for candidate in handlers.iter() {
                if exception_match(&Value::Class(Rc::clone(raised)), candidate, base_exception)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "catching classes that do not inherit from BaseException is not allowed".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_class() -> Rc<ClassObject> {
        Rc::new(ClassObject {
            name: Rc::from("BaseException"),
            bases: vec![],
            namespace: std::cell::RefCell::new(crate::value::Namespace::default()),
        })
    }

    #[test]
    fn integer_arithmetic() {
        let product = binary_op(Op::BinaryMultiply, Value::Int(2), Value::Int(3)).unwrap();
        assert!(matches!(product, Value::Int(6)));
        let quotient = binary_op(Op::BinaryTrueDivide, Value::Int(1), Value::Int(2)).unwrap();
        assert!(matches!(quotient, Value::Float(f) if f == 0.5));
    }

    #[test]
    fn floor_and_modulo_follow_divisor_sign() {
        let floored = binary_op(Op::BinaryFloorDivide, Value::Int(-7), Value::Int(3)).unwrap();
        assert!(matches!(floored, Value::Int(-3)));
        let remainder = binary_op(Op::BinaryModulo, Value::Int(-7), Value::Int(3)).unwrap();
        assert!(matches!(remainder, Value::Int(2)));
        let negative = binary_op(Op::BinaryModulo, Value::Int(7), Value::Int(-3)).unwrap();
        assert!(matches!(negative, Value::Int(-2)));
    }

    #[test]
    fn division_by_zero_raises() {
        let err = binary_op(Op::BinaryTrueDivide, Value::Int(1), Value::Int(0)).unwrap_err();
        assert_eq!(err.exc_type, ExcType::ZeroDivisionError);
    }

    #[test]
    fn string_concat_and_repeat() {
        let joined = binary_op(Op::BinaryAdd, Value::str("ab"), Value::str("cd")).unwrap();
        assert_eq!(joined.py_str(), "abcd");
        let repeated = binary_op(Op::BinaryMultiply, Value::str("ab"), Value::Int(3)).unwrap();
        assert_eq!(repeated.py_str(), "ababab");
    }

    #[test]
    fn mixed_type_add_is_a_type_error() {
        let err = binary_op(Op::BinaryAdd, Value::Int(1), Value::str("x")).unwrap_err();
        assert_eq!(err.exc_type, ExcType::TypeError);
    }

    #[test]
    fn comparisons() {
        let base = dummy_class();
        let less = compare(Cmp::Lt, Value::Int(1), Value::Float(1.5), &base).unwrap();
        assert!(less.is_truthy());
        let member = compare(
            Cmp::In,
            Value::Int(2),
            Value::Tuple(Rc::new(vec![Value::Int(1), Value::Int(2)])),
            &base,
        )
        .unwrap();
        assert!(member.is_truthy());
    }
}
