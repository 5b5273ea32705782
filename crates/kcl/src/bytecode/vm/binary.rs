//! Arithmetic, comparison, and unary opcodes.

use super::{Frame, VmOptions};
use crate::{
    errors::{ErrorKind, KclError, KclResult, Span},
    value::{check_int_range, Value},
    bytecode::op::Opcode,
};

/// Pops the right then left operand, returning `(left, right)` in source
/// order (both sides of a binary expression are pushed left-then-right, so
/// the right operand sits on top).
fn pop2(frame: &mut Frame) -> (Value, Value) {
    let right = frame.stack.pop().expect("stack underflow: binary op rhs");
    let left = frame.stack.pop().expect("stack underflow: binary op lhs");
    (left, right)
}

fn type_error(span: &Span, op: &str, left: &Value, right: &Value) -> KclError {
    KclError::new(
        ErrorKind::EvaluationError,
        span.clone(),
        format!("unsupported operand types for {op}: `{}` and `{}`", left.type_name(), right.type_name()),
    )
}

pub(super) fn exec_arith(frame: &mut Frame, op: Opcode, options: VmOptions, span: &Span) -> KclResult<()> {
    let (left, right) = pop2(frame);
    let result = arith(op, &left, &right, options, span)?;
    frame.stack.push(result);
    Ok(())
}

fn arith(op: Opcode, left: &Value, right: &Value, options: VmOptions, span: &Span) -> KclResult<Value> {
    use Opcode::{
        BinaryAdd, BinaryAnd, BinaryFloorDivide, BinaryLShift, BinaryModulo, BinaryMul, BinaryOr, BinaryPower, BinaryRShift, BinarySub,
        BinaryTrueDivide, BinaryXor, InplaceAdd, InplaceAnd, InplaceFloorDivide, InplaceLShift, InplaceModulo, InplaceMul, InplaceOr,
        InplacePower, InplaceRShift, InplaceSub, InplaceTrueDivide, InplaceXor, LogicAnd, LogicOr,
    };

    match op {
        LogicAnd => return Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        LogicOr => return Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        BinaryAdd | InplaceAdd => {
            if let (Value::Str(a), Value::Str(b)) = (left, right) {
                return Ok(Value::str(format!("{a}{b}")));
            }
            if let (Value::List(a), Value::List(b)) = (left, right) {
                return Ok(Value::List(a.iter().chain(b.iter()).cloned().collect()));
            }
        }
        _ => {}
    }

    let is_float = matches!(left, Value::Float(_)) || matches!(right, Value::Float(_));
    if is_float {
        let (Some(a), Some(b)) = (left.as_float_for_arith(), right.as_float_for_arith()) else {
            return Err(type_error(span, "arithmetic", left, right));
        };
        let result = match op {
            BinaryAdd | InplaceAdd => a + b,
            BinarySub | InplaceSub => a - b,
            BinaryMul | InplaceMul => a * b,
            BinaryTrueDivide | InplaceTrueDivide => a / b,
            BinaryFloorDivide | InplaceFloorDivide => (a / b).floor(),
            BinaryModulo | InplaceModulo => a.rem_euclid(b),
            BinaryPower | InplacePower => a.powf(b),
            _ => return Err(type_error(span, "arithmetic", left, right)),
        };
        return Ok(Value::Float(result));
    }

    let (Some(a), Some(b)) = (left.as_int_for_arith(), right.as_int_for_arith()) else {
        return Err(type_error(span, "arithmetic", left, right));
    };
    let result = match op {
        BinaryAdd | InplaceAdd => a.checked_add(b),
        BinarySub | InplaceSub => a.checked_sub(b),
        BinaryMul | InplaceMul => a.checked_mul(b),
        BinaryTrueDivide | InplaceTrueDivide => {
            if b == 0 {
                return Err(KclError::new(ErrorKind::EvaluationError, span.clone(), "division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinaryFloorDivide | InplaceFloorDivide => {
            if b == 0 {
                return Err(KclError::new(ErrorKind::EvaluationError, span.clone(), "division by zero"));
            }
            Some(a.div_euclid(b))
        }
        BinaryModulo | InplaceModulo => {
            if b == 0 {
                return Err(KclError::new(ErrorKind::EvaluationError, span.clone(), "division by zero"));
            }
            Some(a.rem_euclid(b))
        }
        BinaryPower | InplacePower => a.checked_pow(u32::try_from(b).unwrap_or(0)),
        BinaryLShift | InplaceLShift => a.checked_shl(u32::try_from(b).unwrap_or(0)),
        BinaryRShift | InplaceRShift => a.checked_shr(u32::try_from(b).unwrap_or(0)),
        BinaryOr | InplaceOr => Some(a | b),
        BinaryXor | InplaceXor => Some(a ^ b),
        BinaryAnd | InplaceAnd => Some(a & b),
        _ => return Err(type_error(span, "arithmetic", left, right)),
    };
    let Some(result) = result else {
        return Err(KclError::new(ErrorKind::IntOverflow, span.clone(), format!("integer overflow computing {left} {op} {right}")));
    };
    check_int_range(result, options.strict_range_check, span)?;
    Ok(Value::Int(result))
}

pub(super) fn exec_compare(frame: &mut Frame, op: Opcode) -> KclResult<()> {
    let (left, right) = pop2(frame);
    let result = match op {
        Opcode::CompareEqualTo | Opcode::CompareIs => left == right,
        Opcode::CompareNotEqualTo | Opcode::CompareIsNot => left != right,
        Opcode::CompareLessThan => left.partial_cmp(&right).is_some_and(std::cmp::Ordering::is_lt),
        Opcode::CompareLessThanOrEqualTo => left.partial_cmp(&right).is_some_and(|o| o.is_le()),
        Opcode::CompareGreaterThan => left.partial_cmp(&right).is_some_and(std::cmp::Ordering::is_gt),
        Opcode::CompareGreaterThanOrEqualTo => left.partial_cmp(&right).is_some_and(|o| o.is_ge()),
        Opcode::CompareIn | Opcode::CompareNotIn => {
            let found = match (&left, &right) {
                (_, Value::List(items)) => items.contains(&left),
                (Value::Str(key), Value::Dict(d)) => d.contains_key(key),
                (Value::Str(needle), Value::Str(haystack)) => haystack.contains(needle.as_ref()),
                _ => false,
            };
            if matches!(op, Opcode::CompareNotIn) {
                !found
            } else {
                found
            }
        }
        _ => unreachable!("exec_compare called with a non-comparison opcode"),
    };
    frame.stack.push(Value::Bool(result));
    Ok(())
}

/// `x as Type`: a structural schema-tag test. `Type` is the mangled name
/// constant the compiler loads for the right-hand identifier; this only
/// checks the instance's own declared type, not its ancestor chain (the
/// common case — `x as Person` immediately after `Person { ... }`).
pub(super) fn exec_membership_as(frame: &mut Frame) -> KclResult<()> {
    let (left, right) = pop2(frame);
    let matches = match (&left, &right) {
        (Value::Schema(instance), Value::Str(tag)) => instance.borrow().type_name == tag.as_ref(),
        (other, Value::Str(tag)) => other.type_name() == tag.as_ref(),
        _ => false,
    };
    frame.stack.push(Value::Bool(matches));
    Ok(())
}

pub(super) fn exec_unary(frame: &mut Frame, op: Opcode, span: &Span) -> KclResult<()> {
    let value = frame.stack.pop().expect("stack underflow: unary op");
    let result = match op {
        Opcode::UnaryNot => Value::Bool(!value.is_truthy()),
        Opcode::UnaryPositive => value,
        Opcode::UnaryNegative => match &value {
            Value::Int(i) => Value::Int(-i),
            Value::Float(f) => Value::Float(-f),
            _ => return Err(type_error(span, "unary -", &value, &value)),
        },
        Opcode::UnaryInvert => match value.as_int_for_arith() {
            Some(i) => Value::Int(!i),
            None => return Err(type_error(span, "unary ~", &value, &value)),
        },
        _ => unreachable!("exec_unary called with a non-unary opcode"),
    };
    frame.stack.push(result);
    Ok(())
}
