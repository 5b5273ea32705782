//! Subscripting, literal construction, string interpolation, and the
//! per-entry config-merge opcode.

use super::Frame;
use crate::{
    ast::ConfigEntryOp,
    bytecode::op::Opcode,
    errors::{ErrorKind, KclError, KclResult, Span},
    unify::unify,
    value::{Dict, Value},
};

fn index_error(span: &Span, len: usize, index: i64) -> KclError {
    KclError::new(ErrorKind::EvaluationError, span.clone(), format!("index {index} out of range for a sequence of length {len}"))
}

/// Resolves a possibly-negative index against `len`, Python-style.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let resolved = if index < 0 { index + len as i64 } else { index };
    (resolved >= 0 && (resolved as usize) < len).then_some(resolved as usize)
}

fn subscript_get(base: &Value, index: &Value, span: &Span) -> KclResult<Value> {
    match (base, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len()).ok_or_else(|| index_error(span, items.len(), *i))?;
            Ok(items[idx].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len()).ok_or_else(|| index_error(span, chars.len(), *i))?;
            Ok(Value::str(chars[idx].to_string()))
        }
        (Value::Dict(d), Value::Str(key)) => Ok(d.get(key).cloned().unwrap_or(Value::Undefined)),
        (Value::Schema(instance), Value::Str(key)) => Ok(instance.borrow().attrs.get(key).cloned().unwrap_or(Value::Undefined)),
        _ => Err(KclError::new(
            ErrorKind::EvaluationError,
            span.clone(),
            format!("cannot subscript {} with {}", base.type_name(), index.type_name()),
        )),
    }
}

/// Applies `base[index] = value`, returning the updated `base`. Lists and
/// dicts are plain owned values here (no arena), so the update produces a
/// new value rather than mutating through a shared reference; the compiler
/// writes this result back through the name the base came from when it can
/// (`compiler::compile_store_target`).
fn subscript_set(mut base: Value, index: &Value, value: Value, span: &Span) -> KclResult<Value> {
    match (&mut base, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len()).ok_or_else(|| index_error(span, items.len(), *i))?;
            items[idx] = value;
        }
        (Value::Dict(d), Value::Str(key)) => d.insert(key.as_ref(), value, ConfigEntryOp::Override),
        (Value::Schema(instance), Value::Str(key)) => instance.borrow_mut().attrs.insert(key.as_ref(), value, ConfigEntryOp::Override),
        _ => {
            return Err(KclError::new(
                ErrorKind::EvaluationError,
                span.clone(),
                format!("cannot assign into {} with {}", base.type_name(), index.type_name()),
            ))
        }
    }
    Ok(base)
}

fn subscript_delete(mut base: Value, index: &Value, span: &Span) -> KclResult<()> {
    match (&mut base, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len()).ok_or_else(|| index_error(span, items.len(), *i))?;
            items.remove(idx);
        }
        (Value::Dict(d), Value::Str(key)) => {
            d.remove(key);
        }
        _ => {}
    }
    Ok(())
}

pub(super) fn exec_subscr(frame: &mut Frame, op: Opcode, span: &Span) -> KclResult<()> {
    match op {
        Opcode::BinarySubscr => {
            let index = frame.stack.pop().expect("stack underflow: BINARY_SUBSCR index");
            let base = frame.stack.pop().expect("stack underflow: BINARY_SUBSCR base");
            let value = subscript_get(&base, &index, span)?;
            frame.stack.push(value);
        }
        Opcode::StoreSubscr => {
            let index = frame.stack.pop().expect("stack underflow: STORE_SUBSCR index");
            let base = frame.stack.pop().expect("stack underflow: STORE_SUBSCR base");
            let value = frame.stack.pop().expect("stack underflow: STORE_SUBSCR value");
            frame.stack.push(subscript_set(base, &index, value, span)?);
        }
        Opcode::DeleteSubscr => {
            let index = frame.stack.pop().expect("stack underflow: DELETE_SUBSCR index");
            let base = frame.stack.pop().expect("stack underflow: DELETE_SUBSCR base");
            subscript_delete(base, &index, span)?;
        }
        _ => unreachable!("exec_subscr called with a non-subscript opcode"),
    }
    Ok(())
}

/// `GET_ITER`: normalizes the iterable on top of the stack into a
/// `[list, cursor]` pair. Dicts iterate as `[key, value]` pairs (so a
/// two-variable `for` destructures them directly), strings iterate as
/// one-character strings.
pub(super) fn exec_get_iter(frame: &mut Frame, span: &Span) -> KclResult<()> {
    let iterable = frame.stack.pop().expect("stack underflow: GET_ITER");
    let items = match iterable {
        Value::List(items) => items,
        Value::Dict(d) => d.iter().map(|(k, v)| Value::List(vec![Value::str(k.as_str()), v.clone()])).collect(),
        Value::Str(s) => s.chars().map(|c| Value::str(c.to_string())).collect(),
        other => {
            return Err(KclError::new(ErrorKind::EvaluationError, span.clone(), format!("{} is not iterable", other.type_name())));
        }
    };
    frame.stack.push(Value::List(items));
    frame.stack.push(Value::Int(0));
    Ok(())
}

pub(super) fn exec_build_list(frame: &mut Frame, operand: u32) {
    let n = operand as usize;
    let items = frame.stack.split_off(frame.stack.len() - n);
    frame.stack.push(Value::List(items));
}

pub(super) fn exec_build_map(frame: &mut Frame, operand: u32) {
    let n = operand as usize;
    let pairs = frame.stack.split_off(frame.stack.len() - 2 * n);
    let mut dict = Dict::new();
    for pair in pairs.chunks_exact(2) {
        let key = pair[0].to_string();
        dict.insert(key, pair[1].clone(), ConfigEntryOp::Override);
    }
    frame.stack.push(Value::Dict(dict));
}

pub(super) fn exec_build_string(frame: &mut Frame, operand: u32) {
    let n = operand as usize;
    let parts = frame.stack.split_off(frame.stack.len() - n);
    let joined: String = parts.iter().map(std::string::ToString::to_string).collect();
    frame.stack.push(Value::str(joined));
}

/// `FORMAT_VALUE`: applies an optional format spec (`{x:.2f}`-style) to the
/// value beneath it. Only the empty spec (no conversion) and `.<n>f` are
/// supported, matching the float-formatting case string interpolation
/// exercises.
pub(super) fn exec_format_value(frame: &mut Frame, operand: u32, span: &Span) -> KclResult<()> {
    let spec = frame.code.constants[operand as usize].clone();
    let value = frame.stack.pop().expect("stack underflow: FORMAT_VALUE");
    let formatted = match &spec {
        Value::Undefined => value.to_string(),
        Value::Str(spec) => format_with_spec(&value, spec, span)?,
        _ => unreachable!("FORMAT_VALUE spec constant is always Str or Undefined"),
    };
    frame.stack.push(Value::str(formatted));
    Ok(())
}

fn format_with_spec(value: &Value, spec: &str, span: &Span) -> KclResult<String> {
    if spec.is_empty() {
        return Ok(value.to_string());
    }
    if let Some(precision) = spec.strip_prefix('.').and_then(|s| s.strip_suffix('f')) {
        let precision: usize = precision
            .parse()
            .map_err(|_| KclError::new(ErrorKind::InvalidFormatSpec, span.clone(), format!("invalid format spec `{spec}`")))?;
        let f = value.as_float_for_arith().ok_or_else(|| {
            KclError::new(ErrorKind::InvalidFormatSpec, span.clone(), format!("format spec `{spec}` requires a numeric value"))
        })?;
        return Ok(format!("{f:.precision$}"));
    }
    Err(KclError::new(ErrorKind::InvalidFormatSpec, span.clone(), format!("unsupported format spec `{spec}`")))
}

/// `BUILD_SCHEMA_CONFIG`: pops `(accumulator, key, value)` and pushes the
/// accumulator merged with `{key: value}` under the entry's operator.
pub(super) fn exec_build_schema_config(frame: &mut Frame, operand: u32, span: &Span) -> KclResult<()> {
    let value = frame.stack.pop().expect("stack underflow: BUILD_SCHEMA_CONFIG value");
    let key = frame.stack.pop().expect("stack underflow: BUILD_SCHEMA_CONFIG key");
    let accumulator = frame.stack.pop().expect("stack underflow: BUILD_SCHEMA_CONFIG accumulator");
    let op = config_op_from_operand(operand);
    let key = key.to_string();

    let Value::Dict(mut dict) = accumulator else {
        unreachable!("BUILD_SCHEMA_CONFIG accumulator is always a Dict, seeded by compile_config");
    };
    let merged_entry = match dict.get(&key) {
        Some(existing) => unify(existing, &value, op, span)?,
        None => value,
    };
    dict.insert(key, merged_entry, op);
    frame.stack.push(Value::Dict(dict));
    Ok(())
}

fn config_op_from_operand(operand: u32) -> ConfigEntryOp {
    match operand {
        0 => ConfigEntryOp::Override,
        1 => ConfigEntryOp::Union,
        2 => ConfigEntryOp::Insert,
        other => unreachable!("config entry operand out of range: {other}"),
    }
}

/// `UNPACK_SEQUENCE`: pops a packed `List` of exactly `operand` items and
/// pushes its elements in order (so the last element ends on top, matching
/// `compile_comp_loop`'s reverse-order `STORE_*` sequence).
pub(super) fn exec_unpack_sequence(frame: &mut Frame, operand: u32, span: &Span) -> KclResult<()> {
    let packed = frame.stack.pop().expect("stack underflow: UNPACK_SEQUENCE");
    let Value::List(items) = packed else {
        return Err(KclError::new(ErrorKind::EvaluationError, span.clone(), format!("cannot unpack a {}", packed.type_name())));
    };
    if items.len() != operand as usize {
        return Err(KclError::new(
            ErrorKind::EvaluationError,
            span.clone(),
            format!("expected {operand} values to unpack, got {}", items.len()),
        ));
    }
    for item in items {
        frame.stack.push(item);
    }
    Ok(())
}
