//! Function calls: binding positional/keyword arguments, invoking user
//! closures through a fresh [`Frame`], and the built-in function table.

use std::{cmp::Ordering, rc::Rc};

use super::{Frame, Vm};
use crate::{
    errors::{ErrorKind, KclError, KclResult, Span},
    value::{Closure, Dict, FunctionValue, ParamSlot, Value},
};

/// `MAKE_FUNCTION`: pops the function value pushed by `LOAD_CONST` and the
/// `operand` free values beneath it (pushed in capture order by
/// `compiler::compile_lambda`), and pushes a `Closure` pairing them.
pub(super) fn exec_make_function(frame: &mut Frame, operand: u32) {
    let n_free = operand as usize;
    let function_value = frame.stack.pop().expect("stack underflow: MAKE_FUNCTION function");
    let Value::Function(function) = function_value else {
        unreachable!("MAKE_FUNCTION always follows a LOAD_CONST of a Function value")
    };
    let free = frame.stack.split_off(frame.stack.len() - n_free);
    frame.stack.push(Value::Closure(Closure { function, free: Rc::new(free) }));
}

struct Call {
    func: Value,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
}

/// `CALL_FUNCTION(operand)`: `operand` packs `(kwcount << 12) | argcount`
/// (`compiler::compile_call`). The stack holds, bottom to top: the callee,
/// `argcount` positional values, then `kwcount` `(name, value)` pairs.
fn pop_call(frame: &mut Frame, operand: u32) -> Call {
    let argcount = (operand & 0x0FFF) as usize;
    let kwcount = (operand >> 12) as usize;
    let total = argcount + 2 * kwcount;
    let mut rest = frame.stack.split_off(frame.stack.len() - total);
    let func = frame.stack.pop().expect("stack underflow: CALL_FUNCTION func");
    let kwpart = rest.split_off(argcount);
    let kwargs = kwpart
        .chunks_exact(2)
        .map(|pair| {
            let Value::Str(name) = &pair[0] else { unreachable!("keyword name is always a Str constant") };
            (name.to_string(), pair[1].clone())
        })
        .collect();
    Call { func, args: rest, kwargs }
}

pub(super) fn exec_call(vm: &mut Vm, frame: &mut Frame, operand: u32, span: &Span) -> KclResult<()> {
    let call = pop_call(frame, operand);
    let result = match &call.func {
        Value::BuiltIn(name) => call_builtin(name, &call.args, &call.kwargs, span)?,
        Value::Function(function) => call_user_function(vm, function, Rc::new(Vec::new()), &call.args, &call.kwargs, span)?,
        Value::Closure(closure) => call_user_function(vm, &closure.function, closure.free.clone(), &call.args, &call.kwargs, span)?,
        other => return Err(KclError::new(ErrorKind::EvaluationError, span.clone(), format!("{} is not callable", other.type_name()))),
    };
    frame.stack.push(result);
    Ok(())
}

fn call_user_function(
    vm: &mut Vm,
    function: &Rc<FunctionValue>,
    free: Rc<Vec<Value>>,
    args: &[Value],
    kwargs: &[(String, Value)],
    span: &Span,
) -> KclResult<Value> {
    let mut callee = Frame::new(function.code.clone(), function.pkg.clone(), free);
    bind_params(&function.params, args, kwargs, &mut callee.locals, span)?;
    vm.run_frame(&mut callee)
}

/// Binds positional then keyword arguments into the callee's local slots
/// (params occupy locals `0..params.len()`, per `compiler::compile_lambda`'s
/// definition order), falling back to each parameter's own default.
fn bind_params(params: &[ParamSlot], args: &[Value], kwargs: &[(String, Value)], locals: &mut [Value], span: &Span) -> KclResult<()> {
    if args.len() > params.len() {
        return Err(KclError::new(
            ErrorKind::IllegalArgumentError,
            span.clone(),
            format!("expected at most {} arguments, got {}", params.len(), args.len()),
        ));
    }
    for (i, param) in params.iter().enumerate() {
        locals[i] = match args.get(i) {
            Some(v) => v.clone(),
            None => param.default.clone().unwrap_or(Value::Undefined),
        };
    }
    for (name, value) in kwargs {
        let idx = params
            .iter()
            .position(|p| &p.name == name)
            .ok_or_else(|| KclError::new(ErrorKind::IllegalArgumentError, span.clone(), format!("no such parameter `{name}`")))?;
        locals[idx] = value.clone();
    }
    Ok(())
}

fn type_err(span: &Span, func: &str, got: &Value) -> KclError {
    KclError::new(ErrorKind::IllegalArgumentError, span.clone(), format!("{func}() got an argument of unsupported type `{}`", got.type_name()))
}

fn arity_err(span: &Span, func: &str, n: usize) -> KclError {
    KclError::new(ErrorKind::IllegalArgumentError, span.clone(), format!("{func}() requires {n} argument(s)"))
}

fn iter_arg(func: &str, args: &[Value], span: &Span) -> KclResult<Vec<Value>> {
    match args.first() {
        Some(Value::List(l)) => Ok(l.clone()),
        Some(other) => Err(type_err(span, func, other)),
        None => Err(arity_err(span, func, 1)),
    }
}

fn coerce_int(arg: Option<&Value>, span: &Span) -> KclResult<i64> {
    match arg {
        Some(Value::Str(s)) => {
            s.trim().parse().map_err(|_| KclError::new(ErrorKind::IllegalArgumentError, span.clone(), format!("cannot convert `{s}` to int")))
        }
        Some(other) => other.as_int_for_arith().ok_or_else(|| type_err(span, "int", other)),
        None => Ok(0),
    }
}

fn coerce_float(arg: Option<&Value>, span: &Span) -> KclResult<f64> {
    match arg {
        Some(Value::Str(s)) => {
            s.trim().parse().map_err(|_| KclError::new(ErrorKind::IllegalArgumentError, span.clone(), format!("cannot convert `{s}` to float")))
        }
        Some(other) => other.as_float_for_arith().ok_or_else(|| type_err(span, "float", other)),
        None => Ok(0.0),
    }
}

fn add_values(a: &Value, b: &Value, span: &Span) -> KclResult<Value> {
    if matches!(a, Value::Float(_)) || matches!(b, Value::Float(_)) {
        let (Some(x), Some(y)) = (a.as_float_for_arith(), b.as_float_for_arith()) else { return Err(type_err(span, "sum", b)) };
        Ok(Value::Float(x + y))
    } else {
        let (Some(x), Some(y)) = (a.as_int_for_arith(), b.as_int_for_arith()) else { return Err(type_err(span, "sum", b)) };
        x.checked_add(y).map(Value::Int).ok_or_else(|| KclError::new(ErrorKind::IntOverflow, span.clone(), "sum() overflowed"))
    }
}

fn build_range(args: &[Value], span: &Span) -> KclResult<Value> {
    let ints = args.iter().map(|v| v.as_int_for_arith().ok_or_else(|| type_err(span, "range", v))).collect::<KclResult<Vec<_>>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(arity_err(span, "range", 1)),
    };
    if step == 0 {
        return Err(KclError::new(ErrorKind::IllegalArgumentError, span.clone(), "range() step cannot be zero"));
    }
    let mut out = Vec::new();
    let mut i = start;
    if step > 0 {
        while i < stop {
            out.push(Value::Int(i));
            i += step;
        }
    } else {
        while i > stop {
            out.push(Value::Int(i));
            i += step;
        }
    }
    Ok(Value::List(out))
}

/// The fixed built-in table (`symtable::BUILTIN_FUNCTIONS`). Each resolves
/// immediately — none of them re-enter the evaluator.
fn call_builtin(name: &str, args: &[Value], kwargs: &[(String, Value)], span: &Span) -> KclResult<Value> {
    match name {
        "print" => {
            let rendered: Vec<String> = args.iter().map(std::string::ToString::to_string).collect();
            println!("{}", rendered.join(" "));
            Ok(Value::Undefined)
        }
        // No CLI option source is threaded into the evaluator itself; an
        // un-injected option resolves to its declared default.
        "option" => Ok(kwargs.iter().find(|(k, _)| k == "default").map(|(_, v)| v.clone()).or_else(|| args.get(1).cloned()).unwrap_or(Value::Undefined)),
        "len" => match args.first() {
            Some(Value::Str(s)) => Ok(Value::Int(i64::try_from(s.chars().count()).unwrap_or(i64::MAX))),
            Some(Value::List(l)) => Ok(Value::Int(i64::try_from(l.len()).unwrap_or(i64::MAX))),
            Some(Value::Dict(d)) => Ok(Value::Int(i64::try_from(d.len()).unwrap_or(i64::MAX))),
            Some(other) => Err(type_err(span, "len", other)),
            None => Err(arity_err(span, "len", 1)),
        },
        "type" | "typeof" => Ok(Value::str(args.first().map_or("UndefinedType", Value::type_name))),
        "multiplyof" => {
            let (Some(a), Some(b)) = (args.first().and_then(Value::as_int_for_arith), args.get(1).and_then(Value::as_int_for_arith)) else {
                return Err(arity_err(span, "multiplyof", 2));
            };
            Ok(Value::Bool(b != 0 && a % b == 0))
        }
        "str" => Ok(Value::str(args.first().map_or_else(String::new, std::string::ToString::to_string))),
        "int" => Ok(Value::Int(coerce_int(args.first(), span)?)),
        "float" => Ok(Value::Float(coerce_float(args.first(), span)?)),
        "bool" => Ok(Value::Bool(args.first().is_some_and(Value::is_truthy))),
        "list" => Ok(Value::List(match args.first() {
            Some(Value::List(l)) => l.clone(),
            Some(Value::Dict(d)) => d.iter().map(|(k, _)| Value::str(k.as_str())).collect(),
            Some(Value::Str(s)) => s.chars().map(|c| Value::str(c.to_string())).collect(),
            _ => Vec::new(),
        })),
        "dict" => match args.first() {
            Some(Value::Dict(d)) => Ok(Value::Dict(d.clone())),
            _ => Ok(Value::Dict(Dict::new())),
        },
        "range" => build_range(args, span),
        "abs" => match args.first() {
            Some(Value::Int(i)) => Ok(Value::Int(i.abs())),
            Some(Value::Float(f)) => Ok(Value::Float(f.abs())),
            Some(other) => Err(type_err(span, "abs", other)),
            None => Err(arity_err(span, "abs", 1)),
        },
        "all" => Ok(Value::Bool(iter_arg("all", args, span)?.iter().all(Value::is_truthy))),
        "any" => Ok(Value::Bool(iter_arg("any", args, span)?.iter().any(Value::is_truthy))),
        "sum" => {
            let items = iter_arg("sum", args, span)?;
            let start = args.get(1).cloned().unwrap_or(Value::Int(0));
            items.iter().try_fold(start, |acc, v| add_values(&acc, v, span))
        }
        "max" | "min" => {
            let items = if args.len() == 1 { iter_arg(name, args, span)? } else { args.to_vec() };
            let pick = if name == "max" {
                items.into_iter().reduce(|a, b| if b.partial_cmp(&a).is_some_and(Ordering::is_gt) { b } else { a })
            } else {
                items.into_iter().reduce(|a, b| if b.partial_cmp(&a).is_some_and(Ordering::is_lt) { b } else { a })
            };
            pick.ok_or_else(|| arity_err(span, name, 1))
        }
        "sorted" => {
            let mut items = iter_arg("sorted", args, span)?;
            items.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            Ok(Value::List(items))
        }
        "hasattr" => match (args.first(), args.get(1)) {
            (Some(Value::Schema(instance)), Some(Value::Str(attr))) => Ok(Value::Bool(instance.borrow().attrs.contains_key(attr))),
            (Some(Value::Dict(d)), Some(Value::Str(attr))) => Ok(Value::Bool(d.contains_key(attr))),
            _ => Ok(Value::Bool(false)),
        },
        "isinstance" => match (args.first(), args.get(1)) {
            (Some(Value::Schema(instance)), Some(Value::Str(tag))) => Ok(Value::Bool(instance.borrow().type_name == tag.as_ref())),
            (Some(other), Some(Value::Str(tag))) => Ok(Value::Bool(other.type_name() == tag.as_ref())),
            _ => Err(arity_err(span, "isinstance", 2)),
        },
        other => Err(KclError::new(ErrorKind::EvaluationError, span.clone(), format!("unknown built-in function `{other}`"))),
    }
}
