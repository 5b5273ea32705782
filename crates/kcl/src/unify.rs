//! Unification / merge semantics.
//!
//! All dict and schema-instance merging — config application, top-level
//! redefinition, `+`/`+=` on containers — goes through [`unify`]. Keeping a
//! single entry point is what makes testable properties 3 and 4
//! (associativity of UNION, idempotency of OVERRIDE) provable by
//! construction rather than by accident.

use crate::{
    ast::ConfigEntryOp,
    errors::{ErrorKind, KclError, Span},
    value::{Dict, Value},
};

/// Merges `left` and `right` under `op`, left being the pre-existing value
/// and right the incoming one.
pub fn unify(left: &Value, right: &Value, op: ConfigEntryOp, span: &Span) -> Result<Value, KclError> {
    match (left, right) {
        (Value::Dict(l), Value::Dict(r)) => Ok(Value::Dict(unify_dict(l, r, op, span)?)),
        (Value::List(l), Value::List(r)) => Ok(match op {
            ConfigEntryOp::Insert => {
                let mut merged = l.clone();
                merged.extend(r.clone());
                Value::List(merged)
            }
            ConfigEntryOp::Override | ConfigEntryOp::Union => Value::List(r.clone()),
        }),
        (Value::Schema(l), Value::Schema(r)) => {
            let lb = l.borrow();
            let rb = r.borrow();
            if lb.type_name != rb.type_name {
                return Err(KclError::new(
                    ErrorKind::EvaluationError,
                    span.clone(),
                    format!("conflict unification types: {} and {}", lb.type_name, rb.type_name),
                ));
            }
            let merged_attrs = unify_dict(&lb.attrs, &rb.attrs, op, span)?;
            drop(lb);
            let mut out = r.borrow().clone();
            out.attrs = merged_attrs;
            Ok(Value::Schema(std::rc::Rc::new(std::cell::RefCell::new(out))))
        }
        (_, right) => match op {
            // Scalar/list overlap: the incoming (right) side wins.
            ConfigEntryOp::Union | ConfigEntryOp::Override => Ok(right.clone()),
            ConfigEntryOp::Insert => Ok(right.clone()),
        },
    }
}

/// Merges two ordered dicts under `op`, recursing into overlapping keys of
/// mergeable type. Key order follows `L` then new keys from `R` in first
/// appearance, the same ordering OVERRIDE and UNION both use — they differ
/// only in per-key overwrite-vs-merge behavior, not in resulting order.
pub fn unify_dict(left: &Dict, right: &Dict, op: ConfigEntryOp, span: &Span) -> Result<Dict, KclError> {
    let mut out = Dict::new();
    for (key, value) in left.iter() {
        out.insert(key.clone(), value.clone(), op);
    }
    for (key, r_value) in right.iter() {
        let merged = match out.get(key) {
            Some(l_value) if matches!(op, ConfigEntryOp::Union) && is_mergeable_pair(l_value, r_value) => {
                unify(l_value, r_value, op, span)?
            }
            Some(_) => r_value.clone(),
            None => r_value.clone(),
        };
        out.insert(key.clone(), merged, op);
    }
    Ok(out)
}

fn is_mergeable_pair(a: &Value, b: &Value) -> bool {
    matches!((a, b), (Value::Dict(_), Value::Dict(_)) | (Value::Schema(_), Value::Schema(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(pairs: &[(&str, Value)]) -> Value {
        let mut d = Dict::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone(), ConfigEntryOp::Union);
        }
        Value::Dict(d)
    }

    #[test]
    fn union_recurses_and_scalar_overlap_prefers_right() {
        let a = dict(&[("x", Value::Int(1)), ("y", dict(&[("a", Value::Int(1))]))]);
        let b = dict(&[("x", Value::Int(2)), ("y", dict(&[("b", Value::Int(2))]))]);
        let merged = unify(&a, &b, ConfigEntryOp::Union, &Span::dummy()).unwrap();
        let Value::Dict(d) = merged else { panic!() };
        assert_eq!(d.get("x"), Some(&Value::Int(2)));
        let Value::Dict(y) = d.get("y").unwrap() else { panic!() };
        assert_eq!(y.get("a"), Some(&Value::Int(1)));
        assert_eq!(y.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn union_is_associative() {
        let a = dict(&[("k", Value::Int(1))]);
        let b = dict(&[("k", Value::Int(2)), ("m", Value::Int(1))]);
        let c = dict(&[("m", Value::Int(2)), ("n", Value::Int(3))]);
        let span = Span::dummy();
        let left = unify(&unify(&a, &b, ConfigEntryOp::Union, &span).unwrap(), &c, ConfigEntryOp::Union, &span).unwrap();
        let right = unify(&a, &unify(&b, &c, ConfigEntryOp::Union, &span).unwrap(), ConfigEntryOp::Union, &span).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn override_is_idempotent() {
        let a = dict(&[("x", Value::Int(1))]);
        let span = Span::dummy();
        assert_eq!(unify(&a, &a, ConfigEntryOp::Override, &span).unwrap(), a);
        let b = dict(&[("x", Value::Int(2))]);
        let once = unify(&a, &b, ConfigEntryOp::Override, &span).unwrap();
        let twice = unify(&once, &b, ConfigEntryOp::Override, &span).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn override_preserves_non_overlapping_left_keys() {
        let a = dict(&[("x", Value::Int(1)), ("y", Value::Int(2))]);
        let b = dict(&[("x", Value::Int(9))]);
        let merged = unify(&a, &b, ConfigEntryOp::Override, &Span::dummy()).unwrap();
        let Value::Dict(d) = merged else { panic!() };
        assert_eq!(d.get("x"), Some(&Value::Int(9)));
        assert_eq!(d.get("y"), Some(&Value::Int(2)));
    }

    #[test]
    fn list_insert_appends() {
        let a = Value::List(vec![Value::Int(1)]);
        let b = Value::List(vec![Value::Int(2)]);
        let merged = unify(&a, &b, ConfigEntryOp::Insert, &Span::dummy()).unwrap();
        assert_eq!(merged, Value::List(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn disjoint_schema_types_conflict() {
        use crate::value::SchemaInstance;
        let a = Value::Schema(std::rc::Rc::new(std::cell::RefCell::new(SchemaInstance::new("A"))));
        let b = Value::Schema(std::rc::Rc::new(std::cell::RefCell::new(SchemaInstance::new("B"))));
        assert!(unify(&a, &b, ConfigEntryOp::Union, &Span::dummy()).is_err());
    }
}
