//! Schema construction: inheritance/mixin attribute merging, the
//! self-bound construction frame, and lazy computed-attribute forcing.
//!
//! `compiler::compile_schema_body` currently compiles a schema's computed
//! attributes and `check` blocks as one flat, eagerly-run body rather than
//! per-attribute thunks, so `SchemaInstance::pending` is always empty in
//! practice. `read_attr`'s forcing path below is kept in place for the
//! per-attribute evaluation the field is reserved for, but is presently
//! unreachable; every attribute it sees already lives in `attrs` by the
//! time construction finishes running the body.

use std::{cell::RefCell, rc::Rc};

use super::{Frame, Vm};
use crate::{
    ast::ConfigEntryOp,
    bytecode::schema_type::SchemaType,
    errors::{ErrorKind, KclError, KclResult, Span},
    unify::unify,
    value::{Dict, DecoratorTarget, SchemaInstance, SchemaSettings, Value},
};

/// `BUILD_SCHEMA`: resolves `mangled` to its compiled `SchemaType`, merges
/// parent and mixin attributes (furthest ancestor first, so the explicit
/// `config` always wins last), then runs the schema body as a self-bound
/// frame so computed attributes and `check` blocks observe the merged
/// starting state.
pub(super) fn construct(vm: &mut Vm, mangled: &str, config: Value, span: &Span) -> KclResult<Value> {
    let schema_type = vm
        .schema_type(mangled)
        .ok_or_else(|| KclError::new(ErrorKind::CannotFindModule, span.clone(), format!("schema `{mangled}` was not compiled")))?;
    let Value::Dict(config) = config else { unreachable!("BUILD_SCHEMA config is always a Dict, seeded by compiler::compile_config") };

    let mut attrs = Dict::new();
    if let Some(parent) = &schema_type.parent {
        let parent_value = construct(vm, parent, Value::Dict(Dict::new()), span)?;
        if let Value::Schema(parent_instance) = parent_value {
            merge_attrs(&mut attrs, &parent_instance.borrow().attrs, span)?;
        }
    }
    for mixin in &schema_type.mixins {
        let mixin_value = construct(vm, mixin, Value::Dict(Dict::new()), span)?;
        if let Value::Schema(mixin_instance) = mixin_value {
            merge_attrs(&mut attrs, &mixin_instance.borrow().attrs, span)?;
        }
    }
    merge_attrs(&mut attrs, &config, span)?;

    let instance = Rc::new(RefCell::new(SchemaInstance {
        type_name: schema_type.name.clone(),
        attrs,
        settings: SchemaSettings {
            has_check: false,
            index_signature: schema_type.index_signature.clone(),
            relaxed: schema_type.relaxed,
            optional: schema_type.declared_attrs.iter().filter(|a| a.is_optional).map(|a| a.name.clone()).collect(),
        },
        pending: indexmap::IndexMap::new(),
        tracking: indexmap::IndexMap::new(),
    }));

    let mut frame = Frame::new(schema_type.body.clone(), schema_type.pkg.clone(), Rc::new(Vec::new()));
    frame.locals[0] = Value::Schema(instance.clone());
    frame.constructing = Some(instance.clone());
    vm.run_frame(&mut frame)?;

    warn_if_deprecated(vm, &schema_type, span);

    Ok(Value::Schema(instance))
}

/// Merges `source`'s entries into `target` by UNION, the same operator a
/// repeated top-level assignment uses (`Vm::store_global`) — a parent's or
/// mixin's attribute is a base value, not an override.
fn merge_attrs(target: &mut Dict, source: &Dict, span: &Span) -> KclResult<()> {
    for (key, value) in source.iter() {
        let merged = match target.get(key) {
            Some(existing) => unify(existing, value, ConfigEntryOp::Union, span)?,
            None => value.clone(),
        };
        target.insert(key.clone(), merged, ConfigEntryOp::Union);
    }
    Ok(())
}

fn warn_if_deprecated(vm: &mut Vm, schema_type: &SchemaType, span: &Span) {
    for decorator in &schema_type.decorators {
        if decorator.target == DecoratorTarget::SchemaType && decorator.name == "deprecated" {
            let message = decorator
                .kwargs
                .iter()
                .find(|(k, _)| k == "message")
                .map_or_else(|| format!("schema `{}` is deprecated", schema_type.name), |(_, v)| v.to_string());
            vm.diagnostics.push(KclError::new(ErrorKind::DeprecatedWarning, span.clone(), message));
        }
    }
}

/// `LOAD_ATTR` on a schema instance: attributes already forced into `attrs`
/// resolve directly; an attribute still sitting in `pending` (a computed
/// initializer not yet run — see `SchemaInstance`) is forced on first read,
/// with `tracking` catching a self-referential cycle.
pub(super) fn read_attr(vm: &mut Vm, instance: Rc<RefCell<SchemaInstance>>, name: &str, span: &Span) -> KclResult<Value> {
    if let Some(value) = instance.borrow().attrs.get(name).cloned() {
        return Ok(value);
    }
    let Some(thunk) = instance.borrow().pending.get(name).cloned() else {
        return Ok(Value::Undefined);
    };
    if instance.borrow().tracking.contains_key(name) {
        return Err(KclError::new(ErrorKind::RecursionError, span.clone(), format!("circular reference while computing attribute `{name}`")));
    }
    instance.borrow_mut().tracking.insert(name.to_owned(), 1);
    // `pending` carries no package of its own; nothing populates it yet
    // (see the module doc comment), so there is no caller-observed
    // `LOAD_GLOBAL` inside a thunk body to get wrong in practice.
    let mut frame = Frame::new(thunk, String::new(), Rc::new(Vec::new()));
    frame.locals[0] = Value::Schema(instance.clone());
    frame.constructing = Some(instance.clone());
    let result = vm.run_frame(&mut frame);
    instance.borrow_mut().tracking.shift_remove(name);
    let value = result?;
    instance.borrow_mut().pending.shift_remove(name);
    instance.borrow_mut().attrs.insert(name, value.clone(), ConfigEntryOp::Override);
    Ok(value)
}

/// `STORE_ATTR` on a schema instance: used both for a schema's own declared
/// defaults and for plain `self.x = expr` body statements. Either way an
/// attribute already present — set by the merged parent/mixin/config state
/// before the body ran — keeps that value rather than being overwritten, so
/// a caller-supplied config value always wins over the schema's own default.
pub(super) fn store_attr_insert_if_absent(instance: &mut SchemaInstance, name: &str, value: Value) {
    if !instance.attrs.contains_key(name) {
        instance.attrs.insert(name, value, ConfigEntryOp::Override);
    }
}
