//! The evaluator: a stack machine with frame discipline.

mod binary;
mod call;
mod collections;
mod schema;

use std::rc::Rc;

use ahash::AHashMap;

use super::{
    code::Code,
    compiler::CompiledProgram,
    op::Opcode,
    schema_type::{RuleType, SchemaType},
};
use crate::{
    ast::ConfigEntryOp,
    errors::{Diagnostics, ErrorKind, KclError, KclResult, Span},
    unify::unify,
    value::{Dict, SchemaInstance, Value},
};

/// Per-invocation knobs: strict-range-check toggles
/// 32-bit vs. 64-bit overflow thresholds (testable property 8).
#[derive(Debug, Clone, Copy, Default)]
pub struct VmOptions {
    pub strict_range_check: bool,
}

/// A single activation record: program counter, value
/// stack, locals sized to the code's `num_locals`, free-slot array, and the
/// schema instance under construction (if any) for attribute-thunk forcing.
pub(crate) struct Frame {
    pub code: Rc<Code>,
    pub pc: usize,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub free: Rc<Vec<Value>>,
    pub pkg: String,
    pub constructing: Option<Rc<std::cell::RefCell<SchemaInstance>>>,
}

impl Frame {
    fn new(code: Rc<Code>, pkg: impl Into<String>, free: Rc<Vec<Value>>) -> Self {
        let num_locals = code.num_locals as usize;
        Self { pc: 0, stack: Vec::new(), locals: vec![Value::Undefined; num_locals], free, code, pkg: pkg.into(), constructing: None }
    }

    /// Fetches the opcode at `pc`, advances `pc` past it, and returns the
    /// decoded `(opcode, operand, span)` — the span covers the instruction's
    /// *starting* offset, captured before `pc` moves past it.
    fn fetch(&mut self) -> (Opcode, u32, Span) {
        let start = self.pc;
        let byte = self.code.instructions[start];
        let op = Opcode::from_repr(byte)
            .expect("bytecode invariant: every instruction byte is an Opcode discriminant written by CodeBuilder");
        let operand = if op.has_operand() { self.code.read_operand(start) } else { 0 };
        self.pc += if op.has_operand() { 4 } else { 1 };
        let span = self.code.span_at(start as u32).cloned().unwrap_or_else(Span::dummy);
        (op, operand, span)
    }
}

/// The VM: not `Send`, single-threaded and cooperative —
/// a caller compiles once and runs once per `Vm` value.
pub struct Vm {
    pub(crate) program: Rc<CompiledProgram>,
    pub(crate) globals: AHashMap<String, Vec<Option<Value>>>,
    pub(crate) options: VmOptions,
    pub diagnostics: Diagnostics,
}

impl Vm {
    #[must_use]
    pub fn new(program: CompiledProgram, options: VmOptions) -> Self {
        Self { program: Rc::new(program), globals: AHashMap::new(), options, diagnostics: Diagnostics::new() }
    }

    pub(crate) fn schema_type(&self, mangled: &str) -> Option<Rc<SchemaType>> {
        self.program.schema_types.get(mangled).cloned()
    }

    fn construct_schema(&mut self, mangled: &str, config: Value, span: &Span) -> KclResult<Value> {
        schema::construct(self, mangled, config, span)
    }

    #[allow(dead_code)]
    fn rule_type(&self, mangled: &str) -> Option<Rc<RuleType>> {
        self.program.rule_types.get(mangled).cloned()
    }

    /// Runs the main package to completion, returning its final ordered
    /// binding dict.
    pub fn run_main(&mut self) -> KclResult<Value> {
        let main = self.program.main.clone();
        self.run_package(&main)
    }

    pub(crate) fn run_package(&mut self, pkg: &str) -> KclResult<Value> {
        let Some(code) = self.program.packages.get(pkg).cloned() else {
            return Err(KclError::new(ErrorKind::CannotFindModule, Span::dummy(), format!("package `{pkg}` was not compiled")));
        };
        self.globals.entry(pkg.to_owned()).or_insert_with(|| vec![None; code.num_locals as usize]);
        let names = code.global_names.clone();
        let mut frame = Frame::new(code, pkg, Rc::new(Vec::new()));
        self.run_frame(&mut frame)?;

        let slots = self.globals.get(pkg).cloned().unwrap_or_default();
        let mut out = Dict::new();
        for (idx, slot) in slots.into_iter().enumerate() {
            if let Some(value) = slot {
                if value.is_undefined() {
                    continue;
                }
                let name = names.get(idx).filter(|n| !n.is_empty()).cloned().unwrap_or_else(|| format!("_slot{idx}"));
                out.insert(name, value, ConfigEntryOp::Override);
            }
        }
        Ok(Value::Dict(out))
    }

    /// The fetch-decode-execute loop. Dispatches by
    /// opcode group; every fallible opcode attaches the fetched instruction's
    /// span.
    pub(crate) fn run_frame(&mut self, frame: &mut Frame) -> KclResult<Value> {
        loop {
            if frame.pc >= frame.code.instructions.len() {
                return Ok(Value::Undefined);
            }
            let (op, operand, span) = frame.fetch();
            match op {
                Opcode::Pop => {
                    frame.stack.pop();
                }
                Opcode::DupTop => {
                    let top = frame.stack.last().cloned().expect("stack underflow: DUP_TOP");
                    frame.stack.push(top);
                }
                Opcode::DupTopTwo => {
                    let len = frame.stack.len();
                    let a = frame.stack[len - 2].clone();
                    let b = frame.stack[len - 1].clone();
                    frame.stack.push(a);
                    frame.stack.push(b);
                }
                Opcode::RotTwo => {
                    let len = frame.stack.len();
                    frame.stack.swap(len - 1, len - 2);
                }
                Opcode::RotThree => {
                    let len = frame.stack.len();
                    frame.stack[len - 3..].rotate_right(1);
                }
                Opcode::LoadConst => frame.stack.push(frame.code.constants[operand as usize].clone()),
                Opcode::LoadLocal => frame.stack.push(frame.locals[operand as usize].clone()),
                Opcode::LoadFree => frame.stack.push(frame.free[operand as usize].clone()),
                Opcode::LoadBuiltIn => frame.stack.push(Value::BuiltIn(crate::symtable::BUILTIN_FUNCTIONS[operand as usize].to_owned())),
                Opcode::LoadGlobal | Opcode::LoadName => {
                    let value = self.load_global(&frame.pkg, operand);
                    frame.stack.push(value);
                }
                Opcode::StoreLocal => frame.locals[operand as usize] = frame.stack.pop().expect("stack underflow: STORE_LOCAL"),
                Opcode::StoreFree => {
                    return Err(KclError::new(ErrorKind::EvaluationError, span, "cannot assign to a captured free variable"))
                }
                Opcode::StoreGlobal | Opcode::StoreName => {
                    let value = frame.stack.pop().expect("stack underflow: STORE_GLOBAL");
                    self.store_global(&frame.pkg, operand, value, &span)?;
                }
                Opcode::DeleteLocal => frame.locals[operand as usize] = Value::Undefined,
                Opcode::DeleteGlobal | Opcode::DeleteName => {
                    if let Some(slot) = self.globals.get_mut(&frame.pkg).and_then(|s| s.get_mut(operand as usize)) {
                        *slot = None;
                    }
                }
                Opcode::LoadAttr => {
                    let base = frame.stack.pop().expect("stack underflow: LOAD_ATTR");
                    let name = frame.code.names[operand as usize].clone();
                    let value = self.load_attr(&base, &name, &span)?;
                    frame.stack.push(value);
                }
                Opcode::StoreAttr => {
                    let base = frame.stack.pop().expect("stack underflow: STORE_ATTR base");
                    let value = frame.stack.pop().expect("stack underflow: STORE_ATTR value");
                    let name = frame.code.names[operand as usize].clone();
                    self.store_attr(&base, &name, value, &span)?;
                }
                Opcode::DeleteAttr => {
                    let base = frame.stack.pop().expect("stack underflow: DELETE_ATTR");
                    if let Value::Schema(instance) = &base {
                        let name = frame.code.names[operand as usize].clone();
                        instance.borrow_mut().attrs.remove(&name);
                    }
                }
                Opcode::BinarySubscr | Opcode::StoreSubscr | Opcode::DeleteSubscr => {
                    collections::exec_subscr(frame, op, &span)?;
                }
                Opcode::BinaryAdd
                | Opcode::BinarySub
                | Opcode::BinaryMul
                | Opcode::BinaryTrueDivide
                | Opcode::BinaryFloorDivide
                | Opcode::BinaryModulo
                | Opcode::BinaryPower
                | Opcode::BinaryLShift
                | Opcode::BinaryRShift
                | Opcode::BinaryOr
                | Opcode::BinaryXor
                | Opcode::BinaryAnd
                | Opcode::LogicAnd
                | Opcode::LogicOr
                | Opcode::InplaceAdd
                | Opcode::InplaceSub
                | Opcode::InplaceMul
                | Opcode::InplaceTrueDivide
                | Opcode::InplaceFloorDivide
                | Opcode::InplaceModulo
                | Opcode::InplacePower
                | Opcode::InplaceLShift
                | Opcode::InplaceRShift
                | Opcode::InplaceOr
                | Opcode::InplaceXor
                | Opcode::InplaceAnd => binary::exec_arith(frame, op, self.options, &span)?,
                Opcode::CompareEqualTo
                | Opcode::CompareNotEqualTo
                | Opcode::CompareLessThan
                | Opcode::CompareLessThanOrEqualTo
                | Opcode::CompareGreaterThan
                | Opcode::CompareGreaterThanOrEqualTo
                | Opcode::CompareIs
                | Opcode::CompareIsNot
                | Opcode::CompareIn
                | Opcode::CompareNotIn => binary::exec_compare(frame, op)?,
                Opcode::MembershipAs => binary::exec_membership_as(frame)?,
                Opcode::UnaryPositive | Opcode::UnaryNegative | Opcode::UnaryInvert | Opcode::UnaryNot => {
                    binary::exec_unary(frame, op, &span)?
                }
                Opcode::JumpAbsolute => frame.pc = jump_target(frame.pc, operand),
                Opcode::PopJumpIfTrue => {
                    let cond = frame.stack.pop().expect("stack underflow: POP_JUMP_IF_TRUE");
                    if cond.is_truthy() {
                        frame.pc = jump_target(frame.pc, operand);
                    }
                }
                Opcode::PopJumpIfFalse => {
                    let cond = frame.stack.pop().expect("stack underflow: POP_JUMP_IF_FALSE");
                    if !cond.is_truthy() {
                        frame.pc = jump_target(frame.pc, operand);
                    }
                }
                Opcode::JumpIfTrueOrPop => {
                    let cond = frame.stack.last().expect("stack underflow: JUMP_IF_TRUE_OR_POP");
                    if cond.is_truthy() {
                        frame.pc = jump_target(frame.pc, operand);
                    } else {
                        frame.stack.pop();
                    }
                }
                Opcode::JumpIfFalseOrPop => {
                    let cond = frame.stack.last().expect("stack underflow: JUMP_IF_FALSE_OR_POP");
                    if !cond.is_truthy() {
                        frame.pc = jump_target(frame.pc, operand);
                    } else {
                        frame.stack.pop();
                    }
                }
                Opcode::GetIter => collections::exec_get_iter(frame, &span)?,
                Opcode::ForIter => {
                    // State on the stack is `[list, index]`, index on top.
                    // Continuing an iteration replaces `index` with
                    // `index + 1` and pushes the current item; exhaustion
                    // drops both and jumps past the loop body.
                    let index = frame.stack.pop().expect("stack underflow: FOR_ITER index");
                    let Value::Int(idx) = index else { unreachable!("FOR_ITER index is always an Int") };
                    let Some(Value::List(items)) = frame.stack.last() else {
                        unreachable!("FOR_ITER list is always a List, pushed by GET_ITER")
                    };
                    if (idx as usize) < items.len() {
                        let item = items[idx as usize].clone();
                        frame.stack.push(Value::Int(idx + 1));
                        frame.stack.push(item);
                    } else {
                        frame.stack.pop();
                        frame.pc = jump_target(frame.pc, operand);
                    }
                }
                Opcode::BuildList => collections::exec_build_list(frame, operand),
                Opcode::BuildMap => collections::exec_build_map(frame, operand),
                Opcode::BuildString => collections::exec_build_string(frame, operand),
                Opcode::FormatValue => collections::exec_format_value(frame, operand, &span)?,
                Opcode::BuildSchemaConfig => collections::exec_build_schema_config(frame, operand, &span)?,
                Opcode::MakeFunction => call::exec_make_function(frame, operand),
                Opcode::MakeDecorator => {}
                Opcode::BuildSchema => {
                    let mangled = frame.code.names[operand as usize].clone();
                    let config = frame.stack.pop().expect("stack underflow: BUILD_SCHEMA config");
                    let instance = self.construct_schema(&mangled, config, &span)?;
                    frame.stack.push(instance);
                }
                Opcode::UnpackSequence => collections::exec_unpack_sequence(frame, operand, &span)?,
                Opcode::CallFunction => call::exec_call(self, frame, operand, &span)?,
                Opcode::ReturnValue => return Ok(frame.stack.pop().unwrap_or(Value::Undefined)),
                Opcode::Raise => {
                    let message = frame.stack.pop().unwrap_or(Value::Undefined);
                    return Err(KclError::new(ErrorKind::EvaluationError, span, message.to_string()));
                }
                Opcode::Assert => {
                    let message = frame.stack.pop().expect("stack underflow: ASSERT message");
                    let cond = frame.stack.pop().expect("stack underflow: ASSERT cond");
                    if !cond.is_truthy() {
                        return Err(KclError::new(ErrorKind::AssertionError, span, message.to_string()));
                    }
                }
                Opcode::Check => {
                    let message = frame.stack.pop().expect("stack underflow: CHECK message");
                    let cond = frame.stack.pop().expect("stack underflow: CHECK cond");
                    if !cond.is_truthy() {
                        let text = if message.is_undefined() { "check failed".to_owned() } else { message.to_string() };
                        return Err(KclError::new(ErrorKind::SchemaCheckFailure, span, text));
                    }
                }
                Opcode::ImportName => {
                    let path = frame.code.names[operand as usize].clone();
                    let loaded = self.run_package(&path)?;
                    frame.stack.push(loaded);
                }
                Opcode::ImportFrom => {
                    let name = frame.code.names[operand as usize].clone();
                    let module = frame.stack.last().cloned().expect("stack underflow: IMPORT_FROM");
                    let value = self.load_attr(&module, &name, &span)?;
                    frame.stack.push(value);
                }
                Opcode::DebugGlobals | Opcode::DebugLocals | Opcode::DebugNames | Opcode::DebugStack => {}
            }
        }
    }

    fn load_global(&self, pkg: &str, idx: u32) -> Value {
        self.globals.get(pkg).and_then(|s| s.get(idx as usize)).and_then(|v| v.clone()).unwrap_or(Value::Undefined)
    }

    /// Stores into a global slot. A pre-existing binding is merged with the
    /// incoming value by UNION rather than overwritten: top-level
    /// re-assignment to the same name is how KCL layers configuration
    /// rather than ordinary imperative rebinding.
    pub(crate) fn store_global(&mut self, pkg: &str, idx: u32, value: Value, span: &Span) -> KclResult<()> {
        let slots = self.globals.entry(pkg.to_owned()).or_default();
        if slots.len() <= idx as usize {
            slots.resize(idx as usize + 1, None);
        }
        let merged = match &slots[idx as usize] {
            Some(existing) if !existing.is_undefined() => unify(existing, &value, ConfigEntryOp::Union, span)?,
            _ => value,
        };
        slots[idx as usize] = Some(merged);
        Ok(())
    }

    pub(crate) fn load_attr(&mut self, base: &Value, name: &str, span: &Span) -> KclResult<Value> {
        match base {
            Value::Schema(instance) => schema::read_attr(self, instance.clone(), name, span),
            Value::Dict(d) => Ok(d.get(name).cloned().unwrap_or(Value::Undefined)),
            _ => Err(KclError::new(ErrorKind::AttributeError, span.clone(), format!("{} has no attribute `{name}`", base.type_name()))),
        }
    }

    fn store_attr(&mut self, base: &Value, name: &str, value: Value, span: &Span) -> KclResult<()> {
        match base {
            Value::Schema(instance) => {
                schema::store_attr_insert_if_absent(&mut instance.borrow_mut(), name, value);
                Ok(())
            }
            _ => Err(KclError::new(ErrorKind::CannotAddMembers, span.clone(), format!("cannot set attribute on {}", base.type_name()))),
        }
    }
}

fn sign_extend_24(raw: u32) -> i32 {
    if raw & 0x0080_0000 != 0 {
        (raw | 0xFF00_0000) as i32
    } else {
        raw as i32
    }
}

/// Resolves a jump operand to an absolute offset. `pc` must already be
/// advanced past the jump instruction (as `Frame::fetch` leaves it); the
/// delta is encoded relative to the jump instruction's own start, four bytes
/// earlier, so the two adjustments cancel for a zero-length instruction span.
fn jump_target(pc: usize, operand: u32) -> usize {
    (pc as i64 + i64::from(sign_extend_24(operand)) - 4) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ast::{AssignTarget, Expr, Identifier, Module, Program, Stmt},
        bytecode::compiler::compile_program,
    };

    fn run(stmts: Vec<Stmt>) -> Value {
        let program = Program::single_module("main", Module::new("main.k", stmts));
        let compiled = compile_program(&program).unwrap();
        let mut vm = Vm::new(compiled, VmOptions::default());
        vm.run_main().unwrap()
    }

    #[test]
    fn top_level_assign_round_trips() {
        let result = run(vec![Stmt::Assign {
            targets: vec![AssignTarget::Name(Identifier::single("x"))],
            value: Expr::Int(7),
            span: Span::dummy(),
        }]);
        let Value::Dict(d) = result else { panic!() };
        assert_eq!(d.get("x"), Some(&Value::Int(7)));
    }

    #[test]
    fn repeated_assign_unions_dicts() {
        use crate::ast::{ConfigEntry, ConfigKey};
        let entry = |k: &str, v: i64| ConfigEntry {
            key: ConfigKey::Name(Identifier::single(k)),
            value: Expr::Int(v),
            op: ConfigEntryOp::Union,
            span: Span::dummy(),
        };
        let stmts = vec![
            Stmt::Assign { targets: vec![AssignTarget::Name(Identifier::single("x"))], value: Expr::Config(vec![entry("a", 1)]), span: Span::dummy() },
            Stmt::Assign { targets: vec![AssignTarget::Name(Identifier::single("x"))], value: Expr::Config(vec![entry("b", 2)]), span: Span::dummy() },
        ];
        let result = run(stmts);
        let Value::Dict(d) = result else { panic!() };
        let Value::Dict(x) = d.get("x").unwrap() else { panic!() };
        assert_eq!(x.get("a"), Some(&Value::Int(1)));
        assert_eq!(x.get("b"), Some(&Value::Int(2)));
    }

    #[test]
    fn for_loop_over_list_visits_every_element() {
        use crate::ast::QuantifierKind;
        // sum = [x for x in [1, 2, 3]] via the MAP quantifier, then assigned.
        let stmts = vec![Stmt::Assign {
            targets: vec![AssignTarget::Name(Identifier::single("doubled"))],
            value: Expr::Quantifier {
                kind: QuantifierKind::Map,
                vars: vec!["x".into()],
                iter: Box::new(Expr::List(vec![Expr::Int(1), Expr::Int(2), Expr::Int(3)])),
                cond: None,
                map_expr: Some(Box::new(Expr::Binary(crate::ast::BinOp::Mul, Box::new(Expr::Name(Identifier::single("x"))), Box::new(Expr::Int(2))))),
            },
            span: Span::dummy(),
        }];
        let result = run(stmts);
        let Value::Dict(d) = result else { panic!() };
        assert_eq!(d.get("doubled"), Some(&Value::List(vec![Value::Int(2), Value::Int(4), Value::Int(6)])));
    }
}
