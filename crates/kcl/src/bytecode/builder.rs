//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` handles encoding opcodes and 24-bit operands into raw
//! bytes, patching forward jumps, and tracking source locations and stack
//! depth, with a fixed 24-bit operand encoding rather than variable-width
//! operand forms.

use ahash::AHashMap;
use std::rc::Rc;

use super::{code::{Code, PositionEntry}, op::Opcode};
use crate::{errors::Span, value::Value};

/// A forward jump awaiting patching, returned by [`CodeBuilder::emit_jump`].
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel {
    /// Byte offset of the jump opcode itself (operand starts at `offset+1`).
    offset: usize,
}

#[derive(Debug, Default)]
pub struct CodeBuilder {
    name: String,
    bytecode: Vec<u8>,
    constants: Vec<Value>,
    names: Vec<String>,
    name_index: AHashMap<String, u32>,
    positions: Vec<PositionEntry>,
    current_span: Option<Span>,
    current_stack_depth: i32,
    max_stack_depth: u16,
    num_locals: u32,
    num_free: u32,
    schema_programs: AHashMap<String, Rc<Code>>,
    global_names: Vec<String>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn set_locals(&mut self, num_locals: u32) {
        self.num_locals = num_locals;
    }

    pub fn set_free(&mut self, num_free: u32) {
        self.num_free = num_free;
    }

    /// Records each `GLOBAL` slot's name by index, for [`Code::global_names`].
    pub fn set_global_names(&mut self, bindings: Vec<(String, u32)>) {
        let len = bindings.iter().map(|(_, idx)| idx + 1).max().unwrap_or(0) as usize;
        let mut names = vec![String::new(); len];
        for (name, idx) in bindings {
            names[idx as usize] = name;
        }
        self.global_names = names;
    }

    /// Sets the span attached to the next emitted instruction.
    pub fn set_span(&mut self, span: Span) {
        self.current_span = Some(span);
    }

    fn record_position(&mut self) {
        if let Some(span) = self.current_span.clone() {
            self.positions.push(PositionEntry { offset: self.bytecode.len() as u32, span });
        }
    }

    fn adjust_stack(&mut self, delta: i16) {
        self.current_stack_depth += i32::from(delta);
        debug_assert!(self.current_stack_depth >= 0, "stack underflow compiling {}", self.name);
        if self.current_stack_depth as u16 > self.max_stack_depth {
            self.max_stack_depth = self.current_stack_depth as u16;
        }
    }

    /// Emits an opcode with no operand.
    pub fn emit(&mut self, op: Opcode) {
        debug_assert!(!op.has_operand(), "{op:?} requires an operand");
        self.record_position();
        self.bytecode.push(op as u8);
        if let Some(effect) = op.stack_effect() {
            self.adjust_stack(effect);
        }
    }

    /// Emits an opcode with a 24-bit operand and a caller-supplied stack
    /// delta (used when the effect depends on the operand, e.g. `BUILD_LIST`).
    pub fn emit_operand_with_effect(&mut self, op: Opcode, operand: u32, effect: i16) {
        debug_assert!(op.has_operand(), "{op:?} takes no operand");
        debug_assert!(operand <= 0x00FF_FFFF, "operand {operand} exceeds 24 bits");
        self.record_position();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes()[..3]);
        self.adjust_stack(effect);
    }

    /// Emits an opcode with a 24-bit operand whose stack effect is
    /// operand-independent.
    pub fn emit_operand(&mut self, op: Opcode, operand: u32) {
        let effect = op.stack_effect().unwrap_or(0);
        self.emit_operand_with_effect(op, operand, effect);
    }

    /// Interns `value` into the constant pool, returning its index.
    pub fn add_const(&mut self, value: Value) -> u32 {
        self.constants.push(value);
        u32::try_from(self.constants.len() - 1).expect("constant pool exceeds u32")
    }

    /// Interns `name` into the name pool, deduplicating repeats.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.name_index.get(name) {
            return idx;
        }
        let idx = u32::try_from(self.names.len()).expect("name pool exceeds u32");
        self.names.push(name.to_owned());
        self.name_index.insert(name.to_owned(), idx);
        idx
    }

    pub fn register_schema_program(&mut self, mangled_name: String, program: Rc<Code>) {
        self.schema_programs.insert(mangled_name, program);
    }

    /// Emits a jump opcode with a placeholder operand, returning a label to
    /// [`Self::patch_jump`] once the target offset is known.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        let offset = self.bytecode.len();
        self.emit_operand_with_effect(op, 0, op.stack_effect().unwrap_or(0));
        JumpLabel { offset }
    }

    /// Patches a previously emitted jump to target the current end of the
    /// stream.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        self.patch_jump_to(label, self.bytecode.len());
    }

    /// Patches a previously emitted jump to target an explicit offset (for
    /// backward jumps, e.g. loop headers, pass the remembered offset
    /// directly rather than going through `emit_jump`).
    pub fn patch_jump_to(&mut self, label: JumpLabel, target: usize) {
        let delta = target as i64 - label.offset as i64;
        let delta = i32::try_from(delta).expect("jump delta exceeds i32");
        debug_assert!((-0x0080_0000..=0x007F_FFFF).contains(&delta), "jump delta {delta} exceeds 24 bits");
        let bytes = (delta & 0x00FF_FFFF) as u32;
        let encoded = bytes.to_le_bytes();
        self.bytecode[label.offset + 1] = encoded[0];
        self.bytecode[label.offset + 2] = encoded[1];
        self.bytecode[label.offset + 3] = encoded[2];
    }

    /// The current offset, for backward-jump targets (loop headers).
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    /// Emits a backward jump directly to `target` without patching.
    pub fn emit_jump_back(&mut self, op: Opcode, target: usize) {
        let offset = self.bytecode.len();
        self.emit_operand_with_effect(op, 0, op.stack_effect().unwrap_or(0));
        self.patch_jump_to(JumpLabel { offset }, target);
    }

    #[must_use]
    pub fn current_stack_depth(&self) -> i32 {
        self.current_stack_depth
    }

    /// Finalizes the builder into an immutable [`Code`].
    #[must_use]
    pub fn build(self) -> Code {
        Code {
            name: self.name,
            constants: self.constants,
            names: self.names,
            instructions: self.bytecode,
            positions: self.positions,
            num_locals: self.num_locals,
            num_free: self.num_free,
            max_stack_depth: self.max_stack_depth,
            schema_programs: self.schema_programs,
            global_names: self.global_names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_patch_round_trips_through_decode() {
        let mut b = CodeBuilder::new("test");
        let label = b.emit_jump(Opcode::JumpAbsolute);
        b.emit(Opcode::Pop);
        b.patch_jump(label);
        let code = b.build();
        // The jump instruction occupies offsets 0..4, `Pop` occupies offset
        // 4, so `patch_jump`'s target (end of stream) is 5; the stored delta
        // is measured from the jump instruction's own start (offset 0).
        assert_eq!(code.read_signed_operand(0), 5);
    }

    #[test]
    fn backward_jump_encodes_negative_delta() {
        let mut b = CodeBuilder::new("loop");
        let top = b.current_offset();
        b.emit(Opcode::DupTop);
        b.emit_jump_back(Opcode::JumpAbsolute, top);
        let code = b.build();
        assert_eq!(code.read_signed_operand(1), -1);
    }

    #[test]
    fn const_and_name_pools_deduplicate() {
        let mut b = CodeBuilder::new("c");
        let a1 = b.add_name("x");
        let a2 = b.add_name("x");
        assert_eq!(a1, a2);
        let c1 = b.add_const(Value::Int(1));
        let c2 = b.add_const(Value::Int(1));
        assert_ne!(c1, c2, "constants are not deduplicated, only names");
    }
}
