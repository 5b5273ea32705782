//! The compiled unit: constants, names, instructions, and their side-tables.

use ahash::AHashMap;

use crate::{errors::Span, value::Value};

/// One entry of the position side-table, indexed by the byte offset of the
/// opcode it describes. The sole source of source-location information for
/// runtime error messages.
#[derive(Debug, Clone)]
pub struct PositionEntry {
    pub offset: u32,
    pub span: Span,
}

/// A compiled package or schema-body program.
///
/// Built once per compile and immutable thereafter: nothing after [`super::builder::CodeBuilder::build`] ever
/// mutates a `Code`'s fields.
#[derive(Debug, Clone, Default)]
pub struct Code {
    /// Name, for error messages and debug opcodes.
    pub name: String,
    /// Immutable constant pool, indexed by `LOAD_CONST`'s operand.
    pub constants: Vec<Value>,
    /// Immutable identifier pool, indexed by `LOAD_NAME`/`LOAD_ATTR`/etc.
    pub names: Vec<String>,
    /// The raw instruction stream: opcode bytes interleaved with inline
    /// 24-bit little-endian operands.
    pub instructions: Vec<u8>,
    /// Parallel position records, one per emitted opcode, in stream order.
    pub positions: Vec<PositionEntry>,
    /// Number of local variable slots this code's frame needs.
    pub num_locals: u32,
    /// Number of free-variable slots this code's frame needs (closures).
    pub num_free: u32,
    /// Maximum value-stack depth reached while compiling, used to
    /// pre-allocate the frame's stack.
    pub max_stack_depth: u16,
    /// Sub-programs for schema bodies declared within this code's scope,
    /// keyed by the schema's mangled name.
    pub schema_programs: AHashMap<String, std::rc::Rc<Code>>,
    /// Name of each `GLOBAL`-scope slot, indexed by slot number. Only
    /// meaningful on a package's top-level `Code`; empty on schema/function
    /// sub-programs, which have no globals of their own.
    pub global_names: Vec<String>,
}

impl Code {
    /// Finds the span covering the instruction at `offset`, falling back to
    /// the nearest preceding entry (positions are only recorded when the
    /// current location changes).
    #[must_use]
    pub fn span_at(&self, offset: u32) -> Option<&Span> {
        self.positions.iter().rev().find(|entry| entry.offset <= offset).map(|entry| &entry.span)
    }

    /// Decodes the 24-bit little-endian operand starting at `offset + 1`.
    #[must_use]
    pub fn read_operand(&self, offset: usize) -> u32 {
        let bytes = &self.instructions[offset + 1..offset + 4];
        u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16)
    }

    /// Decodes a signed jump delta from the same 24-bit field.
    #[must_use]
    pub fn read_signed_operand(&self, offset: usize) -> i32 {
        let raw = self.read_operand(offset);
        if raw & 0x0080_0000 != 0 {
            (raw | 0xFF00_0000) as i32
        } else {
            raw as i32
        }
    }
}
