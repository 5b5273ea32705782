#![doc = include_str!("../../../README.md")]

pub mod ast;
pub mod bytecode;
pub mod errors;
pub mod plan;
pub mod plugin;
pub mod rpc;
pub mod settings;
pub mod symtable;
pub mod unify;
pub mod value;

pub use crate::{
    bytecode::{
        compiler::{compile_program, CompiledProgram},
        vm::{Vm, VmOptions},
    },
    errors::{KclError, KclResult},
    value::Value,
};

/// Compiles and runs a resolved `Program` to completion: a single call that
/// owns a fresh [`CompiledProgram`] and a fresh [`Vm`], releasing both on
/// return. Callers that need YAML/JSON output pass the result to [`plan`].
pub fn eval_program(program: &ast::Program, options: VmOptions) -> KclResult<Value> {
    let compiled = compile_program(program)?;
    let mut vm = Vm::new(compiled, options);
    vm.run_main()
}
