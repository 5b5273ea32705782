//! The compiler: lowers a resolved AST [`Program`] into one [`Code`] per
//! package.

use std::rc::Rc;

use ahash::AHashMap;

use super::{
    builder::CodeBuilder,
    code::Code,
    op::Opcode,
    schema_type::{DecoratorSpec, DeclaredAttr, RuleType, SchemaType},
};
use crate::{
    ast::{
        AssignTarget, AugOp, BinOp, CheckExpr, CmpOp, ConfigEntry, ConfigEntryOp, ConfigKey, Decorator, Expr, Identifier, Module,
        Param, Program, QuantifierKind, RuleStmt, SchemaAttr, SchemaStmt, Stmt, StringPart, UnaryOp,
    },
    errors::{ErrorKind, KclError, KclResult, Span},
    symtable::{ScopeKind, SymbolTable},
    value::{DecoratorTarget, NumberUnit, ParamSlot, Value},
};

/// Stable tags for the named compiler errors in
/// `internal/kclvm_py/compiler/build/data.py`'s `CompilerInternalErrorMeta`
/// table. Rendered into the
/// `KclError` message so the underlying trigger condition stays greppable.
#[derive(Debug, Clone, Copy, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
enum CompileErrorCode {
    SymbolNotDefined,
    InvalidQuantifierOp,
    DuplicatedKw,
    UnequalDictKvSize,
    IllegalArgumentSyntax,
    NonDefaultAfterDefault,
    MultipleStarredTargets,
    InvalidFormatSpec,
    ElseIfSyntax,
    ImportMainPackage,
}

impl CompileErrorCode {
    fn kind(self) -> ErrorKind {
        match self {
            Self::SymbolNotDefined => ErrorKind::CompileError,
            Self::InvalidQuantifierOp => ErrorKind::CompileError,
            Self::DuplicatedKw | Self::IllegalArgumentSyntax | Self::NonDefaultAfterDefault | Self::MultipleStarredTargets => {
                ErrorKind::IllegalArgumentErrorSyntax
            }
            Self::UnequalDictKvSize => ErrorKind::CompileError,
            Self::InvalidFormatSpec => ErrorKind::InvalidFormatSpec,
            Self::ElseIfSyntax => ErrorKind::InvalidSyntax,
            Self::ImportMainPackage => ErrorKind::CannotFindModule,
        }
    }
}

fn compile_err(code: CompileErrorCode, span: &Span, message: impl Into<String>) -> KclError {
    KclError::new(code.kind(), span.clone(), format!("{code}: {}", message.into()))
}

/// Wraps a user-exported identifier with the fixed mangling prefix.
pub fn mangle(pkg: &str, name: &str) -> String {
    format!("KMANGLED_{pkg}_{name}")
}

/// A tagged internal name, used to separate namespaces such as attribute
/// tags.
pub fn tag(tag: &str, name: &str) -> String {
    format!("KTAG_{tag}_{name}")
}

/// Strips a leading `$` used to escape reserved words in source identifiers.
fn deprefix(name: &str) -> &str {
    name.strip_prefix('$').unwrap_or(name)
}

pub struct CompiledProgram {
    pub main: String,
    pub packages: AHashMap<String, Rc<Code>>,
    pub schema_types: AHashMap<String, Rc<SchemaType>>,
    pub rule_types: AHashMap<String, Rc<RuleType>>,
}

/// Lowers `program` to one [`Code`] per package.
pub fn compile_program(program: &Program) -> KclResult<CompiledProgram> {
    let mut packages = AHashMap::new();
    let mut schema_types = AHashMap::new();
    let mut rule_types = AHashMap::new();

    for (pkg_name, modules) in &program.pkgs {
        let mut compiler = Compiler::new(pkg_name.clone(), &mut schema_types, &mut rule_types);
        let code = compiler.compile_package(modules)?;
        packages.insert(pkg_name.clone(), Rc::new(code));
    }

    Ok(CompiledProgram { main: program.main.clone(), packages, schema_types, rule_types })
}

struct Compiler<'a> {
    pkg: String,
    symtab: SymbolTable,
    builder: CodeBuilder,
    schema_types: &'a mut AHashMap<String, Rc<SchemaType>>,
    rule_types: &'a mut AHashMap<String, Rc<RuleType>>,
}

impl<'a> Compiler<'a> {
    fn new(pkg: String, schema_types: &'a mut AHashMap<String, Rc<SchemaType>>, rule_types: &'a mut AHashMap<String, Rc<RuleType>>) -> Self {
        Self { builder: CodeBuilder::new(pkg.clone()), symtab: SymbolTable::with_builtins(), pkg, schema_types, rule_types }
    }

    fn compile_package(&mut self, modules: &[Module]) -> KclResult<Code> {
        for module in modules {
            for stmt in &module.body {
                self.compile_stmt(stmt)?;
            }
        }
        self.builder.emit(Opcode::ReturnValue);
        self.builder.set_locals(self.symtab.num_definitions());
        self.builder.set_global_names(self.symtab.global_bindings());
        Ok(std::mem::replace(&mut self.builder, CodeBuilder::new(self.pkg.clone())).build())
    }

    // -- statements --

    fn compile_stmt(&mut self, stmt: &Stmt) -> KclResult<()> {
        match stmt {
            Stmt::Assign { targets, value, span } => self.compile_assign(targets, value, span),
            Stmt::AugAssign { target, op, value, span } => self.compile_aug_assign(target, *op, value, span),
            Stmt::If { branches, orelse } => self.compile_if(branches, orelse),
            Stmt::Assert { test, message, span } => self.compile_assert(test, message, span),
            Stmt::Import { path, asname, span } => self.compile_import(path, asname.as_deref(), span),
            Stmt::Schema(schema) => self.compile_schema(schema),
            Stmt::Rule(rule) => self.compile_rule(rule),
            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.builder.emit(Opcode::Pop);
                Ok(())
            }
        }
    }

    fn compile_assign(&mut self, targets: &[AssignTarget], value: &Expr, span: &Span) -> KclResult<()> {
        self.compile_expr(value)?;
        for (i, target) in targets.iter().enumerate() {
            if i + 1 < targets.len() {
                self.builder.emit(Opcode::DupTop);
            }
            self.compile_store_target(target, span)?;
        }
        Ok(())
    }

    fn compile_store_target(&mut self, target: &AssignTarget, span: &Span) -> KclResult<()> {
        match target {
            AssignTarget::Name(ident) => self.store_name(&ident.names[0], span),
            AssignTarget::Attr(base, attr) => {
                self.compile_expr(base)?;
                self.builder.set_span(span.clone());
                let idx = self.builder.add_name(attr);
                self.builder.emit_operand(Opcode::StoreAttr, idx);
                Ok(())
            }
            AssignTarget::Subscript(base, index) => {
                // STORE_SUBSCR pops (value, base, index) and pushes the
                // updated base back. When the base is a plain name we write
                // the result back through it so `a[i] = v` is actually
                // observable; a computed base (`f()[i] = v`) has nowhere to
                // write back to, so its result is just discarded.
                self.compile_expr(base)?;
                self.compile_expr(index)?;
                self.builder.set_span(span.clone());
                self.builder.emit(Opcode::StoreSubscr);
                if let Expr::Name(ident) = base.as_ref() {
                    self.store_name(&ident.names[0], span)
                } else {
                    self.builder.emit(Opcode::Pop);
                    Ok(())
                }
            }
        }
    }

    fn store_name(&mut self, name: &str, span: &Span) -> KclResult<()> {
        let name = deprefix(name);
        let (symbol, _already) = self.symtab.define(name, None);
        self.builder.set_span(span.clone());
        match symbol.scope {
            ScopeKind::Global => self.builder.emit_operand(Opcode::StoreGlobal, symbol.index),
            ScopeKind::Local => self.builder.emit_operand(Opcode::StoreLocal, symbol.index),
            ScopeKind::Free => self.builder.emit_operand(Opcode::StoreFree, symbol.index),
            ScopeKind::BuiltIn | ScopeKind::Internal => {
                return Err(compile_err(CompileErrorCode::SymbolNotDefined, span, format!("cannot store to `{name}`")))
            }
        }
        Ok(())
    }

    fn compile_aug_assign(&mut self, target: &AssignTarget, op: AugOp, value: &Expr, span: &Span) -> KclResult<()> {
        self.load_target_value(target, span)?;
        self.compile_expr(value)?;
        self.builder.set_span(span.clone());
        self.builder.emit(inplace_opcode(op));
        self.compile_store_target(target, span)
    }

    fn load_target_value(&mut self, target: &AssignTarget, span: &Span) -> KclResult<()> {
        match target {
            AssignTarget::Name(ident) => self.compile_expr(&Expr::Name(ident.clone())),
            AssignTarget::Attr(base, attr) => {
                self.compile_expr(base)?;
                self.builder.set_span(span.clone());
                let idx = self.builder.add_name(attr);
                self.builder.emit_operand(Opcode::LoadAttr, idx);
                Ok(())
            }
            AssignTarget::Subscript(base, index) => {
                self.compile_expr(base)?;
                self.compile_expr(index)?;
                self.builder.set_span(span.clone());
                self.builder.emit(Opcode::BinarySubscr);
                Ok(())
            }
        }
    }

    fn compile_if(&mut self, branches: &[(Expr, Vec<Stmt>)], orelse: &[Stmt]) -> KclResult<()> {
        let mut end_labels = Vec::new();
        for (i, (test, body)) in branches.iter().enumerate() {
            self.compile_expr(test)?;
            let else_label = self.builder.emit_jump(Opcode::PopJumpIfFalse);
            for stmt in body {
                self.compile_stmt(stmt)?;
            }
            let is_last = i + 1 == branches.len();
            if !(is_last && orelse.is_empty()) {
                end_labels.push(self.builder.emit_jump(Opcode::JumpAbsolute));
            }
            self.builder.patch_jump(else_label);
        }
        for stmt in orelse {
            self.compile_stmt(stmt)?;
        }
        for label in end_labels {
            self.builder.patch_jump(label);
        }
        Ok(())
    }

    fn compile_assert(&mut self, test: &Expr, message: &Option<Expr>, span: &Span) -> KclResult<()> {
        self.compile_expr(test)?;
        match message {
            Some(m) => self.compile_expr(m)?,
            None => {
                let idx = self.builder.add_const(Value::str("assertion failed"));
                self.builder.emit_operand(Opcode::LoadConst, idx);
            }
        }
        self.builder.set_span(span.clone());
        self.builder.emit(Opcode::Assert);
        Ok(())
    }

    fn compile_import(&mut self, path: &str, asname: Option<&str>, span: &Span) -> KclResult<()> {
        if path == self.pkg {
            return Err(compile_err(CompileErrorCode::ImportMainPackage, span, format!("package `{path}` cannot import itself")));
        }
        let local = asname.unwrap_or_else(|| path.rsplit('.').next().unwrap_or(path));
        self.builder.set_span(span.clone());
        let path_idx = self.builder.add_name(path);
        self.builder.emit_operand(Opcode::ImportName, path_idx);
        self.store_name(local, span)
    }

    fn compile_schema(&mut self, schema: &SchemaStmt) -> KclResult<()> {
        let mangled = mangle(&self.pkg, &schema.name);

        let mut decorators = Vec::new();
        for dec in &schema.decorators {
            decorators.push(self.compile_decorator_spec(dec, DecoratorTarget::SchemaType, None)?);
        }
        for attr in &schema.attrs {
            // Attribute-level decorators are not carried on `SchemaAttr` in
            // this AST boundary; per-attribute `@deprecated` is applied via
            // the schema-level decorator list with `attribute` set, left to
            // an external type-checker front end to attach.
            let _ = attr;
        }

        let body = self.compile_schema_body(schema)?;

        let declared_attrs = schema
            .attrs
            .iter()
            .map(|a| DeclaredAttr { name: a.name.clone(), has_default: a.default.is_some(), is_optional: a.is_optional })
            .collect();

        let schema_type = SchemaType {
            name: schema.name.clone(),
            pkg: self.pkg.clone(),
            parent: schema.parent_name.as_ref().map(|p| mangle(&self.pkg, p.names.last().unwrap())),
            mixins: schema.mixins.iter().map(|m| mangle(&self.pkg, m.names.last().unwrap())).collect(),
            index_signature: schema.index_signature.clone(),
            relaxed: schema.is_relaxed,
            declared_attrs,
            body: Rc::new(body.clone()),
            decorators,
            docstring: schema.docstring.clone(),
        };

        self.builder.register_schema_program(mangled.clone(), Rc::new(body));
        self.schema_types.insert(mangled.clone(), Rc::new(schema_type));

        // Binds the schema's name to a reference to its own mangled type
        // name (a plain `Str`): enough for `x = Person` / `isinstance`-style
        // comparisons. `Person { ... }` construction itself never reads this
        // binding — `compile_schema_expr` mangles the identifier directly at
        // compile time, matching how the symbol table already resolves
        // schema names without a runtime indirection.
        let const_idx = self.builder.add_const(Value::str(mangled));
        self.builder.set_span(schema.span.clone());
        self.builder.emit_operand(Opcode::LoadConst, const_idx);
        self.store_name(&schema.name, &schema.span)
    }

    /// Compiles a schema body into its own nested [`Code`], run by the VM's
    /// `BUILD_SCHEMA` pipeline. The body executes:
    /// declared-attribute defaults (`STORE_ATTR` with insert-if-absent
    /// semantics — see `vm::schema`), then computed-attribute and control
    /// statements in textual order, then the check block.
    fn compile_schema_body(&mut self, schema: &SchemaStmt) -> KclResult<Code> {
        let outer = std::mem::replace(&mut self.symtab, SymbolTable::with_builtins());
        self.symtab = outer.enter();
        let outer_builder = std::mem::replace(&mut self.builder, CodeBuilder::new(mangle(&self.pkg, &schema.name)));

        // self is always local slot 0 inside a schema body.
        self.symtab.define("self", Some(ScopeKind::Local));

        for attr in &schema.attrs {
            if let Some(default) = &attr.default {
                self.builder.set_span(attr.span.clone());
                // STORE_ATTR pops (base, value) with base on top — push the
                // value first, `self` last, matching every other STORE_ATTR
                // call site (see `compile_store_target`).
                self.compile_expr(default)?;
                self.builder.emit_operand(Opcode::LoadLocal, 0);
                let name_idx = self.builder.add_name(&attr.name);
                self.builder.emit_operand(Opcode::StoreAttr, name_idx);
            }
        }

        for stmt in &schema.body {
            self.compile_stmt(stmt)?;
        }

        for check in &schema.checks {
            self.compile_check(check)?;
        }

        self.builder.emit(Opcode::ReturnValue);
        self.builder.set_locals(self.symtab.num_definitions());

        let code = std::mem::replace(&mut self.builder, outer_builder).build();
        let (restored_outer, _) = self.symtab.leave();
        self.symtab = restored_outer.unwrap_or_else(|| SymbolTable::with_builtins());
        let _ = outer;
        Ok(code)
    }

    fn compile_check(&mut self, check: &CheckExpr) -> KclResult<()> {
        self.compile_expr(&check.test)?;
        match &check.message {
            Some(m) => self.compile_expr(m)?,
            None => {
                let idx = self.builder.add_const(Value::Undefined);
                self.builder.emit_operand(Opcode::LoadConst, idx);
            }
        }
        self.builder.set_span(check.span.clone());
        self.builder.emit(Opcode::Check);
        Ok(())
    }

    fn compile_decorator_spec(&mut self, dec: &Decorator, target: DecoratorTarget, attribute: Option<String>) -> KclResult<DecoratorSpec> {
        let args = dec.args.iter().map(const_eval_literal).collect::<KclResult<Vec<_>>>()?;
        let mut kwargs = Vec::new();
        for (k, v) in &dec.kwargs {
            kwargs.push((k.clone(), const_eval_literal(v)?));
        }
        Ok(DecoratorSpec { name: dec.name.clone(), target, attribute, args, kwargs })
    }

    fn compile_rule(&mut self, rule: &RuleStmt) -> KclResult<()> {
        let outer_builder = std::mem::replace(&mut self.builder, CodeBuilder::new(format!("{}.rule", rule.name)));
        let outer_symtab = std::mem::replace(&mut self.symtab, SymbolTable::with_builtins().enter());
        self.symtab.define("self", Some(ScopeKind::Local));

        for check in &rule.checks {
            self.compile_check(check)?;
        }
        let idx = self.builder.add_const(Value::Bool(true));
        self.builder.emit_operand(Opcode::LoadConst, idx);
        self.builder.emit(Opcode::ReturnValue);
        self.builder.set_locals(self.symtab.num_definitions());

        let body = std::mem::replace(&mut self.builder, outer_builder).build();
        self.symtab = outer_symtab;

        let rule_type = RuleType {
            name: rule.name.clone(),
            parent_rules: rule.parent_rules.iter().map(|p| mangle(&self.pkg, p.names.last().unwrap())).collect(),
            body: Rc::new(body),
        };
        self.rule_types.insert(mangle(&self.pkg, &rule.name), Rc::new(rule_type));
        Ok(())
    }

    // -- expressions --

    fn compile_expr(&mut self, expr: &Expr) -> KclResult<()> {
        match expr {
            Expr::Int(v) => self.emit_const(Value::Int(*v)),
            Expr::Float(v) => self.emit_const(Value::Float(*v)),
            Expr::Str(s) => self.emit_const(Value::str(s.as_str())),
            Expr::Bool(b) => self.emit_const(Value::Bool(*b)),
            Expr::None => self.emit_const(Value::None),
            Expr::Undefined => self.emit_const(Value::Undefined),
            Expr::NumberMultiplier(raw, suffix) => {
                let unit = parse_unit(suffix, &Span::dummy())?;
                self.emit_const(Value::NumberMultiplier(*raw, unit))
            }
            Expr::StringInterpolation(parts) => self.compile_string_interpolation(parts),
            Expr::Name(ident) => self.compile_name_load(ident),
            Expr::List(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                let n = u32::try_from(items.len()).expect("list literal too large");
                self.builder.emit_operand_with_effect(Opcode::BuildList, n, effect_build(n, 1));
                Ok(())
            }
            Expr::ListComp { element, vars, iter, cond } => self.compile_list_comp(element, vars, iter, cond),
            Expr::Config(entries) => self.compile_config(entries),
            Expr::SchemaExpr { name, config } => self.compile_schema_expr(name, config),
            Expr::Unary(op, inner) => {
                self.compile_expr(inner)?;
                self.builder.emit(unary_opcode(*op));
                Ok(())
            }
            Expr::Binary(op, lhs, rhs) => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.builder.emit(binary_opcode(*op));
                Ok(())
            }
            Expr::Compare(first, rest) => self.compile_compare(first, rest),
            Expr::Attr(base, name) => {
                self.compile_expr(base)?;
                let idx = self.builder.add_name(name);
                self.builder.emit_operand(Opcode::LoadAttr, idx);
                Ok(())
            }
            Expr::Subscript(base, index) => {
                self.compile_expr(base)?;
                self.compile_expr(index)?;
                self.builder.emit(Opcode::BinarySubscr);
                Ok(())
            }
            Expr::Call { func, args, kwargs } => self.compile_call(func, args, kwargs),
            Expr::Lambda { params, body, result } => self.compile_lambda(params, body, result),
            Expr::Quantifier { kind, vars, iter, cond, map_expr } => self.compile_quantifier(*kind, vars, iter, cond, map_expr),
        }
    }

    fn emit_const(&mut self, value: Value) -> KclResult<()> {
        let idx = self.builder.add_const(value);
        self.builder.emit_operand(Opcode::LoadConst, idx);
        Ok(())
    }

    fn compile_name_load(&mut self, ident: &Identifier) -> KclResult<()> {
        let name = deprefix(&ident.names[0]);
        let Some(symbol) = self.symtab.resolve(name) else {
            return Err(compile_err(CompileErrorCode::SymbolNotDefined, &ident.span, format!("`{name}` is not defined")));
        };
        match symbol.scope {
            ScopeKind::Global => self.builder.emit_operand(Opcode::LoadGlobal, symbol.index),
            ScopeKind::Local => self.builder.emit_operand(Opcode::LoadLocal, symbol.index),
            ScopeKind::Free => self.builder.emit_operand(Opcode::LoadFree, symbol.index),
            ScopeKind::BuiltIn => self.builder.emit_operand(Opcode::LoadBuiltIn, symbol.index),
            ScopeKind::Internal => unreachable!("resolve never returns an INTERNAL symbol"),
        }
        let mut attr_chain = ident.names.iter().skip(1);
        for seg in &mut attr_chain {
            let idx = self.builder.add_name(deprefix(seg));
            self.builder.emit_operand(Opcode::LoadAttr, idx);
        }
        Ok(())
    }

    fn compile_string_interpolation(&mut self, parts: &[StringPart]) -> KclResult<()> {
        for part in parts {
            match part {
                StringPart::Literal(s) => self.emit_const(Value::str(s.as_str()))?,
                StringPart::Interpolated(expr, spec) => {
                    self.compile_expr(expr)?;
                    let spec_idx = self.builder.add_const(match spec {
                        Some(s) => Value::str(s.as_str()),
                        None => Value::Undefined,
                    });
                    self.builder.emit_operand(Opcode::FormatValue, spec_idx);
                }
            }
        }
        let n = u32::try_from(parts.len()).expect("string interpolation too large");
        self.builder.emit_operand_with_effect(Opcode::BuildString, n, effect_build(n, 1));
        Ok(())
    }

    fn compile_list_comp(&mut self, element: &Expr, vars: &[String], iter: &Expr, cond: &Option<Box<Expr>>) -> KclResult<()> {
        if vars.is_empty() || vars.len() > 2 {
            return Err(compile_err(
                CompileErrorCode::InvalidQuantifierOp,
                &Span::dummy(),
                format!("comprehension needs 1 or 2 loop variables, got {}", vars.len()),
            ));
        }
        let result_idx = {
            let v = Value::List(Vec::new());
            self.builder.add_const(v)
        };
        self.builder.emit_operand(Opcode::LoadConst, result_idx);
        self.compile_comp_loop(vars, iter, cond, |c| {
            c.compile_expr(element)?;
            // Wrap the element in a one-item list and concatenate it onto
            // the accumulator (BINARY_ADD's list case) rather than giving
            // BUILD_LIST a second, accumulator-aware meaning.
            c.builder.emit_operand_with_effect(Opcode::BuildList, 1, effect_build(1, 1));
            c.builder.emit(Opcode::BinaryAdd);
            Ok(())
        })
    }

    /// Shared scaffold for comprehensions and quantifiers: `GET_ITER`, `FOR_ITER` loop header, loop
    /// variable assignment, optional filter, body.
    fn compile_comp_loop(
        &mut self,
        vars: &[String],
        iter: &Expr,
        cond: &Option<Box<Expr>>,
        mut body: impl FnMut(&mut Self) -> KclResult<()>,
    ) -> KclResult<()> {
        self.symtab = std::mem::replace(&mut self.symtab, SymbolTable::with_builtins()).enter();
        for v in vars {
            self.symtab.define(v, None);
        }

        self.compile_expr(iter)?;
        self.builder.emit(Opcode::GetIter);
        let loop_top = self.builder.current_offset();
        let exit_label = self.builder.emit_jump(Opcode::ForIter);

        if vars.len() == 2 {
            let n = 2u32;
            self.builder.emit_operand_with_effect(Opcode::UnpackSequence, n, 1);
        }
        for v in vars.iter().rev() {
            self.store_name(v, &Span::dummy())?;
        }

        if let Some(cond) = cond {
            self.compile_expr(cond)?;
            let skip = self.builder.emit_jump(Opcode::PopJumpIfFalse);
            body(self)?;
            self.builder.patch_jump(skip);
        } else {
            body(self)?;
        }

        self.builder.emit_jump_back(Opcode::JumpAbsolute, loop_top);
        self.builder.patch_jump(exit_label);

        let (outer, _) = self.symtab.leave();
        self.symtab = outer.unwrap_or_else(SymbolTable::with_builtins);
        Ok(())
    }

    fn compile_config(&mut self, entries: &[ConfigEntry]) -> KclResult<()> {
        let base_idx = self.builder.add_const(Value::Dict(crate::value::Dict::new()));
        self.builder.emit_operand(Opcode::LoadConst, base_idx);
        for entry in entries {
            self.compile_config_entry(entry)?;
        }
        Ok(())
    }

    fn compile_config_entry(&mut self, entry: &ConfigEntry) -> KclResult<()> {
        // BUILD_SCHEMA_CONFIG pops (accumulator, key, value) and pushes the
        // merged accumulator back, so entries thread a single dict value
        // across the whole config literal with no duplication needed.
        match &entry.key {
            ConfigKey::Name(ident) => {
                let idx = self.builder.add_const(Value::str(deprefix(&ident.names[0])));
                self.builder.emit_operand(Opcode::LoadConst, idx);
            }
            ConfigKey::Computed(expr) => self.compile_expr(expr)?,
        }
        self.compile_expr(&entry.value)?;
        self.builder.set_span(entry.span.clone());
        self.builder.emit_operand_with_effect(Opcode::BuildSchemaConfig, config_op_operand(entry.op), -2);
        Ok(())
    }

    fn compile_schema_expr(&mut self, name: &Identifier, config: &[ConfigEntry]) -> KclResult<()> {
        self.compile_config(config)?;
        let mangled = mangle(&self.pkg, name.names.last().unwrap());
        let name_idx = self.builder.add_name(&mangled);
        self.builder.set_span(name.span.clone());
        self.builder.emit_operand(Opcode::BuildSchema, name_idx);
        Ok(())
    }

    fn compile_compare(&mut self, first: &Expr, rest: &[(CmpOp, Expr)]) -> KclResult<()> {
        self.compile_expr(first)?;
        for (op, rhs) in rest {
            self.compile_expr(rhs)?;
            self.builder.emit(compare_opcode(*op));
        }
        Ok(())
    }

    fn compile_call(&mut self, func: &Expr, args: &[Expr], kwargs: &[(String, Expr)]) -> KclResult<()> {
        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        let mut seen = std::collections::HashSet::new();
        for (name, value) in kwargs {
            if !seen.insert(name.as_str()) {
                return Err(compile_err(CompileErrorCode::DuplicatedKw, &Span::dummy(), format!("duplicated keyword argument `{name}`")));
            }
            let idx = self.builder.add_const(Value::str(name.as_str()));
            self.builder.emit_operand(Opcode::LoadConst, idx);
            self.compile_expr(value)?;
        }
        let argcount = u32::try_from(args.len()).expect("too many positional arguments");
        let kwcount = u32::try_from(kwargs.len()).expect("too many keyword arguments");
        let operand = (kwcount << 12) | argcount;
        let effect = -(1 + i16::try_from(args.len()).unwrap_or(i16::MAX) + 2 * i16::try_from(kwargs.len()).unwrap_or(i16::MAX)) + 1;
        self.builder.emit_operand_with_effect(Opcode::CallFunction, operand, effect);
        Ok(())
    }

    fn compile_lambda(&mut self, params: &[Param], body: &[Stmt], result: &Expr) -> KclResult<()> {
        let mut seen_default = false;
        for p in params {
            if p.default.is_some() {
                seen_default = true;
            } else if seen_default {
                return Err(compile_err(
                    CompileErrorCode::NonDefaultAfterDefault,
                    &Span::dummy(),
                    format!("parameter `{}` without a default follows one with a default", p.name),
                ));
            }
        }

        let defaults = params
            .iter()
            .map(|p| match &p.default {
                Some(expr) => const_eval_literal(expr),
                None => Ok(Value::Undefined),
            })
            .collect::<KclResult<Vec<_>>>()?;

        let outer_builder = std::mem::replace(&mut self.builder, CodeBuilder::new("<lambda>"));
        let outer_symtab = std::mem::replace(&mut self.symtab, SymbolTable::with_builtins()).enter();
        for p in params {
            self.symtab.define(&p.name, None);
        }
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        self.compile_expr(result)?;
        self.builder.emit(Opcode::ReturnValue);
        self.builder.set_locals(self.symtab.num_definitions());
        let free_symbols = self.symtab.free_symbols().to_vec();
        self.builder.set_free(u32::try_from(free_symbols.len()).unwrap());
        let code = std::mem::replace(&mut self.builder, outer_builder).build();

        let (outer, _) = self.symtab.leave();
        self.symtab = outer.unwrap();
        let _ = outer_symtab;

        for sym in &free_symbols {
            match sym.scope {
                ScopeKind::Local => self.builder.emit_operand(Opcode::LoadLocal, sym.index),
                ScopeKind::Free => self.builder.emit_operand(Opcode::LoadFree, sym.index),
                ScopeKind::Global => self.builder.emit_operand(Opcode::LoadGlobal, sym.index),
                ScopeKind::BuiltIn => self.builder.emit_operand(Opcode::LoadBuiltIn, sym.index),
                ScopeKind::Internal => unreachable!(),
            }
        }
        let n_free = u32::try_from(free_symbols.len()).unwrap();

        let function = crate::value::FunctionValue {
            name: "<lambda>".into(),
            pkg: self.pkg.clone(),
            code: Rc::new(code),
            params: params
                .iter()
                .zip(defaults)
                .map(|(p, default)| ParamSlot { name: p.name.clone(), default: if matches!(default, Value::Undefined) { None } else { Some(default) } })
                .collect(),
        };
        let const_idx = self.builder.add_const(Value::Function(Rc::new(function)));
        self.builder.emit_operand(Opcode::LoadConst, const_idx);
        self.builder.emit_operand_with_effect(Opcode::MakeFunction, n_free, -(i16::try_from(n_free).unwrap_or(i16::MAX)));
        Ok(())
    }

    fn compile_quantifier(
        &mut self,
        kind: QuantifierKind,
        vars: &[String],
        iter: &Expr,
        cond: &Option<Box<Expr>>,
        map_expr: &Option<Box<Expr>>,
    ) -> KclResult<()> {
        match kind {
            QuantifierKind::All | QuantifierKind::Any => {
                let init = kind == QuantifierKind::All;
                let idx = self.builder.add_const(Value::Bool(init));
                self.builder.emit_operand(Opcode::LoadConst, idx);
                let test = map_expr.as_deref().ok_or_else(|| {
                    compile_err(CompileErrorCode::InvalidQuantifierOp, &Span::dummy(), "all/any requires a test expression")
                })?;
                self.compile_comp_loop(vars, iter, cond, |c| {
                    c.compile_expr(test)?;
                    c.builder.emit(if init { Opcode::LogicAnd } else { Opcode::LogicOr });
                    Ok(())
                })
            }
            QuantifierKind::Map => {
                let result_idx = self.builder.add_const(Value::List(Vec::new()));
                self.builder.emit_operand(Opcode::LoadConst, result_idx);
                let mapper = map_expr.as_deref().ok_or_else(|| {
                    compile_err(CompileErrorCode::InvalidQuantifierOp, &Span::dummy(), "map requires a mapping expression")
                })?;
                self.compile_comp_loop(vars, iter, cond, |c| {
                    c.compile_expr(mapper)?;
                    c.builder.emit_operand_with_effect(Opcode::BuildList, 1, effect_build(1, 1));
                    c.builder.emit(Opcode::BinaryAdd);
                    Ok(())
                })
            }
            QuantifierKind::Filter => {
                let result_idx = self.builder.add_const(Value::List(Vec::new()));
                self.builder.emit_operand(Opcode::LoadConst, result_idx);
                self.compile_comp_loop(vars, iter, cond, |c| {
                    if let Some(elem) = &map_expr {
                        c.compile_expr(elem)?;
                    } else if vars.len() == 1 {
                        c.compile_name_load(&Identifier::single(vars[0].clone()))?;
                    } else {
                        for v in vars {
                            c.compile_name_load(&Identifier::single(v.clone()))?;
                        }
                        let n = u32::try_from(vars.len()).expect("loop variable count");
                        c.builder.emit_operand_with_effect(Opcode::BuildList, n, effect_build(n, 1));
                    }
                    c.builder.emit_operand_with_effect(Opcode::BuildList, 1, effect_build(1, 1));
                    c.builder.emit(Opcode::BinaryAdd);
                    Ok(())
                })
            }
        }
    }
}

fn effect_build(n: u32, push: i16) -> i16 {
    push - i16::try_from(n).unwrap_or(i16::MAX)
}

fn config_op_operand(op: ConfigEntryOp) -> u32 {
    match op {
        ConfigEntryOp::Override => 0,
        ConfigEntryOp::Union => 1,
        ConfigEntryOp::Insert => 2,
    }
}

fn binary_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::BinaryAdd,
        BinOp::Sub => Opcode::BinarySub,
        BinOp::Mul => Opcode::BinaryMul,
        BinOp::Div => Opcode::BinaryTrueDivide,
        BinOp::FloorDiv => Opcode::BinaryFloorDivide,
        BinOp::Mod => Opcode::BinaryModulo,
        BinOp::Pow => Opcode::BinaryPower,
        BinOp::LShift => Opcode::BinaryLShift,
        BinOp::RShift => Opcode::BinaryRShift,
        BinOp::BitOr => Opcode::BinaryOr,
        BinOp::BitXor => Opcode::BinaryXor,
        BinOp::BitAnd => Opcode::BinaryAnd,
        BinOp::And => Opcode::LogicAnd,
        BinOp::Or => Opcode::LogicOr,
        BinOp::As => Opcode::MembershipAs,
    }
}

fn inplace_opcode(op: AugOp) -> Opcode {
    match op {
        AugOp::Add => Opcode::InplaceAdd,
        AugOp::Sub => Opcode::InplaceSub,
        AugOp::Mul => Opcode::InplaceMul,
        AugOp::Div => Opcode::InplaceTrueDivide,
        AugOp::FloorDiv => Opcode::InplaceFloorDivide,
        AugOp::Mod => Opcode::InplaceModulo,
        AugOp::Pow => Opcode::InplacePower,
        AugOp::LShift => Opcode::InplaceLShift,
        AugOp::RShift => Opcode::InplaceRShift,
        AugOp::BitOr => Opcode::InplaceOr,
        AugOp::BitXor => Opcode::InplaceXor,
        AugOp::BitAnd => Opcode::InplaceAnd,
    }
}

fn compare_opcode(op: CmpOp) -> Opcode {
    match op {
        CmpOp::Eq => Opcode::CompareEqualTo,
        CmpOp::NotEq => Opcode::CompareNotEqualTo,
        CmpOp::Lt => Opcode::CompareLessThan,
        CmpOp::LtE => Opcode::CompareLessThanOrEqualTo,
        CmpOp::Gt => Opcode::CompareGreaterThan,
        CmpOp::GtE => Opcode::CompareGreaterThanOrEqualTo,
        CmpOp::Is => Opcode::CompareIs,
        // A bare `not` used as a binary comparison operator is treated
        // identically to `is not`.
        CmpOp::IsNot | CmpOp::Not => Opcode::CompareIsNot,
        CmpOp::In => Opcode::CompareIn,
        CmpOp::NotIn => Opcode::CompareNotIn,
    }
}

fn unary_opcode(op: UnaryOp) -> Opcode {
    match op {
        UnaryOp::Invert => Opcode::UnaryInvert,
        UnaryOp::Not => Opcode::UnaryNot,
        UnaryOp::Pos => Opcode::UnaryPositive,
        UnaryOp::Neg => Opcode::UnaryNegative,
    }
}

/// Parses a number-multiplier unit suffix, rejecting anything outside the
/// fixed table.
fn parse_unit(suffix: &str, span: &Span) -> KclResult<NumberUnit> {
    suffix.parse().map_err(|_| KclError::new(ErrorKind::IllegalArgumentError, span.clone(), format!("invalid unit suffix `{suffix}`")))
}

/// Evaluates a literal expression at compile time, for contexts that need an
/// already-evaluated `Value` (parameter defaults, decorator arguments).
/// Non-literal expressions are rejected — defaults and decorator arguments
/// are restricted to literals at this AST boundary.
fn const_eval_literal(expr: &Expr) -> KclResult<Value> {
    match expr {
        Expr::Int(v) => Ok(Value::Int(*v)),
        Expr::Float(v) => Ok(Value::Float(*v)),
        Expr::Str(s) => Ok(Value::str(s.as_str())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::None => Ok(Value::None),
        Expr::Undefined => Ok(Value::Undefined),
        Expr::NumberMultiplier(raw, suffix) => Ok(Value::NumberMultiplier(*raw, parse_unit(suffix, &Span::dummy())?)),
        Expr::List(items) => Ok(Value::List(items.iter().map(const_eval_literal).collect::<KclResult<_>>()?)),
        _ => Err(KclError::new(ErrorKind::CompileError, Span::dummy(), "expected a literal expression here")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Module, Program};

    fn single(stmts: Vec<Stmt>) -> Program {
        Program::single_module("main", Module::new("main.k", stmts))
    }

    #[test]
    fn simple_assign_compiles_and_stores_global() {
        let program = single(vec![Stmt::Assign {
            targets: vec![AssignTarget::Name(Identifier::single("x"))],
            value: Expr::Int(42),
            span: Span::dummy(),
        }]);
        let compiled = compile_program(&program).unwrap();
        let code = &compiled.packages["main"];
        assert!(!code.instructions.is_empty());
        assert_eq!(code.constants[0], Value::Int(42));
    }

    #[test]
    fn undefined_name_is_a_compile_error() {
        let program = single(vec![Stmt::Expr(Expr::Name(Identifier::single("nope")))]);
        let err = compile_program(&program).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CompileError);
        assert!(err.message.contains("SYMBOL_NOT_DEFINED"));
    }

    #[test]
    fn schema_statement_registers_schema_type() {
        let schema = SchemaStmt {
            name: "Person".into(),
            parent_name: None,
            mixins: Vec::new(),
            index_signature: None,
            attrs: vec![SchemaAttr { name: "name".into(), type_str: "str".into(), default: Some(Expr::Str("Alice".into())), is_optional: false, span: Span::dummy() }],
            body: Vec::new(),
            checks: Vec::new(),
            decorators: Vec::new(),
            is_relaxed: false,
            docstring: None,
            span: Span::dummy(),
        };
        let program = single(vec![Stmt::Schema(schema)]);
        let compiled = compile_program(&program).unwrap();
        assert_eq!(compiled.schema_types.len(), 1);
        assert!(compiled.schema_types.contains_key(&mangle("main", "Person")));
    }
}
