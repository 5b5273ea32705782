//! Compiled schema and rule type objects.
//!
//! A `SchemaType` is what `BUILD_SCHEMA(name-idx)` resolves by mangled name:
//! the schema body's compiled sub-program plus the inheritance/decoration
//! metadata the VM needs to run the construction pipeline.

use std::rc::Rc;

use super::code::Code;
use crate::value::{DecoratorTarget, Value};

/// A single attribute declared directly on a schema (`name: type = default`
/// or `name: type` for a required attribute). Computed attributes (plain
/// `name = expr` statements in the body that don't correspond to a declared
/// attribute) are not listed here — they are discovered by walking the
/// body's statement list at construction time.
#[derive(Debug, Clone)]
pub struct DeclaredAttr {
    pub name: String,
    pub has_default: bool,
    pub is_optional: bool,
}

#[derive(Debug, Clone)]
pub struct DecoratorSpec {
    pub name: String,
    pub target: DecoratorTarget,
    pub attribute: Option<String>,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

#[derive(Debug, Clone)]
pub struct SchemaType {
    pub name: String,
    /// Package the schema was declared in, so its body frame addresses the
    /// right package's globals regardless of which package constructs it.
    pub pkg: String,
    pub parent: Option<String>,
    pub mixins: Vec<String>,
    pub index_signature: Option<(String, String, String)>,
    pub relaxed: bool,
    pub declared_attrs: Vec<DeclaredAttr>,
    pub body: Rc<Code>,
    pub decorators: Vec<DecoratorSpec>,
    pub docstring: Option<String>,
}

/// A rule's compiled constraints-only body: evaluating it returns `true`
/// only if every check passes.
#[derive(Debug, Clone)]
pub struct RuleType {
    pub name: String,
    pub parent_rules: Vec<String>,
    pub body: Rc<Code>,
}
