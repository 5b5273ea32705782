//! Runtime value model.
//!
//! Values are plain, structurally-equal, recursively-owned trees: unlike a
//! heap-arena `Value` (necessary where arbitrary object graphs can cycle),
//! KCL's value graph is tree-shaped apart from the one closure/schema
//! back-reference: closures own their captured free slots by value rather
//! than sharing a frame. Sharing is expressed with
//! `Rc` only where several instances need to observe the same definition
//! (a schema type, a compiled function body).

use std::{cmp::Ordering, fmt, rc::Rc};

use indexmap::IndexMap;

use crate::{ast::ConfigEntryOp, bytecode::code::Code, errors::{KclError, Span}};

/// Binary (IEC) and decimal (SI) unit suffixes recognized on integer
/// literals, e.g. `1Mi`, `10k`.
///
/// Grounded in `internal/kclvm_py/compiler/build/utils/units.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum NumberUnit {
    #[strum(serialize = "n")]
    Nano,
    #[strum(serialize = "u")]
    Micro,
    #[strum(serialize = "m")]
    Milli,
    #[strum(serialize = "k")]
    Kilo,
    #[strum(serialize = "K")]
    KiloCap,
    #[strum(serialize = "M")]
    Mega,
    #[strum(serialize = "G")]
    Giga,
    #[strum(serialize = "T")]
    Tera,
    #[strum(serialize = "P")]
    Peta,
    #[strum(serialize = "Ki")]
    Kibi,
    #[strum(serialize = "Mi")]
    Mebi,
    #[strum(serialize = "Gi")]
    Gibi,
    #[strum(serialize = "Ti")]
    Tebi,
    #[strum(serialize = "Pi")]
    Pebi,
}

impl NumberUnit {
    /// `(base, exponent)` such that the multiplier is `base.pow(exponent)`.
    #[must_use]
    pub fn base_exponent(self) -> (i64, i32) {
        match self {
            Self::Nano => (1000, -3),
            Self::Micro => (1000, -2),
            Self::Milli => (1000, -1),
            Self::Kilo | Self::KiloCap => (1000, 1),
            Self::Mega => (1000, 2),
            Self::Giga => (1000, 3),
            Self::Tera => (1000, 4),
            Self::Peta => (1000, 5),
            Self::Kibi => (1024, 1),
            Self::Mebi => (1024, 2),
            Self::Gibi => (1024, 3),
            Self::Tebi => (1024, 4),
            Self::Pebi => (1024, 5),
        }
    }

    /// Computes `raw * base^exponent`, matching `units.py::cal_num`.
    #[must_use]
    pub fn apply(self, raw: i64) -> i64 {
        let (base, exponent) = self.base_exponent();
        if exponent >= 0 {
            raw * base.pow(exponent.unsigned_abs())
        } else {
            raw / base.pow(exponent.unsigned_abs())
        }
    }
}

/// A single dict/schema attribute dict entry: its value plus the config
/// operation that most recently set it.
#[derive(Debug, Clone)]
pub struct DictEntry {
    pub value: Value,
    pub op: ConfigEntryOp,
}

/// An insertion-ordered string-keyed map, used for both plain dicts and
/// schema instance attribute dicts.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: IndexMap<String, DictEntry>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value, op: ConfigEntryOp) {
        self.entries.insert(key.into(), DictEntry { value, op });
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<DictEntry> {
        self.entries.shift_remove(key)
    }

    /// Iterates entries in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter().map(|(k, e)| (k, &e.value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(k, e)| other.entries.get(k).is_some_and(|oe| oe.value == e.value))
    }
}

/// Settings carried by a schema instance beyond its attribute dict.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSettings {
    pub has_check: bool,
    pub index_signature: Option<(String, String, String)>,
    pub relaxed: bool,
    pub optional: Vec<String>,
}

/// A fully or partially constructed schema instance. Attribute values that
/// are still unforced lazy thunks are *not* present in `attrs` yet — they
/// live in `pending` until first read or until construction forces them.
#[derive(Debug, Clone)]
pub struct SchemaInstance {
    pub type_name: String,
    pub attrs: Dict,
    pub settings: SchemaSettings,
    /// Computed-attribute initializers not yet forced, in textual
    /// declaration order (preserved via `IndexMap`'s insertion order).
    pub(crate) pending: IndexMap<String, Rc<Code>>,
    /// Per-attribute recursion tracking level; incremented on entry into an
    /// initializer, decremented on exit. A re-entrant read at the same level
    /// is a cycle.
    pub(crate) tracking: IndexMap<String, u32>,
}

impl SchemaInstance {
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attrs: Dict::new(),
            settings: SchemaSettings::default(),
            pending: IndexMap::new(),
            tracking: IndexMap::new(),
        }
    }
}

impl PartialEq for SchemaInstance {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name && self.attrs == other.attrs
    }
}

/// A compiled, non-closure function: its code body and parameter list.
/// Parameters with defaults carry the constant-pool index of their default
/// expression's already-evaluated `Value` (defaults are evaluated once, at
/// definition time).
#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub name: String,
    /// Package the function body was compiled in, so a `LOAD_GLOBAL` inside
    /// it still addresses its defining package's globals after the function
    /// value has been passed to or called from a different one.
    pub pkg: String,
    pub code: Rc<Code>,
    pub params: Vec<ParamSlot>,
}

#[derive(Debug, Clone)]
pub struct ParamSlot {
    pub name: String,
    pub default: Option<Value>,
}

/// A function plus the free-variable values it captured at definition time.
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Rc<FunctionValue>,
    pub free: Rc<Vec<Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoratorTarget {
    SchemaType,
    Attribute,
}

#[derive(Debug, Clone)]
pub struct DecoratorValue {
    pub name: String,
    pub target: DecoratorTarget,
    pub args: Vec<Value>,
    pub kwargs: Vec<(String, Value)>,
}

/// The tagged runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bool(bool),
    None,
    Undefined,
    NumberMultiplier(i64, NumberUnit),
    List(Vec<Value>),
    Dict(Dict),
    Schema(Rc<std::cell::RefCell<SchemaInstance>>),
    Function(Rc<FunctionValue>),
    Closure(Closure),
    BuiltIn(String),
    Decorator(Rc<DecoratorValue>),
    /// Internal-only: a nested code object sitting in a constant pool,
    /// consumed by `MAKE_FUNCTION`/`MAKE_CLOSURE`/`BUILD_SCHEMA` and never
    /// otherwise observable (never reachable from the planner).
    CodeObject(Rc<Code>),
}

impl Value {
    #[must_use]
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Self::Str(s.into())
    }

    /// `Undefined` is "not set"; only it is elidable from planner output.
    #[must_use]
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bool(_) => "bool",
            Self::None => "NoneType",
            Self::Undefined => "UndefinedType",
            Self::NumberMultiplier(..) => "int",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Schema(_) => "schema",
            Self::Function(_) | Self::Closure(_) | Self::BuiltIn(_) => "function",
            Self::Decorator(_) => "decorator",
            Self::CodeObject(_) => "code",
        }
    }

    /// Truthiness, used by `POP_JUMP_IF_*` and boolean coercion.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::List(l) => !l.is_empty(),
            Self::Dict(d) => !d.is_empty(),
            Self::None | Self::Undefined => false,
            Self::NumberMultiplier(raw, _) => *raw != 0,
            Self::Schema(_) | Self::Function(_) | Self::Closure(_) | Self::BuiltIn(_) | Self::Decorator(_) | Self::CodeObject(_) => true,
        }
    }

    /// Integer value for arithmetic, coercing `Bool` to 0/1 and
    /// `NumberMultiplier` to its expanded value.
    #[must_use]
    pub fn as_int_for_arith(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::NumberMultiplier(raw, unit) => Some(unit.apply(*raw)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_float_for_arith(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            other => other.as_int_for_arith().map(|i| i as f64),
        }
    }
}

/// Structural equality.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::None, Self::None) => true,
            (Self::Undefined, Self::Undefined) => true,
            (Self::NumberMultiplier(a, ua), Self::NumberMultiplier(b, ub)) => ua.apply(*a) == ub.apply(*b),
            (Self::NumberMultiplier(a, u), Self::Int(b)) | (Self::Int(b), Self::NumberMultiplier(a, u)) => u.apply(*a) == *b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dict(a), Self::Dict(b)) => a == b,
            (Self::Schema(a), Self::Schema(b)) => Rc::ptr_eq(a, b) || *a.borrow() == *b.borrow(),
            (Self::BuiltIn(a), Self::BuiltIn(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Closure(a), Self::Closure(b)) => Rc::ptr_eq(&a.function, &b.function) && Rc::ptr_eq(&a.free, &b.free),
            (Self::Decorator(a), Self::Decorator(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a.partial_cmp(b),
            (Self::List(a), Self::List(b)) => a.partial_cmp(b),
            _ => match (self.as_float_for_arith(), other.as_float_for_arith()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::None => write!(f, "None"),
            Self::Undefined => write!(f, "Undefined"),
            Self::NumberMultiplier(raw, unit) => write!(f, "{raw}{unit}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Dict(d) => {
                write!(f, "{{")?;
                for (i, (k, v)) in d.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Self::Schema(instance) => write!(f, "{}(...)", instance.borrow().type_name),
            Self::Function(func) => write!(f, "<function {}>", func.name),
            Self::Closure(c) => write!(f, "<function {}>", c.function.name),
            Self::BuiltIn(name) => write!(f, "<built-in function {name}>"),
            Self::Decorator(d) => write!(f, "<decorator {}>", d.name),
            Self::CodeObject(_) => write!(f, "<code>"),
        }
    }
}

/// Casts a freshly stored `Int` into a narrower range when strict-range-check
/// is enabled.
pub fn check_int_range(value: i64, strict: bool, span: &Span) -> Result<(), KclError> {
    use crate::errors::ErrorKind;
    if strict {
        if value < i64::from(i32::MIN) || value > i64::from(i32::MAX) {
            return Err(KclError::new(ErrorKind::IntOverflow, span.clone(), format!("int value {value} overflows 32-bit range")));
        }
    }
    // Without strict-range-check the 64-bit bound always holds for an `i64`
    // by construction; overflow at that width is only observable by callers
    // constructing from a wider intermediate (e.g. big literal parsing),
    // which is out of scope for this crate (no lexer/parser).
    Ok(())
}
