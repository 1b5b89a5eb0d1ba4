//! Runtime values for the stack VM.
//!
//! Immediate values (numbers, None) are stored inline; everything else is
//! reference-counted. Frames, cells, and namespaces only ever form a tree
//! (cells outlive their defining frame only when captured by a returned
//! closure), so `Rc` suffices and no tracing collector is needed.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::bytecode::code::{CodeObject, Const};

/// String-keyed, insertion-ordered mapping used for globals, locals, class
/// namespaces, instance attributes, and module namespaces.
pub type Namespace = IndexMap<String, Value, ahash::RandomState>;

/// A one-slot shared mutable container backing closed-over variables.
pub type CellRef = Rc<RefCell<Value>>;

/// A Python-level value.
#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Rc<Vec<Value>>),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<Dict>>),
    Code(Rc<CodeObject>),
    Function(Rc<FunctionObject>),
    /// A function retrieved through a class or instance; carries the
    /// receiver (when bound) and the class it was found on.
    Method(Rc<MethodObject>),
    Class(Rc<ClassObject>),
    Instance(Rc<InstanceObject>),
    Module(Rc<ModuleObject>),
    Cell(CellRef),
    Iter(Rc<RefCell<IterObject>>),
    Builtin(Builtin),
    /// A builtin container method bound to its receiver (`xs.append`).
    BuiltinMethod(Rc<BuiltinMethod>),
    /// The class-building callable pushed by `LOAD_BUILD_CLASS`.
    BuildClass,
    /// Internal token used by the finally-unwind protocol; never observable
    /// by user code.
    UnwindToken(UnwindReason),
}

/// Why the finally protocol is unwinding; stored on the stack as a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindReason {
    Return,
    Break,
    Continue,
}

/// Builtin functions available in the default builtins namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    Print,
    Range,
    Len,
    Repr,
    IsInstance,
}

/// Builtin container methods reachable through attribute access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMethodKind {
    ListAppend,
    ListExtend,
    DictGet,
}

#[derive(Debug)]
pub struct BuiltinMethod {
    pub kind: BuiltinMethodKind,
    pub recv: Value,
}

/// A user-defined function: code plus captured environment.
#[derive(Debug)]
pub struct FunctionObject {
    pub name: Rc<str>,
    pub code: Rc<CodeObject>,
    pub globals: Rc<RefCell<Namespace>>,
    pub defaults: Vec<Value>,
    /// Cells for the code object's freevars, in freevar order.
    pub closure: Vec<CellRef>,
}

/// A function found via attribute lookup on a class or instance.
///
/// `self_object` is `None` for access through the class itself; the call
/// protocol then type-checks the explicit first argument against `class`.
#[derive(Debug)]
pub struct MethodObject {
    pub func: Rc<FunctionObject>,
    pub self_object: Option<Value>,
    pub class: Rc<ClassObject>,
}

#[derive(Debug)]
pub struct ClassObject {
    pub name: Rc<str>,
    pub bases: Vec<Rc<ClassObject>>,
    pub namespace: RefCell<Namespace>,
}

impl ClassObject {
    /// Depth-first attribute lookup through the class and its bases.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.namespace.borrow().get(name) {
            return Some(value.clone());
        }
        self.bases.iter().find_map(|base| base.lookup(name))
    }

    /// True if `self` is `other` or a transitive subclass of it.
    #[must_use]
    pub fn is_subclass_of(self: &Rc<Self>, other: &Rc<ClassObject>) -> bool {
        if Rc::ptr_eq(self, other) {
            return true;
        }
        self.bases.iter().any(|base| base.is_subclass_of(other))
    }
}

#[derive(Debug)]
pub struct InstanceObject {
    pub class: Rc<ClassObject>,
    pub attrs: RefCell<Namespace>,
}

#[derive(Debug)]
pub struct ModuleObject {
    pub name: Rc<str>,
    pub namespace: RefCell<Namespace>,
}

/// Dictionary storage; keys are restricted to hashable values.
pub type Dict = IndexMap<DictKey, Value, ahash::RandomState>;

/// Hashable projection of a [`Value`] for use as a dict key.
///
/// Numeric keys are normalized the way the source language hashes them:
/// `True`, `1`, and `1.0` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DictKey {
    None,
    Int(i64),
    FloatBits(u64),
    Str(Rc<str>),
    Bytes(Rc<[u8]>),
    Tuple(Vec<DictKey>),
}

impl DictKey {
    /// Projects a value to its key form; `None` for unhashable values.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<DictKey> {
        match value {
            Value::None => Some(DictKey::None),
            Value::Bool(flag) => Some(DictKey::Int(i64::from(*flag))),
            Value::Int(number) => Some(DictKey::Int(*number)),
            Value::Float(number) => {
                if number.fract() == 0.0 && *number >= i64::MIN as f64 && *number <= i64::MAX as f64
                {
                    Some(DictKey::Int(*number as i64))
                } else {
                    Some(DictKey::FloatBits(number.to_bits()))
                }
            }
            Value::Str(text) => Some(DictKey::Str(Rc::clone(text))),
            Value::Bytes(bytes) => Some(DictKey::Bytes(Rc::clone(bytes))),
            Value::Tuple(items) => items
                .iter()
                .map(DictKey::from_value)
                .collect::<Option<Vec<_>>>()
                .map(DictKey::Tuple),
            _ => None,
        }
    }

    /// Reconstructs a value from the key form (for iteration and `repr`).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            DictKey::None => Value::None,
            DictKey::Int(number) => Value::Int(*number),
            DictKey::FloatBits(bits) => Value::Float(f64::from_bits(*bits)),
            DictKey::Str(text) => Value::Str(Rc::clone(text)),
            DictKey::Bytes(bytes) => Value::Bytes(Rc::clone(bytes)),
            DictKey::Tuple(items) => {
                Value::Tuple(Rc::new(items.iter().map(DictKey::to_value).collect()))
            }
        }
    }
}

/// Iterator state produced by `GET_ITER` and advanced by `FOR_ITER`.
#[derive(Debug)]
pub enum IterObject {
    Seq { items: Vec<Value>, position: usize },
    Range { next: i64, stop: i64, step: i64 },
}

impl IterObject {
    pub fn advance(&mut self) -> Option<Value> {
        match self {
            IterObject::Seq { items, position } => {
                let item = items.get(*position).cloned();
                if item.is_some() {
                    *position += 1;
                }
                item
            }
            IterObject::Range { next, stop, step } => {
                let exhausted = if *step >= 0 { *next >= *stop } else { *next <= *stop };
                if exhausted {
                    None
                } else {
                    let item = Value::Int(*next);
                    *next += *step;
                    Some(item)
                }
            }
        }
    }
}

impl Value {
    #[must_use]
    pub fn str(text: impl Into<Rc<str>>) -> Value {
        Value::Str(text.into())
    }

    /// Materializes a compile-time constant into a runtime value.
    #[must_use]
    pub fn from_const(constant: &Const) -> Value {
        match constant {
            Const::None => Value::None,
            Const::Bool(flag) => Value::Bool(*flag),
            Const::Int(number) => Value::Int(*number),
            Const::Float(number) => Value::Float(*number),
            Const::Str(text) => Value::Str(Rc::from(text.as_str())),
            Const::Bytes(bytes) => Value::Bytes(Rc::from(bytes.as_slice())),
            Const::Tuple(items) => {
                Value::Tuple(Rc::new(items.iter().map(Value::from_const).collect()))
            }
            Const::Code(code) => Value::Code(Rc::clone(code)),
        }
    }

    /// Truth-value testing: empty containers, zeros, and None are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(flag) => *flag,
            Value::Int(number) => *number != 0,
            Value::Float(number) => *number != 0.0,
            Value::Str(text) => !text.is_empty(),
            Value::Bytes(bytes) => !bytes.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            _ => true,
        }
    }

    /// The type name used in error messages.
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".to_owned(),
            Value::Bool(_) => "bool".to_owned(),
            Value::Int(_) => "int".to_owned(),
            Value::Float(_) => "float".to_owned(),
            Value::Str(_) => "str".to_owned(),
            Value::Bytes(_) => "bytes".to_owned(),
            Value::Tuple(_) => "tuple".to_owned(),
            Value::List(_) => "list".to_owned(),
            Value::Dict(_) => "dict".to_owned(),
            Value::Code(_) => "code".to_owned(),
            Value::Function(_) | Value::BuiltinMethod(_) | Value::BuildClass => {
                "function".to_owned()
            }
            Value::Method(_) => "method".to_owned(),
            Value::Class(class) => class.name.to_string(),
            Value::Instance(instance) => instance.class.name.to_string(),
            Value::Module(_) => "module".to_owned(),
            Value::Cell(_) => "cell".to_owned(),
            Value::Iter(_) => "iterator".to_owned(),
            Value::Builtin(builtin) => builtin.to_string(),
            Value::UnwindToken(_) => "unwind-token".to_owned(),
        }
    }

    /// Value equality following the source language's rules: numbers compare
    /// across types, sequences compare element-wise, everything else by
    /// identity.
    #[must_use]
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Bool(a), Value::Int(b)) | (Value::Int(b), Value::Bool(a)) => {
                i64::from(*a) == *b
            }
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Bool(a), Value::Float(b)) | (Value::Float(b), Value::Bool(a)) => {
                f64::from(*a) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, value)| b.get(key).is_some_and(|other| value.py_eq(other)))
            }
            _ => self.is(other),
        }
    }

    /// Identity comparison.
    #[must_use]
    pub fn is(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Module(a), Value::Module(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }

    /// `repr()` of the value.
    #[must_use]
    pub fn repr(&self) -> String {
        match self {
            Value::None => "None".to_owned(),
            Value::Bool(true) => "True".to_owned(),
            Value::Bool(false) => "False".to_owned(),
            Value::Int(number) => number.to_string(),
            Value::Float(number) => {
                if number.fract() == 0.0 && number.is_finite() {
                    format!("{number:.1}")
                } else {
                    number.to_string()
                }
            }
            Value::Str(text) => format!("{text:?}"),
            Value::Bytes(bytes) => {
                let mut out = String::from("b'");
                for byte in bytes.iter() {
                    match byte {
                        b'\\' => out.push_str("\\\\"),
                        b'\'' => out.push_str("\\'"),
                        0x20..=0x7e => out.push(*byte as char),
                        _ => {
                            let _ = write!(out, "\\x{byte:02x}");
                        }
                    }
                }
                out.push('\'');
                out
            }
            Value::Tuple(items) => {
                let parts: Vec<String> = items.iter().map(Value::repr).collect();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            Value::List(items) => {
                let parts: Vec<String> = items.borrow().iter().map(Value::repr).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Dict(entries) => {
                let parts: Vec<String> = entries
                    .borrow()
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key.to_value().repr(), value.repr()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Code(code) => format!("<code object {}>", code.name),
            Value::Function(function) => format!("<function {}>", function.name),
            Value::Method(method) => match &method.self_object {
                Some(receiver) => format!(
                    "<bound method {}.{} of {}>",
                    method.class.name,
                    method.func.name,
                    receiver.repr()
                ),
                None => format!("<method {}.{}>", method.class.name, method.func.name),
            },
            Value::Class(class) => format!("<class '{}'>", class.name),
            Value::Instance(instance) => {
                // Exception instances render like the reference VM's
                // `repr(exc)`: ClassName(args...).
                let attrs = instance.attrs.borrow();
                if let Some(Value::Tuple(args)) = attrs.get("args") {
                    let parts: Vec<String> = args.iter().map(Value::repr).collect();
                    format!("{}({})", instance.class.name, parts.join(", "))
                } else {
                    format!("<{} object>", instance.class.name)
                }
            }
            Value::Module(module) => format!("<module '{}'>", module.name),
            Value::Cell(cell) => format!("<cell: {}>", cell.borrow().repr()),
            Value::Iter(_) => "<iterator>".to_owned(),
            Value::Builtin(builtin) => format!("<built-in function {builtin}>"),
            Value::BuiltinMethod(method) => {
                format!("<built-in method of {}>", method.recv.type_name())
            }
            Value::BuildClass => "<built-in function __build_class__>".to_owned(),
            Value::UnwindToken(reason) => format!("<unwind {reason:?}>"),
        }
    }

    /// `str()` of the value: strings unquoted, otherwise `repr`.
    #[must_use]
    pub fn py_str(&self) -> String {
        match self {
            Value::Str(text) => text.to_string(),
            Value::Instance(instance) => {
                // Exceptions stringify as their single argument, or the
                // joined args, like the reference message format.
                let attrs = instance.attrs.borrow();
                if let Some(Value::Tuple(args)) = attrs.get("args") {
                    match args.len() {
                        0 => String::new(),
                        1 => args[0].py_str(),
                        _ => self.repr(),
                    }
                } else {
                    self.repr()
                }
            }
            other => other.repr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::None.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::str("").is_truthy());
        assert!(Value::Int(-1).is_truthy());
        assert!(Value::str("x").is_truthy());
        assert!(!Value::List(Rc::new(RefCell::new(Vec::new()))).is_truthy());
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(Value::Int(1).py_eq(&Value::Float(1.0)));
        assert!(Value::Bool(true).py_eq(&Value::Int(1)));
        assert!(!Value::Int(1).py_eq(&Value::str("1")));
    }

    #[test]
    fn dict_keys_normalize_numerics() {
        assert_eq!(
            DictKey::from_value(&Value::Bool(true)),
            DictKey::from_value(&Value::Int(1))
        );
        assert_eq!(
            DictKey::from_value(&Value::Float(1.0)),
            DictKey::from_value(&Value::Int(1))
        );
        assert!(DictKey::from_value(&Value::List(Rc::new(RefCell::new(vec![])))).is_none());
    }

    #[test]
    fn range_iterator_counts_up() {
        let mut iter = IterObject::Range {
            next: 0,
            stop: 3,
            step: 1,
        };
        let mut collected = Vec::new();
        while let Some(value) = iter.advance() {
            collected.push(value.py_str());
        }
        assert_eq!(collected, vec!["0", "1", "2"]);
    }

    #[test]
    fn reprs() {
        assert_eq!(Value::Float(2.0).repr(), "2.0");
        assert_eq!(Value::str("a\"b").repr(), "\"a\\\"b\"");
        let tuple = Value::Tuple(Rc::new(vec![Value::Int(1)]));
        assert_eq!(tuple.repr(), "(1,)");
    }
}
