//! The builtin namespace: functions and the exception class tree.
//!
//! Builtin exception classes are ordinary class objects wired into a base
//! chain rooted at `BaseException`, so user `except` clauses and user
//! subclasses work through the same subclass test as everything else.

use std::cell::RefCell;
use std::rc::Rc;

use strum::IntoEnumIterator;

use crate::value::{Builtin, ClassObject, IterObject, Namespace, Value};
use crate::vm::exc::{ExcType, SimpleException};
use crate::vm::{VirtualMachine, VmError};

/// Builds the default builtins namespace. Returns the namespace and the
/// `BaseException` class, which anchors every exception subclass test.
pub fn install() -> (Rc<RefCell<Namespace>>, Rc<ClassObject>) {
    let mut namespace = Namespace::default();
    let mut base_exception = None;

    for exc_type in ExcType::iter() {
        let bases = match exc_type.base() {
            None => vec![],
            Some(base) => {
                let Some(Value::Class(base_class)) = namespace.get(&base.to_string()) else {
                    unreachable!("exception bases are declared before their subclasses");
                };
                vec![Rc::clone(base_class)]
            }
        };
        let class = Rc::new(ClassObject {
            name: Rc::from(exc_type.to_string().as_str()),
            bases,
            namespace: RefCell::new(Namespace::default()),
        });
        if exc_type == ExcType::BaseException {
            base_exception = Some(Rc::clone(&class));
        }
        namespace.insert(exc_type.to_string(), Value::Class(class));
    }

    for builtin in [
        Builtin::Print,
        Builtin::Range,
        Builtin::Len,
        Builtin::Repr,
        Builtin::IsInstance,
    ] {
        namespace.insert(builtin.to_string(), Value::Builtin(builtin));
    }
    namespace.insert("__build_class__".to_owned(), Value::BuildClass);

    (
        Rc::new(RefCell::new(namespace)),
        base_exception.expect("BaseException is always installed"),
    )
}

/// Invokes a builtin function.
pub fn call_builtin(
    vm: &mut VirtualMachine,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, VmError> {
    if !kwargs.is_empty() && builtin != Builtin::Print {
        return Err(vm.raise(SimpleException::new(
            ExcType::TypeError,
            format!("{builtin}() takes no keyword arguments"),
        )));
    }
    match builtin {
        Builtin::Print => {
            let line = args
                .iter()
                .map(Value::py_str)
                .collect::<Vec<_>>()
                .join(" ");
            vm.write_output(&line);
            Ok(Value::None)
        }
        Builtin::Range => range(vm, &args),
        Builtin::Len => match args.as_slice() {
            [value] => length(value).map(Value::Int).ok_or_else(|| {
                vm.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("object of type '{}' has no len()", value.type_name()),
                ))
            }),
            _ => Err(arity(vm, "len", 1, args.len())),
        },
        Builtin::Repr => match args.as_slice() {
            [value] => Ok(Value::str(value.repr())),
            _ => Err(arity(vm, "repr", 1, args.len())),
        },
        Builtin::IsInstance => match args.as_slice() {
            [value, classinfo] => is_instance(value, classinfo)
                .map(Value::Bool)
                .map_err(|exc| vm.raise(exc)),
            _ => Err(arity(vm, "isinstance", 2, args.len())),
        },
    }
}

fn arity(vm: &VirtualMachine, name: &str, expected: usize, got: usize) -> VmError {
    vm.raise(SimpleException::new(
        ExcType::TypeError,
        format!("{name}() takes exactly {expected} argument(s) ({got} given)"),
    ))
}

fn range(vm: &VirtualMachine, args: &[Value]) -> Result<Value, VmError> {
    let int_of = |value: &Value| match value {
        Value::Int(number) => Ok(*number),
        Value::Bool(flag) => Ok(i64::from(*flag)),
        other => Err(vm.raise(SimpleException::new(
            ExcType::TypeError,
            format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ),
        ))),
    };
    let (start, stop, step) = match args {
        [stop] => (0, int_of(stop)?, 1),
        [start, stop] => (int_of(start)?, int_of(stop)?, 1),
        [start, stop, step] => (int_of(start)?, int_of(stop)?, int_of(step)?),
        _ => {
            return Err(vm.raise(SimpleException::new(
                ExcType::TypeError,
                format!("range expected 1 to 3 arguments, got {}", args.len()),
            )))
        }
    };
    if step == 0 {
        return Err(vm.raise(SimpleException::new(
            ExcType::ValueError,
            "range() arg 3 must not be zero".to_owned(),
        )));
    }
    Ok(Value::Iter(Rc::new(RefCell::new(IterObject::Range {
        next: start,
        stop,
        step,
    }))))
}

fn length(value: &Value) -> Option<i64> {
    let length = match value {
        Value::Str(text) => text.chars().count(),
        Value::Bytes(bytes) => bytes.len(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.borrow().len(),
        Value::Dict(entries) => entries.borrow().len(),
        _ => return None,
    };
    Some(length as i64)
}

fn is_instance(value: &Value, classinfo: &Value) -> Result<bool, SimpleException> {
    match classinfo {
        Value::Class(class) => Ok(match value {
            Value::Instance(instance) => instance.class.is_subclass_of(class),
            _ => false,
        }),
        Value::Tuple(choices) => {
            for choice in choices.iter() {
                if is_instance(value, choice)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(SimpleException::new(
            ExcType::TypeError,
            "isinstance() arg 2 must be a type or tuple of types".to_owned(),
        )),
    }
}
