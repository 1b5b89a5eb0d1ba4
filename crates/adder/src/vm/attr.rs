//! The attribute protocol: `LOAD_ATTR` / `STORE_ATTR` and method binding.

use std::rc::Rc;

use crate::value::{BuiltinMethod, BuiltinMethodKind, MethodObject, Value};
use crate::vm::exc::{ExcType, SimpleException};

fn missing(value: &Value, name: &str) -> SimpleException {
    SimpleException::new(
        ExcType::AttributeError,
        format!("'{}' object has no attribute '{}'", value.type_name(), name),
    )
}

/// Looks up `name` on `value`.
///
/// Instance lookup checks the instance attributes, then the class and its
/// bases; functions found on the class bind to the receiver. Class lookup
/// yields unbound methods whose first argument is type-checked at call time.
pub fn getattr(value: &Value, name: &str) -> Result<Value, SimpleException> {
    match value {
        Value::Instance(instance) => {
            if let Some(found) = instance.attrs.borrow().get(name) {
                return Ok(found.clone());
            }
            match instance.class.lookup(name) {
                Some(Value::Function(func)) => Ok(Value::Method(Rc::new(MethodObject {
                    func,
                    self_object: Some(value.clone()),
                    class: Rc::clone(&instance.class),
                }))),
                Some(found) => Ok(found),
                None => Err(missing(value, name)),
            }
        }
        Value::Class(class) => {
            if name == "__name__" {
                return Ok(Value::Str(Rc::clone(&class.name)));
            }
            match class.lookup(name) {
                Some(Value::Function(func)) => Ok(Value::Method(Rc::new(MethodObject {
                    func,
                    self_object: None,
                    class: Rc::clone(class),
                }))),
                Some(found) => Ok(found),
                None => Err(SimpleException::new(
                    ExcType::AttributeError,
                    format!("type object '{}' has no attribute '{}'", class.name, name),
                )),
            }
        }
        Value::Module(module) => module
            .namespace
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                SimpleException::new(
                    ExcType::AttributeError,
                    format!("module '{}' has no attribute '{}'", module.name, name),
                )
            }),
        Value::List(_) => {
            let kind = match name {
                "append" => BuiltinMethodKind::ListAppend,
                "extend" => BuiltinMethodKind::ListExtend,
                _ => return Err(missing(value, name)),
            };
            Ok(Value::BuiltinMethod(Rc::new(BuiltinMethod {
                kind,
                recv: value.clone(),
            })))
        }
        Value::Dict(_) => match name {
            "get" => Ok(Value::BuiltinMethod(Rc::new(BuiltinMethod {
                kind: BuiltinMethodKind::DictGet,
                recv: value.clone(),
            }))),
            _ => Err(missing(value, name)),
        },
        _ => Err(missing(value, name)),
    }
}

/// Stores `name` on `target`; only instances, classes, and modules accept
/// attribute assignment.
pub fn setattr(target: &Value, name: &str, value: Value) -> Result<(), SimpleException> {
    match target {
        Value::Instance(instance) => {
            instance.attrs.borrow_mut().insert(name.to_owned(), value);
            Ok(())
        }
        Value::Class(class) => {
            class.namespace.borrow_mut().insert(name.to_owned(), value);
            Ok(())
        }
        Value::Module(module) => {
            module.namespace.borrow_mut().insert(name.to_owned(), value);
            Ok(())
        }
        _ => Err(SimpleException::new(
            ExcType::AttributeError,
            format!(
                "'{}' object has no settable attribute '{}'",
                target.type_name(),
                name
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::value::{ClassObject, InstanceObject, Namespace};

    #[test]
    fn list_append_binds_receiver() {
        let list = Value::List(Rc::new(RefCell::new(vec![Value::Int(1)])));
        let method = getattr(&list, "append").unwrap();
        let Value::BuiltinMethod(method) = method else {
            panic!("expected builtin method");
        };
        assert_eq!(method.kind, BuiltinMethodKind::ListAppend);
        assert!(method.recv.is(&list));
    }

    #[test]
    fn instance_attrs_shadow_class_attrs() {
        let class = Rc::new(ClassObject {
            name: Rc::from("A"),
            bases: vec![],
            namespace: RefCell::new(Namespace::default()),
        });
        class
            .namespace
            .borrow_mut()
            .insert("x".to_owned(), Value::Int(1));
        let instance = Value::Instance(Rc::new(InstanceObject {
            class,
            attrs: RefCell::new(Namespace::default()),
        }));
        assert!(matches!(getattr(&instance, "x").unwrap(), Value::Int(1)));
        setattr(&instance, "x", Value::Int(2)).unwrap();
        assert!(matches!(getattr(&instance, "x").unwrap(), Value::Int(2)));
    }

    #[test]
    fn missing_attribute_is_an_error() {
        let err = getattr(&Value::Int(3), "foo").unwrap_err();
        assert_eq!(err.exc_type, ExcType::AttributeError);
    }
}
