//! Class construction: `LOAD_BUILD_CLASS` support and instance creation.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::{ClassObject, Dict, DictKey, InstanceObject, Namespace, Value};
use crate::vm::exc::{ExcType, SimpleException};
use crate::vm::frame::Frame;
use crate::vm::{VirtualMachine, VmError};

impl VirtualMachine {
    /// The build-class callable: `__build_class__(func, name, *bases,
    /// [metaclass=...])`.
    ///
    /// Three phases: determine the metaclass and seed the namespace (via its
    /// `__prepare__` when present), execute the class body in a frame whose
    /// locals are that namespace, then produce the class. If the body frame
    /// returned a cell, it is filled with the finished class.
    pub(super) fn build_class(
        &mut self,
        mut args: Vec<Value>,
        mut kwargs: Vec<(String, Value)>,
    ) -> Result<Value, VmError> {
        if args.len() < 2 {
            return Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                "__build_class__: not enough arguments".to_owned(),
            )));
        }
        let func = match args.remove(0) {
            Value::Function(func) => func,
            _ => {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    "__build_class__: func must be a function".to_owned(),
                )))
            }
        };
        let name = match args.remove(0) {
            Value::Str(name) => name,
            _ => {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    "__build_class__: name is not a string".to_owned(),
                )))
            }
        };
        let base_values = args;
        let mut bases = Vec::with_capacity(base_values.len());
        for base in &base_values {
            match base {
                Value::Class(class) => bases.push(Rc::clone(class)),
                other => {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("class base must be a class, not '{}'", other.type_name()),
                    )))
                }
            }
        }

        let metaclass = kwargs
            .iter()
            .position(|(key, _)| key == "metaclass")
            .map(|index| kwargs.remove(index).1);
        if let Some((key, _)) = kwargs.first() {
            return Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!("__build_class__ got an unexpected keyword argument '{key}'"),
            )));
        }

        // Phase 1: the namespace, seeded by the metaclass's __prepare__.
        let namespace = match &metaclass {
            Some(Value::Class(meta)) => match meta.lookup("__prepare__") {
                Some(prepare) => {
                    let prepared = self.call_value(
                        prepare,
                        vec![
                            Value::Str(Rc::clone(&name)),
                            Value::Tuple(Rc::new(base_values.clone())),
                        ],
                        vec![],
                    )?;
                    self.dict_to_namespace(&prepared)?
                }
                None => Namespace::default(),
            },
            _ => Namespace::default(),
        };

        // Phase 2: execute the class body with the namespace as its locals.
        let locals = Rc::new(RefCell::new(namespace));
        let frame = Frame::new(
            Rc::clone(&func.code),
            Rc::clone(&func.globals),
            Rc::clone(&locals),
            &func.closure,
        );
        let body_result = self.run_frame(frame)?;

        // Phase 3: call the metaclass (the default builds a class directly).
        let class_value = match metaclass {
            None => Value::Class(Rc::new(ClassObject {
                name,
                bases,
                namespace: RefCell::new(locals.borrow().clone()),
            })),
            Some(metaclass) => {
                let namespace_dict = namespace_to_dict(&locals.borrow());
                self.call_value(
                    metaclass,
                    vec![
                        Value::Str(name),
                        Value::Tuple(Rc::new(base_values)),
                        namespace_dict,
                    ],
                    vec![],
                )?
            }
        };

        // A class body compiled with a __class__ cell returns it for us to
        // fill in; plain bodies return None.
        if let Value::Cell(cell) = body_result {
            *cell.borrow_mut() = class_value.clone();
        }
        Ok(class_value)
    }

    /// Calls a class: creates an instance, then runs `__init__` when the
    /// class defines one. Exception classes store their arguments instead.
    pub(super) fn instantiate(
        &mut self,
        class: Rc<ClassObject>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, VmError> {
        let instance = Rc::new(InstanceObject {
            class: Rc::clone(&class),
            attrs: RefCell::new(Namespace::default()),
        });
        let value = Value::Instance(Rc::clone(&instance));

        if class.is_subclass_of(self.base_exception()) {
            if !kwargs.is_empty() {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("{}() takes no keyword arguments", class.name),
                )));
            }
            instance
                .attrs
                .borrow_mut()
                .insert("args".to_owned(), Value::Tuple(Rc::new(args)));
            return Ok(value);
        }

        match class.lookup("__init__") {
            Some(Value::Function(init)) => {
                let mut full_args = vec![value.clone()];
                full_args.extend(args);
                let result = self.call_function_object(&init, full_args, kwargs)?;
                if !matches!(result, Value::None) {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!(
                            "__init__() should return None, not '{}'",
                            result.type_name()
                        ),
                    )));
                }
            }
            Some(other) => {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("__init__ must be a function, not '{}'", other.type_name()),
                )))
            }
            None => {
                if !args.is_empty() || !kwargs.is_empty() {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("{}() takes no arguments", class.name),
                    )));
                }
            }
        }
        Ok(value)
    }

    /// Converts a `__prepare__` result into a class-body namespace.
    fn dict_to_namespace(&self, prepared: &Value) -> Result<Namespace, VmError> {
        let Value::Dict(entries) = prepared else {
            return Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!(
                    "__prepare__() must return a mapping, not '{}'",
                    prepared.type_name()
                ),
            )));
        };
        let mut namespace = Namespace::default();
        for (key, value) in entries.borrow().iter() {
            match key {
                DictKey::Str(text) => {
                    namespace.insert(text.to_string(), value.clone());
                }
                _ => {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        "class namespace keys must be strings".to_owned(),
                    )))
                }
            }
        }
        Ok(namespace)
    }
}

/// Snapshot of a class-body namespace as a dict value for metaclass calls.
fn namespace_to_dict(namespace: &Namespace) -> Value {
    let mut entries = Dict::default();
    for (key, value) in namespace {
        entries.insert(DictKey::Str(Rc::from(key.as_str())), value.clone());
    }
    Value::Dict(Rc::new(RefCell::new(entries)))
}
