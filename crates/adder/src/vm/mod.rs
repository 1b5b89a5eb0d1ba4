//! The stack virtual machine.
//!
//! Executes code objects in the reference dialect: a frame stack, per-frame
//! value and block stacks, and a fetch/decode/dispatch loop. Runtime errors
//! become Python-level exceptions driven through the block-unwinding
//! protocol; errors in the machinery itself surface as fatal
//! [`VmError::Fatal`] values.

pub mod binary;
pub mod exc;
pub mod frame;

mod attr;
mod class;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use thiserror::Error;

use crate::bytecode::code::CodeObject;
use crate::bytecode::op::{Cmp, Op};
use crate::builtins;
use crate::io::{PrintWriter, StdPrint};
use crate::value::{
    ClassObject, Dict, DictKey, FunctionObject, InstanceObject, IterObject, ModuleObject,
    Namespace, UnwindReason, Value,
};
use self::exc::{ExcType, SimpleException};
use self::frame::{Block, BlockKind, Frame};

/// A raised exception as a (class, value, traceback) triple.
#[derive(Debug, Clone)]
pub struct ExcRecord {
    pub class: Value,
    pub value: Value,
    pub traceback: Value,
}

impl fmt::Display for ExcRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match &self.class {
            Value::Class(class) => class.name.to_string(),
            other => other.type_name(),
        };
        let message = self.value.py_str();
        if message.is_empty() {
            write!(f, "{name}")
        } else {
            write!(f, "{name}: {message}")
        }
    }
}

/// Errors escaping the VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// A Python-level exception that propagated past the outermost frame.
    #[error("{0}")]
    Raised(ExcRecord),
    /// A broken VM invariant: unknown opcode, stack underflow, frames left
    /// over. Not recoverable by user code.
    #[error("VirtualMachine error: {0}")]
    Fatal(String),
}

/// Why the dispatch loop is unwinding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Why {
    Return,
    Exception,
    Reraise,
    Break,
    Continue,
}

/// The virtual machine: a frame stack plus the interpreter-wide slots.
pub struct VirtualMachine {
    frames: Vec<Frame>,
    return_value: Value,
    /// The currently handled exception: what a bare `raise` re-raises and
    /// what handler exit restores.
    last_exception: Option<ExcRecord>,
    /// The currently propagating exception, set while `why` is unwinding.
    pending_exception: Option<ExcRecord>,
    builtins_ns: Rc<RefCell<Namespace>>,
    base_exception: Rc<ClassObject>,
    /// Host-registered modules consulted by `IMPORT_NAME`.
    modules: AHashMap<String, Value>,
    output: Box<dyn PrintWriter>,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::with_output(Box::new(StdPrint))
    }

    #[must_use]
    pub fn with_output(output: Box<dyn PrintWriter>) -> Self {
        let (builtins_ns, base_exception) = builtins::install();
        VirtualMachine {
            frames: Vec::new(),
            return_value: Value::None,
            last_exception: None,
            pending_exception: None,
            builtins_ns,
            base_exception,
            modules: AHashMap::new(),
            output,
        }
    }

    /// Registers a module for `import` to find.
    pub fn register_module(&mut self, name: &str, namespace: Namespace) {
        let module = Value::Module(Rc::new(ModuleObject {
            name: Rc::from(name),
            namespace: RefCell::new(namespace),
        }));
        self.modules.insert(name.to_owned(), module);
    }

    /// The currently handled exception, if any. `None` outside handlers.
    #[must_use]
    pub fn last_exception(&self) -> Option<&ExcRecord> {
        self.last_exception.as_ref()
    }

    pub(crate) fn base_exception(&self) -> &Rc<ClassObject> {
        &self.base_exception
    }

    pub(crate) fn write_output(&mut self, line: &str) {
        self.output.write_line(line);
    }

    /// Executes a module body and returns its namespace.
    pub fn run_module(
        &mut self,
        code: &Rc<CodeObject>,
        module_name: &str,
    ) -> Result<Rc<RefCell<Namespace>>, VmError> {
        let mut globals = Namespace::default();
        globals.insert("__name__".to_owned(), Value::str(module_name));
        globals.insert("__doc__".to_owned(), Value::None);
        let globals = Rc::new(RefCell::new(globals));
        self.run_code(code, Rc::clone(&globals), Rc::clone(&globals))?;
        Ok(globals)
    }

    /// Runs a code object to completion in the given namespaces.
    pub fn run_code(
        &mut self,
        code: &Rc<CodeObject>,
        globals: Rc<RefCell<Namespace>>,
        locals: Rc<RefCell<Namespace>>,
    ) -> Result<Value, VmError> {
        let frame = Frame::new(Rc::clone(code), globals, locals, &[]);
        let (value, frame) = self.run_frame_inner(frame)?;
        if !self.frames.is_empty() {
            return Err(VmError::Fatal(format!(
                "{} frame(s) left over",
                self.frames.len()
            )));
        }
        if !frame.stack.is_empty() {
            return Err(VmError::Fatal(format!(
                "data left on stack: {} value(s)",
                frame.stack.len()
            )));
        }
        Ok(value)
    }

    /// Runs one frame until it returns or an exception escapes it.
    pub(crate) fn run_frame(&mut self, frame: Frame) -> Result<Value, VmError> {
        self.run_frame_inner(frame).map(|(value, _)| value)
    }

    fn run_frame_inner(&mut self, frame: Frame) -> Result<(Value, Frame), VmError> {
        self.frames.push(frame);
        let reason = loop {
            let (op, arg, offset) = match self.fetch() {
                Ok(fetched) => fetched,
                Err(err) => {
                    self.frames.pop();
                    return Err(err);
                }
            };
            tracing::trace!(
                target: "adder::vm",
                depth = self.frames.len(),
                offset,
                op = %op,
                arg,
                stack = self.frame().stack.len(),
                "dispatch"
            );

            let mut why = match self.dispatch(op, arg) {
                Ok(why) => why,
                Err(VmError::Raised(exc)) => {
                    self.pending_exception = Some(exc);
                    Some(Why::Exception)
                }
                Err(fatal) => {
                    self.frames.pop();
                    return Err(fatal);
                }
            };
            if why == Some(Why::Reraise) {
                why = Some(Why::Exception);
            }
            while let Some(reason) = why {
                if self.frame().block_stack.is_empty() {
                    break;
                }
                why = match self.manage_block_stack(reason) {
                    Ok(why) => why,
                    Err(fatal) => {
                        self.frames.pop();
                        return Err(fatal);
                    }
                };
            }
            if let Some(reason) = why {
                break reason;
            }
        };

        let frame = self.frames.pop().expect("frame stack underflow");
        match reason {
            Why::Return => Ok((
                std::mem::replace(&mut self.return_value, Value::None),
                frame,
            )),
            Why::Exception => {
                let exc = self.pending_exception.take().ok_or_else(|| {
                    VmError::Fatal("exception unwind without an exception".to_owned())
                })?;
                Err(VmError::Raised(exc))
            }
            other => Err(VmError::Fatal(format!(
                "{other:?} unwound past the outermost block"
            ))),
        }
    }

    // --- fetch/decode ---

    fn fetch(&mut self) -> Result<(Op, u16, usize), VmError> {
        let frame = self.frame_mut();
        let offset = frame.lasti;
        let byte = *frame
            .code
            .code
            .get(offset)
            .ok_or_else(|| VmError::Fatal("instruction pointer past end of code".to_owned()))?;
        frame.lasti += 1;
        let op = Op::try_from(byte).map_err(|_| {
            VmError::Fatal(format!("unknown opcode {byte:#04x} at offset {offset}"))
        })?;
        let arg = if op.has_arg() {
            let bytes = frame
                .code
                .code
                .get(frame.lasti..frame.lasti + 2)
                .ok_or_else(|| VmError::Fatal(format!("truncated argument at offset {offset}")))?;
            frame.lasti += 2;
            u16::from_le_bytes([bytes[0], bytes[1]])
        } else {
            0
        };
        Ok((op, arg, offset))
    }

    // --- stack and frame helpers ---

    fn frame(&self) -> &Frame {
        self.frames.last().expect("no active frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("no active frame")
    }

    fn push(&mut self, value: Value) {
        self.frame_mut().stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.frame_mut()
            .stack
            .pop()
            .ok_or_else(|| VmError::Fatal("pop from empty value stack".to_owned()))
    }

    /// Pops `n` values, returned deepest-first.
    fn popn(&mut self, n: usize) -> Result<Vec<Value>, VmError> {
        let stack = &mut self.frame_mut().stack;
        if stack.len() < n {
            return Err(VmError::Fatal("value stack underflow".to_owned()));
        }
        let split = stack.len() - n;
        Ok(stack.split_off(split))
    }

    fn top(&self) -> Result<&Value, VmError> {
        self.frame()
            .stack
            .last()
            .ok_or_else(|| VmError::Fatal("peek at empty value stack".to_owned()))
    }

    fn jump(&mut self, target: usize) {
        self.frame_mut().lasti = target;
    }

    /// Materializes a [`SimpleException`] into a raised exception instance.
    pub(crate) fn raise(&self, exc: SimpleException) -> VmError {
        let class = self.exc_class(exc.exc_type);
        let args = if exc.message.is_empty() {
            Vec::new()
        } else {
            vec![Value::str(exc.message)]
        };
        let mut attrs = Namespace::default();
        attrs.insert("args".to_owned(), Value::Tuple(Rc::new(args)));
        let value = Value::Instance(Rc::new(InstanceObject {
            class: Rc::clone(&class),
            attrs: RefCell::new(attrs),
        }));
        VmError::Raised(ExcRecord {
            class: Value::Class(class),
            value,
            traceback: Value::None,
        })
    }

    fn exc_class(&self, exc_type: ExcType) -> Rc<ClassObject> {
        match self.builtins_ns.borrow().get(&exc_type.to_string()) {
            Some(Value::Class(class)) => Rc::clone(class),
            _ => unreachable!("builtin exception classes are always installed"),
        }
    }

    // --- decode helpers ---

    fn name_arg(&self, arg: u16) -> Result<String, VmError> {
        self.frame()
            .code
            .names
            .get(usize::from(arg))
            .cloned()
            .ok_or_else(|| VmError::Fatal(format!("name operand {arg} out of range")))
    }

    fn varname_arg(&self, arg: u16) -> Result<String, VmError> {
        self.frame()
            .code
            .varnames
            .get(usize::from(arg))
            .cloned()
            .ok_or_else(|| VmError::Fatal(format!("varname operand {arg} out of range")))
    }

    fn deref_arg(&self, arg: u16) -> Result<String, VmError> {
        self.frame()
            .code
            .deref_name(usize::from(arg))
            .map(str::to_owned)
            .ok_or_else(|| VmError::Fatal(format!("deref operand {arg} out of range")))
    }

    fn const_arg(&self, arg: u16) -> Result<Value, VmError> {
        self.frame()
            .code
            .consts
            .get(usize::from(arg))
            .map(Value::from_const)
            .ok_or_else(|| VmError::Fatal(format!("constant operand {arg} out of range")))
    }

    // --- dispatch ---

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, op: Op, arg: u16) -> Result<Option<Why>, VmError> {
        match op {
            Op::Nop => {}
            Op::PopTop => {
                self.pop()?;
            }
            Op::RotTwo => {
                let pair = self.popn(2)?;
                let [a, b]: [Value; 2] = pair.try_into().expect("popn(2)");
                self.push(b);
                self.push(a);
            }
            Op::RotThree => {
                let triple = self.popn(3)?;
                let [a, b, c]: [Value; 3] = triple.try_into().expect("popn(3)");
                self.push(c);
                self.push(a);
                self.push(b);
            }
            Op::DupTop => {
                let top = self.top()?.clone();
                self.push(top);
            }

            Op::UnaryPositive | Op::UnaryNegative | Op::UnaryNot | Op::UnaryInvert => {
                let operand = self.pop()?;
                let result = binary::unary_op(op, operand).map_err(|exc| self.raise(exc))?;
                self.push(result);
            }

            Op::BinaryAdd
            | Op::BinarySubtract
            | Op::BinaryMultiply
            | Op::BinaryTrueDivide
            | Op::BinaryFloorDivide
            | Op::BinaryModulo
            | Op::BinaryPower
            | Op::BinaryLshift
            | Op::BinaryRshift
            | Op::BinaryAnd
            | Op::BinaryOr
            | Op::BinaryXor => {
                let pair = self.popn(2)?;
                let [left, right]: [Value; 2] = pair.try_into().expect("popn(2)");
                let result = binary::binary_op(op, left, right).map_err(|exc| self.raise(exc))?;
                self.push(result);
            }

            Op::BinarySubscr => {
                let pair = self.popn(2)?;
                let [object, index]: [Value; 2] = pair.try_into().expect("popn(2)");
                let result = self.subscript_load(&object, &index)?;
                self.push(result);
            }
            Op::StoreSubscr => {
                let triple = self.popn(3)?;
                let [value, object, index]: [Value; 3] = triple.try_into().expect("popn(3)");
                self.subscript_store(&object, &index, value)?;
            }

            Op::CompareOp => {
                let cmp = Cmp::try_from(arg as u8)
                    .map_err(|_| VmError::Fatal(format!("bad COMPARE_OP operand {arg}")))?;
                let pair = self.popn(2)?;
                let [left, right]: [Value; 2] = pair.try_into().expect("popn(2)");
                let result = binary::compare(cmp, left, right, &self.base_exception)
                    .map_err(|exc| self.raise(exc))?;
                self.push(result);
            }

            Op::LoadConst => {
                let value = self.const_arg(arg)?;
                self.push(value);
            }

            Op::StoreName => {
                let name = self.name_arg(arg)?;
                let value = self.pop()?;
                self.frame().locals.borrow_mut().insert(name, value);
            }
            Op::LoadName => {
                let name = self.name_arg(arg)?;
                let value = self.lookup_name(&name)?;
                self.push(value);
            }
            Op::StoreGlobal => {
                let name = self.name_arg(arg)?;
                let value = self.pop()?;
                self.frame().globals.borrow_mut().insert(name, value);
            }
            Op::LoadGlobal => {
                let name = self.name_arg(arg)?;
                let value = self
                    .frame()
                    .globals
                    .borrow()
                    .get(&name)
                    .cloned()
                    .or_else(|| self.builtins_ns.borrow().get(&name).cloned())
                    .ok_or_else(|| {
                        self.raise(SimpleException::new(
                            ExcType::NameError,
                            format!("name '{name}' is not defined"),
                        ))
                    })?;
                self.push(value);
            }
            Op::LoadFast => {
                let name = self.varname_arg(arg)?;
                let value = self.frame().locals.borrow().get(&name).cloned();
                let value = value.ok_or_else(|| {
                    self.raise(SimpleException::new(
                        ExcType::UnboundLocalError,
                        format!("local variable '{name}' referenced before assignment"),
                    ))
                })?;
                self.push(value);
            }
            Op::StoreFast => {
                let name = self.varname_arg(arg)?;
                let value = self.pop()?;
                self.frame().locals.borrow_mut().insert(name, value);
            }
            Op::LoadDeref => {
                let name = self.deref_arg(arg)?;
                let cell = self.frame().cells.get(&name).cloned().ok_or_else(|| {
                    VmError::Fatal(format!("no cell for deref variable '{name}'"))
                })?;
                let value = cell.borrow().clone();
                self.push(value);
            }
            Op::StoreDeref => {
                let name = self.deref_arg(arg)?;
                let value = self.pop()?;
                let cell = self.frame().cells.get(&name).cloned().ok_or_else(|| {
                    VmError::Fatal(format!("no cell for deref variable '{name}'"))
                })?;
                *cell.borrow_mut() = value;
            }
            Op::LoadClosure => {
                let name = self.deref_arg(arg)?;
                let cell = self.frame().cells.get(&name).cloned().ok_or_else(|| {
                    VmError::Fatal(format!("no cell for closure variable '{name}'"))
                })?;
                self.push(Value::Cell(cell));
            }

            Op::LoadAttr => {
                let name = self.name_arg(arg)?;
                let object = self.pop()?;
                let value = attr::getattr(&object, &name).map_err(|exc| self.raise(exc))?;
                self.push(value);
            }
            Op::StoreAttr => {
                let name = self.name_arg(arg)?;
                let pair = self.popn(2)?;
                let [value, object]: [Value; 2] = pair.try_into().expect("popn(2)");
                attr::setattr(&object, &name, value).map_err(|exc| self.raise(exc))?;
            }

            Op::BuildTuple => {
                let items = self.popn(usize::from(arg))?;
                self.push(Value::Tuple(Rc::new(items)));
            }
            Op::BuildList => {
                let items = self.popn(usize::from(arg))?;
                self.push(Value::List(Rc::new(RefCell::new(items))));
            }
            Op::BuildMap => {
                self.push(Value::Dict(Rc::new(RefCell::new(Dict::default()))));
            }
            Op::StoreMap => {
                let triple = self.popn(3)?;
                let [map, value, key]: [Value; 3] = triple.try_into().expect("popn(3)");
                let Value::Dict(entries) = &map else {
                    return Err(VmError::Fatal("STORE_MAP on a non-dict".to_owned()));
                };
                let key = DictKey::from_value(&key).ok_or_else(|| {
                    self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("unhashable type: '{}'", key.type_name()),
                    ))
                })?;
                entries.borrow_mut().insert(key, value);
                self.push(map);
            }

            Op::UnpackSequence => {
                let sequence = self.pop()?;
                let items: Vec<Value> = match &sequence {
                    Value::Tuple(items) => items.as_ref().clone(),
                    Value::List(items) => items.borrow().clone(),
                    other => {
                        return Err(self.raise(SimpleException::new(
                            ExcType::TypeError,
                            format!("cannot unpack non-sequence {}", other.type_name()),
                        )))
                    }
                };
                let expected = usize::from(arg);
                if items.len() != expected {
                    let detail = if items.len() < expected {
                        format!(
                            "not enough values to unpack (expected {expected}, got {})",
                            items.len()
                        )
                    } else {
                        format!("too many values to unpack (expected {expected})")
                    };
                    return Err(self.raise(SimpleException::new(ExcType::ValueError, detail)));
                }
                for item in items.into_iter().rev() {
                    self.push(item);
                }
            }

            Op::GetIter => {
                let iterable = self.pop()?;
                let iter = self.make_iter(iterable)?;
                self.push(iter);
            }
            Op::ForIter => {
                let target = self.frame().lasti + usize::from(arg);
                let advanced = match self.top()? {
                    Value::Iter(iter) => iter.borrow_mut().advance(),
                    other => {
                        return Err(VmError::Fatal(format!(
                            "FOR_ITER on '{}'",
                            other.type_name()
                        )))
                    }
                };
                match advanced {
                    Some(value) => self.push(value),
                    None => {
                        self.pop()?;
                        self.jump(target);
                    }
                }
            }

            Op::JumpForward => {
                let target = self.frame().lasti + usize::from(arg);
                self.jump(target);
            }
            Op::JumpAbsolute => self.jump(usize::from(arg)),
            Op::PopJumpIfFalse => {
                let value = self.pop()?;
                if !value.is_truthy() {
                    self.jump(usize::from(arg));
                }
            }
            Op::PopJumpIfTrue => {
                let value = self.pop()?;
                if value.is_truthy() {
                    self.jump(usize::from(arg));
                }
            }
            Op::JumpIfFalseOrPop => {
                if self.top()?.is_truthy() {
                    self.pop()?;
                } else {
                    self.jump(usize::from(arg));
                }
            }
            Op::JumpIfTrueOrPop => {
                if self.top()?.is_truthy() {
                    self.jump(usize::from(arg));
                } else {
                    self.pop()?;
                }
            }

            Op::SetupLoop => {
                let handler = self.frame().lasti + usize::from(arg);
                self.push_block(BlockKind::Loop, Some(handler));
            }
            Op::SetupExcept => {
                let handler = self.frame().lasti + usize::from(arg);
                self.push_block(BlockKind::SetupExcept, Some(handler));
            }
            Op::SetupFinally => {
                let handler = self.frame().lasti + usize::from(arg);
                self.push_block(BlockKind::Finally, Some(handler));
            }
            Op::PopBlock => {
                self.frame_mut()
                    .block_stack
                    .pop()
                    .ok_or_else(|| VmError::Fatal("POP_BLOCK on empty block stack".to_owned()))?;
            }
            Op::PopExcept => {
                let block = self
                    .frame_mut()
                    .block_stack
                    .pop()
                    .ok_or_else(|| VmError::Fatal("POP_EXCEPT on empty block stack".to_owned()))?;
                if block.kind != BlockKind::ExceptHandler {
                    return Err(VmError::Fatal(
                        "popped block is not an exception handler".to_owned(),
                    ));
                }
                self.unwind_block(&block)?;
            }
            Op::EndFinally => return self.end_finally(),

            Op::BreakLoop => return Ok(Some(Why::Break)),
            Op::ContinueLoop => {
                self.return_value = Value::Int(i64::from(arg));
                return Ok(Some(Why::Continue));
            }
            Op::ReturnValue => {
                self.return_value = self.pop()?;
                return Ok(Some(Why::Return));
            }

            Op::RaiseVarargs => {
                let (exc, cause) = match arg {
                    0 => (None, None),
                    1 => (Some(self.pop()?), None),
                    2 => {
                        let cause = self.pop()?;
                        (Some(self.pop()?), Some(cause))
                    }
                    _ => {
                        return Err(VmError::Fatal(format!(
                            "bad RAISE_VARARGS operand {arg}"
                        )))
                    }
                };
                return self.do_raise(exc, cause);
            }

            Op::ImportName => {
                let name = self.name_arg(arg)?;
                self.popn(2)?; // level and fromlist drive the host importer
                let module = self.modules.get(&name).cloned().ok_or_else(|| {
                    self.raise(SimpleException::new(
                        ExcType::ImportError,
                        format!("no module named '{name}'"),
                    ))
                })?;
                self.push(module);
            }
            Op::ImportFrom => {
                let name = self.name_arg(arg)?;
                let module = self.top()?.clone();
                let value = attr::getattr(&module, &name).map_err(|_| {
                    let from = match &module {
                        Value::Module(module) => module.name.to_string(),
                        other => other.type_name(),
                    };
                    self.raise(SimpleException::new(
                        ExcType::ImportError,
                        format!("cannot import name '{name}' from '{from}'"),
                    ))
                })?;
                self.push(value);
            }

            Op::LoadBuildClass => self.push(Value::BuildClass),

            Op::MakeFunction | Op::MakeClosure => {
                let name = match self.pop()? {
                    Value::Str(name) => name,
                    other => {
                        return Err(VmError::Fatal(format!(
                            "function name is '{}', not a string",
                            other.type_name()
                        )))
                    }
                };
                let (closure, code) = if op == Op::MakeClosure {
                    let pair = self.popn(2)?;
                    let [closure, code]: [Value; 2] = pair.try_into().expect("popn(2)");
                    (Some(closure), code)
                } else {
                    (None, self.pop()?)
                };
                let Value::Code(code) = code else {
                    return Err(VmError::Fatal("MAKE_FUNCTION without a code object".to_owned()));
                };
                let defaults = self.popn(usize::from(arg))?;
                let closure = match closure {
                    None => Vec::new(),
                    Some(Value::Tuple(cells)) => {
                        let mut refs = Vec::with_capacity(cells.len());
                        for cell in cells.iter() {
                            match cell {
                                Value::Cell(cell) => refs.push(Rc::clone(cell)),
                                other => {
                                    return Err(VmError::Fatal(format!(
                                        "closure item is '{}', not a cell",
                                        other.type_name()
                                    )))
                                }
                            }
                        }
                        refs
                    }
                    Some(other) => {
                        return Err(VmError::Fatal(format!(
                            "closure is '{}', not a tuple",
                            other.type_name()
                        )))
                    }
                };
                let globals = Rc::clone(&self.frame().globals);
                self.push(Value::Function(Rc::new(FunctionObject {
                    name,
                    code,
                    globals,
                    defaults,
                    closure,
                })));
            }

            Op::CallFunction => return self.call_function(arg, Vec::new(), Vec::new()),
            Op::CallFunctionVar => {
                let star = self.pop()?;
                let extra = self.iterable_to_vec(&star)?;
                return self.call_function(arg, extra, Vec::new());
            }
            Op::CallFunctionKw => {
                let kwargs = self.pop()?;
                let extra = self.dict_to_kwargs(&kwargs)?;
                return self.call_function(arg, Vec::new(), extra);
            }
            Op::CallFunctionVarKw => {
                let pair = self.popn(2)?;
                let [star, kwargs]: [Value; 2] = pair.try_into().expect("popn(2)");
                let extra = self.iterable_to_vec(&star)?;
                let extra_kw = self.dict_to_kwargs(&kwargs)?;
                return self.call_function(arg, extra, extra_kw);
            }
        }
        Ok(None)
    }

    // --- name lookup ---

    fn lookup_name(&self, name: &str) -> Result<Value, VmError> {
        let frame = self.frame();
        if let Some(value) = frame.locals.borrow().get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = frame.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.builtins_ns.borrow().get(name) {
            return Ok(value.clone());
        }
        Err(self.raise(SimpleException::new(
            ExcType::NameError,
            format!("name '{name}' is not defined"),
        )))
    }

    // --- subscripts ---

    fn subscript_load(&self, object: &Value, index: &Value) -> Result<Value, VmError> {
        match object {
            Value::List(items) => {
                let items = items.borrow();
                let position = self.sequence_index(index, items.len(), "list")?;
                Ok(items[position].clone())
            }
            Value::Tuple(items) => {
                let position = self.sequence_index(index, items.len(), "tuple")?;
                Ok(items[position].clone())
            }
            Value::Str(text) => {
                let chars: Vec<char> = text.chars().collect();
                let position = self.sequence_index(index, chars.len(), "string")?;
                Ok(Value::str(chars[position].to_string()))
            }
            Value::Dict(entries) => {
                let key = DictKey::from_value(index).ok_or_else(|| {
                    self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("unhashable type: '{}'", index.type_name()),
                    ))
                })?;
                entries.borrow().get(&key).cloned().ok_or_else(|| {
                    self.raise(SimpleException::new(ExcType::KeyError, index.repr()))
                })
            }
            other => Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!("'{}' object is not subscriptable", other.type_name()),
            ))),
        }
    }

    fn subscript_store(
        &self,
        object: &Value,
        index: &Value,
        value: Value,
    ) -> Result<(), VmError> {
        match object {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let position = self.sequence_index(index, items.len(), "list")?;
                items[position] = value;
                Ok(())
            }
            Value::Dict(entries) => {
                let key = DictKey::from_value(index).ok_or_else(|| {
                    self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("unhashable type: '{}'", index.type_name()),
                    ))
                })?;
                entries.borrow_mut().insert(key, value);
                Ok(())
            }
            other => Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!(
                    "'{}' object does not support item assignment",
                    other.type_name()
                ),
            ))),
        }
    }

    /// Normalizes a (possibly negative) integer index into a sequence.
    fn sequence_index(
        &self,
        index: &Value,
        length: usize,
        kind: &str,
    ) -> Result<usize, VmError> {
        let raw = match index {
            Value::Int(number) => *number,
            Value::Bool(flag) => i64::from(*flag),
            other => {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!(
                        "{kind} indices must be integers, not '{}'",
                        other.type_name()
                    ),
                )))
            }
        };
        let adjusted = if raw < 0 { raw + length as i64 } else { raw };
        if adjusted < 0 || adjusted >= length as i64 {
            return Err(self.raise(SimpleException::new(
                ExcType::IndexError,
                format!("{kind} index out of range"),
            )));
        }
        Ok(adjusted as usize)
    }

    // --- iteration ---

    fn make_iter(&self, iterable: Value) -> Result<Value, VmError> {
        let items = match &iterable {
            Value::Iter(_) => return Ok(iterable),
            Value::List(items) => items.borrow().clone(),
            Value::Tuple(items) => items.as_ref().clone(),
            Value::Str(text) => text
                .chars()
                .map(|character| Value::str(character.to_string()))
                .collect(),
            Value::Bytes(bytes) => bytes.iter().map(|byte| Value::Int(i64::from(*byte))).collect(),
            Value::Dict(entries) => entries.borrow().keys().map(DictKey::to_value).collect(),
            other => {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("'{}' object is not iterable", other.type_name()),
                )))
            }
        };
        Ok(Value::Iter(Rc::new(RefCell::new(IterObject::Seq {
            items,
            position: 0,
        }))))
    }

    fn iterable_to_vec(&self, value: &Value) -> Result<Vec<Value>, VmError> {
        match value {
            Value::Tuple(items) => Ok(items.as_ref().clone()),
            Value::List(items) => Ok(items.borrow().clone()),
            other => Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!(
                    "argument after * must be an iterable, not {}",
                    other.type_name()
                ),
            ))),
        }
    }

    fn dict_to_kwargs(&self, value: &Value) -> Result<Vec<(String, Value)>, VmError> {
        let Value::Dict(entries) = value else {
            return Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!(
                    "argument after ** must be a mapping, not {}",
                    value.type_name()
                ),
            )));
        };
        let mut kwargs = Vec::with_capacity(entries.borrow().len());
        for (key, value) in entries.borrow().iter() {
            match key {
                DictKey::Str(key) => kwargs.push((key.to_string(), value.clone())),
                _ => {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        "keywords must be strings".to_owned(),
                    )))
                }
            }
        }
        Ok(kwargs)
    }

    // --- blocks and unwinding ---

    fn push_block(&mut self, kind: BlockKind, handler: Option<usize>) {
        let level = self.frame().stack.len();
        self.frame_mut().block_stack.push(Block {
            kind,
            handler,
            level,
        });
    }

    /// One step of the unwind protocol against the innermost block.
    fn manage_block_stack(&mut self, reason: Why) -> Result<Option<Why>, VmError> {
        let block = *self
            .frame()
            .block_stack
            .last()
            .expect("caller checked the block stack");

        if block.kind == BlockKind::Loop && reason == Why::Continue {
            let target = match &self.return_value {
                Value::Int(target) if *target >= 0 => *target as usize,
                other => {
                    return Err(VmError::Fatal(format!(
                        "continue target is '{}', not an offset",
                        other.type_name()
                    )))
                }
            };
            self.jump(target);
            return Ok(None);
        }

        self.frame_mut().block_stack.pop();
        self.unwind_block(&block)?;

        if block.kind == BlockKind::Loop && reason == Why::Break {
            let handler = block
                .handler
                .ok_or_else(|| VmError::Fatal("loop block without a break target".to_owned()))?;
            self.jump(handler);
            return Ok(None);
        }

        if reason == Why::Exception
            && matches!(block.kind, BlockKind::SetupExcept | BlockKind::Finally)
        {
            let handler = block
                .handler
                .ok_or_else(|| VmError::Fatal("handler block without a target".to_owned()))?;
            self.push_block(BlockKind::ExceptHandler, None);
            // Two triples: the previous exception state below (restored when
            // the handler exits), the new exception above (consumed by the
            // handler-dispatch bytecode).
            match self.last_exception.clone() {
                Some(previous) => {
                    self.push(previous.traceback);
                    self.push(previous.value);
                    self.push(previous.class);
                }
                None => {
                    self.push(Value::None);
                    self.push(Value::None);
                    self.push(Value::None);
                }
            }
            let current = self.pending_exception.take().ok_or_else(|| {
                VmError::Fatal("exception unwind without an exception".to_owned())
            })?;
            self.push(current.traceback.clone());
            self.push(current.value.clone());
            self.push(current.class.clone());
            // Inside the handler, this exception is the handled one.
            self.last_exception = Some(current);
            self.jump(handler);
            return Ok(None);
        }

        if block.kind == BlockKind::Finally {
            let handler = block
                .handler
                .ok_or_else(|| VmError::Fatal("finally block without a target".to_owned()))?;
            let token = match reason {
                Why::Return => {
                    let value = std::mem::replace(&mut self.return_value, Value::None);
                    self.push(value);
                    UnwindReason::Return
                }
                Why::Continue => {
                    let value = std::mem::replace(&mut self.return_value, Value::None);
                    self.push(value);
                    UnwindReason::Continue
                }
                Why::Break => UnwindReason::Break,
                Why::Exception | Why::Reraise => {
                    unreachable!("exception unwind handled above")
                }
            };
            self.push(Value::UnwindToken(token));
            self.jump(handler);
            return Ok(None);
        }

        Ok(Some(reason))
    }

    /// Pops the value stack back to a block's entry level. Except-handler
    /// blocks keep three extra slots: the saved exception state, restored
    /// into `last_exception` here.
    fn unwind_block(&mut self, block: &Block) -> Result<(), VmError> {
        let keep = if block.kind == BlockKind::ExceptHandler {
            3
        } else {
            0
        };
        while self.frame().stack.len() > block.level + keep {
            self.pop()?;
        }
        if block.kind == BlockKind::ExceptHandler {
            let triple = self.popn(3)?;
            let [traceback, value, class]: [Value; 3] = triple.try_into().expect("popn(3)");
            self.last_exception = match class {
                Value::None => None,
                class => Some(ExcRecord {
                    class,
                    value,
                    traceback,
                }),
            };
        }
        Ok(())
    }

    /// `END_FINALLY`: dispatch on the token left by the unwind protocol.
    fn end_finally(&mut self) -> Result<Option<Why>, VmError> {
        match self.pop()? {
            Value::UnwindToken(UnwindReason::Return) => {
                self.return_value = self.pop()?;
                Ok(Some(Why::Return))
            }
            Value::UnwindToken(UnwindReason::Continue) => {
                self.return_value = self.pop()?;
                Ok(Some(Why::Continue))
            }
            Value::UnwindToken(UnwindReason::Break) => Ok(Some(Why::Break)),
            Value::None => Ok(None),
            class @ Value::Class(_) => {
                let value = self.pop()?;
                let traceback = self.pop()?;
                self.pending_exception = Some(ExcRecord {
                    class,
                    value,
                    traceback,
                });
                Ok(Some(Why::Reraise))
            }
            other => Err(VmError::Fatal(format!(
                "confused END_FINALLY: popped '{}'",
                other.type_name()
            ))),
        }
    }

    // --- raising ---

    fn do_raise(
        &mut self,
        exc: Option<Value>,
        cause: Option<Value>,
    ) -> Result<Option<Why>, VmError> {
        let record = match exc {
            None => {
                // Bare raise: re-raise the currently handled exception.
                return match &self.last_exception {
                    Some(handled) => {
                        self.pending_exception = Some(handled.clone());
                        Ok(Some(Why::Reraise))
                    }
                    None => Err(self.raise(SimpleException::new(
                        ExcType::RuntimeError,
                        "No active exception to re-raise".to_owned(),
                    ))),
                };
            }
            Some(Value::Class(class)) => {
                if !class.is_subclass_of(&self.base_exception) {
                    return Err(self.exceptions_must_derive());
                }
                let value = self.instantiate(Rc::clone(&class), Vec::new(), Vec::new())?;
                ExcRecord {
                    class: Value::Class(class),
                    value,
                    traceback: Value::None,
                }
            }
            Some(value @ Value::Instance(_)) => {
                let Value::Instance(instance) = &value else {
                    unreachable!()
                };
                if !instance.class.is_subclass_of(&self.base_exception) {
                    return Err(self.exceptions_must_derive());
                }
                ExcRecord {
                    class: Value::Class(Rc::clone(&instance.class)),
                    value,
                    traceback: Value::None,
                }
            }
            Some(_) => return Err(self.exceptions_must_derive()),
        };

        if let Some(cause) = cause {
            let cause_value = match cause {
                Value::Class(class) if class.is_subclass_of(&self.base_exception) => {
                    self.instantiate(class, Vec::new(), Vec::new())?
                }
                value @ Value::Instance(_) => value,
                Value::None => Value::None,
                _ => {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        "exception causes must derive from BaseException".to_owned(),
                    )))
                }
            };
            if let Value::Instance(instance) = &record.value {
                instance
                    .attrs
                    .borrow_mut()
                    .insert("__cause__".to_owned(), cause_value);
            }
        }

        self.pending_exception = Some(record);
        Ok(Some(Why::Exception))
    }

    fn exceptions_must_derive(&self) -> VmError {
        self.raise(SimpleException::new(
            ExcType::TypeError,
            "exceptions must derive from BaseException".to_owned(),
        ))
    }

    // --- call protocol ---

    /// `CALL_FUNCTION*`: collect keyword pairs and positionals from the
    /// stack, merge in unpacked extras, pop the callable, and push the
    /// result.
    fn call_function(
        &mut self,
        arg: u16,
        extra_args: Vec<Value>,
        extra_kwargs: Vec<(String, Value)>,
    ) -> Result<Option<Why>, VmError> {
        let n_kw = usize::from(arg >> 8);
        let n_pos = usize::from(arg & 0xff);

        let mut kwargs = Vec::with_capacity(n_kw + extra_kwargs.len());
        for _ in 0..n_kw {
            let pair = self.popn(2)?;
            let [key, value]: [Value; 2] = pair.try_into().expect("popn(2)");
            let Value::Str(key) = key else {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    "keywords must be strings".to_owned(),
                )));
            };
            kwargs.push((key.to_string(), value));
        }
        kwargs.reverse();
        kwargs.extend(extra_kwargs);

        let mut args = self.popn(n_pos)?;
        args.extend(extra_args);

        let callable = self.pop()?;
        let result = self.call_value(callable, args, kwargs)?;
        self.push(result);
        Ok(None)
    }

    /// Invokes any callable value with already-collected arguments.
    pub(crate) fn call_value(
        &mut self,
        callable: Value,
        mut args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, VmError> {
        match callable {
            Value::Builtin(builtin) => builtins::call_builtin(self, builtin, args, kwargs),
            Value::BuiltinMethod(method) => self.call_builtin_method(&method, args, kwargs),
            Value::Function(function) => self.call_function_object(&function, args, kwargs),
            Value::Method(method) => {
                match &method.self_object {
                    Some(receiver) => args.insert(0, receiver.clone()),
                    None => {
                        // Unbound method: the explicit first argument must be
                        // an instance of the method's class.
                        let valid = matches!(
                            args.first(),
                            Some(Value::Instance(instance))
                                if instance.class.is_subclass_of(&method.class)
                        );
                        if !valid {
                            let got = args
                                .first()
                                .map_or_else(|| "nothing".to_owned(), Value::type_name);
                            return Err(self.raise(SimpleException::new(
                                ExcType::TypeError,
                                format!(
                                    "unbound method {}() must be called with {} instance \
                                     as first argument (got {} instead)",
                                    method.func.name, method.class.name, got
                                ),
                            )));
                        }
                    }
                }
                self.call_function_object(&method.func, args, kwargs)
            }
            Value::Class(class) => self.instantiate(class, args, kwargs),
            Value::BuildClass => self.build_class(args, kwargs),
            other => Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!("'{}' object is not callable", other.type_name()),
            ))),
        }
    }

    fn call_builtin_method(
        &mut self,
        method: &crate::value::BuiltinMethod,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, VmError> {
        use crate::value::BuiltinMethodKind;
        if !kwargs.is_empty() {
            return Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                "this method takes no keyword arguments".to_owned(),
            )));
        }
        match (method.kind, &method.recv) {
            (BuiltinMethodKind::ListAppend, Value::List(items)) => match args.as_slice() {
                [value] => {
                    items.borrow_mut().push(value.clone());
                    Ok(Value::None)
                }
                _ => Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("append() takes exactly one argument ({} given)", args.len()),
                ))),
            },
            (BuiltinMethodKind::ListExtend, Value::List(items)) => match args.as_slice() {
                [value] => {
                    let extra = self.iterable_to_vec(value)?;
                    items.borrow_mut().extend(extra);
                    Ok(Value::None)
                }
                _ => Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("extend() takes exactly one argument ({} given)", args.len()),
                ))),
            },
            (BuiltinMethodKind::DictGet, Value::Dict(entries)) => {
                let (key, default) = match args.as_slice() {
                    [key] => (key, Value::None),
                    [key, default] => (key, default.clone()),
                    _ => {
                        return Err(self.raise(SimpleException::new(
                            ExcType::TypeError,
                            format!("get expected at most 2 arguments, got {}", args.len()),
                        )))
                    }
                };
                let key = DictKey::from_value(key).ok_or_else(|| {
                    self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("unhashable type: '{}'", key.type_name()),
                    ))
                })?;
                Ok(entries.borrow().get(&key).cloned().unwrap_or(default))
            }
            _ => Err(VmError::Fatal(
                "builtin method bound to the wrong receiver".to_owned(),
            )),
        }
    }

    /// Calls a user-defined function by binding arguments into a fresh frame
    /// and running it.
    pub(crate) fn call_function_object(
        &mut self,
        function: &Rc<FunctionObject>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, VmError> {
        let locals = self.bind_args(function, args, kwargs)?;
        let frame = Frame::new(
            Rc::clone(&function.code),
            Rc::clone(&function.globals),
            Rc::new(RefCell::new(locals)),
            &function.closure,
        );
        self.run_frame(frame)
    }

    /// Builds the locals mapping for a call: positionals, then keywords,
    /// then `*args`/`**kwargs` slots, then defaults.
    fn bind_args(
        &self,
        function: &FunctionObject,
        mut args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Namespace, VmError> {
        use crate::bytecode::code::CodeFlags;

        let code = &function.code;
        let name = &function.name;
        let argcount = code.argcount as usize;
        let params = &code.varnames[..argcount.min(code.varnames.len())];
        let has_varargs = code.flags.contains(CodeFlags::VARARGS);
        let has_varkw = code.flags.contains(CodeFlags::VARKEYWORDS);

        let mut locals = Namespace::default();

        let extra = if args.len() > argcount {
            args.split_off(argcount)
        } else {
            Vec::new()
        };
        let given = args.len() + extra.len();
        for (param, value) in params.iter().zip(args) {
            locals.insert(param.clone(), value);
        }
        if has_varargs {
            let vararg_name = code.varnames.get(argcount).ok_or_else(|| {
                VmError::Fatal("var-args flag without a varnames slot".to_owned())
            })?;
            locals.insert(vararg_name.clone(), Value::Tuple(Rc::new(extra)));
        } else if !extra.is_empty() {
            return Err(self.raise(SimpleException::new(
                ExcType::TypeError,
                format!(
                    "{name}() takes {argcount} positional argument(s) but {given} were given"
                ),
            )));
        }

        let mut extra_kw = Vec::new();
        for (key, value) in kwargs {
            if params.contains(&key) {
                if locals.contains_key(&key) {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("{name}() got multiple values for argument '{key}'"),
                    )));
                }
                locals.insert(key, value);
            } else if has_varkw {
                extra_kw.push((key, value));
            } else {
                return Err(self.raise(SimpleException::new(
                    ExcType::TypeError,
                    format!("{name}() got an unexpected keyword argument '{key}'"),
                )));
            }
        }
        if has_varkw {
            let slot = argcount + usize::from(has_varargs);
            let kwarg_name = code.varnames.get(slot).ok_or_else(|| {
                VmError::Fatal("var-kwargs flag without a varnames slot".to_owned())
            })?;
            let mut entries = Dict::default();
            for (key, value) in extra_kw {
                entries.insert(DictKey::Str(Rc::from(key.as_str())), value);
            }
            locals.insert(kwarg_name.clone(), Value::Dict(Rc::new(RefCell::new(entries))));
        }

        let defaults = &function.defaults;
        let required = argcount.saturating_sub(defaults.len());
        for (position, param) in params.iter().enumerate() {
            if !locals.contains_key(param) {
                if position >= required {
                    locals.insert(param.clone(), defaults[position - required].clone());
                } else {
                    return Err(self.raise(SimpleException::new(
                        ExcType::TypeError,
                        format!("{name}() missing required argument: '{param}'"),
                    )));
                }
            }
        }
        Ok(locals)
    }
}
