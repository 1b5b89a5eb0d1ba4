//! Execution frames, blocks, and cells.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::bytecode::code::CodeObject;
use crate::value::{CellRef, Namespace, Value};

/// What a block-stack entry guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// A loop body; handler is the break target.
    Loop,
    /// A try body with handlers; handler is the dispatch offset.
    SetupExcept,
    /// A try body with a finally; handler is the finally offset.
    Finally,
    /// Pushed while an exception handler runs; guards the saved
    /// exception-state triple beneath the handler's working stack.
    ExceptHandler,
}

/// One entry on a frame's block stack.
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub kind: BlockKind,
    /// Bytecode offset to jump to when the block handles an unwind.
    pub handler: Option<usize>,
    /// Value-stack depth at entry; unwinding pops back down to this.
    pub level: usize,
}

/// Execution record for one invocation of a code object.
///
/// Frames never outlive their call; cells are the only state shared with
/// other frames.
#[derive(Debug)]
pub struct Frame {
    pub code: Rc<CodeObject>,
    pub globals: Rc<RefCell<Namespace>>,
    /// Local bindings; also the class namespace for class-body frames.
    pub locals: Rc<RefCell<Namespace>>,
    /// Cells for this frame's derefvars, keyed by name.
    pub cells: AHashMap<String, CellRef>,
    pub stack: Vec<Value>,
    pub block_stack: Vec<Block>,
    /// Instruction pointer: offset of the next byte to fetch.
    pub lasti: usize,
}

impl Frame {
    /// Builds a frame. Cells for `cellvars` are freshly created, seeded from
    /// the initial locals so captured parameters work; cells for `freevars`
    /// are shared with the defining frame via `closure`.
    pub fn new(
        code: Rc<CodeObject>,
        globals: Rc<RefCell<Namespace>>,
        locals: Rc<RefCell<Namespace>>,
        closure: &[CellRef],
    ) -> Frame {
        let mut cells = AHashMap::new();
        {
            let locals = locals.borrow();
            for name in &code.cellvars {
                let initial = locals.get(name).cloned().unwrap_or(Value::None);
                cells.insert(name.clone(), Rc::new(RefCell::new(initial)));
            }
        }
        for (index, name) in code.freevars.iter().enumerate() {
            if let Some(cell) = closure.get(index) {
                cells.insert(name.clone(), Rc::clone(cell));
            }
        }
        let stack = Vec::with_capacity(code.stacksize as usize);
        Frame {
            code,
            globals,
            locals,
            cells,
            stack,
            block_stack: Vec::new(),
            lasti: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::code::CodeFlags;

    fn empty_code(cellvars: Vec<String>, freevars: Vec<String>) -> Rc<CodeObject> {
        Rc::new(CodeObject {
            argcount: 0,
            kwonlyargcount: 0,
            nlocals: 0,
            stacksize: 0,
            flags: CodeFlags::empty(),
            code: vec![],
            consts: vec![],
            names: vec![],
            varnames: vec![],
            filename: String::new(),
            name: String::new(),
            firstlineno: 1,
            lnotab: vec![],
            freevars,
            cellvars,
        })
    }

    #[test]
    fn cellvars_seed_from_locals() {
        let mut locals = Namespace::default();
        locals.insert("x".to_owned(), Value::Int(5));
        let frame = Frame::new(
            empty_code(vec!["x".to_owned(), "y".to_owned()], vec![]),
            Rc::new(RefCell::new(Namespace::default())),
            Rc::new(RefCell::new(locals)),
            &[],
        );
        assert!(matches!(*frame.cells["x"].borrow(), Value::Int(5)));
        assert!(matches!(*frame.cells["y"].borrow(), Value::None));
    }

    #[test]
    fn freevars_share_closure_cells() {
        let cell: CellRef = Rc::new(RefCell::new(Value::Int(1)));
        let frame = Frame::new(
            empty_code(vec![], vec!["z".to_owned()]),
            Rc::new(RefCell::new(Namespace::default())),
            Rc::new(RefCell::new(Namespace::default())),
            &[Rc::clone(&cell)],
        );
        *cell.borrow_mut() = Value::Int(2);
        assert!(matches!(*frame.cells["z"].borrow(), Value::Int(2)));
    }
}
