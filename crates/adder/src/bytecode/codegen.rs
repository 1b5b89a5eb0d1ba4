//! Bytecode generation from the desugared AST.
//!
//! One [`CodeGen`] exists per scope (module, function, or class body). It
//! walks the AST emitting [`Asm`] fragments, interning constants, names, and
//! fast-local names into insertion-ordered tables, and finally folds the
//! assembly into an immutable [`CodeObject`].

use std::hash::Hash;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::ast::{
    docstring, BinKind, BoolKind, CmpKind, Ctx, ExceptHandler, Expr, ExprKind, FunctionExpr,
    Keyword, Literal, Module, Stmt, StmtKind, UnaryKind,
};
use crate::bytecode::assembly::{assemble, make_lnotab, plumb_depths, Asm, Label};
use crate::bytecode::code::{CodeFlags, CodeObject, Const};
use crate::bytecode::op::{Cmp, Op};
use crate::error::CompileError;
use crate::scope::{Access, Scope};

/// Interning table: maps a key to the next free dense index on first sight,
/// so collected pools are deterministic functions of insertion order.
#[derive(Debug)]
struct Interner<K> {
    map: IndexMap<K, u32>,
}

impl<K: Hash + Eq> Interner<K> {
    fn new() -> Self {
        Interner {
            map: IndexMap::new(),
        }
    }

    fn intern(&mut self, key: K) -> u32 {
        let next = self.map.len() as u32;
        *self.map.entry(key).or_insert(next)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn collect(self) -> Vec<K> {
        self.map.into_keys().collect()
    }
}

/// Compiles a desugared, conformity-checked module to a code object.
pub fn code_for_module(
    module: &Module,
    scope: &Scope,
    filename: &str,
    module_name: &str,
) -> Result<Rc<CodeObject>, CompileError> {
    CodeGen::new(filename, scope).compile_module(&module.body, module_name)
}

/// Per-scope code generator state.
pub struct CodeGen<'a> {
    filename: &'a str,
    scope: &'a Scope,
    constants: Interner<Const>,
    names: Interner<String>,
    varnames: Interner<String>,
    next_label: u32,
    /// Enclosing loops, innermost last.
    loop_stack: Vec<LoopInfo>,
    /// Number of try regions currently being compiled.
    try_depth: u32,
}

/// Continue-target bookkeeping for one enclosing loop.
struct LoopInfo {
    head: Label,
    /// `try_depth` when the loop started; a `continue` issued at a greater
    /// depth must unwind blocks, so it compiles to `CONTINUE_LOOP`.
    try_depth: u32,
}

impl<'a> CodeGen<'a> {
    fn new(filename: &'a str, scope: &'a Scope) -> Self {
        CodeGen {
            filename,
            scope,
            constants: Interner::new(),
            names: Interner::new(),
            varnames: Interner::new(),
            next_label: 0,
            loop_stack: Vec::new(),
            try_depth: 0,
        }
    }

    fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn push_loop(&mut self, head: Label) {
        self.loop_stack.push(LoopInfo {
            head,
            try_depth: self.try_depth,
        });
    }

    // --- finalization ---

    fn compile_module(mut self, body: &[Stmt], name: &str) -> Result<Rc<CodeObject>, CompileError> {
        let assembly = self.body(body)? + self.load_const(Const::None) + Asm::op(Op::ReturnValue);
        self.make_code(assembly, name, 0, false, false)
    }

    fn compile_function(mut self, func: &FunctionExpr) -> Result<Rc<CodeObject>, CompileError> {
        // Constant 0 is the docstring slot, reference-format convention.
        self.constants.intern(match docstring(&func.body) {
            Some(text) => Const::Str(text.to_owned()),
            None => Const::None,
        });
        for param in func.args.names() {
            self.varnames.intern(param.to_owned());
        }
        let assembly =
            self.body(&func.body)? + self.load_const(Const::None) + Asm::op(Op::ReturnValue);
        self.make_code(
            assembly,
            &func.name,
            func.args.args.len(),
            func.args.vararg.is_some(),
            func.args.kwarg.is_some(),
        )
    }

    fn compile_class(
        mut self,
        name: &str,
        body: &[Stmt],
    ) -> Result<Rc<CodeObject>, CompileError> {
        let doc = match docstring(body) {
            Some(text) => {
                self.load_const(Const::Str(text.to_owned())) + self.store_name("__doc__")?
            }
            None => Asm::NoOp,
        };
        let assembly = self.load_name("__name__")?
            + self.store_name("__module__")?
            + self.load_const(Const::Str(name.to_owned()))
            + self.store_name("__qualname__")?
            + doc
            + self.body(body)?
            + self.load_const(Const::None)
            + Asm::op(Op::ReturnValue);
        self.make_code(assembly, name, 0, false, false)
    }

    fn make_code(
        self,
        assembly: Asm,
        name: &str,
        argcount: usize,
        has_varargs: bool,
        has_varkw: bool,
    ) -> Result<Rc<CodeObject>, CompileError> {
        let nlocals = self.varnames.len();
        let stacksize = plumb_depths(&assembly);
        let mut flags = CodeFlags::empty();
        if nlocals > 0 {
            flags |= CodeFlags::HAS_LOCALS;
        }
        if has_varargs {
            flags |= CodeFlags::VARARGS;
        }
        if has_varkw {
            flags |= CodeFlags::VARKEYWORDS;
        }
        if !self.scope.freevars().is_empty() {
            flags |= CodeFlags::NESTED;
        }
        if self.scope.derefvars().next().is_none() {
            flags |= CodeFlags::NOFREE;
        }
        let (firstlineno, lnotab) = make_lnotab(&assembly);
        let code = assemble(&assembly)?;
        tracing::debug!(name, bytes = code.len(), stacksize, "assembled code object");
        Ok(Rc::new(CodeObject {
            argcount: argcount as u32,
            kwonlyargcount: 0,
            nlocals: nlocals as u32,
            stacksize,
            flags,
            code,
            consts: self.constants.collect(),
            names: self.names.collect(),
            varnames: self.varnames.collect(),
            filename: self.filename.to_owned(),
            name: name.to_owned(),
            firstlineno,
            lnotab,
            freevars: self.scope.freevars().to_vec(),
            cellvars: self.scope.cellvars().to_vec(),
        }))
    }

    // --- names and constants ---

    fn load_const(&mut self, constant: Const) -> Asm {
        let index = self.constants.intern(constant);
        Asm::op_arg(Op::LoadConst, index)
    }

    fn load_name(&mut self, name: &str) -> Result<Asm, CompileError> {
        Ok(match self.scope.access(name) {
            Access::Fast => Asm::op_arg(Op::LoadFast, self.varnames.intern(name.to_owned())),
            Access::Deref => Asm::op_arg(Op::LoadDeref, self.deref_index(name)?),
            Access::Name => Asm::op_arg(Op::LoadName, self.names.intern(name.to_owned())),
        })
    }

    fn store_name(&mut self, name: &str) -> Result<Asm, CompileError> {
        Ok(match self.scope.access(name) {
            Access::Fast => Asm::op_arg(Op::StoreFast, self.varnames.intern(name.to_owned())),
            Access::Deref => Asm::op_arg(Op::StoreDeref, self.deref_index(name)?),
            Access::Name => Asm::op_arg(Op::StoreName, self.names.intern(name.to_owned())),
        })
    }

    fn deref_index(&self, name: &str) -> Result<u32, CompileError> {
        self.scope
            .deref_index(name)
            .map(|index| index as u32)
            .ok_or_else(|| CompileError::internal(format!("'{name}' missing from derefvars")))
    }

    // --- statements ---

    fn body(&mut self, body: &[Stmt]) -> Result<Asm, CompileError> {
        let mut assembly = Asm::NoOp;
        for stmt in body {
            assembly = assembly + self.stmt(stmt)?;
        }
        Ok(assembly)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Asm, CompileError> {
        let assembly = self.stmt_kind(stmt)?;
        Ok(if stmt.line > 0 {
            Asm::Line(stmt.line) + assembly
        } else {
            assembly
        })
    }

    fn stmt_kind(&mut self, stmt: &Stmt) -> Result<Asm, CompileError> {
        match &stmt.kind {
            StmtKind::Expr(expr) => Ok(self.expr(expr)? + Asm::op(Op::PopTop)),

            StmtKind::Assign { targets, value } => {
                let mut assembly = self.expr(value)?;
                for (index, target) in targets.iter().enumerate() {
                    if index + 1 < targets.len() {
                        assembly = assembly + Asm::op(Op::DupTop);
                    }
                    assembly = assembly + self.expr(target)?;
                }
                Ok(assembly)
            }

            StmtKind::If { test, body, orelse } => {
                let (orelse_label, after) = (self.fresh_label(), self.fresh_label());
                Ok(self.expr(test)?
                    + Asm::jump(Op::PopJumpIfFalse, orelse_label)
                    + self.body(body)?
                    + Asm::jump(Op::JumpForward, after)
                    + Asm::Label(orelse_label)
                    + self.body(orelse)?
                    + Asm::Label(after))
            }

            StmtKind::While { test, body } => self.compile_while(test, body),
            StmtKind::For { target, iter, body } => self.compile_for(target, iter, body),

            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.expr(expr)?,
                    None => self.load_const(Const::None),
                };
                Ok(value + Asm::op(Op::ReturnValue))
            }

            StmtKind::Raise { exc, cause } => match (exc, cause) {
                (None, _) => Ok(Asm::op_arg(Op::RaiseVarargs, 0)),
                (Some(exc), None) => Ok(self.expr(exc)? + Asm::op_arg(Op::RaiseVarargs, 1)),
                (Some(exc), Some(cause)) => {
                    Ok(self.expr(exc)? + self.expr(cause)? + Asm::op_arg(Op::RaiseVarargs, 2))
                }
            },

            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if finalbody.is_empty() {
                    return self.compile_try_except(body, handlers, orelse);
                }
                self.try_depth += 1;
                let protected = if handlers.is_empty() {
                    self.body(body)
                } else {
                    self.compile_try_except(body, handlers, orelse)
                };
                self.try_depth -= 1;
                self.compile_finally(protected?, finalbody)
            }

            StmtKind::Break => Ok(Asm::op(Op::BreakLoop)),
            StmtKind::Continue => {
                let info = self.loop_stack.last().ok_or_else(|| {
                    CompileError::internal("continue outside loop reached codegen")
                })?;
                // From inside a try region the jump must unwind the block
                // stack first.
                if self.try_depth > info.try_depth {
                    Ok(Asm::jump(Op::ContinueLoop, info.head))
                } else {
                    Ok(Asm::jump(Op::JumpAbsolute, info.head))
                }
            }

            StmtKind::Import(names) => {
                let mut assembly = Asm::NoOp;
                for alias in names {
                    assembly = assembly
                        + self.import_name(0, None, &alias.name)
                        + self.store_name(alias.binding())?;
                }
                Ok(assembly)
            }

            StmtKind::ImportFrom {
                module,
                names,
                level,
            } => {
                let fromlist = Const::Tuple(
                    names
                        .iter()
                        .map(|alias| Const::Str(alias.name.clone()))
                        .collect(),
                );
                let mut assembly = self.import_name(*level, Some(fromlist), module);
                for alias in names {
                    let index = self.names.intern(alias.name.clone());
                    assembly = assembly
                        + Asm::op_arg(Op::ImportFrom, index)
                        + self.store_name(alias.binding())?;
                }
                Ok(assembly + Asm::op(Op::PopTop))
            }

            StmtKind::Pass => Ok(Asm::NoOp),

            StmtKind::ClassDef {
                name,
                bases,
                body,
                scope_id,
            } => {
                let code = self.sprout(*scope_id)?.compile_class(name, body)?;
                let mut assembly = Asm::op(Op::LoadBuildClass)
                    + self.make_closure(&code, name)
                    + self.load_const(Const::Str(name.clone()));
                for base in bases {
                    assembly = assembly + self.expr(base)?;
                }
                Ok(assembly
                    + Asm::op_arg(Op::CallFunction, 2 + bases.len() as u32)
                    + self.store_name(name)?)
            }

            StmtKind::FunctionDef { .. } | StmtKind::Assert { .. } => Err(
                CompileError::internal(format!("sugar reached codegen: {:?}", stmt.kind)),
            ),
        }
    }

    fn compile_while(&mut self, test: &Expr, body: &[Stmt]) -> Result<Asm, CompileError> {
        let (head, end) = (self.fresh_label(), self.fresh_label());
        let needs_block = needs_loop_block(body);
        let after = self.fresh_label();

        let test = self.expr(test)?;
        self.push_loop(head);
        let body = self.body(body);
        self.loop_stack.pop();

        let core = Asm::Label(head)
            + test
            + Asm::jump(Op::PopJumpIfFalse, end)
            + body?
            + Asm::jump(Op::JumpAbsolute, head)
            + Asm::Label(end);
        Ok(if needs_block {
            Asm::jump(Op::SetupLoop, after) + core + Asm::op(Op::PopBlock) + Asm::Label(after)
        } else {
            core
        })
    }

    fn compile_for(&mut self, target: &Expr, iter: &Expr, body: &[Stmt]) -> Result<Asm, CompileError> {
        let (head, end) = (self.fresh_label(), self.fresh_label());
        let needs_block = needs_loop_block(body);
        let after = self.fresh_label();

        let iter = self.expr(iter)?;
        let target = self.expr(target)?;
        self.push_loop(head);
        let body = self.body(body);
        self.loop_stack.pop();

        let core = iter
            + Asm::op(Op::GetIter)
            + Asm::Label(head)
            + Asm::jump(Op::ForIter, end)
            + target
            + body?
            + Asm::jump(Op::JumpAbsolute, head)
            + Asm::Label(end);
        // The exhausted iterator is popped by FOR_ITER on the exit path.
        Ok(if needs_block {
            Asm::jump(Op::SetupLoop, after)
                + core
                + Asm::op(Op::PopBlock)
                + Asm::Label(after)
                + Asm::OffsetStack(-1)
        } else {
            core + Asm::OffsetStack(-1)
        })
    }

    /// Except-region lowering. Depth adjusters keep the textual trace at the
    /// handler-entry depth (six items: two saved exception triples) wherever
    /// the next handler dispatch begins, so the plumb stays an upper bound.
    fn compile_try_except(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: &[Stmt],
    ) -> Result<Asm, CompileError> {
        let (dispatch, else_label, end) =
            (self.fresh_label(), self.fresh_label(), self.fresh_label());

        self.try_depth += 1;
        let protected = self.body(body);
        self.try_depth -= 1;

        let mut assembly = Asm::jump(Op::SetupExcept, dispatch)
            + protected?
            + Asm::op(Op::PopBlock)
            + Asm::jump(Op::JumpForward, else_label)
            + Asm::Label(dispatch);

        for handler in handlers {
            let next = self.fresh_label();
            let typed = handler.class.is_some();
            if let Some(class) = &handler.class {
                assembly = assembly
                    + Asm::op(Op::DupTop)
                    + self.expr(class)?
                    + Asm::op_arg(Op::CompareOp, Cmp::ExcMatch as u32)
                    + Asm::jump(Op::PopJumpIfFalse, next);
            }
            let bind = match &handler.name {
                Some(name) => self.store_name(name)?,
                None => Asm::op(Op::PopTop),
            };
            self.try_depth += 1;
            let handler_body = self.body(&handler.body);
            self.try_depth -= 1;
            assembly = assembly
                + Asm::op(Op::PopTop)
                + bind
                + Asm::op(Op::PopTop)
                + handler_body?
                + Asm::op(Op::PopExcept)
                + Asm::jump(Op::JumpForward, end)
                + Asm::OffsetStack(3);
            if typed {
                assembly = assembly + Asm::Label(next);
            }
        }

        // No handler matched: re-raise from the exception triple.
        Ok(assembly
            + Asm::op(Op::EndFinally)
            + Asm::OffsetStack(-5)
            + Asm::Label(else_label)
            + self.body(orelse)?
            + Asm::Label(end))
    }

    /// Finally-region lowering: the protected assembly runs under a
    /// `SETUP_FINALLY` block; all exits fall into the finally body, which
    /// `END_FINALLY` terminates by dispatching on the saved unwind token.
    fn compile_finally(
        &mut self,
        protected: Asm,
        finalbody: &[Stmt],
    ) -> Result<Asm, CompileError> {
        let final_label = self.fresh_label();
        Ok(Asm::jump(Op::SetupFinally, final_label)
            + protected
            + Asm::op(Op::PopBlock)
            + self.load_const(Const::None)
            + Asm::OffsetStack(-1)
            + Asm::Label(final_label)
            + self.body(finalbody)?
            + Asm::op(Op::EndFinally)
            + Asm::OffsetStack(-5))
    }

    fn import_name(&mut self, level: u32, fromlist: Option<Const>, module: &str) -> Asm {
        let index = self.names.intern(module.to_owned());
        self.load_const(Const::Int(i64::from(level)))
            + self.load_const(fromlist.unwrap_or(Const::None))
            + Asm::op_arg(Op::ImportName, index)
    }

    // --- expressions ---

    fn expr(&mut self, expr: &Expr) -> Result<Asm, CompileError> {
        let assembly = self.expr_kind(expr)?;
        Ok(if expr.line > 0 {
            Asm::Line(expr.line) + assembly
        } else {
            assembly
        })
    }

    fn expr_kind(&mut self, expr: &Expr) -> Result<Asm, CompileError> {
        match &expr.kind {
            ExprKind::Literal(literal) => Ok(self.load_const(const_of(literal))),

            ExprKind::Name { id, ctx } => match ctx {
                Ctx::Load => self.load_name(id),
                Ctx::Store => self.store_name(id),
            },

            ExprKind::UnaryOp { op, operand } => {
                Ok(self.expr(operand)? + Asm::op(unary_opcode(*op)))
            }

            ExprKind::BinOp { left, op, right } => {
                Ok(self.expr(left)? + self.expr(right)? + Asm::op(binary_opcode(*op)))
            }

            ExprKind::Compare { left, op, right } => Ok(self.expr(left)?
                + self.expr(right)?
                + Asm::op_arg(Op::CompareOp, cmp_index(*op) as u32)),

            ExprKind::BoolOp { op, values } => {
                let jump_op = match op {
                    BoolKind::And => Op::JumpIfFalseOrPop,
                    BoolKind::Or => Op::JumpIfTrueOrPop,
                };
                let mut values = values.iter();
                let first = values.next().ok_or_else(|| {
                    CompileError::internal("empty boolean operator reached codegen")
                })?;
                let mut assembly = self.expr(first)?;
                for value in values {
                    let after = self.fresh_label();
                    assembly = assembly
                        + Asm::jump(jump_op, after)
                        + Asm::OffsetStack(-1)
                        + self.expr(value)?
                        + Asm::Label(after);
                }
                Ok(assembly)
            }

            ExprKind::IfExp { test, body, orelse } => {
                let (orelse_label, after) = (self.fresh_label(), self.fresh_label());
                Ok(self.expr(test)?
                    + Asm::jump(Op::PopJumpIfFalse, orelse_label)
                    + self.expr(body)?
                    + Asm::jump(Op::JumpForward, after)
                    + Asm::OffsetStack(-1)
                    + Asm::Label(orelse_label)
                    + self.expr(orelse)?
                    + Asm::Label(after))
            }

            ExprKind::Attribute { value, attr, ctx } => {
                let index = self.names.intern(attr.clone());
                let op = match ctx {
                    Ctx::Load => Op::LoadAttr,
                    Ctx::Store => Op::StoreAttr,
                };
                Ok(self.expr(value)? + Asm::op_arg(op, index))
            }

            ExprKind::Subscript { value, index, ctx } => {
                let op = match ctx {
                    Ctx::Load => Op::BinarySubscr,
                    Ctx::Store => Op::StoreSubscr,
                };
                Ok(self.expr(value)? + self.expr(index)? + Asm::op(op))
            }

            ExprKind::List { elts, ctx } => self.sequence(elts, *ctx, Op::BuildList),
            ExprKind::Tuple { elts, ctx } => self.sequence(elts, *ctx, Op::BuildTuple),

            ExprKind::Dict { keys, values } => {
                let mut assembly =
                    Asm::op_arg(Op::BuildMap, keys.len().min(0xFFFF) as u32);
                for (key, value) in keys.iter().zip(values) {
                    assembly =
                        assembly + self.expr(value)? + self.expr(key)? + Asm::op(Op::StoreMap);
                }
                Ok(assembly)
            }

            ExprKind::Call {
                func,
                args,
                keywords,
                starargs,
                kwargs,
            } => self.compile_call(func, args, keywords, starargs.as_deref(), kwargs.as_deref()),

            ExprKind::Function(func) => {
                let code = self.sprout(func.scope_id)?.compile_function(func)?;
                Ok(self.make_closure(&code, &func.name))
            }

            ExprKind::Lambda { .. } | ExprKind::ListComp { .. } => Err(CompileError::internal(
                format!("sugar reached codegen: {:?}", expr.kind),
            )),
        }
    }

    fn sequence(&mut self, elts: &[Expr], ctx: Ctx, build_op: Op) -> Result<Asm, CompileError> {
        match ctx {
            Ctx::Load => {
                let mut assembly = Asm::NoOp;
                for elt in elts {
                    assembly = assembly + self.expr(elt)?;
                }
                Ok(assembly + Asm::op_arg(build_op, elts.len() as u32))
            }
            Ctx::Store => {
                let mut assembly = Asm::op_arg(Op::UnpackSequence, elts.len() as u32);
                for elt in elts {
                    assembly = assembly + self.expr(elt)?;
                }
                Ok(assembly)
            }
        }
    }

    fn compile_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[Keyword],
        starargs: Option<&Expr>,
        kwargs: Option<&Expr>,
    ) -> Result<Asm, CompileError> {
        let opcode = match (starargs.is_some(), kwargs.is_some()) {
            (true, true) => Op::CallFunctionVarKw,
            (true, false) => Op::CallFunctionVar,
            (false, true) => Op::CallFunctionKw,
            (false, false) => Op::CallFunction,
        };
        let mut assembly = self.expr(func)?;
        for arg in args {
            assembly = assembly + self.expr(arg)?;
        }
        for keyword in keywords {
            assembly = assembly
                + self.load_const(Const::Str(keyword.arg.clone()))
                + self.expr(&keyword.value)?;
        }
        if let Some(starargs) = starargs {
            assembly = assembly + self.expr(starargs)?;
        }
        if let Some(kwargs) = kwargs {
            assembly = assembly + self.expr(kwargs)?;
        }
        let operand = ((keywords.len() as u32) << 8) | args.len() as u32;
        Ok(assembly + Asm::op_arg(opcode, operand))
    }

    // --- functions and classes ---

    fn sprout(&self, scope_id: u32) -> Result<CodeGen<'a>, CompileError> {
        let child = self
            .scope
            .child(scope_id)
            .ok_or_else(|| CompileError::internal(format!("no scope for node {scope_id}")))?;
        Ok(CodeGen::new(self.filename, child))
    }

    /// Emits the definition-site sequence for a compiled function or class
    /// body: a plain `MAKE_FUNCTION`, or cell captures plus `MAKE_CLOSURE`
    /// when the code references enclosing frames.
    fn make_closure(&mut self, code: &Rc<CodeObject>, name: &str) -> Asm {
        if code.freevars.is_empty() {
            return self.load_const(Const::Code(Rc::clone(code)))
                + self.load_const(Const::Str(name.to_owned()))
                + Asm::op_arg(Op::MakeFunction, 0);
        }
        let mut captures = Asm::NoOp;
        for freevar in &code.freevars {
            // The operand is the variable's slot in the enclosing frame's
            // deref space; missing entries are a scope-analysis bug.
            let index = self
                .scope
                .deref_index(freevar)
                .expect("free variable missing from enclosing derefvars");
            captures = captures + Asm::op_arg(Op::LoadClosure, index as u32);
        }
        captures
            + Asm::op_arg(Op::BuildTuple, code.freevars.len() as u32)
            + self.load_const(Const::Code(Rc::clone(code)))
            + self.load_const(Const::Str(name.to_owned()))
            + Asm::op_arg(Op::MakeClosure, 0)
    }
}

fn const_of(literal: &Literal) -> Const {
    match literal {
        Literal::None => Const::None,
        Literal::Bool(value) => Const::Bool(*value),
        Literal::Int(value) => Const::Int(*value),
        Literal::Float(value) => Const::Float(*value),
        Literal::Str(value) => Const::Str(value.clone()),
        Literal::Bytes(value) => Const::Bytes(value.clone()),
    }
}

fn unary_opcode(op: UnaryKind) -> Op {
    match op {
        UnaryKind::Pos => Op::UnaryPositive,
        UnaryKind::Neg => Op::UnaryNegative,
        UnaryKind::Not => Op::UnaryNot,
        UnaryKind::Invert => Op::UnaryInvert,
    }
}

fn binary_opcode(op: BinKind) -> Op {
    match op {
        BinKind::Add => Op::BinaryAdd,
        BinKind::Sub => Op::BinarySubtract,
        BinKind::Mul => Op::BinaryMultiply,
        BinKind::Div => Op::BinaryTrueDivide,
        BinKind::FloorDiv => Op::BinaryFloorDivide,
        BinKind::Mod => Op::BinaryModulo,
        BinKind::Pow => Op::BinaryPower,
        BinKind::LShift => Op::BinaryLshift,
        BinKind::RShift => Op::BinaryRshift,
        BinKind::BitOr => Op::BinaryOr,
        BinKind::BitXor => Op::BinaryXor,
        BinKind::BitAnd => Op::BinaryAnd,
    }
}

fn cmp_index(op: CmpKind) -> Cmp {
    match op {
        CmpKind::Lt => Cmp::Lt,
        CmpKind::LtE => Cmp::Le,
        CmpKind::Eq => Cmp::Eq,
        CmpKind::NotEq => Cmp::Ne,
        CmpKind::Gt => Cmp::Gt,
        CmpKind::GtE => Cmp::Ge,
        CmpKind::In => Cmp::In,
        CmpKind::NotIn => Cmp::NotIn,
        CmpKind::Is => Cmp::Is,
        CmpKind::IsNot => Cmp::IsNot,
    }
}

/// True if the loop body needs a `SETUP_LOOP` block: it contains a `break`,
/// or a `continue` issued from inside a try region (both unwind through the
/// block stack). Plain loops compile to bare label patterns.
fn needs_loop_block(body: &[Stmt]) -> bool {
    loop_exits(body, false)
}

/// Scans for `break`/`continue` binding to the enclosing loop, descending
/// into branches and try regions but not into nested loops or functions.
fn loop_exits(body: &[Stmt], in_try: bool) -> bool {
    body.iter().any(|stmt| match &stmt.kind {
        StmtKind::Break => true,
        StmtKind::Continue => in_try,
        StmtKind::If { body, orelse, .. } => {
            loop_exits(body, in_try) || loop_exits(orelse, in_try)
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            loop_exits(body, true)
                || handlers.iter().any(|handler| loop_exits(&handler.body, true))
                || loop_exits(orelse, in_try || !finalbody.is_empty())
                || loop_exits(finalbody, true)
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::{build, Alias};
    use crate::check::check_conformity;
    use crate::desugar::desugar;
    use crate::scope::top_scope;

    fn compile(module: Module) -> Rc<CodeObject> {
        let module = desugar(module);
        check_conformity(&module).expect("conformity");
        let scope = top_scope(&module);
        code_for_module(&module, &scope, "<test>", "<module>").expect("codegen")
    }

    fn ops_of(code: &CodeObject) -> Vec<(Op, Option<u16>)> {
        code.instructions()
            .map(|instr| {
                let instr = instr.expect("decode");
                (instr.op, instr.arg)
            })
            .collect()
    }

    #[test]
    fn module_multiplication_emits_expected_sequence() {
        // x = 2 * 3, at module level, resolves x by name.
        let code = compile(build::module(vec![build::assign(
            build::store("x"),
            build::binop(build::int(2), BinKind::Mul, build::int(3)),
        )]));
        assert_eq!(
            ops_of(&code),
            vec![
                (Op::LoadConst, Some(0)),
                (Op::LoadConst, Some(1)),
                (Op::BinaryMultiply, None),
                (Op::StoreName, Some(0)),
                (Op::LoadConst, Some(2)),
                (Op::ReturnValue, None),
            ]
        );
        assert_eq!(code.consts[0], Const::Int(2));
        assert_eq!(code.consts[1], Const::Int(3));
        assert_eq!(code.names, vec!["x".to_owned()]);
        assert_eq!(code.stacksize, 2);
    }

    #[test]
    fn equal_constants_of_distinct_types_get_distinct_slots() {
        let code = compile(build::module(vec![
            build::assign(build::store("a"), build::int(1)),
            build::assign(build::store("b"), build::float(1.0)),
            build::assign(build::store("c"), build::int(1)),
        ]));
        assert_eq!(code.consts[0], Const::Int(1));
        assert_eq!(code.consts[1], Const::Float(1.0));
        // The second integer 1 reuses slot 0.
        let loads: Vec<u16> = code
            .instructions()
            .filter_map(|instr| {
                let instr = instr.unwrap();
                (instr.op == Op::LoadConst).then(|| instr.arg.unwrap())
            })
            .collect();
        assert_eq!(&loads[..3], &[0, 1, 0]);
    }

    #[test]
    fn multi_target_assign_dups_n_minus_one_times() {
        let code = compile(build::module(vec![build::assign_many(
            vec![build::store("a"), build::store("b")],
            build::int(7),
        )]));
        let dup_count = ops_of(&code)
            .iter()
            .filter(|(op, _)| *op == Op::DupTop)
            .count();
        assert_eq!(dup_count, 1);
    }

    #[test]
    fn single_target_assign_has_no_dup() {
        let code = compile(build::module(vec![build::assign(
            build::store("a"),
            build::int(7),
        )]));
        assert!(!ops_of(&code).iter().any(|(op, _)| *op == Op::DupTop));
    }

    #[test]
    fn call_operand_packs_keyword_and_positional_counts() {
        let code = compile(build::module(vec![build::expr_stmt(build::call_kw(
            build::name("f"),
            vec![build::int(1), build::int(2)],
            vec![("k", build::int(3))],
        ))]));
        let call = ops_of(&code)
            .into_iter()
            .find(|(op, _)| *op == Op::CallFunction)
            .expect("call emitted");
        assert_eq!(call.1, Some((1 << 8) | 2));
    }

    #[test]
    fn function_definition_site_uses_make_function() {
        let code = compile(build::module(vec![build::def(
            "f",
            &["x"],
            vec![build::pass()],
        )]));
        let ops = ops_of(&code);
        assert!(ops.contains(&(Op::MakeFunction, Some(0))));
        // The function body is constant 0 (after the docstring convention
        // the *module* has no docstring slot, so the code lands first).
        let func_code = code
            .consts
            .iter()
            .find_map(|constant| match constant {
                Const::Code(code) => Some(code),
                _ => None,
            })
            .expect("code constant");
        assert_eq!(func_code.name, "f");
        assert_eq!(func_code.argcount, 1);
        assert_eq!(func_code.varnames, vec!["x".to_owned()]);
        assert!(func_code.flags.contains(CodeFlags::HAS_LOCALS));
        assert!(func_code.flags.contains(CodeFlags::NOFREE));
        assert!(!func_code.flags.contains(CodeFlags::NESTED));
    }

    #[test]
    fn closure_lists_cellvars_and_freevars() {
        // Scenario: outer defines y, inner captures it.
        let code = compile(build::module(vec![build::def(
            "outer",
            &[],
            vec![
                build::assign(build::store("y"), build::int(1)),
                build::def("inner", &[], vec![build::ret(build::name("y"))]),
                build::ret(build::call(build::name("inner"), vec![])),
            ],
        )]));
        let outer = code
            .consts
            .iter()
            .find_map(|constant| match constant {
                Const::Code(code) if code.name == "outer" => Some(code),
                _ => None,
            })
            .expect("outer code");
        assert_eq!(outer.cellvars, vec!["y".to_owned()]);
        let inner = outer
            .consts
            .iter()
            .find_map(|constant| match constant {
                Const::Code(code) if code.name == "inner" => Some(code),
                _ => None,
            })
            .expect("inner code");
        assert_eq!(inner.freevars, vec!["y".to_owned()]);
        assert!(inner.flags.contains(CodeFlags::NESTED));
        assert!(!inner.flags.contains(CodeFlags::NOFREE));
        // Definition site captures the cell then builds the closure.
        let ops = ops_of(outer);
        assert!(ops.contains(&(Op::LoadClosure, Some(0))));
        assert!(ops.contains(&(Op::MakeClosure, Some(0))));
        assert!(!ops.contains(&(Op::MakeFunction, Some(0))));
    }

    #[test]
    fn import_lowering() {
        let code = compile(build::module(vec![Stmt::new(StmtKind::Import(vec![
            Alias {
                name: "os.path".to_owned(),
                asname: None,
            },
        ]))]));
        let ops = ops_of(&code);
        assert!(ops.contains(&(Op::ImportName, Some(0))));
        assert_eq!(code.names, vec!["os.path".to_owned(), "os".to_owned()]);
        assert_eq!(code.consts[0], Const::Int(0));
        assert_eq!(code.consts[1], Const::None);
    }

    #[test]
    fn import_from_lowering_ends_with_pop() {
        let code = compile(build::module(vec![Stmt::new(StmtKind::ImportFrom {
            module: "m".to_owned(),
            names: vec![
                Alias {
                    name: "x".to_owned(),
                    asname: None,
                },
                Alias {
                    name: "y".to_owned(),
                    asname: Some("z".to_owned()),
                },
            ],
            level: 0,
        })]));
        let ops = ops_of(&code);
        let import_froms = ops.iter().filter(|(op, _)| *op == Op::ImportFrom).count();
        assert_eq!(import_froms, 2);
        assert_eq!(
            code.consts[1],
            Const::Tuple(vec![Const::Str("x".to_owned()), Const::Str("y".to_owned())])
        );
        // Module object is popped after the last IMPORT_FROM/store pair.
        let pop_position = ops.iter().rposition(|(op, _)| *op == Op::PopTop).unwrap();
        let last_store = ops.iter().rposition(|(op, _)| *op == Op::StoreName).unwrap();
        assert!(pop_position > last_store);
    }

    #[test]
    fn for_loop_shape() {
        let code = compile(build::module(vec![build::for_(
            build::store("i"),
            build::name("xs"),
            vec![build::pass()],
        )]));
        let ops: Vec<Op> = ops_of(&code).into_iter().map(|(op, _)| op).collect();
        let get_iter = ops.iter().position(|&op| op == Op::GetIter).unwrap();
        let for_iter = ops.iter().position(|&op| op == Op::ForIter).unwrap();
        let jump_back = ops.iter().position(|&op| op == Op::JumpAbsolute).unwrap();
        assert!(get_iter < for_iter && for_iter < jump_back);
        assert!(!ops.contains(&Op::SetupLoop));
    }

    #[test]
    fn loop_with_break_gets_a_block() {
        let code = compile(build::module(vec![build::while_(
            build::bool(true),
            vec![Stmt::new(StmtKind::Break)],
        )]));
        let ops: Vec<Op> = ops_of(&code).into_iter().map(|(op, _)| op).collect();
        assert!(ops.contains(&Op::SetupLoop));
        assert!(ops.contains(&Op::BreakLoop));
        assert!(ops.contains(&Op::PopBlock));
    }

    #[test]
    fn continue_inside_try_unwinds_through_the_block_stack() {
        // while True:
        //     try: continue
        //     except ValueError: pass
        let code = compile(build::module(vec![build::while_(
            build::bool(true),
            vec![Stmt::new(StmtKind::Try {
                body: vec![Stmt::new(StmtKind::Continue)],
                handlers: vec![ExceptHandler {
                    class: Some(build::name("ValueError")),
                    name: None,
                    body: vec![build::pass()],
                }],
                orelse: vec![],
                finalbody: vec![],
            })],
        )]));
        let ops: Vec<Op> = ops_of(&code).into_iter().map(|(op, _)| op).collect();
        assert!(ops.contains(&Op::ContinueLoop));
        assert!(ops.contains(&Op::SetupLoop));
    }

    #[test]
    fn plain_continue_is_a_direct_jump() {
        let code = compile(build::module(vec![build::while_(
            build::bool(true),
            vec![Stmt::new(StmtKind::Continue)],
        )]));
        let ops: Vec<Op> = ops_of(&code).into_iter().map(|(op, _)| op).collect();
        assert!(!ops.contains(&Op::ContinueLoop));
        assert!(!ops.contains(&Op::SetupLoop));
    }

    #[test]
    fn try_except_shape() {
        let code = compile(build::module(vec![Stmt::new(StmtKind::Try {
            body: vec![build::raise(build::call(
                build::name("ValueError"),
                vec![build::str("v")],
            ))],
            handlers: vec![ExceptHandler {
                class: Some(build::name("ValueError")),
                name: Some("e".to_owned()),
                body: vec![build::pass()],
            }],
            orelse: vec![],
            finalbody: vec![],
        })]));
        let ops: Vec<Op> = ops_of(&code).into_iter().map(|(op, _)| op).collect();
        for expected in [
            Op::SetupExcept,
            Op::CompareOp,
            Op::PopExcept,
            Op::EndFinally,
        ] {
            assert!(ops.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn every_jump_lands_on_an_instruction_boundary() {
        let code = compile(build::module(vec![
            build::if_(
                build::compare(build::name("a"), CmpKind::Lt, build::int(3)),
                vec![build::assign(build::store("b"), build::int(1))],
                vec![build::assign(build::store("b"), build::int(2))],
            ),
            build::while_(
                build::name("b"),
                vec![build::assign(
                    build::store("b"),
                    build::binop(build::name("b"), BinKind::Sub, build::int(1)),
                )],
            ),
        ]));
        let boundaries: Vec<usize> = code
            .instructions()
            .map(|instr| instr.unwrap().offset)
            .collect();
        for instr in code.instructions() {
            let instr = instr.unwrap();
            if instr.op.has_jabs() {
                assert!(boundaries.contains(&usize::from(instr.arg.unwrap())));
            } else if instr.op.has_jrel() {
                let target = instr.offset + 3 + usize::from(instr.arg.unwrap());
                assert!(boundaries.contains(&target) || target == code.code.len());
            }
        }
    }

    #[test]
    fn boolop_net_effect_is_one_value() {
        let code = compile(build::module(vec![build::expr_stmt(build::boolop(
            BoolKind::And,
            vec![build::name("a"), build::name("b"), build::name("c")],
        ))]));
        // Stack must be balanced: expression statement pops exactly one value
        // and the module still returns None from an empty stack.
        assert!(code.stacksize >= 1);
        let ops = ops_of(&code);
        let jumps = ops
            .iter()
            .filter(|(op, _)| *op == Op::JumpIfFalseOrPop)
            .count();
        assert_eq!(jumps, 2);
    }

    #[test]
    fn class_body_prologue() {
        let code = compile(build::module(vec![build::class(
            "A",
            vec![],
            vec![build::pass()],
        )]));
        let class_code = code
            .consts
            .iter()
            .find_map(|constant| match constant {
                Const::Code(code) => Some(code),
                _ => None,
            })
            .expect("class body code");
        let ops = ops_of(class_code);
        assert_eq!(ops[0], (Op::LoadName, Some(0)));
        assert_eq!(class_code.names[0], "__name__");
        assert_eq!(class_code.names[1], "__module__");
        assert_eq!(class_code.names[2], "__qualname__");
        // Module-level call: build class with name + no bases.
        let module_ops = ops_of(&code);
        assert!(module_ops.contains(&(Op::LoadBuildClass, None)));
        assert!(module_ops.contains(&(Op::CallFunction, Some(2))));
    }

    #[test]
    fn line_numbers_monotone_in_lnotab() {
        let code = compile(build::module(vec![
            build::assign(build::store("a"), build::int(1)).at(1),
            build::assign(build::store("b"), build::int(2)).at(3),
            build::assign(build::store("c"), build::int(3)).at(10),
        ]));
        assert_eq!(code.firstlineno, 1);
        assert_eq!(code.line_for_offset(0), 1);
        let mut previous = 0;
        for pair in code.lnotab.chunks_exact(2) {
            let line_delta = pair[1];
            previous += u32::from(line_delta);
        }
        assert_eq!(previous, 9);
    }
}
