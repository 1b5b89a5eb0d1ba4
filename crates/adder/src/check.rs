//! Conformity checking for the desugared AST.
//!
//! Runs after desugaring and before scope analysis; rejects any shape the
//! code generator does not handle, so the later passes can treat unexpected
//! nodes as internal bugs rather than user errors.

use std::collections::HashSet;

use crate::ast::{Arguments, Ctx, Expr, ExprKind, Module, Stmt, StmtKind};
use crate::error::CompileError;

/// Operand byte fields for calls hold one byte each.
const MAX_CALL_ARGS: usize = 255;

/// `BUILD_MAP` caps its size hint at a u16.
const MAX_DICT_ENTRIES: usize = 0xFFFF;

/// Verifies that `module` only uses the accepted subset.
pub fn check_conformity(module: &Module) -> Result<(), CompileError> {
    let mut checker = Checker {
        function_depth: 0,
        loop_depth: 0,
    };
    checker.body(&module.body)
}

struct Checker {
    function_depth: u32,
    loop_depth: u32,
}

impl Checker {
    fn body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        body.iter().try_for_each(|stmt| self.stmt(stmt))
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let line = stmt.line;
        match &stmt.kind {
            StmtKind::Expr(expr) => self.expr(expr),
            StmtKind::Assign { targets, value } => {
                if targets.is_empty() {
                    return Err(CompileError::conformity("assignment with no targets", line));
                }
                for target in targets {
                    self.target(target)?;
                }
                self.expr(value)
            }
            StmtKind::If { test, body, orelse } => {
                self.expr(test)?;
                self.body(body)?;
                self.body(orelse)
            }
            StmtKind::While { test, body } => {
                self.expr(test)?;
                self.loop_depth += 1;
                let result = self.body(body);
                self.loop_depth -= 1;
                result
            }
            StmtKind::For { target, iter, body } => {
                self.target(target)?;
                self.expr(iter)?;
                self.loop_depth += 1;
                let result = self.body(body);
                self.loop_depth -= 1;
                result
            }
            StmtKind::Return(value) => {
                if self.function_depth == 0 {
                    return Err(CompileError::conformity("return outside function", line));
                }
                value.as_ref().map_or(Ok(()), |expr| self.expr(expr))
            }
            StmtKind::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.expr(exc)?;
                }
                match cause {
                    Some(_) if exc.is_none() => {
                        Err(CompileError::conformity("raise cause without exception", line))
                    }
                    Some(cause) => self.expr(cause),
                    None => Ok(()),
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                if handlers.is_empty() && finalbody.is_empty() {
                    return Err(CompileError::conformity(
                        "try without handlers or finally",
                        line,
                    ));
                }
                if !orelse.is_empty() && handlers.is_empty() {
                    return Err(CompileError::conformity("try-else without handlers", line));
                }
                self.body(body)?;
                for (index, handler) in handlers.iter().enumerate() {
                    if let Some(class) = &handler.class {
                        self.expr(class)?;
                    } else {
                        if handler.name.is_some() {
                            return Err(CompileError::conformity(
                                "bare except cannot bind a name",
                                line,
                            ));
                        }
                        if index + 1 != handlers.len() {
                            return Err(CompileError::conformity(
                                "bare except must be last",
                                line,
                            ));
                        }
                    }
                    self.body(&handler.body)?;
                }
                self.body(orelse)?;
                // A finally clause may not jump out of the loop around it.
                let loop_depth = std::mem::replace(&mut self.loop_depth, 0);
                let result = self.body(finalbody);
                self.loop_depth = loop_depth;
                result
            }
            StmtKind::Break => {
                if self.loop_depth == 0 {
                    return Err(CompileError::conformity("break outside loop", line));
                }
                Ok(())
            }
            StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(CompileError::conformity("continue outside loop", line));
                }
                Ok(())
            }
            StmtKind::Import(names) => {
                if names.is_empty() {
                    return Err(CompileError::conformity("import with no names", line));
                }
                Ok(())
            }
            StmtKind::ImportFrom { names, .. } => {
                if names.is_empty() {
                    return Err(CompileError::conformity("import-from with no names", line));
                }
                Ok(())
            }
            StmtKind::Pass => Ok(()),
            StmtKind::ClassDef { bases, body, .. } => {
                for base in bases {
                    self.expr(base)?;
                }
                self.body(body)
            }
            StmtKind::FunctionDef { .. } => Err(CompileError::conformity(
                "function definition survived desugaring",
                line,
            )),
            StmtKind::Assert { .. } => Err(CompileError::conformity(
                "assert survived desugaring",
                line,
            )),
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        let line = expr.line;
        match &expr.kind {
            ExprKind::Literal(_) => Ok(()),
            ExprKind::Name { ctx, id } => match ctx {
                Ctx::Load => Ok(()),
                Ctx::Store => Err(CompileError::conformity(
                    format!("store of '{id}' in expression position"),
                    line,
                )),
            },
            ExprKind::UnaryOp { operand, .. } => self.expr(operand),
            ExprKind::BinOp { left, right, .. } | ExprKind::Compare { left, right, .. } => {
                self.expr(left)?;
                self.expr(right)
            }
            ExprKind::BoolOp { values, .. } => {
                if values.len() < 2 {
                    return Err(CompileError::conformity(
                        "boolean operator with fewer than two operands",
                        line,
                    ));
                }
                values.iter().try_for_each(|value| self.expr(value))
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.expr(test)?;
                self.expr(body)?;
                self.expr(orelse)
            }
            ExprKind::Attribute { value, ctx, .. } => match ctx {
                Ctx::Load => self.expr(value),
                Ctx::Store => Err(CompileError::conformity(
                    "attribute store in expression position",
                    line,
                )),
            },
            ExprKind::Subscript { value, index, ctx } => match ctx {
                Ctx::Load => {
                    self.expr(value)?;
                    self.expr(index)
                }
                Ctx::Store => Err(CompileError::conformity(
                    "subscript store in expression position",
                    line,
                )),
            },
            ExprKind::List { elts, ctx } | ExprKind::Tuple { elts, ctx } => match ctx {
                Ctx::Load => elts.iter().try_for_each(|elt| self.expr(elt)),
                Ctx::Store => Err(CompileError::conformity(
                    "sequence store in expression position",
                    line,
                )),
            },
            ExprKind::Dict { keys, values } => {
                if keys.len() != values.len() {
                    return Err(CompileError::conformity(
                        "dict literal with mismatched keys and values",
                        line,
                    ));
                }
                if keys.len() > MAX_DICT_ENTRIES {
                    return Err(CompileError::conformity(
                        format!("dict literal with more than {MAX_DICT_ENTRIES} entries"),
                        line,
                    ));
                }
                keys.iter().try_for_each(|key| self.expr(key))?;
                values.iter().try_for_each(|value| self.expr(value))
            }
            ExprKind::Call {
                func,
                args,
                keywords,
                starargs,
                kwargs,
            } => {
                if args.len() > MAX_CALL_ARGS {
                    return Err(CompileError::conformity(
                        format!("more than {MAX_CALL_ARGS} positional arguments"),
                        line,
                    ));
                }
                if keywords.len() > MAX_CALL_ARGS {
                    return Err(CompileError::conformity(
                        format!("more than {MAX_CALL_ARGS} keyword arguments"),
                        line,
                    ));
                }
                self.expr(func)?;
                args.iter().try_for_each(|arg| self.expr(arg))?;
                keywords
                    .iter()
                    .try_for_each(|keyword| self.expr(&keyword.value))?;
                if let Some(starargs) = starargs {
                    self.expr(starargs)?;
                }
                if let Some(kwargs) = kwargs {
                    self.expr(kwargs)?;
                }
                Ok(())
            }
            ExprKind::Function(func) => {
                self.params(&func.args, line)?;
                self.function_depth += 1;
                let was_loop_depth = std::mem::replace(&mut self.loop_depth, 0);
                let result = self.body(&func.body);
                self.loop_depth = was_loop_depth;
                self.function_depth -= 1;
                result
            }
            ExprKind::Lambda { .. } => Err(CompileError::conformity(
                "lambda survived desugaring",
                line,
            )),
            ExprKind::ListComp { .. } => Err(CompileError::conformity(
                "comprehension survived desugaring",
                line,
            )),
        }
    }

    /// Assignment and loop targets: names, attributes, subscripts, and
    /// sequences thereof, all tagged with store context.
    fn target(&mut self, target: &Expr) -> Result<(), CompileError> {
        let line = target.line;
        match &target.kind {
            ExprKind::Name { ctx: Ctx::Store, .. } => Ok(()),
            ExprKind::Attribute {
                value,
                ctx: Ctx::Store,
                ..
            } => self.expr(value),
            ExprKind::Subscript {
                value,
                index,
                ctx: Ctx::Store,
            } => {
                self.expr(value)?;
                self.expr(index)
            }
            ExprKind::List {
                elts,
                ctx: Ctx::Store,
            }
            | ExprKind::Tuple {
                elts,
                ctx: Ctx::Store,
            } => {
                if elts.len() > MAX_CALL_ARGS {
                    return Err(CompileError::conformity("unpacking too many targets", line));
                }
                elts.iter().try_for_each(|elt| self.target(elt))
            }
            _ => Err(CompileError::conformity(
                "invalid assignment target",
                line,
            )),
        }
    }

    fn params(&self, args: &Arguments, line: u32) -> Result<(), CompileError> {
        let mut seen = HashSet::new();
        for name in args.names() {
            if !seen.insert(name) {
                return Err(CompileError::conformity(
                    format!("duplicate parameter '{name}'"),
                    line,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::desugar::desugar;

    #[test]
    fn accepts_desugared_module() {
        let module = desugar(build::module(vec![
            build::def("f", &["x"], vec![build::ret(build::name("x"))]),
            build::assert(build::bool(true), None),
            build::assign(build::store("y"), build::call(build::name("f"), vec![build::int(1)])),
        ]));
        assert!(check_conformity(&module).is_ok());
    }

    #[test]
    fn rejects_surviving_sugar() {
        let module = build::module(vec![build::assert(build::bool(true), None).at(2)]);
        let err = check_conformity(&module).unwrap_err();
        assert_eq!(
            err,
            CompileError::conformity("assert survived desugaring", 2)
        );
    }

    #[test]
    fn rejects_return_at_module_level() {
        let module = build::module(vec![build::ret(build::int(1)).at(1)]);
        assert!(check_conformity(&module).is_err());
    }

    #[test]
    fn rejects_break_outside_loop() {
        let module = build::module(vec![Stmt::new(StmtKind::Break).at(4)]);
        assert!(check_conformity(&module).is_err());
    }

    #[test]
    fn rejects_bad_assignment_target() {
        let module = build::module(vec![build::assign(build::int(1), build::int(2))]);
        assert!(check_conformity(&module).is_err());
    }

    #[test]
    fn rejects_duplicate_parameters() {
        let module = desugar(build::module(vec![build::def(
            "f",
            &["a", "a"],
            vec![build::pass()],
        )]));
        assert!(check_conformity(&module).is_err());
    }

    #[test]
    fn loop_context_does_not_leak_into_functions() {
        // A function defined inside a loop starts with no enclosing loop.
        let module = desugar(build::module(vec![build::while_(
            build::bool(true),
            vec![build::def("f", &[], vec![Stmt::new(StmtKind::Break)])],
        )]));
        assert!(check_conformity(&module).is_err());
    }
}
