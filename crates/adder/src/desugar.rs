//! AST-to-AST rewriting that eliminates syntactic sugar.
//!
//! After desugaring, no `assert`, `lambda`, decorator list, or comprehension
//! remains, and every `def` has been replaced by an assignment of a
//! [`FunctionExpr`] node. The rewrite recurses into children first, then
//! applies the node-level rule, so nested sugar is handled in one pass.
//!
//! A final repair pass propagates line numbers into synthesized nodes and
//! numbers every `Function`/`ClassDef` scope for the scope analyzer.

use crate::ast::{
    Arguments, Comprehension, Ctx, ExceptHandler, Expr, ExprKind, FunctionExpr, Keyword, Module,
    Stmt, StmtKind,
};

/// Rewrites a module into the reduced core and repairs locations.
#[must_use]
pub fn desugar(module: Module) -> Module {
    let mut module = Module {
        body: rewrite_body(module.body),
    };
    let mut scopes = ScopeNumbering::default();
    repair_body(&mut module.body, 1, &mut scopes);
    module
}

fn rewrite_body(body: Vec<Stmt>) -> Vec<Stmt> {
    body.into_iter().map(rewrite_stmt).collect()
}

fn rewrite_stmt(stmt: Stmt) -> Stmt {
    let line = stmt.line;
    let kind = match stmt.kind {
        StmtKind::Expr(expr) => StmtKind::Expr(rewrite_expr(expr)),
        StmtKind::Assign { targets, value } => StmtKind::Assign {
            targets: targets.into_iter().map(rewrite_expr).collect(),
            value: rewrite_expr(value),
        },
        StmtKind::If { test, body, orelse } => StmtKind::If {
            test: rewrite_expr(test),
            body: rewrite_body(body),
            orelse: rewrite_body(orelse),
        },
        StmtKind::While { test, body } => StmtKind::While {
            test: rewrite_expr(test),
            body: rewrite_body(body),
        },
        StmtKind::For { target, iter, body } => StmtKind::For {
            target: rewrite_expr(target),
            iter: rewrite_expr(iter),
            body: rewrite_body(body),
        },
        StmtKind::Return(value) => StmtKind::Return(value.map(rewrite_expr)),
        StmtKind::Raise { exc, cause } => StmtKind::Raise {
            exc: exc.map(rewrite_expr),
            cause: cause.map(rewrite_expr),
        },
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => StmtKind::Try {
            body: rewrite_body(body),
            handlers: handlers
                .into_iter()
                .map(|handler| ExceptHandler {
                    class: handler.class.map(rewrite_expr),
                    name: handler.name,
                    body: rewrite_body(handler.body),
                })
                .collect(),
            orelse: rewrite_body(orelse),
            finalbody: rewrite_body(finalbody),
        },
        StmtKind::ClassDef {
            name,
            bases,
            body,
            scope_id,
        } => StmtKind::ClassDef {
            name,
            bases: bases.into_iter().map(rewrite_expr).collect(),
            body: rewrite_body(body),
            scope_id,
        },

        // assert e, m  =>  if e: pass else: raise AssertionError(m)
        StmtKind::Assert { test, msg } => {
            let exc = call(
                load("AssertionError"),
                msg.map(rewrite_expr).into_iter().collect(),
            );
            StmtKind::If {
                test: rewrite_expr(test),
                body: Vec::new(),
                orelse: vec![Stmt::new(StmtKind::Raise {
                    exc: Some(exc),
                    cause: None,
                })],
            }
        }

        // @d1 @d2 def f(...)  =>  f = d1(d2(<function f>))
        StmtKind::FunctionDef {
            name,
            args,
            body,
            decorators,
        } => {
            let mut value = function(name.clone(), args, rewrite_body(body));
            for decorator in decorators.into_iter().rev() {
                value = call(rewrite_expr(decorator), vec![value]);
            }
            StmtKind::Assign {
                targets: vec![Expr::new(ExprKind::Name {
                    id: name,
                    ctx: Ctx::Store,
                })],
                value,
            }
        }

        kind @ (StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Pass) => kind,
    };
    Stmt { line, kind }
}

fn rewrite_expr(expr: Expr) -> Expr {
    let line = expr.line;
    let kind = match expr.kind {
        ExprKind::UnaryOp { op, operand } => ExprKind::UnaryOp {
            op,
            operand: Box::new(rewrite_expr(*operand)),
        },
        ExprKind::BinOp { left, op, right } => ExprKind::BinOp {
            left: Box::new(rewrite_expr(*left)),
            op,
            right: Box::new(rewrite_expr(*right)),
        },
        ExprKind::Compare { left, op, right } => ExprKind::Compare {
            left: Box::new(rewrite_expr(*left)),
            op,
            right: Box::new(rewrite_expr(*right)),
        },
        ExprKind::BoolOp { op, values } => ExprKind::BoolOp {
            op,
            values: values.into_iter().map(rewrite_expr).collect(),
        },
        ExprKind::IfExp { test, body, orelse } => ExprKind::IfExp {
            test: Box::new(rewrite_expr(*test)),
            body: Box::new(rewrite_expr(*body)),
            orelse: Box::new(rewrite_expr(*orelse)),
        },
        ExprKind::Attribute { value, attr, ctx } => ExprKind::Attribute {
            value: Box::new(rewrite_expr(*value)),
            attr,
            ctx,
        },
        ExprKind::Subscript { value, index, ctx } => ExprKind::Subscript {
            value: Box::new(rewrite_expr(*value)),
            index: Box::new(rewrite_expr(*index)),
            ctx,
        },
        ExprKind::List { elts, ctx } => ExprKind::List {
            elts: elts.into_iter().map(rewrite_expr).collect(),
            ctx,
        },
        ExprKind::Tuple { elts, ctx } => ExprKind::Tuple {
            elts: elts.into_iter().map(rewrite_expr).collect(),
            ctx,
        },
        ExprKind::Dict { keys, values } => ExprKind::Dict {
            keys: keys.into_iter().map(rewrite_expr).collect(),
            values: values.into_iter().map(rewrite_expr).collect(),
        },
        ExprKind::Call {
            func,
            args,
            keywords,
            starargs,
            kwargs,
        } => ExprKind::Call {
            func: Box::new(rewrite_expr(*func)),
            args: args.into_iter().map(rewrite_expr).collect(),
            keywords: keywords
                .into_iter()
                .map(|keyword| Keyword {
                    arg: keyword.arg,
                    value: rewrite_expr(keyword.value),
                })
                .collect(),
            starargs: starargs.map(|expr| Box::new(rewrite_expr(*expr))),
            kwargs: kwargs.map(|expr| Box::new(rewrite_expr(*expr))),
        },

        // lambda args: e  =>  <function <lambda>> returning e
        ExprKind::Lambda { args, body } => {
            let body = vec![Stmt::new(StmtKind::Return(Some(rewrite_expr(*body))))];
            function("<lambda>".to_owned(), args, body).kind
        }

        // [E for t in it if p ...]  =>  <listcomp>([]) with an accumulator
        // parameter `.0` threaded through the loop skeleton.
        ExprKind::ListComp { elt, generators } => {
            let append = Expr::new(ExprKind::Attribute {
                value: Box::new(load(".0")),
                attr: "append".to_owned(),
                ctx: Ctx::Load,
            });
            let mut body = Stmt::new(StmtKind::Expr(call(append, vec![rewrite_expr(*elt)])));
            for generator in generators.into_iter().rev() {
                let Comprehension { target, iter, ifs } = generator;
                for test in ifs.into_iter().rev() {
                    body = Stmt::new(StmtKind::If {
                        test: rewrite_expr(test),
                        body: vec![body],
                        orelse: Vec::new(),
                    });
                }
                body = Stmt::new(StmtKind::For {
                    target: rewrite_expr(target),
                    iter: rewrite_expr(iter),
                    body: vec![body],
                });
            }
            let body = vec![body, Stmt::new(StmtKind::Return(Some(load(".0"))))];
            let args = Arguments {
                args: vec![".0".to_owned()],
                vararg: None,
                kwarg: None,
            };
            let empty_list = Expr::new(ExprKind::List {
                elts: Vec::new(),
                ctx: Ctx::Load,
            });
            ExprKind::Call {
                func: Box::new(function("<listcomp>".to_owned(), args, body)),
                args: vec![empty_list],
                keywords: Vec::new(),
                starargs: None,
                kwargs: None,
            }
        }

        ExprKind::Function(mut func) => {
            func.body = rewrite_body(std::mem::take(&mut func.body));
            ExprKind::Function(func)
        }

        kind @ (ExprKind::Literal(_) | ExprKind::Name { .. }) => kind,
    };
    Expr { line, kind }
}

fn load(id: &str) -> Expr {
    Expr::new(ExprKind::Name {
        id: id.to_owned(),
        ctx: Ctx::Load,
    })
}

fn call(func: Expr, args: Vec<Expr>) -> Expr {
    Expr::new(ExprKind::Call {
        func: Box::new(func),
        args,
        keywords: Vec::new(),
        starargs: None,
        kwargs: None,
    })
}

fn function(name: String, args: Arguments, body: Vec<Stmt>) -> Expr {
    Expr::new(ExprKind::Function(Box::new(FunctionExpr {
        name,
        args,
        body,
        scope_id: 0,
    })))
}

/// Allocates scope ids for `Function` and `ClassDef` nodes; 0 means
/// unassigned, so ids start at 1.
#[derive(Default)]
struct ScopeNumbering {
    next: u32,
}

impl ScopeNumbering {
    fn fresh(&mut self) -> u32 {
        self.next += 1;
        self.next
    }
}

fn repair_body(body: &mut [Stmt], inherited: u32, scopes: &mut ScopeNumbering) {
    let mut line = inherited;
    for stmt in body {
        repair_stmt(stmt, line, scopes);
        line = stmt.line;
    }
}

fn repair_stmt(stmt: &mut Stmt, inherited: u32, scopes: &mut ScopeNumbering) {
    if stmt.line == 0 {
        stmt.line = inherited;
    }
    let line = stmt.line;
    match &mut stmt.kind {
        StmtKind::Expr(expr) | StmtKind::Return(Some(expr)) => repair_expr(expr, line, scopes),
        StmtKind::Assign { targets, value } => {
            for target in targets {
                repair_expr(target, line, scopes);
            }
            repair_expr(value, line, scopes);
        }
        StmtKind::If { test, body, orelse } => {
            repair_expr(test, line, scopes);
            repair_body(body, line, scopes);
            repair_body(orelse, line, scopes);
        }
        StmtKind::While { test, body } => {
            repair_expr(test, line, scopes);
            repair_body(body, line, scopes);
        }
        StmtKind::For { target, iter, body } => {
            repair_expr(target, line, scopes);
            repair_expr(iter, line, scopes);
            repair_body(body, line, scopes);
        }
        StmtKind::Raise { exc, cause } => {
            if let Some(exc) = exc {
                repair_expr(exc, line, scopes);
            }
            if let Some(cause) = cause {
                repair_expr(cause, line, scopes);
            }
        }
        StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        } => {
            repair_body(body, line, scopes);
            for handler in handlers {
                if let Some(class) = &mut handler.class {
                    repair_expr(class, line, scopes);
                }
                repair_body(&mut handler.body, line, scopes);
            }
            repair_body(orelse, line, scopes);
            repair_body(finalbody, line, scopes);
        }
        StmtKind::ClassDef {
            bases,
            body,
            scope_id,
            ..
        } => {
            *scope_id = scopes.fresh();
            for base in bases {
                repair_expr(base, line, scopes);
            }
            repair_body(body, line, scopes);
        }
        StmtKind::FunctionDef {
            args: _,
            body,
            decorators,
            ..
        } => {
            for decorator in decorators {
                repair_expr(decorator, line, scopes);
            }
            repair_body(body, line, scopes);
        }
        StmtKind::Assert { test, msg } => {
            repair_expr(test, line, scopes);
            if let Some(msg) = msg {
                repair_expr(msg, line, scopes);
            }
        }
        StmtKind::Return(None)
        | StmtKind::Break
        | StmtKind::Continue
        | StmtKind::Import(_)
        | StmtKind::ImportFrom { .. }
        | StmtKind::Pass => {}
    }
}

fn repair_expr(expr: &mut Expr, inherited: u32, scopes: &mut ScopeNumbering) {
    if expr.line == 0 {
        expr.line = inherited;
    }
    let line = expr.line;
    match &mut expr.kind {
        ExprKind::UnaryOp { operand, .. } => repair_expr(operand, line, scopes),
        ExprKind::BinOp { left, right, .. } | ExprKind::Compare { left, right, .. } => {
            repair_expr(left, line, scopes);
            repair_expr(right, line, scopes);
        }
        ExprKind::BoolOp { values, .. } => {
            for value in values {
                repair_expr(value, line, scopes);
            }
        }
        ExprKind::IfExp { test, body, orelse } => {
            repair_expr(test, line, scopes);
            repair_expr(body, line, scopes);
            repair_expr(orelse, line, scopes);
        }
        ExprKind::Attribute { value, .. } => repair_expr(value, line, scopes),
        ExprKind::Subscript { value, index, .. } => {
            repair_expr(value, line, scopes);
            repair_expr(index, line, scopes);
        }
        ExprKind::List { elts, .. } | ExprKind::Tuple { elts, .. } => {
            for elt in elts {
                repair_expr(elt, line, scopes);
            }
        }
        ExprKind::Dict { keys, values } => {
            for key in keys {
                repair_expr(key, line, scopes);
            }
            for value in values {
                repair_expr(value, line, scopes);
            }
        }
        ExprKind::Call {
            func,
            args,
            keywords,
            starargs,
            kwargs,
        } => {
            repair_expr(func, line, scopes);
            for arg in args {
                repair_expr(arg, line, scopes);
            }
            for keyword in keywords {
                repair_expr(&mut keyword.value, line, scopes);
            }
            if let Some(starargs) = starargs {
                repair_expr(starargs, line, scopes);
            }
            if let Some(kwargs) = kwargs {
                repair_expr(kwargs, line, scopes);
            }
        }
        ExprKind::Lambda { body, .. } => repair_expr(body, line, scopes),
        ExprKind::ListComp { elt, generators } => {
            repair_expr(elt, line, scopes);
            for generator in generators {
                repair_expr(&mut generator.target, line, scopes);
                repair_expr(&mut generator.iter, line, scopes);
                for test in &mut generator.ifs {
                    repair_expr(test, line, scopes);
                }
            }
        }
        ExprKind::Function(func) => {
            func.scope_id = scopes.fresh();
            repair_body(&mut func.body, line, scopes);
        }
        ExprKind::Literal(_) | ExprKind::Name { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{build, Literal};

    #[test]
    fn assert_becomes_if_raise() {
        let module = desugar(build::module(vec![build::assert(
            build::bool(false),
            Some(build::str("msg")),
        )
        .at(3)]));
        let StmtKind::If { test, body, orelse } = &module.body[0].kind else {
            panic!("expected if, got {:?}", module.body[0]);
        };
        assert_eq!(test.kind, ExprKind::Literal(Literal::Bool(false)));
        assert!(body.is_empty());
        let StmtKind::Raise { exc: Some(exc), .. } = &orelse[0].kind else {
            panic!("expected raise");
        };
        let ExprKind::Call { func, args, .. } = &exc.kind else {
            panic!("expected call");
        };
        assert!(
            matches!(&func.kind, ExprKind::Name { id, ctx: Ctx::Load } if id == "AssertionError")
        );
        assert_eq!(args.len(), 1);
        // Synthesized nodes inherit the assert's line.
        assert_eq!(orelse[0].line, 3);
    }

    #[test]
    fn def_becomes_assignment_of_function() {
        let module = desugar(build::module(vec![build::def(
            "f",
            &["x"],
            vec![build::pass()],
        )]));
        let StmtKind::Assign { targets, value } = &module.body[0].kind else {
            panic!("expected assign");
        };
        assert!(matches!(&targets[0].kind, ExprKind::Name { id, ctx: Ctx::Store } if id == "f"));
        let ExprKind::Function(func) = &value.kind else {
            panic!("expected function node");
        };
        assert_eq!(func.name, "f");
        assert_eq!(func.args.args, vec!["x".to_owned()]);
        assert_ne!(func.scope_id, 0);
    }

    #[test]
    fn decorators_apply_innermost_first() {
        let mut stmt = build::def("f", &[], vec![build::pass()]);
        let StmtKind::FunctionDef { decorators, .. } = &mut stmt.kind else {
            unreachable!();
        };
        *decorators = vec![build::name("d1"), build::name("d2")];
        let module = desugar(build::module(vec![stmt]));
        let StmtKind::Assign { value, .. } = &module.body[0].kind else {
            panic!("expected assign");
        };
        // Outermost call is d1, whose argument is the d2 call.
        let ExprKind::Call { func, args, .. } = &value.kind else {
            panic!("expected call");
        };
        assert!(matches!(&func.kind, ExprKind::Name { id, .. } if id == "d1"));
        let ExprKind::Call { func: inner, args: inner_args, .. } = &args[0].kind else {
            panic!("expected nested call");
        };
        assert!(matches!(&inner.kind, ExprKind::Name { id, .. } if id == "d2"));
        assert!(matches!(inner_args[0].kind, ExprKind::Function(_)));
    }

    #[test]
    fn lambda_becomes_function_with_return() {
        let module = desugar(build::module(vec![build::assign(
            build::store("f"),
            build::lambda(&["x"], build::name("x")),
        )]));
        let StmtKind::Assign { value, .. } = &module.body[0].kind else {
            panic!("expected assign");
        };
        let ExprKind::Function(func) = &value.kind else {
            panic!("expected function node");
        };
        assert_eq!(func.name, "<lambda>");
        assert!(matches!(func.body[0].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn listcomp_becomes_immediately_invoked_function() {
        let comp = Expr::new(ExprKind::ListComp {
            elt: Box::new(build::name("i")),
            generators: vec![Comprehension {
                target: build::store("i"),
                iter: build::call(build::name("range"), vec![build::int(4)]),
                ifs: vec![build::name("p")],
            }],
        });
        let module = desugar(build::module(vec![build::expr_stmt(comp)]));
        let StmtKind::Expr(expr) = &module.body[0].kind else {
            unreachable!();
        };
        let ExprKind::Call { func, args, .. } = &expr.kind else {
            panic!("expected call");
        };
        // The call site passes a fresh empty list.
        assert!(matches!(&args[0].kind, ExprKind::List { elts, .. } if elts.is_empty()));
        let ExprKind::Function(func) = &func.kind else {
            panic!("expected function node");
        };
        assert_eq!(func.name, "<listcomp>");
        assert_eq!(func.args.args, vec![".0".to_owned()]);
        // Outer-first skeleton: for wraps if wraps the append call.
        let StmtKind::For { body, .. } = &func.body[0].kind else {
            panic!("expected for skeleton");
        };
        let StmtKind::If { body: if_body, .. } = &body[0].kind else {
            panic!("expected filter");
        };
        assert!(matches!(&if_body[0].kind, StmtKind::Expr(_)));
        assert!(matches!(&func.body[1].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn scope_ids_are_unique() {
        let module = desugar(build::module(vec![
            build::def("f", &[], vec![build::def("g", &[], vec![build::pass()])]),
            build::class("A", vec![], vec![build::pass()]),
        ]));
        let mut seen = Vec::new();
        collect_ids(&module.body, &mut seen);
        assert_eq!(seen.len(), 3);
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains(&0));
    }

    fn collect_ids(body: &[Stmt], out: &mut Vec<u32>) {
        for stmt in body {
            match &stmt.kind {
                StmtKind::Assign { value, .. } => collect_expr_ids(value, out),
                StmtKind::ClassDef { scope_id, body, .. } => {
                    out.push(*scope_id);
                    collect_ids(body, out);
                }
                StmtKind::Expr(expr) => collect_expr_ids(expr, out),
                _ => {}
            }
        }
    }

    fn collect_expr_ids(expr: &Expr, out: &mut Vec<u32>) {
        if let ExprKind::Function(func) = &expr.kind {
            out.push(func.scope_id);
            collect_ids(&func.body, out);
        }
    }
}
