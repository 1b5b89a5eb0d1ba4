//! Lexical scope analysis.
//!
//! Two phases over the desugared AST: a visit phase records which names each
//! lexical region defines and uses (children are visited in isolation so a
//! nested scope never bleeds into its parent), and a bottom-up analysis
//! classifies every name as a fast local, a cell/free variable, or a
//! runtime-resolved name.
//!
//! Class bodies are "name" scopes: their assignments are not fast locals, so
//! the class namespace stays visible to the build-class machinery at runtime.

use indexmap::{IndexMap, IndexSet};

use crate::ast::{Ctx, Expr, ExprKind, Module, Stmt, StmtKind};

/// How a name reference is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Positional slot in the frame's varnames.
    Fast,
    /// Indirect through a cell; operand indexes `derefvars`.
    Deref,
    /// Looked up by name at runtime (locals, then globals, then builtins).
    Name,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Module,
    Function,
    Class,
}

/// One lexical region and, after analysis, its name classification.
#[derive(Debug)]
pub struct Scope {
    kind: ScopeKind,
    /// Names bound in this region, in first-binding order.
    defs: IndexSet<String>,
    /// Names referenced in this region, in first-use order.
    uses: IndexSet<String>,
    /// Child scopes keyed by the AST node's `scope_id`, in visit order.
    children: IndexMap<u32, Scope>,
    /// `defs` if this is a function scope, else empty.
    local_defs: IndexSet<String>,
    /// Names defined here and referenced by some descendant.
    cellvars: Vec<String>,
    /// Names used here or below but defined in an ancestor.
    freevars: Vec<String>,
}

/// Builds and analyzes the scope tree for a desugared module.
#[must_use]
pub fn top_scope(module: &Module) -> Scope {
    let mut top = Scope::new(ScopeKind::Module);
    top.visit_body(&module.body);
    top.analyze(&IndexSet::new());
    top
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Scope {
            kind,
            defs: IndexSet::new(),
            uses: IndexSet::new(),
            children: IndexMap::new(),
            local_defs: IndexSet::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
        }
    }

    /// Classifies a name reference made from this scope.
    #[must_use]
    pub fn access(&self, name: &str) -> Access {
        if self.derefvars().any(|deref| deref == name) {
            Access::Deref
        } else if self.local_defs.contains(name) {
            Access::Fast
        } else {
            Access::Name
        }
    }

    /// The child scope for a `Function`/`ClassDef` node.
    #[must_use]
    pub fn child(&self, scope_id: u32) -> Option<&Scope> {
        self.children.get(&scope_id)
    }

    #[must_use]
    pub fn cellvars(&self) -> &[String] {
        &self.cellvars
    }

    #[must_use]
    pub fn freevars(&self) -> &[String] {
        &self.freevars
    }

    /// `cellvars ++ freevars`; indexes into this sequence are the DEREF
    /// operand space.
    pub fn derefvars(&self) -> impl Iterator<Item = &str> {
        self.cellvars
            .iter()
            .chain(&self.freevars)
            .map(String::as_str)
    }

    /// Position of `name` in `derefvars`.
    #[must_use]
    pub fn deref_index(&self, name: &str) -> Option<usize> {
        self.derefvars().position(|deref| deref == name)
    }

    // --- phase 1: visit ---

    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Expr(expr) | StmtKind::Return(Some(expr)) => self.visit_expr(expr),
            StmtKind::Assign { targets, value } => {
                for target in targets {
                    self.visit_expr(target);
                }
                self.visit_expr(value);
            }
            StmtKind::If { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_body(body);
                self.visit_body(orelse);
            }
            StmtKind::While { test, body } => {
                self.visit_expr(test);
                self.visit_body(body);
            }
            StmtKind::For { target, iter, body } => {
                self.visit_expr(target);
                self.visit_expr(iter);
                self.visit_body(body);
            }
            StmtKind::Raise { exc, cause } => {
                if let Some(exc) = exc {
                    self.visit_expr(exc);
                }
                if let Some(cause) = cause {
                    self.visit_expr(cause);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                self.visit_body(body);
                for handler in handlers {
                    if let Some(class) = &handler.class {
                        self.visit_expr(class);
                    }
                    if let Some(name) = &handler.name {
                        self.defs.insert(name.clone());
                    }
                    self.visit_body(&handler.body);
                }
                self.visit_body(orelse);
                self.visit_body(finalbody);
            }
            StmtKind::Import(names) => {
                for alias in names {
                    self.defs.insert(alias.binding().to_owned());
                }
            }
            StmtKind::ImportFrom { names, .. } => {
                for alias in names {
                    self.defs.insert(alias.binding().to_owned());
                }
            }
            StmtKind::ClassDef {
                name,
                bases,
                body,
                scope_id,
            } => {
                // The class name binds in the enclosing scope and the bases
                // are evaluated there; only the body gets its own region.
                self.defs.insert(name.clone());
                for base in bases {
                    self.visit_expr(base);
                }
                let mut child = Scope::new(ScopeKind::Class);
                child.visit_body(body);
                self.children.insert(*scope_id, child);
            }
            StmtKind::Return(None)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Pass
            | StmtKind::FunctionDef { .. }
            | StmtKind::Assert { .. } => {}
        }
    }

    fn visit_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Name { id, ctx } => match ctx {
                Ctx::Load => {
                    self.uses.insert(id.clone());
                }
                Ctx::Store => {
                    self.defs.insert(id.clone());
                }
            },
            ExprKind::UnaryOp { operand, .. } => self.visit_expr(operand),
            ExprKind::BinOp { left, right, .. } | ExprKind::Compare { left, right, .. } => {
                self.visit_expr(left);
                self.visit_expr(right);
            }
            ExprKind::BoolOp { values, .. } => {
                for value in values {
                    self.visit_expr(value);
                }
            }
            ExprKind::IfExp { test, body, orelse } => {
                self.visit_expr(test);
                self.visit_expr(body);
                self.visit_expr(orelse);
            }
            ExprKind::Attribute { value, .. } => self.visit_expr(value),
            ExprKind::Subscript { value, index, .. } => {
                self.visit_expr(value);
                self.visit_expr(index);
            }
            ExprKind::List { elts, .. } | ExprKind::Tuple { elts, .. } => {
                for elt in elts {
                    self.visit_expr(elt);
                }
            }
            ExprKind::Dict { keys, values } => {
                for key in keys {
                    self.visit_expr(key);
                }
                for value in values {
                    self.visit_expr(value);
                }
            }
            ExprKind::Call {
                func,
                args,
                keywords,
                starargs,
                kwargs,
            } => {
                self.visit_expr(func);
                for arg in args {
                    self.visit_expr(arg);
                }
                for keyword in keywords {
                    self.visit_expr(&keyword.value);
                }
                if let Some(starargs) = starargs {
                    self.visit_expr(starargs);
                }
                if let Some(kwargs) = kwargs {
                    self.visit_expr(kwargs);
                }
            }
            ExprKind::Function(func) => {
                // Arguments are the child's initial bindings; the body is
                // visited in isolation.
                let mut child = Scope::new(ScopeKind::Function);
                for param in func.args.names() {
                    child.defs.insert(param.to_owned());
                }
                child.visit_body(&func.body);
                self.children.insert(func.scope_id, child);
            }
            ExprKind::Literal(_) | ExprKind::Lambda { .. } | ExprKind::ListComp { .. } => {}
        }
    }

    // --- phase 2: analyze ---

    fn analyze(&mut self, parent_defs: &IndexSet<String>) {
        self.local_defs = if self.kind == ScopeKind::Function {
            self.defs.clone()
        } else {
            IndexSet::new()
        };

        let mut visible: IndexSet<String> = parent_defs.clone();
        visible.extend(self.local_defs.iter().cloned());
        for child in self.children.values_mut() {
            child.analyze(&visible);
        }

        let mut child_uses: IndexSet<String> = IndexSet::new();
        for child in self.children.values() {
            child_uses.extend(child.freevars.iter().cloned());
        }

        self.cellvars = child_uses
            .iter()
            .filter(|name| self.local_defs.contains(*name))
            .cloned()
            .collect();

        let mut all_uses = self.uses.clone();
        all_uses.extend(child_uses);
        self.freevars = all_uses
            .iter()
            .filter(|name| parent_defs.contains(*name) && !self.local_defs.contains(*name))
            .cloned()
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build;
    use crate::desugar::desugar;

    /// Finds the single child scope of `scope`, with its id.
    fn only_child(scope: &Scope) -> (&u32, &Scope) {
        assert_eq!(scope.children.len(), 1, "expected exactly one child scope");
        scope.children.first().unwrap()
    }

    #[test]
    fn module_names_resolve_by_name() {
        let module = desugar(build::module(vec![build::assign(
            build::store("x"),
            build::name("y"),
        )]));
        let top = top_scope(&module);
        assert_eq!(top.access("x"), Access::Name);
        assert_eq!(top.access("y"), Access::Name);
    }

    #[test]
    fn function_parameters_are_fast() {
        let module = desugar(build::module(vec![build::def(
            "f",
            &["a", "b"],
            vec![build::ret(build::name("a"))],
        )]));
        let top = top_scope(&module);
        let (_, f) = only_child(&top);
        assert_eq!(f.access("a"), Access::Fast);
        assert_eq!(f.access("b"), Access::Fast);
        assert_eq!(f.access("print"), Access::Name);
    }

    #[test]
    fn closure_capture_produces_cell_and_free() {
        // def outer():
        //     y = 1
        //     def inner(): return y
        //     return inner()
        let module = desugar(build::module(vec![build::def(
            "outer",
            &[],
            vec![
                build::assign(build::store("y"), build::int(1)),
                build::def("inner", &[], vec![build::ret(build::name("y"))]),
                build::ret(build::call(build::name("inner"), vec![])),
            ],
        )]));
        let top = top_scope(&module);
        let (_, outer) = only_child(&top);
        assert_eq!(outer.cellvars(), &["y".to_owned()]);
        assert!(outer.freevars().is_empty());
        assert_eq!(outer.access("y"), Access::Deref);
        assert_eq!(outer.access("inner"), Access::Fast);

        let (_, inner) = only_child(outer);
        assert_eq!(inner.freevars(), &["y".to_owned()]);
        assert!(inner.cellvars().is_empty());
        assert_eq!(inner.access("y"), Access::Deref);
        assert_eq!(inner.deref_index("y"), Some(0));
    }

    #[test]
    fn class_body_names_resolve_by_name() {
        let module = desugar(build::module(vec![build::class(
            "A",
            vec![],
            vec![build::assign(build::store("attr"), build::int(1))],
        )]));
        let top = top_scope(&module);
        assert_eq!(top.access("A"), Access::Name);
        let (_, class_scope) = only_child(&top);
        assert_eq!(class_scope.access("attr"), Access::Name);
        assert!(class_scope.cellvars().is_empty());
    }

    #[test]
    fn class_body_does_not_shadow_for_methods() {
        // Methods see the module scope, not the class body.
        let module = desugar(build::module(vec![
            build::assign(build::store("x"), build::int(1)),
            build::class(
                "A",
                vec![],
                vec![
                    build::assign(build::store("x"), build::int(2)),
                    build::def("m", &[], vec![build::ret(build::name("x"))]),
                ],
            ),
        ]));
        let top = top_scope(&module);
        let (_, class_scope) = only_child(&top);
        let (_, method) = only_child(class_scope);
        // `x` is not a free variable of the method: the class body defines it
        // only in its namespace scope, and the module binding resolves by name.
        assert!(method.freevars().is_empty());
        assert_eq!(method.access("x"), Access::Name);
    }

    #[test]
    fn import_binds_first_component() {
        let module = desugar(build::module(vec![Stmt::new(StmtKind::Import(vec![
            crate::ast::Alias {
                name: "os.path".to_owned(),
                asname: None,
            },
        ]))]));
        let top = top_scope(&module);
        assert!(top.defs.contains("os"));
    }

    #[test]
    fn deref_space_orders_cells_before_frees() {
        // def a():
        //     u = 1
        //     def b():
        //         v = 2
        //         def c(): return u + v
        //         return c
        //     return b
        let module = desugar(build::module(vec![build::def(
            "a",
            &[],
            vec![
                build::assign(build::store("u"), build::int(1)),
                build::def(
                    "b",
                    &[],
                    vec![
                        build::assign(build::store("v"), build::int(2)),
                        build::def(
                            "c",
                            &[],
                            vec![build::ret(build::binop(
                                build::name("u"),
                                crate::ast::BinKind::Add,
                                build::name("v"),
                            ))],
                        ),
                        build::ret(build::name("c")),
                    ],
                ),
                build::ret(build::name("b")),
            ],
        )]));
        let top = top_scope(&module);
        let (_, a) = only_child(&top);
        let (_, b) = only_child(a);
        // b defines v (cell) and passes u through (free).
        assert_eq!(b.cellvars(), &["v".to_owned()]);
        assert_eq!(b.freevars(), &["u".to_owned()]);
        assert_eq!(b.deref_index("v"), Some(0));
        assert_eq!(b.deref_index("u"), Some(1));
    }
}
