//! Error-path tests across the taxonomy: conformity rejections, runtime
//! exceptions, and fatal VM invariant violations.

use std::cell::RefCell;
use std::rc::Rc;

use adder::ast::{build, BinKind, Module, Stmt, StmtKind};
use adder::bytecode::code::{CodeFlags, CodeObject};
use adder::value::{Namespace, Value};
use adder::{module_from_ast, CompileError, RunError, VirtualMachine, VmError};

fn run_err(module: Module) -> RunError {
    let mut vm = VirtualMachine::new();
    module_from_ast(module, "<test>", "test_module", &mut vm).expect_err("module fails")
}

fn raised_class(err: RunError) -> String {
    match err {
        RunError::Vm(VmError::Raised(record)) => match &record.class {
            Value::Class(class) => class.name.to_string(),
            other => panic!("exception class is not a class: {other:?}"),
        },
        other => panic!("expected a raised exception, got {other}"),
    }
}

#[test]
fn break_outside_loop_is_a_conformity_error() {
    let err = run_err(build::module(vec![Stmt::new(StmtKind::Break).at(2)]));
    assert!(matches!(
        err,
        RunError::Compile(CompileError::Conformity { line: 2, .. })
    ));
}

#[test]
fn store_context_in_expression_position_is_rejected() {
    let err = run_err(build::module(vec![build::assign(
        build::store("a"),
        build::store("b"),
    )]));
    assert!(matches!(err, RunError::Compile(CompileError::Conformity { .. })));
}

#[test]
fn undefined_name_raises_name_error() {
    let err = run_err(build::module(vec![build::assign(
        build::store("x"),
        build::name("missing"),
    )]));
    assert_eq!(raised_class(err), "NameError");
}

#[test]
fn local_read_before_assignment_raises_unbound_local() {
    // def f():
    //     y = x
    //     x = 1
    // f()
    let err = run_err(build::module(vec![
        build::def(
            "f",
            &[],
            vec![
                build::assign(build::store("y"), build::name("x")),
                build::assign(build::store("x"), build::int(1)),
            ],
        ),
        build::expr_stmt(build::call(build::name("f"), vec![])),
    ]));
    assert_eq!(raised_class(err), "UnboundLocalError");
}

#[test]
fn calling_a_non_callable_raises_type_error() {
    let err = run_err(build::module(vec![build::expr_stmt(build::call(
        build::int(3),
        vec![],
    ))]));
    assert_eq!(raised_class(err), "TypeError");
}

#[test]
fn division_by_zero_raises() {
    let err = run_err(build::module(vec![build::assign(
        build::store("x"),
        build::binop(build::int(1), BinKind::Div, build::int(0)),
    )]));
    assert_eq!(raised_class(err), "ZeroDivisionError");
}

#[test]
fn missing_dict_key_raises_key_error() {
    let err = run_err(build::module(vec![build::assign(
        build::store("x"),
        build::subscript(build::dict(vec![]), build::str("k")),
    )]));
    assert_eq!(raised_class(err), "KeyError");
}

#[test]
fn raising_a_non_exception_raises_type_error() {
    let err = run_err(build::module(vec![build::raise(build::int(42))]));
    assert_eq!(raised_class(err), "TypeError");
}

#[test]
fn bare_raise_without_active_exception() {
    let err = run_err(build::module(vec![Stmt::new(StmtKind::Raise {
        exc: None,
        cause: None,
    })]));
    assert_eq!(raised_class(err), "RuntimeError");
}

#[test]
fn wrong_arity_call_raises_type_error() {
    let err = run_err(build::module(vec![
        build::def("f", &["a"], vec![build::ret(build::name("a"))]),
        build::expr_stmt(build::call(build::name("f"), vec![])),
    ]));
    assert_eq!(raised_class(err), "TypeError");
}

#[test]
fn unknown_import_raises_import_error() {
    let err = run_err(build::module(vec![Stmt::new(StmtKind::Import(vec![
        adder::ast::Alias {
            name: "nowhere".to_owned(),
            asname: None,
        },
    ]))]));
    assert_eq!(raised_class(err), "ImportError");
}

#[test]
fn unpack_length_mismatch_raises_value_error() {
    let target = adder::ast::Expr::new(adder::ast::ExprKind::Tuple {
        elts: vec![build::store("a"), build::store("b")],
        ctx: adder::ast::Ctx::Store,
    });
    let err = run_err(build::module(vec![build::assign(
        target,
        build::tuple(vec![build::int(1)]),
    )]));
    assert_eq!(raised_class(err), "ValueError");
}

#[test]
fn generator_opcodes_are_fatal() {
    // A hand-built code object containing YIELD_VALUE, which is outside the
    // implemented dialect, must die with a VirtualMachine error rather than
    // misbehave.
    let code = Rc::new(CodeObject {
        argcount: 0,
        kwonlyargcount: 0,
        nlocals: 0,
        stacksize: 1,
        flags: CodeFlags::NOFREE,
        code: vec![86, 83], // YIELD_VALUE, RETURN_VALUE
        consts: vec![],
        names: vec![],
        varnames: vec![],
        filename: "<raw>".to_owned(),
        name: "<raw>".to_owned(),
        firstlineno: 1,
        lnotab: vec![],
        freevars: vec![],
        cellvars: vec![],
    });
    let mut vm = VirtualMachine::new();
    let globals = Rc::new(RefCell::new(Namespace::default()));
    let err = vm
        .run_code(&code, Rc::clone(&globals), globals)
        .expect_err("unknown opcode");
    assert!(matches!(err, VmError::Fatal(_)), "got: {err:?}");
}

#[test]
fn truncated_bytecode_is_fatal() {
    let code = Rc::new(CodeObject {
        argcount: 0,
        kwonlyargcount: 0,
        nlocals: 0,
        stacksize: 1,
        flags: CodeFlags::NOFREE,
        code: vec![100, 0], // LOAD_CONST missing its second argument byte
        consts: vec![],
        names: vec![],
        varnames: vec![],
        filename: "<raw>".to_owned(),
        name: "<raw>".to_owned(),
        firstlineno: 1,
        lnotab: vec![],
        freevars: vec![],
        cellvars: vec![],
    });
    let mut vm = VirtualMachine::new();
    let globals = Rc::new(RefCell::new(Namespace::default()));
    let err = vm
        .run_code(&code, Rc::clone(&globals), globals)
        .expect_err("truncated code");
    assert!(matches!(err, VmError::Fatal(_)));
}
