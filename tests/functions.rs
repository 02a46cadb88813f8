mod common;

use common::run_module;
use tinypy::{
    bytecode::{CodeBuilder, CodeFlags, CodeObject, ComparisonOperator, Instruction::*},
    vm::{
        ExceptionKind, ObjectSpace, Settings,
        objspace::{SimpleSpace, Value},
    },
};

const LT: u32 = ComparisonOperator::Less as u32;
const EXC_MATCH: u32 = ComparisonOperator::ExceptionMatch as u32;

/// A module that defines `name` from `code` with `defaults`, then runs `rest`.
fn define(name: &str, code: CodeObject, defaults: &[i64], rest: impl FnOnce(&mut CodeBuilder)) -> CodeObject {
    let mut b = CodeBuilder::new("<module>");
    for &default in defaults {
        b.load_const(default);
    }
    b.load_const(code).emit_arg(MakeFunction, defaults.len() as u32);
    b.emit_name(StoreName, name);
    rest(&mut b);
    b.build().unwrap()
}

fn add_code() -> CodeObject {
    // def add(a, b=10): return a + b
    let mut b = CodeBuilder::new("add").params(&["a", "b"]);
    b.emit_varname(LoadFast, "a").emit_varname(LoadFast, "b").emit(BinaryAdd);
    b.emit(ReturnValue);
    b.build().unwrap()
}

#[test]
fn positional_keyword_and_default_arguments() {
    let space = SimpleSpace::new();
    let module = define("add", add_code(), &[10], |b| {
        // (add(1), add(1, 2), add(b=5, a=1))
        b.emit_name(LoadName, "add").load_const(1).emit_arg(CallFunction, 1);
        b.emit_name(LoadName, "add").load_const(1).load_const(2);
        b.emit_arg(CallFunction, 2);
        b.emit_name(LoadName, "add");
        b.load_const("b").load_const(5).load_const("a").load_const(1);
        b.emit_arg(CallFunction, 2 << 8);
        b.emit_arg(BuildTuple, 3).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    assert_eq!(run.returned().repr(), "(11, 3, 6)");
}

#[test]
fn argument_errors_are_type_errors() {
    let space = SimpleSpace::new();
    let call = |args: &[i64], kwargs: &[(&str, i64)]| {
        let module = define("add", add_code(), &[], |b| {
            b.emit_name(LoadName, "add");
            for &arg in args {
                b.load_const(arg);
            }
            for &(name, value) in kwargs {
                b.load_const(name).load_const(value);
            }
            let argc = args.len() as u32 | (kwargs.len() as u32) << 8;
            b.emit_arg(CallFunction, argc).emit(ReturnValue);
        });
        let run = run_module(&space, module);
        let err = run.result.as_ref().unwrap_err();
        assert!(space.is_exception(err, ExceptionKind::TypeError));
        err.to_string()
    };
    assert_eq!(
        call(&[1], &[]),
        "TypeError: add() takes exactly 2 arguments (1 given)"
    );
    assert_eq!(
        call(&[1, 2, 3], &[]),
        "TypeError: add() takes exactly 2 arguments (3 given)"
    );
    assert_eq!(
        call(&[1, 2], &[("c", 3)]),
        "TypeError: add() got an unexpected keyword argument 'c'"
    );
    assert_eq!(
        call(&[1, 2], &[("a", 3)]),
        "TypeError: add() got multiple values for keyword argument 'a'"
    );
}

#[test]
fn star_args_and_star_kwargs() {
    // def collect(first, *rest, **named): return (first, rest, named)
    // collect(*[1, 2, 3], **{'k': 4})
    let space = SimpleSpace::new();
    let mut f = CodeBuilder::new("collect")
        .params(&["first"])
        .varargs("rest")
        .varkeywords("named");
    f.emit_varname(LoadFast, "first").emit_varname(LoadFast, "rest");
    f.emit_varname(LoadFast, "named").emit_arg(BuildTuple, 3);
    f.emit(ReturnValue);
    let module = define("collect", f.build().unwrap(), &[], |b| {
        b.emit_name(LoadName, "collect");
        b.load_const(1).load_const(2).load_const(3).emit_arg(BuildList, 3);
        b.emit_arg(BuildMap, 0).emit(DupTop).load_const(4).emit(RotTwo);
        b.load_const("k").emit(StoreSubscr);
        b.emit_arg(CallFunctionVarKw, 0).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    assert_eq!(run.returned().repr(), "(1, (2, 3), {'k': 4})");
}

#[test]
fn closures_share_cells() {
    // def make(x):
    //     def get(): return x
    //     def bump(): x = x + 1     (nonlocal through the cell)
    //     return (get, bump)
    // get, bump = make(41)
    // bump()
    // return get()
    let space = SimpleSpace::new();

    let mut get = CodeBuilder::new("get")
        .flags(CodeFlags::NEWLOCALS)
        .freevars(&["x"]);
    get.emit_cell(LoadDeref, "x").emit(ReturnValue);

    let mut bump = CodeBuilder::new("bump")
        .flags(CodeFlags::NEWLOCALS)
        .freevars(&["x"]);
    bump.emit_cell(LoadDeref, "x").load_const(1).emit(BinaryAdd);
    bump.emit_cell(StoreDeref, "x").load_const(()).emit(ReturnValue);

    let mut make = CodeBuilder::new("make").params(&["x"]).cellvars(&["x"]);
    for inner in [get.build().unwrap(), bump.build().unwrap()] {
        make.emit_cell(LoadClosure, "x").emit_arg(BuildTuple, 1);
        make.load_const(inner).emit_arg(MakeClosure, 0);
    }
    make.emit_arg(BuildTuple, 2).emit(ReturnValue);

    let module = define("make", make.build().unwrap(), &[], |b| {
        b.emit_name(LoadName, "make").load_const(41).emit_arg(CallFunction, 1);
        b.emit_arg(UnpackSequence, 2);
        b.emit_name(StoreName, "get").emit_name(StoreName, "bump");
        b.emit_name(LoadName, "bump").emit_arg(CallFunction, 0).emit(PopTop);
        b.emit_name(LoadName, "get").emit_arg(CallFunction, 0).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    assert_eq!(run.returned().as_int(), Some(42));
}

#[test]
fn free_variable_before_assignment() {
    // def outer():
    //     def inner(): return x
    //     r = inner()
    //     x = 1
    let space = SimpleSpace::new();
    let mut inner = CodeBuilder::new("inner")
        .flags(CodeFlags::NEWLOCALS)
        .freevars(&["x"]);
    inner.emit_cell(LoadDeref, "x").emit(ReturnValue);

    let mut outer = CodeBuilder::new("outer").params(&[]).cellvars(&["x"]);
    outer.emit_cell(LoadClosure, "x").emit_arg(BuildTuple, 1);
    outer.load_const(inner.build().unwrap()).emit_arg(MakeClosure, 0);
    outer.emit_arg(CallFunction, 0).emit_varname(StoreFast, "r");
    outer.load_const(1).emit_cell(StoreDeref, "x");
    outer.load_const(()).emit(ReturnValue);

    let module = define("outer", outer.build().unwrap(), &[], |b| {
        b.emit_name(LoadName, "outer").emit_arg(CallFunction, 0).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    let err = run.result.as_ref().unwrap_err();
    assert_eq!(
        err.to_string(),
        "NameError: free variable 'x' referenced before assignment in enclosing scope"
    );
    // inner, outer and the module each add a frame
    let names: Vec<_> = err
        .traceback
        .entries()
        .iter()
        .map(|entry| entry.code_name.as_str())
        .collect();
    assert_eq!(names, ["inner", "outer", "<module>"]);
}

#[test]
fn recursion_limit_raises_runtime_error() {
    // def f(): return f()
    // f()
    let space = SimpleSpace::with_settings(Settings::default().with_recursion_limit(40));
    let mut f = CodeBuilder::new("f").params(&[]);
    f.emit_name(LoadGlobal, "f").emit_arg(CallFunction, 0).emit(ReturnValue);
    let module = define("f", f.build().unwrap(), &[], |b| {
        b.emit_name(LoadName, "f").emit_arg(CallFunction, 0).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    let err = run.result.as_ref().unwrap_err();
    assert_eq!(
        err.to_string(),
        "RuntimeError: maximum recursion depth exceeded"
    );
    assert_eq!(space.execution_context().current_recursion_depth(), 0);
}

fn count_to_code() -> CodeObject {
    // def count_to(n):
    //     i = 0
    //     while i < n:
    //         yield i
    //         i += 1
    let mut b = CodeBuilder::new("count_to")
        .params(&["n"])
        .flags(CodeFlags::GENERATOR);
    let top = b.new_label();
    let exit = b.new_label();
    let end = b.new_label();
    b.load_const(0).emit_varname(StoreFast, "i");
    b.emit_jump(SetupLoop, end);
    b.bind(top);
    b.emit_varname(LoadFast, "i").emit_varname(LoadFast, "n");
    b.emit_arg(CompareOp, LT).emit_jump(PopJumpIfFalse, exit);
    b.emit_varname(LoadFast, "i").emit(YieldValue).emit(PopTop);
    b.emit_varname(LoadFast, "i").load_const(1).emit(InplaceAdd);
    b.emit_varname(StoreFast, "i");
    b.emit_jump(JumpAbsolute, top);
    b.bind(exit);
    b.emit(PopBlock);
    b.bind(end);
    b.load_const(()).emit(ReturnValue);
    b.build().unwrap()
}

#[test]
fn generator_drives_for_loop() {
    // total = 0
    // for i in count_to(5): total += i
    // return (list(count_to(3)), total)
    let space = SimpleSpace::new();
    let module = define("count_to", count_to_code(), &[], |b| {
        let top = b.new_label();
        let done = b.new_label();
        let end = b.new_label();
        b.load_const(0).emit_name(StoreName, "total");
        b.emit_jump(SetupLoop, end);
        b.emit_name(LoadName, "count_to").load_const(5).emit_arg(CallFunction, 1);
        b.emit(GetIter);
        b.bind(top);
        b.emit_jump(ForIter, done);
        b.emit_name(LoadName, "total").emit(RotTwo).emit(InplaceAdd);
        b.emit_name(StoreName, "total");
        b.emit_jump(JumpAbsolute, top);
        b.bind(done);
        b.emit(PopBlock);
        b.bind(end);
        b.emit_name(LoadName, "list");
        b.emit_name(LoadName, "count_to").load_const(3).emit_arg(CallFunction, 1);
        b.emit_arg(CallFunction, 1);
        b.emit_name(LoadName, "total").emit_arg(BuildTuple, 2);
        b.emit(ReturnValue);
    });
    let run = run_module(&space, module);
    assert_eq!(run.returned().repr(), "([0, 1, 2], 10)");
}

#[test]
fn generator_send_and_exhaustion() {
    // def acc():
    //     total = 0
    //     while True:
    //         total += yield total
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("acc")
        .params(&[])
        .flags(CodeFlags::GENERATOR);
    let top = b.new_label();
    b.load_const(0).emit_varname(StoreFast, "total");
    b.bind(top);
    b.emit_varname(LoadFast, "total").emit(DupTop).emit(YieldValue);
    b.emit(InplaceAdd).emit_varname(StoreFast, "total");
    b.emit_jump(JumpAbsolute, top);
    let module = define("acc", b.build().unwrap(), &[], |b| {
        b.emit_name(LoadName, "acc").emit_arg(CallFunction, 0).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    let Value::Generator(acc) = run.returned().clone() else {
        panic!("expected a generator, got {:?}", run.returned());
    };

    let err = acc.send(&space, Value::Int(1)).unwrap_err();
    assert_eq!(
        err.to_string(),
        "TypeError: can't send non-None value to a just-started generator"
    );
    let value = |v: Option<Value>| v.and_then(|v| v.as_int());
    assert_eq!(value(acc.next(&space).unwrap()), Some(0));
    assert_eq!(value(acc.send(&space, Value::Int(5)).unwrap()), Some(5));
    assert_eq!(value(acc.send(&space, Value::Int(2)).unwrap()), Some(7));

    let err = acc.send(&space, Value::str("x")).unwrap_err();
    assert!(space.is_exception(&err, ExceptionKind::TypeError));
    assert!(acc.closed());
    assert!(acc.next(&space).unwrap().is_none());
}

#[test]
fn generator_throw_is_caught_inside() {
    // def g():
    //     try:
    //         yield 1
    //     except ValueError:
    //         yield 'caught'
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("g").params(&[]).flags(CodeFlags::GENERATOR);
    let handler = b.new_label();
    let no_match = b.new_label();
    let done = b.new_label();
    b.emit_jump(SetupExcept, handler);
    b.load_const(1).emit(YieldValue).emit(PopTop);
    b.emit(PopBlock).emit_jump(JumpForward, done);
    b.bind(handler);
    b.emit(DupTop).emit_name(LoadGlobal, "ValueError");
    b.emit_arg(CompareOp, EXC_MATCH).emit_jump(PopJumpIfFalse, no_match);
    b.emit(PopTop).emit(PopTop).emit(PopTop);
    b.load_const("caught").emit(YieldValue).emit(PopTop);
    b.emit_jump(JumpForward, done);
    b.bind(no_match);
    b.emit(EndFinally);
    b.bind(done);
    b.load_const(()).emit(ReturnValue);

    let module = define("g", b.build().unwrap(), &[], |b| {
        b.emit_name(LoadName, "g").emit_arg(CallFunction, 0).emit(ReturnValue);
    });
    let run = run_module(&space, module);
    let Value::Generator(g) = run.returned().clone() else {
        panic!("expected a generator");
    };
    assert_eq!(g.next(&space).unwrap().and_then(|v| v.as_int()), Some(1));
    let thrown = space.new_exception(ExceptionKind::ValueError, "stop".to_owned());
    let caught = g.throw(&space, thrown).unwrap();
    assert_eq!(caught.map(|v| v.to_string()).as_deref(), Some("caught"));
    assert!(g.next(&space).unwrap().is_none());
    assert!(g.closed());

    let thrown = space.new_exception(ExceptionKind::KeyError, "late".to_owned());
    let err = g.throw(&space, thrown).unwrap_err();
    assert_eq!(err.to_string(), "KeyError: 'late'");
}

#[test]
fn yield_outside_generator_is_system_error() {
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    b.load_const(1).emit(YieldValue);
    let code = std::sync::Arc::new(b.build().unwrap());
    let err = space.run_code(code, &space.new_scope()).unwrap_err();
    assert!(space.is_exception(&err, ExceptionKind::SystemError));
}
