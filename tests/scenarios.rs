mod common;

use common::run_module;
use std::sync::Arc;
use tinypy::{
    bytecode::{CodeBuilder, ComparisonOperator, Instruction::*},
    vm::{
        ExceptionKind, ExecutionResult, Frame, ObjectSpace,
        objspace::{SimpleSpace, Value},
        run_frame,
    },
};

const LT: u32 = ComparisonOperator::Less as u32;
const EQ: u32 = ComparisonOperator::Equal as u32;

#[test]
fn scenario_a_store_and_add() {
    // x = 3
    // return x + 4
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    b.load_const(3).emit_name(StoreName, "x");
    b.emit_name(LoadName, "x").load_const(4).emit(BinaryAdd);
    b.emit(ReturnValue);
    let run = run_module(&space, b.build().unwrap());
    assert_eq!(run.returned().as_int(), Some(7));
    assert_eq!(run.global(&space, "x").and_then(|x| x.as_int()), Some(3));
}

#[test]
fn scenario_b_break_restores_stack_depth() {
    // i = 0
    // while i < 3:
    //     i = i + 1
    //     if i == 2:
    //         'junk'; 'junk'   (left on the stack)
    //         break
    // return i
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    let top = b.new_label();
    let exit = b.new_label();
    let end = b.new_label();
    b.load_const(0).emit_name(StoreName, "i");
    b.emit_jump(SetupLoop, end);
    b.bind(top);
    b.emit_name(LoadName, "i").load_const(3).emit_arg(CompareOp, LT);
    b.emit_jump(PopJumpIfFalse, exit);
    b.emit_name(LoadName, "i").load_const(1).emit(BinaryAdd);
    b.emit_name(StoreName, "i");
    b.emit_name(LoadName, "i").load_const(2).emit_arg(CompareOp, EQ);
    b.emit_jump(PopJumpIfFalse, top);
    b.load_const("junk").load_const("junk").emit(BreakLoop);
    b.bind(exit);
    b.emit(PopBlock);
    b.bind(end);
    // with the junk gone this is a one-element tuple
    b.emit_name(LoadName, "i").emit_arg(BuildTuple, 1);
    b.emit(ReturnValue);
    let run = run_module(&space, b.build().unwrap());
    assert_eq!(run.returned().repr(), "(2,)");
    assert_eq!(run.global(&space, "i").and_then(|i| i.as_int()), Some(2));
}

#[test]
fn scenario_c_finally_runs_then_reraises() {
    // log = []
    // try:
    //     raise ValueError
    // finally:
    //     log.append('cleanup')
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    let fin = b.new_label();
    b.emit_arg(BuildList, 0).emit_name(StoreName, "log");
    b.emit_jump(SetupFinally, fin);
    let raise_at = b.offset() + 3;
    b.emit_name(LoadGlobal, "ValueError").emit_arg(RaiseVarargs, 1);
    b.emit(PopBlock);
    b.bind(fin);
    b.emit_name(LoadName, "log").emit_name(LoadAttr, "append");
    b.load_const("cleanup").emit_arg(CallFunction, 1).emit(PopTop);
    b.emit(EndFinally);
    b.load_const(()).emit(ReturnValue);
    let run = run_module(&space, b.build().unwrap());

    let err = run.result.as_ref().unwrap_err();
    assert!(space.is_exception(err, ExceptionKind::ValueError));
    assert_eq!(err.to_string(), "ValueError");
    assert_eq!(err.traceback.len(), 1);
    assert_eq!(err.traceback.entries()[0].offset, raise_at);
    let log = run.global(&space, "log").unwrap();
    assert_eq!(log.repr(), "['cleanup']");
    assert!(run.frame.is_finished());
}

#[test]
fn returning_leaves_an_empty_stack() {
    // a loop and a handler are still active when the return happens
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    let end = b.new_label();
    let handler = b.new_label();
    b.emit_jump(SetupLoop, end);
    b.load_const(1).load_const(2);
    b.emit_jump(SetupExcept, handler);
    b.load_const(3).load_const("result").emit(ReturnValue);
    b.bind(handler);
    b.emit(PopTop).emit(PopTop).emit(PopTop);
    b.emit(PopBlock);
    b.bind(end);
    b.load_const(()).emit(ReturnValue);
    let run = run_module(&space, b.build().unwrap());
    assert_eq!(run.returned().to_string(), "result");
    assert_eq!(run.frame.stack_len(), 0);
    assert_eq!(run.frame.block_depth(), 0);
}

#[test]
fn break_resolves_to_innermost_loop() {
    // log = []
    // for i in [1, 2]:
    //     while True:
    //         try:
    //             try:
    //                 break
    //             finally:
    //                 log.append('f')
    //         except ValueError:
    //             pass
    //     log.append(i)
    // return log
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    let outer_top = b.new_label();
    let outer_done = b.new_label();
    let outer_end = b.new_label();
    let inner_top = b.new_label();
    let inner_end = b.new_label();
    let handler = b.new_label();
    let after_handler = b.new_label();
    let fin = b.new_label();

    b.emit_arg(BuildList, 0).emit_name(StoreName, "log");
    b.emit_jump(SetupLoop, outer_end);
    b.load_const(1).load_const(2).emit_arg(BuildList, 2).emit(GetIter);
    b.bind(outer_top);
    b.emit_jump(ForIter, outer_done);
    b.emit_name(StoreName, "i");

    b.emit_jump(SetupLoop, inner_end);
    b.bind(inner_top);
    b.emit_jump(SetupExcept, handler);
    b.emit_jump(SetupFinally, fin);
    b.emit(BreakLoop);
    b.emit(PopBlock);
    b.bind(fin);
    b.emit_name(LoadName, "log").emit_name(LoadAttr, "append");
    b.load_const("f").emit_arg(CallFunction, 1).emit(PopTop);
    b.emit(EndFinally);
    b.emit(PopBlock).emit_jump(JumpForward, after_handler);
    b.bind(handler);
    b.emit(EndFinally);
    b.bind(after_handler);
    b.emit_jump(JumpAbsolute, inner_top);
    b.emit(PopBlock);
    b.bind(inner_end);

    b.emit_name(LoadName, "log").emit_name(LoadAttr, "append");
    b.emit_name(LoadName, "i").emit_arg(CallFunction, 1).emit(PopTop);
    b.emit_jump(JumpAbsolute, outer_top);
    b.bind(outer_done);
    b.emit(PopBlock);
    b.bind(outer_end);
    b.emit_name(LoadName, "log").emit(ReturnValue);

    let run = run_module(&space, b.build().unwrap());
    assert_eq!(run.returned().repr(), "['f', 1, 'f', 2]");
}

#[test]
fn finally_reraises_original_exception() {
    // try:
    //     raise KeyError('orig')
    // finally:
    //     seen = 1
    let space = SimpleSpace::new();
    let mut b = CodeBuilder::new("<module>");
    let fin = b.new_label();
    b.emit_jump(SetupFinally, fin);
    b.emit_name(LoadGlobal, "KeyError").load_const("orig");
    b.emit_arg(CallFunction, 1).emit_arg(RaiseVarargs, 1);
    b.emit(PopBlock);
    b.bind(fin);
    b.load_const(1).emit_name(StoreName, "seen");
    b.emit(EndFinally);
    b.load_const(()).emit(ReturnValue);
    let run = run_module(&space, b.build().unwrap());

    let err = run.result.as_ref().unwrap_err();
    assert!(matches!(err.exc_type, Value::ExceptionType(ExceptionKind::KeyError)));
    assert_eq!(err.value.repr(), "KeyError('orig',)");
    assert_eq!(err.traceback.len(), 1, "re-raising adds no traceback entry");
    assert!(run.global(&space, "seen").is_some());
}

fn unpack(count: usize, items: &[i64]) -> Result<String, String> {
    // a, b, c = items
    let space = SimpleSpace::new();
    let names = ["a", "b", "c", "d"];
    let mut b = CodeBuilder::new("<module>");
    for &item in items {
        b.load_const(item);
    }
    b.emit_arg(BuildList, items.len() as u32);
    b.emit_arg(UnpackSequence, count as u32);
    for name in &names[..count] {
        b.emit_name(StoreName, name);
    }
    for name in &names[..count] {
        b.emit_name(LoadName, name);
    }
    b.emit_arg(BuildTuple, count as u32).emit(ReturnValue);
    let run = run_module(&space, b.build().unwrap());
    match &run.result {
        Ok(ExecutionResult::Return(value)) => Ok(value.repr()),
        Ok(ExecutionResult::Yield(_)) => unreachable!(),
        Err(err) => Err(err.to_string()),
    }
}

#[test]
fn unpack_sequence_is_exact() {
    assert_eq!(unpack(3, &[1, 2, 3]), Ok("(1, 2, 3)".to_owned()));
    assert_eq!(
        unpack(3, &[1, 2]),
        Err("ValueError: need more than 2 values to unpack".to_owned())
    );
    assert_eq!(
        unpack(3, &[1, 2, 3, 4]),
        Err("ValueError: too many values to unpack".to_owned())
    );
    assert_eq!(
        unpack(2, &[]),
        Err("ValueError: need more than 0 values to unpack".to_owned())
    );
}

#[test]
fn load_name_checks_locals_globals_then_builtins() {
    common::init_logging();
    let space = SimpleSpace::new();
    let globals = space.new_scope();
    let locals = space.new_scope();
    let set = |scope: &Value, name: &str, value: &str| {
        space
            .set_item(scope, &Value::str(name), Value::str(value))
            .unwrap();
    };
    set(&locals, "both", "local");
    set(&globals, "both", "global");
    set(&globals, "only_global", "global");

    let lookup = |name: &str| {
        let mut b = CodeBuilder::new("<class>");
        b.emit_name(LoadName, name).emit(ReturnValue);
        let mut frame = Frame::new(
            &space,
            Arc::new(b.build().unwrap()),
            globals.clone(),
            locals.clone(),
            space.builtins().clone(),
            Vec::new(),
        );
        match run_frame(&space, &mut frame) {
            Ok(ExecutionResult::Return(value)) => value.repr(),
            Ok(ExecutionResult::Yield(_)) => unreachable!(),
            Err(err) => err.to_string(),
        }
    };
    assert_eq!(lookup("both"), "'local'");
    assert_eq!(lookup("only_global"), "'global'");
    assert_eq!(lookup("len"), "<built-in function len>");
    assert_eq!(
        lookup("nowhere"),
        "NameError: name 'nowhere' is not defined"
    );
}
