#![allow(dead_code)]

use std::sync::Arc;
use tinypy::{
    bytecode::CodeObject,
    vm::{
        ExecutionResult, Frame, OpResult,
        objspace::{SimpleSpace, Value},
        run_frame,
    },
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Run {
    pub result: OpResult<ExecutionResult<Value>, Value>,
    pub frame: Frame<Value>,
    pub scope: Value,
}

impl Run {
    /// The returned value; panics when the frame raised or yielded.
    pub fn returned(&self) -> &Value {
        match &self.result {
            Ok(ExecutionResult::Return(value)) => value,
            Ok(ExecutionResult::Yield(value)) => panic!("frame yielded {value:?}"),
            Err(err) => panic!("frame raised {err}\n{}", err.traceback),
        }
    }

    pub fn global(&self, space: &SimpleSpace, name: &str) -> Option<Value> {
        space.scope_get(&self.scope, name)
    }
}

/// Run `code` as a module: globals and locals are one fresh dict.
pub fn run_module(space: &SimpleSpace, code: CodeObject) -> Run {
    init_logging();
    let scope = space.new_scope();
    let mut frame = Frame::new(
        space,
        Arc::new(code),
        scope.clone(),
        scope.clone(),
        space.builtins().clone(),
        Vec::new(),
    );
    let result = run_frame(space, &mut frame);
    Run {
        result,
        frame,
        scope,
    }
}
