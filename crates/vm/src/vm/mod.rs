//! Execution context shared by the frames of one call stack, and the entry
//! point that runs a frame inside it.

mod interpreter;
mod setting;

pub use interpreter::Interpreter;
pub use setting::Settings;

use crate::{
    exceptions::{ExceptionKind, OpResult},
    frame::{ExecutionResult, Frame},
    space::ObjectSpace,
};
use std::cell::Cell;

/// Per-thread execution state shared by every frame of one call stack.
#[derive(Debug)]
pub struct ExecutionContext {
    pub settings: Settings,
    recursion_depth: Cell<usize>,
}

impl ExecutionContext {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            recursion_depth: Cell::new(0),
        }
    }

    pub fn current_recursion_depth(&self) -> usize {
        self.recursion_depth.get()
    }

    /// Used to run the body of a (possibly) recursive function. It will raise a
    /// RuntimeError if recursive functions are nested far too many times,
    /// preventing a stack overflow.
    pub fn with_recursion<S, R, F>(&self, space: &S, f: F) -> OpResult<R, S::Value>
    where
        S: ObjectSpace,
        F: FnOnce() -> OpResult<R, S::Value>,
    {
        self.check_recursive_call(space)?;
        self.recursion_depth.set(self.recursion_depth.get() + 1);
        let result = f();
        self.recursion_depth.set(self.recursion_depth.get() - 1);
        result
    }

    // To be called right before raising the recursion depth.
    fn check_recursive_call<S: ObjectSpace>(&self, space: &S) -> OpResult<(), S::Value> {
        if self.recursion_depth.get() >= self.settings.recursion_limit {
            Err(space.new_exception(
                ExceptionKind::RuntimeError,
                "maximum recursion depth exceeded".to_owned(),
            ))
        } else {
            Ok(())
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

/// Run `frame` until it returns, yields or raises.
///
/// A frame that yields can be resumed by calling this again after
/// [`Frame::resume`] or [`Frame::throw`].
pub fn run_frame<S: ObjectSpace>(
    space: &S,
    frame: &mut Frame<S::Value>,
) -> OpResult<ExecutionResult<S::Value>, S::Value> {
    let context = space.execution_context();
    context.with_recursion(space, || {
        debug!(
            "call {} at depth {}",
            frame.code.obj_name,
            context.current_recursion_depth()
        );
        let result = frame.run(space);
        match &result {
            Ok(ExecutionResult::Return(value)) => {
                debug!("return from {}: {:?}", frame.code.obj_name, value)
            }
            Ok(ExecutionResult::Yield(value)) => {
                debug!("yield from {}: {:?}", frame.code.obj_name, value)
            }
            Err(err) => debug!(
                "exception leaving {}: {:?}",
                frame.code.obj_name, err.exc_type
            ),
        }
        result
    })
}
