//! Generators: a suspended frame driven by `send`, `next` and `throw`.

use crate::{
    exceptions::{ExceptionKind, OpResult, OperationError},
    frame::{ExecutionResult, Frame, FrameState},
    space::ObjectSpace,
    vm::run_frame,
};
use std::{
    cell::{Cell, RefCell},
    fmt,
};

pub struct Generator<V> {
    frame: RefCell<Frame<V>>,
    closed: Cell<bool>,
    running: Cell<bool>,
}

impl<V: fmt::Debug> fmt::Debug for Generator<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generator")
            .field("name", &self.name())
            .field("closed", &self.closed.get())
            .field("running", &self.running.get())
            .finish()
    }
}

impl<V: Clone + fmt::Debug> Generator<V> {
    pub fn new(frame: Frame<V>) -> Self {
        Self {
            frame: RefCell::new(frame),
            closed: Cell::new(false),
            running: Cell::new(false),
        }
    }

    fn maybe_close(&self, res: &OpResult<ExecutionResult<V>, V>) {
        match res {
            Ok(ExecutionResult::Return(_)) | Err(_) => self.closed.set(true),
            Ok(ExecutionResult::Yield(_)) => {}
        }
    }

    fn run_with_context<S, F>(&self, space: &S, func: F) -> OpResult<ExecutionResult<V>, V>
    where
        S: ObjectSpace<Value = V>,
        F: FnOnce(&mut Frame<V>) -> OpResult<ExecutionResult<V>, V>,
    {
        if self.running.replace(true) {
            return Err(space.new_exception(
                ExceptionKind::ValueError,
                "generator already executing".to_owned(),
            ));
        }
        let result = func(&mut *self.frame.borrow_mut());
        self.running.set(false);
        self.maybe_close(&result);
        result
    }

    /// Resume the generator, delivering `value` as the result of the
    /// `yield` it is suspended at. `Ok(None)` means the generator finished.
    pub fn send<S: ObjectSpace<Value = V>>(&self, space: &S, value: V) -> OpResult<Option<V>, V> {
        if self.closed.get() {
            return Ok(None);
        }
        if !self.running.get()
            && self.frame.borrow().state() == FrameState::Created
            && !space.is_none(&value)
        {
            return Err(space.new_exception(
                ExceptionKind::TypeError,
                "can't send non-None value to a just-started generator".to_owned(),
            ));
        }
        let result = self.run_with_context(space, |frame| {
            if frame.state() == FrameState::Suspended {
                frame.resume(value);
            }
            run_frame(space, frame)
        });
        Ok(into_iter_return(result?))
    }

    pub fn next<S: ObjectSpace<Value = V>>(&self, space: &S) -> OpResult<Option<V>, V> {
        self.send(space, space.none())
    }

    /// Raise `exception` inside the generator at the `yield` it is
    /// suspended at.
    pub fn throw<S: ObjectSpace<Value = V>>(
        &self,
        space: &S,
        exception: OperationError<V>,
    ) -> OpResult<Option<V>, V> {
        if self.closed.get() {
            return Err(exception);
        }
        let result = self.run_with_context(space, |frame| {
            frame.throw(exception);
            run_frame(space, frame)
        });
        Ok(into_iter_return(result?))
    }
}

impl<V> Generator<V> {
    pub fn running(&self) -> bool {
        self.running.get()
    }

    pub fn closed(&self) -> bool {
        self.closed.get()
    }

    pub fn name(&self) -> String {
        match self.frame.try_borrow() {
            Ok(frame) => frame.code.obj_name.clone(),
            Err(_) => "<running>".to_owned(),
        }
    }
}


fn into_iter_return<V>(result: ExecutionResult<V>) -> Option<V> {
    match result {
        ExecutionResult::Yield(value) => Some(value),
        ExecutionResult::Return(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objspace::{SimpleSpace, Value};
    use std::sync::Arc;
    use tinypy_bytecode::{CodeBuilder, CodeFlags, CodeObject, ConstantData, Instruction::*};

    fn generator(space: &SimpleSpace, code: CodeObject) -> Generator<Value> {
        let scope = space.new_scope();
        let frame = Frame::new(
            space,
            Arc::new(code),
            scope.clone(),
            scope,
            space.builtins().clone(),
            Vec::new(),
        );
        Generator::new(frame)
    }

    /// `x = yield 1; yield x * 10`
    fn echo_code() -> CodeObject {
        let mut b = CodeBuilder::new("echo").flags(CodeFlags::GENERATOR);
        b.load_const(1).emit(YieldValue).emit_name(StoreName, "x");
        b.emit_name(LoadName, "x").load_const(10).emit(BinaryMultiply);
        b.emit(YieldValue).emit(PopTop);
        b.load_const(ConstantData::None).emit(ReturnValue);
        b.build().unwrap()
    }

    #[test]
    fn send_delivers_values() {
        let space = SimpleSpace::new();
        let jen = generator(&space, echo_code());
        assert_eq!(jen.next(&space).unwrap().and_then(|v| v.as_int()), Some(1));
        let second = jen.send(&space, Value::Int(4)).unwrap();
        assert_eq!(second.and_then(|v| v.as_int()), Some(40));
        assert!(!jen.closed());
        assert!(jen.next(&space).unwrap().is_none());
        assert!(jen.closed());
        assert!(jen.next(&space).unwrap().is_none());
        assert_eq!(
            format!("{jen:?}"),
            "Generator { name: \"echo\", closed: true, running: false }"
        );
    }

    #[test]
    fn just_started_rejects_values() {
        let space = SimpleSpace::new();
        let jen = generator(&space, echo_code());
        let err = jen.send(&space, Value::Int(4)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "TypeError: can't send non-None value to a just-started generator"
        );
        assert!(!jen.closed());
    }

    #[test]
    fn throw_unwinds_inside_generator() {
        // try: yield 1
        // except ValueError: yield 2
        let space = SimpleSpace::new();
        let mut b = CodeBuilder::new("catcher").flags(CodeFlags::GENERATOR);
        let handler = b.new_label();
        let done = b.new_label();
        b.emit_jump(SetupExcept, handler);
        b.load_const(1).emit(YieldValue).emit(PopTop);
        b.emit(PopBlock).emit_jump(JumpForward, done);
        b.bind(handler);
        b.emit(PopTop).emit(PopTop).emit(PopTop);
        b.load_const(2).emit(YieldValue).emit(PopTop);
        b.bind(done);
        b.load_const(ConstantData::None).emit(ReturnValue);
        let jen = generator(&space, b.build().unwrap());

        assert_eq!(jen.next(&space).unwrap().and_then(|v| v.as_int()), Some(1));
        let exc = space.new_exception(ExceptionKind::ValueError, "boom".to_owned());
        let caught = jen.throw(&space, exc).unwrap();
        assert_eq!(caught.and_then(|v| v.as_int()), Some(2));

        let exc = space.new_exception(ExceptionKind::KeyError, "again".to_owned());
        let err = jen.throw(&space, exc).unwrap_err();
        assert!(space.is_exception(&err, ExceptionKind::KeyError));
        assert!(jen.closed());

        let exc = space.new_exception(ExceptionKind::KeyError, "closed".to_owned());
        let err = jen.throw(&space, exc).unwrap_err();
        assert_eq!(err.to_string(), "KeyError: 'closed'");
    }
}
