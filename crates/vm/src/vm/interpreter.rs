use super::setting::Settings;
use crate::{
    exceptions::OpResult,
    objspace::{SimpleSpace, Value},
};
use std::sync::Arc;
use tinypy_bytecode::CodeObject;

/// The general interface for running code against a [`SimpleSpace`].
///
/// # Examples
/// Runs a tiny program that prints a sum.
/// ```
/// use tinypy_bytecode::{CodeBuilder, Instruction};
/// use tinypy_vm::Interpreter;
///
/// let mut builder = CodeBuilder::new("<module>");
/// builder
///     .load_const(40)
///     .load_const(2)
///     .emit(Instruction::BinaryAdd)
///     .emit(Instruction::PrintItem)
///     .emit(Instruction::PrintNewline)
///     .load_const(())
///     .emit(Instruction::ReturnValue);
/// let code = builder.build().unwrap();
///
/// let interp = Interpreter::new(Default::default());
/// interp.run_code(code.into()).unwrap();
/// assert_eq!(interp.space().output(), "42\n");
/// ```
pub struct Interpreter {
    space: SimpleSpace,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Interpreter {
    pub fn new(settings: Settings) -> Self {
        Self {
            space: SimpleSpace::with_settings(settings),
        }
    }

    pub fn space(&self) -> &SimpleSpace {
        &self.space
    }

    /// Run a function with the object space and return its result.
    ///
    /// `enter` can be called any number of times; state such as printed
    /// output is kept between calls.
    pub fn enter<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&SimpleSpace) -> R,
    {
        f(&self.space)
    }

    /// Run module level code in a fresh namespace and return that namespace.
    pub fn run_code(&self, code: Arc<CodeObject>) -> OpResult<Value, Value> {
        self.enter(|space| {
            let scope = space.new_scope();
            space.run_code(code, &scope)?;
            Ok(scope)
        })
    }

    /// Run `f` and turn an escaping exception into an exit code.
    ///
    /// The exception and its traceback are logged at error level.
    pub fn run<F>(self, f: F) -> u32
    where
        F: FnOnce(&SimpleSpace) -> OpResult<(), Value>,
    {
        match self.enter(f) {
            Ok(()) => 0,
            Err(err) => {
                error!("{}\n{err}", err.traceback);
                1
            }
        }
    }
}
