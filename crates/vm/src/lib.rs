//! This crate contains most of the tinypy runtime: frames with their
//! operand and block stacks, the instruction dispatcher, and the
//! [`ObjectSpace`] trait through which every operation on values is
//! performed.
//!
//! Some stuff to look at:
//! - [`frame::Frame`] and [`run_frame`] for execution
//! - [`objspace::SimpleSpace`] for a complete object space to run code against

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

pub mod exceptions;
pub mod frame;
pub mod function;
pub mod generator;
pub mod objspace;
mod space;
pub mod vm;

pub use tinypy_bytecode as bytecode;

pub use self::exceptions::{ExceptionKind, OpResult, OperationError, Traceback, TracebackEntry};
pub use self::frame::{ExecutionResult, Frame};
pub use self::function::{ArgumentError, FuncArgs, bind_arguments};
pub use self::generator::Generator;
pub use self::space::ObjectSpace;
pub use self::vm::{ExecutionContext, Interpreter, Settings, run_frame};
