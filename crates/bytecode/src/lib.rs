//! Bytecode model shared by the tinypy assembler and virtual machine.
//!
//! A [`CodeObject`] holds an encoded instruction stream together with the
//! tables its operands index into. [`CodeBuilder`] assembles one from
//! instructions and labels.

pub mod builder;
pub mod bytecode;
mod error;

pub use builder::{CodeBuilder, Label};
pub use bytecode::{
    Arguments, BinaryOperator, CodeFlags, CodeObject, CodeUnit, ComparisonOperator, ConstantData,
    HAVE_ARGUMENT, Instruction, JumpKind, OpArg, OpArgState, OpArgType, OperandKind,
    UnaryOperator,
};
pub use error::CodeError;
