use thiserror::Error;

/// A structural problem in an instruction stream or code object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("instruction pointer {0} is past the end of the code")]
    OutOfBounds(usize),
    #[error("instruction at offset {0} is truncated")]
    Truncated(usize),
    #[error("EXTENDED_ARG at offset {0} is not followed by an argument-taking instruction")]
    DanglingExtendedArg(usize),
    #[error("{kind} index {index} out of range at offset {offset}")]
    IndexOutOfRange {
        kind: &'static str,
        index: u32,
        offset: usize,
    },
    #[error("jump at offset {offset} targets {target}, which is not an instruction boundary")]
    BadJumpTarget { offset: usize, target: usize },
    #[error("invalid argument {arg} for {opname} at offset {offset}")]
    InvalidArgument {
        opname: &'static str,
        arg: u32,
        offset: usize,
    },
    #[error("code object '{0}' declares more parameters than local names")]
    BadSignature(String),
    #[error("label {0} was never bound")]
    UnboundLabel(u32),
    #[error("jump to label {0} does not fit in a 16-bit operand")]
    JumpTooFar(u32),
    #[error("relative jump to label {0} goes backwards")]
    BackwardJump(u32),
    #[error("'{0}' is not a cell or free variable")]
    UndeclaredCell(String),
}
