//! Implement python as a virtual machine with bytecode. This module
//! implements the bytecode structure: the opcode table, operand decoding
//! and the code object that carries them.

use crate::error::CodeError;
use bitflags::bitflags;
use itertools::Itertools;
use std::{collections::BTreeSet, fmt, sync::Arc};

/// Opcodes at or above this value are followed by a 2-byte little-endian operand.
pub const HAVE_ARGUMENT: u8 = 90;

macro_rules! instructions {
    ($($(#[$attr:meta])* $name:ident = $value:literal => $opname:literal,)*) => {
        /// A single bytecode instruction, numbered like the CPython 2 opcode table.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Instruction {
            $($(#[$attr])* $name = $value,)*
        }

        impl Instruction {
            /// The name this opcode is known by in disassembly.
            pub const fn opname(self) -> &'static str {
                match self {
                    $(Self::$name => $opname,)*
                }
            }
        }

        impl TryFrom<u8> for Instruction {
            type Error = CodeError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                Ok(match value {
                    $($value => Self::$name,)*
                    _ => return Err(CodeError::UnknownOpcode(value)),
                })
            }
        }
    };
}

instructions! {
    PopTop = 1 => "POP_TOP",
    RotTwo = 2 => "ROT_TWO",
    RotThree = 3 => "ROT_THREE",
    DupTop = 4 => "DUP_TOP",
    RotFour = 5 => "ROT_FOUR",
    Nop = 9 => "NOP",
    UnaryPositive = 10 => "UNARY_POSITIVE",
    UnaryNegative = 11 => "UNARY_NEGATIVE",
    UnaryNot = 12 => "UNARY_NOT",
    UnaryConvert = 13 => "UNARY_CONVERT",
    UnaryInvert = 15 => "UNARY_INVERT",
    BinaryPower = 19 => "BINARY_POWER",
    BinaryMultiply = 20 => "BINARY_MULTIPLY",
    BinaryDivide = 21 => "BINARY_DIVIDE",
    BinaryModulo = 22 => "BINARY_MODULO",
    BinaryAdd = 23 => "BINARY_ADD",
    BinarySubtract = 24 => "BINARY_SUBTRACT",
    BinarySubscr = 25 => "BINARY_SUBSCR",
    BinaryFloorDivide = 26 => "BINARY_FLOOR_DIVIDE",
    BinaryTrueDivide = 27 => "BINARY_TRUE_DIVIDE",
    InplaceFloorDivide = 28 => "INPLACE_FLOOR_DIVIDE",
    InplaceTrueDivide = 29 => "INPLACE_TRUE_DIVIDE",
    Slice0 = 30 => "SLICE+0",
    Slice1 = 31 => "SLICE+1",
    Slice2 = 32 => "SLICE+2",
    Slice3 = 33 => "SLICE+3",
    StoreSlice0 = 40 => "STORE_SLICE+0",
    StoreSlice1 = 41 => "STORE_SLICE+1",
    StoreSlice2 = 42 => "STORE_SLICE+2",
    StoreSlice3 = 43 => "STORE_SLICE+3",
    DeleteSlice0 = 50 => "DELETE_SLICE+0",
    DeleteSlice1 = 51 => "DELETE_SLICE+1",
    DeleteSlice2 = 52 => "DELETE_SLICE+2",
    DeleteSlice3 = 53 => "DELETE_SLICE+3",
    InplaceAdd = 55 => "INPLACE_ADD",
    InplaceSubtract = 56 => "INPLACE_SUBTRACT",
    InplaceMultiply = 57 => "INPLACE_MULTIPLY",
    InplaceDivide = 58 => "INPLACE_DIVIDE",
    InplaceModulo = 59 => "INPLACE_MODULO",
    StoreSubscr = 60 => "STORE_SUBSCR",
    DeleteSubscr = 61 => "DELETE_SUBSCR",
    BinaryLshift = 62 => "BINARY_LSHIFT",
    BinaryRshift = 63 => "BINARY_RSHIFT",
    BinaryAnd = 64 => "BINARY_AND",
    BinaryXor = 65 => "BINARY_XOR",
    BinaryOr = 66 => "BINARY_OR",
    InplacePower = 67 => "INPLACE_POWER",
    GetIter = 68 => "GET_ITER",
    PrintExpr = 70 => "PRINT_EXPR",
    PrintItem = 71 => "PRINT_ITEM",
    PrintNewline = 72 => "PRINT_NEWLINE",
    PrintItemTo = 73 => "PRINT_ITEM_TO",
    PrintNewlineTo = 74 => "PRINT_NEWLINE_TO",
    InplaceLshift = 75 => "INPLACE_LSHIFT",
    InplaceRshift = 76 => "INPLACE_RSHIFT",
    InplaceAnd = 77 => "INPLACE_AND",
    InplaceXor = 78 => "INPLACE_XOR",
    InplaceOr = 79 => "INPLACE_OR",
    BreakLoop = 80 => "BREAK_LOOP",
    LoadLocals = 82 => "LOAD_LOCALS",
    ReturnValue = 83 => "RETURN_VALUE",
    YieldValue = 86 => "YIELD_VALUE",
    PopBlock = 87 => "POP_BLOCK",
    EndFinally = 88 => "END_FINALLY",
    StoreName = 90 => "STORE_NAME",
    DeleteName = 91 => "DELETE_NAME",
    UnpackSequence = 92 => "UNPACK_SEQUENCE",
    ForIter = 93 => "FOR_ITER",
    StoreAttr = 95 => "STORE_ATTR",
    DeleteAttr = 96 => "DELETE_ATTR",
    StoreGlobal = 97 => "STORE_GLOBAL",
    DeleteGlobal = 98 => "DELETE_GLOBAL",
    DupTopx = 99 => "DUP_TOPX",
    LoadConst = 100 => "LOAD_CONST",
    LoadName = 101 => "LOAD_NAME",
    BuildTuple = 102 => "BUILD_TUPLE",
    BuildList = 103 => "BUILD_LIST",
    BuildMap = 104 => "BUILD_MAP",
    LoadAttr = 105 => "LOAD_ATTR",
    CompareOp = 106 => "COMPARE_OP",
    JumpForward = 110 => "JUMP_FORWARD",
    /// Jumps when the top of the stack is false, leaving it in place.
    JumpIfFalse = 111 => "JUMP_IF_FALSE",
    JumpIfTrue = 112 => "JUMP_IF_TRUE",
    JumpAbsolute = 113 => "JUMP_ABSOLUTE",
    /// Pops the top of the stack and jumps to an absolute offset when it is false.
    PopJumpIfFalse = 114 => "POP_JUMP_IF_FALSE",
    PopJumpIfTrue = 115 => "POP_JUMP_IF_TRUE",
    LoadGlobal = 116 => "LOAD_GLOBAL",
    ContinueLoop = 119 => "CONTINUE_LOOP",
    SetupLoop = 120 => "SETUP_LOOP",
    SetupExcept = 121 => "SETUP_EXCEPT",
    SetupFinally = 122 => "SETUP_FINALLY",
    LoadFast = 124 => "LOAD_FAST",
    StoreFast = 125 => "STORE_FAST",
    DeleteFast = 126 => "DELETE_FAST",
    SetLineno = 127 => "SET_LINENO",
    RaiseVarargs = 130 => "RAISE_VARARGS",
    /// The low byte of the argument counts positional arguments, the next
    /// byte counts keyword pairs.
    CallFunction = 131 => "CALL_FUNCTION",
    MakeFunction = 132 => "MAKE_FUNCTION",
    BuildSlice = 133 => "BUILD_SLICE",
    MakeClosure = 134 => "MAKE_CLOSURE",
    LoadClosure = 135 => "LOAD_CLOSURE",
    LoadDeref = 136 => "LOAD_DEREF",
    StoreDeref = 137 => "STORE_DEREF",
    CallFunctionVar = 140 => "CALL_FUNCTION_VAR",
    CallFunctionKw = 141 => "CALL_FUNCTION_KW",
    CallFunctionVarKw = 142 => "CALL_FUNCTION_VAR_KW",
    /// Prefix that supplies the high 16 bits of the next instruction's operand.
    ExtendedArg = 143 => "EXTENDED_ARG",
}

/// How a jump instruction's operand becomes a byte offset.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JumpKind {
    /// Counted from the end of the jumping instruction.
    Relative,
    Absolute,
}

/// Which table, if any, an instruction's operand refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperandKind {
    None,
    Const,
    Name,
    VarName,
    /// Index into `cellvars` followed by `freevars`.
    Cell,
    Compare,
    Jump(JumpKind),
    /// A count or flag word interpreted by the instruction itself.
    Raw,
}

impl Instruction {
    #[inline]
    pub const fn has_arg(self) -> bool {
        self as u8 >= HAVE_ARGUMENT
    }

    pub const fn operand_kind(self) -> OperandKind {
        use Instruction::*;
        match self {
            LoadConst => OperandKind::Const,
            StoreName | DeleteName | StoreAttr | DeleteAttr | StoreGlobal | DeleteGlobal
            | LoadName | LoadAttr | LoadGlobal => OperandKind::Name,
            LoadFast | StoreFast | DeleteFast => OperandKind::VarName,
            LoadClosure | LoadDeref | StoreDeref => OperandKind::Cell,
            CompareOp => OperandKind::Compare,
            JumpForward | JumpIfFalse | JumpIfTrue | ForIter | SetupLoop | SetupExcept
            | SetupFinally => OperandKind::Jump(JumpKind::Relative),
            JumpAbsolute | PopJumpIfFalse | PopJumpIfTrue | ContinueLoop => {
                OperandKind::Jump(JumpKind::Absolute)
            }
            _ if self.has_arg() => OperandKind::Raw,
            _ => OperandKind::None,
        }
    }

    #[inline]
    pub const fn jump_kind(self) -> Option<JumpKind> {
        match self.operand_kind() {
            OperandKind::Jump(kind) => Some(kind),
            _ => None,
        }
    }

    /// Bytes taken by this instruction when its operand is `arg`, counting
    /// any EXTENDED_ARG prefix.
    pub const fn encoded_size(self, arg: u32) -> usize {
        if !self.has_arg() {
            1
        } else if arg > 0xffff {
            6
        } else {
            3
        }
    }
}

/// A full 32-bit operand, including any EXTENDED_ARG extension.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct OpArg(pub u32);

impl OpArg {
    pub const fn null() -> Self {
        Self(0)
    }

    /// Returns the EXTENDED_ARG payload, if one is needed, and the operand
    /// for the real instruction.
    #[inline]
    pub const fn split(self) -> (Option<u16>, u16) {
        let lo = (self.0 & 0xffff) as u16;
        if self.0 > 0xffff {
            (Some((self.0 >> 16) as u16), lo)
        } else {
            (None, lo)
        }
    }
}

impl From<u32> for OpArg {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

#[derive(Default, Copy, Clone)]
#[repr(transparent)]
pub struct OpArgState {
    state: u32,
}

impl OpArgState {
    #[inline(always)]
    pub fn get(&mut self, op: Instruction, raw: u16) -> OpArg {
        let arg = self.extend(raw);
        if op != Instruction::ExtendedArg {
            self.reset();
        }
        arg
    }

    #[inline(always)]
    pub fn extend(&mut self, raw: u16) -> OpArg {
        self.state = (self.state << 16) | u32::from(raw);
        OpArg(self.state)
    }

    #[inline(always)]
    pub const fn reset(&mut self) {
        self.state = 0
    }
}

pub trait OpArgType: Copy {
    fn from_op_arg(x: u32) -> Option<Self>;

    fn to_op_arg(self) -> u32;
}

macro_rules! op_arg_enum_impl {
    (enum $name:ident { $($(#[$var_attr:meta])* $var:ident = $value:literal,)* }) => {
        impl OpArgType for $name {
            fn to_op_arg(self) -> u32 {
                self as u32
            }

            fn from_op_arg(x: u32) -> Option<Self> {
                Some(match u8::try_from(x).ok()? {
                    $($value => Self::$var,)*
                    _ => return None,
                })
            }
        }
    };
}

macro_rules! op_arg_enum {
    ($(#[$attr:meta])* $vis:vis enum $name:ident { $($(#[$var_attr:meta])* $var:ident = $value:literal,)* }) => {
        $(#[$attr])*
        $vis enum $name {
            $($(#[$var_attr])* $var = $value,)*
        }

        op_arg_enum_impl!(enum $name {
            $($(#[$var_attr])* $var = $value,)*
        });
    };
}

op_arg_enum!(
    /// The comparison performed by COMPARE_OP.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    #[repr(u8)]
    pub enum ComparisonOperator {
        Less = 0,
        LessOrEqual = 1,
        Equal = 2,
        NotEqual = 3,
        Greater = 4,
        GreaterOrEqual = 5,
        In = 6,
        NotIn = 7,
        Is = 8,
        IsNot = 9,
        /// Whether the exception type below the top matches the pattern on top.
        ExceptionMatch = 10,
    }
);

impl ComparisonOperator {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
            Self::Is => "is",
            Self::IsNot => "is not",
            Self::ExceptionMatch => "exception match",
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Less => "lt",
            Self::LessOrEqual => "le",
            Self::Equal => "eq",
            Self::NotEqual => "ne",
            Self::Greater => "gt",
            Self::GreaterOrEqual => "ge",
            Self::In => "contains",
            Self::NotIn => "not_contains",
            Self::Is => "is_",
            Self::IsNot => "is_not",
            Self::ExceptionMatch => "exc_match",
        }
    }
}

impl fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnaryOperator {
    Positive,
    Negative,
    Invert,
    /// Backquote conversion, `repr`.
    Convert,
}

impl UnaryOperator {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Positive => "pos",
            Self::Negative => "neg",
            Self::Invert => "invert",
            Self::Convert => "repr",
        }
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Positive => "unary +",
            Self::Negative => "unary -",
            Self::Invert => "unary ~",
            Self::Convert => "repr",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOperator {
    Power,
    Multiply,
    /// Classic division: floors for integers, true division otherwise.
    Divide,
    TrueDivide,
    FloorDivide,
    Modulo,
    Add,
    Subtract,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
}

impl BinaryOperator {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Power => "pow",
            Self::Multiply => "mul",
            Self::Divide => "div",
            Self::TrueDivide => "truediv",
            Self::FloorDivide => "floordiv",
            Self::Modulo => "mod",
            Self::Add => "add",
            Self::Subtract => "sub",
            Self::Lshift => "lshift",
            Self::Rshift => "rshift",
            Self::And => "and_",
            Self::Xor => "xor",
            Self::Or => "or_",
        }
    }

    pub const fn inplace_name(self) -> &'static str {
        match self {
            Self::Power => "inplace_pow",
            Self::Multiply => "inplace_mul",
            Self::Divide => "inplace_div",
            Self::TrueDivide => "inplace_truediv",
            Self::FloorDivide => "inplace_floordiv",
            Self::Modulo => "inplace_mod",
            Self::Add => "inplace_add",
            Self::Subtract => "inplace_sub",
            Self::Lshift => "inplace_lshift",
            Self::Rshift => "inplace_rshift",
            Self::And => "inplace_and",
            Self::Xor => "inplace_xor",
            Self::Or => "inplace_or",
        }
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Power => "**",
            Self::Multiply => "*",
            Self::Divide | Self::TrueDivide => "/",
            Self::FloorDivide => "//",
            Self::Modulo => "%",
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Lshift => "<<",
            Self::Rshift => ">>",
            Self::And => "&",
            Self::Xor => "^",
            Self::Or => "|",
        }
    }
}

impl fmt::Display for BinaryOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// An entry of a code object's constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstantData {
    None,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ConstantData>),
    Code(Arc<CodeObject>),
}

/// Quote a string the way `repr` does.
pub fn repr_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

impl fmt::Display for ConstantData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Boolean(true) => f.write_str("True"),
            Self::Boolean(false) => f.write_str("False"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Str(s) => f.write_str(&repr_str(s)),
            Self::Tuple(items) if items.len() == 1 => write!(f, "({},)", items[0]),
            Self::Tuple(items) => write!(f, "({})", items.iter().format(", ")),
            Self::Code(code) => write!(
                f,
                "<code object {}, file \"{}\", line {}>",
                code.obj_name, code.source_path, code.first_line_number
            ),
        }
    }
}

impl From<()> for ConstantData {
    fn from((): ()) -> Self {
        Self::None
    }
}

impl From<bool> for ConstantData {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for ConstantData {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<i64> for ConstantData {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for ConstantData {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ConstantData {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<CodeObject> for ConstantData {
    fn from(code: CodeObject) -> Self {
        Self::Code(Arc::new(code))
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct CodeFlags: u16 {
        const NEWLOCALS = 0x0002;
        const VARARGS = 0x0004;
        const VARKEYWORDS = 0x0008;
        const GENERATOR = 0x0020;
    }
}

/// One decoded instruction, with any EXTENDED_ARG prefix folded into `arg`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CodeUnit {
    /// Offset of the first byte, which is the prefix when there is one.
    pub offset: usize,
    pub op: Instruction,
    pub arg: OpArg,
    /// Offset of the following instruction.
    pub next: usize,
}

impl CodeUnit {
    pub const fn jump_target(&self) -> Option<usize> {
        match self.op.jump_kind() {
            Some(JumpKind::Relative) => Some(self.next + self.arg.0 as usize),
            Some(JumpKind::Absolute) => Some(self.arg.0 as usize),
            None => None,
        }
    }
}

fn decode_raw(code: &[u8], offset: usize) -> Result<(Instruction, u16, usize), CodeError> {
    let &byte = code.get(offset).ok_or(CodeError::OutOfBounds(offset))?;
    let op = Instruction::try_from(byte)?;
    if !op.has_arg() {
        return Ok((op, 0, offset + 1));
    }
    match code.get(offset + 1..offset + 3) {
        Some(&[lo, hi]) => Ok((op, u16::from_le_bytes([lo, hi]), offset + 3)),
        _ => Err(CodeError::Truncated(offset)),
    }
}

/// Primarily to compile and run a single instruction stream, the
/// [`CodeObject`] is the static description of a function or module body.
#[derive(Clone, PartialEq)]
pub struct CodeObject {
    pub instructions: Box<[u8]>,
    pub constants: Box<[ConstantData]>,
    pub names: Box<[String]>,
    pub varnames: Box<[String]>,
    pub cellvars: Box<[String]>,
    pub freevars: Box<[String]>,
    pub arg_count: u32,
    pub flags: CodeFlags,
    pub obj_name: String,
    pub source_path: String,
    pub first_line_number: u32,
}

/// Parameter names of a code object, like `inspect.getargs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arguments<'a> {
    pub args: &'a [String],
    pub vararg: Option<&'a str>,
    pub varkwarg: Option<&'a str>,
}

impl CodeObject {
    /// Decode the instruction starting at `offset`.
    pub fn fetch(&self, offset: usize) -> Result<CodeUnit, CodeError> {
        let mut state = OpArgState::default();
        let mut pos = offset;
        loop {
            let (op, raw, next) = decode_raw(&self.instructions, pos)?;
            let arg = state.get(op, raw);
            if op != Instruction::ExtendedArg {
                return Ok(CodeUnit {
                    offset,
                    op,
                    arg,
                    next,
                });
            }
            match self.instructions.get(next) {
                Some(&byte) if byte >= HAVE_ARGUMENT => pos = next,
                _ => return Err(CodeError::DanglingExtendedArg(pos)),
            }
        }
    }

    /// Iterate over the decoded instructions, stopping after the first error.
    pub fn instructions(&self) -> impl Iterator<Item = Result<CodeUnit, CodeError>> + '_ {
        let mut offset = 0;
        let mut failed = false;
        std::iter::from_fn(move || {
            if failed || offset >= self.instructions.len() {
                return None;
            }
            let unit = self.fetch(offset);
            match &unit {
                Ok(unit) => offset = unit.next,
                Err(_) => failed = true,
            }
            Some(unit)
        })
    }

    pub fn arg_names(&self) -> Arguments<'_> {
        let nargs = (self.arg_count as usize).min(self.varnames.len());
        let mut varargs_pos = nargs;
        let vararg = if self.flags.contains(CodeFlags::VARARGS) {
            let vararg = self.varnames.get(varargs_pos).map(String::as_str);
            varargs_pos += 1;
            vararg
        } else {
            None
        };
        let varkwarg = if self.flags.contains(CodeFlags::VARKEYWORDS) {
            self.varnames.get(varargs_pos).map(String::as_str)
        } else {
            None
        };
        Arguments {
            args: &self.varnames[..nargs],
            vararg,
            varkwarg,
        }
    }

    /// Name of cell slot `i`: cell variables first, then free variables.
    pub fn cell_name(&self, i: usize) -> Option<&str> {
        match i.checked_sub(self.cellvars.len()) {
            None => self.cellvars.get(i),
            Some(free) => self.freevars.get(free),
        }
        .map(String::as_str)
    }

    /// Return the offsets targeted by the jumps of this code object.
    pub fn label_targets(&self) -> BTreeSet<usize> {
        self.instructions()
            .filter_map(Result::ok)
            .filter_map(|unit| unit.jump_target())
            .collect()
    }

    /// Check that every operand is in range and every jump lands on an
    /// instruction boundary. Nested code objects are checked too.
    pub fn validate(&self) -> Result<(), CodeError> {
        let slots = self.arg_count as usize
            + usize::from(self.flags.contains(CodeFlags::VARARGS))
            + usize::from(self.flags.contains(CodeFlags::VARKEYWORDS));
        if slots > self.varnames.len() {
            return Err(CodeError::BadSignature(self.obj_name.clone()));
        }

        let mut boundaries = BTreeSet::new();
        let mut jumps = Vec::new();
        for unit in self.instructions() {
            let unit = unit?;
            boundaries.insert(unit.offset);
            let CodeUnit {
                offset, op, arg, ..
            } = unit;
            let index = arg.0;
            let check_index = |kind: &'static str, len: usize| {
                if (index as usize) < len {
                    Ok(())
                } else {
                    Err(CodeError::IndexOutOfRange {
                        kind,
                        index,
                        offset,
                    })
                }
            };
            let invalid = || CodeError::InvalidArgument {
                opname: op.opname(),
                arg: index,
                offset,
            };
            match op.operand_kind() {
                OperandKind::Const => check_index("constant", self.constants.len())?,
                OperandKind::Name => check_index("name", self.names.len())?,
                OperandKind::VarName => check_index("local variable", self.varnames.len())?,
                OperandKind::Cell => {
                    check_index("cell", self.cellvars.len() + self.freevars.len())?
                }
                OperandKind::Compare => {
                    ComparisonOperator::from_op_arg(index).ok_or_else(invalid)?;
                }
                OperandKind::Jump(_) => {
                    if let Some(target) = unit.jump_target() {
                        jumps.push((offset, target));
                    }
                }
                OperandKind::Raw => {
                    let ok = match op {
                        Instruction::RaiseVarargs => index <= 3,
                        Instruction::BuildSlice => matches!(index, 2 | 3),
                        Instruction::DupTopx => (1..=5).contains(&index),
                        Instruction::BuildMap => index == 0,
                        _ => true,
                    };
                    if !ok {
                        return Err(invalid());
                    }
                }
                OperandKind::None => {}
            }
        }

        for (offset, target) in jumps {
            if !boundaries.contains(&target) {
                return Err(CodeError::BadJumpTarget { offset, target });
            }
        }

        for constant in &*self.constants {
            if let ConstantData::Code(code) = constant {
                code.validate()?;
            }
        }
        Ok(())
    }

    fn display_inner(
        &self,
        f: &mut fmt::Formatter<'_>,
        expand_code_objects: bool,
        level: usize,
    ) -> fmt::Result {
        let label_targets = self.label_targets();
        let offset_digits = 4.max(1 + self.instructions.len().max(1).ilog10() as usize);
        for unit in self.instructions() {
            let unit = match unit {
                Ok(unit) => unit,
                Err(err) => return writeln!(f, "{:indent$}<{err}>", "", indent = level * 4),
            };
            write!(f, "{:indent$}", "", indent = level * 4)?;
            let arrow = if label_targets.contains(&unit.offset) {
                ">>"
            } else {
                "  "
            };
            write!(f, "{arrow} {:offset_digits$} ", unit.offset)?;
            self.fmt_instruction(f, unit, expand_code_objects, level)?;
            writeln!(f)?;
        }
        Ok(())
    }

    fn fmt_instruction(
        &self,
        f: &mut fmt::Formatter<'_>,
        unit: CodeUnit,
        expand_code_objects: bool,
        level: usize,
    ) -> fmt::Result {
        const PAD: usize = 20;
        let opname = unit.op.opname();
        if !unit.op.has_arg() {
            return f.write_str(opname);
        }
        let index = unit.arg.0;
        write!(f, "{opname:PAD$} {index:>5}")?;
        let name_in = |table: &[String]| {
            table
                .get(index as usize)
                .map_or_else(|| "<out of range>".to_owned(), Clone::clone)
        };
        match unit.op.operand_kind() {
            OperandKind::Const => match self.constants.get(index as usize) {
                Some(ConstantData::Code(code)) if expand_code_objects => {
                    writeln!(f, " ({}):", ConstantData::Code(code.clone()))?;
                    code.display_inner(f, true, level + 1)?;
                    Ok(())
                }
                Some(constant) => write!(f, " ({constant})"),
                None => write!(f, " (<out of range>)"),
            },
            OperandKind::Name => write!(f, " ({})", name_in(&self.names)),
            OperandKind::VarName => write!(f, " ({})", name_in(&self.varnames)),
            OperandKind::Cell => write!(
                f,
                " ({})",
                self.cell_name(index as usize).unwrap_or("<out of range>")
            ),
            OperandKind::Compare => match ComparisonOperator::from_op_arg(index) {
                Some(op) => write!(f, " ({op})"),
                None => write!(f, " (<invalid>)"),
            },
            OperandKind::Jump(_) => match unit.jump_target() {
                Some(target) => write!(f, " (to {target})"),
                None => Ok(()),
            },
            OperandKind::Raw => Ok(()),
            OperandKind::None => Ok(()),
        }
    }

    /// Recursively display this CodeObject
    pub fn display_expand_code_objects(&self) -> impl fmt::Display + '_ {
        struct Display<'a>(&'a CodeObject);
        impl fmt::Display for Display<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.display_inner(f, true, 1)
            }
        }
        Display(self)
    }
}

impl fmt::Display for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.display_inner(f, false, 0)
    }
}

impl fmt::Debug for CodeObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<code object {} at ??? file {:?}, line {}>",
            self.obj_name, self.source_path, self.first_line_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(instructions: Vec<u8>) -> CodeObject {
        CodeObject {
            instructions: instructions.into_boxed_slice(),
            constants: vec![ConstantData::Integer(3)].into_boxed_slice(),
            names: vec!["x".to_owned()].into_boxed_slice(),
            varnames: Box::default(),
            cellvars: Box::default(),
            freevars: Box::default(),
            arg_count: 0,
            flags: CodeFlags::empty(),
            obj_name: "<module>".to_owned(),
            source_path: "<test>".to_owned(),
            first_line_number: 1,
        }
    }

    #[test]
    fn opcode_table_round_trips() {
        for byte in 0..=u8::MAX {
            if let Ok(op) = Instruction::try_from(byte) {
                assert_eq!(op as u8, byte);
                assert_eq!(op.has_arg(), byte >= HAVE_ARGUMENT);
            }
        }
        assert_eq!(
            Instruction::try_from(84),
            Err(CodeError::UnknownOpcode(84)),
            "IMPORT_STAR is not part of the instruction set"
        );
    }

    #[test]
    fn fetch_reads_little_endian_operand() {
        let code = code(vec![100, 0x34, 0x12, 83]);
        let unit = code.fetch(0).unwrap();
        assert_eq!(unit.op, Instruction::LoadConst);
        assert_eq!(unit.arg, OpArg(0x1234));
        assert_eq!(unit.next, 3);
        assert_eq!(code.fetch(3).unwrap().op, Instruction::ReturnValue);
    }

    #[test]
    fn extended_arg_composes_operand() {
        let code = code(vec![143, 0x01, 0x00, 113, 0x02, 0x00]);
        let unit = code.fetch(0).unwrap();
        assert_eq!(unit.op, Instruction::JumpAbsolute);
        assert_eq!(unit.arg, OpArg(0x0001_0002));
        assert_eq!(unit.offset, 0);
        assert_eq!(unit.next, 6);
    }

    #[test]
    fn decode_errors() {
        assert_eq!(code(vec![100, 0]).fetch(0), Err(CodeError::Truncated(0)));
        assert_eq!(
            code(vec![143, 0, 0, 1]).fetch(0),
            Err(CodeError::DanglingExtendedArg(0))
        );
        assert_eq!(code(vec![1]).fetch(1), Err(CodeError::OutOfBounds(1)));
    }

    #[test]
    fn relative_and_absolute_jumps() {
        let code = code(vec![110, 1, 0, 1, 113, 0, 0]);
        let targets: Vec<_> = code
            .instructions()
            .map(|unit| unit.unwrap().jump_target())
            .collect();
        assert_eq!(targets, [Some(4), None, Some(0)]);
        assert_eq!(code.label_targets(), BTreeSet::from([0, 4]));
    }

    #[test]
    fn validate_rejects_bad_operands() {
        assert!(code(vec![100, 0, 0, 83]).validate().is_ok());
        assert_eq!(
            code(vec![100, 1, 0, 83]).validate(),
            Err(CodeError::IndexOutOfRange {
                kind: "constant",
                index: 1,
                offset: 0
            })
        );
        assert_eq!(
            code(vec![113, 2, 0, 83]).validate(),
            Err(CodeError::BadJumpTarget {
                offset: 0,
                target: 2
            })
        );
        assert!(matches!(
            code(vec![106, 11, 0]).validate(),
            Err(CodeError::InvalidArgument {
                opname: "COMPARE_OP",
                ..
            })
        ));
    }

    #[test]
    fn arg_names_follow_flags() {
        let mut code = code(vec![]);
        code.varnames = ["a", "b", "rest", "kw", "tmp"]
            .map(str::to_owned)
            .into_iter()
            .collect();
        code.arg_count = 2;
        code.flags = CodeFlags::VARARGS | CodeFlags::VARKEYWORDS;
        let args = code.arg_names();
        assert_eq!(args.args, ["a", "b"]);
        assert_eq!(args.vararg, Some("rest"));
        assert_eq!(args.varkwarg, Some("kw"));

        code.flags = CodeFlags::VARKEYWORDS;
        assert_eq!(code.arg_names().vararg, None);
        assert_eq!(code.arg_names().varkwarg, Some("rest"));
    }

    #[test]
    fn constant_repr() {
        let tuple = ConstantData::Tuple(vec![
            ConstantData::Integer(1),
            ConstantData::Str("it's".to_owned()),
        ]);
        assert_eq!(tuple.to_string(), "(1, \"it's\")");
        assert_eq!(
            ConstantData::Tuple(vec![ConstantData::None]).to_string(),
            "(None,)"
        );
        assert_eq!(ConstantData::Float(2.0).to_string(), "2.0");
    }

    #[test]
    fn disassembly_marks_jump_targets() {
        let code = code(vec![100, 0, 0, 90, 0, 0, 113, 0, 0]);
        let text = code.to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with(">>"));
        assert!(lines[0].contains("LOAD_CONST") && lines[0].ends_with("(3)"));
        assert!(lines[1].contains("STORE_NAME") && lines[1].ends_with("(x)"));
        assert!(lines[2].ends_with("(to 0)"));
    }
}
