//! A small assembler for code objects.
//!
//! Names, local variables and constants are interned as they are first
//! mentioned, and jumps are emitted against [`Label`]s that are patched when
//! the code object is built.

use crate::{
    bytecode::{CodeFlags, CodeObject, ConstantData, Instruction, JumpKind, OpArg},
    error::CodeError,
};
use indexmap::IndexSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Label(pub u32);

#[derive(Debug, Clone, Copy)]
struct JumpFixup {
    label: Label,
    operand_at: usize,
    next: usize,
    kind: JumpKind,
}

#[derive(Debug, Clone)]
pub struct CodeBuilder {
    obj_name: String,
    source_path: String,
    first_line_number: u32,
    arg_count: u32,
    flags: CodeFlags,
    instructions: Vec<u8>,
    constants: Vec<ConstantData>,
    names: IndexSet<String>,
    varnames: IndexSet<String>,
    cellvars: IndexSet<String>,
    freevars: IndexSet<String>,
    labels: Vec<Option<usize>>,
    fixups: Vec<JumpFixup>,
    error: Option<CodeError>,
}

impl CodeBuilder {
    pub fn new(obj_name: impl Into<String>) -> Self {
        Self {
            obj_name: obj_name.into(),
            source_path: "<assembled>".to_owned(),
            first_line_number: 1,
            arg_count: 0,
            flags: CodeFlags::empty(),
            instructions: Vec::new(),
            constants: Vec::new(),
            names: IndexSet::new(),
            varnames: IndexSet::new(),
            cellvars: IndexSet::new(),
            freevars: IndexSet::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            error: None,
        }
    }

    pub fn source_path(mut self, path: impl Into<String>) -> Self {
        self.source_path = path.into();
        self
    }

    pub fn first_line_number(mut self, line: u32) -> Self {
        self.first_line_number = line;
        self
    }

    pub fn flags(mut self, flags: CodeFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Declare the positional parameters. Parameters must be declared before
    /// any other local variable is mentioned.
    pub fn params(mut self, names: &[&str]) -> Self {
        debug_assert!(self.varnames.is_empty(), "parameters must come first");
        self.varnames.extend(names.iter().map(|&name| name.to_owned()));
        self.arg_count = names.len() as u32;
        self.flags |= CodeFlags::NEWLOCALS;
        self
    }

    pub fn varargs(mut self, name: &str) -> Self {
        self.varnames.insert(name.to_owned());
        self.flags |= CodeFlags::VARARGS;
        self
    }

    pub fn varkeywords(mut self, name: &str) -> Self {
        self.varnames.insert(name.to_owned());
        self.flags |= CodeFlags::VARKEYWORDS;
        self
    }

    /// Declare the variables this code keeps in cells for inner functions.
    pub fn cellvars(mut self, names: &[&str]) -> Self {
        self.cellvars
            .extend(names.iter().map(|&name| name.to_owned()));
        self
    }

    /// Declare the variables this code receives from its enclosing scope.
    pub fn freevars(mut self, names: &[&str]) -> Self {
        self.freevars
            .extend(names.iter().map(|&name| name.to_owned()));
        self
    }

    /// Byte offset the next emitted instruction will start at.
    pub fn offset(&self) -> usize {
        self.instructions.len()
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let offset = self.offset();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            debug_assert!(slot.is_none(), "label {} bound twice", label.0);
            *slot = Some(offset);
        }
        self
    }

    pub fn emit(&mut self, op: Instruction) -> &mut Self {
        debug_assert!(!op.has_arg(), "{} takes an argument", op.opname());
        self.instructions.push(op as u8);
        self
    }

    pub fn emit_arg(&mut self, op: Instruction, arg: u32) -> &mut Self {
        debug_assert!(op.has_arg(), "{} takes no argument", op.opname());
        let (ext, lo) = OpArg(arg).split();
        if let Some(hi) = ext {
            self.instructions.push(Instruction::ExtendedArg as u8);
            self.instructions.extend_from_slice(&hi.to_le_bytes());
        }
        self.instructions.push(op as u8);
        self.instructions.extend_from_slice(&lo.to_le_bytes());
        self
    }

    /// Emit a jump to `label`. The operand is always a single 16-bit word.
    pub fn emit_jump(&mut self, op: Instruction, label: Label) -> &mut Self {
        let Some(kind) = op.jump_kind() else {
            debug_assert!(false, "{} is not a jump", op.opname());
            return self;
        };
        let at = self.offset();
        self.instructions.extend_from_slice(&[op as u8, 0, 0]);
        self.fixups.push(JumpFixup {
            label,
            operand_at: at + 1,
            next: at + 3,
            kind,
        });
        self
    }

    pub fn add_const(&mut self, constant: impl Into<ConstantData>) -> u32 {
        self.constants.push(constant.into());
        (self.constants.len() - 1) as u32
    }

    pub fn add_name(&mut self, name: &str) -> u32 {
        self.names.insert_full(name.to_owned()).0 as u32
    }

    pub fn add_varname(&mut self, name: &str) -> u32 {
        self.varnames.insert_full(name.to_owned()).0 as u32
    }

    /// Index of a cell or free variable in the combined cell table.
    pub fn cell_index(&self, name: &str) -> Option<u32> {
        if let Some(i) = self.cellvars.get_index_of(name) {
            return Some(i as u32);
        }
        self.freevars
            .get_index_of(name)
            .map(|i| (self.cellvars.len() + i) as u32)
    }

    pub fn load_const(&mut self, constant: impl Into<ConstantData>) -> &mut Self {
        let idx = self.add_const(constant);
        self.emit_arg(Instruction::LoadConst, idx)
    }

    pub fn emit_name(&mut self, op: Instruction, name: &str) -> &mut Self {
        let idx = self.add_name(name);
        self.emit_arg(op, idx)
    }

    pub fn emit_varname(&mut self, op: Instruction, name: &str) -> &mut Self {
        let idx = self.add_varname(name);
        self.emit_arg(op, idx)
    }

    pub fn emit_cell(&mut self, op: Instruction, name: &str) -> &mut Self {
        match self.cell_index(name) {
            Some(idx) => self.emit_arg(op, idx),
            None => {
                self.error
                    .get_or_insert_with(|| CodeError::UndeclaredCell(name.to_owned()));
                self
            }
        }
    }

    /// Patch every jump, then check the result with [`CodeObject::validate`].
    pub fn build(mut self) -> Result<CodeObject, CodeError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        for fixup in &self.fixups {
            let JumpFixup {
                label,
                operand_at,
                next,
                kind,
            } = *fixup;
            let target = self
                .labels
                .get(label.0 as usize)
                .copied()
                .flatten()
                .ok_or(CodeError::UnboundLabel(label.0))?;
            let value = match kind {
                JumpKind::Relative => target
                    .checked_sub(next)
                    .ok_or(CodeError::BackwardJump(label.0))?,
                JumpKind::Absolute => target,
            };
            let value = u16::try_from(value).map_err(|_| CodeError::JumpTooFar(label.0))?;
            self.instructions[operand_at..operand_at + 2].copy_from_slice(&value.to_le_bytes());
        }

        let code = CodeObject {
            instructions: self.instructions.into_boxed_slice(),
            constants: self.constants.into_boxed_slice(),
            names: self.names.into_iter().collect(),
            varnames: self.varnames.into_iter().collect(),
            cellvars: self.cellvars.into_iter().collect(),
            freevars: self.freevars.into_iter().collect(),
            arg_count: self.arg_count,
            flags: self.flags,
            obj_name: self.obj_name,
            source_path: self.source_path,
            first_line_number: self.first_line_number,
        };
        code.validate()?;
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Instruction::*;

    #[test]
    fn names_are_interned() {
        let mut b = CodeBuilder::new("f");
        assert_eq!(b.add_name("x"), 0);
        assert_eq!(b.add_name("y"), 1);
        assert_eq!(b.add_name("x"), 0);
        b.emit(Nop);
        let code = b.build().unwrap();
        assert_eq!(&*code.names, ["x", "y"]);
    }

    #[test]
    fn forward_and_backward_jumps() {
        let mut b = CodeBuilder::new("loop");
        let top = b.new_label();
        let end = b.new_label();
        b.bind(top);
        b.load_const(true)
            .emit_jump(PopJumpIfFalse, end)
            .emit_jump(JumpAbsolute, top)
            .bind(end);
        b.load_const(ConstantData::None).emit(ReturnValue);
        let code = b.build().unwrap();

        let units: Vec<_> = code.instructions().map(Result::unwrap).collect();
        assert_eq!(units[1].op, PopJumpIfFalse);
        assert_eq!(units[1].jump_target(), Some(9));
        assert_eq!(units[2].jump_target(), Some(0));
    }

    #[test]
    fn large_operand_gets_prefix() {
        let mut b = CodeBuilder::new("big");
        for i in 0..=0x1_0000 {
            b.add_const(i as i64);
        }
        b.emit_arg(LoadConst, 0x1_0000).emit(ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.instructions[0], ExtendedArg as u8);
        let unit = code.fetch(0).unwrap();
        assert_eq!(unit.op, LoadConst);
        assert_eq!(unit.arg, OpArg(0x1_0000));
    }

    #[test]
    fn build_errors() {
        let mut b = CodeBuilder::new("unbound");
        let label = b.new_label();
        b.emit_jump(JumpAbsolute, label);
        assert_eq!(b.build().unwrap_err(), CodeError::UnboundLabel(0));

        let mut b = CodeBuilder::new("backward");
        let label = b.new_label();
        b.bind(label);
        b.emit_jump(JumpForward, label);
        assert_eq!(b.build().unwrap_err(), CodeError::BackwardJump(0));

        let mut b = CodeBuilder::new("cells");
        b.emit_cell(LoadDeref, "x");
        assert_eq!(
            b.build().unwrap_err(),
            CodeError::UndeclaredCell("x".to_owned())
        );
    }

    #[test]
    fn cell_indices_span_both_tables() {
        let b = CodeBuilder::new("f").cellvars(&["a"]).freevars(&["b", "c"]);
        assert_eq!(b.cell_index("a"), Some(0));
        assert_eq!(b.cell_index("c"), Some(2));
        assert_eq!(b.cell_index("d"), None);
    }

    #[test]
    fn signature() {
        let mut b = CodeBuilder::new("f")
            .params(&["a", "b"])
            .varargs("args")
            .varkeywords("kwargs");
        b.emit_varname(LoadFast, "tmp").emit(ReturnValue);
        let code = b.build().unwrap();
        assert_eq!(code.arg_count, 2);
        let args = code.arg_names();
        assert_eq!(args.args, ["a", "b"]);
        assert_eq!(args.vararg, Some("args"));
        assert_eq!(args.varkwarg, Some("kwargs"));
        assert_eq!(code.varnames.len(), 5);
    }
}
