use crate::{
    exceptions::{ExceptionKind, OpResult, OperationError, TracebackEntry},
    space::ObjectSpace,
};
use itertools::Itertools;
use std::{fmt, sync::Arc};
use tinypy_bytecode::{
    BinaryOperator, CodeObject, ComparisonOperator, ConstantData, Instruction, OpArgType,
    UnaryOperator,
};

#[derive(Clone, Debug)]
struct Block<V> {
    /// The type of block.
    typ: BlockType<V>,
    /// The level of the value stack when the block was entered.
    level: usize,
}

#[derive(Clone, Debug)]
enum BlockType<V> {
    Loop {
        end: usize,
    },
    TryExcept {
        handler: usize,
    },
    Finally {
        handler: usize,
    },

    /// Active finally sequence. `reason` is the signal to re-issue at
    /// END_FINALLY, or `None` when the protected body finished normally.
    FinallyHandler {
        reason: Option<UnwindReason<V>>,
    },
}

impl<V> BlockType<V> {
    fn name(&self) -> &'static str {
        match self {
            Self::Loop { .. } => "loop",
            Self::TryExcept { .. } => "try-except",
            Self::Finally { .. } => "try-finally",
            Self::FinallyHandler { .. } => "finally handler",
        }
    }
}

/// The reason why we might be unwinding a block.
/// This could be return of function, exception being
/// raised, a break or continue being hit, etc..
#[derive(Clone, Debug)]
enum UnwindReason<V> {
    /// We are returning a value from a return statement.
    Returning { value: V },

    /// We hit an exception, so unwind any try-except and finally blocks.
    Raising { exception: OperationError<V> },

    /// An exception this frame already recorded in its traceback is raised
    /// again, by a bare `raise` or at the end of a handler.
    Reraising { exception: OperationError<V> },

    /// We are unwinding blocks, since we hit break
    Break,

    /// We are unwinding blocks since we hit a continue statement.
    Continue { target: usize },

    /// The frame suspends with its stacks intact.
    Yielding { value: V },
}

impl<V> UnwindReason<V> {
    fn name(&self) -> &'static str {
        match self {
            Self::Returning { .. } => "return",
            Self::Raising { .. } => "raise",
            Self::Reraising { .. } => "reraise",
            Self::Break => "break",
            Self::Continue { .. } => "continue",
            Self::Yielding { .. } => "yield",
        }
    }
}

impl<V> From<OperationError<V>> for UnwindReason<V> {
    fn from(exception: OperationError<V>) -> Self {
        Self::Raising { exception }
    }
}

/// How a frame stopped running without raising.
#[derive(Clone, Debug)]
pub enum ExecutionResult<V> {
    Return(V),
    Yield(V),
}

/// A valid execution result, or an exception
type FrameResult<V> = Result<Option<ExecutionResult<V>>, OperationError<V>>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameState {
    Created,
    Running,
    Suspended,
    Finished,
}

pub struct Frame<V> {
    pub code: Arc<CodeObject>,
    stack: Vec<V>,
    blocks: Vec<Block<V>>,
    /// Offset of the next instruction to execute.
    pc: usize,
    /// Offset of the instruction most recently started.
    lasti: usize,
    lineno: u32,
    pub locals: V,
    pub globals: V,
    pub builtins: V,
    /// Cells for `code.cellvars` followed by the closure cells for `code.freevars`.
    cells: Vec<V>,
    /// Interned `code.names`.
    names: Box<[V]>,
    /// Interned `code.varnames`.
    varnames: Box<[V]>,
    /// The exception most recently delivered to a handler, for bare `raise`.
    last_exception: Option<OperationError<V>>,
    /// A signal injected from outside, delivered when the frame next runs.
    pending: Option<UnwindReason<V>>,
    state: FrameState,
}

impl<V: Clone + fmt::Debug> Frame<V> {
    pub fn new<S: ObjectSpace<Value = V>>(
        space: &S,
        code: Arc<CodeObject>,
        globals: V,
        locals: V,
        builtins: V,
        closure: Vec<V>,
    ) -> Self {
        let names = code.names.iter().map(|name| space.new_str(name)).collect();
        let varnames = code.varnames.iter().map(|name| space.new_str(name)).collect();
        let free = closure.len();
        let mut cells: Vec<V> = code.cellvars.iter().map(|_| space.new_cell(None)).collect();
        cells.extend(closure);

        let frame = Self {
            lineno: code.first_line_number,
            code,
            stack: Vec::new(),
            blocks: Vec::new(),
            pc: 0,
            lasti: 0,
            locals,
            globals,
            builtins,
            cells,
            names,
            varnames,
            last_exception: None,
            pending: None,
            state: FrameState::Created,
        };
        if free != frame.code.freevars.len() {
            frame.fatal(format_args!(
                "closure has {free} cells but the code has {} free variables",
                frame.code.freevars.len()
            ));
        }
        frame
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == FrameState::Finished
    }

    pub fn lasti(&self) -> usize {
        self.lasti
    }

    pub fn instruction_pointer(&self) -> usize {
        self.pc
    }

    pub fn lineno(&self) -> u32 {
        self.lineno
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn block_depth(&self) -> usize {
        self.blocks.len()
    }

    /// Deliver `sent` as the result of the YIELD_VALUE the frame is suspended at.
    pub fn resume(&mut self, sent: V) {
        if self.state != FrameState::Suspended {
            self.fatal("resumed a frame that is not suspended");
        }
        self.push_value(sent);
    }

    /// Raise `exception` at the current instruction boundary the next time
    /// the frame runs.
    pub fn throw(&mut self, exception: OperationError<V>) {
        if !matches!(self.state, FrameState::Created | FrameState::Suspended) {
            self.fatal("threw into a frame that cannot run");
        }
        self.pending = Some(UnwindReason::Raising { exception });
    }

    pub(crate) fn run<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
    ) -> OpResult<ExecutionResult<V>, V> {
        match self.state {
            FrameState::Created => {
                self.state = FrameState::Running;
                if let Err(exception) = self.init_cells(space) {
                    return self.finish(Err(exception));
                }
            }
            FrameState::Suspended => self.state = FrameState::Running,
            FrameState::Running => self.fatal("frame is already running"),
            FrameState::Finished => self.fatal("frame has already finished"),
        }

        let mut injected = self.pending.take();
        loop {
            let reason = match injected.take() {
                Some(reason) => reason,
                None => match self.execute_instruction(space) {
                    Ok(()) => continue,
                    Err(reason) => reason,
                },
            };
            match self.handle_signal(space, reason) {
                Ok(None) => {}
                Ok(Some(ExecutionResult::Yield(value))) => {
                    self.state = FrameState::Suspended;
                    return Ok(ExecutionResult::Yield(value));
                }
                Ok(Some(ExecutionResult::Return(value))) => {
                    return self.finish(Ok(ExecutionResult::Return(value)));
                }
                Err(exception) => return self.finish(Err(exception)),
            }
        }
    }

    fn finish(
        &mut self,
        result: OpResult<ExecutionResult<V>, V>,
    ) -> OpResult<ExecutionResult<V>, V> {
        if result.is_ok() && !self.stack.is_empty() {
            warn!(
                "{} returned with {} values left on the stack",
                self.code.obj_name,
                self.stack.len()
            );
        }
        self.stack.clear();
        self.blocks.clear();
        self.state = FrameState::Finished;
        result
    }

    /// Copy parameters that live in cells into those cells.
    fn init_cells<S: ObjectSpace<Value = V>>(&self, space: &S) -> OpResult<(), V> {
        let code = self.code.clone();
        let args = code.arg_names();
        for (cell, name) in self.cells.iter().zip(code.cellvars.iter()) {
            let is_param = args.args.contains(name)
                || args.vararg == Some(name.as_str())
                || args.varkwarg == Some(name.as_str());
            if !is_param {
                continue;
            }
            if let Some(value) = space.lookup(&self.locals, &space.new_str(name))? {
                space.cell_set(cell, Some(value));
            }
        }
        Ok(())
    }

    fn handle_signal<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        reason: UnwindReason<V>,
    ) -> FrameResult<V> {
        let reason = match reason {
            UnwindReason::Raising { mut exception } => {
                exception.traceback.push(self.traceback_entry());
                UnwindReason::Raising { exception }
            }
            UnwindReason::Reraising { exception } => UnwindReason::Raising { exception },
            UnwindReason::Yielding { value } => return Ok(Some(ExecutionResult::Yield(value))),
            reason => reason,
        };
        self.unwind_blocks(space, reason)
    }

    fn traceback_entry(&self) -> TracebackEntry {
        TracebackEntry {
            code_name: self.code.obj_name.clone(),
            source_path: self.code.source_path.clone(),
            offset: self.lasti,
            lineno: self.lineno,
        }
    }

    /// Unwind blocks.
    /// The reason for unwinding is passed in, and the block stack is
    /// searched innermost first for a block that handles it.
    fn unwind_blocks<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        reason: UnwindReason<V>,
    ) -> FrameResult<V> {
        let trace_unwinding = space.execution_context().settings.trace_unwinding;
        while let Some(block) = self.blocks.pop() {
            if trace_unwinding {
                trace!(
                    "{}: unwinding {} through {} block",
                    self.code.obj_name,
                    reason.name(),
                    block.typ.name()
                );
            }
            let level = block.level;
            match block.typ {
                BlockType::Loop { end } => match reason {
                    UnwindReason::Break => {
                        self.stack.truncate(level);
                        self.jump(end);
                        return Ok(None);
                    }
                    UnwindReason::Continue { target } => {
                        // the loop stays active and keeps its iterator
                        self.blocks.push(block);
                        self.jump(target);
                        return Ok(None);
                    }
                    _ => self.stack.truncate(level),
                },
                BlockType::TryExcept { handler } => {
                    self.stack.truncate(level);
                    if let UnwindReason::Raising { exception } = reason {
                        self.enter_except_handler(space, exception, handler);
                        return Ok(None);
                    }
                }
                BlockType::Finally { handler } => {
                    self.stack.truncate(level);
                    if let UnwindReason::Raising { exception } = &reason {
                        self.last_exception = Some(exception.clone());
                    }
                    self.push_block(BlockType::FinallyHandler {
                        reason: Some(reason),
                    });
                    self.jump(handler);
                    return Ok(None);
                }
                BlockType::FinallyHandler { .. } => self.stack.truncate(level),
            }
        }

        // We do not have any more blocks to unwind. Inspect the reason we are here:
        match reason {
            UnwindReason::Returning { value } => Ok(Some(ExecutionResult::Return(value))),
            UnwindReason::Yielding { value } => Ok(Some(ExecutionResult::Yield(value))),
            UnwindReason::Raising { exception } | UnwindReason::Reraising { exception } => {
                Err(exception)
            }
            UnwindReason::Break | UnwindReason::Continue { .. } => {
                self.fatal("break or continue outside of a loop block")
            }
        }
    }

    /// The handler receives traceback, value and type on the operand stack,
    /// type on top. No block tracks the handler itself: it ends by popping
    /// those values, or by END_FINALLY re-raising them.
    fn enter_except_handler<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        exception: OperationError<V>,
        handler: usize,
    ) {
        self.push_value(space.new_traceback(&exception.traceback));
        self.push_value(exception.value.clone());
        self.push_value(exception.exc_type.clone());
        self.last_exception = Some(exception);
        self.jump(handler);
    }

    /// Execute a single instruction.
    fn execute_instruction<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
    ) -> Result<(), UnwindReason<V>> {
        let unit = match self.code.fetch(self.pc) {
            Ok(unit) => unit,
            Err(err) => self.fatal(err),
        };
        self.lasti = unit.offset;
        self.pc = unit.next;
        let arg = unit.arg.0;
        vm_trace!(
            "{}: {:>5} {} {} (stack depth {})",
            self.code.obj_name,
            unit.offset,
            unit.op.opname(),
            arg,
            self.stack.len()
        );

        match unit.op {
            Instruction::PopTop => {
                self.pop_value();
            }
            Instruction::RotTwo => self.rotate(2),
            Instruction::RotThree => self.rotate(3),
            Instruction::RotFour => self.rotate(4),
            Instruction::DupTop => {
                let value = self.top_value().clone();
                self.push_value(value);
            }
            Instruction::DupTopx => {
                let count = arg as usize;
                if !(1..=5).contains(&count) {
                    self.fatal(format_args!("invalid DUP_TOPX count {count}"));
                }
                for _ in 0..count {
                    let value = self.nth_value(count - 1).clone();
                    self.push_value(value);
                }
            }
            Instruction::Nop => {}

            Instruction::UnaryPositive => self.execute_unop(space, UnaryOperator::Positive)?,
            Instruction::UnaryNegative => self.execute_unop(space, UnaryOperator::Negative)?,
            Instruction::UnaryConvert => self.execute_unop(space, UnaryOperator::Convert)?,
            Instruction::UnaryInvert => self.execute_unop(space, UnaryOperator::Invert)?,
            Instruction::UnaryNot => {
                let value = self.pop_value();
                let truth = space.is_true(&value)?;
                self.push_value(space.new_bool(!truth));
            }

            Instruction::BinaryPower => self.execute_binop(space, BinaryOperator::Power, false)?,
            Instruction::BinaryMultiply => {
                self.execute_binop(space, BinaryOperator::Multiply, false)?
            }
            Instruction::BinaryDivide => self.execute_binop(space, BinaryOperator::Divide, false)?,
            Instruction::BinaryTrueDivide => {
                self.execute_binop(space, BinaryOperator::TrueDivide, false)?
            }
            Instruction::BinaryFloorDivide => {
                self.execute_binop(space, BinaryOperator::FloorDivide, false)?
            }
            Instruction::BinaryModulo => self.execute_binop(space, BinaryOperator::Modulo, false)?,
            Instruction::BinaryAdd => self.execute_binop(space, BinaryOperator::Add, false)?,
            Instruction::BinarySubtract => {
                self.execute_binop(space, BinaryOperator::Subtract, false)?
            }
            Instruction::BinaryLshift => self.execute_binop(space, BinaryOperator::Lshift, false)?,
            Instruction::BinaryRshift => self.execute_binop(space, BinaryOperator::Rshift, false)?,
            Instruction::BinaryAnd => self.execute_binop(space, BinaryOperator::And, false)?,
            Instruction::BinaryXor => self.execute_binop(space, BinaryOperator::Xor, false)?,
            Instruction::BinaryOr => self.execute_binop(space, BinaryOperator::Or, false)?,
            Instruction::InplacePower => self.execute_binop(space, BinaryOperator::Power, true)?,
            Instruction::InplaceMultiply => {
                self.execute_binop(space, BinaryOperator::Multiply, true)?
            }
            Instruction::InplaceDivide => self.execute_binop(space, BinaryOperator::Divide, true)?,
            Instruction::InplaceTrueDivide => {
                self.execute_binop(space, BinaryOperator::TrueDivide, true)?
            }
            Instruction::InplaceFloorDivide => {
                self.execute_binop(space, BinaryOperator::FloorDivide, true)?
            }
            Instruction::InplaceModulo => self.execute_binop(space, BinaryOperator::Modulo, true)?,
            Instruction::InplaceAdd => self.execute_binop(space, BinaryOperator::Add, true)?,
            Instruction::InplaceSubtract => {
                self.execute_binop(space, BinaryOperator::Subtract, true)?
            }
            Instruction::InplaceLshift => self.execute_binop(space, BinaryOperator::Lshift, true)?,
            Instruction::InplaceRshift => self.execute_binop(space, BinaryOperator::Rshift, true)?,
            Instruction::InplaceAnd => self.execute_binop(space, BinaryOperator::And, true)?,
            Instruction::InplaceXor => self.execute_binop(space, BinaryOperator::Xor, true)?,
            Instruction::InplaceOr => self.execute_binop(space, BinaryOperator::Or, true)?,

            Instruction::BinarySubscr => {
                let key = self.pop_value();
                let container = self.pop_value();
                let result = space.get_item(&container, &key)?;
                self.push_value(result);
            }
            Instruction::StoreSubscr => {
                let key = self.pop_value();
                let container = self.pop_value();
                let value = self.pop_value();
                space.set_item(&container, &key, value)?;
            }
            Instruction::DeleteSubscr => {
                let key = self.pop_value();
                let container = self.pop_value();
                space.del_item(&container, &key)?;
            }
            Instruction::Slice0 => self.execute_slice(space, false, false)?,
            Instruction::Slice1 => self.execute_slice(space, true, false)?,
            Instruction::Slice2 => self.execute_slice(space, false, true)?,
            Instruction::Slice3 => self.execute_slice(space, true, true)?,
            Instruction::StoreSlice0 => self.execute_store_slice(space, false, false)?,
            Instruction::StoreSlice1 => self.execute_store_slice(space, true, false)?,
            Instruction::StoreSlice2 => self.execute_store_slice(space, false, true)?,
            Instruction::StoreSlice3 => self.execute_store_slice(space, true, true)?,
            Instruction::DeleteSlice0 => self.execute_delete_slice(space, false, false)?,
            Instruction::DeleteSlice1 => self.execute_delete_slice(space, true, false)?,
            Instruction::DeleteSlice2 => self.execute_delete_slice(space, false, true)?,
            Instruction::DeleteSlice3 => self.execute_delete_slice(space, true, true)?,
            Instruction::BuildSlice => {
                let step = match arg {
                    2 => space.none(),
                    3 => self.pop_value(),
                    _ => self.fatal(format_args!("invalid BUILD_SLICE count {arg}")),
                };
                let stop = self.pop_value();
                let start = self.pop_value();
                self.push_value(space.new_slice(start, stop, step));
            }

            Instruction::LoadConst => {
                let value = space.new_constant(self.constant(arg));
                self.push_value(value);
            }
            Instruction::LoadName => self.load_name(space, arg)?,
            Instruction::StoreName => {
                let key = self.name(arg).clone();
                let value = self.pop_value();
                space.set_item(&self.locals, &key, value)?;
            }
            Instruction::DeleteName => {
                let key = self.name(arg).clone();
                if let Err(err) = space.del_item(&self.locals, &key) {
                    return Err(self.map_key_error(space, err, || {
                        space.new_exception(
                            ExceptionKind::NameError,
                            format!("name '{}' is not defined", self.name_str(arg)),
                        )
                    }));
                }
            }
            Instruction::LoadGlobal => self.load_global(space, arg)?,
            Instruction::StoreGlobal => {
                let key = self.name(arg).clone();
                let value = self.pop_value();
                space.set_item(&self.globals, &key, value)?;
            }
            Instruction::DeleteGlobal => {
                let key = self.name(arg).clone();
                if let Err(err) = space.del_item(&self.globals, &key) {
                    return Err(self.map_key_error(space, err, || {
                        space.new_exception(
                            ExceptionKind::NameError,
                            format!("global name '{}' is not defined", self.name_str(arg)),
                        )
                    }));
                }
            }
            Instruction::LoadFast => {
                let key = self.varname(arg).clone();
                match space.lookup(&self.locals, &key)? {
                    Some(value) => self.push_value(value),
                    None => return Err(self.unbound_local(space, arg).into()),
                }
            }
            Instruction::StoreFast => {
                let key = self.varname(arg).clone();
                let value = self.pop_value();
                space.set_item(&self.locals, &key, value)?;
            }
            Instruction::DeleteFast => {
                let key = self.varname(arg).clone();
                if let Err(err) = space.del_item(&self.locals, &key) {
                    return Err(self.map_key_error(space, err, || self.unbound_local(space, arg)));
                }
            }
            Instruction::LoadLocals => {
                let locals = self.locals.clone();
                self.push_value(locals);
            }

            Instruction::LoadClosure => {
                let cell = self.cell(arg).clone();
                self.push_value(cell);
            }
            Instruction::LoadDeref => {
                let cell = self.cell(arg).clone();
                match space.cell_get(&cell) {
                    Some(value) => self.push_value(value),
                    None => return Err(self.unbound_deref(space, arg).into()),
                }
            }
            Instruction::StoreDeref => {
                let value = self.pop_value();
                space.cell_set(self.cell(arg), Some(value));
            }

            Instruction::LoadAttr => {
                let obj = self.pop_value();
                let value = space.get_attr(&obj, self.name_str(arg))?;
                self.push_value(value);
            }
            Instruction::StoreAttr => {
                let obj = self.pop_value();
                let value = self.pop_value();
                space.set_attr(&obj, self.name_str(arg), value)?;
            }
            Instruction::DeleteAttr => {
                let obj = self.pop_value();
                space.del_attr(&obj, self.name_str(arg))?;
            }

            Instruction::BuildTuple => {
                let elements = self.pop_multiple(arg as usize);
                self.push_value(space.new_tuple(elements));
            }
            Instruction::BuildList => {
                let elements = self.pop_multiple(arg as usize);
                self.push_value(space.new_list(elements));
            }
            Instruction::BuildMap => {
                if arg != 0 {
                    self.fatal(format_args!("BUILD_MAP with nonzero argument {arg}"));
                }
                let dict = space.new_dict(Vec::new())?;
                self.push_value(dict);
            }
            Instruction::UnpackSequence => {
                let value = self.pop_value();
                let elements = space.unpack_iterable(&value, arg as usize)?;
                self.stack.extend(elements.into_iter().rev());
            }
            Instruction::CompareOp => self.execute_compare(space, arg)?,

            Instruction::GetIter => {
                let iterable = self.pop_value();
                let iterator = space.get_iter(&iterable)?;
                self.push_value(iterator);
            }
            Instruction::ForIter => {
                let iterator = self.top_value().clone();
                match space.iter_next(&iterator)? {
                    Some(value) => self.push_value(value),
                    None => {
                        // Pop iterator from stack:
                        self.pop_value();
                        self.jump_relative(arg);
                    }
                }
            }

            Instruction::JumpForward => self.jump_relative(arg),
            Instruction::JumpAbsolute => self.jump(arg as usize),
            Instruction::JumpIfFalse => {
                if !space.is_true(self.top_value())? {
                    self.jump_relative(arg);
                }
            }
            Instruction::JumpIfTrue => {
                if space.is_true(self.top_value())? {
                    self.jump_relative(arg);
                }
            }
            Instruction::PopJumpIfFalse => {
                let value = self.pop_value();
                if !space.is_true(&value)? {
                    self.jump(arg as usize);
                }
            }
            Instruction::PopJumpIfTrue => {
                let value = self.pop_value();
                if space.is_true(&value)? {
                    self.jump(arg as usize);
                }
            }

            Instruction::SetupLoop => {
                let end = self.pc + arg as usize;
                self.push_block(BlockType::Loop { end });
            }
            Instruction::SetupExcept => {
                let handler = self.pc + arg as usize;
                self.push_block(BlockType::TryExcept { handler });
            }
            Instruction::SetupFinally => {
                let handler = self.pc + arg as usize;
                self.push_block(BlockType::Finally { handler });
            }
            Instruction::PopBlock => self.execute_pop_block(),
            Instruction::EndFinally => self.execute_end_finally(space)?,
            Instruction::BreakLoop => return Err(UnwindReason::Break),
            Instruction::ContinueLoop => {
                return Err(UnwindReason::Continue {
                    target: arg as usize,
                });
            }

            Instruction::RaiseVarargs => return Err(self.execute_raise(space, arg)),
            Instruction::ReturnValue => {
                let value = self.pop_value();
                return Err(UnwindReason::Returning { value });
            }
            Instruction::YieldValue => {
                let value = self.pop_value();
                return Err(UnwindReason::Yielding { value });
            }

            Instruction::CallFunction => self.execute_call(space, arg, false, false)?,
            Instruction::CallFunctionVar => self.execute_call(space, arg, true, false)?,
            Instruction::CallFunctionKw => self.execute_call(space, arg, false, true)?,
            Instruction::CallFunctionVarKw => self.execute_call(space, arg, true, true)?,
            Instruction::MakeFunction => {
                let code = self.pop_value();
                let defaults = self.pop_multiple(arg as usize);
                let func = space.new_function(code, self.globals.clone(), defaults, None)?;
                self.push_value(func);
            }
            Instruction::MakeClosure => {
                let code = self.pop_value();
                let closure = self.pop_value();
                let defaults = self.pop_multiple(arg as usize);
                let func =
                    space.new_function(code, self.globals.clone(), defaults, Some(closure))?;
                self.push_value(func);
            }

            Instruction::PrintExpr => {
                let value = self.pop_value();
                space.display_hook(&value)?;
            }
            Instruction::PrintItem => {
                let value = self.pop_value();
                space.print_item(None, &value)?;
            }
            Instruction::PrintItemTo => {
                let stream = self.pop_value();
                let value = self.pop_value();
                space.print_item(Some(&stream), &value)?;
            }
            Instruction::PrintNewline => space.print_newline(None)?,
            Instruction::PrintNewlineTo => {
                let stream = self.pop_value();
                space.print_newline(Some(&stream))?;
            }

            Instruction::SetLineno => self.lineno = arg,
            Instruction::ExtendedArg => self.fatal("EXTENDED_ARG reached the dispatcher"),
        }
        Ok(())
    }

    fn execute_unop<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        op: UnaryOperator,
    ) -> OpResult<(), V> {
        let operand = self.pop_value();
        let result = space.unary_op(op, &operand)?;
        self.push_value(result);
        Ok(())
    }

    fn execute_binop<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        op: BinaryOperator,
        inplace: bool,
    ) -> OpResult<(), V> {
        let b = self.pop_value();
        let a = self.pop_value();
        let result = if inplace {
            space.inplace_op(op, &a, &b)?
        } else {
            space.binary_op(op, &a, &b)?
        };
        self.push_value(result);
        Ok(())
    }

    fn execute_compare<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        arg: u32,
    ) -> OpResult<(), V> {
        let op = ComparisonOperator::from_op_arg(arg)
            .unwrap_or_else(|| self.fatal(format_args!("invalid comparison {arg}")));
        let b = self.pop_value();
        let a = self.pop_value();
        let result = match op {
            ComparisonOperator::ExceptionMatch => space.new_bool(space.exception_matches(&a, &b)?),
            _ => space.compare(op, &a, &b)?,
        };
        self.push_value(result);
        Ok(())
    }

    fn slice_bounds<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        has_start: bool,
        has_stop: bool,
    ) -> V {
        let stop = if has_stop {
            self.pop_value()
        } else {
            space.none()
        };
        let start = if has_start {
            self.pop_value()
        } else {
            space.none()
        };
        space.new_slice(start, stop, space.none())
    }

    fn execute_slice<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        has_start: bool,
        has_stop: bool,
    ) -> OpResult<(), V> {
        let slice = self.slice_bounds(space, has_start, has_stop);
        let obj = self.pop_value();
        let result = space.get_item(&obj, &slice)?;
        self.push_value(result);
        Ok(())
    }

    fn execute_store_slice<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        has_start: bool,
        has_stop: bool,
    ) -> OpResult<(), V> {
        let slice = self.slice_bounds(space, has_start, has_stop);
        let obj = self.pop_value();
        let value = self.pop_value();
        space.set_item(&obj, &slice, value)
    }

    fn execute_delete_slice<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        has_start: bool,
        has_stop: bool,
    ) -> OpResult<(), V> {
        let slice = self.slice_bounds(space, has_start, has_stop);
        let obj = self.pop_value();
        space.del_item(&obj, &slice)
    }

    fn load_name<S: ObjectSpace<Value = V>>(&mut self, space: &S, idx: u32) -> OpResult<(), V> {
        let key = self.name(idx).clone();
        let value = match space.lookup(&self.locals, &key)? {
            Some(value) => value,
            None => match self.load_global_or_builtin(space, &key)? {
                Some(value) => value,
                None => {
                    return Err(space.new_exception(
                        ExceptionKind::NameError,
                        format!("name '{}' is not defined", self.name_str(idx)),
                    ));
                }
            },
        };
        self.push_value(value);
        Ok(())
    }

    fn load_global<S: ObjectSpace<Value = V>>(&mut self, space: &S, idx: u32) -> OpResult<(), V> {
        let key = self.name(idx).clone();
        match self.load_global_or_builtin(space, &key)? {
            Some(value) => {
                self.push_value(value);
                Ok(())
            }
            None => Err(space.new_exception(
                ExceptionKind::NameError,
                format!("global name '{}' is not defined", self.name_str(idx)),
            )),
        }
    }

    fn load_global_or_builtin<S: ObjectSpace<Value = V>>(
        &self,
        space: &S,
        key: &V,
    ) -> OpResult<Option<V>, V> {
        if let Some(value) = space.lookup(&self.globals, key)? {
            return Ok(Some(value));
        }
        space.lookup(&self.builtins, key)
    }

    /// Replace a `KeyError` from a namespace deletion with the error `make` builds.
    fn map_key_error<S: ObjectSpace<Value = V>>(
        &self,
        space: &S,
        err: OperationError<V>,
        make: impl FnOnce() -> OperationError<V>,
    ) -> UnwindReason<V> {
        if space.is_exception(&err, ExceptionKind::KeyError) {
            make().into()
        } else {
            err.into()
        }
    }

    #[cold]
    fn unbound_local<S: ObjectSpace<Value = V>>(&self, space: &S, idx: u32) -> OperationError<V> {
        let name = self
            .code
            .varnames
            .get(idx as usize)
            .map_or("?", String::as_str);
        space.new_exception(
            ExceptionKind::UnboundLocalError,
            format!("local variable '{name}' referenced before assignment"),
        )
    }

    #[cold]
    fn unbound_deref<S: ObjectSpace<Value = V>>(&self, space: &S, idx: u32) -> OperationError<V> {
        let i = idx as usize;
        let name = self.code.cell_name(i).unwrap_or("?");
        if i < self.code.cellvars.len() {
            space.new_exception(
                ExceptionKind::UnboundLocalError,
                format!("local variable '{name}' referenced before assignment"),
            )
        } else {
            space.new_exception(
                ExceptionKind::NameError,
                format!("free variable '{name}' referenced before assignment in enclosing scope"),
            )
        }
    }

    fn execute_raise<S: ObjectSpace<Value = V>>(&mut self, space: &S, argc: u32) -> UnwindReason<V> {
        match argc {
            0 => match &self.last_exception {
                Some(exception) => UnwindReason::Reraising {
                    exception: exception.clone(),
                },
                None => space
                    .new_exception(
                        ExceptionKind::TypeError,
                        "exceptions must be old-style classes or derived from BaseException, not NoneType"
                            .to_owned(),
                    )
                    .into(),
            },
            1..=3 => {
                let traceback = if argc == 3 {
                    self.pop_value()
                } else {
                    space.none()
                };
                let value = if argc >= 2 {
                    self.pop_value()
                } else {
                    space.none()
                };
                let exc_type = self.pop_value();
                space.prepare_raise(exc_type, value, traceback).into()
            }
            _ => self.fatal(format_args!("invalid RAISE_VARARGS count {argc}")),
        }
    }

    fn execute_call<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
        argc: u32,
        has_star: bool,
        has_starstar: bool,
    ) -> OpResult<(), V> {
        let n_args = (argc & 0xff) as usize;
        let n_kwargs = ((argc >> 8) & 0xff) as usize;
        let starstar = if has_starstar {
            Some(self.pop_value())
        } else {
            None
        };
        let star = if has_star {
            Some(self.pop_value())
        } else {
            None
        };
        let keywords = self.pop_multiple(2 * n_kwargs);
        let positional = self.pop_multiple(n_args);
        let func = self.pop_value();

        let args = space.concatenate_arguments(positional, star)?;
        let kwargs = space.concatenate_keywords(keywords, starstar)?;
        let result = space.call(&func, args, kwargs)?;
        self.push_value(result);
        Ok(())
    }

    fn execute_pop_block(&mut self) {
        let block = self.pop_block();
        self.stack.truncate(block.level);
        if let BlockType::Finally { .. } = block.typ {
            // the protected body finished; fall into the finally body
            self.push_block(BlockType::FinallyHandler { reason: None });
        }
    }

    fn execute_end_finally<S: ObjectSpace<Value = V>>(
        &mut self,
        space: &S,
    ) -> Result<(), UnwindReason<V>> {
        if self.unmatched_exception_on_top(space) {
            let exc_type = self.pop_value();
            let value = self.pop_value();
            let traceback = self.pop_value();
            let exception = space.prepare_raise(exc_type, value, traceback);
            return Err(UnwindReason::Reraising { exception });
        }
        let block = self.pop_block();
        self.stack.truncate(block.level);
        match block.typ {
            BlockType::FinallyHandler { reason: None } => Ok(()),
            BlockType::FinallyHandler {
                reason: Some(UnwindReason::Raising { exception }),
            } => Err(UnwindReason::Reraising { exception }),
            BlockType::FinallyHandler {
                reason: Some(reason),
            } => Err(reason),
            typ => self.fatal(format_args!(
                "END_FINALLY found a {} block instead of a handler",
                typ.name()
            )),
        }
    }

    /// Whether an except handler fell through to END_FINALLY without a
    /// match, leaving its traceback, value and type above the innermost block.
    fn unmatched_exception_on_top<S: ObjectSpace<Value = V>>(&self, space: &S) -> bool {
        let floor = self.blocks.last().map_or(0, |block| block.level);
        self.stack.len() >= floor + 3
            && self
                .stack
                .last()
                .is_some_and(|value| space.is_exception_class(value))
    }

    fn jump(&mut self, target: usize) {
        self.pc = target;
    }

    fn jump_relative(&mut self, delta: u32) {
        self.pc += delta as usize;
    }

    fn push_block(&mut self, typ: BlockType<V>) {
        self.blocks.push(Block {
            typ,
            level: self.stack.len(),
        });
    }

    #[track_caller]
    fn pop_block(&mut self) -> Block<V> {
        match self.blocks.pop() {
            Some(block) => block,
            None => self.fatal("tried to pop a block off an empty block stack"),
        }
    }

    #[inline]
    fn push_value(&mut self, value: V) {
        self.stack.push(value);
    }

    #[inline]
    #[track_caller]
    fn pop_value(&mut self) -> V {
        match self.stack.pop() {
            Some(value) => value,
            None => self.fatal("tried to pop from empty stack"),
        }
    }

    #[track_caller]
    fn pop_multiple(&mut self, count: usize) -> Vec<V> {
        let stack_len = self.stack.len();
        if count > stack_len {
            self.fatal(format_args!(
                "tried to pop {count} values from a stack of {stack_len}"
            ));
        }
        self.stack.split_off(stack_len - count)
    }

    #[inline]
    #[track_caller]
    fn top_value(&self) -> &V {
        match self.stack.last() {
            Some(value) => value,
            None => self.fatal("tried to get top of stack but stack is empty"),
        }
    }

    /// The value `depth` places below the top of the stack.
    #[track_caller]
    fn nth_value(&self, depth: usize) -> &V {
        let stack_len = self.stack.len();
        if depth >= stack_len {
            self.fatal(format_args!(
                "tried to peek {depth} below the top of a stack of {stack_len}"
            ));
        }
        &self.stack[stack_len - depth - 1]
    }

    /// Move the top of the stack `count - 1` places down, lifting the
    /// values above it by one.
    #[track_caller]
    fn rotate(&mut self, count: usize) {
        let stack_len = self.stack.len();
        if count > stack_len {
            self.fatal(format_args!(
                "tried to rotate {count} values of a stack of {stack_len}"
            ));
        }
        self.stack[stack_len - count..].rotate_right(1);
    }

    #[track_caller]
    fn constant(&self, idx: u32) -> &ConstantData {
        match self.code.constants.get(idx as usize) {
            Some(constant) => constant,
            None => self.fatal(format_args!("constant index {idx} out of range")),
        }
    }

    #[track_caller]
    fn name(&self, idx: u32) -> &V {
        match self.names.get(idx as usize) {
            Some(name) => name,
            None => self.fatal(format_args!("name index {idx} out of range")),
        }
    }

    #[track_caller]
    fn name_str(&self, idx: u32) -> &str {
        match self.code.names.get(idx as usize) {
            Some(name) => name,
            None => self.fatal(format_args!("name index {idx} out of range")),
        }
    }

    #[track_caller]
    fn varname(&self, idx: u32) -> &V {
        match self.varnames.get(idx as usize) {
            Some(name) => name,
            None => self.fatal(format_args!("local variable index {idx} out of range")),
        }
    }

    #[track_caller]
    fn cell(&self, idx: u32) -> &V {
        match self.cells.get(idx as usize) {
            Some(cell) => cell,
            None => self.fatal(format_args!("cell index {idx} out of range")),
        }
    }

    /// Bytecode corruption: the code object broke an invariant the compiler
    /// guarantees. Not catchable by the running program.
    #[cold]
    #[inline(never)]
    #[track_caller]
    fn fatal(&self, msg: impl fmt::Display) -> ! {
        error!(
            "bytecode corruption in {} at offset {}: {msg}",
            self.code.obj_name, self.lasti
        );
        panic!("bytecode corruption: {msg}")
    }
}

impl<V: fmt::Debug> fmt::Debug for Frame<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stack_str = self
            .stack
            .iter()
            .format_with("", |value, f| f(&format_args!("\n  > {value:?}")));
        let block_str = self
            .blocks
            .iter()
            .format_with("", |block, f| {
                f(&format_args!("\n  > {} (level {})", block.typ.name(), block.level))
            });
        write!(
            f,
            "Frame Object {{ {} at {} ({:?})\n Stack:{}\n Blocks:{}\n}}",
            self.code.obj_name, self.lasti, self.state, stack_str, block_str
        )
    }
}
