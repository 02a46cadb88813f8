use crate::{
    exceptions::{ExceptionKind, OpResult, OperationError, Traceback},
    vm::ExecutionContext,
};
use itertools::Itertools;
use std::fmt;
use tinypy_bytecode::{BinaryOperator, ComparisonOperator, ConstantData, UnaryOperator};

/// Everything the interpreter needs to know about values.
///
/// The frame never looks inside a [`ObjectSpace::Value`]; it only moves
/// values between its stacks and hands them to these operations. Any
/// operation may fail with an [`OperationError`], which the frame raises.
pub trait ObjectSpace: Sized {
    type Value: Clone + fmt::Debug;

    fn execution_context(&self) -> &ExecutionContext;

    fn none(&self) -> Self::Value;
    fn is_none(&self, value: &Self::Value) -> bool;
    fn new_bool(&self, value: bool) -> Self::Value;
    fn new_str(&self, value: &str) -> Self::Value;
    fn new_constant(&self, constant: &ConstantData) -> Self::Value;
    fn new_tuple(&self, items: Vec<Self::Value>) -> Self::Value;
    fn new_list(&self, items: Vec<Self::Value>) -> Self::Value;
    fn new_dict(
        &self,
        pairs: Vec<(Self::Value, Self::Value)>,
    ) -> OpResult<Self::Value, Self::Value>;
    fn new_slice(
        &self,
        start: Self::Value,
        stop: Self::Value,
        step: Self::Value,
    ) -> Self::Value;
    /// Build a function from a code value, its globals, default values and
    /// an optional tuple of closure cells.
    fn new_function(
        &self,
        code: Self::Value,
        globals: Self::Value,
        defaults: Vec<Self::Value>,
        closure: Option<Self::Value>,
    ) -> OpResult<Self::Value, Self::Value>;

    fn new_cell(&self, contents: Option<Self::Value>) -> Self::Value;
    fn cell_get(&self, cell: &Self::Value) -> Option<Self::Value>;
    fn cell_set(&self, cell: &Self::Value, contents: Option<Self::Value>);

    fn exception_type(&self, kind: ExceptionKind) -> Self::Value;
    fn new_exception(&self, kind: ExceptionKind, msg: String) -> OperationError<Self::Value>;
    fn new_traceback(&self, traceback: &Traceback) -> Self::Value;
    /// Whether `exc_type` matches an `except` clause naming `pattern`.
    fn exception_matches(
        &self,
        exc_type: &Self::Value,
        pattern: &Self::Value,
    ) -> OpResult<bool, Self::Value>;
    /// Whether `value` is an exception class, the type slot an except
    /// handler receives.
    fn is_exception_class(&self, value: &Self::Value) -> bool;
    /// Normalize the operands of a `raise` statement into an exception.
    fn prepare_raise(
        &self,
        exc_type: Self::Value,
        value: Self::Value,
        traceback: Self::Value,
    ) -> OperationError<Self::Value>;

    fn unary_op(
        &self,
        op: UnaryOperator,
        operand: &Self::Value,
    ) -> OpResult<Self::Value, Self::Value>;
    fn binary_op(
        &self,
        op: BinaryOperator,
        a: &Self::Value,
        b: &Self::Value,
    ) -> OpResult<Self::Value, Self::Value>;
    fn inplace_op(
        &self,
        op: BinaryOperator,
        a: &Self::Value,
        b: &Self::Value,
    ) -> OpResult<Self::Value, Self::Value> {
        self.binary_op(op, a, b)
    }
    /// Rich comparison, membership and identity. Exception matching goes
    /// through [`ObjectSpace::exception_matches`] instead.
    fn compare(
        &self,
        op: ComparisonOperator,
        a: &Self::Value,
        b: &Self::Value,
    ) -> OpResult<Self::Value, Self::Value>;
    fn is_true(&self, value: &Self::Value) -> OpResult<bool, Self::Value>;

    fn get_iter(&self, iterable: &Self::Value) -> OpResult<Self::Value, Self::Value>;
    /// Advance an iterator. `Ok(None)` means it is exhausted.
    fn iter_next(&self, iterator: &Self::Value) -> OpResult<Option<Self::Value>, Self::Value>;

    fn get_attr(&self, obj: &Self::Value, name: &str) -> OpResult<Self::Value, Self::Value>;
    fn set_attr(
        &self,
        obj: &Self::Value,
        name: &str,
        value: Self::Value,
    ) -> OpResult<(), Self::Value>;
    fn del_attr(&self, obj: &Self::Value, name: &str) -> OpResult<(), Self::Value>;

    fn get_item(&self, obj: &Self::Value, key: &Self::Value) -> OpResult<Self::Value, Self::Value>;
    fn set_item(
        &self,
        obj: &Self::Value,
        key: &Self::Value,
        value: Self::Value,
    ) -> OpResult<(), Self::Value>;
    fn del_item(&self, obj: &Self::Value, key: &Self::Value) -> OpResult<(), Self::Value>;

    /// Call `func` with a tuple of positional arguments and an optional
    /// dict of keyword arguments.
    fn call(
        &self,
        func: &Self::Value,
        args: Self::Value,
        kwargs: Option<Self::Value>,
    ) -> OpResult<Self::Value, Self::Value>;

    /// `str(value)`
    fn str_value(&self, value: &Self::Value) -> OpResult<String, Self::Value>;

    /// `print value,` to `stream`, or to standard output when there is none.
    fn print_item(
        &self,
        stream: Option<&Self::Value>,
        value: &Self::Value,
    ) -> OpResult<(), Self::Value>;
    fn print_newline(&self, stream: Option<&Self::Value>) -> OpResult<(), Self::Value>;
    /// Show the result of an expression statement in interactive mode.
    fn display_hook(&self, value: &Self::Value) -> OpResult<(), Self::Value>;

    fn is_exception(&self, err: &OperationError<Self::Value>, kind: ExceptionKind) -> bool {
        let pattern = self.exception_type(kind);
        matches!(self.exception_matches(&err.exc_type, &pattern), Ok(true))
    }

    /// Look `key` up in a namespace, mapping a `KeyError` to `None`.
    fn lookup(
        &self,
        namespace: &Self::Value,
        key: &Self::Value,
    ) -> OpResult<Option<Self::Value>, Self::Value> {
        match self.get_item(namespace, key) {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.is_exception(&err, ExceptionKind::KeyError) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Pull exactly `expected` items out of `iterable`.
    fn unpack_iterable(
        &self,
        iterable: &Self::Value,
        expected: usize,
    ) -> OpResult<Vec<Self::Value>, Self::Value> {
        let iterator = self.get_iter(iterable)?;
        let mut items = Vec::with_capacity(expected);
        while items.len() < expected {
            match self.iter_next(&iterator)? {
                Some(item) => items.push(item),
                None => {
                    let got = items.len();
                    let plural = if got == 1 { "" } else { "s" };
                    return Err(self.new_exception(
                        ExceptionKind::ValueError,
                        format!("need more than {got} value{plural} to unpack"),
                    ));
                }
            }
        }
        if self.iter_next(&iterator)?.is_some() {
            return Err(self.new_exception(
                ExceptionKind::ValueError,
                "too many values to unpack".to_owned(),
            ));
        }
        Ok(items)
    }

    fn iterate(&self, iterable: &Self::Value) -> OpResult<Vec<Self::Value>, Self::Value> {
        let iterator = self.get_iter(iterable)?;
        let mut items = Vec::new();
        while let Some(item) = self.iter_next(&iterator)? {
            items.push(item);
        }
        Ok(items)
    }

    /// Build the positional argument tuple of a call, appending the items
    /// of a `*args` value when there is one.
    fn concatenate_arguments(
        &self,
        mut positional: Vec<Self::Value>,
        star: Option<Self::Value>,
    ) -> OpResult<Self::Value, Self::Value> {
        if let Some(star) = star {
            positional.extend(self.iterate(&star)?);
        }
        Ok(self.new_tuple(positional))
    }

    /// Build the keyword dict of a call from flattened `key, value` pairs and
    /// an optional `**kwargs` mapping. Returns `None` when there are no
    /// keyword arguments at all.
    fn concatenate_keywords(
        &self,
        flat_pairs: Vec<Self::Value>,
        starstar: Option<Self::Value>,
    ) -> OpResult<Option<Self::Value>, Self::Value> {
        if flat_pairs.is_empty() && starstar.is_none() {
            return Ok(None);
        }
        let pairs: Vec<(Self::Value, Self::Value)> = flat_pairs.into_iter().tuples().collect();
        let kwargs = self.new_dict(pairs)?;
        if let Some(mapping) = starstar {
            for key in self.iterate(&mapping)? {
                if self.lookup(&kwargs, &key)?.is_some() {
                    let key = self.str_value(&key)?;
                    return Err(self.new_exception(
                        ExceptionKind::TypeError,
                        format!("got multiple values for keyword argument '{key}'"),
                    ));
                }
                let value = self.get_item(&mapping, &key)?;
                self.set_item(&kwargs, &key, value)?;
            }
        }
        Ok(Some(kwargs))
    }
}
