//! A complete, deliberately small object space with Python 2 flavoured
//! semantics, for running and testing bytecode.
//!
//! Values are reference counted and single threaded. Output of `print`
//! statements goes into an in-memory buffer, see [`SimpleSpace::output`].

mod builtins;
mod item;
mod ops;
mod value;

pub use self::value::{
    BoundMethod, Builtin, Dict, DictRef, Exception, Function, HashKey, IteratorState, ListRef,
    MethodKind, Slice, Value,
};

use crate::{
    exceptions::{ExceptionKind, OpResult, OperationError, Traceback},
    frame::{ExecutionResult, Frame},
    function::{FuncArgs, bind_arguments},
    generator::Generator,
    space::ObjectSpace,
    vm::{ExecutionContext, Settings, run_frame},
};
use std::{
    cell::{Cell, RefCell},
    rc::Rc,
    sync::Arc,
};
use tinypy_bytecode::{
    BinaryOperator, CodeFlags, CodeObject, ComparisonOperator, ConstantData, UnaryOperator,
};

type ValueResult<T = Value> = OpResult<T, Value>;

fn hash_key(space: &SimpleSpace, value: &Value) -> ValueResult<HashKey> {
    value.hash_key().ok_or_else(|| {
        space.new_exception(
            ExceptionKind::TypeError,
            format!("unhashable type: '{}'", value.type_name()),
        )
    })
}

pub struct SimpleSpace {
    context: ExecutionContext,
    builtins: Value,
    output: RefCell<String>,
    /// Set after `print x,` so the next item is preceded by a space.
    softspace: Cell<bool>,
}

impl Default for SimpleSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl SimpleSpace {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            context: ExecutionContext::new(settings),
            builtins: builtins::make_builtins(),
            output: RefCell::new(String::new()),
            softspace: Cell::new(false),
        }
    }

    pub fn builtins(&self) -> &Value {
        &self.builtins
    }

    /// A fresh, empty namespace dict.
    pub fn new_scope(&self) -> Value {
        Value::empty_dict()
    }

    /// Everything printed so far.
    pub fn output(&self) -> String {
        self.output.borrow().clone()
    }

    pub fn take_output(&self) -> String {
        self.softspace.set(false);
        self.output.take()
    }

    /// Look `name` up in a namespace dict.
    pub fn scope_get(&self, scope: &Value, name: &str) -> Option<Value> {
        self.lookup(scope, &Value::str(name)).ok().flatten()
    }

    pub fn exception_instance(&self, kind: ExceptionKind, args: Vec<Value>) -> Value {
        Value::Exception(Rc::new(Exception { kind, args }))
    }

    /// Run module level code with `scope` as both its globals and locals.
    pub fn run_code(&self, code: Arc<CodeObject>, scope: &Value) -> ValueResult {
        let mut frame = Frame::new(
            self,
            code,
            scope.clone(),
            scope.clone(),
            self.builtins.clone(),
            Vec::new(),
        );
        match run_frame(self, &mut frame)? {
            ExecutionResult::Return(value) => Ok(value),
            ExecutionResult::Yield(_) => Err(self.new_exception(
                ExceptionKind::SystemError,
                "'yield' outside function".to_owned(),
            )),
        }
    }

    /// Call a function made by `MAKE_FUNCTION` or `MAKE_CLOSURE`.
    pub fn call_function(&self, func: &Function, args: FuncArgs<Value>) -> ValueResult {
        let code = &func.code;
        let locals = if code.flags.contains(CodeFlags::NEWLOCALS) {
            Value::empty_dict()
        } else {
            func.globals.clone()
        };
        bind_arguments(self, code, args, &func.defaults, &locals)?;
        let mut frame = Frame::new(
            self,
            code.clone(),
            func.globals.clone(),
            locals,
            self.builtins.clone(),
            func.closure.clone(),
        );
        if code.flags.contains(CodeFlags::GENERATOR) {
            return Ok(Value::Generator(Rc::new(Generator::new(frame))));
        }
        match run_frame(self, &mut frame)? {
            ExecutionResult::Return(value) => Ok(value),
            ExecutionResult::Yield(_) => Err(self.new_exception(
                ExceptionKind::SystemError,
                format!("{}() yielded but is not a generator", code.obj_name),
            )),
        }
    }

    fn write_stdout(&self, text: &str) {
        self.output.borrow_mut().push_str(text);
    }

    fn no_attribute(&self, obj: &Value, name: &str) -> OperationError<Value> {
        self.new_exception(
            ExceptionKind::AttributeError,
            format!("'{}' object has no attribute '{name}'", obj.type_name()),
        )
    }
}

impl ObjectSpace for SimpleSpace {
    type Value = Value;

    fn execution_context(&self) -> &ExecutionContext {
        &self.context
    }

    fn none(&self) -> Value {
        Value::None
    }

    fn is_none(&self, value: &Value) -> bool {
        value.is_none()
    }

    fn new_bool(&self, value: bool) -> Value {
        Value::Bool(value)
    }

    fn new_str(&self, value: &str) -> Value {
        Value::str(value)
    }

    fn new_constant(&self, constant: &ConstantData) -> Value {
        match constant {
            ConstantData::None => Value::None,
            ConstantData::Boolean(b) => Value::Bool(*b),
            ConstantData::Integer(i) => Value::Int(*i),
            ConstantData::Float(f) => Value::Float(*f),
            ConstantData::Str(s) => Value::str(s),
            ConstantData::Tuple(items) => {
                Value::tuple(items.iter().map(|c| self.new_constant(c)).collect())
            }
            ConstantData::Code(code) => Value::Code(code.clone()),
        }
    }

    fn new_tuple(&self, items: Vec<Value>) -> Value {
        Value::tuple(items)
    }

    fn new_list(&self, items: Vec<Value>) -> Value {
        Value::list(items)
    }

    fn new_dict(&self, pairs: Vec<(Value, Value)>) -> ValueResult {
        let mut dict = Dict::with_capacity(pairs.len());
        for (key, value) in pairs {
            dict.insert(hash_key(self, &key)?, (key, value));
        }
        Ok(Value::Dict(Rc::new(RefCell::new(dict))))
    }

    fn new_slice(&self, start: Value, stop: Value, step: Value) -> Value {
        Value::Slice(Rc::new(Slice { start, stop, step }))
    }

    fn new_function(
        &self,
        code: Value,
        globals: Value,
        defaults: Vec<Value>,
        closure: Option<Value>,
    ) -> ValueResult {
        let code = match code {
            Value::Code(code) => code,
            other => {
                return Err(self.new_exception(
                    ExceptionKind::TypeError,
                    format!(
                        "function() argument 1 must be code, not {}",
                        other.type_name()
                    ),
                ));
            }
        };
        let closure = match closure {
            None => Vec::new(),
            Some(Value::Tuple(cells)) if cells.iter().all(|c| matches!(c, Value::Cell(_))) => {
                cells.to_vec()
            }
            Some(other) => {
                return Err(self.new_exception(
                    ExceptionKind::TypeError,
                    format!("closure must be a tuple of cells, not {}", other.repr()),
                ));
            }
        };
        if closure.len() != code.freevars.len() {
            return Err(self.new_exception(
                ExceptionKind::SystemError,
                format!(
                    "{} requires a closure of {} cells, not {}",
                    code.obj_name,
                    code.freevars.len(),
                    closure.len()
                ),
            ));
        }
        Ok(Value::Function(Rc::new(Function {
            code,
            globals,
            defaults,
            closure,
        })))
    }

    fn new_cell(&self, contents: Option<Value>) -> Value {
        Value::Cell(Rc::new(RefCell::new(contents)))
    }

    fn cell_get(&self, cell: &Value) -> Option<Value> {
        match cell {
            Value::Cell(contents) => contents.borrow().clone(),
            _ => None,
        }
    }

    fn cell_set(&self, cell: &Value, contents: Option<Value>) {
        if let Value::Cell(slot) = cell {
            *slot.borrow_mut() = contents;
        }
    }

    fn exception_type(&self, kind: ExceptionKind) -> Value {
        Value::ExceptionType(kind)
    }

    fn new_exception(&self, kind: ExceptionKind, msg: String) -> OperationError<Value> {
        let args = if msg.is_empty() {
            Vec::new()
        } else {
            vec![Value::str(&msg)]
        };
        OperationError::new(Value::ExceptionType(kind), self.exception_instance(kind, args))
    }

    fn new_traceback(&self, traceback: &Traceback) -> Value {
        Value::Traceback(Rc::new(traceback.clone()))
    }

    fn exception_matches(&self, exc_type: &Value, pattern: &Value) -> ValueResult<bool> {
        match pattern {
            Value::ExceptionType(kind) => Ok(matches!(
                exc_type,
                Value::ExceptionType(actual) if actual.is_subclass(*kind)
            )),
            Value::Tuple(patterns) => {
                for pattern in patterns.iter() {
                    if self.exception_matches(exc_type, pattern)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            _ => Err(self.new_exception(
                ExceptionKind::TypeError,
                "catching classes that do not inherit from BaseException is not allowed"
                    .to_owned(),
            )),
        }
    }

    fn is_exception_class(&self, value: &Value) -> bool {
        matches!(value, Value::ExceptionType(_))
    }

    fn prepare_raise(&self, exc_type: Value, value: Value, traceback: Value) -> OperationError<Value> {
        let err = match &exc_type {
            Value::ExceptionType(kind) => {
                let instance = match value {
                    Value::Exception(ref exc) if exc.kind.is_subclass(*kind) => value.clone(),
                    Value::None => self.exception_instance(*kind, Vec::new()),
                    Value::Tuple(args) => self.exception_instance(*kind, args.to_vec()),
                    other => self.exception_instance(*kind, vec![other]),
                };
                let actual = match &instance {
                    Value::Exception(exc) => exc.kind,
                    _ => *kind,
                };
                OperationError::new(Value::ExceptionType(actual), instance)
            }
            Value::Exception(exc) => {
                if !value.is_none() {
                    return self.new_exception(
                        ExceptionKind::TypeError,
                        "instance exception may not have a separate value".to_owned(),
                    );
                }
                OperationError::new(Value::ExceptionType(exc.kind), exc_type.clone())
            }
            other => {
                return self.new_exception(
                    ExceptionKind::TypeError,
                    format!(
                        "exceptions must be old-style classes or derived from BaseException, not {}",
                        other.type_name()
                    ),
                );
            }
        };
        match traceback {
            Value::None => err,
            Value::Traceback(tb) => err.with_traceback((*tb).clone()),
            _ => self.new_exception(
                ExceptionKind::TypeError,
                "raise: arg 3 must be a traceback or None".to_owned(),
            ),
        }
    }

    fn unary_op(&self, op: UnaryOperator, operand: &Value) -> ValueResult {
        ops::unary_op(self, op, operand)
    }

    fn binary_op(&self, op: BinaryOperator, a: &Value, b: &Value) -> ValueResult {
        ops::binary_op(self, op, a, b)
    }

    fn inplace_op(&self, op: BinaryOperator, a: &Value, b: &Value) -> ValueResult {
        ops::inplace_op(self, op, a, b)
    }

    fn compare(&self, op: ComparisonOperator, a: &Value, b: &Value) -> ValueResult {
        ops::compare(self, op, a, b)
    }

    fn is_true(&self, value: &Value) -> ValueResult<bool> {
        let truth = match value {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(dict) => !dict.borrow().is_empty(),
            _ => true,
        };
        Ok(truth)
    }

    fn get_iter(&self, iterable: &Value) -> ValueResult {
        if matches!(iterable, Value::Iterator(_) | Value::Generator(_)) {
            return Ok(iterable.clone());
        }
        match builtins::iterator_for(iterable) {
            Some(state) => Ok(Value::Iterator(Rc::new(RefCell::new(state)))),
            None => Err(self.new_exception(
                ExceptionKind::TypeError,
                format!("'{}' object is not iterable", iterable.type_name()),
            )),
        }
    }

    fn iter_next(&self, iterator: &Value) -> ValueResult<Option<Value>> {
        match iterator {
            Value::Iterator(state) => Ok(builtins::advance(&mut state.borrow_mut())),
            Value::Generator(jen) => jen.next(self),
            _ => Err(self.new_exception(
                ExceptionKind::TypeError,
                format!("'{}' object is not an iterator", iterator.type_name()),
            )),
        }
    }

    fn get_attr(&self, obj: &Value, name: &str) -> ValueResult {
        match obj {
            Value::Instance(attrs) => {
                let value = attrs.borrow().get(name).cloned();
                value.ok_or_else(|| self.no_attribute(obj, name))
            }
            Value::Exception(exc) if name == "args" => Ok(Value::tuple(exc.args.clone())),
            Value::Function(func) if name == "__name__" => Ok(Value::str(&func.code.obj_name)),
            _ => builtins::get_method(obj, name).ok_or_else(|| self.no_attribute(obj, name)),
        }
    }

    fn set_attr(&self, obj: &Value, name: &str, value: Value) -> ValueResult<()> {
        match obj {
            Value::Instance(attrs) => {
                attrs.borrow_mut().insert(name.to_owned(), value);
                Ok(())
            }
            _ => Err(self.no_attribute(obj, name)),
        }
    }

    fn del_attr(&self, obj: &Value, name: &str) -> ValueResult<()> {
        let removed = match obj {
            Value::Instance(attrs) => attrs.borrow_mut().shift_remove(name),
            _ => None,
        };
        match removed {
            Some(_) => Ok(()),
            None => Err(self.no_attribute(obj, name)),
        }
    }

    fn get_item(&self, obj: &Value, key: &Value) -> ValueResult {
        item::get_item(self, obj, key)
    }

    fn set_item(&self, obj: &Value, key: &Value, value: Value) -> ValueResult<()> {
        item::set_item(self, obj, key, value)
    }

    fn del_item(&self, obj: &Value, key: &Value) -> ValueResult<()> {
        item::del_item(self, obj, key)
    }

    fn call(&self, func: &Value, args: Value, kwargs: Option<Value>) -> ValueResult {
        let args = FuncArgs::from_containers(self, &args, kwargs.as_ref())?;
        match func {
            Value::Function(func) => self.call_function(func, args),
            Value::Builtin(builtin) => builtins::call_builtin(self, *builtin, args),
            Value::Method(method) => builtins::call_method(self, method, args),
            Value::ExceptionType(kind) => builtins::call_exception_type(self, *kind, args),
            _ => Err(self.new_exception(
                ExceptionKind::TypeError,
                format!("'{}' object is not callable", func.type_name()),
            )),
        }
    }

    fn str_value(&self, value: &Value) -> ValueResult<String> {
        Ok(value.to_string())
    }

    fn print_item(&self, stream: Option<&Value>, value: &Value) -> ValueResult<()> {
        let text = value.to_string();
        match stream {
            None | Some(Value::None) => {
                if self.softspace.replace(false) {
                    self.write_stdout(" ");
                }
                self.write_stdout(&text);
                let ends_line = text
                    .chars()
                    .last()
                    .is_some_and(|c| c.is_whitespace() && c != ' ');
                self.softspace.set(!ends_line);
                Ok(())
            }
            Some(Value::List(lines)) => {
                lines.borrow_mut().push(Value::str(&text));
                Ok(())
            }
            Some(other) => Err(self.no_attribute(other, "write")),
        }
    }

    fn print_newline(&self, stream: Option<&Value>) -> ValueResult<()> {
        match stream {
            None | Some(Value::None) => {
                self.softspace.set(false);
                self.write_stdout("\n");
                Ok(())
            }
            Some(Value::List(lines)) => {
                lines.borrow_mut().push(Value::str("\n"));
                Ok(())
            }
            Some(other) => Err(self.no_attribute(other, "write")),
        }
    }

    fn display_hook(&self, value: &Value) -> ValueResult<()> {
        if !value.is_none() {
            self.softspace.set(false);
            self.write_stdout(&value.repr());
            self.write_stdout("\n");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_normalization() {
        let space = SimpleSpace::new();
        let err = space.prepare_raise(
            Value::ExceptionType(ExceptionKind::ValueError),
            Value::str("bad"),
            Value::None,
        );
        assert_eq!(err.to_string(), "ValueError: bad");

        let instance = space.exception_instance(ExceptionKind::KeyError, vec![Value::Int(3)]);
        let err = space.prepare_raise(
            Value::ExceptionType(ExceptionKind::LookupError),
            instance.clone(),
            Value::None,
        );
        assert!(space.is_exception(&err, ExceptionKind::KeyError));
        assert!(err.value.is(&instance));

        let err = space.prepare_raise(instance, Value::None, Value::None);
        assert_eq!(err.to_string(), "KeyError: 3");

        let err = space.prepare_raise(Value::Int(1), Value::None, Value::None);
        assert_eq!(
            err.to_string(),
            "TypeError: exceptions must be old-style classes or derived from BaseException, not int"
        );
    }

    #[test]
    fn exception_matching_with_tuples() {
        let space = SimpleSpace::new();
        let zde = Value::ExceptionType(ExceptionKind::ZeroDivisionError);
        let pattern = Value::tuple(vec![
            Value::ExceptionType(ExceptionKind::KeyError),
            Value::ExceptionType(ExceptionKind::ArithmeticError),
        ]);
        assert!(space.exception_matches(&zde, &pattern).unwrap());
        let key = Value::ExceptionType(ExceptionKind::KeyError);
        assert!(!space.exception_matches(&key, &zde).unwrap());
        assert!(space.exception_matches(&key, &Value::Int(1)).is_err());
    }

    #[test]
    fn print_softspace() {
        let space = SimpleSpace::new();
        space.print_item(None, &Value::Int(1)).unwrap();
        space.print_item(None, &Value::str("a")).unwrap();
        space.print_newline(None).unwrap();
        space.print_item(None, &Value::str("line\n")).unwrap();
        space.print_item(None, &Value::Int(2)).unwrap();
        space.print_newline(None).unwrap();
        assert_eq!(space.take_output(), "1 a\nline\n2\n");
        assert_eq!(space.output(), "");
    }

    #[test]
    fn builtin_calls() {
        let space = SimpleSpace::new();
        let call = |name: &str, args: Vec<Value>| {
            let func = space.scope_get(space.builtins(), name).unwrap();
            match space.call(&func, Value::tuple(args), None) {
                Ok(value) => value.repr(),
                Err(err) => err.to_string(),
            }
        };
        assert_eq!(call("len", vec![Value::str("abc")]), "3");
        assert_eq!(call("range", vec![Value::Int(3)]), "[0, 1, 2]");
        assert_eq!(
            call("range", vec![Value::Int(5), Value::Int(0), Value::Int(-2)]),
            "[5, 3, 1]"
        );
        assert_eq!(call("repr", vec![Value::str("x")]), "\"'x'\"");
        assert_eq!(call("abs", vec![Value::Int(-4)]), "4");
        assert_eq!(
            call("len", vec![]),
            "TypeError: len() takes exactly 1 argument (0 given)"
        );
        assert_eq!(
            call("len", vec![Value::Int(1)]),
            "TypeError: object of type 'int' has no len()"
        );
        assert_eq!(
            call("ValueError", vec![Value::str("m")]),
            "ValueError('m',)"
        );
    }

    #[test]
    fn namespaces_and_methods() {
        let space = SimpleSpace::new();
        let ns = space.scope_get(space.builtins(), "namespace").unwrap();
        let kwargs = space
            .new_dict(vec![(Value::str("a"), Value::Int(1))])
            .unwrap();
        let obj = space.call(&ns, Value::tuple(vec![]), Some(kwargs)).unwrap();
        assert_eq!(space.get_attr(&obj, "a").unwrap().repr(), "1");
        space.set_attr(&obj, "b", Value::Int(2)).unwrap();
        assert_eq!(obj.repr(), "namespace(a=1, b=2)");
        let err = space.get_attr(&obj, "c").unwrap_err();
        assert_eq!(
            err.to_string(),
            "AttributeError: 'namespace' object has no attribute 'c'"
        );

        let list = Value::list(vec![]);
        let append = space.get_attr(&list, "append").unwrap();
        space
            .call(&append, Value::tuple(vec![Value::Int(7)]), None)
            .unwrap();
        assert_eq!(list.repr(), "[7]");
    }
}
