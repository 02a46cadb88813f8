use crate::{
    exceptions::{ExceptionKind, Traceback},
    generator::Generator,
};
use indexmap::IndexMap;
use itertools::Itertools;
use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
    sync::Arc,
};
use tinypy_bytecode::{CodeObject, bytecode::repr_str};

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<Dict>>;

/// Insertion-ordered dict. Entries keep the original key next to the value
/// so iteration hands back the key object that was stored.
pub type Dict = IndexMap<HashKey, (Value, Value)>;

/// A value of the reference object space.
#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Tuple(Rc<[Value]>),
    List(ListRef),
    Dict(DictRef),
    Slice(Rc<Slice>),
    Cell(Rc<RefCell<Option<Value>>>),
    Code(Arc<CodeObject>),
    Function(Rc<Function>),
    Builtin(Builtin),
    Method(Rc<BoundMethod>),
    ExceptionType(ExceptionKind),
    Exception(Rc<Exception>),
    Iterator(Rc<RefCell<IteratorState>>),
    Generator(Rc<Generator<Value>>),
    /// Plain attribute bag, made by the `namespace` builtin.
    Instance(Rc<RefCell<IndexMap<String, Value>>>),
    Traceback(Rc<Traceback>),
}

#[derive(Debug, Clone)]
pub struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

#[derive(Debug)]
pub struct Function {
    pub code: Arc<CodeObject>,
    pub globals: Value,
    pub defaults: Vec<Value>,
    /// Cells for the free variables of `code`.
    pub closure: Vec<Value>,
}

#[derive(Debug)]
pub struct Exception {
    pub kind: ExceptionKind,
    pub args: Vec<Value>,
}

#[derive(Debug)]
pub enum IteratorState {
    /// Walks a list, tuple or string by index, so a list that grows during
    /// iteration yields the new items too.
    Sequence { seq: Value, index: usize },
    /// A snapshot, used for dict keys.
    Items(std::vec::IntoIter<Value>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Builtin {
    Len,
    Range,
    Repr,
    Str,
    Abs,
    List,
    Tuple,
    Namespace,
    Iter,
    Next,
}

impl Builtin {
    pub const ALL: &'static [Self] = &[
        Self::Len,
        Self::Range,
        Self::Repr,
        Self::Str,
        Self::Abs,
        Self::List,
        Self::Tuple,
        Self::Namespace,
        Self::Iter,
        Self::Next,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Len => "len",
            Self::Range => "range",
            Self::Repr => "repr",
            Self::Str => "str",
            Self::Abs => "abs",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Namespace => "namespace",
            Self::Iter => "iter",
            Self::Next => "next",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MethodKind {
    ListAppend,
    ListPop,
    DictKeys,
    DictValues,
    DictItems,
    DictGet,
    GeneratorNext,
    GeneratorSend,
}

impl MethodKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::ListAppend => "append",
            Self::ListPop => "pop",
            Self::DictKeys => "keys",
            Self::DictValues => "values",
            Self::DictItems => "items",
            Self::DictGet => "get",
            Self::GeneratorNext => "next",
            Self::GeneratorSend => "send",
        }
    }

    /// The method called `name` on values of type `type_name`.
    pub fn lookup(type_name: &str, name: &str) -> Option<Self> {
        let kind = match (type_name, name) {
            ("list", "append") => Self::ListAppend,
            ("list", "pop") => Self::ListPop,
            ("dict", "keys") => Self::DictKeys,
            ("dict", "values") => Self::DictValues,
            ("dict", "items") => Self::DictItems,
            ("dict", "get") => Self::DictGet,
            ("generator", "next") => Self::GeneratorNext,
            ("generator", "send") => Self::GeneratorSend,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub kind: MethodKind,
}

/// The hashable projection of a dict key. Numbers that compare equal hash
/// equal, so `1`, `1.0` and `True` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(i64),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
    Type(ExceptionKind),
    Builtin(Builtin),
    Identity(usize),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Self::Str(Rc::from(s))
    }

    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::from(items))
    }

    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    pub fn empty_dict() -> Self {
        Self::Dict(Rc::new(RefCell::new(Dict::new())))
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Self::Int(i) => Some(i),
            Self::Bool(b) => Some(b.into()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
            Self::Slice(_) => "slice",
            Self::Cell(_) => "cell",
            Self::Code(_) => "code",
            Self::Function(_) => "function",
            Self::Builtin(_) | Self::Method(_) => "builtin_function_or_method",
            Self::ExceptionType(_) => "type",
            Self::Exception(exc) => exc.kind.name(),
            Self::Iterator(_) => "iterator",
            Self::Generator(_) => "generator",
            Self::Instance(_) => "namespace",
            Self::Traceback(_) => "traceback",
        }
    }

    /// Address of the shared allocation, for reference types.
    fn identity(&self) -> Option<usize> {
        let addr = match self {
            Self::Tuple(items) => Rc::as_ptr(items) as *const () as usize,
            Self::List(list) => Rc::as_ptr(list) as *const () as usize,
            Self::Dict(dict) => Rc::as_ptr(dict) as *const () as usize,
            Self::Slice(slice) => Rc::as_ptr(slice) as *const () as usize,
            Self::Cell(cell) => Rc::as_ptr(cell) as *const () as usize,
            Self::Code(code) => Arc::as_ptr(code) as *const () as usize,
            Self::Function(func) => Rc::as_ptr(func) as *const () as usize,
            Self::Method(method) => Rc::as_ptr(method) as *const () as usize,
            Self::Exception(exc) => Rc::as_ptr(exc) as *const () as usize,
            Self::Iterator(it) => Rc::as_ptr(it) as *const () as usize,
            Self::Generator(jen) => Rc::as_ptr(jen) as *const () as usize,
            Self::Instance(attrs) => Rc::as_ptr(attrs) as *const () as usize,
            Self::Traceback(tb) => Rc::as_ptr(tb) as *const () as usize,
            Self::None
            | Self::Bool(_)
            | Self::Int(_)
            | Self::Float(_)
            | Self::Str(_)
            | Self::Builtin(_)
            | Self::ExceptionType(_) => return None,
        };
        Some(addr)
    }

    /// `a is b`
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::ExceptionType(a), Self::ExceptionType(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    /// The dict key for this value, or `None` when it is unhashable.
    pub fn hash_key(&self) -> Option<HashKey> {
        let key = match self {
            Self::None => HashKey::None,
            Self::Bool(b) => HashKey::Int((*b).into()),
            Self::Int(i) => HashKey::Int(*i),
            Self::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e18 => HashKey::Int(*f as i64),
            Self::Float(f) => HashKey::Float(f.to_bits()),
            Self::Str(s) => HashKey::Str(s.clone()),
            Self::Tuple(items) => HashKey::Tuple(
                items
                    .iter()
                    .map(Self::hash_key)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Self::ExceptionType(kind) => HashKey::Type(*kind),
            Self::Builtin(b) => HashKey::Builtin(*b),
            Self::List(_) | Self::Dict(_) | Self::Slice(_) => return None,
            other => HashKey::Identity(other.identity()?),
        };
        Some(key)
    }

    pub fn repr(&self) -> String {
        match self {
            Self::None => "None".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => float_repr(*f),
            Self::Str(s) => repr_str(s),
            Self::Tuple(items) if items.len() == 1 => format!("({},)", items[0].repr()),
            Self::Tuple(items) => format!("({})", items.iter().map(Self::repr).join(", ")),
            Self::List(list) => format!("[{}]", list.borrow().iter().map(Self::repr).join(", ")),
            Self::Dict(dict) => format!(
                "{{{}}}",
                dict.borrow()
                    .values()
                    .format_with(", ", |(k, v), f| f(&format_args!(
                        "{}: {}",
                        k.repr(),
                        v.repr()
                    )))
            ),
            Self::Slice(slice) => format!(
                "slice({}, {}, {})",
                slice.start.repr(),
                slice.stop.repr(),
                slice.step.repr()
            ),
            Self::Cell(cell) => match &*cell.borrow() {
                Some(value) => format!("<cell: {} object>", value.type_name()),
                None => "<cell: empty>".to_owned(),
            },
            Self::Code(code) => format!("{code:?}"),
            Self::Function(func) => format!("<function {}>", func.code.obj_name),
            Self::Builtin(b) => format!("<built-in function {}>", b.name()),
            Self::Method(method) => format!(
                "<built-in method {} of {} object>",
                method.kind.name(),
                method.receiver.type_name()
            ),
            Self::ExceptionType(kind) => format!("<type 'exceptions.{kind}'>"),
            Self::Exception(exc) => match exc.args.as_slice() {
                [arg] => format!("{}({},)", exc.kind, arg.repr()),
                args => format!("{}({})", exc.kind, args.iter().map(Self::repr).join(", ")),
            },
            Self::Iterator(_) => "<iterator object>".to_owned(),
            Self::Generator(jen) => format!("<generator object {}>", jen.name()),
            Self::Instance(attrs) => format!(
                "namespace({})",
                attrs
                    .borrow()
                    .iter()
                    .format_with(", ", |(k, v), f| f(&format_args!("{k}={}", v.repr())))
            ),
            Self::Traceback(_) => "<traceback object>".to_owned(),
        }
    }
}

fn float_repr(f: f64) -> String {
    if f.is_nan() {
        "nan".to_owned()
    } else if f.is_infinite() {
        let inf = if f > 0.0 { "inf" } else { "-inf" };
        inf.to_owned()
    } else {
        format!("{f:?}")
    }
}

/// `repr(value)`
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

/// `str(value)`
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::ExceptionType(kind) => f.write_str(kind.name()),
            Self::Exception(exc) => match exc.args.as_slice() {
                [] => Ok(()),
                // the missing key is shown quoted
                [arg] if exc.kind == ExceptionKind::KeyError => f.write_str(&arg.repr()),
                [arg] => write!(f, "{arg}"),
                args => write!(f, "({})", args.iter().map(Self::repr).join(", ")),
            },
            other => f.write_str(&other.repr()),
        }
    }
}
