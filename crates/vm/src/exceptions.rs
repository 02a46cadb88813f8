use itertools::Itertools;
use std::fmt;

pub type OpResult<T, V> = Result<T, OperationError<V>>;

macro_rules! exception_kinds {
    ($($name:ident => $base:expr,)*) => {
        /// The exception classes the interpreter itself raises.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum ExceptionKind {
            $($name,)*
        }

        impl ExceptionKind {
            pub const ALL: &'static [Self] = &[$(Self::$name,)*];

            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }

            pub const fn base(self) -> Option<Self> {
                use ExceptionKind::*;
                match self {
                    $($name => $base,)*
                }
            }
        }
    };
}

exception_kinds! {
    BaseException => None,
    Exception => Some(BaseException),
    StopIteration => Some(Exception),
    ArithmeticError => Some(Exception),
    ZeroDivisionError => Some(ArithmeticError),
    OverflowError => Some(ArithmeticError),
    LookupError => Some(Exception),
    IndexError => Some(LookupError),
    KeyError => Some(LookupError),
    NameError => Some(Exception),
    UnboundLocalError => Some(NameError),
    TypeError => Some(Exception),
    ValueError => Some(Exception),
    AttributeError => Some(Exception),
    RuntimeError => Some(Exception),
    NotImplementedError => Some(RuntimeError),
    AssertionError => Some(Exception),
    SystemError => Some(Exception),
}

impl ExceptionKind {
    pub fn is_subclass(self, other: Self) -> bool {
        let mut kind = Some(self);
        while let Some(k) = kind {
            if k == other {
                return true;
            }
            kind = k.base();
        }
        false
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One frame an exception passed through on its way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracebackEntry {
    pub code_name: String,
    pub source_path: String,
    /// Offset of the instruction that raised.
    pub offset: usize,
    pub lineno: u32,
}

/// Frames an exception passed through, innermost first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Traceback {
    entries: Vec<TracebackEntry>,
}

impl Traceback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TracebackEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TracebackEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Traceback (most recent call last):")?;
        write!(
            f,
            "{}",
            self.entries.iter().rev().format_with("\n", |entry, f| f(&format_args!(
                "  File \"{}\", line {}, in {}",
                entry.source_path, entry.lineno, entry.code_name
            )))
        )
    }
}

/// The exception triple carried by a raise: type, value and traceback.
#[derive(Debug, Clone)]
pub struct OperationError<V> {
    pub exc_type: V,
    pub value: V,
    pub traceback: Traceback,
}

impl<V> OperationError<V> {
    pub fn new(exc_type: V, value: V) -> Self {
        Self {
            exc_type,
            value,
            traceback: Traceback::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = traceback;
        self
    }
}

impl<V: fmt::Display> fmt::Display for OperationError<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = self.value.to_string();
        if value.is_empty() {
            write!(f, "{}", self.exc_type)
        } else {
            write!(f, "{}: {}", self.exc_type, value)
        }
    }
}

impl<V: fmt::Debug + fmt::Display> std::error::Error for OperationError<V> {}
