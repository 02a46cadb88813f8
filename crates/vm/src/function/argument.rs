use crate::{
    exceptions::{ExceptionKind, OpResult},
    space::ObjectSpace,
};
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;
use tinypy_bytecode::CodeObject;

/// The `FuncArgs` struct holds the arguments of a call after `*args` and
/// `**kwargs` have been flattened: positional values in order, and keyword
/// values by name.
#[derive(Debug, Clone)]
pub struct FuncArgs<V> {
    pub args: Vec<V>,
    // in call order
    pub kwargs: IndexMap<String, V>,
}

impl<V> Default for FuncArgs<V> {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            kwargs: IndexMap::new(),
        }
    }
}

impl<V> From<Vec<V>> for FuncArgs<V> {
    fn from(args: Vec<V>) -> Self {
        Self {
            args,
            kwargs: IndexMap::new(),
        }
    }
}

impl<V> FuncArgs<V> {
    pub fn new(args: Vec<V>, kwargs: IndexMap<String, V>) -> Self {
        Self { args, kwargs }
    }

    /// Unpack the argument tuple and keyword dict a call site produced.
    pub fn from_containers<S: ObjectSpace<Value = V>>(
        space: &S,
        args: &V,
        kwargs: Option<&V>,
    ) -> OpResult<Self, V> {
        let args = space.iterate(args)?;
        let mut keywords = IndexMap::new();
        if let Some(kwargs) = kwargs {
            for key in space.iterate(kwargs)? {
                let value = space.get_item(kwargs, &key)?;
                keywords.insert(space.str_value(&key)?, value);
            }
        }
        Ok(Self {
            args,
            kwargs: keywords,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Quantifier {
    Exactly,
    AtMost,
    AtLeast,
}

impl fmt::Display for Quantifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exactly => "exactly",
            Self::AtMost => "at most",
            Self::AtLeast => "at least",
        })
    }
}

/// An error encountered while binding arguments to the parameters of a
/// function call. Raised as a `TypeError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    /// Too few or too many positional arguments. `quantifier` is `None`
    /// when the function takes no arguments at all.
    #[error("{name}() takes {}", count_phrase(.quantifier, .expected, .non_keyword, .given))]
    Count {
        name: String,
        quantifier: Option<Quantifier>,
        expected: usize,
        non_keyword: bool,
        given: usize,
    },
    #[error("{name}() got multiple values for keyword argument '{arg}'")]
    MultipleValues { name: String, arg: String },
    #[error("{name}() got an unexpected keyword argument '{arg}'")]
    UnexpectedKeyword { name: String, arg: String },
    #[error("{name}() got {count} unexpected keyword arguments")]
    UnexpectedKeywords { name: String, count: usize },
}

fn count_phrase(
    quantifier: &Option<Quantifier>,
    expected: &usize,
    non_keyword: &bool,
    given: &usize,
) -> String {
    let kind = if *non_keyword { "non-keyword " } else { "" };
    match quantifier {
        None => format!("no {kind}arguments ({given} given)"),
        Some(quantifier) => {
            let plural = if *expected == 1 { "" } else { "s" };
            format!("{quantifier} {expected} {kind}argument{plural} ({given} given)")
        }
    }
}

/// Parameter values produced by [`match_signature`], in binding order.
#[derive(Debug)]
pub struct BoundArguments<'a, V> {
    pub params: Vec<(&'a str, V)>,
    pub varargs: Option<(&'a str, Vec<V>)>,
    pub varkwargs: Option<(&'a str, IndexMap<String, V>)>,
}

/// Match call arguments against the signature of `code`.
///
/// Positional arguments fill the declared parameters first, then keywords
/// fill the rest by name, then `defaults` cover the trailing parameters.
/// Leftovers go to `*args` and `**kwargs` when the signature has them.
pub fn match_signature<'a, V: Clone>(
    code: &'a CodeObject,
    args: FuncArgs<V>,
    defaults: &[V],
) -> Result<BoundArguments<'a, V>, ArgumentError> {
    let signature = code.arg_names();
    let argnames = signature.args;
    let co_argcount = argnames.len();
    let given_positional = args.args.len();
    let given_keywords = args.kwargs.len();
    let mut kwargs = args.kwargs;
    let mut positional = args.args.into_iter();

    let mut params: Vec<(&str, V)> = argnames
        .iter()
        .map(String::as_str)
        .zip(positional.by_ref())
        .collect();
    let input_argcount = params.len();

    if let Some(name) = argnames[..input_argcount]
        .iter()
        .find(|name| kwargs.contains_key(name.as_str()))
    {
        return Err(ArgumentError::MultipleValues {
            name: code.obj_name.clone(),
            arg: name.clone(),
        });
    }

    let mut missing = 0;
    let def_first = co_argcount.saturating_sub(defaults.len());
    for (i, name) in argnames.iter().enumerate().skip(input_argcount) {
        if let Some(value) = kwargs.shift_remove(name.as_str()) {
            params.push((name.as_str(), value));
        } else if i >= def_first {
            let default = &defaults[defaults.len() - (co_argcount - i)];
            params.push((name.as_str(), default.clone()));
        } else {
            // reported after the keyword checks below
            missing += 1;
        }
    }

    let count_error = |missing: usize| {
        let mut expected = co_argcount;
        let mut non_keyword = false;
        let mut given = given_positional + given_keywords;
        if signature.varkwarg.is_some() || (given_keywords > 0 && !defaults.is_empty()) {
            non_keyword = true;
            given = if missing > 0 {
                co_argcount.saturating_sub(defaults.len() + missing)
            } else {
                given_positional
            };
        }
        let quantifier = if co_argcount == 0 {
            None
        } else if defaults.is_empty() && signature.vararg.is_none() {
            Some(Quantifier::Exactly)
        } else if missing == 0 {
            Some(Quantifier::AtMost)
        } else {
            expected = expected.saturating_sub(defaults.len());
            if given_keywords == 0 {
                non_keyword = false;
            }
            Some(Quantifier::AtLeast)
        };
        ArgumentError::Count {
            name: code.obj_name.clone(),
            quantifier,
            expected,
            non_keyword,
            given,
        }
    };

    let varargs = match signature.vararg {
        Some(name) => Some((name, positional.collect())),
        None if given_positional > co_argcount => return Err(count_error(0)),
        None => None,
    };

    let varkwargs = match signature.varkwarg {
        Some(name) => Some((name, kwargs)),
        None if kwargs.len() == 1 => {
            return Err(ArgumentError::UnexpectedKeyword {
                name: code.obj_name.clone(),
                arg: kwargs.keys().next().cloned().unwrap_or_default(),
            });
        }
        None if !kwargs.is_empty() => {
            return Err(ArgumentError::UnexpectedKeywords {
                name: code.obj_name.clone(),
                count: kwargs.len(),
            });
        }
        None => None,
    };

    if missing > 0 {
        return Err(count_error(missing));
    }
    Ok(BoundArguments {
        params,
        varargs,
        varkwargs,
    })
}

/// Bind `args` to the parameters of `code`, storing each value into the
/// `locals` namespace of a new frame. Mismatches raise `TypeError`.
pub fn bind_arguments<S: ObjectSpace>(
    space: &S,
    code: &CodeObject,
    args: FuncArgs<S::Value>,
    defaults: &[S::Value],
    locals: &S::Value,
) -> OpResult<(), S::Value> {
    let bound = match_signature(code, args, defaults)
        .map_err(|err| space.new_exception(ExceptionKind::TypeError, err.to_string()))?;

    for (name, value) in bound.params {
        space.set_item(locals, &space.new_str(name), value)?;
    }
    if let Some((name, rest)) = bound.varargs {
        space.set_item(locals, &space.new_str(name), space.new_tuple(rest))?;
    }
    if let Some((name, rest)) = bound.varkwargs {
        let pairs = rest
            .into_iter()
            .map(|(key, value)| (space.new_str(&key), value))
            .collect();
        space.set_item(locals, &space.new_str(name), space.new_dict(pairs)?)?;
    }
    Ok(())
}
