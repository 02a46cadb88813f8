//! Builtin functions and the few methods of builtin types.

use super::{BoundMethod, Builtin, IteratorState, MethodKind, SimpleSpace, Value, ops};
use crate::{
    exceptions::{ExceptionKind, OpResult},
    function::{ArgumentError, FuncArgs, Quantifier},
    space::ObjectSpace,
};
use indexmap::IndexMap;
use std::{cell::RefCell, rc::Rc};

type ValueResult<T = Value> = OpResult<T, Value>;

/// Check the positional arity of a builtin that takes no keywords.
fn arity(
    space: &SimpleSpace,
    name: &str,
    args: FuncArgs<Value>,
    min: usize,
    max: usize,
) -> ValueResult<Vec<Value>> {
    if !args.kwargs.is_empty() {
        return Err(space.new_exception(
            ExceptionKind::TypeError,
            format!("{name}() takes no keyword arguments"),
        ));
    }
    let given = args.args.len();
    if (min..=max).contains(&given) {
        return Ok(args.args);
    }
    let (quantifier, expected) = if min == max {
        (Quantifier::Exactly, min)
    } else if given < min {
        (Quantifier::AtLeast, min)
    } else {
        (Quantifier::AtMost, max)
    };
    let err = ArgumentError::Count {
        name: name.to_owned(),
        quantifier: Some(quantifier),
        expected,
        non_keyword: false,
        given,
    };
    Err(space.new_exception(ExceptionKind::TypeError, err.to_string()))
}

fn int_arg(space: &SimpleSpace, name: &str, value: &Value) -> ValueResult<i64> {
    value.as_int().ok_or_else(|| {
        space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "{name}() integer argument expected, got {}",
                value.type_name()
            ),
        )
    })
}

fn range(space: &SimpleSpace, args: &[Value]) -> ValueResult {
    let ints = args
        .iter()
        .map(|arg| int_arg(space, "range", arg))
        .collect::<ValueResult<Vec<_>>>()?;
    let (start, stop, step) = match *ints.as_slice() {
        [stop] => (0, stop, 1),
        [start, stop] => (start, stop, 1),
        [start, stop, step] => (start, stop, step),
        _ => (0, 0, 1),
    };
    if step == 0 {
        return Err(space.new_exception(
            ExceptionKind::ValueError,
            "range() step argument must not be zero".to_owned(),
        ));
    }
    let mut items = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        items.push(Value::Int(i));
        i = match i.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }
    Ok(Value::list(items))
}

fn len(space: &SimpleSpace, value: &Value) -> ValueResult {
    let n = match value {
        Value::Str(s) => s.chars().count(),
        Value::Tuple(items) => items.len(),
        Value::List(items) => items.borrow().len(),
        Value::Dict(dict) => dict.borrow().len(),
        Value::Instance(attrs) => attrs.borrow().len(),
        _ => {
            return Err(space.new_exception(
                ExceptionKind::TypeError,
                format!("object of type '{}' has no len()", value.type_name()),
            ));
        }
    };
    Ok(Value::Int(n as i64))
}

pub(super) fn call_builtin(
    space: &SimpleSpace,
    builtin: Builtin,
    args: FuncArgs<Value>,
) -> ValueResult {
    let name = builtin.name();
    match builtin {
        Builtin::Namespace => {
            if !args.args.is_empty() {
                return Err(space.new_exception(
                    ExceptionKind::TypeError,
                    "namespace() takes no positional arguments".to_owned(),
                ));
            }
            Ok(Value::Instance(Rc::new(RefCell::new(args.kwargs))))
        }
        Builtin::Len => {
            let args = arity(space, name, args, 1, 1)?;
            len(space, &args[0])
        }
        Builtin::Range => {
            let args = arity(space, name, args, 1, 3)?;
            range(space, &args)
        }
        Builtin::Repr => {
            let args = arity(space, name, args, 1, 1)?;
            Ok(Value::str(&args[0].repr()))
        }
        Builtin::Str => {
            let args = arity(space, name, args, 0, 1)?;
            match args.first() {
                Some(value) => Ok(Value::str(&space.str_value(value)?)),
                None => Ok(Value::str("")),
            }
        }
        Builtin::Abs => {
            let args = arity(space, name, args, 1, 1)?;
            ops::abs(space, &args[0])
        }
        Builtin::List => {
            let args = arity(space, name, args, 0, 1)?;
            match args.first() {
                Some(iterable) => Ok(Value::list(space.iterate(iterable)?)),
                None => Ok(Value::list(Vec::new())),
            }
        }
        Builtin::Tuple => {
            let args = arity(space, name, args, 0, 1)?;
            match args.first() {
                Some(iterable) => Ok(Value::tuple(space.iterate(iterable)?)),
                None => Ok(Value::tuple(Vec::new())),
            }
        }
        Builtin::Iter => {
            let args = arity(space, name, args, 1, 1)?;
            space.get_iter(&args[0])
        }
        Builtin::Next => {
            let mut args = arity(space, name, args, 1, 2)?;
            let default = if args.len() == 2 { args.pop() } else { None };
            if !matches!(args[0], Value::Iterator(_) | Value::Generator(_)) {
                return Err(space.new_exception(
                    ExceptionKind::TypeError,
                    format!("{} object is not an iterator", args[0].type_name()),
                ));
            }
            match (space.iter_next(&args[0])?, default) {
                (Some(value), _) | (None, Some(value)) => Ok(value),
                (None, None) => Err(space.new_exception(ExceptionKind::StopIteration, String::new())),
            }
        }
    }
}

pub(super) fn get_method(value: &Value, name: &str) -> Option<Value> {
    let kind = MethodKind::lookup(value.type_name(), name)?;
    Some(Value::Method(Rc::new(BoundMethod {
        receiver: value.clone(),
        kind,
    })))
}

pub(super) fn call_method(
    space: &SimpleSpace,
    method: &BoundMethod,
    args: FuncArgs<Value>,
) -> ValueResult {
    let name = method.kind.name();
    match (method.kind, &method.receiver) {
        (MethodKind::ListAppend, Value::List(list)) => {
            let mut args = arity(space, name, args, 1, 1)?;
            list.borrow_mut().extend(args.pop());
            Ok(Value::None)
        }
        (MethodKind::ListPop, Value::List(list)) => {
            let args = arity(space, name, args, 0, 1)?;
            let mut items = list.borrow_mut();
            if items.is_empty() {
                return Err(space.new_exception(
                    ExceptionKind::IndexError,
                    "pop from empty list".to_owned(),
                ));
            }
            let last = items.len() as i64 - 1;
            let i = match args.first() {
                Some(index) => int_arg(space, name, index)?,
                None => last,
            };
            let i = if i < 0 { i + last + 1 } else { i };
            if !(0..=last).contains(&i) {
                return Err(space.new_exception(
                    ExceptionKind::IndexError,
                    "pop index out of range".to_owned(),
                ));
            }
            Ok(items.remove(i as usize))
        }
        (MethodKind::DictKeys, Value::Dict(dict)) => {
            arity(space, name, args, 0, 0)?;
            Ok(Value::list(dict.borrow().values().map(|(k, _)| k.clone()).collect()))
        }
        (MethodKind::DictValues, Value::Dict(dict)) => {
            arity(space, name, args, 0, 0)?;
            Ok(Value::list(dict.borrow().values().map(|(_, v)| v.clone()).collect()))
        }
        (MethodKind::DictItems, Value::Dict(dict)) => {
            arity(space, name, args, 0, 0)?;
            Ok(Value::list(
                dict.borrow()
                    .values()
                    .map(|(k, v)| Value::tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            ))
        }
        (MethodKind::DictGet, dict @ Value::Dict(_)) => {
            let mut args = arity(space, name, args, 1, 2)?;
            let default = if args.len() == 2 { args.pop() } else { None };
            Ok(space.lookup(dict, &args[0])?.or(default).unwrap_or(Value::None))
        }
        (MethodKind::GeneratorNext, Value::Generator(jen)) => {
            arity(space, name, args, 0, 0)?;
            jen.next(space)?.ok_or_else(|| {
                space.new_exception(ExceptionKind::StopIteration, String::new())
            })
        }
        (MethodKind::GeneratorSend, Value::Generator(jen)) => {
            let mut args = arity(space, name, args, 1, 1)?;
            let value = args.pop().unwrap_or(Value::None);
            jen.send(space, value)?.ok_or_else(|| {
                space.new_exception(ExceptionKind::StopIteration, String::new())
            })
        }
        (kind, receiver) => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "descriptor '{}' does not apply to a '{}' object",
                kind.name(),
                receiver.type_name()
            ),
        )),
    }
}

/// Instantiate an exception class: `ValueError("msg")`.
pub(super) fn call_exception_type(
    space: &SimpleSpace,
    kind: ExceptionKind,
    args: FuncArgs<Value>,
) -> ValueResult {
    if !args.kwargs.is_empty() {
        return Err(space.new_exception(
            ExceptionKind::TypeError,
            format!("{kind} does not take keyword arguments"),
        ));
    }
    Ok(space.exception_instance(kind, args.args))
}

/// The builtins namespace every frame falls back to.
pub(super) fn make_builtins() -> Value {
    let mut names: IndexMap<String, Value> = IndexMap::new();
    names.insert("None".to_owned(), Value::None);
    names.insert("True".to_owned(), Value::Bool(true));
    names.insert("False".to_owned(), Value::Bool(false));
    for &builtin in Builtin::ALL {
        names.insert(builtin.name().to_owned(), Value::Builtin(builtin));
    }
    for &kind in ExceptionKind::ALL {
        names.insert(kind.name().to_owned(), Value::ExceptionType(kind));
    }
    let dict = Value::empty_dict();
    if let Value::Dict(entries) = &dict {
        let mut entries = entries.borrow_mut();
        for (name, value) in names {
            let key = Value::str(&name);
            if let Some(hashed) = key.hash_key() {
                entries.insert(hashed, (key, value));
            }
        }
    }
    dict
}

/// An iterator over `iterable`, or `None` when it is not iterable.
pub(super) fn iterator_for(iterable: &Value) -> Option<IteratorState> {
    let state = match iterable {
        Value::List(_) | Value::Tuple(_) | Value::Str(_) => IteratorState::Sequence {
            seq: iterable.clone(),
            index: 0,
        },
        Value::Dict(dict) => IteratorState::Items(
            dict.borrow()
                .values()
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>()
                .into_iter(),
        ),
        _ => return None,
    };
    Some(state)
}

pub(super) fn advance(state: &mut IteratorState) -> Option<Value> {
    match state {
        IteratorState::Sequence { seq, index } => {
            let item = match seq {
                Value::List(items) => items.borrow().get(*index).cloned(),
                Value::Tuple(items) => items.get(*index).cloned(),
                Value::Str(s) => s.chars().nth(*index).map(|c| Value::str(c.encode_utf8(&mut [0; 4]))),
                _ => None,
            };
            if item.is_some() {
                *index += 1;
            }
            item
        }
        IteratorState::Items(items) => items.next(),
    }
}
