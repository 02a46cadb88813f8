//! Subscription: indexing and slicing of sequences, and dict lookup.

use super::{SimpleSpace, Slice, Value, hash_key};
use crate::{
    exceptions::{ExceptionKind, OpResult},
    space::ObjectSpace,
};

type ValueResult<T = Value> = OpResult<T, Value>;

fn slice_bound(space: &SimpleSpace, value: &Value) -> ValueResult<Option<i64>> {
    match value {
        Value::None => Ok(None),
        other => other.as_int().map(Some).ok_or_else(|| {
            space.new_exception(
                ExceptionKind::TypeError,
                "slice indices must be integers or None".to_owned(),
            )
        }),
    }
}

/// The positions a slice selects in a sequence of `len` items, in order.
fn slice_positions(space: &SimpleSpace, slice: &Slice, len: usize) -> ValueResult<(Vec<usize>, i64)> {
    let len = len as i64;
    let step = slice_bound(space, &slice.step)?.unwrap_or(1);
    if step == 0 {
        return Err(space.new_exception(
            ExceptionKind::ValueError,
            "slice step cannot be zero".to_owned(),
        ));
    }
    let clamp = |bound: Option<i64>, default: i64| match bound {
        None => default,
        Some(i) => {
            let i = if i < 0 { i + len } else { i };
            if i < 0 {
                if step < 0 { -1 } else { 0 }
            } else if i >= len {
                if step < 0 { len - 1 } else { len }
            } else {
                i
            }
        }
    };
    let (start_default, stop_default) = if step < 0 { (len - 1, -1) } else { (0, len) };
    let start = clamp(slice_bound(space, &slice.start)?, start_default);
    let stop = clamp(slice_bound(space, &slice.stop)?, stop_default);

    let mut positions = Vec::new();
    let mut i = start;
    while (step > 0 && i < stop) || (step < 0 && i > stop) {
        positions.push(i as usize);
        i += step;
    }
    Ok((positions, step))
}

fn index(space: &SimpleSpace, type_name: &str, key: &Value, len: usize) -> ValueResult<usize> {
    let Some(i) = key.as_int() else {
        return Err(space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "{type_name} indices must be integers, not {}",
                key.type_name()
            ),
        ));
    };
    let len = len as i64;
    let i = if i < 0 { i + len } else { i };
    if (0..len).contains(&i) {
        Ok(i as usize)
    } else {
        Err(space.new_exception(
            ExceptionKind::IndexError,
            format!("{type_name} index out of range"),
        ))
    }
}

fn key_error(space: &SimpleSpace, key: &Value) -> crate::OperationError<Value> {
    let kind = ExceptionKind::KeyError;
    crate::OperationError::new(
        Value::ExceptionType(kind),
        space.exception_instance(kind, vec![key.clone()]),
    )
}

pub(super) fn get_item(space: &SimpleSpace, obj: &Value, key: &Value) -> ValueResult {
    match (obj, key) {
        (Value::List(list), Value::Slice(slice)) => {
            let items = list.borrow();
            let (positions, _) = slice_positions(space, slice, items.len())?;
            Ok(Value::list(positions.into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::List(list), _) => {
            let items = list.borrow();
            let i = index(space, "list", key, items.len())?;
            Ok(items[i].clone())
        }
        (Value::Tuple(items), Value::Slice(slice)) => {
            let (positions, _) = slice_positions(space, slice, items.len())?;
            Ok(Value::tuple(positions.into_iter().map(|i| items[i].clone()).collect()))
        }
        (Value::Tuple(items), _) => {
            let i = index(space, "tuple", key, items.len())?;
            Ok(items[i].clone())
        }
        (Value::Str(s), Value::Slice(slice)) => {
            let chars: Vec<char> = s.chars().collect();
            let (positions, _) = slice_positions(space, slice, chars.len())?;
            let out: String = positions.into_iter().map(|i| chars[i]).collect();
            Ok(Value::str(&out))
        }
        (Value::Str(s), _) => {
            let chars: Vec<char> = s.chars().collect();
            let i = index(space, "string", key, chars.len())?;
            Ok(Value::str(chars[i].encode_utf8(&mut [0; 4])))
        }
        (Value::Dict(dict), _) => {
            let hashed = hash_key(space, key)?;
            match dict.borrow().get(&hashed) {
                Some((_, value)) => Ok(value.clone()),
                None => Err(key_error(space, key)),
            }
        }
        _ => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!("'{}' object is not subscriptable", obj.type_name()),
        )),
    }
}

pub(super) fn set_item(space: &SimpleSpace, obj: &Value, key: &Value, value: Value) -> ValueResult<()> {
    match (obj, key) {
        (Value::List(list), Value::Slice(slice)) => {
            // collect first, the source may be the list itself
            let new_items = space.iterate(&value)?;
            let mut items = list.borrow_mut();
            let (positions, step) = slice_positions(space, slice, items.len())?;
            if step == 1 {
                let start = positions.first().copied().unwrap_or_else(|| {
                    // empty selection: insert where the slice starts
                    match slice_bound(space, &slice.start) {
                        Ok(Some(i)) if i < 0 => (i + items.len() as i64).max(0) as usize,
                        Ok(Some(i)) => (i as usize).min(items.len()),
                        _ => 0,
                    }
                });
                let end = start + positions.len();
                items.splice(start..end, new_items);
                return Ok(());
            }
            if new_items.len() != positions.len() {
                return Err(space.new_exception(
                    ExceptionKind::ValueError,
                    format!(
                        "attempt to assign sequence of size {} to extended slice of size {}",
                        new_items.len(),
                        positions.len()
                    ),
                ));
            }
            for (i, item) in positions.into_iter().zip(new_items) {
                items[i] = item;
            }
            Ok(())
        }
        (Value::List(list), _) => {
            let mut items = list.borrow_mut();
            let i = index(space, "list", key, items.len())?;
            items[i] = value;
            Ok(())
        }
        (Value::Dict(dict), _) => {
            let hashed = hash_key(space, key)?;
            dict.borrow_mut().insert(hashed, (key.clone(), value));
            Ok(())
        }
        _ => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "'{}' object does not support item assignment",
                obj.type_name()
            ),
        )),
    }
}

pub(super) fn del_item(space: &SimpleSpace, obj: &Value, key: &Value) -> ValueResult<()> {
    match (obj, key) {
        (Value::List(list), Value::Slice(slice)) => {
            let mut items = list.borrow_mut();
            let (mut positions, _) = slice_positions(space, slice, items.len())?;
            positions.sort_unstable();
            for i in positions.into_iter().rev() {
                items.remove(i);
            }
            Ok(())
        }
        (Value::List(list), _) => {
            let mut items = list.borrow_mut();
            let i = index(space, "list", key, items.len())?;
            items.remove(i);
            Ok(())
        }
        (Value::Dict(dict), _) => {
            let hashed = hash_key(space, key)?;
            match dict.borrow_mut().shift_remove(&hashed) {
                Some(_) => Ok(()),
                None => Err(key_error(space, key)),
            }
        }
        _ => Err(space.new_exception(
            ExceptionKind::TypeError,
            format!(
                "'{}' object doesn't support item deletion",
                obj.type_name()
            ),
        )),
    }
}
