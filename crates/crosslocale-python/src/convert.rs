//! Python object <-> Value conversion.

use std::collections::HashSet;

use pyo3::IntoPyObjectExt;
use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyInt, PyList, PyString, PyTuple};

use crosslocale_core::Value;

/// Containers nested deeper than this are treated as unrepresentable, which
/// also stops self-referencing lists.
const MAX_DEPTH: usize = 256;

/// Convert a Python object. Anything without a representation becomes
/// `Value::Invalid`; inside a container that drops the entry on send.
pub fn to_value(obj: &Bound<'_, PyAny>) -> Value {
    to_value_at(obj, 0)
}

fn to_value_at(obj: &Bound<'_, PyAny>, depth: usize) -> Value {
    if obj.is_none() {
        return Value::Nil;
    }
    // bool subclasses int, so it must be checked first.
    if let Ok(b) = obj.cast::<PyBool>() {
        return Value::Bool(b.is_true());
    }
    if obj.is_instance_of::<PyInt>() {
        return match obj.extract::<i64>() {
            Ok(n) => Value::Int64(n),
            Err(_) => obj.extract::<f64>().map_or(Value::Invalid, Value::from_f64),
        };
    }
    if let Ok(f) = obj.cast::<PyFloat>() {
        return Value::from_f64(f.value());
    }
    if let Ok(s) = obj.cast::<PyString>() {
        // Lone surrogates have no UTF-8 encoding.
        return s.to_str().map_or(Value::Invalid, |s| Value::Str(s.to_owned()));
    }

    if depth >= MAX_DEPTH {
        return Value::Invalid;
    }
    if let Ok(list) = obj.cast::<PyList>() {
        return Value::List(list.iter().map(|item| to_value_at(&item, depth + 1)).collect());
    }
    if let Ok(tuple) = obj.cast::<PyTuple>() {
        return Value::List(tuple.iter().map(|item| to_value_at(&item, depth + 1)).collect());
    }
    if let Ok(dict) = obj.cast::<PyDict>() {
        return Value::Dict(
            dict.iter()
                .filter_map(|(key, value)| {
                    let key = key.cast::<PyString>().ok()?.to_str().ok()?.to_owned();
                    Some((key, to_value_at(&value, depth + 1)))
                })
                .collect(),
        );
    }
    Value::Invalid
}

/// Convert a value back into Python objects.
///
/// A `Dict` with repeated keys becomes a list of `(key, value)` tuples so no
/// pair is lost; otherwise it becomes a `dict` in the same order.
///
/// Values received from a backend never contain `Invalid`; converting one
/// raises ``TypeError``.
pub fn to_python<'py>(py: Python<'py>, value: Value) -> PyResult<Bound<'py, PyAny>> {
    match value {
        Value::Invalid => Err(PyTypeError::new_err("value has no Python representation")),
        Value::Nil => Ok(py.None().into_bound(py)),
        Value::Bool(b) => b.into_bound_py_any(py),
        Value::Int64(n) => n.into_bound_py_any(py),
        Value::Float64(n) => n.into_bound_py_any(py),
        Value::Str(s) => s.into_bound_py_any(py),
        Value::List(items) => {
            let items = items
                .into_iter()
                .map(|item| to_python(py, item))
                .collect::<PyResult<Vec<_>>>()?;
            Ok(PyList::new(py, items)?.into_any())
        }
        Value::Dict(entries) => {
            let unique = {
                let mut seen = HashSet::with_capacity(entries.len());
                entries.iter().all(|(key, _)| seen.insert(key.as_str()))
            };
            if unique {
                let dict = PyDict::new(py);
                for (key, value) in entries {
                    dict.set_item(key, to_python(py, value)?)?;
                }
                Ok(dict.into_any())
            } else {
                let pairs = entries
                    .into_iter()
                    .map(|(key, value)| {
                        let value = to_python(py, value)?;
                        PyTuple::new(py, [key.into_bound_py_any(py)?, value])
                    })
                    .collect::<PyResult<Vec<_>>>()?;
                Ok(PyList::new(py, pairs)?.into_any())
            }
        }
    }
}
