//! Python `Backend` class.

use std::sync::{Arc, Mutex, PoisonError};

use pyo3::exceptions::{PyException, PyTypeError};
use pyo3::prelude::*;

use crosslocale_core::{Backend, Loopback, Value};

use crate::convert::{to_python, to_value};

pyo3::create_exception!(
    crosslocale,
    BackendError,
    PyException,
    "Raised when a backend call fails. Carries ``id`` and ``description``."
);

/// Build a `BackendError` carrying the symbolic id and description.
pub fn backend_error(py: Python<'_>, err: &crosslocale_core::BackendError) -> PyErr {
    let code = err.code();
    let exc = BackendError::new_err(err.to_string());
    let value = exc.value(py);
    let attached = value
        .setattr("id", code.id())
        .and_then(|()| value.setattr("description", code.description()))
        .and_then(|()| value.setattr("code", code as i32));
    match attached {
        Ok(()) => exc,
        Err(e) => e,
    }
}

fn freed_error(py: Python<'_>) -> PyErr {
    backend_error(py, &crosslocale_core::BackendError::Disconnected)
}

/// One connection to a backend worker.
///
/// `recv` blocks with the GIL released; `recv_async` returns an awaitable.
#[pyclass(name = "Backend", module = "crosslocale", frozen)]
pub struct PyBackend {
    inner: Mutex<Option<Arc<Backend>>>,
}

impl PyBackend {
    fn handle(&self, py: Python<'_>) -> PyResult<Arc<Backend>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| freed_error(py))
    }
}

#[pymethods]
impl PyBackend {
    #[new]
    fn new(py: Python<'_>) -> PyResult<Self> {
        let backend = Backend::new(Loopback).map_err(|e| backend_error(py, &e))?;
        tracing::debug!(backend_id = %backend.id(), "Python backend created");
        Ok(Self {
            inner: Mutex::new(Some(Arc::new(backend))),
        })
    }

    /// Send a message. Raises ``TypeError`` if the object has no
    /// representation at all.
    fn send(&self, py: Python<'_>, message: &Bound<'_, PyAny>) -> PyResult<()> {
        let backend = self.handle(py)?;
        let value = to_value(message);
        if value.is_invalid() {
            let type_name = message.get_type().name()?;
            return Err(PyTypeError::new_err(format!(
                "cannot send object of type {type_name}"
            )));
        }
        backend.send(value).map_err(|e| backend_error(py, &e))
    }

    /// Block until a message arrives.
    fn recv<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let backend = self.handle(py)?;
        let value: Value = py
            .detach(|| backend.recv())
            .map_err(|e| backend_error(py, &e))?;
        to_python(py, value)
    }

    /// Awaitable variant of ``recv``.
    fn recv_async<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let backend = self.handle(py)?;
        pyo3_async_runtimes::tokio::future_into_py(py, async move {
            let result = backend.recv_async().await;
            Python::attach(|py| match result {
                Ok(value) => to_python(py, value).map(Bound::unbind),
                Err(e) => Err(backend_error(py, &e)),
            })
        })
    }

    fn close(&self, py: Python<'_>) -> PyResult<()> {
        self.handle(py)?.close();
        Ok(())
    }

    fn is_closed(&self, py: Python<'_>) -> PyResult<bool> {
        Ok(self.handle(py)?.is_closed())
    }

    /// Shut the backend down. Later calls raise ``BackendError``.
    fn free(&self, py: Python<'_>) -> PyResult<()> {
        let backend = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| freed_error(py))?;
        py.detach(|| backend.shutdown())
            .map_err(|e| backend_error(py, &e))
    }

    fn __enter__(slf: PyRef<'_, Self>) -> PyRef<'_, Self> {
        slf
    }

    fn __exit__(
        &self,
        py: Python<'_>,
        _exc_type: Option<&Bound<'_, PyAny>>,
        _exc_val: Option<&Bound<'_, PyAny>>,
        _exc_tb: Option<&Bound<'_, PyAny>>,
    ) -> PyResult<bool> {
        let freed = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none();
        if !freed {
            self.free(py)?;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::{PyDict, PyList};

    #[test]
    fn send_then_recv() {
        Python::attach(|py| {
            let backend = PyBackend::new(py).unwrap();
            let message = py.eval(c"{'a': 1, 'b': [True, None, 3.14]}", None, None).unwrap();
            backend.send(py, &message).unwrap();

            let reply = backend.recv(py).unwrap();
            assert!(reply.eq(&message).unwrap());
            backend.free(py).unwrap();
        });
    }

    #[test]
    fn invalid_top_level_raises_type_error() {
        Python::attach(|py| {
            let backend = PyBackend::new(py).unwrap();
            let err = backend.send(py, &py.eval(c"object()", None, None).unwrap()).unwrap_err();
            assert!(err.is_instance_of::<PyTypeError>(py));

            // Unrepresentable children are dropped instead.
            let list = PyList::new(py, [1i64]).unwrap();
            list.append(py.eval(c"object()", None, None).unwrap()).unwrap();
            backend.send(py, list.as_any()).unwrap();
            let reply = backend.recv(py).unwrap();
            assert_eq!(reply.repr().unwrap().to_str().unwrap(), "[1]");
            backend.free(py).unwrap();
        });
    }

    #[test]
    fn errors_carry_id_and_description() {
        Python::attach(|py| {
            let backend = PyBackend::new(py).unwrap();
            backend.close(py).unwrap();
            assert!(backend.is_closed(py).unwrap());

            let err = backend.send(py, &py.None().into_bound(py)).unwrap_err();
            assert!(err.is_instance_of::<BackendError>(py));
            let value = err.value(py);
            let id: String = value.getattr("id").unwrap().extract().unwrap();
            let description: String = value.getattr("description").unwrap().extract().unwrap();
            assert_eq!(id, "CROSSLOCALE_ERR_BACKEND_DISCONNECTED");
            assert_eq!(description, "the backend thread has disconnected");
            backend.free(py).unwrap();
        });
    }

    #[test]
    fn recv_async_under_asyncio() {
        Python::attach(|py| {
            let backend = Bound::new(py, PyBackend::new(py).unwrap()).unwrap();
            let locals = PyDict::new(py);
            locals.set_item("backend", &backend).unwrap();
            py.run(
                c"import asyncio

async def receive(b):
    return await b.recv_async()

backend.send(['ping', 2])
reply = asyncio.run(receive(backend))

backend.close()
try:
    asyncio.run(receive(backend))
except Exception as e:
    error_id = e.id
",
                None,
                Some(&locals),
            )
            .unwrap();

            let reply = locals.get_item("reply").unwrap().unwrap();
            assert_eq!(reply.repr().unwrap().to_str().unwrap(), "['ping', 2]");
            let error_id: String = locals.get_item("error_id").unwrap().unwrap().extract().unwrap();
            assert_eq!(error_id, "CROSSLOCALE_ERR_BACKEND_DISCONNECTED");
            backend.get().free(py).unwrap();
        });
    }

    #[test]
    fn calls_after_free_raise() {
        Python::attach(|py| {
            let backend = PyBackend::new(py).unwrap();
            backend.free(py).unwrap();
            assert!(backend.recv(py).unwrap_err().is_instance_of::<BackendError>(py));
            assert!(backend.free(py).is_err());
        });
    }
}
