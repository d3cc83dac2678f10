//! crosslocale-python: PyO3 bindings for the crosslocale bridge.

mod backend;
mod convert;

use pyo3::exceptions::PyImportError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crosslocale_core::{
    CRATE_VERSION, FFI_BRIDGE_VERSION, NICE_VERSION, PROTOCOL_VERSION, VersionInfo,
    check_bridge_version, logging,
};

/// Bridge version these bindings were written against.
const EXPECTED_BRIDGE_VERSION: u32 = 5;

/// Initialize tracing with CROSSLOCALE_LOG and LOG_FORMAT support.
///
/// Returns False if logging was already initialized.
#[pyfunction]
fn init_logging(py: Python<'_>) -> bool {
    let installed = logging::init_tracing();
    if installed {
        let version = detect_version(py);
        tracing::info!(
            version = version.nice,
            bridge = version.bridge,
            python = version.host.as_deref().unwrap_or("unknown"),
            "crosslocale logging initialized"
        );
    }
    installed
}

fn detect_version(py: Python<'_>) -> VersionInfo {
    let version = VersionInfo::new();
    if let Ok(sys) = py.import("sys")
        && let Ok(py_version) = sys.getattr("version")
        && let Ok(v) = py_version.extract::<String>()
    {
        let short_version = v.split_whitespace().next().unwrap_or(&v);
        return version.with_host(short_version.to_string());
    }
    version
}

/// Versions of the bindings, the bridge and the running interpreter.
#[pyfunction]
fn version_info(py: Python<'_>) -> PyResult<Bound<'_, PyDict>> {
    let version = detect_version(py);
    let info = PyDict::new(py);
    info.set_item("crosslocale", version.crosslocale)?;
    info.set_item("nice", version.nice)?;
    info.set_item("bridge", version.bridge)?;
    info.set_item("protocol", version.protocol)?;
    info.set_item("python", version.host)?;
    Ok(info)
}

#[pymodule]
#[pyo3(name = "crosslocale")]
fn crosslocale_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Refuse to load against a core with a different wire shape.
    check_bridge_version(EXPECTED_BRIDGE_VERSION)
        .map_err(|e| PyImportError::new_err(e.to_string()))?;

    m.add("__version__", CRATE_VERSION)?;
    m.add("NICE_VERSION", NICE_VERSION)?;
    m.add("FFI_BRIDGE_VERSION", FFI_BRIDGE_VERSION)?;
    m.add("PROTOCOL_VERSION", PROTOCOL_VERSION)?;

    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add_function(wrap_pyfunction!(version_info, m)?)?;

    m.add_class::<backend::PyBackend>()?;
    m.add("BackendError", m.py().get_type::<backend::BackendError>())?;

    Ok(())
}
