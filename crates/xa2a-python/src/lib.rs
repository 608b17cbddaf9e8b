//! Python bindings for xa2a
//!
//! Exposes the per-call fast-path policy so a Python dispatcher can decide,
//! without touching device memory, whether a call goes to the custom path.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use xa2a_core::{A2aConfig, DType, DevicePtr, FastPathPolicy, TensorView};

fn parse_dtype(name: &str) -> PyResult<DType> {
    let short = name.strip_prefix("torch.").unwrap_or(name);
    DType::from_name(short)
        .ok_or_else(|| PyValueError::new_err(format!("unsupported dtype: {name}")))
}

/// Configuration resolved from the `XA2A_*` environment variables
#[pyclass(frozen)]
struct Config {
    inner: A2aConfig,
}

#[pymethods]
impl Config {
    #[new]
    fn new() -> Self {
        Self {
            inner: A2aConfig::from_env(),
        }
    }

    #[getter]
    fn max_size(&self) -> usize {
        self.inner.max_size
    }

    #[getter]
    fn peer_output_size(&self) -> usize {
        self.inner.peer_output_size
    }

    #[getter]
    fn barrier_max_size(&self) -> usize {
        self.inner.barrier_max_size
    }

    #[getter]
    fn rank_data_size(&self) -> usize {
        self.inner.rank_data_size
    }

    #[getter]
    fn disabled(&self) -> bool {
        self.inner.disabled
    }

    #[getter]
    fn visible_devices(&self) -> Option<Vec<u32>> {
        self.inner.visible_devices.clone()
    }

    fn __repr__(&self) -> String {
        format!("{:?}", self.inner)
    }
}

/// True if the fast path supports a group of this size
#[pyfunction]
fn supported_world_size(world_size: usize) -> bool {
    xa2a_core::SUPPORTED_WORLD_SIZES.contains(&world_size)
}

/// Rows a call sends, honouring offsets when given
#[pyfunction]
#[pyo3(signature = (split_sizes, split_offsets=None))]
fn block_count(split_sizes: Vec<i64>, split_offsets: Option<Vec<i64>>) -> PyResult<i64> {
    xa2a_core::block_count(&split_sizes, split_offsets.as_deref())
        .ok_or_else(|| PyValueError::new_err("block count overflows a 64-bit integer"))
}

/// Evaluate the per-call predicate for a tensor described by its layout.
///
/// Layouts or splits whose sizes overflow are reported as ineligible.
#[pyfunction]
#[pyo3(signature = (
    shape,
    strides,
    dtype,
    storage_offset,
    storage_bytes,
    split_sizes,
    split_offsets=None,
    full_mesh=true,
    max_size=None,
))]
#[allow(clippy::too_many_arguments)]
fn should_use_fast_path(
    shape: Vec<usize>,
    strides: Vec<usize>,
    dtype: &str,
    storage_offset: usize,
    storage_bytes: usize,
    split_sizes: Vec<i64>,
    split_offsets: Option<Vec<i64>>,
    full_mesh: bool,
    max_size: Option<usize>,
) -> PyResult<bool> {
    if shape.len() != strides.len() {
        return Err(PyValueError::new_err(format!(
            "shape has {} dims but strides has {}",
            shape.len(),
            strides.len()
        )));
    }
    let input = TensorView {
        ptr: DevicePtr::NULL,
        shape,
        strides,
        storage_offset,
        storage_bytes,
        dtype: parse_dtype(dtype)?,
    };
    let policy = FastPathPolicy {
        enabled: true,
        full_mesh,
        max_size: max_size.unwrap_or(xa2a_core::config::DEFAULT_MAX_SIZE),
    };
    Ok(xa2a_core::should_use_fast_path(
        &policy,
        &input,
        &split_sizes,
        split_offsets.as_deref(),
    ))
}

#[pymodule]
fn xa2a(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Config>()?;
    m.add_function(wrap_pyfunction!(supported_world_size, m)?)?;
    m.add_function(wrap_pyfunction!(block_count, m)?)?;
    m.add_function(wrap_pyfunction!(should_use_fast_path, m)?)?;
    m.add("ALIGNMENT", xa2a_core::ALIGNMENT)?;
    Ok(())
}
