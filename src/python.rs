use pyo3::exceptions::{PyOSError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict, PyTuple};

use crate::config::{self, CacheConfig};
use crate::error::Error;
use crate::key::{CacheKey, KEY_SIZE};
use crate::shm::ShmBufferCache;

impl From<Error> for PyErr {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(_) => PyOSError::new_err(format!("Failed to open shared buffer cache: {e}")),
            other => PyValueError::new_err(other.to_string()),
        }
    }
}

/// A shared-memory buffer cache, attachable from several processes.
///
/// Keys are 16-byte `bytes` objects; values are arbitrary `bytes`.
#[pyclass(frozen)]
pub struct SharedBufferCache {
    name: String,
    cache: parking_lot::RwLock<Option<ShmBufferCache>>,
}

#[pymethods]
impl SharedBufferCache {
    #[new]
    #[pyo3(signature = (name, size, entry_lock_expiration=5, cache_lock_expiration=5, dir=None))]
    fn new(
        name: String,
        size: &Bound<'_, PyAny>,
        entry_lock_expiration: u64,
        cache_lock_expiration: u64,
        dir: Option<String>,
    ) -> PyResult<Self> {
        // 67108864 or "64m"
        let size = match size.extract::<usize>() {
            Ok(size) => size,
            Err(_) => config::parse_size(&size.extract::<String>()?)?,
        };

        let mut config = CacheConfig::new(name.clone(), size)
            .with_entry_lock_expiration(std::time::Duration::from_secs(entry_lock_expiration))
            .with_cache_lock_expiration(std::time::Duration::from_secs(cache_lock_expiration));
        if let Some(dir) = dir {
            config = config.with_dir(dir);
        }

        let cache = ShmBufferCache::create(&config)?;
        Ok(SharedBufferCache {
            name,
            cache: parking_lot::RwLock::new(Some(cache)),
        })
    }

    /// Cache lookup. Returns a copy of the value, or None on miss.
    fn fetch<'py>(&self, py: Python<'py>, key: &[u8]) -> PyResult<Option<Bound<'py, PyBytes>>> {
        let key = parse_key(key)?;
        let guard = self.cache.read();
        let cache = open_cache(&guard)?;
        Ok(cache
            .fetch_owned(&key)
            .map(|bytes| PyBytes::new(py, &bytes)))
    }

    /// Store the concatenation of `parts`. Returns False if not cached.
    #[pyo3(signature = (key, *parts))]
    fn store(&self, key: &[u8], parts: &Bound<'_, PyTuple>) -> PyResult<bool> {
        let key = parse_key(key)?;
        let items: Vec<Bound<'_, PyAny>> = parts.iter().collect();
        let slices = items
            .iter()
            .map(|part| part.extract::<&[u8]>())
            .collect::<PyResult<Vec<&[u8]>>>()?;

        let guard = self.cache.read();
        let cache = open_cache(&guard)?;
        Ok(cache.store(&key, &slices))
    }

    /// Counters and gauges as a dict, in status-page order.
    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let guard = self.cache.read();
        let snapshot = open_cache(&guard)?.get_stats();
        let dict = PyDict::new(py);
        for (name, value) in snapshot.fields() {
            dict.set_item(name, value)?;
        }
        Ok(dict)
    }

    /// Status page fragment for the stats.
    fn stats_xml(&self) -> PyResult<String> {
        let guard = self.cache.read();
        let snapshot = open_cache(&guard)?.get_stats();
        let mut out = String::new();
        snapshot
            .write_xml(&mut out)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(out)
    }

    fn reset_stats(&self) -> PyResult<()> {
        let guard = self.cache.read();
        open_cache(&guard)?.reset_stats();
        Ok(())
    }

    /// Remove the backing file. Attached handles keep working.
    fn unlink(&self) -> PyResult<()> {
        let guard = self.cache.read();
        open_cache(&guard)?.unlink()?;
        Ok(())
    }

    /// Unmap the arena. Further calls raise ValueError.
    fn close(&self) {
        self.cache.write().take();
    }

    #[getter]
    fn path(&self) -> Option<String> {
        let guard = self.cache.read();
        guard
            .as_ref()
            .and_then(|cache| cache.path())
            .map(|path| path.display().to_string())
    }

    fn __repr__(&self) -> String {
        let state = if self.cache.read().is_some() {
            "open"
        } else {
            "closed"
        };
        format!("SharedBufferCache(name={:?}, {state})", self.name)
    }
}

fn parse_key(key: &[u8]) -> PyResult<CacheKey> {
    CacheKey::from_slice(key).ok_or_else(|| {
        PyValueError::new_err(format!(
            "key must be exactly {KEY_SIZE} bytes, got {}",
            key.len()
        ))
    })
}

fn open_cache(cache: &Option<ShmBufferCache>) -> PyResult<&ShmBufferCache> {
    cache
        .as_ref()
        .ok_or_else(|| PyValueError::new_err("shared buffer cache is closed"))
}

#[pymodule]
fn buffer_cache(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<SharedBufferCache>()?;
    m.add("KEY_SIZE", KEY_SIZE)?;
    Ok(())
}
