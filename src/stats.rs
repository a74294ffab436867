/// Cache statistics.
///
/// Counters live in the arena header and are bumped with relaxed atomic
/// adds, so any process can update them with or without the cache lock.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by every attached process.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedStats {
    pub store_ok: AtomicU64,
    pub store_bytes: AtomicU64,
    pub store_err: AtomicU64,
    pub store_exists: AtomicU64,
    pub fetch_hit: AtomicU64,
    pub fetch_bytes: AtomicU64,
    pub fetch_miss: AtomicU64,
    pub evicted: AtomicU64,
    pub evicted_bytes: AtomicU64,
    pub reset: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<SharedStats>() == 80);

impl SharedStats {
    #[inline]
    pub fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn counters(&self) -> [&AtomicU64; 10] {
        [
            &self.store_ok,
            &self.store_bytes,
            &self.store_err,
            &self.store_exists,
            &self.fetch_hit,
            &self.fetch_bytes,
            &self.fetch_miss,
            &self.evicted,
            &self.evicted_bytes,
            &self.reset,
        ]
    }

    /// Copy the counters, adding the gauges computed by the caller.
    pub fn snapshot(&self, entries: u64, data_size: u64) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            store_ok: load(&self.store_ok),
            store_bytes: load(&self.store_bytes),
            store_err: load(&self.store_err),
            store_exists: load(&self.store_exists),
            fetch_hit: load(&self.fetch_hit),
            fetch_bytes: load(&self.fetch_bytes),
            fetch_miss: load(&self.fetch_miss),
            evicted: load(&self.evicted),
            evicted_bytes: load(&self.evicted_bytes),
            reset: load(&self.reset),
            entries,
            data_size,
        }
    }
}

/// Point-in-time copy of the counters plus two gauges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub store_ok: u64,
    pub store_bytes: u64,
    pub store_err: u64,
    pub store_exists: u64,
    pub fetch_hit: u64,
    pub fetch_bytes: u64,
    pub fetch_miss: u64,
    pub evicted: u64,
    pub evicted_bytes: u64,
    pub reset: u64,
    /// Live entries (allocated or ready).
    pub entries: u64,
    /// Bytes spanned by live values in the buffers region.
    pub data_size: u64,
}

impl StatsSnapshot {
    /// Named fields in status-page order.
    pub fn fields(&self) -> [(&'static str, u64); 12] {
        [
            ("store_ok", self.store_ok),
            ("store_bytes", self.store_bytes),
            ("store_err", self.store_err),
            ("store_exists", self.store_exists),
            ("fetch_hit", self.fetch_hit),
            ("fetch_bytes", self.fetch_bytes),
            ("fetch_miss", self.fetch_miss),
            ("evicted", self.evicted),
            ("evicted_bytes", self.evicted_bytes),
            ("reset", self.reset),
            ("entries", self.entries),
            ("data_size", self.data_size),
        ]
    }

    /// Render as a sequence of `<name>value</name>` elements.
    pub fn write_xml<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        for (name, value) in self.fields() {
            write!(out, "<{name}>{value}</{name}>")?;
        }
        Ok(())
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.fields() {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}
