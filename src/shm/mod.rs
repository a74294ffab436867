/// Shared-memory buffer cache engine.
///
/// Provides `ShmBufferCache`, a cross-process cache of variable-length
/// values keyed by 128-bit keys. Everything (header, entry records, value
/// bytes) lives in one mapped arena. Entry records grow up from the header,
/// value bytes grow down from the arena end.
///
/// One lock in the header guards all metadata. Payload bytes are copied
/// outside the lock: a store publishes its entry by flipping the entry state
/// to `Ready` with a single atomic write. Zero-copy fetches stay valid for
/// the entry lease only; `fetch_owned` copies under the lock. Stats are
/// updated via atomics (no lock).
pub mod buffers;
pub mod index;
pub mod layout;
pub mod lists;
pub mod lock;
pub mod region;

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{compiler_fence, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::{Error, Result, StoreError};
use crate::key::{CacheKey, HASH_PROBE_KEY, KEY_SIZE};
use crate::stats::{SharedStats, StatsSnapshot};
use buffers::{AllocError, BufferRing};
use layout::{
    entries_end, entries_offset, entry_offset, ControlBlock, Entry, EntryId, EntryState,
    EntryTables, Header, HeaderInit, ENTRY_ALLOCATED, ENTRY_FREE, ENTRY_READY, ENTRY_SIZE,
    HEADER_SIZE, MAGIC, VERSION,
};
use region::ShmRegion;

/// How long an attacher waits for the creator to publish the header.
const INIT_WAIT: Duration = Duration::from_secs(2);

/// Key, state and byte range of one live entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveRange {
    pub key: CacheKey,
    pub state: EntryState,
    /// Offset of the value from the arena base.
    pub start: u64,
    pub len: u64,
}

impl LiveRange {
    pub fn end(&self) -> u64 {
        self.start + self.len
    }
}

/// The main shared-memory cache handle.
///
/// Multiple processes sharing the same arena each hold their own handle,
/// possibly mapped at different base addresses.
pub struct ShmBufferCache<C: Clock = SystemClock> {
    region: ShmRegion,
    clock: C,
    entry_lock_secs: u64,
    cache_lock_secs: u64,
    /// Bytes kept free past the entries region for entry growth.
    margin_bytes: u64,
    log_ctx: String,
}

/// A store that owns an `Allocated` entry and its buffer run.
///
/// The lock is already released; the payload is copied by [`publish`].
///
/// [`publish`]: Reservation::publish
pub(crate) struct Reservation<'a> {
    base: *mut u8,
    id: EntryId,
    start: u64,
    size: u64,
    _cache: PhantomData<&'a ()>,
}

impl Reservation<'_> {
    /// Copy `parts` into the run in order, then mark the entry `Ready`.
    pub(crate) fn publish(self, parts: &[&[u8]]) {
        unsafe {
            let mut dest = self.base.add(self.start as usize);
            let mut remaining = self.size as usize;
            for part in parts {
                let len = part.len().min(remaining);
                ptr::copy_nonoverlapping(part.as_ptr(), dest, len);
                dest = dest.add(len);
                remaining -= len;
            }

            // The only metadata write done without the lock. Release orders
            // the payload copy before it.
            let entry = self.base.add(entry_offset(self.id)) as *const Entry;
            let state = &*ptr::addr_of!((*entry).state);
            let _ = state.compare_exchange(
                ENTRY_ALLOCATED,
                ENTRY_READY,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
    }
}

impl ShmBufferCache<SystemClock> {
    /// Create the named arena, or attach to it if it already exists.
    pub fn create(config: &CacheConfig) -> Result<Self> {
        Self::create_with_clock(config, SystemClock)
    }

    /// A cache over a private anonymous mapping.
    pub fn anonymous(config: &CacheConfig) -> Result<Self> {
        Self::anonymous_with_clock(config, SystemClock)
    }
}

impl<C: Clock> ShmBufferCache<C> {
    pub fn create_with_clock(config: &CacheConfig, clock: C) -> Result<Self> {
        config.validate()?;
        let dir = config.dir.clone().unwrap_or_else(region::shm_dir);
        let (mut region, mut existed) =
            ShmRegion::map_or_create(&dir, &config.name, config.size)?;
        if existed {
            match Self::attach_header(&region, config) {
                Err(Error::BadMagic) => {
                    // the creator died before publishing the header
                    warn!(
                        path = ?region.path(),
                        "replacing a shared buffer cache that was never initialized"
                    );
                    region.unlink_stale()?;
                    (region, existed) =
                        ShmRegion::map_or_create(&dir, &config.name, config.size)?;
                    if existed {
                        Self::attach_header(&region, config)?;
                    }
                }
                other => other?,
            }
        }
        Self::open(region, existed, config, clock)
    }

    pub fn anonymous_with_clock(config: &CacheConfig, clock: C) -> Result<Self> {
        config.validate()?;
        let region = ShmRegion::anonymous(config.size)?;
        Self::open(region, false, config, clock)
    }

    /// Finish opening `region`. An existing arena must already have passed
    /// [`attach_header`](Self::attach_header).
    fn open(region: ShmRegion, existed: bool, config: &CacheConfig, clock: C) -> Result<Self> {
        if !existed {
            Self::init_header(&region, config);
        }

        // Safety: the region holds at least a header, initialized or checked.
        let header = unsafe { &*(region.base_ptr() as *const Header) };
        let cache = ShmBufferCache {
            entry_lock_secs: header.entry_lock_secs,
            cache_lock_secs: header.cache_lock_secs,
            margin_bytes: header.entries_margin as u64 * ENTRY_SIZE as u64,
            log_ctx: header.log_context(),
            region,
            clock,
        };

        info!(
            cache = %cache.log_ctx,
            size = header.total_size,
            existed,
            path = ?cache.region.path(),
            "shared buffer cache ready"
        );
        Ok(cache)
    }

    fn init_header(region: &ShmRegion, config: &CacheConfig) {
        let log_ctx = format!("in buffer cache \"{}\"", config.name);
        let header = Header::new(&HeaderInit {
            total_size: config.size as u64,
            entry_lock_secs: config.entry_lock_expiration.as_secs(),
            cache_lock_secs: config.cache_lock_expiration.as_secs(),
            expiration_secs: config.expiration.as_secs(),
            hash_probe: HASH_PROBE_KEY.short_hash(),
            entries_margin: config.entries_margin,
            log_ctx: &log_ctx,
        });
        let base = region.base_ptr() as *mut Header;
        // Safety: validate() guarantees the arena is larger than the header,
        // and nobody attaches before magic is set.
        unsafe {
            ptr::write(base, header);
            (*base).magic.store(MAGIC, Ordering::Release);
        }
    }

    fn attach_header(region: &ShmRegion, config: &CacheConfig) -> Result<()> {
        if region.len() < HEADER_SIZE {
            return Err(Error::LayoutMismatch {
                field: "mapped_size",
                expected: config.size as u64,
                found: region.len() as u64,
            });
        }
        // Safety: at least HEADER_SIZE bytes are mapped.
        let header = unsafe { &*(region.base_ptr() as *const Header) };

        let deadline = Instant::now() + INIT_WAIT;
        while !header.is_initialized() {
            if Instant::now() >= deadline {
                return Err(Error::BadMagic);
            }
            std::thread::sleep(Duration::from_millis(1));
        }

        let checks: [(&'static str, u64, u64); 5] = [
            ("version", VERSION as u64, header.version as u64),
            ("total_size", config.size as u64, header.total_size),
            ("mapped_size", header.total_size, region.len() as u64),
            ("entry_size", ENTRY_SIZE as u64, header.entry_size as u64),
            (
                "entries_margin",
                config.entries_margin as u64,
                header.entries_margin as u64,
            ),
        ];
        for (field, expected, found) in checks {
            if expected != found {
                return Err(Error::LayoutMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }

        if header.hash_probe != HASH_PROBE_KEY.short_hash() {
            return Err(Error::HasherMismatch);
        }
        Ok(())
    }

    fn header(&self) -> &Header {
        unsafe { &*(self.region.base_ptr() as *const Header) }
    }

    fn stats(&self) -> &SharedStats {
        &self.header().stats
    }

    /// Get the control block. Caller must hold the arena lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn control_mut(&self) -> &mut ControlBlock {
        &mut *self.header().control.get()
    }

    /// The first `count` entry records. Caller must hold the arena lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn entries_mut(&self, count: u32) -> &mut [Entry] {
        let base = self.region.base_ptr().add(entries_offset()) as *mut Entry;
        std::slice::from_raw_parts_mut(base, count as usize)
    }

    /// Backing file path, `None` for an anonymous arena.
    pub fn path(&self) -> Option<&std::path::Path> {
        self.region.path()
    }

    /// Total arena size in bytes.
    pub fn size(&self) -> usize {
        self.region.len()
    }

    /// Look up a key. Returns the value bytes on hit, without copying.
    ///
    /// A hit pins the entry against eviction for the entry lease
    /// (`entry_lock_expiration`). Once the lease runs out, any store in any
    /// process may evict the entry and overwrite its bytes.
    ///
    /// # Safety
    ///
    /// The caller must be done with the returned slice before the entry
    /// lease expires. Reading it afterwards may observe bytes another store
    /// is writing. Use [`fetch_owned`](Self::fetch_owned) when that cannot
    /// be guaranteed.
    pub unsafe fn fetch(&self, key: &CacheKey) -> Option<&[u8]> {
        let found = {
            let _guard = self.header().lock.lock();
            self.pin_locked(key)
        };
        self.count_fetch(found.map(|(_, size)| size));
        let (start, size) = found?;
        Some(std::slice::from_raw_parts(
            self.region.base_ptr().add(start as usize),
            size as usize,
        ))
    }

    /// Look up a key and copy the value out.
    ///
    /// The copy is made under the arena lock, so no store can evict the
    /// entry while it is read.
    pub fn fetch_owned(&self, key: &CacheKey) -> Option<Vec<u8>> {
        let value = {
            let _guard = self.header().lock.lock();
            self.pin_locked(key).map(|(start, size)| {
                // Safety: a ready entry's run lies inside the mapping, and
                // evicting it needs the lock held here.
                unsafe {
                    std::slice::from_raw_parts(
                        self.region.base_ptr().add(start as usize),
                        size as usize,
                    )
                }
                .to_vec()
            })
        };
        self.count_fetch(value.as_ref().map(|v| v.len() as u64));
        value
    }

    /// Find a ready entry and refresh its lease. Caller must hold the lock.
    fn pin_locked(&self, key: &CacheKey) -> Option<(u64, u64)> {
        // Safety: lock held.
        let cb = unsafe { self.control_mut() };
        if cb.reset != 0 {
            // mid-recovery: nothing can be trusted
            return None;
        }
        let entries = unsafe { self.entries_mut(cb.entry_count) };
        let limit = self.region.len() as u64;
        let hash = key.short_hash();
        let id = index::lookup(entries, cb.tables.index_root, hash, key.as_bytes())?;
        let e = &mut entries[id as usize];
        if e.state() != EntryState::Ready || e.buffer_end() > limit {
            return None;
        }
        let now = self.clock.now_secs();
        e.access_time = now;
        cb.access_time = now;
        Some((e.buffer_start, e.buffer_size))
    }

    fn count_fetch(&self, hit_size: Option<u64>) {
        let stats = self.stats();
        match hit_size {
            Some(size) => {
                SharedStats::bump(&stats.fetch_hit, 1);
                SharedStats::bump(&stats.fetch_bytes, size);
            }
            None => SharedStats::bump(&stats.fetch_miss, 1),
        }
    }

    /// Store the concatenation of `parts` under `key`.
    ///
    /// Returns false if the value was not cached; see [`try_store`] for why.
    ///
    /// [`try_store`]: Self::try_store
    pub fn store(&self, key: &CacheKey, parts: &[&[u8]]) -> bool {
        self.try_store(key, parts).is_ok()
    }

    pub fn try_store(&self, key: &CacheKey, parts: &[&[u8]]) -> std::result::Result<(), StoreError> {
        let size: usize = parts.iter().map(|part| part.len()).sum();
        let result = self
            .reserve(key, size)
            .map(|reservation| reservation.publish(parts));

        let stats = self.stats();
        match result {
            Ok(()) => {
                SharedStats::bump(&stats.store_ok, 1);
                SharedStats::bump(&stats.store_bytes, size as u64);
            }
            Err(StoreError::Exists) => SharedStats::bump(&stats.store_exists, 1),
            Err(e) => {
                SharedStats::bump(&stats.store_err, 1);
                debug!(cache = %self.log_ctx, key = %key, size, error = %e, "store failed");
            }
        }
        result
    }

    /// Claim an entry and a run for `key` under the lock.
    pub(crate) fn reserve(
        &self,
        key: &CacheKey,
        size: usize,
    ) -> std::result::Result<Reservation<'_>, StoreError> {
        let hash = key.short_hash();
        let header = self.header();
        let _guard = header.lock.lock();
        let now = self.clock.now_secs();
        // Safety: lock held.
        let cb = unsafe { self.control_mut() };

        if cb.reset != 0 {
            if now < cb.access_time.saturating_add(self.cache_lock_secs) {
                return Err(StoreError::Recovering);
            }
            warn!(
                cache = %self.log_ctx,
                entries = cb.tables.live_count,
                "resetting cache left dirty by an interrupted store"
            );
            self.reset_locked(cb);
        } else {
            let entries = unsafe { self.entries_mut(cb.entry_count) };
            if index::lookup(entries, cb.tables.index_root, hash, key.as_bytes()).is_some() {
                return Err(StoreError::Exists);
            }
            cb.reset = 1;
        }
        // the marker lands before any mutation
        compiler_fence(Ordering::SeqCst);

        let result = self.reserve_locked(cb, key, hash, size as u64, now);
        compiler_fence(Ordering::SeqCst);
        cb.reset = 0;

        result.map(|(id, start)| Reservation {
            base: self.region.base_ptr(),
            id,
            start,
            size: size as u64,
            _cache: PhantomData,
        })
    }

    fn reserve_locked(
        &self,
        cb: &mut ControlBlock,
        key: &CacheKey,
        hash: u32,
        size: u64,
        now: u64,
    ) -> std::result::Result<(EntryId, u64), StoreError> {
        let floor = cb.entries_end() + self.margin_bytes;
        let limit = cb.ring.limit(floor);
        if size > limit {
            return Err(StoreError::ValueTooLarge {
                size: size as usize,
                limit: limit as usize,
            });
        }

        let id = self.obtain_entry(cb, now).ok_or(StoreError::NoFreeEntry)?;

        let entries = unsafe { self.entries_mut(cb.entry_count) };
        let floor = cb.entries_end() + self.margin_bytes;
        let ControlBlock { ring, tables, .. } = &mut *cb;

        let start = match ring.allocate(size, floor, |ring| {
            self.evict_oldest(tables, entries, ring, now)
        }) {
            Ok(start) => start,
            Err(e) => {
                // the record never left the free state
                tables.free.push_back(entries, id);
                return Err(match e {
                    AllocError::TooLarge { limit } => StoreError::ValueTooLarge {
                        size: size as usize,
                        limit: limit as usize,
                    },
                    AllocError::NoSpace => StoreError::NoBufferSpace,
                });
            }
        };

        let e = &mut entries[id as usize];
        e.key = *key.as_bytes();
        e.hash = hash;
        e.buffer_start = start;
        e.buffer_size = size;
        // pinned before the payload is even copied
        e.access_time = now;
        e.set_state(ENTRY_ALLOCATED);

        tables.used.push_back(entries, id);
        index::insert(entries, &mut tables.index_root, id);
        tables.live_count += 1;
        tables.live_bytes += size;
        cb.access_time = now;

        Ok((id, start))
    }

    /// Pop a free entry, carving a new record if there is room, evicting
    /// the oldest entry otherwise.
    fn obtain_entry(&self, cb: &mut ControlBlock, now: u64) -> Option<EntryId> {
        let entries = unsafe { self.entries_mut(cb.entry_count) };
        if let Some(id) = cb.tables.free.pop_front(entries) {
            return Some(id);
        }

        let next_end = entries_end(cb.entry_count.checked_add(1)?);
        if next_end <= cb.ring.start && next_end <= self.region.len() as u64 {
            let id = cb.entry_count;
            // Safety: the record lies below the buffers region and inside
            // the mapping.
            unsafe {
                ptr::write(
                    self.region.base_ptr().add(entry_offset(id)) as *mut Entry,
                    Entry::vacant(),
                );
            }
            cb.entry_count += 1;
            return Some(id);
        }

        if !self.evict_oldest(&mut cb.tables, entries, &mut cb.ring, now) {
            return None;
        }
        cb.tables.free.pop_front(entries)
    }

    /// Evict the head of the used list unless it is still pinned.
    fn evict_oldest(
        &self,
        tables: &mut EntryTables,
        entries: &mut [Entry],
        ring: &mut BufferRing,
        now: u64,
    ) -> bool {
        let Some(id) = tables.used.front() else {
            return false;
        };
        let (access_time, start, size) = {
            let e = &entries[id as usize];
            (e.access_time, e.buffer_start, e.buffer_size)
        };
        if now < access_time.saturating_add(self.entry_lock_secs) {
            debug!(cache = %self.log_ctx, entry = id, "oldest entry is pinned");
            return false;
        }

        index::remove(entries, &mut tables.index_root, id);
        tables.used.remove(entries, id);
        entries[id as usize].set_state(ENTRY_FREE);
        tables.free.push_back(entries, id);
        tables.live_count = tables.live_count.saturating_sub(1);
        tables.live_bytes = tables.live_bytes.saturating_sub(size);
        ring.release(start, tables.used.is_empty());

        let stats = self.stats();
        SharedStats::bump(&stats.evicted, 1);
        SharedStats::bump(&stats.evicted_bytes, size);
        true
    }

    /// Drop every entry without walking the (possibly damaged) structures.
    fn reset_locked(&self, cb: &mut ControlBlock) {
        let stats = self.stats();
        SharedStats::bump(&stats.evicted, cb.tables.live_count as u64);
        SharedStats::bump(&stats.evicted_bytes, cb.tables.live_bytes);
        SharedStats::bump(&stats.reset, 1);

        cb.entry_count = 0;
        cb.ring = BufferRing::new(self.header().total_size);
        cb.tables = EntryTables::EMPTY;
    }

    /// Counters plus the current entry count and data span.
    pub fn get_stats(&self) -> StatsSnapshot {
        let header = self.header();
        let (entries, data_size) = {
            let _guard = header.lock.lock();
            let cb = unsafe { self.control_mut() };
            (cb.tables.live_count as u64, cb.ring.data_size())
        };
        header.stats.snapshot(entries, data_size)
    }

    /// Zero the counters. Cache contents are untouched.
    pub fn reset_stats(&self) {
        self.stats().clear();
    }

    /// Every live entry, oldest first.
    pub fn live_ranges(&self) -> Vec<LiveRange> {
        let header = self.header();
        let _guard = header.lock.lock();
        let cb = unsafe { self.control_mut() };
        let entries = unsafe { self.entries_mut(cb.entry_count) };
        cb.tables
            .used
            .iter(entries, entries.len())
            .filter_map(|id| entries.get(id as usize))
            .map(|e| LiveRange {
                key: CacheKey::new(e.key),
                state: e.state(),
                start: e.buffer_start,
                len: e.buffer_size,
            })
            .collect()
    }

    /// Walk every shared structure and report the first inconsistency.
    pub fn check_integrity(&self) -> std::result::Result<(), String> {
        let header = self.header();
        let _guard = header.lock.lock();
        let cb = unsafe { self.control_mut() };

        if cb.reset != 0 {
            return Err("reset flag is set".into());
        }

        let ring = cb.ring;
        let count = cb.entry_count;
        if ring.end != header.total_size
            || ring.start > ring.end
            || !(ring.start..=ring.end).contains(&ring.write)
            || !(ring.start..=ring.end).contains(&ring.read)
        {
            return Err(format!("buffer cursors out of bounds: {ring:?}"));
        }
        if entries_end(count) > ring.start {
            return Err(format!(
                "entries region ends at {} past buffers start {}",
                entries_end(count),
                ring.start
            ));
        }

        let entries = unsafe { self.entries_mut(count) };
        let tables = cb.tables;

        let mut free = 0usize;
        for id in tables.free.iter(entries, entries.len() + 1) {
            let Some(e) = entries.get(id as usize) else {
                return Err(format!("free list links past the entries region: {id}"));
            };
            if e.state() != EntryState::Free {
                return Err(format!("entry {id} on the free list is {:?}", e.state()));
            }
            free += 1;
        }

        let mut ranges = Vec::new();
        let mut keys: HashSet<[u8; KEY_SIZE]> = HashSet::new();
        let mut bytes = 0u64;
        for id in tables.used.iter(entries, entries.len() + 1) {
            let Some(e) = entries.get(id as usize) else {
                return Err(format!("used list links past the entries region: {id}"));
            };
            if e.state() == EntryState::Free {
                return Err(format!("entry {id} on the used list is free"));
            }
            if index::lookup(entries, tables.index_root, e.hash, &e.key) != Some(id) {
                return Err(format!("entry {id} is missing from the index"));
            }
            if !keys.insert(e.key) {
                return Err(format!("key {} appears twice", CacheKey::new(e.key)));
            }
            if !ring.holds(e.buffer_start, e.buffer_size) {
                return Err(format!(
                    "entry {id} run [{}, {}) outside live data {ring:?}",
                    e.buffer_start,
                    e.buffer_end()
                ));
            }
            ranges.push((e.buffer_start, e.buffer_end()));
            bytes += e.buffer_size;
        }

        if free + ranges.len() != count as usize {
            return Err(format!(
                "{count} entries carved, {free} free and {} used",
                ranges.len()
            ));
        }
        if ranges.len() != tables.live_count as usize || bytes != tables.live_bytes {
            return Err(format!(
                "live totals {}/{} disagree with the used list {}/{bytes}",
                tables.live_count,
                tables.live_bytes,
                ranges.len()
            ));
        }
        let indexed = index::check(entries, tables.index_root)?;
        if indexed != ranges.len() {
            return Err(format!("index holds {indexed} entries, used list {}", ranges.len()));
        }

        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(format!("runs {:?} and {:?} overlap", pair[0], pair[1]));
            }
        }

        if tables.used.is_empty() && (ring.read != ring.end || ring.write != ring.end) {
            return Err(format!("empty cache with cursors not collapsed: {ring:?}"));
        }
        Ok(())
    }

    /// Remove the backing file. Attached handles keep working.
    pub fn unlink(&self) -> Result<()> {
        self.region.unlink()?;
        Ok(())
    }

    /// Leave the reset flag set, as a store that died mid-mutation would.
    #[cfg(test)]
    fn mark_interrupted(&self) {
        let _guard = self.header().lock.lock();
        unsafe { self.control_mut().reset = 1 };
    }
}

// ShmBufferCache is Send+Sync because all mutations go through the shm lock
unsafe impl<C: Clock> Send for ShmBufferCache<C> {}
unsafe impl<C: Clock> Sync for ShmBufferCache<C> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::collections::HashMap;

    const LEASE: u64 = 5;

    /// Arena for exactly `n` values of 100 bytes (112 aligned) with a
    /// margin of `margin` entry records.
    fn sized_for(n: usize, margin: u32) -> usize {
        HEADER_SIZE + n * (ENTRY_SIZE + 112) + margin as usize * ENTRY_SIZE
    }

    fn cache(size: usize, margin: u32) -> (ShmBufferCache<ManualClock>, ManualClock) {
        let clock = ManualClock::new(1000);
        let config = CacheConfig::new("test", size).with_entries_margin(margin);
        let cache = ShmBufferCache::anonymous_with_clock(&config, clock.clone()).unwrap();
        (cache, clock)
    }

    fn key(i: u32) -> CacheKey {
        CacheKey::derive(&i.to_le_bytes())
    }

    #[test]
    fn round_trip_with_gather() {
        let (cache, _) = cache(64 << 10, 16);
        let k = key(1);
        assert!(cache.store(&k, &[b"hello ", b"shared ", b"world"]));
        // Safety: read well within the lease.
        assert_eq!(unsafe { cache.fetch(&k) }, Some(&b"hello shared world"[..]));
        assert_eq!(cache.fetch_owned(&k), Some(b"hello shared world".to_vec()));

        let stats = cache.get_stats();
        assert_eq!(stats.store_ok, 1);
        assert_eq!(stats.store_bytes, 18);
        assert_eq!(stats.fetch_hit, 2);
        assert_eq!(stats.fetch_bytes, 36);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.data_size, 32);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn missing_key_is_a_miss() {
        let (cache, _) = cache(64 << 10, 16);
        assert_eq!(cache.fetch_owned(&key(7)), None);
        assert_eq!(cache.get_stats().fetch_miss, 1);
    }

    #[test]
    fn empty_value_round_trips() {
        let (cache, _) = cache(64 << 10, 16);
        assert!(cache.store(&key(1), &[]));
        assert_eq!(cache.fetch_owned(&key(1)).as_deref(), Some(&b""[..]));
        cache.check_integrity().unwrap();
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (cache, _) = cache(64 << 10, 16);
        let k = key(1);
        assert_eq!(cache.try_store(&k, &[b"first"]), Ok(()));
        assert_eq!(cache.try_store(&k, &[b"second"]), Err(StoreError::Exists));
        assert_eq!(cache.fetch_owned(&k).as_deref(), Some(&b"first"[..]));

        let stats = cache.get_stats();
        assert_eq!(stats.store_exists, 1);
        assert_eq!(stats.store_err, 0);
    }

    #[test]
    fn value_too_large_is_permanent() {
        let (cache, _) = cache(64 << 10, 16);
        let value = vec![0u8; 64 << 10];
        let err = cache.try_store(&key(1), &[&value]).unwrap_err();
        assert!(matches!(err, StoreError::ValueTooLarge { size, .. } if size == value.len()));
        assert!(!err.is_retryable());
        assert_eq!(cache.get_stats().store_err, 1);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn allocated_entry_is_not_visible() {
        let (cache, _) = cache(64 << 10, 16);
        let k = key(1);
        let reservation = cache.reserve(&k, 5).unwrap();

        assert_eq!(cache.fetch_owned(&k), None);
        assert_eq!(cache.try_store(&k, &[b"other"]), Err(StoreError::Exists));
        assert_eq!(cache.live_ranges()[0].state, EntryState::Allocated);

        reservation.publish(&[b"value"]);
        assert_eq!(cache.fetch_owned(&k).as_deref(), Some(&b"value"[..]));
        assert_eq!(cache.live_ranges()[0].state, EntryState::Ready);
    }

    #[test]
    fn oldest_entries_are_evicted_first() {
        let (cache, clock) = cache(sized_for(10, 4), 4);
        let value = [7u8; 100];
        for i in 0..30 {
            assert!(cache.store(&key(i), &[&value]), "store {i}");
            clock.advance(LEASE);
        }

        let live: Vec<u32> = (0..30).filter(|&i| cache.fetch_owned(&key(i)).is_some()).collect();
        assert_eq!(live, (20..30).collect::<Vec<_>>());

        let stats = cache.get_stats();
        assert_eq!(stats.store_ok - stats.evicted, live.len() as u64);
        assert_eq!(stats.entries, live.len() as u64);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn pinned_entry_survives_store_pressure() {
        let (cache, clock) = cache(sized_for(10, 4), 4);
        let value = [1u8; 100];
        for i in 0..10 {
            assert!(cache.store(&key(i), &[&value]));
        }
        clock.advance(LEASE);

        // pins the head of the used list
        assert!(cache.fetch_owned(&key(0)).is_some());
        for i in 10..20 {
            assert_eq!(
                cache.try_store(&key(i), &[&value]),
                Err(StoreError::NoBufferSpace)
            );
        }
        assert!(cache.fetch_owned(&key(0)).is_some());
        cache.check_integrity().unwrap();

        clock.advance(LEASE);
        assert!(cache.store(&key(10), &[&value]));
        assert_eq!(cache.fetch_owned(&key(0)), None);
        assert!(cache.fetch_owned(&key(1)).is_some());
        cache.check_integrity().unwrap();
    }

    #[test]
    fn owned_copy_outlives_eviction() {
        let (cache, clock) = cache(sized_for(4, 4), 4);
        assert!(cache.store(&key(0), &[&[0xAA; 100]]));
        let held = cache.fetch_owned(&key(0)).unwrap();

        for i in 1..20 {
            clock.advance(LEASE);
            assert!(cache.store(&key(i), &[&[0xBB; 100]]), "store {i}");
        }
        assert_eq!(cache.fetch_owned(&key(0)), None);
        assert!(cache.get_stats().evicted >= 16);
        assert_eq!(held, vec![0xAAu8; 100]);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn empty_value_keeps_the_ring_honest() {
        let (cache, clock) = cache(sized_for(4, 4), 4);
        assert!(cache.store(&key(0), &[&[1u8; 100]]));
        clock.advance(LEASE);
        assert!(cache.store(&key(1), &[]));

        // evicts key 0, then stops at the pinned empty value
        assert_eq!(
            cache.try_store(&key(2), &[&[1u8; 500]]),
            Err(StoreError::NoBufferSpace)
        );
        let stats = cache.get_stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.data_size, 16);

        // fits at the top without touching the empty value
        assert!(cache.store(&key(3), &[&[2u8; 16]]));
        assert_eq!(cache.fetch_owned(&key(1)).as_deref(), Some(&b""[..]));
        assert_eq!(cache.get_stats().evicted, 1);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn stats_are_stable_without_operations() {
        let (cache, _) = cache(64 << 10, 16);
        cache.store(&key(1), &[b"abc"]);
        cache.fetch_owned(&key(1));
        cache.fetch_owned(&key(2));
        assert_eq!(cache.get_stats(), cache.get_stats());

        cache.reset_stats();
        let stats = cache.get_stats();
        assert_eq!(stats.store_ok, 0);
        assert_eq!(stats.fetch_hit, 0);
        // gauges come from the live structures
        assert_eq!(stats.entries, 1);
        assert!(cache.fetch_owned(&key(1)).is_some());
    }

    #[test]
    fn interrupted_store_locks_out_then_resets() {
        let (cache, clock) = cache(64 << 10, 16);
        for i in 0..5 {
            assert!(cache.store(&key(i), &[b"payload"]));
        }
        cache.mark_interrupted();

        assert_eq!(cache.fetch_owned(&key(0)), None);
        let err = cache.try_store(&key(100), &[b"new"]).unwrap_err();
        assert_eq!(err, StoreError::Recovering);
        assert!(err.is_retryable());
        assert!(cache.check_integrity().is_err());

        clock.advance(LEASE);
        assert!(cache.store(&key(100), &[b"new"]));

        let stats = cache.get_stats();
        assert_eq!(stats.reset, 1);
        assert_eq!(stats.evicted, 5);
        assert_eq!(stats.evicted_bytes, 5 * 7);
        assert_eq!(stats.store_err, 1);
        assert_eq!(stats.entries, 1);
        for i in 0..5 {
            assert_eq!(cache.fetch_owned(&key(i)), None);
        }
        assert_eq!(cache.fetch_owned(&key(100)).as_deref(), Some(&b"new"[..]));
        assert_eq!(cache.live_ranges().len(), 1);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn thousand_entries_then_one_more() {
        let (cache, clock) = cache(sized_for(1000, 16), 16);
        let value = [0x5au8; 100];
        for i in 0..1000 {
            assert!(cache.store(&key(i), &[&value]), "store {i}");
        }
        for i in 0..1000 {
            assert!(cache.fetch_owned(&key(i)).is_some(), "fetch {i}");
        }

        clock.advance(LEASE);
        assert!(cache.store(&key(1000), &[&value]));
        assert_eq!(cache.fetch_owned(&key(0)), None);
        for i in 1..=1000 {
            assert_eq!(cache.fetch_owned(&key(i)).as_deref(), Some(&value[..]), "fetch {i}");
        }

        let stats = cache.get_stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.entries, 1000);
        cache.check_integrity().unwrap();
    }

    #[test]
    fn wrapping_stores_never_overlap() {
        let (cache, clock) = cache(32 << 10, 16);
        let mut wrapped = false;
        let mut newest: Option<u64> = None;
        for i in 0..400u32 {
            let size = 50 + (i as usize * 37) % 700;
            let value = vec![i as u8; size];
            assert!(cache.store(&key(i), &[&value]), "store {i}");
            clock.advance(LEASE);

            let ranges = cache.live_ranges();
            let last = ranges.last().unwrap();
            if newest.is_some_and(|prev| last.start > prev) {
                wrapped = true;
            }
            newest = Some(last.start);

            let mut sorted = ranges.clone();
            sorted.sort_by_key(|r| r.start);
            for pair in sorted.windows(2) {
                assert!(pair[0].end() <= pair[1].start, "{pair:?}");
            }
            cache.check_integrity().unwrap();
        }
        assert!(wrapped);
        assert!(cache.get_stats().evicted > 0);
    }

    fn payload(id: u32, size: usize) -> Vec<u8> {
        (0..size).map(|i| (id as usize * 31 + i) as u8).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn stores_round_trip_and_stay_consistent(
            ops in prop::collection::vec((0u32..40, 0usize..900, 0u64..4, any::<bool>()), 1..150),
        ) {
            let (cache, clock) = cache(16 << 10, 8);
            let mut model: HashMap<u32, Vec<u8>> = HashMap::new();

            for (id, size, tick, fetch_first) in ops {
                clock.advance(tick);
                if fetch_first {
                    if let Some(bytes) = cache.fetch_owned(&key(id)).as_deref() {
                        prop_assert_eq!(Some(bytes), model.get(&id).map(Vec::as_slice));
                    }
                }

                let value = payload(id, size);
                match cache.try_store(&key(id), &[&value[..size / 2], &value[size / 2..]]) {
                    Ok(()) => {
                        prop_assert_eq!(cache.fetch_owned(&key(id)), Some(value.clone()));
                        model.insert(id, value);
                    }
                    Err(StoreError::Exists) => {
                        prop_assert!(cache.fetch_owned(&key(id)).is_some());
                    }
                    Err(e) => prop_assert!(e.is_retryable(), "{e}"),
                }
                prop_assert_eq!(cache.check_integrity(), Ok(()));
            }

            let fetchable = (0..40)
                .filter(|&id| match cache.fetch_owned(&key(id)).as_deref() {
                    Some(bytes) => model.get(&id).map(Vec::as_slice) == Some(bytes),
                    None => false,
                })
                .count() as u64;
            let stats = cache.get_stats();
            prop_assert_eq!(stats.store_ok - stats.evicted, fetchable);
        }
    }
}
