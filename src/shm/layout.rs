/// `#[repr(C)]` structures that live in the shared arena.
///
/// All structs use fixed-size fields and explicit padding so the layout
/// is identical across compilations and processes. Nothing in the arena
/// holds an absolute pointer: buffer positions are byte offsets from the
/// arena base and entries reference each other by [`EntryId`].
///
/// ```text
/// +--------+---------------------> <---------------------+
/// | Header | Entries region (up)    free    Buffers (down)|
/// +--------+---------------------> <---------------------+
/// 0        HEADER_SIZE                                   total_size
/// ```
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::buffers::BufferRing;
use super::lists::ListHead;
use super::lock::ShmMutex;
use crate::key::KEY_SIZE;
use crate::stats::SharedStats;

/// Magic word stored once the header is fully initialized.
pub const MAGIC: u64 = u64::from_le_bytes(*b"VODBUF01");

pub const VERSION: u32 = 1;

/// Size of the fixed header at the start of the arena.
pub const HEADER_SIZE: usize = 512;

/// Size reserved for the log-context string in the header.
pub const LOG_CTX_SIZE: usize = 128;

/// Values are placed at offsets aligned down to this boundary.
pub const BUFFER_ALIGNMENT: usize = 16;

/// Index of an entry record in the entries region.
pub type EntryId = u32;

/// "No entry" in tree and list links.
pub const NIL: EntryId = u32::MAX;

/// Entry state: on the free list, holds nothing.
pub const ENTRY_FREE: u32 = 0;
/// Entry state: published in the index, payload still being copied.
pub const ENTRY_ALLOCATED: u32 = 1;
/// Entry state: payload complete, fetchable.
pub const ENTRY_READY: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    Free,
    Allocated,
    Ready,
}

impl EntryState {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            ENTRY_ALLOCATED => EntryState::Allocated,
            ENTRY_READY => EntryState::Ready,
            _ => EntryState::Free,
        }
    }
}

/// Header lives at offset 0 of the arena.
#[repr(C)]
pub struct Header {
    pub lock: ShmMutex, // 0..64

    pub magic: AtomicU64,       // 64..72   (0 until initialized)
    pub total_size: u64,        // 72..80
    pub entry_lock_secs: u64,   // 80..88
    pub cache_lock_secs: u64,   // 88..96
    pub expiration_secs: u64,   // 96..104
    pub version: u32,           // 104..108
    pub hash_probe: u32,        // 108..112
    pub entry_size: u32,        // 112..116
    pub entries_margin: u32,    // 116..120
    pub _reserved: u64,         // 120..128

    pub log_ctx: [u8; LOG_CTX_SIZE], // 128..256

    pub stats: SharedStats, // 256..336

    /// Mutable cache state. Only touched while `lock` is held.
    pub control: UnsafeCell<ControlBlock>, // 336..464

    pub _pad: [u8; 48], // 464..512
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

/// Settings the creator records for every attached process.
pub struct HeaderInit<'a> {
    pub total_size: u64,
    pub entry_lock_secs: u64,
    pub cache_lock_secs: u64,
    pub expiration_secs: u64,
    pub hash_probe: u32,
    pub entries_margin: u32,
    pub log_ctx: &'a str,
}

impl Header {
    /// A fresh header with `magic` still unset.
    pub fn new(init: &HeaderInit<'_>) -> Self {
        let mut log_ctx = [0u8; LOG_CTX_SIZE];
        let text = init.log_ctx.as_bytes();
        let len = text.len().min(LOG_CTX_SIZE - 1);
        log_ctx[..len].copy_from_slice(&text[..len]);

        Header {
            lock: ShmMutex::new(),
            magic: AtomicU64::new(0),
            total_size: init.total_size,
            entry_lock_secs: init.entry_lock_secs,
            cache_lock_secs: init.cache_lock_secs,
            expiration_secs: init.expiration_secs,
            version: VERSION,
            hash_probe: init.hash_probe,
            entry_size: ENTRY_SIZE as u32,
            entries_margin: init.entries_margin,
            _reserved: 0,
            log_ctx,
            stats: SharedStats::default(),
            control: UnsafeCell::new(ControlBlock::new(init.total_size)),
            _pad: [0; 48],
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC
    }

    pub fn log_context(&self) -> String {
        let len = self
            .log_ctx
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LOG_CTX_SIZE);
        String::from_utf8_lossy(&self.log_ctx[..len]).into_owned()
    }
}

/// The cache engine's control block.
#[repr(C)]
#[derive(Debug)]
pub struct ControlBlock {
    /// Last fetch or store, in clock seconds.
    pub access_time: u64, // 0..8
    /// Crash marker: set while a multi-structure mutation is in flight.
    pub reset: u32, // 8..12
    /// Entry records carved so far.
    pub entry_count: u32, // 12..16
    pub ring: BufferRing, // 16..48
    pub tables: EntryTables, // 48..80
    pub _pad: [u8; 48], // 80..128
}

const _: () = assert!(std::mem::size_of::<ControlBlock>() == 128);

impl ControlBlock {
    pub fn new(total_size: u64) -> Self {
        ControlBlock {
            access_time: 0,
            reset: 0,
            entry_count: 0,
            ring: BufferRing::new(total_size),
            tables: EntryTables::EMPTY,
            _pad: [0; 48],
        }
    }

    /// End of the entries region.
    pub fn entries_end(&self) -> u64 {
        entries_end(self.entry_count)
    }
}

/// Index root, lifecycle lists and live totals.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryTables {
    pub live_bytes: u64, // 0..8
    pub index_root: EntryId, // 8..12
    pub live_count: u32, // 12..16
    pub free: ListHead, // 16..24
    pub used: ListHead, // 24..32
}

const _: () = assert!(std::mem::size_of::<EntryTables>() == 32);

impl EntryTables {
    pub const EMPTY: EntryTables = EntryTables {
        live_bytes: 0,
        index_root: NIL,
        live_count: 0,
        free: ListHead::EMPTY,
        used: ListHead::EMPTY,
    };
}

/// Metadata record for one cached value.
///
/// Fields ordered u64-first to avoid implicit alignment padding.
#[repr(C)]
#[derive(Debug)]
pub struct Entry {
    pub key: [u8; KEY_SIZE], // 0..16
    pub buffer_start: u64,   // 16..24 (arena offset)
    pub buffer_size: u64,    // 24..32
    pub access_time: u64,    // 32..40
    pub hash: u32,           // 40..44
    /// Written without the lock when a store publishes its payload.
    pub state: AtomicU32, // 44..48
    pub left: EntryId,    // 48..52 (index)
    pub right: EntryId,   // 52..56
    pub height: u32,      // 56..60
    pub prev: EntryId,    // 60..64 (lifecycle list)
    pub next: EntryId,    // 64..68
    pub _pad: u32,        // 68..72
}

pub const ENTRY_SIZE: usize = 72;

const _: () = assert!(std::mem::size_of::<Entry>() == ENTRY_SIZE);

impl Entry {
    pub fn vacant() -> Self {
        Entry {
            key: [0; KEY_SIZE],
            buffer_start: 0,
            buffer_size: 0,
            access_time: 0,
            hash: 0,
            state: AtomicU32::new(ENTRY_FREE),
            left: NIL,
            right: NIL,
            height: 0,
            prev: NIL,
            next: NIL,
            _pad: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> EntryState {
        EntryState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: u32) {
        self.state.store(state, Ordering::Relaxed);
    }

    #[inline]
    pub fn buffer_end(&self) -> u64 {
        self.buffer_start + self.buffer_size
    }
}

/// Offset of the entries region from the start of the arena.
pub const fn entries_offset() -> usize {
    HEADER_SIZE
}

/// Offset of entry `id`.
pub fn entry_offset(id: EntryId) -> usize {
    HEADER_SIZE + id as usize * ENTRY_SIZE
}

/// End of the entries region holding `count` records.
pub fn entries_end(count: u32) -> u64 {
    (HEADER_SIZE + count as usize * ENTRY_SIZE) as u64
}

/// Round `offset` down to [`BUFFER_ALIGNMENT`].
#[inline]
pub fn align_down(offset: u64) -> u64 {
    offset & !(BUFFER_ALIGNMENT as u64 - 1)
}
