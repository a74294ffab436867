/// Cross-process mutex stored inside the arena header.
///
/// Layout in shared memory (64 bytes, one cache line):
///   [owner_pid: u32][padding to 64]
///
/// A TTAS spinlock whose lock word is the owner's process id (0 = free).
/// Waiters that spin for a long time check whether the owner is still
/// alive and take the lock over from a dead process. Whatever that process
/// was doing is left to the cache's reset flag.
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::warn;

/// Size reserved for the lock in the arena header: one cache line.
pub const LOCK_SIZE: usize = 64;

/// Busy spins before each waiter starts yielding.
const SPINS_BEFORE_YIELD: u32 = 128;

/// Yielding rounds between two liveness checks of the owner.
const YIELDS_PER_OWNER_CHECK: u32 = 1024;

#[repr(C)]
pub struct ShmMutex {
    owner: AtomicU32,
    _pad: [u8; LOCK_SIZE - 4],
}

const _: () = assert!(std::mem::size_of::<ShmMutex>() == LOCK_SIZE);

/// Releases the lock on drop.
pub struct ShmMutexGuard<'a> {
    lock: &'a ShmMutex,
}

impl ShmMutex {
    pub const fn new() -> Self {
        ShmMutex {
            owner: AtomicU32::new(0),
            _pad: [0; LOCK_SIZE - 4],
        }
    }

    /// Acquire the lock. Spins (then yields) until acquired.
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        let me = std::process::id();
        let mut rounds: u32 = 0;
        loop {
            // Test: spin on load (cache-friendly, no bus traffic)
            let owner = self.owner.load(Ordering::Relaxed);
            if owner == 0 {
                // Test-and-Set
                if self
                    .owner
                    .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return ShmMutexGuard { lock: self };
                }
                continue;
            }

            rounds = rounds.wrapping_add(1);
            if rounds < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
                continue;
            }

            if rounds % YIELDS_PER_OWNER_CHECK == 0
                && owner != me
                && !process_alive(owner)
                && self
                    .owner
                    .compare_exchange(owner, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                warn!(dead_pid = owner, "took over shared cache lock from a dead process");
                return ShmMutexGuard { lock: self };
            }
            std::thread::yield_now();
        }
    }

    /// Acquire the lock if it is free right now.
    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        self.owner
            .compare_exchange(0, std::process::id(), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ShmMutexGuard { lock: self })
    }

    /// Process id of the current holder, 0 when free.
    pub fn owner(&self) -> u32 {
        self.owner.load(Ordering::Relaxed)
    }

    fn unlock(&self) {
        self.owner.store(0, Ordering::Release);
    }
}

impl Default for ShmMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Whether `pid` still names a live process.
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    // EPERM: alive but owned by someone else
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}
