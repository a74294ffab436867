/// Cyclic allocator for the buffers region.
///
/// Values are placed downward from the arena end. Four offsets describe
/// the region:
///
/// ```text
///   floor      S          W///////////R             E
///   (entries)  start      write       read          end
/// ```
///
/// - `start` is the lowest offset the region has claimed so far. It only
///   moves down, and never below the floor the caller passes in (entries
///   region end plus the reserved margin).
/// - `write` is where the next value ends; values go right below it.
/// - `read` is the start of the run freed last, i.e. the exclusive upper
///   bound of the oldest live value.
///
/// When `write <= read` (and the two are not equal below `end`) live data
/// is `[W, R)` and free space is `[S, W)` plus `[R, E)`. After a wrap,
/// `write > read`: live data is `[W, E)` plus the older run below `R`, and
/// the only usable gap is `[R, W)`. `write == read < end` is a full ring.
///
/// Every run is at least one alignment unit wide, empty values included, so
/// no live run ever starts exactly at the read head.
use super::layout::{align_down, BUFFER_ALIGNMENT};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferRing {
    pub start: u64,
    pub end: u64,
    pub read: u64,
    pub write: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
    /// Cannot fit even in an empty region. Not worth retrying.
    TooLarge { limit: u64 },
    /// Nothing left to evict, or the oldest value is pinned.
    NoSpace,
}

impl BufferRing {
    /// An empty region ending at `end`.
    pub fn new(end: u64) -> Self {
        BufferRing {
            start: end,
            end,
            read: end,
            write: end,
        }
    }

    /// Whether the write head has wrapped past the read head.
    #[inline]
    pub fn is_wrapped(&self) -> bool {
        self.write > self.read || (self.write == self.read && self.read != self.end)
    }

    /// Bytes spanned by live values.
    pub fn data_size(&self) -> u64 {
        if self.is_wrapped() {
            (self.end - self.write) + (self.read - self.start)
        } else {
            self.read - self.write
        }
    }

    /// Largest value that fits once everything is evicted.
    pub fn limit(&self, floor: u64) -> u64 {
        self.end
            .saturating_sub(floor)
            .saturating_sub(BUFFER_ALIGNMENT as u64)
    }

    /// Allocate `size` bytes; returns the run's start offset.
    ///
    /// `evict` must free the oldest live value and report it through
    /// [`BufferRing::release`], returning false if there is nothing it may
    /// evict. Only `write` (and `start`, when growing) move here.
    pub fn allocate<F>(&mut self, size: u64, floor: u64, mut evict: F) -> Result<u64, AllocError>
    where
        F: FnMut(&mut BufferRing) -> bool,
    {
        let limit = self.limit(floor);
        if size > limit {
            return Err(AllocError::TooLarge { limit });
        }

        let run = size.max(1);
        loop {
            let fit = self.write.checked_sub(run).map(align_down);

            if !self.is_wrapped() {
                // Layout:	S	W/////R		E
                if let Some(start) = fit {
                    if start >= self.start {
                        return Ok(self.claim(start));
                    }
                    // grow toward the entries region
                    if start >= floor {
                        self.start = start;
                        return Ok(self.claim(start));
                    }
                }
                if self.read != self.end {
                    // no room below the write head, continue from the end
                    self.write = self.end;
                    continue;
                }
            } else if let Some(start) = fit.filter(|&start| start >= self.read) {
                // Layout:	S////R		W///E
                return Ok(self.claim(start));
            }

            if !evict(self) {
                return Err(AllocError::NoSpace);
            }
        }
    }

    /// Record that the oldest live value, starting at `freed_start`, is gone.
    pub fn release(&mut self, freed_start: u64, now_empty: bool) {
        if now_empty {
            self.read = self.end;
            self.write = self.end;
        } else {
            self.read = freed_start;
        }
    }

    /// Whether a live run `[start, start + size)` lies where this ring
    /// says live data may be.
    pub fn holds(&self, start: u64, size: u64) -> bool {
        let end = start + size;
        if self.is_wrapped() {
            (start >= self.write && end <= self.end) || (start >= self.start && end <= self.read)
        } else {
            start >= self.write && end <= self.read
        }
    }

    fn claim(&mut self, start: u64) -> u64 {
        self.write = start;
        start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    const END: u64 = 4096;
    const FLOOR: u64 = 1024;

    /// Ring plus a FIFO of live runs standing in for the used list.
    struct Model {
        ring: BufferRing,
        live: VecDeque<(u64, u64)>,
        /// Oldest value pinned: eviction refuses.
        frozen: bool,
    }

    impl Model {
        fn new() -> Self {
            Model {
                ring: BufferRing::new(END),
                live: VecDeque::new(),
                frozen: false,
            }
        }

        fn evict_oldest(&mut self) {
            let (start, _) = self.live.pop_front().unwrap();
            self.ring.release(start, self.live.is_empty());
        }

        fn alloc(&mut self, size: u64) -> Result<u64, AllocError> {
            let live = &mut self.live;
            let frozen = self.frozen;
            let result = self.ring.allocate(size, FLOOR, |ring| {
                if frozen {
                    return false;
                }
                let Some((start, _)) = live.pop_front() else {
                    return false;
                };
                ring.release(start, live.is_empty());
                true
            });
            if let Ok(start) = result {
                self.live.push_back((start, size));
            }
            result
        }

        fn assert_consistent(&self) {
            let mut runs: Vec<_> = self.live.iter().copied().collect();
            runs.sort();
            for pair in runs.windows(2) {
                assert!(pair[0].0 + pair[0].1 <= pair[1].0, "overlap: {runs:?}");
            }
            for &(start, size) in &runs {
                assert!(start >= FLOOR && start + size <= END);
                assert!(start >= self.ring.start);
                assert_eq!(start % BUFFER_ALIGNMENT as u64, 0);
                assert!(self.ring.holds(start, size), "{:?} {start} {size}", self.ring);
            }
            if self.live.is_empty() {
                assert_eq!(self.ring.read, END);
                assert_eq!(self.ring.write, END);
            }
        }
    }

    #[test]
    fn first_allocation_grows_from_the_end() {
        let mut m = Model::new();
        assert_eq!(m.alloc(100), Ok(END - 112));
        assert_eq!(m.ring.start, END - 112);
        assert_eq!(m.ring.write, END - 112);
        assert_eq!(m.ring.read, END);
        assert_eq!(m.ring.data_size(), 112);
    }

    #[test]
    fn too_large_is_permanent() {
        let mut m = Model::new();
        let limit = END - FLOOR - BUFFER_ALIGNMENT as u64;
        assert_eq!(m.alloc(limit + 1), Err(AllocError::TooLarge { limit }));
        assert!(m.alloc(limit).is_ok());
    }

    #[test]
    fn wraps_to_the_end_after_evicting_the_oldest() {
        let mut m = Model::new();
        // 3 x 1008 bytes fill [1072, 4096); the floor stops further growth
        for _ in 0..3 {
            m.alloc(1000).unwrap();
        }
        m.assert_consistent();
        let oldest = m.live[0];

        let start = m.alloc(1000).unwrap();
        // the oldest run at the top was reused exactly
        assert_eq!(start, oldest.0);
        assert_eq!(m.live.len(), 3);
        assert!(m.ring.is_wrapped());
        m.assert_consistent();
    }

    #[test]
    fn full_ring_is_not_mistaken_for_empty() {
        let mut m = Model::new();
        for _ in 0..3 {
            m.alloc(1000).unwrap();
        }
        // reuse the top slot exactly: write == read below the end
        m.alloc(1000).unwrap();
        assert_eq!(m.ring.write, m.ring.read);
        assert!(m.ring.is_wrapped());
        // the next value must evict rather than overwrite
        m.alloc(1000).unwrap();
        assert_eq!(m.live.len(), 3);
        m.assert_consistent();
    }

    #[test]
    fn pinned_oldest_fails_allocation() {
        let mut m = Model::new();
        for _ in 0..3 {
            m.alloc(1000).unwrap();
        }
        m.frozen = true;
        assert_eq!(m.alloc(1000), Err(AllocError::NoSpace));
        // the failed attempt left the live runs untouched
        assert_eq!(m.live.len(), 3);
    }

    #[test]
    fn evicting_everything_collapses_the_cursors() {
        let mut m = Model::new();
        for _ in 0..3 {
            m.alloc(1000).unwrap();
        }
        // needs the whole span
        let big = END - FLOOR - BUFFER_ALIGNMENT as u64;
        m.alloc(big).unwrap();
        assert_eq!(m.live.len(), 1);
        m.assert_consistent();
    }

    #[test]
    fn empty_values_take_one_unit() {
        let mut m = Model::new();
        assert_eq!(m.alloc(0), Ok(END - 16));
        assert_eq!(m.alloc(16), Ok(END - 32));
        m.assert_consistent();
    }

    #[test]
    fn evicting_below_an_empty_value_is_not_full() {
        let mut m = Model::new();
        m.alloc(100).unwrap();
        m.alloc(0).unwrap();
        m.evict_oldest();
        assert!(!m.ring.is_wrapped());
        assert_eq!(m.ring.data_size(), 16);

        // still room below the write head; the empty value stays
        m.frozen = true;
        assert_eq!(m.alloc(100), Ok(END - 240));
        assert_eq!(m.live.len(), 2);
        m.assert_consistent();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn live_runs_never_overlap(sizes in prop::collection::vec(0u64..1500, 1..200)) {
            let mut m = Model::new();
            for size in sizes {
                m.alloc(size).unwrap();
                m.assert_consistent();
            }
        }

        #[test]
        fn pinned_head_is_never_evicted(
            prefill in prop::collection::vec(1u64..800, 1..20),
            sizes in prop::collection::vec(1u64..800, 1..50),
        ) {
            let mut m = Model::new();
            for size in prefill {
                m.alloc(size).unwrap();
            }
            m.frozen = true;
            let before = m.live.clone();
            for size in sizes {
                let n = m.live.len();
                match m.alloc(size) {
                    Ok(_) => prop_assert_eq!(m.live.len(), n + 1),
                    Err(e) => prop_assert_eq!(e, AllocError::NoSpace),
                }
                prop_assert!(m.live.iter().take(before.len()).eq(before.iter()));
                m.assert_consistent();
            }
        }
    }
}
