pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod shm;
pub mod stats;

#[cfg(feature = "python")]
mod python;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{parse_size, CacheConfig};
pub use error::{Error, Result, StoreError};
pub use key::{CacheKey, KEY_SIZE};
pub use shm::layout::EntryState;
pub use shm::{LiveRange, ShmBufferCache};
pub use stats::StatsSnapshot;
