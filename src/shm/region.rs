/// Shared memory region management using mmap.
///
/// Creates or opens a named memory-mapped file that holds the entire
/// arena. The first process to create the file reports
/// `already_existed = false` and is the only one that initializes it.
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use memmap2::MmapMut;
use tracing::warn;

/// How long an attacher waits for the creator to size the file.
const SIZE_WAIT: Duration = Duration::from_secs(2);

/// Where to store the mmap files.
pub fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        // macOS and other Unix: use TMPDIR
        std::env::temp_dir().join("buffer_cache")
    }
}

/// A mapped arena, owning the mmap handle.
pub struct ShmRegion {
    mmap: MmapMut,
    base: NonNull<u8>,
    path: Option<PathBuf>,
    /// Inode of the mapped file, 0 for an anonymous mapping.
    ino: u64,
}

impl ShmRegion {
    /// Map `dir/name`, creating it with `size` bytes if it does not exist.
    ///
    /// Returns the region and whether the file already existed. An existing
    /// file keeps its own size; the caller validates it against the header.
    /// A file its creator never sized is removed and created afresh.
    pub fn map_or_create(dir: &Path, name: &str, size: usize) -> io::Result<(Self, bool)> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let path = dir.join(name);

        for _ in 0..2 {
            if let Some(region) = Self::try_create(&path, size)? {
                return Ok((region, false));
            }
            let file = match fs::OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                // removed between the two opens
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if Self::wait_for_size(&file)? {
                // Safety: shared file mapping; all access to the contents
                // goes through the arena lock or atomics.
                let mmap = unsafe { MmapMut::map_mut(&file)? };
                return Ok((Self::from_file(mmap, path, &file)?, true));
            }
            warn!(path = %path.display(), "removing a cache file that was never sized");
            remove_if_same(&path, file.metadata()?.ino())?;
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "shared buffer cache file was never sized",
        ))
    }

    /// Create and map a new file. `None` if it already exists.
    fn try_create(path: &Path, size: usize) -> io::Result<Option<Self>> {
        match fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => {
                file.set_len(size as u64)?;
                // Safety: the file is new and sized; nobody else initializes it.
                let mmap = unsafe { MmapMut::map_mut(&file)? };
                Ok(Some(Self::from_file(mmap, path.to_path_buf(), &file)?))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A private, zero-filled mapping. Shared only with forked children.
    pub fn anonymous(size: usize) -> io::Result<Self> {
        let mmap = MmapMut::map_anon(size)?;
        Ok(Self::from_mmap(mmap, None, 0))
    }

    fn from_file(mmap: MmapMut, path: PathBuf, file: &fs::File) -> io::Result<Self> {
        Ok(Self::from_mmap(mmap, Some(path), file.metadata()?.ino()))
    }

    fn from_mmap(mut mmap: MmapMut, path: Option<PathBuf>, ino: u64) -> Self {
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        ShmRegion {
            mmap,
            base,
            path,
            ino,
        }
    }

    /// The creator sets the length right after creating the file. False if
    /// it never did.
    fn wait_for_size(file: &fs::File) -> io::Result<bool> {
        let deadline = Instant::now() + SIZE_WAIT;
        loop {
            if file.metadata()?.len() > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn base_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Backing file, `None` for an anonymous mapping.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Remove the backing file. Existing mappings stay valid.
    pub fn unlink(&self) -> io::Result<()> {
        match &self.path {
            Some(path) => match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Remove the backing file, unless another process already replaced it.
    pub fn unlink_stale(&self) -> io::Result<()> {
        match &self.path {
            Some(path) => remove_if_same(path, self.ino),
            None => Ok(()),
        }
    }
}

fn remove_if_same(path: &Path, ino: u64) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.ino() == ino => match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        },
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_dir() -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "buffer_cache_region_{}_{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ))
    }

    #[test]
    fn second_mapping_sees_the_first() {
        let dir = scratch_dir();
        let (first, existed) = ShmRegion::map_or_create(&dir, "arena", 4096).unwrap();
        assert!(!existed);
        assert_eq!(first.len(), 4096);
        unsafe { first.base_ptr().add(100).write(0xAB) };

        let (second, existed) = ShmRegion::map_or_create(&dir, "arena", 4096).unwrap();
        assert!(existed);
        assert_ne!(first.base_ptr(), second.base_ptr());
        assert_eq!(unsafe { second.base_ptr().add(100).read() }, 0xAB);

        first.unlink().unwrap();
        assert!(!dir.join("arena").exists());
        // already gone
        second.unlink().unwrap();
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn existing_file_keeps_its_size() {
        let dir = scratch_dir();
        let (first, _) = ShmRegion::map_or_create(&dir, "arena", 8192).unwrap();
        let (second, existed) = ShmRegion::map_or_create(&dir, "arena", 4096).unwrap();
        assert!(existed);
        assert_eq!(second.len(), 8192);
        first.unlink().unwrap();
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn never_sized_file_is_replaced() {
        let dir = scratch_dir();
        fs::create_dir_all(&dir).unwrap();
        fs::File::create(dir.join("arena")).unwrap();

        let (region, existed) = ShmRegion::map_or_create(&dir, "arena", 4096).unwrap();
        assert!(!existed);
        assert_eq!(region.len(), 4096);
        assert_eq!(fs::metadata(dir.join("arena")).unwrap().len(), 4096);
        region.unlink().unwrap();
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn stale_unlink_spares_a_replacement() {
        let dir = scratch_dir();
        let (old, _) = ShmRegion::map_or_create(&dir, "arena", 4096).unwrap();
        old.unlink().unwrap();
        let (new, existed) = ShmRegion::map_or_create(&dir, "arena", 4096).unwrap();
        assert!(!existed);

        old.unlink_stale().unwrap();
        assert!(dir.join("arena").exists());
        new.unlink_stale().unwrap();
        assert!(!dir.join("arena").exists());
        let _ = fs::remove_dir(&dir);
    }

    #[test]
    fn anonymous_region_is_zeroed() {
        let region = ShmRegion::anonymous(4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert!(region.path().is_none());
        let bytes = unsafe { std::slice::from_raw_parts(region.base_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        region.unlink().unwrap();
        region.unlink_stale().unwrap();
    }
}
