//! Named shared-memory segments
//!
//! A segment is a file under the segment root (normally `/dev/shm`) mapped
//! into every process that opens it. The first opener creates and sizes the
//! file; later openers wait (bounded) until it reaches full size and then
//! attach to the existing mapping. All access goes
//! through bounds-checked accessors: atomics for header words, copies for
//! the data region.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use memmap2::{MmapOptions, MmapRaw};
use tracing::debug;

use super::lock::{LockGuard, LockSignal};
use super::QueueError;

/// Default wait before a lock acquisition fails
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(100);
/// Default poll interval while another process holds a lock
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_millis(50);
/// Default wait for a segment another handle is still creating
pub const DEFAULT_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Directory that holds segments and lock markers for one node
///
/// Lock waiters inside this process are woken through per-lock condition
/// variables; waiters in other processes fall back to the retry interval.
pub struct SegmentSpace {
    root: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
    attach_timeout: Duration,
    signals: DashMap<String, Arc<LockSignal>>,
}

impl SegmentSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retry: DEFAULT_LOCK_RETRY,
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            signals: DashMap::new(),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_retry(mut self, retry: Duration) -> Self {
        self.lock_retry = retry;
        self
    }

    pub fn with_attach_timeout(mut self, timeout: Duration) -> Self {
        self.attach_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn attach_timeout(&self) -> Duration {
        self.attach_timeout
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Poll `ready` until it holds or the attach timeout elapses
    pub fn wait_attached(&self, mut ready: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + self.attach_timeout;
        loop {
            if ready() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(ATTACH_POLL_INTERVAL);
        }
    }

    /// Create the segment if it does not exist, otherwise attach to it
    pub fn open_segment(&self, name: &str, size: usize) -> Result<Segment, QueueError> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.path(name);

        let (file, created) = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                file.set_len(size as u64)?;
                (file, true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                // The creator sizes the file right after creating it
                let mut actual = 0;
                self.wait_attached(|| {
                    actual = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
                    actual >= size
                });
                if actual < size {
                    return Err(QueueError::SegmentMismatch {
                        name: name.to_string(),
                        expected: size,
                        actual,
                    });
                }
                (file, false)
            }
            Err(e) => return Err(e.into()),
        };

        let map = MmapOptions::new().len(size).map_raw(&file)?;
        debug!(
            "{} segment '{}' ({} bytes)",
            if created { "Created" } else { "Attached" },
            name,
            size
        );

        Ok(Segment {
            name: name.to_string(),
            map,
            created,
        })
    }

    /// Replace any segment left under `name` with a new, zeroed one
    ///
    /// Handles still mapping the old segment keep their memory, but new
    /// openers only see the replacement.
    pub fn create_segment(&self, name: &str, size: usize) -> Result<Segment, QueueError> {
        self.remove_segment(name)?;
        self.open_segment(name, size)
    }

    /// Unlink a segment; mapped handles stay valid until dropped
    pub fn remove_segment(&self, name: &str) -> Result<(), QueueError> {
        match std::fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Acquire the named lock, waiting up to the configured timeout
    pub fn acquire_lock(&self, name: &str) -> Result<LockGuard, QueueError> {
        let signal = self
            .signals
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LockSignal::default()))
            .clone();
        LockGuard::acquire(
            name,
            self.path(name),
            signal,
            self.lock_timeout,
            self.lock_retry,
        )
    }

    /// Remove a lock marker left behind by a crashed holder
    pub fn clear_lock(&self, name: &str) -> Result<(), QueueError> {
        self.remove_segment(name)
    }
}

impl std::fmt::Debug for SegmentSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentSpace")
            .field("root", &self.root)
            .field("lock_timeout", &self.lock_timeout)
            .field("lock_retry", &self.lock_retry)
            .field("attach_timeout", &self.attach_timeout)
            .finish()
    }
}

/// One mapped segment
pub struct Segment {
    name: String,
    map: MmapRaw,
    created: bool,
}

impl Segment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Whether this handle created the segment (and so must initialise it)
    pub fn created(&self) -> bool {
        self.created
    }

    /// Header word at a fixed, 4-byte aligned offset
    pub fn u32_at(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len(),
            "u32 word at {} outside segment '{}'",
            offset,
            self.name
        );
        // SAFETY: the mapping is page aligned, the offset is 4-byte aligned
        // and in bounds, and the reference cannot outlive `self.map`.
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU32) }
    }

    /// Header word at a fixed, 8-byte aligned offset
    pub fn u64_at(&self, offset: usize) -> &AtomicU64 {
        assert!(
            offset % 8 == 0 && offset + 8 <= self.len(),
            "u64 word at {} outside segment '{}'",
            offset,
            self.name
        );
        // SAFETY: as for `u32_at`, with 8-byte alignment.
        unsafe { &*(self.map.as_mut_ptr().add(offset) as *const AtomicU64) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), QueueError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(QueueError::OutOfBounds {
                offset,
                len,
                size: self.len(),
            }),
        }
    }

    /// Copy bytes out of the segment
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), QueueError> {
        self.check(offset, buf.len())?;
        // SAFETY: range checked above; the caller's single-reader contract
        // keeps writers out of this region while it is read.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the segment
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), QueueError> {
        self.check(offset, data.len())?;
        // SAFETY: range checked above; the caller's single-writer contract
        // keeps other writers and readers out of this region.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.map.as_mut_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn zero(&self, offset: usize, len: usize) -> Result<(), QueueError> {
        self.check(offset, len)?;
        // SAFETY: range checked above.
        unsafe {
            std::ptr::write_bytes(self.map.as_mut_ptr().add(offset), 0, len);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("created", &self.created)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_first_opener_creates_second_attaches() {
        let dir = tempfile::tempdir().unwrap();
        let space = SegmentSpace::new(dir.path());

        let a = space.open_segment("seg", 128).unwrap();
        let b = space.open_segment("seg", 128).unwrap();
        assert!(a.created());
        assert!(!b.created());

        a.u32_at(8).store(42, Ordering::Release);
        assert_eq!(b.u32_at(8).load(Ordering::Acquire), 42);

        b.write(100, b"abc").unwrap();
        let mut buf = [0u8; 3];
        a.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn test_attach_smaller_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let space = SegmentSpace::new(dir.path()).with_attach_timeout(Duration::from_millis(20));
        space.open_segment("seg", 64).unwrap();
        assert!(matches!(
            space.open_segment("seg", 128),
            Err(QueueError::SegmentMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_bounds_access() {
        let dir = tempfile::tempdir().unwrap();
        let space = SegmentSpace::new(dir.path());
        let seg = space.open_segment("seg", 64).unwrap();
        assert!(matches!(
            seg.write(60, &[0u8; 8]),
            Err(QueueError::OutOfBounds { .. })
        ));
        assert!(seg.zero(0, 64).is_ok());
    }

    #[test]
    fn test_attach_waits_for_creator_to_size_file() {
        let dir = tempfile::tempdir().unwrap();
        let space = Arc::new(SegmentSpace::new(dir.path()));
        // Created but not sized yet, as seen between create and set_len
        let file = std::fs::File::create(space.path("seg")).unwrap();

        let attacher = {
            let space = space.clone();
            std::thread::spawn(move || space.open_segment("seg", 256))
        };
        std::thread::sleep(Duration::from_millis(30));
        file.set_len(256).unwrap();

        let seg = attacher.join().unwrap().unwrap();
        assert!(!seg.created());
        assert_eq!(seg.len(), 256);
    }

    #[test]
    fn test_create_segment_replaces_old_contents() {
        let dir = tempfile::tempdir().unwrap();
        let space = SegmentSpace::new(dir.path());
        let old = space.open_segment("seg", 128).unwrap();
        old.write(0, b"stale").unwrap();

        let fresh = space.create_segment("seg", 128).unwrap();
        assert!(fresh.created());
        let mut buf = [0u8; 5];
        fresh.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 5]);

        // The old mapping is detached from the new file
        old.write(0, b"later").unwrap();
        fresh.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 5]);
    }

    #[test]
    fn test_remove_missing_segment_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let space = SegmentSpace::new(dir.path());
        assert!(space.remove_segment("nope").is_ok());
    }
}
