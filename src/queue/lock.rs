//! Cross-process named locks
//!
//! A lock is held by whoever managed to exclusively create its 1-byte marker
//! file; releasing deletes the marker. Waiters retry until a bounded timeout
//! expires. Waiters in the same process park on a condition variable and are
//! woken as soon as the holder releases.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::QueueError;

/// In-process wakeup for one lock name
#[derive(Default)]
pub struct LockSignal {
    mutex: Mutex<()>,
    released: Condvar,
}

impl LockSignal {
    fn notify(&self) {
        let _guard = self.mutex.lock();
        self.released.notify_all();
    }
}

/// Held lock; dropping it releases the lock
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    name: String,
    path: PathBuf,
    signal: Arc<LockSignal>,
}

impl LockGuard {
    pub(crate) fn acquire(
        name: &str,
        path: PathBuf,
        signal: Arc<LockSignal>,
        timeout: Duration,
        retry: Duration,
    ) -> Result<Self, QueueError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            // Held across the attempt so a same-process release cannot slip
            // in between the failed create and the wait.
            let mut parked = signal.mutex.lock();
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut marker) => {
                    marker.write_all(&[1])?;
                    drop(parked);
                    return Ok(Self {
                        name: name.to_string(),
                        path,
                        signal,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::LockTimeout {
                    name: name.to_string(),
                    waited: now - started,
                });
            }
            signal
                .released
                .wait_for(&mut parked, retry.min(deadline - now));
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock '{}': {}", self.name, e);
        }
        self.signal.notify();
    }
}
