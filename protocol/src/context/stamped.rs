//! Optimistic-read / exclusive-write guard with stamp escalation.
//!
//! A version counter paired with a `parking_lot::RwLock<()>`:
//!
//! ```text
//! version even  -> no writer inside
//! version odd   -> a writer holds the guard
//! ```
//!
//! - [`StampedLock::try_optimistic_read`] hands out the current (even)
//!   version as a [`ReadStamp`] without touching the lock.
//! - [`StampedLock::validate`] reports whether any writer entered since the
//!   stamp was taken. Reads made under an invalid stamp may be torn and must
//!   be discarded.
//! - [`StampedLock::write`] takes exclusive access. The version is bumped on
//!   entry and again on exit, so every stamp taken before or during the
//!   write section fails validation afterwards.
//! - [`StampedLock::try_convert_to_write`] escalates a stamp: it acquires the
//!   write lock and succeeds only if the version still equals the stamp.
//!   The stamp is consumed either way; a failed escalation means starting
//!   over from a fresh optimistic read.
//!
//! The data protected by the guard keeps its own short-lived locks, so an
//! optimistic reader never races on memory; what the stamp protects is the
//! consistency of several reads taken together.

use std::fmt;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockWriteGuard};

/// Proof of an optimistic read start. Deliberately neither `Clone` nor
/// `Copy`: escalation consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct ReadStamp(u64);

impl ReadStamp {
    /// Version observed when the stamp was issued.
    pub fn version(&self) -> u64 {
        self.0
    }
}

/// See the module documentation.
#[derive(Default)]
pub struct StampedLock {
    version: AtomicU64,
    inner: RwLock<()>,
}

impl fmt::Debug for StampedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StampedLock")
            .field("version", &self.version())
            .field("write_locked", &self.is_write_locked())
            .finish()
    }
}

impl StampedLock {
    /// Creates an unlocked guard at version zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stamp, or `None` while a writer is inside.
    pub fn try_optimistic_read(&self) -> Option<ReadStamp> {
        let version = self.version.load(Ordering::Acquire);
        (version & 1 == 0).then_some(ReadStamp(version))
    }

    /// `true` if no writer has entered since `stamp` was issued.
    pub fn validate(&self, stamp: &ReadStamp) -> bool {
        fence(Ordering::Acquire);
        self.version.load(Ordering::Relaxed) == stamp.0
    }

    /// Blocks until exclusive access is granted.
    pub fn write(&self) -> WriteGuard<'_> {
        let guard = self.inner.write();
        self.version.fetch_add(1, Ordering::AcqRel);
        WriteGuard {
            lock: self,
            _inner: guard,
        }
    }

    /// Escalates `stamp` to exclusive access, failing if a writer intervened.
    pub fn try_convert_to_write(&self, stamp: ReadStamp) -> Option<WriteGuard<'_>> {
        let guard = self.inner.write();
        if self.version.load(Ordering::Acquire) != stamp.0 {
            return None;
        }
        self.version.fetch_add(1, Ordering::AcqRel);
        Some(WriteGuard {
            lock: self,
            _inner: guard,
        })
    }

    /// Current version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether a writer currently holds the guard.
    pub fn is_write_locked(&self) -> bool {
        self.version() & 1 == 1
    }
}

/// Exclusive access to a [`StampedLock`]. Also serves as the witness that
/// registry mutators demand. Releasing it invalidates every outstanding
/// stamp.
pub struct WriteGuard<'a> {
    lock: &'a StampedLock,
    _inner: RwLockWriteGuard<'a, ()>,
}

impl WriteGuard<'_> {
    /// Whether this guard was taken on `lock` itself.
    pub fn guards(&self, lock: &StampedLock) -> bool {
        std::ptr::eq(self.lock, lock)
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("version", &self.lock.version())
            .finish()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // Runs before `_inner` is dropped, so the version is even again
        // by the time the next writer can get in.
        self.lock.version.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fresh_stamp_validates() {
        let lock = StampedLock::new();
        let stamp = lock.try_optimistic_read().unwrap();
        assert_eq!(stamp.version(), 0);
        assert!(lock.validate(&stamp));
    }

    #[test]
    fn write_invalidates_earlier_stamps() {
        let lock = StampedLock::new();
        let stamp = lock.try_optimistic_read().unwrap();
        drop(lock.write());
        assert!(!lock.validate(&stamp));
        assert_eq!(lock.version(), 2);
    }

    #[test]
    fn no_stamp_while_writer_inside() {
        let lock = StampedLock::new();
        let guard = lock.write();
        assert!(lock.is_write_locked());
        assert!(lock.try_optimistic_read().is_none());
        drop(guard);
        assert!(!lock.is_write_locked());
        assert!(lock.try_optimistic_read().is_some());
    }

    #[test]
    fn escalation_succeeds_on_valid_stamp() {
        let lock = StampedLock::new();
        let stamp = lock.try_optimistic_read().unwrap();
        let guard = lock.try_convert_to_write(stamp).expect("uncontended escalation");
        assert!(lock.is_write_locked());
        drop(guard);
        assert_eq!(lock.version(), 2);
    }

    #[test]
    fn escalation_fails_after_intervening_writer() {
        let lock = StampedLock::new();
        let stamp = lock.try_optimistic_read().unwrap();
        drop(lock.write());
        assert!(lock.try_convert_to_write(stamp).is_none());
        // The failed escalation must not leave the guard held.
        assert!(!lock.is_write_locked());
        assert!(lock.try_optimistic_read().is_some());
    }

    #[test]
    fn guard_knows_its_lock() {
        let lock = StampedLock::new();
        let other = StampedLock::new();
        let guard = lock.write();
        assert!(guard.guards(&lock));
        assert!(!guard.guards(&other));
    }

    #[test]
    fn guard_released_during_unwind() {
        let lock = Arc::new(StampedLock::new());
        let inner = Arc::clone(&lock);
        let result = std::thread::spawn(move || {
            let _guard = inner.write();
            panic!("writer blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!lock.is_write_locked());
        assert_eq!(lock.version() % 2, 0);
    }

    #[test]
    fn escalation_waits_out_a_writer_then_fails() {
        let lock = Arc::new(StampedLock::new());
        let stamp = lock.try_optimistic_read().unwrap();

        let writer = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _guard = lock.write();
                std::thread::sleep(Duration::from_millis(20));
            })
        };
        while lock.version() == 0 {
            std::thread::yield_now();
        }
        assert!(lock.try_convert_to_write(stamp).is_none());
        writer.join().unwrap();
        assert!(!lock.is_write_locked());
    }
}
