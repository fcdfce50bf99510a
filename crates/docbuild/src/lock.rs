//! Named resource-lock registry (SPEC_FULL.md §4.5).
//!
//! A map from `(lock_type, canonical-resource-name)` to a mutex, created
//! lazily under a registry-level mutex, per
//! `original_source/src/docserv/resourcelock.py::ResourceLock`. Lock type
//! is a discriminated tag ([`LockKind`]) rather than a list used as a key,
//! per design note §9. Acquire is blocking by default; try-acquire is
//! supported for the cleanup entry path (finalize is skippable when
//! already in progress).

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use docbuild_types::LockKind;

/// A single named binary lock. Hand-rolled rather than `std::sync::Mutex`
/// because the registry must hand out a lock *handle* that can be held
/// across a long external-process sequence and explicitly released or
/// dropped without fighting guard lifetimes tied to the registry's own
/// map mutex.
struct NamedLock {
    held: Mutex<bool>,
    condvar: Condvar,
}

impl NamedLock {
    fn new() -> Self {
        Self {
            held: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.condvar.wait(held).unwrap();
        }
        *held = true;
    }

    fn try_acquire(&self) -> bool {
        let mut held = self.held.lock().unwrap();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Releases the lock if held. Returns `false` if it was already
    /// unheld, so the caller can log a warning for a double-release
    /// attempt without the registry depending on a reporter.
    fn release(&self) -> bool {
        let mut held = self.held.lock().unwrap();
        if *held {
            *held = false;
            self.condvar.notify_one();
            true
        } else {
            false
        }
    }
}

/// Lazily-populated registry of named locks, keyed by `(LockKind,
/// resource)`. Entries are never removed: locks are reference-owned and
/// survive across instructions, matching §4.5.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<(LockKind, String), Arc<NamedLock>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_create(&self, kind: LockKind, resource: &str) -> Arc<NamedLock> {
        self.locks
            .lock()
            .unwrap()
            .entry((kind, resource.to_string()))
            .or_insert_with(|| Arc::new(NamedLock::new()))
            .clone()
    }

    /// Block until the named lock is free, then hold it. Release by
    /// calling [`LockHandle::release`] or dropping the handle.
    pub fn acquire(&self, kind: LockKind, resource: &str) -> LockHandle {
        let lock = self.get_or_create(kind, resource);
        lock.acquire();
        LockHandle {
            lock: Some(lock),
            kind,
            resource: resource.to_string(),
            held: true,
        }
    }

    /// Non-blocking acquire, for the cleanup entry path (§4.5: "try-acquire
    /// is supported for the cleanup entry path").
    pub fn try_acquire(&self, kind: LockKind, resource: &str) -> Option<LockHandle> {
        let lock = self.get_or_create(kind, resource);
        if lock.try_acquire() {
            Some(LockHandle {
                lock: Some(lock),
                kind,
                resource: resource.to_string(),
                held: true,
            })
        } else {
            None
        }
    }
}

/// An acquired (or once-acquired) lock. Dropping an unreleased handle
/// releases the lock; calling [`release`](Self::release) explicitly lets
/// the caller observe whether release was a no-op.
pub struct LockHandle {
    lock: Option<Arc<NamedLock>>,
    pub kind: LockKind,
    pub resource: String,
    held: bool,
}

impl LockHandle {
    /// Release the lock. Returns `false` (a no-op) if it was already
    /// released — this guards against double-release, per §4.5: "release
    /// is a no-op if the holder never acquired."
    pub fn release(&mut self) -> bool {
        if !self.held {
            return false;
        }
        self.held = false;
        self.lock.as_ref().is_some_and(|l| l.release())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
