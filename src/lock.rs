//! Per-object reader/writer locks and the commit protocol.
//!
//! Every mutable object in the graph sits in an [`ObjectLock`].  A module
//! never locks objects itself: a cursor hands it a [`Visit`] (an
//! upgradable read), which it finishes with exactly one of
//!
//! - [`Visit::discard`]: nothing changed,
//! - [`Visit::accept_unchanged`]: the value was only read,
//! - [`Visit::upgrade`] followed by [`Exclusive::accept_invalidate`],
//!   [`Exclusive::accept_unchanged`], [`Exclusive::discard`] or
//!   [`Exclusive::delete`].
//!
//! Each of these consumes the guard and returns a [`Committed`] token.
//! Upgrading consumes the visit, so a module cannot keep reading through a
//! guard it has already upgraded, and it cannot take a second exclusive
//! lock on the same object.  Edits under an [`Exclusive`] go to a draft that
//! is written back only on accept: an early `?` return drops the draft and
//! leaves the object exactly as it was.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use serde::Serialize;

/// Identity of a locked object, unique per object type within one graph.
pub type ObjectId = u64;

/// A graph object behind a reader/writer lock, plus the flags the barrier
/// reads: logically deleted, and derived caches gone stale.
#[derive(Debug)]
pub struct ObjectLock<T> {
    id: ObjectId,
    value: RwLock<T>,
    deleted: AtomicBool,
    stale: AtomicBool,
}

impl<T> ObjectLock<T> {
    pub fn new(id: ObjectId, value: T) -> Self {
        Self {
            id,
            value: RwLock::new(value),
            deleted: AtomicBool::new(false),
            stale: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether the object was deleted during the current stage.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Take a shared lock.  Many shared holders may coexist with one
    /// upgradable holder, never with an exclusive one.
    pub fn read(&self) -> Shared<'_, T> {
        Shared {
            guard: self.value.read(),
        }
    }

    pub(crate) fn upgradable(&self) -> RwLockUpgradableReadGuard<'_, T> {
        self.value.upgradable_read()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.value.is_locked()
    }

    /// Lock-free access for the sole owner of the object.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    /// Clear and return the stale flag.
    pub(crate) fn take_stale(&mut self) -> bool {
        std::mem::replace(self.stale.get_mut(), false)
    }

    pub(crate) fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Clone> ObjectLock<T> {
    /// Copy the value out under a brief shared lock.
    pub fn snapshot(&self) -> T {
        self.value.read().clone()
    }
}

/// Shared (read-only) guard.
pub struct Shared<'a, T> {
    guard: RwLockReadGuard<'a, T>,
}

impl<T> Deref for Shared<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Commit protocol
// ═══════════════════════════════════════════════════════════════════════

/// How a module finished with a visited object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Commit {
    /// No change; caches untouched
    Discard,
    /// Structural change; derived caches downstream go stale
    AcceptInvalidate,
    /// Read, or changed in a way no cache depends on
    AcceptUnchanged,
}

/// Proof that a visit was finished.  Hand it to
/// [`Pass::commit`](crate::module::Pass::commit).
#[must_use = "pass the token to Pass::commit"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Committed {
    pub id: ObjectId,
    pub commit: Commit,
    pub deleted: bool,
}

/// Commit counts for a partition or stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub discarded: usize,
    pub invalidated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl CommitStats {
    pub fn record(&mut self, done: &Committed) {
        if done.deleted {
            self.deleted += 1;
            return;
        }
        match done.commit {
            Commit::Discard => self.discarded += 1,
            Commit::AcceptInvalidate => self.invalidated += 1,
            Commit::AcceptUnchanged => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: &CommitStats) {
        self.discarded += other.discarded;
        self.invalidated += other.invalidated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
    }

    /// Objects finished in any way.
    pub fn total(&self) -> usize {
        self.discarded + self.invalidated + self.unchanged + self.deleted
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Guards handed to modules
// ═══════════════════════════════════════════════════════════════════════

/// An object handed out by a cursor, held under an upgradable read lock.
///
/// The visit borrows its cursor, so a module holds at most one visit per
/// cursor at a time.  Dropping a visit without finishing it counts as a
/// discard.
#[must_use = "finish the visit with discard, accept_unchanged or upgrade"]
pub struct Visit<'c, T> {
    lock: &'c ObjectLock<T>,
    guard: RwLockUpgradableReadGuard<'c, T>,
    rest: &'c [&'c ObjectLock<T>],
}

impl<'c, T> Visit<'c, T> {
    pub(crate) fn new(
        lock: &'c ObjectLock<T>,
        guard: RwLockUpgradableReadGuard<'c, T>,
        rest: &'c [&'c ObjectLock<T>],
    ) -> Self {
        Self { lock, guard, rest }
    }

    pub fn id(&self) -> ObjectId {
        self.lock.id
    }

    pub fn discard(self) -> Committed {
        Committed {
            id: self.lock.id,
            commit: Commit::Discard,
            deleted: false,
        }
    }

    pub fn accept_unchanged(self) -> Committed {
        Committed {
            id: self.lock.id,
            commit: Commit::AcceptUnchanged,
            deleted: false,
        }
    }
}

impl<'c, T: Clone> Visit<'c, T> {
    /// Snapshots of the objects after this one in the partition, in order,
    /// skipping deleted ones.  Each is read under a brief shared lock.
    pub fn successors(&self) -> Successors<'_, T> {
        Successors {
            rest: self.rest.iter(),
        }
    }

    /// The next object after this one, without consuming it.
    pub fn peek_next(&self) -> Option<T> {
        self.successors().next()
    }

    /// Atomically upgrade to an exclusive lock.  Waits for shared readers
    /// to leave; other upgradable holders cannot exist.
    pub fn upgrade(self) -> Exclusive<'c, T> {
        let Visit { lock, guard, .. } = self;
        let guard = RwLockUpgradableReadGuard::upgrade(guard);
        let draft = (*guard).clone();
        Exclusive { lock, guard, draft }
    }
}

impl<T> Deref for Visit<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Lookahead iterator returned by [`Visit::successors`].
pub struct Successors<'v, T> {
    rest: std::slice::Iter<'v, &'v ObjectLock<T>>,
}

impl<T: Clone> Iterator for Successors<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        loop {
            let lock = self.rest.next()?;
            if !lock.is_deleted() {
                return Some(lock.snapshot());
            }
        }
    }
}

/// Exclusive lock with a draft copy of the object.
///
/// Reads and writes through `Deref`/`DerefMut` go to the draft.  Only the
/// accept methods write it back.
#[must_use = "finish with accept_invalidate, accept_unchanged, discard or delete"]
pub struct Exclusive<'c, T> {
    lock: &'c ObjectLock<T>,
    guard: RwLockWriteGuard<'c, T>,
    draft: T,
}

impl<'c, T> Exclusive<'c, T> {
    pub fn id(&self) -> ObjectId {
        self.lock.id
    }

    /// The object as it was before this module's edits.
    pub fn original(&self) -> &T {
        &self.guard
    }

    /// Write the draft back and mark derived caches stale.
    pub fn accept_invalidate(self) -> Committed {
        let Exclusive {
            lock,
            mut guard,
            draft,
        } = self;
        *guard = draft;
        lock.stale.store(true, Ordering::Release);
        Committed {
            id: lock.id,
            commit: Commit::AcceptInvalidate,
            deleted: false,
        }
    }

    /// Write the draft back, keeping derived caches.
    pub fn accept_unchanged(self) -> Committed {
        let Exclusive {
            lock,
            mut guard,
            draft,
        } = self;
        *guard = draft;
        Committed {
            id: lock.id,
            commit: Commit::AcceptUnchanged,
            deleted: false,
        }
    }

    /// Throw the draft away.
    pub fn discard(self) -> Committed {
        Committed {
            id: self.lock.id,
            commit: Commit::Discard,
            deleted: false,
        }
    }

    /// Flag the object for removal at the next barrier.  It is not yielded
    /// again in this stage.
    pub fn delete(self) -> Committed {
        self.lock.deleted.store(true, Ordering::Release);
        Committed {
            id: self.lock.id,
            commit: Commit::AcceptInvalidate,
            deleted: true,
        }
    }
}

impl<T> Deref for Exclusive<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.draft
    }
}

impl<T> DerefMut for Exclusive<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.draft
    }
}
