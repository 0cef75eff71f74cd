//! Ordered iteration over the objects of one partition.
//!
//! A cursor is created per module per partition.  Its order is fixed when it
//! is created: events by `(offset, grace before main, grace offset)`,
//! measures by start time, parts and metaparts in score order.  Inserts made
//! during the stage are filed at the barrier and never show up here.

use std::collections::HashMap;

use crate::lock::{ObjectId, ObjectLock, Visit};
use crate::model::{Event, Measure, Metapart, PartInfo, Time};

/// The order a cursor yields objects of a type in.
pub trait CursorOrder {
    type Key: Ord;

    fn cursor_key(&self) -> Self::Key;
}

impl CursorOrder for Event {
    type Key = (Time, bool, Time);

    fn cursor_key(&self) -> Self::Key {
        self.time_key()
    }
}

impl CursorOrder for Measure {
    type Key = Time;

    fn cursor_key(&self) -> Time {
        self.start
    }
}

impl CursorOrder for PartInfo {
    type Key = ();

    fn cursor_key(&self) {}
}

impl CursorOrder for Metapart {
    type Key = ();

    fn cursor_key(&self) {}
}

/// Cursor over the objects of type `T` in one partition.
pub struct Cursor<'g, T> {
    items: Vec<&'g ObjectLock<T>>,
    index: HashMap<ObjectId, usize>,
    pos: usize,
    exhausted: bool,
}

impl<'g, T: CursorOrder> Cursor<'g, T> {
    /// Sort the partition's objects, reading each key under a shared lock.
    pub(crate) fn new(locks: Vec<&'g ObjectLock<T>>) -> Self {
        let mut keyed: Vec<(T::Key, &'g ObjectLock<T>)> = locks
            .into_iter()
            .filter(|lock| !lock.is_deleted())
            .map(|lock| (lock.read().cursor_key(), lock))
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        let items: Vec<&'g ObjectLock<T>> = keyed.into_iter().map(|(_, lock)| lock).collect();
        let index = items
            .iter()
            .enumerate()
            .map(|(i, lock)| (lock.id(), i))
            .collect();
        Self {
            items,
            index,
            pos: 0,
            exhausted: false,
        }
    }
}

impl<'g, T> Cursor<'g, T> {
    /// Objects in the partition when the cursor was created.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `None` has been returned.  Stays true.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Advance to the next live object and take its upgradable lock.
    pub fn next_visit(&mut self) -> Option<Visit<'_, T>> {
        if self.exhausted {
            return None;
        }
        while let Some(&lock) = self.items.get(self.pos) {
            self.pos += 1;
            if lock.is_deleted() {
                continue;
            }
            let guard = lock.upgradable();
            return Some(Visit::new(lock, guard, &self.items[self.pos..]));
        }
        self.exhausted = true;
        None
    }
}

impl<'g, T: Clone> Cursor<'g, T> {
    /// Snapshot of the first live object after `after`, without moving the
    /// cursor.  `None` when `after` is not in this partition.
    pub fn peek_next_after(&self, after: ObjectId) -> Option<T> {
        let &at = self.index.get(&after)?;
        self.items[at + 1..]
            .iter()
            .find(|lock| !lock.is_deleted())
            .map(|lock| lock.snapshot())
    }
}

impl<'g> Cursor<'g, Event> {
    pub fn next_note(&mut self) -> Option<Visit<'_, Event>> {
        self.next_visit()
    }

    pub fn peek_next_note(&self, after: ObjectId) -> Option<Event> {
        self.peek_next_after(after)
    }
}

impl<'g> Cursor<'g, Measure> {
    pub fn next_meas(&mut self) -> Option<Visit<'_, Measure>> {
        self.next_visit()
    }

    pub fn peek_next_meas(&self, after: ObjectId) -> Option<Measure> {
        self.peek_next_after(after)
    }
}

impl<'g> Cursor<'g, PartInfo> {
    pub fn next_part(&mut self) -> Option<Visit<'_, PartInfo>> {
        self.next_visit()
    }
}

impl<'g> Cursor<'g, Metapart> {
    pub fn next_metapart(&mut self) -> Option<Visit<'_, Metapart>> {
        self.next_visit()
    }
}
