//! Spanner balance.
//!
//! Walks a voice in time order keeping the set of open `(kind, id)`
//! spanners.  A begin and an end of the same spanner on one event means
//! either that one spanner ends where the next begins (if the kind allows
//! touching) or that the spanner covers just that event (if the kind allows
//! spanning one).

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValidationError;
use crate::model::*;
use crate::module::{Granularity, Module, Pass};

/// Spanner bookkeeping for one walk through a voice.
#[derive(Debug, Default)]
pub struct SpannerBalance {
    /// Open spanners with the order they were opened in.
    open: BTreeMap<SpannerRef, (usize, FilePos)>,
    opened: usize,
    issues: Vec<ValidationError>,
}

impl SpannerBalance {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&mut self, spanner: SpannerRef, pos: FilePos) -> Option<FilePos> {
        self.opened += 1;
        self.open
            .insert(spanner, (self.opened, pos))
            .map(|(_, earlier)| earlier)
    }

    /// Process one event's marks.  Returns the spanners the event lies
    /// under, sorted.
    pub fn feed(&mut self, event: &Event) -> Vec<SpannerRef> {
        let mut under: BTreeSet<SpannerRef> = self.open.keys().copied().collect();
        let mut begins = event.spanner_begins();
        let ends = event.spanner_ends();

        for end in ends {
            under.insert(end);
            if let Some(at) = begins.iter().position(|b| *b == end) {
                begins.remove(at);
                self.same_event(end, event);
            } else if self.open.remove(&end).is_none() {
                self.issues.push(ValidationError::UnmatchedSpannerEnd {
                    spanner: end,
                    pos: event.pos.clone(),
                });
            }
        }

        for begin in begins {
            under.insert(begin);
            if let Some(earlier) = self.open(begin, event.pos.clone()) {
                self.issues.push(ValidationError::UnmatchedSpannerBegin {
                    spanner: begin,
                    pos: earlier,
                });
            }
        }

        under.into_iter().collect()
    }

    /// A begin and an end of `spanner` on the same event.
    fn same_event(&mut self, spanner: SpannerRef, event: &Event) {
        let pos = event.pos.clone();
        if self.open.contains_key(&spanner) {
            if spanner.kind.can_touch() {
                // The open one ends here and a new one begins
                self.open(spanner, pos);
            } else if !spanner.kind.can_span_one() {
                self.open.remove(&spanner);
                self.issues
                    .push(ValidationError::SpannerCannotTouch { spanner, pos });
            }
        } else if !spanner.kind.can_span_one() {
            self.issues
                .push(ValidationError::SpannerCannotSpanOne { spanner, pos });
        }
    }

    /// Close the walk.  Every spanner still open is an unmatched begin,
    /// reported in the order it was opened.
    pub fn finish(mut self) -> Vec<ValidationError> {
        let mut open: Vec<_> = std::mem::take(&mut self.open).into_iter().collect();
        open.sort_by_key(|(_, (order, _))| *order);
        self.issues.extend(
            open.into_iter()
                .map(|(spanner, (_, pos))| ValidationError::UnmatchedSpannerBegin { spanner, pos }),
        );
        self.issues
    }
}

/// Check a sequence of events (in time order) for spanner balance.
pub fn check_spanners(events: &[Event]) -> Vec<ValidationError> {
    let mut balance = SpannerBalance::new();
    for event in events {
        balance.feed(event);
    }
    balance.finish()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Spanners;

impl Module for Spanners {
    fn name(&self) -> &str {
        "spanners"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Voice
    }

    fn after(&self) -> &[&str] {
        &["ties"]
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let mut balance = SpannerBalance::new();
        let mut notes = pass.notes();
        while let Some(v) = notes.next_note() {
            let under = balance.feed(&v);
            if v.cache.spanners == under {
                pass.commit(v.accept_unchanged());
                continue;
            }
            let mut e = v.upgrade();
            e.cache.spanners = under;
            pass.commit(e.accept_unchanged());
        }

        let issues = balance.finish();
        for issue in &issues {
            log::warn!("{} in {}: {issue}", self.name(), pass.key());
        }
        match issues.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }
}
