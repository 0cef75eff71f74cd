//! Resolve overlapping events within a voice.
//!
//! Two events of one lane conflict when they overlap in time and either
//! sound the same, or one of them is a rest, or the pass runs in mono mode.
//! Rests always give way to notes.  Grace and mark events never conflict.

use std::collections::HashMap;

use crate::config::PrunePolicy;
use crate::error::ValidationError;
use crate::model::*;
use crate::module::{Granularity, Module, Pass};
use crate::passes::{piece, split_marks};

/// Half-open time span `[offset, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: Time,
    pub end: Time,
}

impl Span {
    pub fn of(event: &Event) -> Self {
        Self {
            offset: event.offset,
            end: event.end(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.offset
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.offset < other.end && other.offset < self.end
    }

    pub fn len(&self) -> Time {
        self.end - self.offset
    }
}

/// Whether two events of one lane need resolving if they overlap.
fn conflicts(a: &Event, b: &Event, mono: bool) -> bool {
    if !a.occupies_time() || !b.occupies_time() {
        return false;
    }
    mono || a.is_rest() || b.is_rest() || (a.sound().is_some() && a.sound() == b.sound())
}

/// A glissando from `a` to `b` keeps both ends even when they overlap.
fn paired(a: &Event, b: &Event) -> bool {
    let ends = b.spanner_ends();
    a.spanner_begins()
        .iter()
        .any(|s| s.kind.is_paired() && ends.contains(s))
}

/// Apply `policy` to the pieces of the earlier event against the later one.
pub fn resolve(policy: PrunePolicy, pieces: &mut Vec<Span>, later: &mut Span) {
    match policy {
        PrunePolicy::Cutoff => {
            pieces.retain(|p| p.offset < later.offset);
            for p in pieces.iter_mut() {
                p.end = p.end.min(later.offset);
            }
        }
        PrunePolicy::Steal => {
            for p in pieces.iter() {
                if p.overlaps(later) {
                    later.offset = later.offset.max(p.end);
                }
            }
            later.offset = later.offset.min(later.end);
        }
        PrunePolicy::Split => {
            let mut out = Vec::with_capacity(pieces.len() + 1);
            for p in pieces.drain(..) {
                if !p.overlaps(later) {
                    out.push(p);
                    continue;
                }
                let head = Span {
                    offset: p.offset,
                    end: later.offset,
                };
                let tail = Span {
                    offset: later.end,
                    end: p.end,
                };
                out.extend([head, tail].into_iter().filter(|s| !s.is_empty()));
            }
            *pieces = out;
        }
        PrunePolicy::Transfer => {
            let Some(at) = pieces.iter().position(|p| p.overlaps(later)) else {
                return;
            };
            let cut = later.offset.max(pieces[at].offset);
            let stolen = pieces[at].end - cut;
            pieces[at].end = cut;
            pieces.truncate(at + 1);
            pieces.retain(|p| !p.is_empty());
            later.end += stolen;
        }
    }
}

/// Overlap pruning.
#[derive(Debug, Clone, Copy)]
pub struct Prune {
    policy: PrunePolicy,
    mono: bool,
}

impl Prune {
    pub fn new(policy: PrunePolicy, mono: bool) -> Self {
        Self { policy, mono }
    }
}

impl Module for Prune {
    fn name(&self) -> &str {
        "prune"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Voice
    }

    fn after(&self) -> &[&str] {
        &["quantize"]
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        // New spans of events not visited yet
        let mut pending: HashMap<EventId, Span> = HashMap::new();
        let mut notes = pass.notes();

        while let Some(v) = notes.next_note() {
            let start = pending.remove(&v.id).unwrap_or_else(|| Span::of(&v));
            if !v.occupies_time() {
                pass.commit(v.discard());
                continue;
            }

            let mut pieces = vec![start];
            for b in v.successors() {
                if b.offset >= start.end {
                    break;
                }
                if !conflicts(&v, &b, self.mono) || paired(&v, &b) {
                    continue;
                }
                let mut later = pending.get(&b.id).copied().unwrap_or_else(|| Span::of(&b));
                if later.is_empty() || !pieces.iter().any(|p| p.overlaps(&later)) {
                    continue;
                }
                let policy = match (v.is_rest(), b.is_rest()) {
                    (true, false) => PrunePolicy::Cutoff,
                    (false, true) => PrunePolicy::Steal,
                    _ => self.policy,
                };
                resolve(policy, &mut pieces, &mut later);
                if later != Span::of(&b) {
                    pending.insert(b.id, later);
                }
                if pieces.is_empty() {
                    break;
                }
            }
            pieces.retain(|p| !p.is_empty());

            if pieces == [Span::of(&v)] {
                pass.commit(v.discard());
                continue;
            }

            let Some(&first) = pieces.first() else {
                if v.has_spanner_marks() {
                    return Err(ValidationError::UnresolvableOverlap { pos: v.pos.clone() });
                }
                log::debug!("prune: dropping {} at {}", v.id, v.offset);
                pass.commit(v.upgrade().delete());
                continue;
            };

            let mut e = v.upgrade();
            let tails: Vec<Event> = if pieces.len() > 1 {
                let (keep, moved) = split_marks(std::mem::take(&mut e.marks));
                e.marks = keep;
                let last = pieces.len() - 2;
                pieces[1..]
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        let marks = if i == last { moved.clone() } else { Vec::new() };
                        piece(&e, p.offset, p.len(), marks)
                    })
                    .collect()
            } else {
                Vec::new()
            };
            e.offset = first.offset;
            e.duration = first.len();
            pass.commit(e.accept_invalidate());
            for tail in tails {
                pass.insert(tail);
            }
        }
        Ok(())
    }
}
