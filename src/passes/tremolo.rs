//! Tremolo splitting.
//!
//! A tremolo can only be drawn on a note whose value is a whole number of
//! strokes times a power of two.  Whatever does not fit is split off into a
//! tied continuation without the tremolo.

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::model::*;
use crate::module::{Granularity, Module, Pass};
use crate::passes::{add_mark, piece, split_marks};

/// Tremolo stroke count of an event, and whether it alternates with a
/// partner note.
fn tremolo_of(event: &Event) -> Option<(u32, bool)> {
    event.marks.iter().find_map(|m| match m.kind {
        MarkKind::Tremolo { count } => Some((count, false)),
        MarkKind::DoubleTremolo { count } => Some((count, true)),
        _ => None,
    })
}

/// Whether `count` names a drawable stroke value.
pub fn valid_count(count: u32) -> bool {
    count.is_power_of_two() && (8..=128).contains(&count)
}

/// Longest `stroke * 2^k` (k >= 1) not exceeding `duration`, or `None`
/// when even two strokes do not fit.
pub fn tremolo_body(count: u32, duration: Time) -> Option<Time> {
    let stroke = Time::new(4, i64::from(count));
    let mut body = stroke * 2;
    if duration < body {
        return None;
    }
    while body * 2 <= duration {
        body *= 2;
    }
    Some(body)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tremolo;

impl Module for Tremolo {
    fn name(&self) -> &str {
        "tremolo"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Voice
    }

    fn after(&self) -> &[&str] {
        &["prune"]
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let mut partnered: HashSet<EventId> = HashSet::new();
        let mut notes = pass.notes();

        while let Some(v) = notes.next_note() {
            let Some((count, double)) = v.is_note().then(|| tremolo_of(&v)).flatten() else {
                pass.commit(v.discard());
                continue;
            };
            if !valid_count(count) {
                return Err(ValidationError::InvalidTremoloCount {
                    count,
                    pos: v.pos.clone(),
                });
            }

            if double && !partnered.remove(&v.id) {
                let partner = v
                    .successors()
                    .take_while(|b| b.offset == v.offset)
                    .find(|b| {
                        b.duration == v.duration
                            && !partnered.contains(&b.id)
                            && tremolo_of(b) == Some((count, true))
                    });
                match partner {
                    Some(b) => {
                        partnered.insert(b.id);
                    }
                    None => {
                        return Err(ValidationError::MissingTremoloPartner {
                            pos: v.pos.clone(),
                        })
                    }
                }
            }

            let Some(body) = tremolo_body(count, v.duration) else {
                log::warn!(
                    "{}: {} too short for a tremolo of {count}",
                    v.pos,
                    v.duration
                );
                let mut e = v.upgrade();
                e.valid = false;
                pass.commit(e.accept_unchanged());
                continue;
            };
            if body == v.duration {
                pass.commit(v.discard());
                continue;
            }

            let mut e = v.upgrade();
            let (mut keep, mut moved) = split_marks(std::mem::take(&mut e.marks));
            moved.retain(|m| !m.is_tremolo());
            add_mark(&mut keep, MarkKind::TieRight);
            add_mark(&mut moved, MarkKind::TieLeft);
            let rest = piece(&e, e.offset + body, e.duration - body, moved);
            e.marks = keep;
            e.duration = body;
            pass.commit(e.accept_invalidate());
            pass.insert(rest);
        }
        Ok(())
    }
}
