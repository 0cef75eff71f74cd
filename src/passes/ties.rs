//! Split events at barlines.
//!
//! An event crossing one or more measure boundaries is cut at each of them.
//! Note pieces are tied together; rest pieces are not.

use crate::error::ValidationError;
use crate::model::*;
use crate::module::{Granularity, Module, Pass};
use crate::passes::{add_mark, piece, split_marks};

/// Measure starts strictly inside `(offset, end)`.
pub fn crossings(bounds: &[(Time, Time)], offset: Time, end: Time) -> Vec<Time> {
    bounds
        .iter()
        .map(|&(start, _)| start)
        .filter(|&start| offset < start && start < end)
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ties;

impl Module for Ties {
    fn name(&self) -> &str {
        "ties"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Voice
    }

    fn same_instance_ok(&self) -> bool {
        false
    }

    fn after(&self) -> &[&str] {
        &["quantize"]
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let bounds = match pass.key().part() {
            Some(part) => pass.view().measure_bounds(part),
            None => Vec::new(),
        };
        let mut notes = pass.notes();

        while let Some(v) = notes.next_note() {
            let cuts = if v.occupies_time() {
                crossings(&bounds, v.offset, v.end())
            } else {
                Vec::new()
            };
            if cuts.is_empty() {
                pass.commit(v.discard());
                continue;
            }

            let mut e = v.upgrade();
            let tie = e.is_note();
            let (mut first, mut last) = split_marks(std::mem::take(&mut e.marks));

            let mut edges = Vec::with_capacity(cuts.len() + 2);
            edges.push(e.offset);
            edges.extend_from_slice(&cuts);
            edges.push(e.end());
            let segments = edges.len() - 1;

            let mut pieces = Vec::with_capacity(segments - 1);
            for (i, w) in edges.windows(2).enumerate().skip(1) {
                let mut marks = if i + 1 == segments {
                    std::mem::take(&mut last)
                } else {
                    Vec::new()
                };
                if tie {
                    add_mark(&mut marks, MarkKind::TieLeft);
                    if i + 1 < segments {
                        add_mark(&mut marks, MarkKind::TieRight);
                    }
                }
                pieces.push(piece(&e, w[0], w[1] - w[0], marks));
            }

            if tie {
                add_mark(&mut first, MarkKind::TieRight);
            }
            e.marks = first;
            e.duration = cuts[0] - e.offset;
            pass.commit(e.accept_invalidate());
            for p in pieces {
                pass.insert(p);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passes::testing::run_alone;

    fn three_bars(events: Vec<Event>) -> Score {
        let mut score = Score::new();
        score
            .parts
            .push(Part::with_meter("P1", 3, time(4, 1)).with_events(events));
        score
    }

    #[test]
    fn crossings_exclude_the_edges() {
        let bounds = [(time(0, 1), time(4, 1)), (time(4, 1), time(8, 1))];
        assert!(crossings(&bounds, time(0, 1), time(4, 1)).is_empty());
        assert_eq!(crossings(&bounds, time(3, 1), time(5, 1)), vec![time(4, 1)]);
    }

    #[test]
    fn note_across_two_barlines_becomes_three_tied_pieces() {
        let out = run_alone(
            &Ties,
            three_bars(vec![Event::note(time(3, 1), time(6, 1), 60)
                .with_mark(Mark::begin(Spanner::Slur, 1))
                .with_mark(Mark::end(Spanner::Wedge, 2))]),
        )
        .unwrap();
        let events = &out.parts[0].events;
        let spans: Vec<(Time, Time)> = events.iter().map(|e| (e.offset, e.duration)).collect();
        assert_eq!(
            spans,
            vec![
                (time(3, 1), time(1, 1)),
                (time(4, 1), time(4, 1)),
                (time(8, 1), time(1, 1))
            ]
        );
        assert_eq!(
            events[0].marks,
            vec![Mark::begin(Spanner::Slur, 1), Mark::new(MarkKind::TieRight)]
        );
        assert_eq!(
            events[1].marks,
            vec![Mark::new(MarkKind::TieLeft), Mark::new(MarkKind::TieRight)]
        );
        assert_eq!(
            events[2].marks,
            vec![Mark::end(Spanner::Wedge, 2), Mark::new(MarkKind::TieLeft)]
        );
    }

    #[test]
    fn rests_are_split_without_ties() {
        let out = run_alone(&Ties, three_bars(vec![Event::rest(time(2, 1), time(4, 1))])).unwrap();
        let events = &out.parts[0].events;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.marks.is_empty()));
    }
}
