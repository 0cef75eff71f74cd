//! Snap event times to a grid.

use crate::error::ValidationError;
use crate::model::{Event, Time};
use crate::module::{Granularity, Module, Pass};

/// Rounds offsets and ends to the nearest `1/divisions` of a quarter note.
#[derive(Debug, Clone, Copy)]
pub struct Quantize {
    grid: Time,
}

impl Quantize {
    pub fn new(divisions: u32) -> Self {
        Self {
            grid: Time::new(1, i64::from(divisions.max(1))),
        }
    }

    /// Quantized `(offset, duration)` of an event.  Grace events keep their
    /// duration; a positive duration never rounds below one grid step.
    pub fn snap(&self, event: &Event) -> (Time, Time) {
        let round = |t: Time| (t / self.grid).round() * self.grid;
        let offset = round(event.offset);
        if event.is_grace() {
            return (offset, event.duration);
        }
        let mut duration = round(event.offset + event.duration) - offset;
        if event.duration > Time::from_integer(0) && duration < self.grid {
            duration = self.grid;
        }
        (offset, duration)
    }
}

impl Module for Quantize {
    fn name(&self) -> &str {
        "quantize"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Note
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let part_end = pass.key().part().and_then(|p| pass.view().part_end(p));
        let mut notes = pass.notes();
        while let Some(v) = notes.next_note() {
            let (offset, duration) = self.snap(&v);
            if part_end.is_some_and(|end| v.occupies_time() && offset + duration > end) {
                pass.request_redo();
            }
            if (offset, duration) == (v.offset, v.duration) {
                pass.commit(v.discard());
                continue;
            }
            let mut e = v.upgrade();
            e.offset = offset;
            e.duration = duration;
            pass.commit(e.accept_invalidate());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{time, Part, Score};
    use crate::passes::testing::run_alone;

    #[test]
    fn snaps_to_grid_without_collapsing() {
        let q = Quantize::new(4);
        let e = Event::note(time(3, 10), time(1, 20), 60);
        assert_eq!(q.snap(&e), (time(1, 4), time(1, 4)));
        let e = Event::note(time(1, 1), time(7, 10), 60);
        assert_eq!(q.snap(&e), (time(1, 1), time(3, 4)));
        let grace = Event::note(time(1, 9), time(1, 8), 60).with_grace(time(0, 1));
        assert_eq!(q.snap(&grace), (time(0, 1), time(1, 8)));
    }

    #[test]
    fn overhanging_event_extends_measures() {
        let mut score = Score::new();
        score.parts.push(
            Part::with_meter("P1", 1, time(4, 1))
                .with_events(vec![Event::note(time(3, 1), time(3, 1), 60)]),
        );
        let out = run_alone(&Quantize::new(8), score).unwrap();
        let measures = &out.parts[0].measures;
        assert_eq!(measures.len(), 2);
        assert_eq!((measures[1].start, measures[1].end), (time(4, 1), time(8, 1)));
    }
}
