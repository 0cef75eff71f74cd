//! Part grouping: voice sets of parts and metaparts.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ValidationError;
use crate::module::{Granularity, Module, Pass};

#[derive(Debug, Clone, Copy, Default)]
pub struct GroupParts;

impl Module for GroupParts {
    fn name(&self) -> &str {
        "group-parts"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Score
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let view = pass.view();
        let mut voices: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();

        let mut parts = pass.parts();
        while let Some(v) = parts.next_part() {
            // Part locks are numbered by part index
            let used: BTreeSet<u32> = view.voices(v.id() as usize).into_iter().collect();
            if voices.insert(v.id.clone(), used.clone()).is_some() {
                return Err(ValidationError::DuplicatePart { part: v.id.clone() });
            }
            if v.voices == used {
                pass.commit(v.discard());
                continue;
            }
            let mut p = v.upgrade();
            p.voices = used;
            pass.commit(p.accept_unchanged());
        }

        let mut metaparts = pass.metaparts();
        while let Some(v) = metaparts.next_metapart() {
            let mut union = BTreeSet::new();
            for child in &v.parts {
                let Some(set) = voices.get(child) else {
                    return Err(ValidationError::UnknownPart {
                        metapart: v.id.clone(),
                        part: child.clone(),
                    });
                };
                union.extend(set.iter().copied());
            }
            if v.voices == union {
                pass.commit(v.discard());
                continue;
            }
            let mut m = v.upgrade();
            m.voices = union;
            pass.commit(m.accept_unchanged());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::passes::testing::run_alone;

    fn piano() -> Score {
        let mut score = Score::new();
        score.parts.push(Part::with_meter("RH", 1, time(4, 1)).with_events(vec![
            Event::note(time(0, 1), time(4, 1), 72),
            Event::note(time(0, 1), time(4, 1), 67).in_voice(2),
        ]));
        score.parts.push(
            Part::with_meter("LH", 1, time(4, 1))
                .with_events(vec![Event::note(time(0, 1), time(4, 1), 48).in_voice(5)]),
        );
        score.metaparts.push(Metapart {
            id: "piano".into(),
            name: None,
            parts: vec!["RH".into(), "LH".into()],
            voices: BTreeSet::new(),
        });
        score
    }

    #[test]
    fn voices_are_collected_and_unioned() {
        let out = run_alone(&GroupParts, piano()).unwrap();
        assert_eq!(out.parts[0].voices, BTreeSet::from([1, 2]));
        assert_eq!(out.parts[1].voices, BTreeSet::from([5]));
        assert_eq!(out.metaparts[0].voices, BTreeSet::from([1, 2, 5]));
    }

    #[test]
    fn voices_come_from_the_visited_part() {
        let mut score = piano();
        score.metaparts.clear();
        score.parts[1].voices = BTreeSet::from([9]);
        let out = run_alone(&GroupParts, score).unwrap();
        assert_eq!(out.parts[1].voices, BTreeSet::from([5]));
    }

    #[test]
    fn duplicate_part_ids_are_rejected() {
        let mut score = piano();
        score.parts[1].id = "RH".into();
        let err = run_alone(&GroupParts, score).unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationError::DuplicatePart { part: "RH".into() })
        );
    }

    #[test]
    fn unknown_child_is_rejected() {
        let mut score = piano();
        score.metaparts[0].parts.push("Pedal".into());
        let err = run_alone(&GroupParts, score).unwrap_err();
        assert_eq!(
            err.validation(),
            Some(&ValidationError::UnknownPart {
                metapart: "piano".into(),
                part: "Pedal".into()
            })
        );
    }
}
