//! The standard passes.
//!
//! Registered in this order (which is also the dependency order):
//!
//! | module | granularity | notes |
//! |---|---|---|
//! | `quantize` | note | may extend measures |
//! | `prune` | voice | |
//! | `tremolo` | voice | |
//! | `ties` | voice | runs in a stage of its own |
//! | `spanners` | voice | fills spanner caches |
//! | `keysigs` | measure | |
//! | `keysig-carry` | part | destructive |
//! | `barlines` | part | |
//! | `group-parts` | score | |

pub mod barlines;
pub mod group;
pub mod keysig;
pub mod prune;
pub mod quantize;
pub mod spanners;
pub mod ties;
pub mod tremolo;

use crate::config::Settings;
use crate::model::{Event, EventCache, EventId, Mark, MarkKind, Origin, Time};
use crate::module::{Module, Registry};

pub use barlines::{merge_barlines, Barlines};
pub use group::GroupParts;
pub use keysig::{derive_key, KeySigCarry, KeySigs};
pub use prune::Prune;
pub use quantize::Quantize;
pub use spanners::{check_spanners, SpannerBalance, Spanners};
pub use ties::Ties;
pub use tremolo::Tremolo;

/// The standard registry.
pub fn standard(settings: &Settings) -> Registry {
    let modules: Vec<Box<dyn Module>> = vec![
        Box::new(Quantize::new(settings.quantize_divisions)),
        Box::new(Prune::new(settings.prune, settings.mono)),
        Box::new(Tremolo),
        Box::new(Ties),
        Box::new(Spanners),
        Box::new(KeySigs),
        Box::new(KeySigCarry),
        Box::new(Barlines::new(settings.final_barline)),
        Box::new(GroupParts),
    ];
    Registry::from_modules(modules)
}

/// Divide an event's marks between the first and last piece of a split.
/// Spanner ends and outgoing ties move to the last piece.
pub(crate) fn split_marks(marks: Vec<Mark>) -> (Vec<Mark>, Vec<Mark>) {
    marks
        .into_iter()
        .partition(|m| m.ends().is_none() && m.kind != MarkKind::TieRight)
}

/// A new piece of `event` covering `[offset, offset + duration)`.
pub(crate) fn piece(event: &Event, offset: Time, duration: Time, marks: Vec<Mark>) -> Event {
    Event {
        id: EventId::default(),
        offset,
        grace: None,
        duration,
        marks,
        origin: Origin::Split,
        cache: EventCache::default(),
        ..event.clone()
    }
}

/// Add a mark unless an equal one is present.
pub(crate) fn add_mark(marks: &mut Vec<Mark>, kind: MarkKind) {
    if !marks.iter().any(|m| m.kind == kind) {
        marks.push(Mark::new(kind));
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Spanner;

    #[test]
    fn split_moves_ends_and_outgoing_ties_last() {
        let marks = vec![
            Mark::begin(Spanner::Slur, 1),
            Mark::new(MarkKind::TieLeft),
            Mark::end(Spanner::Wedge, 2),
            Mark::new(MarkKind::TieRight),
            Mark::new(MarkKind::Articulation("staccato".into())),
        ];
        let (first, last) = split_marks(marks);
        assert_eq!(first.len(), 3);
        assert_eq!(
            last,
            vec![Mark::end(Spanner::Wedge, 2), Mark::new(MarkKind::TieRight)]
        );
    }

    #[test]
    fn standard_registry_plans_every_module() {
        let registry = standard(&Settings::default());
        let stages = crate::planner::plan_all(&registry).unwrap();
        let names: Vec<Vec<String>> = stages.iter().map(|s| s.module_names()).collect();
        assert_eq!(
            names,
            vec![
                vec!["quantize"],
                vec!["prune", "tremolo"],
                vec!["ties"],
                vec!["spanners"],
                vec!["keysigs"],
                vec!["keysig-carry"],
                vec!["barlines"],
                vec!["group-parts"],
            ]
        );
    }
}
