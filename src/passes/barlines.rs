//! Barlines between measures.

use crate::error::ValidationError;
use crate::model::*;
use crate::module::{Granularity, Module, Pass};

/// Combine the barlines requested on both sides of one bar.  Commutative.
pub fn merge_barlines(a: Barline, b: Barline) -> Barline {
    match (a, b) {
        (Barline::Final, Barline::Initial) | (Barline::Initial, Barline::Final) => {
            Barline::InitFinal
        }
        (Barline::RepeatRight, Barline::RepeatLeft)
        | (Barline::RepeatLeft, Barline::RepeatRight) => Barline::RepeatBoth,
        _ => a.max(b),
    }
}

fn merge_requests(right: Option<Barline>, left: Option<Barline>) -> Barline {
    match (right, left) {
        (Some(a), Some(b)) => merge_barlines(a, b),
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => Barline::Normal,
    }
}

/// Decides the barline drawn at the right edge of every measure.
#[derive(Debug, Clone, Copy)]
pub struct Barlines {
    final_barline: Barline,
}

impl Barlines {
    pub fn new(final_barline: Barline) -> Self {
        Self { final_barline }
    }
}

impl Module for Barlines {
    fn name(&self) -> &str {
        "barlines"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Part
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let mut measures = pass.measures();
        while let Some(v) = measures.next_meas() {
            let barline = match v.peek_next() {
                Some(next) => merge_requests(v.right_barline, next.left_barline),
                None => v.right_barline.unwrap_or(self.final_barline),
            };
            if v.barline == Some(barline) {
                pass.commit(v.discard());
                continue;
            }
            let mut m = v.upgrade();
            m.barline = Some(barline);
            pass.commit(m.accept_unchanged());
        }
        Ok(())
    }
}
