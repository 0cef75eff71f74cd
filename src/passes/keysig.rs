//! Key signatures.
//!
//! `keysigs` derives a key for every measure without an explicit one from
//! the pitches in it.  `keysig-carry` then fills measures that had nothing
//! to go on with the key in effect before them.

use crate::error::ValidationError;
use crate::model::*;
use crate::module::{Engine, Granularity, Module, Owned, Pass};

/// The key (-7..=7 fifths, major) leaving the fewest pitches outside its
/// scale.  Ties go to fewer accidentals, then to sharps.  Microtones count
/// as outside every key.  `None` when there are no pitches.
pub fn derive_key(pitches: &[Time]) -> Option<KeySig> {
    if pitches.is_empty() {
        return None;
    }
    (-7i8..=7)
        .map(KeySig::major)
        .min_by_key(|key| {
            let outside = pitches
                .iter()
                .filter(|p| !p.is_integer() || !key.contains(p.to_integer()))
                .count();
            (outside, key.fifths.unsigned_abs(), key.fifths < 0)
        })
}

/// Per-measure key derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySigs;

impl Module for KeySigs {
    fn name(&self) -> &str {
        "keysigs"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Measure
    }

    fn after(&self) -> &[&str] {
        &["quantize"]
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let mut pitches = Vec::new();
        let mut notes = pass.notes();
        while let Some(v) = notes.next_note() {
            pitches.extend(v.pitch());
            pass.commit(v.accept_unchanged());
        }

        let mut measures = pass.measures();
        while let Some(v) = measures.next_meas() {
            let key = v.key_request.or_else(|| derive_key(&pitches));
            if key == v.key {
                pass.commit(v.discard());
                continue;
            }
            let mut m = v.upgrade();
            m.key = key;
            pass.commit(m.accept_unchanged());
        }
        Ok(())
    }
}

/// Carries keys forward into measures without pitches.  Runs lock-free.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySigCarry;

impl Module for KeySigCarry {
    fn name(&self) -> &str {
        "keysig-carry"
    }

    fn granularity(&self) -> Granularity {
        Granularity::Part
    }

    fn engine(&self) -> Engine {
        Engine::Destructive
    }

    fn after(&self) -> &[&str] {
        &["keysigs"]
    }

    /// Nothing to decide under locks; the measures are left as they are
    /// for the settle phase.
    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        let mut measures = pass.measures();
        while let Some(v) = measures.next_meas() {
            pass.commit(v.accept_unchanged());
        }
        Ok(())
    }

    fn settle(&self, owned: &mut Owned<'_>) -> Result<(), ValidationError> {
        let mut current = KeySig::major(0);
        for measure in owned.measures.iter_mut() {
            match measure.key {
                Some(key) => current = key,
                None => measure.key = Some(current),
            }
        }
        Ok(())
    }
}
