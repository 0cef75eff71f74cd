//! scoreflow: staged, partition-parallel module pipeline that prepares a
//! parsed score for engraving.
//!
//! A front end hands over a [`Score`]; the pipeline plans the modules the
//! requested back ends need into stages, runs each stage over the score's
//! partitions (parts, voices or measures) on a worker pool, and hands the
//! finished score back.
//!
//! # Example
//! ```no_run
//! use scoreflow::{process, read_score_file, Output, Settings};
//!
//! let score = read_score_file("path/to/score.json").unwrap();
//! let report = process(score, &[Output::Lilypond], Settings::default()).unwrap();
//! println!("Stages: {}", report.stages.len());
//! println!("Events: {}", report.score.event_count());
//! ```

pub mod config;
pub mod cursor;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod lock;
pub mod model;
pub mod module;
pub mod passes;
pub mod pipeline;
pub mod planner;

use std::path::Path;

pub use config::{PrunePolicy, Settings};
pub use error::{PipelineError, PlanError, ValidationError};
pub use model::*;
pub use module::{Engine, Granularity, Module, Owned, Pass, Registry};
pub use pipeline::{Pipeline, RunReport};
pub use planner::Output;

/// Run the standard passes over `score` for the given back ends.
pub fn process(
    score: Score,
    outputs: &[Output],
    settings: Settings,
) -> Result<RunReport, PipelineError> {
    let registry = Registry::standard(&settings);
    Pipeline::new(&registry, settings).run(score, outputs)
}

/// Parse a score from its JSON hand-off form.
pub fn score_from_json(json: &str) -> Result<Score, PipelineError> {
    Ok(serde_json::from_str(json)?)
}

/// Convert a score to a JSON string.
/// Useful for passing data across FFI boundaries.
pub fn score_to_json(score: &Score) -> Result<String, PipelineError> {
    Ok(serde_json::to_string_pretty(score)?)
}

/// Read a score from a JSON file.
pub fn read_score_file<P: AsRef<Path>>(path: P) -> Result<Score, PipelineError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| PipelineError::Io {
        path: path.display().to_string(),
        source,
    })?;
    score_from_json(&json)
}

/// JSON in, JSON out: the whole run for hosts that only pass strings.
fn process_json(score_json: &str, settings_json: Option<&str>) -> Result<String, PipelineError> {
    let settings = match settings_json {
        Some(json) if !json.trim().is_empty() => Settings::from_json(json)?,
        _ => Settings::default(),
    };
    let score = score_from_json(score_json)?;
    let report = process(score, &[Output::Lilypond], settings)?;
    score_to_json(&report.score)
}

// ═══════════════════════════════════════════════════════════════════════
// C FFI for iOS (static library) and desktop hosts
// ═══════════════════════════════════════════════════════════════════════

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

/// Run the standard passes over a score given as JSON and return the
/// finished score as JSON.  Returns null on any failure (the reason is
/// logged).
/// The caller must free the returned string with `scoreflow_free_string`.
///
/// # Safety
/// `score_json` must be a valid null-terminated UTF-8 C string.
/// `settings_json` may be null.
#[no_mangle]
pub unsafe extern "C" fn scoreflow_process_json(
    score_json: *const c_char,
    settings_json: *const c_char,
) -> *mut c_char {
    if score_json.is_null() {
        return std::ptr::null_mut();
    }
    let score = match unsafe { CStr::from_ptr(score_json) }.to_str() {
        Ok(s) => s,
        Err(_) => return std::ptr::null_mut(),
    };
    let settings = if settings_json.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(settings_json) }.to_str().ok()
    };

    match process_json(score, settings) {
        Ok(json) => CString::new(json).unwrap_or_default().into_raw(),
        Err(e) => {
            log::error!("scoreflow_process_json: {e}");
            std::ptr::null_mut()
        }
    }
}

/// Free a string previously returned by scoreflow functions.
///
/// # Safety
/// `ptr` must be a string previously returned by a scoreflow function, or null.
#[no_mangle]
pub unsafe extern "C" fn scoreflow_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ffi_round_trip() {
        let score = r#"{
            "parts": [{
                "id": "P1",
                "measures": [{ "start": [0, 1], "end": [4, 1] }],
                "events": [{
                    "kind": { "note": { "sound": { "pitch": [60, 1] } } },
                    "offset": [0, 1],
                    "duration": [6, 1]
                }]
            }]
        }"#;
        let score = CString::new(score).unwrap();
        let out = unsafe { scoreflow_process_json(score.as_ptr(), std::ptr::null()) };
        assert!(!out.is_null());
        let json = unsafe { CStr::from_ptr(out) }.to_str().unwrap().to_string();
        unsafe { scoreflow_free_string(out) };

        let finished = score_from_json(&json).unwrap();
        assert_eq!(finished.parts[0].measures.len(), 2);
        assert_eq!(finished.parts[0].events.len(), 2);
    }

    #[test]
    fn ffi_rejects_bad_input() {
        let bad = CString::new("{ not json").unwrap();
        let out = unsafe { scoreflow_process_json(bad.as_ptr(), std::ptr::null()) };
        assert!(out.is_null());
        assert!(unsafe { scoreflow_process_json(std::ptr::null(), std::ptr::null()) }.is_null());
    }
}
