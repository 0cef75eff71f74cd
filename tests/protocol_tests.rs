//! Lock and cursor protocol tests: custom modules driving the dispatcher.

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use scoreflow::*;

fn part(id: &str, events: Vec<Event>) -> Part {
    Part::with_meter(id, 2, time(4, 1)).with_events(events)
}

fn two_part_score() -> Score {
    let mut score = Score::new();
    score.parts.push(part(
        "P1",
        vec![
            Event::note(time(0, 1), time(1, 1), 60),
            Event::rest(time(1, 1), time(1, 1)),
            Event::note(time(2, 1), time(2, 1), 62),
            Event::note(time(4, 1), time(1, 1), 55).in_voice(2),
        ],
    ));
    score.parts.push(part(
        "P2",
        vec![
            Event::rest(time(0, 1), time(2, 1)),
            Event::note(time(2, 1), time(1, 1), 48),
            Event::note(time(5, 1), time(1, 1), 50),
        ],
    ));
    score
}

fn settings(threads: usize) -> Settings {
    Settings {
        threads,
        ..Settings::default()
    }
}

/// A configurable test module.
struct TestModule {
    name: &'static str,
    granularity: Granularity,
    engine: Engine,
    action: fn(&mut Pass<'_>, &Mutex<Vec<String>>),
    settle: Option<fn(&mut Owned<'_>, &Mutex<Vec<String>>)>,
    log: Arc<Mutex<Vec<String>>>,
}

impl TestModule {
    fn new(
        name: &'static str,
        granularity: Granularity,
        log: &Arc<Mutex<Vec<String>>>,
        action: fn(&mut Pass<'_>, &Mutex<Vec<String>>),
    ) -> Self {
        Self {
            name,
            granularity,
            engine: Engine::Visit,
            action,
            settle: None,
            log: Arc::clone(log),
        }
    }
}

impl Module for TestModule {
    fn name(&self) -> &str {
        self.name
    }

    fn granularity(&self) -> Granularity {
        self.granularity
    }

    fn engine(&self) -> Engine {
        self.engine
    }

    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError> {
        (self.action)(pass, &self.log);
        Ok(())
    }

    fn settle(&self, owned: &mut Owned<'_>) -> Result<(), ValidationError> {
        if let Some(settle) = self.settle {
            settle(owned, &self.log);
        }
        Ok(())
    }
}

fn record(log: &Mutex<Vec<String>>, entry: String) {
    if let Ok(mut log) = log.lock() {
        log.push(entry);
    }
}

fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
    let mut all = log.lock().unwrap().clone();
    all.sort();
    all
}

// ═══════════════════════════════════════════════════════════════════════
// Cursor behavior
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn exhausted_cursor_stays_exhausted() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register(TestModule::new("drain", Granularity::Voice, &log, |pass, log| {
            let mut notes = pass.notes();
            let mut seen = 0;
            while let Some(v) = notes.next_note() {
                seen += 1;
                pass.commit(v.discard());
            }
            let again = (0..3).filter(|_| notes.next_note().is_some()).count();
            record(log, format!("{} seen={seen} again={again}", pass.key()));
        }))
        .unwrap();

    let report = Pipeline::new(&registry, settings(1)).run_all(two_part_score()).unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "part 0 voice 1 seen=3 again=0",
            "part 0 voice 2 seen=1 again=0",
            "part 1 voice 1 seen=3 again=0",
        ]
    );
    assert_eq!(report.stages[0].commits.discarded, 7);
    println!("✓ cursor exhaustion is idempotent");
}

#[test]
fn partitions_match_granularity() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    for (name, granularity) in [
        ("score", Granularity::Score),
        ("part", Granularity::Part),
        ("measure", Granularity::Measure),
    ] {
        registry
            .register(TestModule::new(name, granularity, &log, |pass, log| {
                let notes = pass.notes().len();
                let measures = pass.measures().len();
                let parts = pass.parts().len();
                record(
                    log,
                    format!("{}: notes={notes} measures={measures} parts={parts}", pass.key()),
                );
            }))
            .unwrap();
    }

    Pipeline::new(&registry, settings(2)).run_all(two_part_score()).unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "part 0 measure 1: notes=3 measures=1 parts=0",
            "part 0 measure 2: notes=1 measures=1 parts=0",
            "part 0: notes=4 measures=2 parts=1",
            "part 1 measure 1: notes=2 measures=1 parts=0",
            "part 1 measure 2: notes=1 measures=1 parts=0",
            "part 1: notes=3 measures=2 parts=1",
            "score: notes=7 measures=4 parts=2",
        ]
    );
    println!("✓ partitions hold what their granularity says");
}

// ═══════════════════════════════════════════════════════════════════════
// Commit protocol
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn deleted_objects_are_skipped_then_swept() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register(TestModule::new("drop-rests", Granularity::Voice, &log, |pass, _| {
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                if v.is_rest() {
                    pass.commit(v.upgrade().delete());
                } else {
                    pass.commit(v.discard());
                }
            }
        }))
        .unwrap();
    registry
        .register(TestModule::new("count-rests", Granularity::Voice, &log, |pass, log| {
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                if v.is_rest() {
                    record(log, format!("rest still visible at {}", v.offset));
                }
                pass.commit(v.accept_unchanged());
            }
        }))
        .unwrap();

    let report = Pipeline::new(&registry, settings(4)).run_all(two_part_score()).unwrap();
    assert_eq!(report.stages.len(), 1);
    assert!(entries(&log).is_empty());
    assert_eq!(report.stages[0].commits.deleted, 2);
    assert_eq!(report.stages[0].swept, 2);
    assert!(report.score.parts.iter().all(|p| p.events.iter().all(|e| !e.is_rest())));
    assert_eq!(report.score.event_count(), 5);
    println!("✓ deleted objects are never yielded again and are swept at the barrier");
}

#[test]
fn inserts_appear_only_after_the_barrier() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register(TestModule::new("echo", Granularity::Voice, &log, |pass, _| {
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                if v.is_note() {
                    let mut echo = (*v).clone();
                    echo.offset += time(1, 2);
                    echo.origin = Origin::Filler;
                    pass.insert(echo);
                }
                pass.commit(v.discard());
            }
        }))
        .unwrap();
    registry
        .register(TestModule::new("same-stage", Granularity::Voice, &log, |pass, log| {
            let count = pass.notes().len();
            record(log, format!("same {} {count}", pass.key()));
        }))
        .unwrap();
    registry
        .register(TestModule::new("next-stage", Granularity::Part, &log, |pass, log| {
            let count = pass.notes().len();
            record(log, format!("next {} {count}", pass.key()));
        }))
        .unwrap();

    let report = Pipeline::new(&registry, settings(1)).run_all(two_part_score()).unwrap();
    assert_eq!(
        entries(&log),
        vec![
            "next part 0 7",
            "next part 1 5",
            "same part 0 voice 1 3",
            "same part 0 voice 2 1",
            "same part 1 voice 1 3",
        ]
    );
    assert_eq!(report.inserted(), 5);

    // Fresh ids continue after the input ids, in partition order
    let fillers: Vec<u64> = report
        .score
        .parts
        .iter()
        .flat_map(|p| p.events.iter())
        .filter(|e| e.origin == Origin::Filler)
        .map(|e| e.id.0)
        .collect();
    assert_eq!(fillers, vec![8, 9, 10, 11, 12]);
    println!("✓ inserted events are filed at the barrier with fresh ids");
}

#[test]
fn invalidation_clears_derived_state() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register(TestModule::new("derive", Granularity::Part, &log, |pass, _| {
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                let mut e = v.upgrade();
                e.cache.staff = Some(1);
                pass.commit(e.accept_unchanged());
            }
            let mut measures = pass.measures();
            while let Some(v) = measures.next_meas() {
                let mut m = v.upgrade();
                m.key = Some(KeySig::major(3));
                pass.commit(m.accept_unchanged());
            }
        }))
        .unwrap();
    registry
        .register(TestModule::new("nudge-first", Granularity::Voice, &log, |pass, _| {
            let mut notes = pass.notes();
            if let Some(v) = notes.next_note() {
                let mut e = v.upgrade();
                e.dynamic = Some(time(1, 2));
                pass.commit(e.accept_invalidate());
            };
        }))
        .unwrap();

    let report = Pipeline::new(&registry, settings(1)).run_all(two_part_score()).unwrap();
    let p1 = &report.score.parts[0];
    // voice 1 starts in measure 1, voice 2 in measure 2
    assert!(p1.measures.iter().all(|m| m.key.is_none()));
    let cached: Vec<bool> = p1.events.iter().map(|e| e.cache.staff.is_some()).collect();
    assert_eq!(cached, vec![false, true, true, false]);

    let p2 = &report.score.parts[1];
    assert_eq!(p2.measures[0].key, None);
    assert_eq!(p2.measures[1].key, Some(KeySig::major(3)));
    assert_eq!(report.stages[1].commits.invalidated, 3);
    println!("✓ accept-invalidate clears caches and the measure's derived key");
}

#[test]
fn dropped_draft_changes_nothing() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register(TestModule::new("second-thoughts", Granularity::Voice, &log, |pass, _| {
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                let mut e = v.upgrade();
                e.offset += time(10, 1);
                e.duration = time(0, 1);
                pass.commit(e.discard());
            }
        }))
        .unwrap();

    let before = two_part_score();
    let report = Pipeline::new(&registry, settings(3)).run_all(before.clone()).unwrap();
    let spans = |s: &Score| -> Vec<(Time, Time)> {
        s.parts
            .iter()
            .flat_map(|p| p.events.iter().map(|e| (e.offset, e.duration)))
            .collect()
    };
    assert_eq!(spans(&report.score), spans(&before));
    assert_eq!(report.stages[0].commits.discarded, 7);
    println!("✓ discarded drafts never reach the graph");
}

// ═══════════════════════════════════════════════════════════════════════
// Cross-partition reads
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn voice_stage_reads_the_neighbouring_lane() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    registry
        .register(TestModule::new("accent", Granularity::Part, &log, |pass, _| {
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                if v.pitch() != Some(Time::from_integer(62)) {
                    pass.commit(v.discard());
                    continue;
                }
                let mut e = v.upgrade();
                e.dynamic = Some(time(3, 4));
                pass.commit(e.accept_unchanged());
            }
        }))
        .unwrap();
    registry
        .register(TestModule::new("look-across", Granularity::Voice, &log, |pass, log| {
            let view = pass.view();
            let Some(part) = pass.key().part() else {
                return;
            };
            let mut notes = pass.notes();
            while let Some(v) = notes.next_note() {
                for other in view.voices(part) {
                    if v.voices.contains(&other) {
                        continue;
                    }
                    let Some(prev) = view.previous_note(part, other, v.offset) else {
                        continue;
                    };
                    let pitch = prev.pitch().map(|p| p.to_string()).unwrap_or_default();
                    let dynamic = prev.dynamic.map(|d| d.to_string()).unwrap_or_default();
                    let key = pass.key();
                    record(
                        log,
                        format!("{key} at {}: voice {other} had {pitch} at {dynamic}", v.offset),
                    );
                }
                pass.commit(v.discard());
            }
        }))
        .unwrap();

    let report = Pipeline::new(&registry, settings(4)).run_all(two_part_score()).unwrap();
    // the rest at beat 1 is skipped; voice 1 sees nothing before beat 4
    assert_eq!(entries(&log), vec!["part 0 voice 2 at 4: voice 1 had 62 at 3/4"]);
    assert_eq!(report.stages[1].partitions, 3);
    assert_eq!(report.stages[1].commits.discarded, 7);
    println!("✓ lookahead sees the committed neighbour lane");
}

// ═══════════════════════════════════════════════════════════════════════
// Destructive engine
// ═══════════════════════════════════════════════════════════════════════

fn shift_quarter(owned: &mut Owned<'_>, log: &Mutex<Vec<String>>) {
    for event in owned.events.iter_mut() {
        event.offset += time(1, 4);
    }
    record(log, format!("settle {} events={}", owned.key(), owned.events.len()));
}

#[test]
fn settle_phase_owns_disjoint_partitions() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut registry = Registry::new();
    let mut shift = TestModule::new("shift", Granularity::Measure, &log, |pass, log| {
        record(log, format!("run {}", pass.key()));
    });
    shift.engine = Engine::Destructive;
    shift.settle = Some(shift_quarter);
    registry.register(shift).unwrap();

    let report = Pipeline::new(&registry, settings(4)).run_all(two_part_score()).unwrap();
    let log = entries(&log);
    assert_eq!(log.iter().filter(|l| l.starts_with("run")).count(), 4);
    assert_eq!(
        log.iter().filter(|l| l.starts_with("settle")).cloned().collect::<Vec<_>>(),
        vec![
            "settle part 0 measure 1 events=3",
            "settle part 0 measure 2 events=1",
            "settle part 1 measure 1 events=2",
            "settle part 1 measure 2 events=1",
        ]
    );
    let offsets: Vec<Time> = report.score.parts[1].events.iter().map(|e| e.offset).collect();
    assert_eq!(offsets, vec![time(1, 4), time(9, 4), time(21, 4)]);
    println!("✓ settle phase sees every event exactly once, lock-free");
}
