//! The locked, runtime form of a score.
//!
//! A [`ScoreGraph`] owns every part, measure and event behind its own
//! [`ObjectLock`].  While a stage runs the graph is shared (`&ScoreGraph`)
//! between workers and objects change only through the lock protocol.
//! Structural work (sweeping deleted objects, filing inserts into lanes,
//! clearing stale caches, extending measures) needs `&mut ScoreGraph` and so
//! only happens at barriers.

use std::collections::BTreeMap;
use std::fmt;

use crate::lock::ObjectLock;
use crate::model::*;
use crate::module::{Granularity, Owned};

/// The unit of parallel work within a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PartitionKey {
    Score,
    Part(usize),
    Voice { part: usize, voice: u32 },
    Measure { part: usize, measure: usize },
}

impl PartitionKey {
    /// The part this partition belongs to, unless it spans the whole score.
    pub fn part(&self) -> Option<usize> {
        match *self {
            PartitionKey::Score => None,
            PartitionKey::Part(part)
            | PartitionKey::Voice { part, .. }
            | PartitionKey::Measure { part, .. } => Some(part),
        }
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionKey::Score => write!(f, "score"),
            PartitionKey::Part(p) => write!(f, "part {p}"),
            PartitionKey::Voice { part, voice } => write!(f, "part {part} voice {voice}"),
            PartitionKey::Measure { part, measure } => {
                write!(f, "part {part} measure {}", measure + 1)
            }
        }
    }
}

/// One part: its own data, its measures, and one lane of events per voice.
#[derive(Debug)]
pub(crate) struct PartNode {
    pub(crate) info: ObjectLock<PartInfo>,
    pub(crate) measures: Vec<ObjectLock<Measure>>,
    pub(crate) lanes: BTreeMap<u32, Vec<ObjectLock<Event>>>,
}

/// What a barrier did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SyncSummary {
    pub inserted: usize,
    pub swept: usize,
    pub measures_added: usize,
}

/// The shared score graph.
#[derive(Debug)]
pub struct ScoreGraph {
    title: Option<String>,
    parts: Vec<PartNode>,
    metaparts: Vec<ObjectLock<Metapart>>,
    next_event: u64,
    next_measure: u64,
}

/// Sort events into lane order.
fn sort_lane(events: &mut [Event]) {
    events.sort_by(|a, b| a.time_key().cmp(&b.time_key()));
}

/// Index of the measure an offset belongs to.  Offsets before the first
/// measure go to the first, offsets past the end to the last.
pub(crate) fn measure_index(bounds: &[(Time, Time)], at: Time) -> usize {
    let idx = bounds.partition_point(|&(_, end)| end <= at);
    idx.min(bounds.len().saturating_sub(1))
}

impl ScoreGraph {
    /// Build the graph from a front end's score.  Event ids are reassigned
    /// in part order.
    pub fn from_score(score: Score) -> Self {
        let mut graph = ScoreGraph {
            title: score.title,
            parts: Vec::with_capacity(score.parts.len()),
            metaparts: Vec::with_capacity(score.metaparts.len()),
            next_event: 1,
            next_measure: 0,
        };

        for (index, part) in score.parts.into_iter().enumerate() {
            let info = PartInfo {
                id: part.id,
                name: part.name,
                voices: part.voices,
            };
            let measures = part
                .measures
                .into_iter()
                .map(|m| graph.lock_measure(m))
                .collect();
            let mut node = PartNode {
                info: ObjectLock::new(index as u64, info),
                measures,
                lanes: BTreeMap::new(),
            };
            let events = part
                .events
                .into_iter()
                .map(|mut e| {
                    e.id = graph.fresh_event_id();
                    e
                })
                .collect();
            file_events(&mut node, events);
            graph.parts.push(node);
        }

        graph.metaparts = score
            .metaparts
            .into_iter()
            .enumerate()
            .map(|(i, mp)| ObjectLock::new(i as u64, mp))
            .collect();

        graph
    }

    /// Hand the finished graph back as a plain score.
    pub fn into_score(self) -> Score {
        let parts = self
            .parts
            .into_iter()
            .filter(|node| !node.info.is_deleted())
            .map(|node| {
                let info = node.info.into_inner();
                let measures = node
                    .measures
                    .into_iter()
                    .filter(|m| !m.is_deleted())
                    .map(ObjectLock::into_inner)
                    .collect();
                let mut events: Vec<Event> = node
                    .lanes
                    .into_values()
                    .flatten()
                    .filter(|e| !e.is_deleted())
                    .map(ObjectLock::into_inner)
                    .collect();
                events.sort_by(|a, b| {
                    (a.time_key(), a.primary_voice(), a.id).cmp(&(
                        b.time_key(),
                        b.primary_voice(),
                        b.id,
                    ))
                });
                Part {
                    id: info.id,
                    name: info.name,
                    measures,
                    events,
                    voices: info.voices,
                }
            })
            .collect();

        Score {
            title: self.title,
            parts,
            metaparts: self
                .metaparts
                .into_iter()
                .filter(|m| !m.is_deleted())
                .map(ObjectLock::into_inner)
                .collect(),
        }
    }

    fn fresh_event_id(&mut self) -> EventId {
        let id = EventId(self.next_event);
        self.next_event += 1;
        id
    }

    fn lock_measure(&mut self, measure: Measure) -> ObjectLock<Measure> {
        let lock = ObjectLock::new(self.next_measure, measure);
        self.next_measure += 1;
        lock
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Read-only access for lookahead across partitions.
    pub fn view(&self) -> GraphView<'_> {
        GraphView { graph: self }
    }

    /// The partitions of a stage at the given granularity, in a fixed
    /// order.
    pub fn partitions(&self, granularity: Granularity) -> Vec<PartitionKey> {
        match granularity {
            Granularity::Score => vec![PartitionKey::Score],
            Granularity::Part => (0..self.parts.len()).map(PartitionKey::Part).collect(),
            Granularity::Voice | Granularity::Note => self
                .parts
                .iter()
                .enumerate()
                .flat_map(|(part, node)| {
                    node.lanes
                        .keys()
                        .map(move |&voice| PartitionKey::Voice { part, voice })
                })
                .collect(),
            Granularity::Measure => self
                .parts
                .iter()
                .enumerate()
                .flat_map(|(part, node)| {
                    (0..node.measures.len())
                        .map(move |measure| PartitionKey::Measure { part, measure })
                })
                .collect(),
        }
    }

    // ── Partition contents (handed to cursors) ──────────────────────

    pub(crate) fn event_locks(&self, key: PartitionKey) -> Vec<&ObjectLock<Event>> {
        match key {
            PartitionKey::Score => self
                .parts
                .iter()
                .flat_map(|node| node.lanes.values().flatten())
                .collect(),
            PartitionKey::Part(part) => self
                .parts
                .get(part)
                .map(|node| node.lanes.values().flatten().collect())
                .unwrap_or_default(),
            PartitionKey::Voice { part, voice } => self
                .parts
                .get(part)
                .and_then(|node| node.lanes.get(&voice))
                .map(|lane| lane.iter().collect())
                .unwrap_or_default(),
            PartitionKey::Measure { part, measure } => {
                let Some(node) = self.parts.get(part) else {
                    return Vec::new();
                };
                let bounds = self.view().measure_bounds(part);
                node.lanes
                    .values()
                    .flatten()
                    .filter(|lock| measure_index(&bounds, lock.read().offset) == measure)
                    .collect()
            }
        }
    }

    pub(crate) fn measure_locks(&self, key: PartitionKey) -> Vec<&ObjectLock<Measure>> {
        match key {
            PartitionKey::Score => self
                .parts
                .iter()
                .flat_map(|node| node.measures.iter())
                .collect(),
            PartitionKey::Part(part) => self
                .parts
                .get(part)
                .map(|node| node.measures.iter().collect())
                .unwrap_or_default(),
            PartitionKey::Measure { part, measure } => self
                .parts
                .get(part)
                .and_then(|node| node.measures.get(measure))
                .into_iter()
                .collect(),
            PartitionKey::Voice { .. } => Vec::new(),
        }
    }

    pub(crate) fn part_locks(&self, key: PartitionKey) -> Vec<&ObjectLock<PartInfo>> {
        match key {
            PartitionKey::Score => self.parts.iter().map(|node| &node.info).collect(),
            PartitionKey::Part(part) => {
                self.parts.get(part).map(|node| &node.info).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn metapart_locks(&self, key: PartitionKey) -> Vec<&ObjectLock<Metapart>> {
        match key {
            PartitionKey::Score => self.metaparts.iter().collect(),
            _ => Vec::new(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Barrier work
    // ═══════════════════════════════════════════════════════════════════

    /// Whether every object lock is free.  Guards borrow the graph, so this
    /// only fails if a guard was leaked.
    pub(crate) fn all_unlocked(&self) -> bool {
        self.parts.iter().all(|node| {
            !node.info.is_locked()
                && node.measures.iter().all(|m| !m.is_locked())
                && node.lanes.values().flatten().all(|e| !e.is_locked())
        }) && self.metaparts.iter().all(|m| !m.is_locked())
    }

    /// Run the barrier: clear stale caches, sweep deleted objects, file the
    /// inserted events (in the order given), and on `redo` extend measures
    /// to cover every event.
    pub(crate) fn sync(&mut self, inserts: Vec<(usize, Event)>, redo: bool) -> SyncSummary {
        debug_assert!(self.all_unlocked(), "object lock still held at a barrier");

        let mut summary = SyncSummary::default();
        let mut incoming: Vec<Vec<Event>> = vec![Vec::new(); self.parts.len()];
        for (part, mut event) in inserts {
            if part >= incoming.len() {
                log::warn!("dropping event inserted into unknown part {part}");
                continue;
            }
            event.id = self.fresh_event_id();
            incoming[part].push(event);
            summary.inserted += 1;
        }

        self.metaparts.retain(|m| !m.is_deleted());
        for mp in &mut self.metaparts {
            if mp.take_stale() {
                mp.get_mut().voices.clear();
            }
        }

        let mut kept = Vec::with_capacity(self.parts.len());
        for (mut node, new_events) in std::mem::take(&mut self.parts).into_iter().zip(incoming) {
            if node.info.is_deleted() {
                summary.swept += 1;
                continue;
            }
            if node.info.take_stale() {
                node.info.get_mut().voices.clear();
            }
            summary.swept += sweep_part(&mut node, new_events);
            kept.push(node);
        }
        self.parts = kept;

        if redo {
            summary.measures_added = self.extend_measures();
        }
        summary
    }

    /// Append measures (repeating each part's last measure length) until
    /// every event ends inside the part.
    fn extend_measures(&mut self) -> usize {
        let mut added = 0;
        for index in 0..self.parts.len() {
            let latest = self.parts[index]
                .lanes
                .values_mut()
                .flatten()
                .map(|lock| {
                    let e = lock.get_mut();
                    e.offset + e.duration
                })
                .max();
            let Some(latest) = latest else {
                continue;
            };
            loop {
                let last = self.parts[index]
                    .measures
                    .last_mut()
                    .map(|m| m.get_mut().clone());
                let Some(last) = last else {
                    break;
                };
                let length = last.end - last.start;
                if last.end >= latest || length <= Time::from_integer(0) {
                    break;
                }
                let mut next = Measure::new(last.end, last.end + length);
                next.divisions = last.divisions;
                let lock = self.lock_measure(next);
                self.parts[index].measures.push(lock);
                added += 1;
            }
        }
        if added > 0 {
            log::info!("extended score by {added} measure(s) to cover quantized events");
        }
        added
    }

    /// Split the graph into disjoint, lock-free partitions for the settle
    /// phase of a destructive stage.
    pub(crate) fn owned_partitions(&mut self, granularity: Granularity) -> Vec<Owned<'_>> {
        let mut out = Vec::new();
        match granularity {
            Granularity::Score => {
                let mut all = Owned::new(PartitionKey::Score);
                for node in &mut self.parts {
                    let PartNode { measures, lanes, .. } = node;
                    all.measures.extend(measures.iter_mut().map(ObjectLock::get_mut));
                    all.events
                        .extend(lanes.values_mut().flatten().map(ObjectLock::get_mut));
                }
                all.sort_events();
                out.push(all);
            }
            Granularity::Part => {
                for (part, node) in self.parts.iter_mut().enumerate() {
                    let PartNode { measures, lanes, .. } = node;
                    let mut owned = Owned::new(PartitionKey::Part(part));
                    owned.measures = measures.iter_mut().map(ObjectLock::get_mut).collect();
                    owned.events = lanes.values_mut().flatten().map(ObjectLock::get_mut).collect();
                    owned.sort_events();
                    out.push(owned);
                }
            }
            Granularity::Voice | Granularity::Note => {
                for (part, node) in self.parts.iter_mut().enumerate() {
                    for (&voice, lane) in node.lanes.iter_mut() {
                        let mut owned = Owned::new(PartitionKey::Voice { part, voice });
                        owned.events = lane.iter_mut().map(ObjectLock::get_mut).collect();
                        out.push(owned);
                    }
                }
            }
            Granularity::Measure => {
                for (part, node) in self.parts.iter_mut().enumerate() {
                    let PartNode { measures, lanes, .. } = node;
                    if measures.is_empty() {
                        continue;
                    }
                    let bounds: Vec<(Time, Time)> = measures
                        .iter_mut()
                        .map(|m| {
                            let m = m.get_mut();
                            (m.start, m.end)
                        })
                        .collect();
                    let mut buckets: Vec<Vec<&mut Event>> =
                        (0..bounds.len()).map(|_| Vec::new()).collect();
                    for lock in lanes.values_mut().flatten() {
                        let event = lock.get_mut();
                        buckets[measure_index(&bounds, event.offset)].push(event);
                    }
                    for (measure, (lock, events)) in measures.iter_mut().zip(buckets).enumerate() {
                        let mut owned = Owned::new(PartitionKey::Measure { part, measure });
                        owned.measures.push(lock.get_mut());
                        owned.events = events;
                        owned.sort_events();
                        out.push(owned);
                    }
                }
            }
        }
        out
    }

    /// Restore lane order after lock-free edits.
    pub(crate) fn resort(&mut self) {
        for node in &mut self.parts {
            sweep_part(node, Vec::new());
        }
    }
}

/// Re-file a part's events: clear stale caches (and the derived key of the
/// measure a stale event sits in), drop deleted events and measures, add
/// `incoming`, regroup by primary voice and sort each lane.  Returns the
/// number of objects swept.
fn sweep_part(node: &mut PartNode, incoming: Vec<Event>) -> usize {
    let mut swept = 0;
    let before = node.measures.len();
    node.measures.retain(|m| !m.is_deleted());
    swept += before - node.measures.len();

    for lock in &mut node.measures {
        if lock.take_stale() {
            let m = lock.get_mut();
            m.key = m.key_request;
            m.barline = None;
        }
    }

    let bounds: Vec<(Time, Time)> = node
        .measures
        .iter_mut()
        .map(|m| {
            let m = m.get_mut();
            (m.start, m.end)
        })
        .collect();

    let mut events = Vec::new();
    for mut lock in std::mem::take(&mut node.lanes).into_values().flatten() {
        if lock.is_deleted() {
            swept += 1;
            continue;
        }
        let stale = lock.take_stale();
        let mut event = lock.into_inner();
        if stale {
            event.cache = EventCache::default();
            if !bounds.is_empty() {
                let m = node.measures[measure_index(&bounds, event.offset)].get_mut();
                m.key = m.key_request;
            }
        }
        events.push(event);
    }
    events.extend(incoming);
    file_events(node, events);
    swept
}

/// Group events into lanes by primary voice, sorted.
fn file_events(node: &mut PartNode, events: Vec<Event>) {
    let mut lanes: BTreeMap<u32, Vec<Event>> = BTreeMap::new();
    for event in events {
        lanes.entry(event.primary_voice()).or_default().push(event);
    }
    node.lanes = lanes
        .into_iter()
        .map(|(voice, mut lane)| {
            sort_lane(&mut lane);
            let locks = lane
                .into_iter()
                .map(|e| ObjectLock::new(e.id.0, e))
                .collect();
            (voice, locks)
        })
        .collect();
}

// ═══════════════════════════════════════════════════════════════════════
// Read-only view
// ═══════════════════════════════════════════════════════════════════════

/// Lookahead into any partition.  Every method copies values out under
/// brief shared locks, so holding the results never blocks anyone.
///
/// A module holding an [`Exclusive`](crate::lock::Exclusive) must not read
/// objects another partition of the same stage can lock exclusively.
#[derive(Clone, Copy)]
pub struct GraphView<'g> {
    graph: &'g ScoreGraph,
}

impl<'g> GraphView<'g> {
    pub fn part_count(&self) -> usize {
        self.graph.parts.len()
    }

    pub fn title(&self) -> Option<&'g str> {
        self.graph.title.as_deref()
    }

    pub fn measures(&self, part: usize) -> Vec<Measure> {
        self.graph
            .parts
            .get(part)
            .map(|node| {
                node.measures
                    .iter()
                    .filter(|m| !m.is_deleted())
                    .map(ObjectLock::snapshot)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `(start, end)` of every measure of a part.
    pub fn measure_bounds(&self, part: usize) -> Vec<(Time, Time)> {
        self.graph
            .parts
            .get(part)
            .map(|node| {
                node.measures
                    .iter()
                    .filter(|m| !m.is_deleted())
                    .map(|m| {
                        let m = m.read();
                        (m.start, m.end)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// End of a part's last measure.
    pub fn part_end(&self, part: usize) -> Option<Time> {
        self.measure_bounds(part).last().map(|&(_, end)| end)
    }

    /// Voice lanes of a part.
    pub fn voices(&self, part: usize) -> Vec<u32> {
        self.graph
            .parts
            .get(part)
            .map(|node| node.lanes.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of one lane, in lane order.
    pub fn voice_events(&self, part: usize, voice: u32) -> Vec<Event> {
        self.graph
            .parts
            .get(part)
            .and_then(|node| node.lanes.get(&voice))
            .map(|lane| {
                lane.iter()
                    .filter(|e| !e.is_deleted())
                    .map(ObjectLock::snapshot)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The last note of a lane starting before `before`.
    pub fn previous_note(&self, part: usize, voice: u32, before: Time) -> Option<Event> {
        let lane = self.graph.parts.get(part)?.lanes.get(&voice)?;
        lane.iter()
            .rev()
            .filter(|lock| !lock.is_deleted())
            .map(ObjectLock::snapshot)
            .find(|e| e.is_note() && e.offset < before)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::time::Duration;

    use super::*;
    use crate::lock::Visit;

    fn two_voice_score() -> Score {
        let mut score = Score::new();
        score.parts.push(Part::with_meter("P1", 2, time(4, 1)).with_events(vec![
            Event::note(time(4, 1), time(1, 1), 64),
            Event::note(time(0, 1), time(1, 1), 60),
            Event::note(time(1, 1), time(1, 1), 62).in_voice(2),
        ]));
        score
    }

    #[test]
    fn events_are_filed_by_voice_and_sorted() {
        let graph = ScoreGraph::from_score(two_voice_score());
        let view = graph.view();
        assert_eq!(view.voices(0), vec![1, 2]);
        let lane: Vec<Time> = view.voice_events(0, 1).iter().map(|e| e.offset).collect();
        assert_eq!(lane, vec![time(0, 1), time(4, 1)]);
    }

    #[test]
    fn partitions_follow_granularity() {
        let graph = ScoreGraph::from_score(two_voice_score());
        assert_eq!(graph.partitions(Granularity::Score), vec![PartitionKey::Score]);
        assert_eq!(graph.partitions(Granularity::Part).len(), 1);
        assert_eq!(
            graph.partitions(Granularity::Voice),
            vec![
                PartitionKey::Voice { part: 0, voice: 1 },
                PartitionKey::Voice { part: 0, voice: 2 }
            ]
        );
        assert_eq!(graph.partitions(Granularity::Measure).len(), 2);
    }

    #[test]
    fn measure_partition_holds_contained_events() {
        let graph = ScoreGraph::from_score(two_voice_score());
        let first = graph.event_locks(PartitionKey::Measure { part: 0, measure: 0 });
        let second = graph.event_locks(PartitionKey::Measure { part: 0, measure: 1 });
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn measure_index_clamps() {
        let bounds = vec![(time(0, 1), time(4, 1)), (time(4, 1), time(8, 1))];
        assert_eq!(measure_index(&bounds, time(-1, 1)), 0);
        assert_eq!(measure_index(&bounds, time(4, 1)), 1);
        assert_eq!(measure_index(&bounds, time(20, 1)), 1);
    }

    #[test]
    fn sync_files_inserts_and_extends_measures() {
        let mut graph = ScoreGraph::from_score(two_voice_score());
        let added = Event::note(time(9, 1), time(2, 1), 67).in_voice(3);
        let summary = graph.sync(vec![(0, added)], true);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.measures_added, 1);
        let score = graph.into_score();
        assert_eq!(score.parts[0].measures.len(), 3);
        let last = score.parts[0].events.last().unwrap();
        assert_eq!(last.id, EventId(4));
        assert_eq!(last.voices, std::collections::BTreeSet::from([3]));
    }

    #[test]
    fn view_answers_lookahead_questions() {
        let mut score = two_voice_score();
        score.title = Some("Etude".into());
        let graph = ScoreGraph::from_score(score);
        let view = graph.view();

        assert_eq!(view.title(), Some("Etude"));
        assert_eq!(view.part_count(), 1);
        let starts: Vec<Time> = view.measures(0).iter().map(|m| m.start).collect();
        assert_eq!(starts, vec![time(0, 1), time(4, 1)]);
        assert!(view.measures(3).is_empty());

        let before = |voice, beat| {
            view.previous_note(0, voice, time(beat, 1))
                .and_then(|e| e.pitch())
        };
        assert_eq!(before(1, 4), Some(Time::from_integer(60)));
        assert_eq!(before(1, 5), Some(Time::from_integer(64)));
        assert_eq!(before(2, 1), None, "strictly before");
        assert_eq!(before(2, 2), Some(Time::from_integer(62)));
        assert_eq!(before(7, 9), None);
    }

    #[test]
    fn view_reads_wait_for_an_exclusive_holder() {
        let graph = ScoreGraph::from_score(two_voice_score());
        let view = graph.view();
        let locks = graph.event_locks(PartitionKey::Voice { part: 0, voice: 1 });
        let first = locks[0];
        let mut excl = Visit::new(first, first.upgradable(), &[]).upgrade();
        excl.duration = time(3, 1);

        let (ready_tx, ready) = mpsc::channel();
        let (seen_tx, seen) = mpsc::channel();
        std::thread::scope(|s| {
            s.spawn(move || {
                ready_tx.send(()).unwrap();
                let lane = view.voice_events(0, 1);
                seen_tx
                    .send(lane.iter().map(|e| e.duration).collect::<Vec<_>>())
                    .unwrap();
            });
            ready.recv().unwrap();
            assert_eq!(
                seen.recv_timeout(Duration::from_millis(50)),
                Err(RecvTimeoutError::Timeout)
            );
            let _ = excl.accept_invalidate();
            assert_eq!(seen.recv().unwrap(), vec![time(3, 1), time(1, 1)]);
        });
    }

    #[test]
    fn round_trip_keeps_events() {
        let graph = ScoreGraph::from_score(two_voice_score());
        let score = graph.into_score();
        assert_eq!(score.event_count(), 3);
        let ids: Vec<u64> = score.parts[0].events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }
}
