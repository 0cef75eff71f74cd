//! The module interface.
//!
//! A module is one pass over the score.  It declares the granularity it
//! wants to see the score at, how it may be scheduled, and the modules it
//! must run after.  The dispatcher calls [`Module::run`] once per partition
//! with a [`Pass`] giving cursors over exactly that partition.

use serde::Serialize;

use crate::cursor::Cursor;
use crate::error::{PlanError, ValidationError};
use crate::graph::{GraphView, PartitionKey, ScoreGraph};
use crate::lock::{CommitStats, Committed};
use crate::model::{Event, Measure, Metapart, PartInfo};

/// How a stage partitions the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    /// One partition holding everything
    Score,
    /// One partition per part
    Part,
    /// One partition per voice lane
    Voice,
    /// One partition per measure of each part
    Measure,
    /// Events one at a time; partitioned like `Voice`
    Note,
}

/// How a stage treats locking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    /// Every object is reached through the cursor lock protocol
    #[default]
    Visit,
    /// After the locked pass, a lock-free settle pass over disjoint
    /// partitions.  The locked pass may leave everything to the settle
    /// phase.
    Destructive,
}

/// A pluggable pass.
pub trait Module: Send + Sync {
    /// Unique name, used for dependencies and output requirements.
    fn name(&self) -> &str;

    fn granularity(&self) -> Granularity;

    fn engine(&self) -> Engine {
        Engine::Visit
    }

    /// Lower runs first among neighbours of equal granularity.
    fn priority(&self) -> i32 {
        0
    }

    /// Whether this module may share a stage with others.
    fn same_instance_ok(&self) -> bool {
        true
    }

    /// Modules that must have finished before this one starts.
    fn after(&self) -> &[&str] {
        &[]
    }

    /// Process one partition under the lock protocol.
    fn run(&self, pass: &mut Pass<'_>) -> Result<(), ValidationError>;

    /// Lock-free second phase of a destructive stage.
    fn settle(&self, _owned: &mut Owned<'_>) -> Result<(), ValidationError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Per-partition context
// ═══════════════════════════════════════════════════════════════════════

/// What one partition of one stage produced, handed to the barrier.
#[derive(Debug, Default)]
pub(crate) struct PartitionOutcome {
    pub stats: CommitStats,
    pub inserts: Vec<(usize, Event)>,
    pub redo: bool,
}

impl PartitionOutcome {
    pub fn absorb(&mut self, other: PartitionOutcome) {
        self.stats.merge(&other.stats);
        self.inserts.extend(other.inserts);
        self.redo |= other.redo;
    }
}

/// A module's handle on one partition.
pub struct Pass<'g> {
    graph: &'g ScoreGraph,
    key: PartitionKey,
    outcome: PartitionOutcome,
}

impl<'g> Pass<'g> {
    pub(crate) fn new(graph: &'g ScoreGraph, key: PartitionKey) -> Self {
        Self {
            graph,
            key,
            outcome: PartitionOutcome::default(),
        }
    }

    pub(crate) fn finish(self) -> PartitionOutcome {
        self.outcome
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    /// Events of this partition.
    pub fn notes(&self) -> Cursor<'g, Event> {
        Cursor::new(self.graph.event_locks(self.key))
    }

    /// Measures of this partition.
    pub fn measures(&self) -> Cursor<'g, Measure> {
        Cursor::new(self.graph.measure_locks(self.key))
    }

    pub fn parts(&self) -> Cursor<'g, PartInfo> {
        Cursor::new(self.graph.part_locks(self.key))
    }

    pub fn metaparts(&self) -> Cursor<'g, Metapart> {
        Cursor::new(self.graph.metapart_locks(self.key))
    }

    /// Read-only lookahead outside this partition.
    pub fn view(&self) -> GraphView<'g> {
        self.graph.view()
    }

    /// Record how a visit ended.
    pub fn commit(&mut self, done: Committed) {
        self.outcome.stats.record(&done);
    }

    /// Queue a new event for this partition's part.  It is filed, with a
    /// fresh id, at the barrier.  Score-wide passes should use
    /// [`insert_into`](Self::insert_into).
    pub fn insert(&mut self, event: Event) {
        let part = self.key.part().unwrap_or(0);
        self.insert_into(part, event);
    }

    pub fn insert_into(&mut self, part: usize, event: Event) {
        self.outcome.inserts.push((part, event));
    }

    /// Ask the barrier to extend measures to cover every event.
    pub fn request_redo(&mut self) {
        self.outcome.redo = true;
    }

    pub fn stats(&self) -> &CommitStats {
        &self.outcome.stats
    }
}

/// A partition handed out exclusively in the settle phase of a destructive
/// stage.  Holds plain references: no other partition can see these
/// objects while it exists.
pub struct Owned<'g> {
    key: PartitionKey,
    /// Measures of the partition, in time order
    pub measures: Vec<&'g mut Measure>,
    /// Events of the partition, in time order
    pub events: Vec<&'g mut Event>,
}

impl<'g> Owned<'g> {
    pub(crate) fn new(key: PartitionKey) -> Self {
        Self {
            key,
            measures: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn key(&self) -> PartitionKey {
        self.key
    }

    pub(crate) fn sort_events(&mut self) {
        self.events.sort_by(|a, b| a.time_key().cmp(&b.time_key()));
        self.measures.sort_by(|a, b| a.start.cmp(&b.start));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// The ordered list of modules a pipeline may schedule.
#[derive(Default)]
pub struct Registry {
    modules: Vec<Box<dyn Module>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_modules(modules: Vec<Box<dyn Module>>) -> Self {
        Self { modules }
    }

    /// The standard passes, configured from `settings`.
    pub fn standard(settings: &crate::config::Settings) -> Self {
        crate::passes::standard(settings)
    }

    /// Append a module.  Names must be unique.
    pub fn register<M: Module + 'static>(&mut self, module: M) -> Result<&mut Self, PlanError> {
        if self.get(module.name()).is_some() {
            return Err(PlanError::DuplicateModule(module.name().to_string()));
        }
        self.modules.push(Box::new(module));
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&dyn Module> {
        self.iter().find(|m| m.name() == name)
    }

    /// Registration index of a module.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Module> {
        self.modules.iter().map(|m| m.as_ref())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Module for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn granularity(&self) -> Granularity {
            Granularity::Voice
        }

        fn run(&self, _pass: &mut Pass<'_>) -> Result<(), ValidationError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = Registry::new();
        registry.register(Named("a")).unwrap().register(Named("b")).unwrap();
        let err = registry.register(Named("a")).err();
        assert_eq!(err, Some(PlanError::DuplicateModule("a".into())));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.position("b"), Some(1));
    }
}
