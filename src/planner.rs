//! Stage planning.
//!
//! Turns the registry and the requested outputs into an ordered list of
//! stages.  Everything that can be wrong with a module list is caught here,
//! before the graph is built.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::module::{Engine, Granularity, Module, Registry};

/// A back end the score is being prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Output {
    Midi,
    Lilypond,
    MusicXml,
}

impl Output {
    /// Modules this back end needs.  Their dependencies come along.
    pub fn requires(self) -> &'static [&'static str] {
        match self {
            Output::Midi => &["quantize", "prune", "ties"],
            Output::Lilypond | Output::MusicXml => &[
                "quantize",
                "prune",
                "tremolo",
                "ties",
                "spanners",
                "keysigs",
                "keysig-carry",
                "barlines",
                "group-parts",
            ],
        }
    }
}

/// Why a stage is separated from the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncReason {
    /// First stage of the run
    Start,
    /// Different partitioning
    Granularity,
    /// Entering or leaving a whole-score stage
    WholeScore,
    /// Different locking engine
    Engine,
    /// A module that must run alone
    Exclusive,
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncReason::Start => "start",
            SyncReason::Granularity => "granularity",
            SyncReason::WholeScore => "whole score",
            SyncReason::Engine => "engine",
            SyncReason::Exclusive => "exclusive",
        };
        f.write_str(s)
    }
}

/// Modules that run together between two barriers.
pub struct Stage<'r> {
    pub index: usize,
    pub granularity: Granularity,
    pub engine: Engine,
    pub sync: SyncReason,
    pub modules: Vec<&'r dyn Module>,
}

impl Stage<'_> {
    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name().to_string()).collect()
    }

    fn accepts(&self, module: &dyn Module) -> bool {
        module.granularity() == self.granularity
            && module.engine() == self.engine
            && module.same_instance_ok()
            && self.modules.iter().all(|m| m.same_instance_ok())
    }

    fn reason_for(&self, module: &dyn Module) -> SyncReason {
        let granularity = module.granularity();
        if granularity != self.granularity {
            if granularity == Granularity::Score || self.granularity == Granularity::Score {
                SyncReason::WholeScore
            } else {
                SyncReason::Granularity
            }
        } else if module.engine() != self.engine {
            SyncReason::Engine
        } else {
            SyncReason::Exclusive
        }
    }
}

impl fmt::Debug for Stage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("index", &self.index)
            .field("granularity", &self.granularity)
            .field("engine", &self.engine)
            .field("sync", &self.sync)
            .field("modules", &self.module_names())
            .finish()
    }
}

/// Plan the stages needed for `outputs`.
pub fn plan<'r>(registry: &'r Registry, outputs: &[Output]) -> Result<Vec<Stage<'r>>, PlanError> {
    if outputs.is_empty() {
        return Err(PlanError::NothingRequested);
    }
    let mut wanted = BTreeSet::new();
    for output in outputs {
        for &name in output.requires() {
            if registry.get(name).is_none() {
                return Err(PlanError::UnknownModule(name.to_string()));
            }
            wanted.insert(name.to_string());
        }
    }
    build(registry, wanted)
}

/// Plan every registered module.
pub fn plan_all(registry: &Registry) -> Result<Vec<Stage<'_>>, PlanError> {
    if registry.is_empty() {
        return Err(PlanError::NothingRequested);
    }
    let wanted = registry.iter().map(|m| m.name().to_string()).collect();
    build(registry, wanted)
}

fn build(registry: &Registry, mut wanted: BTreeSet<String>) -> Result<Vec<Stage<'_>>, PlanError> {
    // Dependency closure
    let mut queue: Vec<String> = wanted.iter().cloned().collect();
    while let Some(name) = queue.pop() {
        let Some(module) = registry.get(&name) else {
            return Err(PlanError::UnknownModule(name));
        };
        for &dep in module.after() {
            if registry.get(dep).is_none() {
                return Err(PlanError::MissingDependency {
                    module: name.clone(),
                    needs: dep.to_string(),
                });
            }
            if wanted.insert(dep.to_string()) {
                queue.push(dep.to_string());
            }
        }
    }

    let selected: Vec<&dyn Module> = registry
        .iter()
        .filter(|m| wanted.contains(m.name()))
        .collect();
    let ordered = order_by_priority(selected);
    check_order(&ordered)?;

    if let Some(m) = ordered
        .iter()
        .find(|m| m.granularity() == Granularity::Note && m.engine() == Engine::Destructive)
    {
        return Err(PlanError::UnsupportedEngine {
            module: m.name().to_string(),
        });
    }

    Ok(fold(ordered))
}

/// Stable sort by priority inside each run of equal granularity.
fn order_by_priority(selected: Vec<&dyn Module>) -> Vec<&dyn Module> {
    let mut ordered = Vec::with_capacity(selected.len());
    let mut run: Vec<&dyn Module> = Vec::new();
    for module in selected {
        if run.last().is_some_and(|m| m.granularity() != module.granularity()) {
            run.sort_by_key(|m| m.priority());
            ordered.append(&mut run);
        }
        run.push(module);
    }
    run.sort_by_key(|m| m.priority());
    ordered.append(&mut run);
    ordered
}

/// Every dependency must come before its dependent.
fn check_order(ordered: &[&dyn Module]) -> Result<(), PlanError> {
    for (at, module) in ordered.iter().enumerate() {
        for &dep in module.after() {
            let before = ordered[..at].iter().any(|m| m.name() == dep);
            if !before {
                return Err(PlanError::OrderViolation {
                    module: module.name().to_string(),
                    needs: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn fold(ordered: Vec<&dyn Module>) -> Vec<Stage<'_>> {
    let mut stages: Vec<Stage<'_>> = Vec::new();
    for module in ordered {
        if let Some(stage) = stages.last_mut().filter(|s| s.accepts(module)) {
            stage.modules.push(module);
            continue;
        }
        let sync = stages
            .last()
            .map_or(SyncReason::Start, |stage| stage.reason_for(module));
        stages.push(Stage {
            index: stages.len(),
            granularity: module.granularity(),
            engine: module.engine(),
            sync,
            modules: vec![module],
        });
    }
    stages
}
