//! Run-level entry point.

use serde::Serialize;

use crate::config::Settings;
use crate::dispatch::{Dispatcher, StageReport};
use crate::error::{PipelineError, PlanError};
use crate::graph::ScoreGraph;
use crate::model::Score;
use crate::module::Registry;
use crate::planner::{self, Output, Stage};

/// The finished score plus what each stage did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub score: Score,
    pub stages: Vec<StageReport>,
}

impl RunReport {
    /// Total events inserted across all stages.
    pub fn inserted(&self) -> usize {
        self.stages.iter().map(|s| s.inserted).sum()
    }
}

/// A configured pipeline over a registry.
pub struct Pipeline<'r> {
    registry: &'r Registry,
    settings: Settings,
}

impl<'r> Pipeline<'r> {
    pub fn new(registry: &'r Registry, settings: Settings) -> Self {
        Self { registry, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The stages a run for `outputs` would execute.
    pub fn plan(&self, outputs: &[Output]) -> Result<Vec<Stage<'r>>, PlanError> {
        planner::plan(self.registry, outputs)
    }

    /// Prepare `score` for the requested back ends.
    pub fn run(&self, score: Score, outputs: &[Output]) -> Result<RunReport, PipelineError> {
        let stages = self.plan(outputs)?;
        self.execute(score, &stages)
    }

    /// Run every registered module.
    pub fn run_all(&self, score: Score) -> Result<RunReport, PipelineError> {
        let stages = planner::plan_all(self.registry)?;
        self.execute(score, &stages)
    }

    fn execute(&self, score: Score, stages: &[Stage<'_>]) -> Result<RunReport, PipelineError> {
        let dispatcher = Dispatcher::new(&self.settings)?;
        let mut graph = ScoreGraph::from_score(score);
        log::info!(
            "running {} stage(s) over {} part(s) on {} worker(s)",
            stages.len(),
            graph.part_count(),
            dispatcher.workers()
        );

        let mut reports = Vec::with_capacity(stages.len());
        for stage in stages {
            let report = dispatcher.run_stage(&mut graph, stage)?;
            log::debug!(
                "stage {} done ({} sync): {} commit(s), {} inserted, {} swept",
                report.index,
                report.sync,
                report.commits.total(),
                report.inserted,
                report.swept
            );
            reports.push(report);
        }

        let score = graph.into_score();
        log::info!(
            "finished: {} part(s), {} event(s), {} measure(s)",
            score.parts.len(),
            score.event_count(),
            score.measure_count()
        );
        Ok(RunReport {
            score,
            stages: reports,
        })
    }
}
