//! Running one stage: fan partitions out, join, then run the barrier.

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;

use crate::config::Settings;
use crate::error::PipelineError;
use crate::graph::{PartitionKey, ScoreGraph};
use crate::lock::CommitStats;
use crate::module::{Engine, Granularity, Owned, PartitionOutcome, Pass};
use crate::planner::{Stage, SyncReason};

/// What a stage did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub index: usize,
    pub modules: Vec<String>,
    pub granularity: Granularity,
    pub engine: Engine,
    pub sync: SyncReason,
    pub partitions: usize,
    pub commits: CommitStats,
    /// Events filed at the barrier
    pub inserted: usize,
    /// Deleted objects removed at the barrier
    pub swept: usize,
    /// Measures appended because an event ran past the end
    pub measures_added: usize,
}

/// Runs stages either on the caller's thread or on a bounded worker pool.
pub struct Dispatcher {
    pool: Option<ThreadPool>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(settings: &Settings) -> Result<Self, PipelineError> {
        if !settings.is_parallel() {
            return Ok(Self {
                pool: None,
                workers: 1,
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.threads)
            .thread_name(|i| format!("scoreflow-worker-{i}"))
            .build()?;
        let workers = pool.current_num_threads();
        Ok(Self {
            pool: Some(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every module of `stage` over every partition, then the barrier.
    /// The first failing partition (in partition order) aborts the run.
    pub fn run_stage(
        &self,
        graph: &mut ScoreGraph,
        stage: &Stage<'_>,
    ) -> Result<StageReport, PipelineError> {
        let keys = graph.partitions(stage.granularity);
        log::debug!(
            "stage {} [{}]: {} partition(s) by {:?}",
            stage.index,
            stage.module_names().join(", "),
            keys.len(),
            stage.granularity
        );

        let shared: &ScoreGraph = graph;
        let results = self.fan_out(stage.granularity, &keys, |key| {
            drain_partition(shared, stage, key)
        });

        let mut total = PartitionOutcome::default();
        for result in results {
            total.absorb(result?);
        }

        let commits = total.stats;
        let summary = graph.sync(total.inserts, total.redo);

        if stage.engine == Engine::Destructive {
            let mut owned = graph.owned_partitions(stage.granularity);
            let slots: Vec<&mut Owned<'_>> = owned.iter_mut().collect();
            let results = self.fan_out_mut(stage.granularity, slots, |part| {
                settle_partition(stage, part)
            });
            drop(owned);
            for result in results {
                result?;
            }
            graph.resort();
        }

        Ok(StageReport {
            index: stage.index,
            modules: stage.module_names(),
            granularity: stage.granularity,
            engine: stage.engine,
            sync: stage.sync,
            partitions: keys.len(),
            commits,
            inserted: summary.inserted,
            swept: summary.swept,
            measures_added: summary.measures_added,
        })
    }

    fn pool_for(&self, granularity: Granularity, partitions: usize) -> Option<&ThreadPool> {
        match &self.pool {
            Some(pool) if granularity != Granularity::Score && partitions > 1 => Some(pool),
            _ => None,
        }
    }

    /// Apply `work` to each key, one contiguous chunk of keys per worker.
    /// Results come back in key order.
    fn fan_out<R, F>(&self, granularity: Granularity, keys: &[PartitionKey], work: F) -> Vec<R>
    where
        R: Send,
        F: Fn(PartitionKey) -> R + Sync,
    {
        let Some(pool) = self.pool_for(granularity, keys.len()) else {
            return keys.iter().map(|&key| work(key)).collect();
        };
        let mut slots: Vec<Option<R>> = keys.iter().map(|_| None).collect();
        let chunk = keys.len().div_ceil(self.workers.max(1));
        let work = &work;
        pool.scope(|scope| {
            for (keys, slots) in keys.chunks(chunk).zip(slots.chunks_mut(chunk)) {
                scope.spawn(move |_| {
                    for (&key, slot) in keys.iter().zip(slots.iter_mut()) {
                        *slot = Some(work(key));
                    }
                });
            }
        });
        slots.into_iter().flatten().collect()
    }

    /// Like [`fan_out`](Self::fan_out), over exclusively owned items.
    fn fan_out_mut<T, R, F>(&self, granularity: Granularity, items: Vec<&mut T>, work: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(&mut T) -> R + Sync,
    {
        let Some(pool) = self.pool_for(granularity, items.len()) else {
            return items.into_iter().map(|item| work(item)).collect();
        };
        let mut items = items;
        let mut slots: Vec<Option<R>> = items.iter().map(|_| None).collect();
        let chunk = items.len().div_ceil(self.workers.max(1));
        let work = &work;
        pool.scope(|scope| {
            for (items, slots) in items.chunks_mut(chunk).zip(slots.chunks_mut(chunk)) {
                scope.spawn(move |_| {
                    for (item, slot) in items.iter_mut().zip(slots.iter_mut()) {
                        *slot = Some(work(&mut **item));
                    }
                });
            }
        });
        slots.into_iter().flatten().collect()
    }
}

/// Run each module of the stage over one partition, under locks.
fn drain_partition(
    graph: &ScoreGraph,
    stage: &Stage<'_>,
    key: PartitionKey,
) -> Result<PartitionOutcome, PipelineError> {
    let mut outcome = PartitionOutcome::default();
    for module in &stage.modules {
        let mut pass = Pass::new(graph, key);
        module.run(&mut pass).map_err(|source| {
            log::warn!("{} failed on {key}: {source}", module.name());
            PipelineError::Validation {
                module: module.name().to_string(),
                partition: key.to_string(),
                source,
            }
        })?;
        outcome.absorb(pass.finish());
    }
    Ok(outcome)
}

/// Lock-free settle phase of a destructive stage for one partition.
fn settle_partition(stage: &Stage<'_>, owned: &mut Owned<'_>) -> Result<(), PipelineError> {
    let key = owned.key();
    for module in &stage.modules {
        module.settle(owned).map_err(|source| {
            log::warn!("{} failed to settle {key}: {source}", module.name());
            PipelineError::Validation {
                module: module.name().to_string(),
                partition: key.to_string(),
                source,
            }
        })?;
    }
    Ok(())
}
