use crate::index::{IndexTable, ProfileBits};
use crate::progress::{Progress, ProgressKind};
use crate::store::{ScoreJob, ScoreStatus, ScoreStore};
use crate::types::ALMOST_INF;
use crossbeam_channel::{Receiver, bounded};
use log::{debug, info};
use std::thread;
use std::time::Instant;
use thiserror::Error;

// --- Pool Tuning Parameters ---

/// A worker logs its running total after this many scores.
const LOG_EVERY: usize = 100_000;

// ========================================================================================
//                              Pairwise distance
// ========================================================================================

/// Turns two indexed profiles into a distance: genes called in both, minus the
/// gene+allele pairs they share.
#[derive(Debug, Clone, Copy)]
pub struct Comparer<'a> {
    table: &'a IndexTable,
    min_matching_genes: u32,
}

impl<'a> Comparer<'a> {
    pub fn new(table: &'a IndexTable, min_matching_genes: u32) -> Self {
        Self {
            table,
            min_matching_genes,
        }
    }

    /// The distance between two profiles by indexer offset. Pairs sharing fewer
    /// than `min_matching_genes` genes are incomparable and come back as `ALMOST_INF`.
    #[inline]
    pub fn compare(&self, a: usize, b: usize) -> i32 {
        let profiles = self.table.profiles();
        compare_profiles(&profiles[a], &profiles[b], self.min_matching_genes)
    }
}

#[inline]
pub fn compare_profiles(a: &ProfileBits, b: &ProfileBits, min_matching_genes: u32) -> i32 {
    let genes = a.genes.intersection_count(&b.genes);
    if genes < min_matching_genes {
        return ALMOST_INF;
    }
    let alleles = a.alleles.intersection_count(&b.alleles);
    genes.saturating_sub(alleles) as i32
}

// ========================================================================================
//                                   Worker pool
// ========================================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScoreError {
    #[error("scoring worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("the dispatcher thread panicked")]
    DispatcherPanicked,
}

/// How the pool shared out the work.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScoringSummary {
    pub computed: usize,
    pub per_worker: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub workers: usize,
    pub queue_bound: usize,
    pub progress_batch: usize,
    pub min_matching_genes: u32,
}

fn score_jobs(
    worker: usize,
    jobs: Receiver<ScoreJob>,
    store: &ScoreStore,
    comparer: Comparer<'_>,
    progress: &Progress,
    progress_batch: usize,
) -> usize {
    let mut computed = 0;
    let mut unreported = 0;
    for job in jobs.iter() {
        let value = comparer.compare(store.index_offset(job.a), store.index_offset(job.b));
        store.set(job.slot, value, ScoreStatus::Complete);
        computed += 1;
        unreported += 1;
        if unreported == progress_batch {
            progress.emit(ProgressKind::ScoreCalculated, unreported as u64);
            unreported = 0;
        }
        if computed % LOG_EVERY == 0 {
            debug!("Worker {worker} has computed {computed} scores");
        }
    }
    if unreported > 0 {
        progress.emit(ProgressKind::ScoreCalculated, unreported as u64);
    }
    debug!("Worker {worker} has computed {computed} scores");
    computed
}

/// Fills every pending slot of `store` and returns once the pool has drained.
///
/// A dispatcher thread walks the pending slots in order and feeds them through a
/// bounded queue; each worker pulls jobs until the queue closes. Every slot is handed
/// out exactly once, so workers never write the same slot.
pub fn score_pending(
    store: &ScoreStore,
    table: &IndexTable,
    options: PoolOptions,
    progress: &Progress,
) -> Result<ScoringSummary, ScoreError> {
    let pending = store.todo();
    info!(
        "Scoring {} pending pairs with {} workers",
        pending, options.workers
    );
    let start = Instant::now();
    let comparer = Comparer::new(table, options.min_matching_genes);

    let outcome = thread::scope(|scope| {
        let (job_tx, job_rx) = bounded::<ScoreJob>(options.queue_bound.max(1));

        let dispatcher = scope.spawn(move || {
            for job in store.pending() {
                if job_tx.send(job).is_err() {
                    break;
                }
            }
        });

        let workers: Vec<_> = (0..options.workers.max(1))
            .map(|worker| {
                let jobs = job_rx.clone();
                scope.spawn(move || {
                    score_jobs(
                        worker,
                        jobs,
                        store,
                        comparer,
                        progress,
                        options.progress_batch.max(1),
                    )
                })
            })
            .collect();
        drop(job_rx);

        let per_worker: Vec<Result<usize, ScoreError>> = workers
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .map_err(|_| ScoreError::WorkerPanicked(worker))
            })
            .collect();
        let dispatched = dispatcher
            .join()
            .map_err(|_| ScoreError::DispatcherPanicked);
        dispatched?;
        per_worker.into_iter().collect::<Result<Vec<usize>, ScoreError>>()
    });

    let per_worker = outcome?;
    let computed: usize = per_worker.iter().sum();
    info!(
        "Scored {} pairs in {:.2?}; {} pending",
        computed,
        start.elapsed(),
        store.todo()
    );
    progress.emit(ProgressKind::ScoringComplete, 0);
    Ok(ScoringSummary {
        computed,
        per_worker,
    })
}
