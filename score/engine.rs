use crate::cluster::format::{Documents, document_count};
use crate::cluster::{ClusterError, Clusters};
use crate::config::{ConfigError, EngineConfig};
use crate::index::{IndexError, Indexer};
use crate::io::{InputError, InputReader};
use crate::pipeline::{PoolOptions, ScoreError, ScoringSummary, score_pending};
use crate::progress::{Progress, ProgressKind};
use crate::store::{ScoreStore, ScoresResult, StoreError};
use crate::types::{Cache, Profile, Request, position_lookup};
use crossbeam_channel::bounded;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::io::BufRead;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Score(#[from] ScoreError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("the profile reader thread panicked")]
    ReaderPanicked,
}

/// Everything one request produces.
#[derive(Debug)]
pub struct RunOutcome {
    pub request: Request,
    pub scores: ScoresResult,
    pub clusters: Clusters,
    pub scoring: ScoringSummary,
    pub cache_reused: bool,
}

/// Streams `profiles` into `indexer`: one thread parses while the rayon pool indexes.
/// Returns the number of duplicate profiles that were skipped.
pub fn index_profiles<I>(
    profiles: I,
    indexer: &Indexer,
    queue_bound: usize,
    progress: &Progress,
) -> Result<usize, EngineError>
where
    I: IntoIterator<Item = Result<Profile, InputError>>,
    I::IntoIter: Send,
{
    let profiles = profiles.into_iter();
    let duplicates = AtomicUsize::new(0);

    thread::scope(|scope| {
        let (profile_tx, profile_rx) = bounded(queue_bound.max(1));
        let reader = scope.spawn(move || {
            for profile in profiles {
                let failed = profile.is_err();
                if profile_tx.send(profile).is_err() || failed {
                    break;
                }
                progress.emit(ProgressKind::ProfileParsed, 1);
            }
            progress.emit(ProgressKind::ParsingComplete, 0);
        });

        let indexed = profile_rx
            .into_iter()
            .par_bridge()
            .try_for_each(|profile: Result<Profile, InputError>| {
                let outcome = indexer.index(&profile?)?;
                if outcome.duplicate {
                    duplicates.fetch_add(1, Ordering::Relaxed);
                } else {
                    progress.emit(ProgressKind::ProfileIndexed, 1);
                }
                Ok::<(), EngineError>(())
            });

        let joined = reader.join().map_err(|_| EngineError::ReaderPanicked);
        indexed?;
        joined
    })?;

    let duplicates = duplicates.into_inner();
    if duplicates > 0 {
        debug!("Skipped {duplicates} duplicate profiles");
    }
    Ok(duplicates)
}

/// Runs one request end to end: index, score, cluster and render the output documents.
pub fn run_profiles<I>(
    request: Request,
    profiles: I,
    cache: &Cache,
    config: &EngineConfig,
    progress: &Progress,
) -> Result<RunOutcome, EngineError>
where
    I: IntoIterator<Item = Result<Profile, InputError>>,
    I::IntoIter: Send,
{
    config.validate()?;
    let (unique, _) = position_lookup(&request.sts);
    if unique.len() != request.sts.len() {
        warn!(
            "The request names {} ids but only {} are distinct; repeats are ignored",
            request.sts.len(),
            unique.len()
        );
    }
    progress.emit(ProgressKind::ProfilesExpected, unique.len() as u64);
    info!(
        "Clustering {} profiles up to threshold {}",
        unique.len(),
        request.threshold
    );

    let indexer = Indexer::with_capacity_hint(&request.sts, config.allele_capacity_hint);
    index_profiles(profiles, &indexer, config.queue_bound, progress)?;
    let table = indexer.freeze(config.sparse_density)?;

    let store = ScoreStore::new(&request, cache)?;
    progress.emit(ProgressKind::CachedScoresExpected, store.done() as u64);
    let scoring = score_pending(
        &store,
        &table,
        PoolOptions {
            workers: config.workers,
            queue_bound: config.queue_bound,
            progress_batch: config.progress_batch,
            min_matching_genes: config.min_matching_genes,
        },
        progress,
    )?;
    let scores = store.result()?;

    progress.emit(ProgressKind::ClusteringStarted, 0);
    let cache_reused = store.cache_reusable();
    let clusters = if cache_reused {
        Clusters::from_cache(&scores.scores, scores.sts.clone(), cache)?
    } else {
        Clusters::from_scratch(&scores.scores, scores.sts.clone())?
    };
    progress.emit(ProgressKind::ClusteringComplete, 0);

    progress.emit(
        ProgressKind::ResultsToSave,
        document_count(request.threshold),
    );

    Ok(RunOutcome {
        request,
        scores,
        clusters,
        scoring,
        cache_reused,
    })
}

impl RunOutcome {
    /// The output documents, rendered as they are consumed.
    pub fn outputs(&self) -> Documents<'_> {
        self.clusters.format(self.request.threshold, &self.scores.scores)
    }

    /// The cache the next run can resume from.
    pub fn cache(&self) -> Cache {
        self.clusters.cache(self.request.threshold, &self.scores.scores)
    }
}

/// Reads the request and then the profiles from `input` and runs them.
pub fn run<R>(
    mut input: InputReader<R>,
    cache: &Cache,
    config: &EngineConfig,
    progress: &Progress,
) -> Result<RunOutcome, EngineError>
where
    R: BufRead + Send,
{
    progress.emit(ProgressKind::ParsingStarted, 0);
    let request = input.request()?;
    run_profiles(request, input, cache, config, progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterOutput;
    use crate::progress::ProgressEvent;
    use crate::types::{ALMOST_INF, ProfileId};
    use crossbeam_channel::unbounded;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    const INPUT: &str = r#"{"sts": ["a", "b", "c"], "threshold": 1}
{"st": "a", "matches": {"gene1": 1, "gene2": 1, "gene3": 1}, "schemeSize": 3}
{"st": "b", "matches": {"gene1": 2, "gene2": 2, "gene4": 1}, "schemeSize": 3}
{"st": "c", "matches": {"gene1": 1, "gene2": 2, "gene3": 1, "gene4": 1}, "schemeSize": 4}
"#;

    fn config() -> EngineConfig {
        EngineConfig {
            workers: 2,
            progress_batch: 1,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn three_tiny_profiles_end_to_end() {
        let (tx, rx) = unbounded::<ProgressEvent>();
        let outcome = run(
            InputReader::new(Cursor::new(INPUT)),
            &Cache::default(),
            &config(),
            &Progress::new(tx),
        )
        .unwrap();

        assert_eq!(outcome.scores.scores, vec![2, 1, 1]);
        assert!(!outcome.cache_reused);
        assert_eq!(outcome.scoring.computed, 3);
        assert_eq!(outcome.clusters.get(1), vec![2, 2, 2]);
        assert_eq!(outcome.clusters.get(0), vec![0, 1, 2]);
        assert_eq!(outcome.outputs().count(), 3);

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        let count = |kind: ProgressKind| -> u64 {
            events.iter().filter(|e| e.kind == kind).map(|e| e.n.max(1)).sum()
        };
        assert_eq!(count(ProgressKind::ProfileParsed), 3);
        assert_eq!(count(ProgressKind::ProfileIndexed), 3);
        assert_eq!(count(ProgressKind::ScoreCalculated), 3);
        assert_eq!(events[0].kind, ProgressKind::ParsingStarted);
        assert_eq!(
            events.last().map(|e| (e.kind, e.n)),
            Some((ProgressKind::ResultsToSave, 3))
        );
    }

    #[test]
    fn a_reusable_cache_extends_the_previous_run() {
        let first_request = r#"{"sts": ["a", "b"], "threshold": 3}"#;
        let mut first_input = String::from(first_request);
        first_input.push('\n');
        first_input.push_str(INPUT.lines().nth(1).unwrap_or_default());
        first_input.push('\n');
        first_input.push_str(INPUT.lines().nth(2).unwrap_or_default());
        let first = run(
            InputReader::new(Cursor::new(first_input)),
            &Cache::default(),
            &config(),
            &Progress::disabled(),
        )
        .unwrap();
        let cache = Cache::from_outputs(first.outputs()).unwrap();
        assert_eq!(cache, first.cache());
        assert_eq!(cache.edges[&2], vec![[0, 1]]);

        let second = run(
            InputReader::new(Cursor::new(INPUT)),
            &cache,
            &config(),
            &Progress::disabled(),
        )
        .unwrap();
        assert!(second.cache_reused);
        assert_eq!(second.scoring.computed, 2);
        assert_eq!(second.scores.scores, vec![2, 1, 1]);

        let fresh = run(
            InputReader::new(Cursor::new(INPUT)),
            &Cache::default(),
            &config(),
            &Progress::disabled(),
        )
        .unwrap();
        assert_eq!(second.clusters, fresh.clusters);
    }

    #[test]
    fn a_missing_profile_fails_the_run() {
        let truncated: String = INPUT.lines().take(3).collect::<Vec<_>>().join("\n");
        let err = run(
            InputReader::new(Cursor::new(truncated)),
            &Cache::default(),
            &config(),
            &Progress::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Index(IndexError::Incomplete { .. })));
    }

    #[test]
    fn an_undeclared_profile_fails_the_run() {
        let request = Request {
            sts: vec![ProfileId::from("a")],
            threshold: 1,
        };
        let profiles = vec![Ok(Profile::new("zzz", [("gene1", 1)]))];
        let err = run_profiles(
            request,
            profiles,
            &Cache::default(),
            &config(),
            &Progress::disabled(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Index(IndexError::UnknownProfile { .. })
        ));
    }

    #[test]
    fn duplicates_are_skipped_and_incomparable_pairs_stay_apart() {
        let request = Request {
            sts: vec!["a".into(), "b".into()],
            threshold: 10,
        };
        let profiles = vec![
            Ok(Profile::new("a", [("gene1", 1)])),
            Ok(Profile::new("a", [("gene1", 1)])),
            Ok(Profile::new("b", [("gene2", 1)])),
        ];
        let config = EngineConfig {
            min_matching_genes: 1,
            ..config()
        };
        let outcome =
            run_profiles(request, profiles, &Cache::default(), &config, &Progress::disabled())
                .unwrap();
        assert_eq!(outcome.scores.scores, vec![ALMOST_INF]);
        assert_eq!(outcome.clusters.get(10), vec![0, 1]);
    }

    #[test]
    fn default_settings_report_every_completed_score() {
        let (tx, rx) = unbounded::<ProgressEvent>();
        let outcome = run(
            InputReader::new(Cursor::new(INPUT)),
            &Cache::default(),
            &EngineConfig::default(),
            &Progress::new(tx),
        )
        .unwrap();
        assert_eq!(outcome.scoring.computed, 3);

        let calculated: Vec<ProgressEvent> = rx
            .try_iter()
            .filter(|e| e.kind == ProgressKind::ScoreCalculated)
            .collect();
        assert_eq!(calculated.len(), 3);
        assert!(calculated.iter().all(|e| e.n == 1));
    }

    #[test]
    fn a_huge_threshold_does_not_materialise_every_document() {
        let request = Request {
            sts: vec!["a".into(), "b".into()],
            threshold: 20_000_000,
        };
        let profiles = vec![
            Ok(Profile::new("a", [("gene1", 1), ("gene2", 1)])),
            Ok(Profile::new("b", [("gene1", 1), ("gene2", 2)])),
        ];
        let (tx, rx) = unbounded::<ProgressEvent>();
        let outcome =
            run_profiles(request, profiles, &Cache::default(), &config(), &Progress::new(tx))
                .unwrap();

        let last = rx.try_iter().last().map(|e| (e.kind, e.n));
        assert_eq!(last, Some((ProgressKind::ResultsToSave, 20_000_002)));
        let cache = outcome.cache();
        assert_eq!(cache.edges.len(), 1);
        assert_eq!(cache.edges[&1], vec![[0, 1]]);
        assert_eq!(
            outcome.outputs().nth(1),
            Some(ClusterOutput::Edges {
                edges: BTreeMap::from([(1, vec![[0, 1]])])
            })
        );
    }
}
