#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

// ========================================================================================
//
//                                   cgclust
//
// ========================================================================================
//
// Reads a request and its profiles, computes every pairwise allele distance that is not
// already cached, clusters the result with single linkage and writes the output documents.
// Progress goes to a bar on stderr and logs go through `env_logger`; stdout only ever
// carries results.

use cgclust::config::EngineConfig;
use cgclust::engine::{self, RunOutcome};
use cgclust::io::{self as cgio, InputReader};
use cgclust::progress::{Progress, ProgressKind, spawn_progress_bar};
use cgclust::types::Cache;
use clap::Parser;
use crossbeam_channel::unbounded;
use log::info;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "cgclust",
    version,
    about = "Pairwise cgMLST distances and single-linkage clusters."
)]
struct Cli {
    /// JSON Lines input: the request on the first line, then one profile per line.
    /// Gzip is detected automatically. Reads stdin when omitted.
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// A cache written by a previous run with --write-cache
    #[arg(long, value_name = "FILE")]
    cache: Option<PathBuf>,

    /// TOML file with engine settings
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of scoring workers (overrides the config file)
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Pairs sharing fewer called genes are never joined (overrides the config file)
    #[arg(long, value_name = "N")]
    min_matching_genes: Option<u32>,

    /// Where to write the output documents; stdout when omitted
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write a cache for the next run to this file
    #[arg(long, value_name = "FILE")]
    write_cache: Option<PathBuf>,

    /// Write a TSV of cluster labels to this file
    #[arg(long, value_name = "FILE", requires = "cut")]
    labels: Option<PathBuf>,

    /// Thresholds at which to cut the clustering for --labels
    #[arg(long, value_name = "T1,T2,...", value_delimiter = ',', requires = "labels")]
    cut: Vec<i32>,
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(min_matching_genes) = cli.min_matching_genes {
        config.min_matching_genes = min_matching_genes;
    }
    config.validate()?;
    Ok(config)
}

fn write_results(
    cli: &Cli,
    outcome: RunOutcome,
    progress: &Progress,
) -> Result<(), Box<dyn std::error::Error>> {
    match &cli.output {
        Some(path) => cgio::write_outputs(File::create(path)?, outcome.outputs(), progress)?,
        None => cgio::write_outputs(io::stdout().lock(), outcome.outputs(), progress)?,
    }

    if let Some(path) = &cli.labels {
        cgio::write_labels(File::create(path)?, &outcome.clusters, &cli.cut)?;
        info!("Wrote labels for {} cuts to {}", cli.cut.len(), path.display());
    }

    if let Some(path) = &cli.write_cache {
        let cache = outcome.cache();
        cgio::write_cache(path, &cache)?;
        info!("Wrote cache of {} profiles to {}", cache.sts.len(), path.display());
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    let config = load_config(&cli)?;
    let cache = match &cli.cache {
        Some(path) => cgio::read_cache(path)?,
        None => Cache::default(),
    };

    let (progress_tx, progress_rx) = unbounded();
    let bar = spawn_progress_bar(progress_rx);
    let progress = Progress::new(progress_tx);

    let input = InputReader::new(cgio::open_input(cli.input.as_deref())?);
    let result = engine::run(input, &cache, &config, &progress)
        .map_err(Into::into)
        .and_then(|outcome| {
            info!(
                "Computed {} scores; cache reused: {}",
                outcome.scoring.computed, outcome.cache_reused
            );
            write_results(&cli, outcome, &progress)
        });

    progress.emit(ProgressKind::Exit, 0);
    drop(progress);
    if bar.join().is_err() {
        log::warn!("The progress bar thread panicked");
    }
    info!("Finished in {:.2?}", start.elapsed());
    result
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
