use std::path::Path;

use anyhow::{Context, Result};
use clap::ArgMatches;

use gepsim_simulate::{BulkGepGenerator, JobConfig};

pub fn run_generate(matches: &ArgMatches) -> Result<()> {
    let config_path = matches
        .get_one::<String>("config")
        .context("A path to a job file is required.")?;

    let mut config = JobConfig::from_file(Path::new(config_path))
        .with_context(|| format!("Failed to read job file {}", config_path))?;
    if let Some(threads) = matches.get_one::<usize>("threads") {
        config.threads = Some(*threads);
    }
    if let Some(seed) = matches.get_one::<u64>("seed") {
        config.seed = Some(*seed);
    }
    if let Some(rounds) = matches.get_one::<u64>("max-rounds") {
        config.max_rounds = Some(*rounds);
    }
    config.validate().context("Invalid job file")?;

    let pool = config
        .load_pool()
        .context("Failed to load the single-cell pool")?;
    let reference = config
        .load_reference(pool.genes())
        .context("Failed to load the reference cohort")?;
    let filters = config.build_filters(&reference, pool.genes())?;

    let show_progress = !matches.get_flag("no-progress");
    let generator = BulkGepGenerator::new(&pool, config.params(show_progress), filters)?;
    let summary = generator.run()?;

    if summary.completed {
        println!(
            "{} samples written to {} (acceptance ratio {:.4})",
            summary.accepted,
            generator.paths().bundle.display(),
            summary.acceptance_ratio
        );
    } else {
        println!(
            "{} of {} samples after {} rounds, rerun to resume",
            summary.accepted, summary.target, summary.rounds
        );
    }

    Ok(())
}
