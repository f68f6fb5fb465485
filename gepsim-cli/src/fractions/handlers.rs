use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::ArgMatches;
use rand::SeedableRng;
use rand::rngs::StdRng;

use gepsim_simulate::artifacts::write_fraction_table;
use gepsim_simulate::{FractionStrategy, JobConfig};

use super::cli::DEFAULT_OUT;

pub fn run_fractions(matches: &ArgMatches) -> Result<()> {
    let n = *matches
        .get_one::<usize>("n")
        .context("The number of samples is required.")?;
    let default_out = DEFAULT_OUT.to_string();
    let output = matches.get_one::<String>("output").unwrap_or(&default_out);

    let mut cell_types: Vec<String> = matches
        .get_many::<String>("cell-types")
        .map(|types| types.map(|t| t.trim().to_string()).collect())
        .unwrap_or_default();

    let strategy = match (
        matches.get_one::<String>("strategy"),
        matches.get_one::<String>("config"),
    ) {
        (Some(name), _) => FractionStrategy::from_str(name)?,
        (None, Some(path)) => {
            let config = JobConfig::from_file(Path::new(path))
                .with_context(|| format!("Failed to read job file {}", path))?;
            if cell_types.is_empty() {
                cell_types = config.cell_types;
            }
            config.fractions
        }
        (None, None) => bail!("Either --strategy or --config is required."),
    };
    if cell_types.is_empty() {
        bail!("No cell types given; pass --cell-types or a job file.");
    }

    let mut rng = match matches.get_one::<u64>("seed") {
        Some(seed) => StdRng::seed_from_u64(*seed),
        None => StdRng::seed_from_u64(rand::random()),
    };
    let prefix = format!("s_{}", strategy.name());
    let table = strategy.generate(n, &cell_types, &prefix, &mut rng)?;

    write_fraction_table(Path::new(output), &table)
        .with_context(|| format!("Failed to write {}", output))?;
    tracing::info!(
        "{} {} fraction vectors over {} cell types written to {}",
        table.len(),
        strategy.name(),
        cell_types.len(),
        output
    );

    Ok(())
}
