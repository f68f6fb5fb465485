use std::fs;

use anyhow::{Context, Result, bail};
use clap::ArgMatches;

use gepsim_simulate::{EXAMPLE_CONFIG, JobConfig};

pub fn run_config(matches: &ArgMatches) -> Result<()> {
    // the example must stay loadable
    JobConfig::from_toml(EXAMPLE_CONFIG)?.validate()?;

    match matches.get_one::<String>("output") {
        Some(output) => {
            if fs::exists(output)? {
                bail!("{} already exists, not overwriting it", output);
            }
            fs::write(output, EXAMPLE_CONFIG)
                .with_context(|| format!("Failed to write {}", output))?;
            tracing::info!("example job file written to {}", output);
        }
        None => print!("{}", EXAMPLE_CONFIG),
    }

    Ok(())
}
