mod config;
mod fractions;
mod generate;
mod logging;

use anyhow::Result;
use clap::Command;

pub mod consts {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const BIN_NAME: &str = "gepsim";
}

fn build_parser() -> Command {
    Command::new(consts::BIN_NAME)
        .bin_name(consts::BIN_NAME)
        .version(consts::VERSION)
        .author("gepsim developers")
        .about("Generate labeled synthetic bulk gene-expression profiles from single-cell data, filtered against a real reference cohort.")
        .subcommand_required(true)
        .subcommand(generate::cli::create_generate_cli())
        .subcommand(fractions::cli::create_fractions_cli())
        .subcommand(config::cli::create_config_cli())
}

fn main() -> Result<()> {
    logging::init_logging()?;

    let app = build_parser();
    let matches = app.get_matches();

    match matches.subcommand() {
        //
        // GENERATE
        //
        Some((generate::cli::GENERATE_CMD, matches)) => {
            generate::handlers::run_generate(matches)?;
        }

        //
        // FRACTIONS
        //
        Some((fractions::cli::FRACTIONS_CMD, matches)) => {
            fractions::handlers::run_fractions(matches)?;
        }

        //
        // EXAMPLE CONFIG
        //
        Some((config::cli::CONFIG_CMD, matches)) => {
            config::handlers::run_config(matches)?;
        }

        _ => unreachable!("Subcommand not found"),
    };

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use gepsim_core::io::read_fraction_table;
    use gepsim_simulate::EXAMPLE_CONFIG;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use tempfile::tempdir;

    fn run(args: &[&str]) -> Result<()> {
        let matches = build_parser().try_get_matches_from(args)?;
        match matches.subcommand() {
            Some((generate::cli::GENERATE_CMD, matches)) => generate::handlers::run_generate(matches),
            Some((fractions::cli::FRACTIONS_CMD, matches)) => {
                fractions::handlers::run_fractions(matches)
            }
            Some((config::cli::CONFIG_CMD, matches)) => config::handlers::run_config(matches),
            _ => unreachable!("Subcommand not found"),
        }
    }

    #[rstest]
    fn test_parser_is_consistent() {
        build_parser().debug_assert();
    }

    #[rstest]
    #[case(&["gepsim", "generate", "job.toml", "--no-progress"], generate::cli::GENERATE_CMD)]
    #[case(&["gepsim", "fractions", "--strategy", "fragment", "-n", "10", "--cell-types", "A,B"], fractions::cli::FRACTIONS_CMD)]
    #[case(&["gepsim", "config"], config::cli::CONFIG_CMD)]
    fn test_subcommands_parse(#[case] args: &[&str], #[case] expected: &str) {
        let matches = build_parser().try_get_matches_from(args).unwrap();
        assert_eq!(matches.subcommand_name(), Some(expected));
    }

    #[rstest]
    fn test_subcommand_is_required() {
        assert!(build_parser().try_get_matches_from(["gepsim"]).is_err());
    }

    #[rstest]
    fn test_config_writes_the_example_once() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("job.toml");
        let out = out.to_str().unwrap();

        run(&["gepsim", "config", "--output", out]).unwrap();
        assert_eq!(fs::read_to_string(out).unwrap(), EXAMPLE_CONFIG);
        assert!(run(&["gepsim", "config", "--output", out]).is_err());
    }

    #[rstest]
    fn test_fractions_table() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("fractions.csv");
        let out = out.to_str().unwrap();

        run(&[
            "gepsim", "fractions", "--strategy", "seg_random", "-n", "25", "--cell-types", "A,B,C",
            "--seed", "3", "--output", out,
        ])
        .unwrap();

        let table = read_fraction_table(Path::new(out)).unwrap();
        assert_eq!(table.cell_types, vec!["A", "B", "C"]);
        assert_eq!(table.len(), 25);
        assert_eq!(table.rows[0].sample_id, "s_seg_random_0");
        for row in &table.rows {
            assert!((row.total() - 1.0).abs() < 1e-6);
        }
    }

    #[rstest]
    fn test_fractions_need_cell_types() {
        assert!(run(&["gepsim", "fractions", "--strategy", "random", "-n", "5"]).is_err());
    }
}
