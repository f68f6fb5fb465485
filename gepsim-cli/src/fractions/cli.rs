use clap::{Arg, Command, arg, value_parser};

use gepsim_simulate::fractions::SUPPORTED_STRATEGIES;

pub const FRACTIONS_CMD: &str = "fractions";
pub const DEFAULT_OUT: &str = "fractions.csv";

pub fn create_fractions_cli() -> Command {
    Command::new(FRACTIONS_CMD)
        .about("Write a table of random cell-type fraction vectors without mixing any profiles.")
        .arg(
            arg!(--strategy <strategy>)
                .help("Fraction strategy with its default parameters")
                .value_parser(SUPPORTED_STRATEGIES.to_vec())
                .conflicts_with("config"),
        )
        .arg(
            arg!(--config <config>)
                .help("Take the strategy and cell types from the [fractions] section of a job file"),
        )
        .arg(
            Arg::new("n")
                .short('n')
                .long("n-samples")
                .required(true)
                .help("Number of fraction vectors")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            arg!(--"cell-types" <types>)
                .help("Comma-separated cell types, in column order")
                .value_delimiter(','),
        )
        .arg(arg!(--seed <seed>).value_parser(value_parser!(u64)))
        .arg(arg!(--output <output>))
}
