use clap::{Arg, ArgAction, Command, arg, value_parser};

pub const GENERATE_CMD: &str = "generate";

pub fn create_generate_cli() -> Command {
    Command::new(GENERATE_CMD)
        .about("Run (or resume) a generation job described by a TOML file.")
        .arg(
            Arg::new("config")
                .required(true)
                .help("Path to the job file"),
        )
        .arg(
            arg!(--threads <threads>)
                .help("Worker threads, overrides the job file")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            arg!(--seed <seed>)
                .help("Seed of a new job, overrides the job file")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            arg!(--"max-rounds" <rounds>)
                .help("Stop after this many rounds; the next run resumes")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            arg!(--"no-progress")
                .help("Hide the progress bar")
                .action(ArgAction::SetTrue),
        )
}
