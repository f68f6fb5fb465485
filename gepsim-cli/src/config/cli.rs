use clap::{Command, arg};

pub const CONFIG_CMD: &str = "config";

pub fn create_config_cli() -> Command {
    Command::new(CONFIG_CMD)
        .about("Print a commented example job file, or write it to --output.")
        .arg(arg!(--output <output>))
}
