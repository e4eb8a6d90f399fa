use clap::Parser;
use fsnet::config::{Args, Config};
use fsnet::logging::{init_logging, LogConfig};
use std::error::Error as _;

fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(&LogConfig::from_flags(args.quiet, args.verbose)) {
        eprintln!("{e}");
    }

    let result = Config::from_args(args).and_then(|config| fsnet::run::run(&config));
    if let Err(e) = result {
        eprintln!("Error: {e}");
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {cause}");
            source = cause.source();
        }
        std::process::exit(1);
    }
}
