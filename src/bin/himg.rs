extern crate heapimage;

use std::fmt::Display;
use std::process;

use clap::Parser;

use heapimage::driver::commands;
use heapimage::driver::error::HeapImageError;
use heapimage::driver::options::{Commands, HeapImageCli};

pub fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = HeapImageCli::parse();

    match &cli.command {
        Commands::Demo(args) => {
            let result = commands::demo(args);
            finish(&cli, result)
        }
        Commands::Load(args) => {
            let result = commands::load(args);
            finish(&cli, result)
        }
        Commands::Inspect(args) => match commands::inspect(args) {
            Ok(text) => {
                println!("{text}");
                process::exit(0)
            }
            Err(e) => fail(e),
        },
    }
}

fn fail(e: HeapImageError) -> ! {
    eprintln!("{e}");
    process::exit(e.exit_code())
}

/// Optionally dump stats to stderr then exit
fn finish<S: Display>(cli: &HeapImageCli, result: Result<S, HeapImageError>) -> ! {
    match result {
        Ok(stats) => {
            if cli.statistics {
                eprintln!();
                eprintln!("~~~~~~~~~~");
                eprintln!("STATISTICS");
                eprintln!("~~~~~~~~~~");
                eprintln!();
                eprintln!("{stats}");
            }
            process::exit(0)
        }
        Err(e) => fail(e),
    }
}
