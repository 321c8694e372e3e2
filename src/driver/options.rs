//! Command line argument handling with clap v4 and subcommands.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::dump::settings::DumpSettings;
use crate::load::settings::LoadSettings;

/// Default number of generated records per kind in the demo heap
pub const DEFAULT_SCALE: usize = 64;

/// himg - write, load and inspect relocatable heap images
#[derive(Parser, Debug, Clone)]
#[command(name = "himg")]
#[command(about = "Write, load and inspect relocatable heap images")]
#[command(version)]
pub struct HeapImageCli {
    /// Print statistics to stderr before exiting
    #[arg(short = 'S', long = "statistics", global = true)]
    pub statistics: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Build the demo heap and write an image of it
    Demo(DemoArgs),
    /// Load an image into a fresh runtime
    Load(LoadArgs),
    /// Show the header of an image
    Inspect(InspectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Image file to write
    #[arg(value_name = "OUT")]
    pub output: PathBuf,

    /// Size of the generated part of the heap
    #[arg(long = "scale", default_value_t = DEFAULT_SCALE)]
    pub scale: usize,

    #[command(flatten)]
    pub settings: DumpSettings,
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Image file to load
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Compare the loaded heap against a freshly built demo heap
    #[arg(long = "verify")]
    pub verify: bool,

    /// Scale the demo heap was built with (for --verify)
    #[arg(long = "scale", default_value_t = DEFAULT_SCALE)]
    pub scale: usize,

    #[command(flatten)]
    pub settings: LoadSettings,
}

#[derive(Args, Debug, Clone)]
pub struct InspectArgs {
    /// Image file to inspect
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,

    /// Output the header as JSON
    #[arg(long = "json")]
    pub json: bool,

    /// Include a hex dump of the header bytes
    #[arg(long = "hex")]
    pub hex: bool,
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    pub fn test_demo_args() {
        let cli = HeapImageCli::try_parse_from([
            "himg",
            "-S",
            "demo",
            "out.himg",
            "--scale",
            "3",
            "--score-exponent",
            "-0.5",
        ])
        .unwrap();
        assert!(cli.statistics);
        match cli.command {
            Commands::Demo(args) => {
                assert_eq!(args.output, PathBuf::from("out.himg"));
                assert_eq!(args.scale, 3);
                assert_eq!(args.settings.score_exponent, -0.5);
                assert_eq!(args.settings.strong_weight, 1200);
            }
            c => panic!("unexpected {c:?}"),
        }
    }

    #[test]
    pub fn test_load_defaults_to_exclusive() {
        let cli = HeapImageCli::try_parse_from(["himg", "load", "x.himg"]).unwrap();
        match cli.command {
            Commands::Load(args) => {
                assert!(args.settings.exclusive);
                assert!(!args.settings.force_heap_fallback);
                assert!(!args.verify);
            }
            c => panic!("unexpected {c:?}"),
        }
        let cli =
            HeapImageCli::try_parse_from(["himg", "load", "x.himg", "--shared", "--heap-fallback"])
                .unwrap();
        match cli.command {
            Commands::Load(args) => {
                assert!(!args.settings.exclusive);
                assert!(args.settings.force_heap_fallback);
            }
            c => panic!("unexpected {c:?}"),
        }
    }

    #[test]
    pub fn test_inspect_flags() {
        let cli = HeapImageCli::try_parse_from(["himg", "inspect", "--json", "x.himg"]).unwrap();
        match cli.command {
            Commands::Inspect(args) => {
                assert!(args.json);
                assert!(!args.hex);
            }
            c => panic!("unexpected {c:?}"),
        }
    }
}
