//! Loader settings and statistics

use std::fmt;

use clap::Args;

use crate::driver::statistics::Timings;
use crate::image::header::Phase;

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct LoadSettings {
    /// Read the image onto the heap instead of mapping it
    #[arg(long = "heap-fallback")]
    pub force_heap_fallback: bool,
    /// Allow more than one image per process
    #[arg(long = "shared", action = clap::ArgAction::SetFalse)]
    pub exclusive: bool,
}

impl Default for LoadSettings {
    fn default() -> Self {
        LoadSettings {
            force_heap_fallback: false,
            exclusive: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoadStats {
    pub file_bytes: usize,
    pub hot_bytes: usize,
    pub discardable_bytes: usize,
    pub cold_bytes: usize,
    pub objects: usize,
    pub relocs: [usize; 3],
    pub host_relocs: usize,
    pub heap_backed: bool,
    pub hooks_run: usize,
    pub timings: Timings,
}

impl fmt::Display for LoadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "File bytes         : {:10}", self.file_bytes)?;
        writeln!(f, "Hot bytes          : {:10}", self.hot_bytes)?;
        writeln!(f, "Discardable bytes  : {:10}", self.discardable_bytes)?;
        writeln!(f, "Cold bytes         : {:10}", self.cold_bytes)?;
        writeln!(f, "Objects            : {:10}", self.objects)?;
        for phase in Phase::ALL {
            writeln!(
                f,
                "{:<19}: {:10}",
                format!("Relocs ({})", phase.name()),
                self.relocs[phase as usize]
            )?;
        }
        writeln!(f, "Host relocs        : {:10}", self.host_relocs)?;
        writeln!(f, "Hooks run          : {:10}", self.hooks_run)?;
        writeln!(
            f,
            "Backing            : {:>10}",
            if self.heap_backed { "heap" } else { "mmap" }
        )?;
        writeln!(f)?;
        write!(f, "{}", self.timings)
    }
}
