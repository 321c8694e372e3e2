//! What a dump produced

use std::fmt;

use crate::driver::statistics::{Counts, Timings};
use crate::image::header::Phase;

#[derive(Debug, Default, Clone)]
pub struct DumpStats {
    /// Records written, by kind
    pub objects: Counts,
    pub hot_bytes: usize,
    pub discardable_bytes: usize,
    pub cold_bytes: usize,
    pub table_bytes: usize,
    /// Intra-image relocations by phase
    pub relocs: [usize; 3],
    /// Image-to-host relocations before merging
    pub host_relocs_unmerged: usize,
    pub host_relocs: usize,
    pub fixups: usize,
    pub hash_tables: usize,
    pub timings: Timings,
}

impl DumpStats {
    pub fn total_bytes(&self) -> usize {
        self.hot_bytes + self.discardable_bytes + self.cold_bytes + self.table_bytes
    }
}

impl fmt::Display for DumpStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Hot bytes          : {:10}", self.hot_bytes)?;
        writeln!(f, "Discardable bytes  : {:10}", self.discardable_bytes)?;
        writeln!(f, "Cold bytes         : {:10}", self.cold_bytes)?;
        writeln!(f, "Table bytes        : {:10}", self.table_bytes)?;
        writeln!(f, "Fixups             : {:10}", self.fixups)?;
        for phase in Phase::ALL {
            writeln!(
                f,
                "{:<19}: {:10}",
                format!("Relocs ({})", phase.name()),
                self.relocs[phase as usize]
            )?;
        }
        writeln!(
            f,
            "Host relocs        : {:10} ({} before merge)",
            self.host_relocs, self.host_relocs_unmerged
        )?;
        writeln!(f)?;
        write!(f, "{}", self.objects)?;
        writeln!(f)?;
        write!(f, "{}", self.timings)
    }
}
