//! The image writer
//!
//! A dump walks the object graph from the roots, writes each reachable
//! object exactly once, resolves forward references and writes the
//! relocation tables. The destination file is created first with a
//! placeholder header whose magic is deliberately wrong, and the real
//! first magic byte is the very last thing written, so an interrupted
//! dump never looks like a valid image.
pub mod context;
pub mod encoder;
pub mod error;
pub mod fixup;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod walker;

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use log::info;

use crate::heap::host::Remembered;
use crate::heap::ObjectGraph;
use crate::image::fingerprint::Fingerprint;
use crate::image::header::ImageHeader;
use crate::image::{INCOMPLETE_MAGIC_BYTE, MAGIC};

use self::context::DumpContext;
use self::error::DumpError;
use self::settings::DumpSettings;
use self::stats::DumpStats;

/// Lay out a complete image in memory
pub fn write_image_bytes<G: ObjectGraph + ?Sized>(
    graph: &G,
    remembered: &[Remembered],
    settings: &DumpSettings,
) -> Result<(Vec<u8>, DumpStats), DumpError> {
    let fingerprint = Fingerprint::of_build(&graph.layout().identity());
    DumpContext::new(graph, settings).build(fingerprint, remembered)
}

/// Write an image of `graph` to `path`
pub fn dump_image<G: ObjectGraph + ?Sized>(
    graph: &G,
    remembered: &[Remembered],
    path: &Path,
    settings: &DumpSettings,
) -> Result<DumpStats, DumpError> {
    let fingerprint = Fingerprint::of_build(&graph.layout().identity());
    let mut file = File::create(path)?;
    let mut placeholder = ImageHeader::new(fingerprint).encode();
    placeholder[0] = INCOMPLETE_MAGIC_BYTE;
    file.write_all(&placeholder)?;

    let (mut bytes, mut stats) = DumpContext::new(graph, settings).build(fingerprint, remembered)?;

    let start = Instant::now();
    bytes[0] = INCOMPLETE_MAGIC_BYTE;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&MAGIC[..1])?;
    file.sync_all()?;
    stats.timings.record("dump-write", start.elapsed());

    info!("wrote {} bytes to {}", bytes.len(), path.display());
    Ok(stats)
}
