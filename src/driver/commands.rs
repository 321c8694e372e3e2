//! Implementations of the `himg` subcommands

use std::time::Instant;

use log::info;
use pretty_hex::pretty_hex;
use serde_json::json;

use crate::dump::stats::DumpStats;
use crate::heap::graph::check_isomorphic;
use crate::image::fingerprint::Fingerprint;
use crate::image::header::{ImageHeader, Phase};
use crate::load::loader::inspect as read_image_header;
use crate::load::runtime::ImageRuntime;
use crate::load::settings::{LoadSettings, LoadStats};

use super::demo::{demo_heap, demo_layout, demo_remembered, DemoNativeLoader};
use super::error::HeapImageError;
use super::options::{DemoArgs, InspectArgs, LoadArgs};

fn demo_runtime(settings: LoadSettings) -> Result<ImageRuntime, HeapImageError> {
    let mut runtime =
        ImageRuntime::new(demo_layout(), settings).with_native_loader(DemoNativeLoader::default());
    for location in demo_remembered() {
        runtime.remember(location)?;
    }
    Ok(runtime)
}

/// Build the demo heap and write it to the output path
pub fn demo(args: &DemoArgs) -> Result<DumpStats, HeapImageError> {
    let start = Instant::now();
    let heap = demo_heap(args.scale)?;
    let built = start.elapsed();
    info!("built demo heap of {} objects", heap.len());

    let runtime = demo_runtime(LoadSettings::default())?;
    let mut stats = runtime.dump(&heap, &args.output, &args.settings)?;
    stats.timings.record("demo-build", built);
    Ok(stats)
}

/// Load an image into a fresh demo runtime, optionally verifying it
pub fn load(args: &LoadArgs) -> Result<LoadStats, HeapImageError> {
    let mut runtime = demo_runtime(args.settings.clone())?;
    let mut stats = runtime.load(&args.image)?.clone();

    if args.verify {
        let start = Instant::now();
        let expected = demo_heap(args.scale)?;
        let loaded = runtime.materialize(expected.root_slots())?;
        check_isomorphic(&expected, &loaded)?;
        stats.timings.record("load-verify", start.elapsed());
        info!("loaded heap matches demo heap ({} objects)", loaded.len());
    }

    Ok(stats)
}

fn header_json(header: &ImageHeader, file_len: usize, expected: &Fingerprint) -> serde_json::Value {
    let mut relocs = serde_json::Map::new();
    for phase in Phase::ALL {
        let loc = header.relocs(phase);
        relocs.insert(
            phase.name().to_string(),
            json!({ "offset": loc.offset, "count": loc.count }),
        );
    }
    json!({
        "magic": String::from_utf8_lossy(&header.magic),
        "fingerprint": header.fingerprint.to_hex(),
        "matches_demo_build": header.fingerprint == *expected,
        "file_bytes": file_len,
        "relocs": relocs,
        "object_starts": {
            "offset": header.object_starts.offset,
            "count": header.object_starts.count,
        },
        "host_relocs": {
            "offset": header.host_relocs.offset,
            "count": header.host_relocs.count,
        },
        "discardable_start": header.discardable_start,
        "cold_start": header.cold_start,
        "hash_list_offset": header.hash_list_offset,
        "end_heap": header.end_heap,
    })
}

/// Describe an image header as text or JSON
pub fn inspect(args: &InspectArgs) -> Result<String, HeapImageError> {
    let (header, file_len) = read_image_header(&args.image)?;
    let expected = Fingerprint::of_build(&demo_layout().identity());

    let mut out = if args.json {
        serde_json::to_string_pretty(&header_json(&header, file_len, &expected))?
    } else {
        let verdict = if header.fingerprint == expected {
            "loadable by this build"
        } else {
            "built by a different binary"
        };
        format!("{header}\nfile bytes        : {file_len}\nstatus            : {verdict}")
    };

    if args.hex {
        out.push('\n');
        out.push_str(&pretty_hex(&header.encode()));
    }
    Ok(out)
}
