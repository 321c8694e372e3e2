//! The process-side context for writing and loading images
//!
//! `ImageRuntime` owns the host static storage and the registries that
//! the writer and loader consult: load hooks, remembered host
//! locations and the native-code loader. At most one image is loaded
//! per runtime, and with exclusive loading (the default) at most one
//! per process.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use log::{debug, warn};

use crate::dump::error::DumpError;
use crate::dump::settings::DumpSettings;
use crate::dump::stats::DumpStats;
use crate::dump::dump_image;
use crate::heap::host::{HostImage, HostLayout, Remembered};
use crate::heap::{Heap, ObjectGraph};

use super::error::{LoadError, LoadStatus, RegistryError};
use super::image::LoadedImage;
use super::loader::load_image;
use super::reader::materialize;
use super::settings::{LoadSettings, LoadStats};
use super::thaw::thaw_hash_tables;

/// Maximum number of registered load hooks
pub const HOOKS_MAX: usize = 24;
/// Maximum number of remembered host locations
pub const REMEMBERED_MAX: usize = 64;

/// Set once an image has been loaded with exclusive loading
static PROCESS_LOADED: AtomicBool = AtomicBool::new(false);

/// Whether an exclusive load has succeeded in this process
pub fn process_has_image() -> bool {
    PROCESS_LOADED.load(Ordering::SeqCst)
}

/// Activation of native code units referenced by an image
pub trait NativeLoader {
    /// Load the unit stored in `file`, returning an opaque handle
    fn load_unit(&mut self, file: &str) -> Result<u64, String>;

    /// Entry point of function `name` in a loaded unit
    fn resolve(&mut self, unit: u64, name: &str) -> Result<u64, String>;
}

/// Refuses every native unit
#[derive(Debug, Default)]
pub struct NoNativeCode;

impl NativeLoader for NoNativeCode {
    fn load_unit(&mut self, file: &str) -> Result<u64, String> {
        Err(format!("native code not available for {file}"))
    }

    fn resolve(&mut self, _unit: u64, name: &str) -> Result<u64, String> {
        Err(format!("native code not available for {name}"))
    }
}

/// Run now and after every later load; receives the image when there
/// is one
pub type LoadHook = fn(Option<&mut LoadedImage>, &mut HostImage) -> Result<(), LoadError>;

pub struct ImageRuntime {
    host: HostImage,
    hooks: Vec<LoadHook>,
    remembered: Vec<Remembered>,
    native: Box<dyn NativeLoader>,
    settings: LoadSettings,
    image: Option<LoadedImage>,
    stats: Option<LoadStats>,
}

impl ImageRuntime {
    pub fn new(layout: HostLayout, settings: LoadSettings) -> Self {
        ImageRuntime {
            host: HostImage::new(layout),
            hooks: vec![thaw_hash_tables],
            remembered: vec![],
            native: Box::new(NoNativeCode),
            settings,
            image: None,
            stats: None,
        }
    }

    pub fn with_native_loader<N: NativeLoader + 'static>(mut self, native: N) -> Self {
        self.native = Box::new(native);
        self
    }

    pub fn host(&self) -> &HostImage {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut HostImage {
        &mut self.host
    }

    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    /// Register a hook, running it immediately
    pub fn add_hook(&mut self, hook: LoadHook) -> Result<(), RegistryError> {
        if self.hooks.len() >= HOOKS_MAX {
            return Err(RegistryError::Hooks(HOOKS_MAX));
        }
        self.hooks.push(hook);
        if let Err(e) = hook(self.image.as_mut(), &mut self.host) {
            warn!("load hook failed: {e}");
        }
        Ok(())
    }

    pub fn hook_count(&self) -> usize {
        self.hooks.len()
    }

    /// Register a host location to carry across images
    pub fn remember(&mut self, location: Remembered) -> Result<(), RegistryError> {
        if self.remembered.len() >= REMEMBERED_MAX {
            return Err(RegistryError::Remembered(REMEMBERED_MAX));
        }
        if !self.host.layout().holds(location) {
            return Err(RegistryError::OutOfRange(location));
        }
        self.remembered.push(location);
        Ok(())
    }

    pub fn remembered(&self) -> &[Remembered] {
        &self.remembered
    }

    /// Static slots registered as raw pointers
    pub fn raw_pointer_slots(&self) -> Vec<u32> {
        self.remembered
            .iter()
            .filter_map(|r| match r {
                Remembered::RawPointer { slot } => Some(*slot),
                _ => None,
            })
            .collect()
    }

    /// Write an image of `graph` with this runtime's remembered
    /// locations
    pub fn dump<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
        path: &Path,
        settings: &DumpSettings,
    ) -> Result<DumpStats, DumpError> {
        if graph.layout() != self.host.layout() {
            return Err(DumpError::Internal(
                "heap was built for a different host layout".to_string(),
            ));
        }
        dump_image(graph, &self.remembered, path, settings)
    }

    pub fn image(&self) -> Option<&LoadedImage> {
        self.image.as_ref()
    }

    pub fn image_mut(&mut self) -> Option<&mut LoadedImage> {
        self.image.as_mut()
    }

    pub fn stats(&self) -> Option<&LoadStats> {
        self.stats.as_ref()
    }

    fn run_hooks(&mut self, image: &mut LoadedImage) -> Result<(), LoadError> {
        for hook in &self.hooks {
            hook(Some(&mut *image), &mut self.host)?;
        }
        Ok(())
    }

    fn try_load(&mut self, path: &Path) -> Result<(), LoadError> {
        if self.image.is_some() {
            return Err(LoadError::AlreadyLoaded);
        }
        let (mut image, mut stats) =
            load_image(path, &mut self.host, self.native.as_mut(), &self.settings)?;

        let snapshot = self.host.snapshot();
        let start = Instant::now();
        if let Err(e) = self.run_hooks(&mut image) {
            self.host.restore(&snapshot);
            return Err(e);
        }
        stats.hooks_run = self.hooks.len();
        stats.timings.record("load-hooks", start.elapsed());

        self.image = Some(image);
        self.stats = Some(stats);
        Ok(())
    }

    /// Load the image at `path`
    ///
    /// On failure the runtime is left without an image and host
    /// storage is unchanged.
    pub fn load(&mut self, path: &Path) -> Result<&LoadStats, LoadError> {
        let exclusive = self.settings.exclusive;
        if exclusive
            && PROCESS_LOADED
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return Err(LoadError::AlreadyLoaded);
        }
        match self.try_load(path) {
            Ok(()) => {
                debug!("image ready");
                self.stats
                    .as_ref()
                    .ok_or_else(|| LoadError::corrupt("statistics missing after load"))
            }
            Err(e) => {
                if exclusive {
                    PROCESS_LOADED.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    /// Load the image at `path`, reporting only the status
    pub fn load_status(&mut self, path: &Path) -> LoadStatus {
        match self.load(path) {
            Ok(_) => LoadStatus::Success,
            Err(e) => {
                warn!("{e}");
                e.status()
            }
        }
    }

    /// Rebuild a heap from the loaded image with `roots` as root slots
    pub fn materialize(&self, roots: &[u32]) -> Result<Heap, LoadError> {
        let image = self
            .image
            .as_ref()
            .ok_or_else(|| LoadError::corrupt("no image loaded"))?;
        materialize(image, &self.host, roots, &self.raw_pointer_slots())
    }
}
