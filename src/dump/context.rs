//! State of a single dump
//!
//! A `DumpContext` is created for one write, drives the walk from the
//! roots to completion, lays out the sections and tables, and is then
//! discarded.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use log::{debug, info};

use crate::heap::host::Remembered;
use crate::heap::{BuiltinId, ObjectGraph, ObjectId, Value};
use crate::image::fingerprint::Fingerprint;
use crate::image::header::{ImageHeader, Locator, Phase, HEADER_SIZE};
use crate::image::kind::{header_word, ObjectKind};
use crate::image::layout::{self, vector};
use crate::image::reloc::{merge_host_relocs, HostReloc, ObjectStart, Reloc};
use crate::image::word::Tag;
use crate::image::{DUMP_ALIGNMENT, MAX_PAGE_SIZE};

use super::encoder::{to_offset, Encoder};
use super::error::DumpError;
use super::fixup::{Fixup, FixupKind, HostFixup};
use super::scheduler::{ScoreTuning, Scheduler, Weight};
use super::settings::DumpSettings;
use super::stats::DumpStats;

/// Owner of a symbol record
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    Object(ObjectId),
    Builtin(BuiltinId),
}

/// Something that gets its own place in the image
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Item {
    Object(ObjectId),
    /// Immutable payload of an object
    Cold(ObjectId),
    /// Localized value block of a symbol
    SymbolAux(SymbolRef),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ItemState {
    /// Pending in the scheduler
    Queued,
    /// Waiting on a deferred list
    Deferred,
    Written(u32),
}

pub struct DumpContext<'g, G: ObjectGraph + ?Sized> {
    pub(super) graph: &'g G,
    pub(super) settings: DumpSettings,
    pub(super) enc: Encoder,
    pub(super) states: HashMap<Item, ItemState>,
    pub(super) queue: Scheduler<ObjectId>,
    pub(super) fixups: Vec<Fixup>,
    pub(super) host_fixups: Vec<HostFixup>,
    pub(super) relocs: [Vec<Reloc>; 3],
    pub(super) host_relocs: Vec<HostReloc>,
    pub(super) object_starts: Vec<ObjectStart>,
    pub(super) cold: VecDeque<ObjectId>,
    pub(super) copied: Vec<BuiltinId>,
    pub(super) deferred_hash_tables: VecDeque<ObjectId>,
    pub(super) deferred_symbol_aux: VecDeque<SymbolRef>,
    pub(super) hash_tables: Vec<ObjectId>,
    pub(super) stats: DumpStats,
}

impl<'g, G: ObjectGraph + ?Sized> DumpContext<'g, G> {
    pub fn new(graph: &'g G, settings: &DumpSettings) -> Self {
        DumpContext {
            graph,
            settings: settings.clone(),
            enc: Encoder::new(),
            states: HashMap::new(),
            queue: Scheduler::new(ScoreTuning::from(settings), settings.fancy_warn),
            fixups: vec![],
            host_fixups: vec![],
            relocs: Default::default(),
            host_relocs: vec![],
            object_starts: vec![],
            cold: VecDeque::new(),
            copied: vec![],
            deferred_hash_tables: VecDeque::new(),
            deferred_symbol_aux: VecDeque::new(),
            hash_tables: vec![],
            stats: DumpStats::default(),
        }
    }

    pub fn state(&self, item: Item) -> Option<ItemState> {
        self.states.get(&item).copied()
    }

    pub(super) fn reloc(
        &mut self,
        phase: Phase,
        at: usize,
        reloc: fn(u32) -> Reloc,
    ) -> Result<(), DumpError> {
        let at = to_offset(at)?;
        self.relocs[phase as usize].push(reloc(at));
        Ok(())
    }

    /// Reserve a record with its header word, checking the size limit
    pub(super) fn record(
        &mut self,
        kind: ObjectKind,
        aux: u64,
        size: usize,
    ) -> Result<usize, DumpError> {
        if size > self.settings.max_object_size {
            return Err(DumpError::ObjectTooLarge {
                kind: kind.name().to_string(),
                size,
                limit: self.settings.max_object_size,
            });
        }
        let base = self.enc.reserve(size)?;
        self.enc.put_u64(base, header_word(kind, aux))?;
        self.stats.objects.bump(kind.name());
        Ok(base)
    }

    /// Reserve a hot record for `item` and mark it written
    pub(super) fn begin(
        &mut self,
        item: Item,
        kind: ObjectKind,
        aux: u64,
        size: usize,
    ) -> Result<usize, DumpError> {
        let base = self.record(kind, aux, size)?;
        let offset = to_offset(base)?;
        self.states.insert(item, ItemState::Written(offset));
        self.object_starts.push(ObjectStart { offset, kind });
        Ok(base)
    }

    /// Note a reference to `id`, queueing it if it has not been seen,
    /// and return the tag that value words pointing at it carry
    pub(super) fn enqueue_object(
        &mut self,
        id: ObjectId,
        basis: usize,
        weight: Weight,
    ) -> Result<Tag, DumpError> {
        let object = self
            .graph
            .object(id)
            .ok_or_else(|| DumpError::DanglingReference(id.to_string()))?;
        let kind = object.kind().ok_or_else(|| super::walker::unsupported(object))?;
        match self.states.get(&Item::Object(id)) {
            None => {
                self.states.insert(Item::Object(id), ItemState::Queued);
                self.queue.enqueue(id, basis, weight);
            }
            Some(ItemState::Queued) => self.queue.enqueue(id, basis, weight),
            Some(_) => {}
        }
        Ok(kind.tag())
    }

    /// Queue an object's payload for the cold section and record a
    /// fixup for the field that locates it
    pub(super) fn cold_payload(
        &mut self,
        id: ObjectId,
        at: usize,
        kind: FixupKind,
    ) -> Result<(), DumpError> {
        let item = Item::Cold(id);
        if !self.states.contains_key(&item) {
            self.states.insert(item, ItemState::Deferred);
            self.cold.push_back(id);
        }
        self.fixups.push(Fixup {
            at,
            target: item,
            kind,
        });
        Ok(())
    }

    /// Drain the scheduler and the deferred hash-table and symbol-aux
    /// queues until all are empty
    fn drain(&mut self) -> Result<(), DumpError> {
        loop {
            while let Some(id) = self.queue.dequeue(self.enc.position()) {
                self.write_object(id)?;
            }
            if let Some(id) = self.deferred_hash_tables.pop_front() {
                self.write_object(id)?;
                continue;
            }
            if let Some(owner) = self.deferred_symbol_aux.pop_front() {
                self.write_symbol_aux(owner)?;
                continue;
            }
            return Ok(());
        }
    }

    /// Store a value into a host word at load time
    fn host_store(&mut self, host_offset: u32, value: Value, raw: bool) -> Result<(), DumpError> {
        let graph = self.graph;
        let layout = graph.layout();
        let reloc = match value {
            Value::Fixnum(_) | Value::Constant(_) if raw => HostReloc::immediate(host_offset, 8, 0),
            Value::Fixnum(_) | Value::Constant(_) => {
                HostReloc::immediate(host_offset, 8, super::walker::immediate_word(value)?)
            }
            Value::Builtin(b) => {
                let off = layout.builtin_offset(b) as u64;
                HostReloc::host_value(host_offset, if raw { off } else { off | Tag::Symbol as u64 })
            }
            Value::Subr(s) => HostReloc::host_value(host_offset, layout.subr_offset(s) as u64),
            Value::Object(id) => {
                let tag = self.enqueue_object(id, self.enc.position(), Weight::None)?;
                self.host_fixups.push(HostFixup {
                    host_offset,
                    target: Item::Object(id),
                    tag: (!raw).then_some(tag),
                });
                return Ok(());
            }
        };
        self.host_relocs.push(reloc);
        Ok(())
    }

    fn dump_roots(&mut self) -> Result<(), DumpError> {
        let roots = self.graph.roots();
        debug!("dumping {} roots", roots.len());
        let graph = self.graph;
        for root in roots {
            let host_offset = graph.layout().static_offset(root.slot);
            self.host_store(host_offset, root.value, false)?;
        }
        Ok(())
    }

    fn dump_remembered(&mut self, remembered: &[Remembered]) -> Result<(), DumpError> {
        let graph = self.graph;
        let layout = graph.layout();
        for r in remembered {
            match *r {
                Remembered::Scalar { offset, len } => {
                    let bytes = graph
                        .scalar(offset, len)
                        .ok_or_else(|| DumpError::BadRemembered(format!("{r:?}")))?;
                    let host_offset = layout.scalar_offset(offset);
                    if len <= 8 {
                        let mut word = [0u8; 8];
                        word[..bytes.len()].copy_from_slice(bytes);
                        self.host_relocs.push(HostReloc::immediate(
                            host_offset,
                            len,
                            u64::from_le_bytes(word),
                        ));
                    } else {
                        let at = to_offset(self.enc.append(bytes)?)?;
                        self.host_relocs
                            .push(HostReloc::copy_from_image(host_offset, at, len));
                    }
                }
                Remembered::RawPointer { slot } => {
                    let value = graph
                        .static_value(slot)
                        .ok_or_else(|| DumpError::BadRemembered(format!("{r:?}")))?;
                    self.host_store(layout.static_offset(slot), value, true)?;
                }
            }
        }
        Ok(())
    }

    /// Queue the referents of every builtin symbol; the symbols
    /// themselves are copied back into the host after the hot section
    fn note_builtins(&mut self) -> Result<(), DumpError> {
        let count = self.graph.layout().builtin_names().len() as u32;
        for i in 0..count {
            let id = BuiltinId(i);
            self.scan_symbol(SymbolRef::Builtin(id))?;
            self.copied.push(id);
        }
        Ok(())
    }

    /// Write the vector of all frozen hash tables
    fn dump_hash_list(&mut self) -> Result<u32, DumpError> {
        if self.hash_tables.is_empty() {
            return Ok(0);
        }
        let tables = self.hash_tables.clone();
        let base = self.record(
            ObjectKind::Vector,
            tables.len() as u64,
            vector::size(tables.len()),
        )?;
        let offset = to_offset(base)?;
        self.object_starts.push(ObjectStart {
            offset,
            kind: ObjectKind::Vector,
        });
        for (i, id) in tables.into_iter().enumerate() {
            self.fixups.push(Fixup {
                at: base + vector::slot(i),
                target: Item::Object(id),
                kind: FixupKind::Value(Tag::Vectorlike),
            });
        }
        Ok(offset)
    }

    /// Write builtin symbol copies in host order, each with a copy
    /// relocation back into host storage
    fn dump_copied(&mut self) -> Result<(), DumpError> {
        let mut copied = std::mem::take(&mut self.copied);
        copied.sort();
        for id in copied {
            let base = self.write_builtin_copy(id)?;
            let host_offset = self.graph.layout().builtin_offset(id);
            self.host_relocs.push(HostReloc::copy_from_image(
                host_offset,
                to_offset(base)?,
                layout::symbol::SIZE as u32,
            ));
        }
        if !self.queue.is_empty() {
            return Err(DumpError::Internal(
                "objects queued while writing copied symbols".to_string(),
            ));
        }
        Ok(())
    }

    fn dump_cold(&mut self) -> Result<(), DumpError> {
        while let Some(id) = self.cold.pop_front() {
            let payload = self.cold_bytes(id)?;
            let at = self.enc.append(&payload)?;
            self.states
                .insert(Item::Cold(id), ItemState::Written(to_offset(at)?));
        }
        Ok(())
    }

    fn write_table<T, F, const N: usize>(
        &mut self,
        entries: &[T],
        encode: F,
    ) -> Result<Locator, DumpError>
    where
        F: Fn(&T) -> [u8; N],
    {
        self.enc.align(DUMP_ALIGNMENT);
        let offset = self.enc.offset()?;
        for entry in entries {
            self.enc.append(&encode(entry))?;
        }
        Ok(Locator::new(offset, entries.len() as u32))
    }

    /// Walk the graph and lay out the complete image
    pub fn build(
        mut self,
        fingerprint: Fingerprint,
        remembered: &[Remembered],
    ) -> Result<(Vec<u8>, DumpStats), DumpError> {
        let mut header = ImageHeader::new(fingerprint);
        self.enc.reserve(HEADER_SIZE)?;

        let start = Instant::now();
        self.dump_roots()?;
        self.dump_remembered(remembered)?;
        self.note_builtins()?;
        self.drain()?;
        header.hash_list_offset = self.dump_hash_list()?;
        self.drain()?;
        self.enc.align(DUMP_ALIGNMENT);
        header.discardable_start = self.enc.offset()?;
        self.stats.timings.record("dump-walk", start.elapsed());
        debug!(
            "hot section {} bytes, {} objects",
            header.discardable_start as usize - HEADER_SIZE,
            self.object_starts.len()
        );

        let start = Instant::now();
        self.dump_copied()?;
        self.enc.align(MAX_PAGE_SIZE);
        header.cold_start = self.enc.offset()?;
        self.dump_cold()?;
        self.enc.align(DUMP_ALIGNMENT);
        header.end_heap = self.enc.offset()?;
        self.stats.timings.record("dump-copied-cold", start.elapsed());

        let start = Instant::now();
        self.resolve_fixups()?;
        self.stats.timings.record("dump-resolve", start.elapsed());

        let start = Instant::now();
        for phase in Phase::ALL {
            let relocs = std::mem::take(&mut self.relocs[phase as usize]);
            self.stats.relocs[phase as usize] = relocs.len();
            header.relocs[phase as usize] = self.write_table(&relocs, Reloc::encode)?;
        }
        let starts = std::mem::take(&mut self.object_starts);
        header.object_starts = self.write_table(&starts, ObjectStart::encode)?;
        let host_relocs = std::mem::take(&mut self.host_relocs);
        self.stats.host_relocs_unmerged = host_relocs.len();
        let host_relocs = merge_host_relocs(host_relocs);
        self.stats.host_relocs = host_relocs.len();
        header.host_relocs = self.write_table(&host_relocs, HostReloc::encode)?;
        self.enc.put_bytes(0, &header.encode())?;
        self.stats.timings.record("dump-tables", start.elapsed());

        let total = self.enc.position();
        self.stats.hot_bytes = header.discardable_start as usize - HEADER_SIZE;
        self.stats.discardable_bytes = (header.cold_start - header.discardable_start) as usize;
        self.stats.cold_bytes = (header.end_heap - header.cold_start) as usize;
        self.stats.table_bytes = total - header.end_heap as usize;
        self.stats.hash_tables = self.hash_tables.len();
        info!(
            "image laid out: {} bytes, {} objects, {} fixups",
            total,
            self.stats.objects.total(),
            self.stats.fixups
        );

        Ok((self.enc.into_bytes(), self.stats))
    }
}
