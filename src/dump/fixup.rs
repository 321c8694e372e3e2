//! Deferred patches and their resolution
//!
//! A field referring to an object whose offset is not yet known gets a
//! placeholder and a fixup. Once every queue is drained each fixup is
//! patched with the target's final offset and, where the patched word
//! must be rebased at load, a relocation is recorded for it.

use crate::heap::ObjectGraph;
use crate::image::header::Phase;
use crate::image::reloc::{HostReloc, Reloc, RelocKind};
use crate::image::word::{tagged, Tag};

use super::context::{DumpContext, Item, ItemState};
use super::encoder::to_offset;
use super::error::DumpError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FixupKind {
    /// Tagged value word, rebased at load
    Value(Tag),
    /// Untagged pointer, rebased at load
    RawPtr,
    /// Plain image offset, left as is
    Offset,
}

/// A patch to a word of the image
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Fixup {
    pub at: usize,
    pub target: Item,
    pub kind: FixupKind,
}

/// A patch to a word of host static storage
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HostFixup {
    pub host_offset: u32,
    pub target: Item,
    /// `None` for raw pointer slots
    pub tag: Option<Tag>,
}

impl<'g, G: ObjectGraph + ?Sized> DumpContext<'g, G> {
    fn final_offset(&self, target: Item) -> Result<u32, DumpError> {
        match self.states.get(&target) {
            Some(ItemState::Written(offset)) => Ok(*offset),
            _ => Err(DumpError::DanglingReference(format!("{target:?}"))),
        }
    }

    /// Patch every fixup, recording relocations, then sort the
    /// relocation lists
    pub fn resolve_fixups(&mut self) -> Result<(), DumpError> {
        let mut fixups = std::mem::take(&mut self.fixups);
        fixups.sort_by_key(|f| f.at);
        self.stats.fixups = fixups.len();

        for fixup in &fixups {
            let offset = self.final_offset(fixup.target)?;
            let at = to_offset(fixup.at)?;
            match fixup.kind {
                FixupKind::Value(tag) => {
                    self.enc.put_u64(fixup.at, tagged(offset as u64, tag))?;
                    self.relocs[Phase::Early as usize].push(Reloc::tagged(
                        at,
                        RelocKind::ImageValue,
                        tag,
                    ));
                }
                FixupKind::RawPtr => {
                    self.enc.put_u64(fixup.at, offset as u64)?;
                    self.relocs[Phase::Early as usize].push(Reloc::new(at, RelocKind::ImagePtr));
                }
                FixupKind::Offset => {
                    self.enc.put_u64(fixup.at, offset as u64)?;
                }
            }
        }

        let host_fixups = std::mem::take(&mut self.host_fixups);
        for fixup in host_fixups {
            let offset = self.final_offset(fixup.target)? as u64;
            let payload = match fixup.tag {
                Some(tag) => tagged(offset, tag),
                None => offset,
            };
            self.host_relocs
                .push(HostReloc::image_value(fixup.host_offset, payload));
        }

        for relocs in self.relocs.iter_mut() {
            relocs.sort_by_key(|r| r.offset);
        }
        Ok(())
    }
}
