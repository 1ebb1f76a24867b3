//! Per-physical-page index of compiled blocks.

use crate::arena::{CodeArena, CodeRef};
use crate::features::FeatureSet;
use crate::{page_index, page_offset, INSTR_SHIFT, PAGE_SIZE};
use std::collections::{HashMap, HashSet};

/// One compiled block: entry blob, size of the *guest* code it covers, and
/// the feature levels the translation assumed (None = unconditional).
#[derive(Debug, Clone)]
pub struct BlockTranslation {
    pub code: CodeRef,
    pub guest_len: u32,
    pub required: Option<FeatureSet>,
}

impl BlockTranslation {
    fn required_features(&self) -> Option<&FeatureSet> {
        self.required.as_ref()
    }
}

const SLOTS_PER_PAGE: usize = (PAGE_SIZE as usize) >> INSTR_SHIFT;
const SLOTS_PER_CHUNK: usize = 128;
const CHUNKS_PER_PAGE: usize = SLOTS_PER_PAGE / SLOTS_PER_CHUNK;

struct Chunk {
    slots: [Option<BlockTranslation>; SLOTS_PER_CHUNK],
}

impl Chunk {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: [const { None }; SLOTS_PER_CHUNK],
        })
    }
}

/// Compiled-block table for one guest physical page.
///
/// The offset table is chunked and chunks allocate lazily: most pages hold a
/// handful of blocks. The profile also owns the set of its code handles so a
/// whole-page invalidation can free the backing blobs precisely.
///
/// State machine: Empty → Populated → Empty; there is no partial
/// invalidation (instruction boundaries inside a freed blob cannot be safely
/// targeted individually).
pub struct PageProfile {
    chunks: [Option<Box<Chunk>>; CHUNKS_PER_PAGE],
    owned: HashSet<CodeRef>,
    dirty: bool,
    valid: bool,
}

impl Default for PageProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl PageProfile {
    pub fn new() -> Self {
        Self {
            chunks: [const { None }; CHUNKS_PER_PAGE],
            owned: HashSet::new(),
            dirty: false,
            valid: false,
        }
    }

    #[inline]
    fn slot_of(offset: u64) -> (usize, usize) {
        let slot = (offset >> INSTR_SHIFT) as usize % SLOTS_PER_PAGE;
        (slot / SLOTS_PER_CHUNK, slot % SLOTS_PER_CHUNK)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn has_code(&self) -> bool {
        self.valid && !self.owned.is_empty()
    }

    /// Insert a block at `offset` within the page.
    ///
    /// A dirty profile is invalidated first (no new code is compiled against
    /// a page with pending invalidation). Re-inserting at an occupied offset
    /// without an intervening invalidation is a coherency-wiring bug and
    /// fails fast.
    pub fn insert(&mut self, offset: u64, txln: BlockTranslation, arena: &mut CodeArena) {
        if self.dirty {
            self.invalidate(arena);
        }
        self.valid = true;

        let (chunk_idx, slot_idx) = Self::slot_of(offset);
        let chunk = self.chunks[chunk_idx].get_or_insert_with(Chunk::new);
        let slot = &mut chunk.slots[slot_idx];
        if slot.is_some() {
            panic!("compiled block re-inserted at occupied offset {offset:#x}");
        }
        self.owned.insert(txln.code);
        *slot = Some(txln);
    }

    pub fn get(&self, offset: u64) -> Option<&BlockTranslation> {
        if !self.valid || self.dirty {
            return None;
        }
        let (chunk_idx, slot_idx) = Self::slot_of(offset);
        self.chunks[chunk_idx].as_ref()?.slots[slot_idx].as_ref()
    }

    /// Drop the single entry at `offset` (feature-mismatch cleanup only;
    /// page-granular invalidation is the normal path).
    pub fn invalidate_entry(&mut self, offset: u64, arena: &mut CodeArena) {
        let (chunk_idx, slot_idx) = Self::slot_of(offset);
        let Some(chunk) = self.chunks[chunk_idx].as_mut() else {
            return;
        };
        if let Some(txln) = chunk.slots[slot_idx].take() {
            self.owned.remove(&txln.code);
            arena.free(txln.code);
        }
    }

    /// Free every block on this page and return to the Empty state.
    pub fn invalidate(&mut self, arena: &mut CodeArena) {
        for code in self.owned.drain() {
            arena.free(code);
        }
        self.chunks = [const { None }; CHUNKS_PER_PAGE];
        self.valid = false;
        self.dirty = false;
    }
}

/// The whole compiled-block index: one lazily created [`PageProfile`] per
/// guest physical page that ever held code.
#[derive(Default)]
pub struct BlockIndex {
    pages: HashMap<u64, PageProfile>,
    /// Pages marked dirty since the last garbage collection.
    dirty_pages: Vec<u64>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, paddr: u64, txln: BlockTranslation, arena: &mut CodeArena) {
        log::trace!("indexing block at {paddr:#x}");
        self.pages
            .entry(page_index(paddr))
            .or_default()
            .insert(page_offset(paddr), txln, arena);
    }

    /// Look up the block at `paddr`, gated on `active` features. A block
    /// whose requirement is no longer satisfied is dropped and reported as a
    /// miss, forcing recompilation; it is never returned stale.
    pub fn get(
        &mut self,
        paddr: u64,
        active: &FeatureSet,
        arena: &mut CodeArena,
    ) -> Option<BlockTranslation> {
        let profile = self.pages.get_mut(&page_index(paddr))?;
        let txln = profile.get(page_offset(paddr))?;
        let ok = txln
            .required_features()
            .is_none_or(|required| active.satisfies(required));
        if !ok {
            profile.invalidate_entry(page_offset(paddr), arena);
            return None;
        }
        Some(txln.clone())
    }

    /// Does this physical page currently hold compiled code? Consulted on
    /// the write path to decide whether to publish a region-dirty event.
    #[inline]
    pub fn has_code(&self, paddr: u64) -> bool {
        self.pages
            .get(&page_index(paddr))
            .is_some_and(PageProfile::has_code)
    }

    /// Defer invalidation of the page containing `paddr` to the next
    /// [`Self::garbage_collect`]. Lookups of the page miss in the meantime.
    pub fn mark_page_dirty(&mut self, paddr: u64) {
        if let Some(profile) = self.pages.get_mut(&page_index(paddr)) {
            log::debug!("marking code page {:#x} dirty", paddr & !(PAGE_SIZE - 1));
            if !profile.is_dirty() {
                profile.mark_dirty();
                self.dirty_pages.push(page_index(paddr));
            }
        }
    }

    /// Free every page marked dirty since the last collection.
    pub fn garbage_collect(&mut self, arena: &mut CodeArena) {
        if self.dirty_pages.is_empty() {
            return;
        }
        log::debug!("collecting {} dirty code pages", self.dirty_pages.len());
        for page in self.dirty_pages.drain(..) {
            // A re-insertion may already have reset the profile; code
            // compiled since the dirty mark must survive.
            if let Some(profile) = self.pages.get_mut(&page) {
                if profile.is_dirty() {
                    profile.invalidate(arena);
                }
            }
        }
    }

    /// Immediately free every block on the page containing `paddr`.
    pub fn invalidate_page(&mut self, paddr: u64, arena: &mut CodeArena) {
        if let Some(profile) = self.pages.get_mut(&page_index(paddr)) {
            profile.invalidate(arena);
        }
    }

    /// Free everything.
    pub fn invalidate_all(&mut self, arena: &mut CodeArena) {
        log::debug!("full block-index invalidation");
        for profile in self.pages.values_mut() {
            profile.invalidate(arena);
        }
        self.dirty_pages.clear();
    }
}
