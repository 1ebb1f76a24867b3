use crate::{BlockCompiler, CompiledBlock, CoreConfig, CoreError};
use strix_events::{Event, EventQueue, Ring};
use strix_jit_cache::{
    BlockIndex, BlockTranslation, CodeArena, CodeRef, FeatureSet, ResidentBlockCache,
};
use strix_mem::{
    page_base, AccessInfo, AccessKind, AddressTranslator, CachedMemory, DeviceBus, HostPage,
    MemoryBacking, PageCache, TranslateFault, WriteReceipt,
};

/// One guest execution thread's view of memory and compiled code.
///
/// All invalidation flows through the event queue: mutators publish, and
/// [`ExecContext::pump_events`] delivers at the next dispatch boundary.
/// Expensive reclamation (freeing dirty code pages) is deferred further,
/// to the start of the next block lookup, so a burst of self-modifying
/// writes costs one collection rather than one per write.
pub struct ExecContext<M, D, P, C> {
    mem: CachedMemory<M, D, P>,
    page_cache: Option<PageCache>,
    arena: CodeArena,
    index: BlockIndex,
    resident: ResidentBlockCache,
    features: FeatureSet,
    events: EventQueue,
    compiler: C,
    gc_pending: bool,
    config: CoreConfig,
}

impl<M, D, P, C> ExecContext<M, D, P, C>
where
    M: AddressTranslator,
    D: DeviceBus,
    P: MemoryBacking,
    C: BlockCompiler<M, D, P>,
{
    pub fn new(mmu: M, devices: D, backing: P, compiler: C, config: CoreConfig) -> Self {
        Self {
            mem: CachedMemory::new(mmu, devices, backing, config.mem),
            page_cache: None,
            arena: CodeArena::new(),
            index: BlockIndex::new(),
            resident: ResidentBlockCache::new(),
            features: FeatureSet::new(),
            events: EventQueue::new(),
            compiler,
            gc_pending: false,
            config,
        }
    }

    /// Attach a direct-mapped host-page cache for the generated code's fast
    /// path. Participates in TLB-event invalidation from then on.
    pub fn set_page_cache(&mut self, cache: PageCache) {
        self.page_cache = Some(cache);
    }

    pub fn mem(&mut self) -> &mut CachedMemory<M, D, P> {
        &mut self.mem
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    pub fn compiler_mut(&mut self) -> &mut C {
        &mut self.compiler
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn code(&self, code: CodeRef) -> &[u8] {
        self.arena.get(code)
    }

    pub fn compiled_code_bytes(&self) -> usize {
        self.arena.total_code_bytes()
    }

    /// Replace the active feature levels. Takes effect at the next event
    /// pump: specialized translations that no longer match are dropped.
    pub fn set_features(&mut self, features: FeatureSet) {
        let mask = features.available_mask();
        self.features = features;
        self.events.publish(Event::FeatureChange {
            available_mask: mask,
        });
    }

    pub fn set_ring(&mut self, ring: Ring) {
        self.events.publish(Event::PrivilegeChange { ring });
    }

    pub fn read(&mut self, vaddr: u64, dst: &mut [u8]) -> Result<(), TranslateFault> {
        self.mem.read(vaddr, dst)
    }

    pub fn fetch(&mut self, vaddr: u64, dst: &mut [u8]) -> Result<(), TranslateFault> {
        self.mem.fetch(vaddr, dst)
    }

    /// Write guest memory, publishing a region-dirty event for every
    /// physical page hit that currently holds compiled code.
    ///
    /// A faulting straddle still dirties the first page: the byte
    /// decomposition commits its prefix there before stopping, so any
    /// compiled code on it is already stale.
    pub fn write(&mut self, vaddr: u64, src: &[u8]) -> Result<WriteReceipt, TranslateFault> {
        match self.mem.write(vaddr, src) {
            Ok(receipt) => {
                for paddr in [Some(receipt.paddr), receipt.straddle_paddr].into_iter().flatten() {
                    if self.index.has_code(paddr) {
                        self.events.publish(Event::RegionDirty { paddr });
                    }
                }
                Ok(receipt)
            }
            Err(fault) => {
                // If the first page itself is writable the fault came from
                // the straddle target, and bytes landed before it.
                let ring = self.mem.ring();
                let probe = AccessInfo::sideless(AccessKind::Write, ring);
                if let Ok(paddr) = self.mem.translate_probe(vaddr, probe) {
                    if self.index.has_code(paddr) {
                        self.events.publish(Event::RegionDirty { paddr });
                    }
                }
                Err(fault)
            }
        }
    }

    /// Host pointer to the page containing `vaddr`, filling the page cache
    /// on miss. Device pages and unmapped pages are never cached.
    pub fn host_page(&mut self, vaddr: u64) -> Option<HostPage> {
        let cache = self.page_cache.as_mut()?;
        if let Some(page) = cache.lookup(vaddr) {
            return Some(page);
        }
        let ring = self.mem.ring();
        let paddr = self
            .mem
            .translate_probe(vaddr, AccessInfo::sideless(AccessKind::Read, ring))
            .ok()?;
        if self.mem.devices_mut().has_device(paddr) {
            return None;
        }
        let page = self.mem.backing_mut().lock_page(page_base(paddr))?;
        let cache = self.page_cache.as_mut()?;
        cache.install(vaddr, page);
        Some(page)
    }

    /// Find or build the block at `pc`. This is the dispatch boundary:
    /// pending events are delivered and deferred code reclamation runs
    /// before any cache is consulted.
    pub fn lookup_block(&mut self, pc: u64) -> Result<CodeRef, CoreError> {
        self.pump_events();
        if self.gc_pending {
            self.index.garbage_collect(&mut self.arena);
            self.gc_pending = false;
        }

        if let Some(code) = self.resident.lookup(pc) {
            return Ok(code);
        }

        let info = AccessInfo::new(AccessKind::Fetch, self.mem.ring());
        let paddr = self.mem.mmu_mut().translate(pc, info)?.paddr;

        if let Some(txln) = self.index.get(paddr, &self.features, &mut self.arena) {
            self.promote(pc, &txln);
            return Ok(txln.code);
        }

        self.compile_block(pc, paddr)
    }

    fn promote(&mut self, pc: u64, txln: &BlockTranslation) {
        let no_requirement = FeatureSet::new();
        let required = txln.required.as_ref().unwrap_or(&no_requirement);
        self.resident.insert(pc, txln.code, required);
    }

    fn compile_block(&mut self, pc: u64, paddr: u64) -> Result<CodeRef, CoreError> {
        let block = self.compiler.compile(pc, &self.features, &mut self.mem)?;
        let CompiledBlock {
            code,
            guest_len,
            required,
        } = block;

        if self.arena.total_code_bytes() + code.len() > self.config.code_bytes_ceiling {
            log::info!(
                "compiled code over {} byte ceiling, dropping all translations",
                self.config.code_bytes_ceiling
            );
            self.index.invalidate_all(&mut self.arena);
            self.resident.invalidate();
            self.gc_pending = false;
        }

        let code = self.arena.alloc(code);
        let txln = BlockTranslation {
            code,
            guest_len,
            required,
        };
        self.promote(pc, &txln);
        self.index.insert(paddr, txln, &mut self.arena);
        Ok(code)
    }

    /// Deliver every pending event to the caches it affects.
    pub fn pump_events(&mut self) {
        if self.events.is_empty() {
            return;
        }
        for event in self.events.drain() {
            log::trace!("delivering {:?}", event.kind());
            match event {
                Event::TlbFullFlush => {
                    self.mem.flush_caches();
                    if let Some(cache) = self.page_cache.as_mut() {
                        cache.flush();
                    }
                    self.resident.invalidate();
                }
                Event::TlbEntryEvict { vaddr } => {
                    self.mem.evict(vaddr);
                    if let Some(cache) = self.page_cache.as_mut() {
                        cache.evict(vaddr);
                    }
                    self.resident.evict(vaddr);
                }
                Event::PrivilegeChange { ring } => {
                    self.mem.flush_caches();
                    self.mem.set_ring(ring);
                }
                Event::RegionDirty { paddr } => {
                    if self.config.eager_code_invalidation {
                        self.index.invalidate_page(paddr, &mut self.arena);
                    } else {
                        self.index.mark_page_dirty(paddr);
                        self.gc_pending = true;
                    }
                    // The resident cache is virtually keyed and cannot name
                    // the entries backed by this physical page.
                    self.resident.invalidate();
                }
                Event::FeatureChange { available_mask } => {
                    self.resident.invalidate_features(available_mask);
                }
                Event::FlushAll => {
                    self.mem.flush_caches();
                    if let Some(cache) = self.page_cache.as_mut() {
                        cache.flush();
                    }
                    self.index.invalidate_all(&mut self.arena);
                    self.resident.invalidate();
                    self.gc_pending = false;
                }
            }
        }
    }
}
