//! Index-referenced pool of compiled code blobs.
//!
//! Blocks reference their code by [`CodeRef`] rather than raw pointer, so
//! the arena can be owned by the execution context and freed page-at-a-time
//! without any global state. Byte totals feed the size-budget watchdog.

/// Handle to one compiled code blob in a [`CodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeRef(u32);

impl CodeRef {
    /// Placeholder handle for empty cache slots; never allocated.
    pub const DANGLING: CodeRef = CodeRef(u32::MAX);
}

#[derive(Debug, Default)]
pub struct CodeArena {
    blobs: Vec<Option<Box<[u8]>>>,
    free: Vec<u32>,
    total_bytes: usize,
}

impl CodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a compiled blob and hand back its handle.
    pub fn alloc(&mut self, code: Box<[u8]>) -> CodeRef {
        self.total_bytes += code.len();
        match self.free.pop() {
            Some(slot) => {
                debug_assert!(self.blobs[slot as usize].is_none());
                self.blobs[slot as usize] = Some(code);
                CodeRef(slot)
            }
            None => {
                let slot = u32::try_from(self.blobs.len()).expect("code arena overflow");
                self.blobs.push(Some(code));
                CodeRef(slot)
            }
        }
    }

    /// Free one blob. Freeing an already-freed handle is a wiring bug.
    pub fn free(&mut self, code: CodeRef) {
        let slot = &mut self.blobs[code.0 as usize];
        let blob = slot.take().expect("double free of code blob");
        self.total_bytes -= blob.len();
        self.free.push(code.0);
    }

    /// The compiled bytes for `code`; panics on a dangling handle (a handle
    /// must never outlive its page's profile).
    pub fn get(&self, code: CodeRef) -> &[u8] {
        self.blobs[code.0 as usize]
            .as_deref()
            .expect("dangling code reference")
    }

    #[inline]
    pub fn contains(&self, code: CodeRef) -> bool {
        self.blobs
            .get(code.0 as usize)
            .is_some_and(|slot| slot.is_some())
    }

    /// Total resident compiled-code size, watchdog input.
    #[inline]
    pub fn total_code_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn live_blobs(&self) -> usize {
        self.blobs.len() - self.free.len()
    }
}
