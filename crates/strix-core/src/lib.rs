//! Execution context: cached guest memory plus the compiled-code caches,
//! kept coherent through the event queue.
//!
//! The structures themselves live in `strix-mem` and `strix-jit-cache`;
//! this crate wires them to a [`BlockCompiler`] and applies the coherency
//! fan-out: every guest action that can invalidate cached state (TLB
//! maintenance, privilege changes, self-modifying writes, feature-level
//! changes) is published as an event and delivered to each affected cache
//! at the next dispatch boundary.

mod context;
#[cfg(test)]
mod test_util;

pub use context::ExecContext;

use strix_jit_cache::FeatureSet;
use strix_mem::{CachedMemory, MemConfig, TranslateFault};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Mem(#[from] TranslateFault),
    #[error("block compilation failed at {pc:#x}: {reason}")]
    Compile { pc: u64, reason: String },
}

/// Output of one block compilation: host code plus the guest span it
/// covers and the feature levels it was specialized for.
pub struct CompiledBlock {
    pub code: Box<[u8]>,
    pub guest_len: u32,
    pub required: Option<FeatureSet>,
}

/// Turns guest code at a virtual PC into a host-executable blob. Reads the
/// guest instruction bytes through the context's own cached memory, so
/// fetch translations it performs are real fetches.
pub trait BlockCompiler<M, D, P> {
    fn compile(
        &mut self,
        pc: u64,
        features: &FeatureSet,
        mem: &mut CachedMemory<M, D, P>,
    ) -> Result<CompiledBlock, CoreError>;
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Total compiled-code bytes allowed to accumulate before every
    /// translation is dropped and compilation starts over.
    pub code_bytes_ceiling: usize,
    /// Free dirty code pages inside the event pump instead of deferring
    /// to the next block lookup.
    pub eager_code_invalidation: bool,
    pub mem: MemConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            code_bytes_ceiling: 64 << 20,
            eager_code_invalidation: false,
            mem: MemConfig::default(),
        }
    }
}
