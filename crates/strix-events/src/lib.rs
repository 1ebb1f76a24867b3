//! Guest-visible maintenance events and the publish queue that feeds cache
//! coherency.
//!
//! Anything the guest can do that changes the meaning of a cached translation
//! or a compiled block (TLB maintenance, privilege transitions, writes to
//! code pages, ISA feature-level changes) is published here as an [`Event`].
//! The owning execution thread drains the queue at dispatch-loop boundaries
//! and fans each event out to the affected caches, so invalidation is always
//! serialized against that thread's own probe/fill operations.

use std::sync::Mutex;

/// Current privilege ring of the simulated thread.
///
/// Only the user/kernel distinction matters to the caches; intermediate rings
/// of architectures that have them are collapsed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ring {
    User,
    Kernel,
}

/// A guest-visible event that may invalidate cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Full TLB flush (e.g. a guest write to its page-table base register).
    TlbFullFlush,
    /// Single-entry TLB invalidation for the page containing `vaddr`.
    TlbEntryEvict { vaddr: u64 },
    /// The thread changed privilege ring.
    PrivilegeChange { ring: Ring },
    /// A write landed on a physical page known to hold compiled code.
    RegionDirty { paddr: u64 },
    /// The active ISA feature levels changed; `available_mask` is the new
    /// packed feature mask (see `strix-jit-cache`'s feature encoding).
    FeatureChange { available_mask: u64 },
    /// Explicit request to drop everything, caches and compiled code alike.
    FlushAll,
}

/// Discriminant-only view of [`Event`], for logging event delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TlbFullFlush,
    TlbEntryEvict,
    PrivilegeChange,
    RegionDirty,
    FeatureChange,
    FlushAll,
}

impl Event {
    #[inline]
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TlbFullFlush => EventKind::TlbFullFlush,
            Event::TlbEntryEvict { .. } => EventKind::TlbEntryEvict,
            Event::PrivilegeChange { .. } => EventKind::PrivilegeChange,
            Event::RegionDirty { .. } => EventKind::RegionDirty,
            Event::FeatureChange { .. } => EventKind::FeatureChange,
            Event::FlushAll => EventKind::FlushAll,
        }
    }
}

/// Publish queue for maintenance events.
///
/// `publish` may be called from any thread (cross-thread broadcast
/// invalidation, e.g. a global code-modification notification); the lock is
/// scoped to the queue push/swap only and is never held across a cache probe
/// or fill. Events are applied by whoever drains the queue, which is always
/// the cache-owning thread.
#[derive(Debug, Default)]
pub struct EventQueue {
    pending: Mutex<Vec<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: Event) {
        log::trace!("publish {:?}", event);
        self.pending
            .lock()
            .expect("event queue poisoned")
            .push(event);
    }

    /// Take the entire backlog, leaving the queue empty.
    pub fn drain(&self) -> Vec<Event> {
        let mut pending = self.pending.lock().expect("event queue poisoned");
        std::mem::take(&mut *pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().expect("event queue poisoned").is_empty()
    }
}
