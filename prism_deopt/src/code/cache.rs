//! Code cache for installed compiled regions.
//!
//! The engine never allocates or frees code. It looks regions up by compile
//! id or by pc, and flips their entrant and deoptimization attributes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;

use super::region::{CompiledRegion, DeoptStatus};
use crate::runtime::{MethodId, Pc};

/// First address handed out by [`CodeCache::reserve`].
const CODE_BASE: usize = 0x10_0000;

// =============================================================================
// Statistics
// =============================================================================

/// Code cache counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CodeCacheStats {
    pub installed: u64,
    pub made_not_entrant: u64,
    pub deoptimized: u64,
}

#[derive(Debug, Default)]
struct Counters {
    installed: AtomicU64,
    made_not_entrant: AtomicU64,
    deoptimized: AtomicU64,
}

// =============================================================================
// CodeCache
// =============================================================================

/// Installed compiled regions, keyed by compile id.
#[derive(Debug)]
pub struct CodeCache {
    regions: DashMap<u32, Arc<CompiledRegion>>,
    next_address: AtomicUsize,
    counters: Counters,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCache {
    pub fn new() -> Self {
        Self {
            regions: DashMap::new(),
            next_address: AtomicUsize::new(CODE_BASE),
            counters: Counters::default(),
        }
    }

    /// Reserve an address range of `size` bytes for a new region.
    pub fn reserve(&self, size: usize) -> Pc {
        let aligned = size.next_multiple_of(16).max(16);
        Pc(self.next_address.fetch_add(aligned, Ordering::Relaxed))
    }

    /// Install a region, replacing any region with the same compile id.
    pub fn install(&self, region: CompiledRegion) -> Arc<CompiledRegion> {
        let region = Arc::new(region);
        self.regions.insert(region.compile_id(), Arc::clone(&region));
        self.counters.installed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            target: "prism_deopt",
            compile_id = region.compile_id(),
            method = %region.method().qualified_name(),
            "installed compiled region"
        );
        region
    }

    pub fn get(&self, compile_id: u32) -> Option<Arc<CompiledRegion>> {
        self.regions.get(&compile_id).map(|r| Arc::clone(r.value()))
    }

    pub fn remove(&self, compile_id: u32) -> Option<Arc<CompiledRegion>> {
        self.regions.remove(&compile_id).map(|(_, r)| r)
    }

    /// Region containing `pc`.
    pub fn find_by_pc(&self, pc: Pc) -> Option<Arc<CompiledRegion>> {
        self.regions
            .iter()
            .find(|r| r.contains(pc))
            .map(|r| Arc::clone(r.value()))
    }

    /// Regions compiled from `method`.
    pub fn regions_for(&self, method: MethodId) -> Vec<Arc<CompiledRegion>> {
        self.regions
            .iter()
            .filter(|r| r.method().id() == method)
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Stop new calls into `region`.
    ///
    /// Unless the region was marked without counting recompiles, the
    /// method's decompile count goes up, and a method decompiled more than
    /// `recompilation_cutoff` times becomes not compilable. Returns `false`
    /// if the region was already not entrant.
    pub fn make_not_entrant(&self, region: &CompiledRegion, recompilation_cutoff: u32) -> bool {
        if !region.make_not_entrant() {
            return false;
        }
        self.counters.made_not_entrant.fetch_add(1, Ordering::Relaxed);
        if region.deopt_status() != DeoptStatus::DeoptimizeNoUpdate {
            let method = region.method();
            if let Some(mdo) = method.method_data() {
                if mdo.inc_decompile_count() > recompilation_cutoff {
                    method.set_not_compilable("decompile_count > per_method_recompilation_cutoff");
                }
            }
        }
        true
    }

    /// Regions marked for deoptimization at or below `generation`.
    pub fn marked_regions(&self, generation: u64) -> Vec<Arc<CompiledRegion>> {
        self.regions
            .iter()
            .filter(|r| r.marked_generation().is_some_and(|g| g <= generation))
            .map(|r| Arc::clone(r.value()))
            .collect()
    }

    /// Make every region marked at or below `generation` not entrant and
    /// record it as deoptimized. Returns the number of regions processed.
    pub fn make_marked_deoptimized(&self, generation: u64, recompilation_cutoff: u32) -> usize {
        let marked = self.marked_regions(generation);
        for region in &marked {
            self.make_not_entrant(region, recompilation_cutoff);
            region.set_deoptimized();
        }
        self.counters
            .deoptimized
            .fetch_add(marked.len() as u64, Ordering::Relaxed);
        marked.len()
    }

    pub fn stats(&self) -> CodeCacheStats {
        CodeCacheStats {
            installed: self.counters.installed.load(Ordering::Relaxed),
            made_not_entrant: self.counters.made_not_entrant.load(Ordering::Relaxed),
            deoptimized: self.counters.deoptimized.load(Ordering::Relaxed),
        }
    }
}
