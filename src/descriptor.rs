//! Descriptor layout and set pre-allocation.
//!
//! Node implementations with the `declare_descriptors` capability hand their
//! reflected layouts to the cache during compile. Layouts are canonicalized
//! and deduplicated by content hash; pools are sized to the sum of declared
//! set estimates plus headroom, and every set is allocated up front so the
//! execute path performs no descriptor allocation at all.

use std::hash::{Hash, Hasher};

use fxhash::{FxHashMap, FxHasher64};
use log::debug;
use smallvec::SmallVec;

use crate::handle::{DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, ShaderStageFlags};
use crate::traits::GpuBackend;

/// Descriptor binding class, as reflected from shaders.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DescriptorType {
    Sampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    InputAttachment,
}

pub const DESCRIPTOR_TYPE_COUNT: usize = 6;

impl DescriptorType {
    fn index(self) -> usize {
        match self {
            DescriptorType::Sampler => 0,
            DescriptorType::SampledImage => 1,
            DescriptorType::StorageImage => 2,
            DescriptorType::UniformBuffer => 3,
            DescriptorType::StorageBuffer => 4,
            DescriptorType::InputAttachment => 5,
        }
    }

    fn from_index(index: usize) -> DescriptorType {
        match index {
            0 => DescriptorType::Sampler,
            1 => DescriptorType::SampledImage,
            2 => DescriptorType::StorageImage,
            3 => DescriptorType::UniformBuffer,
            4 => DescriptorType::StorageBuffer,
            _ => DescriptorType::InputAttachment,
        }
    }
}

/// One entry (binding) in a descriptor set layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DescriptorBinding {
    /// Binding index.
    pub binding: u32,
    pub descriptor_type: DescriptorType,
    /// Which shader stages will see this descriptor.
    pub stage_flags: ShaderStageFlags,
    /// Number of descriptors in the binding.
    pub count: u32,
}

/// Content-addressed identity of a canonicalized layout.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LayoutHash(pub u64);

/// A node's descriptor requirements, collected during compile.
#[derive(Clone, Debug)]
pub struct DescriptorDeclaration {
    pub bindings: Vec<DescriptorBinding>,
    pub estimated_set_count: u32,
}

struct CachedLayout {
    handle: DescriptorSetLayoutHandle,
    bindings: Vec<DescriptorBinding>,
    /// Sum of set estimates declared against this layout this compile.
    estimate: u32,
    /// Pre-allocated sets, popped during execute.
    free_sets: Vec<DescriptorSetHandle>,
    allocated: u32,
}

/// Canonicalizes a binding list: sorted by binding index, no duplicates.
/// Returns `None` when two entries claim the same binding.
fn canonicalize(bindings: &[DescriptorBinding]) -> Option<Vec<DescriptorBinding>> {
    let mut sorted: Vec<DescriptorBinding> = bindings.to_vec();
    sorted.sort_by_key(|b| b.binding);
    for pair in sorted.windows(2) {
        if pair[0].binding == pair[1].binding {
            return None;
        }
    }
    Some(sorted)
}

fn content_hash(bindings: &[DescriptorBinding]) -> LayoutHash {
    let mut hasher = FxHasher64::default();
    for b in bindings {
        b.binding.hash(&mut hasher);
        b.descriptor_type.hash(&mut hasher);
        b.stage_flags.bits().hash(&mut hasher);
        b.count.hash(&mut hasher);
    }
    LayoutHash(hasher.finish())
}

/// Extra sets allocated on top of the declared estimates, in percent.
const POOL_HEADROOM_PCT: u32 = 25;

pub struct DescriptorCache {
    layouts: FxHashMap<LayoutHash, CachedLayout>,
    pools: Vec<DescriptorPoolHandle>,
}

impl DescriptorCache {
    pub fn new() -> DescriptorCache {
        DescriptorCache {
            layouts: FxHashMap::default(),
            pools: Vec::new(),
        }
    }

    /// Returns the layout handle for `bindings`, creating and caching it on
    /// first sight. Identical binding lists (after canonicalization) share
    /// one layout.
    pub fn request_layout(
        &mut self,
        backend: &dyn GpuBackend,
        bindings: &[DescriptorBinding],
    ) -> Option<(LayoutHash, DescriptorSetLayoutHandle)> {
        let canonical = canonicalize(bindings)?;
        let hash = content_hash(&canonical);
        if let Some(cached) = self.layouts.get(&hash) {
            return Some((hash, cached.handle));
        }
        let handle = backend.create_descriptor_set_layout(&canonical);
        debug!("descriptor cache: new layout {:?} ({} bindings)", hash, canonical.len());
        self.layouts.insert(
            hash,
            CachedLayout {
                handle,
                bindings: canonical,
                estimate: 0,
                free_sets: Vec::new(),
                allocated: 0,
            },
        );
        Some((hash, self.layouts[&hash].handle))
    }

    /// Looks up a cached layout's canonical bindings by content hash.
    pub fn layout_bindings(&self, hash: LayoutHash) -> Option<&[DescriptorBinding]> {
        self.layouts.get(&hash).map(|l| l.bindings.as_slice())
    }

    /// Records a node's set-count estimate against a layout.
    pub fn declare_estimate(&mut self, hash: LayoutHash, set_count: u32) {
        if let Some(cached) = self.layouts.get_mut(&hash) {
            cached.estimate += set_count;
        }
    }

    /// Builds pools sized to the declared estimates plus headroom and
    /// pre-allocates every set. End of compile only.
    pub fn build_pools(&mut self, backend: &dyn GpuBackend) {
        let mut sizes = [0u32; DESCRIPTOR_TYPE_COUNT];
        let mut total_sets = 0u32;

        for cached in self.layouts.values() {
            let want = cached.estimate + cached.estimate * POOL_HEADROOM_PCT / 100;
            let missing = want.saturating_sub(cached.allocated);
            if missing == 0 {
                continue;
            }
            total_sets += missing;
            for b in &cached.bindings {
                sizes[b.descriptor_type.index()] += b.count * missing;
            }
        }
        if total_sets == 0 {
            return;
        }

        let pool_sizes: SmallVec<[(DescriptorType, u32); DESCRIPTOR_TYPE_COUNT]> = sizes
            .iter()
            .enumerate()
            .filter(|entry| *entry.1 > 0)
            .map(|(i, &n)| (DescriptorType::from_index(i), n))
            .collect();
        let pool = backend.create_descriptor_pool(&pool_sizes, total_sets);
        self.pools.push(pool);

        for cached in self.layouts.values_mut() {
            let want = cached.estimate + cached.estimate * POOL_HEADROOM_PCT / 100;
            let missing = want.saturating_sub(cached.allocated);
            if missing == 0 {
                continue;
            }
            cached.free_sets.reserve(missing as usize);
            backend.allocate_descriptor_sets(pool, cached.handle, missing, &mut cached.free_sets);
            cached.allocated += missing;
        }
        debug!(
            "descriptor cache: pooled {} sets across {} layouts",
            total_sets,
            self.layouts.len()
        );
    }

    /// Pops a pre-allocated set. Execute-path safe: no backend call, no
    /// allocation. `None` means the estimates were exceeded beyond headroom.
    pub fn take_set(&mut self, hash: LayoutHash) -> Option<DescriptorSetHandle> {
        self.layouts.get_mut(&hash)?.free_sets.pop()
    }

    /// Number of sets currently pre-allocated for `hash`.
    pub fn available_sets(&self, hash: LayoutHash) -> usize {
        self.layouts.get(&hash).map_or(0, |l| l.free_sets.len())
    }

    /// Resets per-compile estimates. Called at the start of each compile so
    /// re-declared estimates do not accumulate across invalidations.
    pub fn reset_estimates(&mut self) {
        for cached in self.layouts.values_mut() {
            cached.estimate = 0;
            cached.allocated = cached.free_sets.len() as u32;
        }
    }

    /// Flushes everything; graph cleanup only.
    pub fn flush(&mut self, backend: &dyn GpuBackend) {
        for pool in self.pools.drain(..) {
            backend.destroy_descriptor_pool(pool);
        }
        self.layouts.clear();
    }
}

impl Default for DescriptorCache {
    fn default() -> DescriptorCache {
        DescriptorCache::new()
    }
}
