//! The allocator stack.
//!
//! Every allocator implements one uniform operation set over *tags*: an
//! opaque small integer scoping a bag of allocations that is released as
//! a unit. Four concrete kinds exist —
//!
//! - [`linear::LinearAllocator`]: one pre-sized buffer, bump cursor
//! - [`malloc::MallocAllocator`]: per-object heap blocks per tag
//! - [`mremap::MremapAllocator`]: grow-in-place arena chains
//! - [`dedup::DedupAllocator`]: content-hash internment over a parent
//!
//! — composed by [`auto::AutoAllocator`] according to a scenario. The
//! builder consumes this stack as its storage fabric and never touches
//! the system allocator directly.
//!
//! Trait objects appear only at the composition seams (a dedup parent,
//! the registry's factories); everything inside is concrete. All methods
//! take `&self`: tag state uses interior mutability because distinct
//! tags of one allocator may be driven from different threads.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{LazyLock, RwLock};

use tracing::debug;

pub mod auto;
pub mod dedup;
pub mod linear;
pub mod malloc;
pub mod mremap;

pub use auto::{AutoAllocator, AutoConfig, AutoScenario};
pub use dedup::DedupAllocator;
pub use linear::LinearAllocator;
pub use malloc::MallocAllocator;
pub use mremap::MremapAllocator;

/// Opaque tag id scoping a group of allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocTag(pub(crate) u32);

impl AllocTag {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Allocator operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The allocator cannot satisfy the request.
    OutOfMemory,
    /// Size arithmetic would wrap.
    SizeOverflow,
    /// The tag is unknown or already released.
    InvalidTag,
    /// A configuration value is out of range.
    InvalidConfig,
    /// Alignment is zero, not a power of two, or too large.
    BadAlign,
    /// No free tag ids remain.
    TagLimit,
    /// Registry name collision or unknown allocator name.
    Registry,
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AllocError::OutOfMemory => "out of memory",
            AllocError::SizeOverflow => "size arithmetic overflow",
            AllocError::InvalidTag => "invalid allocation tag",
            AllocError::InvalidConfig => "invalid allocator configuration",
            AllocError::BadAlign => "bad alignment",
            AllocError::TagLimit => "no free tags",
            AllocError::Registry => "allocator registry error",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for AllocError {}

/// Per-tag creation parameters.
#[derive(Debug, Clone, Default)]
pub struct TagConfig {
    /// Expected total bytes; sizes initial arenas and hash tables.
    pub estimated_size: usize,
    /// Bytes reserved at the head of a single-area tag for an export
    /// header. Only meaningful for allocators that support single areas.
    pub reserve: usize,
}

/// One contiguous region backing part of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub base: usize,
    pub size: usize,
    pub used: usize,
}

/// Introspection snapshot for a tag.
#[derive(Debug, Clone, Default)]
pub struct TagInfo {
    pub free: usize,
    pub used: usize,
    pub total: usize,
    pub areas: Vec<Area>,
}

/// The one contiguous mapping of a single-area tag, for cache export.
#[derive(Debug, Clone, Copy)]
pub struct SingleArea {
    pub base: NonNull<u8>,
    /// Bytes in use, including the reserved header.
    pub size: usize,
    /// Reserved header bytes at the head.
    pub start_offset: usize,
    /// Full allocation size of the mapping.
    pub alloc_size: usize,
}

/// Uniform allocator operations.
///
/// Contract notes:
/// - every operation is side-effect-free on other tags;
/// - `free` and `release` may be no-ops (linear storage);
/// - `store` may intern: the returned pointer can be a previous store's;
/// - pointers stay valid until their tag is released or reset.
pub trait TagAllocator: Send + Sync {
    /// Short stable name ("linear", "mremap", ...).
    fn name(&self) -> &'static str;

    fn get_tag(&self, config: &TagConfig) -> Result<AllocTag, AllocError>;
    fn release_tag(&self, tag: AllocTag);

    /// Compact unused space; addresses already handed out stay valid.
    fn trim_tag(&self, _tag: AllocTag) {}

    /// Forget every allocation in the tag but keep its arenas for reuse.
    fn reset_tag(&self, tag: AllocTag);

    fn alloc(&self, tag: AllocTag, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Release one object where the allocator supports it.
    fn free(&self, _tag: AllocTag, _ptr: NonNull<u8>) {}

    /// Copy `bytes` in. Default is alloc + copy; dedup interns instead.
    fn store(&self, tag: AllocTag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        let dst = self.alloc(tag, bytes.len(), align)?;
        // SAFETY: `dst` is a fresh allocation of `bytes.len()` bytes that
        // cannot overlap a caller-visible slice.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
        }
        Some(dst)
    }

    /// Gathering store: the segments are copied back to back.
    fn storev(&self, tag: AllocTag, iov: &[&[u8]], align: usize) -> Option<NonNull<u8>> {
        let total: usize = {
            let mut sum = 0usize;
            for seg in iov {
                sum = sum.checked_add(seg.len())?;
            }
            sum
        };
        let dst = self.alloc(tag, total, align)?;
        let mut off = 0;
        for seg in iov {
            // SAFETY: `dst` spans `total` bytes; offsets were summed with
            // overflow checks above.
            unsafe {
                std::ptr::copy_nonoverlapping(seg.as_ptr(), dst.as_ptr().add(off), seg.len());
            }
            off += seg.len();
        }
        Some(dst)
    }

    /// Mark a prior `store` result unused. Refcount decrement for dedup,
    /// a no-op for storage without per-object lifetime.
    fn release(&self, _tag: AllocTag, _ptr: NonNull<u8>, _size: usize) {}

    /// Does `ptr` lie inside this allocator's storage for `tag`?
    fn contains(&self, tag: AllocTag, ptr: NonNull<u8>) -> bool;

    fn info(&self, tag: AllocTag) -> Option<TagInfo>;

    /// The tag's one contiguous mapping, when it physically is one.
    fn single_area(&self, _tag: AllocTag) -> Option<SingleArea> {
        None
    }

    /// Enumerate backing areas; returns the count appended to `out`.
    fn areas(&self, tag: AllocTag, out: &mut Vec<Area>) -> usize {
        match self.info(tag) {
            Some(info) => {
                let n = info.areas.len();
                out.extend(info.areas);
                n
            }
            None => 0,
        }
    }
}

/// Round `offset` up to `align` (a power of two). `None` on overflow.
pub(crate) fn align_up(offset: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    offset.checked_add(align - 1).map(|n| n & !(align - 1))
}

/// Is `align` acceptable for arena storage?
pub(crate) fn align_ok(align: usize) -> bool {
    align.is_power_of_two() && align <= 4096
}

// ---------------------------------------------------------------------------
// Factory registry
// ---------------------------------------------------------------------------

/// Construction parameters understood by every registered factory.
#[derive(Debug, Clone)]
pub struct AllocSpec {
    /// Scenario for the "auto" factory; others ignore it.
    pub scenario: AutoScenario,
    /// Expected total size of all tags, for initial sizing.
    pub estimated_max_size: usize,
}

impl Default for AllocSpec {
    fn default() -> Self {
        AllocSpec {
            scenario: AutoScenario::PerTagFree,
            estimated_max_size: 1 << 20,
        }
    }
}

/// Creates one allocator instance from a spec.
pub type AllocatorFactory = fn(&AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError>;

// The only process-wide mutable state: allocator factories by name.
// Initialised on first use; registration after startup is allowed but
// names are never replaced.
static REGISTRY: LazyLock<RwLock<HashMap<String, AllocatorFactory>>> = LazyLock::new(|| {
    let mut map: HashMap<String, AllocatorFactory> = HashMap::new();
    map.insert("linear".into(), factory_linear);
    map.insert("malloc".into(), factory_malloc);
    map.insert("mremap".into(), factory_mremap);
    map.insert("dedup".into(), factory_dedup);
    map.insert("auto".into(), factory_auto);
    RwLock::new(map)
});

fn factory_linear(spec: &AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError> {
    Ok(Box::new(LinearAllocator::new(linear::LinearConfig {
        size: spec.estimated_max_size,
        ..Default::default()
    })?))
}

fn factory_malloc(_spec: &AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError> {
    Ok(Box::new(MallocAllocator::new()))
}

fn factory_mremap(spec: &AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError> {
    Ok(Box::new(MremapAllocator::new(mremap::MremapConfig {
        min_arena: spec.estimated_max_size.max(mremap::MremapConfig::default().min_arena),
        ..Default::default()
    })?))
}

fn factory_dedup(spec: &AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError> {
    let parent = factory_mremap(spec)?;
    Ok(Box::new(DedupAllocator::new(
        parent,
        dedup::DedupConfig::sized_for(spec.estimated_max_size),
    )?))
}

fn factory_auto(spec: &AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError> {
    Ok(Box::new(AutoAllocator::new(auto::AutoConfig {
        scenario: spec.scenario,
        estimated_max_size: spec.estimated_max_size,
    })?))
}

/// Register a factory under a new unique name.
pub fn register_allocator(name: &str, factory: AllocatorFactory) -> Result<(), AllocError> {
    let mut map = REGISTRY.write().expect("allocator registry poisoned");
    if map.contains_key(name) {
        return Err(AllocError::Registry);
    }
    map.insert(name.to_owned(), factory);
    debug!(target: "loam::alloc", name, "allocator factory registered");
    Ok(())
}

/// Create an allocator by registered name.
pub fn create_allocator(name: &str, spec: &AllocSpec) -> Result<Box<dyn TagAllocator>, AllocError> {
    let factory = {
        let map = REGISTRY.read().expect("allocator registry poisoned");
        map.get(name).copied().ok_or(AllocError::Registry)?
    };
    let created = factory(spec)?;
    debug!(target: "loam::alloc", name, "allocator created");
    Ok(created)
}

/// Names currently registered, sorted.
pub fn registered_allocators() -> Vec<String> {
    let map = REGISTRY.read().expect("allocator registry poisoned");
    let mut names: Vec<String> = map.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), Some(0));
        assert_eq!(align_up(1, 8), Some(8));
        assert_eq!(align_up(8, 8), Some(8));
        assert_eq!(align_up(9, 16), Some(16));
        assert_eq!(align_up(usize::MAX, 16), None);
    }

    #[test]
    fn test_builtin_factories_present() {
        let names = registered_allocators();
        for expected in ["auto", "dedup", "linear", "malloc", "mremap"] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
    }
}
