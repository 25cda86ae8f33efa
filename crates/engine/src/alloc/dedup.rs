//! Dedup allocator: content-hash internment over a parent allocator.
//!
//! `store` hashes the bytes (xxHash64, per-allocator seed), probes an
//! optional Bloom prefilter, then walks the bucket chain of the active
//! table. A hit by `(hash, size, bytewise equal)` bumps the entry's
//! refcount and returns the canonical pointer; a miss stores in the
//! parent and links a fresh entry. `release` decrements and evicts at
//! zero. When the average chain length passes the trigger, entries are
//! rehashed into a scratch table at twice the bucket count and the
//! tables swap.
//!
//! Writers to one tag are serialised by a per-tag mutex — the engine's
//! regime is a single writer per tag, and the mutex makes the rebuild's
//! table swap trivially consistent. Canonical pointers handed out
//! earlier never move, so readers in other threads are unaffected.
//!
//! Entry nodes live in a dedicated parent sub-tag where the parent can
//! provide one; over a single-tag parent (linear) they fall back to a
//! private heap so the exportable area carries values only.

use std::collections::HashMap;
use std::hash::Hasher;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, RwLock};

use loam_core::IdBits;
use tracing::debug;
use twox_hash::XxHash64;

use super::{
    AllocError, AllocTag, Area, MallocAllocator, SingleArea, TagAllocator, TagConfig, TagInfo,
};

const MAX_TAGS: usize = 32;

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Initial bucket count; rounded up to a power of two.
    pub buckets: usize,
    /// Bloom filter size in bits; 0 disables the prefilter.
    pub bloom_bits: usize,
    /// Average chain length that triggers a table rebuild.
    pub chain_trigger: usize,
    /// Content hash seed.
    pub seed: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            buckets: 1024,
            bloom_bits: 8192,
            chain_trigger: 4,
            seed: 0x6c6f_616d,
        }
    }
}

impl DedupConfig {
    /// Size tables for an expected total of `estimated` content bytes.
    pub fn sized_for(estimated: usize) -> Self {
        // One bucket per ~256 bytes of expected content.
        let buckets = (estimated / 256).next_power_of_two().clamp(64, 1 << 20);
        DedupConfig {
            buckets,
            bloom_bits: buckets * 8,
            ..Default::default()
        }
    }
}

/// Bucket chain node; lives outside the exportable content area.
struct Entry {
    hash: u64,
    size: usize,
    /// Alignment the canonical copy was stored with. A hit requires at
    /// least the requested alignment, so equal bytes stored for
    /// differently-aligned records never share a pointer wrongly.
    align: usize,
    refs: usize,
    ptr: usize,
    next: *mut Entry,
}

/// Where entry nodes are allocated from.
enum EntrySource {
    /// A dedicated sub-tag of the parent allocator.
    ParentTag(AllocTag),
    /// Private heap, used when the parent cannot give a second tag.
    Heap(AllocTag),
}

struct Tables {
    active: Vec<*mut Entry>,
    /// Rebuild target; drained back to empty after every swap.
    scratch: Vec<*mut Entry>,
    count: usize,
    bloom: Vec<u64>,
    /// Recycled entry nodes.
    free: *mut Entry,
}

struct DedupTagState {
    parent_tag: AllocTag,
    entries: EntrySource,
    tables: Mutex<Tables>,
}

pub struct DedupAllocator {
    parent: Box<dyn TagAllocator>,
    entry_heap: MallocAllocator,
    cfg: DedupConfig,
    ids: IdBits,
    tags: RwLock<HashMap<u32, Arc<DedupTagState>>>,
}

// SAFETY: the raw entry pointers in `Tables` are only dereferenced while
// the owning tag's mutex is held; canonical content pointers are managed
// by the (Send + Sync) parent.
unsafe impl Send for DedupAllocator {}
unsafe impl Sync for DedupAllocator {}

impl DedupAllocator {
    pub fn new(parent: Box<dyn TagAllocator>, cfg: DedupConfig) -> Result<Self, AllocError> {
        if cfg.buckets == 0 || cfg.chain_trigger == 0 {
            return Err(AllocError::InvalidConfig);
        }
        Ok(DedupAllocator {
            parent,
            entry_heap: MallocAllocator::new(),
            cfg,
            ids: IdBits::new(MAX_TAGS),
            tags: RwLock::new(HashMap::new()),
        })
    }

    /// The wrapped parent allocator.
    pub fn parent(&self) -> &dyn TagAllocator {
        self.parent.as_ref()
    }

    fn state(&self, tag: AllocTag) -> Option<Arc<DedupTagState>> {
        self.tags.read().ok()?.get(&tag.0).cloned()
    }

    fn hash_bytes(&self, bytes: &[u8]) -> u64 {
        let mut h = XxHash64::with_seed(self.cfg.seed);
        h.write(bytes);
        h.finish()
    }

    fn alloc_entry(&self, state: &DedupTagState, tables: &mut Tables) -> Option<*mut Entry> {
        if !tables.free.is_null() {
            let node = tables.free;
            // SAFETY: free-list nodes were valid entries; chain is ours
            // under the tag mutex.
            tables.free = unsafe { (*node).next };
            return Some(node);
        }
        let layout_size = std::mem::size_of::<Entry>();
        let align = std::mem::align_of::<Entry>();
        let raw = match state.entries {
            EntrySource::ParentTag(t) => self.parent.alloc(t, layout_size, align)?,
            EntrySource::Heap(t) => self.entry_heap.alloc(t, layout_size, align)?,
        };
        Some(raw.as_ptr() as *mut Entry)
    }

    fn bloom_probe(tables: &Tables, hash: u64) -> bool {
        if tables.bloom.is_empty() {
            return true;
        }
        let bits = tables.bloom.len() * 64;
        let b1 = (hash % bits as u64) as usize;
        let b2 = (hash.rotate_right(32) % bits as u64) as usize;
        let set = |b: usize| tables.bloom[b / 64] & (1u64 << (b % 64)) != 0;
        set(b1) && set(b2)
    }

    fn bloom_set(tables: &mut Tables, hash: u64) {
        if tables.bloom.is_empty() {
            return;
        }
        let bits = tables.bloom.len() * 64;
        let b1 = (hash % bits as u64) as usize;
        let b2 = (hash.rotate_right(32) % bits as u64) as usize;
        tables.bloom[b1 / 64] |= 1u64 << (b1 % 64);
        tables.bloom[b2 / 64] |= 1u64 << (b2 % 64);
    }

    /// Rehash every entry into a scratch table at twice the buckets,
    /// then swap. Runs under the tag mutex; lookups from the owning
    /// writer always see one consistent table.
    fn rebuild(tables: &mut Tables) {
        let new_buckets = tables.active.len() * 2;
        tables.scratch = vec![std::ptr::null_mut(); new_buckets];
        let mask = new_buckets - 1;
        for bi in 0..tables.active.len() {
            let mut node = tables.active[bi];
            while !node.is_null() {
                // SAFETY: all chain nodes are live entries owned by this
                // tag, accessed under its mutex.
                unsafe {
                    let next = (*node).next;
                    let slot = ((*node).hash as usize) & mask;
                    (*node).next = tables.scratch[slot];
                    tables.scratch[slot] = node;
                    node = next;
                }
            }
            tables.active[bi] = std::ptr::null_mut();
        }
        std::mem::swap(&mut tables.active, &mut tables.scratch);
        tables.scratch.clear();
        debug!(target: "loam::dedup", buckets = new_buckets, "hash table rebuilt");
    }

    /// The shared store path: intern `bytes`, returning the canonical
    /// pointer.
    fn store_interned(
        &self,
        state: &DedupTagState,
        bytes: &[u8],
        align: usize,
    ) -> Option<NonNull<u8>> {
        let hash = self.hash_bytes(bytes);
        let mut tables = state.tables.lock().expect("dedup tag poisoned");
        let mask = tables.active.len() - 1;
        let slot = (hash as usize) & mask;

        if Self::bloom_probe(&tables, hash) {
            let mut node = tables.active[slot];
            while !node.is_null() {
                // SAFETY: chain nodes are live under the tag mutex; the
                // content pointer stays valid for the tag's lifetime.
                unsafe {
                    if (*node).hash == hash
                        && (*node).size == bytes.len()
                        && (*node).align >= align
                    {
                        let existing =
                            std::slice::from_raw_parts((*node).ptr as *const u8, (*node).size);
                        if existing == bytes {
                            (*node).refs += 1;
                            return Some(NonNull::new_unchecked((*node).ptr as *mut u8));
                        }
                    }
                    node = (*node).next;
                }
            }
        }

        // Miss: the parent gets the canonical copy.
        let content = self.parent.store(state.parent_tag, bytes, align)?;
        let node = self.alloc_entry(state, &mut tables)?;
        // SAFETY: `node` is a fresh (or recycled) entry slot owned by
        // this tag.
        unsafe {
            *node = Entry {
                hash,
                size: bytes.len(),
                align,
                refs: 1,
                ptr: content.as_ptr() as usize,
                next: tables.active[slot],
            };
        }
        tables.active[slot] = node;
        tables.count += 1;
        Self::bloom_set(&mut tables, hash);

        if tables.count > self.cfg.chain_trigger * tables.active.len() {
            Self::rebuild(&mut tables);
        }
        Some(content)
    }

    fn release_all(&self, state: &DedupTagState) {
        self.parent.release_tag(state.parent_tag);
        match state.entries {
            EntrySource::ParentTag(t) => self.parent.release_tag(t),
            EntrySource::Heap(t) => self.entry_heap.release_tag(t),
        }
    }
}

impl Drop for DedupAllocator {
    fn drop(&mut self) {
        // Outer layer first: drop index state, then the parent tags it
        // pointed into.
        let tags: Vec<Arc<DedupTagState>> = self
            .tags
            .get_mut()
            .expect("tag table poisoned")
            .drain()
            .map(|(_, v)| v)
            .collect();
        for state in tags {
            self.release_all(&state);
        }
    }
}

impl TagAllocator for DedupAllocator {
    fn name(&self) -> &'static str {
        "dedup"
    }

    fn get_tag(&self, config: &TagConfig) -> Result<AllocTag, AllocError> {
        let id = self.ids.alloc().ok_or(AllocError::TagLimit)? as u32;
        let parent_tag = self.parent.get_tag(config)?;
        let sub = self.parent.get_tag(&TagConfig::default())?;
        let entries = if sub == parent_tag {
            // Single-tag parent: keep index nodes out of the content
            // (and exportable) area.
            EntrySource::Heap(self.entry_heap.get_tag(&TagConfig::default())?)
        } else {
            EntrySource::ParentTag(sub)
        };
        let state = Arc::new(DedupTagState {
            parent_tag,
            entries,
            tables: Mutex::new(Tables {
                active: vec![std::ptr::null_mut(); self.cfg.buckets.next_power_of_two()],
                scratch: Vec::new(),
                count: 0,
                bloom: if self.cfg.bloom_bits > 0 {
                    vec![0u64; self.cfg.bloom_bits.div_ceil(64)]
                } else {
                    Vec::new()
                },
                free: std::ptr::null_mut(),
            }),
        });
        self.tags
            .write()
            .expect("tag table poisoned")
            .insert(id, state);
        Ok(AllocTag(id))
    }

    fn release_tag(&self, tag: AllocTag) {
        let removed = self.tags.write().expect("tag table poisoned").remove(&tag.0);
        if let Some(state) = removed {
            self.release_all(&state);
            self.ids.free(tag.index());
        }
    }

    fn trim_tag(&self, tag: AllocTag) {
        if let Some(state) = self.state(tag) {
            self.parent.trim_tag(state.parent_tag);
        }
    }

    fn reset_tag(&self, tag: AllocTag) {
        let Some(state) = self.state(tag) else {
            return;
        };
        let mut tables = state.tables.lock().expect("dedup tag poisoned");
        for slot in tables.active.iter_mut() {
            *slot = std::ptr::null_mut();
        }
        tables.count = 0;
        tables.free = std::ptr::null_mut();
        for word in tables.bloom.iter_mut() {
            *word = 0;
        }
        drop(tables);
        self.parent.reset_tag(state.parent_tag);
        match state.entries {
            EntrySource::ParentTag(t) => self.parent.reset_tag(t),
            EntrySource::Heap(t) => self.entry_heap.reset_tag(t),
        }
    }

    /// Plain allocation bypasses internment entirely.
    fn alloc(&self, tag: AllocTag, size: usize, align: usize) -> Option<NonNull<u8>> {
        let state = self.state(tag)?;
        self.parent.alloc(state.parent_tag, size, align)
    }

    fn free(&self, tag: AllocTag, ptr: NonNull<u8>) {
        if let Some(state) = self.state(tag) {
            self.parent.free(state.parent_tag, ptr);
        }
    }

    fn store(&self, tag: AllocTag, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        let state = self.state(tag)?;
        self.store_interned(&state, bytes, align)
    }

    fn storev(&self, tag: AllocTag, iov: &[&[u8]], align: usize) -> Option<NonNull<u8>> {
        let state = self.state(tag)?;
        let total: usize = {
            let mut sum = 0usize;
            for seg in iov {
                sum = sum.checked_add(seg.len())?;
            }
            sum
        };
        let mut flat = Vec::with_capacity(total);
        for seg in iov {
            flat.extend_from_slice(seg);
        }
        self.store_interned(&state, &flat, align)
    }

    fn release(&self, tag: AllocTag, ptr: NonNull<u8>, size: usize) {
        let Some(state) = self.state(tag) else {
            return;
        };
        // Rehash the content to find its bucket.
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
        let hash = self.hash_bytes(bytes);
        let mut tables = state.tables.lock().expect("dedup tag poisoned");
        let mask = tables.active.len() - 1;
        let slot = (hash as usize) & mask;
        let mut link: *mut *mut Entry = &mut tables.active[slot];
        // SAFETY: chain surgery under the tag mutex.
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).ptr == ptr.as_ptr() as usize {
                    (*node).refs -= 1;
                    if (*node).refs == 0 {
                        *link = (*node).next;
                        tables.count -= 1;
                        (*node).next = tables.free;
                        tables.free = node;
                        self.parent.release(state.parent_tag, ptr, size);
                        self.parent.free(state.parent_tag, ptr);
                    }
                    return;
                }
                link = &raw mut (*node).next;
            }
        }
    }

    fn contains(&self, tag: AllocTag, ptr: NonNull<u8>) -> bool {
        match self.state(tag) {
            Some(state) => self.parent.contains(state.parent_tag, ptr),
            None => false,
        }
    }

    fn info(&self, tag: AllocTag) -> Option<TagInfo> {
        let state = self.state(tag)?;
        self.parent.info(state.parent_tag)
    }

    fn single_area(&self, tag: AllocTag) -> Option<SingleArea> {
        let state = self.state(tag)?;
        self.parent.single_area(state.parent_tag)
    }

    fn areas(&self, tag: AllocTag, out: &mut Vec<Area>) -> usize {
        match self.state(tag) {
            Some(state) => self.parent.areas(state.parent_tag, out),
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::malloc::MallocAllocator;
    use super::*;

    fn make() -> DedupAllocator {
        DedupAllocator::new(
            Box::new(MallocAllocator::new()),
            DedupConfig {
                buckets: 8,
                bloom_bits: 512,
                chain_trigger: 2,
                seed: 42,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_identical_stores_intern() {
        let a = make();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.store(tag, b"hello interning world", 8).unwrap();
        let p2 = a.store(tag, b"hello interning world", 8).unwrap();
        assert_eq!(p1, p2);
        let p3 = a.store(tag, b"different content here", 8).unwrap();
        assert_ne!(p1, p3);
        a.release_tag(tag);
    }

    #[test]
    fn test_release_evicts_at_zero() {
        let a = make();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.store(tag, b"refcounted", 8).unwrap();
        let p2 = a.store(tag, b"refcounted", 8).unwrap();
        assert_eq!(p1, p2);
        a.release(tag, p1, 10);
        // Still interned: one reference left.
        let p3 = a.store(tag, b"refcounted", 8).unwrap();
        assert_eq!(p1, p3);
        a.release(tag, p1, 10);
        a.release(tag, p1, 10);
        // Fully released; a fresh store may land anywhere but must work.
        let p4 = a.store(tag, b"refcounted", 8).unwrap();
        let got = unsafe { std::slice::from_raw_parts(p4.as_ptr(), 10) };
        assert_eq!(got, b"refcounted");
        a.release_tag(tag);
    }

    #[test]
    fn test_rebuild_preserves_entries() {
        let a = make(); // 8 buckets, trigger 2 -> rebuild at ~17 entries
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let mut ptrs = Vec::new();
        for i in 0..100u32 {
            let bytes = format!("entry number {i:04}");
            ptrs.push((bytes.clone(), a.store(tag, bytes.as_bytes(), 8).unwrap()));
        }
        // Every prior store still interns to the same pointer.
        for (bytes, p) in &ptrs {
            assert_eq!(a.store(tag, bytes.as_bytes(), 8).unwrap(), *p);
        }
        a.release_tag(tag);
    }

    #[test]
    fn test_storev_matches_store() {
        let a = make();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let whole = a.store(tag, b"ab-cd-ef", 8).unwrap();
        let gathered = a.storev(tag, &[b"ab-", b"cd-", b"ef"], 8).unwrap();
        assert_eq!(whole, gathered);
        a.release_tag(tag);
    }

    #[test]
    fn test_alloc_bypasses_interning() {
        let a = make();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.alloc(tag, 16, 8).unwrap();
        let p2 = a.alloc(tag, 16, 8).unwrap();
        assert_ne!(p1, p2);
        assert!(a.contains(tag, p1));
        a.release_tag(tag);
    }

    #[test]
    fn test_zero_length_store() {
        let a = make();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.store(tag, b"", 1).unwrap();
        let p2 = a.store(tag, b"", 1).unwrap();
        assert_eq!(p1, p2);
        a.release_tag(tag);
    }
}
