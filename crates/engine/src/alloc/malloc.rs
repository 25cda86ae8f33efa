//! Malloc allocator: per-object heap blocks, released per tag.
//!
//! Each tag keeps a singly linked list of live blocks behind a
//! test-and-set spinlock. The lock only covers list surgery; the block
//! payloads come from the system allocator. Up to [`MAX_TAGS`] tags,
//! tracked by an ID bitmap.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use loam_core::IdBits;
use tracing::debug;

use super::{align_ok, AllocError, AllocTag, Area, TagAllocator, TagConfig, TagInfo};

/// Tag capacity of one malloc allocator.
pub const MAX_TAGS: usize = 32;

/// Live-block list node. The payload is a separate system allocation.
struct Block {
    ptr: *mut u8,
    size: usize,
    align: usize,
    next: *mut Block,
}

struct MallocTag {
    lock: AtomicBool,
    head: UnsafeCell<*mut Block>,
    used: AtomicUsize,
}

impl MallocTag {
    fn new() -> Self {
        MallocTag {
            lock: AtomicBool::new(false),
            head: UnsafeCell::new(std::ptr::null_mut()),
            used: AtomicUsize::new(0),
        }
    }
}

/// Holds the tag's spinlock for the guard's lifetime.
struct SpinGuard<'a>(&'a AtomicBool);

impl<'a> SpinGuard<'a> {
    fn lock(flag: &'a AtomicBool) -> Self {
        while flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard(flag)
    }
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MallocAllocator {
    tags: [MallocTag; MAX_TAGS],
    ids: IdBits,
}

// SAFETY: the raw list heads are only touched while the per-tag spinlock
// is held; payload pointers are never aliased across tags.
unsafe impl Send for MallocAllocator {}
unsafe impl Sync for MallocAllocator {}

impl MallocAllocator {
    pub fn new() -> Self {
        MallocAllocator {
            tags: std::array::from_fn(|_| MallocTag::new()),
            ids: IdBits::new(MAX_TAGS),
        }
    }

    fn tag_state(&self, tag: AllocTag) -> Option<&MallocTag> {
        if tag.index() < MAX_TAGS && self.ids.is_used(tag.index()) {
            Some(&self.tags[tag.index()])
        } else {
            None
        }
    }

    /// Free every block of a tag. Caller decides whether to free the id.
    fn drain(&self, state: &MallocTag) {
        let _guard = SpinGuard::lock(&state.lock);
        // SAFETY: the spinlock serialises all access to the list head.
        let mut node = unsafe { *state.head.get() };
        while !node.is_null() {
            // SAFETY: nodes and payloads were allocated in `alloc` with
            // the recorded layouts and are owned by this list.
            unsafe {
                let block = Box::from_raw(node);
                std::alloc::dealloc(
                    block.ptr,
                    Layout::from_size_align_unchecked(block.size, block.align),
                );
                node = block.next;
            }
        }
        // SAFETY: as above, still under the lock.
        unsafe { *state.head.get() = std::ptr::null_mut() };
        state.used.store(0, Ordering::Release);
    }
}

impl Default for MallocAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MallocAllocator {
    fn drop(&mut self) {
        for state in &self.tags {
            self.drain(state);
        }
    }
}

impl TagAllocator for MallocAllocator {
    fn name(&self) -> &'static str {
        "malloc"
    }

    fn get_tag(&self, _config: &TagConfig) -> Result<AllocTag, AllocError> {
        match self.ids.alloc() {
            Some(id) => Ok(AllocTag(id as u32)),
            None => Err(AllocError::TagLimit),
        }
    }

    fn release_tag(&self, tag: AllocTag) {
        if let Some(state) = self.tag_state(tag) {
            let freed = state.used.load(Ordering::Acquire);
            self.drain(state);
            self.ids.free(tag.index());
            debug!(target: "loam::malloc", tag = tag.index(), freed, "tag released");
        }
    }

    fn reset_tag(&self, tag: AllocTag) {
        if let Some(state) = self.tag_state(tag) {
            self.drain(state);
        }
    }

    fn alloc(&self, tag: AllocTag, size: usize, align: usize) -> Option<NonNull<u8>> {
        let state = self.tag_state(tag)?;
        if !align_ok(align) {
            return None;
        }
        let size = size.max(1);
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: `layout` has non-zero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr)?;

        let _guard = SpinGuard::lock(&state.lock);
        // SAFETY: list head is protected by the spinlock.
        unsafe {
            let node = Box::into_raw(Box::new(Block {
                ptr: ptr.as_ptr(),
                size,
                align,
                next: *state.head.get(),
            }));
            *state.head.get() = node;
        }
        state.used.fetch_add(size, Ordering::Release);
        Some(ptr)
    }

    fn free(&self, tag: AllocTag, ptr: NonNull<u8>) {
        let Some(state) = self.tag_state(tag) else {
            return;
        };
        let _guard = SpinGuard::lock(&state.lock);
        // SAFETY: list surgery under the spinlock; the block was linked
        // in by `alloc` and is removed exactly once.
        unsafe {
            let mut link = state.head.get();
            while !(*link).is_null() {
                let node = *link;
                if (*node).ptr == ptr.as_ptr() {
                    *link = (*node).next;
                    let block = Box::from_raw(node);
                    state.used.fetch_sub(block.size, Ordering::Release);
                    std::alloc::dealloc(
                        block.ptr,
                        Layout::from_size_align_unchecked(block.size, block.align),
                    );
                    return;
                }
                link = &raw mut (*node).next;
            }
        }
    }

    fn contains(&self, tag: AllocTag, ptr: NonNull<u8>) -> bool {
        let Some(state) = self.tag_state(tag) else {
            return false;
        };
        let addr = ptr.as_ptr() as usize;
        let _guard = SpinGuard::lock(&state.lock);
        // SAFETY: under the spinlock.
        unsafe {
            let mut node = *state.head.get();
            while !node.is_null() {
                let base = (*node).ptr as usize;
                if addr >= base && addr < base + (*node).size {
                    return true;
                }
                node = (*node).next;
            }
        }
        false
    }

    fn info(&self, tag: AllocTag) -> Option<TagInfo> {
        let state = self.tag_state(tag)?;
        let mut areas = Vec::new();
        let _guard = SpinGuard::lock(&state.lock);
        // SAFETY: under the spinlock.
        unsafe {
            let mut node = *state.head.get();
            while !node.is_null() {
                areas.push(Area {
                    base: (*node).ptr as usize,
                    size: (*node).size,
                    used: (*node).size,
                });
                node = (*node).next;
            }
        }
        let used = state.used.load(Ordering::Acquire);
        Some(TagInfo {
            free: 0,
            used,
            total: used,
            areas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_free_accounting() {
        let a = MallocAllocator::new();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.alloc(tag, 100, 8).unwrap();
        let p2 = a.alloc(tag, 50, 8).unwrap();
        assert_eq!(a.info(tag).unwrap().used, 150);
        assert!(a.contains(tag, p1));
        a.free(tag, p1);
        assert_eq!(a.info(tag).unwrap().used, 50);
        assert!(!a.contains(tag, p1));
        assert!(a.contains(tag, p2));
        a.release_tag(tag);
    }

    #[test]
    fn test_tag_isolation() {
        let a = MallocAllocator::new();
        let t1 = a.get_tag(&TagConfig::default()).unwrap();
        let t2 = a.get_tag(&TagConfig::default()).unwrap();
        assert_ne!(t1, t2);
        let p = a.alloc(t1, 32, 8).unwrap();
        assert!(a.contains(t1, p));
        assert!(!a.contains(t2, p));
        a.release_tag(t1);
        assert!(a.info(t1).is_none());
        assert!(a.info(t2).is_some());
        a.release_tag(t2);
    }

    #[test]
    fn test_tag_limit() {
        let a = MallocAllocator::new();
        let mut tags = Vec::new();
        for _ in 0..MAX_TAGS {
            tags.push(a.get_tag(&TagConfig::default()).unwrap());
        }
        assert_eq!(a.get_tag(&TagConfig::default()), Err(AllocError::TagLimit));
        for t in tags {
            a.release_tag(t);
        }
        assert!(a.get_tag(&TagConfig::default()).is_ok());
    }

    #[test]
    fn test_release_tag_frees_everything() {
        let a = MallocAllocator::new();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        for _ in 0..10 {
            a.alloc(tag, 64, 16).unwrap();
        }
        a.release_tag(tag);
        // Id is reusable and the fresh tag starts empty.
        let tag2 = a.get_tag(&TagConfig::default()).unwrap();
        assert_eq!(a.info(tag2).unwrap().used, 0);
    }
}
