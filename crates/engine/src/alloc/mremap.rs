//! Mremap allocator: grow-in-place arena chains.
//!
//! Per tag, arenas form a singly linked list, newest first. Each arena
//! is one anonymous mapping: a small header (list link, size, bump
//! cursor, flags) followed by payload. Allocation bumps the cursor with
//! a CAS; when an arena runs out the allocator first tries to grow the
//! mapping in place — `mremap` with `MREMAP_MAYMOVE` off on Linux, a
//! fixed-address hint mapping appended at the tail elsewhere — and only
//! then chains a new arena, sized by the grow ratio and capped by the
//! balloon ratio. Oversized requests bypass arenas and get dedicated
//! mappings.
//!
//! Arena flags and cursors are atomics: several threads may append to
//! one tag, and publication of a grown size is a release store. The
//! slow paths (grow, trim, arena creation) resolve contention with CAS
//! loops that spin with a CPU relax hint.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use loam_core::IdBits;
use tracing::debug;

use super::{align_ok, align_up, AllocError, AllocTag, Area, TagAllocator, TagConfig, TagInfo};

const MAX_TAGS: usize = 64;

// Arena flags.
const FULL: u32 = 1 << 0;
const GROWING: u32 = 1 << 1;
const CANT_GROW: u32 = 1 << 2;

/// Arena header, stored at the start of its mapping.
#[repr(C)]
struct ArenaHdr {
    /// Address of the next (older) arena's header; 0 terminates.
    next: AtomicUsize,
    /// Current mapping size, including this header.
    size: AtomicUsize,
    /// Next free offset from the mapping base.
    cursor: AtomicUsize,
    flags: AtomicU32,
    _pad: u32,
}

/// Payload starts right after the header.
const HDR_SIZE: usize = 32;
const _: () = assert!(std::mem::size_of::<ArenaHdr>() == HDR_SIZE);

#[derive(Debug, Clone)]
pub struct MremapConfig {
    /// Smallest arena mapping.
    pub min_arena: usize,
    /// New/grown arena size as a multiple of the previous size.
    pub grow_ratio: f64,
    /// Hard cap on growth as a multiple of the previous size.
    pub balloon_ratio: f64,
    /// Requests at or above this size get a dedicated mapping.
    pub big_alloc: usize,
    /// Trim unmaps an empty non-head arena larger than this.
    pub empty_threshold: usize,
    /// Test hook: skip `mremap` and exercise the fixed-address-hint
    /// fallback even where `mremap` exists.
    pub force_fallback_grow: bool,
}

impl Default for MremapConfig {
    fn default() -> Self {
        MremapConfig {
            min_arena: 256 * 1024,
            grow_ratio: 1.5,
            balloon_ratio: 8.0,
            big_alloc: 1024 * 1024,
            empty_threshold: 64 * 1024,
            force_fallback_grow: false,
        }
    }
}

struct BigAlloc {
    base: usize,
    map_size: usize,
    used: usize,
}

struct MremapTagState {
    /// Newest arena's header address; 0 until first allocation.
    head: AtomicUsize,
    /// Dedicated mappings for oversized requests.
    big: Mutex<Vec<BigAlloc>>,
    /// First-arena size for this tag.
    first_arena: usize,
}

pub struct MremapAllocator {
    cfg: MremapConfig,
    page: usize,
    ids: IdBits,
    tags: RwLock<HashMap<u32, Arc<MremapTagState>>>,
}

// SAFETY: arena headers are reached only through tag state this
// allocator owns; all header fields are atomics and mapping lifetime is
// tied to tag release under the same ownership.
unsafe impl Send for MremapAllocator {}
unsafe impl Sync for MremapAllocator {}

impl MremapAllocator {
    pub fn new(cfg: MremapConfig) -> Result<Self, AllocError> {
        if cfg.grow_ratio < 1.0 || cfg.balloon_ratio < cfg.grow_ratio {
            return Err(AllocError::InvalidConfig);
        }
        // SAFETY: sysconf with a valid name has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            return Err(AllocError::InvalidConfig);
        }
        Ok(MremapAllocator {
            cfg,
            page: page as usize,
            ids: IdBits::new(MAX_TAGS),
            tags: RwLock::new(HashMap::new()),
        })
    }

    fn round_page(&self, n: usize) -> Option<usize> {
        align_up(n, self.page)
    }

    fn state(&self, tag: AllocTag) -> Option<Arc<MremapTagState>> {
        self.tags.read().ok()?.get(&tag.0).cloned()
    }

    /// Map fresh anonymous pages.
    fn map_pages(&self, len: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous private mapping with no address constraint.
        let p = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return None;
        }
        NonNull::new(p as *mut u8)
    }

    fn unmap(&self, base: usize, len: usize) {
        // SAFETY: `base/len` always name a mapping this allocator created
        // and still owns.
        unsafe {
            libc::munmap(base as *mut libc::c_void, len);
        }
    }

    /// Try to extend the arena mapping in place to `new_size` bytes.
    fn grow_in_place(&self, base: usize, old_size: usize, new_size: usize) -> bool {
        #[cfg(target_os = "linux")]
        if !self.cfg.force_fallback_grow {
            // SAFETY: `base` is the start of an `old_size`-byte mapping we
            // own; flags 0 forbid the kernel from moving it.
            let p = unsafe {
                libc::mremap(base as *mut libc::c_void, old_size, new_size, 0)
            };
            return p != libc::MAP_FAILED;
        }
        // No mremap (or forced fallback): ask for pages right after the
        // tail and check whether the kernel honoured the hint.
        let tail = base + old_size;
        let extra = new_size - old_size;
        #[cfg(target_os = "linux")]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        // SAFETY: hint address; never MAP_FIXED, so no existing mapping
        // can be clobbered.
        let p = unsafe {
            libc::mmap(
                tail as *mut libc::c_void,
                extra,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return false;
        }
        if p as usize != tail {
            // Hint not honoured; give the stray mapping back.
            self.unmap(p as usize, extra);
            return false;
        }
        true
    }

    /// Create an arena of at least `payload + HDR_SIZE` bytes and link it
    /// as the new head. Returns the header address.
    fn new_arena(&self, state: &MremapTagState, min_payload: usize) -> Option<usize> {
        let prev = state.head.load(Ordering::Acquire);
        let base_size = if prev == 0 {
            state.first_arena
        } else {
            // SAFETY: `prev` is a live arena header.
            let prev_size = unsafe { &*(prev as *const ArenaHdr) }.size.load(Ordering::Acquire);
            ((prev_size as f64 * self.cfg.grow_ratio) as usize)
                .min((prev_size as f64 * self.cfg.balloon_ratio) as usize)
        };
        let wanted = base_size
            .max(self.cfg.min_arena)
            .max(min_payload.checked_add(HDR_SIZE)?);
        let map_size = self.round_page(wanted)?;
        let base = self.map_pages(map_size)?;
        let addr = base.as_ptr() as usize;
        debug!(target: "loam::mremap", size = map_size, "new arena");
        // SAFETY: fresh zero mapping, large enough for the header.
        unsafe {
            let hdr = addr as *mut ArenaHdr;
            (*hdr).next.store(prev, Ordering::Relaxed);
            (*hdr).size.store(map_size, Ordering::Relaxed);
            (*hdr).cursor.store(HDR_SIZE, Ordering::Relaxed);
            (*hdr).flags.store(0, Ordering::Relaxed);
        }
        match state
            .head
            .compare_exchange(prev, addr, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Some(addr),
            Err(_) => {
                // Another thread installed an arena first; use theirs.
                self.unmap(addr, map_size);
                Some(state.head.load(Ordering::Acquire))
            }
        }
    }

    /// Bump-allocate inside one arena. `None` when it cannot fit.
    fn try_bump(&self, hdr_addr: usize, size: usize, align: usize) -> Option<NonNull<u8>> {
        // SAFETY: header address comes from a live arena chain.
        let hdr = unsafe { &*(hdr_addr as *const ArenaHdr) };
        let mut cur = hdr.cursor.load(Ordering::Relaxed);
        loop {
            let start = align_up(cur, align)?;
            let end = start.checked_add(size)?;
            if end > hdr.size.load(Ordering::Acquire) {
                return None;
            }
            match hdr
                .cursor
                .compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    // SAFETY: offset is inside the mapping.
                    return Some(unsafe {
                        NonNull::new_unchecked((hdr_addr + start) as *mut u8)
                    });
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Grow the head arena so `size @ align` fits. Returns false when a
    /// new arena is needed instead.
    fn try_grow(&self, hdr_addr: usize, size: usize, align: usize) -> bool {
        // SAFETY: live arena header.
        let hdr = unsafe { &*(hdr_addr as *const ArenaHdr) };
        loop {
            let flags = hdr.flags.load(Ordering::Acquire);
            if flags & (FULL | CANT_GROW) != 0 {
                return false;
            }
            if flags & GROWING != 0 {
                // Another thread is growing; wait for its verdict.
                std::hint::spin_loop();
                continue;
            }
            if hdr
                .flags
                .compare_exchange_weak(flags, flags | GROWING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            break;
        }

        let old_size = hdr.size.load(Ordering::Acquire);
        let cur = hdr.cursor.load(Ordering::Acquire);
        let needed = match align_up(cur, align).and_then(|s| s.checked_add(size)) {
            Some(n) => n,
            None => {
                hdr.flags.fetch_and(!GROWING, Ordering::AcqRel);
                return false;
            }
        };
        let target = ((old_size as f64 * self.cfg.grow_ratio) as usize).max(needed);
        let capped = (old_size as f64 * self.cfg.balloon_ratio) as usize;
        let grown = self.round_page(target.min(capped.max(needed)));

        let ok = match grown {
            Some(new_size) if new_size > old_size => {
                self.grow_in_place(hdr_addr, old_size, new_size).then(|| {
                    hdr.size.store(new_size, Ordering::Release);
                    debug!(
                        target: "loam::mremap",
                        old = old_size,
                        new = new_size,
                        "arena grown in place"
                    );
                })
                .is_some()
            }
            _ => false,
        };
        if ok {
            hdr.flags.fetch_and(!GROWING, Ordering::AcqRel);
        } else {
            hdr.flags
                .fetch_or(FULL | CANT_GROW, Ordering::AcqRel);
            hdr.flags.fetch_and(!GROWING, Ordering::AcqRel);
        }
        ok
    }

    fn drop_tag_storage(&self, state: &MremapTagState) {
        let mut addr = state.head.swap(0, Ordering::AcqRel);
        while addr != 0 {
            // SAFETY: walking the owned chain; each arena unmapped once.
            let (next, size) = unsafe {
                let hdr = &*(addr as *const ArenaHdr);
                (hdr.next.load(Ordering::Acquire), hdr.size.load(Ordering::Acquire))
            };
            self.unmap(addr, size);
            addr = next;
        }
        let mut big = state.big.lock().expect("big-alloc list poisoned");
        for b in big.drain(..) {
            self.unmap(b.base, b.map_size);
        }
    }
}

impl Drop for MremapAllocator {
    fn drop(&mut self) {
        let tags = self.tags.get_mut().expect("tag table poisoned");
        let states: Vec<_> = tags.values().cloned().collect();
        tags.clear();
        for state in &states {
            self.drop_tag_storage(state);
        }
    }
}

impl TagAllocator for MremapAllocator {
    fn name(&self) -> &'static str {
        "mremap"
    }

    fn get_tag(&self, config: &TagConfig) -> Result<AllocTag, AllocError> {
        let id = self.ids.alloc().ok_or(AllocError::TagLimit)? as u32;
        let first_arena = if config.estimated_size > 0 {
            self.round_page(
                config
                    .estimated_size
                    .checked_add(HDR_SIZE)
                    .ok_or(AllocError::SizeOverflow)?,
            )
            .ok_or(AllocError::SizeOverflow)?
        } else {
            self.cfg.min_arena
        };
        let state = Arc::new(MremapTagState {
            head: AtomicUsize::new(0),
            big: Mutex::new(Vec::new()),
            first_arena,
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
            self.drop_tag_storage(&state);
            self.ids.free(tag.index());
        }
    }

    fn trim_tag(&self, tag: AllocTag) {
        let Some(state) = self.state(tag) else {
            return;
        };
        let head = state.head.load(Ordering::Acquire);
        let mut prev: usize = 0;
        let mut addr = head;
        while addr != 0 {
            // SAFETY: live arena chain owned by this tag.
            let hdr = unsafe { &*(addr as *const ArenaHdr) };
            let next = hdr.next.load(Ordering::Acquire);
            let size = hdr.size.load(Ordering::Acquire);
            let cursor = hdr.cursor.load(Ordering::Acquire);

            let empty = cursor <= HDR_SIZE;
            if empty && addr != head && size >= self.cfg.empty_threshold {
                // Unlink and unmap a cold empty arena.
                // SAFETY: `prev` is the live predecessor in the chain.
                unsafe {
                    (*(prev as *const ArenaHdr)).next.store(next, Ordering::Release);
                }
                debug!(target: "loam::mremap", size, "trim unmapped empty arena");
                self.unmap(addr, size);
                addr = next;
                continue;
            }

            // Return clean tail pages to the kernel, keep the mapping.
            if let Some(keep) = self.round_page(cursor) {
                if size > keep {
                    // SAFETY: the advised range is inside the mapping and
                    // past the cursor, so nothing live is dropped.
                    unsafe {
                        libc::madvise(
                            (addr + keep) as *mut libc::c_void,
                            size - keep,
                            libc::MADV_DONTNEED,
                        );
                    }
                }
            }
            prev = addr;
            addr = next;
        }
    }

    fn reset_tag(&self, tag: AllocTag) {
        let Some(state) = self.state(tag) else {
            return;
        };
        let mut addr = state.head.load(Ordering::Acquire);
        while addr != 0 {
            // SAFETY: live arena chain.
            let hdr = unsafe { &*(addr as *const ArenaHdr) };
            hdr.cursor.store(HDR_SIZE, Ordering::Release);
            // Growth verdicts survive a reset; fullness does not.
            hdr.flags.fetch_and(CANT_GROW, Ordering::AcqRel);
            addr = hdr.next.load(Ordering::Acquire);
        }
        let mut big = state.big.lock().expect("big-alloc list poisoned");
        for b in big.drain(..) {
            self.unmap(b.base, b.map_size);
        }
    }

    fn alloc(&self, tag: AllocTag, size: usize, align: usize) -> Option<NonNull<u8>> {
        if !align_ok(align) {
            return None;
        }
        let state = self.state(tag)?;

        if size >= self.cfg.big_alloc {
            let map_size = self.round_page(size)?;
            let base = self.map_pages(map_size)?;
            state.big.lock().expect("big-alloc list poisoned").push(BigAlloc {
                base: base.as_ptr() as usize,
                map_size,
                used: size,
            });
            debug!(target: "loam::mremap", size, "dedicated big mapping");
            return Some(base);
        }

        loop {
            let head = state.head.load(Ordering::Acquire);
            if head == 0 {
                self.new_arena(&state, size.checked_add(align)?)?;
                continue;
            }
            if let Some(p) = self.try_bump(head, size, align) {
                return Some(p);
            }
            if self.try_grow(head, size, align) {
                continue;
            }
            // Head is full and cannot grow; chain a new arena sized with
            // alignment headroom. The CAS inside tolerates a racing
            // creator.
            self.new_arena(&state, size.checked_add(align)?)?;
        }
    }

    fn contains(&self, tag: AllocTag, ptr: NonNull<u8>) -> bool {
        let Some(state) = self.state(tag) else {
            return false;
        };
        let addr = ptr.as_ptr() as usize;
        let mut cur = state.head.load(Ordering::Acquire);
        while cur != 0 {
            // SAFETY: live arena chain.
            let hdr = unsafe { &*(cur as *const ArenaHdr) };
            let cursor = hdr.cursor.load(Ordering::Acquire);
            if addr >= cur + HDR_SIZE && addr < cur + cursor {
                return true;
            }
            cur = hdr.next.load(Ordering::Acquire);
        }
        let big = state.big.lock().expect("big-alloc list poisoned");
        big.iter()
            .any(|b| addr >= b.base && addr < b.base + b.used)
    }

    fn info(&self, tag: AllocTag) -> Option<TagInfo> {
        let state = self.state(tag)?;
        let mut info = TagInfo::default();
        let mut cur = state.head.load(Ordering::Acquire);
        while cur != 0 {
            // SAFETY: live arena chain.
            let hdr = unsafe { &*(cur as *const ArenaHdr) };
            let size = hdr.size.load(Ordering::Acquire);
            let cursor = hdr.cursor.load(Ordering::Acquire);
            info.total += size;
            info.used += cursor - HDR_SIZE;
            info.free += size - cursor;
            info.areas.push(Area {
                base: cur,
                size,
                used: cursor,
            });
            cur = hdr.next.load(Ordering::Acquire);
        }
        let big = state.big.lock().expect("big-alloc list poisoned");
        for b in big.iter() {
            info.total += b.map_size;
            info.used += b.used;
            info.areas.push(Area {
                base: b.base,
                size: b.map_size,
                used: b.used,
            });
        }
        Some(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny() -> MremapConfig {
        MremapConfig {
            min_arena: 4096,
            big_alloc: 1 << 20,
            empty_threshold: 4096,
            ..Default::default()
        }
    }

    #[test]
    fn test_alloc_and_contains() {
        let a = MremapAllocator::new(tiny()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p = a.alloc(tag, 100, 16).unwrap();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        assert!(a.contains(tag, p));
        a.release_tag(tag);
    }

    #[test]
    fn test_growth_across_arenas() {
        let a = MremapAllocator::new(tiny()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        // Far more than one minimum arena's worth of small allocations.
        let mut ptrs = Vec::new();
        for _ in 0..1000 {
            ptrs.push(a.alloc(tag, 64, 8).unwrap());
        }
        for p in &ptrs {
            assert!(a.contains(tag, *p));
        }
        let info = a.info(tag).unwrap();
        assert!(info.used >= 64 * 1000);
        a.release_tag(tag);
    }

    #[test]
    fn test_fallback_grow_path() {
        let mut cfg = tiny();
        cfg.force_fallback_grow = true;
        let a = MremapAllocator::new(cfg).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        for _ in 0..1000 {
            a.alloc(tag, 64, 8).unwrap();
        }
        assert!(a.info(tag).unwrap().used >= 64 * 1000);
        a.release_tag(tag);
    }

    #[test]
    fn test_big_alloc_dedicated_mapping() {
        let a = MremapAllocator::new(tiny()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p = a.alloc(tag, 2 << 20, 16).unwrap();
        assert!(a.contains(tag, p));
        let info = a.info(tag).unwrap();
        assert!(info.areas.iter().any(|ar| ar.size >= 2 << 20));
        a.release_tag(tag);
    }

    #[test]
    fn test_reset_keeps_arenas() {
        let a = MremapAllocator::new(tiny()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        a.alloc(tag, 512, 8).unwrap();
        let total_before = a.info(tag).unwrap().total;
        a.reset_tag(tag);
        let info = a.info(tag).unwrap();
        assert_eq!(info.used, 0);
        assert_eq!(info.total, total_before);
        // Old addresses are reusable after reset.
        a.alloc(tag, 512, 8).unwrap();
        a.release_tag(tag);
    }

    #[test]
    fn test_trim_then_alloc_still_works() {
        let a = MremapAllocator::new(tiny()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        for _ in 0..200 {
            a.alloc(tag, 64, 8).unwrap();
        }
        a.trim_tag(tag);
        let p = a.alloc(tag, 64, 8).unwrap();
        assert!(a.contains(tag, p));
        a.release_tag(tag);
    }

    #[test]
    fn test_concurrent_same_tag_appends() {
        let a = Arc::new(MremapAllocator::new(tiny()).unwrap());
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let a = Arc::clone(&a);
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..200 {
                    got.push(a.alloc(tag, 32, 8).unwrap().as_ptr() as usize);
                }
                got
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before, "allocations must not alias");
        a.release_tag(tag);
    }
}
