//! Linear allocator: one buffer, one bump cursor, one tag.
//!
//! The whole tag is a single pre-sized anonymous mapping, which is what
//! makes it exportable: `single_area` hands back the buffer verbatim,
//! page-aligned, with the reserved header bytes at the front for the
//! cache preamble. Releasing the tag rewinds the cursor; dropping the
//! allocator unmaps, so a cache reload can land on the freed address.
//! `free` is a no-op.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    align_ok, align_up, AllocError, AllocTag, Area, SingleArea, TagAllocator, TagConfig, TagInfo,
};

/// Reserve alignment; collection headers need 16.
const BUF_ALIGN: usize = 16;

#[derive(Debug, Clone)]
pub struct LinearConfig {
    /// Buffer capacity in bytes.
    pub size: usize,
    /// Header bytes reserved at the front for cache export.
    pub reserve: usize,
}

impl Default for LinearConfig {
    fn default() -> Self {
        LinearConfig {
            size: 1 << 20,
            reserve: 0,
        }
    }
}

pub struct LinearAllocator {
    buf: NonNull<u8>,
    cap: usize,
    reserve: AtomicUsize,
    /// Next free offset from `buf`; starts at the aligned reserve.
    cursor: AtomicUsize,
}

// SAFETY: the buffer is owned for the allocator's lifetime and all
// cursor movement is atomic; handed-out regions are disjoint.
unsafe impl Send for LinearAllocator {}
unsafe impl Sync for LinearAllocator {}

impl LinearAllocator {
    pub fn new(config: LinearConfig) -> Result<Self, AllocError> {
        let reserve = align_up(config.reserve, BUF_ALIGN).ok_or(AllocError::SizeOverflow)?;
        if config.size.max(reserve) == 0 {
            return Err(AllocError::InvalidConfig);
        }
        // SAFETY: sysconf with a valid name has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page <= 0 {
            return Err(AllocError::InvalidConfig);
        }
        let cap = align_up(config.size.max(reserve), page as usize)
            .ok_or(AllocError::SizeOverflow)?;
        // An anonymous mapping: zero-filled (header padding and
        // alignment gaps dump as zero bytes) and page-aligned for cache
        // export.
        // SAFETY: anonymous private mapping with no address constraint.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                cap,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(AllocError::OutOfMemory);
        }
        let buf = NonNull::new(raw as *mut u8).ok_or(AllocError::OutOfMemory)?;
        Ok(LinearAllocator {
            buf,
            cap,
            reserve: AtomicUsize::new(reserve),
            cursor: AtomicUsize::new(reserve),
        })
    }

    fn base(&self) -> usize {
        self.buf.as_ptr() as usize
    }
}

impl Drop for LinearAllocator {
    fn drop(&mut self) {
        // SAFETY: mapped in `new` with this exact length; unmapped once.
        unsafe {
            libc::munmap(self.buf.as_ptr() as *mut libc::c_void, self.cap);
        }
    }
}

impl TagAllocator for LinearAllocator {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn get_tag(&self, config: &TagConfig) -> Result<AllocTag, AllocError> {
        // One shared tag. A fresh tag may widen the header reserve, but
        // only while the buffer is still empty.
        if config.reserve > 0 {
            let reserve = align_up(config.reserve, BUF_ALIGN).ok_or(AllocError::SizeOverflow)?;
            if reserve > self.cap {
                return Err(AllocError::InvalidConfig);
            }
            let old = self.reserve.load(Ordering::Acquire);
            if reserve != old {
                if self.cursor.load(Ordering::Acquire) != old {
                    return Err(AllocError::InvalidConfig);
                }
                self.reserve.store(reserve, Ordering::Release);
                self.cursor.store(reserve, Ordering::Release);
            }
        }
        Ok(AllocTag(0))
    }

    fn release_tag(&self, tag: AllocTag) {
        self.reset_tag(tag);
    }

    fn reset_tag(&self, _tag: AllocTag) {
        self.cursor
            .store(self.reserve.load(Ordering::Acquire), Ordering::Release);
    }

    fn alloc(&self, tag: AllocTag, size: usize, align: usize) -> Option<NonNull<u8>> {
        if tag.0 != 0 || !align_ok(align) {
            return None;
        }
        let base = self.base();
        let mut cur = self.cursor.load(Ordering::Relaxed);
        loop {
            let aligned_addr = align_up(base.checked_add(cur)?, align)?;
            let start = aligned_addr - base;
            let end = start.checked_add(size)?;
            if end > self.cap {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cur,
                end,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                // SAFETY: offset `start` is in bounds of the live buffer.
                Ok(_) => return Some(unsafe { NonNull::new_unchecked(self.buf.as_ptr().add(start)) }),
                Err(actual) => cur = actual,
            }
        }
    }

    fn contains(&self, tag: AllocTag, ptr: NonNull<u8>) -> bool {
        if tag.0 != 0 {
            return false;
        }
        let addr = ptr.as_ptr() as usize;
        let base = self.base();
        addr >= base && addr < base + self.cursor.load(Ordering::Acquire)
    }

    fn info(&self, tag: AllocTag) -> Option<TagInfo> {
        if tag.0 != 0 {
            return None;
        }
        let used = self.cursor.load(Ordering::Acquire);
        Some(TagInfo {
            free: self.cap - used,
            used,
            total: self.cap,
            areas: vec![Area {
                base: self.base(),
                size: self.cap,
                used,
            }],
        })
    }

    fn single_area(&self, tag: AllocTag) -> Option<SingleArea> {
        if tag.0 != 0 {
            return None;
        }
        Some(SingleArea {
            base: self.buf,
            size: self.cursor.load(Ordering::Acquire),
            start_offset: self.reserve.load(Ordering::Acquire),
            alloc_size: self.cap,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bump_and_alignment() {
        let a = LinearAllocator::new(LinearConfig {
            size: 256,
            reserve: 0,
        })
        .unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p1 = a.alloc(tag, 3, 1).unwrap();
        let p2 = a.alloc(tag, 8, 8).unwrap();
        assert_eq!(p2.as_ptr() as usize % 8, 0);
        assert!(p2.as_ptr() as usize >= p1.as_ptr() as usize + 3);
        assert!(a.contains(tag, p1));
        assert!(a.contains(tag, p2));
    }

    #[test]
    fn test_exhaustion_fails_cleanly() {
        let a = LinearAllocator::new(LinearConfig {
            size: 4096,
            reserve: 0,
        })
        .unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let cap = a.info(tag).unwrap().total;
        assert!(a.alloc(tag, cap - 16, 16).is_some());
        let before = a.info(tag).unwrap().used;
        assert!(a.alloc(tag, 64, 16).is_none());
        // Failure leaves the cursor where it was.
        assert_eq!(a.info(tag).unwrap().used, before);
    }

    #[test]
    fn test_release_rewinds_to_reserve() {
        let a = LinearAllocator::new(LinearConfig {
            size: 256,
            reserve: 32,
        })
        .unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        a.alloc(tag, 100, 8).unwrap();
        a.release_tag(tag);
        let info = a.info(tag).unwrap();
        assert_eq!(info.used, 32);
        let area = a.single_area(tag).unwrap();
        assert_eq!(area.start_offset, 32);
        assert_eq!(area.size, 32);
    }

    #[test]
    fn test_store_copies() {
        let a = LinearAllocator::new(LinearConfig::default()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        let p = a.store(tag, b"hello world", 1).unwrap();
        let got = unsafe { std::slice::from_raw_parts(p.as_ptr(), 11) };
        assert_eq!(got, b"hello world");
    }

    #[test]
    fn test_get_tag_reserve_after_use_rejected() {
        let a = LinearAllocator::new(LinearConfig::default()).unwrap();
        let tag = a.get_tag(&TagConfig::default()).unwrap();
        a.alloc(tag, 8, 8).unwrap();
        let err = a.get_tag(&TagConfig {
            reserve: 64,
            ..Default::default()
        });
        assert_eq!(err, Err(AllocError::InvalidConfig));
    }
}
