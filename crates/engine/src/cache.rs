//! Cache files: dump a single-area tag, map it back, relocate if needed.
//!
//! File layout: the tag's reserved header bytes come first, the first
//! sixteen holding two 64-bit little-endian words —
//! `[original_mapping_address, root_value_word]` — zero-padded to the
//! reserve; the rest of the file is the arena bytes verbatim. No magic
//! or version word: the two-word preamble is the defined minimum.
//!
//! Reload maps the file privately at the recorded address
//! (`MAP_FIXED_NOREPLACE` where available, honoured-hint detection
//! elsewhere). Landing there makes every internal pointer valid as-is
//! and the cached root usable verbatim, with no decode and no fresh
//! allocation. Landing anywhere else, the loader rewrites every
//! pointer-bearing word reachable from the root by the mapping delta —
//! or fails with [`CacheError::Mismatch`] when relocation is disabled.

use std::fs::File;
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use loam_core::{relocate_tree, Kind, Value};
use tracing::debug;

use crate::alloc::SingleArea;
use crate::builder::Builder;

/// Bytes of the two-word preamble.
pub const HEADER_BYTES: usize = 16;

#[derive(Debug)]
pub enum CacheError {
    Io(std::io::Error),
    /// The builder's allocator cannot export one contiguous area.
    NoSingleArea,
    /// The tag's reserve cannot hold the preamble.
    HeaderTooSmall,
    /// File shorter than its own header.
    Truncated,
    /// Mapped at a different address and relocation is disabled.
    Mismatch,
    /// The recorded root word is not a value.
    BadRoot,
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Io(e) => write!(f, "cache i/o: {e}"),
            CacheError::NoSingleArea => write!(f, "allocator cannot export a single area"),
            CacheError::HeaderTooSmall => write!(f, "header reserve below {HEADER_BYTES} bytes"),
            CacheError::Truncated => write!(f, "cache file truncated"),
            CacheError::Mismatch => write!(f, "cache mapped at a different address"),
            CacheError::BadRoot => write!(f, "cache root word is invalid"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::Io(e)
    }
}

/// Dump a builder's single-area tag with `root` as the document root.
pub fn save(builder: &Builder, root: Value, path: &Path) -> Result<(), CacheError> {
    let area = builder.single_area().ok_or(CacheError::NoSingleArea)?;
    save_area(&area, root, path)
}

/// Dump an exported area. The preamble is written into the area's
/// reserved head, then the used bytes go out verbatim.
pub fn save_area(area: &SingleArea, root: Value, path: &Path) -> Result<(), CacheError> {
    if area.start_offset < HEADER_BYTES {
        return Err(CacheError::HeaderTooSmall);
    }
    let base = area.base.as_ptr();
    // SAFETY: the area's first `start_offset` bytes are reserved for
    // exactly this header and belong to the live mapping.
    unsafe {
        let addr = (base as u64).to_le_bytes();
        let word = root.raw().to_le_bytes();
        std::ptr::copy_nonoverlapping(addr.as_ptr(), base, 8);
        std::ptr::copy_nonoverlapping(word.as_ptr(), base.add(8), 8);
    }
    // SAFETY: `size` bytes from `base` are the live used area.
    let bytes = unsafe { std::slice::from_raw_parts(base, area.size) };
    std::fs::write(path, bytes)?;
    debug!(target: "loam::cache", size = area.size, "cache written");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Rewrite pointers when the file cannot map at its old address.
    /// Off, such a load fails with [`CacheError::Mismatch`].
    pub relocate: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions { relocate: true }
    }
}

/// A mapped cache file. The root (and everything it references) stays
/// valid until this is dropped.
#[derive(Debug)]
pub struct LoadedCache {
    base: NonNull<u8>,
    map_size: usize,
    root: Value,
    relocated: bool,
}

// SAFETY: the mapping is privately owned and immutable after load.
unsafe impl Send for LoadedCache {}
unsafe impl Sync for LoadedCache {}

impl LoadedCache {
    pub fn root(&self) -> Value {
        self.root
    }

    /// Did the loader have to rewrite pointers?
    pub fn relocated(&self) -> bool {
        self.relocated
    }
}

impl Drop for LoadedCache {
    fn drop(&mut self) {
        // SAFETY: mapped in `load` with this exact length.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.map_size);
        }
    }
}

/// Map a cache file back in.
pub fn load(path: &Path, opts: &LoadOptions) -> Result<LoadedCache, CacheError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; HEADER_BYTES];
    file.read_exact(&mut header).map_err(|_| CacheError::Truncated)?;
    let orig_base = u64::from_le_bytes(header[..8].try_into().expect("8-byte slice"));
    let root_word = u64::from_le_bytes(header[8..].try_into().expect("8-byte slice"));
    let file_len = file.metadata()?.len() as usize;

    // SAFETY: sysconf with a valid name has no preconditions.
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let map_size = file_len
        .checked_add(page - 1)
        .ok_or(CacheError::Truncated)?
        & !(page - 1);

    let fd = file.as_raw_fd();
    let prot = libc::PROT_READ | libc::PROT_WRITE;

    // First choice: the recorded address, never clobbering anything.
    #[cfg(target_os = "linux")]
    // SAFETY: private file mapping; NOREPLACE refuses occupied ranges.
    let mut mapped = unsafe {
        libc::mmap(
            orig_base as *mut libc::c_void,
            map_size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_FIXED_NOREPLACE,
            fd,
            0,
        )
    };
    #[cfg(not(target_os = "linux"))]
    // SAFETY: hint only, the kernel picks a free range.
    let mut mapped = unsafe {
        libc::mmap(orig_base as *mut libc::c_void, map_size, prot, libc::MAP_PRIVATE, fd, 0)
    };

    if mapped == libc::MAP_FAILED {
        // Occupied (or hint rejected): map anywhere.
        // SAFETY: private file mapping with no address constraint.
        mapped = unsafe {
            libc::mmap(std::ptr::null_mut(), map_size, prot, libc::MAP_PRIVATE, fd, 0)
        };
        if mapped == libc::MAP_FAILED {
            return Err(CacheError::Io(std::io::Error::last_os_error()));
        }
    }
    let base = NonNull::new(mapped as *mut u8).ok_or(CacheError::Mismatch)?;
    let new_base = base.as_ptr() as u64;

    let root = Value::from_raw(root_word);
    if root.kind() == Kind::Invalid {
        // SAFETY: mapped above with this length.
        unsafe { libc::munmap(mapped, map_size) };
        return Err(CacheError::BadRoot);
    }

    if new_base == orig_base {
        debug!(target: "loam::cache", addr = orig_base, "cache mapped in place");
        return Ok(LoadedCache {
            base,
            map_size,
            root,
            relocated: false,
        });
    }

    if !opts.relocate {
        // SAFETY: mapped above with this length.
        unsafe { libc::munmap(mapped, map_size) };
        return Err(CacheError::Mismatch);
    }

    let delta = new_base.wrapping_sub(orig_base);
    // SAFETY: the file's arena bytes are mapped read-write at
    // `orig_base + delta ..`, and `root` was exported from that arena.
    let root = unsafe { relocate_tree(orig_base, orig_base + file_len as u64, root, delta) };
    debug!(
        target: "loam::cache",
        from = orig_base,
        to = new_base,
        "cache relocated"
    );
    Ok(LoadedCache {
        base,
        map_size,
        root,
        relocated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{AutoScenario, TagConfig};
    use crate::builder::BuilderConfig;
    use std::sync::Arc;

    fn linear_builder(reserve: usize) -> Builder {
        let auto = crate::alloc::AutoAllocator::new(crate::alloc::auto::AutoConfig {
            scenario: AutoScenario::SingleLinear,
            estimated_max_size: 64 * 1024,
        })
        .unwrap();
        Builder::new(
            Arc::new(auto),
            BuilderConfig {
                tag: TagConfig {
                    reserve,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn sample_root(b: &Builder) -> Value {
        b.mapping_of(&[
            (b.str_of("name"), b.str_of("cache round trip fixture")),
            (
                b.str_of("values"),
                b.sequence_of(&[b.int_of(1), b.int_of(1 << 62), b.float_of(0.1)]),
            ),
        ])
    }

    #[test]
    fn test_round_trip_with_relocation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.cache");
        let b = linear_builder(64);
        let root = sample_root(&b);
        save(&b, root, &path).unwrap();

        // The builder still occupies the original address, so this load
        // must take the relocation path.
        let loaded = load(&path, &LoadOptions::default()).unwrap();
        assert!(loaded.relocated());
        assert_eq!(b.compare(loaded.root(), root), 0);
    }

    #[test]
    fn test_reload_at_original_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verbatim.cache");
        let b = linear_builder(64);
        let root = sample_root(&b);
        save(&b, root, &path).unwrap();

        // Rebuild the expected tree in a fresh arena, then free the
        // original mapping so its address range is available again.
        let check = linear_builder(64);
        let expected = check.deep_copy(root);
        drop(b);

        let loaded = load(&path, &LoadOptions::default()).unwrap();
        assert_eq!(check.compare(loaded.root(), expected), 0);
    }

    #[test]
    fn test_mismatch_when_relocation_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strict.cache");
        let b = linear_builder(64);
        let root = sample_root(&b);
        save(&b, root, &path).unwrap();

        // Original address is still occupied by the live builder.
        let err = load(&path, &LoadOptions { relocate: false }).unwrap_err();
        assert!(matches!(err, CacheError::Mismatch));
    }

    #[test]
    fn test_save_requires_reserve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.cache");
        let b = linear_builder(0);
        let root = b.int_of(1);
        let err = save(&b, root, &path).unwrap_err();
        assert!(matches!(err, CacheError::HeaderTooSmall));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.cache");
        std::fs::write(&path, b"short").unwrap();
        let err = load(&path, &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, CacheError::Truncated));
    }

    #[test]
    fn test_multi_arena_tag_cannot_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.cache");
        let b = Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap();
        let err = save(&b, b.int_of(1), &path).unwrap_err();
        assert!(matches!(err, CacheError::NoSingleArea));
    }
}
