//! Pointer relocation for remapped arenas.
//!
//! A dumped arena records the address it was mapped at. When it is mapped
//! back somewhere else, every pointer-bearing word inside still refers to
//! the old address range and must be rewritten by the mapping delta.
//! The walk starts at the root value, follows collection items and
//! indirect records, and rewrites stored words in place.
//!
//! Interned trees are DAGs: a shared subtree is reachable through more
//! than one parent. A visited set keyed by the old payload address makes
//! the rewrite happen exactly once per record, so the walk is idempotent
//! and `delta = 0` is the identity.

use std::collections::HashSet;

use crate::word::{
    IND_ANCHOR, IND_TAG, IND_VALUE, IND_WORDS_OFFSET, Kind, Value,
};

/// Relocate `root` and everything reachable from it.
///
/// `old_lo..old_hi` is the address range the arena occupied when it was
/// dumped; `delta` is `new_base - old_base` (wrapping). Words whose
/// payload falls outside the old range are left untouched: they never
/// occur in a single-area dump, but a partial walk must not corrupt them.
/// Returns the relocated root word.
///
/// # Safety
/// The remapped arena bytes must be live and writable at
/// `old_lo + delta .. old_hi + delta`, and `root` must have been the
/// exported root of that arena.
pub unsafe fn relocate_tree(old_lo: u64, old_hi: u64, root: Value, delta: u64) -> Value {
    let mut visited = HashSet::new();
    let mut walk = Walk {
        old_lo,
        old_hi,
        delta,
        visited: &mut visited,
    };
    unsafe { walk.value(root) }
}

struct Walk<'a> {
    old_lo: u64,
    old_hi: u64,
    delta: u64,
    visited: &'a mut HashSet<u64>,
}

impl Walk<'_> {
    /// Relocate one word and, first time through, the record it points at.
    unsafe fn value(&mut self, v: Value) -> Value {
        if v.is_in_place() || v == Value::INVALID {
            return v;
        }
        let old_ptr = v.payload_ptr() as u64;
        if old_ptr < self.old_lo || old_ptr >= self.old_hi {
            return v;
        }
        let moved = v.relocate_ptr(self.delta);
        if !self.visited.insert(old_ptr) {
            return moved;
        }
        let new_ptr = old_ptr.wrapping_add(self.delta) as *mut u8;
        match v.kind() {
            Kind::Sequence => unsafe {
                let count = *(new_ptr as *const u64) as usize;
                self.slots(new_ptr.add(8) as *mut u64, count);
            },
            Kind::Mapping => unsafe {
                let count = *(new_ptr as *const u64) as usize;
                self.slots(new_ptr.add(8) as *mut u64, count * 2);
            },
            Kind::Indirect => unsafe {
                let flags = *new_ptr;
                let present =
                    (flags & (IND_VALUE | IND_ANCHOR | IND_TAG)).count_ones() as usize;
                self.slots(new_ptr.add(IND_WORDS_OFFSET) as *mut u64, present);
            },
            // Boxed ints, floats and strings carry no further pointers.
            _ => {}
        }
        moved
    }

    /// Rewrite `count` stored value words starting at `slots`.
    unsafe fn slots(&mut self, slots: *mut u64, count: usize) {
        for i in 0..count {
            let slot = unsafe { slots.add(i) };
            let stored = Value::from_raw(unsafe { *slot });
            let moved = unsafe { self.value(stored) };
            unsafe { *slot = moved.raw() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::{TAG_SEQUENCE, TAG_STR_BOXED};

    // Build a tiny fake arena by hand: a sequence of two boxed strings.
    // Layout (16-aligned base):
    //   0x00  string "hello" -> [5, h, e, l, l, o, 0] padded to 16
    //   0x10  seq header {2} + 2 words, padded
    #[repr(C, align(16))]
    struct Arena([u8; 64]);

    fn build(arena: &mut Arena) -> Value {
        let base = arena.0.as_mut_ptr();
        arena.0[0] = 5;
        arena.0[1..6].copy_from_slice(b"hello");
        let s = Value::from_ptr(TAG_STR_BOXED, base as *const u8);
        let header = 2u64.to_le_bytes();
        arena.0[16..24].copy_from_slice(&header);
        arena.0[24..32].copy_from_slice(&s.raw().to_le_bytes());
        arena.0[32..40].copy_from_slice(&s.raw().to_le_bytes());
        Value::from_ptr(TAG_SEQUENCE, unsafe { base.add(16) } as *const u8)
    }

    #[test]
    fn test_delta_zero_is_identity() {
        let mut arena = Arena([0; 64]);
        let root = build(&mut arena);
        let lo = arena.0.as_ptr() as u64;
        let hi = lo + 64;
        let before = arena.0;
        let out = unsafe { relocate_tree(lo, hi, root, 0) };
        assert_eq!(out, root);
        assert_eq!(arena.0, before);
        // Repeated calls stay the identity.
        let out2 = unsafe { relocate_tree(lo, hi, root, 0) };
        assert_eq!(out2, root);
        assert_eq!(arena.0, before);
    }

    #[test]
    fn test_shared_child_relocated_once() {
        // Author the arena as if it had been dumped from a fictitious old
        // base: stored words carry old addresses, the bytes live here.
        const OLD_LO: u64 = 0x5000_0000_0000;
        let mut arena = Arena([0; 64]);
        build(&mut arena);
        let real_lo = arena.0.as_ptr() as u64;
        let delta = real_lo.wrapping_sub(OLD_LO);

        // Both sequence slots share one string at old offset 0.
        let old_str = Value::from_raw(OLD_LO | TAG_STR_BOXED);
        arena.0[24..32].copy_from_slice(&old_str.raw().to_le_bytes());
        arena.0[32..40].copy_from_slice(&old_str.raw().to_le_bytes());
        let old_root = Value::from_raw((OLD_LO + 16) | TAG_SEQUENCE);

        let root = unsafe { relocate_tree(OLD_LO, OLD_LO + 64, old_root, delta) };
        assert_eq!(root.payload_ptr() as u64, real_lo + 16);
        let items = unsafe { root.seq_items() }.unwrap();
        assert_eq!(items[0], items[1]);
        assert_eq!(items[0].payload_ptr() as u64, real_lo);
        assert_eq!(unsafe { items[0].as_bytes() }, Some(&b"hello"[..]));
    }
}
