//! Generic value builder.
//!
//! A builder pairs an allocator with one alloc tag and creates values in
//! it: in-place scalars cost nothing, everything else is stored into the
//! tag's arenas. When the allocator's outer layer is dedup, every store
//! interns, so structurally identical subtrees collapse to one pointer;
//! `intern: false` bypasses that for callers that know their input is
//! already canonical.
//!
//! Creation never leaves partial state behind: each record is fully
//! prepared in a scratch buffer and becomes visible only through the
//! single `store`/`storev` that copies it in. On allocation failure or
//! size overflow every create returns [`Value::INVALID`].
//!
//! Values built here are immutable; their lifetime is the builder's tag.
//! The safe methods trust the engine-wide contract that argument values
//! were built against live storage (this builder's or a peer's).

use std::ptr::NonNull;
use std::sync::Arc;

use tracing::debug;

use loam_core::word::{
    TAG_FLOAT_BOXED, TAG_INDIRECT, TAG_INT_BOXED, TAG_MAPPING, TAG_SEQUENCE, TAG_STR_BOXED,
};
use loam_core::{varint, IndirectView, Kind, ScalarStyle, Value, style_flags};
use loam_core::{IND_ANCHOR, IND_TAG, IND_VALUE, IND_FLOW};

use crate::alloc::{
    AllocError, AllocTag, AutoAllocator, AutoConfig, AutoScenario, SingleArea, TagAllocator,
    TagConfig,
};
use crate::scalar::Schema;

/// Builder creation parameters.
#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    pub schema: Schema,
    /// Route creates through `store` so a dedup layer can intern.
    /// Ignored (plain copies) when the allocator has no dedup layer.
    pub intern: bool,
    pub tag: TagConfig,
}

impl BuilderConfig {
    pub fn interning() -> Self {
        BuilderConfig {
            intern: true,
            ..Default::default()
        }
    }
}

/// Fields of an indirect wrapper. `anchor` and `tag` must be strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndirectSpec {
    pub value: Option<Value>,
    pub anchor: Option<Value>,
    pub tag: Option<Value>,
    pub style: ScalarStyle,
    pub flow: bool,
}

pub struct Builder {
    alloc: Arc<dyn TagAllocator>,
    tag: AllocTag,
    schema: Schema,
    intern: bool,
}

impl Builder {
    /// Build against an existing allocator; takes one fresh tag.
    pub fn new(alloc: Arc<dyn TagAllocator>, config: BuilderConfig) -> Result<Self, AllocError> {
        let tag = alloc.get_tag(&config.tag)?;
        Ok(Builder {
            alloc,
            tag,
            schema: config.schema,
            intern: config.intern,
        })
    }

    /// Build against a private auto allocator for the given scenario.
    pub fn with_scenario(
        scenario: AutoScenario,
        estimated_max_size: usize,
    ) -> Result<Self, AllocError> {
        let auto = AutoAllocator::new(AutoConfig {
            scenario,
            estimated_max_size,
        })?;
        let mut config = BuilderConfig::default();
        config.intern = matches!(
            scenario,
            AutoScenario::PerTagFreeDedup
                | AutoScenario::PerObjFreeDedup
                | AutoScenario::SingleLinearDedup
        );
        Builder::new(Arc::new(auto), config)
    }

    pub fn allocator(&self) -> &dyn TagAllocator {
        self.alloc.as_ref()
    }

    pub fn tag(&self) -> AllocTag {
        self.tag
    }

    pub fn schema(&self) -> Schema {
        self.schema
    }

    pub fn set_schema(&mut self, schema: Schema) {
        self.schema = schema;
    }

    /// Does `v`'s backing storage belong to this builder's tag?
    pub fn contains_value(&self, v: Value) -> bool {
        if v.is_in_place() || v == Value::INVALID {
            return true;
        }
        match NonNull::new(v.payload_ptr() as *mut u8) {
            Some(p) => self.alloc.contains(self.tag, p),
            None => false,
        }
    }

    /// Compact the tag's unused space.
    pub fn trim(&self) {
        self.alloc.trim_tag(self.tag);
    }

    /// Drop every value built so far; the tag stays usable.
    pub fn reset(&self) {
        self.alloc.reset_tag(self.tag);
    }

    /// The tag's single contiguous area, when the allocator can promise
    /// one (linear scenarios). Used for cache export.
    pub fn single_area(&self) -> Option<SingleArea> {
        let area = self.alloc.single_area(self.tag);
        if let Some(a) = &area {
            debug!(
                target: "loam::builder",
                size = a.size,
                start_offset = a.start_offset,
                "single-area export"
            );
        }
        area
    }

    // -----------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------

    #[inline(always)]
    pub fn null_of(&self) -> Value {
        Value::NULL
    }

    #[inline(always)]
    pub fn bool_of(&self, b: bool) -> Value {
        Value::bool_of(b)
    }

    pub fn int_of(&self, i: i64) -> Value {
        if let Some(v) = Value::int_inline(i) {
            return v;
        }
        match self.put(&i.to_ne_bytes(), 8) {
            Some(p) => Value::from_ptr(TAG_INT_BOXED, p.as_ptr()),
            None => Value::INVALID,
        }
    }

    pub fn float_of(&self, d: f64) -> Value {
        if let Some(v) = Value::float_inline(d) {
            return v;
        }
        match self.put(&d.to_ne_bytes(), 8) {
            Some(p) => Value::from_ptr(TAG_FLOAT_BOXED, p.as_ptr()),
            None => Value::INVALID,
        }
    }

    pub fn string_of(&self, bytes: &[u8]) -> Value {
        if let Some(v) = Value::str_inline(bytes) {
            return v;
        }
        let mut head = [0u8; varint::MAX_LEN64];
        let n = varint::encode64(bytes.len() as u64, &mut head);
        match self.putv(&[&head[..n], bytes, &[0u8]], 8) {
            Some(p) => Value::from_ptr(TAG_STR_BOXED, p.as_ptr()),
            None => Value::INVALID,
        }
    }

    #[inline]
    pub fn str_of(&self, s: &str) -> Value {
        self.string_of(s.as_bytes())
    }

    /// Sequence of `items`, each internalized first.
    pub fn sequence_of(&self, items: &[Value]) -> Value {
        let mut local = Vec::with_capacity(items.len());
        for &item in items {
            let v = self.internalize(item);
            if v == Value::INVALID && item != Value::INVALID {
                return Value::INVALID;
            }
            local.push(v);
        }
        self.collection(TAG_SEQUENCE, &local)
    }

    /// Mapping from key/value pairs, each internalized first.
    pub fn mapping_of(&self, pairs: &[(Value, Value)]) -> Value {
        let mut flat = Vec::with_capacity(pairs.len() * 2);
        for &(k, v) in pairs {
            flat.push(k);
            flat.push(v);
        }
        self.mapping_from_flat(&flat)
    }

    /// Mapping from an interleaved `[k0, v0, k1, v1, ...]` word array.
    /// Odd length is invalid input.
    pub fn mapping_from_flat(&self, words: &[Value]) -> Value {
        if words.len() % 2 != 0 {
            return Value::INVALID;
        }
        let mut local = Vec::with_capacity(words.len());
        for &w in words {
            let v = self.internalize(w);
            if v == Value::INVALID && w != Value::INVALID {
                return Value::INVALID;
            }
            local.push(v);
        }
        self.collection(TAG_MAPPING, &local)
    }

    /// Write a `{count}` header plus packed words, 16-aligned. For
    /// mappings the count is the pair count.
    fn collection(&self, tag_bits: u64, words: &[Value]) -> Value {
        let count = if tag_bits == TAG_MAPPING {
            words.len() / 2
        } else {
            words.len()
        };
        // Overflow-checked total size, although the header bound alone
        // cannot wrap before the allocator refuses.
        let Some(_total) = words.len().checked_mul(8).and_then(|n| n.checked_add(8)) else {
            return Value::INVALID;
        };
        let header = (count as u64).to_ne_bytes();
        // SAFETY: Value is repr(transparent) over u64.
        let body = unsafe {
            std::slice::from_raw_parts(words.as_ptr().cast::<u8>(), words.len() * 8)
        };
        match self.putv(&[&header, body], 16) {
            Some(p) => Value::from_ptr(tag_bits, p.as_ptr()),
            None => Value::INVALID,
        }
    }

    /// Indirect wrapper. Present fields are internalized; `anchor` and
    /// `tag` must be strings.
    pub fn indirect_of(&self, spec: IndirectSpec) -> Value {
        let mut flags = 0u8;
        let mut words = [Value::NULL; 3];
        let mut n = 0;
        let mut push = |flag: u8, v: Option<Value>, flags: &mut u8| -> bool {
            if let Some(v) = v {
                let v = self.internalize(v);
                if v == Value::INVALID {
                    return false;
                }
                *flags |= flag;
                words[n] = v;
                n += 1;
            }
            true
        };
        if !push(IND_VALUE, spec.value, &mut flags)
            || !push(IND_ANCHOR, spec.anchor, &mut flags)
            || !push(IND_TAG, spec.tag, &mut flags)
        {
            return Value::INVALID;
        }
        if spec.flow {
            flags |= IND_FLOW;
        }
        flags |= style_flags(spec.style);

        let mut head = [0u8; 8];
        head[0] = flags;
        // SAFETY: Value is repr(transparent) over u64.
        let body = unsafe { std::slice::from_raw_parts(words.as_ptr().cast::<u8>(), n * 8) };
        match self.putv(&[&head, body], 8) {
            Some(p) => Value::from_ptr(TAG_INDIRECT, p.as_ptr()),
            None => Value::INVALID,
        }
    }

    /// Alias: an indirect with an anchor and no value.
    pub fn alias_of(&self, anchor: &str) -> Value {
        let name = self.str_of(anchor);
        if name == Value::INVALID {
            return Value::INVALID;
        }
        self.indirect_of(IndirectSpec {
            anchor: Some(name),
            ..Default::default()
        })
    }

    /// Classify `text` under this builder's schema (see [`crate::scalar`]).
    pub fn scalar_from_text(&self, text: &str, force: Option<Kind>) -> Value {
        crate::scalar::scalar_from_text(self, text, self.schema, force)
    }

    // -----------------------------------------------------------------
    // Internalization / copying
    // -----------------------------------------------------------------

    /// Ensure `v` lives in this builder's tag. In-place values and
    /// values already inside the tag pass through; anything foreign is
    /// deep-copied (and interned, when interning is on).
    pub fn internalize(&self, v: Value) -> Value {
        if v.is_in_place() {
            return v;
        }
        if v == Value::INVALID || self.contains_value(v) {
            return v;
        }
        self.rebuild(v)
    }

    /// Deep copy: fresh headers for every collection and record, child
    /// scalars internalized. Under dedup the copy compares pointer-equal
    /// to the original's interned form.
    pub fn deep_copy(&self, v: Value) -> Value {
        if v.is_in_place() || v == Value::INVALID {
            return v;
        }
        self.rebuild(v)
    }

    fn rebuild(&self, v: Value) -> Value {
        // SAFETY: engine contract — argument values are backed by live
        // storage for the duration of the call.
        unsafe {
            match v.kind() {
                Kind::Int => match v.as_int() {
                    Some(i) => self.int_of(i),
                    None => Value::INVALID,
                },
                Kind::Float => match v.as_float() {
                    Some(d) => self.float_of(d),
                    None => Value::INVALID,
                },
                Kind::String => match v.as_bytes() {
                    Some(b) => self.string_of(b),
                    None => Value::INVALID,
                },
                Kind::Sequence => {
                    let Some(items) = v.seq_items() else {
                        return Value::INVALID;
                    };
                    let copied: Vec<Value> = items.iter().map(|&i| self.rebuild_child(i)).collect();
                    if copied.iter().any(|&c| c == Value::INVALID)
                        && !items.iter().any(|&i| i == Value::INVALID)
                    {
                        return Value::INVALID;
                    }
                    self.collection(TAG_SEQUENCE, &copied)
                }
                Kind::Mapping => {
                    let Some(words) = v.map_words() else {
                        return Value::INVALID;
                    };
                    let copied: Vec<Value> = words.iter().map(|&w| self.rebuild_child(w)).collect();
                    if copied.iter().any(|&c| c == Value::INVALID)
                        && !words.iter().any(|&w| w == Value::INVALID)
                    {
                        return Value::INVALID;
                    }
                    self.collection(TAG_MAPPING, &copied)
                }
                Kind::Indirect => {
                    let Some(view) = v.indirect() else {
                        return Value::INVALID;
                    };
                    self.indirect_of(IndirectSpec {
                        value: view.value.map(|w| self.rebuild_child(w)),
                        anchor: view.anchor.map(|w| self.rebuild_child(w)),
                        tag: view.tag.map(|w| self.rebuild_child(w)),
                        style: view.style(),
                        flow: view.flow(),
                    })
                }
                _ => v,
            }
        }
    }

    fn rebuild_child(&self, v: Value) -> Value {
        if v.is_in_place() || v == Value::INVALID {
            return v;
        }
        if self.contains_value(v) {
            return v;
        }
        self.rebuild(v)
    }

    // -----------------------------------------------------------------
    // Lookup / comparison helpers
    // -----------------------------------------------------------------

    /// Total structural order (see [`loam_core::compare`]).
    pub fn compare(&self, a: Value, b: Value) -> i32 {
        // SAFETY: engine contract — argument values are live.
        unsafe { loam_core::compare(a, b) }
    }

    /// Mapping lookup by structural key equality. `INVALID` on a miss or
    /// a non-mapping input.
    pub fn map_get(&self, map: Value, key: Value) -> Value {
        // SAFETY: engine contract — argument values are live.
        unsafe {
            match map.map_words() {
                Some(words) => {
                    loam_core::map_lookup_words(words, key).unwrap_or(Value::INVALID)
                }
                None => Value::INVALID,
            }
        }
    }

    /// Indirect view of `v`, when it is an indirect record.
    pub fn indirect_view(&self, v: Value) -> Option<IndirectView> {
        // SAFETY: engine contract — argument values are live.
        unsafe { v.indirect() }
    }

    // -----------------------------------------------------------------
    // Storage plumbing
    // -----------------------------------------------------------------

    fn put(&self, bytes: &[u8], align: usize) -> Option<NonNull<u8>> {
        if self.intern {
            self.alloc.store(self.tag, bytes, align)
        } else {
            let dst = self.alloc.alloc(self.tag, bytes.len(), align)?;
            // SAFETY: fresh allocation of `bytes.len()` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr(), bytes.len());
            }
            Some(dst)
        }
    }

    fn putv(&self, iov: &[&[u8]], align: usize) -> Option<NonNull<u8>> {
        if self.intern {
            self.alloc.storev(self.tag, iov, align)
        } else {
            let total: usize = {
                let mut sum = 0usize;
                for seg in iov {
                    sum = sum.checked_add(seg.len())?;
                }
                sum
            };
            let dst = self.alloc.alloc(self.tag, total, align)?;
            let mut off = 0;
            for seg in iov {
                // SAFETY: `dst` spans `total` bytes, summed with checks.
                unsafe {
                    std::ptr::copy_nonoverlapping(seg.as_ptr(), dst.as_ptr().add(off), seg.len());
                }
                off += seg.len();
            }
            Some(dst)
        }
    }
}

impl Drop for Builder {
    fn drop(&mut self) {
        self.alloc.release_tag(self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> Builder {
        Builder::with_scenario(AutoScenario::PerTagFree, 64 * 1024).unwrap()
    }

    #[test]
    fn test_scalar_round_trips() {
        let b = plain();
        assert_eq!(b.null_of(), Value::NULL);
        assert_eq!(b.bool_of(true).as_bool(), Some(true));

        for i in [0i64, -7, 123456, i64::MAX, i64::MIN] {
            let v = b.int_of(i);
            assert_eq!(unsafe { v.as_int() }, Some(i), "{i}");
        }
        for d in [0.0f64, 1.5, -0.25, 0.1, 1e300, f64::INFINITY] {
            let v = b.float_of(d);
            assert_eq!(unsafe { v.as_float() }, Some(d), "{d}");
        }
    }

    #[test]
    fn test_int_inline_outline_boundary() {
        let b = plain();
        let hi = b.int_of((1 << 60) - 1);
        assert!(hi.is_in_place());
        let out = b.int_of(1 << 60);
        assert!(!out.is_in_place());
        assert_eq!(unsafe { out.as_int() }, Some(1 << 60));
        let lo = b.int_of(-(1 << 60));
        assert!(lo.is_in_place());
    }

    #[test]
    fn test_string_inline_outline_boundary() {
        let b = plain();
        let short = b.str_of("short1");
        assert!(short.is_in_place());
        assert_eq!(unsafe { short.as_str() }, Some("short1"));

        let long = b.str_of("long string out of place");
        assert!(!long.is_in_place());
        assert_eq!(unsafe { long.as_str() }, Some("long string out of place"));

        let eight = b.str_of("12345678");
        assert!(!eight.is_in_place());
        assert_eq!(unsafe { eight.as_str() }, Some("12345678"));
    }

    #[test]
    fn test_string_with_interior_nul() {
        let b = plain();
        let v = b.string_of(b"nul\0inside and long enough");
        assert_eq!(
            unsafe { v.as_bytes() },
            Some(&b"nul\0inside and long enough"[..])
        );
    }

    #[test]
    fn test_sequence_and_mapping() {
        let b = plain();
        let empty = b.sequence_of(&[]);
        assert_eq!(unsafe { empty.collection_count() }, Some(0));

        let seq = b.sequence_of(&[b.int_of(1), b.int_of(2), b.int_of(3)]);
        assert_eq!(seq.kind(), Kind::Sequence);
        let items = unsafe { seq.seq_items() }.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(unsafe { items[2].as_int() }, Some(3));

        let map = b.mapping_of(&[
            (b.str_of("a"), b.int_of(1)),
            (b.str_of("b"), b.int_of(2)),
        ]);
        assert_eq!(map.kind(), Kind::Mapping);
        assert_eq!(unsafe { map.collection_count() }, Some(2));
        let got = b.map_get(map, b.str_of("b"));
        assert_eq!(unsafe { got.as_int() }, Some(2));
        assert_eq!(b.map_get(map, b.str_of("zz")), Value::INVALID);
    }

    #[test]
    fn test_mapping_odd_words_invalid() {
        let b = plain();
        assert_eq!(b.mapping_from_flat(&[Value::NULL]), Value::INVALID);
    }

    #[test]
    fn test_indirect_and_alias() {
        let b = plain();
        let wrapped = b.indirect_of(IndirectSpec {
            value: Some(b.int_of(5)),
            anchor: Some(b.str_of("a1")),
            tag: Some(b.str_of("!mytag")),
            style: ScalarStyle::DoubleQuoted,
            flow: true,
        });
        assert_eq!(wrapped.kind(), Kind::Indirect);
        assert_eq!(unsafe { wrapped.kind_deep() }, Kind::Int);
        assert_eq!(unsafe { wrapped.as_int() }, Some(5));
        let view = b.indirect_view(wrapped).unwrap();
        assert!(view.flow());
        assert_eq!(view.style(), ScalarStyle::DoubleQuoted);
        let anchor = view.anchor.unwrap();
        assert_eq!(unsafe { anchor.as_str() }, Some("a1"));

        let alias = b.alias_of("a1");
        assert_eq!(unsafe { alias.kind_deep() }, Kind::Alias);
    }

    #[test]
    fn test_internalize_is_idempotent() {
        let b = plain();
        let v = b.sequence_of(&[b.str_of("payload well past inline")]);
        // Already inside the tag: pointer-identical pass-through.
        assert_eq!(b.internalize(v), v);

        // Foreign value: copied in.
        let other = plain();
        let foreign = other.str_of("foreign string, quite long");
        let local = b.internalize(foreign);
        assert_ne!(local, foreign);
        assert!(b.contains_value(local));
        assert_eq!(b.compare(local, foreign), 0);
        assert_eq!(b.internalize(local), local);
    }

    #[test]
    fn test_deep_copy_compares_equal() {
        let b = plain();
        let v = b.mapping_of(&[
            (b.str_of("k"), b.sequence_of(&[b.int_of(1), b.float_of(0.5)])),
            (b.str_of("longer key than inline"), b.null_of()),
        ]);
        let c = b.deep_copy(v);
        assert_ne!(c, v);
        assert_eq!(b.compare(c, v), 0);
    }

    #[test]
    fn test_dedup_builder_interns_subtrees() {
        let b = Builder::with_scenario(AutoScenario::PerTagFreeDedup, 64 * 1024).unwrap();
        let s1 = b.sequence_of(&[b.str_of("shared child string"), b.int_of(9)]);
        let s2 = b.sequence_of(&[b.str_of("shared child string"), b.int_of(9)]);
        assert_eq!(b.compare(s1, s2), 0);
        assert_eq!(s1, s2, "identical trees intern to one pointer");
    }

    #[test]
    fn test_oom_returns_invalid() {
        let b = Builder::with_scenario(AutoScenario::SingleLinear, 4096).unwrap();
        // The linear buffer holds 4 KiB; this cannot fit.
        let huge = vec![0x61u8; 1 << 20];
        assert_eq!(b.string_of(&huge), Value::INVALID);
        // The builder is still usable afterwards.
        let still_fine = b.str_of("still fine");
        assert_eq!(unsafe { still_fine.as_str() }, Some("still fine"));
    }
}
