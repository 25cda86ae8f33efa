//! loam-core: primitives for the loam value engine
//!
//! This crate is the dependency-free bottom of the stack. It defines the
//! one-word tagged value encoding and the bit-level helpers the engine
//! builds on:
//!
//! - `word`: the tagged value word — kinds, inline scalars, collection
//!   and indirect layouts, readers, and structural comparison
//! - `reloc`: the pointer-relocation walk for remapped arena dumps
//! - `varint`: canonical variable-length size encoding
//! - `idbits`: lock-free small-integer ID allocation
//!
//! Nothing here allocates; storage comes from the engine's allocator
//! stack, and readers that follow payload pointers are `unsafe` with a
//! "backing tag is live" contract.

// The inline-string path borrows bytes straight out of the word, and the
// dump format is little-endian on disk.
#[cfg(target_endian = "big")]
compile_error!("loam-core requires a little-endian target");
#[cfg(not(target_pointer_width = "64"))]
compile_error!("loam-core requires 64-bit pointers");

pub mod idbits;
pub mod reloc;
pub mod varint;
pub mod word;

pub use idbits::IdBits;
pub use reloc::relocate_tree;
pub use word::{
    IND_ANCHOR, IND_FLOW, IND_TAG, IND_VALUE, IND_WORDS_OFFSET, INT_INLINE_END, INT_INLINE_MIN,
    IndirectView, Kind, STR_INLINE_MAX, ScalarStyle, TAG_FLOAT_BOXED, TAG_INDIRECT, TAG_INT_BOXED,
    TAG_MAPPING, TAG_SEQUENCE, TAG_STR_BOXED, Value, compare, indirect_record_size,
    map_lookup_words, read_indirect, style_flags,
};
