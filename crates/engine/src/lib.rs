//! loam-engine: a space-efficient generic value engine.
//!
//! Structured data (the YAML/JSON model) as one tagged machine word per
//! value, with all heap backing packed into tag-scoped arenas that can
//! be trimmed, dumped to disk as one blob, mapped back and relocated.
//!
//! The stack, bottom up:
//!
//! - `alloc`: the allocator stack — linear, malloc, mremap and dedup
//!   allocators behind one trait, composed by the auto allocator and a
//!   process-wide factory registry
//! - `builder`: creation primitives for every value kind, internment,
//!   internalization, deep copy, single-area export
//! - `scalar`: schema-driven classification of plain scalar text
//! - `ops`: pure functional operations over values, optionally parallel
//!   on a `pool` worker pool
//! - `decode`: event-stream decoder (anchors, aliases, merge keys) and
//!   the matching emitter
//! - `cache`: dump/reload of single-area tags with pointer relocation
//!
//! Diagnostics go through `tracing`; the embedding application decides
//! where they land. Nothing here installs a subscriber.

pub mod alloc;
pub mod builder;
pub mod cache;
pub mod decode;
pub mod ops;
pub mod pool;
pub mod scalar;

pub use alloc::{
    AllocError, AllocSpec, AllocTag, AutoAllocator, AutoScenario, DedupAllocator,
    LinearAllocator, MallocAllocator, MremapAllocator, SingleArea, TagAllocator, TagConfig,
    TagInfo, create_allocator, register_allocator, registered_allocators,
};
pub use builder::{Builder, BuilderConfig, IndirectSpec};
pub use cache::{CacheError, LoadOptions, LoadedCache};
pub use decode::{DecodeError, DecodeOptions, Decoder, Document, Event, EventSink, EventSource};
pub use ops::{Op, Parallel, apply};
pub use pool::{CancelFlag, CoroutinePool, WorkerPool};
pub use scalar::{Schema, scalar_from_text};

// Re-export the value primitives so most users need one crate.
pub use loam_core::{Kind, ScalarStyle, Value, compare, relocate_tree};
