//! Pure functional operations over values.
//!
//! Every operation reads its input, builds a new value through the
//! builder, and never mutates live data — untouched subtrees are shared
//! between input and output. Failures (wrong input kind, out-of-range
//! index, missing path segment, allocation failure, cancellation)
//! return [`Value::INVALID`] and leave the input unchanged.
//!
//! [`apply`] is the single dispatch entry over the [`Op`] code; the free
//! functions underneath are the direct API.
//!
//! Filter, map and reduce optionally run on a [`WorkerPool`]: items are
//! chunked evenly across workers (pair-aligned for mappings so key and
//! value stay together), each worker fills a private output, and a
//! shared [`CancelFlag`] is polled between items.

use std::sync::Mutex;

use loam_core::{Kind, Value};

use crate::builder::Builder;
use crate::decode::{self, DecodeOptions, EventSink, EventSource};
use crate::pool::{CancelFlag, Job, WorkerPool};
use crate::scalar;

/// Element predicate. Mapping entries arrive as `[key, value]` pairs.
pub type Pred<'a> = dyn Fn(Value) -> bool + Sync + 'a;
/// Element transform; returns the replacement element.
pub type MapFn<'a> = dyn Fn(&Builder, Value) -> Value + Sync + 'a;
/// Accumulator step: `f(builder, acc, item) -> acc`.
pub type ReduceFn<'a> = dyn Fn(&Builder, Value, Value) -> Value + Sync + 'a;

/// Parallel execution context for the higher-order ops.
#[derive(Clone, Copy, Default)]
pub struct Parallel<'a> {
    pub pool: Option<&'a dyn WorkerPool>,
    pub cancel: Option<&'a CancelFlag>,
}

/// Operation codes with their arguments.
pub enum Op<'a> {
    CreateNull,
    CreateBool(bool),
    CreateInt(i64),
    CreateFloat(f64),
    CreateString(&'a str),
    CreateSeq(&'a [Value]),
    CreateMap(&'a [(Value, Value)]),
    Insert { at: usize, items: &'a [Value] },
    Replace { at: usize, items: &'a [Value] },
    Append { items: &'a [Value] },
    Concat { others: &'a [Value] },
    Reverse,
    Assoc { pairs: &'a [(Value, Value)] },
    Disassoc { keys: &'a [Value] },
    Keys,
    Values,
    Items,
    Merge { others: &'a [Value] },
    Set { key: Value, value: Value },
    SetAt { index: usize, value: Value },
    SetAtPath { path: &'a [Value], value: Value },
    Get { key: Value },
    GetAt { index: usize },
    GetAtPath { path: &'a [Value] },
    Contains { key: Value },
    Slice { start: usize, end: usize },
    SlicePy { start: i64, end: i64 },
    Take(usize),
    Drop(usize),
    First,
    Last,
    Rest,
    Unique,
    Sort,
    Filter { pred: &'a Pred<'a>, par: Parallel<'a> },
    Map { f: &'a MapFn<'a>, par: Parallel<'a> },
    Reduce { f: &'a ReduceFn<'a>, acc: Value, par: Parallel<'a> },
    Convert { to: Kind },
    Parse { source: &'a mut dyn EventSource, options: DecodeOptions },
    Emit { sink: &'a mut dyn EventSink },
}

/// Dispatch one operation.
pub fn apply(b: &Builder, input: Value, op: Op<'_>) -> Value {
    match op {
        Op::CreateNull => b.null_of(),
        Op::CreateBool(x) => b.bool_of(x),
        Op::CreateInt(x) => b.int_of(x),
        Op::CreateFloat(x) => b.float_of(x),
        Op::CreateString(x) => b.str_of(x),
        Op::CreateSeq(items) => b.sequence_of(items),
        Op::CreateMap(pairs) => b.mapping_of(pairs),
        Op::Insert { at, items } => insert(b, input, at, items),
        Op::Replace { at, items } => replace(b, input, at, items),
        Op::Append { items } => append(b, input, items),
        Op::Concat { others } => concat(b, input, others),
        Op::Reverse => reverse(b, input),
        Op::Assoc { pairs } => assoc(b, input, pairs),
        Op::Disassoc { keys } => disassoc(b, input, keys),
        Op::Keys => keys(b, input),
        Op::Values => values(b, input),
        Op::Items => items(b, input),
        Op::Merge { others } => merge(b, input, others),
        Op::Set { key, value } => set(b, input, key, value),
        Op::SetAt { index, value } => set_at(b, input, index, value),
        Op::SetAtPath { path, value } => set_at_path(b, input, path, value),
        Op::Get { key } => get(b, input, key),
        Op::GetAt { index } => get_at(b, input, index),
        Op::GetAtPath { path } => get_at_path(b, input, path),
        Op::Contains { key } => contains(b, input, key),
        Op::Slice { start, end } => slice(b, input, start, end),
        Op::SlicePy { start, end } => slice_py(b, input, start, end),
        Op::Take(n) => take(b, input, n),
        Op::Drop(n) => drop_n(b, input, n),
        Op::First => first(b, input),
        Op::Last => last(b, input),
        Op::Rest => rest(b, input),
        Op::Unique => unique(b, input),
        Op::Sort => sort(b, input),
        Op::Filter { pred, par } => filter(b, input, pred, par),
        Op::Map { f, par } => map(b, input, f, par),
        Op::Reduce { f, acc, par } => reduce(b, input, f, acc, par),
        Op::Convert { to } => convert(b, input, to),
        Op::Parse { source, options } => parse(b, source, options),
        Op::Emit { sink } => emit(b, input, sink),
    }
}

// ---------------------------------------------------------------------------
// Collection views
// ---------------------------------------------------------------------------

/// Sequence items of `v`, unwrapping one indirect level.
fn seq_view<'a>(v: Value) -> Option<&'a [Value]> {
    // SAFETY: engine contract — op inputs are live values.
    unsafe { v.seq_items() }
}

/// Interleaved mapping words of `v`.
fn map_view<'a>(v: Value) -> Option<&'a [Value]> {
    // SAFETY: engine contract — op inputs are live values.
    unsafe { v.map_words() }
}

fn is_mapping(v: Value) -> bool {
    // SAFETY: engine contract — op inputs are live values.
    unsafe { v.kind_deep() == Kind::Mapping }
}

// ---------------------------------------------------------------------------
// Structural ops (sequences)
// ---------------------------------------------------------------------------

pub fn insert(b: &Builder, input: Value, at: usize, items: &[Value]) -> Value {
    let Some(existing) = seq_view(input) else {
        return Value::INVALID;
    };
    if at > existing.len() {
        return Value::INVALID;
    }
    let Some(total) = existing.len().checked_add(items.len()) else {
        return Value::INVALID;
    };
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&existing[..at]);
    out.extend_from_slice(items);
    out.extend_from_slice(&existing[at..]);
    b.sequence_of(&out)
}

pub fn replace(b: &Builder, input: Value, at: usize, items: &[Value]) -> Value {
    let Some(existing) = seq_view(input) else {
        return Value::INVALID;
    };
    let Some(end) = at.checked_add(items.len()) else {
        return Value::INVALID;
    };
    if end > existing.len() {
        return Value::INVALID;
    }
    let mut out = existing.to_vec();
    out[at..end].copy_from_slice(items);
    b.sequence_of(&out)
}

pub fn append(b: &Builder, input: Value, items: &[Value]) -> Value {
    let Some(existing) = seq_view(input) else {
        return Value::INVALID;
    };
    insert(b, input, existing.len(), items)
}

pub fn concat(b: &Builder, input: Value, others: &[Value]) -> Value {
    let Some(head) = seq_view(input) else {
        return Value::INVALID;
    };
    let mut out = head.to_vec();
    for &other in others {
        let Some(tail) = seq_view(other) else {
            return Value::INVALID;
        };
        out.extend_from_slice(tail);
    }
    b.sequence_of(&out)
}

pub fn reverse(b: &Builder, input: Value) -> Value {
    if let Some(items) = seq_view(input) {
        let mut out = items.to_vec();
        out.reverse();
        return b.sequence_of(&out);
    }
    if let Some(words) = map_view(input) {
        let mut pairs: Vec<&[Value]> = words.chunks_exact(2).collect();
        pairs.reverse();
        let flat: Vec<Value> = pairs.into_iter().flatten().copied().collect();
        return b.mapping_from_flat(&flat);
    }
    Value::INVALID
}

// ---------------------------------------------------------------------------
// Mapping ops
// ---------------------------------------------------------------------------

pub fn assoc(b: &Builder, input: Value, pairs: &[(Value, Value)]) -> Value {
    let Some(words) = map_view(input) else {
        return Value::INVALID;
    };
    let mut out = words.to_vec();
    for &(key, value) in pairs {
        match out.chunks_exact(2).position(|p| b.compare(p[0], key) == 0) {
            Some(i) => out[i * 2 + 1] = value,
            None => {
                out.push(key);
                out.push(value);
            }
        }
    }
    b.mapping_from_flat(&out)
}

pub fn disassoc(b: &Builder, input: Value, keys: &[Value]) -> Value {
    let Some(words) = map_view(input) else {
        return Value::INVALID;
    };
    let mut out = Vec::with_capacity(words.len());
    for pair in words.chunks_exact(2) {
        if !keys.iter().any(|&k| b.compare(pair[0], k) == 0) {
            out.push(pair[0]);
            out.push(pair[1]);
        }
    }
    b.mapping_from_flat(&out)
}

pub fn keys(b: &Builder, input: Value) -> Value {
    let Some(words) = map_view(input) else {
        return Value::INVALID;
    };
    let out: Vec<Value> = words.chunks_exact(2).map(|p| p[0]).collect();
    b.sequence_of(&out)
}

pub fn values(b: &Builder, input: Value) -> Value {
    let Some(words) = map_view(input) else {
        return Value::INVALID;
    };
    let out: Vec<Value> = words.chunks_exact(2).map(|p| p[1]).collect();
    b.sequence_of(&out)
}

/// Mapping entries as a sequence of `[key, value]` pairs.
pub fn items(b: &Builder, input: Value) -> Value {
    let Some(words) = map_view(input) else {
        return Value::INVALID;
    };
    let mut out = Vec::with_capacity(words.len() / 2);
    for pair in words.chunks_exact(2) {
        let entry = b.sequence_of(pair);
        if entry == Value::INVALID {
            return Value::INVALID;
        }
        out.push(entry);
    }
    b.sequence_of(&out)
}

/// Merge mappings; keys already present in `input` (or an earlier
/// argument) win.
pub fn merge(b: &Builder, input: Value, others: &[Value]) -> Value {
    let Some(words) = map_view(input) else {
        return Value::INVALID;
    };
    let mut out = words.to_vec();
    for &other in others {
        let Some(extra) = map_view(other) else {
            return Value::INVALID;
        };
        for pair in extra.chunks_exact(2) {
            let exists = out.chunks_exact(2).any(|p| b.compare(p[0], pair[0]) == 0);
            if !exists {
                out.push(pair[0]);
                out.push(pair[1]);
            }
        }
    }
    b.mapping_from_flat(&out)
}

// ---------------------------------------------------------------------------
// Lookup / update
// ---------------------------------------------------------------------------

/// Mapping: lookup by key. Sequence: `key` must be an integer index.
pub fn get(b: &Builder, input: Value, key: Value) -> Value {
    if is_mapping(input) {
        return b.map_get(input, key);
    }
    if let Some(items) = seq_view(input) {
        // SAFETY: engine contract — `key` is live.
        if let Some(i) = unsafe { key.as_int() } {
            if i >= 0 && (i as usize) < items.len() {
                return items[i as usize];
            }
        }
    }
    Value::INVALID
}

/// Index-based access: sequence element, or mapping entry as `[k, v]`.
pub fn get_at(b: &Builder, input: Value, index: usize) -> Value {
    if let Some(items) = seq_view(input) {
        return items.get(index).copied().unwrap_or(Value::INVALID);
    }
    if let Some(words) = map_view(input) {
        let Some(pair) = words.chunks_exact(2).nth(index) else {
            return Value::INVALID;
        };
        return b.sequence_of(pair);
    }
    Value::INVALID
}

/// Replace by key (mapping) or integer index (sequence), sharing every
/// untouched element.
pub fn set(b: &Builder, input: Value, key: Value, value: Value) -> Value {
    if is_mapping(input) {
        return assoc(b, input, &[(key, value)]);
    }
    // SAFETY: engine contract — `key` is live.
    match unsafe { key.as_int() } {
        Some(i) if i >= 0 => set_at(b, input, i as usize, value),
        _ => Value::INVALID,
    }
}

pub fn set_at(b: &Builder, input: Value, index: usize, value: Value) -> Value {
    if let Some(items) = seq_view(input) {
        if index >= items.len() {
            return Value::INVALID;
        }
        let mut out = items.to_vec();
        out[index] = value;
        return b.sequence_of(&out);
    }
    if let Some(words) = map_view(input) {
        if index >= words.len() / 2 {
            return Value::INVALID;
        }
        let mut out = words.to_vec();
        out[index * 2 + 1] = value;
        return b.mapping_from_flat(&out);
    }
    Value::INVALID
}

/// Walk `path` left to right; `INVALID` on the first missing segment.
pub fn get_at_path(b: &Builder, input: Value, path: &[Value]) -> Value {
    let mut current = input;
    for &segment in path {
        current = get(b, current, segment);
        if current == Value::INVALID {
            return Value::INVALID;
        }
    }
    current
}

/// Rebuild the spine along `path` bottom-up, sharing untouched siblings.
pub fn set_at_path(b: &Builder, input: Value, path: &[Value], value: Value) -> Value {
    let Some((&segment, rest)) = path.split_first() else {
        return b.internalize(value);
    };
    let child = get(b, input, segment);
    if child == Value::INVALID {
        return Value::INVALID;
    }
    let rebuilt = set_at_path(b, child, rest, value);
    if rebuilt == Value::INVALID {
        return Value::INVALID;
    }
    set(b, input, segment, rebuilt)
}

/// Mapping: key present. Sequence: some element equals `key`.
pub fn contains(b: &Builder, input: Value, key: Value) -> Value {
    if is_mapping(input) {
        return b.bool_of(b.map_get(input, key) != Value::INVALID);
    }
    if let Some(items) = seq_view(input) {
        return b.bool_of(items.iter().any(|&i| b.compare(i, key) == 0));
    }
    Value::INVALID
}

// ---------------------------------------------------------------------------
// Sequence slicing
// ---------------------------------------------------------------------------

pub fn slice(b: &Builder, input: Value, start: usize, end: usize) -> Value {
    let Some(items) = seq_view(input) else {
        return Value::INVALID;
    };
    let end = end.min(items.len());
    let start = start.min(end);
    b.sequence_of(&items[start..end])
}

/// Python-style slicing: negative indices count from the end, and
/// out-of-range bounds clamp.
pub fn slice_py(b: &Builder, input: Value, start: i64, end: i64) -> Value {
    let Some(items) = seq_view(input) else {
        return Value::INVALID;
    };
    let len = items.len() as i64;
    let norm = |i: i64| -> usize {
        let i = if i < 0 { i + len } else { i };
        i.clamp(0, len) as usize
    };
    let (start, end) = (norm(start), norm(end));
    let start = start.min(end);
    b.sequence_of(&items[start..end])
}

pub fn take(b: &Builder, input: Value, n: usize) -> Value {
    slice(b, input, 0, n)
}

pub fn drop_n(b: &Builder, input: Value, n: usize) -> Value {
    slice(b, input, n, usize::MAX)
}

pub fn first(_b: &Builder, input: Value) -> Value {
    match seq_view(input) {
        Some(items) => items.first().copied().unwrap_or(Value::INVALID),
        None => Value::INVALID,
    }
}

pub fn last(_b: &Builder, input: Value) -> Value {
    match seq_view(input) {
        Some(items) => items.last().copied().unwrap_or(Value::INVALID),
        None => Value::INVALID,
    }
}

pub fn rest(b: &Builder, input: Value) -> Value {
    drop_n(b, input, 1)
}

/// Drop structural duplicates; the first occurrence stays.
pub fn unique(b: &Builder, input: Value) -> Value {
    let Some(items) = seq_view(input) else {
        return Value::INVALID;
    };
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for &item in items {
        if !out.iter().any(|&seen| b.compare(seen, item) == 0) {
            out.push(item);
        }
    }
    b.sequence_of(&out)
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

/// Stable structural sort. Sequences sort elements; mappings sort pairs
/// by key.
pub fn sort(b: &Builder, input: Value) -> Value {
    if let Some(items) = seq_view(input) {
        let mut out = items.to_vec();
        out.sort_by(|&x, &y| cmp_ordering(b.compare(x, y)));
        return b.sequence_of(&out);
    }
    if let Some(words) = map_view(input) {
        let mut pairs: Vec<&[Value]> = words.chunks_exact(2).collect();
        pairs.sort_by(|x, y| cmp_ordering(b.compare(x[0], y[0])));
        let flat: Vec<Value> = pairs.into_iter().flatten().copied().collect();
        return b.mapping_from_flat(&flat);
    }
    Value::INVALID
}

fn cmp_ordering(c: i32) -> std::cmp::Ordering {
    match c {
        x if x < 0 => std::cmp::Ordering::Less,
        0 => std::cmp::Ordering::Equal,
        _ => std::cmp::Ordering::Greater,
    }
}

// ---------------------------------------------------------------------------
// Higher-order ops
// ---------------------------------------------------------------------------

/// Items of either collection kind, plus the pair width (2 for
/// mappings so chunking keeps keys with their values).
fn hot_view<'a>(input: Value) -> Option<(&'a [Value], usize)> {
    if let Some(items) = seq_view(input) {
        return Some((items, 1));
    }
    map_view(input).map(|words| (words, 2))
}

/// Split into at most `workers` chunks whose length is a multiple of
/// `stride`.
fn chunk_evenly(words: &[Value], workers: usize, stride: usize) -> Vec<&[Value]> {
    let groups = words.len() / stride;
    if groups == 0 {
        return Vec::new();
    }
    let per = groups.div_ceil(workers.max(1)) * stride;
    words.chunks(per).collect()
}

/// Run `work` over the chunks on the pool, keeping chunk order.
fn run_chunks<'a, T, W>(pool: &dyn WorkerPool, chunks: Vec<&'a [Value]>, work: W) -> Vec<T>
where
    T: Send,
    W: Fn(&'a [Value]) -> T + Sync,
{
    let slots: Mutex<Vec<Option<T>>> = Mutex::new((0..chunks.len()).map(|_| None).collect());
    let jobs: Vec<Job<'_>> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let slots = &slots;
            let work = &work;
            Box::new(move || {
                let out = work(chunk);
                slots.lock().expect("worker slot poisoned")[i] = Some(out);
            }) as Job<'_>
        })
        .collect();
    pool.run(jobs);
    slots
        .into_inner()
        .expect("worker slot poisoned")
        .into_iter()
        .map(|slot| slot.expect("pool dropped a job"))
        .collect()
}

fn cancelled(par: &Parallel<'_>) -> bool {
    par.cancel.is_some_and(|c| c.is_cancelled())
}

/// Keep elements the predicate accepts. Mapping entries are passed to
/// the predicate as `[key, value]` sequences.
pub fn filter(b: &Builder, input: Value, pred: &Pred<'_>, par: Parallel<'_>) -> Value {
    let Some((words, stride)) = hot_view(input) else {
        return Value::INVALID;
    };
    let probe = |pair: &[Value]| -> Option<bool> {
        if stride == 1 {
            Some(pred(pair[0]))
        } else {
            let entry = b.sequence_of(pair);
            if entry == Value::INVALID {
                return None;
            }
            Some(pred(entry))
        }
    };

    let kept: Vec<Value> = match par.pool {
        Some(pool) if words.len() > stride => {
            let chunks = chunk_evenly(words, pool.workers(), stride);
            let partials = run_chunks(pool, chunks, |chunk| {
                let mut out = Vec::new();
                for pair in chunk.chunks_exact(stride) {
                    if cancelled(&par) {
                        return None;
                    }
                    match probe(pair) {
                        Some(true) => out.extend_from_slice(pair),
                        Some(false) => {}
                        None => return None,
                    }
                }
                Some(out)
            });
            let mut out = Vec::new();
            for partial in partials {
                match partial {
                    Some(part) => out.extend(part),
                    None => return Value::INVALID,
                }
            }
            out
        }
        _ => {
            let mut out = Vec::new();
            for pair in words.chunks_exact(stride) {
                if cancelled(&par) {
                    return Value::INVALID;
                }
                match probe(pair) {
                    Some(true) => out.extend_from_slice(pair),
                    Some(false) => {}
                    None => return Value::INVALID,
                }
            }
            out
        }
    };

    if stride == 1 {
        b.sequence_of(&kept)
    } else {
        b.mapping_from_flat(&kept)
    }
}

/// Transform every element. For mappings the transform receives and
/// must return a `[key, value]` pair.
pub fn map(b: &Builder, input: Value, f: &MapFn<'_>, par: Parallel<'_>) -> Value {
    let Some((words, stride)) = hot_view(input) else {
        return Value::INVALID;
    };
    let step = |pair: &[Value]| -> Option<Vec<Value>> {
        if stride == 1 {
            let out = f(b, pair[0]);
            if out == Value::INVALID {
                return None;
            }
            Some(vec![out])
        } else {
            let entry = b.sequence_of(pair);
            if entry == Value::INVALID {
                return None;
            }
            let out = f(b, entry);
            let new_pair = seq_view(out)?;
            if new_pair.len() != 2 {
                return None;
            }
            Some(new_pair.to_vec())
        }
    };

    let produced: Vec<Value> = match par.pool {
        Some(pool) if words.len() > stride => {
            let chunks = chunk_evenly(words, pool.workers(), stride);
            let partials = run_chunks(pool, chunks, |chunk| {
                let mut out = Vec::with_capacity(chunk.len());
                for pair in chunk.chunks_exact(stride) {
                    if cancelled(&par) {
                        return None;
                    }
                    out.extend(step(pair)?);
                }
                Some(out)
            });
            let mut out = Vec::with_capacity(words.len());
            for partial in partials {
                match partial {
                    Some(part) => out.extend(part),
                    None => return Value::INVALID,
                }
            }
            out
        }
        _ => {
            let mut out = Vec::with_capacity(words.len());
            for pair in words.chunks_exact(stride) {
                if cancelled(&par) {
                    return Value::INVALID;
                }
                match step(pair) {
                    Some(part) => out.extend(part),
                    None => return Value::INVALID,
                }
            }
            out
        }
    };

    if stride == 1 {
        b.sequence_of(&produced)
    } else {
        b.mapping_from_flat(&produced)
    }
}

/// Fold the collection into one value. In parallel each worker folds
/// its chunk seeded with `acc`, and the partials fold single-threaded,
/// so `f` should be associative.
pub fn reduce(b: &Builder, input: Value, f: &ReduceFn<'_>, acc: Value, par: Parallel<'_>) -> Value {
    let Some((words, stride)) = hot_view(input) else {
        return Value::INVALID;
    };
    let step = |mut current: Value, pair: &[Value]| -> Value {
        if current == Value::INVALID {
            return Value::INVALID;
        }
        let item = if stride == 1 {
            pair[0]
        } else {
            let entry = b.sequence_of(pair);
            if entry == Value::INVALID {
                return Value::INVALID;
            }
            entry
        };
        current = f(b, current, item);
        current
    };

    match par.pool {
        Some(pool) if words.len() > stride => {
            let chunks = chunk_evenly(words, pool.workers(), stride);
            let partials = run_chunks(pool, chunks, |chunk| {
                let mut current = acc;
                for pair in chunk.chunks_exact(stride) {
                    if cancelled(&par) {
                        return Value::INVALID;
                    }
                    current = step(current, pair);
                    if current == Value::INVALID {
                        return Value::INVALID;
                    }
                }
                current
            });
            let mut iter = partials.into_iter();
            let Some(mut total) = iter.next() else {
                return acc;
            };
            for partial in iter {
                if partial == Value::INVALID || total == Value::INVALID {
                    return Value::INVALID;
                }
                total = f(b, total, partial);
            }
            total
        }
        _ => {
            let mut current = acc;
            for pair in words.chunks_exact(stride) {
                if cancelled(&par) {
                    return Value::INVALID;
                }
                current = step(current, pair);
                if current == Value::INVALID {
                    return Value::INVALID;
                }
            }
            current
        }
    }
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

/// Convert between kinds. Strings re-classify through the schema with
/// the target kind forced; collections convert between pair-sequences
/// and mappings.
pub fn convert(b: &Builder, input: Value, to: Kind) -> Value {
    // SAFETY: engine contract — op inputs are live values.
    let from = unsafe { input.kind_deep() };
    if from == to {
        return b.internalize(input);
    }
    // SAFETY: as above; each accessor matches the checked kind.
    unsafe {
        match (from, to) {
            (Kind::Null, Kind::String) => b.str_of("null"),
            (Kind::Bool, Kind::Int) => b.int_of(input.as_bool().unwrap() as i64),
            (Kind::Bool, Kind::String) => {
                b.str_of(if input.as_bool().unwrap() { "true" } else { "false" })
            }
            (Kind::Int, Kind::Float) => b.float_of(input.as_int().unwrap() as f64),
            (Kind::Int, Kind::Bool) => b.bool_of(input.as_int().unwrap() != 0),
            (Kind::Int, Kind::String) => b.str_of(&input.as_int().unwrap().to_string()),
            (Kind::Float, Kind::Int) => {
                let d = input.as_float().unwrap();
                if d.is_finite() && d >= i64::MIN as f64 && d <= i64::MAX as f64 {
                    b.int_of(d as i64)
                } else {
                    Value::INVALID
                }
            }
            (Kind::Float, Kind::String) => b.str_of(&format_float(input.as_float().unwrap())),
            (Kind::String, _) => {
                let Some(text) = input.as_str() else {
                    return Value::INVALID;
                };
                scalar::scalar_from_text(b, text, b.schema(), Some(to))
            }
            (Kind::Sequence, Kind::Mapping) => {
                let items = input.seq_items().unwrap();
                let mut flat = Vec::with_capacity(items.len() * 2);
                for &item in items {
                    let Some(pair) = item.seq_items() else {
                        return Value::INVALID;
                    };
                    if pair.len() != 2 {
                        return Value::INVALID;
                    }
                    flat.extend_from_slice(pair);
                }
                b.mapping_from_flat(&flat)
            }
            (Kind::Mapping, Kind::Sequence) => items(b, input),
            _ => Value::INVALID,
        }
    }
}

fn format_float(d: f64) -> String {
    if d.is_nan() {
        ".nan".to_owned()
    } else if d == f64::INFINITY {
        ".inf".to_owned()
    } else if d == f64::NEG_INFINITY {
        "-.inf".to_owned()
    } else {
        format!("{d:?}")
    }
}

// ---------------------------------------------------------------------------
// I/O bridges
// ---------------------------------------------------------------------------

/// Decode one document from an event source; the root (or directory
/// when requested) becomes the result.
pub fn parse(b: &Builder, source: &mut dyn EventSource, options: DecodeOptions) -> Value {
    let directory = options.directory;
    match decode::decode(b, source, options) {
        Ok(docs) => match docs.first() {
            Some(doc) if directory => doc.directory,
            Some(doc) => doc.root,
            None => Value::INVALID,
        },
        Err(_) => Value::INVALID,
    }
}

/// Replay `input` into an event sink; returns the input on success.
pub fn emit(b: &Builder, input: Value, sink: &mut dyn EventSink) -> Value {
    match decode::emit(b, input, sink) {
        Ok(()) => input,
        Err(_) => Value::INVALID,
    }
}
