//! Decoder glue between an event parser and the builder.
//!
//! The lexer/parser lives outside this crate; it drives the decoder with
//! a stream of [`Event`]s and gets back one value tree per document.
//! The decoder owns the bookkeeping a composer needs:
//!
//! - a stack of in-progress collections,
//! - the anchor registry — `complete` anchors whose value is known, and
//!   `collecting` anchors whose collection is still open (a nest counter
//!   per entry tells when it closes),
//! - alias resolution, including the self-referential case,
//! - YAML 1.1 merge keys (`<<`), mapping or sequence-of-mappings
//!   argument, existing keys winning,
//! - adoption of the document's schema when the builder's is `Auto`,
//! - an optional per-document directory value.
//!
//! The reverse direction, [`emit`], walks a value tree and replays the
//! event stream, quoting plain strings that would re-classify.

use loam_core::{Kind, ScalarStyle, Value};
use tracing::debug;

use crate::builder::{Builder, IndirectSpec};
use crate::scalar::{self, Schema};

/// Composer events, the contract with the external parser and emitter.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StreamStart,
    StreamEnd,
    DocumentStart {
        explicit: bool,
        /// `Some` when a `%YAML` directive was present.
        version: Option<(u32, u32)>,
        /// `%TAG` handle/prefix pairs.
        tags: Vec<(String, String)>,
    },
    DocumentEnd {
        explicit: bool,
    },
    Scalar {
        value: String,
        anchor: Option<String>,
        tag: Option<String>,
        style: ScalarStyle,
    },
    Alias {
        anchor: String,
    },
    SequenceStart {
        anchor: Option<String>,
        tag: Option<String>,
        flow: bool,
    },
    SequenceEnd,
    MappingStart {
        anchor: Option<String>,
        tag: Option<String>,
        flow: bool,
    },
    MappingEnd,
}

/// Anything that can produce events. Every `Iterator<Item = Event>`
/// qualifies, so tests can drive the decoder from a `Vec`.
pub trait EventSource {
    fn next_event(&mut self) -> Option<Event>;
}

impl<I: Iterator<Item = Event>> EventSource for I {
    fn next_event(&mut self) -> Option<Event> {
        self.next()
    }
}

/// Anything that can consume events.
pub trait EventSink {
    fn event(&mut self, event: Event) -> Result<(), DecodeError>;
}

impl EventSink for Vec<Event> {
    fn event(&mut self, event: Event) -> Result<(), DecodeError> {
        self.push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Alias names an anchor that was never defined.
    UnresolvedAlias(String),
    /// Alias names an anchor whose collection is still open.
    RecursiveAlias(String),
    /// Event sequence violates the grammar (e.g. end without start).
    UnexpectedEvent(&'static str),
    /// Structurally bad input (odd mapping, bad merge argument).
    InvalidInput(&'static str),
    /// The builder's allocator refused.
    OutOfMemory,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::UnresolvedAlias(name) => write!(f, "unresolved alias *{name}"),
            DecodeError::RecursiveAlias(name) => write!(f, "recursive alias *{name}"),
            DecodeError::UnexpectedEvent(what) => write!(f, "unexpected event: {what}"),
            DecodeError::InvalidInput(what) => write!(f, "invalid input: {what}"),
            DecodeError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Replace aliases with the anchored value. Off, aliases stay in the
    /// tree as alias values.
    pub resolve_aliases: bool,
    /// Build the per-document directory mapping.
    pub directory: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        DecodeOptions {
            resolve_aliases: true,
            directory: false,
        }
    }
}

/// One decoded document.
#[derive(Debug, Clone, Copy)]
pub struct Document {
    pub root: Value,
    /// The directory mapping, when requested; `INVALID` otherwise.
    pub directory: Value,
}

enum Frame {
    Seq {
        items: Vec<Value>,
        anchor: Option<String>,
        tag: Option<String>,
        flow: bool,
    },
    Map {
        words: Vec<Value>,
        merges: Vec<Value>,
        have_key: bool,
        awaiting_merge: bool,
        anchor: Option<String>,
        tag: Option<String>,
        flow: bool,
    },
}

struct Collecting {
    name: String,
    nest: u32,
}

struct DocMeta {
    version: Option<(u32, u32)>,
    tags: Vec<(String, String)>,
}

pub struct Decoder<'b> {
    builder: &'b Builder,
    opts: DecodeOptions,
    /// Effective schema for the current document.
    schema: Schema,
    frames: Vec<Frame>,
    complete: Vec<(String, Value)>,
    collecting: Vec<Collecting>,
    doc: Option<DocMeta>,
    root: Option<Value>,
}

impl<'b> Decoder<'b> {
    pub fn new(builder: &'b Builder, opts: DecodeOptions) -> Self {
        let schema = match builder.schema() {
            Schema::Auto => Schema::V12Core,
            s => s,
        };
        Decoder {
            builder,
            opts,
            schema,
            frames: Vec::new(),
            complete: Vec::new(),
            collecting: Vec::new(),
            doc: None,
            root: None,
        }
    }

    /// Feed one event; returns a document when one completes.
    pub fn feed(&mut self, event: Event) -> Result<Option<Document>, DecodeError> {
        match event {
            Event::StreamStart => Ok(None),
            Event::StreamEnd => {
                if !self.frames.is_empty() {
                    return Err(DecodeError::UnexpectedEvent("stream end inside collection"));
                }
                Ok(None)
            }
            Event::DocumentStart {
                version, tags, ..
            } => {
                self.schema = match self.builder.schema() {
                    // Adopt the parser-reported version.
                    Schema::Auto => match version {
                        Some((1, 1)) => Schema::V11,
                        _ => Schema::V12Core,
                    },
                    s => s,
                };
                self.doc = Some(DocMeta { version, tags });
                self.root = None;
                Ok(None)
            }
            Event::DocumentEnd { .. } => self.end_document(),
            Event::Scalar {
                value,
                anchor,
                tag,
                style,
            } => self.on_scalar(&value, anchor, tag, style),
            Event::Alias { anchor } => self.on_alias(&anchor),
            Event::SequenceStart { anchor, tag, flow } => {
                self.open_collection(anchor.clone());
                self.frames.push(Frame::Seq {
                    items: Vec::new(),
                    anchor,
                    tag,
                    flow,
                });
                Ok(None)
            }
            Event::SequenceEnd => {
                let Some(Frame::Seq {
                    items,
                    anchor,
                    tag,
                    flow,
                }) = self.frames.pop()
                else {
                    return Err(DecodeError::UnexpectedEvent("sequence end"));
                };
                let seq = self.builder.sequence_of(&items);
                if seq == Value::INVALID {
                    return Err(DecodeError::OutOfMemory);
                }
                let node = self.finish_node(seq, anchor, tag, ScalarStyle::Plain, flow)?;
                self.close_collections(node);
                self.complete_node(node)
            }
            Event::MappingStart { anchor, tag, flow } => {
                self.open_collection(anchor.clone());
                self.frames.push(Frame::Map {
                    words: Vec::new(),
                    merges: Vec::new(),
                    have_key: false,
                    awaiting_merge: false,
                    anchor,
                    tag,
                    flow,
                });
                Ok(None)
            }
            Event::MappingEnd => {
                let Some(Frame::Map {
                    words,
                    merges,
                    have_key,
                    awaiting_merge,
                    anchor,
                    tag,
                    flow,
                }) = self.frames.pop()
                else {
                    return Err(DecodeError::UnexpectedEvent("mapping end"));
                };
                if have_key || awaiting_merge {
                    return Err(DecodeError::InvalidInput("mapping key without value"));
                }
                let map = self.build_mapping(words, merges)?;
                let node = self.finish_node(map, anchor, tag, ScalarStyle::Plain, flow)?;
                self.close_collections(node);
                self.complete_node(node)
            }
        }
    }

    fn end_document(&mut self) -> Result<Option<Document>, DecodeError> {
        if !self.frames.is_empty() {
            return Err(DecodeError::UnexpectedEvent("document end inside collection"));
        }
        let root = self.root.take().unwrap_or(Value::NULL);
        let meta = self.doc.take();
        let directory = if self.opts.directory {
            self.build_directory(root, meta.as_ref())?
        } else {
            Value::INVALID
        };
        // Anchors do not cross documents.
        self.complete.clear();
        self.collecting.clear();
        debug!(target: "loam::decode", "document complete");
        Ok(Some(Document { root, directory }))
    }

    fn on_scalar(
        &mut self,
        text: &str,
        anchor: Option<String>,
        tag: Option<String>,
        style: ScalarStyle,
    ) -> Result<Option<Document>, DecodeError> {
        // YAML 1.1 merge key in key position.
        if self.schema == Schema::V11
            && self.opts.resolve_aliases
            && style == ScalarStyle::Plain
            && text == "<<"
            && tag.is_none()
        {
            if let Some(Frame::Map {
                have_key: false,
                awaiting_merge,
                ..
            }) = self.frames.last_mut()
            {
                *awaiting_merge = true;
                return Ok(None);
            }
        }

        let force = tag.as_deref().and_then(force_kind_for_tag);
        let value = if style != ScalarStyle::Plain {
            // Any quoted or block style pins the scalar to a string.
            self.builder.string_of(text.as_bytes())
        } else {
            scalar::scalar_from_text(self.builder, text, self.schema, force)
        };
        if value == Value::INVALID {
            return Err(DecodeError::InvalidInput("scalar rejected by forced tag"));
        }
        let node = self.finish_node(value, anchor.clone(), tag, style, false)?;
        if self.opts.resolve_aliases {
            if let Some(name) = anchor {
                self.complete.push((name, node));
            }
        }
        self.complete_node(node)
    }

    fn on_alias(&mut self, name: &str) -> Result<Option<Document>, DecodeError> {
        if !self.opts.resolve_aliases {
            let alias = self.builder.alias_of(name);
            if alias == Value::INVALID {
                return Err(DecodeError::OutOfMemory);
            }
            return self.complete_node(alias);
        }
        // Latest definition wins.
        if let Some((_, value)) = self.complete.iter().rev().find(|(n, _)| n == name) {
            let value = *value;
            return self.complete_node(value);
        }
        if self.collecting.iter().any(|c| c.name == name) {
            return Err(DecodeError::RecursiveAlias(name.to_owned()));
        }
        Err(DecodeError::UnresolvedAlias(name.to_owned()))
    }

    /// Every collection start deepens all collecting anchors; an
    /// anchored start registers a new one.
    fn open_collection(&mut self, anchor: Option<String>) {
        for c in self.collecting.iter_mut() {
            c.nest += 1;
        }
        if self.opts.resolve_aliases {
            if let Some(name) = anchor {
                self.collecting.push(Collecting { name, nest: 1 });
            }
        }
    }

    /// Wrap a finished node when it carries presentation or naming.
    fn finish_node(
        &mut self,
        value: Value,
        anchor: Option<String>,
        tag: Option<String>,
        style: ScalarStyle,
        flow: bool,
    ) -> Result<Value, DecodeError> {
        let keep_anchor = !self.opts.resolve_aliases && anchor.is_some();
        let needs_wrap =
            keep_anchor || tag.is_some() || style != ScalarStyle::Plain || flow;
        if !needs_wrap {
            return Ok(value);
        }
        let spec = IndirectSpec {
            value: Some(value),
            anchor: if keep_anchor {
                anchor.as_deref().map(|a| self.builder.str_of(a))
            } else {
                None
            },
            tag: tag.as_deref().map(|t| self.builder.str_of(t)),
            style,
            flow,
        };
        let wrapped = self.builder.indirect_of(spec);
        if wrapped == Value::INVALID {
            return Err(DecodeError::OutOfMemory);
        }
        Ok(wrapped)
    }

    /// A collection just closed: unwind one nesting level. Collecting
    /// anchors whose counter reaches zero were opened on this very
    /// collection and graduate to complete with its value.
    fn close_collections(&mut self, value: Value) {
        let mut graduated = Vec::new();
        for c in self.collecting.iter_mut() {
            c.nest -= 1;
            if c.nest == 0 {
                graduated.push(std::mem::take(&mut c.name));
            }
        }
        self.collecting.retain(|c| c.nest > 0);
        for name in graduated {
            self.complete.push((name, value));
        }
    }

    /// Route a completed node into the open frame, or make it the root.
    fn complete_node(&mut self, value: Value) -> Result<Option<Document>, DecodeError> {
        match self.frames.last_mut() {
            None => {
                self.root = Some(value);
                Ok(None)
            }
            Some(Frame::Seq { items, .. }) => {
                items.push(value);
                Ok(None)
            }
            Some(Frame::Map {
                words,
                merges,
                have_key,
                awaiting_merge,
                ..
            }) => {
                if *awaiting_merge {
                    merges.push(value);
                    *awaiting_merge = false;
                } else if *have_key {
                    words.push(value);
                    *have_key = false;
                } else {
                    words.push(value);
                    *have_key = true;
                }
                Ok(None)
            }
        }
    }

    /// Apply merge arguments (existing keys win, first occurrence wins
    /// inside the merge) and build the mapping.
    fn build_mapping(
        &self,
        mut words: Vec<Value>,
        merges: Vec<Value>,
    ) -> Result<Value, DecodeError> {
        for merge in merges {
            // SAFETY: merge values were built by this decoder's builder
            // (or resolved from its anchors) and are live.
            unsafe {
                match merge.kind_deep() {
                    Kind::Mapping => self.merge_one(&mut words, merge)?,
                    Kind::Sequence => {
                        let items = merge.seq_items().ok_or(DecodeError::OutOfMemory)?;
                        for &item in items {
                            if item.kind_deep() != Kind::Mapping {
                                return Err(DecodeError::InvalidInput(
                                    "merge sequence item is not a mapping",
                                ));
                            }
                            self.merge_one(&mut words, item)?;
                        }
                    }
                    _ => {
                        return Err(DecodeError::InvalidInput(
                            "merge argument is not a mapping or sequence of mappings",
                        ))
                    }
                }
            }
        }
        let map = self.builder.mapping_from_flat(&words);
        if map == Value::INVALID {
            return Err(DecodeError::OutOfMemory);
        }
        Ok(map)
    }

    /// Merge one mapping's pairs into `words`; keys already present win.
    unsafe fn merge_one(&self, words: &mut Vec<Value>, map: Value) -> Result<(), DecodeError> {
        let pairs = unsafe { map.map_words() }.ok_or(DecodeError::OutOfMemory)?;
        for pair in pairs.chunks_exact(2) {
            let exists = words
                .chunks_exact(2)
                .any(|p| self.builder.compare(p[0], pair[0]) == 0);
            if !exists {
                words.push(pair[0]);
                words.push(pair[1]);
            }
        }
        Ok(())
    }

    fn build_directory(
        &self,
        root: Value,
        meta: Option<&DocMeta>,
    ) -> Result<Value, DecodeError> {
        let b = self.builder;
        let version = meta.and_then(|m| m.version);
        let (major, minor) = version.unwrap_or((1, 2));
        let tag_pairs: Vec<(Value, Value)> = meta
            .map(|m| {
                m.tags
                    .iter()
                    .map(|(h, p)| (b.str_of(h), b.str_of(p)))
                    .collect()
            })
            .unwrap_or_default();
        let tags_explicit = !tag_pairs.is_empty();
        let tags = b.mapping_of(&tag_pairs);
        let dir = b.mapping_of(&[
            (b.str_of("root"), root),
            (b.str_of("version"), b.str_of(&format!("{major}.{minor}"))),
            (b.str_of("version-explicit"), b.bool_of(version.is_some())),
            (b.str_of("tags"), tags),
            (b.str_of("tags-explicit"), b.bool_of(tags_explicit)),
            (b.str_of("schema"), b.str_of(self.schema.name())),
        ]);
        if dir == Value::INVALID {
            return Err(DecodeError::OutOfMemory);
        }
        Ok(dir)
    }
}

/// Decode every document a source yields.
pub fn decode<S: EventSource + ?Sized>(
    builder: &Builder,
    source: &mut S,
    opts: DecodeOptions,
) -> Result<Vec<Document>, DecodeError> {
    let mut decoder = Decoder::new(builder, opts);
    let mut docs = Vec::new();
    while let Some(event) = source.next_event() {
        if let Some(doc) = decoder.feed(event)? {
            docs.push(doc);
        }
    }
    Ok(docs)
}

/// Core-schema shorthand and full tags that force a scalar kind.
fn force_kind_for_tag(tag: &str) -> Option<Kind> {
    match tag {
        "!!str" | "tag:yaml.org,2002:str" => Some(Kind::String),
        "!!int" | "tag:yaml.org,2002:int" => Some(Kind::Int),
        "!!float" | "tag:yaml.org,2002:float" => Some(Kind::Float),
        "!!bool" | "tag:yaml.org,2002:bool" => Some(Kind::Bool),
        "!!null" | "tag:yaml.org,2002:null" => Some(Kind::Null),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Emission
// ---------------------------------------------------------------------------

/// Replay a value tree as events, one implicit document.
pub fn emit(builder: &Builder, value: Value, sink: &mut dyn EventSink) -> Result<(), DecodeError> {
    sink.event(Event::StreamStart)?;
    sink.event(Event::DocumentStart {
        explicit: false,
        version: None,
        tags: Vec::new(),
    })?;
    emit_node(builder, value, sink)?;
    sink.event(Event::DocumentEnd { explicit: false })?;
    sink.event(Event::StreamEnd)
}

fn emit_node(
    builder: &Builder,
    value: Value,
    sink: &mut dyn EventSink,
) -> Result<(), DecodeError> {
    let mut anchor = None;
    let mut tag = None;
    let mut style = ScalarStyle::Plain;
    let mut flow = false;
    let mut inner = value;

    // SAFETY: emitted values are live by the engine contract.
    unsafe {
        if let Some(view) = value.indirect() {
            if view.is_alias() {
                let name = view
                    .anchor
                    .as_ref()
                    .and_then(|a| a.as_str())
                    .ok_or(DecodeError::InvalidInput("alias without anchor name"))?;
                return sink.event(Event::Alias {
                    anchor: name.to_owned(),
                });
            }
            anchor = view
                .anchor
                .as_ref()
                .and_then(|a| a.as_str())
                .map(str::to_owned);
            tag = view.tag.as_ref().and_then(|t| t.as_str()).map(str::to_owned);
            style = view.style();
            flow = view.flow();
            inner = view.value.ok_or(DecodeError::InvalidInput("empty indirect"))?;
        }

        match inner.kind() {
            Kind::Null => sink.event(Event::Scalar {
                value: "null".to_owned(),
                anchor,
                tag,
                style,
            }),
            Kind::Bool => sink.event(Event::Scalar {
                value: if inner.as_bool().unwrap() { "true" } else { "false" }.to_owned(),
                anchor,
                tag,
                style,
            }),
            Kind::Int => sink.event(Event::Scalar {
                value: inner.as_int().ok_or(DecodeError::InvalidInput("int"))?.to_string(),
                anchor,
                tag,
                style,
            }),
            Kind::Float => {
                let d = inner.as_float().ok_or(DecodeError::InvalidInput("float"))?;
                sink.event(Event::Scalar {
                    value: float_text(d),
                    anchor,
                    tag,
                    style,
                })
            }
            Kind::String => {
                let text = inner
                    .as_str()
                    .ok_or(DecodeError::InvalidInput("non-UTF-8 string"))?
                    .to_owned();
                // A plain string that would re-classify must be quoted.
                let style = if style == ScalarStyle::Plain
                    && scalar::classify_kind(&text, builder.schema()) != Kind::String
                {
                    ScalarStyle::SingleQuoted
                } else {
                    style
                };
                sink.event(Event::Scalar {
                    value: text,
                    anchor,
                    tag,
                    style,
                })
            }
            Kind::Sequence => {
                sink.event(Event::SequenceStart { anchor, tag, flow })?;
                for &item in inner.seq_items().ok_or(DecodeError::InvalidInput("seq"))? {
                    emit_node(builder, item, sink)?;
                }
                sink.event(Event::SequenceEnd)
            }
            Kind::Mapping => {
                sink.event(Event::MappingStart { anchor, tag, flow })?;
                for &word in inner.map_words().ok_or(DecodeError::InvalidInput("map"))? {
                    emit_node(builder, word, sink)?;
                }
                sink.event(Event::MappingEnd)
            }
            _ => Err(DecodeError::InvalidInput("unemittable value")),
        }
    }
}

fn float_text(d: f64) -> String {
    if d.is_nan() {
        ".nan".to_owned()
    } else if d == f64::INFINITY {
        ".inf".to_owned()
    } else if d == f64::NEG_INFINITY {
        "-.inf".to_owned()
    } else {
        // Debug formatting keeps the decimal point ("150.0", not "150").
        format!("{d:?}")
    }
}
