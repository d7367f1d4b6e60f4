//! Mark-sweep-compact collection over the word arena.
//!
//! A collection runs in four passes: mark from the registered roots with an
//! explicit worklist, nil out weak references to unmarked objects, sweep
//! dead runs into free chunks while recording each survivor's forwarding
//! index in its header cache word, then rewrite every reference field and
//! slide the survivors down. The world is stopped throughout; the
//! interpreter registers every root explicitly, so there is no stack
//! scanning anywhere.

use std::time::Instant;

use log::{debug, warn};
use serde::Serialize;

use crate::memory::header::*;
use crate::memory::heap::{Heap, RESERVED_WORDS};
use crate::memory::value::{Ref, Value};

// Weak arrays found during marking are recorded in a side list so the fixup
// pass does not rescan the arena. Past the cap a full scan runs instead; see
// `collect`.
const WEAK_LIST_CAP: usize = 100;

/// Every root the mutator holds, copied in before a collection and read
/// back after. A reference that is not registered here (and not reachable
/// from one that is) does not survive.
#[derive(Default)]
pub struct RootSet {
    pub(crate) values: Vec<Value>,
    /// The class table; consulted during marking so every object's class
    /// survives with its instances.
    pub class_table: Option<Ref>,
}

impl RootSet {
    pub fn new() -> RootSet {
        RootSet {
            values: Vec::with_capacity(64),
            class_table: None,
        }
    }

    /// Registers a root and returns its slot for reading back after the
    /// collection.
    pub fn push(&mut self, v: Value) -> usize {
        self.values.push(v);
        self.values.len() - 1
    }

    pub fn get(&self, slot: usize) -> Value {
        self.values[slot]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Outcome of one collection.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GcStats {
    pub recovered_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub marked_objects: usize,
    pub duration_micros: u64,
}

struct MarkOutcome {
    marked: usize,
    weak: Vec<Ref>,
    overflow: bool,
}

impl Heap {
    /// Runs a full stop-the-world collection and returns its stats.
    ///
    /// All values in `roots` are rewritten to the survivors' new locations;
    /// the caller must read every register back out afterwards. Survivor
    /// cache words are cleared by the move, which doubles as a global
    /// call-site cache flush.
    pub fn collect(&mut self, roots: &mut RootSet) -> GcStats {
        let started = Instant::now();
        let used_before = self.used_bytes();
        #[cfg(feature = "gc-telemetry")]
        self.telemetry.begin_cycle(used_before);

        let mark = self.mark_phase(roots);
        self.process_weak(&mark.weak);
        if mark.overflow {
            warn!(
                "gc: weak side list exceeded {} entries; falling back to a full scan",
                WEAK_LIST_CAP
            );
            self.process_weak_full_scan();
        }
        self.sweep_and_forward();
        self.update_refs(roots);
        self.compact_move();

        self.allocations_since_gc = 0;
        self.bytes_since_gc = 0;
        self.gc_count += 1;
        self.gc_needed = false;
        let free = self.free_bytes();
        self.gc_threshold = free / 10;
        if self.gc_threshold < 1_000_000 {
            self.gc_threshold = free / 2;
        }

        let used = self.used_bytes();
        let stats = GcStats {
            recovered_bytes: used_before - used,
            used_bytes: used,
            free_bytes: free,
            marked_objects: mark.marked,
            duration_micros: started.elapsed().as_micros() as u64,
        };
        debug!(
            "gc: recovered {}k in {}us; used {}k ({:.1}% of {}k) {}k free",
            stats.recovered_bytes / 1000,
            stats.duration_micros,
            used / 1000,
            100.0 * used as f64 / self.capacity_bytes() as f64,
            self.capacity_bytes() / 1000,
            free / 1000
        );
        #[cfg(feature = "gc-telemetry")]
        self.telemetry.end_cycle(&stats);
        stats
    }

    // ---- mark ---------------------------------------------------------

    fn mark_phase(&mut self, roots: &RootSet) -> MarkOutcome {
        let mut worklist: Vec<Ref> = Vec::with_capacity(256);
        let mut weak: Vec<Ref> = Vec::with_capacity(WEAK_LIST_CAP);
        let mut overflow = false;
        let mut marked = 0usize;
        let class_table = roots.class_table;

        if let Some(ct) = class_table {
            self.mark_object(ct, &mut worklist, &mut marked);
        }
        for v in &roots.values {
            if let Value::Ref(r) = *v {
                self.mark_object(r, &mut worklist, &mut marked);
            }
        }

        while let Some(r) = worklist.pop() {
            let class = self.class_index(r);
            if let Some(ct) = class_table {
                self.mark_class(ct, class, &mut worklist, &mut marked);
                // A method keeps its owning class alive.
                if class == FUNCTION_CLASS && self.word_count(r) > 1 {
                    if let Value::Int(owner) = self.field(r, 1) {
                        self.mark_class(ct, owner as u32, &mut worklist, &mut marked);
                    }
                }
            }
            if class == WEAK_ARRAY_CLASS {
                // Marked but not traced; the fixup pass nils dead entries.
                if weak.len() < WEAK_LIST_CAP {
                    weak.push(r);
                } else {
                    overflow = true;
                }
                continue;
            }
            if self.format(r).has_refs() {
                let body = self.body_start(r);
                for i in 0..self.word_count(r) {
                    if let Value::Ref(t) = Value::decode(self.words[body + i]) {
                        self.mark_object(t, &mut worklist, &mut marked);
                    }
                }
            }
        }

        MarkOutcome {
            marked,
            weak,
            overflow,
        }
    }

    fn mark_object(&mut self, r: Ref, worklist: &mut Vec<Ref>, marked: &mut usize) {
        let f = self.format(r);
        if f.marked() {
            return;
        }
        self.set_format(r, f.with_mark());
        *marked += 1;
        worklist.push(r);
    }

    fn mark_class(&mut self, ct: Ref, index: u32, worklist: &mut Vec<Ref>, marked: &mut usize) {
        if index >= 1 && (index as usize) <= self.word_count(ct) {
            if let Value::Ref(c) = self.field(ct, index as usize - 1) {
                self.mark_object(c, worklist, marked);
            }
        }
    }

    // ---- weak fixup ---------------------------------------------------

    fn process_weak(&mut self, weak: &[Ref]) {
        for &w in weak {
            self.nil_dead_fields(w);
        }
    }

    fn nil_dead_fields(&mut self, w: Ref) {
        let body = self.body_start(w);
        for i in 0..self.word_count(w) {
            if let Value::Ref(t) = Value::decode(self.words[body + i]) {
                if !self.format(t).marked() {
                    self.words[body + i] = Value::Nil.encode();
                }
            }
        }
    }

    fn process_weak_full_scan(&mut self) {
        let mut at = RESERVED_WORDS;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let format = Format::from_word(self.words[at + FORMAT_WORD]);
            if class == WEAK_ARRAY_CLASS && format.marked() {
                self.nil_dead_fields(Ref::from_index(at));
            }
            at = self.next_chunk(at);
        }
    }

    // ---- sweep --------------------------------------------------------

    /// Merges dead runs into free chunks and stores each survivor's future
    /// word index in its cache word (0 means "stays in place"). Finalizers
    /// of unreachable ExternalReferences run here, before their space is
    /// reclaimed.
    fn sweep_and_forward(&mut self) {
        let mut at = RESERVED_WORDS;
        let mut shift = 0usize;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let format = Format::from_word(self.words[at + FORMAT_WORD]);
            if class != 0 && format.marked() {
                self.words[at + CACHE_WORD] = if shift > 0 { (at - shift) as u32 } else { 0 };
                at = self.next_chunk(at);
                continue;
            }
            let run_start = at;
            let mut run_end = at;
            while run_end < self.free_start {
                let c = self.words[run_end + CLASS_WORD];
                let f = Format::from_word(self.words[run_end + FORMAT_WORD]);
                if c != 0 && f.marked() {
                    break;
                }
                if c == EXTERNAL_REF_CLASS {
                    let body = run_end + HEADER_WORDS;
                    let handle = self.words[body];
                    let id = self.words[body + 1];
                    if handle != 0 {
                        self.run_finalizer(id, handle);
                    }
                }
                run_end = self.next_chunk(run_end);
            }
            let run_words = run_end - run_start;
            self.words[run_start + CLASS_WORD] = 0;
            self.words[run_start + FORMAT_WORD] = 0;
            self.words[run_start + COUNT_WORD] = (run_words - HEADER_WORDS) as u32;
            self.words[run_start + CACHE_WORD] = 0;
            self.words[run_start + HASH_WORD] = 0;
            shift += run_words;
            at = run_end;
        }
    }

    // ---- pointer update -----------------------------------------------

    fn forward_word(&self, word: u32) -> u32 {
        if let Value::Ref(t) = Value::decode(word) {
            let fwd = self.words[t.index() + CACHE_WORD];
            if fwd != 0 {
                return Value::Ref(Ref::from_index(fwd as usize)).encode();
            }
        }
        word
    }

    fn update_refs(&mut self, roots: &mut RootSet) {
        let mut at = RESERVED_WORDS;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let format = Format::from_word(self.words[at + FORMAT_WORD]);
            let count = self.words[at + COUNT_WORD] as usize;
            if class != 0 && format.has_refs() {
                let body = at + HEADER_WORDS;
                for i in body..body + count {
                    let w = self.forward_word(self.words[i]);
                    self.words[i] = w;
                }
            }
            at = self.next_chunk(at);
        }
        for i in 0..roots.values.len() {
            let w = self.forward_word(roots.values[i].encode());
            roots.values[i] = Value::decode(w);
        }
        if let Some(ct) = roots.class_table {
            let w = self.forward_word(Value::Ref(ct).encode());
            if let Value::Ref(moved) = Value::decode(w) {
                roots.class_table = Some(moved);
            }
        }
    }

    // ---- compact ------------------------------------------------------

    fn compact_move(&mut self) {
        let mut at = RESERVED_WORDS;
        let mut dst = RESERVED_WORDS;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let format = Format::from_word(self.words[at + FORMAT_WORD]);
            let size = HEADER_WORDS + self.words[at + COUNT_WORD] as usize;
            if class != 0 && format.marked() {
                if dst != at {
                    self.words.copy_within(at..at + size, dst);
                }
                self.words[dst + FORMAT_WORD] = format.without_mark().word();
                self.words[dst + CACHE_WORD] = 0;
                dst += size;
            }
            at += size;
        }
        self.free_start = dst;
    }
}
