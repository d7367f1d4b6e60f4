use std::fmt;

use serde::Serialize;

use crate::memory::header::*;
use crate::memory::value::{Ref, Value};

/// Bytes kept free as working space so a collection can always run.
pub const GC_MARGIN_BYTES: usize = 100_000;

const WORD_BYTES: usize = 4;
// Words 0 and 1 are never used for objects, so encoded references never
// collide with the nil/true/false words.
pub(crate) const RESERVED_WORDS: usize = 2;

/// Arena exhaustion. Reported to the operation that requested the
/// allocation; the process and other tasks are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory {
    pub requested_words: usize,
}

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "out of memory: failed to allocate {} words",
            self.requested_words
        )
    }
}

impl std::error::Error for OutOfMemory {}

/// Finalizer for an external resource handle. Runs during the sweep when
/// the owning ExternalReference is unreachable; must not allocate.
pub type FinalizerFn = fn(handle: u32);

/// Heap usage counters for the `memStats` primitive and the stats report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MemStats {
    pub used_bytes: usize,
    pub capacity_bytes: usize,
    pub allocations_since_gc: usize,
    pub bytes_allocated_since_gc: usize,
    pub gc_count: usize,
}

/// Live-object census by class, produced by [`Heap::snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct HeapSnapshot {
    pub capacity_words: usize,
    pub free_words: usize,
    pub live_objects: usize,
    pub live_words: usize,
    pub by_class: Vec<ClassCensus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassCensus {
    pub class_index: u32,
    pub count: usize,
    pub words: usize,
}

/// The object heap: a contiguous arena of 32-bit words with bump
/// allocation.
///
/// Objects are laid out as a five-word header followed by the body (see
/// [`crate::memory::header`]). Allocation never moves existing data; the
/// free pointer only ever retreats inside [`Heap::collect`], which runs
/// between interpreter dispatch steps. When remaining space falls under the
/// adaptive threshold the `gc_needed` flag is set and acted on at the next
/// safe point, never inside a primitive.
pub struct Heap {
    pub(crate) words: Vec<u32>,
    pub(crate) free_start: usize,
    pub(crate) gc_threshold: usize,
    pub(crate) gc_needed: bool,
    pub(crate) gc_enabled: bool,
    pub(crate) gc_count: usize,
    pub(crate) allocations_since_gc: usize,
    pub(crate) bytes_since_gc: usize,
    pub(crate) finalizers: Vec<(String, FinalizerFn)>,
    pub(crate) hash_seed: u32,
    #[cfg(feature = "gc-telemetry")]
    pub(crate) telemetry: crate::memory::telemetry::GcTelemetry,
}

impl Heap {
    /// Creates a heap with `megabytes * 1_000_000` bytes of arena.
    pub fn new(megabytes: usize) -> Heap {
        let capacity_words = megabytes.max(1) * 1_000_000 / WORD_BYTES;
        let mut heap = Heap {
            words: vec![0; capacity_words],
            free_start: RESERVED_WORDS,
            gc_threshold: 0,
            gc_needed: false,
            gc_enabled: true,
            gc_count: 0,
            allocations_since_gc: 0,
            bytes_since_gc: 0,
            finalizers: Vec::new(),
            hash_seed: 123_456,
            #[cfg(feature = "gc-telemetry")]
            telemetry: crate::memory::telemetry::GcTelemetry::new(),
        };
        heap.gc_threshold = heap.free_bytes() / 10;
        heap
    }

    // ---- capacity and counters ----------------------------------------

    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    pub fn used_bytes(&self) -> usize {
        self.free_start * WORD_BYTES
    }

    pub fn free_bytes(&self) -> usize {
        (self.words.len() - self.free_start) * WORD_BYTES
    }

    /// Pre-flight check including the collector's working margin.
    pub fn can_allocate(&self, word_count: usize) -> bool {
        let needed = (self.free_start + HEADER_WORDS + word_count) * WORD_BYTES;
        needed + GC_MARGIN_BYTES < self.capacity_bytes()
    }

    pub fn set_gc_enabled(&mut self, enabled: bool) {
        self.gc_enabled = enabled;
    }

    /// True when automatic collection should run at the next safe point.
    pub fn should_collect(&self) -> bool {
        self.gc_enabled && self.gc_needed
    }

    pub fn request_collection(&mut self) {
        self.gc_needed = true;
    }

    pub fn gc_count(&self) -> usize {
        self.gc_count
    }

    pub fn mem_stats(&self) -> MemStats {
        MemStats {
            used_bytes: self.used_bytes(),
            capacity_bytes: self.capacity_bytes(),
            allocations_since_gc: self.allocations_since_gc,
            bytes_allocated_since_gc: self.bytes_since_gc,
            gc_count: self.gc_count,
        }
    }

    // ---- allocation ---------------------------------------------------

    fn allocate_raw(
        &mut self,
        class_index: u32,
        word_count: usize,
        format: Format,
    ) -> Result<Ref, OutOfMemory> {
        let needed = HEADER_WORDS + word_count;
        if self.free_start + needed > self.words.len() {
            return Err(OutOfMemory {
                requested_words: word_count,
            });
        }
        let at = self.free_start;
        self.free_start += needed;
        self.words[at + CLASS_WORD] = class_index;
        self.words[at + FORMAT_WORD] = format.word();
        self.words[at + COUNT_WORD] = word_count as u32;
        self.words[at + CACHE_WORD] = 0;
        self.words[at + HASH_WORD] = 0;
        self.allocations_since_gc += 1;
        self.bytes_since_gc += needed * WORD_BYTES;
        if self.free_bytes() < self.gc_threshold {
            self.gc_needed = true;
        }
        #[cfg(feature = "gc-telemetry")]
        self.telemetry.record_alloc(class_index, needed);
        Ok(Ref::from_index(at))
    }

    /// Allocates an object whose body holds `word_count` tagged reference
    /// words, each initialized to `fill`.
    pub fn allocate(
        &mut self,
        class_index: u32,
        word_count: usize,
        fill: Value,
    ) -> Result<Ref, OutOfMemory> {
        let r = self.allocate_raw(class_index, word_count, Format::refs())?;
        let body = self.body_start(r);
        self.words[body..body + word_count].fill(fill.encode());
        Ok(r)
    }

    /// Allocates a raw-byte object of `byte_count` zeroed bytes.
    pub fn allocate_binary(
        &mut self,
        class_index: u32,
        byte_count: usize,
    ) -> Result<Ref, OutOfMemory> {
        let word_count = byte_count.div_ceil(4);
        let extra = (4 - byte_count % 4) % 4;
        let r = self.allocate_raw(class_index, word_count, Format::binary(extra as u32))?;
        let body = self.body_start(r);
        self.words[body..body + word_count].fill(0);
        Ok(r)
    }

    // ---- header and body access ---------------------------------------

    pub fn class_index(&self, r: Ref) -> u32 {
        self.words[r.index() + CLASS_WORD]
    }

    pub fn word_count(&self, r: Ref) -> usize {
        self.words[r.index() + COUNT_WORD] as usize
    }

    pub fn format(&self, r: Ref) -> Format {
        Format::from_word(self.words[r.index() + FORMAT_WORD])
    }

    pub(crate) fn set_format(&mut self, r: Ref, format: Format) {
        self.words[r.index() + FORMAT_WORD] = format.word();
    }

    pub fn cache_word(&self, r: Ref) -> u32 {
        self.words[r.index() + CACHE_WORD]
    }

    pub fn set_cache_word(&mut self, r: Ref, word: u32) {
        self.words[r.index() + CACHE_WORD] = word;
    }

    pub fn hash_word(&self, r: Ref) -> u32 {
        self.words[r.index() + HASH_WORD]
    }

    pub fn set_hash_word(&mut self, r: Ref, word: u32) {
        self.words[r.index() + HASH_WORD] = word;
    }

    pub(crate) fn body_start(&self, r: Ref) -> usize {
        r.index() + HEADER_WORDS
    }

    /// Reads a reference-typed body field.
    pub fn field(&self, r: Ref, i: usize) -> Value {
        debug_assert!(i < self.word_count(r));
        Value::decode(self.words[self.body_start(r) + i])
    }

    /// Writes a reference-typed body field.
    pub fn set_field(&mut self, r: Ref, i: usize, v: Value) {
        debug_assert!(i < self.word_count(r));
        debug_assert!(self.format(r).has_refs());
        let body = self.body_start(r);
        self.words[body + i] = v.encode();
    }

    pub fn raw_word(&self, r: Ref, i: usize) -> u32 {
        debug_assert!(i < self.word_count(r));
        self.words[self.body_start(r) + i]
    }

    pub fn set_raw_word(&mut self, r: Ref, i: usize, word: u32) {
        debug_assert!(i < self.word_count(r));
        let body = self.body_start(r);
        self.words[body + i] = word;
    }

    /// Class index of any value, immediates included.
    pub fn class_index_of(&self, v: Value) -> u32 {
        match v {
            Value::Nil => NIL_CLASS,
            Value::True | Value::False => BOOLEAN_CLASS,
            Value::Int(_) => INTEGER_CLASS,
            Value::Ref(r) => self.class_index(r),
        }
    }

    // ---- arrays -------------------------------------------------------

    pub fn new_array(&mut self, count: usize, fill: Value) -> Result<Ref, OutOfMemory> {
        self.allocate(ARRAY_CLASS, count, fill)
    }

    pub fn new_weak_array(&mut self, count: usize) -> Result<Ref, OutOfMemory> {
        self.allocate(WEAK_ARRAY_CLASS, count, Value::Nil)
    }

    // ---- strings ------------------------------------------------------

    /// Allocates a string: NUL-terminated UTF-8 padded to a word boundary.
    /// The terminator always fits because one extra byte is reserved, so
    /// the byte length can be recovered by scanning the final word.
    pub fn new_string(&mut self, s: &str) -> Result<Ref, OutOfMemory> {
        let bytes = s.as_bytes();
        let word_count = (bytes.len() + 1).div_ceil(4);
        let r = self.allocate_raw(STRING_CLASS, word_count, Format::binary(0))?;
        let body = self.body_start(r);
        self.words[body..body + word_count].fill(0);
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            self.words[body + i] = u32::from_le_bytes(w);
        }
        Ok(r)
    }

    /// Byte length of a string, excluding the terminator.
    pub fn string_len(&self, r: Ref) -> usize {
        let wc = self.word_count(r);
        if wc == 0 {
            return 0;
        }
        let last = self.words[self.body_start(r) + wc - 1].to_le_bytes();
        let tail = last.iter().position(|b| *b == 0).unwrap_or(4);
        4 * (wc - 1) + tail
    }

    pub fn string_byte(&self, r: Ref, i: usize) -> u8 {
        let word = self.words[self.body_start(r) + i / 4];
        word.to_le_bytes()[i % 4]
    }

    /// Copies the string contents out as an owned `String`.
    pub fn string_value(&self, r: Ref) -> String {
        let len = self.string_len(r);
        let mut bytes = Vec::with_capacity(len);
        for i in 0..len {
            bytes.push(self.string_byte(r, i));
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Content comparison against a Rust string, without allocating.
    pub fn str_matches(&self, r: Ref, s: &str) -> bool {
        if self.class_index(r) != STRING_CLASS || self.string_len(r) != s.len() {
            return false;
        }
        s.as_bytes()
            .iter()
            .enumerate()
            .all(|(i, b)| self.string_byte(r, i) == *b)
    }

    /// Content equality of two strings. Padding is canonical (zeroed), so
    /// word comparison suffices.
    pub fn string_eq(&self, a: Ref, b: Ref) -> bool {
        if a == b {
            return true;
        }
        let wc = self.word_count(a);
        if wc != self.word_count(b) {
            return false;
        }
        let (pa, pb) = (self.body_start(a), self.body_start(b));
        self.words[pa..pa + wc] == self.words[pb..pb + wc]
    }

    // ---- floats -------------------------------------------------------

    pub fn new_float(&mut self, x: f64) -> Result<Ref, OutOfMemory> {
        let r = self.allocate_raw(FLOAT_CLASS, 2, Format::binary(0))?;
        let bits = x.to_bits();
        let body = self.body_start(r);
        self.words[body] = bits as u32;
        self.words[body + 1] = (bits >> 32) as u32;
        Ok(r)
    }

    pub fn float_value(&self, r: Ref) -> f64 {
        let body = self.body_start(r);
        let lo = self.words[body] as u64;
        let hi = self.words[body + 1] as u64;
        f64::from_bits(hi << 32 | lo)
    }

    // ---- binary data --------------------------------------------------

    pub fn new_binary_data(&mut self, bytes: &[u8]) -> Result<Ref, OutOfMemory> {
        let r = self.allocate_binary(BINARY_DATA_CLASS, bytes.len())?;
        let body = self.body_start(r);
        for (i, chunk) in bytes.chunks(4).enumerate() {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            self.words[body + i] = u32::from_le_bytes(w);
        }
        Ok(r)
    }

    /// Byte length of a raw-byte object.
    pub fn byte_count(&self, r: Ref) -> usize {
        4 * self.word_count(r) - self.format(r).extra_bytes() as usize
    }

    pub fn byte_at(&self, r: Ref, i: usize) -> u8 {
        debug_assert!(i < self.byte_count(r));
        let word = self.words[self.body_start(r) + i / 4];
        word.to_le_bytes()[i % 4]
    }

    pub fn set_byte_at(&mut self, r: Ref, i: usize, b: u8) {
        debug_assert!(i < self.byte_count(r));
        let at = self.body_start(r) + i / 4;
        let mut bytes = self.words[at].to_le_bytes();
        bytes[i % 4] = b;
        self.words[at] = u32::from_le_bytes(bytes);
    }

    pub fn binary_bytes(&self, r: Ref) -> Vec<u8> {
        (0..self.byte_count(r)).map(|i| self.byte_at(r, i)).collect()
    }

    // ---- large integers -----------------------------------------------

    /// Builds a LargeInteger from sign and big-endian magnitude bytes.
    pub fn new_large_int(&mut self, negative: bool, magnitude: &[u8]) -> Result<Ref, OutOfMemory> {
        let data = self.new_binary_data(magnitude)?;
        let r = self.allocate(LARGE_INTEGER_CLASS, 2, Value::Nil)?;
        self.set_field(r, 0, Value::Ref(data));
        self.set_field(r, 1, Value::from_bool(negative));
        Ok(r)
    }

    pub fn large_int_from_i64(&mut self, n: i64) -> Result<Ref, OutOfMemory> {
        let mag = n.unsigned_abs().to_be_bytes();
        let first = mag.iter().position(|b| *b != 0).unwrap_or(mag.len() - 1);
        self.new_large_int(n < 0, &mag[first..])
    }

    /// An integer as a value: inline when it fits, LargeInteger otherwise.
    /// Out-of-range integers are never truncated.
    pub fn int_value(&mut self, n: i64) -> Result<Value, OutOfMemory> {
        if Value::int_fits(n) {
            Ok(Value::Int(n as i32))
        } else {
            Ok(Value::Ref(self.large_int_from_i64(n)?))
        }
    }

    pub fn large_int_to_f64(&self, r: Ref) -> f64 {
        let mut x = 0.0f64;
        if let Some(data) = self.field(r, 0).as_ref() {
            for i in 0..self.byte_count(data) {
                x = x * 256.0 + self.byte_at(data, i) as f64;
            }
        }
        if self.field(r, 1) == Value::True { -x } else { x }
    }

    /// The exact `i64` value, when the magnitude fits eight bytes.
    pub fn large_int_to_i64(&self, r: Ref) -> Option<i64> {
        let data = self.field(r, 0).as_ref()?;
        let count = self.byte_count(data);
        if count > 8 {
            return None;
        }
        let mut mag: u64 = 0;
        for i in 0..count {
            mag = mag << 8 | self.byte_at(data, i) as u64;
        }
        if self.field(r, 1) == Value::True {
            if mag > i64::MIN.unsigned_abs() {
                return None;
            }
            Some((mag as i64).wrapping_neg())
        } else {
            i64::try_from(mag).ok()
        }
    }

    // ---- external references ------------------------------------------

    /// Registers a finalizer under a name and returns its id (1-based; 0
    /// means no finalizer).
    pub fn register_finalizer(&mut self, name: &str, f: FinalizerFn) -> u32 {
        self.finalizers.push((name.to_string(), f));
        self.finalizers.len() as u32
    }

    pub fn finalizer_named(&self, name: &str) -> Option<u32> {
        self.finalizers
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| i as u32 + 1)
    }

    /// Creates an ExternalReference wrapping a native handle. The body is
    /// two raw words: the handle and the finalizer id.
    pub fn new_external_reference(
        &mut self,
        handle: u32,
        finalizer_id: u32,
    ) -> Result<Ref, OutOfMemory> {
        let r = self.allocate_binary(EXTERNAL_REF_CLASS, 8)?;
        let body = self.body_start(r);
        self.words[body] = handle;
        self.words[body + 1] = finalizer_id;
        Ok(r)
    }

    pub fn external_handle(&self, r: Ref) -> u32 {
        self.words[self.body_start(r)]
    }

    /// Explicitly releases an external resource: runs the finalizer once
    /// and zeroes the handle so the GC backstop cannot release it again.
    pub fn close_external(&mut self, r: Ref) {
        let body = self.body_start(r);
        let handle = self.words[body];
        let id = self.words[body + 1];
        if handle != 0 {
            self.run_finalizer(id, handle);
            self.words[body] = 0;
        }
    }

    pub(crate) fn run_finalizer(&self, id: u32, handle: u32) {
        if id >= 1 && (id as usize) <= self.finalizers.len() {
            (self.finalizers[id as usize - 1].1)(handle);
        }
    }

    // ---- copying ------------------------------------------------------

    /// Copies a window of `src` into a new object of `new_count` body
    /// words, starting at the one-based `src_index`. Slots outside the
    /// source are nil-filled. Class and format carry over; this is how
    /// arrays grow.
    pub fn copy_obj(
        &mut self,
        src: Ref,
        new_count: usize,
        src_index: usize,
    ) -> Result<Ref, OutOfMemory> {
        let class = self.class_index(src);
        let format = self.format(src).without_mark();
        let src_count = self.word_count(src);
        let r = self.allocate_raw(class, new_count, format)?;
        let src_body = self.body_start(src);
        let dst_body = self.body_start(r);
        let start = src_index.saturating_sub(1);
        for i in 0..new_count {
            let j = start + i;
            self.words[dst_body + i] = if j < src_count {
                self.words[src_body + j]
            } else {
                Value::Nil.encode()
            };
        }
        Ok(r)
    }

    /// A copy of `array` one slot longer, with `v` in the new last slot.
    /// The shared empty array can be appended to safely; the source is
    /// never touched.
    pub fn append(&mut self, array: Ref, v: Value) -> Result<Ref, OutOfMemory> {
        let count = self.word_count(array);
        let grown = self.copy_obj(array, count + 1, 1)?;
        self.set_field(grown, count, v);
        Ok(grown)
    }

    /// Shallow copy of an object, hash word included.
    pub fn clone_obj(&mut self, src: Ref) -> Result<Ref, OutOfMemory> {
        let class = self.class_index(src);
        let format = self.format(src).without_mark();
        let count = self.word_count(src);
        let r = self.allocate_raw(class, count, format)?;
        let src_body = self.body_start(src);
        let dst_body = self.body_start(r);
        self.words.copy_within(src_body..src_body + count, dst_body);
        self.words[r.index() + HASH_WORD] = self.words[src.index() + HASH_WORD];
        Ok(r)
    }

    // ---- heap walking -------------------------------------------------

    pub(crate) fn next_chunk(&self, at: usize) -> usize {
        at + HEADER_WORDS + self.words[at + COUNT_WORD] as usize
    }

    /// The next live object after `prev` in address order, optionally
    /// filtered by class (0 matches any). `None` for `prev` starts from the
    /// bottom of the arena.
    pub fn object_after(&self, prev: Option<Ref>, class_filter: u32) -> Option<Ref> {
        let mut at = match prev {
            None => RESERVED_WORDS,
            Some(r) => self.next_chunk(r.index()),
        };
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            if class != 0 && (class_filter == 0 || class == class_filter) {
                return Some(Ref::from_index(at));
            }
            at = self.next_chunk(at);
        }
        None
    }

    /// Every live object holding a reference to `target`.
    pub fn references_to(&self, target: Ref) -> Vec<Ref> {
        let needle = Value::Ref(target).encode();
        let mut found = Vec::new();
        let mut at = RESERVED_WORDS;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let count = self.words[at + COUNT_WORD] as usize;
            if class != 0 && Format::from_word(self.words[at + FORMAT_WORD]).has_refs() {
                let body = at + HEADER_WORDS;
                if self.words[body..body + count].contains(&needle) {
                    found.push(Ref::from_index(at));
                }
            }
            at = self.next_chunk(at);
        }
        found
    }

    /// Rewrites every reference field equal to a pair's first value with
    /// the pair's second value, across the whole arena.
    pub fn replace_objects(&mut self, pairs: &[(Value, Value)]) {
        let encoded: Vec<(u32, u32)> = pairs
            .iter()
            .map(|(from, to)| (from.encode(), to.encode()))
            .collect();
        let mut at = RESERVED_WORDS;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let count = self.words[at + COUNT_WORD] as usize;
            if class != 0 && Format::from_word(self.words[at + FORMAT_WORD]).has_refs() {
                let body = at + HEADER_WORDS;
                for i in body..body + count {
                    for (from, to) in &encoded {
                        if self.words[i] == *from {
                            self.words[i] = *to;
                        }
                    }
                }
            }
            at = self.next_chunk(at);
        }
    }

    /// Census of live objects for the stats report.
    pub fn snapshot(&self) -> HeapSnapshot {
        let mut by_class: Vec<ClassCensus> = Vec::new();
        let mut live_objects = 0;
        let mut live_words = 0;
        let mut at = RESERVED_WORDS;
        while at < self.free_start {
            let class = self.words[at + CLASS_WORD];
            let size = HEADER_WORDS + self.words[at + COUNT_WORD] as usize;
            if class != 0 {
                live_objects += 1;
                live_words += size;
                match by_class.iter_mut().find(|c| c.class_index == class) {
                    Some(c) => {
                        c.count += 1;
                        c.words += size;
                    }
                    None => by_class.push(ClassCensus {
                        class_index: class,
                        count: 1,
                        words: size,
                    }),
                }
            }
            at = self.next_chunk(at);
        }
        by_class.sort_by(|a, b| b.words.cmp(&a.words));
        HeapSnapshot {
            capacity_words: self.words.len(),
            free_words: self.words.len() - self.free_start,
            live_objects,
            live_words,
            by_class,
        }
    }
}
