//! Hash functions for dictionary keys.
//!
//! String hashes are content hashes (word-wise MurmurHash3); everything
//! else that is not a number gets an identity hash drawn from a
//! Park-Miller sequence, stable for the life of the process but arbitrary
//! across runs. Computed hashes are cached in the object's header hash
//! word, which travels with the object through compaction.

use crate::memory::header::{FLOAT_CLASS, STRING_CLASS};
use crate::memory::heap::Heap;
use crate::memory::value::Value;

/// Hashes are masked to 30 bits so they always fit an inline integer.
pub const HASH_MASK: u32 = 0x3FFF_FFFF;

const MURMUR_C1: u32 = 0xcc9e_2d51;
const MURMUR_C2: u32 = 0x1b87_3593;

/// Word-wise MurmurHash3. Strings are NUL-padded to whole words, so
/// hashing the words hashes the canonical form of the contents.
pub fn murmur_words(words: &[u32]) -> u32 {
    let mut h: u32 = 0;
    for &word in words {
        let mut k = word.wrapping_mul(MURMUR_C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(MURMUR_C2);
        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }
    h ^= 4 * words.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

fn next_identity_hash(heap: &mut Heap) -> u32 {
    heap.hash_seed = 16807u32.wrapping_mul(heap.hash_seed) & 0x7FF_FFFF;
    heap.hash_seed
}

/// The hash of any value, caching object hashes in the header hash word.
pub fn object_hash(heap: &mut Heap, v: Value) -> u32 {
    match v {
        Value::Int(_) => (7u32.wrapping_mul(v.encode())) & 0x7FFF_FFFF,
        Value::Nil | Value::True | Value::False => v.encode(),
        Value::Ref(r) => {
            let cached = heap.hash_word(r);
            if cached != 0 {
                return cached;
            }
            let hash = match heap.class_index(r) {
                STRING_CLASS => {
                    let body = heap.body_start(r);
                    let count = heap.word_count(r);
                    murmur_words(&heap.words[body..body + count]) & HASH_MASK
                }
                FLOAT_CLASS => ((heap.float_value(r).to_bits() >> 22) as u32) & HASH_MASK,
                _ => next_identity_hash(heap) & HASH_MASK,
            };
            heap.set_hash_word(r, hash);
            hash
        }
    }
}
