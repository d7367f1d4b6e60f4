/// Object headers are five words, one logical field per word:
///
/// | word | field       | contents                                        |
/// |------|-------------|-------------------------------------------------|
/// | 0    | class index | 0 marks a free chunk                            |
/// | 1    | format      | flag bits, see [`Format`]                       |
/// | 2    | word count  | body length in words, fixed at creation         |
/// | 3    | cache word  | untraced scratch: call-target cache on nodes,   |
/// |      |             | forwarding index during compaction              |
/// | 4    | hash word   | 0 until computed, then immutable                |
///
/// The cache word must never hold a traced reference; the collector clears
/// it on every survivor after compaction.
pub const HEADER_WORDS: usize = 5;

pub const CLASS_WORD: usize = 0;
pub const FORMAT_WORD: usize = 1;
pub const COUNT_WORD: usize = 2;
pub const CACHE_WORD: usize = 3;
pub const HASH_WORD: usize = 4;

// Bootstrap class indices, assigned in this order at VM startup. User
// classes are appended after LAST_BUILTIN_CLASS.
pub const NIL_CLASS: u32 = 1;
pub const BOOLEAN_CLASS: u32 = 2;
pub const INTEGER_CLASS: u32 = 3;
pub const FLOAT_CLASS: u32 = 4;
pub const STRING_CLASS: u32 = 5;
pub const ARRAY_CLASS: u32 = 6;
pub const BINARY_DATA_CLASS: u32 = 7;
pub const EXTERNAL_REF_CLASS: u32 = 8;
pub const LIST_CLASS: u32 = 9;
pub const DICTIONARY_CLASS: u32 = 10;
pub const COMMAND_CLASS: u32 = 11;
pub const REPORTER_CLASS: u32 = 12;
pub const CLASS_CLASS: u32 = 13;
pub const FUNCTION_CLASS: u32 = 14;
pub const MODULE_CLASS: u32 = 15;
pub const TASK_CLASS: u32 = 16;
pub const WEAK_ARRAY_CLASS: u32 = 17;
pub const LARGE_INTEGER_CLASS: u32 = 18;
pub const LAST_BUILTIN_CLASS: u32 = 18;

const HAS_REFS_BIT: u32 = 1;
const MARK_BIT: u32 = 2;
const EXTRA_SHIFT: u32 = 2;
const EXTRA_MASK: u32 = 0b11 << EXTRA_SHIFT;

/// The format word of an object header.
///
/// Bit 0 says whether the body holds tagged reference words (traced by the
/// collector) or raw bytes. Bit 1 is the GC mark, live only during a
/// collection. Bits 2-3 count the unused bytes in the final body word of a
/// binary object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format(u32);

impl Format {
    /// Format of a reference-bodied object.
    pub fn refs() -> Format {
        Format(HAS_REFS_BIT)
    }

    /// Format of a raw-byte object with `extra` unused bytes (0..=3) in its
    /// last word.
    pub fn binary(extra: u32) -> Format {
        debug_assert!(extra <= 3);
        Format(extra << EXTRA_SHIFT)
    }

    pub fn from_word(word: u32) -> Format {
        Format(word)
    }

    pub fn word(self) -> u32 {
        self.0
    }

    pub fn has_refs(self) -> bool {
        self.0 & HAS_REFS_BIT != 0
    }

    pub fn marked(self) -> bool {
        self.0 & MARK_BIT != 0
    }

    pub fn with_mark(self) -> Format {
        Format(self.0 | MARK_BIT)
    }

    pub fn without_mark(self) -> Format {
        Format(self.0 & !MARK_BIT)
    }

    /// Unused byte count in the last body word of a binary object.
    pub fn extra_bytes(self) -> u32 {
        (self.0 & EXTRA_MASK) >> EXTRA_SHIFT
    }
}
