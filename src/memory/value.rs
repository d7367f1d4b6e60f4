use std::fmt;

/// Location of an object header in the arena, counted in words.
///
/// A `Ref` is only meaningful against the heap that produced it, and it is
/// invalidated by compaction; the collector rewrites every stored word, so
/// code must never hold a `Ref` across a collection outside a registered
/// root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref(pub(crate) u32);

impl Ref {
    /// Word index of the object header.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Ref {
        Ref(index as u32)
    }
}

/// Encoded singleton words. Object references are multiples of 4 and the
/// arena reserves its first two words, so no reference can collide with
/// these.
pub const NIL_WORD: u32 = 0;
pub const TRUE_WORD: u32 = 2;
pub const FALSE_WORD: u32 = 4;

/// Smallest integer representable inline (31-bit signed).
pub const MIN_INLINE_INT: i32 = -(1 << 30);
/// Largest integer representable inline (31-bit signed).
pub const MAX_INLINE_INT: i32 = (1 << 30) - 1;

const REF_SCALE: u32 = 4;

/// A runtime value: either an immediate or a reference into the arena.
///
/// The stored form is a single 32-bit word. Odd words carry a 31-bit signed
/// integer in their upper bits; the even words 0, 2 and 4 are nil, true and
/// false; any other even word is an object reference. [`Value::encode`] and
/// [`Value::decode`] are the only places that know this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    Nil,
    True,
    False,
    Int(i32),
    Ref(Ref),
}

impl Value {
    /// Encodes the value into its arena word form.
    pub fn encode(self) -> u32 {
        match self {
            Value::Nil => NIL_WORD,
            Value::True => TRUE_WORD,
            Value::False => FALSE_WORD,
            Value::Int(n) => {
                debug_assert!((MIN_INLINE_INT..=MAX_INLINE_INT).contains(&n));
                ((n as u32) << 1) | 1
            }
            Value::Ref(r) => {
                debug_assert!(r.0 >= 2, "object below the reserved arena words");
                r.0 * REF_SCALE
            }
        }
    }

    /// Decodes an arena word back into a value.
    pub fn decode(word: u32) -> Value {
        if word & 1 != 0 {
            return Value::Int((word as i32) >> 1);
        }
        match word {
            NIL_WORD => Value::Nil,
            TRUE_WORD => Value::True,
            FALSE_WORD => Value::False,
            _ => Value::Ref(Ref(word / REF_SCALE)),
        }
    }

    pub fn from_bool(b: bool) -> Value {
        if b { Value::True } else { Value::False }
    }

    /// Whether `n` fits the inline integer range. Out-of-range integers are
    /// represented as LargeInteger heap objects instead.
    pub fn int_fits(n: i64) -> bool {
        (MIN_INLINE_INT as i64..=MAX_INLINE_INT as i64).contains(&n)
    }

    pub fn as_int(self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_ref(self) -> Option<Ref> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            Value::True => Some(true),
            Value::False => Some(false),
            _ => None,
        }
    }

    pub fn is_nil(self) -> bool {
        self == Value::Nil
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::True => write!(f, "true"),
            Value::False => write!(f, "false"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Ref(r) => write!(f, "<obj {}>", r.0),
        }
    }
}
