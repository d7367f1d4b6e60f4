//! Open-addressed dictionaries stored as heap objects.
//!
//! A dictionary is three fields: `tally`, `keys`, `values`. The parallel
//! key/value arrays are probed linearly from `hash(key) % capacity`.
//! String keys match by content (identical reference is the fast path);
//! every other key matches by identity. Once occupancy passes 75% the
//! arrays double and every entry is reinserted. There is no removal; the
//! method cache empties an entry by overwriting its value instead.

use crate::memory::header::DICTIONARY_CLASS;
use crate::memory::header::STRING_CLASS;
use crate::memory::heap::{Heap, OutOfMemory};
use crate::memory::value::{Ref, Value};
use crate::runtime::hashing::object_hash;

const DICT_TALLY: usize = 0;
const DICT_KEYS: usize = 1;
const DICT_VALUES: usize = 2;

const MIN_CAPACITY: usize = 4;

pub fn new_dict(heap: &mut Heap, capacity: usize) -> Result<Ref, OutOfMemory> {
    let capacity = capacity.max(MIN_CAPACITY);
    let keys = heap.new_array(capacity, Value::Nil)?;
    let values = heap.new_array(capacity, Value::Nil)?;
    let dict = heap.allocate(DICTIONARY_CLASS, 3, Value::Nil)?;
    heap.set_field(dict, DICT_TALLY, Value::Int(0));
    heap.set_field(dict, DICT_KEYS, Value::Ref(keys));
    heap.set_field(dict, DICT_VALUES, Value::Ref(values));
    Ok(dict)
}

pub fn dict_count(heap: &Heap, dict: Ref) -> usize {
    match heap.field(dict, DICT_TALLY) {
        Value::Int(n) => n as usize,
        _ => 0,
    }
}

pub fn dict_keys(heap: &Heap, dict: Ref) -> Option<Ref> {
    heap.field(dict, DICT_KEYS).as_ref()
}

fn keys_match(heap: &Heap, candidate: Value, key: Value) -> bool {
    if candidate == key {
        return true;
    }
    if let (Value::Ref(a), Value::Ref(b)) = (candidate, key) {
        return heap.class_index(a) == STRING_CLASS
            && heap.class_index(b) == STRING_CLASS
            && heap.string_eq(a, b);
    }
    false
}

/// Probe for `key`: the slot holding it, or the first nil slot.
fn scan_slot(heap: &mut Heap, keys: Ref, key: Value) -> usize {
    let capacity = heap.word_count(keys);
    let mut slot = object_hash(heap, key) as usize % capacity;
    loop {
        let candidate = heap.field(keys, slot);
        if candidate.is_nil() || keys_match(heap, candidate, key) {
            return slot;
        }
        slot = (slot + 1) % capacity;
    }
}

/// The value stored under `key`, nil when absent.
pub fn dict_at(heap: &mut Heap, dict: Ref, key: Value) -> Value {
    let Some(keys) = heap.field(dict, DICT_KEYS).as_ref() else {
        return Value::Nil;
    };
    let Some(values) = heap.field(dict, DICT_VALUES).as_ref() else {
        return Value::Nil;
    };
    let slot = scan_slot(heap, keys, key);
    if heap.field(keys, slot).is_nil() {
        Value::Nil
    } else {
        heap.field(values, slot)
    }
}

pub fn dict_has_key(heap: &mut Heap, dict: Ref, key: Value) -> bool {
    let Some(keys) = heap.field(dict, DICT_KEYS).as_ref() else {
        return false;
    };
    let slot = scan_slot(heap, keys, key);
    !heap.field(keys, slot).is_nil()
}

/// Stores `value` under `key`, growing the arrays when occupancy passes
/// 75%. Growth allocates but never moves the dictionary itself.
pub fn dict_at_put(heap: &mut Heap, dict: Ref, key: Value, value: Value) -> Result<(), OutOfMemory> {
    let Some(keys) = heap.field(dict, DICT_KEYS).as_ref() else {
        return Ok(());
    };
    let Some(values) = heap.field(dict, DICT_VALUES).as_ref() else {
        return Ok(());
    };
    let slot = scan_slot(heap, keys, key);
    let mut tally = dict_count(heap, dict);
    if heap.field(keys, slot).is_nil() {
        tally += 1;
        heap.set_field(keys, slot, key);
        heap.set_field(dict, DICT_TALLY, Value::Int(tally as i32));
    }
    heap.set_field(values, slot, value);

    let capacity = heap.word_count(keys);
    if 3 * capacity < 4 * tally {
        grow(heap, dict, keys, values, capacity * 2)?;
    }
    Ok(())
}

fn grow(
    heap: &mut Heap,
    dict: Ref,
    old_keys: Ref,
    old_values: Ref,
    new_capacity: usize,
) -> Result<(), OutOfMemory> {
    let new_keys = heap.new_array(new_capacity, Value::Nil)?;
    let new_values = heap.new_array(new_capacity, Value::Nil)?;
    for i in 0..heap.word_count(old_keys) {
        let key = heap.field(old_keys, i);
        if key.is_nil() {
            continue;
        }
        let slot = scan_slot(heap, new_keys, key);
        heap.set_field(new_keys, slot, key);
        heap.set_field(new_values, slot, heap.field(old_values, i));
    }
    heap.set_field(dict, DICT_KEYS, Value::Ref(new_keys));
    heap.set_field(dict, DICT_VALUES, Value::Ref(new_values));
    Ok(())
}
