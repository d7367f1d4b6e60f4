use std::sync::atomic::{AtomicUsize, Ordering};

use bramble::memory::header::{
    ARRAY_CLASS, BINARY_DATA_CLASS, BOOLEAN_CLASS, EXTERNAL_REF_CLASS, INTEGER_CLASS,
    LARGE_INTEGER_CLASS, NIL_CLASS, STRING_CLASS,
};
use bramble::memory::heap::Heap;
use bramble::memory::value::Value;

#[test]
fn allocation_writes_headers_and_fields_read_back() {
    let mut heap = Heap::new(2);
    let obj = heap.allocate(ARRAY_CLASS, 3, Value::Nil).unwrap();
    assert_eq!(heap.class_index(obj), ARRAY_CLASS);
    assert_eq!(heap.word_count(obj), 3);
    assert!(heap.format(obj).has_refs());

    heap.set_field(obj, 0, Value::Int(-4));
    heap.set_field(obj, 1, Value::True);
    heap.set_field(obj, 2, Value::Ref(obj));
    assert_eq!(heap.field(obj, 0), Value::Int(-4));
    assert_eq!(heap.field(obj, 1), Value::True);
    assert_eq!(heap.field(obj, 2), Value::Ref(obj));
}

#[test]
fn immediate_values_have_classes_but_no_storage() {
    let mut heap = Heap::new(2);
    let before = heap.used_bytes();
    let v = heap.int_value(41).unwrap();
    assert_eq!(v, Value::Int(41));
    assert_eq!(heap.used_bytes(), before, "small ints must not allocate");

    assert_eq!(heap.class_index_of(Value::Nil), NIL_CLASS);
    assert_eq!(heap.class_index_of(Value::True), BOOLEAN_CLASS);
    assert_eq!(heap.class_index_of(Value::False), BOOLEAN_CLASS);
    assert_eq!(heap.class_index_of(Value::Int(7)), INTEGER_CLASS);
}

#[test]
fn strings_round_trip_and_compare_by_contents() {
    let mut heap = Heap::new(2);
    let a = heap.new_string("garden").unwrap();
    let b = heap.new_string("garden").unwrap();
    let c = heap.new_string("gate").unwrap();

    assert_eq!(heap.class_index(a), STRING_CLASS);
    assert!(!heap.format(a).has_refs());
    assert_eq!(heap.string_len(a), 6);
    assert_eq!(heap.string_byte(a, 0), b'g');
    assert_eq!(heap.string_value(a), "garden");
    assert!(heap.str_matches(a, "garden"));
    assert!(!heap.str_matches(a, "gardens"));
    assert!(heap.string_eq(a, b));
    assert!(!heap.string_eq(a, c));
}

#[test]
fn wide_integers_box_and_convert() {
    let mut heap = Heap::new(2);
    let v = heap.int_value(5_000_000_000).unwrap();
    let Value::Ref(r) = v else {
        panic!("expected a boxed integer, got {v}")
    };
    assert_eq!(heap.class_index(r), LARGE_INTEGER_CLASS);
    assert_eq!(heap.large_int_to_i64(r), Some(5_000_000_000));
    assert_eq!(heap.large_int_to_f64(r), 5_000_000_000.0);

    let negative = heap.int_value(-5_000_000_000).unwrap();
    let Value::Ref(r) = negative else {
        panic!("expected a boxed integer, got {negative}")
    };
    assert_eq!(heap.large_int_to_i64(r), Some(-5_000_000_000));

    let f = heap.new_float(0.25).unwrap();
    assert_eq!(heap.float_value(f), 0.25);
}

#[test]
fn binary_data_stores_raw_bytes() {
    let mut heap = Heap::new(2);
    let data = heap.new_binary_data(&[1, 2, 250]).unwrap();
    assert_eq!(heap.class_index(data), BINARY_DATA_CLASS);
    assert_eq!(heap.byte_count(data), 3);
    assert_eq!(heap.byte_at(data, 2), 250);
    heap.set_byte_at(data, 0, 9);
    assert_eq!(heap.binary_bytes(data), vec![9, 2, 250]);
}

#[test]
fn copy_append_and_clone_preserve_contents() {
    let mut heap = Heap::new(2);
    let arr = heap.new_array(3, Value::Nil).unwrap();
    for i in 0..3 {
        heap.set_field(arr, i, Value::Int(i as i32 + 1));
    }

    let grown = heap.copy_obj(arr, 5, 1).unwrap();
    assert_eq!(heap.word_count(grown), 5);
    assert_eq!(heap.field(grown, 0), Value::Int(1));
    assert_eq!(heap.field(grown, 2), Value::Int(3));
    assert_eq!(heap.field(grown, 3), Value::Nil);
    assert_eq!(heap.field(grown, 4), Value::Nil);

    let tail = heap.copy_obj(arr, 2, 2).unwrap();
    assert_eq!(heap.field(tail, 0), Value::Int(2));
    assert_eq!(heap.field(tail, 1), Value::Int(3));

    let longer = heap.append(arr, Value::Int(4)).unwrap();
    assert_eq!(heap.word_count(longer), 4);
    assert_eq!(heap.field(longer, 3), Value::Int(4));

    let copy = heap.clone_obj(arr).unwrap();
    assert_ne!(copy, arr);
    assert_eq!(heap.class_index(copy), ARRAY_CLASS);
    assert_eq!(heap.field(copy, 1), Value::Int(2));
}

#[test]
fn heap_walk_visits_objects_in_address_order() {
    let mut heap = Heap::new(2);
    let first = heap.new_array(1, Value::Nil).unwrap();
    let name = heap.new_string("between").unwrap();
    let second = heap.new_array(1, Value::Nil).unwrap();

    let mut arrays = Vec::new();
    let mut cursor = None;
    while let Some(obj) = heap.object_after(cursor, ARRAY_CLASS) {
        arrays.push(obj);
        cursor = Some(obj);
    }
    assert_eq!(arrays, vec![first, second]);

    let strings: Vec<_> = std::iter::successors(
        heap.object_after(None, STRING_CLASS),
        |prev| heap.object_after(Some(*prev), STRING_CLASS),
    )
    .collect();
    assert_eq!(strings, vec![name]);
}

#[test]
fn reference_queries_and_bulk_replacement() {
    let mut heap = Heap::new(2);
    let target = heap.new_array(1, Value::Int(5)).unwrap();
    let other = heap.new_array(1, Value::Int(6)).unwrap();
    let holder = heap.new_array(2, Value::Nil).unwrap();
    heap.set_field(holder, 0, Value::Ref(target));
    heap.set_field(holder, 1, Value::Int(0));

    let holders = heap.references_to(target);
    assert!(holders.contains(&holder), "holder not reported: {holders:?}");
    assert!(heap.references_to(other).is_empty());

    heap.replace_objects(&[(Value::Ref(target), Value::Ref(other))]);
    assert_eq!(heap.field(holder, 0), Value::Ref(other));
}

static SOCKET_CLOSES: AtomicUsize = AtomicUsize::new(0);

fn close_socket(handle: u32) {
    SOCKET_CLOSES.fetch_add(handle as usize, Ordering::SeqCst);
}

#[test]
fn external_references_release_native_handles_once() {
    let mut heap = Heap::new(2);
    let id = heap.register_finalizer("socket", close_socket);
    assert_eq!(heap.finalizer_named("socket"), Some(id));
    assert_eq!(heap.finalizer_named("pipe"), None);

    let ext = heap.new_external_reference(70, id).unwrap();
    assert_eq!(heap.class_index(ext), EXTERNAL_REF_CLASS);
    assert_eq!(heap.external_handle(ext), 70);

    heap.close_external(ext);
    assert_eq!(heap.external_handle(ext), 0);
    assert_eq!(SOCKET_CLOSES.load(Ordering::SeqCst), 70);

    // Closing again must not run the finalizer a second time.
    heap.close_external(ext);
    assert_eq!(SOCKET_CLOSES.load(Ordering::SeqCst), 70);
}

#[test]
fn mem_stats_track_capacity_and_allocation_counters() {
    let mut heap = Heap::new(1);
    let stats = heap.mem_stats();
    assert_eq!(stats.capacity_bytes, 1_000_000);
    assert_eq!(stats.gc_count, 0);

    let before = heap.mem_stats();
    heap.new_array(10, Value::Nil).unwrap();
    let after = heap.mem_stats();
    assert_eq!(after.allocations_since_gc, before.allocations_since_gc + 1);
    assert!(after.bytes_allocated_since_gc > before.bytes_allocated_since_gc);
    assert!(after.used_bytes > before.used_bytes);
}

#[test]
fn oversized_allocations_fault_instead_of_growing() {
    let mut heap = Heap::new(1);
    assert!(!heap.can_allocate(300_000));
    assert!(heap.allocate(ARRAY_CLASS, 300_000, Value::Nil).is_err());
    // The failed allocation must leave the heap usable.
    let ok = heap.new_array(4, Value::Nil).unwrap();
    assert_eq!(heap.word_count(ok), 4);
}
