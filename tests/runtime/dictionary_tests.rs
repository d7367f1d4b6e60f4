use bramble::memory::heap::Heap;
use bramble::memory::value::Value;
use bramble::runtime::dictionary::{
    dict_at, dict_at_put, dict_count, dict_has_key, dict_keys, new_dict,
};

#[path = "../common/mod.rs"]
mod common;

use common::{module_var, small_vm};

#[test]
fn inserts_find_their_values_and_missing_keys_read_nil() {
    let mut heap = Heap::new(2);
    let dict = new_dict(&mut heap, 4).unwrap();
    assert_eq!(dict_count(&heap, dict), 0);

    let name = heap.new_string("port").unwrap();
    dict_at_put(&mut heap, dict, Value::Ref(name), Value::Int(8080)).unwrap();
    dict_at_put(&mut heap, dict, Value::Int(3), Value::True).unwrap();

    assert_eq!(dict_count(&heap, dict), 2);
    assert_eq!(dict_at(&mut heap, dict, Value::Ref(name)), Value::Int(8080));
    assert_eq!(dict_at(&mut heap, dict, Value::Int(3)), Value::True);
    assert_eq!(dict_at(&mut heap, dict, Value::Int(4)), Value::Nil);
    assert!(dict_has_key(&mut heap, dict, Value::Int(3)));
    assert!(!dict_has_key(&mut heap, dict, Value::Int(4)));
}

#[test]
fn growth_keeps_every_entry_reachable() {
    let mut heap = Heap::new(2);
    let dict = new_dict(&mut heap, 4).unwrap();
    for i in 0..50 {
        let key = heap.new_string(&format!("key-{i}")).unwrap();
        dict_at_put(&mut heap, dict, Value::Ref(key), Value::Int(i)).unwrap();
    }

    assert_eq!(dict_count(&heap, dict), 50);
    let keys = dict_keys(&heap, dict).unwrap();
    assert!(
        heap.word_count(keys) > 50,
        "arrays did not grow past the load factor: {}",
        heap.word_count(keys)
    );
    for i in 0..50 {
        let probe = heap.new_string(&format!("key-{i}")).unwrap();
        assert_eq!(
            dict_at(&mut heap, dict, Value::Ref(probe)),
            Value::Int(i),
            "key-{i} lost during growth"
        );
    }
}

#[test]
fn string_keys_match_by_contents_identity_keys_by_reference() {
    let mut heap = Heap::new(2);
    let dict = new_dict(&mut heap, 8).unwrap();

    let written = heap.new_string("color").unwrap();
    dict_at_put(&mut heap, dict, Value::Ref(written), Value::Int(1)).unwrap();
    let equal = heap.new_string("color").unwrap();
    let different = heap.new_string("colour").unwrap();
    assert_eq!(dict_at(&mut heap, dict, Value::Ref(equal)), Value::Int(1));
    assert_eq!(dict_at(&mut heap, dict, Value::Ref(different)), Value::Nil);

    let a = heap.new_array(1, Value::Nil).unwrap();
    let b = heap.new_array(1, Value::Nil).unwrap();
    dict_at_put(&mut heap, dict, Value::Ref(a), Value::Int(2)).unwrap();
    assert_eq!(dict_at(&mut heap, dict, Value::Ref(a)), Value::Int(2));
    assert_eq!(
        dict_at(&mut heap, dict, Value::Ref(b)),
        Value::Nil,
        "a structurally equal array is still a different key"
    );
}

#[test]
fn overwriting_a_key_keeps_a_single_entry() {
    let mut heap = Heap::new(2);
    let dict = new_dict(&mut heap, 4).unwrap();
    let key = heap.new_string("retries").unwrap();
    dict_at_put(&mut heap, dict, Value::Ref(key), Value::Int(3)).unwrap();

    let same = heap.new_string("retries").unwrap();
    dict_at_put(&mut heap, dict, Value::Ref(same), Value::Int(5)).unwrap();

    assert_eq!(dict_count(&heap, dict), 1);
    assert_eq!(dict_at(&mut heap, dict, Value::Ref(key)), Value::Int(5));
}

#[test]
fn entries_survive_collection_and_compaction() {
    let mut vm = small_vm();
    let dict = new_dict(&mut vm.heap, 4).unwrap();
    vm.add_module_variable(vm.current_module, "table", Value::Ref(dict))
        .unwrap();
    for i in 0..20 {
        let key = vm.heap.new_string(&format!("entry-{i}")).unwrap();
        dict_at_put(&mut vm.heap, dict, Value::Ref(key), Value::Int(i)).unwrap();
    }
    let marker = vm.heap.new_array(1, Value::Int(-1)).unwrap();
    dict_at_put(&mut vm.heap, dict, Value::Ref(marker), Value::Int(99)).unwrap();
    vm.add_module_variable(vm.current_module, "marker", Value::Ref(marker))
        .unwrap();
    // Unrooted filler forces the survivors to slide during compaction.
    for _ in 0..50 {
        vm.heap.new_array(200, Value::Nil).unwrap();
    }

    vm.collect_now();

    let Value::Ref(dict) = module_var(&vm, "table") else {
        panic!("dictionary lost")
    };
    assert_eq!(dict_count(&vm.heap, dict), 21);
    for i in 0..20 {
        let probe = vm.heap.new_string(&format!("entry-{i}")).unwrap();
        assert_eq!(
            dict_at(&mut vm.heap, dict, Value::Ref(probe)),
            Value::Int(i),
            "entry-{i} unreachable after compaction"
        );
    }
    // Identity keys keep working because the cached hash moves with the
    // object and the stored key slot is forwarded to the new address.
    let moved = module_var(&vm, "marker");
    assert_eq!(dict_at(&mut vm.heap, dict, moved), Value::Int(99));
}
