use std::sync::atomic::{AtomicUsize, Ordering};

use bramble::memory::value::Value;
use bramble::runtime::vm::VM;

#[path = "../common/mod.rs"]
mod common;

use common::{assign, module_var, run_blocks, small_vm};

#[test]
fn collection_recovers_unreferenced_objects() {
    let mut vm = small_vm();
    let keep = vm.heap.new_array(10, Value::Int(99)).unwrap();
    vm.add_module_variable(vm.current_module, "keep", Value::Ref(keep))
        .unwrap();
    for _ in 0..100 {
        vm.heap.new_array(1000, Value::Nil).unwrap();
    }
    let before = vm.heap.used_bytes();

    let stats = vm.collect_now();

    assert!(stats.recovered_bytes > 0, "no garbage recovered");
    assert!(
        vm.heap.used_bytes() < before,
        "used bytes did not drop: {} -> {}",
        before,
        vm.heap.used_bytes()
    );
    // The rooted array must survive with its contents, found through the
    // module rather than the stale pre-collection handle.
    let Value::Ref(keep) = module_var(&vm, "keep") else {
        panic!("rooted array was collected")
    };
    assert_eq!(vm.heap.word_count(keep), 10);
    assert_eq!(vm.heap.field(keep, 3), Value::Int(99));
}

#[test]
fn a_dropped_array_returns_the_heap_to_its_baseline() {
    let mut vm = small_vm();
    vm.collect_now();
    let baseline = vm.heap.used_bytes();

    vm.heap.new_array(1000, Value::Int(1)).unwrap();
    assert!(vm.heap.used_bytes() > baseline);

    vm.collect_now();
    // Compaction packs the same live set into the same span.
    assert_eq!(vm.heap.used_bytes(), baseline);
}

#[test]
fn compaction_preserves_object_graphs() {
    let mut vm = small_vm();
    let child = vm.heap.new_array(1, Value::Int(7)).unwrap();
    vm.heap.new_array(500, Value::Nil).unwrap();
    let holder = vm.heap.new_array(2, Value::Nil).unwrap();
    vm.heap.set_field(holder, 0, Value::Ref(child));
    vm.heap.new_array(500, Value::Nil).unwrap();
    vm.add_module_variable(vm.current_module, "holder", Value::Ref(holder))
        .unwrap();

    vm.collect_now();

    let Value::Ref(holder) = module_var(&vm, "holder") else {
        panic!("holder lost")
    };
    let Value::Ref(child) = vm.heap.field(holder, 0) else {
        panic!("child pointer lost")
    };
    assert_eq!(vm.heap.field(child, 0), Value::Int(7));

    let stats = vm.heap.mem_stats();
    assert_eq!(
        stats.used_bytes + vm.heap.free_bytes(),
        stats.capacity_bytes,
        "accounting drifted after compaction"
    );
}

#[test]
fn weak_arrays_let_dead_referents_go() {
    let mut vm = small_vm();
    let strong = vm.heap.new_array(1, Value::Int(1)).unwrap();
    let doomed = vm.heap.new_array(1, Value::Int(2)).unwrap();
    let weak = vm.heap.new_weak_array(2).unwrap();
    vm.heap.set_field(weak, 0, Value::Ref(strong));
    vm.heap.set_field(weak, 1, Value::Ref(doomed));
    vm.add_module_variable(vm.current_module, "weak", Value::Ref(weak))
        .unwrap();
    vm.add_module_variable(vm.current_module, "strong", Value::Ref(strong))
        .unwrap();

    vm.collect_now();

    let Value::Ref(weak) = module_var(&vm, "weak") else {
        panic!("weak array lost")
    };
    assert_eq!(
        vm.heap.field(weak, 0),
        module_var(&vm, "strong"),
        "strongly held referent must survive in the weak slot"
    );
    assert_eq!(
        vm.heap.field(weak, 1),
        Value::Nil,
        "dead referent must be cleared, not retained"
    );
}

static HANDLES_CLOSED: AtomicUsize = AtomicUsize::new(0);

fn record_close(handle: u32) {
    HANDLES_CLOSED.fetch_add(handle as usize, Ordering::SeqCst);
}

#[test]
fn finalizers_run_for_unreachable_external_references() {
    let mut vm = small_vm();
    let id = vm.heap.register_finalizer("probe", record_close);
    vm.heap.new_external_reference(33, id).unwrap();
    let kept = vm.heap.new_external_reference(44, id).unwrap();
    vm.add_module_variable(vm.current_module, "kept", Value::Ref(kept))
        .unwrap();

    vm.collect_now();
    assert_eq!(
        HANDLES_CLOSED.load(Ordering::SeqCst),
        33,
        "only the unreachable handle should be finalized"
    );

    vm.collect_now();
    assert_eq!(
        HANDLES_CLOSED.load(Ordering::SeqCst),
        33,
        "a surviving reference must not be finalized on later cycles"
    );
}

#[test]
fn collection_scheduling_respects_the_enable_switch() {
    let mut vm = small_vm();
    vm.heap.set_gc_enabled(false);
    vm.heap.request_collection();
    assert!(!vm.heap.should_collect(), "disabled heap asked to collect");

    vm.heap.set_gc_enabled(true);
    assert!(vm.heap.should_collect(), "pending request was dropped");

    vm.collect_now();
    assert!(!vm.heap.should_collect(), "request survived the collection");
}

#[test]
fn gc_stats_account_for_the_whole_arena() {
    let mut vm = small_vm();
    let gc_count_before = vm.heap.gc_count();
    let stats = vm.collect_now();

    assert!(stats.marked_objects > 0, "system objects were not marked");
    assert_eq!(stats.used_bytes + stats.free_bytes, vm.heap.capacity_bytes());
    assert_eq!(vm.heap.gc_count(), gc_count_before + 1);
}

#[test]
fn allocation_pressure_triggers_collection_mid_program() {
    let mut vm = VM::new(2).expect("heap");
    let fresh = vm.reporter("newArray", &[Value::Int(120)]).unwrap();
    let body = assign(&mut vm, "x", Value::Ref(fresh));
    let spin = vm
        .command("repeat", &[Value::Int(8000), Value::Ref(body)])
        .unwrap();

    run_blocks(&mut vm, &[spin]);

    assert!(
        vm.heap.gc_count() > 0,
        "8000 arrays of 120 slots cannot fit a 2 MB heap without collecting"
    );
}
