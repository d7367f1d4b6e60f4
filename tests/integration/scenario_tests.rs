//! End-to-end runs that cross the collector, the class model, and the
//! scheduler in one program.

use bramble::memory::value::Value;
use bramble::runtime::node::chain;
use bramble::runtime::task::WaitReason;
use bramble::runtime::vm::{RunResult, VM};

#[path = "../common/mod.rs"]
mod common;

use common::{assign, module_var, read_var, run_blocks, s, small_vm};

#[test]
fn steady_state_churn_returns_memory_to_baseline() {
    let mut vm = small_vm();
    let fresh = vm.reporter("newArray", &[Value::Int(1000)]).unwrap();
    let keep = assign(&mut vm, "x", Value::Ref(fresh));
    let cycle = vm
        .command("repeat", &[Value::Int(200), Value::Ref(keep)])
        .unwrap();
    // Root the program so it survives the collections between cycles;
    // compaction moves it, so each cycle rereads the handle.
    vm.add_module_variable(vm.current_module, "prog", Value::Ref(cycle))
        .unwrap();

    let mut settled = Vec::new();
    for _ in 0..5 {
        let Value::Ref(cycle) = module_var(&vm, "prog") else {
            panic!("program lost")
        };
        run_blocks(&mut vm, &[cycle]);
        vm.collect_now();
        settled.push(vm.heap.used_bytes());
    }

    // The first cycle interns names and creates the variable; every
    // later cycle must come back to exactly the same live set.
    assert_eq!(settled[1], settled[2], "live set grew: {settled:?}");
    assert_eq!(settled[2], settled[3], "live set grew: {settled:?}");
    assert_eq!(settled[3], settled[4], "live set grew: {settled:?}");
    assert!(vm.heap.gc_count() > 0, "churn never triggered a collection");
}

#[test]
fn method_redefinition_reaches_live_instances_and_warm_sites() {
    let mut vm = small_vm();
    let square = vm.define_class("Square", &["side"]).unwrap();
    let side = read_var(&mut vm, "side");
    let side2 = read_var(&mut vm, "side");
    let product = vm.reporter("*", &[side, side2]).unwrap();
    let body = vm.command("return", &[Value::Ref(product)]).unwrap();
    vm.add_method(square, "area", &[], Some(body)).unwrap();

    let index = match vm.heap.field(square, bramble::runtime::classes::CLASS_INDEX) {
        Value::Int(n) => n as u32,
        other => panic!("bad class index {other:?}"),
    };
    let inst = vm.new_instance(index).unwrap();
    vm.heap.set_field(inst, 0, Value::Int(4));

    let call = vm.reporter("area", &[Value::Ref(inst)]).unwrap();
    let measure = assign(&mut vm, "r", Value::Ref(call));

    run_blocks(&mut vm, &[measure]);
    assert_eq!(module_var(&vm, "r"), Value::Int(16));

    // Redefine area as the doubled side and rerun the very same warm
    // call node against the very same instance.
    let side = read_var(&mut vm, "side");
    let doubled = vm.reporter("*", &[Value::Int(2), side]).unwrap();
    let body = vm.command("return", &[Value::Ref(doubled)]).unwrap();
    vm.add_method(square, "area", &[], Some(body)).unwrap();

    run_blocks(&mut vm, &[measure]);
    assert_eq!(
        module_var(&vm, "r"),
        Value::Int(8),
        "warm call site kept dispatching to the old method"
    );
}

#[test]
fn a_producer_yields_at_its_threshold_and_finishes_after() {
    let mut vm = small_vm();
    let init = assign(&mut vm, "s", Value::Int(0));
    let name = s(&mut vm, "s");
    let inc = vm.command("+=", &[Value::Ref(name), Value::Int(1)]).unwrap();
    let seen = read_var(&mut vm, "s");
    let at_mark = vm.reporter("==", &[seen, Value::Int(500)]).unwrap();
    let pause = vm.command("yield", &[]).unwrap();
    let guard = vm
        .command("if", &[Value::Ref(at_mark), Value::Ref(pause)])
        .unwrap();
    let step = chain(&mut vm.heap, &[inc, guard]).unwrap();
    let i_name = s(&mut vm, "i");
    let produce = vm
        .command("for", &[Value::Ref(i_name), Value::Int(1000), Value::Ref(step)])
        .unwrap();
    let prog = chain(&mut vm.heap, &[init, produce]).unwrap();

    let task = vm.spawn_task(prog).unwrap();
    assert_eq!(vm.run_task(task).unwrap(), RunResult::Suspended);
    assert_eq!(vm.task_wait_reason(task), Some(WaitReason::Display));
    assert_eq!(
        module_var(&vm, "s"),
        Value::Int(500),
        "the park must land exactly on the threshold"
    );

    assert!(matches!(vm.run_task(task).unwrap(), RunResult::Completed(_)));
    assert_eq!(module_var(&vm, "s"), Value::Int(1000));
}

#[test]
fn collected_programs_leave_a_usable_machine() {
    let mut vm = VM::new(2).expect("heap");
    for round in 0..3 {
        // One round allocates more than the whole arena, so it cannot
        // finish without at least one collection.
        let fresh = vm.reporter("newArray", &[Value::Int(600)]).unwrap();
        let keep = assign(&mut vm, "x", Value::Ref(fresh));
        let cycle = vm
            .command("repeat", &[Value::Int(1000), Value::Ref(keep)])
            .unwrap();
        run_blocks(&mut vm, &[cycle]);
        assert!(
            matches!(module_var(&vm, "x"), Value::Ref(_)),
            "round {round} lost its result"
        );
    }
    assert!(vm.heap.gc_count() >= 3, "each round overflows a 2 MB heap");
}
