use bramble::memory::value::{Ref, Value};
use bramble::runtime::node::chain;
use bramble::runtime::vm::VM;

#[path = "../common/mod.rs"]
mod common;

use common::{assign, module_var, read_var, run_blocks, run_blocks_to_error, s, small_vm};

fn rep(vm: &mut VM, op: &str, args: &[Value]) -> Value {
    Value::Ref(vm.reporter(op, args).expect("reporter"))
}

#[test]
fn arithmetic_promotes_instead_of_wrapping() {
    let mut vm = small_vm();
    let million = Value::Int(1_000_000);
    let square = rep(&mut vm, "*", &[million, million]);
    let cube = rep(&mut vm, "*", &[square, million]);
    let set = assign(&mut vm, "x", cube);
    let wide = rep(&mut vm, "+", &[Value::Int(2_000_000_000), Value::Int(2_000_000_000)]);
    let set2 = assign(&mut vm, "y", wide);

    run_blocks(&mut vm, &[set, set2]);

    let Value::Ref(x) = module_var(&vm, "x") else {
        panic!("product should be boxed")
    };
    assert_eq!(vm.heap.large_int_to_i64(x), Some(1_000_000_000_000_000_000));
    let Value::Ref(y) = module_var(&vm, "y") else {
        panic!("sum should be boxed")
    };
    assert_eq!(vm.heap.large_int_to_i64(y), Some(4_000_000_000));
}

#[test]
fn loops_and_conditionals_drive_accumulation() {
    let mut vm = small_vm();
    let init = assign(&mut vm, "s", Value::Int(0));
    let i_name = s(&mut vm, "i");
    let step = read_var(&mut vm, "i");
    let s_name = s(&mut vm, "s");
    let body = vm.command("+=", &[Value::Ref(s_name), step]).unwrap();
    let walk = vm
        .command("for", &[Value::Ref(i_name), Value::Int(5), Value::Ref(body)])
        .unwrap();
    let cond = {
        let seen = read_var(&mut vm, "s");
        rep(&mut vm, "<", &[seen, Value::Int(100)])
    };
    let then = assign(&mut vm, "ok", Value::True);
    let check = vm.command("if", &[cond, Value::Ref(then)]).unwrap();

    run_blocks(&mut vm, &[init, walk, check]);

    assert_eq!(module_var(&vm, "s"), Value::Int(15));
    assert_eq!(module_var(&vm, "ok"), Value::True);
}

#[test]
fn untaken_branches_do_not_run() {
    let mut vm = small_vm();
    let init = assign(&mut vm, "x", Value::Int(9));
    let cond = {
        let x = read_var(&mut vm, "x");
        rep(&mut vm, "<", &[x, Value::Int(5)])
    };
    let then = assign(&mut vm, "y", Value::Int(1));
    let check = vm.command("if", &[cond, Value::Ref(then)]).unwrap();
    let after = assign(&mut vm, "z", Value::Int(2));

    run_blocks(&mut vm, &[init, check, after]);

    assert_eq!(module_var(&vm, "y"), Value::Nil, "branch ran despite false guard");
    assert_eq!(module_var(&vm, "z"), Value::Int(2));
}

#[test]
fn while_loops_reevaluate_their_condition() {
    let mut vm = small_vm();
    let init = assign(&mut vm, "n", Value::Int(0));
    let cond = {
        let n = read_var(&mut vm, "n");
        rep(&mut vm, "<", &[n, Value::Int(3)])
    };
    let n_name = s(&mut vm, "n");
    let body = vm.command("+=", &[Value::Ref(n_name), Value::Int(1)]).unwrap();
    let spin = vm.command("while", &[cond, Value::Ref(body)]).unwrap();

    run_blocks(&mut vm, &[init, spin]);

    assert_eq!(module_var(&vm, "n"), Value::Int(3));
}

fn define_fib(vm: &mut VM) {
    let n = read_var(vm, "n");
    let base_ret = vm.command("return", &[n]).unwrap();
    let n = read_var(vm, "n");
    let cond = rep(vm, "<", &[n, Value::Int(2)]);
    let base = vm.command("if", &[cond, Value::Ref(base_ret)]).unwrap();

    let n = read_var(vm, "n");
    let n_minus_1 = rep(vm, "-", &[n, Value::Int(1)]);
    let left = rep(vm, "fib", &[n_minus_1]);
    let n = read_var(vm, "n");
    let n_minus_2 = rep(vm, "-", &[n, Value::Int(2)]);
    let right = rep(vm, "fib", &[n_minus_2]);
    let sum = rep(vm, "+", &[left, right]);
    let rec = vm.command("return", &[sum]).unwrap();

    let body = chain(&mut vm.heap, &[base, rec]).unwrap();
    vm.add_function(vm.current_module, "fib", &["n"], Some(body))
        .unwrap();
}

#[test]
fn recursive_calls_stack_and_return() {
    let mut vm = small_vm();
    define_fib(&mut vm);
    let call = rep(&mut vm, "fib", &[Value::Int(10)]);
    let set = assign(&mut vm, "r", call);

    run_blocks(&mut vm, &[set]);

    assert_eq!(module_var(&vm, "r"), Value::Int(55));
}

#[test]
fn methods_bind_fields_and_arguments() {
    let mut vm = small_vm();
    let class = vm.define_class("Counter", &["count"]).unwrap();
    let count_name = s(&mut vm, "count");
    let delta = read_var(&mut vm, "delta");
    let bump = vm.command("+=", &[Value::Ref(count_name), delta]).unwrap();
    let count = read_var(&mut vm, "count");
    let give = vm.command("return", &[count]).unwrap();
    let body = chain(&mut vm.heap, &[bump, give]).unwrap();
    vm.add_method(class, "bump", &["delta"], Some(body)).unwrap();

    let index = match vm.heap.field(class, bramble::runtime::classes::CLASS_INDEX) {
        Value::Int(n) => n as u32,
        other => panic!("bad class index {other:?}"),
    };
    let inst = vm.new_instance(index).unwrap();
    vm.heap.set_field(inst, 0, Value::Int(10));
    vm.add_module_variable(vm.current_module, "c", Value::Ref(inst))
        .unwrap();

    let call = rep(&mut vm, "bump", &[Value::Ref(inst), Value::Int(5)]);
    let set = assign(&mut vm, "r", call);
    let holder = read_var(&mut vm, "c");
    let field_name = s(&mut vm, "count");
    let peek = rep(&mut vm, "getField", &[holder, Value::Ref(field_name)]);
    let set2 = assign(&mut vm, "seen", peek);

    run_blocks(&mut vm, &[set, set2]);

    assert_eq!(module_var(&vm, "r"), Value::Int(15));
    assert_eq!(module_var(&vm, "seen"), Value::Int(15));
}

#[test]
fn dispatch_revalidates_when_the_receiver_class_changes() {
    let mut vm = small_vm();
    let alpha = vm.define_class("Alpha", &["mark"]).unwrap();
    let beta = vm.define_class("Beta", &["mark"]).unwrap();
    let one = vm.command("return", &[Value::Int(1)]).unwrap();
    vm.add_method(alpha, "tagOf", &[], Some(one)).unwrap();
    let two = vm.command("return", &[Value::Int(2)]).unwrap();
    vm.add_method(beta, "tagOf", &[], Some(two)).unwrap();

    // One shared call site inside `probe` sees both receiver classes.
    let o = read_var(&mut vm, "o");
    let tag = rep(&mut vm, "tagOf", &[o]);
    let give = vm.command("return", &[tag]).unwrap();
    vm.add_function(vm.current_module, "probe", &["o"], Some(give))
        .unwrap();

    let index_of = |vm: &VM, class: Ref| match vm.heap.field(class, bramble::runtime::classes::CLASS_INDEX) {
        Value::Int(n) => n as u32,
        other => panic!("bad class index {other:?}"),
    };
    let a = vm.new_instance(index_of(&vm, alpha)).unwrap();
    let b = vm.new_instance(index_of(&vm, beta)).unwrap();

    let call_a = rep(&mut vm, "probe", &[Value::Ref(a)]);
    let set_a = assign(&mut vm, "a", call_a);
    let call_b = rep(&mut vm, "probe", &[Value::Ref(b)]);
    let set_b = assign(&mut vm, "b", call_b);

    run_blocks(&mut vm, &[set_a, set_b]);

    assert_eq!(module_var(&vm, "a"), Value::Int(1));
    assert_eq!(
        module_var(&vm, "b"),
        Value::Int(2),
        "stale per-site cache served the wrong class"
    );
}

#[test]
fn return_unwinds_only_its_own_activation() {
    let mut vm = small_vm();
    let give = vm.command("return", &[Value::Int(5)]).unwrap();
    let never = assign(&mut vm, "after", Value::Int(1));
    let body = chain(&mut vm.heap, &[give, never]).unwrap();
    vm.add_function(vm.current_module, "early", &[], Some(body))
        .unwrap();

    let call = rep(&mut vm, "early", &[]);
    let set = assign(&mut vm, "r", call);
    let tail = assign(&mut vm, "tail", Value::Int(2));

    run_blocks(&mut vm, &[set, tail]);

    assert_eq!(module_var(&vm, "r"), Value::Int(5));
    assert_eq!(module_var(&vm, "after"), Value::Nil, "code under return ran");
    assert_eq!(module_var(&vm, "tail"), Value::Int(2), "caller chain stopped");
}

#[test]
fn collection_primitives_compose_in_programs() {
    let mut vm = small_vm();
    let fresh = rep(&mut vm, "newArray", &[Value::Int(3)]);
    let set = assign(&mut vm, "xs", fresh);
    let mut stores = Vec::new();
    for i in 1..=3 {
        let xs = read_var(&mut vm, "xs");
        let store = vm
            .command("atPut", &[xs, Value::Int(i), Value::Int(i * 10)])
            .unwrap();
        stores.push(store);
    }
    let xs = read_var(&mut vm, "xs");
    let size = rep(&mut vm, "count", &[xs]);
    let set_n = assign(&mut vm, "n", size);
    let xs = read_var(&mut vm, "xs");
    let first = rep(&mut vm, "at", &[xs, Value::Int(1)]);
    let set_first = assign(&mut vm, "first", first);

    let packed = rep(&mut vm, "list", &[Value::Int(4), Value::Int(5), Value::Int(6)]);
    let set_ys = assign(&mut vm, "ys", packed);
    let ys = read_var(&mut vm, "ys");
    let mid = rep(&mut vm, "at", &[ys, Value::Int(2)]);
    let set_mid = assign(&mut vm, "mid", mid);

    let mut blocks = vec![set];
    blocks.extend(stores);
    blocks.extend([set_n, set_first, set_ys, set_mid]);
    run_blocks(&mut vm, &blocks);

    assert_eq!(module_var(&vm, "n"), Value::Int(3));
    assert_eq!(module_var(&vm, "first"), Value::Int(10));
    assert_eq!(module_var(&vm, "mid"), Value::Int(5));
}

#[test]
fn tick_budgets_slice_execution_without_losing_state() {
    let mut vm = small_vm();
    vm.set_tick_limit(50);
    let init = assign(&mut vm, "s", Value::Int(0));
    let s_name = s(&mut vm, "s");
    let body = vm.command("+=", &[Value::Ref(s_name), Value::Int(1)]).unwrap();
    let spin = vm
        .command("repeat", &[Value::Int(1000), Value::Ref(body)])
        .unwrap();
    let prog = chain(&mut vm.heap, &[init, spin]).unwrap();

    let task = vm.spawn_task(prog).unwrap();
    let mut slices = 0;
    loop {
        match vm.run_task(task).unwrap() {
            bramble::runtime::vm::RunResult::Suspended => slices += 1,
            bramble::runtime::vm::RunResult::Completed(_) => break,
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(slices < 10_000, "task never finished");
    }

    assert!(slices > 1, "a 50-tick budget must slice a 1000-iteration loop");
    assert_eq!(module_var(&vm, "s"), Value::Int(1000));
}

#[test]
fn undefined_functions_report_the_call_position() {
    let mut vm = small_vm();
    let call = vm.command_at("glorp", 4, "w.gp", &[]).unwrap();
    let report = run_blocks_to_error(&mut vm, &[call]);

    assert!(
        report.contains("Undefined function: glorp"),
        "got:\n{report}"
    );
    assert!(report.contains("w.gp:4"), "got:\n{report}");
}
