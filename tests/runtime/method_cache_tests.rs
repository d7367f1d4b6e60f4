use bramble::memory::value::Value;

#[path = "../common/mod.rs"]
mod common;

use common::{assign, module_var, run_blocks, s, small_vm};

#[test]
fn program_dispatch_warms_the_shared_cache() {
    let mut vm = small_vm();
    let body = vm.command("return", &[Value::Int(1)]).unwrap();
    vm.add_function(vm.current_module, "probe", &[], Some(body))
        .unwrap();

    let left = vm.reporter("probe", &[]).unwrap();
    let right = vm.reporter("probe", &[]).unwrap();
    let sum = vm
        .reporter("+", &[Value::Ref(left), Value::Ref(right)])
        .unwrap();
    let set = assign(&mut vm, "x", Value::Ref(sum));

    let before = vm.method_cache_stats();
    run_blocks(&mut vm, &[set]);
    assert_eq!(module_var(&vm, "x"), Value::Int(2));

    let after = vm.method_cache_stats();
    assert!(after.misses > before.misses, "first resolution must miss");

    // The run left the shared cache warm for everyone else.
    let module = vm.current_module;
    let found = vm.find_method("probe", None, module).unwrap();
    assert!(found.is_some());
    let warmed = vm.method_cache_stats();
    assert_eq!(warmed.hits, after.hits + 1);
    assert_eq!(warmed.misses, after.misses);
}

#[test]
fn redefinition_mid_program_reaches_later_call_sites() {
    let mut vm = small_vm();
    let body = vm.command("return", &[Value::Int(1)]).unwrap();
    vm.add_function(vm.current_module, "f", &[], Some(body))
        .unwrap();

    let first = vm.reporter("f", &[]).unwrap();
    let set_a = assign(&mut vm, "a", Value::Ref(first));
    let name = s(&mut vm, "f");
    let new_body = vm.command("return", &[Value::Int(2)]).unwrap();
    let redefine = vm
        .command("to", &[Value::Ref(name), Value::Ref(new_body)])
        .unwrap();
    let second = vm.reporter("f", &[]).unwrap();
    let set_b = assign(&mut vm, "b", Value::Ref(second));

    run_blocks(&mut vm, &[set_a, redefine, set_b]);

    assert_eq!(module_var(&vm, "a"), Value::Int(1));
    assert_eq!(
        module_var(&vm, "b"),
        Value::Int(2),
        "the call after 'to' must see the new definition"
    );
}

#[test]
fn warm_call_sites_bypass_the_shared_cache() {
    let mut vm = small_vm();
    let body = vm.command("return", &[Value::Int(4)]).unwrap();
    vm.add_function(vm.current_module, "probe", &[], Some(body))
        .unwrap();
    let call = vm.reporter("probe", &[]).unwrap();
    let set = assign(&mut vm, "x", Value::Ref(call));

    run_blocks(&mut vm, &[set]);
    let warm = vm.method_cache_stats();

    // Rerunning the same nodes dispatches through the per-site caches
    // without consulting the shared dictionary at all.
    run_blocks(&mut vm, &[set]);
    let rerun = vm.method_cache_stats();
    assert_eq!(rerun.hits, warm.hits, "warm sites should not probe the cache");
    assert_eq!(rerun.misses, warm.misses);

    // Flushing the sites forces re-resolution, which now hits the still
    // warm shared entries instead of missing.
    vm.clear_call_site_caches();
    run_blocks(&mut vm, &[set]);
    let refilled = vm.method_cache_stats();
    assert!(refilled.hits > rerun.hits, "expected shared-cache hits");
    assert_eq!(refilled.misses, rerun.misses);
    assert_eq!(module_var(&vm, "x"), Value::Int(4));
}

#[test]
fn library_loads_batch_invalidation_to_the_end() {
    let mut vm = small_vm();
    let body = vm.command("return", &[Value::Int(1)]).unwrap();
    vm.add_function(vm.current_module, "f", &[], Some(body))
        .unwrap();
    let module = vm.current_module;
    vm.find_method("f", None, module).unwrap();
    let warm = vm.method_cache_stats();

    vm.begin_library_load();
    let body = vm.command("return", &[Value::Int(2)]).unwrap();
    vm.add_function(module, "g", &[], Some(body)).unwrap();
    let mid = vm.method_cache_stats();
    assert_eq!(mid.full_clears, warm.full_clears, "load must defer the flush");
    vm.find_method("f", None, module).unwrap();
    assert_eq!(
        vm.method_cache_stats().hits,
        mid.hits + 1,
        "unrelated entries stay warm during a load"
    );

    vm.end_library_load().unwrap();
    let flushed = vm.method_cache_stats();
    assert_eq!(flushed.full_clears, mid.full_clears + 1);
    assert_eq!(flushed.selectors, 0, "the dictionary must start over");
    vm.find_method("f", None, module).unwrap();
    assert_eq!(
        vm.method_cache_stats().misses,
        flushed.misses + 1,
        "entries repopulate on first use after the flush"
    );
}
