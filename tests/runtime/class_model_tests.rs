use bramble::memory::header::{LAST_BUILTIN_CLASS, MODULE_CLASS};
use bramble::memory::value::Value;
use bramble::runtime::classes::{CLASS_INDEX, MODULE_EXPANDERS, MODULE_FIELD_COUNT};

#[path = "../common/mod.rs"]
mod common;

use common::small_vm;

use bramble::memory::value::Ref;
use bramble::runtime::vm::VM;

fn class_index_of(vm: &VM, class: Ref) -> u32 {
    match vm.heap.field(class, CLASS_INDEX) {
        Value::Int(n) if n > 0 => n as u32,
        other => panic!("class without an index: {other:?}"),
    }
}

fn return_int(vm: &mut VM, n: i32) -> Ref {
    vm.command("return", &[Value::Int(n)]).expect("body")
}

#[test]
fn defining_a_class_registers_it_with_fields() {
    let mut vm = small_vm();
    let class = vm.define_class("Point", &["x", "y"]).unwrap();
    let index = class_index_of(&vm, class);
    assert!(index > LAST_BUILTIN_CLASS, "user classes follow the builtins");
    assert_eq!(vm.class_named(vm.current_module, "Point"), Some(class));
    assert_eq!(vm.class_name(index), "Point");

    assert_eq!(vm.field_index_of(index, "x"), Some(0));
    assert_eq!(vm.field_index_of(index, "y"), Some(1));
    assert_eq!(vm.field_index_of(index, "z"), None);

    let inst = vm.new_instance(index).unwrap();
    assert_eq!(vm.heap.class_index(inst), index);
    assert_eq!(vm.heap.word_count(inst), 2);
    assert_eq!(vm.heap.field(inst, 1), Value::Nil);

    // Redefinition by name hands back the existing class.
    assert_eq!(vm.define_class("Point", &[]).unwrap(), class);
}

#[test]
fn instances_grow_with_later_field_additions() {
    let mut vm = small_vm();
    let class = vm.define_class("Box", &["a"]).unwrap();
    let index = class_index_of(&vm, class);
    let old = vm.new_instance(index).unwrap();

    vm.add_field(class, "b").unwrap();

    let new = vm.new_instance(index).unwrap();
    assert_eq!(vm.heap.word_count(old), 1, "existing instances keep their size");
    assert_eq!(vm.heap.word_count(new), 2);
    assert_eq!(vm.field_index_of(index, "b"), Some(1));
}

#[test]
fn method_arguments_must_not_shadow_fields() {
    let mut vm = small_vm();
    let class = vm.define_class("Disc", &["radius"]).unwrap();

    let err = vm
        .add_method(class, "area", &["radius"], None)
        .unwrap_err()
        .to_string();
    assert!(
        err.contains("shadows a field name"),
        "wrong rejection: {err}"
    );

    let body = return_int(&mut vm, 9);
    vm.add_method(class, "area", &["scale"], Some(body)).unwrap();

    let err = vm
        .add_function(vm.current_module, "free", &["this"], None)
        .unwrap_err()
        .to_string();
    assert!(err.contains("'this'"), "wrong rejection: {err}");
}

#[test]
fn resolution_prefers_class_methods_over_module_functions() {
    let mut vm = small_vm();
    let class = vm.define_class("Crate", &[]).unwrap();
    let index = class_index_of(&vm, class);

    let f_body = return_int(&mut vm, 1);
    let function = vm
        .add_function(vm.current_module, "describe", &[], Some(f_body))
        .unwrap();
    let m_body = return_int(&mut vm, 2);
    let method = vm.add_method(class, "describe", &[], Some(m_body)).unwrap();

    let module = vm.current_module;
    assert_eq!(vm.lookup_method("describe", Some(index), module), Some(method));
    assert_eq!(vm.lookup_method("describe", None, module), Some(function));

    // The cached front end agrees and gets warmer as it goes.
    assert_eq!(vm.find_method("describe", Some(index), module).unwrap(), Some(method));
    let misses = vm.method_cache_stats().misses;
    let hits = vm.method_cache_stats().hits;
    assert_eq!(vm.find_method("describe", Some(index), module).unwrap(), Some(method));
    assert_eq!(vm.method_cache_stats().misses, misses);
    assert_eq!(vm.method_cache_stats().hits, hits + 1);
}

#[test]
fn expanders_in_the_calling_module_win_over_class_methods() {
    let mut vm = small_vm();
    let class = vm.define_class("Shape", &[]).unwrap();
    let index = class_index_of(&vm, class);

    let body_a = return_int(&mut vm, 1);
    let displaced = vm.add_method(class, "area", &[], Some(body_a)).unwrap();
    let body_b = return_int(&mut vm, 2);
    let installed = vm.add_method(class, "area", &[], Some(body_b)).unwrap();
    assert_ne!(displaced, installed, "redefinition must build a new function");

    // A host registers an expander by placing a function for a foreign
    // class into the module's expander list.
    let other = vm
        .heap
        .allocate(MODULE_CLASS, MODULE_FIELD_COUNT, Value::Nil)
        .unwrap();
    let listed = vm.heap.new_array(1, Value::Ref(displaced)).unwrap();
    vm.heap.set_field(other, MODULE_EXPANDERS, Value::Ref(listed));

    assert_eq!(
        vm.lookup_method("area", Some(index), other),
        Some(displaced),
        "expander in the calling module must shadow the class method"
    );
    assert_eq!(
        vm.lookup_method("area", Some(index), vm.current_module),
        Some(installed)
    );
}

#[test]
fn lookups_fall_back_to_top_then_session_modules() {
    let mut vm = small_vm();
    let body = return_int(&mut vm, 1);
    let shared = vm
        .add_function(vm.top_module, "greet", &[], Some(body))
        .unwrap();

    let elsewhere = vm
        .heap
        .allocate(MODULE_CLASS, MODULE_FIELD_COUNT, Value::Nil)
        .unwrap();
    assert_eq!(
        vm.lookup_method("greet", None, elsewhere),
        Some(shared),
        "top-level functions must be visible from every module"
    );

    let session = vm
        .heap
        .allocate(MODULE_CLASS, MODULE_FIELD_COUNT, Value::Nil)
        .unwrap();
    vm.session_module = session;
    let body = return_int(&mut vm, 2);
    let late = vm.add_function(session, "late", &[], Some(body)).unwrap();
    assert_eq!(
        vm.lookup_method("late", None, vm.top_module),
        Some(late),
        "the session module is the last fallback"
    );
}

#[test]
fn module_variables_update_in_place() {
    let mut vm = small_vm();
    let module = vm.current_module;
    let first = vm.add_module_variable(module, "level", Value::Int(1)).unwrap();
    let again = vm.add_module_variable(module, "level", Value::Int(2)).unwrap();

    assert_eq!(first, again, "assignment must reuse the slot");
    assert_eq!(vm.module_variable_index(module, "level"), Some(first));
    assert_eq!(vm.module_variable(module, first), Value::Int(2));
    assert_eq!(vm.module_variable_index(module, "missing"), None);
}
