#![allow(dead_code)]
//! Helpers shared by the test binaries: short program construction through
//! the node API and wrappers around the public scheduler entry points.

use bramble::memory::value::{Ref, Value};
use bramble::runtime::node::chain;
use bramble::runtime::vm::{RunResult, VM};

pub fn small_vm() -> VM {
    VM::new(4).expect("heap")
}

/// A fresh heap string.
pub fn s(vm: &mut VM, text: &str) -> Ref {
    vm.heap.new_string(text).expect("string")
}

/// Chains `blocks` into a program and runs it to completion.
pub fn run_blocks(vm: &mut VM, blocks: &[Ref]) -> Value {
    let prog = chain(&mut vm.heap, blocks).expect("non-empty program");
    match vm.run_program(prog).expect("host fault") {
        RunResult::Completed(v) => v,
        other => panic!("program did not complete: {other:?}"),
    }
}

/// Runs and expects an error stop; returns the report.
pub fn run_blocks_to_error(vm: &mut VM, blocks: &[Ref]) -> String {
    let prog = chain(&mut vm.heap, blocks).expect("non-empty program");
    match vm.run_program(prog).expect("host fault") {
        RunResult::Errored(report) => report,
        other => panic!("program did not stop with an error: {other:?}"),
    }
}

/// Reads a variable of the current module, nil when absent.
pub fn module_var(vm: &VM, name: &str) -> Value {
    match vm.module_variable_index(vm.current_module, name) {
        Some(i) => vm.module_variable(vm.current_module, i),
        None => Value::Nil,
    }
}

/// `name = value`, as a block.
pub fn assign(vm: &mut VM, name: &str, value: Value) -> Ref {
    let var = s(vm, name);
    vm.command("=", &[Value::Ref(var), value]).expect("assign block")
}

/// `(v name)`, as a reporter argument.
pub fn read_var(vm: &mut VM, name: &str) -> Value {
    let var = s(vm, name);
    Value::Ref(vm.reporter("v", &[Value::Ref(var)]).expect("read reporter"))
}
