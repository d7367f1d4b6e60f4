//! Pinned stop-report wording. These strings are host UI surface; edit
//! them deliberately.

use bramble::memory::value::Value;
use insta::assert_snapshot;

#[path = "../common/mod.rs"]
mod common;

use common::{run_blocks_to_error, s, small_vm};

#[test]
fn undefined_function_report() {
    let mut vm = small_vm();
    let host = s(&mut vm, "example.com");
    let call = vm
        .command_at(
            "openSocket",
            12,
            "demo.gp",
            &[Value::Ref(host), Value::Int(80)],
        )
        .unwrap();
    let report = run_blocks_to_error(&mut vm, &[call]);
    assert_snapshot!(report, @r"
    Undefined function: openSocket
    Stopped at demo.gp:12: openSocket 'example.com' 80
    ");
}

#[test]
fn bad_loop_count_report() {
    let mut vm = small_vm();
    let word = s(&mut vm, "forever");
    let spin = vm
        .command_at("repeat", 3, "loop.gp", &[Value::Ref(word), Value::Nil])
        .unwrap();
    let report = run_blocks_to_error(&mut vm, &[spin]);
    assert_snapshot!(report, @r"
    First argument of 'repeat' must be an integer or float
    Stopped at loop.gp:3: repeat 'forever' nil
    ");
}

#[test]
fn user_error_report() {
    let mut vm = small_vm();
    let what = s(&mut vm, "task exploded");
    let boom = vm
        .command_at("error", 7, "boom.gp", &[Value::Ref(what), Value::Int(99)])
        .unwrap();
    let report = run_blocks_to_error(&mut vm, &[boom]);
    assert_snapshot!(report, @r"
    task exploded 99
    Stopped at boom.gp:7: error 'task exploded' 99
    ");
}

#[test]
fn arithmetic_fault_report_points_at_the_reporter() {
    let mut vm = small_vm();
    let bad = vm.reporter("%", &[Value::Int(5), Value::Int(0)]).unwrap();
    let name = s(&mut vm, "x");
    let set = vm
        .command_at("=", 1, "math.gp", &[Value::Ref(name), Value::Ref(bad)])
        .unwrap();
    let report = run_blocks_to_error(&mut vm, &[set]);
    assert_snapshot!(report, @r"
    Modulo by zero
    Stopped at script:0: % 5 0
    ");
}
