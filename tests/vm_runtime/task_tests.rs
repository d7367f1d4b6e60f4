use bramble::memory::value::Value;
use bramble::runtime::node::chain;
use bramble::runtime::task::{WaitReason, TASK_PROFILE_INDEX, TASK_TO_RESUME};
use bramble::runtime::vm::RunResult;

#[path = "../common/mod.rs"]
mod common;

use common::{assign, module_var, read_var, run_blocks, s, small_vm};

#[test]
fn tasks_run_to_completion_and_remember_their_result() {
    let mut vm = small_vm();
    let give = vm.command("return", &[Value::Int(7)]).unwrap();
    let task = vm.spawn_task(give).unwrap();

    assert_eq!(vm.run_task(task).unwrap(), RunResult::Completed(Value::Int(7)));
    assert_eq!(vm.task_result(task), Value::Int(7));
    assert_eq!(vm.task_wait_reason(task), Some(WaitReason::Terminated));

    // Stepping a finished task is a no-op that repeats the answer.
    assert_eq!(vm.run_task(task).unwrap(), RunResult::Completed(Value::Int(7)));
}

#[test]
fn yield_parks_between_display_frames() {
    let mut vm = small_vm();
    let a = s(&mut vm, "a");
    let before = vm.command("print", &[Value::Ref(a)]).unwrap();
    let pause = vm.command("yield", &[]).unwrap();
    let b = s(&mut vm, "b");
    let after = vm.command("print", &[Value::Ref(b)]).unwrap();
    let prog = chain(&mut vm.heap, &[before, pause, after]).unwrap();

    let task = vm.spawn_task(prog).unwrap();
    assert_eq!(vm.run_task(task).unwrap(), RunResult::Suspended);
    assert_eq!(vm.take_printed(), vec!["a"]);
    assert_eq!(vm.task_wait_reason(task), Some(WaitReason::Display));
    assert!(
        vm.task_ready(task, vm.msecs_since_start()),
        "a display park resumes on the next step"
    );

    assert!(matches!(vm.run_task(task).unwrap(), RunResult::Completed(_)));
    assert_eq!(vm.take_printed(), vec!["b"]);
}

#[test]
fn timer_waits_hold_the_task_until_the_clock_passes() {
    let mut vm = small_vm();
    let wait = vm.command("waitMillis", &[Value::Int(30)]).unwrap();
    let done = s(&mut vm, "done");
    let say = vm.command("print", &[Value::Ref(done)]).unwrap();
    let prog = chain(&mut vm.heap, &[wait, say]).unwrap();

    let started = vm.msecs_since_start();
    let task = vm.spawn_task(prog).unwrap();
    assert_eq!(vm.run_task(task).unwrap(), RunResult::Suspended);
    assert_eq!(vm.task_wait_reason(task), Some(WaitReason::Timer));
    assert!(
        !vm.task_ready(task, vm.msecs_since_start()),
        "the wake time cannot have passed already"
    );

    assert!(matches!(vm.drive_task(task).unwrap(), RunResult::Completed(_)));
    assert_eq!(vm.take_printed(), vec!["done"]);
    assert!(
        vm.msecs_since_start() - started >= 25,
        "the timer park returned early"
    );
}

#[test]
fn errors_park_the_task_for_inspection() {
    let mut vm = small_vm();
    let word = s(&mut vm, "boom");
    let explode = vm.command_at("error", 7, "boom.gp", &[Value::Ref(word)]).unwrap();
    let task = vm.spawn_task(explode).unwrap();

    let RunResult::Errored(report) = vm.run_task(task).unwrap() else {
        panic!("error did not surface")
    };
    assert!(report.contains("boom"), "got:\n{report}");
    assert!(report.contains("boom.gp:7"), "got:\n{report}");

    assert_eq!(vm.task_wait_reason(task), Some(WaitReason::Error));
    let reason = vm.task_error_reason(task).expect("no recorded reason");
    assert!(reason.contains("boom"), "got: {reason}");
    assert!(
        !vm.task_ready(task, vm.msecs_since_start()),
        "errored tasks must wait for the debugger"
    );

    // The host finds the faulty task through the debugee register.
    let grab = vm.reporter("debugeeTask", &[]).unwrap();
    let keep = assign(&mut vm, "suspect", Value::Ref(grab));
    run_blocks(&mut vm, &[keep]);
    assert_eq!(module_var(&vm, "suspect"), Value::Ref(task));

    // Stepping the parked task replays the faulting call.
    assert!(matches!(vm.run_task(task).unwrap(), RunResult::Errored(_)));
}

#[test]
fn resume_switches_tasks_without_chaining_back() {
    let mut vm = small_vm();
    let beta_work = assign(&mut vm, "y", Value::Int(1));
    let beta = vm.spawn_task(beta_work).unwrap();
    vm.add_module_variable(vm.current_module, "tb", Value::Ref(beta))
        .unwrap();

    let first = assign(&mut vm, "x", Value::Int(1));
    let target = read_var(&mut vm, "tb");
    let switch = vm.command("resume", &[target]).unwrap();
    let last = assign(&mut vm, "x", Value::Int(3));
    let prog = chain(&mut vm.heap, &[first, switch, last]).unwrap();
    let alpha = vm.spawn_task(prog).unwrap();

    // Driving alpha ends in beta's completion; alpha stays parked and
    // runnable, waiting for the host scheduler to come back to it.
    assert!(matches!(vm.drive_task(alpha).unwrap(), RunResult::Completed(_)));
    assert_eq!(module_var(&vm, "y"), Value::Int(1));
    assert_eq!(module_var(&vm, "x"), Value::Int(1));
    assert_eq!(vm.task_wait_reason(alpha), None);
    assert!(vm.task_ready(alpha, vm.msecs_since_start()));

    assert!(matches!(vm.run_task(alpha).unwrap(), RunResult::Completed(_)));
    assert_eq!(module_var(&vm, "x"), Value::Int(3));
}

#[test]
fn completed_tasks_follow_their_resume_link() {
    let mut vm = small_vm();
    let give = vm.command("return", &[Value::Int(7)]).unwrap();
    let alpha = vm.spawn_task(give).unwrap();
    let work = assign(&mut vm, "z", Value::Int(1));
    let beta = vm.spawn_task(work).unwrap();
    vm.heap.set_field(beta, TASK_TO_RESUME, Value::Ref(alpha));

    assert_eq!(
        vm.drive_task(beta).unwrap(),
        RunResult::Completed(Value::Int(7)),
        "beta's completion must hand off to alpha"
    );
    assert_eq!(module_var(&vm, "z"), Value::Int(1));
    assert_eq!(vm.task_result(alpha), Value::Int(7));
}

#[test]
fn single_step_resume_runs_exactly_one_operation() {
    let mut vm = small_vm();
    let one = assign(&mut vm, "y", Value::Int(1));
    let two = assign(&mut vm, "z", Value::Int(2));
    let beta_prog = chain(&mut vm.heap, &[one, two]).unwrap();
    let beta = vm.spawn_task(beta_prog).unwrap();
    vm.add_module_variable(vm.current_module, "tb", Value::Ref(beta))
        .unwrap();

    let target = read_var(&mut vm, "tb");
    let switch = vm.command("resume", &[target, Value::True]).unwrap();
    let after = assign(&mut vm, "x", Value::Int(9));
    let alpha_prog = chain(&mut vm.heap, &[switch, after]).unwrap();
    let alpha = vm.spawn_task(alpha_prog).unwrap();

    assert_eq!(vm.run_task(alpha).unwrap(), RunResult::Suspended);
    assert_eq!(module_var(&vm, "y"), Value::Int(1), "first op did not run");
    assert_eq!(module_var(&vm, "z"), Value::Nil, "stepper ran past one op");

    assert!(matches!(vm.run_task(beta).unwrap(), RunResult::Completed(_)));
    assert_eq!(module_var(&vm, "z"), Value::Int(2));

    assert!(matches!(vm.run_task(alpha).unwrap(), RunResult::Completed(_)));
    assert_eq!(module_var(&vm, "x"), Value::Int(9));
}

#[test]
fn profiling_samples_while_the_task_spins() {
    let mut vm = small_vm();
    let init = assign(&mut vm, "s", Value::Int(0));
    let name = s(&mut vm, "s");
    let body = vm.command("+=", &[Value::Ref(name), Value::Int(1)]).unwrap();
    let spin = vm
        .command("repeat", &[Value::Int(2000), Value::Ref(body)])
        .unwrap();
    let prog = chain(&mut vm.heap, &[init, spin]).unwrap();

    let task = vm.spawn_task(prog).unwrap();
    vm.enable_profiling(task, 50).unwrap();
    vm.set_profile_interval(10);

    assert!(matches!(vm.run_task(task).unwrap(), RunResult::Completed(_)));
    assert_eq!(module_var(&vm, "s"), Value::Int(2000));

    let Value::Int(samples) = vm.heap.field(task, TASK_PROFILE_INDEX) else {
        panic!("no profile cursor")
    };
    assert!(samples > 0, "no samples were taken in 2000 iterations");
    vm.log_profile_data(task);
}
