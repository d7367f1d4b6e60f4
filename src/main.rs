use std::{env, process, thread, time::Duration};

use bramble::memory::value::{Ref, Value};
use bramble::runtime::fault::Fault;
use bramble::runtime::node::chain;
use bramble::runtime::vm::{RunResult, VM};

fn main() {
    env_logger::init();

    let mut args: Vec<String> = env::args().collect();
    let trace = args.iter().any(|arg| arg == "--trace");
    let stats_json = args.iter().any(|arg| arg == "--stats-json");
    let gc_report = args.iter().any(|arg| arg == "--gc-report");
    if trace {
        args.retain(|arg| arg != "--trace");
    }
    if stats_json {
        args.retain(|arg| arg != "--stats-json");
    }
    if gc_report {
        args.retain(|arg| arg != "--gc-report");
    }
    let heap_mb = match extract_usize_flag(&mut args, "--heap-mb", 100) {
        Some(value) => value,
        None => return,
    };
    let tick_limit = match extract_usize_flag(&mut args, "--tick-limit", 0) {
        Some(value) => value,
        None => return,
    };

    if args.len() < 2 {
        print_help();
        return;
    }

    match args[1].as_str() {
        "-h" | "--help" | "help" => print_help(),
        "counter" => {
            if let Some(n) = demo_count(&args, 100_000) {
                run_demo("counter", n, heap_mb, tick_limit, trace, stats_json, gc_report);
            }
        }
        "squares" => {
            if let Some(n) = demo_count(&args, 50) {
                run_demo("squares", n, heap_mb, tick_limit, trace, stats_json, gc_report);
            }
        }
        "churn" => {
            if let Some(n) = demo_count(&args, 2_000) {
                run_demo("churn", n, heap_mb, tick_limit, trace, stats_json, gc_report);
            }
        }
        other => {
            eprintln!("Unknown demo: {}", other);
            print_help();
        }
    }
}

fn print_help() {
    println!(
        "\
Bramble VM

Usage:
  bramble counter [count]    Count in a loop and print the total
  bramble squares [count]    Fill an array with squares, print the last
  bramble churn [count]      Allocate garbage, collect, print recovered bytes

Flags:
  --heap-mb <n>      Heap size in megabytes (default: 100)
  --tick-limit <n>   Preempt tasks every n ticks (default: run to completion)
  --trace            Print each dispatched operation
  --stats-json       Print VM statistics as JSON after the run
  --gc-report        Print GC telemetry after the run (requires --features gc-telemetry)
  -h, --help         Show this help message
"
    );
}

fn run_demo(
    name: &str,
    n: i32,
    heap_mb: usize,
    tick_limit: usize,
    trace: bool,
    stats_json: bool,
    gc_report: bool,
) {
    let mut vm = match VM::new(heap_mb) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    vm.set_trace(trace);
    vm.set_tick_limit(tick_limit as i32);

    let built = match name {
        "counter" => counter_program(&mut vm, n),
        "squares" => squares_program(&mut vm, n),
        _ => churn_program(&mut vm, n),
    };
    let prog = match built {
        Ok(prog) => prog,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    let result = match vm.spawn_task(prog) {
        Ok(task) => host_loop(&mut vm, task),
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };
    for line in vm.take_printed() {
        println!("{}", line);
    }
    if let RunResult::Errored(report) = result {
        eprintln!("{}", report);
        process::exit(1);
    }

    if stats_json {
        match serde_json::to_string_pretty(&vm.stats()) {
            Ok(rendered) => println!("{}", rendered),
            Err(err) => eprintln!("Error rendering stats: {}", err),
        }
    }
    #[cfg(feature = "gc-telemetry")]
    if gc_report {
        println!("\n{}", vm.gc_telemetry_report());
    }
    #[cfg(not(feature = "gc-telemetry"))]
    if gc_report {
        eprintln!("Warning: --gc-report requires building with `--features gc-telemetry`");
    }
}

/// Runs `task` to completion the way an embedding host would: run a
/// slice, flush output, sleep out timer waits, repeat.
fn host_loop(vm: &mut VM, task: Ref) -> RunResult {
    loop {
        match vm.run_task(task) {
            Ok(RunResult::Suspended) => {
                for line in vm.take_printed() {
                    println!("{}", line);
                }
                while !vm.task_ready(task, vm.msecs_since_start()) {
                    thread::sleep(Duration::from_millis(1));
                }
            }
            Ok(done) => return done,
            Err(fault) => return RunResult::Errored(fault.to_string()),
        }
    }
}

fn demo_count(args: &[String], default: i32) -> Option<i32> {
    match args.get(2) {
        None => Some(default),
        Some(raw) => match raw.parse::<i32>() {
            Ok(n) if n >= 0 => Some(n),
            _ => {
                eprintln!("Error: the count must be a non-negative integer.");
                None
            }
        },
    }
}

fn extract_usize_flag(args: &mut Vec<String>, flag: &str, default: usize) -> Option<usize> {
    let mut value = default;
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            if i + 1 >= args.len() {
                eprintln!("Usage: bramble <demo> {} <n>", flag);
                return None;
            }
            let raw = args.remove(i + 1);
            args.remove(i);
            match raw.parse::<usize>() {
                Ok(parsed) => value = parsed,
                Err(_) => {
                    eprintln!("Error: {} expects a non-negative integer.", flag);
                    return None;
                }
            }
            continue;
        }
        i += 1;
    }
    Some(value)
}

// ---- demo programs --------------------------------------------------------

/// i = 0; repeat n { i += 1 }; print "counted to" i
fn counter_program(vm: &mut VM, n: i32) -> Result<Ref, Fault> {
    let var = vm.intern("i")?;
    let init = vm.command("=", &[Value::Ref(var), Value::Int(0)])?;
    let bump = vm.command("+=", &[Value::Ref(var), Value::Int(1)])?;
    let count = vm.command("repeat", &[Value::Int(n), Value::Ref(bump)])?;
    let read = vm.reporter("v", &[Value::Ref(var)])?;
    let label = vm.intern("counted to")?;
    let say = vm.command("print", &[Value::Ref(label), Value::Ref(read)])?;
    chain(&mut vm.heap, &[init, count, say]).ok_or_else(|| Fault::bad_call("Empty program"))
}

/// xs = newArray n; for i n { atPut xs i (i * i) }; print "last square" (at xs n)
fn squares_program(vm: &mut VM, n: i32) -> Result<Ref, Fault> {
    let xs = vm.intern("xs")?;
    let i = vm.intern("i")?;
    let size = vm.reporter("newArray", &[Value::Int(n)])?;
    let init = vm.command("=", &[Value::Ref(xs), Value::Ref(size)])?;
    let left = vm.reporter("v", &[Value::Ref(i)])?;
    let right = vm.reporter("v", &[Value::Ref(i)])?;
    let square = vm.reporter("*", &[Value::Ref(left), Value::Ref(right)])?;
    let target = vm.reporter("v", &[Value::Ref(xs)])?;
    let slot = vm.reporter("v", &[Value::Ref(i)])?;
    let put = vm.command(
        "atPut",
        &[Value::Ref(target), Value::Ref(slot), Value::Ref(square)],
    )?;
    let fill = vm.command("for", &[Value::Ref(i), Value::Int(n), Value::Ref(put)])?;
    let xs_again = vm.reporter("v", &[Value::Ref(xs)])?;
    let last = vm.reporter("at", &[Value::Ref(xs_again), Value::Int(n)])?;
    let label = vm.intern("last square")?;
    let say = vm.command("print", &[Value::Ref(label), Value::Ref(last)])?;
    chain(&mut vm.heap, &[init, fill, say]).ok_or_else(|| Fault::bad_call("Empty program"))
}

/// repeat n { x = newArray 50 }; print "recovered" (gc) "bytes"
fn churn_program(vm: &mut VM, n: i32) -> Result<Ref, Fault> {
    let x = vm.intern("x")?;
    let alloc = vm.reporter("newArray", &[Value::Int(50)])?;
    let set = vm.command("=", &[Value::Ref(x), Value::Ref(alloc)])?;
    let spin = vm.command("repeat", &[Value::Int(n), Value::Ref(set)])?;
    let freed = vm.reporter("gc", &[])?;
    let label = vm.intern("recovered")?;
    let unit = vm.intern("bytes")?;
    let say = vm.command(
        "print",
        &[Value::Ref(label), Value::Ref(freed), Value::Ref(unit)],
    )?;
    chain(&mut vm.heap, &[spin, say]).ok_or_else(|| Fault::bad_call("Empty program"))
}
