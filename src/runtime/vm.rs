//! The virtual machine: registers, bootstrap, and the collection seam.
//!
//! A `VM` is a heap plus the handful of registers the dispatch loop runs
//! on: the growable value stack, the typed control stack, the two base
//! positions, and the current node. Everything else it owns is an object
//! in its heap, reached from the named roots below. Collections happen
//! only at the safe point in the dispatch loop, so the registers are the
//! complete root set and no raw reference can be live across a move.

use std::time::Instant;

use log::debug;
use serde::Serialize;

use crate::memory::gc::{GcStats, RootSet};
use crate::memory::header::{CLASS_CLASS, LIST_CLASS, MODULE_CLASS};
use crate::memory::heap::{Heap, MemStats};
use crate::memory::value::{Ref, Value};
use crate::runtime::classes::{
    BOOTSTRAP_CLASSES, CLASS_FIELD_COUNT, CLASS_FIELD_NAMES, CLASS_INDEX, CLASS_METHODS,
    CLASS_MODULE, CLASS_NAME, MODULE_CLASSES, MODULE_EXPANDERS, MODULE_EXPORTS,
    MODULE_FIELD_COUNT, MODULE_FUNCTIONS, MODULE_NAME, MODULE_VARIABLES, MODULE_VARIABLE_NAMES,
};
use crate::runtime::dictionary::{dict_at, dict_at_put, new_dict};
use crate::runtime::fault::Fault;
use crate::runtime::frame::Frame;
use crate::runtime::method_cache::{MethodCacheStats, METHOD_CACHE_CAPACITY};
use crate::runtime::task::WaitReason;

/// Ceiling on the value stack, in slots. Growth past this is reported as
/// runaway recursion rather than aborting on memory exhaustion.
pub const STACK_LIMIT: usize = 10_000_000;

/// Ceiling on the control stack, in frames.
pub const FRAME_LIMIT: usize = 1_000_000;

const SHARED_STRINGS_CAPACITY: usize = 10_000;
const CLASS_TABLE_CAPACITY: usize = 32;

/// How one installment of a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    /// The task ran to its final Halt frame; the value is its result.
    Completed(Value),
    /// The task parked itself; its wait reason says when to step it again.
    Suspended,
    /// The task failed and is parked for inspection; the string is the
    /// rendered stop report.
    Errored(String),
}

/// Counter snapshot for the `--stats-json` report.
#[derive(Debug, Clone, Serialize)]
pub struct VmStats {
    pub memory: MemStats,
    pub method_cache: MethodCacheStats,
}

pub struct VM {
    pub heap: Heap,

    // Distinguished objects, all GC roots.
    pub(crate) empty_array: Ref,
    pub(crate) shared_strings: Ref,
    pub(crate) classes: Ref,
    pub(crate) method_cache: Ref,
    pub top_module: Ref,
    pub session_module: Ref,
    pub current_module: Ref,
    pub console_module: Ref,

    // Machine registers.
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) base: usize,
    pub(crate) mframe: Option<usize>,
    pub(crate) current: Option<Ref>,
    pub(crate) last_node: Option<Ref>,
    pub(crate) result: Value,
    pub(crate) current_task: Value,
    pub(crate) debugee_task: Value,

    // Cooperative scheduling state.
    pub(crate) tick_limit: i32,
    pub(crate) ticks: i32,
    pub(crate) default_tick_limit: i32,
    pub(crate) stop: bool,
    pub(crate) step_quota: Option<u32>,
    pub(crate) suspend_reason: Option<WaitReason>,
    pub(crate) profile_tick: i32,

    pub(crate) reading_library: bool,
    pub(crate) cache_hits: u64,
    pub(crate) cache_misses: u64,
    pub(crate) cache_full_clears: u64,
    pub(crate) cache_entry_clears: u64,

    pub(crate) printed: Vec<String>,
    pub(crate) started: Instant,
    trace: bool,
}

impl VM {
    /// A fresh machine with a heap of `heap_megabytes`. Bootstraps the
    /// shared string table, the class table, the method cache, and the
    /// top-level module before returning.
    pub fn new(heap_megabytes: usize) -> Result<VM, Fault> {
        let mut heap = Heap::new(heap_megabytes);
        let empty_array = heap.new_array(0, Value::Nil)?;
        let mut vm = VM {
            heap,
            empty_array,
            shared_strings: empty_array,
            classes: empty_array,
            method_cache: empty_array,
            top_module: empty_array,
            session_module: empty_array,
            current_module: empty_array,
            console_module: empty_array,
            stack: Vec::new(),
            frames: Vec::new(),
            base: 0,
            mframe: None,
            current: None,
            last_node: None,
            result: Value::Nil,
            current_task: Value::Nil,
            debugee_task: Value::Nil,
            tick_limit: 0,
            ticks: 0,
            default_tick_limit: 0,
            stop: false,
            step_quota: None,
            suspend_reason: None,
            profile_tick: 0,
            reading_library: false,
            cache_hits: 0,
            cache_misses: 0,
            cache_full_clears: 0,
            cache_entry_clears: 0,
            printed: Vec::new(),
            started: Instant::now(),
            trace: false,
        };
        vm.bootstrap()?;
        Ok(vm)
    }

    /// Builds the objects every session starts from, in dependency order:
    /// string table, module, the built-in classes, method cache. All four
    /// module registers start out as the one top-level module.
    fn bootstrap(&mut self) -> Result<(), Fault> {
        self.shared_strings = new_dict(&mut self.heap, SHARED_STRINGS_CAPACITY)?;
        self.classes = self.heap.new_weak_array(CLASS_TABLE_CAPACITY)?;

        let module = self.new_module("TopLevelModule")?;
        self.top_module = module;
        self.session_module = module;
        self.current_module = module;
        self.console_module = module;

        let list = self.heap.new_array(BOOTSTRAP_CLASSES.len(), Value::Nil)?;
        for (i, (name, fields)) in BOOTSTRAP_CLASSES.iter().enumerate() {
            let class = self.bootstrap_class(name, fields, i as u32 + 1)?;
            self.heap.set_field(list, i, Value::Ref(class));
        }
        // The strong list in the module keeps the built-ins alive; the
        // weak table slots alone would not.
        self.heap.set_field(module, MODULE_CLASSES, Value::Ref(list));

        self.method_cache = new_dict(&mut self.heap, METHOD_CACHE_CAPACITY)?;
        debug!(
            "bootstrap: {} classes, heap {}k",
            BOOTSTRAP_CLASSES.len(),
            self.heap.mem_stats().capacity_bytes / 1000
        );
        Ok(())
    }

    fn new_module(&mut self, name: &str) -> Result<Ref, Fault> {
        let name_s = self.intern(name)?;
        let empty = self.empty_array;
        let module = self.heap.allocate(MODULE_CLASS, MODULE_FIELD_COUNT, Value::Nil)?;
        self.heap.set_field(module, MODULE_NAME, Value::Ref(name_s));
        self.heap.set_field(module, MODULE_CLASSES, Value::Ref(empty));
        self.heap.set_field(module, MODULE_FUNCTIONS, Value::Ref(empty));
        self.heap.set_field(module, MODULE_EXPANDERS, Value::Ref(empty));
        self.heap.set_field(module, MODULE_VARIABLE_NAMES, Value::Ref(empty));
        self.heap.set_field(module, MODULE_VARIABLES, Value::Ref(empty));
        self.heap.set_field(module, MODULE_EXPORTS, Value::Ref(empty));
        Ok(module)
    }

    fn bootstrap_class(&mut self, name: &str, fields: &[&str], index: u32) -> Result<Ref, Fault> {
        let name_s = self.intern(name)?;
        let field_names = if fields.is_empty() {
            self.empty_array
        } else {
            let a = self.heap.new_array(fields.len(), Value::Nil)?;
            for (i, f) in fields.iter().enumerate() {
                let s = self.intern(f)?;
                self.heap.set_field(a, i, Value::Ref(s));
            }
            a
        };
        let class = self.heap.allocate(CLASS_CLASS, CLASS_FIELD_COUNT, Value::Nil)?;
        self.heap.set_field(class, CLASS_NAME, Value::Ref(name_s));
        self.heap.set_field(class, CLASS_INDEX, Value::Int(index as i32));
        self.heap.set_field(class, CLASS_FIELD_NAMES, Value::Ref(field_names));
        self.heap.set_field(class, CLASS_METHODS, Value::Ref(self.empty_array));
        self.heap.set_field(class, CLASS_MODULE, Value::Ref(self.top_module));
        self.heap.set_field(self.classes, index as usize - 1, Value::Ref(class));
        Ok(class)
    }

    // ---- interning -----------------------------------------------------

    /// The canonical copy of `s` from the shared string table, added on
    /// first sight. The transient lookup copy becomes garbage on a hit.
    pub fn intern(&mut self, s: &str) -> Result<Ref, Fault> {
        let candidate = self.heap.new_string(s)?;
        let dict = self.shared_strings;
        if let Some(existing) = dict_at(&mut self.heap, dict, Value::Ref(candidate)).as_ref() {
            return Ok(existing);
        }
        dict_at_put(&mut self.heap, dict, Value::Ref(candidate), Value::Ref(candidate))?;
        Ok(candidate)
    }

    /// A List over a fresh contents array holding `items`.
    pub fn new_list(&mut self, items: &[Value]) -> Result<Ref, Fault> {
        let contents = self.heap.new_array(items.len(), Value::Nil)?;
        for (i, v) in items.iter().enumerate() {
            self.heap.set_field(contents, i, *v);
        }
        let list = self.heap.allocate(LIST_CLASS, 3, Value::Nil)?;
        self.heap.set_field(list, 0, Value::Int(1));
        self.heap.set_field(list, 1, Value::Int(items.len() as i32));
        self.heap.set_field(list, 2, Value::Ref(contents));
        Ok(list)
    }

    // ---- stacks --------------------------------------------------------

    pub(crate) fn push(&mut self, v: Value) -> Result<(), Fault> {
        if self.stack.len() >= STACK_LIMIT {
            return Err(Fault::bad_call("Could not grow stack; infinite recursion?"));
        }
        self.stack.push(v);
        Ok(())
    }

    pub(crate) fn push_frame(&mut self, f: Frame) -> Result<(), Fault> {
        if self.frames.len() >= FRAME_LIMIT {
            return Err(Fault::bad_call("Could not grow stack; infinite recursion?"));
        }
        self.frames.push(f);
        Ok(())
    }

    /// Clears every register back to the idle state. Saved task state, if
    /// any was wanted, has been written out before this.
    pub(crate) fn reset_machine(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.base = 0;
        self.mframe = None;
        self.current = None;
        self.result = Value::Nil;
        self.current_task = Value::Nil;
        self.ticks = 0;
        self.stop = false;
        self.step_quota = None;
        self.suspend_reason = None;
    }

    // ---- collection ----------------------------------------------------

    /// The dispatch loop's safe point.
    pub(crate) fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_now();
        }
    }

    /// Runs a collection with every register registered as a root, then
    /// reads the forwarded values back in the same order.
    pub fn collect_now(&mut self) -> GcStats {
        let mut roots = RootSet::new();
        roots.class_table = Some(self.classes);
        roots.push(Value::Ref(self.empty_array));
        roots.push(Value::Ref(self.shared_strings));
        roots.push(Value::Ref(self.method_cache));
        roots.push(Value::Ref(self.top_module));
        roots.push(Value::Ref(self.session_module));
        roots.push(Value::Ref(self.current_module));
        roots.push(Value::Ref(self.console_module));
        roots.push(self.current_task);
        roots.push(self.debugee_task);
        roots.push(self.result);
        roots.push(opt_node(self.current));
        roots.push(opt_node(self.last_node));
        for v in &self.stack {
            roots.push(*v);
        }
        for f in &self.frames {
            f.push_roots(&mut roots);
        }

        let stats = self.heap.collect(&mut roots);

        if let Some(ct) = roots.class_table {
            self.classes = ct;
        }
        let mut cursor = 0;
        let mut take = |cursor: &mut usize| {
            let v = roots.get(*cursor);
            *cursor += 1;
            v
        };
        self.empty_array = forced_ref(take(&mut cursor));
        self.shared_strings = forced_ref(take(&mut cursor));
        self.method_cache = forced_ref(take(&mut cursor));
        self.top_module = forced_ref(take(&mut cursor));
        self.session_module = forced_ref(take(&mut cursor));
        self.current_module = forced_ref(take(&mut cursor));
        self.console_module = forced_ref(take(&mut cursor));
        self.current_task = take(&mut cursor);
        self.debugee_task = take(&mut cursor);
        self.result = take(&mut cursor);
        self.current = take(&mut cursor).as_ref();
        self.last_node = take(&mut cursor).as_ref();
        for i in 0..self.stack.len() {
            self.stack[i] = take(&mut cursor);
        }
        let mut frames = std::mem::take(&mut self.frames);
        for f in &mut frames {
            f.restore_roots(&roots, &mut cursor);
        }
        self.frames = frames;
        stats
    }

    // ---- host services -------------------------------------------------

    /// Milliseconds since this machine was created; the clock behind
    /// `msecsSinceStart` and timer waits.
    pub fn msecs_since_start(&self) -> i64 {
        self.started.elapsed().as_millis() as i64
    }

    /// Lines produced by `print` since the last drain.
    pub fn take_printed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.printed)
    }

    /// Tick budget given to newly spawned and resumed tasks; zero means
    /// run without preemption.
    pub fn set_tick_limit(&mut self, ticks: i32) {
        self.default_tick_limit = ticks;
    }

    /// Record a profile sample every `ticks` ticks; zero disables.
    pub fn set_profile_interval(&mut self, ticks: i32) {
        self.profile_tick = ticks;
    }

    pub fn set_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub(crate) fn tracing(&self) -> bool {
        self.trace
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            memory: self.heap.mem_stats(),
            method_cache: self.method_cache_stats(),
        }
    }

    #[cfg(feature = "gc-telemetry")]
    pub fn gc_telemetry_report(&self) -> String {
        let mut out = self
            .heap
            .telemetry
            .report_allocation_stats(|i| self.class_from_index(i).map(|_| self.class_name(i)));
        out.push('\n');
        out.push_str(&self.heap.telemetry.report_cycles());
        out
    }
}

fn opt_node(n: Option<Ref>) -> Value {
    match n {
        Some(r) => Value::Ref(r),
        None => Value::Nil,
    }
}

// Registered roots of these slots are always references; the collector
// only ever rewrites them to the moved copy.
fn forced_ref(v: Value) -> Ref {
    match v {
        Value::Ref(r) => r,
        other => unreachable!("non-reference register root {other}"),
    }
}
