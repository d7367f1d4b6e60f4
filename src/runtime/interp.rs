//! The dispatch loop.
//!
//! Execution walks Command chains one node at a time. For each node the
//! loop evaluates arguments left to right onto the value stack: literals
//! are pushed as written, a Reporter argument pushes an `Eval` frame and
//! becomes the current node itself. When every argument is in place the
//! node executes through its cached call target: an inline operation, a
//! registry primitive, or a user function activation. Control structures
//! push typed frames and rerun their bodies from `block_end`, which is
//! also where loop back edges pay a tick.
//!
//! Collections happen only at the safe point at the top of the loop, so
//! no raw `Ref` held inside a handler ever spans a heap move. The one
//! exception, the inline `gc` operation, rereads its node from the
//! current register after collecting.

use std::time::Duration;

use log::debug;

use crate::memory::header::{ARRAY_CLASS, FUNCTION_CLASS, LIST_CLASS, STRING_CLASS, TASK_CLASS};
use crate::memory::value::{Ref, Value};
use crate::runtime::classes::{
    function_arg_names, function_body, function_class_index, function_local_names,
    function_module, name_position, MODULE_VARIABLE_NAMES,
};
use crate::runtime::fault::Fault;
use crate::runtime::frame::{Binding, Frame};
use crate::runtime::node::{
    call_target, cached_class_id, node_arg, node_arg_count, node_cache, node_is_reporter,
    node_next, node_op, op_matches, set_cached_class_id, set_call_target, set_node_cache,
    CallTarget, InlineOp,
};
use crate::runtime::prims::{num_arg, prim_by_index, prim_index, wide_int, Num};
use crate::runtime::task::{WaitReason, TASK_STACK};
use crate::runtime::vm::{RunResult, VM};

/// Why the inner loop returned.
enum LoopExit {
    /// The bottom Halt frame was reached; the value is the task result.
    Done(Value),
    /// The machine was parked into the carried task.
    Parked(Option<Ref>),
}

impl VM {
    /// Spawns a task for `prog` and drives it to completion or error,
    /// sleeping out timer waits. The host step loop in `main` does the
    /// same thing with rendering in between.
    pub fn run_program(&mut self, prog: Ref) -> Result<RunResult, Fault> {
        let task = self.spawn_task(prog)?;
        self.drive_task(task)
    }

    /// Installs `task` and runs until it parks, completes, or fails.
    /// Resuming an already finished task just reports its result.
    pub fn run_task(&mut self, task: Ref) -> Result<RunResult, Fault> {
        if self.heap.field(task, TASK_STACK).is_nil() {
            return Ok(RunResult::Completed(self.task_result(task)));
        }
        self.install_task(task)?;
        Ok(self.run_installed()?.0)
    }

    /// Steps `task` until it completes or errors, waiting out timer parks
    /// and immediately reinstalling display parks. Follows task switches,
    /// so the returned outcome may belong to a task `task` resumed.
    pub fn drive_task(&mut self, task: Ref) -> Result<RunResult, Fault> {
        let mut active = task;
        loop {
            if self.heap.field(active, TASK_STACK).is_nil() {
                return Ok(RunResult::Completed(self.task_result(active)));
            }
            self.install_task(active)?;
            let (result, parked) = self.run_installed()?;
            let RunResult::Suspended = result else {
                return Ok(result);
            };
            let Some(parked) = parked else {
                return Ok(RunResult::Suspended);
            };
            active = parked;
            while !self.task_ready(active, self.msecs_since_start()) {
                match self.task_wait_reason(active) {
                    Some(WaitReason::Timer) => std::thread::sleep(Duration::from_millis(1)),
                    _ => return Ok(RunResult::Suspended),
                }
            }
        }
    }

    /// Runs the installed machine, following `taskToResume` chains when a
    /// task completes. Returns the outcome and, for suspensions, the task
    /// the machine was parked into.
    fn run_installed(&mut self) -> Result<(RunResult, Option<Ref>), Fault> {
        loop {
            let exit = match self.run_loop() {
                Ok(exit) => exit,
                Err(fault) => {
                    let report = match self.current_task {
                        Value::Ref(task) => self.fail_task(task, &fault)?,
                        _ => self.format_stop_report(&fault),
                    };
                    debug!("task stopped: {}", report);
                    self.reset_machine();
                    return Ok((RunResult::Errored(report), None));
                }
            };
            match exit {
                LoopExit::Done(v) => {
                    let follow = match self.current_task {
                        Value::Ref(task) => self.complete_task(task, v)?,
                        _ => None,
                    };
                    self.reset_machine();
                    match follow {
                        Some(next) if !self.heap.field(next, TASK_STACK).is_nil() => {
                            self.install_task(next)?;
                        }
                        _ => return Ok((RunResult::Completed(v), None)),
                    }
                }
                LoopExit::Parked(task) => return Ok((RunResult::Suspended, task)),
            }
        }
    }

    fn run_loop(&mut self) -> Result<LoopExit, Fault> {
        loop {
            if let Some(reason) = self.suspend_reason.take() {
                return Ok(LoopExit::Parked(self.park(Some(reason))?));
            }
            if self.stop {
                self.stop = false;
                return Ok(LoopExit::Parked(self.park(None)?));
            }
            if let Some(quota) = self.step_quota {
                if quota == 0 {
                    return Ok(LoopExit::Parked(self.park(None)?));
                }
                self.step_quota = Some(quota - 1);
            }
            self.maybe_collect();
            let done = match self.current {
                Some(node) => self.step(node)?,
                None => self.block_end()?,
            };
            if let Some(v) = done {
                return Ok(LoopExit::Done(v));
            }
        }
    }

    /// Writes the running state into the current task and clears the
    /// machine. Returns the parked task for the host.
    fn park(&mut self, reason: Option<WaitReason>) -> Result<Option<Ref>, Fault> {
        let Value::Ref(task) = self.current_task else {
            self.reset_machine();
            return Ok(None);
        };
        self.save_machine_into(task)?;
        self.set_task_wait_reason(task, reason)?;
        self.reset_machine();
        Ok(Some(task))
    }

    // ---- argument evaluation -------------------------------------------

    /// Evaluates the next outstanding argument of `node`, or executes it
    /// once all arguments are in place. `and`, `or`, and `if` execute
    /// early as soon as a delivered argument settles their outcome.
    fn step(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        if self.tracing() {
            self.trace_step(node);
        }
        let nargs = node_arg_count(&self.heap, node);
        loop {
            let evaluated = self.stack.len() - self.base;
            if evaluated >= 1 {
                let last = self.stack[self.stack.len() - 1];
                if (last == Value::False && op_matches(&self.heap, node, "and"))
                    || (last == Value::True && op_matches(&self.heap, node, "or"))
                {
                    break;
                }
                if last == Value::True
                    && evaluated % 2 == 1
                    && op_matches(&self.heap, node, "if")
                {
                    break;
                }
            }
            if evaluated >= nargs {
                break;
            }
            let arg = node_arg(&self.heap, node, evaluated);
            match arg {
                Value::Ref(r) if node_is_reporter(&self.heap, r) => {
                    if call_target(&self.heap, r) == CallTarget::Inline(InlineOp::GetVar) {
                        if let Some(v) = self.quick_var(r) {
                            self.push(v)?;
                            continue;
                        }
                    }
                    self.push_frame(Frame::Eval { node, base: self.base })?;
                    self.current = Some(r);
                    self.base = self.stack.len();
                    return Ok(None);
                }
                v => self.push(v)?,
            }
        }
        self.execute(node)
    }

    /// The frameless path for a warm variable fetch in argument position.
    /// Anything cold or doubtful returns None and takes the full route.
    fn quick_var(&self, r: Ref) -> Option<Value> {
        let Value::Int(word) = node_cache(&self.heap, r) else {
            return None;
        };
        match Binding::decode(word) {
            Binding::Arg(i) => self.arg_slot(i as usize),
            Binding::Local(i) => self.local_slot(i as usize),
            Binding::Field(i) => self.field_slot(i as usize),
            Binding::ModuleVar(i) => {
                let name = node_arg(&self.heap, r, 0).as_ref()?;
                if self.module_var_name_matches(i as usize, name) {
                    Some(self.module_variable(self.current_module, i as usize))
                } else {
                    None
                }
            }
            Binding::Unbound => None,
        }
    }

    // ---- execution ------------------------------------------------------

    fn execute(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        self.last_node = Some(node);
        let argc = self.stack.len() - self.base;
        let target = call_target(&self.heap, node);
        let needs_resolve = match target {
            CallTarget::Unresolved => true,
            CallTarget::Inline(_) => false,
            _ => {
                argc > 0
                    && cached_class_id(&self.heap, node)
                        != Some(self.heap.class_index_of(self.stack[self.base]))
            }
        };
        let target = if needs_resolve {
            self.resolve(node)?
        } else {
            target
        };
        match target {
            CallTarget::Method => {
                let Some(method) = node_cache(&self.heap, node).as_ref() else {
                    // The traced cache slot was reset under us; start over.
                    let target = self.resolve(node)?;
                    return self.execute_resolved(node, target);
                };
                self.invoke(node, method)?;
                Ok(None)
            }
            other => self.execute_resolved(node, other),
        }
    }

    fn execute_resolved(&mut self, node: Ref, target: CallTarget) -> Result<Option<Value>, Fault> {
        match target {
            CallTarget::Method => {
                let Some(method) = node_cache(&self.heap, node).as_ref() else {
                    return Err(Fault::bad_call("Call site lost its resolved method"));
                };
                self.invoke(node, method)?;
                Ok(None)
            }
            CallTarget::Prim(i) => self.run_prim(node, i),
            CallTarget::Inline(op) => self.inline_execute(node, op),
            CallTarget::Unresolved => Err(Fault::bad_call("Call site failed to resolve")),
        }
    }

    /// Five-step resolution, then the inline table, then the primitive
    /// registry. Writes its findings into the call site.
    fn resolve(&mut self, node: Ref) -> Result<CallTarget, Fault> {
        let Some(op_ref) = node_op(&self.heap, node) else {
            return Err(Fault::bad_call("Block has no operation name"));
        };
        let op = self.heap.string_value(op_ref);
        let argc = self.stack.len() - self.base;
        let receiver_class = if argc > 0 {
            Some(self.heap.class_index_of(self.stack[self.base]))
        } else {
            None
        };
        if let Some(method) = self.find_method(&op, receiver_class, self.current_module)? {
            set_call_target(&mut self.heap, node, CallTarget::Method);
            set_node_cache(&mut self.heap, node, Value::Ref(method));
            set_cached_class_id(&mut self.heap, node, receiver_class.unwrap_or(0));
            return Ok(CallTarget::Method);
        }
        if let Some(inline) = InlineOp::from_name(&op) {
            let target = CallTarget::Inline(inline);
            set_call_target(&mut self.heap, node, target);
            return Ok(target);
        }
        if let Some(i) = prim_index(&op) {
            let target = CallTarget::Prim(i);
            set_call_target(&mut self.heap, node, target);
            set_cached_class_id(&mut self.heap, node, receiver_class.unwrap_or(0));
            return Ok(target);
        }
        Err(Fault::undefined(&op))
    }

    fn run_prim(&mut self, node: Ref, index: u32) -> Result<Option<Value>, Fault> {
        let prim = prim_by_index(index)
            .ok_or_else(|| Fault::bad_call("Call site cached an unknown primitive"))?;
        let args: Vec<Value> = self.stack[self.base..].to_vec();
        self.stack.truncate(self.base);
        let v = (prim.func)(self, &args)?;
        if node_is_reporter(&self.heap, node) {
            self.deliver_result(v)
        } else {
            self.current = node_next(&self.heap, node);
            Ok(None)
        }
    }

    /// Routes a computed value to whoever asked for it: the node whose
    /// argument was outstanding, or the bottom Halt frame as the task
    /// result. A value delivered with neither is dropped.
    fn deliver_result(&mut self, v: Value) -> Result<Option<Value>, Fault> {
        match self.frames.last().copied() {
            Some(Frame::Eval { node, base }) => {
                self.frames.pop();
                self.current = Some(node);
                self.base = base;
                self.push(v)?;
                Ok(None)
            }
            Some(Frame::Halt) => Ok(Some(v)),
            _ => {
                self.current = None;
                Ok(None)
            }
        }
    }

    /// Activates a user function: pads missing arguments with nil, makes
    /// the local slots, pushes the Call frame, and enters the body in the
    /// function's defining module.
    fn invoke(&mut self, node: Ref, method: Ref) -> Result<(), Fault> {
        let nargs = self.stack.len() - self.base;
        let params = match function_arg_names(&self.heap, method) {
            Some(a) => self.heap.word_count(a),
            None => 0,
        };
        for _ in nargs..params {
            self.push(Value::Nil)?;
        }
        let locals = match function_local_names(&self.heap, method) {
            Some(l) => self.heap.word_count(l),
            None => 0,
        };
        let locals_base = self.stack.len();
        for _ in 0..locals {
            self.push(Value::Nil)?;
        }
        let saved_mframe = self.mframe;
        self.push_frame(Frame::Call {
            node,
            base: self.base,
            nargs,
            locals_base,
            method,
            saved_mframe,
        })?;
        self.mframe = Some(self.frames.len() - 1);
        if let Some(m) = function_module(&self.heap, method) {
            self.current_module = m;
        }
        self.current = function_body(&self.heap, method);
        self.base = self.stack.len();
        Ok(())
    }

    // ---- block ends -----------------------------------------------------

    /// A command chain ran out; the top control frame decides what runs
    /// next. Loop frames take their back edge here, Call frames return to
    /// their caller, the Halt frame completes the task.
    fn block_end(&mut self) -> Result<Option<Value>, Fault> {
        let Some(top) = self.frames.last().copied() else {
            return Ok(Some(std::mem::replace(&mut self.result, Value::Nil)));
        };
        match top {
            Frame::Halt => Ok(Some(std::mem::replace(&mut self.result, Value::Nil))),
            Frame::Eval { .. } => self.deliver_result(Value::Nil),
            Frame::If { node } => {
                self.frames.pop();
                self.current = node_next(&self.heap, node);
                Ok(None)
            }
            Frame::Repeat { node, remaining } => {
                if remaining > 1 {
                    if let Some(Frame::Repeat { remaining, .. }) = self.frames.last_mut() {
                        *remaining -= 1;
                    }
                    self.current = node_arg(&self.heap, node, 1).as_ref();
                    self.tick();
                } else {
                    self.frames.pop();
                    self.current = node_next(&self.heap, node);
                }
                Ok(None)
            }
            Frame::While { node } => {
                self.frames.pop();
                self.current = Some(node);
                self.tick();
                Ok(None)
            }
            Frame::For { node, binding, index, limit } => {
                let next = index + 1;
                if next <= limit {
                    if let Some(Frame::For { index, .. }) = self.frames.last_mut() {
                        *index = next;
                    }
                    self.write_binding(binding, Value::Int(next))?;
                    self.current = node_arg(&self.heap, node, 2).as_ref();
                    self.tick();
                } else {
                    self.frames.pop();
                    self.current = node_next(&self.heap, node);
                }
                Ok(None)
            }
            Frame::ForEach { node, binding, items, index, limit } => {
                let next = index + 1;
                if next < limit && next < self.heap.word_count(items) {
                    if let Some(Frame::ForEach { index, .. }) = self.frames.last_mut() {
                        *index = next;
                    }
                    let v = self.heap.field(items, next);
                    self.write_binding(binding, v)?;
                    self.current = node_arg(&self.heap, node, 2).as_ref();
                    self.tick();
                } else {
                    self.frames.pop();
                    self.current = node_next(&self.heap, node);
                }
                Ok(None)
            }
            Frame::Animate { node } => {
                self.frames.pop();
                self.current = Some(node);
                self.suspend_reason = Some(WaitReason::Display);
                Ok(None)
            }
            Frame::Uninterrupted { node, saved_limit } => {
                self.frames.pop();
                self.tick_limit = saved_limit;
                self.current = node_next(&self.heap, node);
                Ok(None)
            }
            Frame::Call { node, base, saved_mframe, .. } => {
                self.frames.pop();
                self.stack.truncate(base);
                self.mframe = saved_mframe;
                self.current_module = self.enclosing_module();
                let v = std::mem::replace(&mut self.result, Value::Nil);
                if node_is_reporter(&self.heap, node) {
                    self.deliver_result(v)
                } else {
                    self.base = self.stack.len();
                    self.current = node_next(&self.heap, node);
                    Ok(None)
                }
            }
        }
    }

    /// The module of the nearest activation below the top of the control
    /// stack, for restoring `current_module` on return.
    fn enclosing_module(&self) -> Ref {
        for f in self.frames.iter().rev() {
            if let Frame::Call { method, .. } = f {
                if let Some(m) = function_module(&self.heap, *method) {
                    return m;
                }
            }
        }
        self.console_module
    }

    /// Pays one tick at a loop back edge. Exhausting the budget stops the
    /// machine at the next loop top; a profile interval records a sample.
    fn tick(&mut self) {
        self.ticks += 1;
        if self.profile_tick > 0 && self.ticks % self.profile_tick == 0 {
            self.record_profile_sample();
        }
        if self.tick_limit > 0 && self.ticks > self.tick_limit {
            self.stop = true;
        }
    }

    // ---- inline operations ----------------------------------------------

    fn inline_execute(&mut self, node: Ref, op: InlineOp) -> Result<Option<Value>, Fault> {
        match op {
            InlineOp::If => self.inline_if(node),
            InlineOp::Repeat => self.inline_repeat(node),
            InlineOp::While => self.inline_while(node),
            InlineOp::WaitUntil => self.inline_wait_until(node),
            InlineOp::For => self.inline_for(node),
            InlineOp::Animate => self.inline_animate(node),
            InlineOp::Uninterrupted => self.inline_uninterrupted(node),
            InlineOp::Return => self.inline_return(node),
            InlineOp::ArgCount => {
                let n = match self.active_window() {
                    Some((_, _, nargs)) => nargs as i32,
                    None => 0,
                };
                self.finish(node, Value::Int(n))
            }
            InlineOp::GetArg => self.inline_get_arg(node),
            InlineOp::LastReceiver => self.inline_last_receiver(node),
            InlineOp::Apply => self.inline_apply(node),
            InlineOp::ApplyToArray => self.inline_apply_to_array(node),
            InlineOp::Add | InlineOp::Sub => self.inline_add_sub(node, op),
            InlineOp::Less => self.inline_less(node),
            InlineOp::IsNil => {
                let v = self.arg_or_nil(0).is_nil();
                self.finish(node, if v { Value::True } else { Value::False })
            }
            InlineOp::NotNil => {
                let v = !self.arg_or_nil(0).is_nil();
                self.finish(node, if v { Value::True } else { Value::False })
            }
            InlineOp::CurrentTask => self.inline_current_task(node),
            InlineOp::Resume => self.inline_resume(node),
            InlineOp::Gc => self.inline_gc(),
            InlineOp::Noop => {
                self.advance(node);
                Ok(None)
            }
            InlineOp::GetVar => self.inline_get_var(node),
            InlineOp::SetVar | InlineOp::Local => self.inline_set_var(node),
            InlineOp::IncVar => self.inline_inc_var(node),
        }
    }

    fn inline_if(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let nargs = node_arg_count(&self.heap, node);
        let evaluated = self.stack.len() - self.base;
        let mut chosen = None;
        let mut i = 0;
        while i < evaluated {
            let cond = self.stack[self.base + i];
            if i + 1 >= nargs {
                // Trailing else body.
                chosen = Some(cond);
                break;
            }
            match cond {
                Value::True => {
                    chosen = Some(if i + 1 < evaluated {
                        self.stack[self.base + i + 1]
                    } else {
                        node_arg(&self.heap, node, i + 1)
                    });
                    break;
                }
                Value::False => i += 2,
                _ => return Err(Fault::bad_call("Expected a boolean (true or false)")),
            }
        }
        self.stack.truncate(self.base);
        match chosen {
            Some(Value::Nil) | None => {
                self.current = node_next(&self.heap, node);
                Ok(None)
            }
            Some(body) => {
                let body = self.command_body(body, "if")?;
                self.push_frame(Frame::If { node })?;
                self.current = Some(body);
                Ok(None)
            }
        }
    }

    fn inline_repeat(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let count = match self.arg_or_nil(0) {
            Value::Int(n) => n as i64,
            Value::Ref(r) => match self.heap.class_index(r) {
                crate::memory::header::FLOAT_CLASS => self.heap.float_value(r) as i64,
                crate::memory::header::LARGE_INTEGER_CLASS => {
                    self.heap.large_int_to_i64(r).unwrap_or(i64::MAX)
                }
                _ => {
                    return Err(Fault::bad_call(
                        "First argument of 'repeat' must be an integer or float",
                    ));
                }
            },
            _ => {
                return Err(Fault::bad_call(
                    "First argument of 'repeat' must be an integer or float",
                ));
            }
        };
        let body = self.arg_or_nil(1);
        self.stack.truncate(self.base);
        if count < 1 || body.is_nil() {
            self.current = node_next(&self.heap, node);
            return Ok(None);
        }
        let body = self.command_body(body, "repeat")?;
        let remaining = count.min(i32::MAX as i64) as i32;
        self.push_frame(Frame::Repeat { node, remaining })?;
        self.current = Some(body);
        Ok(None)
    }

    fn inline_while(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let cond = self.arg_or_nil(0);
        let body = self.arg_or_nil(1);
        self.stack.truncate(self.base);
        match cond {
            Value::True => {
                let body = if body.is_nil() {
                    None
                } else {
                    Some(self.command_body(body, "while")?)
                };
                self.push_frame(Frame::While { node })?;
                self.current = body;
                Ok(None)
            }
            Value::False => {
                self.current = node_next(&self.heap, node);
                Ok(None)
            }
            _ => Err(Fault::bad_call("Expected a boolean (true or false)")),
        }
    }

    fn inline_wait_until(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let cond = self.arg_or_nil(0);
        self.stack.truncate(self.base);
        match cond {
            Value::True => {
                self.current = node_next(&self.heap, node);
                Ok(None)
            }
            Value::False => {
                self.current = Some(node);
                self.suspend_reason = Some(WaitReason::Display);
                Ok(None)
            }
            _ => Err(Fault::bad_call("Expected a boolean (true or false)")),
        }
    }

    fn inline_for(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let Some(name) = self.arg_or_nil(0).as_ref() else {
            return Err(Fault::bad_call(
                "First argument of 'for' must be a variable name",
            ));
        };
        if self.heap.class_index(name) != STRING_CLASS {
            return Err(Fault::bad_call(
                "First argument of 'for' must be a variable name",
            ));
        }
        let name_str = self.heap.string_value(name);
        let binding = self.compute_binding(&name_str, true)?;
        let seq = self.arg_or_nil(1);
        let body_val = self.arg_or_nil(2);
        self.stack.truncate(self.base);
        let body = if body_val.is_nil() {
            None
        } else {
            Some(self.command_body(body_val, "for")?)
        };

        let int_limit = match seq {
            Value::Int(n) => Some(n),
            Value::Ref(r) => match self.heap.class_index(r) {
                crate::memory::header::FLOAT_CLASS => Some(self.heap.float_value(r) as i32),
                crate::memory::header::LARGE_INTEGER_CLASS => {
                    Some(self.heap.large_int_to_i64(r).unwrap_or(i64::MAX).min(i32::MAX as i64) as i32)
                }
                _ => None,
            },
            _ => {
                return Err(Fault::bad_call(
                    "Second argument of 'for' must be an integer, float, or array",
                ));
            }
        };
        if let Some(limit) = int_limit {
            if limit < 1 {
                self.current = node_next(&self.heap, node);
                return Ok(None);
            }
            self.write_binding(binding, Value::Int(1))?;
            self.push_frame(Frame::For { node, binding, index: 1, limit })?;
            self.current = body;
            return Ok(None);
        }

        // A reference sequence: Array iterates its slots, List its span.
        let r = match seq {
            Value::Ref(r) => r,
            _ => unreachable!(),
        };
        let (items, start, limit) = match self.heap.class_index(r) {
            ARRAY_CLASS => (r, 0usize, self.heap.word_count(r)),
            LIST_CLASS => {
                let Some(contents) = self.heap.field(r, 2).as_ref() else {
                    self.current = node_next(&self.heap, node);
                    return Ok(None);
                };
                let first = self.heap.field(r, 0).as_int().unwrap_or(1).max(1) as usize;
                let last = self.heap.field(r, 1).as_int().unwrap_or(0).max(0) as usize;
                (contents, first - 1, last.min(self.heap.word_count(contents)))
            }
            _ => {
                return Err(Fault::bad_call(
                    "Second argument of 'for' must be an integer, float, or array",
                ));
            }
        };
        if start >= limit {
            self.current = node_next(&self.heap, node);
            return Ok(None);
        }
        let v = self.heap.field(items, start);
        self.write_binding(binding, v)?;
        self.push_frame(Frame::ForEach { node, binding, items, index: start, limit })?;
        self.current = body;
        Ok(None)
    }

    fn inline_animate(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let body_val = self.arg_or_nil(0);
        self.stack.truncate(self.base);
        let body = if body_val.is_nil() {
            None
        } else {
            Some(self.command_body(body_val, "animate")?)
        };
        self.push_frame(Frame::Animate { node })?;
        self.current = body;
        Ok(None)
    }

    fn inline_uninterrupted(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let body_val = self.arg_or_nil(0);
        self.stack.truncate(self.base);
        let body = if body_val.is_nil() {
            None
        } else {
            Some(self.command_body(body_val, "uninterruptedly")?)
        };
        self.push_frame(Frame::Uninterrupted { node, saved_limit: self.tick_limit })?;
        self.tick_limit = 0;
        self.current = body;
        Ok(None)
    }

    fn inline_return(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let _ = node;
        let evaluated = self.stack.len() - self.base;
        self.result = if evaluated >= 1 {
            self.stack[self.base]
        } else {
            Value::Nil
        };
        self.stack.truncate(self.base);
        let keep = match self.mframe {
            Some(m) => m + 1,
            None => 1,
        };
        // Leaving uninterruptedly blocks early puts their budget back; the
        // outermost one holds the limit that was active before any began.
        for f in &self.frames[keep.min(self.frames.len())..] {
            if let Frame::Uninterrupted { saved_limit, .. } = f {
                self.tick_limit = *saved_limit;
                break;
            }
        }
        self.frames.truncate(keep);
        if self.mframe.is_none() {
            self.stack.clear();
            self.base = 0;
        }
        self.current = None;
        Ok(None)
    }

    fn inline_get_arg(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let Value::Int(i) = self.arg_or_nil(0) else {
            return Err(Fault::bad_call("First argument of 'arg' must be an integer"));
        };
        let v = match self.active_window() {
            Some((base, _, nargs)) if i >= 1 && (i as usize) <= nargs => {
                self.stack[base + i as usize - 1]
            }
            _ => Value::Nil,
        };
        self.finish(node, v)
    }

    fn inline_last_receiver(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let mut found = Value::Nil;
        for f in self.frames.iter().rev() {
            if let Frame::Call { base, nargs, method, .. } = f {
                if *nargs > 0 && function_class_index(&self.heap, *method) != 0 {
                    found = self.stack[*base];
                    break;
                }
            }
        }
        self.finish(node, found)
    }

    fn inline_apply(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        if self.stack.len() == self.base {
            return Err(Fault::bad_call(
                "First argument of 'call' must be a String or Function",
            ));
        }
        match self.stack[self.base] {
            Value::Ref(f) if self.heap.class_index(f) == FUNCTION_CLASS => {
                self.stack.remove(self.base);
                self.invoke(node, f)?;
                Ok(None)
            }
            Value::Ref(s) if self.heap.class_index(s) == STRING_CLASS => {
                let name = self.heap.string_value(s);
                self.stack.remove(self.base);
                self.dispatch_named(node, &name)
            }
            _ => Err(Fault::bad_call(
                "First argument of 'call' must be a String or Function",
            )),
        }
    }

    fn inline_apply_to_array(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let designator = self.arg_or_nil(0);
        let spread = self.arg_or_nil(1);
        let Some(array) = spread.as_ref().filter(|r| self.heap.class_index(*r) == ARRAY_CLASS)
        else {
            return Err(Fault::bad_call(
                "Second argument of 'callWith' must be an Array",
            ));
        };
        let items: Vec<Value> = (0..self.heap.word_count(array))
            .map(|i| self.heap.field(array, i))
            .collect();
        self.stack.truncate(self.base);
        for v in items {
            self.push(v)?;
        }
        match designator {
            Value::Ref(f) if self.heap.class_index(f) == FUNCTION_CLASS => {
                self.invoke(node, f)?;
                Ok(None)
            }
            Value::Ref(s) if self.heap.class_index(s) == STRING_CLASS => {
                let name = self.heap.string_value(s);
                self.dispatch_named(node, &name)
            }
            _ => Err(Fault::bad_call(
                "First argument of 'callWith' must be a String or Function",
            )),
        }
    }

    /// Dispatches a runtime-chosen name the way `resolve` would, but
    /// without touching the call site caches.
    fn dispatch_named(&mut self, node: Ref, name: &str) -> Result<Option<Value>, Fault> {
        let argc = self.stack.len() - self.base;
        let receiver_class = if argc > 0 {
            Some(self.heap.class_index_of(self.stack[self.base]))
        } else {
            None
        };
        if let Some(m) = self.find_method(name, receiver_class, self.current_module)? {
            self.invoke(node, m)?;
            return Ok(None);
        }
        if let Some(i) = prim_index(name) {
            let prim = prim_by_index(i)
                .ok_or_else(|| Fault::bad_call("Call site cached an unknown primitive"))?;
            let args: Vec<Value> = self.stack[self.base..].to_vec();
            self.stack.truncate(self.base);
            let v = (prim.func)(self, &args)?;
            return self.finish(node, v);
        }
        Err(Fault::undefined(name))
    }

    fn inline_add_sub(&mut self, node: Ref, op: InlineOp) -> Result<Option<Value>, Fault> {
        let argc = self.stack.len() - self.base;
        if op == InlineOp::Sub && argc == 1 {
            let v = match num_arg(&self.heap, self.stack[self.base]) {
                Some(Num::I(x)) => match x.checked_neg() {
                    Some(n) => self.heap.int_value(n)?,
                    None => wide_int(&mut self.heap, -(x as i128))?,
                },
                Some(Num::F(x)) => Value::Ref(self.heap.new_float(-x)?),
                None => return self.numeric_fallback(node),
            };
            return self.finish(node, v);
        }
        if argc != 2 {
            return Err(Fault::bad_call(format!(
                "'{}' takes two arguments",
                self.op_name(node)
            )));
        }
        let a = num_arg(&self.heap, self.stack[self.base]);
        let b = num_arg(&self.heap, self.stack[self.base + 1]);
        let v = match (a, b) {
            (Some(Num::I(x)), Some(Num::I(y))) => {
                let wide = if op == InlineOp::Add {
                    x.checked_add(y)
                } else {
                    x.checked_sub(y)
                };
                match wide {
                    Some(n) => self.heap.int_value(n)?,
                    None => {
                        let n = if op == InlineOp::Add {
                            x as i128 + y as i128
                        } else {
                            x as i128 - y as i128
                        };
                        wide_int(&mut self.heap, n)?
                    }
                }
            }
            (Some(a), Some(b)) => {
                let (x, y) = (a.to_f64(), b.to_f64());
                let f = if op == InlineOp::Add { x + y } else { x - y };
                Value::Ref(self.heap.new_float(f)?)
            }
            _ => return self.numeric_fallback(node),
        };
        self.finish(node, v)
    }

    fn inline_less(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let argc = self.stack.len() - self.base;
        if argc != 2 {
            return Err(Fault::bad_call("'<' takes two arguments"));
        }
        let a = num_arg(&self.heap, self.stack[self.base]);
        let b = num_arg(&self.heap, self.stack[self.base + 1]);
        let less = match (a, b) {
            (Some(Num::I(x)), Some(Num::I(y))) => x < y,
            (Some(a), Some(b)) => a.to_f64() < b.to_f64(),
            _ => return self.numeric_fallback(node),
        };
        self.finish(node, if less { Value::True } else { Value::False })
    }

    /// A numeric inline op saw a non-number: a user method on the receiver
    /// class gets one chance before the type fault.
    fn numeric_fallback(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let op = self.op_name(node);
        if self.stack.len() > self.base {
            let receiver_class = self.heap.class_index_of(self.stack[self.base]);
            if let Some(m) = self.find_method(&op, Some(receiver_class), self.current_module)? {
                self.invoke(node, m)?;
                return Ok(None);
            }
        }
        Err(Fault::bad_call(format!(
            "All arguments of '{}' must be numbers",
            op
        )))
    }

    fn inline_current_task(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        self.stack.truncate(self.base);
        let Value::Ref(task) = self.current_task else {
            return self.finish(node, Value::Nil);
        };
        // The snapshot resumes by re-executing this reporter, so a resumed
        // task delivers itself again at the same consumer.
        self.current = Some(node);
        self.save_machine_into(task)?;
        self.finish(node, Value::Ref(task))
    }

    fn inline_resume(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let Some(target) = self
            .arg_or_nil(0)
            .as_ref()
            .filter(|r| self.heap.class_index(*r) == TASK_CLASS)
        else {
            return Err(Fault::bad_call("First argument of resume must be a Task"));
        };
        let single = self.arg_or_nil(1) == Value::True;
        self.stack.truncate(self.base);
        self.current = node_next(&self.heap, node);
        if self.heap.field(target, TASK_STACK).is_nil() {
            return Ok(None);
        }
        if let Value::Ref(running) = self.current_task {
            if running == target {
                return Ok(None);
            }
            self.save_machine_into(running)?;
            self.set_task_wait_reason(running, None)?;
        }
        self.install_task(target)?;
        if single {
            self.step_quota = Some(1);
        }
        Ok(None)
    }

    fn inline_gc(&mut self) -> Result<Option<Value>, Fault> {
        self.stack.truncate(self.base);
        let stats = self.collect_now();
        // Every Ref from before the collection is stale now; the node
        // comes back through the forwarded current register.
        let Some(node) = self.current else {
            return Ok(None);
        };
        let v = self.heap.int_value(stats.recovered_bytes as i64)?;
        self.finish(node, v)
    }

    // ---- variables ------------------------------------------------------

    fn inline_get_var(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let (binding, name) = self.resolve_var(node, 0, false)?;
        let v = self.read_binding(binding, &name)?;
        self.finish(node, v)
    }

    fn inline_set_var(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let (binding, _) = self.resolve_var(node, 0, true)?;
        let v = self.arg_or_nil(1);
        self.write_binding(binding, v)?;
        self.advance(node);
        Ok(None)
    }

    fn inline_inc_var(&mut self, node: Ref) -> Result<Option<Value>, Fault> {
        let (binding, name) = self.resolve_var(node, 0, false)?;
        let current = self.read_binding(binding, &name)?;
        let delta = self.arg_or_nil(1);
        let v = match (num_arg(&self.heap, current), num_arg(&self.heap, delta)) {
            (Some(Num::I(x)), Some(Num::I(y))) => match x.checked_add(y) {
                Some(n) => self.heap.int_value(n)?,
                None => wide_int(&mut self.heap, x as i128 + y as i128)?,
            },
            (Some(a), Some(b)) => Value::Ref(self.heap.new_float(a.to_f64() + b.to_f64())?),
            _ => {
                return Err(Fault::bad_call(format!(
                    "All arguments of '{}' must be numbers",
                    self.op_name(node)
                )));
            }
        };
        self.write_binding(binding, v)?;
        self.advance(node);
        Ok(None)
    }

    /// The binding for a variable node's name argument. A literal name
    /// caches the binding on the node; a computed name resolves fresh
    /// every time. Module variable hints are revalidated against the name
    /// table before reuse.
    fn resolve_var(
        &mut self,
        node: Ref,
        arg: usize,
        create: bool,
    ) -> Result<(Binding, String), Fault> {
        let Some(name_ref) = self
            .stack
            .get(self.base + arg)
            .and_then(|v| v.as_ref())
            .filter(|r| self.heap.class_index(*r) == STRING_CLASS)
        else {
            return Err(Fault::bad_call("The variable name must be a string."));
        };
        let name = self.heap.string_value(name_ref);
        let literal = node_arg(&self.heap, node, arg) == Value::Ref(name_ref);
        if literal {
            if let Value::Int(word) = node_cache(&self.heap, node) {
                match Binding::decode(word) {
                    Binding::ModuleVar(i)
                        if !self.module_var_name_matches(i as usize, name_ref) => {}
                    Binding::Unbound => {}
                    b => return Ok((b, name)),
                }
            }
        }
        let binding = self.compute_binding(&name, create)?;
        if literal {
            set_node_cache(&mut self.heap, node, Value::Int(binding.encode()));
        }
        Ok((binding, name))
    }

    /// Scope resolution: inside an activation the function's arguments,
    /// locals, and (for methods) the receiver's fields; at the top level
    /// the current module's variables, created on assignment.
    fn compute_binding(&mut self, name: &str, create: bool) -> Result<Binding, Fault> {
        if let Some(m) = self.mframe {
            let Some(Frame::Call { method, .. }) = self.frames.get(m).copied() else {
                return Err(Fault::unbound(name));
            };
            if let Some(i) =
                name_position(&self.heap, function_arg_names(&self.heap, method), name)
            {
                return Ok(Binding::Arg(i as u16));
            }
            if let Some(i) =
                name_position(&self.heap, function_local_names(&self.heap, method), name)
            {
                return Ok(Binding::Local(i as u16));
            }
            let class_index = function_class_index(&self.heap, method);
            if class_index != 0 {
                if let Some(i) = self.field_index_of(class_index, name) {
                    return Ok(Binding::Field(i as u16));
                }
            }
            // Module variables are reached from function bodies only
            // through the shared/setShared primitives.
            return Err(Fault::unbound(name));
        }
        let module = self.current_module;
        if let Some(i) = self.module_variable_index(module, name) {
            return Ok(Binding::ModuleVar(i as u16));
        }
        if create {
            let i = self.add_module_variable(module, name, Value::Nil)?;
            return Ok(Binding::ModuleVar(i as u16));
        }
        Err(Fault::unbound(name))
    }

    fn read_binding(&self, binding: Binding, name: &str) -> Result<Value, Fault> {
        match binding {
            Binding::Arg(i) => Ok(self.arg_slot(i as usize).unwrap_or(Value::Nil)),
            Binding::Local(i) => Ok(self.local_slot(i as usize).unwrap_or(Value::Nil)),
            Binding::Field(i) => Ok(self.field_slot(i as usize).unwrap_or(Value::Nil)),
            Binding::ModuleVar(i) => Ok(self.module_variable(self.current_module, i as usize)),
            Binding::Unbound => Err(Fault::unbound(name)),
        }
    }

    fn write_binding(&mut self, binding: Binding, v: Value) -> Result<(), Fault> {
        match binding {
            Binding::Arg(i) => {
                let Some((base, locals_base, _)) = self.active_window() else {
                    return Err(Fault::bad_call("No activation for variable assignment"));
                };
                let slot = base + i as usize;
                if slot < locals_base {
                    self.stack[slot] = v;
                }
                Ok(())
            }
            Binding::Local(i) => {
                let Some((_, locals_base, _)) = self.active_window() else {
                    return Err(Fault::bad_call("No activation for variable assignment"));
                };
                let slot = locals_base + i as usize;
                if slot < self.stack.len() {
                    self.stack[slot] = v;
                }
                Ok(())
            }
            Binding::Field(i) => {
                let Some((base, _, _)) = self.active_window() else {
                    return Err(Fault::bad_call("No activation for variable assignment"));
                };
                let Value::Ref(receiver) = self.stack[base] else {
                    return Err(Fault::bad_call("Assignment to a field without a receiver"));
                };
                if (i as usize) < self.heap.word_count(receiver) {
                    self.heap.set_field(receiver, i as usize, v);
                    Ok(())
                } else {
                    // The instance predates this field.
                    Err(Fault::bad_call("Assignment to a missing field"))
                }
            }
            Binding::ModuleVar(i) => {
                let module = self.current_module;
                self.set_module_variable(module, i as usize, v);
                Ok(())
            }
            Binding::Unbound => Err(Fault::bad_call("Assignment to an unknown variable")),
        }
    }

    // ---- small helpers --------------------------------------------------

    /// (base, locals base, nargs) of the active Call frame.
    fn active_window(&self) -> Option<(usize, usize, usize)> {
        let m = self.mframe?;
        match self.frames.get(m) {
            Some(Frame::Call { base, locals_base, nargs, .. }) => {
                Some((*base, *locals_base, *nargs))
            }
            _ => None,
        }
    }

    fn arg_slot(&self, i: usize) -> Option<Value> {
        let (base, locals_base, _) = self.active_window()?;
        let slot = base + i;
        Some(if slot < locals_base {
            self.stack[slot]
        } else {
            Value::Nil
        })
    }

    fn local_slot(&self, i: usize) -> Option<Value> {
        let (_, locals_base, _) = self.active_window()?;
        self.stack.get(locals_base + i).copied()
    }

    /// Reads a receiver field through the active window. An instance made
    /// before the field was added reads as nil.
    fn field_slot(&self, i: usize) -> Option<Value> {
        let (base, _, _) = self.active_window()?;
        let Value::Ref(receiver) = self.stack[base] else {
            return Some(Value::Nil);
        };
        Some(if i < self.heap.word_count(receiver) {
            self.heap.field(receiver, i)
        } else {
            Value::Nil
        })
    }

    fn module_var_name_matches(&self, i: usize, name: Ref) -> bool {
        let Some(names) = self
            .heap
            .field(self.current_module, MODULE_VARIABLE_NAMES)
            .as_ref()
        else {
            return false;
        };
        if i >= self.heap.word_count(names) {
            return false;
        }
        match self.heap.field(names, i) {
            Value::Ref(n) => self.heap.string_eq(n, name),
            _ => false,
        }
    }

    fn arg_or_nil(&self, i: usize) -> Value {
        self.stack.get(self.base + i).copied().unwrap_or(Value::Nil)
    }

    fn op_name(&self, node: Ref) -> String {
        match node_op(&self.heap, node) {
            Some(s) => self.heap.string_value(s),
            None => "?".to_string(),
        }
    }

    /// Checks that a loop or branch body is a command list.
    fn command_body(&self, body: Value, construct: &str) -> Result<Ref, Fault> {
        match body {
            Value::Ref(r) if self.heap.class_index(r) == crate::memory::header::COMMAND_CLASS => {
                Ok(r)
            }
            _ => Err(Fault::bad_call(format!(
                "Bad command list in '{}'",
                construct
            ))),
        }
    }

    /// Consumes a command's arguments and moves to the next node.
    fn advance(&mut self, node: Ref) {
        self.stack.truncate(self.base);
        self.current = node_next(&self.heap, node);
    }

    /// Finishes an op usable in either position: reporters deliver the
    /// value, commands drop it and chain on.
    fn finish(&mut self, node: Ref, v: Value) -> Result<Option<Value>, Fault> {
        self.stack.truncate(self.base);
        if node_is_reporter(&self.heap, node) {
            self.deliver_result(v)
        } else {
            self.current = node_next(&self.heap, node);
            Ok(None)
        }
    }

    fn trace_step(&self, node: Ref) {
        let kind = if node_is_reporter(&self.heap, node) {
            "reporter"
        } else {
            "command"
        };
        println!(
            "{:indent$}{} {} (stack {}, evaluated {})",
            "",
            kind,
            self.op_name(node),
            self.stack.len(),
            self.stack.len() - self.base,
            indent = (self.frames.len().saturating_sub(1)).min(24)
        );
    }
}
