//! Tasks: parked machine states in the heap.
//!
//! A running task exists only as the VM's registers. Suspension writes
//! those registers into the Task object (value stack copied to an Array,
//! control frames encoded, the two integer positions, the continuation
//! node); installation is the exact inverse plus revalidation, so a task
//! built or mutated by script code cannot hand the interpreter a corrupt
//! state. Between those two moments a task is ordinary heap data and dies
//! with its last reference.

use log::{debug, info};

use crate::memory::header::TASK_CLASS;
use crate::memory::value::{Ref, Value};
use crate::runtime::fault::Fault;
use crate::runtime::frame::{frames_from_heap, frames_to_heap, Frame};
use crate::runtime::node::{node_arg, node_arg_count, node_file, node_line, node_op};
use crate::runtime::vm::VM;

pub const TASK_STACK: usize = 0;
pub const TASK_FRAMES: usize = 1;
pub const TASK_BASE: usize = 2;
pub const TASK_MFRAME: usize = 3;
pub const TASK_CURRENT: usize = 4;
pub const TASK_NEXT: usize = 5;
pub const TASK_RESULT: usize = 6;
pub const TASK_TICK_LIMIT: usize = 7;
pub const TASK_TO_RESUME: usize = 8;
pub const TASK_WAIT_REASON: usize = 9;
pub const TASK_WAKE_MSECS: usize = 10;
pub const TASK_PROFILE_ARRAY: usize = 11;
pub const TASK_PROFILE_INDEX: usize = 12;
pub const TASK_ERROR_REASON: usize = 13;
pub const TASK_FIELD_COUNT: usize = 14;

// Profile samples are (node, tick count, enclosing methods) records.
pub const PROFILE_CHAIN_DEPTH: usize = 3;
pub const PROFILE_SAMPLE_STRIDE: usize = 2 + PROFILE_CHAIN_DEPTH;

/// Why a parked task is parked. Stored as an interned string in the task
/// so script code can read it; nil means runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Display,
    Timer,
    Terminated,
    Error,
}

impl WaitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitReason::Display => "display",
            WaitReason::Timer => "timer",
            WaitReason::Terminated => "terminated",
            WaitReason::Error => "error",
        }
    }

    fn from_name(name: &str) -> Option<WaitReason> {
        match name {
            "display" => Some(WaitReason::Display),
            "timer" => Some(WaitReason::Timer),
            "terminated" => Some(WaitReason::Terminated),
            "error" => Some(WaitReason::Error),
            _ => None,
        }
    }
}

fn bad_task() -> Fault {
    Fault::bad_call("Bad task in resume")
}

impl VM {
    /// A fresh runnable task that will execute `prog` when installed. The
    /// control stack is a lone Halt frame; the program sits in `nextBlock`
    /// until the first installation.
    pub fn spawn_task(&mut self, prog: Ref) -> Result<Ref, Fault> {
        let frames = frames_to_heap(&mut self.heap, &[Frame::Halt])?;
        let stack = self.empty_array;
        let task = self.heap.allocate(TASK_CLASS, TASK_FIELD_COUNT, Value::Nil)?;
        self.heap.set_field(task, TASK_STACK, Value::Ref(stack));
        self.heap.set_field(task, TASK_FRAMES, Value::Ref(frames));
        self.heap.set_field(task, TASK_BASE, Value::Int(0));
        self.heap.set_field(task, TASK_MFRAME, Value::Int(0));
        self.heap.set_field(task, TASK_NEXT, Value::Ref(prog));
        self.heap.set_field(task, TASK_TICK_LIMIT, Value::Int(self.default_tick_limit));
        self.heap.set_field(task, TASK_PROFILE_INDEX, Value::Int(0));
        Ok(task)
    }

    /// Copies the machine registers into `task`. The registers themselves
    /// are left as they are; callers reset them after parking.
    pub(crate) fn save_machine_into(&mut self, task: Ref) -> Result<(), Fault> {
        let stack = self.heap.new_array(self.stack.len(), Value::Nil)?;
        for (i, v) in self.stack.iter().enumerate() {
            self.heap.set_field(stack, i, *v);
        }
        let frames = frames_to_heap(&mut self.heap, &self.frames)?;
        self.heap.set_field(task, TASK_STACK, Value::Ref(stack));
        self.heap.set_field(task, TASK_FRAMES, Value::Ref(frames));
        self.heap.set_field(task, TASK_BASE, Value::Int(self.base as i32));
        let mframe = self.mframe.map_or(0, |m| m + 1) as i32;
        self.heap.set_field(task, TASK_MFRAME, Value::Int(mframe));
        let current = match self.current {
            Some(n) => Value::Ref(n),
            None => Value::Nil,
        };
        self.heap.set_field(task, TASK_CURRENT, current);
        self.heap.set_field(task, TASK_NEXT, Value::Nil);
        self.heap.set_field(task, TASK_RESULT, self.result);
        self.heap.set_field(task, TASK_TICK_LIMIT, Value::Int(self.tick_limit));
        Ok(())
    }

    /// Loads a parked task into the registers, revalidating every slot.
    /// The caller has already checked the class and the completed-task
    /// case (nil stack field).
    pub(crate) fn install_task(&mut self, task: Ref) -> Result<(), Fault> {
        let stack_obj = self
            .heap
            .field(task, TASK_STACK)
            .as_ref()
            .ok_or_else(|| Fault::bad_call("Task has bad stack in resume"))?;
        if self.heap.class_index(stack_obj) != crate::memory::header::ARRAY_CLASS {
            return Err(Fault::bad_call("Task has bad stack in resume"));
        }
        let frames_obj = self.heap.field(task, TASK_FRAMES).as_ref().ok_or_else(bad_task)?;
        let mut frames = frames_from_heap(&self.heap, frames_obj)?;
        if frames.is_empty() {
            frames.push(Frame::Halt);
        }
        frames[0] = Frame::Halt;
        let base = self.heap.field(task, TASK_BASE).as_int().ok_or_else(bad_task)?;
        let mframe = self.heap.field(task, TASK_MFRAME).as_int().ok_or_else(bad_task)?;
        if base < 0 || mframe < 0 {
            return Err(bad_task());
        }
        let stack_len = self.heap.word_count(stack_obj);
        if base as usize > stack_len || mframe as usize > frames.len() {
            return Err(bad_task());
        }

        self.stack.clear();
        for i in 0..stack_len {
            self.stack.push(self.heap.field(stack_obj, i));
        }
        self.frames = frames;
        self.base = base as usize;
        self.mframe = match mframe {
            0 => None,
            m => Some(m as usize - 1),
        };
        self.current = self
            .heap
            .field(task, TASK_CURRENT)
            .as_ref()
            .or_else(|| self.heap.field(task, TASK_NEXT).as_ref());
        self.result = self.heap.field(task, TASK_RESULT);
        self.tick_limit = self
            .heap
            .field(task, TASK_TICK_LIMIT)
            .as_int()
            .unwrap_or(self.default_tick_limit);
        self.ticks = 0;
        self.current_task = Value::Ref(task);
        self.set_task_wait_reason(task, None)?;
        Ok(())
    }

    /// Marks `task` finished: result recorded, saved state dropped so the
    /// dead machine does not retain objects. Returns the follow-up task
    /// from `taskToResume` if one was linked.
    pub(crate) fn complete_task(&mut self, task: Ref, result: Value) -> Result<Option<Ref>, Fault> {
        self.heap.set_field(task, TASK_RESULT, result);
        self.heap.set_field(task, TASK_STACK, Value::Nil);
        self.heap.set_field(task, TASK_FRAMES, Value::Nil);
        self.heap.set_field(task, TASK_CURRENT, Value::Nil);
        self.heap.set_field(task, TASK_NEXT, Value::Nil);
        self.set_task_wait_reason(task, Some(WaitReason::Terminated))?;
        let follow = self.heap.field(task, TASK_TO_RESUME).as_ref();
        self.heap.set_field(task, TASK_TO_RESUME, Value::Nil);
        debug!("task {} terminated", task.index());
        Ok(follow)
    }

    /// Parks the failing task for inspection: state saved as for a yield,
    /// wait reason "error", the reason recorded, and the task retained in
    /// the debugee slot. Returns the rendered stop report.
    pub(crate) fn fail_task(&mut self, task: Ref, fault: &Fault) -> Result<String, Fault> {
        self.save_machine_into(task)?;
        self.set_task_wait_reason(task, Some(WaitReason::Error))?;
        let reason = self.heap.new_string(&fault.to_string())?;
        self.heap.set_field(task, TASK_ERROR_REASON, Value::Ref(reason));
        self.debugee_task = Value::Ref(task);
        self.current_module = self.session_module;
        Ok(self.format_stop_report(fault))
    }

    pub fn task_wait_reason(&self, task: Ref) -> Option<WaitReason> {
        let s = self.heap.field(task, TASK_WAIT_REASON).as_ref()?;
        WaitReason::from_name(&self.heap.string_value(s))
    }

    pub(crate) fn set_task_wait_reason(
        &mut self,
        task: Ref,
        reason: Option<WaitReason>,
    ) -> Result<(), Fault> {
        let v = match reason {
            Some(r) => Value::Ref(self.intern(r.as_str())?),
            None => Value::Nil,
        };
        self.heap.set_field(task, TASK_WAIT_REASON, v);
        Ok(())
    }

    pub fn task_result(&self, task: Ref) -> Value {
        self.heap.field(task, TASK_RESULT)
    }

    pub fn task_error_reason(&self, task: Ref) -> Option<String> {
        let s = self.heap.field(task, TASK_ERROR_REASON).as_ref()?;
        Some(self.heap.string_value(s))
    }

    pub(crate) fn task_wake_msecs(&self, task: Ref) -> i64 {
        match self.heap.field(task, TASK_WAKE_MSECS) {
            Value::Int(n) => n as i64,
            Value::Ref(r) => self.heap.large_int_to_i64(r).unwrap_or(i64::MAX),
            _ => 0,
        }
    }

    /// Whether the host step loop should install this task now. Display
    /// waits clear every step; timer waits compare against the clock.
    pub fn task_ready(&self, task: Ref, now_msecs: i64) -> bool {
        match self.task_wait_reason(task) {
            None | Some(WaitReason::Display) => true,
            Some(WaitReason::Timer) => self.task_wake_msecs(task) <= now_msecs,
            Some(WaitReason::Terminated) | Some(WaitReason::Error) => false,
        }
    }

    // ---- profiling ------------------------------------------------------

    /// Gives `task` a profile buffer of `samples` records and resets the
    /// write position. The dispatch loop records into it whenever the
    /// profile tick is set.
    pub fn enable_profiling(&mut self, task: Ref, samples: usize) -> Result<(), Fault> {
        let array = self
            .heap
            .new_array(samples * PROFILE_SAMPLE_STRIDE, Value::Nil)?;
        self.heap.set_field(task, TASK_PROFILE_ARRAY, Value::Ref(array));
        self.heap.set_field(task, TASK_PROFILE_INDEX, Value::Int(0));
        Ok(())
    }

    /// Appends one (node, ticks, enclosing methods) record to the current
    /// task's profile buffer, if there is one with space left.
    pub(crate) fn record_profile_sample(&mut self) {
        let Some(task) = self.current_task.as_ref() else {
            return;
        };
        let Some(array) = self.heap.field(task, TASK_PROFILE_ARRAY).as_ref() else {
            return;
        };
        let index = match self.heap.field(task, TASK_PROFILE_INDEX) {
            Value::Int(n) if n >= 0 => n as usize,
            _ => return,
        };
        if index + PROFILE_SAMPLE_STRIDE > self.heap.word_count(array) {
            return;
        }
        let mut chain = [Value::Nil; PROFILE_CHAIN_DEPTH];
        let mut depth = 0;
        for frame in self.frames.iter().rev() {
            if depth == PROFILE_CHAIN_DEPTH {
                break;
            }
            if let Frame::Call { method, .. } = frame {
                chain[depth] = self
                    .heap
                    .field(*method, crate::runtime::classes::FN_NAME);
                depth += 1;
            }
        }
        let node = match self.current {
            Some(n) => Value::Ref(n),
            None => Value::Nil,
        };
        self.heap.set_field(array, index, node);
        self.heap.set_field(array, index + 1, Value::Int(self.ticks));
        for (i, m) in chain.iter().enumerate() {
            self.heap.set_field(array, index + 2 + i, *m);
        }
        self.heap.set_field(
            task,
            TASK_PROFILE_INDEX,
            Value::Int((index + PROFILE_SAMPLE_STRIDE) as i32),
        );
    }

    /// Renders the recorded samples, one line each, for the host log.
    pub fn log_profile_data(&self, task: Ref) {
        let Some(array) = self.heap.field(task, TASK_PROFILE_ARRAY).as_ref() else {
            return;
        };
        let recorded = match self.heap.field(task, TASK_PROFILE_INDEX) {
            Value::Int(n) if n > 0 => n as usize,
            _ => return,
        };
        let mut at = 0;
        while at + PROFILE_SAMPLE_STRIDE <= recorded {
            let op = match self.heap.field(array, at).as_ref() {
                Some(node) => match node_op(&self.heap, node) {
                    Some(s) => self.heap.string_value(s),
                    None => "?".to_string(),
                },
                None => "(between blocks)".to_string(),
            };
            let ticks = self.heap.field(array, at + 1).as_int().unwrap_or(0);
            let mut methods = Vec::new();
            for i in 0..PROFILE_CHAIN_DEPTH {
                if let Some(s) = self.heap.field(array, at + 2 + i).as_ref() {
                    methods.push(self.heap.string_value(s));
                }
            }
            if methods.is_empty() {
                info!("profile: {} at tick {}", op, ticks);
            } else {
                info!("profile: {} at tick {} in {}", op, ticks, methods.join(" < "));
            }
            at += PROFILE_SAMPLE_STRIDE;
        }
    }

    // ---- reports --------------------------------------------------------

    /// A short printable form of a value for error reports. Strings are
    /// quoted, other objects show their class.
    pub(crate) fn describe_value(&self, v: Value) -> String {
        match v {
            Value::Nil | Value::True | Value::False | Value::Int(_) => v.to_string(),
            Value::Ref(r) => match self.heap.class_index(r) {
                crate::memory::header::STRING_CLASS => {
                    format!("'{}'", self.heap.string_value(r))
                }
                crate::memory::header::FLOAT_CLASS => format!("{}", self.heap.float_value(r)),
                c => format!("<{}>", self.class_name(c)),
            },
        }
    }

    /// The stack-trace-style stop report attached to script failures:
    /// the fault message, then the failing operation with its source
    /// position and literal arguments.
    pub(crate) fn format_stop_report(&self, fault: &Fault) -> String {
        let Some(node) = self.last_node else {
            return format!("Stopped: {}", fault);
        };
        let op = match node_op(&self.heap, node) {
            Some(s) => self.heap.string_value(s),
            None => "?".to_string(),
        };
        let file = match node_file(&self.heap, node) {
            Some(f) => self.heap.string_value(f),
            None => "script".to_string(),
        };
        let mut rendered = format!(
            "{}\nStopped at {}:{}: {}",
            fault,
            file,
            node_line(&self.heap, node),
            op
        );
        for i in 0..node_arg_count(&self.heap, node) {
            rendered.push(' ');
            rendered.push_str(&self.describe_value(node_arg(&self.heap, node, i)));
        }
        rendered
    }
}
