//! Block nodes: the unit the interpreter executes.
//!
//! A node is an ordinary heap object of class Command or Reporter with six
//! fixed fields followed by its argument slots. Commands chain through the
//! `next` field; a Reporter's `next` is always nil. The header cache word
//! of a node holds its encoded [`CallTarget`]; the `cache` body field holds
//! the resolved method reference or variable binding. The collector clears
//! cache words on every survivor, so an untouched target word always reads
//! [`CallTarget::Unresolved`].

use crate::memory::header::{COMMAND_CLASS, REPORTER_CLASS};
use crate::memory::heap::Heap;
use crate::memory::value::{Ref, Value};
use crate::runtime::fault::Fault;
use crate::runtime::vm::VM;

pub const NODE_OP: usize = 0;
pub const NODE_LINE: usize = 1;
pub const NODE_FILE: usize = 2;
pub const NODE_CACHE: usize = 3;
pub const NODE_CACHED_CLASS: usize = 4;
pub const NODE_NEXT: usize = 5;
pub const NODE_FIXED_FIELDS: usize = 6;

/// Operations the dispatch loop handles without a registry call. Variable
/// access and the control structures live here; everything else is a
/// registry primitive or a user definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineOp {
    If,
    Repeat,
    While,
    WaitUntil,
    For,
    Animate,
    Uninterrupted,
    Return,
    ArgCount,
    GetArg,
    LastReceiver,
    Apply,
    ApplyToArray,
    Add,
    Sub,
    Less,
    IsNil,
    NotNil,
    CurrentTask,
    Resume,
    Gc,
    Noop,
    GetVar,
    SetVar,
    IncVar,
    Local,
}

impl InlineOp {
    // Declaration order, so ALL[op as usize] == op.
    const ALL: [InlineOp; 26] = [
        InlineOp::If,
        InlineOp::Repeat,
        InlineOp::While,
        InlineOp::WaitUntil,
        InlineOp::For,
        InlineOp::Animate,
        InlineOp::Uninterrupted,
        InlineOp::Return,
        InlineOp::ArgCount,
        InlineOp::GetArg,
        InlineOp::LastReceiver,
        InlineOp::Apply,
        InlineOp::ApplyToArray,
        InlineOp::Add,
        InlineOp::Sub,
        InlineOp::Less,
        InlineOp::IsNil,
        InlineOp::NotNil,
        InlineOp::CurrentTask,
        InlineOp::Resume,
        InlineOp::Gc,
        InlineOp::Noop,
        InlineOp::GetVar,
        InlineOp::SetVar,
        InlineOp::IncVar,
        InlineOp::Local,
    ];

    pub fn from_name(name: &str) -> Option<InlineOp> {
        let op = match name {
            "if" => InlineOp::If,
            "repeat" => InlineOp::Repeat,
            "while" => InlineOp::While,
            "waitUntil" => InlineOp::WaitUntil,
            "for" => InlineOp::For,
            "animate" => InlineOp::Animate,
            "uninterruptedly" => InlineOp::Uninterrupted,
            "return" => InlineOp::Return,
            "argCount" => InlineOp::ArgCount,
            "arg" => InlineOp::GetArg,
            "lastReceiver" => InlineOp::LastReceiver,
            "call" => InlineOp::Apply,
            "callWith" => InlineOp::ApplyToArray,
            "+" => InlineOp::Add,
            "-" => InlineOp::Sub,
            "<" => InlineOp::Less,
            "isNil" => InlineOp::IsNil,
            "notNil" => InlineOp::NotNil,
            "currentTask" => InlineOp::CurrentTask,
            "resume" => InlineOp::Resume,
            "gc" => InlineOp::Gc,
            "noop" => InlineOp::Noop,
            "v" | "my" => InlineOp::GetVar,
            "=" | "setMy" => InlineOp::SetVar,
            "+=" | "increaseMy" => InlineOp::IncVar,
            "local" => InlineOp::Local,
            _ => return None,
        };
        Some(op)
    }

    fn from_index(i: u32) -> Option<InlineOp> {
        InlineOp::ALL.get(i as usize).copied()
    }
}

/// The resolved target of a call site, packed into the node's header cache
/// word. The low two bits are the tag; a `Method` target keeps the method
/// reference in the node's traced `cache` field, never in the cache word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Unresolved,
    Inline(InlineOp),
    Prim(u32),
    Method,
}

const TARGET_TAG_MASK: u32 = 3;
const TARGET_INLINE: u32 = 1;
const TARGET_PRIM: u32 = 2;
const TARGET_METHOD: u32 = 3;

impl CallTarget {
    pub fn encode(self) -> u32 {
        match self {
            CallTarget::Unresolved => 0,
            CallTarget::Inline(op) => (op as u32) << 2 | TARGET_INLINE,
            CallTarget::Prim(i) => i << 2 | TARGET_PRIM,
            CallTarget::Method => TARGET_METHOD,
        }
    }

    pub fn decode(word: u32) -> CallTarget {
        match word & TARGET_TAG_MASK {
            TARGET_INLINE => match InlineOp::from_index(word >> 2) {
                Some(op) => CallTarget::Inline(op),
                None => CallTarget::Unresolved,
            },
            TARGET_PRIM => CallTarget::Prim(word >> 2),
            TARGET_METHOD => CallTarget::Method,
            _ => CallTarget::Unresolved,
        }
    }
}

// ---- field access -----------------------------------------------------

pub fn node_op(heap: &Heap, node: Ref) -> Option<Ref> {
    heap.field(node, NODE_OP).as_ref()
}

pub fn op_matches(heap: &Heap, node: Ref, name: &str) -> bool {
    match node_op(heap, node) {
        Some(op) => heap.str_matches(op, name),
        None => false,
    }
}

pub fn node_line(heap: &Heap, node: Ref) -> i32 {
    heap.field(node, NODE_LINE).as_int().unwrap_or(0)
}

pub fn node_file(heap: &Heap, node: Ref) -> Option<Ref> {
    heap.field(node, NODE_FILE).as_ref()
}

pub fn node_arg_count(heap: &Heap, node: Ref) -> usize {
    heap.word_count(node) - NODE_FIXED_FIELDS
}

pub fn node_arg(heap: &Heap, node: Ref, i: usize) -> Value {
    heap.field(node, NODE_FIXED_FIELDS + i)
}

pub fn node_next(heap: &Heap, node: Ref) -> Option<Ref> {
    heap.field(node, NODE_NEXT).as_ref()
}

pub fn set_node_next(heap: &mut Heap, node: Ref, next: Option<Ref>) {
    debug_assert!(heap.class_index(node) == COMMAND_CLASS);
    let v = match next {
        Some(r) => Value::Ref(r),
        None => Value::Nil,
    };
    heap.set_field(node, NODE_NEXT, v);
}

pub fn node_is_reporter(heap: &Heap, node: Ref) -> bool {
    heap.class_index(node) == REPORTER_CLASS
}

/// True when the value is a Command or Reporter reference.
pub fn is_node(heap: &Heap, v: Value) -> bool {
    match v {
        Value::Ref(r) => {
            let class = heap.class_index(r);
            class == COMMAND_CLASS || class == REPORTER_CLASS
        }
        _ => false,
    }
}

pub fn call_target(heap: &Heap, node: Ref) -> CallTarget {
    CallTarget::decode(heap.cache_word(node))
}

pub fn set_call_target(heap: &mut Heap, node: Ref, target: CallTarget) {
    heap.set_cache_word(node, target.encode());
}

pub fn node_cache(heap: &Heap, node: Ref) -> Value {
    heap.field(node, NODE_CACHE)
}

pub fn set_node_cache(heap: &mut Heap, node: Ref, v: Value) {
    heap.set_field(node, NODE_CACHE, v);
}

pub fn cached_class_id(heap: &Heap, node: Ref) -> Option<u32> {
    match heap.field(node, NODE_CACHED_CLASS) {
        Value::Int(n) if n >= 0 => Some(n as u32),
        _ => None,
    }
}

pub fn set_cached_class_id(heap: &mut Heap, node: Ref, class_index: u32) {
    heap.set_field(node, NODE_CACHED_CLASS, Value::Int(class_index as i32));
}

/// Drops every resolution a call site holds, returning it to the state it
/// had when built.
pub fn reset_call_site(heap: &mut Heap, node: Ref) {
    heap.set_cache_word(node, 0);
    heap.set_field(node, NODE_CACHE, Value::Nil);
    heap.set_field(node, NODE_CACHED_CLASS, Value::Nil);
}

// ---- construction -----------------------------------------------------

/// Links commands into a chain through their `next` fields and returns the
/// head. Already-linked tails are overwritten.
pub fn chain(heap: &mut Heap, blocks: &[Ref]) -> Option<Ref> {
    for pair in blocks.windows(2) {
        set_node_next(heap, pair[0], Some(pair[1]));
    }
    if let Some(last) = blocks.last() {
        set_node_next(heap, *last, None);
    }
    blocks.first().copied()
}

impl VM {
    fn node(
        &mut self,
        class_index: u32,
        op: &str,
        line: i32,
        file: Option<&str>,
        args: &[Value],
    ) -> Result<Ref, Fault> {
        let op_ref = self.intern(op)?;
        let file_val = match file {
            Some(f) => Value::Ref(self.intern(f)?),
            None => Value::Nil,
        };
        let node = self
            .heap
            .allocate(class_index, NODE_FIXED_FIELDS + args.len(), Value::Nil)?;
        self.heap.set_field(node, NODE_OP, Value::Ref(op_ref));
        self.heap.set_field(node, NODE_LINE, Value::Int(line));
        self.heap.set_field(node, NODE_FILE, file_val);
        for (i, arg) in args.iter().enumerate() {
            self.heap.set_field(node, NODE_FIXED_FIELDS + i, *arg);
        }
        Ok(node)
    }

    /// Builds a Command node with interned `op` and the given argument
    /// slots. Argument values are stored as written; only Reporter
    /// references are evaluated at run time.
    pub fn command(&mut self, op: &str, args: &[Value]) -> Result<Ref, Fault> {
        self.node(COMMAND_CLASS, op, 0, None, args)
    }

    /// [`VM::command`] with a source location for error reports.
    pub fn command_at(
        &mut self,
        op: &str,
        line: i32,
        file: &str,
        args: &[Value],
    ) -> Result<Ref, Fault> {
        self.node(COMMAND_CLASS, op, line, Some(file), args)
    }

    /// Builds a Reporter node. Reporters deliver a value and never chain.
    pub fn reporter(&mut self, op: &str, args: &[Value]) -> Result<Ref, Fault> {
        self.node(REPORTER_CLASS, op, 0, None, args)
    }
}
