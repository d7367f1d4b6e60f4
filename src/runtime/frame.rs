//! Control frames and variable bindings.
//!
//! The interpreter keeps its control state in a typed `Vec<Frame>` beside
//! the value stack. Frames never live in the heap while a task is running;
//! suspension encodes them into a plain Array ([`frames_to_heap`]) and
//! resumption decodes and revalidates them ([`frames_from_heap`]), so a
//! parked task is ordinary collectable data.

use crate::memory::gc::RootSet;
use crate::memory::header::ARRAY_CLASS;
use crate::memory::heap::{Heap, OutOfMemory};
use crate::memory::value::{Ref, Value};
use crate::runtime::fault::Fault;

// Binding bit layout, stored as an inline integer in a node's cache field.
const ARG_BIT: i32 = 1 << 10;
const LOCAL_BIT: i32 = 1 << 11;
const FIELD_BIT: i32 = 1 << 12;
const MODULE_BIT: i32 = 1 << 13;
const UNBOUND_WORD: i32 = (1 << 14) | 1;
const INDEX_MASK: i32 = 0x3FF;

/// Where a variable name resolved. `Arg` and `Local` index the active call
/// window, `Field` indexes the receiver, `ModuleVar` is a hint that is
/// revalidated against the module's name table on every access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Arg(u16),
    Local(u16),
    Field(u16),
    ModuleVar(u16),
    Unbound,
}

impl Binding {
    pub fn encode(self) -> i32 {
        match self {
            Binding::Arg(i) => ARG_BIT | i as i32,
            Binding::Local(i) => LOCAL_BIT | i as i32,
            Binding::Field(i) => FIELD_BIT | i as i32,
            Binding::ModuleVar(i) => MODULE_BIT | i as i32,
            Binding::Unbound => UNBOUND_WORD,
        }
    }

    pub fn decode(word: i32) -> Binding {
        let index = (word & INDEX_MASK) as u16;
        if word & ARG_BIT != 0 {
            Binding::Arg(index)
        } else if word & LOCAL_BIT != 0 {
            Binding::Local(index)
        } else if word & FIELD_BIT != 0 {
            Binding::Field(index)
        } else if word & MODULE_BIT != 0 {
            Binding::ModuleVar(index)
        } else {
            Binding::Unbound
        }
    }
}

/// One entry on the control stack.
///
/// `Eval` remembers the node whose argument is being computed and the value
/// stack base to restore when the result arrives. The loop frames carry
/// their per-iteration state; `Call` carries the activation window layout.
/// `Halt` sits at the bottom of every task and turns the final block end
/// into task completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    Halt,
    Eval {
        node: Ref,
        base: usize,
    },
    If {
        node: Ref,
    },
    Repeat {
        node: Ref,
        remaining: i32,
    },
    Animate {
        node: Ref,
    },
    While {
        node: Ref,
    },
    For {
        node: Ref,
        binding: Binding,
        index: i32,
        limit: i32,
    },
    ForEach {
        node: Ref,
        binding: Binding,
        items: Ref,
        index: usize,
        limit: usize,
    },
    Uninterrupted {
        node: Ref,
        saved_limit: i32,
    },
    Call {
        node: Ref,
        base: usize,
        nargs: usize,
        locals_base: usize,
        method: Ref,
        saved_mframe: Option<usize>,
    },
}

const TAG_HALT: i32 = 0;
const TAG_EVAL: i32 = 1;
const TAG_IF: i32 = 2;
const TAG_REPEAT: i32 = 3;
const TAG_ANIMATE: i32 = 4;
const TAG_WHILE: i32 = 5;
const TAG_FOR: i32 = 6;
const TAG_FOR_EACH: i32 = 7;
const TAG_UNINTERRUPTED: i32 = 8;
const TAG_CALL: i32 = 9;

/// Slots per frame in the encoded array. Call is the widest at seven.
const FRAME_STRIDE: usize = 7;

impl Frame {
    /// Registers this frame's references before a collection, in the same
    /// order [`Frame::restore_roots`] reads them back.
    pub(crate) fn push_roots(&self, roots: &mut RootSet) {
        match self {
            Frame::Halt => {}
            Frame::Eval { node, .. }
            | Frame::If { node }
            | Frame::Repeat { node, .. }
            | Frame::Animate { node }
            | Frame::While { node }
            | Frame::For { node, .. }
            | Frame::Uninterrupted { node, .. } => {
                roots.push(Value::Ref(*node));
            }
            Frame::ForEach { node, items, .. } => {
                roots.push(Value::Ref(*node));
                roots.push(Value::Ref(*items));
            }
            Frame::Call { node, method, .. } => {
                roots.push(Value::Ref(*node));
                roots.push(Value::Ref(*method));
            }
        }
    }

    /// Reads forwarded references back after a collection. `cursor` must
    /// start at the slot the matching [`Frame::push_roots`] wrote first.
    pub(crate) fn restore_roots(&mut self, roots: &RootSet, cursor: &mut usize) {
        let mut take = || {
            let slot = *cursor;
            *cursor += 1;
            match roots.get(slot) {
                Value::Ref(r) => r,
                v => unreachable!("non-reference root {v} in frame slot"),
            }
        };
        match self {
            Frame::Halt => {}
            Frame::Eval { node, .. }
            | Frame::If { node }
            | Frame::Repeat { node, .. }
            | Frame::Animate { node }
            | Frame::While { node }
            | Frame::For { node, .. }
            | Frame::Uninterrupted { node, .. } => {
                *node = take();
            }
            Frame::ForEach { node, items, .. } => {
                *node = take();
                *items = take();
            }
            Frame::Call { node, method, .. } => {
                *node = take();
                *method = take();
            }
        }
    }
}

fn slot_int(n: usize) -> Value {
    Value::Int(n as i32)
}

/// Encodes the control stack into a heap Array for task suspension. Each
/// frame takes [`FRAME_STRIDE`] slots: a tag, then its payload, nil padded.
pub fn frames_to_heap(heap: &mut Heap, frames: &[Frame]) -> Result<Ref, OutOfMemory> {
    let array = heap.allocate(ARRAY_CLASS, frames.len() * FRAME_STRIDE, Value::Nil)?;
    for (i, frame) in frames.iter().enumerate() {
        let at = i * FRAME_STRIDE;
        let mut put = |offset: usize, v: Value| heap.set_field(array, at + offset, v);
        match *frame {
            Frame::Halt => put(0, Value::Int(TAG_HALT)),
            Frame::Eval { node, base } => {
                put(0, Value::Int(TAG_EVAL));
                put(1, Value::Ref(node));
                put(2, slot_int(base));
            }
            Frame::If { node } => {
                put(0, Value::Int(TAG_IF));
                put(1, Value::Ref(node));
            }
            Frame::Repeat { node, remaining } => {
                put(0, Value::Int(TAG_REPEAT));
                put(1, Value::Ref(node));
                put(2, Value::Int(remaining));
            }
            Frame::Animate { node } => {
                put(0, Value::Int(TAG_ANIMATE));
                put(1, Value::Ref(node));
            }
            Frame::While { node } => {
                put(0, Value::Int(TAG_WHILE));
                put(1, Value::Ref(node));
            }
            Frame::For {
                node,
                binding,
                index,
                limit,
            } => {
                put(0, Value::Int(TAG_FOR));
                put(1, Value::Ref(node));
                put(2, Value::Int(binding.encode()));
                put(3, Value::Int(index));
                put(4, Value::Int(limit));
            }
            Frame::ForEach {
                node,
                binding,
                items,
                index,
                limit,
            } => {
                put(0, Value::Int(TAG_FOR_EACH));
                put(1, Value::Ref(node));
                put(2, Value::Int(binding.encode()));
                put(3, Value::Ref(items));
                put(4, slot_int(index));
                put(5, slot_int(limit));
            }
            Frame::Uninterrupted { node, saved_limit } => {
                put(0, Value::Int(TAG_UNINTERRUPTED));
                put(1, Value::Ref(node));
                put(2, Value::Int(saved_limit));
            }
            Frame::Call {
                node,
                base,
                nargs,
                locals_base,
                method,
                saved_mframe,
            } => {
                put(0, Value::Int(TAG_CALL));
                put(1, Value::Ref(node));
                put(2, slot_int(base));
                put(3, slot_int(nargs));
                put(4, slot_int(locals_base));
                put(5, Value::Ref(method));
                put(6, slot_int(saved_mframe.map_or(0, |m| m + 1)));
            }
        }
    }
    Ok(array)
}

fn bad_frames() -> Fault {
    Fault::bad_call("Task has bad frames in resume")
}

/// Decodes a suspended control stack. Every slot is revalidated so a task
/// whose frame array was mutated cannot corrupt the interpreter.
pub fn frames_from_heap(heap: &Heap, array: Ref) -> Result<Vec<Frame>, Fault> {
    if heap.class_index(array) != ARRAY_CLASS {
        return Err(bad_frames());
    }
    let words = heap.word_count(array);
    if !words.is_multiple_of(FRAME_STRIDE) {
        return Err(bad_frames());
    }
    let int = |offset: usize, at: usize| -> Result<i32, Fault> {
        heap.field(array, at + offset).as_int().ok_or_else(bad_frames)
    };
    let index = |offset: usize, at: usize| -> Result<usize, Fault> {
        let n = int(offset, at)?;
        usize::try_from(n).map_err(|_| bad_frames())
    };
    let obj = |offset: usize, at: usize| -> Result<Ref, Fault> {
        heap.field(array, at + offset).as_ref().ok_or_else(bad_frames)
    };
    let mut frames = Vec::with_capacity(words / FRAME_STRIDE);
    for i in 0..words / FRAME_STRIDE {
        let at = i * FRAME_STRIDE;
        let frame = match int(0, at)? {
            TAG_HALT => Frame::Halt,
            TAG_EVAL => Frame::Eval {
                node: obj(1, at)?,
                base: index(2, at)?,
            },
            TAG_IF => Frame::If { node: obj(1, at)? },
            TAG_REPEAT => Frame::Repeat {
                node: obj(1, at)?,
                remaining: int(2, at)?,
            },
            TAG_ANIMATE => Frame::Animate { node: obj(1, at)? },
            TAG_WHILE => Frame::While { node: obj(1, at)? },
            TAG_FOR => Frame::For {
                node: obj(1, at)?,
                binding: Binding::decode(int(2, at)?),
                index: int(3, at)?,
                limit: int(4, at)?,
            },
            TAG_FOR_EACH => Frame::ForEach {
                node: obj(1, at)?,
                binding: Binding::decode(int(2, at)?),
                items: obj(3, at)?,
                index: index(4, at)?,
                limit: index(5, at)?,
            },
            TAG_UNINTERRUPTED => Frame::Uninterrupted {
                node: obj(1, at)?,
                saved_limit: int(2, at)?,
            },
            TAG_CALL => Frame::Call {
                node: obj(1, at)?,
                base: index(2, at)?,
                nargs: index(3, at)?,
                locals_base: index(4, at)?,
                method: obj(5, at)?,
                saved_mframe: match index(6, at)? {
                    0 => None,
                    m => Some(m - 1),
                },
            },
            _ => return Err(bad_frames()),
        };
        frames.push(frame);
    }
    Ok(frames)
}
