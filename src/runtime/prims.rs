//! The primitive registry.
//!
//! Everything callable that is neither an inline interpreter operation nor
//! a user function lives here. Call sites cache registry positions in
//! their header cache word, so the table is append-only; reordering
//! entries breaks warmed call sites.
//!
//! Primitives receive the whole VM plus their already-popped arguments.
//! Missing arguments read as nil; type faults name the argument they
//! reject. A primitive may allocate but must not collect, since callers
//! hold raw `Ref`s across the call.

use std::fmt;

use log::{debug, info};
use sha2::{Digest, Sha256};

use crate::memory::header::{
    ARRAY_CLASS, BINARY_DATA_CLASS, CLASS_CLASS, COMMAND_CLASS, DICTIONARY_CLASS,
    EXTERNAL_REF_CLASS, FLOAT_CLASS, LARGE_INTEGER_CLASS, LIST_CLASS, STRING_CLASS,
    WEAK_ARRAY_CLASS,
};
use crate::memory::heap::{Heap, OutOfMemory};
use crate::memory::value::{Ref, Value};
use crate::runtime::classes::{function_module, CLASS_INDEX};
use crate::runtime::dictionary::{dict_at, dict_at_put, dict_count};
use crate::runtime::fault::Fault;
use crate::runtime::frame::Frame;
use crate::runtime::hashing::object_hash;
use crate::runtime::task::{WaitReason, TASK_WAKE_MSECS};
use crate::runtime::vm::VM;
use crate::runtime::PrimFn;

/// One registry entry.
#[derive(Clone)]
pub struct Primitive {
    pub name: &'static str,
    pub func: PrimFn,
}

impl fmt::Debug for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Primitive({})", self.name)
    }
}

// ---- numbers --------------------------------------------------------------

/// A numeric argument widened for arithmetic. LargeIntegers that fit i64
/// stay integral; wider ones degrade to f64.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Num {
    I(i64),
    F(f64),
}

impl Num {
    pub(crate) fn to_f64(self) -> f64 {
        match self {
            Num::I(i) => i as f64,
            Num::F(f) => f,
        }
    }
}

pub(crate) fn num_arg(heap: &Heap, v: Value) -> Option<Num> {
    match v {
        Value::Int(n) => Some(Num::I(n as i64)),
        Value::Ref(r) => match heap.class_index(r) {
            FLOAT_CLASS => Some(Num::F(heap.float_value(r))),
            LARGE_INTEGER_CLASS => match heap.large_int_to_i64(r) {
                Some(i) => Some(Num::I(i)),
                None => Some(Num::F(heap.large_int_to_f64(r))),
            },
            _ => None,
        },
        _ => None,
    }
}

/// An integer result that may not fit i64, as Int or LargeInteger.
pub(crate) fn wide_int(heap: &mut Heap, n: i128) -> Result<Value, OutOfMemory> {
    if let Ok(v) = i64::try_from(n) {
        return heap.int_value(v);
    }
    let negative = n < 0;
    let bytes = n.unsigned_abs().to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    let r = heap.new_large_int(negative, &bytes[first..])?;
    Ok(Value::Ref(r))
}

// ---- argument helpers -----------------------------------------------------

fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).copied().unwrap_or(Value::Nil)
}

fn bool_result(b: bool) -> Value {
    if b {
        Value::True
    } else {
        Value::False
    }
}

fn int_of(heap: &Heap, v: Value) -> Option<i64> {
    match num_arg(heap, v) {
        Some(Num::I(x)) => Some(x),
        _ => None,
    }
}

fn string_arg(heap: &Heap, args: &[Value], i: usize, msg: &str) -> Result<Ref, Fault> {
    match arg(args, i) {
        Value::Ref(r) if heap.class_index(r) == STRING_CLASS => Ok(r),
        _ => Err(Fault::bad_call(msg)),
    }
}

fn index_arg(heap: &Heap, args: &[Value], i: usize) -> Result<i64, Fault> {
    int_of(heap, arg(args, i)).ok_or_else(|| Fault::bad_call("Index must be an integer"))
}

fn size_arg(heap: &Heap, v: Value, msg: &str) -> Result<usize, Fault> {
    match int_of(heap, v) {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(Fault::bad_call(msg)),
    }
}

fn two_nums(vm: &VM, args: &[Value], op: &str) -> Result<(Num, Num), Fault> {
    match (num_arg(&vm.heap, arg(args, 0)), num_arg(&vm.heap, arg(args, 1))) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(Fault::bad_call(format!(
            "All arguments of '{}' must be numbers",
            op
        ))),
    }
}

fn two_ints(vm: &VM, args: &[Value], op: &str) -> Result<(i64, i64), Fault> {
    match (int_of(&vm.heap, arg(args, 0)), int_of(&vm.heap, arg(args, 1))) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(Fault::bad_call(format!(
            "All arguments of '{}' must be integers",
            op
        ))),
    }
}

/// A class argument given as a Class object or a class name looked up in
/// the current module.
fn class_designator(vm: &VM, args: &[Value], i: usize, prim: &str) -> Result<Ref, Fault> {
    match arg(args, i) {
        Value::Ref(r) if vm.heap.class_index(r) == CLASS_CLASS => Ok(r),
        Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => {
            let name = vm.heap.string_value(r);
            vm.class_named(vm.current_module, &name)
                .ok_or_else(|| Fault::bad_call(format!("Unknown class: {}", name)))
        }
        _ => Err(Fault::bad_call(format!(
            "Argument of {} must be a class or class name",
            prim
        ))),
    }
}

fn class_index_field(vm: &VM, class: Ref) -> Result<u32, Fault> {
    match vm.heap.field(class, CLASS_INDEX) {
        Value::Int(n) if n > 0 => Ok(n as u32),
        _ => Err(Fault::bad_call("Bad class object")),
    }
}

/// Unquoted display form, as `print` and `toString` show values.
fn to_display_string(vm: &VM, v: Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::True => "true".to_string(),
        Value::False => "false".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Ref(r) => match vm.heap.class_index(r) {
            STRING_CLASS => vm.heap.string_value(r),
            FLOAT_CLASS => format!("{}", vm.heap.float_value(r)),
            LARGE_INTEGER_CLASS => match vm.heap.large_int_to_i64(r) {
                Some(i) => i.to_string(),
                None => "a LargeInteger".to_string(),
            },
            c => format!("a {}", vm.class_name(c)),
        },
    }
}

fn joined_display(vm: &VM, args: &[Value]) -> String {
    args.iter()
        .map(|v| to_display_string(vm, *v))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits a definition argument list into parameter names and the trailing
/// body, which must be a command list or nil.
fn split_definition(vm: &VM, rest: &[Value]) -> Result<(Vec<String>, Option<Ref>), Fault> {
    let mut params = Vec::new();
    let mut body = None;
    if let Some((last, names)) = rest.split_last() {
        match *last {
            Value::Nil => {}
            Value::Ref(r) if vm.heap.class_index(r) == COMMAND_CLASS => body = Some(r),
            _ => {
                return Err(Fault::bad_call(
                    "The last argument of a definition must be a command list or nil",
                ));
            }
        }
        for v in names {
            match *v {
                Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => {
                    params.push(vm.heap.string_value(r));
                }
                _ => return Err(Fault::bad_call("Parameter names must be strings")),
            }
        }
    }
    Ok((params, body))
}

/// The module `shared`/`setShared` resolve in: the defining module of the
/// active function, or the current module at top level.
fn shared_module(vm: &VM) -> Ref {
    if let Some(m) = vm.mframe {
        if let Some(Frame::Call { method, .. }) = vm.frames.get(m) {
            if let Some(module) = function_module(&vm.heap, *method) {
                return module;
            }
        }
    }
    vm.current_module
}

// ---- arithmetic -----------------------------------------------------------

fn prim_mul(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (a, b) = two_nums(vm, args, "*")?;
    match (a, b) {
        (Num::I(x), Num::I(y)) => match x.checked_mul(y) {
            Some(n) => Ok(vm.heap.int_value(n)?),
            None => Ok(wide_int(&mut vm.heap, x as i128 * y as i128)?),
        },
        (a, b) => Ok(Value::Ref(vm.heap.new_float(a.to_f64() * b.to_f64())?)),
    }
}

fn prim_div(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    // Division is float division; IEEE handles zero denominators.
    let (a, b) = two_nums(vm, args, "/")?;
    Ok(Value::Ref(vm.heap.new_float(a.to_f64() / b.to_f64())?))
}

fn prim_mod(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (a, b) = two_nums(vm, args, "%")?;
    match (a, b) {
        (Num::I(_), Num::I(0)) => Err(Fault::bad_call("Modulo by zero")),
        (Num::I(x), Num::I(y)) => Ok(vm.heap.int_value(x % y)?),
        (a, b) => Ok(Value::Ref(vm.heap.new_float(a.to_f64() % b.to_f64())?)),
    }
}

fn prim_abs(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match num_arg(&vm.heap, arg(args, 0)) {
        Some(Num::I(x)) => match x.checked_abs() {
            Some(n) => Ok(vm.heap.int_value(n)?),
            None => Ok(wide_int(&mut vm.heap, (x as i128).abs())?),
        },
        Some(Num::F(x)) => Ok(Value::Ref(vm.heap.new_float(x.abs())?)),
        None => Err(Fault::bad_call("First argument of abs must be a number")),
    }
}

fn prim_sqrt(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match num_arg(&vm.heap, arg(args, 0)) {
        Some(n) => Ok(Value::Ref(vm.heap.new_float(n.to_f64().sqrt())?)),
        None => Err(Fault::bad_call("First argument of sqrt must be a number")),
    }
}

fn prim_to_float(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match num_arg(&vm.heap, arg(args, 0)) {
        Some(n) => Ok(Value::Ref(vm.heap.new_float(n.to_f64())?)),
        None => Err(Fault::bad_call("First argument of toFloat must be a number")),
    }
}

fn prim_truncate(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match num_arg(&vm.heap, arg(args, 0)) {
        Some(Num::I(x)) => Ok(vm.heap.int_value(x)?),
        Some(Num::F(x)) => Ok(vm.heap.int_value(x as i64)?),
        None => Err(Fault::bad_call("First argument of truncate must be a number")),
    }
}

// ---- comparison and logic -------------------------------------------------

fn prim_le(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (a, b) = two_nums(vm, args, "<=")?;
    Ok(bool_result(match (a, b) {
        (Num::I(x), Num::I(y)) => x <= y,
        (a, b) => a.to_f64() <= b.to_f64(),
    }))
}

fn prim_ge(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (a, b) = two_nums(vm, args, ">=")?;
    Ok(bool_result(match (a, b) {
        (Num::I(x), Num::I(y)) => x >= y,
        (a, b) => a.to_f64() >= b.to_f64(),
    }))
}

fn prim_gt(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (a, b) = two_nums(vm, args, ">")?;
    Ok(bool_result(match (a, b) {
        (Num::I(x), Num::I(y)) => x > y,
        (a, b) => a.to_f64() > b.to_f64(),
    }))
}

/// Equality: identical values, cross-representation numbers, or strings
/// with the same contents. Everything else compares by identity.
fn values_equal(vm: &VM, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(x), Some(y)) = (num_arg(&vm.heap, a), num_arg(&vm.heap, b)) {
        return match (x, y) {
            (Num::I(p), Num::I(q)) => p == q,
            (x, y) => x.to_f64() == y.to_f64(),
        };
    }
    if let (Value::Ref(r), Value::Ref(s)) = (a, b) {
        if vm.heap.class_index(r) == STRING_CLASS && vm.heap.class_index(s) == STRING_CLASS {
            return vm.heap.string_eq(r, s);
        }
    }
    false
}

fn prim_eq(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    Ok(bool_result(values_equal(vm, arg(args, 0), arg(args, 1))))
}

fn prim_ne(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    Ok(bool_result(!values_equal(vm, arg(args, 0), arg(args, 1))))
}

fn prim_identical(_vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    Ok(bool_result(arg(args, 0) == arg(args, 1)))
}

/// Almost-equal float comparison: the low 12 mantissa bits are masked off
/// both operands before comparing, absorbing accumulated rounding error.
fn prim_compare_floats(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (a, b) = two_nums(vm, args, "compareFloats")?;
    const MASK: u64 = 0xFFFF_FFFF_FFFF_F000;
    let x = a.to_f64().to_bits() & MASK;
    let y = b.to_f64().to_bits() & MASK;
    Ok(bool_result(x == y))
}

fn prim_and(_vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let mut all = true;
    for v in args {
        match v {
            Value::True => {}
            Value::False => all = false,
            _ => return Err(Fault::bad_call("Expected a boolean (true or false)")),
        }
    }
    Ok(bool_result(all))
}

fn prim_or(_vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let mut any = false;
    for v in args {
        match v {
            Value::True => any = true,
            Value::False => {}
            _ => return Err(Fault::bad_call("Expected a boolean (true or false)")),
        }
    }
    Ok(bool_result(any))
}

fn prim_not(_vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match arg(args, 0) {
        Value::True => Ok(Value::False),
        Value::False => Ok(Value::True),
        _ => Err(Fault::bad_call("Expected a boolean (true or false)")),
    }
}

// ---- bit operations -------------------------------------------------------

fn prim_bit_and(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (x, y) = two_ints(vm, args, "&")?;
    Ok(vm.heap.int_value(x & y)?)
}

fn prim_bit_or(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (x, y) = two_ints(vm, args, "|")?;
    Ok(vm.heap.int_value(x | y)?)
}

fn prim_bit_xor(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (x, y) = two_ints(vm, args, "^")?;
    Ok(vm.heap.int_value(x ^ y)?)
}

fn prim_shift_left(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (x, y) = two_ints(vm, args, "<<")?;
    Ok(wide_int(&mut vm.heap, (x as i128) << (y & 31))?)
}

fn prim_shift_right(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (x, y) = two_ints(vm, args, ">>")?;
    Ok(vm.heap.int_value(x >> (y & 31))?)
}

fn prim_unsigned_shift_right(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    // Logical shift over the low 32 bits.
    let (x, y) = two_ints(vm, args, ">>>")?;
    Ok(vm.heap.int_value(((x as u32) >> (y & 31)) as i64)?)
}

// ---- collections ----------------------------------------------------------

fn prim_new_array(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let n = size_arg(
        &vm.heap,
        arg(args, 0),
        "First argument of newArray must be a non-negative integer",
    )?;
    let fill = arg(args, 1);
    Ok(Value::Ref(vm.heap.new_array(n, fill)?))
}

fn prim_array(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let arr = vm.heap.new_array(args.len(), Value::Nil)?;
    for (i, v) in args.iter().enumerate() {
        vm.heap.set_field(arr, i, *v);
    }
    Ok(Value::Ref(arr))
}

fn prim_list(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    Ok(Value::Ref(vm.new_list(args)?))
}

/// (first 1-based slot, one past last slot) of a List's live window in its
/// contents array.
fn list_window(heap: &Heap, list: Ref) -> (usize, usize, Option<Ref>) {
    let contents = heap.field(list, 2).as_ref();
    let first = heap.field(list, 0).as_int().unwrap_or(1).max(1) as usize;
    let last = heap.field(list, 1).as_int().unwrap_or(0).max(0) as usize;
    let cap = contents.map(|c| heap.word_count(c)).unwrap_or(0);
    (first, last.min(cap) + 1, contents)
}

fn prim_count(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let n = match arg(args, 0) {
        Value::Ref(r) => match vm.heap.class_index(r) {
            ARRAY_CLASS | WEAK_ARRAY_CLASS => vm.heap.word_count(r),
            LIST_CLASS => {
                let (first, end, _) = list_window(&vm.heap, r);
                end.saturating_sub(first)
            }
            STRING_CLASS => vm.heap.string_len(r),
            DICTIONARY_CLASS => dict_count(&vm.heap, r),
            BINARY_DATA_CLASS => vm.heap.byte_count(r),
            _ => {
                return Err(Fault::bad_call(
                    "First argument of count must be a collection",
                ));
            }
        },
        _ => {
            return Err(Fault::bad_call(
                "First argument of count must be a collection",
            ));
        }
    };
    Ok(vm.heap.int_value(n as i64)?)
}

fn prim_at(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let Value::Ref(r) = arg(args, 0) else {
        return Err(Fault::bad_call("First argument of at must be a collection"));
    };
    match vm.heap.class_index(r) {
        ARRAY_CLASS | WEAK_ARRAY_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            if i < 1 || i as usize > vm.heap.word_count(r) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            Ok(vm.heap.field(r, i as usize - 1))
        }
        LIST_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            let (first, end, contents) = list_window(&vm.heap, r);
            let slot = first as i64 + i - 1;
            let (Some(contents), true) = (contents, i >= 1 && (slot as usize) < end) else {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            };
            Ok(vm.heap.field(contents, slot as usize - 1))
        }
        STRING_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            if i < 1 || i as usize > vm.heap.string_len(r) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            let b = vm.heap.string_byte(r, i as usize - 1);
            let s = String::from_utf8_lossy(&[b]).into_owned();
            Ok(Value::Ref(vm.heap.new_string(&s)?))
        }
        DICTIONARY_CLASS => Ok(dict_at(&mut vm.heap, r, arg(args, 1))),
        BINARY_DATA_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            if i < 1 || i as usize > vm.heap.byte_count(r) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            Ok(Value::Int(vm.heap.byte_at(r, i as usize - 1) as i32))
        }
        _ => Err(Fault::bad_call("First argument of at must be a collection")),
    }
}

fn prim_at_put(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let Value::Ref(r) = arg(args, 0) else {
        return Err(Fault::bad_call(
            "First argument of atPut must be a collection",
        ));
    };
    let v = arg(args, 2);
    match vm.heap.class_index(r) {
        ARRAY_CLASS | WEAK_ARRAY_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            if i < 1 || i as usize > vm.heap.word_count(r) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            vm.heap.set_field(r, i as usize - 1, v);
            Ok(Value::Nil)
        }
        LIST_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            let (first, end, contents) = list_window(&vm.heap, r);
            let slot = first as i64 + i - 1;
            let (Some(contents), true) = (contents, i >= 1 && (slot as usize) < end) else {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            };
            vm.heap.set_field(contents, slot as usize - 1, v);
            Ok(Value::Nil)
        }
        STRING_CLASS => Err(Fault::bad_call("Strings are immutable")),
        DICTIONARY_CLASS => {
            dict_at_put(&mut vm.heap, r, arg(args, 1), v)?;
            Ok(Value::Nil)
        }
        BINARY_DATA_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            if i < 1 || i as usize > vm.heap.byte_count(r) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            let b = int_of(&vm.heap, v)
                .ok_or_else(|| Fault::bad_call("Third argument of atPut must be a byte"))?;
            vm.heap.set_byte_at(r, i as usize - 1, (b & 0xFF) as u8);
            Ok(Value::Nil)
        }
        _ => Err(Fault::bad_call(
            "First argument of atPut must be a collection",
        )),
    }
}

fn prim_copy_array(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let Value::Ref(r) = arg(args, 0) else {
        return Err(Fault::bad_call(
            "First argument of copyArray must be an Array",
        ));
    };
    let class = vm.heap.class_index(r);
    if class != ARRAY_CLASS && class != WEAK_ARRAY_CLASS {
        return Err(Fault::bad_call(
            "First argument of copyArray must be an Array",
        ));
    }
    let n = match arg(args, 1) {
        Value::Nil => vm.heap.word_count(r),
        v => size_arg(
            &vm.heap,
            v,
            "Second argument of copyArray must be a non-negative integer",
        )?,
    };
    let start = match arg(args, 2) {
        Value::Nil => 1,
        v => match int_of(&vm.heap, v) {
            Some(i) if i >= 1 => i as usize,
            Some(i) => return Err(Fault::bad_call(format!("Index out of range: {}", i))),
            None => return Err(Fault::bad_call("Index must be an integer")),
        },
    };
    Ok(Value::Ref(vm.heap.copy_obj(r, n, start)?))
}

fn prim_fill_array(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let Value::Ref(r) = arg(args, 0) else {
        return Err(Fault::bad_call(
            "First argument of fillArray must be an Array",
        ));
    };
    let v = arg(args, 1);
    for i in 0..vm.heap.word_count(r) {
        vm.heap.set_field(r, i, v);
    }
    Ok(Value::Nil)
}

fn prim_clone(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match arg(args, 0) {
        Value::Ref(r) => Ok(Value::Ref(vm.heap.clone_obj(r)?)),
        v => Ok(v),
    }
}

// ---- objects and classes --------------------------------------------------

fn prim_new(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let class = class_designator(vm, args, 0, "new")?;
    let index = class_index_field(vm, class)?;
    Ok(Value::Ref(vm.new_instance(index)?))
}

fn prim_new_indexable(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let class = class_designator(vm, args, 0, "newIndexable")?;
    let index = class_index_field(vm, class)?;
    let n = size_arg(
        &vm.heap,
        arg(args, 1),
        "Second argument of newIndexable must be a non-negative integer",
    )?;
    let inst = vm.new_instance(index)?;
    if n == 0 {
        return Ok(Value::Ref(inst));
    }
    let fields = vm.heap.word_count(inst);
    Ok(Value::Ref(vm.heap.copy_obj(inst, fields + n, 1)?))
}

fn fielded_object(vm: &VM, args: &[Value], prim: &str) -> Result<Ref, Fault> {
    match arg(args, 0) {
        Value::Ref(r) if vm.heap.format(r).has_refs() => Ok(r),
        _ => Err(Fault::bad_call(format!(
            "First argument of {} must be an object with fields",
            prim
        ))),
    }
}

fn field_position(vm: &VM, obj: Ref, selector: Value, prim: &str) -> Result<usize, Fault> {
    match selector {
        Value::Int(i) => {
            if i < 1 || i as usize > vm.heap.word_count(obj) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            Ok(i as usize - 1)
        }
        Value::Ref(s) if vm.heap.class_index(s) == STRING_CLASS => {
            let name = vm.heap.string_value(s);
            vm.field_index_of(vm.heap.class_index(obj), &name)
                .ok_or_else(|| Fault::bad_call(format!("Unknown field: {}", name)))
        }
        _ => Err(Fault::bad_call(format!(
            "Second argument of {} must be a field name or index",
            prim
        ))),
    }
}

fn prim_get_field(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let obj = fielded_object(vm, args, "getField")?;
    let i = field_position(vm, obj, arg(args, 1), "getField")?;
    Ok(vm.heap.field(obj, i))
}

fn prim_set_field(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let obj = fielded_object(vm, args, "setField")?;
    let i = field_position(vm, obj, arg(args, 1), "setField")?;
    vm.heap.set_field(obj, i, arg(args, 2));
    Ok(Value::Nil)
}

fn prim_to_string(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let s = to_display_string(vm, arg(args, 0));
    Ok(Value::Ref(vm.heap.new_string(&s)?))
}

fn prim_is_class(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name = string_arg(
        &vm.heap,
        args,
        1,
        "Second argument of isClass must be a class name",
    )?;
    let actual = vm.class_name(vm.heap.class_index_of(arg(args, 0)));
    Ok(bool_result(vm.heap.str_matches(name, &actual)))
}

fn prim_class_of(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let index = vm.heap.class_index_of(arg(args, 0));
    match vm.class_from_index(index) {
        Some(c) => Ok(Value::Ref(c)),
        None => Ok(Value::Nil),
    }
}

fn prim_hash(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let h = object_hash(&mut vm.heap, arg(args, 0));
    Ok(vm.heap.int_value(h as i64)?)
}

fn prim_define_class(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of defineClass must be a class name",
    )?;
    let name = vm.heap.string_value(name_ref);
    let mut fields = Vec::new();
    for v in &args[1..] {
        match *v {
            Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => {
                fields.push(vm.heap.string_value(r));
            }
            _ => return Err(Fault::bad_call("Field names must be strings")),
        }
    }
    let field_refs: Vec<&str> = fields.iter().map(|s| s.as_str()).collect();
    Ok(Value::Ref(vm.define_class(&name, &field_refs)?))
}

fn prim_classes(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    let classes = vm.all_classes();
    let arr = vm.heap.new_array(classes.len(), Value::Nil)?;
    for (i, c) in classes.iter().enumerate() {
        vm.heap.set_field(arr, i, Value::Ref(*c));
    }
    Ok(Value::Ref(arr))
}

fn prim_class(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of class must be a class name",
    )?;
    let name = vm.heap.string_value(name_ref);
    match vm.class_named(vm.current_module, &name) {
        Some(c) => Ok(Value::Ref(c)),
        None => Ok(Value::Nil),
    }
}

fn prim_shared(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of shared must be a variable name",
    )?;
    let name = vm.heap.string_value(name_ref);
    let module = shared_module(vm);
    match vm.module_variable_index(module, &name) {
        Some(i) => Ok(vm.module_variable(module, i)),
        None => Err(Fault::bad_call(format!("Unknown shared variable: {}", name))),
    }
}

fn prim_set_shared(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of setShared must be a variable name",
    )?;
    let name = vm.heap.string_value(name_ref);
    let module = shared_module(vm);
    vm.add_module_variable(module, &name, arg(args, 1))?;
    Ok(Value::Nil)
}

// ---- binary data ----------------------------------------------------------

fn prim_new_binary_data(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let n = size_arg(
        &vm.heap,
        arg(args, 0),
        "First argument of newBinaryData must be a non-negative integer",
    )?;
    Ok(Value::Ref(vm.heap.allocate_binary(BINARY_DATA_CLASS, n)?))
}

fn prim_byte_count(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let n = match arg(args, 0) {
        Value::Ref(r) if vm.heap.class_index(r) == BINARY_DATA_CLASS => vm.heap.byte_count(r),
        Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => vm.heap.string_len(r),
        _ => {
            return Err(Fault::bad_call(
                "First argument of byteCount must be a BinaryData or String",
            ));
        }
    };
    Ok(vm.heap.int_value(n as i64)?)
}

fn prim_byte_at(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (r, len) = match arg(args, 0) {
        Value::Ref(r) if vm.heap.class_index(r) == BINARY_DATA_CLASS => {
            (r, vm.heap.byte_count(r))
        }
        Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => (r, vm.heap.string_len(r)),
        _ => {
            return Err(Fault::bad_call(
                "First argument of byteAt must be a BinaryData or String",
            ));
        }
    };
    let i = index_arg(&vm.heap, args, 1)?;
    if i < 1 || i as usize > len {
        return Err(Fault::bad_call(format!("Index out of range: {}", i)));
    }
    Ok(Value::Int(vm.heap.byte_at(r, i as usize - 1) as i32))
}

fn prim_byte_at_put(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match arg(args, 0) {
        Value::Ref(r) if vm.heap.class_index(r) == BINARY_DATA_CLASS => {
            let i = index_arg(&vm.heap, args, 1)?;
            if i < 1 || i as usize > vm.heap.byte_count(r) {
                return Err(Fault::bad_call(format!("Index out of range: {}", i)));
            }
            let b = int_of(&vm.heap, arg(args, 2))
                .ok_or_else(|| Fault::bad_call("Third argument of byteAtPut must be a byte"))?;
            vm.heap.set_byte_at(r, i as usize - 1, (b & 0xFF) as u8);
            Ok(Value::Nil)
        }
        Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => {
            Err(Fault::bad_call("Strings are immutable"))
        }
        _ => Err(Fault::bad_call(
            "First argument of byteAtPut must be a BinaryData",
        )),
    }
}

fn prim_sha256(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let bytes = match arg(args, 0) {
        Value::Ref(r) if vm.heap.class_index(r) == STRING_CLASS => {
            vm.heap.string_value(r).into_bytes()
        }
        Value::Ref(r) if vm.heap.class_index(r) == BINARY_DATA_CLASS => vm.heap.binary_bytes(r),
        _ => {
            return Err(Fault::bad_call(
                "First argument of sha256 must be a String or BinaryData",
            ));
        }
    };
    let digest = Sha256::digest(&bytes);
    Ok(Value::Ref(vm.heap.new_binary_data(&digest)?))
}

// ---- host and scheduler ---------------------------------------------------

fn prim_msecs_since_start(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    let msecs = vm.msecs_since_start();
    Ok(vm.heap.int_value(msecs)?)
}

fn prim_version(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    let v = format!("bramble {}", env!("CARGO_PKG_VERSION"));
    Ok(Value::Ref(vm.heap.new_string(&v)?))
}

fn prim_to(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of 'to' must be a function name",
    )?;
    let name = vm.heap.string_value(name_ref);
    let (params, body) = split_definition(vm, &args[1..])?;
    let param_refs: Vec<&str> = params.iter().map(|s| s.as_str()).collect();
    let module = vm.current_module;
    Ok(Value::Ref(vm.add_function(module, &name, &param_refs, body)?))
}

fn prim_method(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of 'method' must be a method name",
    )?;
    let name = vm.heap.string_value(name_ref);
    let class = class_designator(vm, args, 1, "method")?;
    let (params, body) = split_definition(vm, &args[2..])?;
    let param_refs: Vec<&str> = params.iter().map(|s| s.as_str()).collect();
    Ok(Value::Ref(vm.add_method(class, &name, &param_refs, body)?))
}

fn prim_function(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (params, body) = split_definition(vm, args)?;
    let param_refs: Vec<&str> = params.iter().map(|s| s.as_str()).collect();
    Ok(Value::Ref(vm.anonymous_function(&param_refs, body)?))
}

fn prim_error(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let message = if args.is_empty() {
        "error".to_string()
    } else {
        joined_display(vm, args)
    };
    Err(Fault::bad_call(message))
}

fn prim_halt(_vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    Err(Fault::halted("Halted"))
}

fn prim_print(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let line = joined_display(vm, args);
    debug!("print: {}", line);
    vm.printed.push(line);
    Ok(Value::Nil)
}

fn prim_yield(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    vm.suspend_reason = Some(WaitReason::Display);
    Ok(Value::Nil)
}

fn prim_wait_millis(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let ms = int_of(&vm.heap, arg(args, 0))
        .ok_or_else(|| Fault::bad_call("First argument of waitMillis must be an integer"))?;
    if let Value::Ref(task) = vm.current_task {
        let wake = vm.msecs_since_start() + ms.max(0);
        let v = vm.heap.int_value(wake)?;
        vm.heap.set_field(task, TASK_WAKE_MSECS, v);
        vm.suspend_reason = Some(WaitReason::Timer);
    }
    Ok(Value::Nil)
}

fn prim_debugee_task(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    Ok(vm.debugee_task)
}

fn prim_session_module(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    Ok(Value::Ref(vm.session_module))
}

fn prim_top_level_module(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    Ok(Value::Ref(vm.top_module))
}

fn prim_this_module(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    Ok(Value::Ref(vm.current_module))
}

// ---- introspection --------------------------------------------------------

fn prim_mem_stats(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    let stats = vm.heap.mem_stats();
    let arr = vm.heap.new_array(5, Value::Nil)?;
    let fields = [
        stats.used_bytes,
        stats.capacity_bytes,
        stats.allocations_since_gc,
        stats.bytes_allocated_since_gc,
        stats.gc_count,
    ];
    for (i, n) in fields.iter().enumerate() {
        let v = vm.heap.int_value(*n as i64)?;
        vm.heap.set_field(arr, i, v);
    }
    Ok(Value::Ref(arr))
}

fn prim_obj_words(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match arg(args, 0) {
        Value::Ref(r) => Ok(vm.heap.int_value(vm.heap.word_count(r) as i64)?),
        _ => Ok(Value::Int(0)),
    }
}

fn prim_object_after(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let prev = match arg(args, 0) {
        Value::Nil => None,
        Value::Ref(r) => Some(r),
        _ => {
            return Err(Fault::bad_call(
                "First argument of objectAfter must be an object or nil",
            ));
        }
    };
    let filter = match arg(args, 1) {
        Value::Nil => 0,
        Value::Int(n) if n >= 0 => n as u32,
        Value::Ref(r) if vm.heap.class_index(r) == CLASS_CLASS => class_index_field(vm, r)?,
        _ => {
            return Err(Fault::bad_call(
                "Second argument of objectAfter must be a class or class index",
            ));
        }
    };
    match vm.heap.object_after(prev, filter) {
        Some(r) => Ok(Value::Ref(r)),
        None => Ok(Value::Nil),
    }
}

fn prim_object_references(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let Value::Ref(target) = arg(args, 0) else {
        return Err(Fault::bad_call(
            "First argument of objectReferences must be an object",
        ));
    };
    let holders = vm.heap.references_to(target);
    let arr = vm.heap.new_array(holders.len(), Value::Nil)?;
    for (i, h) in holders.iter().enumerate() {
        vm.heap.set_field(arr, i, Value::Ref(*h));
    }
    Ok(Value::Ref(arr))
}

fn mapped_ref(pairs: &[(Value, Value)], r: Ref) -> Ref {
    for (old, new) in pairs {
        if *old == Value::Ref(r) {
            if let Value::Ref(n) = new {
                return *n;
            }
        }
    }
    r
}

/// Bulk pointer surgery: every reference to `old[i]` anywhere in the heap
/// becomes a reference to `new[i]`. The value stack and module registers
/// are rewritten too; saved control frames of parked tasks are heap
/// objects and are covered by the heap pass.
fn prim_replace_objects(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let (Value::Ref(old), Value::Ref(new)) = (arg(args, 0), arg(args, 1)) else {
        return Err(Fault::bad_call(
            "Arguments of replaceObjects must be two Arrays of the same length",
        ));
    };
    if vm.heap.class_index(old) != ARRAY_CLASS
        || vm.heap.class_index(new) != ARRAY_CLASS
        || vm.heap.word_count(old) != vm.heap.word_count(new)
    {
        return Err(Fault::bad_call(
            "Arguments of replaceObjects must be two Arrays of the same length",
        ));
    }
    let pairs: Vec<(Value, Value)> = (0..vm.heap.word_count(old))
        .map(|i| (vm.heap.field(old, i), vm.heap.field(new, i)))
        .collect();
    vm.heap.replace_objects(&pairs);
    for v in &mut vm.stack {
        for (o, n) in &pairs {
            if v == o {
                *v = *n;
            }
        }
    }
    vm.top_module = mapped_ref(&pairs, vm.top_module);
    vm.session_module = mapped_ref(&pairs, vm.session_module);
    vm.current_module = mapped_ref(&pairs, vm.current_module);
    vm.console_module = mapped_ref(&pairs, vm.console_module);
    for (o, n) in &pairs {
        if vm.result == *o {
            vm.result = *n;
        }
    }
    Ok(Value::Nil)
}

fn prim_clear_method_cache(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    vm.method_cache_clear_all()?;
    Ok(Value::Nil)
}

fn prim_method_cache_stats(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let _ = args;
    let stats = vm.method_cache_stats();
    let json = serde_json::to_string(&stats)
        .map_err(|e| Fault::bad_call(format!("Could not render stats: {}", e)))?;
    Ok(Value::Ref(vm.heap.new_string(&json)?))
}

// ---- external references --------------------------------------------------

fn prim_open_external_reference(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    let name_ref = string_arg(
        &vm.heap,
        args,
        0,
        "First argument of openExternalReference must be a String",
    )?;
    let name = vm.heap.string_value(name_ref);
    let id = vm
        .heap
        .finalizer_named(&name)
        .ok_or_else(|| Fault::bad_call(format!("Unknown finalizer: {}", name)))?;
    let handle = match int_of(&vm.heap, arg(args, 1)) {
        Some(h) if h >= 0 && h <= u32::MAX as i64 => h as u32,
        _ => {
            return Err(Fault::bad_call(
                "Second argument of openExternalReference must be a handle",
            ));
        }
    };
    Ok(Value::Ref(vm.heap.new_external_reference(handle, id)?))
}

fn prim_close_external_reference(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    match arg(args, 0) {
        Value::Ref(r) if vm.heap.class_index(r) == EXTERNAL_REF_CLASS => {
            vm.heap.close_external(r);
            Ok(Value::Nil)
        }
        _ => Err(Fault::bad_call(
            "First argument of closeExternalReference must be an ExternalReference",
        )),
    }
}

fn prim_log(vm: &mut VM, args: &[Value]) -> Result<Value, Fault> {
    info!("{}", joined_display(vm, args));
    Ok(Value::Nil)
}

// ---- registry -------------------------------------------------------------

/// All registry primitives in order; positions are cached by call sites.
pub static PRIMITIVES: &[Primitive] = &[
    Primitive { name: "*", func: prim_mul },
    Primitive { name: "/", func: prim_div },
    Primitive { name: "%", func: prim_mod },
    Primitive { name: "abs", func: prim_abs },
    Primitive { name: "sqrt", func: prim_sqrt },
    Primitive { name: "toFloat", func: prim_to_float },
    Primitive { name: "truncate", func: prim_truncate },
    Primitive { name: "<=", func: prim_le },
    Primitive { name: "==", func: prim_eq },
    Primitive { name: "!=", func: prim_ne },
    Primitive { name: ">=", func: prim_ge },
    Primitive { name: ">", func: prim_gt },
    Primitive { name: "===", func: prim_identical },
    Primitive { name: "compareFloats", func: prim_compare_floats },
    Primitive { name: "and", func: prim_and },
    Primitive { name: "or", func: prim_or },
    Primitive { name: "not", func: prim_not },
    Primitive { name: "&", func: prim_bit_and },
    Primitive { name: "|", func: prim_bit_or },
    Primitive { name: "^", func: prim_bit_xor },
    Primitive { name: "<<", func: prim_shift_left },
    Primitive { name: ">>", func: prim_shift_right },
    Primitive { name: ">>>", func: prim_unsigned_shift_right },
    Primitive { name: "newArray", func: prim_new_array },
    Primitive { name: "array", func: prim_array },
    Primitive { name: "list", func: prim_list },
    Primitive { name: "count", func: prim_count },
    Primitive { name: "at", func: prim_at },
    Primitive { name: "atPut", func: prim_at_put },
    Primitive { name: "copyArray", func: prim_copy_array },
    Primitive { name: "fillArray", func: prim_fill_array },
    Primitive { name: "clone", func: prim_clone },
    Primitive { name: "new", func: prim_new },
    Primitive { name: "newIndexable", func: prim_new_indexable },
    Primitive { name: "getField", func: prim_get_field },
    Primitive { name: "setField", func: prim_set_field },
    Primitive { name: "toString", func: prim_to_string },
    Primitive { name: "isClass", func: prim_is_class },
    Primitive { name: "classOf", func: prim_class_of },
    Primitive { name: "hash", func: prim_hash },
    Primitive { name: "defineClass", func: prim_define_class },
    Primitive { name: "classes", func: prim_classes },
    Primitive { name: "class", func: prim_class },
    Primitive { name: "shared", func: prim_shared },
    Primitive { name: "setShared", func: prim_set_shared },
    Primitive { name: "newBinaryData", func: prim_new_binary_data },
    Primitive { name: "byteCount", func: prim_byte_count },
    Primitive { name: "byteAt", func: prim_byte_at },
    Primitive { name: "byteAtPut", func: prim_byte_at_put },
    Primitive { name: "sha256", func: prim_sha256 },
    Primitive { name: "msecsSinceStart", func: prim_msecs_since_start },
    Primitive { name: "version", func: prim_version },
    Primitive { name: "to", func: prim_to },
    Primitive { name: "method", func: prim_method },
    Primitive { name: "function", func: prim_function },
    Primitive { name: "error", func: prim_error },
    Primitive { name: "halt", func: prim_halt },
    Primitive { name: "print", func: prim_print },
    Primitive { name: "yield", func: prim_yield },
    Primitive { name: "waitMillis", func: prim_wait_millis },
    Primitive { name: "debugeeTask", func: prim_debugee_task },
    Primitive { name: "sessionModule", func: prim_session_module },
    Primitive { name: "topLevelModule", func: prim_top_level_module },
    Primitive { name: "thisModule", func: prim_this_module },
    Primitive { name: "memStats", func: prim_mem_stats },
    Primitive { name: "objWords", func: prim_obj_words },
    Primitive { name: "objectAfter", func: prim_object_after },
    Primitive { name: "objectReferences", func: prim_object_references },
    Primitive { name: "replaceObjects", func: prim_replace_objects },
    Primitive { name: "clearMethodCache", func: prim_clear_method_cache },
    Primitive { name: "methodCacheStats", func: prim_method_cache_stats },
    Primitive { name: "openExternalReference", func: prim_open_external_reference },
    Primitive { name: "closeExternalReference", func: prim_close_external_reference },
    Primitive { name: "log", func: prim_log },
];

pub fn prim_index(name: &str) -> Option<u32> {
    PRIMITIVES
        .iter()
        .position(|p| p.name == name)
        .map(|i| i as u32)
}

pub fn prim_by_index(index: u32) -> Option<&'static Primitive> {
    PRIMITIVES.get(index as usize)
}
