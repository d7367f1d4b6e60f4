//! The execution core: class and module model, dictionaries over heap
//! objects, the shared method cache, node graphs, and the tree-walking
//! interpreter with its cooperative task scheduler.
//!
//! All interpreter state lives in one [`vm::VM`] context object; there are
//! no globals. Heap references held by the VM are registered as GC roots
//! before every collection and read back afterwards, so a collection can
//! run at any dispatch boundary.

use crate::memory::value::Value;
use crate::runtime::fault::Fault;
use crate::runtime::vm::VM;

pub mod classes;
pub mod dictionary;
pub mod fault;
pub mod frame;
pub mod hashing;
pub mod interp;
pub mod method_cache;
pub mod node;
pub mod prims;
pub mod task;
pub mod vm;

/// Signature of a registry primitive. Primitives run at GC-safe points and
/// may allocate, but must re-read any `Ref` they held across their own
/// allocating calls if they forced a collection.
pub type PrimFn = fn(&mut VM, &[Value]) -> Result<Value, Fault>;
