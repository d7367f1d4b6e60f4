//! Object memory: the word arena, tagged values, object headers, and the
//! mark-sweep-compacting collector.
//!
//! All heap data lives in one contiguous `Vec<u32>` arena. References are
//! word offsets into that arena, never pointers, so compaction can relocate
//! objects by rewriting words. Allocation is a bump of the free pointer and
//! never moves existing data; only [`heap::Heap::collect`] moves objects,
//! and only between interpreter dispatch steps.

pub mod gc;
pub mod header;
pub mod heap;
#[cfg(feature = "gc-telemetry")]
pub mod telemetry;
pub mod value;
