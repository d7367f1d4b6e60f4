pub mod memory;
pub mod runtime;
