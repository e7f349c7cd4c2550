//! Allocation Store Adapters
//!
//! - `FileAllocationStore`: JSON file, written atomically on every save
//! - `MemoryAllocationStore`: in-process table for tests and ephemeral runs

mod file;
mod memory;

pub use file::FileAllocationStore;
pub use memory::MemoryAllocationStore;
