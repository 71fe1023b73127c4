//! Database backend implementations

pub mod memory;

pub use memory::{MemoryDatabase, TransactionStyle};
