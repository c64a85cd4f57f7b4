//! Database module for SQLite persistence.

mod pool;
mod records;

pub use pool::*;
pub use records::*;
