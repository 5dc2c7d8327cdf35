//! Wire protocol implementations.

pub mod mysql;
