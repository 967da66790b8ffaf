//! Cache and store clients: the traits the engine consumes plus the bundled
//! Redis, SQL and in-memory implementations.

pub mod traits;
pub mod memory;
pub mod redis;
pub mod sql;
