//! Backend executors.
//!
//! Both store roles implement [`traits::RecordBackend`]; the coordinator only
//! ever sees the trait, so tests and embedded deployments can swap in
//! [`memory::InMemoryStore`] for either role.

pub mod traits;
pub mod pool;
pub mod memory;
pub mod redis;
pub mod sql;
