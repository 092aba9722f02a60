//! Storage contract (C2) and its reference implementations.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    Pagination, RunFilter, RunPage, ScheduledWake, StorageContract, StoreError, WakeKind,
};
