//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`HistoryStore`] trait for instance and history persistence
//! - [`InMemoryHistoryStore`] for testing and embedding
//! - [`PostgresHistoryStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;
pub use store::{
    DueTimer, EventStream, HistoryStore, InstanceInfo, InstanceLease, InstanceStatus, NewInstance, StoreError,
};
