// Task store backends for the workq claiming core
//
// Two implementations of workq_core::TaskStore:
// - PostgresTaskStore: production backend, row-locked claim transaction
// - InMemoryTaskStore: tests and single-process deployments
//
// Both delegate the actual claim rule to Task::apply_claim so they cannot
// drift apart.

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
