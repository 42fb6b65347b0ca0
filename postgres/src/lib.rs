//! # Silverback Postgres
//!
//! `PostgreSQL` implementations of the Silverback durable-store traits:
//!
//! - [`PostgresOutboxStore`]: the transactional outbox table
//! - [`PostgresAdvisoryLock`] / [`PostgresLeaseLock`]: distributed locks
//!   coordinating outbox workers
//! - [`PostgresOffsetStore`]: the stored-offset loader for static
//!   partition assignment
//!
//! All types wrap a shared [`sqlx::PgPool`]. Schema creation helpers
//! (`ensure_schema`) are provided for bootstrap convenience; production
//! deployments typically own their migrations.

mod lock;
mod offset_store;
mod outbox_store;

pub use lock::{PostgresAdvisoryLock, PostgresLeaseLock};
pub use offset_store::PostgresOffsetStore;
pub use outbox_store::{PostgresOutboxStore, PostgresOutboxTransaction};
