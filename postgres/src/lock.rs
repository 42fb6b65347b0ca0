//! Distributed locks on `PostgreSQL`.
//!
//! Two implementations of the core [`DistributedLock`] trait:
//!
//! - [`PostgresAdvisoryLock`]: `pg_try_advisory_lock` on a dedicated
//!   connection. The lock dies with the session, so a crashed holder frees
//!   it automatically.
//! - [`PostgresLeaseLock`]: a `locks` table with an expiry column. Works
//!   on any `PostgreSQL`-compatible backend that lacks advisory locks; a
//!   crashed holder is taken over once its lease expires.

use async_trait::async_trait;
use silverback_core::outbox::{DistributedLock, LockError};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Row, pool::PoolConnection, Postgres};
use std::time::Duration;
use tokio::sync::Mutex;

/// Map a lock name onto the 64-bit advisory lock keyspace (FNV-1a).
fn advisory_key(name: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in name.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    #[allow(clippy::cast_possible_wrap)]
    {
        hash as i64
    }
}

/// Session-scoped advisory lock.
///
/// While held, a dedicated pool connection is pinned: advisory locks
/// belong to the session, and a recycled connection would silently drop
/// the lock.
pub struct PostgresAdvisoryLock {
    pool: PgPool,
    held: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PostgresAdvisoryLock {
    /// Create a lock over the given pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(None),
        }
    }
}

#[async_trait]
impl DistributedLock for PostgresAdvisoryLock {
    async fn try_acquire(&self, name: &str, _holder: &str) -> Result<bool, LockError> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            // This instance already holds the session lock.
            return Ok(true);
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(advisory_key(name))
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn release(&self, name: &str, _holder: &str) -> Result<(), LockError> {
        let mut held = self.held.lock().await;
        if let Some(mut conn) = held.take() {
            sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(advisory_key(name))
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| LockError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

/// Table-based lease lock.
///
/// Table layout:
///
/// ```sql
/// locks (
///     name       text primary key,
///     holder     text not null,
///     expires_at timestamptz not null
/// )
/// ```
pub struct PostgresLeaseLock {
    pool: PgPool,
    ttl: Duration,
}

impl PostgresLeaseLock {
    /// Default lease duration.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

    /// Create a lease lock with the default TTL.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Override the lease duration. Must comfortably exceed the worker's
    /// tick interval so a live holder renews before expiring.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Create the `locks` table when it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Backend`] when the DDL fails.
    pub async fn ensure_schema(&self) -> Result<(), LockError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS locks (
                name       TEXT PRIMARY KEY,
                holder     TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DistributedLock for PostgresLeaseLock {
    async fn try_acquire(&self, name: &str, holder: &str) -> Result<bool, LockError> {
        #[allow(clippy::cast_possible_wrap)]
        let ttl_seconds = self.ttl.as_secs() as i64;
        // Insert, renew our own lease, or take over an expired one.
        let row: Option<PgRow> = sqlx::query(
            r"
            INSERT INTO locks (name, holder, expires_at)
            VALUES ($1, $2, now() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    expires_at = EXCLUDED.expires_at
                WHERE locks.holder = EXCLUDED.holder
                   OR locks.expires_at < now()
            RETURNING holder
            ",
        )
        .bind(name)
        .bind(holder)
        .bind(ttl_seconds)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(row.is_some_and(|r| r.get::<String, _>("holder") == holder))
    }

    async fn release(&self, name: &str, holder: &str) -> Result<(), LockError> {
        sqlx::query("DELETE FROM locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_stable_and_distinct() {
        assert_eq!(advisory_key("outbox"), advisory_key("outbox"));
        assert_ne!(advisory_key("outbox"), advisory_key("outbox-2"));
    }
}
