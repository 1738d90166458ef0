//! Connection pool monitoring utilities
//!
//! Instrumented transactions that log how long a pooled connection was
//! waited for and held, for diagnosing pool saturation and writer contention.

use doccat_common::Result;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::time::Instant;

/// Transaction wrapper that logs acquisition and release timing
pub struct MonitoredTransaction<'c> {
    tx: Transaction<'c, Sqlite>,
    timer: HoldTimer,
}

/// Tracks how long a connection is held; logs on drop if never released
struct HoldTimer {
    caller: &'static str,
    acquired_at: Instant,
    released: bool,
}

impl HoldTimer {
    fn release(&mut self, how: &'static str) {
        self.released = true;
        let held_ms = self.acquired_at.elapsed().as_millis();
        if held_ms > 2000 {
            tracing::warn!(
                caller = self.caller,
                held_ms,
                how,
                "LONG TRANSACTION - connection held for extended period"
            );
        } else if held_ms > 1000 {
            tracing::info!(
                caller = self.caller,
                held_ms,
                how,
                "Transaction held longer than expected (>1s)"
            );
        } else {
            tracing::debug!(caller = self.caller, held_ms, how, "Connection released");
        }
    }
}

impl Drop for HoldTimer {
    fn drop(&mut self) {
        if !self.released {
            let held_ms = self.acquired_at.elapsed().as_millis();
            if held_ms > 2000 {
                tracing::warn!(
                    caller = self.caller,
                    held_ms,
                    "LONG TRANSACTION DROPPED - rolled back via drop (error path?)"
                );
            } else {
                tracing::debug!(caller = self.caller, held_ms, "Connection released (drop)");
            }
        }
    }
}

impl<'c> MonitoredTransaction<'c> {
    /// Commit the transaction and log release timing
    pub async fn commit(self) -> Result<()> {
        let MonitoredTransaction { tx, mut timer } = self;
        tx.commit().await?;
        timer.release("commit");
        Ok(())
    }

    /// Rollback the transaction and log release timing
    pub async fn rollback(self) -> Result<()> {
        let MonitoredTransaction { tx, mut timer } = self;
        tx.rollback().await?;
        timer.release("rollback");
        Ok(())
    }

    /// Connection to run statements on inside the transaction
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }
}

/// Begin a monitored transaction with connection pool timing logs
///
/// ```ignore
/// let mut tx = begin_monitored(&pool, "validation::merge_clusters").await?;
/// sqlx::query("...").execute(tx.conn()).await?;
/// tx.commit().await?;
/// ```
pub async fn begin_monitored<'c>(
    pool: &'c sqlx::SqlitePool,
    caller: &'static str,
) -> Result<MonitoredTransaction<'c>> {
    let start = Instant::now();

    tracing::debug!(caller, "Connection acquisition requested");

    let tx = pool.begin().await?;

    let wait_ms = start.elapsed().as_millis();
    if wait_ms > 1000 {
        tracing::warn!(
            caller,
            wait_ms,
            "SLOW CONNECTION ACQUISITION - pool may be saturated"
        );
    } else if wait_ms > 500 {
        tracing::info!(
            caller,
            wait_ms,
            "Connection acquisition slower than expected (>500ms)"
        );
    } else {
        tracing::debug!(caller, wait_ms, "Connection acquired");
    }

    Ok(MonitoredTransaction {
        tx,
        timer: HoldTimer {
            caller,
            acquired_at: Instant::now(),
            released: false,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_persists_and_drop_rolls_back() {
        let pool = doccat_common::db::open_memory_pool().await.unwrap();
        sqlx::query("CREATE TABLE t (v INTEGER)").execute(&pool).await.unwrap();

        let mut tx = begin_monitored(&pool, "test::commit").await.unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (1)").execute(tx.conn()).await.unwrap();
        tx.commit().await.unwrap();

        {
            let mut tx = begin_monitored(&pool, "test::drop").await.unwrap();
            sqlx::query("INSERT INTO t (v) VALUES (2)").execute(tx.conn()).await.unwrap();
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
