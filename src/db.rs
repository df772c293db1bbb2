//! SQLite connection setup and the retrying unit-of-work executor.
//!
//! Every component reaches the database through [`Db::run_query`] or
//! [`Db::run_transaction`]. Both re-invoke the caller's closure on
//! transient failures (see [`StorageError::is_transient`]) with exponential
//! backoff, and pass every other error through untouched.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{Config, DbConfig};
use crate::error::{StorageError, StorageResult};

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(config.db.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Current time as Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DbConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Wait before attempt `attempt + 1`: `base * 2^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(10))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }
}

/// Pool handle plus retry policy. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    pool: SqlitePool,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Db {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub async fn open(config: &Config) -> Result<Self> {
        let pool = connect(config).await?;
        Ok(Self::new(pool, RetryPolicy::from_config(&config.db)))
    }

    /// A handle whose backoff waits abort when `cancel` fires.
    ///
    /// Attempts already in flight are not interrupted; only the wait
    /// between attempts is.
    pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
        Self {
            pool: self.pool.clone(),
            policy: self.policy,
            cancel,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run a single statement (or a few independent ones) with retry.
    ///
    /// `f` receives a pool handle and is called once per attempt.
    pub async fn run_query<T, F, Fut>(&self, mut f: F) -> StorageResult<T>
    where
        F: FnMut(SqlitePool) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f(self.pool.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => self.back_off(attempt, err).await?,
            }
            attempt += 1;
        }
    }

    /// Run `f` inside a transaction with retry.
    ///
    /// The transaction commits only when `f` returns `Ok`. Any error, a
    /// panic inside `f`, or dropping the returned future drops the
    /// `sqlx::Transaction`, which rolls it back. `f` must own whatever it
    /// captures in the returned future, since it is re-invoked per attempt.
    pub async fn run_transaction<T, F>(&self, mut f: F) -> StorageResult<T>
    where
        F: for<'t> FnMut(&'t mut SqliteConnection) -> BoxFuture<'t, StorageResult<T>>,
    {
        let mut attempt = 1;
        loop {
            let result = async {
                let mut tx = self.pool.begin().await?;
                let value = f(&mut *tx).await?;
                tx.commit().await?;
                Ok::<T, StorageError>(value)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) => self.back_off(attempt, err).await?,
            }
            attempt += 1;
        }
    }

    /// `Ok(())` means "try again"; otherwise the error to surface.
    async fn back_off(&self, attempt: u32, err: StorageError) -> StorageResult<()> {
        if !err.is_transient() || attempt >= self.policy.max_attempts {
            return Err(err);
        }
        let delay = self.policy.delay_after(attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient storage error, retrying");
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StorageError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn memory_db(max_attempts: u32) -> Db {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        Db::new(
            pool,
            RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_transient_error_retried_until_success() {
        let db = memory_db(3).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = db
            .run_query(move |_pool| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(StorageError::Database(sqlx::Error::PoolTimedOut))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let db = memory_db(3).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = db
            .run_query(move |_pool| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StorageError::Database(sqlx::Error::PoolTimedOut))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Database(sqlx::Error::PoolTimedOut)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let db = memory_db(3).await;
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = db
            .run_query(move |_pool| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(StorageError::not_found("repository", 9))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = memory_db(3).await;
        let result: StorageResult<()> = db
            .run_transaction(|conn| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO t (id, v) VALUES (1, 1)")
                        .execute(&mut *conn)
                        .await?;
                    Err(StorageError::InvalidInput("abort".into()))
                })
            })
            .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_transaction_commits_and_returns_value() {
        let db = memory_db(3).await;
        let id: i64 = db
            .run_transaction(|conn| {
                Box::pin(async move {
                    let id: i64 =
                        sqlx::query_scalar("INSERT INTO t (v) VALUES (42) RETURNING id")
                            .fetch_one(&mut *conn)
                            .await?;
                    Ok(id)
                })
            })
            .await
            .unwrap();
        let v: i64 = sqlx::query_scalar("SELECT v FROM t WHERE id = ?")
            .bind(id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(v, 42);
    }

    #[tokio::test]
    async fn test_cancel_aborts_backoff() {
        let db = memory_db(10).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = db
            .with_cancel(cancel)
            .run_query(|_pool| async {
                Err::<(), _>(StorageError::Database(sqlx::Error::PoolTimedOut))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
    }
}
