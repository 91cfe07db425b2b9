//! Retry helper for SQLite lock contention.
//!
//! Several worker processes writing one SQLite file will occasionally see
//! `SQLITE_BUSY` / `SQLITE_LOCKED` even with a busy timeout configured.
//! Those are retried with capped exponential backoff and jitter; every
//! other error is returned immediately.

use crate::error::QueueError;
use rand::random;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

const BUSY_MAX_RETRIES: u32 = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

pub(crate) fn is_busy(err: &QueueError) -> bool {
    let QueueError::Database(sqlx_err) = err else {
        return false;
    };
    let msg = match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
                return true;
            }
            db_err.message().to_ascii_lowercase()
        }
        other => other.to_string().to_ascii_lowercase(),
    };
    msg.contains("database is locked") || msg.contains("database is busy")
}

fn backoff(attempt: u32) -> Duration {
    let exp = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

pub(crate) async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T, QueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = backoff(attempt);
                debug!(
                    "Database busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    BUSY_MAX_RETRIES
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_capped() {
        for attempt in 0..30 {
            assert!(backoff(attempt) <= Duration::from_millis(BUSY_MAX_DELAY_MS));
        }
        assert!(backoff(0) >= Duration::from_millis(BUSY_BASE_DELAY_MS));
    }

    #[test]
    fn only_lock_errors_are_busy() {
        assert!(!is_busy(&QueueError::InvalidStatus("x".into())));
        assert!(!is_busy(&QueueError::Database(sqlx::Error::RowNotFound)));
        assert!(is_busy(&QueueError::Database(sqlx::Error::Protocol(
            "database is locked".into()
        ))));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let out = retry_on_busy("test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(QueueError::Database(sqlx::Error::Protocol(
                        "database is busy".into(),
                    )))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn other_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let err = retry_on_busy("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(QueueError::InvalidStatus("paused".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, QueueError::InvalidStatus(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
