use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result};
use crate::models::{CanonicalEvent, JobState, QueuedJob};
use crate::retry::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    /// A live job with this id already exists; nothing was written.
    Duplicate(JobState),
    /// The previous job had failed terminally and was reset with a fresh budget.
    Requeued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { attempts: u32, retry_in: Duration },
    Terminal { attempts: u32 },
}

/// The durable queue. All dedup, attempt counting and lease handling lives here.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert_if_absent(
        &self,
        event: &CanonicalEvent,
        max_attempts: u32,
    ) -> Result<InsertOutcome>;

    /// Lease the next runnable job, moving it to `active`.
    async fn dequeue_lease(&self) -> Result<Option<QueuedJob>>;

    async fn ack(&self, id: &str) -> Result<()>;

    /// Record a failed attempt; reschedules or marks the job terminal.
    async fn fail(&self, id: &str, reason: &str) -> Result<FailOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// How long a leased job may stay `active` before it is handed out again.
    pub lease: Duration,
    pub retry_backoff: Backoff,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            retry_backoff: Backoff::default(),
        }
    }
}

pub struct SqliteQueueStore {
    conn: Mutex<Connection>,
    config: StoreConfig,
}

/// Open or create the SQLite queue at `path`.
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(include_str!("../sql/schema.sql"))?;
    Ok(())
}

impl SqliteQueueStore {
    pub fn open(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        Ok(Self::with_connection(open_db(path)?, config))
    }

    pub fn open_in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self::with_connection(conn, config))
    }

    fn with_connection(conn: Connection, config: StoreConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            config,
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // open transactions roll back on drop, so a poisoned connection is still consistent
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedJob>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, payload, state, attempts, max_attempts, last_error FROM jobs WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()?;
        row.map(into_job).transpose()
    }

    /// Jobs ordered by id, optionally restricted to one state.
    pub fn list(&self, state: Option<JobState>) -> Result<Vec<QueuedJob>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, payload, state, attempts, max_attempts, last_error FROM jobs
             WHERE ?1 IS NULL OR state = ?1
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![state.map(|s| s.as_str())], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(into_job).collect()
    }

    /// Number of jobs per state, every state included.
    pub fn counts(&self) -> Result<Vec<(JobState, u64)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM jobs WHERE state = ?1")?;
        JobState::ALL
            .iter()
            .map(|state| {
                let n: i64 = stmt.query_row(params![state.as_str()], |r| r.get(0))?;
                Ok((*state, n as u64))
            })
            .collect()
    }

    /// Delete succeeded jobs last touched more than `older_than` ago.
    ///
    /// The row is the only dedup record for its identity, so a pruned
    /// transfer that is fetched again becomes a new job.
    pub fn prune_finished(&self, older_than: Duration) -> Result<usize> {
        let cutoff = now_ms() - older_than.as_millis() as i64;
        let deleted = self.conn().execute(
            "DELETE FROM jobs WHERE state = 'succeeded' AND updated_at <= ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn insert_if_absent(
        &self,
        event: &CanonicalEvent,
        max_attempts: u32,
    ) -> Result<InsertOutcome> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self.conn();
        insert_job(&mut conn, &event.identity, &payload, max_attempts, now_ms())
    }

    async fn dequeue_lease(&self) -> Result<Option<QueuedJob>> {
        let lease_ms = self.config.lease.as_millis() as i64;
        let mut conn = self.conn();
        lease_next(&mut conn, now_ms(), lease_ms)
    }

    async fn ack(&self, id: &str) -> Result<()> {
        let updated = self.conn().execute(
            "UPDATE jobs SET state = 'succeeded', lease_expires_at = NULL, last_error = NULL, updated_at = ?2
             WHERE id = ?1 AND state = 'active'",
            params![id, now_ms()],
        )?;
        if updated == 0 {
            return Err(Error::JobNotActive(id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, id: &str, reason: &str) -> Result<FailOutcome> {
        let mut conn = self.conn();
        record_failure(&mut conn, id, reason, &self.config.retry_backoff, now_ms())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

type JobRow = (String, String, String, i64, i64, Option<String>);

fn read_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

fn into_job((id, payload, state, attempts, max_attempts, last_error): JobRow) -> Result<QueuedJob> {
    Ok(QueuedJob {
        id,
        payload: serde_json::from_str(&payload)?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        state: state.parse()?,
        last_error,
    })
}

fn insert_job(
    conn: &mut Connection,
    id: &str,
    payload: &str,
    max_attempts: u32,
    now: i64,
) -> Result<InsertOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let existing: Option<String> = tx
        .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |r| r.get(0))
        .optional()?;

    let outcome = match existing.as_deref().map(str::parse::<JobState>).transpose()? {
        None => {
            tx.execute(
                "INSERT INTO jobs (id, payload, state, attempts, max_attempts, run_at, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?4)",
                params![id, payload, max_attempts, now],
            )?;
            InsertOutcome::Created
        }
        Some(JobState::Failed) => {
            tx.execute(
                "UPDATE jobs SET payload = ?2, state = 'pending', attempts = 0, max_attempts = ?3,
                    run_at = ?4, lease_expires_at = NULL, last_error = NULL, updated_at = ?4
                 WHERE id = ?1",
                params![id, payload, max_attempts, now],
            )?;
            InsertOutcome::Requeued
        }
        Some(state) => InsertOutcome::Duplicate(state),
    };

    tx.commit()?;
    Ok(outcome)
}

fn lease_next(conn: &mut Connection, now: i64, lease_ms: i64) -> Result<Option<QueuedJob>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let reclaimed = tx.execute(
        "UPDATE jobs SET state = 'pending', lease_expires_at = NULL, updated_at = ?1
         WHERE state = 'active' AND lease_expires_at <= ?1",
        params![now],
    )?;
    if reclaimed > 0 {
        warn!("requeued {} job(s) whose lease expired", reclaimed);
    }

    let row = tx
        .query_row(
            "SELECT id, payload, state, attempts, max_attempts, last_error FROM jobs
             WHERE state = 'pending' AND run_at <= ?1
             ORDER BY run_at, created_at
             LIMIT 1",
            params![now],
            read_row,
        )
        .optional()?;

    let Some(row) = row else {
        tx.commit()?;
        return Ok(None);
    };

    tx.execute(
        "UPDATE jobs SET state = 'active', lease_expires_at = ?2, updated_at = ?3 WHERE id = ?1",
        params![row.0, now + lease_ms, now],
    )?;
    tx.commit()?;

    let mut job = into_job(row)?;
    job.state = JobState::Active;
    debug!("leased job {} (attempts so far: {})", job.id, job.attempts);
    Ok(Some(job))
}

fn record_failure(
    conn: &mut Connection,
    id: &str,
    reason: &str,
    backoff: &Backoff,
    now: i64,
) -> Result<FailOutcome> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row: Option<(i64, i64)> = tx
        .query_row(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ?1 AND state = 'active'",
            params![id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let (attempts, max_attempts) = row.ok_or_else(|| Error::JobNotActive(id.to_string()))?;
    let attempts = attempts as u32 + 1;

    let outcome = if attempts >= max_attempts as u32 {
        tx.execute(
            "UPDATE jobs SET state = 'failed', attempts = ?2, last_error = ?3,
                lease_expires_at = NULL, updated_at = ?4
             WHERE id = ?1",
            params![id, attempts, reason, now],
        )?;
        FailOutcome::Terminal { attempts }
    } else {
        let retry_in = backoff.delay(attempts);
        tx.execute(
            "UPDATE jobs SET state = 'pending', attempts = ?2, last_error = ?3, run_at = ?4,
                lease_expires_at = NULL, updated_at = ?5
             WHERE id = ?1",
            params![id, attempts, reason, now + retry_in.as_millis() as i64, now],
        )?;
        FailOutcome::Retrying { attempts, retry_in }
    };

    tx.commit()?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    fn event(hash: &str) -> CanonicalEvent {
        CanonicalEvent {
            identity: hash.to_string(),
            from: "0xaa".to_string(),
            to: "0xbb".to_string(),
            token_id: U256::from(1u64),
        }
    }

    fn store() -> SqliteQueueStore {
        SqliteQueueStore::open_in_memory(StoreConfig {
            lease: Duration::from_secs(30),
            retry_backoff: Backoff::immediate(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn duplicate_insert_is_a_no_op() {
        let store = store();
        assert_eq!(store.insert_if_absent(&event("0x1"), 7).await.unwrap(), InsertOutcome::Created);
        assert_eq!(
            store.insert_if_absent(&event("0x1"), 7).await.unwrap(),
            InsertOutcome::Duplicate(JobState::Pending)
        );
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lease_ack_cycle() {
        let store = store();
        store.insert_if_absent(&event("0x1"), 7).await.unwrap();

        let job = store.dequeue_lease().await.unwrap().unwrap();
        assert_eq!(job.id, "0x1");
        assert_eq!(job.state, JobState::Active);
        assert!(store.dequeue_lease().await.unwrap().is_none());

        assert_eq!(
            store.insert_if_absent(&event("0x1"), 7).await.unwrap(),
            InsertOutcome::Duplicate(JobState::Active)
        );

        store.ack("0x1").await.unwrap();
        assert_eq!(store.get("0x1").unwrap().unwrap().state, JobState::Succeeded);
        assert_eq!(
            store.insert_if_absent(&event("0x1"), 7).await.unwrap(),
            InsertOutcome::Duplicate(JobState::Succeeded)
        );
        assert!(store.dequeue_lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_requires_a_lease() {
        let store = store();
        store.insert_if_absent(&event("0x1"), 7).await.unwrap();
        assert!(matches!(store.ack("0x1").await, Err(Error::JobNotActive(_))));
        assert!(matches!(store.fail("0x9", "x").await, Err(Error::JobNotActive(_))));
    }

    #[tokio::test]
    async fn failures_reschedule_then_go_terminal() {
        let store = store();
        store.insert_if_absent(&event("0x1"), 3).await.unwrap();

        for expected in 1..3 {
            store.dequeue_lease().await.unwrap().unwrap();
            match store.fail("0x1", "boom").await.unwrap() {
                FailOutcome::Retrying { attempts, .. } => assert_eq!(attempts, expected),
                other => panic!("unexpected {:?}", other),
            }
        }

        store.dequeue_lease().await.unwrap().unwrap();
        assert_eq!(
            store.fail("0x1", "boom").await.unwrap(),
            FailOutcome::Terminal { attempts: 3 }
        );

        let job = store.get("0x1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(store.dequeue_lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_job_is_revived_with_fresh_budget() {
        let store = store();
        store.insert_if_absent(&event("0x1"), 1).await.unwrap();
        store.dequeue_lease().await.unwrap().unwrap();
        store.fail("0x1", "boom").await.unwrap();

        assert_eq!(store.insert_if_absent(&event("0x1"), 7).await.unwrap(), InsertOutcome::Requeued);
        let job = store.get("0x1").unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 7);
        assert_eq!(job.last_error, None);
    }

    #[tokio::test]
    async fn backoff_delays_the_retry() {
        let store = SqliteQueueStore::open_in_memory(StoreConfig {
            lease: Duration::from_secs(30),
            retry_backoff: Backoff {
                initial: Duration::from_secs(3600),
                max: Duration::from_secs(3600),
                multiplier: 2.0,
            },
        })
        .unwrap();
        store.insert_if_absent(&event("0x1"), 7).await.unwrap();
        store.dequeue_lease().await.unwrap().unwrap();
        store.fail("0x1", "boom").await.unwrap();

        assert_eq!(store.get("0x1").unwrap().unwrap().state, JobState::Pending);
        assert!(store.dequeue_lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_handed_out_again() {
        let store = SqliteQueueStore::open_in_memory(StoreConfig {
            lease: Duration::ZERO,
            retry_backoff: Backoff::immediate(),
        })
        .unwrap();
        store.insert_if_absent(&event("0x1"), 7).await.unwrap();

        let first = store.dequeue_lease().await.unwrap().unwrap();
        let second = store.dequeue_lease().await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 0);
    }

    #[tokio::test]
    async fn counts_and_prune() {
        let store = store();
        for hash in ["0x1", "0x2", "0x3"] {
            store.insert_if_absent(&event(hash), 7).await.unwrap();
        }
        let job = store.dequeue_lease().await.unwrap().unwrap();
        store.ack(&job.id).await.unwrap();

        let counts = store.counts().unwrap();
        assert!(counts.contains(&(JobState::Pending, 2)));
        assert!(counts.contains(&(JobState::Succeeded, 1)));
        assert!(counts.contains(&(JobState::Failed, 0)));

        assert_eq!(store.prune_finished(Duration::ZERO).unwrap(), 1);
        assert_eq!(store.list(Some(JobState::Succeeded)).unwrap().len(), 0);
        assert_eq!(store.list(Some(JobState::Pending)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn succeeded_job_stays_deduplicated_until_pruned() {
        let store = store();
        store.insert_if_absent(&event("0x1"), 7).await.unwrap();
        let job = store.dequeue_lease().await.unwrap().unwrap();
        store.ack(&job.id).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                store.insert_if_absent(&event("0x1"), 7).await.unwrap(),
                InsertOutcome::Duplicate(JobState::Succeeded)
            );
        }
        assert!(store.dequeue_lease().await.unwrap().is_none());
    }

    #[test]
    fn file_backed_store_persists_jobs() {
        let path = std::env::temp_dir().join(format!("transfer-reconciler-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);

        {
            let store = SqliteQueueStore::open(&path, StoreConfig::default()).unwrap();
            let mut conn = store.conn();
            insert_job(&mut conn, "0xabc", &serde_json::to_string(&event("0xabc")).unwrap(), 7, now_ms())
                .unwrap();
        }

        let reopened = SqliteQueueStore::open(&path, StoreConfig::default()).unwrap();
        let job = reopened.get("0xabc").unwrap().unwrap();
        assert_eq!(job.payload, event("0xabc"));
        assert_eq!(job.state, JobState::Pending);

        drop(reopened);
        let _ = std::fs::remove_file(&path);
    }
}
