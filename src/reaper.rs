//! The reaper: periodic rescue of jobs that stall in a worker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};

use crate::codec;
use crate::error::Result;
use crate::job::Namespace;
use crate::queue::now_epoch_seconds;
use crate::store::{Store, Transaction};

const BATCH_SIZE: isize = 5;

/// Scans `N_jobsrefs` in strict batches of [`BATCH_SIZE`], rescuing any job
/// whose processing has exceeded `job_timeout` while still owned by a
/// worker, and stops scanning at the first batch that needed no rescue.
///
/// Earlier reapers in this lineage advanced their scan offset by 5 but read
/// ranges of 5 *starting* at that offset, producing an irregular, overlapping
/// traversal. This reaper scans disjoint batches instead, preserving the
/// intent (bounded work per tick, but catch clusters of timeouts) without
/// the overlap.
pub struct Reaper {
    namespace: Namespace,
    store: Arc<dyn Store>,
    call_how_often: Duration,
    job_timeout: Duration,
    max_retries: u64,
}

impl Reaper {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn Store>, call_how_often: Duration, job_timeout: Duration, max_retries: u64) -> Self {
        Self {
            namespace: Namespace::new(namespace),
            store,
            call_how_often,
            job_timeout,
            max_retries,
        }
    }

    /// Runs forever, scanning once per `call_how_often`.
    pub async fn run(self) {
        loop {
            tokio::time::sleep(self.call_how_often).await;
            if let Err(error) = self.scan_once().await {
                warn!(%error, "reaper scan failed, will retry next tick");
            }
        }
    }

    /// Runs exactly one scan pass, for tests and for callers wanting manual
    /// control over timing.
    pub async fn scan_once(&self) -> Result<()> {
        let mut offset: isize = 0;

        loop {
            let ids = self.store.range(&self.namespace.jobsrefs(), offset, offset + BATCH_SIZE - 1).await?;
            if ids.is_empty() {
                return Ok(());
            }

            let mut all_ok = true;
            for id_bytes in &ids {
                let id = String::from_utf8_lossy(id_bytes).into_owned();
                if !self.check_one(&id).await? {
                    all_ok = false;
                }
            }

            if all_ok {
                return Ok(());
            }
            offset += BATCH_SIZE;
        }
    }

    /// Checks and, if necessary, rescues a single job. Returns `true` if
    /// the job was healthy (no action taken).
    async fn check_one(&self, id: &str) -> Result<bool> {
        let progress_key = self.namespace.progress_key(id);
        let Some(bytes) = self.store.get(&progress_key).await? else {
            warn!(job_id = %id, "found orphan reference");
            self.store.exec(Transaction::new().remove(self.namespace.jobsrefs(), 1, Bytes::from(id.to_string().into_bytes()))).await?;
            return Ok(false);
        };

        let mut record = match codec::decode(&bytes, &progress_key) {
            Ok(r) => r,
            Err(error) => {
                warn!(job_id = %id, %error, "skipping corrupt record");
                return Ok(true);
            },
        };

        if record.is_terminal() {
            return Ok(true);
        }

        let Some(started) = record.processing_started else {
            return Ok(true);
        };
        if record.worker.is_none() {
            return Ok(true);
        }

        let elapsed = now_epoch_seconds() - started;
        if elapsed <= self.job_timeout.as_secs_f64() {
            return Ok(true);
        }

        warn!(job_id = %id, worker = ?record.worker, timeout = ?self.job_timeout, "rescuing stuck job");

        let original_blob = codec::encode(&record)?;

        record.worker = None;
        record.processing_started = None;
        record.progress = None;
        record.timestamp = now_epoch_seconds();
        record.retries += 1;

        let mut txn = Transaction::new().remove(self.namespace.processing(), -1, original_blob);

        if record.retries >= self.max_retries {
            info!(job_id = %id, retries = record.retries, "exhausted retries, dead-lettering");
            txn = txn.push_right(self.namespace.deadletter(), Bytes::from(msg_bytes(&record.msg)));
        } else {
            let new_blob = codec::encode(&record)?;
            txn = txn.set(progress_key, new_blob.clone(), None).push_left(self.namespace.pending(), new_blob);
        }

        txn = txn
            .remove(self.namespace.jobsrefs(), 1, Bytes::from(id.to_string().into_bytes()))
            .push_right(self.namespace.jobsrefs(), Bytes::from(id.to_string().into_bytes()));

        self.store.exec(txn).await?;

        Ok(false)
    }
}

/// Pushes the dead-lettered `msg` field as its raw string bytes when it's a
/// JSON string (the common case), or as JSON text otherwise.
fn msg_bytes(v: &serde_json::Value) -> Vec<u8> {
    match v {
        serde_json::Value::String(s) => s.clone().into_bytes(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::job::JobRecord;
    use crate::store::fake::FakeStore;

    fn stuck_job(id: &str, started_secs_ago: f64) -> JobRecord {
        JobRecord {
            id: id.to_string(),
            timestamp: now_epoch_seconds() - started_secs_ago,
            worker: Some("worker-a".into()),
            processing_started: Some(now_epoch_seconds() - started_secs_ago),
            processing_finished: None,
            progress: Some(0),
            short_result: None,
            result: None,
            callback: None,
            retries: 0,
            functions: None,
            msg: serde_json::Value::String("payload".into()),
        }
    }

    async fn seed(store: &FakeStore, ns: &Namespace, record: &JobRecord) {
        let blob = codec::encode(record).unwrap();
        store.set(&ns.progress_key(&record.id), blob.clone(), None).await.unwrap();
        store.push_right(&ns.jobsrefs(), Bytes::from(record.id.clone().into_bytes())).await.unwrap();
        store.push_right(&ns.processing(), blob).await.unwrap();
    }

    #[tokio::test]
    async fn rescues_a_stuck_job_and_requeues_it() {
        let store = FakeStore::new();
        let ns = Namespace::new("ns");
        let job = stuck_job("1", 100.0);
        seed(&store, &ns, &job).await;

        let store_dyn: Arc<dyn Store> = Arc::new(store.clone());
        let reaper = Reaper::new("ns", store_dyn, Duration::from_secs(1), Duration::from_secs(5), 5);
        reaper.scan_once().await.unwrap();

        let blob = store.get(&ns.progress_key("1")).await.unwrap().unwrap();
        let rescued = codec::decode(&blob, "k").unwrap();
        assert_eq!(rescued.retries, 1);
        assert_eq!(rescued.worker, None);
        assert_eq!(rescued.progress, None);

        assert_eq!(store.len(&ns.pending()).await.unwrap(), 1);
        assert_eq!(store.len(&ns.processing()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_goes_to_dead_letter() {
        let store = FakeStore::new();
        let ns = Namespace::new("ns");
        let mut job = stuck_job("2", 100.0);
        job.retries = 1;
        seed(&store, &ns, &job).await;

        let store_dyn: Arc<dyn Store> = Arc::new(store.clone());
        let reaper = Reaper::new("ns", store_dyn, Duration::from_secs(1), Duration::from_secs(5), 2);
        reaper.scan_once().await.unwrap();

        assert_eq!(store.len(&ns.deadletter()).await.unwrap(), 1);
        assert_eq!(store.len(&ns.pending()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn healthy_job_is_left_alone() {
        let store = FakeStore::new();
        let ns = Namespace::new("ns");
        let job = stuck_job("3", 1.0);
        seed(&store, &ns, &job).await;

        let store_dyn: Arc<dyn Store> = Arc::new(store.clone());
        let reaper = Reaper::new("ns", store_dyn, Duration::from_secs(1), Duration::from_secs(30), 5);
        reaper.scan_once().await.unwrap();

        assert_eq!(store.len(&ns.pending()).await.unwrap(), 0);
        assert_eq!(store.len(&ns.jobsrefs()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn orphan_reference_is_removed() {
        let store = FakeStore::new();
        let ns = Namespace::new("ns");
        store.push_right(&ns.jobsrefs(), Bytes::from_static(b"999")).await.unwrap();

        let store_dyn: Arc<dyn Store> = Arc::new(store.clone());
        let reaper = Reaper::new("ns", store_dyn, Duration::from_secs(1), Duration::from_secs(5), 5);
        reaper.scan_once().await.unwrap();

        assert_eq!(store.len(&ns.jobsrefs()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_jobs_are_never_touched() {
        let store = FakeStore::new();
        let ns = Namespace::new("ns");
        let mut job = stuck_job("4", 1000.0);
        job.progress = Some(100);
        seed(&store, &ns, &job).await;

        let store_dyn: Arc<dyn Store> = Arc::new(store.clone());
        let reaper = Reaper::new("ns", store_dyn, Duration::from_secs(1), Duration::from_secs(5), 5);
        reaper.scan_once().await.unwrap();

        let blob = store.get(&ns.progress_key("4")).await.unwrap().unwrap();
        let record = codec::decode(&blob, "k").unwrap();
        assert_eq!(record.retries, 0);
        assert_eq!(record.progress, Some(100));
    }
}
