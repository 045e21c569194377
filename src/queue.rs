//! The queue handle (`Mlq`) and producer (`post`).

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::codec;
use crate::error::Result;
use crate::job::{JobRecord, Namespace};
use crate::store::{Store, Transaction};
use crate::worker::{Handler, HandlerFn};

/// Shared handle onto one namespace of the queue. Cloning is cheap: the
/// store handle, handler registry, and worker id are all held behind
/// `Arc`s, so producers, the claim loop, and the reaper can share one
/// long-lived instance.
#[derive(Clone)]
pub struct Mlq {
    pub(crate) namespace: Namespace,
    pub(crate) store: Arc<dyn Store>,
    /// Identifies this process as the claiming worker when it processes a
    /// job. Generated once at construction.
    pub(crate) worker_id: String,
    pub(crate) handlers: Arc<Mutex<Vec<Handler>>>,
    pub(crate) claim_loop_started: Arc<AtomicBool>,
    pub(crate) http: reqwest::Client,
    /// Handlers known to this process but not necessarily active, keyed by
    /// name. The control surface's consumer-registration endpoints
    /// activate/deactivate entries from this catalog rather than accepting
    /// arbitrary code over the wire.
    pub(crate) catalog: Arc<Mutex<HashMap<String, HandlerFn>>>,
}

impl Mlq {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn Store>) -> Self {
        Self {
            namespace: Namespace::new(namespace),
            store,
            worker_id: Uuid::new_v4().to_string(),
            handlers: Arc::new(Mutex::new(Vec::new())),
            claim_loop_started: Arc::new(AtomicBool::new(false)),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("building the callback HTTP client"),
            catalog: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Returns the underlying store handle, for constructing a [`crate::reaper::Reaper`]
    /// over the same namespace.
    pub fn store_handle(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Allocates an id, composes a job record, and atomically registers it
    /// on the pending list, the references list, and the progress key.
    pub async fn post(
        &self,
        msg: Value,
        callback: Option<String>,
        functions: Option<Vec<String>>,
    ) -> Result<String> {
        let id = self.store.incr(&self.namespace.max_id_key()).await?;
        let id = id.to_string();
        let timestamp = now_epoch_seconds();

        info!(job_id = %id, namespace = %self.namespace.as_str(), "posting job");

        let record = JobRecord {
            id: id.clone(),
            timestamp,
            worker: None,
            processing_started: None,
            processing_finished: None,
            progress: None,
            short_result: None,
            result: None,
            callback,
            retries: 0,
            functions,
            msg,
        };

        let encoded = codec::encode(&record)?;

        let txn = Transaction::new()
            .push_right(self.namespace.jobsrefs(), bytes::Bytes::from(id.clone().into_bytes()))
            .push_left(self.namespace.pending(), encoded.clone())
            .set(self.namespace.progress_key(&id), encoded, None);

        self.store.exec(txn).await?;

        Ok(id)
    }

    /// The length of the pending list.
    pub async fn job_count(&self) -> Result<i64> {
        self.store.len(&self.namespace.pending()).await
    }

    /// Reads and decodes the current progress record for `id`, if any.
    pub async fn progress(&self, id: &str) -> Result<Option<JobRecord>> {
        let key = self.namespace.progress_key(id);
        match self.store.get(&key).await? {
            Some(bytes) => Ok(Some(codec::decode(&bytes, &key)?)),
            None => Ok(None),
        }
    }

    /// Reads a raw (undecoded) value at `key`. Exposed for the HTTP layer's
    /// result endpoint, which applies its own decode-failure handling.
    pub async fn get_raw(&self, key: &str) -> Result<Option<bytes::Bytes>> {
        self.store.get(key).await
    }
}

pub(crate) fn now_epoch_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_secs_f64()
}
