//! The worker (listener): handler registry, claim loop, and the
//! handler-facing utility context.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::{MlqError, Result};
use crate::job::{JobRecord, Namespace};
use crate::queue::{now_epoch_seconds, Mlq};
use crate::store::Transaction;

/// What a handler returned: either a single value that becomes both
/// `short_result` and `result`, or an explicit `(short_result, result)`
/// pair.
#[derive(Clone, Debug)]
pub enum HandlerOutcome {
    Single(Value),
    Pair(String, Value),
}

/// A handler's description of why it failed. The `Display` text becomes
/// the job's `result` field.
#[derive(Clone, Debug)]
pub struct HandlerFailure(pub String);

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerFailure {}

pub type HandlerFuture = BoxFuture<'static, std::result::Result<HandlerOutcome, HandlerFailure>>;
pub type HandlerFn = Arc<dyn Fn(Value, Utils) -> HandlerFuture + Send + Sync>;

/// A registered handler: a name used for `functions` filtering plus the
/// callable itself.
#[derive(Clone)]
pub struct Handler {
    pub name: String,
    pub func: HandlerFn,
}

/// The per-invocation context passed to a handler. Never held across
/// invocations — a fresh `Utils` is built for each job/handler dispatch, so
/// there is no shared mutable state for handlers to race on beyond what the
/// store itself serializes.
#[derive(Clone)]
pub struct Utils {
    mlq: Mlq,
    job_id: String,
    /// The full decoded job record as it stood when this handler was
    /// invoked (worker id, timestamps, retries, etc.).
    pub full_message: JobRecord,
}

impl Utils {
    /// Reads the current progress record, overwrites `progress`, and writes
    /// it back. Races with the reaper: whichever write lands last wins,
    /// which is the accepted at-least-once behavior for this engine.
    pub async fn update_progress(&self, p: i64) -> Result<()> {
        let key = self.mlq.namespace.progress_key(&self.job_id);
        let current = self
            .mlq
            .store
            .get(&key)
            .await?
            .ok_or_else(|| MlqError::NotFound(self.job_id.clone()))?;
        let mut record = codec::decode(&current, &key)?;
        record.progress = Some(p);
        let encoded = codec::encode(&record)?;
        self.mlq.store.set(&key, encoded, None).await
    }

    /// Writes `data` under a namespaced key (a caller-supplied `key` or a
    /// freshly generated id) with an optional TTL, and returns the full key
    /// so it can be passed back to [`Utils::fetch_data`].
    pub async fn store_data(&self, data: Bytes, key: Option<String>, ttl: Option<Duration>) -> Result<String> {
        let id = key.unwrap_or_else(|| Uuid::new_v4().to_string());
        let full_key = self.mlq.namespace.data_key(&id);
        self.mlq.store.set(&full_key, data, ttl.map(|d| d.as_secs())).await?;
        Ok(full_key)
    }

    /// Reads back a key returned by [`Utils::store_data`], or `None` if
    /// absent or expired.
    pub async fn fetch_data(&self, key: &str) -> Result<Option<Bytes>> {
        self.mlq.store.get(key).await
    }

    /// Posts a new job from within a handler. Equivalent to [`Mlq::post`].
    pub async fn post(&self, msg: Value, callback: Option<String>, functions: Option<Vec<String>>) -> Result<String> {
        self.mlq.post(msg, callback, functions).await
    }

    /// Subscribes to `pub_<id>` and blocks until the next message on that
    /// channel arrives, returning its payload.
    ///
    /// This subscribes only after being called, so if the awaited job
    /// completes between when it was posted and when this runs, the
    /// publication is missed and this call blocks forever. Callers that
    /// cannot guarantee subscribe-before-post ordering should use
    /// [`Utils::poll_progress_fallback`] instead. Handlers must not await
    /// an id whose completion depends on this same worker: the claim loop
    /// is blocked here and cannot process the job it is waiting on.
    pub async fn block_until_result(&self, id: &str) -> Result<Bytes> {
        let channel = Namespace::pub_channel(id);
        let mut sub = self.mlq.store.subscribe(&channel).await?;
        sub.recv().await.ok_or_else(|| MlqError::NotFound(id.to_string()))
    }

    /// A durable alternative to [`Utils::block_until_result`]: polls the
    /// progress key for `id` until it reaches a terminal state, rather than
    /// relying on a pub/sub message that might already have been missed.
    pub async fn poll_progress_fallback(&self, id: &str, interval: Duration) -> Result<JobRecord> {
        loop {
            if let Some(record) = self.mlq.progress(id).await? {
                if record.is_terminal() {
                    return Ok(record);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }
}

impl Mlq {
    /// Registers `func` under `name`. Re-registering the same name replaces
    /// the existing handler rather than duplicating it. The first call also
    /// starts the claim loop; later calls only extend the registry.
    pub async fn create_listener(&self, name: impl Into<String>, func: HandlerFn) {
        let name = name.into();
        {
            let mut handlers = self.handlers.lock().await;
            if let Some(existing) = handlers.iter_mut().find(|h| h.name == name) {
                existing.func = func;
            } else {
                handlers.push(Handler { name: name.clone(), func });
            }
        }

        if !self.claim_loop_started.swap(true, Ordering::SeqCst) {
            info!(worker = %self.worker_id, "starting claim loop");
            let mlq = self.clone();
            tokio::spawn(async move { mlq.claim_loop().await });
        }
    }

    /// Registers `func` under `name` in the catalog of handlers this
    /// process knows how to run, without activating it. Called at startup
    /// for every handler the binary links in; the control surface then
    /// activates/deactivates by name.
    pub async fn register_available(&self, name: impl Into<String>, func: HandlerFn) {
        self.catalog.lock().await.insert(name.into(), func);
    }

    /// Activates a catalog entry as a live listener. Returns `false` if no
    /// handler with that name was registered via [`Mlq::register_available`].
    pub async fn activate_listener(&self, name: &str) -> bool {
        let func = self.catalog.lock().await.get(name).cloned();
        match func {
            Some(func) => {
                self.create_listener(name.to_string(), func).await;
                true
            },
            None => false,
        }
    }

    /// Removes the first handler named `name`. Returns whether one was
    /// found.
    pub async fn remove_listener(&self, name: &str) -> bool {
        let mut handlers = self.handlers.lock().await;
        let before = handlers.len();
        if let Some(pos) = handlers.iter().position(|h| h.name == name) {
            handlers.remove(pos);
        }
        handlers.len() != before
    }

    async fn claim_loop(self) {
        loop {
            let claimed = match self
                .store
                .blocking_pop_right_push_left(&self.namespace.pending(), &self.namespace.processing())
                .await
            {
                Ok(bytes) => bytes,
                Err(error) => {
                    error!(%error, "claim failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                },
            };

            if let Err(error) = self.process_claimed(claimed).await {
                error!(%error, "failed to process claimed job");
            }
        }
    }

    #[instrument(skip_all, fields(worker = %self.worker_id))]
    async fn process_claimed(&self, original: Bytes) -> Result<()> {
        let mut record = codec::decode(&original, "claimed job")?;
        let job_id = record.id.clone();

        record.worker = Some(self.worker_id.clone());
        record.processing_started = Some(now_epoch_seconds());
        record.progress = Some(0);
        self.store
            .set(&self.namespace.progress_key(&job_id), codec::encode(&record)?, None)
            .await?;

        let handlers = self.handlers.lock().await.clone();

        let mut failure: Option<HandlerFailure> = None;
        let mut outcome: Option<HandlerOutcome> = None;

        for handler in &handlers {
            let should_run = record
                .functions
                .as_ref()
                .map_or(true, |names| names.iter().any(|n| n == &handler.name));
            if !should_run {
                continue;
            }

            let utils = Utils {
                mlq: self.clone(),
                job_id: job_id.clone(),
                full_message: record.clone(),
            };

            match (handler.func)(record.msg.clone(), utils).await {
                Ok(o) => outcome = Some(o),
                Err(e) => {
                    failure = Some(e);
                    break;
                },
            }
        }

        match failure {
            Some(failure) => self.finalize_failed(&mut record, &original, failure).await,
            None => self.finalize_succeeded(&mut record, &original, outcome).await,
        }
    }

    async fn finalize_failed(&self, record: &mut JobRecord, original: &Bytes, failure: HandlerFailure) -> Result<()> {
        warn!(job_id = %record.id, error = %failure, "moving job to dead letter");

        record.progress = Some(-1);
        record.result = Some(Value::String(failure.0.clone()));
        self.store
            .set(&self.namespace.progress_key(&record.id), codec::encode(record)?, None)
            .await?;
        self.store.push_right(&self.namespace.deadletter(), original.clone()).await?;

        if let Some(callback) = record.callback.clone() {
            self.fire_callback(&callback, false, &record.id, None).await;
        }

        self.cleanup(&record.id, original).await
    }

    async fn finalize_succeeded(&self, record: &mut JobRecord, original: &Bytes, outcome: Option<HandlerOutcome>) -> Result<()> {
        let (short_result, result) = match outcome {
            Some(HandlerOutcome::Pair(short, result)) => (Some(short), Some(result)),
            Some(HandlerOutcome::Single(value)) => (value_to_short_result(&value), Some(value)),
            None => (None, None),
        };

        record.worker = None;
        record.progress = Some(100);
        record.processing_finished = Some(now_epoch_seconds());
        record.short_result = short_result.clone();
        record.result = result;

        self.store
            .set(&self.namespace.progress_key(&record.id), codec::encode(record)?, None)
            .await?;

        info!(job_id = %record.id, "completed job");
        let published = short_result.clone().unwrap_or_default();
        self.store
            .publish(&Namespace::pub_channel(&record.id), Bytes::from(published.into_bytes()))
            .await?;

        if let Some(callback) = record.callback.clone() {
            self.fire_callback(&callback, true, &record.id, short_result.as_deref()).await;
        }

        self.cleanup(&record.id, original).await
    }

    async fn fire_callback(&self, url: &str, success: bool, job_id: &str, short_result: Option<&str>) {
        let query = [
            ("success", if success { "1" } else { "0" }.to_string()),
            ("job_id", job_id.to_string()),
            ("short_result", short_result.unwrap_or_default().to_string()),
        ];

        if let Err(error) = self.http.get(url).query(&query).send().await {
            warn!(%error, job_id, "callback delivery failed, ignoring");
        }
    }

    /// Best-effort removal of the finalized job from the processing list
    /// and the reaper's reference list. A no-op if the reaper already
    /// rescued and rewrote the record.
    async fn cleanup(&self, job_id: &str, original: &Bytes) -> Result<()> {
        let txn = Transaction::new()
            .remove(self.namespace.processing(), -1, original.clone())
            .remove(self.namespace.jobsrefs(), 1, Bytes::from(job_id.to_string().into_bytes()));

        if let Err(error) = self.store.exec(txn).await {
            warn!(%error, job_id, "cleanup after finalize failed");
        }

        Ok(())
    }
}

/// Derives a `short_result` from a non-pair handler return value: strings
/// pass through verbatim, everything else (including null) falls back to
/// its JSON text or `None`.
fn value_to_short_result(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::fake::FakeStore;
    use crate::store::Store;

    fn handler(name: &str, f: impl Fn(Value, Utils) -> HandlerFuture + Send + Sync + 'static) -> HandlerFn {
        let _ = name;
        Arc::new(f)
    }

    #[tokio::test]
    async fn happy_path_completes_job() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let mlq = Mlq::new("ns", store.clone());

        mlq.create_listener(
            "uppercase",
            handler("uppercase", |msg, _utils| {
                Box::pin(async move {
                    let s = msg.as_str().unwrap_or_default().to_uppercase();
                    Ok(HandlerOutcome::Single(Value::String(s)))
                })
            }),
        )
        .await;

        let mut sub = store.subscribe("pub_1").await.unwrap();

        let id = mlq.post(Value::String("hello".into()), None, None).await.unwrap();
        assert_eq!(id, "1");

        let published = sub.recv().await.unwrap();
        assert_eq!(published, Bytes::from_static(b"HELLO"));

        let record = mlq.progress(&id).await.unwrap().unwrap();
        assert_eq!(record.progress, Some(100));
        assert_eq!(record.short_result.as_deref(), Some("HELLO"));
        assert_eq!(record.result, Some(Value::String("HELLO".into())));
        assert_eq!(record.worker, None);

        assert_eq!(store.len("ns_jobsrefs").await.unwrap(), 0);
        assert_eq!(store.len("ns_processing").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn tuple_return_splits_short_and_long_result() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let mlq = Mlq::new("ns", store.clone());

        mlq.create_listener(
            "pairish",
            handler("pairish", |_msg, _utils| {
                Box::pin(async move {
                    Ok(HandlerOutcome::Pair("ok".into(), serde_json::json!({"big": "payload"})))
                })
            }),
        )
        .await;

        let id = mlq.post(Value::Null, None, None).await.unwrap();
        // Give the claim loop a moment to run.
        for _ in 0..200 {
            if let Some(r) = mlq.progress(&id).await.unwrap() {
                if r.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let record = mlq.progress(&id).await.unwrap().unwrap();
        assert_eq!(record.short_result.as_deref(), Some("ok"));
        assert_eq!(record.result, Some(serde_json::json!({"big": "payload"})));
    }

    #[tokio::test]
    async fn handler_failure_goes_to_dead_letter() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let mlq = Mlq::new("ns", store.clone());

        mlq.create_listener(
            "boom",
            handler("boom", |_msg, _utils| Box::pin(async move { Err(HandlerFailure("kaboom".into())) })),
        )
        .await;

        let id = mlq.post(Value::Null, None, None).await.unwrap();
        for _ in 0..200 {
            if let Some(r) = mlq.progress(&id).await.unwrap() {
                if r.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let record = mlq.progress(&id).await.unwrap().unwrap();
        assert_eq!(record.progress, Some(-1));
        assert_eq!(store.len("ns_deadletter").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn functions_filter_selects_handler() {
        let store: Arc<dyn Store> = Arc::new(FakeStore::new());
        let mlq = Mlq::new("ns", store.clone());

        let ran_h1 = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_h2 = Arc::new(std::sync::atomic::AtomicBool::new(false));

        {
            let flag = ran_h1.clone();
            mlq.create_listener(
                "h1",
                Arc::new(move |_msg, _utils| {
                    let flag = flag.clone();
                    Box::pin(async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(HandlerOutcome::Single(Value::Null))
                    })
                }),
            )
            .await;
        }
        {
            let flag = ran_h2.clone();
            mlq.create_listener(
                "h2",
                Arc::new(move |_msg, _utils| {
                    let flag = flag.clone();
                    Box::pin(async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok(HandlerOutcome::Single(Value::Null))
                    })
                }),
            )
            .await;
        }

        let id = mlq.post(Value::Null, None, Some(vec!["h1".into()])).await.unwrap();
        for _ in 0..200 {
            if let Some(r) = mlq.progress(&id).await.unwrap() {
                if r.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(ran_h1.load(Ordering::SeqCst));
        assert!(!ran_h2.load(Ordering::SeqCst));
    }
}
