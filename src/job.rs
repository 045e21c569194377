//! The job record and the namespaced key schema it lives under.

use serde::{Deserialize, Serialize};

/// A single job as it is written to and read from the store.
///
/// Field names match the wire encoding exactly (see [`crate::codec`]) so
/// records stay interoperable with any other implementation reading the
/// same namespace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub timestamp: f64,
    pub worker: Option<String>,
    pub processing_started: Option<f64>,
    pub processing_finished: Option<f64>,
    /// `None` = queued, `Some(0)` = started, `Some(1..=99)` = progressing,
    /// `Some(100)` = completed, `Some(-1)` = failed.
    pub progress: Option<i64>,
    pub short_result: Option<String>,
    pub result: Option<serde_json::Value>,
    pub callback: Option<String>,
    pub retries: u64,
    /// Handler names to invoke, or `None` meaning "all registered handlers".
    pub functions: Option<Vec<String>>,
    /// The producer-supplied payload. Opaque to the engine.
    pub msg: serde_json::Value,
}

impl JobRecord {
    /// True once `progress` has reached a terminal state (100 or -1). The
    /// reaper must never touch a terminal job.
    pub fn is_terminal(&self) -> bool {
        matches!(self.progress, Some(100) | Some(-1))
    }
}

/// A human/control-surface friendly projection of [`JobRecord::progress`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobProgress {
    Queued,
    Started,
    Progressing(u8),
    Completed,
    Failed,
}

impl From<Option<i64>> for JobProgress {
    fn from(p: Option<i64>) -> Self {
        match p {
            None => JobProgress::Queued,
            Some(0) => JobProgress::Started,
            Some(100) => JobProgress::Completed,
            Some(-1) => JobProgress::Failed,
            Some(n) => JobProgress::Progressing(n.clamp(1, 99) as u8),
        }
    }
}

impl std::fmt::Display for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobProgress::Queued => write!(f, "queued"),
            JobProgress::Started => write!(f, "started"),
            JobProgress::Progressing(p) => write!(f, "{p}"),
            JobProgress::Completed => write!(f, "completed"),
            JobProgress::Failed => write!(f, "failed"),
        }
    }
}

/// The namespaced key schema. Centralizes the `{namespace}_{suffix}` string
/// formatting used throughout the queue into one place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(n: impl Into<String>) -> Self {
        Self(n.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The pending list: jobs awaiting claim.
    pub fn pending(&self) -> String {
        self.0.clone()
    }

    /// The processing list: jobs currently claimed by some worker.
    pub fn processing(&self) -> String {
        format!("{}_processing", self.0)
    }

    /// The references list: the reaper's scan index.
    pub fn jobsrefs(&self) -> String {
        format!("{}_jobsrefs", self.0)
    }

    /// The dead-letter list.
    pub fn deadletter(&self) -> String {
        format!("{}_deadletter", self.0)
    }

    /// The per-job progress key.
    pub fn progress_key(&self, id: &str) -> String {
        format!("{}_progress_{id}", self.0)
    }

    /// The monotonic id counter key.
    pub fn max_id_key(&self) -> String {
        format!("{}_max_id", self.0)
    }

    /// The pub/sub channel a completed job's short result is published on.
    pub fn pub_channel(id: &str) -> String {
        format!("pub_{id}")
    }

    /// Namespaced ancillary-data key for `store_data`/`fetch_data`. Keys are
    /// namespaced under `N` rather than a bare UUID to avoid cross-namespace
    /// collisions in the store's flat key space.
    pub fn data_key(&self, id: &str) -> String {
        format!("{}_data_{id}", self.0)
    }
}
