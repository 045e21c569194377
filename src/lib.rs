//! A Redis-backed distributed job queue: producers post jobs, workers
//! claim and dispatch them to registered handlers, and a reaper rescues
//! jobs that stall mid-processing.

pub mod codec;
pub mod config;
pub mod error;
pub mod http;
pub mod job;
pub mod queue;
pub mod reaper;
pub mod store;
pub mod worker;

pub use error::{MlqError, Result};
pub use job::{JobProgress, JobRecord, Namespace};
pub use queue::Mlq;
pub use reaper::Reaper;
pub use worker::{Handler, HandlerFailure, HandlerFn, HandlerFuture, HandlerOutcome, Utils};
