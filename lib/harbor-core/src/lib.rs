//! Core primitives for bounded, acknowledgment-tracked ingestion.
#![deny(warnings)]
#![deny(missing_docs)]

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument as _;

pub mod admission;
pub mod backoff;
pub mod data_model;
pub mod ingest;
pub mod lifecycle;
pub mod message;
pub mod registry;
pub mod report;
pub mod source;
pub mod tracking;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// This function is a thin wrapper over [`tokio::spawn`], and provides implicit "tracing" for spawned futures by
/// ensuring that the task is attached to the current `tracing` span.
pub fn spawn_traced<F, R>(f: F) -> JoinHandle<R>
where
    F: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    tokio::spawn(f.in_current_span())
}
