//! Tracking registry.
//!
//! The registry maps the [`TrackingId`] of each outstanding submission back to the payload that must be acknowledged
//! once the submission's delivery outcome is known, along with the admission slot the submission holds.

use std::{
    collections::HashMap,
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
};

use harbor_error::GenericError;
use metrics::Gauge;
use tokio::sync::Mutex;

use crate::{admission::AdmissionPermit, data_model::MetricGroup, tracking::TrackingId};

/// An outstanding submission.
///
/// Entries own their admission permit, so the slot is released when the entry is dropped. An entry that is resubmitted
/// moves its permit into the new registration, keeping the slot held across the retry.
#[derive(Debug)]
pub struct TrackingEntry<P> {
    payload: Option<P>,
    backup: Option<MetricGroup>,
    _permit: AdmissionPermit,
    attempts: u32,
}

impl<P> TrackingEntry<P> {
    /// Creates a new `TrackingEntry` for the given payload, holding the given admission slot.
    pub fn new(payload: P, permit: AdmissionPermit) -> Self {
        Self {
            payload: Some(payload),
            backup: None,
            _permit: permit,
            attempts: 1,
        }
    }

    /// Retains a copy of the submitted group, for resubmission if delivery fails.
    pub fn with_backup(mut self, backup: Option<MetricGroup>) -> Self {
        self.backup = backup;
        self
    }

    /// Takes the payload out of the entry, if it has not already been taken.
    ///
    /// Once the payload of a resubmitted entry has been acknowledged, the entry carries only the backup.
    pub fn take_payload(&mut self) -> Option<P> {
        self.payload.take()
    }

    /// Returns the retained copy of the submitted group, if any.
    pub fn backup(&self) -> Option<&MetricGroup> {
        self.backup.as_ref()
    }

    /// Returns how many times the group has been submitted.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Records another submission attempt.
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }
}

/// A successful registration.
#[derive(Debug)]
pub struct Registered<P> {
    /// Identifier issued by the sink tracker.
    pub id: TrackingId,

    /// An entry that was already registered under the same identifier.
    ///
    /// Sink trackers must never reuse identifiers, so this is only ever set when that invariant is broken. The caller
    /// owns the displaced entry and decides how to resolve it.
    pub displaced: Option<TrackingEntry<P>>,
}

/// A failed registration.
///
/// Submission failed, so nothing was registered and no outcome will be reported. The entry is handed back to the caller
/// to resolve.
#[derive(Debug)]
pub struct SubmitFailed<P> {
    /// Error returned by the sink tracker.
    pub error: GenericError,

    /// The entry that was to be registered.
    pub entry: TrackingEntry<P>,
}

/// Concurrency-safe map of outstanding submissions.
///
/// The map is guarded by a single asynchronous lock. Submission happens while the lock is held, so a delivery outcome
/// that races ahead of submission returning still finds the entry registered: the delivery listener cannot look the
/// identifier up until the entry is in place. A submission that blocks therefore blocks outcome resolution too, which
/// is why [`SinkTracker::submit`][crate::tracking::SinkTracker::submit] must not wait on outcomes being resolved.
///
/// Entries are always handed out by value, and admission slots are released outside of the lock when the caller drops
/// them.
pub struct TrackingRegistry<P> {
    entries: Mutex<HashMap<TrackingId, TrackingEntry<P>>>,
    len: AtomicUsize,
    undelivered: Gauge,
}

impl<P> TrackingRegistry<P> {
    /// Creates a new, empty `TrackingRegistry`.
    ///
    /// `undelivered` is kept up to date with the number of outstanding entries.
    pub fn new(undelivered: Gauge) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            len: AtomicUsize::new(0),
            undelivered,
        }
    }

    /// Submits a group via `submit`, registering `entry` under the issued identifier.
    ///
    /// # Errors
    ///
    /// If submission fails, the entry is returned to the caller along with the error.
    pub async fn register<F>(&self, entry: TrackingEntry<P>, submit: F) -> Result<Registered<P>, SubmitFailed<P>>
    where
        F: Future<Output = Result<TrackingId, GenericError>>,
    {
        let mut entries = self.entries.lock().await;
        match submit.await {
            Ok(id) => {
                let displaced = entries.insert(id, entry);
                self.publish_len(entries.len());
                Ok(Registered { id, displaced })
            }
            Err(error) => Err(SubmitFailed { error, entry }),
        }
    }

    /// Removes the entry registered under `id`.
    ///
    /// Returns `None` if no such entry exists, such as when an outcome is reported twice for the same identifier.
    pub async fn remove(&self, id: TrackingId) -> Option<TrackingEntry<P>> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&id);
        if entry.is_some() {
            self.publish_len(entries.len());
        }
        entry
    }

    /// Removes all entries, returning them for the caller to abandon.
    pub async fn drain(&self) -> Vec<(TrackingId, TrackingEntry<P>)> {
        let mut entries = self.entries.lock().await;
        let drained = entries.drain().collect();
        self.publish_len(0);
        drained
    }

    /// Returns the number of outstanding entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Returns `true` if there are no outstanding entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish_len(&self, len: usize) {
        self.len.store(len, Ordering::Relaxed);
        self.undelivered.set(len as f64);
    }
}
