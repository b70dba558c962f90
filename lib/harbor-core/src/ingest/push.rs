//! Push ingestion.
//!
//! In push mode there is no broker: each inbound request is its own message, and acknowledging it means responding to
//! it. Instead of returning as soon as the request is parsed and submitted, the request waits for its delivery outcome,
//! so downstream latency and failures show up directly in the response the sender sees. Senders retry on failure
//! responses, which takes the place of broker redelivery.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use harbor_error::{generic_error, ErrorClass, GenericError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    stage::{DecodeParseStage, StageError, StageOutcome},
    telemetry::IngestMetrics,
    RedeliveryMode,
};
use crate::{
    admission::{AdmissionController, AdmissionError},
    message::{Acknowledge, MessageContent},
    registry::{Registered, SubmitFailed, TrackingEntry, TrackingRegistry},
    report::ErrorReporter,
    tracking::SinkTracker,
};

/// Completion signal for a pending push request.
///
/// Stored in the tracking registry in place of a broker message. Dropping the signal without resolving it, as happens
/// when outstanding work is abandoned at shutdown, is observed by the waiting request as [`PushResponse::Abandoned`].
#[derive(Debug)]
pub struct CompletionSignal {
    tx: oneshot::Sender<bool>,
}

#[async_trait]
impl Acknowledge for CompletionSignal {
    async fn ack(self) -> Result<(), GenericError> {
        // The request may have been cancelled by the client in the meantime, which isn't an error.
        let _ = self.tx.send(true);
        Ok(())
    }

    async fn nack(self) -> Result<(), GenericError> {
        let _ = self.tx.send(false);
        Ok(())
    }
}

/// Outcome of a push request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PushResponse {
    /// The metrics were durably written.
    Delivered,

    /// The payload was valid but contained no metrics.
    Empty,

    /// The payload exceeded the maximum message length.
    TooLarge,

    /// The payload could not be decoded or parsed.
    Malformed,

    /// No admission slot became available in time, the write path is unavailable, or ingestion is shutting down.
    Unavailable,

    /// The write path failed to deliver the metrics.
    Failed,

    /// Ingestion shut down before the delivery outcome was known.
    Abandoned,
}

impl PushResponse {
    /// Returns `true` if the sender should retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Failed | Self::Abandoned)
    }
}

pub(super) struct PushIngesterInner {
    pub stage: DecodeParseStage,
    pub admission: AdmissionController,
    pub registry: Arc<TrackingRegistry<CompletionSignal>>,
    pub tracker: Arc<dyn SinkTracker>,
    pub mode: RedeliveryMode,
    pub reporter: ErrorReporter,
    pub metrics: IngestMetrics,
    pub intake: CancellationToken,
    pub request_timeout: Duration,
}

/// Ingests pushed payloads, holding each request open until its delivery outcome is known.
///
/// Cheaply cloneable: every request handler can hold its own copy.
#[derive(Clone)]
pub struct PushIngester {
    inner: Arc<PushIngesterInner>,
}

impl PushIngester {
    pub(super) fn new(inner: PushIngesterInner) -> Self {
        Self { inner: Arc::new(inner) }
    }

    /// Returns `true` if new requests are being accepted.
    pub fn is_accepting(&self) -> bool {
        !self.inner.intake.is_cancelled()
    }

    /// Returns the maximum message length, if one is set.
    pub fn max_message_len(&self) -> Option<usize> {
        self.inner.stage.max_message_len()
    }

    /// Ingests a single pushed payload, waiting until its delivery outcome is known.
    ///
    /// The payload is decoded and parsed before an admission slot is requested, so oversized or malformed payloads
    /// never occupy a slot.
    pub async fn ingest<M>(&self, request: &M) -> PushResponse
    where
        M: MessageContent + ?Sized,
    {
        let inner = &self.inner;
        if inner.intake.is_cancelled() {
            inner.metrics.rejected_unavailable.increment(1);
            return PushResponse::Unavailable;
        }

        inner.metrics.received.increment(1);
        let group = match inner.stage.process(request).await {
            Ok(StageOutcome::Group(group)) => group,
            Ok(StageOutcome::Empty) => {
                inner.metrics.dropped_empty.increment(1);
                return PushResponse::Empty;
            }
            Err(e) => {
                inner.metrics.dropped_for(&e).increment(1);
                let response = match e {
                    StageError::PayloadTooLarge { .. } => PushResponse::TooLarge,
                    StageError::Decode { .. } | StageError::Parse { .. } => PushResponse::Malformed,
                };
                inner.reporter.report(ErrorClass::Permanent, None, e.into());
                return response;
            }
        };

        let permit = match inner.admission.acquire_timeout(&inner.intake, inner.request_timeout).await {
            Ok(permit) => permit,
            Err(e) => {
                inner.metrics.rejected_unavailable.increment(1);
                match e {
                    AdmissionError::Cancelled => debug!("Rejecting push request during shutdown."),
                    AdmissionError::TimedOut { .. } => {
                        inner.reporter.report(ErrorClass::Transient, None, e.into());
                    }
                }
                return PushResponse::Unavailable;
            }
        };

        let (tx, rx) = oneshot::channel();
        let backup = matches!(inner.mode, RedeliveryMode::AckAndResubmit).then(|| group.clone());
        let entry = TrackingEntry::new(CompletionSignal { tx }, permit).with_backup(backup);

        match inner.registry.register(entry, inner.tracker.submit(group)).await {
            Ok(Registered { id, displaced }) => {
                inner.metrics.submitted.increment(1);
                debug!(tracking_id = %id, "Waiting for delivery of pushed metric group.");
                if displaced.is_some() {
                    inner.reporter.report(
                        ErrorClass::Internal,
                        None,
                        generic_error!("Sink tracker reused tracking ID {}. Displaced entry abandoned.", id),
                    );
                }
            }
            Err(SubmitFailed { error, entry }) => {
                drop(entry);
                inner.metrics.dropped_submit_failed.increment(1);
                inner.reporter.report(
                    ErrorClass::Transient,
                    None,
                    error.context("Failed to submit pushed metric group."),
                );
                return PushResponse::Unavailable;
            }
        }

        match rx.await {
            Ok(true) => PushResponse::Delivered,
            Ok(false) => PushResponse::Failed,
            Err(_) => PushResponse::Abandoned,
        }
    }
}
