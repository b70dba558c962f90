//! Delivery listener.

use std::sync::Arc;

use harbor_error::{generic_error, ErrorClass};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{telemetry::IngestMetrics, RedeliveryMode};
use crate::{
    message::Acknowledge,
    registry::{Registered, SubmitFailed, TrackingRegistry},
    report::ErrorReporter,
    tracking::{DeliveryOutcome, SinkTracker},
};

/// Resolves delivery outcomes back to the tracked payloads.
pub(super) struct DeliveryListener<P> {
    registry: Arc<TrackingRegistry<P>>,
    tracker: Arc<dyn SinkTracker>,
    outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
    mode: RedeliveryMode,
    reporter: ErrorReporter,
    metrics: IngestMetrics,
}

impl<P: Acknowledge> DeliveryListener<P> {
    pub fn new(
        registry: Arc<TrackingRegistry<P>>, tracker: Arc<dyn SinkTracker>,
        outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>, mode: RedeliveryMode, reporter: ErrorReporter,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            registry,
            tracker,
            outcomes,
            mode,
            reporter,
            metrics,
        }
    }

    pub async fn run(mut self, drain: CancellationToken) {
        debug!("Delivery listener started.");

        loop {
            select! {
                biased;

                _ = drain.cancelled() => break,
                maybe_outcome = self.outcomes.recv() => match maybe_outcome {
                    Some(outcome) => self.resolve(outcome).await,
                    None => {
                        debug!("Delivery outcome channel closed.");
                        break;
                    }
                },
            }
        }

        debug!("Delivery listener stopped.");
    }

    async fn resolve(&self, outcome: DeliveryOutcome) {
        // The entry, and with it the admission slot, is dropped once the outcome is fully handled. Resubmission is the
        // exception: the entry moves into the new registration and keeps its slot.
        let Some(mut entry) = self.registry.remove(outcome.id).await else {
            self.reporter.report(
                ErrorClass::Internal,
                None,
                generic_error!(
                    "Received delivery outcome for unknown tracking ID {}. Ignoring.",
                    outcome.id
                ),
            );
            return;
        };

        trace!(
            tracking_id = %outcome.id,
            delivered = outcome.delivered,
            attempts = entry.attempts(),
            "Resolving delivery outcome."
        );

        if outcome.delivered {
            self.metrics.delivered.increment(1);
            if let Some(payload) = entry.take_payload() {
                ack(payload, &self.reporter).await;
            }
            return;
        }

        self.metrics.failed.increment(1);
        match self.mode {
            RedeliveryMode::AckAndDrop => {
                self.reporter.report(
                    ErrorClass::Delivery,
                    None,
                    generic_error!(
                        "Metric group with tracking ID {} was not delivered. Releasing message for redelivery.",
                        outcome.id
                    ),
                );
                if let Some(payload) = entry.take_payload() {
                    nack(payload, &self.reporter).await;
                }
            }
            RedeliveryMode::AckAndResubmit => {
                // The broker has moved past the message regardless, so acknowledge it and retry from the backup.
                if let Some(payload) = entry.take_payload() {
                    ack(payload, &self.reporter).await;
                }

                let Some(backup) = entry.backup().cloned() else {
                    self.reporter.report(
                        ErrorClass::Internal,
                        None,
                        generic_error!(
                            "No backup retained for undelivered tracking ID {}. Metric group is lost.",
                            outcome.id
                        ),
                    );
                    return;
                };

                self.reporter.report(
                    ErrorClass::Delivery,
                    None,
                    generic_error!(
                        "Metric group with tracking ID {} was not delivered (attempt {}). Resubmitting.",
                        outcome.id,
                        entry.attempts()
                    ),
                );

                entry.record_attempt();
                match self.registry.register(entry, self.tracker.submit(backup)).await {
                    Ok(Registered { id, displaced }) => {
                        self.metrics.resubmitted.increment(1);
                        trace!(previous_tracking_id = %outcome.id, tracking_id = %id, "Resubmitted metric group.");
                        if displaced.is_some() {
                            self.reporter.report(
                                ErrorClass::Internal,
                                None,
                                generic_error!("Sink tracker reused tracking ID {}. Displaced entry abandoned.", id),
                            );
                        }
                    }
                    Err(SubmitFailed { error, entry }) => {
                        // The original message is already acknowledged, so there is nothing left to redeliver from.
                        drop(entry);
                        self.reporter.report(
                            ErrorClass::Internal,
                            None,
                            error.context(format!(
                                "Failed to resubmit metric group with tracking ID {}. Metric group is lost.",
                                outcome.id
                            )),
                        );
                    }
                }
            }
        }
    }
}

pub(super) async fn ack<P: Acknowledge>(payload: P, reporter: &ErrorReporter) {
    if let Err(e) = payload.ack().await {
        reporter.report(ErrorClass::Transient, None, e.context("Failed to acknowledge message."));
    }
}

pub(super) async fn nack<P: Acknowledge>(payload: P, reporter: &ErrorReporter) {
    if let Err(e) = payload.nack().await {
        reporter.report(
            ErrorClass::Transient,
            None,
            e.context("Failed to negatively acknowledge message."),
        );
    }
}
