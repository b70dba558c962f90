//! Delivery tracking between ingestion and the write path.
//!
//! A [`SinkTracker`] accepts metric groups for writing and issues a [`TrackingId`] for each submission. Once the write
//! path knows the fate of a group, it reports a [`DeliveryOutcome`] for that identifier, asynchronously and in no
//! particular order.
//!
//! [`channel`] provides a tracker that hands groups to a downstream consumer over a bounded channel, where each group
//! carries a [`DeliveryTicket`] that the consumer resolves once the group has been written (or has failed to be).

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use harbor_error::{generic_error, GenericError};
use tokio::sync::mpsc;
use tracing::trace;

use crate::data_model::MetricGroup;

/// Opaque identifier for a single submission to a sink tracker.
///
/// Identifiers are unique per submission: submitting the same group again yields a new identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TrackingId(u64);

impl TrackingId {
    /// Creates a `TrackingId` from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the identifier.
    pub const fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fate of a submitted metric group.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeliveryOutcome {
    /// Identifier issued when the group was submitted.
    pub id: TrackingId,

    /// Whether or not the group was durably written.
    ///
    /// `false` signals a write-path failure, never a parse failure.
    pub delivered: bool,
}

/// Accepts metric groups for writing and tracks their delivery.
#[async_trait]
pub trait SinkTracker: Send + Sync {
    /// Submits a metric group for writing, returning the identifier that its delivery outcome will be reported under.
    ///
    /// The outcome may be reported before this method returns.
    ///
    /// Outcomes are not resolved while a submission is pending, so an implementation that applies backpressure must be
    /// able to accept at least as many groups as can be outstanding at once (the ingester's
    /// `max_undelivered_messages`) without waiting on their outcomes. Otherwise a full write path stalls the release
    /// of admission slots behind the slowest submission.
    ///
    /// # Errors
    ///
    /// If the write path is unavailable, an error is returned and no outcome will ever be reported for the group.
    async fn submit(&self, group: MetricGroup) -> Result<TrackingId, GenericError>;
}

#[async_trait]
impl<T> SinkTracker for Arc<T>
where
    T: SinkTracker + ?Sized,
{
    async fn submit(&self, group: MetricGroup) -> Result<TrackingId, GenericError> {
        (**self).submit(group).await
    }
}

/// Creates a channel-backed sink tracker.
///
/// Returns the tracker itself, the receiver of submitted groups (bounded to `capacity`, so a slow consumer applies
/// backpressure to submission), and the receiver of delivery outcomes. Identifiers start at 1 and increase
/// monotonically across all clones of the tracker.
pub fn channel(
    capacity: usize,
) -> (
    TrackingSender,
    mpsc::Receiver<TrackedGroup>,
    mpsc::UnboundedReceiver<DeliveryOutcome>,
) {
    let (groups_tx, groups_rx) = mpsc::channel(capacity.max(1));
    let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

    let sender = TrackingSender {
        next_id: Arc::new(AtomicU64::new(1)),
        groups_tx,
        outcomes_tx,
    };

    (sender, groups_rx, outcomes_rx)
}

/// Sending half of a channel-backed sink tracker.
#[derive(Clone)]
pub struct TrackingSender {
    next_id: Arc<AtomicU64>,
    groups_tx: mpsc::Sender<TrackedGroup>,
    outcomes_tx: mpsc::UnboundedSender<DeliveryOutcome>,
}

#[async_trait]
impl SinkTracker for TrackingSender {
    async fn submit(&self, group: MetricGroup) -> Result<TrackingId, GenericError> {
        let id = TrackingId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tracked = TrackedGroup {
            group,
            ticket: DeliveryTicket {
                id,
                outcomes_tx: Some(self.outcomes_tx.clone()),
            },
        };

        // If the send fails, the ticket comes back to us inside the error and must not report an outcome for a group
        // that was never accepted.
        match self.groups_tx.send(tracked).await {
            Ok(()) => {
                trace!(tracking_id = %id, "Submitted metric group.");
                Ok(id)
            }
            Err(mpsc::error::SendError(tracked)) => {
                tracked.ticket.forget();
                Err(generic_error!("Write path is closed."))
            }
        }
    }
}

/// A metric group handed to the write path, along with the ticket used to report its delivery outcome.
#[derive(Debug)]
pub struct TrackedGroup {
    group: MetricGroup,
    ticket: DeliveryTicket,
}

impl TrackedGroup {
    /// Returns the tracking identifier of the group.
    pub fn id(&self) -> TrackingId {
        self.ticket.id
    }

    /// Returns a reference to the metric group.
    pub fn group(&self) -> &MetricGroup {
        &self.group
    }

    /// Consumes the tracked group, returning the metric group and its delivery ticket.
    pub fn into_parts(self) -> (MetricGroup, DeliveryTicket) {
        (self.group, self.ticket)
    }
}

/// A single-use handle for reporting the delivery outcome of a submitted group.
///
/// Exactly one outcome is reported per ticket. Resolving the ticket consumes it, and dropping an unresolved ticket
/// reports the group as failed.
#[derive(Debug)]
pub struct DeliveryTicket {
    id: TrackingId,
    outcomes_tx: Option<mpsc::UnboundedSender<DeliveryOutcome>>,
}

impl DeliveryTicket {
    /// Returns the tracking identifier of the group.
    pub fn id(&self) -> TrackingId {
        self.id
    }

    /// Reports the group as durably written.
    pub fn delivered(mut self) {
        self.report(true);
    }

    /// Reports the group as failed.
    pub fn failed(mut self) {
        self.report(false);
    }

    fn forget(mut self) {
        self.outcomes_tx = None;
    }

    fn report(&mut self, delivered: bool) {
        if let Some(outcomes_tx) = self.outcomes_tx.take() {
            // The receiving side going away means nobody is waiting on outcomes anymore.
            let _ = outcomes_tx.send(DeliveryOutcome { id: self.id, delivered });
        }
    }
}

impl Drop for DeliveryTicket {
    fn drop(&mut self) {
        self.report(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::Metric;

    fn group() -> MetricGroup {
        MetricGroup::new(vec![Metric::new("cpu").with_field("usage", 1.0)])
    }

    #[tokio::test]
    async fn identifiers_are_unique_and_start_at_one() {
        let (tracker, mut groups_rx, _outcomes_rx) = channel(4);

        let first = tracker.submit(group()).await.unwrap();
        let second = tracker.clone().submit(group()).await.unwrap();

        assert_eq!(first, TrackingId::from_raw(1));
        assert_eq!(second, TrackingId::from_raw(2));
        assert_eq!(groups_rx.recv().await.unwrap().id(), first);
        assert_eq!(groups_rx.recv().await.unwrap().id(), second);
    }

    #[tokio::test]
    async fn ticket_reports_exactly_once() {
        let (tracker, mut groups_rx, mut outcomes_rx) = channel(4);

        let delivered_id = tracker.submit(group()).await.unwrap();
        let failed_id = tracker.submit(group()).await.unwrap();

        let (_, ticket) = groups_rx.recv().await.unwrap().into_parts();
        ticket.delivered();
        let (_, ticket) = groups_rx.recv().await.unwrap().into_parts();
        ticket.failed();

        assert_eq!(
            outcomes_rx.recv().await,
            Some(DeliveryOutcome {
                id: delivered_id,
                delivered: true
            })
        );
        assert_eq!(
            outcomes_rx.recv().await,
            Some(DeliveryOutcome {
                id: failed_id,
                delivered: false
            })
        );
        assert!(outcomes_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_ticket_reports_failure() {
        let (tracker, mut groups_rx, mut outcomes_rx) = channel(4);

        let id = tracker.submit(group()).await.unwrap();
        drop(groups_rx.recv().await.unwrap());

        assert_eq!(outcomes_rx.recv().await, Some(DeliveryOutcome { id, delivered: false }));
    }

    #[tokio::test]
    async fn closed_write_path_fails_submission_silently() {
        let (tracker, groups_rx, mut outcomes_rx) = channel(4);
        drop(groups_rx);

        assert!(tracker.submit(group()).await.is_err());
        assert!(outcomes_rx.try_recv().is_err());
    }
}
