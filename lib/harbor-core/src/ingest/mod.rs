//! Bounded, acknowledgment-tracked ingestion.
//!
//! An ingester pulls messages from a [`Source`], decodes and parses each one into a metric group, and submits the group
//! to a [`SinkTracker`]. Every submitted group holds an admission slot until its delivery outcome is known, which bounds
//! how much undelivered work can be outstanding at once. A separate delivery listener resolves outcomes back to the
//! original messages, acknowledging them (or not) and releasing their slots.
//!
//! The same machinery also backs push ingestion (see [`PushIngester`]), where each inbound request takes the place of a
//! broker message.

use std::{ops::ControlFlow, sync::Arc, time::Duration};

use bytesize::ByteSize;
use harbor_config::GenericConfiguration;
use harbor_error::{generic_error, ErrorClass, GenericError};
use serde::Deserialize;
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn};

use crate::{
    admission::AdmissionController,
    backoff::ExponentialBackoff,
    lifecycle::{Lifecycle, ShutdownReport},
    message::{Acknowledge, BrokerMessage},
    registry::{Registered, SubmitFailed, TrackingEntry, TrackingRegistry},
    report::ErrorReporter,
    source::Source,
    tracking::{DeliveryOutcome, SinkTracker},
};

mod listener;
use self::listener::{ack, nack, DeliveryListener};

mod push;
pub use self::push::{CompletionSignal, PushIngester, PushResponse};
use self::push::PushIngesterInner;

mod stage;
pub use self::stage::{DecodeError, DecodeParseStage, Decoder, Enrichment, Parser, StageError, StageOutcome};

mod telemetry;
use self::telemetry::IngestMetrics;


const fn default_max_undelivered_messages() -> usize {
    1000
}

const fn default_shutdown_grace_period_secs() -> f64 {
    5.0
}

/// How undelivered metric groups are handled.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RedeliveryMode {
    /// Negatively acknowledge the message and let the broker redeliver it.
    #[default]
    AckAndDrop,

    /// Acknowledge the message and resubmit a retained copy of its metric group.
    ///
    /// For brokers that cannot redeliver a message once the consumer has moved past it.
    AckAndResubmit,
}

/// Where metric timestamps come from.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    /// Keep whatever timestamp the payload carried.
    #[default]
    Payload,

    /// Overwrite timestamps with the broker's publish time, when the message has one.
    Publish,
}

/// Ingestion configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct IngestConfiguration {
    /// Maximum number of metric groups that may be submitted but not yet resolved.
    ///
    /// Once reached, no further messages are admitted until an outstanding group is resolved. Must be greater than
    /// zero.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_max_undelivered_messages")]
    max_undelivered_messages: usize,

    /// Maximum message length, before and after decoding.
    ///
    /// Longer messages are acknowledged and discarded. If set to zero, there is no limit.
    ///
    /// Defaults to zero.
    #[serde(default)]
    max_message_len: ByteSize,

    /// How long to keep resolving outstanding metric groups after intake stops, in seconds.
    ///
    /// Fractional values are allowed. Groups still unresolved after this are abandoned, and their messages left
    /// unacknowledged.
    ///
    /// Defaults to 5 seconds.
    #[serde(default = "default_shutdown_grace_period_secs")]
    shutdown_grace_period_secs: f64,

    /// How undelivered metric groups are handled.
    ///
    /// Defaults to `ack_and_drop`.
    #[serde(default)]
    redelivery_mode: RedeliveryMode,

    /// Tag to add to each metric, holding the topic the message was received from.
    ///
    /// Defaults to unset.
    #[serde(default)]
    topic_tag: Option<String>,

    /// Message attributes to add to each metric as tags.
    ///
    /// Defaults to none.
    #[serde(default)]
    attributes_as_tags: Vec<String>,

    /// Message attribute whose value replaces the name of each metric.
    ///
    /// Defaults to unset.
    #[serde(default)]
    attribute_as_metric_name: Option<String>,

    /// Where metric timestamps come from.
    ///
    /// Defaults to `payload`.
    #[serde(default)]
    timestamp_source: TimestampSource,

    /// Content encoding assumed for messages that don't declare one.
    ///
    /// Defaults to unset, meaning such messages are not encoded.
    #[serde(default)]
    content_encoding: Option<String>,
}

impl Default for IngestConfiguration {
    fn default() -> Self {
        Self {
            max_undelivered_messages: default_max_undelivered_messages(),
            max_message_len: ByteSize::b(0),
            shutdown_grace_period_secs: default_shutdown_grace_period_secs(),
            redelivery_mode: RedeliveryMode::default(),
            topic_tag: None,
            attributes_as_tags: Vec::new(),
            attribute_as_metric_name: None,
            timestamp_source: TimestampSource::default(),
            content_encoding: None,
        }
    }
}

impl IngestConfiguration {
    /// Creates a new `IngestConfiguration` from the given section of the configuration.
    ///
    /// A missing section yields the defaults.
    ///
    /// # Errors
    ///
    /// If the section cannot be deserialized, or holds invalid values, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration, section: &str) -> Result<Self, GenericError> {
        let ingest = config.try_get_typed::<Self>(section)?.unwrap_or_default();
        ingest.validate()?;
        Ok(ingest)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// If any value is out of range, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        if self.max_undelivered_messages == 0 {
            return Err(generic_error!("`max_undelivered_messages` must be greater than zero."));
        }
        if Duration::try_from_secs_f64(self.shutdown_grace_period_secs).is_err() {
            return Err(generic_error!(
                "`shutdown_grace_period_secs` must be a finite, non-negative number of seconds (got {}).",
                self.shutdown_grace_period_secs
            ));
        }
        Ok(())
    }

    /// Sets the maximum number of undelivered metric groups.
    pub fn with_max_undelivered_messages(mut self, max: usize) -> Self {
        self.max_undelivered_messages = max;
        self
    }

    /// Sets the maximum message length. Zero disables the limit.
    pub fn with_max_message_len(mut self, max: ByteSize) -> Self {
        self.max_message_len = max;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace_period(mut self, grace_period: Duration) -> Self {
        self.shutdown_grace_period_secs = grace_period.as_secs_f64();
        self
    }

    /// Sets the redelivery mode.
    pub fn with_redelivery_mode(mut self, mode: RedeliveryMode) -> Self {
        self.redelivery_mode = mode;
        self
    }

    /// Returns the maximum number of undelivered metric groups.
    pub fn max_undelivered_messages(&self) -> usize {
        self.max_undelivered_messages
    }

    /// Returns the maximum message length, in bytes, if there is one.
    pub fn max_message_len(&self) -> Option<usize> {
        match self.max_message_len.as_u64() {
            0 => None,
            len => Some(usize::try_from(len).unwrap_or(usize::MAX)),
        }
    }

    /// Returns the shutdown grace period.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::try_from_secs_f64(self.shutdown_grace_period_secs).unwrap_or(Duration::ZERO)
    }

    /// Returns the redelivery mode.
    pub fn redelivery_mode(&self) -> RedeliveryMode {
        self.redelivery_mode
    }
}

/// Builds and starts ingestion.
///
/// An ingester is started either against a [`Source`] ([`start`][Self::start]), or in push mode
/// ([`start_push`][Self::start_push]). Either way, the returned [`IngestHandle`] is used to observe and shut down
/// ingestion.
pub struct Ingester {
    name: Arc<str>,
    config: IngestConfiguration,
    stage: DecodeParseStage,
    tracker: Arc<dyn SinkTracker>,
    outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
    reporter: ErrorReporter,
    backoff: ExponentialBackoff,
}

impl Ingester {
    /// Creates a new `Ingester`.
    ///
    /// `outcomes` must receive the delivery outcomes of groups submitted to `tracker`.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new<N: Into<Arc<str>>>(
        name: N, config: IngestConfiguration, decoder: Arc<dyn Decoder>, parser: Arc<dyn Parser>,
        tracker: Arc<dyn SinkTracker>, outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
    ) -> Result<Self, GenericError> {
        config.validate()?;

        let name = name.into();
        let stage = DecodeParseStage::from_configuration(decoder, parser, &config);
        let reporter = ErrorReporter::new(Arc::clone(&name));

        Ok(Self {
            name,
            config,
            stage,
            tracker,
            outcomes,
            reporter,
            backoff: ExponentialBackoff::default(),
        })
    }

    /// Sets the error reporter.
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Sets the backoff used when the source fails to receive.
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn start_common<P: Acknowledge>(self) -> (IngestHandle<P>, IngestMetrics, IngestParts) {
        let Self {
            name,
            config,
            stage,
            tracker,
            outcomes,
            reporter,
            backoff,
        } = self;

        let metrics = IngestMetrics::new(&name);
        let lifecycle = Lifecycle::new(config.shutdown_grace_period());
        let admission = AdmissionController::new(config.max_undelivered_messages());
        let registry = Arc::new(TrackingRegistry::new(metrics.undelivered.clone()));

        let listener = DeliveryListener::new(
            Arc::clone(&registry),
            Arc::clone(&tracker),
            outcomes,
            config.redelivery_mode(),
            reporter.clone(),
            metrics.clone(),
        );
        lifecycle.spawn_drain(listener.run(lifecycle.drain_token()));

        let parts = IngestParts {
            stage,
            tracker,
            reporter,
            backoff,
            mode: config.redelivery_mode(),
            admission: admission.clone(),
            intake: lifecycle.intake_token(),
        };
        let handle = IngestHandle {
            name,
            lifecycle,
            admission,
            registry,
            abandoned: metrics.abandoned.clone(),
        };

        (handle, metrics, parts)
    }

    /// Starts pulling messages from `source`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S>(self, source: S) -> IngestHandle<Box<dyn BrokerMessage>>
    where
        S: Source + 'static,
    {
        let span = info_span!("ingester", source = %self.name);
        let _enter = span.enter();

        let (handle, metrics, parts) = self.start_common();
        let intake_loop = IntakeLoop {
            stage: parts.stage,
            admission: parts.admission,
            registry: Arc::clone(&handle.registry),
            tracker: parts.tracker,
            mode: parts.mode,
            reporter: parts.reporter,
            metrics,
            backoff: parts.backoff,
            logged_empty: false,
        };
        handle.lifecycle.spawn_intake(intake_loop.run(source, parts.intake));

        debug!(max_undelivered_messages = handle.admission.capacity(), "Started ingester.");
        handle
    }

    /// Starts push ingestion.
    ///
    /// Requests wait at most `request_timeout` for an admission slot. Must be called from within a Tokio runtime.
    pub fn start_push(self, request_timeout: Duration) -> (PushIngester, IngestHandle<CompletionSignal>) {
        let span = info_span!("ingester", source = %self.name);
        let _enter = span.enter();

        let (handle, metrics, parts) = self.start_common();
        let ingester = PushIngester::new(PushIngesterInner {
            stage: parts.stage,
            admission: parts.admission,
            registry: Arc::clone(&handle.registry),
            tracker: parts.tracker,
            mode: parts.mode,
            reporter: parts.reporter,
            metrics,
            intake: parts.intake,
            request_timeout,
        });

        debug!(max_undelivered_messages = handle.admission.capacity(), "Started push ingester.");
        (ingester, handle)
    }
}

struct IngestParts {
    stage: DecodeParseStage,
    tracker: Arc<dyn SinkTracker>,
    reporter: ErrorReporter,
    backoff: ExponentialBackoff,
    mode: RedeliveryMode,
    admission: AdmissionController,
    intake: CancellationToken,
}

/// Handle to a running ingester.
pub struct IngestHandle<P> {
    name: Arc<str>,
    lifecycle: Lifecycle,
    admission: AdmissionController,
    registry: Arc<TrackingRegistry<P>>,
    abandoned: metrics::Counter,
}

impl<P> IngestHandle<P> {
    /// Returns the name of the ingester.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of admission slots currently held.
    pub fn in_flight(&self) -> usize {
        self.admission.in_flight()
    }

    /// Returns the number of submitted metric groups awaiting their delivery outcome.
    pub fn undelivered(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }

    /// Shuts down ingestion.
    ///
    /// Intake stops immediately. Outstanding metric groups keep being resolved until none remain or the shutdown grace
    /// period elapses, after which any that remain are abandoned: their messages are left unacknowledged, to be
    /// redelivered by the broker.
    ///
    /// A group counts as outstanding for as long as it holds its admission slot. That covers a push request between
    /// admission and registration, and a failed group between the acknowledgment of its message and its resubmission,
    /// neither of which is in the tracking registry at that moment.
    pub async fn shutdown(self) -> ShutdownReport {
        let idle_in_time = self.lifecycle.shutdown(self.admission.wait_until_idle()).await;

        let abandoned = self.registry.drain().await;
        let abandoned_count = abandoned.len();
        if abandoned_count > 0 {
            self.abandoned.increment(abandoned_count as u64);
            warn!(
                source = %self.name,
                abandoned = abandoned_count,
                "Shutdown grace period elapsed with undelivered metric groups. Abandoning them."
            );
        }
        drop(abandoned);

        let drained = abandoned_count == 0;
        debug!(source = %self.name, drained, idle_in_time, "Ingester stopped.");
        ShutdownReport {
            drained,
            abandoned: abandoned_count,
        }
    }
}

struct IntakeLoop {
    stage: DecodeParseStage,
    admission: AdmissionController,
    registry: Arc<TrackingRegistry<Box<dyn BrokerMessage>>>,
    tracker: Arc<dyn SinkTracker>,
    mode: RedeliveryMode,
    reporter: ErrorReporter,
    metrics: IngestMetrics,
    backoff: ExponentialBackoff,
    logged_empty: bool,
}

impl IntakeLoop {
    async fn run<S: Source>(mut self, mut source: S, intake: CancellationToken) {
        debug!("Ingestion loop started.");

        let mut error_count = 0;
        loop {
            let received = select! {
                biased;

                _ = intake.cancelled() => break,
                received = source.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    error_count = 0;
                    if self.handle_message(message, &intake).await.is_break() {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("Source closed.");
                    break;
                }
                Err(e) => {
                    self.reporter
                        .report(ErrorClass::Transient, None, e.context("Failed to receive message."));
                    let completed = self.backoff.wait(error_count, &intake).await;
                    error_count += 1;
                    if !completed {
                        break;
                    }
                }
            }
        }

        debug!("Ingestion loop stopped.");
    }

    async fn handle_message(&mut self, message: Box<dyn BrokerMessage>, intake: &CancellationToken) -> ControlFlow<()> {
        self.metrics.received.increment(1);

        let group = match self.stage.process(&*message).await {
            Ok(StageOutcome::Group(group)) => group,
            Ok(StageOutcome::Empty) => {
                self.metrics.dropped_empty.increment(1);
                if !self.logged_empty {
                    debug!(
                        message_id = message.id(),
                        "No metrics created from message. Further occurrences will not be logged."
                    );
                    self.logged_empty = true;
                }
                ack(message, &self.reporter).await;
                return ControlFlow::Continue(());
            }
            Err(e) => {
                self.metrics.dropped_for(&e).increment(1);
                self.reporter.report(ErrorClass::Permanent, Some(message.id()), e.into());
                ack(message, &self.reporter).await;
                return ControlFlow::Continue(());
            }
        };

        let Some(permit) = self.admission.acquire(intake).await else {
            self.metrics.dropped_cancelled.increment(1);
            debug!(
                message_id = message.id(),
                "Intake stopped while waiting for admission. Releasing message for redelivery."
            );
            nack(message, &self.reporter).await;
            return ControlFlow::Break(());
        };

        let message_id = message.id().to_string();
        let backup = matches!(self.mode, RedeliveryMode::AckAndResubmit).then(|| group.clone());
        let entry = TrackingEntry::new(message, permit).with_backup(backup);

        let registration = select! {
            biased;

            _ = intake.cancelled() => None,
            result = self.registry.register(entry, self.tracker.submit(group)) => Some(result),
        };

        match registration {
            Some(Ok(Registered { id, displaced })) => {
                self.metrics.submitted.increment(1);
                trace!(tracking_id = %id, message_id = %message_id, "Submitted metric group.");
                if displaced.is_some() {
                    self.reporter.report(
                        ErrorClass::Internal,
                        Some(&message_id),
                        generic_error!("Sink tracker reused tracking ID {}. Displaced entry abandoned.", id),
                    );
                }
                ControlFlow::Continue(())
            }
            Some(Err(SubmitFailed { error, entry })) => {
                // Leave the message unacknowledged so the broker redelivers it.
                drop(entry);
                self.metrics.dropped_submit_failed.increment(1);
                self.reporter.report(
                    ErrorClass::Transient,
                    Some(&message_id),
                    error.context("Failed to submit metric group."),
                );
                ControlFlow::Continue(())
            }
            None => {
                self.metrics.dropped_cancelled.increment(1);
                debug!(
                    message_id = %message_id,
                    "Intake stopped during submission. Message left unacknowledged."
                );
                ControlFlow::Break(())
            }
        }
    }
}
