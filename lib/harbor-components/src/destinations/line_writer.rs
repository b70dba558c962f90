use std::time::Duration;

use harbor_config::GenericConfiguration;
use harbor_core::tracking::{DeliveryTicket, TrackedGroup};
use harbor_error::{generic_error, GenericError};
use harbor_io::line_protocol::encode_metric;
use metrics::{counter, Counter};
use serde::Deserialize;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _},
    select,
    sync::mpsc,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, warn};

const fn default_batch_size() -> usize {
    1000
}

const fn default_flush_interval_ms() -> u64 {
    1000
}

/// Line writer configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct LineWriterConfiguration {
    /// Number of buffered metrics that triggers a flush.
    ///
    /// Defaults to 1000.
    #[serde(default = "default_batch_size")]
    batch_size: usize,

    /// Maximum time metrics stay buffered before being flushed, in milliseconds.
    ///
    /// Defaults to 1000 milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    flush_interval_ms: u64,
}

impl Default for LineWriterConfiguration {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

impl LineWriterConfiguration {
    /// Creates a new `LineWriterConfiguration` from the `output` section of the given configuration.
    ///
    /// A missing section yields the defaults.
    ///
    /// # Errors
    ///
    /// If the section cannot be deserialized, or holds invalid values, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let output = config.try_get_typed::<Self>("output")?.unwrap_or_default();
        output.validate()?;
        Ok(output)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// If any value is out of range, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        if self.batch_size == 0 {
            return Err(generic_error!("`batch_size` must be greater than zero."));
        }
        if self.flush_interval_ms == 0 {
            return Err(generic_error!("`flush_interval_ms` must be greater than zero."));
        }
        Ok(())
    }

    /// Sets the number of buffered metrics that triggers a flush.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the flush interval.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval_ms = u64::try_from(flush_interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

struct Metrics {
    metrics_written: Counter,
    metrics_skipped: Counter,
    write_errors: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            metrics_written: counter!("harbor_output_metrics_written_total"),
            metrics_skipped: counter!("harbor_output_metrics_skipped_total"),
            write_errors: counter!("harbor_output_write_errors_total"),
        }
    }
}

/// Writes metric groups as line protocol, resolving their delivery outcomes.
///
/// Groups are buffered until the batch size is reached or the flush interval elapses, then written and flushed in one
/// go. A successful flush resolves every group in the batch as delivered, and a failed one resolves every group in the
/// batch as failed. Write errors never stop the writer.
pub struct LineWriter<W> {
    config: LineWriterConfiguration,
    groups: mpsc::Receiver<TrackedGroup>,
    writer: W,
    buffer: String,
    buffered_metrics: usize,
    tickets: Vec<DeliveryTicket>,
    metrics: Metrics,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Creates a new `LineWriter` that writes the groups received on `groups` to `writer`.
    pub fn new(config: LineWriterConfiguration, groups: mpsc::Receiver<TrackedGroup>, writer: W) -> Self {
        Self {
            config,
            groups,
            writer,
            buffer: String::new(),
            buffered_metrics: 0,
            tickets: Vec::new(),
            metrics: Metrics::new(),
        }
    }

    /// Runs the writer until the group channel is closed, flushing whatever is left buffered before returning.
    pub async fn run(mut self) {
        let mut flush = interval(self.config.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            batch_size = self.config.batch_size,
            flush_interval_ms = self.config.flush_interval_ms,
            "Line writer started."
        );

        loop {
            select! {
                maybe_group = self.groups.recv() => match maybe_group {
                    Some(group) => {
                        self.buffer_group(group);
                        if self.buffered_metrics >= self.config.batch_size {
                            self.flush().await;
                            flush.reset();
                        }
                    }
                    None => break,
                },
                _ = flush.tick() => {
                    if !self.tickets.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        if !self.tickets.is_empty() {
            self.flush().await;
        }
        debug!("Line writer stopped.");
    }

    fn buffer_group(&mut self, tracked: TrackedGroup) {
        let (group, ticket) = tracked.into_parts();
        for metric in &group {
            if encode_metric(metric, &mut self.buffer) {
                self.buffered_metrics += 1;
            } else {
                self.metrics.metrics_skipped.increment(1);
                warn!(tracking_id = %ticket.id(), metric = %metric, "Skipping metric with no representable fields.");
            }
        }
        self.tickets.push(ticket);
    }

    async fn flush(&mut self) {
        let batch_groups = self.tickets.len();
        let batch_metrics = self.buffered_metrics;

        match self.write_buffer().await {
            Ok(()) => {
                self.metrics.metrics_written.increment(batch_metrics as u64);
                debug!(groups = batch_groups, metrics = batch_metrics, "Flushed batch.");
                for ticket in self.tickets.drain(..) {
                    ticket.delivered();
                }
            }
            Err(e) => {
                self.metrics.write_errors.increment(1);
                error!(error = %e, groups = batch_groups, "Failed to write batch.");
                for ticket in self.tickets.drain(..) {
                    ticket.failed();
                }
            }
        }

        self.buffer.clear();
        self.buffered_metrics = 0;
    }

    async fn write_buffer(&mut self) -> std::io::Result<()> {
        self.writer.write_all(self.buffer.as_bytes()).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        pin::Pin,
        task::{Context, Poll},
    };

    use harbor_core::{
        data_model::{Metric, MetricGroup},
        tracking::{self, SinkTracker as _},
    };
    use tokio::io::{duplex, AsyncReadExt as _};

    use super::*;

    fn group(name: &str, count: usize) -> MetricGroup {
        (0..count)
            .map(|i| Metric::new(name).with_field("value", i as i64))
            .collect::<Vec<_>>()
            .into()
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_batch_is_full() {
        let (sender, groups, mut outcomes) = tracking::channel(16);
        let (writer, mut reader) = duplex(64 * 1024);
        let config = LineWriterConfiguration::default()
            .with_batch_size(3)
            .with_flush_interval(Duration::from_secs(3600));
        let task = tokio::spawn(LineWriter::new(config, groups, writer).run());

        let first = sender.submit(group("cpu", 2)).await.unwrap();
        let second = sender.submit(group("mem", 1)).await.unwrap();

        for expected in [first, second] {
            let outcome = outcomes.recv().await.unwrap();
            assert_eq!(outcome.id, expected);
            assert!(outcome.delivered);
        }

        drop(sender);
        task.await.unwrap();

        let mut written = String::new();
        reader.read_to_string(&mut written).await.unwrap();
        assert_eq!(written, "cpu value=0i\ncpu value=1i\nmem value=0i\n");
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_interval() {
        let (sender, groups, mut outcomes) = tracking::channel(16);
        let (writer, _reader) = duplex(64 * 1024);
        let config = LineWriterConfiguration::default().with_flush_interval(Duration::from_millis(250));
        let _task = tokio::spawn(LineWriter::new(config, groups, writer).run());

        let id = sender.submit(group("cpu", 1)).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(1), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.id, id);
        assert!(outcome.delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_remainder_when_input_closes() {
        let (sender, groups, mut outcomes) = tracking::channel(16);
        let (writer, _reader) = duplex(64 * 1024);
        let config = LineWriterConfiguration::default().with_flush_interval(Duration::from_secs(3600));
        let task = tokio::spawn(LineWriter::new(config, groups, writer).run());

        let id = sender.submit(group("cpu", 1)).await.unwrap();
        drop(sender);
        task.await.unwrap();

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.id, id);
        assert!(outcome.delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn write_errors_fail_the_batch() {
        let (sender, groups, mut outcomes) = tracking::channel(16);
        let config = LineWriterConfiguration::default().with_batch_size(1);
        let task = tokio::spawn(LineWriter::new(config, groups, BrokenWriter).run());

        let first = sender.submit(group("cpu", 1)).await.unwrap();
        let second = sender.submit(group("cpu", 1)).await.unwrap();

        for expected in [first, second] {
            let outcome = outcomes.recv().await.unwrap();
            assert_eq!(outcome.id, expected);
            assert!(!outcome.delivered);
        }

        drop(sender);
        task.await.unwrap();
    }

    #[test]
    fn rejects_invalid_options() {
        assert!(LineWriterConfiguration::default().with_batch_size(0).validate().is_err());
        assert!(LineWriterConfiguration::default()
            .with_flush_interval(Duration::ZERO)
            .validate()
            .is_err());
    }
}
