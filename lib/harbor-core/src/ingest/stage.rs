//! Decode/parse stage.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use harbor_error::GenericError;
use snafu::Snafu;

use super::{IngestConfiguration, TimestampSource};
use crate::{
    data_model::{Metric, MetricGroup},
    message::MessageContent,
};

/// A decoding error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DecodeError {
    /// The decoded payload exceeded the size limit.
    #[snafu(display("Decoded payload exceeds the limit of {} bytes.", limit))]
    TooLarge {
        /// Size limit, in bytes.
        limit: usize,
    },

    /// The content encoding is not supported.
    #[snafu(display("Unsupported content encoding '{}'.", encoding))]
    UnsupportedEncoding {
        /// The requested encoding.
        encoding: String,
    },

    /// The payload is not valid for its content encoding.
    #[snafu(display("Failed to decode payload: {}", source))]
    Malformed {
        /// Error source.
        source: GenericError,
    },
}

/// Turns an encoded payload into raw bytes.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decodes `payload` according to `encoding`.
    ///
    /// `None` means the payload is not encoded. When `limit` is set, decoding stops with [`DecodeError::TooLarge`] as
    /// soon as the output would exceed it.
    async fn decode(
        &self, payload: &[u8], encoding: Option<&str>, limit: Option<usize>,
    ) -> Result<Vec<u8>, DecodeError>;
}

/// Turns raw bytes into metrics.
pub trait Parser: Send + Sync {
    /// Parses `payload` into zero or more metrics.
    ///
    /// # Errors
    ///
    /// If the payload is malformed, an error is returned. Parsing is all-or-nothing: a payload with a single malformed
    /// record yields no metrics.
    fn parse(&self, payload: &[u8]) -> Result<Vec<Metric>, GenericError>;
}

/// A decode/parse stage error.
///
/// All variants are permanent: processing the same message again would fail the same way.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum StageError {
    /// The payload exceeded the maximum message length.
    #[snafu(display("Payload exceeds the maximum message length of {} bytes.", max))]
    PayloadTooLarge {
        /// Maximum message length, in bytes.
        max: usize,
    },

    /// The payload could not be decoded.
    #[snafu(display("Failed to decode message: {}", source))]
    Decode {
        /// Error source.
        source: DecodeError,
    },

    /// The decoded payload could not be parsed.
    #[snafu(display("Failed to parse message: {}", source))]
    Parse {
        /// Error source.
        source: GenericError,
    },
}

/// Result of processing a message.
#[derive(Debug)]
pub enum StageOutcome {
    /// The payload was valid but contained no metrics.
    Empty,

    /// The payload produced a non-empty group of metrics.
    Group(MetricGroup),
}

/// Message-derived enrichment applied to parsed metrics.
#[derive(Clone, Debug, Default)]
pub struct Enrichment {
    topic_tag: Option<String>,
    attributes_as_tags: Vec<String>,
    attribute_as_metric_name: Option<String>,
    timestamp_source: TimestampSource,
}

impl Enrichment {
    fn from_configuration(config: &IngestConfiguration) -> Self {
        Self {
            topic_tag: config.topic_tag.clone(),
            attributes_as_tags: config.attributes_as_tags.clone(),
            attribute_as_metric_name: config.attribute_as_metric_name.clone(),
            timestamp_source: config.timestamp_source,
        }
    }

    fn is_noop(&self) -> bool {
        self.topic_tag.is_none()
            && self.attributes_as_tags.is_empty()
            && self.attribute_as_metric_name.is_none()
            && self.timestamp_source == TimestampSource::Payload
    }

    fn apply<M>(&self, message: &M, group: &mut MetricGroup)
    where
        M: MessageContent + ?Sized,
    {
        if self.is_noop() {
            return;
        }

        let topic = self
            .topic_tag
            .as_deref()
            .and_then(|tag| message.topic().map(|topic| (tag, topic)));
        let attribute_tags = self
            .attributes_as_tags
            .iter()
            .filter_map(|key| message.attribute(key).map(|value| (key.as_str(), value)))
            .collect::<Vec<_>>();
        let name = self
            .attribute_as_metric_name
            .as_deref()
            .and_then(|key| message.attribute(key));
        let timestamp = match self.timestamp_source {
            TimestampSource::Payload => None,
            TimestampSource::Publish => message.publish_time().and_then(unix_nanos),
        };

        for metric in group.iter_mut() {
            if let Some((tag, topic)) = topic {
                metric.insert_tag(tag, topic);
            }
            for (key, value) in &attribute_tags {
                metric.insert_tag(*key, *value);
            }
            if let Some(name) = name {
                metric.set_name(name);
            }
            if let Some(timestamp) = timestamp {
                metric.set_timestamp(timestamp);
            }
        }
    }
}

fn unix_nanos(time: SystemTime) -> Option<u64> {
    let elapsed = time.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(elapsed.as_nanos()).ok()
}

/// Decodes and parses messages into metric groups.
///
/// Enrichment happens here, before the group is submitted or copied for redelivery, so a group is never modified after
/// it leaves the stage.
#[derive(Clone)]
pub struct DecodeParseStage {
    decoder: Arc<dyn Decoder>,
    parser: Arc<dyn Parser>,
    max_message_len: Option<usize>,
    default_encoding: Option<String>,
    enrichment: Enrichment,
}

impl DecodeParseStage {
    /// Creates a new `DecodeParseStage` with no size limit and no enrichment.
    pub fn new(decoder: Arc<dyn Decoder>, parser: Arc<dyn Parser>) -> Self {
        Self {
            decoder,
            parser,
            max_message_len: None,
            default_encoding: None,
            enrichment: Enrichment::default(),
        }
    }

    /// Creates a new `DecodeParseStage` with the size limit, default encoding, and enrichment from `config`.
    pub fn from_configuration(
        decoder: Arc<dyn Decoder>, parser: Arc<dyn Parser>, config: &IngestConfiguration,
    ) -> Self {
        Self {
            decoder,
            parser,
            max_message_len: config.max_message_len(),
            default_encoding: config.content_encoding.clone(),
            enrichment: Enrichment::from_configuration(config),
        }
    }

    /// Returns the maximum message length, if one is set.
    pub fn max_message_len(&self) -> Option<usize> {
        self.max_message_len
    }

    /// Processes a single message.
    ///
    /// # Errors
    ///
    /// If the payload is too large, cannot be decoded, or cannot be parsed, an error is returned.
    pub async fn process<M>(&self, message: &M) -> Result<StageOutcome, StageError>
    where
        M: MessageContent + ?Sized,
    {
        let payload = message.payload();
        if let Some(max) = self.max_message_len {
            if payload.len() > max {
                return Err(StageError::PayloadTooLarge { max });
            }
        }

        let encoding = message.content_encoding().or(self.default_encoding.as_deref());
        let decoded = self
            .decoder
            .decode(payload, encoding, self.max_message_len)
            .await
            .map_err(|source| match source {
                DecodeError::TooLarge { limit } => StageError::PayloadTooLarge { max: limit },
                source => StageError::Decode { source },
            })?;

        let metrics = self
            .parser
            .parse(&decoded)
            .map_err(|source| StageError::Parse { source })?;
        if metrics.is_empty() {
            return Ok(StageOutcome::Empty);
        }

        let mut group = MetricGroup::new(metrics);
        self.enrichment.apply(message, &mut group);
        Ok(StageOutcome::Group(group))
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytesize::ByteSize;

    use super::{test_util::*, *};
    use crate::{
        ingest::RedeliveryMode,
        message::test_util::{AckCounts, MockMessage},
    };

    fn configured_stage(config: &IngestConfiguration) -> DecodeParseStage {
        DecodeParseStage::from_configuration(Arc::new(PassthroughDecoder), Arc::new(PairParser), config)
    }

    #[tokio::test]
    async fn parses_group() {
        let counts = AckCounts::default();
        let message = MockMessage::new("1", "cpu 1.5\nmem 2\n", &counts);

        let StageOutcome::Group(group) = stage().process(&message).await.unwrap() else {
            panic!("expected a group");
        };
        assert_eq!(group.len(), 2);
        assert_eq!(group.iter().next().unwrap().name(), "cpu");
    }

    #[tokio::test]
    async fn empty_payload_is_empty() {
        let counts = AckCounts::default();
        let message = MockMessage::new("1", "\n\n", &counts);

        assert!(matches!(stage().process(&message).await, Ok(StageOutcome::Empty)));
    }

    #[tokio::test]
    async fn malformed_payload_is_parse_error() {
        let counts = AckCounts::default();
        let message = MockMessage::new("1", "cpu notanumber", &counts);

        assert!(matches!(stage().process(&message).await, Err(StageError::Parse { .. })));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_decoding() {
        let counts = AckCounts::default();
        let message = MockMessage::new("1", "cpu 1.5", &counts);
        let config = IngestConfiguration {
            max_message_len: ByteSize::b(4),
            ..IngestConfiguration::default()
        };

        assert!(matches!(
            configured_stage(&config).process(&message).await,
            Err(StageError::PayloadTooLarge { max: 4 })
        ));
    }

    #[tokio::test]
    async fn default_encoding_applies_when_message_has_none() {
        let counts = AckCounts::default();
        let message = MockMessage::new("1", "cpu 1", &counts);
        let config = IngestConfiguration {
            content_encoding: Some("x-upper".to_string()),
            ..IngestConfiguration::default()
        };

        let StageOutcome::Group(group) = configured_stage(&config).process(&message).await.unwrap() else {
            panic!("expected a group");
        };
        assert_eq!(group.iter().next().unwrap().name(), "CPU");

        let config = IngestConfiguration {
            content_encoding: Some("br".to_string()),
            ..IngestConfiguration::default()
        };
        assert!(matches!(
            configured_stage(&config).process(&message).await,
            Err(StageError::Decode {
                source: DecodeError::UnsupportedEncoding { .. }
            })
        ));
    }

    #[tokio::test]
    async fn enrichment_from_message_metadata() {
        let counts = AckCounts::default();
        let mut message = MockMessage::new("1", "cpu 1\nmem 2", &counts);
        message.topic = Some("telemetry".to_string());
        message.attributes.insert("host".to_string(), "web-1".to_string());
        message.attributes.insert("metric".to_string(), "renamed".to_string());
        message.publish_time = Some(UNIX_EPOCH + Duration::from_secs(42));

        let config = IngestConfiguration {
            redelivery_mode: RedeliveryMode::AckAndDrop,
            topic_tag: Some("topic".to_string()),
            attributes_as_tags: vec!["host".to_string(), "missing".to_string()],
            attribute_as_metric_name: Some("metric".to_string()),
            timestamp_source: TimestampSource::Publish,
            ..IngestConfiguration::default()
        };

        let StageOutcome::Group(group) = configured_stage(&config).process(&message).await.unwrap() else {
            panic!("expected a group");
        };
        for metric in &group {
            assert_eq!(metric.name(), "renamed");
            assert_eq!(metric.tags().get("topic").map(String::as_str), Some("telemetry"));
            assert_eq!(metric.tags().get("host").map(String::as_str), Some("web-1"));
            assert!(!metric.tags().contains_key("missing"));
            assert_eq!(metric.timestamp(), Some(42_000_000_000));
        }
    }
}
