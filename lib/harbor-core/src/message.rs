//! Broker messages and acknowledgment.

use std::time::SystemTime;

use async_trait::async_trait;
use harbor_error::GenericError;

/// Read-only view over an inbound message.
///
/// Everything the decode/parse stage needs to turn a message into metrics: the raw payload, an optional encoding hint,
/// and the metadata used for enrichment.
pub trait MessageContent: Send + Sync {
    /// Returns the raw payload.
    fn payload(&self) -> &[u8];

    /// Returns the content encoding of the payload, if the message carries one.
    fn content_encoding(&self) -> Option<&str> {
        None
    }

    /// Returns the topic, subject, or subscription the message was received from.
    fn topic(&self) -> Option<&str> {
        None
    }

    /// Returns the value of the given message attribute (header, property, etc), if present.
    fn attribute(&self, _key: &str) -> Option<&str> {
        None
    }

    /// Returns the time the broker accepted the message, if known.
    fn publish_time(&self) -> Option<SystemTime> {
        None
    }
}

/// A message received from a broker.
///
/// Acknowledging a message consumes it, so a message can be acknowledged (positively or negatively) at most once.
/// Dropping a message without acknowledging it leaves it unacknowledged, and the broker's own redelivery policy applies.
#[async_trait]
pub trait BrokerMessage: MessageContent {
    /// Returns a broker-assigned identifier for the message.
    fn id(&self) -> &str;

    /// Acknowledges the message, indicating it was processed and must not be redelivered.
    ///
    /// # Errors
    ///
    /// If the broker could not be reached, an error is returned.
    async fn ack(self: Box<Self>) -> Result<(), GenericError>;

    /// Negatively acknowledges the message, asking the broker to redeliver it.
    ///
    /// Brokers without negative acknowledgment may treat this as a no-op and rely on their redelivery timeout.
    ///
    /// # Errors
    ///
    /// If the broker could not be reached, an error is returned.
    async fn nack(self: Box<Self>) -> Result<(), GenericError>;
}

/// The final step in resolving a tracked unit of work.
///
/// Implemented by anything that can be stored in the tracking registry and resolved once its delivery outcome is
/// known: broker messages, as well as the completion signal of a pending push request.
#[async_trait]
pub trait Acknowledge: Send + 'static {
    /// Resolves the unit as successfully processed.
    async fn ack(self) -> Result<(), GenericError>;

    /// Resolves the unit as failed.
    async fn nack(self) -> Result<(), GenericError>;
}

#[async_trait]
impl Acknowledge for Box<dyn BrokerMessage> {
    async fn ack(self) -> Result<(), GenericError> {
        BrokerMessage::ack(self).await
    }

    async fn nack(self) -> Result<(), GenericError> {
        BrokerMessage::nack(self).await
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::*;

    /// Shared ack/nack counters for [`MockMessage`].
    #[derive(Clone, Debug, Default)]
    pub struct AckCounts {
        acks: Arc<AtomicUsize>,
        nacks: Arc<AtomicUsize>,
    }

    impl AckCounts {
        pub fn acks(&self) -> usize {
            self.acks.load(Ordering::SeqCst)
        }

        pub fn nacks(&self) -> usize {
            self.nacks.load(Ordering::SeqCst)
        }
    }

    pub struct MockMessage {
        pub id: String,
        pub payload: Vec<u8>,
        pub topic: Option<String>,
        pub attributes: HashMap<String, String>,
        pub publish_time: Option<SystemTime>,
        pub ack_delay: Option<Duration>,
        pub counts: AckCounts,
    }

    impl MockMessage {
        pub fn new(id: &str, payload: &str, counts: &AckCounts) -> Self {
            Self {
                id: id.to_string(),
                payload: payload.as_bytes().to_vec(),
                topic: None,
                attributes: HashMap::new(),
                publish_time: None,
                ack_delay: None,
                counts: counts.clone(),
            }
        }

        /// Makes acknowledging the message take `delay`, like a round trip to the broker would.
        pub fn with_ack_delay(mut self, delay: Duration) -> Self {
            self.ack_delay = Some(delay);
            self
        }

        pub fn boxed(self) -> Box<dyn BrokerMessage> {
            Box::new(self)
        }
    }

    impl MessageContent for MockMessage {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        fn topic(&self) -> Option<&str> {
            self.topic.as_deref()
        }

        fn attribute(&self, key: &str) -> Option<&str> {
            self.attributes.get(key).map(String::as_str)
        }

        fn publish_time(&self) -> Option<SystemTime> {
            self.publish_time
        }
    }

    #[async_trait]
    impl BrokerMessage for MockMessage {
        fn id(&self) -> &str {
            &self.id
        }

        async fn ack(self: Box<Self>) -> Result<(), GenericError> {
            if let Some(delay) = self.ack_delay {
                tokio::time::sleep(delay).await;
            }
            self.counts.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(self: Box<Self>) -> Result<(), GenericError> {
            self.counts.nacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
