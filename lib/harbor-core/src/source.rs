//! Message sources.
//!
//! Broker clients come in two shapes: pull-based clients that return the next message when asked, and callback-based
//! clients that push messages into a handler as they arrive. The ingestion loop pulls from a [`Source`], and
//! [`callback_source`] adapts callback-based clients to that model.

use async_trait::async_trait;
use harbor_error::{generic_error, GenericError};
use tokio::sync::mpsc;

use crate::message::BrokerMessage;

/// A source of broker messages.
#[async_trait]
pub trait Source: Send {
    /// Receives the next message.
    ///
    /// Returns `Ok(None)` once the source is closed and will never produce another message.
    ///
    /// # Errors
    ///
    /// If the broker could not be reached, an error is returned. Errors are treated as transient: the caller backs off
    /// and calls `receive` again.
    async fn receive(&mut self) -> Result<Option<Box<dyn BrokerMessage>>, GenericError>;
}

/// Creates a callback-driven source.
///
/// Messages passed to the returned [`MessageCallback`] are buffered, up to `prefetch` at a time, until the ingestion
/// loop pulls them from the returned [`ChannelSource`]. Once the buffer is full, the callback waits, which pushes back
/// on the broker client. `prefetch` should stay small relative to the admission pool so that messages don't pile up
/// outside of admission control.
pub fn callback_source(prefetch: usize) -> (MessageCallback, ChannelSource) {
    let (messages_tx, messages_rx) = mpsc::channel(prefetch.max(1));
    (MessageCallback { messages_tx }, ChannelSource { messages_rx })
}

/// Handler passed to callback-based broker clients.
#[derive(Clone)]
pub struct MessageCallback {
    messages_tx: mpsc::Sender<Box<dyn BrokerMessage>>,
}

impl MessageCallback {
    /// Hands a received message to the ingestion loop, waiting for buffer space if necessary.
    ///
    /// # Errors
    ///
    /// If the ingestion loop has stopped, an error is returned and the message is dropped without being acknowledged.
    pub async fn on_message(&self, message: Box<dyn BrokerMessage>) -> Result<(), GenericError> {
        self.messages_tx
            .send(message)
            .await
            .map_err(|_| generic_error!("Ingestion loop has stopped."))
    }

    /// Returns `true` if the ingestion loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.messages_tx.is_closed()
    }
}

/// Pull side of a callback-driven source.
///
/// The source closes once every [`MessageCallback`] has been dropped and all buffered messages have been received.
pub struct ChannelSource {
    messages_rx: mpsc::Receiver<Box<dyn BrokerMessage>>,
}

#[async_trait]
impl Source for ChannelSource {
    async fn receive(&mut self) -> Result<Option<Box<dyn BrokerMessage>>, GenericError> {
        Ok(self.messages_rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, task::spawn};

    use super::*;
    use crate::message::test_util::{AckCounts, MockMessage};

    #[tokio::test]
    async fn callback_applies_backpressure() {
        let counts = AckCounts::default();
        let (callback, mut source) = callback_source(1);

        callback.on_message(MockMessage::new("1", "a", &counts).boxed()).await.unwrap();

        let mut blocked = spawn(callback.on_message(MockMessage::new("2", "b", &counts).boxed()));
        assert_pending!(blocked.poll());

        let first = source.receive().await.unwrap().unwrap();
        assert_eq!(first.id(), "1");

        assert!(blocked.is_woken());
        assert!(blocked.await.is_ok());
        assert_eq!(source.receive().await.unwrap().unwrap().id(), "2");
    }

    #[tokio::test]
    async fn source_closes_after_callbacks_drop() {
        let counts = AckCounts::default();
        let (callback, mut source) = callback_source(4);

        callback.on_message(MockMessage::new("1", "a", &counts).boxed()).await.unwrap();
        drop(callback);

        assert!(source.receive().await.unwrap().is_some());
        assert!(source.receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn callback_fails_once_source_is_gone() {
        let counts = AckCounts::default();
        let (callback, source) = callback_source(4);
        drop(source);

        assert!(callback.is_closed());
        assert!(callback.on_message(MockMessage::new("1", "a", &counts).boxed()).await.is_err());
        assert_eq!(counts.acks() + counts.nacks(), 0);
    }
}
