//! Error reporting.

use std::{fmt, sync::Arc};

use harbor_error::{ErrorClass, GenericError};
use metrics::{counter, Counter};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// An error surfaced by an ingester.
#[derive(Debug)]
pub struct ReportedError {
    source_name: Arc<str>,
    class: ErrorClass,
    message_id: Option<String>,
    error: GenericError,
}

impl ReportedError {
    /// Returns the name of the ingester that reported the error.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Returns the class of the error.
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    /// Returns the identifier of the message the error relates to, if any.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Returns the underlying error.
    pub fn error(&self) -> &GenericError {
        &self.error
    }
}

impl fmt::Display for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} error: {:#}", self.source_name, self.class, self.error)
    }
}

/// Surfaces ingestion errors to the surrounding agent.
///
/// Every reported error is logged. If a reporting channel was attached, the error is also forwarded on it, so the
/// agent can observe errors without scraping logs. Reporting never blocks and never fails: if the receiving side of
/// the channel is gone, errors are only logged.
#[derive(Clone)]
pub struct ErrorReporter {
    source_name: Arc<str>,
    errors_tx: Option<mpsc::UnboundedSender<ReportedError>>,
    internal_errors: Counter,
}

impl ErrorReporter {
    /// Creates a new `ErrorReporter` that only logs errors.
    pub fn new<N: Into<Arc<str>>>(source_name: N) -> Self {
        let source_name = source_name.into();
        let internal_errors = counter!("harbor_internal_errors_total", "source" => source_name.to_string());
        Self {
            source_name,
            errors_tx: None,
            internal_errors,
        }
    }

    /// Creates a new `ErrorReporter` that also forwards errors to the returned receiver.
    pub fn with_channel<N: Into<Arc<str>>>(source_name: N) -> (Self, mpsc::UnboundedReceiver<ReportedError>) {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let mut reporter = Self::new(source_name);
        reporter.errors_tx = Some(errors_tx);
        (reporter, errors_rx)
    }

    /// Returns the name of the ingester errors are reported for.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Reports an error.
    pub fn report(&self, class: ErrorClass, message_id: Option<&str>, error: GenericError) {
        let chain = format!("{:#}", error);
        match class {
            ErrorClass::Internal => {
                self.internal_errors.increment(1);
                error!(
                    source = %self.source_name,
                    class = class.as_str(),
                    message_id,
                    error = %chain,
                    "Internal ingestion error."
                );
            }
            _ => {
                warn!(
                    source = %self.source_name,
                    class = class.as_str(),
                    message_id,
                    error = %chain,
                    "Ingestion error."
                );
            }
        }

        if let Some(errors_tx) = &self.errors_tx {
            let _ = errors_tx.send(ReportedError {
                source_name: Arc::clone(&self.source_name),
                class,
                message_id: message_id.map(str::to_string),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use harbor_error::generic_error;

    use super::*;

    #[test]
    fn forwards_reported_errors() {
        let (reporter, mut errors_rx) = ErrorReporter::with_channel("kafka");

        reporter.report(ErrorClass::Permanent, Some("msg-1"), generic_error!("payload too large"));
        reporter.report(ErrorClass::Internal, None, generic_error!("unknown tracking ID"));

        let first = errors_rx.try_recv().unwrap();
        assert_eq!(first.source_name(), "kafka");
        assert_eq!(first.class(), ErrorClass::Permanent);
        assert_eq!(first.message_id(), Some("msg-1"));
        assert_eq!(first.error().to_string(), "payload too large");
        assert_eq!(first.to_string(), "[kafka] permanent error: payload too large");

        let second = errors_rx.try_recv().unwrap();
        assert_eq!(second.class(), ErrorClass::Internal);
        assert!(second.message_id().is_none());
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (reporter, errors_rx) = ErrorReporter::with_channel("kafka");
        drop(errors_rx);

        reporter.report(ErrorClass::Transient, None, generic_error!("broker unreachable"));
        assert_eq!(reporter.source_name(), "kafka");
    }
}
