use metrics::{counter, gauge, Counter, Gauge};

use super::stage::StageError;

/// Internal telemetry for a single ingester.
#[derive(Clone)]
pub(super) struct IngestMetrics {
    pub received: Counter,
    pub dropped_oversized: Counter,
    pub dropped_malformed: Counter,
    pub dropped_empty: Counter,
    pub dropped_cancelled: Counter,
    pub dropped_submit_failed: Counter,
    pub rejected_unavailable: Counter,
    pub submitted: Counter,
    pub delivered: Counter,
    pub failed: Counter,
    pub resubmitted: Counter,
    pub abandoned: Counter,
    pub undelivered: Gauge,
}

impl IngestMetrics {
    pub fn new(source: &str) -> Self {
        let dropped = |reason: &'static str| {
            counter!("harbor_messages_dropped_total", "source" => source.to_string(), "reason" => reason)
        };

        Self {
            received: counter!("harbor_messages_received_total", "source" => source.to_string()),
            dropped_oversized: dropped("oversized"),
            dropped_malformed: dropped("malformed"),
            dropped_empty: dropped("empty"),
            dropped_cancelled: dropped("cancelled"),
            dropped_submit_failed: dropped("submit_failed"),
            rejected_unavailable: dropped("unavailable"),
            submitted: counter!("harbor_groups_submitted_total", "source" => source.to_string()),
            delivered: counter!("harbor_groups_delivered_total", "source" => source.to_string()),
            failed: counter!("harbor_groups_failed_total", "source" => source.to_string()),
            resubmitted: counter!("harbor_groups_resubmitted_total", "source" => source.to_string()),
            abandoned: counter!("harbor_groups_abandoned_total", "source" => source.to_string()),
            undelivered: gauge!("harbor_undelivered_groups", "source" => source.to_string()),
        }
    }

    pub fn dropped_for(&self, error: &StageError) -> &Counter {
        match error {
            StageError::PayloadTooLarge { .. } => &self.dropped_oversized,
            StageError::Decode { .. } | StageError::Parse { .. } => &self.dropped_malformed,
        }
    }
}
