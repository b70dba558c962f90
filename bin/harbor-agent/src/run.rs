use std::{sync::Arc, time::Duration};

use harbor_components::{destinations::LineWriter, sources::HttpPushSource};
use harbor_core::tracking;
use harbor_error::{ErrorContext as _, GenericError};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::AgentConfiguration;

const WRITER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs the agent until interrupted.
pub async fn run(config: AgentConfiguration) -> Result<(), GenericError> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        process_id = std::process::id(),
        "Harbor agent starting..."
    );

    // Sized like the admission pool, so admitted groups never wait on the writer for channel capacity.
    let capacity = config.http_push.ingest().max_undelivered_messages();
    let (tracker, groups, outcomes) = tracking::channel(capacity);

    let source = HttpPushSource::new(&config.http_push, Arc::new(tracker), outcomes)
        .error_context("Failed to create HTTP push source.")?;
    let mut writer = tokio::spawn(LineWriter::new(config.output, groups, tokio::io::stdout()).run());

    let report = source
        .run(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received SIGINT, shutting down..."),
                Err(e) => error!(error = %e, "Failed to listen for SIGINT. Shutting down..."),
            }
        })
        .await?;
    if report.abandoned > 0 {
        warn!(abandoned = report.abandoned, "Some metric groups were not written before shutdown.");
    }

    // The source no longer holds the tracker, so the writer sees its input close and flushes what's left.
    match timeout(WRITER_STOP_TIMEOUT, &mut writer).await {
        Ok(result) => result.error_context("Line writer task failed.")?,
        Err(_) => {
            writer.abort();
            warn!("Line writer did not stop in time.");
        }
    }

    Ok(())
}
