//! HTTP push source.
//!
//! Accepts metric payloads over HTTP and holds each request open until the metrics it carried were delivered, or
//! failed to be. The response status tells the sender whether to retry, so the sender's own retry policy takes the
//! place of broker redelivery.

use std::{
    future::{Future, IntoFuture as _},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use axum::Router;
use harbor_config::GenericConfiguration;
use harbor_core::{
    ingest::{CompletionSignal, IngestConfiguration, IngestHandle, Ingester},
    lifecycle::ShutdownReport,
    report::ErrorReporter,
    tracking::{DeliveryOutcome, SinkTracker},
};
use harbor_error::{generic_error, ErrorContext as _, GenericError};
use harbor_io::{decode::PayloadDecoder, ParserConfiguration};
use serde::Deserialize;
use tokio::{net::TcpListener, select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod handlers;
use self::handlers::{build_router, PushState};

const SOURCE_NAME: &str = "http_push";

const fn default_listen_address() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8186))
}

fn default_path() -> String {
    "/write".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    10
}

/// HTTP push source configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpPushConfiguration {
    /// Address to listen on.
    ///
    /// Defaults to `127.0.0.1:8186`.
    #[serde(default = "default_listen_address")]
    listen_address: SocketAddr,

    /// Path that accepts payloads.
    ///
    /// Defaults to `/write`.
    #[serde(default = "default_path")]
    path: String,

    /// Shared secret that senders must present in the `Authorization` header, as `Token <secret>` or
    /// `Bearer <secret>`.
    ///
    /// Defaults to unset, meaning requests are not authenticated.
    #[serde(default)]
    token: Option<String>,

    /// How long a request may wait for an admission slot before being rejected, in seconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_request_timeout_secs")]
    request_timeout_secs: u64,

    #[serde(flatten)]
    parser: ParserConfiguration,

    #[serde(flatten)]
    ingest: IngestConfiguration,
}

impl Default for HttpPushConfiguration {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            path: default_path(),
            token: None,
            request_timeout_secs: default_request_timeout_secs(),
            parser: ParserConfiguration::default(),
            ingest: IngestConfiguration::default(),
        }
    }
}

impl HttpPushConfiguration {
    /// Creates a new `HttpPushConfiguration` from the `http_push` section of the given configuration.
    ///
    /// A missing section yields the defaults.
    ///
    /// # Errors
    ///
    /// If the section cannot be deserialized, or holds invalid values, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let push = config.try_get_typed::<Self>(SOURCE_NAME)?.unwrap_or_default();
        push.validate()?;
        Ok(push)
    }

    /// Checks that the configuration is usable.
    ///
    /// # Errors
    ///
    /// If any value is out of range, an error is returned.
    pub fn validate(&self) -> Result<(), GenericError> {
        if !self.path.starts_with('/') {
            return Err(generic_error!("`path` must start with '/' (got '{}').", self.path));
        }
        if self.path == handlers::HEALTH_PATH {
            return Err(generic_error!("`path` cannot be '{}'.", handlers::HEALTH_PATH));
        }
        if matches!(self.token.as_deref(), Some("")) {
            return Err(generic_error!("`token` cannot be empty."));
        }
        self.ingest.validate()
    }

    /// Sets the address to listen on.
    pub fn with_listen_address(mut self, listen_address: SocketAddr) -> Self {
        self.listen_address = listen_address;
        self
    }

    /// Sets the shared secret required from senders.
    pub fn with_token<T: Into<String>>(mut self, token: T) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Sets the ingestion options.
    pub fn with_ingest(mut self, ingest: IngestConfiguration) -> Self {
        self.ingest = ingest;
        self
    }

    /// Returns the address to listen on.
    pub fn listen_address(&self) -> SocketAddr {
        self.listen_address
    }

    /// Returns the path that accepts payloads.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the ingestion options.
    pub fn ingest(&self) -> &IngestConfiguration {
        &self.ingest
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HTTP push source.
pub struct HttpPushSource {
    listen_address: SocketAddr,
    path: String,
    token: Option<Arc<str>>,
    request_timeout: Duration,
    body_limit: Option<usize>,
    ingester: Ingester,
}

impl HttpPushSource {
    /// Creates a new `HttpPushSource`.
    ///
    /// Metric groups are submitted to `tracker`, and `outcomes` must receive their delivery outcomes.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(
        config: &HttpPushConfiguration, tracker: Arc<dyn SinkTracker>, outcomes: mpsc::UnboundedReceiver<DeliveryOutcome>,
    ) -> Result<Self, GenericError> {
        config.validate()?;

        let ingester = Ingester::new(
            SOURCE_NAME,
            config.ingest.clone(),
            Arc::new(PayloadDecoder),
            config.parser.build(),
            tracker,
            outcomes,
        )?;

        Ok(Self {
            listen_address: config.listen_address,
            path: config.path.clone(),
            token: config.token.as_deref().map(Arc::from),
            request_timeout: config.request_timeout(),
            body_limit: config.ingest.max_message_len(),
            ingester,
        })
    }

    /// Sets the error reporter.
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.ingester = self.ingester.with_error_reporter(reporter);
        self
    }

    /// Starts ingestion, returning the router that serves push requests and the handle to the running ingester.
    ///
    /// Useful when the router is served by something other than [`run`][Self::run]. Must be called from within a Tokio
    /// runtime.
    pub fn into_router(self) -> (Router, IngestHandle<CompletionSignal>) {
        let (ingester, handle) = self.ingester.start_push(self.request_timeout);
        let state = PushState::new(ingester, self.token);
        (build_router(&self.path, self.body_limit, state), handle)
    }

    /// Serves push requests until `shutdown` completes, then shuts down gracefully.
    ///
    /// On shutdown, new requests are rejected while requests already in flight are held open until their metrics are
    /// resolved or the shutdown grace period elapses. The server stops once every open request has been answered.
    ///
    /// # Errors
    ///
    /// If the listener cannot be bound, or the server fails, an error is returned.
    pub async fn run<F>(self, shutdown: F) -> Result<ShutdownReport, GenericError>
    where
        F: Future<Output = ()>,
    {
        let listen_address = self.listen_address;
        let listener = TcpListener::bind(listen_address)
            .await
            .with_error_context(|| format!("Failed to bind HTTP push listener to {}.", listen_address))?;

        let path = self.path.clone();
        let (router, handle) = self.into_router();

        let server_stop = CancellationToken::new();
        let mut server = tokio::spawn(
            axum::serve(listener, router)
                .with_graceful_shutdown(server_stop.clone().cancelled_owned())
                .into_future(),
        );
        info!(%listen_address, %path, "HTTP push source listening.");

        let server_error = select! {
            _ = shutdown => None,
            result = &mut server => Some(flatten_server_result(result)),
        };

        info!("Stopping HTTP push source.");
        let report = handle.shutdown().await;
        server_stop.cancel();

        let result = match server_error {
            Some(result) => result.and_then(|()| Err(generic_error!("HTTP server stopped unexpectedly."))),
            None => flatten_server_result(server.await),
        };
        if let Err(e) = result {
            error!(error = %e, "HTTP push source failed.");
            return Err(e);
        }

        info!(drained = report.drained, abandoned = report.abandoned, "HTTP push source stopped.");
        Ok(report)
    }
}

fn flatten_server_result(
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), GenericError> {
    result
        .error_context("HTTP server task failed.")?
        .error_context("HTTP server failed.")
}
