//! Logging.

use harbor_config::{ConfigurationError, GenericConfiguration};
use harbor_error::{generic_error, GenericError};
use serde::Deserialize;
use tracing::{level_filters::LevelFilter, Subscriber};
use tracing_subscriber::{
    layer::SubscriberExt as _, registry::LookupSpan, util::SubscriberInitExt as _, EnvFilter, Layer,
};

const LOG_LEVEL_ENV_VAR: &str = "HARBOR_LOG_LEVEL";
const LOG_FORMAT_JSON_ENV_VAR: &str = "HARBOR_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

const fn default_log_level() -> LevelFilter {
    LevelFilter::INFO
}

/// Logging configuration.
///
/// Read from the `agent` section of the configuration. The `HARBOR_LOG_LEVEL` and `HARBOR_LOG_FORMAT_JSON`
/// environment variables take precedence over configured values.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct LoggingConfiguration {
    /// Default filtering directive.
    ///
    /// Accepts anything `EnvFilter` does, so per-target directives such as `info,harbor_core=debug` work too.
    ///
    /// Defaults to `info`.
    #[serde(default)]
    log_level: Option<String>,

    /// Whether to emit logs as JSON.
    ///
    /// Defaults to `false`, which emits human-readable output.
    #[serde(default)]
    log_format_json: bool,
}

impl LoggingConfiguration {
    /// Reads the logging configuration from the `agent` section of the given configuration.
    ///
    /// # Errors
    ///
    /// If the section exists but cannot be deserialized, an error will be returned.
    pub fn try_from_config(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        let mut logging = config
            .try_get_typed::<LoggingConfiguration>("agent")?
            .unwrap_or_default();

        if let Some(is_json) = json_format_override() {
            logging.log_format_json = is_json;
        }

        Ok(logging)
    }

    /// Returns `true` if logs should be emitted as JSON.
    pub fn is_json(&self) -> bool {
        self.log_format_json
    }

    fn build_filter(&self) -> Result<EnvFilter, GenericError> {
        let builder = EnvFilter::builder().with_default_directive(default_log_level().into());

        // The environment variable always wins, and is parsed leniently like any other `RUST_LOG`-style variable.
        if std::env::var_os(LOG_LEVEL_ENV_VAR).is_some() {
            return Ok(builder.with_env_var(LOG_LEVEL_ENV_VAR).from_env_lossy());
        }

        match self.log_level.as_deref() {
            Some(directives) => builder
                .parse(directives)
                .map_err(|e| generic_error!("Invalid log level '{}': {}", directives, e)),
            None => Ok(builder.parse_lossy("")),
        }
    }
}

fn json_format_override() -> Option<bool> {
    std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .ok()
        .map(|s| s.trim().to_lowercase())
        .map(|s| s == "true" || s == "1")
}

/// Initializes the logging subsystem for `tracing`.
///
/// Logs are written to standard output, either as JSON (one object per line) or in a human-readable format.
///
/// # Errors
///
/// If the log level directives are invalid, or if the logging subsystem was already initialized, an error will be
/// returned.
pub fn initialize_logging(config: &LoggingConfiguration) -> Result<(), GenericError> {
    let level_filter = config.build_filter()?;

    if config.log_format_json {
        tracing_subscriber::registry()
            .with(initialize_tracing_json().with_filter(level_filter))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(initialize_tracing_pretty().with_filter(level_filter))
            .try_init()?;
    }

    Ok(())
}

fn initialize_tracing_json<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

fn initialize_tracing_pretty<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new().with_target(true)
}
