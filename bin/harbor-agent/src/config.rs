use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use harbor_components::{destinations::LineWriterConfiguration, sources::HttpPushConfiguration};
use harbor_config::{ConfigurationLoader, GenericConfiguration};
use harbor_error::{ErrorContext as _, GenericError};

const DEFAULT_CONFIG_PATH: &str = "/etc/harbor/harbor.toml";

/// Prefix of environment variables that override configuration values.
const ENV_PREFIX: &str = "HARBOR";

#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand)]
pub enum Action {
    /// Runs the agent. (default)
    Run(ConfigArgs),

    /// Checks the configuration and exits.
    Validate(ConfigArgs),
}

impl Action {
    pub fn config_path(&self) -> &Path {
        match self {
            Self::Run(args) | Self::Validate(args) => &args.config,
        }
    }
}

impl Default for Action {
    fn default() -> Self {
        Self::Run(ConfigArgs {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
        })
    }
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to the configuration file.
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Loads the configuration file at `path`, with `HARBOR_`-prefixed environment variables layered on top.
pub fn load_configuration(path: &Path) -> Result<GenericConfiguration, GenericError> {
    let loader = ConfigurationLoader::default()
        .from_toml(path)
        .error_context("Failed to load configuration file.")?
        .from_environment(ENV_PREFIX)?;

    Ok(loader.into_generic())
}

/// Agent configuration.
pub struct AgentConfiguration {
    pub http_push: HttpPushConfiguration,
    pub output: LineWriterConfiguration,
}

impl AgentConfiguration {
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let mut http_push =
            HttpPushConfiguration::from_configuration(config).error_context("Invalid `http_push` configuration.")?;

        // Environment variables can't express nesting, so `HARBOR_HTTP_PUSH_TOKEN` only exists as the flat key
        // `http_push_token`, and has to be applied on top of the section by hand.
        if let Some(listen_address) = config.try_get_typed::<SocketAddr>("http_push_listen_address")? {
            http_push = http_push.with_listen_address(listen_address);
        }
        if let Some(token) = config.try_get_typed::<String>("http_push_token")? {
            http_push = http_push.with_token(token);
            http_push.validate()?;
        }

        let output =
            LineWriterConfiguration::from_configuration(config).error_context("Invalid `output` configuration.")?;

        Ok(Self { http_push, output })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_sections() {
        let config = ConfigurationLoader::default()
            .from_toml_str(
                r#"
                [http_push]
                listen_address = "0.0.0.0:9100"
                token = "from-file"

                [output]
                batch_size = 10
                "#,
            )
            .into_generic();
        let agent = AgentConfiguration::from_configuration(&config).unwrap();

        assert_eq!(agent.http_push.listen_address().port(), 9100);
    }

    #[test]
    fn flat_keys_override_sections() {
        let config = ConfigurationLoader::default()
            .from_toml_str(
                r#"
                http_push_listen_address = "127.0.0.1:9200"

                [http_push]
                listen_address = "0.0.0.0:9100"
                "#,
            )
            .into_generic();
        let agent = AgentConfiguration::from_configuration(&config).unwrap();

        assert_eq!(agent.http_push.listen_address(), "127.0.0.1:9200".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn cli_defaults_to_run() {
        let cli = Cli::parse_from(["harbor-agent"]);
        let action = cli.action.unwrap_or_default();
        assert!(matches!(action, Action::Run(_)));
        assert_eq!(action.config_path(), Path::new(DEFAULT_CONFIG_PATH));

        let cli = Cli::parse_from(["harbor-agent", "validate", "--config", "/tmp/harbor.toml"]);
        let action = cli.action.unwrap_or_default();
        assert!(matches!(action, Action::Validate(_)));
        assert_eq!(action.config_path(), Path::new("/tmp/harbor.toml"));
    }
}
