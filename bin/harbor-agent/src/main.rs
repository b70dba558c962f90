//! Harbor agent.
//!
//! Accepts metrics pushed over HTTP and writes them to stdout as line protocol, holding each request open until its
//! metrics were written.

#![deny(warnings)]
#![deny(missing_docs)]

use clap::Parser as _;
use harbor_app::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
use tracing::{error, info};

mod config;
use self::config::{load_configuration, Action, AgentConfiguration, Cli};

mod run;
use self::run::run;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let action = cli.action.unwrap_or_default();

    let configuration = match load_configuration(action.config_path()) {
        Ok(configuration) => configuration,
        Err(e) => fatal_and_exit(format!("failed to load configuration: {:#}", e)),
    };

    let logging_config = match LoggingConfiguration::try_from_config(&configuration) {
        Ok(logging_config) => logging_config,
        Err(e) => fatal_and_exit(format!("failed to load logging configuration: {}", e)),
    };
    if let Err(e) = initialize_logging(&logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {:#}", e));
    }

    let agent_config = match AgentConfiguration::from_configuration(&configuration) {
        Ok(agent_config) => agent_config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    match action {
        Action::Validate(_) => info!("Configuration is valid."),
        Action::Run(_) => match run(agent_config).await {
            Ok(()) => info!("Harbor agent stopped."),
            Err(e) => {
                error!("{:?}", e);
                std::process::exit(1);
            }
        },
    }
}
