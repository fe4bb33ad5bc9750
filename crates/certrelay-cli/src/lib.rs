//! Command-line entrypoint wiring for the certificate relay.

pub mod bootstrap;
pub mod cli_args;
pub mod validation;

pub use bootstrap::{
    init_tracing, pacing_config, reset_credentials_if_requested, run_relay, session_config,
};
pub use cli_args::Cli;
pub use validation::validate_cli;
