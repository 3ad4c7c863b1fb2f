//! CLI error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use portward_config::ConfigError;
use portward_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONFIG: i32 = 3;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error(transparent)]
    #[diagnostic(
        code(portward::config),
        help(
            "Check the settings file (portward --config <path> check-config)\n\
             or the PORTWARD_* environment overrides."
        )
    )]
    Config(#[from] ConfigError),

    #[error("could not reach the facade")]
    #[diagnostic(
        code(portward::connection),
        help("Check that the endpoint is running and the API key is valid.")
    )]
    Api(#[from] portward_api::Error),

    #[error("worker stopped with an unrecoverable error")]
    #[diagnostic(code(portward::worker))]
    Worker(#[from] CoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to a process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(ConfigError::Validation { .. }) => exit_code::USAGE,
            Self::Config(_) => exit_code::CONFIG,
            Self::Api(_) => exit_code::CONNECTION,
            Self::Worker(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}
