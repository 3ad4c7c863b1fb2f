mod cli;
mod error;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use portward_api::{ModelApi, Provider, RestModel, RestProvider};
use portward_config::Settings;
use portward_core::{Firewaller, FirewallMode};

use crate::cli::{Cli, Command, RunArgs};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

/// Install the tracing subscriber. Precedence: `RUST_LOG`, then the
/// verbosity flags, then the configured default filter.
fn init_tracing(verbose: u8, quiet: bool, settings: &Settings) {
    let fallback = match (quiet, verbose) {
        (true, _) => "error".to_string(),
        (false, 0) => settings
            .log
            .filter
            .clone()
            .unwrap_or_else(|| "info".to_string()),
        (false, 1) => "debug".to_string(),
        (false, _) => "trace".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Completions(args) => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(args.shell, &mut cmd, "portward", &mut std::io::stdout());
            Ok(())
        }

        Command::CheckConfig => {
            let settings = portward_config::load_settings(cli.global.config.as_deref())?;
            init_tracing(cli.global.verbose, cli.global.quiet, &settings);
            check_config(&settings)
        }

        Command::Run(args) => {
            let settings = portward_config::load_settings(cli.global.config.as_deref())?;
            init_tracing(cli.global.verbose, cli.global.quiet, &settings);
            run_worker(&settings, args).await
        }
    }
}

/// Validate the settings and print the effective configuration with
/// secrets redacted.
fn check_config(settings: &Settings) -> Result<(), CliError> {
    let mode = portward_config::firewall_mode(settings)?;
    let model = portward_config::client_config(&settings.model, "model")?;
    let provider = portward_config::client_config(&settings.provider, "provider")?;
    let (initial, max) = portward_config::restart_backoff(settings);

    println!("firewall-mode:     {mode}");
    println!("model endpoint:    {}", model.base_url);
    println!(
        "model api-key:     {}",
        if model.api_key.is_some() { "<set>" } else { "<unset>" }
    );
    println!("provider endpoint: {}", provider.base_url);
    println!(
        "provider api-key:  {}",
        if provider.api_key.is_some() { "<set>" } else { "<unset>" }
    );
    println!("restart backoff:   {}s to {}s", initial.as_secs(), max.as_secs());
    println!("configuration OK");
    Ok(())
}

/// Run the worker under supervision: a fatal worker error is logged and
/// the worker restarted from scratch after an exponential backoff.
async fn run_worker(settings: &Settings, args: RunArgs) -> Result<(), CliError> {
    let mode: FirewallMode = match args.mode {
        Some(mode) => mode.into(),
        None => portward_config::firewall_mode(settings)?,
    };
    let model_config = portward_config::client_config(&settings.model, "model")?;
    let provider_config = portward_config::client_config(&settings.provider, "provider")?;

    let model: Arc<dyn ModelApi> = Arc::new(RestModel::new(&model_config)?);
    let environ: Arc<dyn Provider> = Arc::new(RestProvider::new(&provider_config)?);

    let (initial_delay, max_delay) = portward_config::restart_backoff(settings);
    let mut delay = initial_delay;

    info!(%mode, "starting firewall reconciliation worker");
    loop {
        let firewaller = Firewaller::new(Arc::clone(&model), Arc::clone(&environ), mode);
        let cancel = firewaller.cancel_token();
        let mut worker = tokio::spawn(firewaller.run());

        tokio::select! {
            result = &mut worker => {
                match result {
                    Ok(Ok(())) => {
                        info!("worker stopped cleanly");
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, delay_secs = delay.as_secs(), "worker failed; restarting");
                    }
                    Err(e) => {
                        error!(error = %e, delay_secs = delay.as_secs(), "worker task aborted; restarting");
                    }
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                cancel.cancel();
                let _ = worker.await;
                return Ok(());
            }
        }
    }
}
