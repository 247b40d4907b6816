//! Thin command-line frontend: loads the system configuration, submits one
//! install request to the engine, and streams status messages until the
//! install reaches a terminal state.

use std::{process::ExitCode, sync::Arc};

use clap::Parser;
use eyre::WrapErr as _;
use figment::providers::Format as _;
use rauc_engine::{install_run, logging, Context, InstallRequest, UpdateSource};
use rauc_engine_core::config::{SystemConfig, SystemConfigFile};
use tracing::{debug, error};

const CFG_DEFAULT_PATH: &str = "/etc/rauc/system.toml";
const ENV_VAR_PREFIX: &str = "RAUC_ENGINE_";

/// Installs an update bundle onto the inactive slot set of this system.
#[derive(Debug, Parser)]
#[command(author, version)]
struct Args {
    /// Path to the system config file.
    #[arg(long)]
    config: Option<String>,
    /// Local `.raucb` bundle path, or the URL of a remote manifest.
    source: String,
}

fn main() -> ExitCode {
    logging::init();

    let args = Args::parse();
    match run(&args) {
        Ok(status) if status == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> eyre::Result<i32> {
    let config_path = args.config.as_deref().unwrap_or(CFG_DEFAULT_PATH);
    debug!("loading system config from `{config_path}`");

    // Environment variables override the config file, mirroring the usual
    // layering for service configuration.
    let file: SystemConfigFile = figment::Figment::new()
        .merge(figment::providers::Toml::file(config_path))
        .merge(figment::providers::Env::prefixed(ENV_VAR_PREFIX))
        .extract()
        .wrap_err_with(|| format!("failed reading system config at `{config_path}`"))?;
    let config = SystemConfig::from_parts(config_path, file)
        .wrap_err("failed validating system config")?;

    let source = UpdateSource::parse(&args.source)
        .wrap_err("failed parsing update source")?;

    let ctx = Arc::new(
        Context::builder(config)
            .build()
            .wrap_err("failed assembling engine context")?,
    );
    let request = Arc::new(InstallRequest::new(source));
    let status = request.status_messages().clone();

    let handle = install_run(Arc::clone(&ctx), Arc::clone(&request))
        .wrap_err("failed starting install")?;

    for message in status.iter() {
        println!("{message}");
        if message == "finished" {
            break;
        }
    }
    handle.join();

    if let Some(last_error) = ctx.last_error() {
        error!("install failed: {last_error}");
    }
    Ok(request.result())
}
