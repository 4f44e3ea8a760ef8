mod archive;
mod bundle;
mod checksum;
mod cli;
mod collector;
mod config;
mod errors;
mod fsprobe;
mod hostname;
mod identity;
mod logging;
mod metrics;
mod notify;
mod orchestrator;
mod preflight;
mod restore;
mod retention;
mod security;
mod signals;
mod storage;
mod ui;
mod utils;

use anyhow::Result;
use clap::Parser;
use std::path::Path;

use cli::{Cli, Mode};
use config::Config;
use identity::IdentityPaths;
use utils::cancel::CancellationToken;

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(()) => 0,
        Err(e) => {
            let code = signals::caught_signal()
                .map(|signo| 128 + signo)
                .unwrap_or_else(|| errors::exit_code_for(&e));
            tracing::error!(error = format!("{e:#}"), "run failed");
            code
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    let cfg = Config::load(&cli.config)?;
    logging::init(cli.log_level.as_deref(), &cfg.log_file)?;

    match cli.mode()? {
        Mode::Backup => {
            let cfg = if cli.dry_run { Config { dry_run: true, ..cfg } } else { cfg };
            let cancel = CancellationToken::new();
            signals::install(&cancel)?;
            orchestrator::run(&cfg, &cancel)?;
        }
        Mode::Install => {
            identity::run_wizard(&identity_paths(cli))?;
        }
        Mode::NewKey => {
            identity::rotate(&identity_paths(cli))?;
        }
        Mode::Decrypt(bundle_path) => {
            restore::decrypt_bundle(&bundle_path)?;
        }
        Mode::Restore => {
            restore::interactive_restore(&cfg)?;
        }
        Mode::CheckConfig => {
            tracing::info!("config OK");
        }
        Mode::PrintConfig => {
            println!("{}", cfg.to_redacted_summary());
        }
    }
    Ok(())
}

/// `IdentityPaths` always lives under the config file's own directory, the
/// same base relative config paths resolve against — the operator points
/// `AGE_RECIPIENTS_FILE`/`AGE_IDENTITY_FILE` at the wizard's output.
fn identity_paths(cli: &Cli) -> IdentityPaths {
    let base_dir = cli
        .config
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    IdentityPaths::new(base_dir)
}
