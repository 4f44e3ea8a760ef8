use anyhow::{Result, bail};
use clap::Parser;
use std::path::PathBuf;

/// Mirrors the external CLI contract: one binary, one config file, a handful
/// of mutually exclusive run modes selected by flag rather than subcommand.
#[derive(Parser, Debug)]
#[command(
    name = "pve-backup-agent",
    about = "Scheduled configuration-state backup agent for Proxmox VE / PBS hosts",
    version = env!("CARGO_PKG_VERSION")
)]
pub struct Cli {
    #[arg(long, default_value = "/etc/pve-backup-agent/backup.conf")]
    pub config: PathBuf,

    #[arg(long)]
    pub log_level: Option<String>,

    #[arg(long)]
    pub dry_run: bool,

    /// Run the identity-setup wizard and exit.
    #[arg(long)]
    pub install: bool,

    /// Rotate the AGE identity, backing up the old one, and exit.
    #[arg(long)]
    pub newkey: bool,

    /// Decrypt a bundle to plaintext on disk and exit.
    #[arg(long, value_name = "BUNDLE")]
    pub decrypt: Option<PathBuf>,

    /// Enter the interactive restore workflow and exit.
    #[arg(long)]
    pub restore: bool,

    #[arg(long)]
    pub check_config: bool,

    #[arg(long)]
    pub print_config: bool,
}

#[derive(Debug)]
pub enum Mode {
    Backup,
    Install,
    NewKey,
    Decrypt(PathBuf),
    Restore,
    CheckConfig,
    PrintConfig,
}

impl Cli {
    pub fn mode(&self) -> Result<Mode> {
        let flags: Vec<(&str, bool)> = vec![
            ("install", self.install),
            ("newkey", self.newkey),
            ("decrypt", self.decrypt.is_some()),
            ("restore", self.restore),
            ("check-config", self.check_config),
            ("print-config", self.print_config),
        ];
        let set: Vec<&str> = flags.iter().filter(|(_, on)| *on).map(|(n, _)| *n).collect();
        if set.len() > 1 {
            bail!("flags are mutually exclusive, got: {}", set.join(", "));
        }
        Ok(match set.first() {
            None => Mode::Backup,
            Some(&"install") => Mode::Install,
            Some(&"newkey") => Mode::NewKey,
            Some(&"decrypt") => Mode::Decrypt(self.decrypt.clone().unwrap()),
            Some(&"restore") => Mode::Restore,
            Some(&"check-config") => Mode::CheckConfig,
            Some(&"print-config") => Mode::PrintConfig,
            Some(other) => unreachable!("unhandled mode flag: {other}"),
        })
    }
}
