use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

/// Which compressor binary to shell out to when archiving. `None` disables
/// compression; the archive is then a bare `.tar`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    None,
    Gzip,
    Pigz,
    Bzip2,
    Xz,
    Lzma,
    Zstd,
}

impl Compressor {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => Compressor::None,
            "gzip" => Compressor::Gzip,
            "pigz" => Compressor::Pigz,
            "bzip2" => Compressor::Bzip2,
            "xz" => Compressor::Xz,
            "lzma" => Compressor::Lzma,
            "zstd" => Compressor::Zstd,
            other => bail!("unknown COMPRESSION '{other}'"),
        })
    }

    pub fn binary(self) -> &'static str {
        match self {
            Compressor::None => "",
            Compressor::Gzip => "gzip",
            Compressor::Pigz => "pigz",
            Compressor::Bzip2 => "bzip2",
            Compressor::Xz => "xz",
            Compressor::Lzma => "lzma",
            Compressor::Zstd => "zstd",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Compressor::None => "",
            Compressor::Gzip | Compressor::Pigz => "gz",
            Compressor::Bzip2 => "bz2",
            Compressor::Xz => "xz",
            Compressor::Lzma => "lzma",
            Compressor::Zstd => "zst",
        }
    }

    /// Lowercase token accepted by `parse`, used for the manifest's
    /// `compression_type` field instead of a `Debug`-derived label.
    pub fn as_str(self) -> &'static str {
        match self {
            Compressor::None => "none",
            Compressor::Gzip => "gzip",
            Compressor::Pigz => "pigz",
            Compressor::Bzip2 => "bzip2",
            Compressor::Xz => "xz",
            Compressor::Lzma => "lzma",
            Compressor::Zstd => "zstd",
        }
    }
}

/// Coarse compression profile used to pick a concrete level (and, for some
/// compressors, extra flags) when `COMPRESSION_LEVEL` isn't given explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    Fast,
    Standard,
    Maximum,
    Ultra,
}

impl CompressionMode {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "fast" => CompressionMode::Fast,
            "standard" => CompressionMode::Standard,
            "maximum" => CompressionMode::Maximum,
            "ultra" => CompressionMode::Ultra,
            other => bail!("unknown COMPRESSION_MODE '{other}'"),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompressionMode::Fast => "fast",
            CompressionMode::Standard => "standard",
            CompressionMode::Maximum => "maximum",
            CompressionMode::Ultra => "ultra",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub requested: Compressor,
    pub level: Option<u32>,
    pub mode: CompressionMode,
    pub threads: Option<u32>,
}

#[derive(Clone, PartialEq, Eq)]
pub enum EncryptionMode {
    None,
    Recipients,
    Passphrase,
}

#[derive(Debug, Clone)]
pub struct EncryptionConfig {
    pub mode: EncryptionMode,
    pub recipients_file: Option<PathBuf>,
    pub identity_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    Simple,
    Gfs,
}

#[derive(Debug, Clone)]
pub struct GfsQuotas {
    pub daily: u32,
    pub weekly: u32,
    pub monthly: u32,
    pub yearly: u32,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub mode: RetentionMode,
    pub keep_count: u32,
    pub gfs: GfsQuotas,
}

#[derive(Debug, Clone)]
pub struct LocalTierConfig {
    pub dir: PathBuf,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone)]
pub struct SecondaryTierConfig {
    pub path: PathBuf,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone)]
pub struct CloudTierConfig {
    pub remote: String,
    pub remote_path: String,
    pub log_path: Option<PathBuf>,
    pub transfer_tool: PathBuf,
    pub connection_timeout: Duration,
    pub operation_timeout: Duration,
    pub delete_timeout: Duration,
    pub retry_count: u32,
    pub batch_delete_size: u32,
    pub batch_pause: Duration,
    pub retention: RetentionConfig,
}

/// Which Proxmox product this host runs, used to pick the right
/// version-probe command and to label the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxmoxType {
    Pve,
    Pbs,
}

impl ProxmoxType {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "pve" => ProxmoxType::Pve,
            "pbs" => ProxmoxType::Pbs,
            other => bail!("unknown PROXMOX_TYPE '{other}'"),
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxmoxType::Pve => "pve",
            ProxmoxType::Pbs => "pbs",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub on_success: bool,
    pub on_failure: bool,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub textfile_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub staging_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub log_file: PathBuf,
    pub max_lock_age: Duration,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
    pub local: Option<LocalTierConfig>,
    pub secondary: Option<SecondaryTierConfig>,
    pub cloud: Option<CloudTierConfig>,
    pub notify: NotifyConfig,
    pub metrics: MetricsConfig,
    pub dry_run: bool,
    pub proxmox_type: ProxmoxType,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let map = parse_env_file(&raw)?;
        let n = Normalizer { base_dir, map: &map };
        Self::from_map(&n)
    }

    fn from_map(n: &Normalizer) -> Result<Self> {
        let staging_dir = n.resolve(n.require("STAGING_DIR")?);
        let lock_dir = n
            .opt("LOCK_DIR")
            .map(|s| n.resolve(s))
            .unwrap_or_else(|| PathBuf::from("/var/lock/pve-backup-agent"));
        let log_file = n
            .opt("LOG_FILE")
            .map(|s| n.resolve(s))
            .unwrap_or_else(|| PathBuf::from("/var/log/pve-backup-agent.log"));
        let max_lock_age = n
            .opt("MAX_LOCK_AGE")
            .map(|s| parse_duration(s))
            .transpose()?
            .unwrap_or(Duration::from_secs(2 * 3600));

        let compression = CompressionConfig {
            requested: n
                .opt("COMPRESSION")
                .map(Compressor::parse)
                .transpose()?
                .unwrap_or(Compressor::Gzip),
            level: n.opt("COMPRESSION_LEVEL").map(|s| parse_u32(s, "COMPRESSION_LEVEL")).transpose()?,
            mode: n
                .opt("COMPRESSION_MODE")
                .map(CompressionMode::parse)
                .transpose()?
                .unwrap_or(CompressionMode::Standard),
            threads: n.opt("COMPRESSION_THREADS").map(|s| parse_u32(s, "COMPRESSION_THREADS")).transpose()?,
        };

        let mode = match n.opt("ENCRYPTION_MODE").unwrap_or("none") {
            "none" => EncryptionMode::None,
            "recipients" => EncryptionMode::Recipients,
            "passphrase" => EncryptionMode::Passphrase,
            other => bail!("unknown ENCRYPTION_MODE '{other}'"),
        };
        if mode == EncryptionMode::Recipients && n.opt("AGE_RECIPIENTS_FILE").is_none() {
            bail!("ENCRYPTION_MODE=recipients requires AGE_RECIPIENTS_FILE");
        }
        let encryption = EncryptionConfig {
            mode,
            recipients_file: n.opt("AGE_RECIPIENTS_FILE").map(|s| n.resolve(s)),
            identity_file: n.opt("AGE_IDENTITY_FILE").map(|s| n.resolve(s)),
        };

        let local = if n.bool_flag("ENABLE_LOCAL", true)? {
            Some(LocalTierConfig {
                dir: n.resolve(n.require("LOCAL_BACKUP_DIR")?),
                retention: n.retention_for("LOCAL")?,
            })
        } else {
            None
        };

        let secondary = if n.bool_flag("ENABLE_SECONDARY", false)? {
            Some(SecondaryTierConfig {
                path: n.resolve(n.require("SECONDARY_PATH")?),
                retention: n.retention_for("SECONDARY")?,
            })
        } else {
            None
        };

        let cloud = if n.bool_flag("ENABLE_CLOUD", false)? {
            Some(CloudTierConfig {
                remote: n.require("CLOUD_REMOTE")?.to_string(),
                remote_path: n.require("CLOUD_REMOTE_PATH")?.to_string(),
                log_path: n.opt("CLOUD_LOG_PATH").map(|s| n.resolve(s)),
                transfer_tool: n
                    .opt("CLOUD_TRANSFER_TOOL")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("rclone")),
                connection_timeout: n
                    .opt("CLOUD_CONNECTION_TIMEOUT")
                    .map(parse_duration)
                    .transpose()?
                    .unwrap_or(Duration::from_secs(30)),
                operation_timeout: n
                    .opt("CLOUD_OPERATION_TIMEOUT")
                    .map(parse_duration)
                    .transpose()?
                    .unwrap_or(Duration::from_secs(300)),
                delete_timeout: n
                    .opt("CLOUD_DELETE_TIMEOUT")
                    .map(parse_duration)
                    .transpose()?
                    .unwrap_or(Duration::from_secs(300)),
                retry_count: n.opt("CLOUD_RETRY_COUNT").map(|s| parse_u32(s, "CLOUD_RETRY_COUNT")).transpose()?.unwrap_or(3),
                batch_delete_size: n
                    .opt("CLOUD_BATCH_DELETE_SIZE")
                    .map(|s| parse_u32(s, "CLOUD_BATCH_DELETE_SIZE"))
                    .transpose()?
                    .unwrap_or(50),
                batch_pause: n
                    .opt("CLOUD_BATCH_PAUSE")
                    .map(parse_duration)
                    .transpose()?
                    .unwrap_or(Duration::from_secs(1)),
                retention: n.retention_for("CLOUD")?,
            })
        } else {
            None
        };

        if local.is_none() && secondary.is_none() && cloud.is_none() {
            bail!("at least one storage tier (LOCAL, SECONDARY, CLOUD) must be enabled");
        }

        let notify = NotifyConfig {
            enabled: n.bool_flag("NOTIFY_ENABLED", false)?,
            on_success: n.bool_flag("NOTIFY_ON_SUCCESS", true)?,
            on_failure: n.bool_flag("NOTIFY_ON_FAILURE", true)?,
        };

        let metrics = MetricsConfig {
            enabled: n.bool_flag("METRICS_ENABLED", false)?,
            textfile_path: n.opt("METRICS_TEXTFILE_PATH").map(|s| n.resolve(s)),
        };

        let dry_run = n.bool_flag("DRY_RUN", false)?;

        let proxmox_type = n
            .opt("PROXMOX_TYPE")
            .map(ProxmoxType::parse)
            .transpose()?
            .unwrap_or(ProxmoxType::Pve);

        Ok(Self {
            staging_dir,
            lock_dir,
            log_file,
            max_lock_age,
            compression,
            encryption,
            local,
            secondary,
            cloud,
            notify,
            metrics,
            dry_run,
            proxmox_type,
        })
    }

    pub fn to_redacted_summary(&self) -> String {
        let mut out = BTreeMap::new();
        out.insert("staging_dir", self.staging_dir.display().to_string());
        out.insert("lock_dir", self.lock_dir.display().to_string());
        out.insert("log_file", self.log_file.display().to_string());
        out.insert("max_lock_age", humantime::format_duration(self.max_lock_age).to_string());
        out.insert("compression", format!("{:?}", self.compression.requested));
        out.insert("compression_mode", self.compression.mode.as_str().to_string());
        out.insert("encryption_mode", format!("{:?}", self.encryption.mode));
        out.insert("local_enabled", self.local.is_some().to_string());
        out.insert("secondary_enabled", self.secondary.is_some().to_string());
        out.insert("cloud_enabled", self.cloud.is_some().to_string());
        out.insert("notify_enabled", self.notify.enabled.to_string());
        out.insert("metrics_enabled", self.metrics.enabled.to_string());
        out.insert("dry_run", self.dry_run.to_string());
        out.insert("proxmox_type", self.proxmox_type.as_str().to_string());
        out.into_iter()
            .map(|(k, v)| format!("{k} = {v}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl std::fmt::Debug for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EncryptionMode::None => "none",
            EncryptionMode::Recipients => "recipients",
            EncryptionMode::Passphrase => "passphrase",
        };
        write!(f, "{s}")
    }
}

impl EncryptionMode {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "none" => EncryptionMode::None,
            "recipients" => EncryptionMode::Recipients,
            "passphrase" => EncryptionMode::Passphrase,
            other => bail!("unknown encryption mode '{other}'"),
        })
    }
}

struct Normalizer<'a> {
    base_dir: &'a Path,
    map: &'a BTreeMap<String, String>,
}

impl<'a> Normalizer<'a> {
    fn opt(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    fn require(&self, key: &str) -> Result<&'a str> {
        self.opt(key).ok_or_else(|| anyhow!("missing required config key {key}"))
    }

    fn resolve(&self, p: &str) -> PathBuf {
        let pb = PathBuf::from(p.trim());
        if pb.is_absolute() {
            pb
        } else {
            self.base_dir.join(pb)
        }
    }

    fn bool_flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.opt(key) {
            None => Ok(default),
            Some(s) => match s.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                other => bail!("invalid boolean for {key}: '{other}'"),
            },
        }
    }

    fn retention_for(&self, prefix: &str) -> Result<RetentionConfig> {
        let mode = match self.opt(&format!("{prefix}_RETENTION_MODE")).unwrap_or("simple") {
            "simple" => RetentionMode::Simple,
            "gfs" => RetentionMode::Gfs,
            other => bail!("unknown {prefix}_RETENTION_MODE '{other}'"),
        };
        let keep_count = self
            .opt(&format!("{prefix}_RETENTION_COUNT"))
            .map(|s| parse_u32(s, "RETENTION_COUNT"))
            .transpose()?
            .unwrap_or(7);
        let gfs = GfsQuotas {
            daily: self.gfs_quota(prefix, "DAILY", 7)?,
            weekly: self.gfs_quota(prefix, "WEEKLY", 4)?,
            monthly: self.gfs_quota(prefix, "MONTHLY", 12)?,
            yearly: self.gfs_quota(prefix, "YEARLY", 5)?,
        };
        Ok(RetentionConfig { mode, keep_count, gfs })
    }

    fn gfs_quota(&self, prefix: &str, period: &str, default: u32) -> Result<u32> {
        self.opt(&format!("{prefix}_GFS_{period}"))
            .map(|s| parse_u32(s, "GFS quota"))
            .transpose()
            .map(|v| v.unwrap_or(default))
    }
}

fn parse_u32(s: &str, field: &str) -> Result<u32> {
    s.trim().parse::<u32>().with_context(|| format!("invalid {field}: '{s}'"))
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim()).with_context(|| format!("invalid duration '{s}'"))
}

/// Deprecated keys kept working with a one-time warning, pointing at the
/// replacement used by `from_map`.
const DEPRECATED_ALIASES: &[(&str, &str)] = &[
    ("BACKUP_DIR", "LOCAL_BACKUP_DIR"),
    ("RETENTION_COUNT", "LOCAL_RETENTION_COUNT"),
    ("GPG_RECIPIENTS_FILE", "AGE_RECIPIENTS_FILE"),
];

/// Parses the flat `KEY=value` config format: `#` line comments, blank lines
/// ignored, `$VAR` / `${VAR}` expanded against the process environment
/// before assignment.
fn parse_env_file(src: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for (lineno, raw_line) in src.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| anyhow!("config line {}: missing '=': {raw_line}", lineno + 1))?;
        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit()) {
            bail!("config line {}: invalid key '{key}'", lineno + 1);
        }
        let value = expand_vars(value.trim().trim_matches('"'));
        let key = DEPRECATED_ALIASES
            .iter()
            .find(|(old, _)| *old == key)
            .map(|(old, new)| {
                tracing::warn!(old, new, "deprecated config key, use the replacement");
                new.to_string()
            })
            .unwrap_or_else(|| key.to_string());
        map.insert(key, value);
    }
    Ok(map)
}

fn expand_vars(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            for c2 in chars.by_ref() {
                if c2 == '}' {
                    break;
                }
                name.push(c2);
            }
            out.push_str(&std::env::var(&name).unwrap_or_default());
        } else {
            let mut name = String::new();
            while let Some(&c2) = chars.peek() {
                if c2.is_ascii_alphanumeric() || c2 == '_' {
                    name.push(c2);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push_str(&std::env::var(&name).unwrap_or_default());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, s: &str) {
        std::fs::write(path, s).unwrap();
    }

    #[test]
    fn load_minimal_ok() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        let cfg_path = dir.join("backup.conf");
        write(
            &cfg_path,
            "STAGING_DIR=stage\nLOCAL_BACKUP_DIR=local\n",
        );
        let cfg = Config::load(&cfg_path).expect("load ok");
        assert_eq!(cfg.staging_dir, dir.join("stage"));
        assert!(cfg.local.is_some());
        assert_eq!(cfg.local.unwrap().dir, dir.join("local"));
    }

    #[test]
    fn comments_and_blank_lines_ignored() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("backup.conf");
        write(
            &cfg_path,
            "# comment\n\nSTAGING_DIR=stage\n  # indented comment\nLOCAL_BACKUP_DIR=local\n",
        );
        Config::load(&cfg_path).expect("load ok despite comments/blank lines");
    }

    #[test]
    fn var_expansion_works() {
        unsafe { std::env::set_var("PVE_BACKUP_TEST_VAR", "expanded") };
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("backup.conf");
        write(
            &cfg_path,
            "STAGING_DIR=stage\nLOCAL_BACKUP_DIR=$PVE_BACKUP_TEST_VAR/local\n",
        );
        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(
            cfg.local.unwrap().dir,
            tmp.path().join("expanded/local")
        );
        unsafe { std::env::remove_var("PVE_BACKUP_TEST_VAR") };
    }

    #[test]
    fn deprecated_alias_maps_to_new_key() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("backup.conf");
        write(&cfg_path, "STAGING_DIR=stage\nBACKUP_DIR=legacy\n");
        let cfg = Config::load(&cfg_path).unwrap();
        assert_eq!(cfg.local.unwrap().dir, tmp.path().join("legacy"));
    }

    #[test]
    fn no_storage_tier_enabled_fails() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("backup.conf");
        write(&cfg_path, "STAGING_DIR=stage\nENABLE_LOCAL=false\n");
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("at least one storage tier"));
    }

    #[test]
    fn recipients_mode_requires_recipients_file() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("backup.conf");
        write(
            &cfg_path,
            "STAGING_DIR=stage\nLOCAL_BACKUP_DIR=local\nENCRYPTION_MODE=recipients\n",
        );
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("AGE_RECIPIENTS_FILE"));
    }

    #[test]
    fn bad_boolean_fails() {
        let tmp = TempDir::new().unwrap();
        let cfg_path = tmp.path().join("backup.conf");
        write(
            &cfg_path,
            "STAGING_DIR=stage\nLOCAL_BACKUP_DIR=local\nENABLE_CLOUD=maybe\n",
        );
        let err = Config::load(&cfg_path).unwrap_err().to_string();
        assert!(err.contains("invalid boolean"));
    }
}
