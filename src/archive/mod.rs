pub mod compress;
pub mod verify;

use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::{CompressionMode, Compressor, EncryptionConfig, EncryptionMode};
use crate::errors::BackupErrorKind;
use crate::utils::bins::which;
use crate::utils::cancel::CancellationToken;
use compress::{compress_args, effective_level, select};

pub struct ArchiveOutput {
    pub path: PathBuf,
    pub size: u64,
    pub effective_compressor: Compressor,
    pub effective_level: u32,
}

/// Archives `staging_dir` into `dest_path`: tar -> (optional external
/// compressor process) -> (optional in-process AGE encryption) -> file.
/// At no point is an intermediate plaintext or compressed-but-unencrypted
/// buffer written to disk when encryption is enabled — the compressor's
/// stdout is piped directly into the encryptor's streaming writer.
pub fn create_archive(
    staging_dir: &Path,
    dest_path: &Path,
    compressor: Compressor,
    level: Option<u32>,
    mode: CompressionMode,
    threads: Option<u32>,
    encryption: &EncryptionConfig,
    cancel: &CancellationToken,
) -> Result<ArchiveOutput> {
    let selection = select(compressor);
    let effective = selection.effective;
    let level = effective_level(effective, level, mode);

    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create archive dir {}", parent.display()))?;
    }
    let out_file = File::create(dest_path)
        .with_context(|| format!("create archive {}", dest_path.display()))
        .map_err(|e| e.context(BackupErrorKind::ArchiveFailed))?;

    let result = (|| -> Result<()> {
        let mut sink = wrap_encryption(out_file, encryption)?;

        if effective == Compressor::None {
            write_tar(staging_dir, &mut *sink, cancel)?;
        } else {
            let args = compress_args(effective, level, mode, threads);
            let mut child = Command::new(effective.binary())
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .spawn()
                .with_context(|| format!("spawn compressor {}", effective.binary()))?;

            let mut child_stdin = child.stdin.take().expect("piped stdin");
            let mut child_stdout = child.stdout.take().expect("piped stdout");

            let staging_dir = staging_dir.to_path_buf();
            let cancel_for_writer = cancel.clone();
            let writer = std::thread::spawn(move || -> Result<()> {
                write_tar(&staging_dir, &mut child_stdin, &cancel_for_writer)?;
                drop(child_stdin);
                Ok(())
            });

            let copied = io::copy(&mut child_stdout, sink.as_write())
                .context("copy compressor output into sink")?;
            tracing::debug!(bytes = copied, "compressor output copied");

            writer
                .join()
                .map_err(|_| anyhow::anyhow!("tar writer thread panicked"))??;

            let status = child.wait().context("wait for compressor")?;
            if !status.success() {
                return Err(anyhow::anyhow!("compressor {} exited with {status}", effective.binary())
                    .context(BackupErrorKind::CompressionFailed));
            }
        }
        sink.finish()
    })();

    result.map_err(|e| {
        if crate::errors::has_kind(&e) {
            e
        } else {
            e.context(BackupErrorKind::ArchiveFailed)
        }
    })?;

    let size = std::fs::metadata(dest_path)
        .with_context(|| format!("stat {}", dest_path.display()))?
        .len();

    Ok(ArchiveOutput {
        path: dest_path.to_path_buf(),
        size,
        effective_compressor: effective,
        effective_level: level,
    })
}

/// A writer that can be finalized (age's `StreamWriter::finish` consumes
/// `self`, so we box it behind a trait object with an explicit finish step).
trait EncryptSink: Send {
    fn as_write(&mut self) -> &mut dyn Write;
    fn finish(self: Box<Self>) -> Result<()>;
}

struct PlainSink(File);
impl EncryptSink for PlainSink {
    fn as_write(&mut self) -> &mut dyn Write {
        &mut self.0
    }
    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct AgeSink(Option<age::stream::StreamWriter<File>>);
impl EncryptSink for AgeSink {
    fn as_write(&mut self) -> &mut dyn Write {
        self.0.as_mut().expect("writer present until finish")
    }
    fn finish(mut self: Box<Self>) -> Result<()> {
        let w = self.0.take().expect("writer present until finish");
        w.finish().context("finalize AGE stream")?;
        Ok(())
    }
}

fn wrap_encryption(out_file: File, encryption: &EncryptionConfig) -> Result<Box<dyn EncryptSink>> {
    match encryption.mode {
        EncryptionMode::None => Ok(Box::new(PlainSink(out_file))),
        EncryptionMode::Recipients => {
            let path = encryption
                .recipients_file
                .as_ref()
                .context("ENCRYPTION_MODE=recipients requires AGE_RECIPIENTS_FILE")?;
            let recipients = load_recipients(path)?;
            let encryptor = age::Encryptor::with_recipients(recipients)
                .context("no valid AGE recipients")?;
            let writer = encryptor.wrap_output(out_file).context("start AGE stream")?;
            Ok(Box::new(AgeSink(Some(writer))))
        }
        EncryptionMode::Passphrase => {
            let identity_file = encryption
                .identity_file
                .as_ref()
                .context("ENCRYPTION_MODE=passphrase requires AGE_IDENTITY_FILE")?;
            let passphrase = std::fs::read_to_string(identity_file)
                .with_context(|| format!("read passphrase file {}", identity_file.display()))?;
            let secret = age::secrecy::SecretString::new(passphrase.trim().to_string());
            let encryptor = age::Encryptor::with_user_passphrase(secret);
            let writer = encryptor.wrap_output(out_file).context("start AGE stream")?;
            Ok(Box::new(AgeSink(Some(writer))))
        }
    }
}

fn load_recipients(path: &Path) -> Result<Vec<Box<dyn age::Recipient + Send>>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("read recipients file {}", path.display()))?;
    let mut out: Vec<Box<dyn age::Recipient + Send>> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let recipient: age::x25519::Recipient = line
            .parse()
            .map_err(|e| anyhow::anyhow!("bad AGE recipient '{line}': {e}"))?;
        out.push(Box::new(recipient));
    }
    if out.is_empty() {
        bail!("recipients file {} has no valid recipients", path.display());
    }
    Ok(out)
}

fn write_tar(staging_dir: &Path, sink: &mut dyn Write, cancel: &CancellationToken) -> Result<()> {
    let mut builder = tar::Builder::new(sink);
    builder.follow_symlinks(false);
    for entry in walkdir::WalkDir::new(staging_dir).follow_links(false) {
        cancel.check()?;
        let entry = entry.with_context(|| format!("walk {}", staging_dir.display()))?;
        let path = entry.path();
        let rel = path.strip_prefix(staging_dir).unwrap_or(path);
        if rel.as_os_str().is_empty() {
            continue;
        }
        let meta = std::fs::symlink_metadata(path).with_context(|| format!("lstat {}", path.display()))?;
        if meta.is_dir() {
            builder.append_dir(rel, path)?;
        } else if meta.file_type().is_symlink() {
            let target = std::fs::read_link(path).with_context(|| format!("readlink {}", path.display()))?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&meta);
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, rel, &target)
                .with_context(|| format!("append symlink {}", path.display()))?;
        } else {
            let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(&meta);
            builder.append_data(&mut header, rel, &mut f)?;
        }
    }
    builder.finish().context("finish tar stream")?;
    Ok(())
}
