use anyhow::{Context, Result, bail};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use crate::config::{Compressor, EncryptionConfig, EncryptionMode};
use crate::errors::BackupErrorKind;

/// Verifies a freshly-written archive is structurally sound. What "sound"
/// means depends on the encryption mode:
///
/// - `None`: decompress and confirm the tar headers parse.
/// - `Recipients`: the backup host never holds the private key, so we can
///   only confirm the file is a well-formed AGE container.
/// - `Passphrase`: the same deterministic passphrase used to encrypt is
///   available here too, so we decrypt, decompress and parse the tar fully.
pub fn verify_archive(
    path: &Path,
    effective_compressor: Compressor,
    encryption: &EncryptionConfig,
) -> Result<()> {
    let result = (|| -> Result<()> {
        match encryption.mode {
            EncryptionMode::None => verify_plain(path, effective_compressor),
            EncryptionMode::Recipients => verify_age_container_only(path),
            EncryptionMode::Passphrase => verify_passphrase(path, effective_compressor, encryption),
        }
    })();
    result.map_err(|e| e.context(BackupErrorKind::VerificationFailed))
}

fn verify_plain(path: &Path, compressor: Compressor) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = decompressing_reader(file, compressor)?;
    count_tar_entries(reader)
}

fn verify_age_container_only(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    age::Decryptor::new(BufReader::new(file)).context("archive is not a valid AGE container")?;
    Ok(())
}

fn verify_passphrase(path: &Path, compressor: Compressor, encryption: &EncryptionConfig) -> Result<()> {
    let identity_file = encryption
        .identity_file
        .as_ref()
        .context("ENCRYPTION_MODE=passphrase requires AGE_IDENTITY_FILE")?;
    let passphrase = std::fs::read_to_string(identity_file)
        .with_context(|| format!("read passphrase file {}", identity_file.display()))?;
    let secret = age::secrecy::SecretString::new(passphrase.trim().to_string());

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let decryptor =
        age::Decryptor::new(BufReader::new(file)).context("archive is not a valid AGE container")?;
    let identity = age::scrypt::Identity::new(secret);
    let reader = decryptor
        .decrypt(std::iter::once(&identity as &dyn age::Identity))
        .context("decrypt archive for verification")?;
    let reader = decompressing_reader_dyn(Box::new(reader), compressor)?;
    count_tar_entries(reader)
}

fn decompressing_reader(file: File, compressor: Compressor) -> Result<Box<dyn std::io::Read>> {
    decompressing_reader_dyn(Box::new(BufReader::new(file)), compressor)
}

pub(crate) fn decompressing_reader_dyn(
    inner: Box<dyn std::io::Read>,
    compressor: Compressor,
) -> Result<Box<dyn std::io::Read>> {
    Ok(match compressor {
        Compressor::None => inner,
        Compressor::Gzip | Compressor::Pigz => Box::new(flate2::read::GzDecoder::new(inner)),
        Compressor::Bzip2 => Box::new(bzip2::read::BzDecoder::new(inner)),
        Compressor::Xz | Compressor::Lzma => Box::new(liblzma::read::XzDecoder::new(inner)),
        Compressor::Zstd => Box::new(zstd::stream::Decoder::new(inner)?),
    })
}

fn count_tar_entries(reader: impl std::io::Read) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let mut count = 0u64;
    for entry in archive.entries().context("read tar entries")? {
        let _ = entry.context("read tar entry header")?;
        count += 1;
    }
    if count == 0 {
        bail!("archive contains no entries");
    }
    Ok(())
}
