use anyhow::{Context, Result, bail};
use dialoguer::{Input, Password, Select};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

/// Rejected outright regardless of length/class mix — lifted straight from
/// well-known leaked-password lists, not exhaustive.
const COMMON_PASSWORDS: &[&str] = &[
    "password", "123456", "12345678", "qwerty", "letmein", "admin123",
    "password123", "iloveyou", "welcome", "monkey123", "changeme",
];

/// Where the wizard reads/writes. Only ever a recipients file (public keys)
/// or a passphrase file consumed later by `ENCRYPTION_MODE=passphrase` —
/// never a private key.
pub struct IdentityPaths {
    pub dir: PathBuf,
    pub recipients_file: PathBuf,
    pub passphrase_file: PathBuf,
}

impl IdentityPaths {
    pub fn new(base_dir: &Path) -> Self {
        let dir = base_dir.join("identity/age");
        Self {
            recipients_file: dir.join("recipient.txt"),
            passphrase_file: dir.join("passphrase.txt"),
            dir,
        }
    }
}

/// Interactive identity setup. Runs until the user picks a mode and
/// succeeds, or exits.
pub fn run_wizard(paths: &IdentityPaths) -> Result<()> {
    let choice = Select::new()
        .with_prompt("AGE identity setup")
        .items(&[
            "Paste one or more AGE public recipients",
            "Derive from a passphrase (ENCRYPTION_MODE=passphrase)",
            "Derive a recipient from a private key (the key itself is not stored)",
            "Exit",
        ])
        .default(0)
        .interact()
        .context("read wizard selection")?;

    match choice {
        0 => paste_recipients(paths),
        1 => passphrase_identity(paths),
        2 => private_key_recipient(paths),
        _ => Ok(()),
    }
}

/// `--newkey`: back up whatever is already on disk, then run the wizard.
pub fn rotate(paths: &IdentityPaths) -> Result<()> {
    for existing in [&paths.recipients_file, &paths.passphrase_file] {
        if existing.exists() {
            let backup = existing.with_extension("bak");
            fs::copy(existing, &backup)
                .with_context(|| format!("back up {}", existing.display()))?;
            tracing::info!(backup = %backup.display(), "backed up prior identity material");
        }
    }
    run_wizard(paths)
}

fn paste_recipients(paths: &IdentityPaths) -> Result<()> {
    let mut recipients = Vec::new();
    loop {
        let line: String = Input::new()
            .with_prompt(format!("AGE public recipient #{} (blank to finish)", recipients.len() + 1))
            .allow_empty(true)
            .interact_text()
            .context("read recipient")?;
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        line.parse::<age::x25519::Recipient>()
            .map_err(|e| anyhow::anyhow!("bad AGE recipient '{line}': {e}"))?;
        recipients.push(line.to_string());
    }
    if recipients.is_empty() {
        bail!("no recipients entered");
    }
    write_recipients(paths, &recipients)
}

/// `age`'s scrypt scheme is symmetric (no public/private split), so a
/// deterministic passphrase cannot yield a separate "recipient" the way an
/// X25519 keypair does. Rather than fabricate one, this stores the validated
/// passphrase itself for `ENCRYPTION_MODE=passphrase` to consume — the same
/// passphrase the archive is later decrypted with.
fn passphrase_identity(paths: &IdentityPaths) -> Result<()> {
    loop {
        let mut passphrase = Password::new()
            .with_prompt("Passphrase (>=12 chars, >=3 character classes)")
            .interact()
            .context("read passphrase")?;
        if let Err(e) = validate_passphrase(&passphrase) {
            passphrase.zeroize();
            tracing::warn!(error = %e, "passphrase rejected, try again");
            continue;
        }

        let mut confirm = Password::new()
            .with_prompt("Confirm passphrase")
            .interact()
            .context("read confirmation")?;
        let matches = confirm == passphrase;
        confirm.zeroize();
        if !matches {
            passphrase.zeroize();
            tracing::warn!("passphrases did not match, try again");
            continue;
        }

        fs::create_dir_all(&paths.dir).with_context(|| format!("mkdir {}", paths.dir.display()))?;
        fs::set_permissions(&paths.dir, fs::Permissions::from_mode(0o700))?;
        let result = fs::write(&paths.passphrase_file, &passphrase)
            .with_context(|| format!("write {}", paths.passphrase_file.display()));
        passphrase.zeroize();
        result?;
        fs::set_permissions(&paths.passphrase_file, fs::Permissions::from_mode(0o600))?;
        tracing::info!(path = %paths.passphrase_file.display(), "stored passphrase for ENCRYPTION_MODE=passphrase");
        return Ok(());
    }
}

fn validate_passphrase(p: &str) -> Result<()> {
    if p.chars().count() < 12 {
        bail!("passphrase must be at least 12 characters");
    }
    let classes = [
        p.chars().any(|c| c.is_ascii_lowercase()),
        p.chars().any(|c| c.is_ascii_uppercase()),
        p.chars().any(|c| c.is_ascii_digit()),
        p.chars().any(|c| !c.is_ascii_alphanumeric()),
    ]
    .into_iter()
    .filter(|b| *b)
    .count();
    if classes < 3 {
        bail!("passphrase must mix at least 3 character classes");
    }
    let lower = p.to_ascii_lowercase();
    if COMMON_PASSWORDS.iter().any(|bad| lower.contains(bad)) {
        bail!("passphrase is too common");
    }
    Ok(())
}

fn private_key_recipient(paths: &IdentityPaths) -> Result<()> {
    let mut key: String = Password::new()
        .with_prompt("AGE private key (AGE-SECRET-KEY-1...)")
        .interact()
        .context("read private key")?;
    let parsed = key
        .trim()
        .parse::<age::x25519::Identity>()
        .map_err(|e| anyhow::anyhow!("invalid AGE private key: {e}"));
    key.zeroize();
    let identity = parsed?;
    write_recipients(paths, &[identity.to_public().to_string()])
}

fn write_recipients(paths: &IdentityPaths, recipients: &[String]) -> Result<()> {
    fs::create_dir_all(&paths.dir).with_context(|| format!("mkdir {}", paths.dir.display()))?;
    fs::set_permissions(&paths.dir, fs::Permissions::from_mode(0o700))?;
    let body = recipients.join("\n") + "\n";
    fs::write(&paths.recipients_file, body)
        .with_context(|| format!("write {}", paths.recipients_file.display()))?;
    fs::set_permissions(&paths.recipients_file, fs::Permissions::from_mode(0o600))?;
    tracing::info!(path = %paths.recipients_file.display(), count = recipients.len(), "stored AGE recipients");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn validate_passphrase_rejects_short() {
        assert!(validate_passphrase("short1A!").is_err());
    }

    #[test]
    fn validate_passphrase_rejects_two_classes() {
        assert!(validate_passphrase("alllowercaseletters").is_err());
    }

    #[test]
    fn validate_passphrase_rejects_common() {
        assert!(validate_passphrase("password123456").is_err());
    }

    #[test]
    fn validate_passphrase_accepts_strong() {
        assert!(validate_passphrase("Correct-Horse-Battery-9").is_ok());
    }

    #[test]
    fn write_recipients_sets_restrictive_permissions() {
        let tmp = TempDir::new().unwrap();
        let paths = IdentityPaths::new(tmp.path());
        write_recipients(&paths, &["age1qtest".to_string()]).unwrap();

        let file_mode = fs::metadata(&paths.recipients_file).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(&paths.dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn private_key_recipient_round_trips() {
        let identity = age::x25519::Identity::generate();
        let tmp = TempDir::new().unwrap();
        let paths = IdentityPaths::new(tmp.path());
        write_recipients(&paths, &[identity.to_public().to_string()]).unwrap();

        let content = fs::read_to_string(&paths.recipients_file).unwrap();
        assert!(content.trim().parse::<age::x25519::Recipient>().is_ok());
    }
}
