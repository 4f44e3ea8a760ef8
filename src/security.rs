use anyhow::Result;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Thin file-permission audit: warns (never fails the run) when a secret
/// material path is readable by group/other. Deeper security posture checks
/// are outside this agent's interface contract.
pub fn audit_secret_permissions(paths: &[&Path]) -> Result<()> {
    for path in paths {
        if !path.exists() {
            continue;
        }
        let mode = std::fs::metadata(path)?.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "secret file is readable by group/other"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn warns_but_does_not_fail_on_loose_permissions() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("secret");
        std::fs::write(&path, b"x").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(audit_secret_permissions(&[&path]).is_ok());
    }

    #[test]
    fn missing_path_is_skipped() {
        assert!(audit_secret_permissions(&[Path::new("/nonexistent/secret")]).is_ok());
    }
}
