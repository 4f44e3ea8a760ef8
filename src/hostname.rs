use nix::unistd::gethostname;

/// Resolves a short hostname for run identity and lock payloads.
///
/// Falls back to `"unknown"` rather than failing a backup run over a
/// hostname lookup, per the run-identity rule that a missing hostname must
/// never block a backup.
pub fn short_hostname() -> String {
    gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.split('.').next().unwrap_or("unknown").to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_empty() {
        assert!(!short_hostname().is_empty());
    }
}
