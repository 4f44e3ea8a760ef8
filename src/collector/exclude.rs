use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Compiled glob-based exclusion matcher. Config supplies exclusions as
/// plain shell globs (`*.tmp`, `lost+found`, ...); compiling once up front
/// keeps per-file matching cheap during a large tree walk.
pub struct ExcludeMatcher {
    set: GlobSet,
}

impl ExcludeMatcher {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pat in patterns {
            let glob = Glob::new(pat).with_context(|| format!("invalid exclusion glob '{pat}'"))?;
            builder.add(glob);
        }
        let set = builder.build().context("compile exclusion globs")?;
        Ok(Self { set })
    }

    pub fn empty() -> Self {
        Self {
            set: GlobSetBuilder::new().build().expect("empty globset always compiles"),
        }
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        self.set.is_match(path)
    }
}
