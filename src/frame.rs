//! Captured frame types.
//!
//! A `Frame` is owned by the cycle that acquired it. Frames written by the live
//! source are transient and are deleted during cleanup; fixture frames are
//! read-only inputs and are never deleted.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug)]
pub struct Frame {
    /// Logical location name (e.g. "Avenida dos Estados").
    pub site: String,
    /// Image on local storage.
    pub path: PathBuf,
    pub captured_at: DateTime<Utc>,
    transient: bool,
}

impl Frame {
    /// A frame persisted by the acquisition step; removed once the cycle ends.
    pub fn transient(site: impl Into<String>, path: PathBuf, captured_at: DateTime<Utc>) -> Self {
        Self {
            site: site.into(),
            path,
            captured_at,
            transient: true,
        }
    }

    /// A frame backed by a fixture file that must outlive the cycle.
    pub fn fixture(site: impl Into<String>, path: PathBuf, captured_at: DateTime<Utc>) -> Self {
        Self {
            site: site.into(),
            path,
            captured_at,
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of asking a source for a frame.
///
/// `Empty` keeps the site label so callers can log and report which site was
/// skipped.
#[derive(Debug)]
pub enum Acquisition {
    Frame(Frame),
    Empty { site: String },
}

impl Acquisition {
    pub fn site(&self) -> &str {
        match self {
            Acquisition::Frame(frame) => &frame.site,
            Acquisition::Empty { site } => site,
        }
    }

    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Acquisition::Frame(frame) => Some(frame),
            Acquisition::Empty { .. } => None,
        }
    }
}

/// Best-effort removal of a scratch file. Failures are logged and swallowed.
pub fn remove_scratch_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed scratch file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("failed to remove scratch file {}: {}", path.display(), e),
    }
}

/// File-system friendly form of a site label ("Avenida dos Estados" ->
/// "avenida_dos_estados").
pub fn site_slug(site: &str) -> String {
    let slug: String = site
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if slug.is_empty() {
        "site".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_slug_lowercases_and_replaces_separators() {
        assert_eq!(site_slug("Avenida dos Estados"), "avenida_dos_estados");
        assert_eq!(site_slug("Rua 7/B"), "rua_7_b");
        assert_eq!(site_slug("   "), "site");
    }

    #[test]
    fn scratch_removal_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.png");
        remove_scratch_file(&path);
        std::fs::write(&path, b"x").unwrap();
        remove_scratch_file(&path);
        assert!(!path.exists());
    }
}
