//! Replayable fixture source.
//!
//! The directory is listed once at construction. Eligible image files are
//! sorted by file name and served cyclically; the listing is not refreshed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::FrameSource;
use crate::clock::{Clock, SystemClock};
use crate::frame::{Acquisition, Frame};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub struct FixtureSource {
    site: String,
    entries: Vec<PathBuf>,
    next: usize,
    clock: Box<dyn Clock>,
}

impl FixtureSource {
    /// List `dir` and capture the eligible entries.
    ///
    /// A missing directory holds no fixtures; an unreadable one is an error.
    pub fn new(site: impl Into<String>, dir: &Path) -> Result<Self> {
        let site = site.into();
        if !dir.exists() {
            log::warn!(
                "FixtureSource: fixture directory {} does not exist; no fixtures for '{}'",
                dir.display(),
                site
            );
            return Ok(Self::from_entries(site, Vec::new()));
        }
        let entries = list_fixtures(dir)?;
        log::info!(
            "FixtureSource: {} fixture(s) in {} for site '{}'",
            entries.len(),
            dir.display(),
            site
        );
        Ok(Self::from_entries(site, entries))
    }

    pub fn from_entries(site: impl Into<String>, entries: Vec<PathBuf>) -> Self {
        Self {
            site: site.into(),
            entries,
            next: 0,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FrameSource for FixtureSource {
    fn name(&self) -> &'static str {
        "fixture"
    }

    fn site(&self) -> &str {
        &self.site
    }

    fn acquire(&mut self) -> Acquisition {
        if self.entries.is_empty() {
            return Acquisition::Empty {
                site: self.site.clone(),
            };
        }
        let path = self.entries[self.next].clone();
        self.next = (self.next + 1) % self.entries.len();
        log::debug!("FixtureSource: serving {}", path.display());
        Acquisition::Frame(Frame::fixture(self.site.clone(), path, self.clock.now()))
    }
}

fn list_fixtures(dir: &Path) -> Result<Vec<PathBuf>> {
    let read_dir = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list fixture directory {}", dir.display()))?;
    let mut entries = Vec::new();
    for entry in read_dir {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path.is_file() && is_image_file(&path) {
            entries.push(path);
        }
    }
    entries.sort();
    Ok(entries)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"not decoded here").unwrap();
    }

    #[test]
    fn serves_each_fixture_once_per_pass_in_name_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "b.png");
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "c.JPEG");
        touch(dir.path(), "notes.txt");

        let mut source = FixtureSource::new("Test Avenue", dir.path())?;
        assert_eq!(source.len(), 3);

        let names: Vec<String> = (0..6)
            .map(|_| {
                let frame = source.acquire().into_frame().expect("frame");
                assert!(!frame.is_transient());
                assert_eq!(frame.site, "Test Avenue");
                frame
                    .path
                    .file_name()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        assert_eq!(names, vec!["a.jpg", "b.png", "c.JPEG", "a.jpg", "b.png", "c.JPEG"]);
        Ok(())
    }

    #[test]
    fn empty_directory_yields_empty_with_site_label() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = FixtureSource::new("Empty Street", dir.path())?;
        match source.acquire() {
            Acquisition::Empty { site } => assert_eq!(site, "Empty Street"),
            Acquisition::Frame(_) => panic!("expected empty acquisition"),
        }
        Ok(())
    }

    #[test]
    fn missing_directory_holds_no_fixtures() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut source = FixtureSource::new("Gone Road", &dir.path().join("nope"))?;
        assert!(source.is_empty());
        assert!(matches!(source.acquire(), Acquisition::Empty { .. }));
        Ok(())
    }

    #[test]
    fn file_in_place_of_directory_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        touch(dir.path(), "fixtures");
        assert!(FixtureSource::new("x", &dir.path().join("fixtures")).is_err());
        Ok(())
    }
}
