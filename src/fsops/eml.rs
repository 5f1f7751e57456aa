use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::fsops::io_atom::{read_bytes, write_atomic};
use crate::model::filename::{folder_prefix, message_filename, subject_budget};
use crate::util::time::date_subpath;

const QUARANTINE_DIR: &str = "_Quarantine";

/// Canonical message storage under the archive root. The physical tree is
/// flat by received date; server folder hierarchy lives only in message
/// metadata. There is deliberately no move operation: a server-side folder
/// change never touches the file.
#[derive(Debug, Clone)]
pub struct EmlStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredEml {
    pub relative_path: String,
    pub size: u64,
}

impl EmlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn status_dir(&self) -> PathBuf {
        self.root.join("status")
    }

    pub fn db_path(&self) -> PathBuf {
        self.status_dir().join("magpie.db")
    }

    pub fn transformed_dir(&self) -> PathBuf {
        self.root.join("transformed")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join(QUARANTINE_DIR)
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.root.join("eml"))?;
        fs::create_dir_all(self.status_dir())?;
        Ok(())
    }

    /// Write canonical MIME bytes, picking a unique date-keyed filename.
    /// Returns the archive-relative path; the file is fully flushed before
    /// this returns.
    pub fn store(
        &self,
        mime: &[u8],
        folder_path: &str,
        subject: &str,
        received: OffsetDateTime,
    ) -> Result<StoredEml> {
        let subdir = format!("eml/{}", date_subpath(received));
        fs::create_dir_all(self.root.join(&subdir))?;
        let budget = subject_budget(&self.root, &folder_prefix(folder_path));

        let mut counter = None;
        let relative = loop {
            let name = message_filename(folder_path, subject, received, budget, counter);
            let candidate = format!("{subdir}/{name}");
            if !self.root.join(&candidate).exists() {
                break candidate;
            }
            counter = Some(counter.map_or(1, |n| n + 1));
        };

        write_atomic(&self.root.join(&relative), mime)?;
        Ok(StoredEml {
            size: mime.len() as u64,
            relative_path: relative,
        })
    }

    /// Relocate a message into `_Quarantine/`, preserving its sub-path. A
    /// missing source surfaces as `NotFound` so callers can still update
    /// their records.
    pub fn move_to_quarantine(&self, relative: &str) -> Result<String> {
        let source = self.full_path_of(relative)?;
        if !source.exists() {
            return Err(Error::NotFound(format!("{relative} is not in the archive")));
        }
        let quarantined = format!("{QUARANTINE_DIR}/{relative}");
        let target = self.root.join(&quarantined);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&source, &target)?;
        Ok(quarantined)
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.full_path_of(relative)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    pub fn open_read(&self, relative: &str) -> Result<File> {
        let path = self.full_path_of(relative)?;
        File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("{relative} is not in the archive"))
            }
            _ => err.into(),
        })
    }

    pub fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.full_path_of(relative)?;
        if !path.exists() {
            return Err(Error::NotFound(format!("{relative} is not in the archive")));
        }
        read_bytes(&path)
    }

    pub fn delete(&self, relative: &str) -> Result<()> {
        let path = self.full_path_of(relative)?;
        fs::remove_file(path)?;
        Ok(())
    }

    pub fn size(&self, relative: &str) -> Result<u64> {
        let path = self.full_path_of(relative)?;
        Ok(fs::metadata(path)?.len())
    }

    /// Resolve an archive-relative path, rejecting anything that would land
    /// outside the root.
    pub fn full_path_of(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        if relative.is_empty() || rel.is_absolute() {
            return Err(Error::Filesystem(format!("invalid archive path {relative}")));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(Error::Filesystem(format!(
                        "path {relative} escapes the archive root"
                    )));
                }
            }
        }
        let joined = self.root.join(rel);
        // Symlinked intermediates could still point elsewhere; canonicalise
        // what exists and re-check containment.
        if let (Ok(canonical_root), Some(parent)) = (self.root.canonicalize(), joined.parent()) {
            if let Ok(canonical_parent) = parent.canonicalize() {
                if !canonical_parent.starts_with(&canonical_root) {
                    return Err(Error::Filesystem(format!(
                        "path {relative} escapes the archive root"
                    )));
                }
            }
        }
        Ok(joined)
    }
}
