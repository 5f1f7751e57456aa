use std::fs::{self, File};
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use zip::ZipArchive;

use crate::error::Result;
use crate::security::screen::{is_blocked_extension, is_safe_relative_entry};

fn default_true() -> bool {
    true
}
fn default_min_files() -> u64 {
    1
}
fn default_max_files() -> u64 {
    200
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ZipPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_files")]
    pub min_files: u64,
    #[serde(default = "default_max_files")]
    pub max_files: u64,
    #[serde(default = "default_true")]
    pub skip_encrypted: bool,
    #[serde(default = "default_true")]
    pub skip_with_executables: bool,
}

impl Default for ZipPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_files: default_min_files(),
            max_files: default_max_files(),
            skip_encrypted: true,
            skip_with_executables: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ZipAnalysis {
    pub file_count: u64,
    pub total_uncompressed: u64,
    pub unsafe_paths: Vec<String>,
    pub executables: Vec<String>,
    pub is_encrypted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Disabled,
    Corrupt,
    Encrypted,
    UnsafePaths { sample: String },
    Executables { sample: String },
    TooFewFiles,
    TooManyFiles,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "extraction disabled"),
            Self::Corrupt => write!(f, "archive could not be parsed"),
            Self::Encrypted => write!(f, "archive is encrypted"),
            Self::UnsafePaths { sample } => write!(f, "unsafe entry paths ({sample})"),
            Self::Executables { sample } => write!(f, "contains executables ({sample})"),
            Self::TooFewFiles => write!(f, "below minimum file count"),
            Self::TooManyFiles => write!(f, "above maximum file count"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ZipDecision {
    CanExtract,
    Skipped(SkipReason),
}

#[derive(Debug, Clone)]
pub struct ExtractedEntry {
    pub entry_name: String,
    /// Destination-root-relative path; None when the entry was not written.
    pub path: Option<String>,
    pub size: u64,
}

#[derive(Debug)]
pub struct ZipOutcome {
    pub decision: ZipDecision,
    pub analysis: Option<ZipAnalysis>,
    pub files: Vec<ExtractedEntry>,
}

/// Open failures on individual entries carrying these signals mean the
/// archive wants a password we do not have.
fn looks_encrypted(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    ["password", "encrypt", "crc"]
        .iter()
        .any(|signal| lowered.contains(signal))
}

/// Analyse without writing a single byte: entry census, unsafe/executable
/// samples, encryption probe, then the policy decision.
pub fn analyze(bytes: &[u8], policy: &ZipPolicy) -> (ZipDecision, Option<ZipAnalysis>) {
    let mut archive = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(_) => return (ZipDecision::Skipped(SkipReason::Corrupt), None),
    };

    let mut analysis = ZipAnalysis::default();
    for index in 0..archive.len() {
        let (name, size, is_dir) = match archive.by_index_raw(index) {
            Ok(entry) => (entry.name().to_string(), entry.size(), entry.is_dir()),
            Err(_) => return (ZipDecision::Skipped(SkipReason::Corrupt), None),
        };
        if is_dir {
            continue;
        }
        analysis.file_count += 1;
        analysis.total_uncompressed += size;
        if !is_safe_relative_entry(&name) {
            analysis.unsafe_paths.push(name.clone());
        }
        if is_blocked_extension(entry_basename(&name)) {
            analysis.executables.push(name.clone());
        }
        if let Err(err) = archive.by_index(index) {
            if looks_encrypted(&err.to_string()) {
                analysis.is_encrypted = true;
            }
        }
    }

    let decision = decide(policy, &analysis);
    (decision, Some(analysis))
}

fn decide(policy: &ZipPolicy, analysis: &ZipAnalysis) -> ZipDecision {
    if !policy.enabled {
        return ZipDecision::Skipped(SkipReason::Disabled);
    }
    if analysis.is_encrypted && policy.skip_encrypted {
        return ZipDecision::Skipped(SkipReason::Encrypted);
    }
    if let Some(sample) = analysis.unsafe_paths.first() {
        return ZipDecision::Skipped(SkipReason::UnsafePaths {
            sample: sample.clone(),
        });
    }
    if policy.skip_with_executables {
        if let Some(sample) = analysis.executables.first() {
            return ZipDecision::Skipped(SkipReason::Executables {
                sample: sample.clone(),
            });
        }
    }
    if analysis.file_count < policy.min_files {
        return ZipDecision::Skipped(SkipReason::TooFewFiles);
    }
    if analysis.file_count > policy.max_files {
        return ZipDecision::Skipped(SkipReason::TooManyFiles);
    }
    ZipDecision::CanExtract
}

fn entry_basename(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn sanitize_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .map(|ch| {
            if ch.is_control() || matches!(ch, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '-'
            } else {
                ch
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "-".to_string()
    } else {
        trimmed.to_string()
    }
}

fn unique_destination(path: PathBuf) -> PathBuf {
    if !path.exists() {
        return path;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());
    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut counter = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let candidate = parent.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Decide, then stream entries under `dest_root`. Every written path is
/// re-verified for containment after the directory is created; nothing is
/// ever written outside `dest_root`.
pub fn extract(bytes: &[u8], dest_root: &Path, policy: &ZipPolicy) -> Result<ZipOutcome> {
    let (decision, analysis) = analyze(bytes, policy);
    if decision != ZipDecision::CanExtract {
        return Ok(ZipOutcome {
            decision,
            analysis,
            files: Vec::new(),
        });
    }

    let mut archive = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(_) => {
            return Ok(ZipOutcome {
                decision: ZipDecision::Skipped(SkipReason::Corrupt),
                analysis,
                files: Vec::new(),
            });
        }
    };

    fs::create_dir_all(dest_root)?;
    let canonical_root = dest_root.canonicalize()?;
    let mut files = Vec::new();

    for index in 0..archive.len() {
        let mut entry = match archive.by_index(index) {
            Ok(entry) => entry,
            Err(err) => {
                files.push(ExtractedEntry {
                    entry_name: format!("#{index}"),
                    path: None,
                    size: 0,
                });
                tracing::warn!(index, error = %err, "skipping unreadable archive entry");
                continue;
            }
        };
        let entry_name = entry.name().to_string();
        if entry.is_dir() {
            continue;
        }
        if !is_safe_relative_entry(&entry_name) {
            files.push(ExtractedEntry {
                entry_name,
                path: None,
                size: entry.size(),
            });
            continue;
        }

        let relative: PathBuf = entry_name
            .split(['/', '\\'])
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .map(sanitize_segment)
            .collect();
        let mut target = dest_root.join(&relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
            let canonical_parent = parent.canonicalize()?;
            if !canonical_parent.starts_with(&canonical_root) {
                files.push(ExtractedEntry {
                    entry_name,
                    path: None,
                    size: entry.size(),
                });
                continue;
            }
        }
        target = unique_destination(target);

        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        out.sync_all()?;

        let written = target
            .strip_prefix(dest_root)
            .unwrap_or(&target)
            .to_string_lossy()
            .replace('\\', "/");
        files.push(ExtractedEntry {
            entry_name,
            path: Some(written),
            size: fs::metadata(&target)?.len(),
        });
    }

    Ok(ZipOutcome {
        decision: ZipDecision::CanExtract,
        analysis,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn clean_archive_can_extract() {
        let bytes = build_zip(&[("readme.txt", b"hello"), ("docs/guide.md", b"guide")]);
        let (decision, analysis) = analyze(&bytes, &ZipPolicy::default());
        assert_eq!(decision, ZipDecision::CanExtract);
        let analysis = analysis.unwrap();
        assert_eq!(analysis.file_count, 2);
        assert_eq!(analysis.total_uncompressed, 10);
        assert!(!analysis.is_encrypted);
    }

    #[test]
    fn corrupt_bytes_are_skipped() {
        let (decision, analysis) = analyze(b"not a zip at all", &ZipPolicy::default());
        assert_eq!(decision, ZipDecision::Skipped(SkipReason::Corrupt));
        assert!(analysis.is_none());
    }

    #[test]
    fn disabled_policy_short_circuits() {
        let bytes = build_zip(&[("readme.txt", b"hello")]);
        let policy = ZipPolicy {
            enabled: false,
            ..ZipPolicy::default()
        };
        let (decision, _) = analyze(&bytes, &policy);
        assert_eq!(decision, ZipDecision::Skipped(SkipReason::Disabled));
    }

    #[test]
    fn traversal_entries_are_flagged() {
        let bytes = build_zip(&[("../../etc/passwd", b"root"), ("ok.txt", b"fine")]);
        let (decision, analysis) = analyze(&bytes, &ZipPolicy::default());
        assert!(matches!(
            decision,
            ZipDecision::Skipped(SkipReason::UnsafePaths { .. })
        ));
        assert_eq!(analysis.unwrap().unsafe_paths, vec!["../../etc/passwd"]);
    }

    #[test]
    fn executables_are_flagged() {
        let bytes = build_zip(&[("setup.exe", b"MZ"), ("readme.txt", b"hi")]);
        let (decision, analysis) = analyze(&bytes, &ZipPolicy::default());
        assert!(matches!(
            decision,
            ZipDecision::Skipped(SkipReason::Executables { .. })
        ));
        assert_eq!(analysis.unwrap().executables, vec!["setup.exe"]);
    }

    #[test]
    fn unsafe_executable_entry_counts_in_both_lists() {
        let bytes = build_zip(&[("../payload.exe", b"MZ")]);
        let (decision, analysis) = analyze(&bytes, &ZipPolicy::default());
        assert!(matches!(
            decision,
            ZipDecision::Skipped(SkipReason::UnsafePaths { .. })
        ));
        let analysis = analysis.unwrap();
        assert_eq!(analysis.unsafe_paths, vec!["../payload.exe"]);
        assert_eq!(analysis.executables, vec!["../payload.exe"]);
    }

    #[test]
    fn executables_allowed_when_policy_permits() {
        let bytes = build_zip(&[("setup.exe", b"MZ")]);
        let policy = ZipPolicy {
            skip_with_executables: false,
            ..ZipPolicy::default()
        };
        let (decision, _) = analyze(&bytes, &policy);
        assert_eq!(decision, ZipDecision::CanExtract);
    }

    #[test]
    fn file_count_bounds() {
        let bytes = build_zip(&[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c")]);
        let too_many = ZipPolicy {
            max_files: 2,
            ..ZipPolicy::default()
        };
        let (decision, _) = analyze(&bytes, &too_many);
        assert_eq!(decision, ZipDecision::Skipped(SkipReason::TooManyFiles));

        let too_few = ZipPolicy {
            min_files: 5,
            ..ZipPolicy::default()
        };
        let (decision, _) = analyze(&bytes, &too_few);
        assert_eq!(decision, ZipDecision::Skipped(SkipReason::TooFewFiles));
    }

    #[test]
    fn extraction_writes_inside_root_only() {
        let bytes = build_zip(&[("docs/readme.txt", b"hello"), ("top.txt", b"t")]);
        let dir = tempfile::tempdir().unwrap();
        let outcome = extract(&bytes, dir.path(), &ZipPolicy::default()).unwrap();
        assert_eq!(outcome.decision, ZipDecision::CanExtract);
        assert_eq!(outcome.files.len(), 2);
        assert!(dir.path().join("docs/readme.txt").exists());
        assert!(dir.path().join("top.txt").exists());
        for entry in &outcome.files {
            let rel = entry.path.as_ref().unwrap();
            let canonical = dir.path().join(rel).canonicalize().unwrap();
            assert!(canonical.starts_with(dir.path().canonicalize().unwrap()));
        }
    }

    #[test]
    fn hostile_archive_writes_nothing() {
        let bytes = build_zip(&[("../../escape.txt", b"x"), ("setup.exe", b"MZ")]);
        let dir = tempfile::tempdir().unwrap();
        let outcome = extract(&bytes, dir.path(), &ZipPolicy::default()).unwrap();
        assert!(matches!(outcome.decision, ZipDecision::Skipped(_)));
        assert!(outcome.files.is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn extraction_resolves_collisions() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("top.txt"), b"existing").unwrap();
        let bytes = build_zip(&[("top.txt", b"fresh")]);
        let outcome = extract(&bytes, dir.path(), &ZipPolicy::default()).unwrap();
        let written = outcome.files[0].path.as_ref().unwrap();
        assert_eq!(written, "top_1.txt");
        assert_eq!(fs::read(dir.path().join("top.txt")).unwrap(), b"existing");
        assert_eq!(fs::read(dir.path().join("top_1.txt")).unwrap(), b"fresh");
    }

    #[test]
    fn illegal_segment_characters_are_replaced() {
        let bytes = build_zip(&[("we?ird:name.txt", b"x")]);
        let dir = tempfile::tempdir().unwrap();
        let outcome = extract(&bytes, dir.path(), &ZipPolicy::default()).unwrap();
        assert_eq!(outcome.files[0].path.as_deref(), Some("we-ird-name.txt"));
    }

    #[test]
    fn encryption_signal_matching() {
        assert!(looks_encrypted("Password required to decrypt file"));
        assert!(looks_encrypted("invalid CRC checksum"));
        assert!(looks_encrypted("entry is encrypted"));
        assert!(!looks_encrypted("unexpected end of stream"));
    }
}
