use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::fsops::eml::EmlStore;
use crate::fsops::io_atom::write_atomic;
use crate::security::screen::is_blocked_extension;
use crate::security::ziparc::{self, SkipReason, ZipDecision, ZipPolicy};
use crate::store::db::{StateStore, StateTxn};
use crate::store::records::{
    AttachmentRecord, MessageRecord, TransformationRecord, TransformationType, ZipExtractedFile,
    ZipExtractionRecord,
};
use crate::transform::attachments::{AttachmentOptions, collect_parts, safe_attachment_name};
use crate::transform::html::{HtmlOptions, render_html};
use crate::transform::markdown::render_markdown;
use crate::util::time::date_subpath;

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    pub generate_html: bool,
    pub generate_markdown: bool,
    pub extract_attachments: bool,
    pub html: HtmlOptions,
    pub attachments: AttachmentOptions,
    pub zip: ZipPolicy,
}

impl TransformOptions {
    pub fn requested_types(&self) -> Vec<TransformationType> {
        let mut types = Vec::new();
        // attachments first so html can reference extracted files
        if self.extract_attachments {
            types.push(TransformationType::Attachments);
        }
        if self.generate_html {
            types.push(TransformationType::Html);
        }
        if self.generate_markdown {
            types.push(TransformationType::Markdown);
        }
        types
    }

    /// Fingerprint of the effective options; a change re-selects every
    /// message for regeneration.
    pub fn config_version(&self) -> String {
        let canonical = format!(
            "html:{},{},{},{};attach:{};zip:{},{},{},{},{}",
            self.html.inline_styles,
            self.html.strip_external_images,
            self.html.hide_cc,
            self.html.hide_bcc,
            self.attachments.skip_executables,
            self.zip.enabled,
            self.zip.min_files,
            self.zip.max_files,
            self.zip.skip_encrypted,
            self.zip.skip_with_executables,
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformSummary {
    pub transformed: u32,
    pub errors: u32,
}

/// Reads canonical EML files and writes the derivative tree. The network is
/// never touched from here.
pub struct TransformPipeline {
    eml: EmlStore,
    options: TransformOptions,
}

impl TransformPipeline {
    pub fn new(eml: EmlStore, options: TransformOptions) -> Self {
        Self { eml, options }
    }

    pub fn options(&self) -> &TransformOptions {
        &self.options
    }

    pub fn config_version(&self) -> String {
        self.options.config_version()
    }

    /// Transform everything the store says is missing or stale. `only`
    /// restricts to one derivative type; `force` re-renders regardless of
    /// recorded config versions.
    pub fn run_offline(
        &self,
        store: &mut StateStore,
        only: Option<TransformationType>,
        force: bool,
    ) -> Result<TransformSummary> {
        let version = self.config_version();
        let mut summary = TransformSummary::default();
        let types: Vec<TransformationType> = self
            .options
            .requested_types()
            .into_iter()
            .filter(|t| only.is_none_or(|o| o == *t))
            .collect();

        for ttype in types {
            let candidates = if force {
                store
                    .list_messages()?
                    .into_iter()
                    .filter(|m| m.quarantined_at.is_none())
                    .collect()
            } else {
                store.messages_needing_transformation(ttype, &version)?
            };
            debug!(%ttype, candidates = candidates.len(), "selecting messages for transformation");
            for message in candidates {
                let mime = match self.eml.read(&message.local_path) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(message = %message.graph_id, error = %err, "canonical file unreadable");
                        summary.errors += 1;
                        continue;
                    }
                };
                let txn = store.begin()?;
                match self.apply_one(&txn, &message, &mime, ttype) {
                    Ok(()) => {
                        txn.commit()?;
                        summary.transformed += 1;
                    }
                    Err(err) => {
                        warn!(message = %message.graph_id, %ttype, error = %err, "transformation failed");
                        summary.errors += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    /// Inline variant used by the sync engine right after a message row is
    /// inserted, inside the same transaction scope.
    pub fn apply_inline(
        &self,
        txn: &StateTxn<'_>,
        message: &MessageRecord,
        mime: &[u8],
    ) -> Result<()> {
        for ttype in self.options.requested_types() {
            self.apply_one(txn, message, mime, ttype)?;
        }
        Ok(())
    }

    fn apply_one(
        &self,
        txn: &StateTxn<'_>,
        message: &MessageRecord,
        mime: &[u8],
        ttype: TransformationType,
    ) -> Result<()> {
        let mail = mailparse::parse_mail(mime)
            .map_err(|err| Error::Fatal(format!("unparseable message: {err}")))?;
        let stem = message_stem(&message.local_path);
        let subdir = date_subpath(message.received_time);

        let (output_path, size) = match ttype {
            TransformationType::Html => {
                let cid_map = self.cid_map(&mail, &stem, &subdir);
                let rendered = render_html(&mail, &self.options.html, &cid_map);
                let relative = format!("transformed/html/{subdir}/{stem}.html");
                write_atomic(&self.eml.root().join(&relative), rendered.as_bytes())?;
                (relative, rendered.len() as i64)
            }
            TransformationType::Markdown => {
                let rendered = render_markdown(&mail);
                let relative = format!("transformed/markdown/{subdir}/{stem}.md");
                write_atomic(&self.eml.root().join(&relative), rendered.as_bytes())?;
                (relative, rendered.len() as i64)
            }
            TransformationType::Attachments => {
                let relative = format!("transformed/attachments/{subdir}/{stem}");
                let written = self.extract_attachments(txn, message, &mail, &relative)?;
                (relative, written)
            }
        };

        txn.record_transformation(&TransformationRecord {
            message_id: message.graph_id.clone(),
            transformation_type: ttype,
            applied_at: OffsetDateTime::now_utc(),
            config_version: self.config_version(),
            output_path,
            output_size_bytes: Some(size),
        })
    }

    /// Where html output will find an extracted part, relative to the html
    /// file's own directory.
    fn cid_map(
        &self,
        mail: &mailparse::ParsedMail<'_>,
        stem: &str,
        subdir: &str,
    ) -> HashMap<String, String> {
        if !self.options.extract_attachments {
            return HashMap::new();
        }
        collect_parts(mail)
            .into_iter()
            .filter_map(|part| {
                let cid = part.content_id.clone()?;
                let name = safe_attachment_name(&part.filename);
                Some((cid, format!("../../../attachments/{subdir}/{stem}/{name}")))
            })
            .collect()
    }

    fn extract_attachments(
        &self,
        txn: &StateTxn<'_>,
        message: &MessageRecord,
        mail: &mailparse::ParsedMail<'_>,
        relative_dir: &str,
    ) -> Result<i64> {
        let dest_root = self.eml.root().join(relative_dir);
        let now = OffsetDateTime::now_utc();
        let mut total: i64 = 0;

        for part in collect_parts(mail) {
            let name = safe_attachment_name(&part.filename);

            if self.options.attachments.skip_executables && is_blocked_extension(&name) {
                txn.insert_attachment(&AttachmentRecord {
                    id: 0,
                    message_id: message.graph_id.clone(),
                    filename: name,
                    file_path: None,
                    size_bytes: part.data.len() as i64,
                    content_type: Some(part.content_type.clone()),
                    content_id: part.content_id.clone(),
                    is_inline: part.is_inline,
                    skipped: true,
                    skip_reason: Some("blocked executable extension".to_string()),
                    extracted_at: now,
                })?;
                continue;
            }

            if part.is_zip() {
                self.handle_zip(txn, message, &part.data, &name, &dest_root, relative_dir, now)?;
                total += part.data.len() as i64;
                continue;
            }

            std::fs::create_dir_all(&dest_root)?;
            let target = unique_name(&dest_root, &name);
            write_atomic(&dest_root.join(&target), &part.data)?;
            total += part.data.len() as i64;
            txn.insert_attachment(&AttachmentRecord {
                id: 0,
                message_id: message.graph_id.clone(),
                filename: name,
                file_path: Some(format!("{relative_dir}/{target}")),
                size_bytes: part.data.len() as i64,
                content_type: Some(part.content_type.clone()),
                content_id: part.content_id.clone(),
                is_inline: part.is_inline,
                skipped: false,
                skip_reason: None,
                extracted_at: now,
            })?;
        }
        Ok(total)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_zip(
        &self,
        txn: &StateTxn<'_>,
        message: &MessageRecord,
        data: &[u8],
        name: &str,
        dest_root: &Path,
        relative_dir: &str,
        now: OffsetDateTime,
    ) -> Result<()> {
        let archive_stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        let extraction_dir = dest_root.join(archive_stem);
        let outcome = ziparc::extract(data, &extraction_dir, &self.options.zip)?;

        let (can_extract, skip_reason) = match &outcome.decision {
            ZipDecision::CanExtract => (true, None),
            ZipDecision::Skipped(reason) => {
                let mut text = reason.to_string();
                // an unsafe-path refusal still names executables it saw
                if matches!(reason, SkipReason::UnsafePaths { .. }) {
                    if let Some(sample) = outcome
                        .analysis
                        .as_ref()
                        .and_then(|a| a.executables.first())
                    {
                        text.push_str(&format!("; contains executables ({sample})"));
                    }
                }
                (false, Some(text))
            }
        };

        // archive row first, whatever the decision
        let archive_path = if can_extract {
            // original archive preserved alongside its extraction directory
            std::fs::create_dir_all(dest_root)?;
            let target = unique_name(dest_root, name);
            write_atomic(&dest_root.join(&target), data)?;
            Some(format!("{relative_dir}/{target}"))
        } else {
            // clean up the (empty) extraction dir a refused decision created
            if extraction_dir.exists() && std::fs::read_dir(&extraction_dir)?.next().is_none() {
                std::fs::remove_dir(&extraction_dir)?;
            }
            None
        };

        let attachment_id = txn.insert_attachment(&AttachmentRecord {
            id: 0,
            message_id: message.graph_id.clone(),
            filename: name.to_string(),
            file_path: archive_path,
            size_bytes: data.len() as i64,
            content_type: Some("application/zip".to_string()),
            content_id: None,
            is_inline: false,
            skipped: !can_extract,
            skip_reason: skip_reason.clone(),
            extracted_at: now,
        })?;

        let analysis = outcome.analysis.unwrap_or_default();
        let files: Vec<ZipExtractedFile> = outcome
            .files
            .iter()
            .map(|f| ZipExtractedFile {
                id: 0,
                zip_extraction_id: 0,
                entry_name: f.entry_name.clone(),
                extracted_path: f
                    .path
                    .as_ref()
                    .map(|p| format!("{relative_dir}/{archive_stem}/{p}")),
                size_bytes: f.size as i64,
            })
            .collect();
        txn.insert_zip_extraction(
            &ZipExtractionRecord {
                id: 0,
                message_id: message.graph_id.clone(),
                attachment_id: Some(attachment_id),
                archive_name: name.to_string(),
                can_extract,
                skip_reason,
                file_count: analysis.file_count as i64,
                total_uncompressed: analysis.total_uncompressed as i64,
                has_executables: !analysis.executables.is_empty(),
                has_unsafe_paths: !analysis.unsafe_paths.is_empty(),
                is_encrypted: analysis.is_encrypted,
                extracted_at: now,
            },
            &files,
        )?;
        if let ZipDecision::Skipped(reason) = &outcome.decision {
            if !matches!(reason, SkipReason::Disabled) {
                debug!(archive = name, %reason, "archive extraction refused");
            }
        }
        Ok(())
    }
}

fn message_stem(local_path: &str) -> String {
    let filename = local_path.rsplit('/').next().unwrap_or(local_path);
    filename
        .strip_suffix(".eml")
        .unwrap_or(filename)
        .to_string()
}

fn unique_name(dir: &Path, name: &str) -> String {
    if !dir.join(name).exists() {
        return name.to_string();
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem.to_string(), Some(ext.to_string())),
        None => (name.to_string(), None),
    };
    let mut counter = 1u32;
    loop {
        let candidate = match &ext {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use time::macros::datetime;

    fn message_record(local_path: &str) -> MessageRecord {
        let now = datetime!(2024-01-15 10:30:00 UTC);
        MessageRecord {
            graph_id: "g1".to_string(),
            immutable_id: "im1".to_string(),
            local_path: local_path.to_string(),
            folder_path: "Inbox".to_string(),
            subject: Some("With files".to_string()),
            sender: None,
            recipients: None,
            received_time: now,
            size: 0,
            has_attachments: true,
            in_reply_to: None,
            conversation_id: None,
            quarantined_at: None,
            quarantine_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn plain_mime() -> Vec<u8> {
        b"Subject: With files\r\nFrom: a@example.org\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nhello".to_vec()
    }

    fn mime_with_zip(zip: &[u8]) -> Vec<u8> {
        use base64::Engine as _;

        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"Subject: With files\r\n\
              Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\r\n\
              --XYZ\r\n\
              Content-Type: text/plain; charset=utf-8\r\n\r\n\
              body\r\n\
              --XYZ\r\n\
              Content-Type: application/zip\r\n\
              Content-Disposition: attachment; filename=\"bundle.zip\"\r\n\
              Content-Transfer-Encoding: base64\r\n\r\n",
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(zip);
        raw.extend_from_slice(encoded.as_bytes());
        raw.extend_from_slice(b"\r\n--XYZ--\r\n");
        raw
    }

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn setup(
        dir: &tempfile::TempDir,
        options: TransformOptions,
        mime: &[u8],
    ) -> (TransformPipeline, StateStore, MessageRecord) {
        let eml = EmlStore::new(dir.path());
        eml.ensure().unwrap();
        let stored = eml
            .store(mime, "Inbox", "With files", datetime!(2024-01-15 10:30:00 UTC))
            .unwrap();
        let mut store = StateStore::open_in_memory().unwrap();
        let message = message_record(&stored.relative_path);
        let txn = store.begin().unwrap();
        txn.insert_message(&message).unwrap();
        txn.commit().unwrap();
        (TransformPipeline::new(eml, options), store, message)
    }

    #[test]
    fn config_version_tracks_options() {
        let a = TransformOptions::default().config_version();
        let b = TransformOptions {
            html: HtmlOptions {
                hide_cc: true,
                ..HtmlOptions::default()
            },
            ..TransformOptions::default()
        }
        .config_version();
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
        assert_eq!(a, TransformOptions::default().config_version());
    }

    #[test]
    fn offline_run_renders_html_and_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let options = TransformOptions {
            generate_html: true,
            generate_markdown: true,
            ..TransformOptions::default()
        };
        let (pipeline, mut store, message) = setup(&dir, options, &plain_mime());
        let summary = pipeline.run_offline(&mut store, None, false).unwrap();
        assert_eq!(summary.transformed, 2);
        assert_eq!(summary.errors, 0);

        let html = store
            .transformation_for("g1", TransformationType::Html)
            .unwrap()
            .unwrap();
        assert!(dir.path().join(&html.output_path).exists());
        assert!(html.output_path.starts_with("transformed/html/2024/01/"));

        // nothing left to do at the same version
        let again = pipeline.run_offline(&mut store, None, false).unwrap();
        assert_eq!(again.transformed, 0);
        drop(message);
    }

    #[test]
    fn stale_config_version_reselects() {
        let dir = tempfile::tempdir().unwrap();
        let options = TransformOptions {
            generate_markdown: true,
            ..TransformOptions::default()
        };
        let (pipeline, mut store, _) = setup(&dir, options, &plain_mime());
        pipeline.run_offline(&mut store, None, false).unwrap();

        let changed = TransformOptions {
            generate_markdown: true,
            html: HtmlOptions {
                hide_bcc: false,
                ..HtmlOptions::default()
            },
            ..TransformOptions::default()
        };
        let pipeline2 = TransformPipeline::new(EmlStore::new(dir.path()), changed);
        let summary = pipeline2.run_offline(&mut store, None, false).unwrap();
        assert_eq!(summary.transformed, 1);
        let stored = store
            .transformation_for("g1", TransformationType::Markdown)
            .unwrap()
            .unwrap();
        assert_eq!(stored.config_version, pipeline2.config_version());
    }

    #[test]
    fn hostile_zip_is_recorded_but_not_extracted() {
        let dir = tempfile::tempdir().unwrap();
        let zip = build_zip(&[
            ("../../etc/passwd", b"root"),
            ("setup.exe", b"MZ"),
            ("readme.txt", b"hi"),
        ]);
        let options = TransformOptions {
            extract_attachments: true,
            ..TransformOptions::default()
        };
        let (pipeline, mut store, _) = setup(&dir, options, &mime_with_zip(&zip));
        let summary = pipeline.run_offline(&mut store, None, false).unwrap();
        assert_eq!(summary.errors, 0);

        let attachments = store.attachments_for_message("g1").unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].skipped);
        assert!(attachments[0].file_path.is_none());
        assert!(
            attachments[0]
                .skip_reason
                .as_deref()
                .unwrap()
                .contains("unsafe")
        );

        let extractions = store.zip_extractions_for_message("g1").unwrap();
        assert_eq!(extractions.len(), 1);
        assert!(!extractions[0].can_extract);
        assert!(extractions[0].has_unsafe_paths);
        assert!(extractions[0].has_executables);

        // nothing was written under the attachment tree
        assert!(!dir.path().join("transformed/attachments").exists()
            || walkdir::WalkDir::new(dir.path().join("transformed/attachments"))
                .into_iter()
                .filter_map(|e| e.ok())
                .all(|e| e.file_type().is_dir()));
    }

    #[test]
    fn clean_zip_extracts_and_preserves_archive() {
        let dir = tempfile::tempdir().unwrap();
        let zip = build_zip(&[("docs/readme.txt", b"hello")]);
        let options = TransformOptions {
            extract_attachments: true,
            ..TransformOptions::default()
        };
        let (pipeline, mut store, _) = setup(&dir, options, &mime_with_zip(&zip));
        let summary = pipeline.run_offline(&mut store, None, false).unwrap();
        assert_eq!(summary.errors, 0);

        let attachments = store.attachments_for_message("g1").unwrap();
        assert!(!attachments[0].skipped);
        let archive_path = attachments[0].file_path.as_ref().unwrap();
        assert!(dir.path().join(archive_path).exists());

        let extractions = store.zip_extractions_for_message("g1").unwrap();
        assert!(extractions[0].can_extract);
        let files = store.zip_files_for_extraction(extractions[0].id).unwrap();
        assert_eq!(files.len(), 1);
        let extracted = files[0].extracted_path.as_ref().unwrap();
        assert!(dir.path().join(extracted).exists());
        assert_eq!(
            std::fs::read(dir.path().join(extracted)).unwrap(),
            b"hello"
        );
    }

    #[test]
    fn blocked_attachment_writes_no_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = Vec::new();
        raw.extend_from_slice(
            b"Subject: With files\r\n\
              Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\r\n\
              --XYZ\r\n\
              Content-Type: application/octet-stream\r\n\
              Content-Disposition: attachment; filename=\"installer.exe\"\r\n\r\n\
              MZbinary\r\n\
              --XYZ--\r\n",
        );
        let options = TransformOptions {
            extract_attachments: true,
            ..TransformOptions::default()
        };
        let (pipeline, mut store, _) = setup(&dir, options, &raw);
        pipeline.run_offline(&mut store, None, false).unwrap();

        let attachments = store.attachments_for_message("g1").unwrap();
        assert_eq!(attachments.len(), 1);
        assert!(attachments[0].skipped);
        assert!(attachments[0].file_path.is_none());
        assert!(!dir.path().join("transformed/attachments/2024/01").exists()
            || std::fs::read_dir(dir.path().join("transformed/attachments/2024/01"))
                .map(|mut d| d.next().is_none())
                .unwrap_or(true));
    }

    #[test]
    fn stem_strips_extension() {
        assert_eq!(
            message_stem("eml/2024/01/inbox_2024-01-15-10-30-00_hello.eml"),
            "inbox_2024-01-15-10-30-00_hello"
        );
    }

    #[test]
    fn unique_name_counters() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_name(dir.path(), "a.txt"), "a.txt");
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        assert_eq!(unique_name(dir.path(), "a.txt"), "a_1.txt");
    }
}
