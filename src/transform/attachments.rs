use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use serde::Deserialize;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AttachmentOptions {
    #[serde(default = "default_true")]
    pub skip_executables: bool,
}

impl Default for AttachmentOptions {
    fn default() -> Self {
        Self {
            skip_executables: true,
        }
    }
}

/// One decoded attachment part, before any screening.
#[derive(Debug, Clone)]
pub struct ExtractedPart {
    pub filename: String,
    pub data: Vec<u8>,
    pub content_type: String,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

impl ExtractedPart {
    pub fn is_zip(&self) -> bool {
        self.content_type.eq_ignore_ascii_case("application/zip")
            || self
                .filename
                .rsplit_once('.')
                .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("zip"))
    }
}

/// Walk the MIME tree collecting attachment parts plus named/cid inline
/// parts (the ones a renderer can reference).
pub fn collect_parts(mail: &ParsedMail<'_>) -> Vec<ExtractedPart> {
    let mut parts = Vec::new();
    walk(mail, &mut parts);
    parts
}

fn walk(part: &ParsedMail<'_>, out: &mut Vec<ExtractedPart>) {
    let disposition = part.get_content_disposition();
    let filename = disposition.params.get("filename").cloned();
    let content_id = part
        .headers
        .get_first_value("Content-ID")
        .map(|raw| raw.trim_matches(['<', '>', ' ']).to_string());

    let is_attachment = disposition.disposition == DispositionType::Attachment;
    let is_named_inline = disposition.disposition == DispositionType::Inline
        && (filename.is_some() || content_id.is_some())
        && !part.ctype.mimetype.starts_with("text/");

    if is_attachment || is_named_inline {
        if let Ok(data) = part.get_body_raw() {
            out.push(ExtractedPart {
                filename: filename
                    .or_else(|| part.ctype.params.get("name").cloned())
                    .unwrap_or_else(|| "attachment".to_string()),
                content_type: part.ctype.mimetype.clone(),
                content_id,
                is_inline: !is_attachment,
                data,
            });
        }
        return;
    }
    for sub in &part.subparts {
        walk(sub, out);
    }
}

/// Filesystem-safe attachment filename: case and extension preserved,
/// illegal characters collapsed.
pub fn safe_attachment_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|ch| {
            if ch.is_control() || matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            {
                '-'
            } else {
                ch
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}
