use time::OffsetDateTime;

/// One archived mail. `graph_id` is the server row key; `immutable_id` is the
/// dedup key that survives server-side moves.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub graph_id: String,
    pub immutable_id: String,
    pub local_path: String,
    pub folder_path: String,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub recipients: Option<String>,
    pub received_time: OffsetDateTime,
    pub size: i64,
    pub has_attachments: bool,
    pub in_reply_to: Option<String>,
    pub conversation_id: Option<String>,
    pub quarantined_at: Option<OffsetDateTime>,
    pub quarantine_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FolderRecord {
    pub graph_id: String,
    pub parent_folder_id: Option<String>,
    pub local_path: String,
    pub display_name: String,
    pub total_item_count: Option<i64>,
    pub unread_item_count: Option<i64>,
    pub delta_token: Option<String>,
    pub last_sync_time: Option<OffsetDateTime>,
}

/// Mid-folder resume position. A row exists only while the folder's last
/// sync has not completed cleanly.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderSyncProgress {
    pub folder_id: String,
    pub pending_next_link: Option<String>,
    pub pending_page_number: i64,
    pub pending_message_index: i64,
    pub sync_started_at: OffsetDateTime,
    pub last_checkpoint_at: OffsetDateTime,
    pub messages_processed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformationType {
    Html,
    Markdown,
    Attachments,
}

impl TransformationType {
    pub const ALL: [Self; 3] = [Self::Html, Self::Markdown, Self::Attachments];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Markdown => "markdown",
            Self::Attachments => "attachments",
        }
    }
}

impl std::str::FromStr for TransformationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(Self::Html),
            "markdown" => Ok(Self::Markdown),
            "attachments" => Ok(Self::Attachments),
            other => Err(format!("unknown transformation type: {other}")),
        }
    }
}

impl std::fmt::Display for TransformationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformationRecord {
    pub message_id: String,
    pub transformation_type: TransformationType,
    pub applied_at: OffsetDateTime,
    pub config_version: String,
    pub output_path: String,
    pub output_size_bytes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRecord {
    pub id: i64,
    pub message_id: String,
    pub filename: String,
    /// None when the part was screened out and never written.
    pub file_path: Option<String>,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub content_id: Option<String>,
    pub is_inline: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub extracted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZipExtractionRecord {
    pub id: i64,
    pub message_id: String,
    pub attachment_id: Option<i64>,
    pub archive_name: String,
    pub can_extract: bool,
    pub skip_reason: Option<String>,
    pub file_count: i64,
    pub total_uncompressed: i64,
    pub has_executables: bool,
    pub has_unsafe_paths: bool,
    pub is_encrypted: bool,
    pub extracted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZipExtractedFile {
    pub id: i64,
    pub zip_extraction_id: i64,
    pub entry_name: String,
    pub extracted_path: Option<String>,
    pub size_bytes: i64,
}

/// Per-mailbox aggregate bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStateRecord {
    pub mailbox: String,
    pub last_sync_time: Option<OffsetDateTime>,
    pub last_batch_id: Option<String>,
    pub delta_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn transformation_type_roundtrip() {
        for ttype in TransformationType::ALL {
            assert_eq!(
                TransformationType::from_str(ttype.as_str()).unwrap(),
                ttype
            );
        }
        assert!(TransformationType::from_str("pdf").is_err());
    }
}
