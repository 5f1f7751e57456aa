use async_trait::async_trait;
use time::OffsetDateTime;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    Network,
    Throttled,
    CursorInvalid,
    NotFound,
    Other,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Structured classification first; the wording heuristic covers
    /// providers that only surface text.
    pub fn is_cursor_invalid(&self) -> bool {
        self.kind == ProviderErrorKind::CursorInvalid || cursor_invalid_wording(&self.message)
    }
}

fn cursor_invalid_wording(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    let subject = ["resync", "delta", "sync_state", "token"]
        .iter()
        .any(|s| lowered.contains(s));
    let verdict = lowered.contains("invalid") || lowered.contains("expired");
    subject && verdict
}

impl From<ProviderError> for Error {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::Auth => Self::Auth(err.message),
            ProviderErrorKind::Network => Self::Network(err.message),
            ProviderErrorKind::Throttled => Self::Throttled(err.message),
            ProviderErrorKind::CursorInvalid => Self::CursorInvalid(err.message),
            ProviderErrorKind::NotFound => Self::NotFound(err.message),
            ProviderErrorKind::Other => Self::Fatal(err.message),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteFolder {
    pub id: String,
    pub display_name: String,
    pub parent_id: Option<String>,
    /// `/`-separated hierarchical path built during enumeration.
    pub full_path: String,
    pub total_item_count: Option<i64>,
    pub unread_item_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedReason {
    Deleted,
    Changed,
}

#[derive(Debug, Clone, Default)]
pub struct DeltaItem {
    pub id: String,
    pub immutable_id: Option<String>,
    pub internet_message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub recipients: Option<String>,
    pub received_time: Option<OffsetDateTime>,
    pub has_attachments: bool,
    pub conversation_id: Option<String>,
    pub parent_folder_id: Option<String>,
    pub removed_reason: Option<RemovedReason>,
    pub new_parent_folder_id: Option<String>,
}

impl DeltaItem {
    /// The dedup key: the server's move-stable identifier when present,
    /// otherwise the row id.
    pub fn dedup_id(&self) -> &str {
        self.immutable_id.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaPage {
    pub items: Vec<DeltaItem>,
    /// Continuation for the next page, when more pages exist.
    pub next_cursor: Option<String>,
    /// Terminal cursor, present only on the last page.
    pub final_cursor: Option<String>,
}

/// The narrow mailbox capability the sync engine consumes. One production
/// implementation talks to the hosted API; tests substitute stubs.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn current_user_mailbox(&self) -> Result<String, ProviderError>;

    async fn list_folders(&self, mailbox: Option<&str>)
    -> Result<Vec<RemoteFolder>, ProviderError>;

    async fn delta_page(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, ProviderError>;

    async fn fetch_mime(&self, message_id: &str) -> Result<Vec<u8>, ProviderError>;

    async fn list_messages_since(
        &self,
        folder_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<DeltaItem>, ProviderError>;
}

/// Bearer-token supplier the provider adapter pulls from. Implemented by the
/// credential gateway in production.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self) -> crate::error::Result<String>;
}
