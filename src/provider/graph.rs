use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::debug;

use crate::provider::types::{
    DeltaItem, DeltaPage, MailProvider, ProviderError, ProviderErrorKind, RemoteFolder,
    RemovedReason, TokenSource,
};
use crate::util::time::{format_rfc3339, parse_rfc3339};

const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const PAGE_SIZE: u32 = 100;

/// Thin REST adapter over the hosted mail API. All heavy lifting lives in
/// the sync engine; this just shapes requests and classifies failures.
pub struct GraphProvider {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
    mailbox: Option<String>,
}

impl GraphProvider {
    pub fn new(tokens: Arc<dyn TokenSource>, mailbox: Option<String>) -> Self {
        Self::with_base_url(tokens, mailbox, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        tokens: Arc<dyn TokenSource>,
        mailbox: Option<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            mailbox,
        }
    }

    fn user_segment(&self, mailbox: Option<&str>) -> String {
        match mailbox.or(self.mailbox.as_deref()) {
            Some(user) => format!("users/{user}"),
            None => "me".to_string(),
        }
    }

    async fn get(&self, url: &str, immutable_ids: bool) -> Result<reqwest::Response, ProviderError> {
        let token = self
            .tokens
            .bearer_token()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::Auth, err.to_string()))?;
        let mut request = self.http.get(url).bearer_auth(token);
        if immutable_ids {
            request = request.header("Prefer", "IdType=\"ImmutableId\"");
        }
        let response = request
            .send()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::Network, err.to_string()))?;
        classify_response(response).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        immutable_ids: bool,
    ) -> Result<T, ProviderError> {
        self.get(url, immutable_ids)
            .await?
            .json::<T>()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::Other, err.to_string()))
    }

    async fn folder_page(
        &self,
        url: &str,
        out: &mut Vec<GraphFolder>,
    ) -> Result<(), ProviderError> {
        let mut next = Some(url.to_string());
        while let Some(url) = next {
            let page: GraphList<GraphFolder> = self.get_json(&url, true).await?;
            out.extend(page.value);
            next = page.next_link;
        }
        Ok(())
    }
}

async fn classify_response(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let code = serde_json::from_str::<GraphErrorBody>(&body)
        .map(|b| b.error.code)
        .unwrap_or_default();
    let detail = format!("{status}: {code} {body}");
    let kind = match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        404 => ProviderErrorKind::NotFound,
        429 => ProviderErrorKind::Throttled,
        _ if is_cursor_error_code(&code) => ProviderErrorKind::CursorInvalid,
        410 => ProviderErrorKind::CursorInvalid,
        500..=599 => ProviderErrorKind::Network,
        _ => ProviderErrorKind::Other,
    };
    Err(ProviderError::new(kind, detail))
}

fn is_cursor_error_code(code: &str) -> bool {
    let lowered = code.to_ascii_lowercase();
    lowered.contains("resync") || lowered.contains("syncstatenotfound") || lowered.contains("syncstateinvalid")
}

#[async_trait]
impl MailProvider for GraphProvider {
    async fn current_user_mailbox(&self) -> Result<String, ProviderError> {
        if let Some(mailbox) = &self.mailbox {
            return Ok(mailbox.clone());
        }
        let me: GraphUser = self
            .get_json(&format!("{}/me", self.base_url), false)
            .await?;
        me.mail
            .or(me.user_principal_name)
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Other, "user has no mailbox address"))
    }

    async fn list_folders(
        &self,
        mailbox: Option<&str>,
    ) -> Result<Vec<RemoteFolder>, ProviderError> {
        let user = self.user_segment(mailbox);
        let mut raw = Vec::new();
        self.folder_page(
            &format!(
                "{}/{user}/mailFolders?includeHiddenFolders=true&$top={PAGE_SIZE}",
                self.base_url
            ),
            &mut raw,
        )
        .await?;
        // breadth-first over children so paths build parent-first
        let mut index = 0;
        while index < raw.len() {
            let (id, child_count) = (raw[index].id.clone(), raw[index].child_folder_count);
            if child_count > 0 {
                self.folder_page(
                    &format!(
                        "{}/{user}/mailFolders/{id}/childFolders?includeHiddenFolders=true&$top={PAGE_SIZE}",
                        self.base_url
                    ),
                    &mut raw,
                )
                .await?;
            }
            index += 1;
        }

        let mut paths: HashMap<String, String> = HashMap::new();
        let mut folders = Vec::with_capacity(raw.len());
        for folder in &raw {
            let full_path = match folder.parent_folder_id.as_deref().and_then(|p| paths.get(p)) {
                Some(parent_path) => format!("{parent_path}/{}", folder.display_name),
                None => folder.display_name.clone(),
            };
            paths.insert(folder.id.clone(), full_path.clone());
            folders.push(RemoteFolder {
                id: folder.id.clone(),
                display_name: folder.display_name.clone(),
                parent_id: folder.parent_folder_id.clone(),
                full_path,
                total_item_count: folder.total_item_count,
                unread_item_count: folder.unread_item_count,
            });
        }
        debug!(count = folders.len(), "enumerated remote folders");
        Ok(folders)
    }

    async fn delta_page(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, ProviderError> {
        let user = self.user_segment(None);
        let url = match cursor {
            // cursors are complete continuation URLs issued by the server
            Some(cursor) => cursor.to_string(),
            None => format!(
                "{}/{user}/mailFolders/{folder_id}/messages/delta?$top={PAGE_SIZE}",
                self.base_url
            ),
        };
        let page: GraphDeltaPage = self.get_json(&url, true).await?;
        Ok(DeltaPage {
            items: page.value.into_iter().map(GraphMessage::into_item).collect(),
            next_cursor: page.next_link,
            final_cursor: page.delta_link,
        })
    }

    async fn fetch_mime(&self, message_id: &str) -> Result<Vec<u8>, ProviderError> {
        let user = self.user_segment(None);
        let response = self
            .get(
                &format!("{}/{user}/messages/{message_id}/$value", self.base_url),
                true,
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProviderError::new(ProviderErrorKind::Network, err.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn list_messages_since(
        &self,
        folder_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<DeltaItem>, ProviderError> {
        let user = self.user_segment(None);
        let filter = format!("receivedDateTime ge {}", format_rfc3339(since));
        let mut url = Some(format!(
            "{}/{user}/mailFolders/{folder_id}/messages?$filter={}&$top={PAGE_SIZE}",
            self.base_url,
            urlencode(&filter)
        ));
        let mut items = Vec::new();
        while let Some(current) = url {
            let page: GraphDeltaPage = self.get_json(&current, true).await?;
            items.extend(page.value.into_iter().map(GraphMessage::into_item));
            url = page.next_link;
        }
        Ok(items)
    }
}

fn urlencode(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            ' ' => "%20".to_string(),
            ':' => "%3A".to_string(),
            '+' => "%2B".to_string(),
            other => other.to_string(),
        })
        .collect()
}

// -- wire shapes --------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Debug, Deserialize, Default)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct GraphUser {
    #[serde(default)]
    mail: Option<String>,
    #[serde(rename = "userPrincipalName", default)]
    user_principal_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphFolder {
    id: String,
    #[serde(rename = "displayName", default)]
    display_name: String,
    #[serde(rename = "parentFolderId", default)]
    parent_folder_id: Option<String>,
    #[serde(rename = "childFolderCount", default)]
    child_folder_count: i64,
    #[serde(rename = "totalItemCount", default)]
    total_item_count: Option<i64>,
    #[serde(rename = "unreadItemCount", default)]
    unread_item_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GraphDeltaPage {
    #[serde(default = "Vec::new")]
    value: Vec<GraphMessage>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink", default)]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphRemoved {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct GraphAddressWrapper {
    #[serde(rename = "emailAddress", default)]
    email_address: Option<GraphAddress>,
}

#[derive(Debug, Deserialize, Default)]
struct GraphAddress {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

impl GraphAddress {
    fn render(&self) -> String {
        match (&self.name, &self.address) {
            (Some(name), Some(addr)) if !name.is_empty() => format!("{name} <{addr}>"),
            (_, Some(addr)) => addr.clone(),
            (Some(name), None) => name.clone(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphMessage {
    id: String,
    #[serde(rename = "immutableId", default)]
    immutable_id: Option<String>,
    #[serde(rename = "internetMessageId", default)]
    internet_message_id: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<GraphAddressWrapper>,
    #[serde(rename = "toRecipients", default)]
    to_recipients: Vec<GraphAddressWrapper>,
    #[serde(rename = "receivedDateTime", default)]
    received_date_time: Option<String>,
    #[serde(rename = "hasAttachments", default)]
    has_attachments: bool,
    #[serde(rename = "conversationId", default)]
    conversation_id: Option<String>,
    #[serde(rename = "parentFolderId", default)]
    parent_folder_id: Option<String>,
    #[serde(rename = "@removed", default)]
    removed: Option<GraphRemoved>,
}

impl GraphMessage {
    fn into_item(self) -> DeltaItem {
        let removed_reason = self.removed.as_ref().map(|r| match r.reason.as_str() {
            "deleted" => RemovedReason::Deleted,
            _ => RemovedReason::Changed,
        });
        let recipients: Vec<String> = self
            .to_recipients
            .iter()
            .filter_map(|w| w.email_address.as_ref())
            .map(GraphAddress::render)
            .filter(|r| !r.is_empty())
            .collect();
        let new_parent = if removed_reason == Some(RemovedReason::Changed) {
            self.parent_folder_id.clone()
        } else {
            None
        };
        DeltaItem {
            received_time: self
                .received_date_time
                .as_deref()
                .and_then(|v| parse_rfc3339(v).ok()),
            recipients: if recipients.is_empty() {
                None
            } else {
                serde_json::to_string(&recipients).ok()
            },
            from: self
                .from
                .as_ref()
                .and_then(|w| w.email_address.as_ref())
                .map(GraphAddress::render),
            id: self.id,
            immutable_id: self.immutable_id,
            internet_message_id: self.internet_message_id,
            subject: self.subject,
            has_attachments: self.has_attachments,
            conversation_id: self.conversation_id,
            parent_folder_id: self.parent_folder_id,
            removed_reason,
            new_parent_folder_id: new_parent,
        }
    }
}
