use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use magpie::provider::types::{
    DeltaItem, DeltaPage, MailProvider, ProviderError, ProviderErrorKind, RemoteFolder,
};
use magpie::sync::summary::CancelToken;

type PageKey = (String, Option<String>);

/// Scripted provider: pages keyed by (folder, cursor), bodies keyed by
/// message id. Unscripted requests fail loudly so a test can prove a call
/// never happened.
#[derive(Default)]
pub struct StubProvider {
    pub mailbox: String,
    folders: Vec<RemoteFolder>,
    pages: HashMap<PageKey, Result<DeltaPage, (ProviderErrorKind, String)>>,
    bodies: HashMap<String, Vec<u8>>,
    since_items: HashMap<String, Vec<DeltaItem>>,
    pub since_calls: Mutex<Vec<(String, OffsetDateTime)>>,
    pub fetch_count: AtomicUsize,
    pub cancel_after_fetches: Option<(usize, CancelToken)>,
}

impl StubProvider {
    pub fn new(mailbox: &str) -> Self {
        Self {
            mailbox: mailbox.to_string(),
            ..Self::default()
        }
    }

    pub fn add_folder(&mut self, id: &str, full_path: &str) {
        self.folders.push(RemoteFolder {
            id: id.to_string(),
            display_name: full_path
                .rsplit('/')
                .next()
                .unwrap_or(full_path)
                .to_string(),
            parent_id: None,
            full_path: full_path.to_string(),
            total_item_count: None,
            unread_item_count: None,
        });
    }

    pub fn script_page(&mut self, folder_id: &str, cursor: Option<&str>, page: DeltaPage) {
        self.pages.insert(
            (folder_id.to_string(), cursor.map(String::from)),
            Ok(page),
        );
    }

    pub fn script_error(
        &mut self,
        folder_id: &str,
        cursor: Option<&str>,
        kind: ProviderErrorKind,
        message: &str,
    ) {
        self.pages.insert(
            (folder_id.to_string(), cursor.map(String::from)),
            Err((kind, message.to_string())),
        );
    }

    pub fn add_body(&mut self, message_id: &str, bytes: &[u8]) {
        self.bodies.insert(message_id.to_string(), bytes.to_vec());
    }

    pub fn set_since(&mut self, folder_id: &str, items: Vec<DeltaItem>) {
        self.since_items.insert(folder_id.to_string(), items);
    }
}

#[async_trait]
impl MailProvider for StubProvider {
    async fn current_user_mailbox(&self) -> Result<String, ProviderError> {
        Ok(self.mailbox.clone())
    }

    async fn list_folders(
        &self,
        _mailbox: Option<&str>,
    ) -> Result<Vec<RemoteFolder>, ProviderError> {
        Ok(self.folders.clone())
    }

    async fn delta_page(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, ProviderError> {
        match self
            .pages
            .get(&(folder_id.to_string(), cursor.map(String::from)))
        {
            Some(Ok(page)) => Ok(clone_page(page)),
            Some(Err((kind, message))) => Err(ProviderError::new(*kind, message.clone())),
            None => Err(ProviderError::new(
                ProviderErrorKind::Other,
                format!("unscripted delta request: folder={folder_id} cursor={cursor:?}"),
            )),
        }
    }

    async fn fetch_mime(&self, message_id: &str) -> Result<Vec<u8>, ProviderError> {
        let count = self.fetch_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after_fetches {
            if count >= *after {
                token.cancel();
            }
        }
        self.bodies.get(message_id).cloned().ok_or_else(|| {
            ProviderError::new(
                ProviderErrorKind::NotFound,
                format!("no body scripted for {message_id}"),
            )
        })
    }

    async fn list_messages_since(
        &self,
        folder_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<DeltaItem>, ProviderError> {
        self.since_calls
            .lock()
            .unwrap()
            .push((folder_id.to_string(), since));
        Ok(self
            .since_items
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }
}

fn clone_page(page: &DeltaPage) -> DeltaPage {
    DeltaPage {
        items: page.items.clone(),
        next_cursor: page.next_cursor.clone(),
        final_cursor: page.final_cursor.clone(),
    }
}

pub fn present_item(id: &str, immutable_id: &str, subject: &str, received: &str) -> DeltaItem {
    DeltaItem {
        id: id.to_string(),
        immutable_id: Some(immutable_id.to_string()),
        subject: Some(subject.to_string()),
        from: Some("Alice <alice@example.org>".to_string()),
        received_time: Some(OffsetDateTime::parse(received, &Rfc3339).unwrap()),
        ..DeltaItem::default()
    }
}

pub fn mime_for(subject: &str) -> Vec<u8> {
    format!(
        "Subject: {subject}\r\nFrom: alice@example.org\r\nContent-Type: text/plain; charset=utf-8\r\n\r\nbody of {subject}"
    )
    .into_bytes()
}
