use std::collections::HashSet;

use futures::StreamExt;
use mailparse::MailHeaderMap;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fsops::eml::EmlStore;
use crate::model::filename::sanitize_folder_path;
use crate::provider::types::{
    DeltaItem, MailProvider, ProviderError, RemoteFolder, RemovedReason,
};
use crate::store::db::StateStore;
use crate::store::records::{FolderRecord, FolderSyncProgress, MessageRecord};
use crate::sync::filter::FolderMatcher;
use crate::sync::summary::{CancelToken, SyncOptions, SyncSummary};
use crate::transform::driver::TransformPipeline;

/// Date-window fallback overlap, absorbing late-arriving messages whose
/// receipt timestamps are slightly out of order.
const FALLBACK_OVERLAP: Duration = Duration::minutes(60);

const QUARANTINE_REASON_DELETED: &str = "deleted_in_provider";

/// Per-folder incremental pipeline: delta cursor, page, dedupe, download,
/// store, record. Owns the active store connection and the folder cursor for
/// the folder in flight.
pub struct SyncEngine<'a> {
    provider: &'a dyn MailProvider,
    store: &'a mut StateStore,
    eml: &'a EmlStore,
    transforms: Option<&'a TransformPipeline>,
    options: SyncOptions,
    cancel: CancelToken,
}

struct FolderCursorState {
    page_number: i64,
    processed: i64,
    since_checkpoint: i64,
    started_at: OffsetDateTime,
}

enum Action {
    New(DeltaItem),
    Skip,
    Delete(DeltaItem),
    Move(DeltaItem),
}

enum Fetched {
    New(DeltaItem, std::result::Result<Vec<u8>, ProviderError>),
    Skip,
    Delete(DeltaItem),
    Move(DeltaItem),
    Cancelled,
}

enum DeltaOutcome {
    Completed,
    CursorRejected,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        provider: &'a dyn MailProvider,
        store: &'a mut StateStore,
        eml: &'a EmlStore,
        options: SyncOptions,
        cancel: CancelToken,
    ) -> Self {
        Self {
            provider,
            store,
            eml,
            transforms: None,
            options,
            cancel,
        }
    }

    /// Render derivatives for each newly ingested message, inside the same
    /// commit scope as its row.
    pub fn with_inline_transforms(mut self, pipeline: &'a TransformPipeline) -> Self {
        self.transforms = Some(pipeline);
        self
    }

    pub async fn run(mut self) -> Result<SyncSummary> {
        let mailbox = match &self.options.mailbox {
            Some(mailbox) => mailbox.clone(),
            None => self.provider.current_user_mailbox().await?,
        };
        info!(%mailbox, "starting sync");
        if !self.options.dry_run {
            self.store.ensure_sync_state(&mailbox)?;
        }

        let folders = self
            .provider
            .list_folders(self.options.mailbox.as_deref())
            .await?;
        let matcher = FolderMatcher::new(&self.options.exclude_patterns);
        let selected: Vec<RemoteFolder> = folders
            .into_iter()
            .filter(|f| !matcher.is_excluded(&f.full_path))
            .filter(|f| match &self.options.folder {
                Some(only) => path_selects(only, &f.full_path),
                None => true,
            })
            .collect();

        if self.options.dry_run {
            for folder in &selected {
                info!(folder = %folder.full_path, "would sync");
            }
            info!(folders = selected.len(), "dry run: nothing persisted");
            return Ok(SyncSummary::default());
        }

        for folder in &selected {
            self.store.upsert_folder(&folder_record(folder))?;
        }

        let batch_id = format!("batch-{}", OffsetDateTime::now_utc().unix_timestamp());
        let mut summary = SyncSummary::default();
        for folder in &selected {
            if self.cancel.is_cancelled() {
                warn!(%summary, "sync cancelled");
                return Err(Error::Cancelled);
            }
            match self
                .sync_folder(folder, &mailbox, &batch_id, &mut summary)
                .await
            {
                Ok(()) => summary.folders_processed += 1,
                Err(Error::Cancelled) => {
                    warn!(%summary, "sync cancelled");
                    return Err(Error::Cancelled);
                }
                Err(err @ (Error::Filesystem(_) | Error::Integrity(_))) => {
                    // folder stays resumable through its progress row
                    warn!(folder = %folder.full_path, error = %err, "folder aborted");
                    summary.errors += 1;
                }
                Err(err) => {
                    warn!(%summary, "sync aborted");
                    return Err(err);
                }
            }
        }

        self.store
            .set_sync_completed(&mailbox, OffsetDateTime::now_utc())?;
        info!(%summary, "sync complete");
        Ok(summary)
    }

    async fn sync_folder(
        &mut self,
        folder: &RemoteFolder,
        mailbox: &str,
        batch_id: &str,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let stored = self
            .store
            .get_folder(&folder.id)?
            .ok_or_else(|| Error::Integrity(format!("folder {} missing after upsert", folder.id)))?;
        let progress = self.store.folder_progress(&folder.id)?;
        let cursor = progress
            .as_ref()
            .and_then(|p| p.pending_next_link.clone())
            .or_else(|| stored.delta_token.clone());
        let mut state = FolderCursorState {
            page_number: progress.as_ref().map_or(0, |p| p.pending_page_number),
            processed: progress.as_ref().map_or(0, |p| p.messages_processed),
            since_checkpoint: 0,
            started_at: progress
                .as_ref()
                .map_or_else(OffsetDateTime::now_utc, |p| p.sync_started_at),
        };
        if progress.is_some() {
            info!(folder = %stored.local_path, "resuming interrupted folder sync");
        }

        match self
            .run_delta(folder, &stored, mailbox, batch_id, cursor, &mut state, summary)
            .await?
        {
            DeltaOutcome::Completed => Ok(()),
            DeltaOutcome::CursorRejected => {
                info!(folder = %stored.local_path, "delta cursor rejected, using fallback");
                self.fallback_sync(folder, &stored, mailbox, batch_id, summary)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_delta(
        &mut self,
        folder: &RemoteFolder,
        stored: &FolderRecord,
        mailbox: &str,
        batch_id: &str,
        mut cursor: Option<String>,
        state: &mut FolderCursorState,
        summary: &mut SyncSummary,
    ) -> Result<DeltaOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let page_cursor = cursor.clone();
            let page = match self.provider.delta_page(&folder.id, cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) if err.is_cursor_invalid() => return Ok(DeltaOutcome::CursorRejected),
                Err(err) => return Err(err.into()),
            };
            state.page_number += 1;
            debug!(folder = %stored.local_path, page = state.page_number, items = page.items.len(), "processing delta page");
            self.process_items(
                &folder.id,
                stored,
                mailbox,
                batch_id,
                page.items,
                page_cursor,
                state,
                summary,
            )
            .await?;

            match page.next_cursor {
                Some(link) => cursor = Some(link),
                None => {
                    // terminal page: advance the cursor and retire the
                    // progress row in one commit
                    let now = OffsetDateTime::now_utc();
                    let txn = self.store.begin()?;
                    match page.final_cursor.as_deref() {
                        Some(token) => txn.set_folder_delta_token(&folder.id, token, now)?,
                        None => txn.set_folder_last_sync(&folder.id, now)?,
                    }
                    txn.delete_progress(&folder.id)?;
                    txn.touch_sync_state(mailbox, Some(batch_id))?;
                    txn.commit()?;
                    return Ok(DeltaOutcome::Completed);
                }
            }
        }
    }

    /// Expired cursor: re-ingest a date window through the normal dedup path
    /// without touching the stored delta token; a later run re-establishes a
    /// fresh cursor.
    async fn fallback_sync(
        &mut self,
        folder: &RemoteFolder,
        stored: &FolderRecord,
        mailbox: &str,
        batch_id: &str,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let mut state = FolderCursorState {
            page_number: 1,
            processed: 0,
            since_checkpoint: 0,
            started_at: OffsetDateTime::now_utc(),
        };
        match stored.last_sync_time {
            Some(last_sync) => {
                let since = last_sync - FALLBACK_OVERLAP;
                let items = self
                    .provider
                    .list_messages_since(&folder.id, since)
                    .await?;
                info!(folder = %stored.local_path, items = items.len(), "date-window fallback");
                self.process_items(
                    &folder.id,
                    stored,
                    mailbox,
                    batch_id,
                    items,
                    None,
                    &mut state,
                    summary,
                )
                .await?;
                let txn = self.store.begin()?;
                txn.set_folder_last_sync(&folder.id, OffsetDateTime::now_utc())?;
                txn.delete_progress(&folder.id)?;
                txn.touch_sync_state(mailbox, Some(batch_id))?;
                txn.commit()?;
                Ok(())
            }
            None => {
                info!(folder = %stored.local_path, "no prior sync window, starting full delta");
                match self
                    .run_delta(folder, stored, mailbox, batch_id, None, &mut state, summary)
                    .await?
                {
                    DeltaOutcome::Completed => Ok(()),
                    DeltaOutcome::CursorRejected => Err(Error::CursorInvalid(
                        "provider rejected a fresh delta request".into(),
                    )),
                }
            }
        }
    }

    /// Classify serially (the dedup read path), then drive downloads through
    /// an order-preserving bounded stream so inserts land FIFO by page order.
    #[allow(clippy::too_many_arguments)]
    async fn process_items(
        &mut self,
        folder_id: &str,
        stored: &FolderRecord,
        mailbox: &str,
        batch_id: &str,
        items: Vec<DeltaItem>,
        page_cursor: Option<String>,
        state: &mut FolderCursorState,
        summary: &mut SyncSummary,
    ) -> Result<()> {
        let mut plan = Vec::with_capacity(items.len());
        let mut seen_in_page: HashSet<String> = HashSet::new();
        for item in items {
            let action = match item.removed_reason {
                Some(RemovedReason::Deleted) => Action::Delete(item),
                Some(RemovedReason::Changed) => Action::Move(item),
                None => {
                    let duplicate = !seen_in_page.insert(item.dedup_id().to_string());
                    if duplicate
                        || self
                            .store
                            .get_message_by_immutable_id(item.dedup_id())?
                            .is_some()
                    {
                        Action::Skip
                    } else {
                        Action::New(item)
                    }
                }
            };
            plan.push(action);
        }

        let provider = self.provider;
        let cancel = self.cancel.clone();
        let width = self.options.max_parallel_downloads.max(1);
        let mut fetched = futures::stream::iter(plan.into_iter().map(move |action| {
            let cancel = cancel.clone();
            async move {
                match action {
                    Action::New(item) => {
                        if cancel.is_cancelled() {
                            return Fetched::Cancelled;
                        }
                        let bytes = provider.fetch_mime(&item.id).await;
                        Fetched::New(item, bytes)
                    }
                    Action::Skip => Fetched::Skip,
                    Action::Delete(item) => Fetched::Delete(item),
                    Action::Move(item) => Fetched::Move(item),
                }
            }
        }))
        .buffered(width);

        let mut index_in_page: i64 = 0;
        while let Some(result) = fetched.next().await {
            match result {
                Fetched::Cancelled => {
                    drop(fetched);
                    self.checkpoint(folder_id, mailbox, batch_id, page_cursor.as_deref(), index_in_page, state)?;
                    return Err(Error::Cancelled);
                }
                Fetched::Skip => summary.messages_skipped += 1,
                Fetched::New(item, Ok(bytes)) => {
                    match self.ingest_message(&item, stored, &bytes) {
                        Ok(transform_failed) => {
                            summary.messages_synced += 1;
                            if transform_failed {
                                summary.errors += 1;
                            }
                        }
                        Err(err @ Error::Integrity(_)) => return Err(err),
                        Err(err) => {
                            warn!(message = %item.id, error = %err, "failed to store message");
                            summary.errors += 1;
                        }
                    }
                }
                Fetched::New(item, Err(err)) => {
                    warn!(message = %item.id, error = %err, "download failed");
                    summary.errors += 1;
                }
                Fetched::Delete(item) => {
                    if self.quarantine_message(&item)? {
                        summary.quarantined += 1;
                    }
                }
                Fetched::Move(item) => {
                    if self.move_message(&item)? {
                        summary.moves += 1;
                    }
                }
            }
            index_in_page += 1;
            state.processed += 1;
            state.since_checkpoint += 1;
            if state.since_checkpoint >= i64::from(self.options.checkpoint_interval.max(1)) {
                self.checkpoint(folder_id, mailbox, batch_id, page_cursor.as_deref(), index_in_page, state)?;
                state.since_checkpoint = 0;
            }
        }
        Ok(())
    }

    /// New message: canonical file first, then its row. Returns whether an
    /// inline transformation failed (never fatal to the folder).
    fn ingest_message(
        &mut self,
        item: &DeltaItem,
        folder: &FolderRecord,
        bytes: &[u8],
    ) -> Result<bool> {
        let received = item.received_time.unwrap_or_else(OffsetDateTime::now_utc);
        let subject = item.subject.clone().unwrap_or_default();
        let stored = self
            .eml
            .store(bytes, &folder.local_path, &subject, received)?;
        let in_reply_to = mailparse::parse_headers(bytes)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value("In-Reply-To"));
        let now = OffsetDateTime::now_utc();
        let record = MessageRecord {
            graph_id: item.id.clone(),
            immutable_id: item.dedup_id().to_string(),
            local_path: stored.relative_path,
            folder_path: folder.local_path.clone(),
            subject: item.subject.clone(),
            sender: item.from.clone(),
            recipients: item.recipients.clone(),
            received_time: received,
            size: stored.size as i64,
            has_attachments: item.has_attachments,
            in_reply_to,
            conversation_id: item.conversation_id.clone(),
            quarantined_at: None,
            quarantine_reason: None,
            created_at: now,
            updated_at: now,
        };
        let txn = self.store.begin()?;
        txn.insert_message(&record)?;
        let mut transform_failed = false;
        if let Some(pipeline) = self.transforms {
            if let Err(err) = pipeline.apply_inline(&txn, &record, bytes) {
                warn!(message = %record.graph_id, error = %err, "inline transformation failed");
                transform_failed = true;
            }
        }
        txn.commit()?;
        debug!(message = %record.graph_id, path = %record.local_path, "ingested");
        Ok(transform_failed)
    }

    /// Server-side deletion: relocate the file, mark the row. A file that is
    /// already gone still gets its quarantine markers.
    fn quarantine_message(&mut self, item: &DeltaItem) -> Result<bool> {
        let existing = match self.store.get_message_by_immutable_id(item.dedup_id())? {
            Some(found) => Some(found),
            None => self.store.get_message_by_graph_id(&item.id)?,
        };
        let Some(message) = existing else {
            debug!(message = %item.id, "deletion for unknown message ignored");
            return Ok(false);
        };
        if message.quarantined_at.is_some() {
            return Ok(false);
        }
        let new_path = match self.eml.move_to_quarantine(&message.local_path) {
            Ok(path) => Some(path),
            Err(Error::NotFound(_)) => {
                warn!(message = %message.graph_id, "canonical file already missing");
                None
            }
            Err(err) => return Err(err),
        };
        let txn = self.store.begin()?;
        txn.mark_quarantined(
            &message.graph_id,
            OffsetDateTime::now_utc(),
            QUARANTINE_REASON_DELETED,
            new_path.as_deref(),
        )?;
        txn.commit()?;
        info!(message = %message.graph_id, "quarantined");
        Ok(true)
    }

    /// Server-side move: metadata only, the file never moves. An unknown
    /// target folder defers until that folder's own sync.
    fn move_message(&mut self, item: &DeltaItem) -> Result<bool> {
        let existing = match self.store.get_message_by_immutable_id(item.dedup_id())? {
            Some(found) => Some(found),
            None => self.store.get_message_by_graph_id(&item.id)?,
        };
        let Some(message) = existing else {
            return Ok(false);
        };
        let Some(new_parent) = item.new_parent_folder_id.as_deref() else {
            return Ok(false);
        };
        match self.store.get_folder(new_parent)? {
            Some(folder) => {
                let txn = self.store.begin()?;
                txn.update_folder_path(&message.graph_id, &folder.local_path)?;
                txn.commit()?;
                debug!(message = %message.graph_id, to = %folder.local_path, "folder metadata updated");
                Ok(true)
            }
            None => {
                debug!(message = %message.graph_id, folder = new_parent, "move target unknown, deferred");
                Ok(false)
            }
        }
    }

    fn checkpoint(
        &mut self,
        folder_id: &str,
        mailbox: &str,
        batch_id: &str,
        page_cursor: Option<&str>,
        index_in_page: i64,
        state: &FolderCursorState,
    ) -> Result<()> {
        let txn = self.store.begin()?;
        txn.upsert_progress(&FolderSyncProgress {
            folder_id: folder_id.to_string(),
            pending_next_link: page_cursor.map(String::from),
            pending_page_number: state.page_number,
            pending_message_index: index_in_page,
            sync_started_at: state.started_at,
            last_checkpoint_at: OffsetDateTime::now_utc(),
            messages_processed: state.processed,
        })?;
        txn.touch_sync_state(mailbox, Some(batch_id))?;
        txn.commit()?;
        debug!(folder = folder_id, index = index_in_page, "checkpoint committed");
        Ok(())
    }
}

pub fn folder_record(folder: &RemoteFolder) -> FolderRecord {
    FolderRecord {
        graph_id: folder.id.clone(),
        parent_folder_id: folder.parent_id.clone(),
        local_path: sanitize_folder_path(&folder.full_path),
        display_name: folder.display_name.clone(),
        total_item_count: folder.total_item_count,
        unread_item_count: folder.unread_item_count,
        delta_token: None,
        last_sync_time: None,
    }
}

fn path_selects(only: &str, candidate: &str) -> bool {
    let only = only.trim_end_matches('/');
    candidate.eq_ignore_ascii_case(only)
        || (candidate.len() > only.len()
            && candidate
                .get(..only.len())
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case(only))
            && candidate.as_bytes()[only.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_selection_includes_descendants() {
        assert!(path_selects("Inbox", "Inbox"));
        assert!(path_selects("inbox", "Inbox/Sub"));
        assert!(!path_selects("Inbox", "Inbox2"));
        assert!(!path_selects("Inbox/Sub", "Inbox"));
        assert!(path_selects("Inbox/", "Inbox"));
    }

    #[test]
    fn folder_record_sanitizes_path() {
        let remote = RemoteFolder {
            id: "f1".to_string(),
            display_name: "Project: X".to_string(),
            parent_id: Some("root".to_string()),
            full_path: "Inbox/Project: X".to_string(),
            total_item_count: Some(3),
            unread_item_count: Some(1),
        };
        let record = folder_record(&remote);
        assert_eq!(record.local_path, "Inbox/Project-X");
        assert!(record.delta_token.is_none());
    }
}
