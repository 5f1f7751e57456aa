use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::store::migrations::MIGRATIONS;
use crate::store::records::{
    AttachmentRecord, FolderRecord, FolderSyncProgress, MessageRecord, SyncStateRecord,
    TransformationRecord, TransformationType, ZipExtractedFile, ZipExtractionRecord,
};
use crate::util::time::{format_rfc3339, parse_rfc3339};

/// Embedded metadata database, one file under `status/`. Single writer;
/// every multi-row mutation that must be atomic goes through [`StateTxn`].
pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| Error::Schema(err.to_string()))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| Error::Schema(err.to_string()))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|err| Error::Schema(err.to_string()))?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_version (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                )",
            )
            .map_err(|err| Error::Schema(err.to_string()))?;
        let current: i64 = self
            .conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })
            .map_err(|err| Error::Schema(err.to_string()))?;
        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .map_err(|err| Error::Schema(err.to_string()))?;
            tx.execute_batch(sql)
                .map_err(|err| Error::Schema(format!("migration {version}: {err}")))?;
            tx.execute(
                "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![version, format_rfc3339(OffsetDateTime::now_utc())],
            )
            .map_err(|err| Error::Schema(err.to_string()))?;
            tx.commit().map_err(|err| Error::Schema(err.to_string()))?;
            tracing::debug!(version, "applied schema migration");
        }
        Ok(())
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
                row.get(0)
            })?)
    }

    pub fn begin(&mut self) -> Result<StateTxn<'_>> {
        Ok(StateTxn {
            tx: self.conn.transaction()?,
        })
    }

    // -- folders --------------------------------------------------------

    /// Insert or refresh a folder mapping. When a row with the same
    /// `local_path` exists under a different server id, its delta token and
    /// last sync time carry over so an identifier-scheme change does not
    /// throw away sync progress.
    pub fn upsert_folder(&mut self, folder: &FolderRecord) -> Result<()> {
        let tx = self.conn.transaction()?;
        let previous: Option<(String, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT graph_id, delta_token, last_sync_time FROM folders WHERE local_path = ?1",
                params![folder.local_path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let (carry_token, carry_sync) = match previous {
            Some((old_id, token, sync)) if old_id != folder.graph_id => {
                tx.execute("DELETE FROM folders WHERE graph_id = ?1", params![old_id])?;
                (token, sync)
            }
            _ => (None, None),
        };
        let delta_token = folder.delta_token.clone().or(carry_token);
        let last_sync = folder
            .last_sync_time
            .map(format_rfc3339)
            .or(carry_sync);
        tx.execute(
            "INSERT INTO folders
                (graph_id, parent_folder_id, local_path, display_name,
                 total_item_count, unread_item_count, delta_token, last_sync_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(graph_id) DO UPDATE SET
                parent_folder_id = excluded.parent_folder_id,
                local_path = excluded.local_path,
                display_name = excluded.display_name,
                total_item_count = excluded.total_item_count,
                unread_item_count = excluded.unread_item_count,
                delta_token = COALESCE(excluded.delta_token, folders.delta_token),
                last_sync_time = COALESCE(excluded.last_sync_time, folders.last_sync_time)",
            params![
                folder.graph_id,
                folder.parent_folder_id,
                folder.local_path,
                folder.display_name,
                folder.total_item_count,
                folder.unread_item_count,
                delta_token,
                last_sync,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_folder(&self, graph_id: &str) -> Result<Option<FolderRecord>> {
        folder_by(&self.conn, "graph_id", graph_id)
    }

    pub fn get_folder_by_path(&self, local_path: &str) -> Result<Option<FolderRecord>> {
        folder_by(&self.conn, "local_path", local_path)
    }

    pub fn list_folders(&self) -> Result<Vec<FolderRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FOLDER_COLUMNS} FROM folders ORDER BY local_path"
        ))?;
        let rows = stmt.query_map([], map_folder)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- messages -------------------------------------------------------

    pub fn get_message_by_immutable_id(&self, immutable_id: &str) -> Result<Option<MessageRecord>> {
        message_by(&self.conn, "immutable_id", immutable_id)
    }

    pub fn get_message_by_graph_id(&self, graph_id: &str) -> Result<Option<MessageRecord>> {
        message_by(&self.conn, "graph_id", graph_id)
    }

    pub fn list_messages(&self) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages ORDER BY received_time"
        ))?;
        let rows = stmt.query_map([], map_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete_message(&mut self, graph_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM messages WHERE graph_id = ?1", params![graph_id])?;
        Ok(())
    }

    pub fn message_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }

    pub fn quarantined_count(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE quarantined_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }

    // -- sync state -----------------------------------------------------

    pub fn get_sync_state(&self, mailbox: &str) -> Result<Option<SyncStateRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT mailbox, last_sync_time, last_batch_id, delta_token,
                        created_at, updated_at
                 FROM sync_state WHERE mailbox = ?1",
                params![mailbox],
                map_sync_state,
            )
            .optional()?)
    }

    pub fn list_sync_states(&self) -> Result<Vec<SyncStateRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT mailbox, last_sync_time, last_batch_id, delta_token, created_at, updated_at
             FROM sync_state ORDER BY mailbox",
        )?;
        let rows = stmt.query_map([], map_sync_state)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn ensure_sync_state(&mut self, mailbox: &str) -> Result<SyncStateRecord> {
        if let Some(existing) = self.get_sync_state(mailbox)? {
            return Ok(existing);
        }
        let now = format_rfc3339(OffsetDateTime::now_utc());
        self.conn.execute(
            "INSERT INTO sync_state (mailbox, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![mailbox, now],
        )?;
        self.get_sync_state(mailbox)?
            .ok_or_else(|| Error::Integrity(format!("sync_state row for {mailbox} vanished")))
    }

    pub fn set_sync_completed(&mut self, mailbox: &str, at: OffsetDateTime) -> Result<()> {
        self.conn.execute(
            "UPDATE sync_state SET last_sync_time = ?2, updated_at = ?2 WHERE mailbox = ?1",
            params![mailbox, format_rfc3339(at)],
        )?;
        Ok(())
    }

    // -- folder sync progress -------------------------------------------

    pub fn folder_progress(&self, folder_id: &str) -> Result<Option<FolderSyncProgress>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {PROGRESS_COLUMNS} FROM folder_sync_progress WHERE folder_id = ?1"
                ),
                params![folder_id],
                map_progress,
            )
            .optional()?)
    }

    pub fn list_progress(&self) -> Result<Vec<FolderSyncProgress>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM folder_sync_progress ORDER BY folder_id"
        ))?;
        let rows = stmt.query_map([], map_progress)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // -- transformations ------------------------------------------------

    /// Everything still missing a derivative of `ttype` at `config_version`,
    /// quarantined messages excluded.
    pub fn messages_needing_transformation(
        &self,
        ttype: TransformationType,
        config_version: &str,
    ) -> Result<Vec<MessageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS_QUALIFIED} FROM messages m
             LEFT JOIN transformations t
                ON t.message_id = m.graph_id AND t.transformation_type = ?1
             WHERE m.quarantined_at IS NULL
               AND (t.message_id IS NULL OR t.config_version != ?2)
             ORDER BY m.received_time"
        ))?;
        let rows = stmt.query_map(params![ttype.as_str(), config_version], map_message)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn transformation_for(
        &self,
        message_id: &str,
        ttype: TransformationType,
    ) -> Result<Option<TransformationRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT message_id, transformation_type, applied_at, config_version,
                        output_path, output_size_bytes
                 FROM transformations
                 WHERE message_id = ?1 AND transformation_type = ?2",
                params![message_id, ttype.as_str()],
                map_transformation,
            )
            .optional()?)
    }

    pub fn list_transformations(&self) -> Result<Vec<TransformationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, transformation_type, applied_at, config_version,
                    output_path, output_size_bytes
             FROM transformations ORDER BY message_id, transformation_type",
        )?;
        let rows = stmt.query_map([], map_transformation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn transformation_count(&self, ttype: TransformationType) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM transformations WHERE transformation_type = ?1",
            params![ttype.as_str()],
            |row| row.get(0),
        )?)
    }

    pub fn record_transformation(&mut self, record: &TransformationRecord) -> Result<()> {
        record_transformation(&self.conn, record)
    }

    // -- attachments / zip ----------------------------------------------

    pub fn insert_attachment(&mut self, attachment: &AttachmentRecord) -> Result<i64> {
        insert_attachment(&self.conn, attachment)
    }

    pub fn attachments_for_message(&self, message_id: &str) -> Result<Vec<AttachmentRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, filename, file_path, size_bytes, content_type,
                    content_id, is_inline, skipped, skip_reason, extracted_at
             FROM attachments WHERE message_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![message_id], map_attachment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_zip_extraction(
        &mut self,
        record: &ZipExtractionRecord,
        files: &[ZipExtractedFile],
    ) -> Result<i64> {
        let tx = self.conn.transaction()?;
        let id = insert_zip_extraction(&tx, record, files)?;
        tx.commit()?;
        Ok(id)
    }

    pub fn zip_extractions_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ZipExtractionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, attachment_id, archive_name, can_extract, skip_reason,
                    file_count, total_uncompressed, has_executables, has_unsafe_paths,
                    is_encrypted, extracted_at
             FROM zip_extractions WHERE message_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![message_id], map_zip_extraction)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn zip_files_for_extraction(&self, extraction_id: i64) -> Result<Vec<ZipExtractedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, zip_extraction_id, entry_name, extracted_path, size_bytes
             FROM zip_extracted_files WHERE zip_extraction_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![extraction_id], |row| {
            Ok(ZipExtractedFile {
                id: row.get(0)?,
                zip_extraction_id: row.get(1)?,
                entry_name: row.get(2)?,
                extracted_path: row.get(3)?,
                size_bytes: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Scope for mutations that must land together. Dropping without commit
/// rolls everything back.
pub struct StateTxn<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl StateTxn<'_> {
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    pub fn get_message_by_immutable_id(&self, immutable_id: &str) -> Result<Option<MessageRecord>> {
        message_by(&self.tx, "immutable_id", immutable_id)
    }

    pub fn get_message_by_graph_id(&self, graph_id: &str) -> Result<Option<MessageRecord>> {
        message_by(&self.tx, "graph_id", graph_id)
    }

    pub fn get_folder_by_path(&self, local_path: &str) -> Result<Option<FolderRecord>> {
        folder_by(&self.tx, "local_path", local_path)
    }

    pub fn insert_message(&self, message: &MessageRecord) -> Result<()> {
        self.tx.execute(
            "INSERT INTO messages
                (graph_id, immutable_id, local_path, folder_path, subject, sender,
                 recipients, received_time, size, has_attachments, in_reply_to,
                 conversation_id, quarantined_at, quarantine_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                message.graph_id,
                message.immutable_id,
                message.local_path,
                message.folder_path,
                message.subject,
                message.sender,
                message.recipients,
                format_rfc3339(message.received_time),
                message.size,
                message.has_attachments,
                message.in_reply_to,
                message.conversation_id,
                message.quarantined_at.map(format_rfc3339),
                message.quarantine_reason,
                format_rfc3339(message.created_at),
                format_rfc3339(message.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn mark_quarantined(
        &self,
        graph_id: &str,
        at: OffsetDateTime,
        reason: &str,
        new_path: Option<&str>,
    ) -> Result<()> {
        self.tx.execute(
            "UPDATE messages SET
                quarantined_at = ?2,
                quarantine_reason = ?3,
                local_path = COALESCE(?4, local_path),
                updated_at = ?2
             WHERE graph_id = ?1",
            params![graph_id, format_rfc3339(at), reason, new_path],
        )?;
        Ok(())
    }

    pub fn update_folder_path(&self, graph_id: &str, folder_path: &str) -> Result<()> {
        self.tx.execute(
            "UPDATE messages SET folder_path = ?2, updated_at = ?3 WHERE graph_id = ?1",
            params![
                graph_id,
                folder_path,
                format_rfc3339(OffsetDateTime::now_utc())
            ],
        )?;
        Ok(())
    }

    pub fn upsert_progress(&self, progress: &FolderSyncProgress) -> Result<()> {
        self.tx.execute(
            "INSERT INTO folder_sync_progress
                (folder_id, pending_next_link, pending_page_number, pending_message_index,
                 sync_started_at, last_checkpoint_at, messages_processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(folder_id) DO UPDATE SET
                pending_next_link = excluded.pending_next_link,
                pending_page_number = excluded.pending_page_number,
                pending_message_index = excluded.pending_message_index,
                last_checkpoint_at = excluded.last_checkpoint_at,
                messages_processed = excluded.messages_processed",
            params![
                progress.folder_id,
                progress.pending_next_link,
                progress.pending_page_number,
                progress.pending_message_index,
                format_rfc3339(progress.sync_started_at),
                format_rfc3339(progress.last_checkpoint_at),
                progress.messages_processed,
            ],
        )?;
        Ok(())
    }

    pub fn delete_progress(&self, folder_id: &str) -> Result<()> {
        self.tx.execute(
            "DELETE FROM folder_sync_progress WHERE folder_id = ?1",
            params![folder_id],
        )?;
        Ok(())
    }

    /// Terminal cursor write; only the fully-consumed delta response's token
    /// ever lands here.
    pub fn set_folder_delta_token(
        &self,
        folder_id: &str,
        token: &str,
        at: OffsetDateTime,
    ) -> Result<()> {
        self.tx.execute(
            "UPDATE folders SET delta_token = ?2, last_sync_time = ?3 WHERE graph_id = ?1",
            params![folder_id, token, format_rfc3339(at)],
        )?;
        Ok(())
    }

    /// Fallback path bookkeeping: advance the sync time without touching the
    /// stored cursor.
    pub fn set_folder_last_sync(&self, folder_id: &str, at: OffsetDateTime) -> Result<()> {
        self.tx.execute(
            "UPDATE folders SET last_sync_time = ?2 WHERE graph_id = ?1",
            params![folder_id, format_rfc3339(at)],
        )?;
        Ok(())
    }

    pub fn touch_sync_state(&self, mailbox: &str, last_batch_id: Option<&str>) -> Result<()> {
        self.tx.execute(
            "UPDATE sync_state SET
                last_batch_id = COALESCE(?2, last_batch_id),
                updated_at = ?3
             WHERE mailbox = ?1",
            params![
                mailbox,
                last_batch_id,
                format_rfc3339(OffsetDateTime::now_utc())
            ],
        )?;
        Ok(())
    }

    pub fn record_transformation(&self, record: &TransformationRecord) -> Result<()> {
        record_transformation(&self.tx, record)
    }

    pub fn insert_attachment(&self, attachment: &AttachmentRecord) -> Result<i64> {
        insert_attachment(&self.tx, attachment)
    }

    pub fn insert_zip_extraction(
        &self,
        record: &ZipExtractionRecord,
        files: &[ZipExtractedFile],
    ) -> Result<i64> {
        insert_zip_extraction(&self.tx, record, files)
    }
}

// -- shared row plumbing ------------------------------------------------

const MESSAGE_COLUMNS: &str = "graph_id, immutable_id, local_path, folder_path, subject, sender, \
     recipients, received_time, size, has_attachments, in_reply_to, conversation_id, \
     quarantined_at, quarantine_reason, created_at, updated_at";

const MESSAGE_COLUMNS_QUALIFIED: &str = "m.graph_id, m.immutable_id, m.local_path, \
     m.folder_path, m.subject, m.sender, m.recipients, m.received_time, m.size, \
     m.has_attachments, m.in_reply_to, m.conversation_id, m.quarantined_at, \
     m.quarantine_reason, m.created_at, m.updated_at";

const FOLDER_COLUMNS: &str = "graph_id, parent_folder_id, local_path, display_name, \
     total_item_count, unread_item_count, delta_token, last_sync_time";

const PROGRESS_COLUMNS: &str = "folder_id, pending_next_link, pending_page_number, \
     pending_message_index, sync_started_at, last_checkpoint_at, messages_processed";

fn read_ts(value: &str) -> rusqlite::Result<OffsetDateTime> {
    parse_rfc3339(value).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(err.to_string())),
        )
    })
}

fn read_opt_ts(value: Option<String>) -> rusqlite::Result<Option<OffsetDateTime>> {
    value.map(|v| read_ts(&v)).transpose()
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    Ok(MessageRecord {
        graph_id: row.get(0)?,
        immutable_id: row.get(1)?,
        local_path: row.get(2)?,
        folder_path: row.get(3)?,
        subject: row.get(4)?,
        sender: row.get(5)?,
        recipients: row.get(6)?,
        received_time: read_ts(&row.get::<_, String>(7)?)?,
        size: row.get(8)?,
        has_attachments: row.get(9)?,
        in_reply_to: row.get(10)?,
        conversation_id: row.get(11)?,
        quarantined_at: read_opt_ts(row.get(12)?)?,
        quarantine_reason: row.get(13)?,
        created_at: read_ts(&row.get::<_, String>(14)?)?,
        updated_at: read_ts(&row.get::<_, String>(15)?)?,
    })
}

fn map_folder(row: &Row<'_>) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        graph_id: row.get(0)?,
        parent_folder_id: row.get(1)?,
        local_path: row.get(2)?,
        display_name: row.get(3)?,
        total_item_count: row.get(4)?,
        unread_item_count: row.get(5)?,
        delta_token: row.get(6)?,
        last_sync_time: read_opt_ts(row.get(7)?)?,
    })
}

fn map_progress(row: &Row<'_>) -> rusqlite::Result<FolderSyncProgress> {
    Ok(FolderSyncProgress {
        folder_id: row.get(0)?,
        pending_next_link: row.get(1)?,
        pending_page_number: row.get(2)?,
        pending_message_index: row.get(3)?,
        sync_started_at: read_ts(&row.get::<_, String>(4)?)?,
        last_checkpoint_at: read_ts(&row.get::<_, String>(5)?)?,
        messages_processed: row.get(6)?,
    })
}

fn map_sync_state(row: &Row<'_>) -> rusqlite::Result<SyncStateRecord> {
    Ok(SyncStateRecord {
        mailbox: row.get(0)?,
        last_sync_time: read_opt_ts(row.get(1)?)?,
        last_batch_id: row.get(2)?,
        delta_token: row.get(3)?,
        created_at: read_ts(&row.get::<_, String>(4)?)?,
        updated_at: read_ts(&row.get::<_, String>(5)?)?,
    })
}

fn map_transformation(row: &Row<'_>) -> rusqlite::Result<TransformationRecord> {
    let raw: String = row.get(1)?;
    let ttype = raw.parse::<TransformationType>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::other(err)),
        )
    })?;
    Ok(TransformationRecord {
        message_id: row.get(0)?,
        transformation_type: ttype,
        applied_at: read_ts(&row.get::<_, String>(2)?)?,
        config_version: row.get(3)?,
        output_path: row.get(4)?,
        output_size_bytes: row.get(5)?,
    })
}

fn map_attachment(row: &Row<'_>) -> rusqlite::Result<AttachmentRecord> {
    Ok(AttachmentRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        filename: row.get(2)?,
        file_path: row.get(3)?,
        size_bytes: row.get(4)?,
        content_type: row.get(5)?,
        content_id: row.get(6)?,
        is_inline: row.get(7)?,
        skipped: row.get(8)?,
        skip_reason: row.get(9)?,
        extracted_at: read_ts(&row.get::<_, String>(10)?)?,
    })
}

fn map_zip_extraction(row: &Row<'_>) -> rusqlite::Result<ZipExtractionRecord> {
    Ok(ZipExtractionRecord {
        id: row.get(0)?,
        message_id: row.get(1)?,
        attachment_id: row.get(2)?,
        archive_name: row.get(3)?,
        can_extract: row.get(4)?,
        skip_reason: row.get(5)?,
        file_count: row.get(6)?,
        total_uncompressed: row.get(7)?,
        has_executables: row.get(8)?,
        has_unsafe_paths: row.get(9)?,
        is_encrypted: row.get(10)?,
        extracted_at: read_ts(&row.get::<_, String>(11)?)?,
    })
}

fn message_by(conn: &Connection, column: &str, value: &str) -> Result<Option<MessageRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE {column} = ?1"),
            params![value],
            map_message,
        )
        .optional()?)
}

fn folder_by(conn: &Connection, column: &str, value: &str) -> Result<Option<FolderRecord>> {
    Ok(conn
        .query_row(
            &format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE {column} = ?1"),
            params![value],
            map_folder,
        )
        .optional()?)
}

fn record_transformation(conn: &Connection, record: &TransformationRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO transformations
            (message_id, transformation_type, applied_at, config_version,
             output_path, output_size_bytes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(message_id, transformation_type) DO UPDATE SET
            applied_at = excluded.applied_at,
            config_version = excluded.config_version,
            output_path = excluded.output_path,
            output_size_bytes = excluded.output_size_bytes",
        params![
            record.message_id,
            record.transformation_type.as_str(),
            format_rfc3339(record.applied_at),
            record.config_version,
            record.output_path,
            record.output_size_bytes,
        ],
    )?;
    Ok(())
}

fn insert_attachment(conn: &Connection, attachment: &AttachmentRecord) -> Result<i64> {
    conn.execute(
        "INSERT INTO attachments
            (message_id, filename, file_path, size_bytes, content_type, content_id,
             is_inline, skipped, skip_reason, extracted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            attachment.message_id,
            attachment.filename,
            attachment.file_path,
            attachment.size_bytes,
            attachment.content_type,
            attachment.content_id,
            attachment.is_inline,
            attachment.skipped,
            attachment.skip_reason,
            format_rfc3339(attachment.extracted_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_zip_extraction(
    conn: &Connection,
    record: &ZipExtractionRecord,
    files: &[ZipExtractedFile],
) -> Result<i64> {
    conn.execute(
        "INSERT INTO zip_extractions
            (message_id, attachment_id, archive_name, can_extract, skip_reason,
             file_count, total_uncompressed, has_executables, has_unsafe_paths,
             is_encrypted, extracted_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            record.message_id,
            record.attachment_id,
            record.archive_name,
            record.can_extract,
            record.skip_reason,
            record.file_count,
            record.total_uncompressed,
            record.has_executables,
            record.has_unsafe_paths,
            record.is_encrypted,
            format_rfc3339(record.extracted_at),
        ],
    )?;
    let extraction_id = conn.last_insert_rowid();
    for file in files {
        conn.execute(
            "INSERT INTO zip_extracted_files
                (zip_extraction_id, entry_name, extracted_path, size_bytes)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                extraction_id,
                file.entry_name,
                file.extracted_path,
                file.size_bytes,
            ],
        )?;
    }
    Ok(extraction_id)
}
