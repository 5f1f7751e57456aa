/// Forward-only, monotonically numbered. Applied versions are recorded in
/// `schema_version`; downgrade is unsupported.
pub const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE sync_state (
            mailbox TEXT PRIMARY KEY,
            last_sync_time TEXT,
            last_batch_id TEXT,
            delta_token TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE messages (
            graph_id TEXT PRIMARY KEY,
            immutable_id TEXT NOT NULL UNIQUE,
            local_path TEXT NOT NULL,
            folder_path TEXT NOT NULL,
            subject TEXT,
            sender TEXT,
            recipients TEXT,
            received_time TEXT NOT NULL,
            size INTEGER NOT NULL,
            has_attachments INTEGER NOT NULL DEFAULT 0,
            in_reply_to TEXT,
            conversation_id TEXT,
            quarantined_at TEXT,
            quarantine_reason TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX idx_messages_folder_path ON messages(folder_path);
        CREATE INDEX idx_messages_received_time ON messages(received_time);
        CREATE INDEX idx_messages_conversation ON messages(conversation_id);
        CREATE INDEX idx_messages_quarantined ON messages(quarantined_at)
            WHERE quarantined_at IS NOT NULL;

        CREATE TABLE folders (
            graph_id TEXT PRIMARY KEY,
            parent_folder_id TEXT,
            local_path TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            total_item_count INTEGER,
            unread_item_count INTEGER,
            delta_token TEXT,
            last_sync_time TEXT
        );

        CREATE TABLE transformations (
            message_id TEXT NOT NULL REFERENCES messages(graph_id) ON DELETE CASCADE,
            transformation_type TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            config_version TEXT NOT NULL,
            output_path TEXT NOT NULL,
            output_size_bytes INTEGER,
            PRIMARY KEY (message_id, transformation_type)
        );
        CREATE INDEX idx_transformations_type_version
            ON transformations(transformation_type, config_version);

        CREATE TABLE attachments (
            id INTEGER PRIMARY KEY,
            message_id TEXT NOT NULL REFERENCES messages(graph_id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            file_path TEXT,
            size_bytes INTEGER NOT NULL,
            content_type TEXT,
            content_id TEXT,
            is_inline INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            skip_reason TEXT,
            extracted_at TEXT NOT NULL
        );
        CREATE INDEX idx_attachments_message ON attachments(message_id);
        CREATE INDEX idx_attachments_skipped ON attachments(skipped)
            WHERE skipped = 1;

        CREATE TABLE zip_extractions (
            id INTEGER PRIMARY KEY,
            message_id TEXT NOT NULL REFERENCES messages(graph_id) ON DELETE CASCADE,
            attachment_id INTEGER REFERENCES attachments(id) ON DELETE CASCADE,
            archive_name TEXT NOT NULL,
            can_extract INTEGER NOT NULL,
            skip_reason TEXT,
            file_count INTEGER NOT NULL DEFAULT 0,
            total_uncompressed INTEGER NOT NULL DEFAULT 0,
            has_executables INTEGER NOT NULL DEFAULT 0,
            has_unsafe_paths INTEGER NOT NULL DEFAULT 0,
            is_encrypted INTEGER NOT NULL DEFAULT 0,
            extracted_at TEXT NOT NULL
        );
        CREATE INDEX idx_zip_extractions_message ON zip_extractions(message_id);
        CREATE INDEX idx_zip_extractions_attachment ON zip_extractions(attachment_id);

        CREATE TABLE zip_extracted_files (
            id INTEGER PRIMARY KEY,
            zip_extraction_id INTEGER NOT NULL
                REFERENCES zip_extractions(id) ON DELETE CASCADE,
            entry_name TEXT NOT NULL,
            extracted_path TEXT,
            size_bytes INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX idx_zip_extracted_files_extraction
            ON zip_extracted_files(zip_extraction_id);
        ",
    ),
    (
        2,
        "
        CREATE TABLE folder_sync_progress (
            folder_id TEXT PRIMARY KEY REFERENCES folders(graph_id) ON DELETE CASCADE,
            pending_next_link TEXT,
            pending_page_number INTEGER NOT NULL DEFAULT 0,
            pending_message_index INTEGER NOT NULL DEFAULT 0,
            sync_started_at TEXT NOT NULL,
            last_checkpoint_at TEXT NOT NULL,
            messages_processed INTEGER NOT NULL DEFAULT 0
        );
        ",
    ),
];
