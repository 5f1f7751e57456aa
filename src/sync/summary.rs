use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mailbox: Option<String>,
    /// Commit progress every this many processed items.
    pub checkpoint_interval: u32,
    pub max_parallel_downloads: usize,
    pub exclude_patterns: Vec<String>,
    /// Restrict the run to one folder path (and its descendants).
    pub folder: Option<String>,
    pub dry_run: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mailbox: None,
            checkpoint_interval: 10,
            max_parallel_downloads: 4,
            exclude_patterns: Vec::new(),
            folder: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub folders_processed: u32,
    pub messages_synced: u32,
    pub messages_skipped: u32,
    pub quarantined: u32,
    pub moves: u32,
    pub errors: u32,
}

impl std::fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "synced={} skipped={} quarantined={} folders={} errors={}",
            self.messages_synced,
            self.messages_skipped,
            self.quarantined,
            self.folders_processed,
            self.errors
        )
    }
}

/// Shared interrupt flag, observed at page boundaries, download starts, and
/// checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
