use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;

use crate::auth::device::DeviceAuth;
use crate::auth::gateway::{AuthStatus, CredentialGateway};
use crate::auth::tokens::TokenStore;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsops::eml::EmlStore;
use crate::provider::graph::GraphProvider;
use crate::store::db::StateStore;
use crate::store::records::TransformationType;
use crate::sync::engine::SyncEngine;
use crate::sync::summary::{CancelToken, SyncOptions};
use crate::transform::driver::TransformPipeline;
use crate::util::time::format_rfc3339;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "magpie",
    version,
    about = "Mirror a hosted mailbox into a file-first local archive"
)]
pub struct MagpieCli {
    #[arg(long, help = "Path to the YAML config file")]
    pub config: Option<PathBuf>,

    #[arg(long, default_value = ".", help = "Archive root directory")]
    pub output: PathBuf,

    #[arg(long, help = "Enable debug logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    #[command(about = "Synchronize the mailbox into the archive")]
    Sync {
        #[arg(long, help = "Commit progress every N processed items")]
        checkpoint_interval: Option<u32>,
        #[arg(long, help = "Concurrent message downloads")]
        parallel: Option<usize>,
        #[arg(long, help = "Enumerate folders without writing anything")]
        dry_run: bool,
        #[arg(long, help = "Restrict to one folder path (and its descendants)")]
        folder: Option<String>,
        #[arg(long, help = "Folder exclusion pattern (repeatable)")]
        exclude: Vec<String>,
        #[arg(long, help = "Mailbox to sync instead of the signed-in user's")]
        mailbox: Option<String>,
        #[arg(long, help = "Render browsable HTML inline")]
        html: bool,
        #[arg(long, help = "Render markdown inline")]
        markdown: bool,
        #[arg(long, help = "Extract attachments inline")]
        attachments: bool,
    },
    #[command(about = "Regenerate derivative files from the canonical archive")]
    Transform {
        #[arg(long, value_enum, help = "Restrict to one derivative type")]
        only: Option<OnlyType>,
        #[arg(long, help = "Re-render even when derivatives are current")]
        force: bool,
    },
    #[command(about = "Show archive and sync state")]
    Status,
    #[command(about = "Check archive files against recorded state")]
    Verify,
    #[command(about = "Manage provider sign-in")]
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum AuthAction {
    #[command(about = "Sign in with a device code")]
    Login,
    #[command(about = "Forget stored tokens")]
    Logout,
    #[command(about = "Show sign-in state without touching the network")]
    Status,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum OnlyType {
    Html,
    Markdown,
    Attachments,
}

impl From<OnlyType> for TransformationType {
    fn from(value: OnlyType) -> Self {
        match value {
            OnlyType::Html => Self::Html,
            OnlyType::Markdown => Self::Markdown,
            OnlyType::Attachments => Self::Attachments,
        }
    }
}

pub async fn run(cli: MagpieCli, cancel: CancelToken) -> Result<String> {
    let config = Config::load(cli.config.as_deref())?;
    let eml = EmlStore::new(&cli.output);

    match cli.command {
        Commands::Sync {
            checkpoint_interval,
            parallel,
            dry_run,
            folder,
            exclude,
            mailbox,
            html,
            markdown,
            attachments,
        } => {
            eml.ensure()?;
            let mut store = StateStore::open(&eml.db_path())?;

            let mut exclude_patterns = config.sync.exclude_folders.clone();
            exclude_patterns.extend(exclude);
            let options = SyncOptions {
                mailbox: mailbox.or_else(|| config.provider.mailbox.clone()),
                checkpoint_interval: checkpoint_interval
                    .unwrap_or(config.sync.checkpoint_interval)
                    .max(1),
                max_parallel_downloads: parallel.unwrap_or(config.sync.parallel).max(1),
                exclude_patterns,
                folder,
                dry_run,
            };

            let mut transform_options = config.transform_options();
            transform_options.generate_html |= html;
            transform_options.generate_markdown |= markdown;
            transform_options.extract_attachments |= attachments;
            let inline = transform_options.generate_html
                || transform_options.generate_markdown
                || transform_options.extract_attachments;
            let pipeline = TransformPipeline::new(eml.clone(), transform_options);

            let gateway = Arc::new(build_gateway(&config)?);
            let provider = GraphProvider::new(gateway, options.mailbox.clone());

            let mut engine = SyncEngine::new(&provider, &mut store, &eml, options, cancel);
            if inline {
                engine = engine.with_inline_transforms(&pipeline);
            }
            let summary = engine.run().await?;
            Ok(format!("sync complete: {summary}"))
        }

        Commands::Transform { only, force } => {
            eml.ensure()?;
            let mut store = StateStore::open(&eml.db_path())?;
            let mut options = config.transform_options();
            // `--only T` implies T even when the config leaves it off
            match only {
                Some(OnlyType::Html) => options.generate_html = true,
                Some(OnlyType::Markdown) => options.generate_markdown = true,
                Some(OnlyType::Attachments) => options.extract_attachments = true,
                None => {}
            }
            let pipeline = TransformPipeline::new(eml.clone(), options);
            let summary =
                pipeline.run_offline(&mut store, only.map(TransformationType::from), force)?;
            Ok(format!(
                "transform complete: transformed={} errors={}",
                summary.transformed, summary.errors
            ))
        }

        Commands::Status => {
            let store = StateStore::open(&eml.db_path())?;
            status_report(&store)
        }

        Commands::Verify => {
            let store = StateStore::open(&eml.db_path())?;
            verify_archive(&store, &eml)
        }

        Commands::Auth { action } => auth_command(&config, action).await,
    }
}

fn build_gateway(config: &Config) -> Result<CredentialGateway> {
    let client_id = config
        .provider
        .client_id
        .as_deref()
        .ok_or_else(|| Error::Config("provider.client_id is not configured".into()))?;
    let account = config
        .provider
        .mailbox
        .clone()
        .unwrap_or_else(|| client_id.to_string());
    Ok(CredentialGateway::new(
        Box::new(DeviceAuth::new(client_id, config.provider.tenant_id.clone())),
        TokenStore::new(account),
    ))
}

async fn auth_command(config: &Config, action: AuthAction) -> Result<String> {
    let gateway = build_gateway(config)?;
    match action {
        AuthAction::Login => {
            let client_id = config.provider.client_id.as_deref().unwrap_or_default();
            let auth = DeviceAuth::new(client_id, config.provider.tenant_id.clone());
            let grant = auth.begin_device_login().await?;
            if grant.message.is_empty() {
                println!(
                    "Visit {} and enter the code {}",
                    grant.verification_uri, grant.user_code
                );
            } else {
                println!("{}", grant.message);
            }
            let tokens = auth.poll_device_login(&grant).await?;
            gateway.store_grant(&tokens)?;
            Ok("signed in".to_string())
        }
        AuthAction::Logout => {
            gateway.sign_out().await?;
            Ok("signed out".to_string())
        }
        AuthAction::Status => match gateway.status().await? {
            AuthStatus::SignedOut => Ok("signed out".to_string()),
            AuthStatus::NeedsRefresh => {
                Ok("signed in (access token expired, will refresh silently)".to_string())
            }
            AuthStatus::SignedIn { expires_on } => Ok(format!(
                "signed in (token valid until {})",
                format_rfc3339(expires_on)
            )),
        },
    }
}

fn status_report(store: &StateStore) -> Result<String> {
    let mut lines = Vec::new();
    for state in store.list_sync_states()? {
        let last = state
            .last_sync_time
            .map_or_else(|| "never".to_string(), format_rfc3339);
        lines.push(format!("mailbox {}: last sync {}", state.mailbox, last));
    }
    lines.push(format!("messages: {}", store.message_count()?));
    lines.push(format!("quarantined: {}", store.quarantined_count()?));
    let folders = store.list_folders()?;
    lines.push(format!("folders: {}", folders.len()));
    for ttype in TransformationType::ALL {
        lines.push(format!(
            "transformed/{}: {}",
            ttype,
            store.transformation_count(ttype)?
        ));
    }
    let in_flight = store.list_progress()?;
    if in_flight.is_empty() {
        lines.push("in-flight folder syncs: none".to_string());
    } else {
        for progress in in_flight {
            lines.push(format!(
                "in-flight: folder={} page={} index={} processed={}",
                progress.folder_id,
                progress.pending_page_number,
                progress.pending_message_index,
                progress.messages_processed
            ));
        }
    }
    for folder in folders {
        if let Some(last) = folder.last_sync_time {
            lines.push(format!(
                "folder {}: last sync {}",
                folder.local_path,
                format_rfc3339(last)
            ));
        }
    }
    Ok(lines.join("\n"))
}

fn verify_archive(store: &StateStore, eml: &EmlStore) -> Result<String> {
    let mut violations = Vec::new();
    let messages = store.list_messages()?;
    let checked = messages.len();
    for message in &messages {
        match eml.size(&message.local_path) {
            Ok(size) if size == message.size as u64 => {}
            Ok(size) => violations.push(format!(
                "{}: size {} != recorded {}",
                message.local_path, size, message.size
            )),
            Err(_) => violations.push(format!("{}: file missing", message.local_path)),
        }
    }
    for transformation in store.list_transformations()? {
        match eml.full_path_of(&transformation.output_path) {
            Ok(path) => {
                if !path.exists() {
                    violations.push(format!("{}: derivative missing", transformation.output_path));
                }
            }
            Err(_) => violations.push(format!(
                "{}: derivative escapes archive root",
                transformation.output_path
            )),
        }
    }
    info!(checked, violations = violations.len(), "verify finished");
    if violations.is_empty() {
        Ok(format!("verified {checked} messages, no violations"))
    } else {
        Err(Error::Filesystem(format!(
            "verify found {} violation(s):\n{}",
            violations.len(),
            violations.join("\n")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::records::MessageRecord;
    use time::macros::datetime;

    #[test]
    fn parse_sync_flags() {
        let cli = MagpieCli::parse_from([
            "magpie",
            "--output",
            "/tmp/archive",
            "sync",
            "--checkpoint-interval",
            "25",
            "--parallel",
            "8",
            "--dry-run",
            "--exclude",
            "Spam",
            "--exclude",
            "Trash/**",
            "--html",
        ]);
        match cli.command {
            Commands::Sync {
                checkpoint_interval,
                parallel,
                dry_run,
                exclude,
                html,
                markdown,
                ..
            } => {
                assert_eq!(checkpoint_interval, Some(25));
                assert_eq!(parallel, Some(8));
                assert!(dry_run);
                assert_eq!(exclude, vec!["Spam", "Trash/**"]);
                assert!(html);
                assert!(!markdown);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_transform_only() {
        let cli = MagpieCli::parse_from(["magpie", "transform", "--only", "markdown", "--force"]);
        match cli.command {
            Commands::Transform { only, force } => {
                assert_eq!(only, Some(OnlyType::Markdown));
                assert!(force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parse_auth_subcommands() {
        let cli = MagpieCli::parse_from(["magpie", "auth", "status"]);
        assert!(matches!(
            cli.command,
            Commands::Auth {
                action: AuthAction::Status
            }
        ));
    }

    fn sample_message(local_path: &str, size: i64) -> MessageRecord {
        let now = datetime!(2024-01-15 10:30:00 UTC);
        MessageRecord {
            graph_id: "g1".to_string(),
            immutable_id: "im1".to_string(),
            local_path: local_path.to_string(),
            folder_path: "Inbox".to_string(),
            subject: Some("Hello".to_string()),
            sender: None,
            recipients: None,
            received_time: now,
            size,
            has_attachments: false,
            in_reply_to: None,
            conversation_id: None,
            quarantined_at: None,
            quarantine_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn verify_passes_on_consistent_archive() {
        let dir = tempfile::tempdir().unwrap();
        let eml = EmlStore::new(dir.path());
        eml.ensure().unwrap();
        let stored = eml
            .store(b"mime", "Inbox", "Hello", datetime!(2024-01-15 10:30:00 UTC))
            .unwrap();
        let mut store = StateStore::open_in_memory().unwrap();
        let txn = store.begin().unwrap();
        txn.insert_message(&sample_message(&stored.relative_path, 4))
            .unwrap();
        txn.commit().unwrap();
        let report = verify_archive(&store, &eml).unwrap();
        assert!(report.contains("no violations"));
    }

    #[test]
    fn verify_reports_missing_and_mismatched_files() {
        let dir = tempfile::tempdir().unwrap();
        let eml = EmlStore::new(dir.path());
        eml.ensure().unwrap();
        let stored = eml
            .store(b"mime", "Inbox", "Hello", datetime!(2024-01-15 10:30:00 UTC))
            .unwrap();
        let mut store = StateStore::open_in_memory().unwrap();
        let txn = store.begin().unwrap();
        // recorded size disagrees with the file
        txn.insert_message(&sample_message(&stored.relative_path, 999))
            .unwrap();
        txn.commit().unwrap();
        let err = verify_archive(&store, &eml).unwrap_err();
        assert!(matches!(err, Error::Filesystem(_)));
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn status_reports_counts() {
        let store = StateStore::open_in_memory().unwrap();
        let report = status_report(&store).unwrap();
        assert!(report.contains("messages: 0"));
        assert!(report.contains("in-flight folder syncs: none"));
    }

    #[test]
    fn gateway_requires_client_id() {
        let err = build_gateway(&Config::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
