use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::security::ziparc::ZipPolicy;
use crate::transform::attachments::AttachmentOptions;
use crate::transform::driver::TransformOptions;
use crate::transform::html::HtmlOptions;

/// YAML configuration. A missing file means defaults; a malformed one is a
/// `config` failure. Explicit CLI flags override matching values.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub provider: ProviderConfig,
    pub sync: SyncConfig,
    pub transformations: TransformationsConfig,
    pub zip_extraction: ZipPolicy,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub client_id: Option<String>,
    pub tenant_id: String,
    pub mailbox: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            tenant_id: "common".to_string(),
            mailbox: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub checkpoint_interval: u32,
    pub parallel: usize,
    pub exclude_folders: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10,
            parallel: 4,
            exclude_folders: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TransformationsConfig {
    pub generate_html: bool,
    pub generate_markdown: bool,
    pub extract_attachments: bool,
    pub html_options: HtmlOptions,
    pub attachment_options: AttachmentOptions,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            Some(path) => Err(Error::Config(format!(
                "config file {} does not exist",
                path.display()
            ))),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        data.parse()
    }

    pub fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            generate_html: self.transformations.generate_html,
            generate_markdown: self.transformations.generate_markdown,
            extract_attachments: self.transformations.extract_attachments,
            html: self.transformations.html_options.clone(),
            attachments: self.transformations.attachment_options.clone(),
            zip: self.zip_extraction.clone(),
        }
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|err| Error::Config(format!("invalid config: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_applied() {
        let config = Config::default();
        assert_eq!(config.sync.checkpoint_interval, 10);
        assert_eq!(config.sync.parallel, 4);
        assert_eq!(config.provider.tenant_id, "common");
        assert!(config.zip_extraction.enabled);
        assert!(config.transformations.attachment_options.skip_executables);
    }

    #[test]
    fn parse_full_document() {
        let config: Config = "
provider:
  client_id: app-123
  tenant_id: contoso
  mailbox: archive@contoso.com
sync:
  checkpoint_interval: 25
  parallel: 8
  exclude_folders:
    - Spam
    - 'Trash/**'
transformations:
  generate_html: true
  generate_markdown: true
  extract_attachments: true
  html_options:
    inline_styles: false
    hide_cc: true
  attachment_options:
    skip_executables: false
zip_extraction:
  enabled: true
  min_files: 2
  max_files: 50
  skip_encrypted: false
"
        .parse()
        .unwrap();
        assert_eq!(config.provider.client_id.as_deref(), Some("app-123"));
        assert_eq!(config.sync.checkpoint_interval, 25);
        assert_eq!(config.sync.exclude_folders, vec!["Spam", "Trash/**"]);
        assert!(config.transformations.generate_html);
        assert!(!config.transformations.html_options.inline_styles);
        assert!(config.transformations.html_options.hide_cc);
        // untouched nested defaults survive partial documents
        assert!(config.transformations.html_options.strip_external_images);
        assert_eq!(config.zip_extraction.min_files, 2);
        assert!(!config.zip_extraction.skip_encrypted);
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config: Config = "sync:\n  parallel: 2\n".parse().unwrap();
        assert_eq!(config.sync.parallel, 2);
        assert_eq!(config.sync.checkpoint_interval, 10);
    }

    #[test]
    fn malformed_document_is_config_error() {
        let err = "sync: [not a map".parse::<Config>().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_explicit_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/magpie.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(Config::load(None).is_ok());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("magpie.yaml");
        std::fs::write(&path, "provider:\n  client_id: app-9\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.provider.client_id.as_deref(), Some("app-9"));
    }

    #[test]
    fn transform_options_carry_fingerprint_inputs() {
        let config: Config = "transformations:\n  generate_html: true\n".parse().unwrap();
        let options = config.transform_options();
        assert!(options.generate_html);
        let other: Config = "zip_extraction:\n  max_files: 5\n".parse().unwrap();
        assert_ne!(
            options.config_version(),
            other.transform_options().config_version()
        );
    }
}
