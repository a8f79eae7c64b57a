//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$MTXBOX_CONFIG` (environment variable)
//! 2. `~/.config/mtxbox/config.toml` (Linux/macOS)
//!    `%APPDATA%\mtxbox\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! Nothing here is global: callers turn a [`Config`] into a
//! [`ParseContext`] and [`OpenOptions`] and hand those to the parser
//! and the store.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::parser::ParseContext;
use crate::store::{OpenOptions, RecordFormat};
use crate::writer::WriterOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Message parser settings.
    pub parser: ParserConfig,
    /// Mailbox store settings.
    pub mailbox: MailboxConfig,
    /// Message writer settings.
    pub writer: WriterConfig,
    /// Performance tuning.
    pub performance: PerformanceConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Message parser settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Host substituted into addresses that have none.
    pub default_host: String,
    /// Maximum MIME nesting depth before parsing is refused.
    pub max_depth: usize,
}

/// Mailbox store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Directory holding the secondary writer lock files (default: system temp dir).
    pub lock_dir: Option<PathBuf>,
    /// Keywords pre-assigned to the first user-flag slots, in order.
    pub keywords: Vec<String>,
    /// Accept an empty file as a valid, empty mailbox.
    pub allow_empty: bool,
    /// Record format used when writing into an empty mailbox: "mtx" or "tenex".
    pub create_format: String,
}

/// Message writer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Column at which address header lines are folded.
    pub line_width: usize,
}

/// Performance tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Chunk size for moving records during expunge (default: 65536 = 64 KB).
    pub copy_chunk_size: usize,
    /// Number of parsed messages kept in the per-stream LRU cache.
    pub message_cache_size: usize,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            default_host: "localhost".to_string(),
            max_depth: crate::parser::MAX_DEPTH,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            lock_dir: None,
            keywords: Vec::new(),
            allow_empty: true,
            create_format: "mtx".to_string(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self { line_width: 78 }
    }
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            copy_chunk_size: 64 * 1024,
            message_cache_size: 50,
        }
    }
}

// ── Context builders ────────────────────────────────────────────

impl Config {
    /// Parser context derived from this configuration.
    pub fn parse_context(&self) -> ParseContext {
        ParseContext {
            default_host: self.parser.default_host.clone(),
            max_depth: self.parser.max_depth,
        }
    }

    /// Store open options derived from this configuration.
    pub fn open_options(&self, readonly: bool) -> OpenOptions {
        let create_format = match self.mailbox.create_format.to_ascii_lowercase().as_str() {
            "tenex" => RecordFormat::Tenex,
            "mtx" => RecordFormat::Mtx,
            other => {
                tracing::warn!(format = other, "Unknown create_format, using mtx");
                RecordFormat::Mtx
            }
        };
        OpenOptions {
            readonly,
            allow_empty: self.mailbox.allow_empty,
            create_format,
            lock_dir: self.mailbox.lock_dir.clone(),
            keywords: self.mailbox.keywords.clone(),
            context: self.parse_context(),
            cache_size: self.performance.message_cache_size,
            copy_chunk_size: self.performance.copy_chunk_size,
        }
    }

    /// Message writer settings derived from this configuration.
    pub fn writer_options(&self) -> WriterOptions {
        WriterOptions {
            line_width: self.writer.line_width,
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MTXBOX_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mtxbox").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mtxbox")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mtxbox.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.parser.default_host, "localhost");
        assert_eq!(cfg.writer.line_width, 78);
        assert!(cfg.mailbox.allow_empty);
        assert_eq!(cfg.performance.copy_chunk_size, 64 * 1024);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.parser.default_host, cfg.parser.default_host);
        assert_eq!(parsed.mailbox.create_format, cfg.mailbox.create_format);
        assert_eq!(
            parsed.performance.message_cache_size,
            cfg.performance.message_cache_size
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[parser]
default_host = "example.org"

[mailbox]
keywords = ["$Forwarded", "Work"]
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.parser.default_host, "example.org");
        assert_eq!(cfg.mailbox.keywords, vec!["$Forwarded", "Work"]);
        assert_eq!(cfg.writer.line_width, 78);
        assert_eq!(cfg.parser.max_depth, crate::parser::MAX_DEPTH);
    }

    #[test]
    fn test_open_options_from_config() {
        let mut cfg = Config::default();
        cfg.mailbox.create_format = "tenex".to_string();
        cfg.parser.default_host = "mail.test".to_string();
        let opts = cfg.open_options(true);
        assert!(opts.readonly);
        assert_eq!(opts.create_format, RecordFormat::Tenex);
        assert_eq!(opts.context.default_host, "mail.test");
    }

    #[test]
    fn test_writer_options_from_config() {
        let mut cfg = Config::default();
        cfg.writer.line_width = 60;
        assert_eq!(cfg.writer_options().line_width, 60);
    }
}
