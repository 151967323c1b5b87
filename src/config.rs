//! Configuration for the OntExtract orchestrator.
//!
//! Settings live in `.ontextract/ontextract.toml` and are layered
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8720
//!
//! [orchestration]
//! review_policy = "auto_approve"
//! max_concurrent_documents = 4
//! resume_on_startup = true
//!
//! [llm.extraction]
//! model = "claude-sonnet-4-5"
//! api_key_env = "ANTHROPIC_API_KEY"
//! max_tokens = 2048
//! temperature = 0.0
//!
//! [llm.synthesis]
//! model = "claude-sonnet-4-5"
//! max_tokens = 4096
//! temperature = 0.3
//!
//! [tools]
//! embedding_dimensions = 256
//!
//! [logging]
//! level = "info"
//! format = "compact"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the per-project data directory.
pub const DATA_DIR: &str = ".ontextract";
/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "ontextract.toml";
/// Default SQLite file name inside the data directory.
pub const DB_FILE: &str = "ontextract.db";

/// What happens at the review gate when a run was started with
/// `review_choices = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewPolicy {
    /// Record a machine-authored approval and continue.
    #[default]
    AutoApprove,
    /// Suspend for a human decision exactly as with `review_choices = true`.
    RequireReview,
}

impl std::fmt::Display for ReviewPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewPolicy::AutoApprove => write!(f, "auto_approve"),
            ReviewPolicy::RequireReview => write!(f, "require_review"),
        }
    }
}

impl std::str::FromStr for ReviewPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "auto_approve" => Ok(ReviewPolicy::AutoApprove),
            "require_review" => Ok(ReviewPolicy::RequireReview),
            _ => anyhow::bail!(
                "Invalid review policy '{}'. Valid values: auto_approve, require_review",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// HTTP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// SQLite path; relative paths resolve against the project directory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8720
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: None,
        }
    }
}

/// Workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationSection {
    #[serde(default)]
    pub review_policy: ReviewPolicy,
    /// Documents processed in parallel during Execute.
    #[serde(default = "default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    /// Resume runs left in `running` when the server starts.
    #[serde(default = "default_true")]
    pub resume_on_startup: bool,
}

fn default_max_concurrent_documents() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for OrchestrationSection {
    fn default() -> Self {
        Self {
            review_policy: ReviewPolicy::default(),
            max_concurrent_documents: default_max_concurrent_documents(),
            resume_on_startup: true,
        }
    }
}

/// One LLM capability (structured extraction or synthesis).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmProviderSection {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "anthropic".to_string()
}

fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_timeout_secs() -> u64 {
    120
}

impl LlmProviderSection {
    fn with_limits(max_tokens: u32, temperature: f32) -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: None,
            max_tokens,
            temperature,
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn extraction_default() -> Self {
        Self::with_limits(2048, 0.0)
    }

    pub fn synthesis_default() -> Self {
        Self::with_limits(4096, 0.3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSection {
    #[serde(default = "LlmProviderSection::extraction_default")]
    pub extraction: LlmProviderSection,
    #[serde(default = "LlmProviderSection::synthesis_default")]
    pub synthesis: LlmProviderSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            extraction: LlmProviderSection::extraction_default(),
            synthesis: LlmProviderSection::synthesis_default(),
        }
    }
}

/// Built-in tool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
}

fn default_embedding_dimensions() -> usize {
    256
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            embedding_dimensions: default_embedding_dimensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
    /// Directory for daily-rolling log files. Stderr only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            directory: None,
        }
    }
}

/// The complete ontextract.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OntExtractToml {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub orchestration: OrchestrationSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl OntExtractToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse ontextract.toml")
    }

    /// Load from `<data_dir>/ontextract.toml`, or defaults when absent.
    pub fn load_or_default(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize ontextract.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `ONTEXTRACT_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("ONTEXTRACT_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid ONTEXTRACT_PORT '{}'", port))?;
        }
        if let Some(path) = lookup("ONTEXTRACT_DB_PATH") {
            self.server.db_path = Some(PathBuf::from(path));
        }
        if let Some(policy) = lookup("ONTEXTRACT_REVIEW_POLICY") {
            self.orchestration.review_policy = policy.parse()?;
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: the OS will pick a random port".to_string());
        }
        if self.orchestration.max_concurrent_documents == 0 {
            warnings.push(
                "orchestration.max_concurrent_documents is 0: Execute will use 1".to_string(),
            );
        }

        for (name, section) in [
            ("extraction", &self.llm.extraction),
            ("synthesis", &self.llm.synthesis),
        ] {
            if section.provider != "anthropic" {
                warnings.push(format!(
                    "llm.{}.provider '{}' is not supported (expected 'anthropic')",
                    name, section.provider
                ));
            }
            if section.model.trim().is_empty() {
                warnings.push(format!("llm.{}.model is empty", name));
            }
            if section.max_tokens == 0 {
                warnings.push(format!("llm.{}.max_tokens must be greater than 0", name));
            }
            if !(0.0..=1.0).contains(&section.temperature) {
                warnings.push(format!(
                    "llm.{}.temperature {} is outside 0.0..=1.0",
                    name, section.temperature
                ));
            }
        }

        if self.tools.embedding_dimensions == 0 || self.tools.embedding_dimensions > 4096 {
            warnings.push(format!(
                "tools.embedding_dimensions {} should be between 1 and 4096",
                self.tools.embedding_dimensions
            ));
        }

        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "logging.level '{}' is not a valid filter directive",
                self.logging.level
            ));
        }

        warnings
    }
}

/// Runtime configuration merged from the TOML file, the environment and CLI flags.
#[derive(Debug, Clone)]
pub struct OntExtractConfig {
    pub project_dir: PathBuf,
    /// The `.ontextract` directory.
    pub data_dir: PathBuf,
    pub toml: OntExtractToml,
    pub verbose: bool,
}

impl OntExtractConfig {
    /// Load configuration for a project directory, applying environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let data_dir = project_dir.join(DATA_DIR);
        let mut toml = OntExtractToml::load_or_default(&data_dir)?;
        toml.apply_env_overrides()?;

        Ok(Self {
            project_dir,
            data_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    /// Database path (env/file override, else `.ontextract/ontextract.db`).
    pub fn db_path(&self) -> PathBuf {
        match &self.toml.server.db_path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.project_dir.join(path),
            None => self.data_dir.join(DB_FILE),
        }
    }

    /// Log directory, resolved against the project directory.
    pub fn log_dir(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                self.project_dir.join(dir)
            }
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = OntExtractToml::default();
        assert_eq!(config.server.port, 8720);
        assert_eq!(config.orchestration.review_policy, ReviewPolicy::AutoApprove);
        assert_eq!(config.orchestration.max_concurrent_documents, 4);
        assert!(config.orchestration.resume_on_startup);
        assert_eq!(config.llm.extraction.max_tokens, 2048);
        assert_eq!(config.llm.synthesis.max_tokens, 4096);
        assert_eq!(config.tools.embedding_dimensions, 256);
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_parse_partial_file_keeps_defaults() {
        let config = OntExtractToml::parse(
            r#"
            [orchestration]
            review_policy = "require_review"

            [llm.synthesis]
            model = "custom-model"
            max_tokens = 8000
            temperature = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.orchestration.review_policy, ReviewPolicy::RequireReview);
        assert_eq!(config.orchestration.max_concurrent_documents, 4);
        assert_eq!(config.llm.synthesis.model, "custom-model");
        assert_eq!(config.llm.synthesis.api_key_env, "ANTHROPIC_API_KEY");
        assert_eq!(config.llm.extraction, LlmProviderSection::extraction_default());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = OntExtractToml::parse("[server\nport = 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_review_policy_from_str() {
        assert_eq!(
            "auto_approve".parse::<ReviewPolicy>().unwrap(),
            ReviewPolicy::AutoApprove
        );
        assert_eq!(
            "Require-Review".parse::<ReviewPolicy>().unwrap(),
            ReviewPolicy::RequireReview
        );
        let err = "manual".parse::<ReviewPolicy>().unwrap_err();
        assert!(err.to_string().contains("Invalid review policy"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ONTEXTRACT_PORT", "9999"),
            ("ONTEXTRACT_DB_PATH", "/tmp/runs.db"),
            ("ONTEXTRACT_REVIEW_POLICY", "require_review"),
        ]);
        let mut config = OntExtractToml::default();
        config
            .apply_overrides_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.server.db_path, Some(PathBuf::from("/tmp/runs.db")));
        assert_eq!(config.orchestration.review_policy, ReviewPolicy::RequireReview);
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = OntExtractToml::default();
        let result = config.apply_overrides_from(|key| {
            (key == "ONTEXTRACT_PORT").then(|| "not-a-port".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let mut config = OntExtractToml::default();
        config.llm.extraction.temperature = 1.5;
        config.llm.synthesis.max_tokens = 0;
        config.tools.embedding_dimensions = 0;
        config.logging.level = "ontextract=loud".to_string();
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("llm.extraction.temperature")));
        assert!(warnings.iter().any(|w| w.contains("llm.synthesis.max_tokens")));
        assert!(warnings.iter().any(|w| w.contains("embedding_dimensions")));
        assert!(warnings.iter().any(|w| w.contains("logging.level")));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = OntExtractToml::default();
        config.server.port = 4000;
        config.orchestration.review_policy = ReviewPolicy::RequireReview;
        config.save(&path).unwrap();

        let loaded = OntExtractToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.server.port, 4000);
        assert_eq!(loaded.orchestration.review_policy, ReviewPolicy::RequireReview);
    }

    #[test]
    fn test_db_path_resolution() {
        let dir = tempdir().unwrap();
        let mut config = OntExtractConfig {
            project_dir: dir.path().to_path_buf(),
            data_dir: dir.path().join(DATA_DIR),
            toml: OntExtractToml::default(),
            verbose: false,
        };
        assert_eq!(config.db_path(), dir.path().join(DATA_DIR).join(DB_FILE));

        config.toml.server.db_path = Some(PathBuf::from("data/runs.db"));
        assert_eq!(config.db_path(), dir.path().join("data/runs.db"));

        config.toml.server.db_path = Some(PathBuf::from("/var/lib/ontextract.db"));
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/ontextract.db"));
    }
}
