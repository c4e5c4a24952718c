use crate::models::{CorePolicy, RunJournal};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use std::fs;

/// Default prefix for environment overrides, e.g. `STRIDELINK__CONNECT_TIMEOUT_SECS=5`.
pub const ENV_PREFIX: &str = "STRIDELINK";

/// Separator between the prefix and nested keys in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Configuration manager for the policy file and the run journal.
///
/// Manages two files in its configuration directory:
/// - Policy (`StrideLink Policy.yaml`): timeouts, retention window, scoring and
///   simulation constants. Environment variables override file values.
/// - Run journal (`Run Journal.yaml`): the persisted run records crash
///   detection scans at startup.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_dir: Utf8PathBuf,
    policy_path: Utf8PathBuf,
    journal_path: Utf8PathBuf,
    env_prefix: String,
    /// Replaces the process environment when set.
    env_source: Option<config::Map<String, String>>,
}

impl ConfigManager {
    /// Create a new ConfigManager with the specified configuration directory.
    ///
    /// # Arguments
    /// * `config_dir` - Directory containing configuration files (e.g., "StrideLink Data")
    pub fn new<P: AsRef<Utf8Path>>(config_dir: P) -> Result<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();

        // Create config directory if it doesn't exist
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {}", config_dir))?;
        }

        Ok(Self {
            policy_path: config_dir.join("StrideLink Policy.yaml"),
            journal_path: config_dir.join("Run Journal.yaml"),
            config_dir,
            env_prefix: ENV_PREFIX.to_string(),
            env_source: None,
        })
    }

    /// Use a different environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read overrides from `vars` instead of the process environment.
    ///
    /// Keys use the same `PREFIX__KEY` form as real environment variables.
    pub fn with_env_source<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut source = config::Map::new();
        for (key, value) in vars {
            source.insert(key.into(), value.into());
        }
        self.env_source = Some(source);
        self
    }

    /// Load the policy, layering environment overrides over the policy file.
    ///
    /// A missing file is not an error; every field has a default.
    ///
    /// # Errors
    /// Fails if the file cannot be parsed, an override has the wrong type, or
    /// the sensor name pattern is not a valid regex.
    pub fn load_policy(&self) -> Result<CorePolicy> {
        if !self.policy_path.exists() {
            tracing::warn!(
                "Policy file not found at {}, using defaults",
                self.policy_path
            );
        }

        let environment = config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(self.env_source.clone());

        let settings = config::Config::builder()
            .add_source(
                config::File::new(self.policy_path.as_str(), config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(environment)
            .build()
            .with_context(|| format!("Failed to read policy: {}", self.policy_path))?;

        let policy: CorePolicy = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse policy: {}", self.policy_path))?;

        if !policy.sensor_name_pattern.is_empty() {
            regex::Regex::new(&policy.sensor_name_pattern).with_context(|| {
                format!(
                    "Invalid sensor_name_pattern in policy: {}",
                    policy.sensor_name_pattern
                )
            })?;
        }

        tracing::info!("Loaded policy from {}", self.policy_path);
        Ok(policy)
    }

    /// Save the policy file.
    ///
    /// # Arguments
    /// * `policy` - The CorePolicy to save
    pub fn save_policy(&self, policy: &CorePolicy) -> Result<()> {
        let yaml_string =
            serde_yaml_ng::to_string(policy).context("Failed to serialize policy to YAML")?;

        fs::write(&self.policy_path, yaml_string)
            .with_context(|| format!("Failed to write policy: {}", self.policy_path))?;

        tracing::info!("Saved policy to {}", self.policy_path);
        Ok(())
    }

    /// Load the run journal.
    ///
    /// # Returns
    /// The loaded RunJournal, or an empty journal if the file doesn't exist
    pub fn load_run_journal(&self) -> Result<RunJournal> {
        if !self.journal_path.exists() {
            tracing::debug!("No run journal at {}", self.journal_path);
            return Ok(RunJournal::default());
        }

        let file_contents = fs::read_to_string(&self.journal_path)
            .with_context(|| format!("Failed to read run journal: {}", self.journal_path))?;

        let journal: RunJournal = serde_yaml_ng::from_str(&file_contents)
            .with_context(|| format!("Failed to parse run journal: {}", self.journal_path))?;

        tracing::info!(
            "Loaded run journal from {} ({} runs)",
            self.journal_path,
            journal.runs.len()
        );
        Ok(journal)
    }

    /// Save the run journal.
    pub fn save_run_journal(&self, journal: &RunJournal) -> Result<()> {
        let yaml_string = serde_yaml_ng::to_string(journal)
            .context("Failed to serialize run journal to YAML")?;

        fs::write(&self.journal_path, yaml_string)
            .with_context(|| format!("Failed to write run journal: {}", self.journal_path))?;

        tracing::info!("Saved run journal to {}", self.journal_path);
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir(&self) -> &Utf8Path {
        &self.config_dir
    }

    pub fn policy_path(&self) -> &Utf8Path {
        &self.policy_path
    }

    pub fn journal_path(&self) -> &Utf8Path {
        &self.journal_path
    }
}
