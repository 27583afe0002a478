//! Engine configuration and the on-disk working area.

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the working area.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Capacity of the bounded channels between stages and consumers.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long terminal task snapshots stay readable.
    #[serde(default = "default_task_retention")]
    pub task_retention_seconds: u64,
    /// Logging setup.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Model endpoint used by model-backed stages.
    #[serde(default)]
    pub model: ModelConfig,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_channel_capacity() -> usize {
    32
}

fn default_task_retention() -> u64 {
    300
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            channel_capacity: default_channel_capacity(),
            task_retention_seconds: default_task_retention(),
            logging: LoggingConfig::default(),
            model: ModelConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded engine config");
        Ok(config)
    }

    /// Overlays `DOCFLOW_*` environment variables.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Overlays values from an arbitrary variable lookup.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(dir) = lookup("DOCFLOW_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
        if let Some(filter) = lookup("DOCFLOW_LOG") {
            self.logging.filter = filter;
        }
        if let Some(url) = lookup("DOCFLOW_MODEL_BASE_URL") {
            self.model.base_url = Some(url);
        }
        if let Some(key) = lookup("DOCFLOW_MODEL_API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(id) = lookup("DOCFLOW_MODEL_ID") {
            self.model.model_id = id;
        }
        if let Some(raw) = lookup("DOCFLOW_MODEL_TIMEOUT") {
            self.model.timeout_seconds = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|secs| timeout_from_secs("model.timeout_seconds", *secs).is_ok())
                .ok_or(ConfigError::Env {
                    var: "DOCFLOW_MODEL_TIMEOUT".to_string(),
                    value: raw,
                })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks values serde cannot: timeouts and channel sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.timeout()?;
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Sets the working directory.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Sets the task retention window.
    #[must_use]
    pub fn with_task_retention(mut self, seconds: u64) -> Self {
        self.task_retention_seconds = seconds;
        self
    }

    /// Returns the working area rooted at `work_dir`.
    #[must_use]
    pub fn working_area(&self) -> WorkingArea {
        WorkingArea::new(&self.work_dir)
    }

    /// Retention window as a Duration.
    #[must_use]
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_seconds)
    }
}

/// Logging setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// An `EnvFilter` directive string.
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "docflow=info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

/// An OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL, e.g. `https://api.example.com/v1`. Unset disables model stages.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Bearer token.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model identifier.
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Per-request timeout.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: f64,
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_model_timeout() -> f64 {
    60.0
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model_id: default_model_id(),
            timeout_seconds: default_model_timeout(),
        }
    }
}

impl ModelConfig {
    /// Returns true when an endpoint is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.base_url.as_deref().is_some_and(|url| !url.trim().is_empty())
    }

    /// Gets the timeout as a Duration.
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        timeout_from_secs("model.timeout_seconds", self.timeout_seconds)
    }
}

/// Converts seconds into a timeout.
///
/// Zero, negative, non-finite and out-of-range values are rejected.
pub fn timeout_from_secs(field: &str, seconds: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(seconds)
        .ok()
        .filter(|timeout| !timeout.is_zero())
        .ok_or_else(|| ConfigError::Invalid {
            field: field.to_string(),
            reason: format!("{seconds} is not a usable timeout in seconds"),
        })
}

/// The directories a run reads from and writes to.
///
/// Locations are fixed when a stage is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingArea {
    root: PathBuf,
}

impl WorkingArea {
    /// Creates a working area rooted at `root`. Nothing is created on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where source documents are read from.
    #[must_use]
    pub fn source(&self) -> PathBuf {
        self.root.join("source")
    }

    /// Where intermediate files are staged.
    #[must_use]
    pub fn processing(&self) -> PathBuf {
        self.root.join("processing")
    }

    /// Where final outputs are written.
    #[must_use]
    pub fn destination(&self) -> PathBuf {
        self.root.join("destination")
    }

    /// Where unreadable inputs are moved.
    #[must_use]
    pub fn error(&self) -> PathBuf {
        self.root.join("error")
    }

    /// Creates every directory of the area.
    pub async fn prepare(&self) -> std::io::Result<()> {
        for dir in [self.source(), self.processing(), self.destination(), self.error()] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Empties `processing/` so a run never sees stale intermediates.
    pub async fn clean_processing(&self) -> std::io::Result<()> {
        let dir = self.processing();
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        tokio::fs::create_dir_all(&dir).await
    }

    /// Moves a file into `error/`, replacing any previous copy.
    pub async fn quarantine(&self, path: &Path) -> std::io::Result<PathBuf> {
        let dir = self.error();
        tokio::fs::create_dir_all(&dir).await?;
        let name = path.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        let target = dir.join(name);
        if tokio::fs::rename(path, &target).await.is_err() {
            // Cross-device moves fall back to copy + remove.
            tokio::fs::copy(path, &target).await?;
            tokio::fs::remove_file(path).await?;
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.channel_capacity, 32);
        assert_eq!(config.logging.filter, "docflow=info");
        assert!(!config.model.is_configured());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"work_dir": "/data", "model": {"model_id": "m1"}}"#).unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/data"));
        assert_eq!(config.model.model_id, "m1");
        assert_eq!(config.task_retention_seconds, 300);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = EngineConfig::from_file(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(EngineConfig::from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("DOCFLOW_WORK_DIR", "/srv/docflow"),
            ("DOCFLOW_LOG", "docflow=debug"),
            ("DOCFLOW_MODEL_BASE_URL", "http://localhost:8000/v1"),
            ("DOCFLOW_MODEL_TIMEOUT", "12.5"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::default()
            .with_overrides(|var| vars.get(var).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.work_dir, PathBuf::from("/srv/docflow"));
        assert_eq!(config.logging.filter, "docflow=debug");
        assert!(config.model.is_configured());
        assert_eq!(config.model.timeout().unwrap(), Duration::from_millis(12_500));
    }

    #[test]
    fn test_timeout_rejects_negative_and_huge_values() {
        for seconds in [-1.0, 0.0, 1e30, f64::NAN, f64::INFINITY] {
            let model = ModelConfig {
                timeout_seconds: seconds,
                ..ModelConfig::default()
            };
            assert!(
                matches!(model.timeout(), Err(ConfigError::Invalid { .. })),
                "{seconds} accepted"
            );
        }
        assert_eq!(timeout_from_secs("t", 0.25).unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn test_from_file_validates_values() {
        let dir = tempfile::tempdir().unwrap();
        for body in [
            r#"{"model": {"timeout_seconds": -1}}"#,
            r#"{"model": {"timeout_seconds": 1e30}}"#,
            r#"{"channel_capacity": 0}"#,
        ] {
            let path = dir.path().join("config.json");
            std::fs::write(&path, body).unwrap();
            assert!(
                matches!(EngineConfig::from_file(&path), Err(ConfigError::Invalid { .. })),
                "{body} accepted"
            );
        }
    }

    #[test]
    fn test_huge_timeout_override_is_rejected() {
        let result = EngineConfig::default().with_overrides(|var| {
            (var == "DOCFLOW_MODEL_TIMEOUT").then(|| "1e30".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[test]
    fn test_invalid_timeout_override() {
        let result = EngineConfig::default().with_overrides(|var| {
            (var == "DOCFLOW_MODEL_TIMEOUT").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Env { .. })));
    }

    #[tokio::test]
    async fn test_working_area_layout() {
        let dir = tempfile::tempdir().unwrap();
        let area = WorkingArea::new(dir.path());
        area.prepare().await.unwrap();

        std::fs::write(area.processing().join("stale.txt"), "old").unwrap();
        area.clean_processing().await.unwrap();
        assert!(area.processing().exists());
        assert_eq!(std::fs::read_dir(area.processing()).unwrap().count(), 0);

        let bad = area.source().join("broken.eml");
        std::fs::write(&bad, "x").unwrap();
        let moved = area.quarantine(&bad).await.unwrap();
        assert!(!bad.exists());
        assert_eq!(moved, area.error().join("broken.eml"));
    }
}
