use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::workflows::{RetryLimits, WorkflowLimits};

/// Main configuration structure for Conductor
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConductorConfig {
    /// Workflow scheduling and bounds
    pub orchestrator: OrchestratorConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Ceiling on workflows that are not yet terminal
    pub max_concurrent_workflows: usize,
    /// Overall deadline of a single workflow
    pub workflow_timeout_seconds: u64,
    /// How long shutdown waits for loops before aborting them
    pub shutdown_grace_seconds: u64,
    /// Consecutive clarification rounds Intake may ask for
    pub max_intake_retries: u32,
    /// Consecutive revisions the Implementer may ask for
    pub max_implementer_revisions: u32,
    /// Stage calls a single workflow may make in total
    pub max_stage_invocations: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level, used when RUST_LOG is not set
    pub log_level: String,
    /// Emit JSON log lines instead of plain text
    pub json_logs: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 5,
            workflow_timeout_seconds: 300, // 5 minutes
            shutdown_grace_seconds: 10,
            max_intake_retries: 5,
            max_implementer_revisions: 3,
            max_stage_invocations: 50,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: true,
        }
    }
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_secs(self.workflow_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn workflow_limits(&self) -> WorkflowLimits {
        WorkflowLimits {
            timeout: self.workflow_timeout(),
            retry: RetryLimits {
                intake: self.max_intake_retries,
                implementer: self.max_implementer_revisions,
            },
            max_stage_invocations: self.max_stage_invocations,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (conductor.toml, .conductor-rc)
    /// 3. Environment variables (CONDUCTOR__ORCHESTRATOR__MAX_CONCURRENT_WORKFLOWS=...)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Same layering as [`ConductorConfig::load`], with files looked up in `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let defaults = Config::try_from(&ConductorConfig::default())?;
        let mut builder = Config::builder().add_source(defaults);

        let toml_path = dir.join("conductor.toml");
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path));
        }

        let rc_path = dir.join(".conductor-rc");
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(config::FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("CONDUCTOR")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let conductor_config: ConductorConfig = config.try_deserialize()?;
        conductor_config.validate()?;

        Ok(conductor_config)
    }

    fn validate(&self) -> Result<()> {
        if self.orchestrator.max_concurrent_workflows == 0 {
            anyhow::bail!("orchestrator.max_concurrent_workflows must be at least 1");
        }
        if self.orchestrator.workflow_timeout_seconds == 0 {
            anyhow::bail!("orchestrator.workflow_timeout_seconds must be at least 1");
        }
        if self.orchestrator.max_stage_invocations == 0 {
            anyhow::bail!("orchestrator.max_stage_invocations must be at least 1");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<ConductorConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = ConductorConfig::load_env_file();
        ConductorConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static ConductorConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let config = config()?;
    tracing::info!(
        max_concurrent_workflows = config.orchestrator.max_concurrent_workflows,
        workflow_timeout_seconds = config.orchestrator.workflow_timeout_seconds,
        "Configuration loaded successfully"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = ConductorConfig::default();

        assert_eq!(config.orchestrator.max_concurrent_workflows, 5);
        assert_eq!(config.orchestrator.workflow_timeout_seconds, 300);
        assert_eq!(config.orchestrator.max_implementer_revisions, 3);
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("conductor.toml"),
            "[orchestrator]\nmax_concurrent_workflows = 2\nworkflow_timeout_seconds = 30\n",
        )
        .unwrap();

        let config = ConductorConfig::load_from(dir.path()).unwrap();

        assert_eq!(config.orchestrator.max_concurrent_workflows, 2);
        assert_eq!(config.orchestrator.workflow_timeout(), Duration::from_secs(30));
        // untouched keys keep their defaults
        assert_eq!(config.orchestrator.max_intake_retries, 5);
        assert!(config.observability.json_logs);
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("conductor.toml"),
            "[orchestrator]\nmax_concurrent_workflows = 0\n",
        )
        .unwrap();

        assert!(ConductorConfig::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_zero_stage_invocations_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("conductor.toml"),
            "[orchestrator]\nmax_stage_invocations = 0\n",
        )
        .unwrap();

        let err = ConductorConfig::load_from(dir.path()).unwrap_err();
        assert!(err.to_string().contains("max_stage_invocations"));
    }

    #[test]
    fn test_environment_overrides_nested_keys() {
        // No other loader test reads these two keys.
        std::env::set_var("CONDUCTOR__OBSERVABILITY__LOG_LEVEL", "debug");
        std::env::set_var("CONDUCTOR__ORCHESTRATOR__MAX_IMPLEMENTER_REVISIONS", "9");
        let dir = TempDir::new().unwrap();

        let loaded = ConductorConfig::load_from(dir.path());
        std::env::remove_var("CONDUCTOR__OBSERVABILITY__LOG_LEVEL");
        std::env::remove_var("CONDUCTOR__ORCHESTRATOR__MAX_IMPLEMENTER_REVISIONS");

        let config = loaded.unwrap();
        assert_eq!(config.observability.log_level, "debug");
        assert_eq!(config.orchestrator.max_implementer_revisions, 9);
    }

    #[test]
    fn test_save_round_trips_through_loader() {
        let dir = TempDir::new().unwrap();
        let mut config = ConductorConfig::default();
        config.orchestrator.shutdown_grace_seconds = 3;
        config.observability.json_logs = false;

        config.save_to_file(dir.path().join("conductor.toml")).unwrap();
        let loaded = ConductorConfig::load_from(dir.path()).unwrap();

        assert_eq!(loaded.orchestrator.shutdown_grace(), Duration::from_secs(3));
        assert!(!loaded.observability.json_logs);
    }

    #[test]
    fn test_workflow_limits_follow_orchestrator_section() {
        let orchestrator = OrchestratorConfig {
            max_intake_retries: 1,
            max_implementer_revisions: 2,
            max_stage_invocations: 9,
            ..OrchestratorConfig::default()
        };

        let limits = orchestrator.workflow_limits();
        assert_eq!(limits.retry.intake, 1);
        assert_eq!(limits.retry.implementer, 2);
        assert_eq!(limits.max_stage_invocations, 9);
    }
}
