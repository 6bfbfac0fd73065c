use crate::http::{HttpAgentInvoker, HttpApiInvoker};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stepflow_core::config::EngineConfig;
use stepflow_core::state::StateManager;
use stepflow_core::storage::{FilesystemDefinitionStore, JsonlEventLog, RedbStateStore};
use stepflow_core::workflow::WorkflowExecutor;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub agents: AgentsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,

    #[serde(default = "default_event_log_dir")]
    pub event_log_dir: String,

    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: String,
}

fn default_state_file() -> String {
    "state.redb".to_string()
}

fn default_event_log_dir() -> String {
    "events".to_string()
}

fn default_definitions_dir() -> String {
    "workflows".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            event_log_dir: default_event_log_dir(),
            definitions_dir: default_definitions_dir(),
        }
    }
}

/// Remote agent service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    #[serde(default = "default_agents_url")]
    pub base_url: String,

    /// Transport-level timeout; step deadlines are enforced by the engine
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_agents_url() -> String {
    "http://127.0.0.1:8700".to_string()
}

fn default_request_timeout_secs() -> u64 {
    600
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            base_url: default_agents_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl CliConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.state_file)
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.event_log_dir)
    }

    pub fn definitions_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.definitions_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.agents.request_timeout_secs)
    }
}

/// Engine wiring shared by every subcommand
pub struct Runtime {
    pub executor: Arc<WorkflowExecutor>,
    pub event_log: Arc<JsonlEventLog>,
}

impl Runtime {
    pub async fn new(config: &CliConfig) -> Result<Self> {
        let state_store = Arc::new(
            RedbStateStore::new(config.state_path()).context("Failed to open state store")?,
        );
        let state = Arc::new(StateManager::new(
            state_store,
            config.engine.state_cache_ttl(),
        ));

        let event_log = Arc::new(
            JsonlEventLog::new(config.event_log_path()).context("Failed to create event log")?,
        );

        let definitions = Arc::new(
            FilesystemDefinitionStore::load(config.definitions_path())
                .await
                .context("Failed to load workflow definitions")?,
        );

        let agents = Arc::new(HttpAgentInvoker::new(
            &config.agents.base_url,
            config.request_timeout(),
        )?);
        let apis = Arc::new(HttpApiInvoker::new(config.request_timeout())?);

        let executor = WorkflowExecutor::new(state, definitions, agents, config.engine.clone())
            .with_event_sink(event_log.clone())
            .with_api_invoker(apis);

        Ok(Self {
            executor: Arc::new(executor),
            event_log,
        })
    }
}
