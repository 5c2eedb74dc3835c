use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thalassa_protocol::ShipInfo;

use crate::agent::BridgeConfig;
use crate::bus::BusConfig;
use crate::docker::DockerConfig;
use crate::environment::EnvironmentConfig;
use crate::scheduler::SchedulerConfig;

/// Runtime configuration for the whole orchestration core.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub bus: BusConfig,
    pub environments: EnvironmentConfig,
    pub agent: BridgeConfig,
    pub docker: DockerConfig,
    pub scheduler: SchedulerConfig,
    pub history: HistoryConfig,
    /// Ship catalog keyed by ship name.
    pub ships: BTreeMap<String, ShipConfig>,
}

impl OrchestratorConfig {
    pub fn ship_catalog(&self) -> Vec<ShipInfo> {
        self.ships
            .iter()
            .map(|(name, ship)| ShipInfo {
                name: name.clone(),
                image: ship.image.clone(),
                dockerfile: ship.dockerfile.clone(),
                description: ship.description.clone(),
            })
            .collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HistoryConfig {
    /// SQLite file. Defaults to the data directory.
    pub path: Option<PathBuf>,
}

impl HistoryConfig {
    pub fn path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(thalassa_protocol::paths::history_db_path)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ShipConfig {
    pub image: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}
