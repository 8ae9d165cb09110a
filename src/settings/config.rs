//! Shape of the YAML configuration file.

use crate::monitor::NodeKind;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub blockchain: BlockchainConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// directory of the embedded key-value store; defaults to
    /// `heimdall_storage` next to the working directory.
    pub storage: Option<PathBuf>,
    pub pooltool: Option<PoolToolConfig>,
    pub email: Option<EmailConfig>,
    pub prometheus: Option<PrometheusConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// logging level that shall be used; levels can be panic, fatal,
    /// error, warn, info, debug or trace.
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BlockchainConfig {
    pub genesis_block_hash: String,
    pub genesis_block_time: DateTime<Utc>,
    pub slots_per_epoch: u64,
    /// duration of a slot in milliseconds.
    pub slot_duration: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct PeerConfig {
    /// unique name of the node.
    pub name: String,
    #[serde(rename = "type", default = "default_node_kind")]
    pub kind: NodeKind,
    /// base URL of the node's administrative REST interface.
    pub api: Url,
    /// the maximal number of blocks this node is allowed to lag behind;
    /// 0 disables the check.
    #[serde(default)]
    pub max_block_lag: u64,
    /// maximal age of the most recent block in milliseconds before the
    /// node counts as stuck.
    pub max_time_since_last_block: Option<u64>,
    /// grace period after node start in milliseconds.
    #[serde(default)]
    pub warm_up_time: u64,
    /// API timeout in milliseconds.
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,
}

fn default_node_kind() -> NodeKind {
    NodeKind::Passive
}

fn default_api_timeout() -> u64 {
    3_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MonitorConfig {
    /// interval in which the status of the nodes shall be checked, in
    /// milliseconds.
    #[serde(default = "default_interval")]
    pub interval: u64,
    pub leader_jury: Option<LeaderJuryConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            interval: default_interval(),
            leader_jury: None,
        }
    }
}

fn default_interval() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LeaderJuryConfig {
    /// path to the leader certificate of the staking identity.
    pub cert: Option<PathBuf>,
    /// the number of checkpoints considered for leader decisions.
    #[serde(default = "default_window")]
    pub window: usize,
    /// exclusion zone in front of a scheduled block, in seconds.
    #[serde(default = "default_exclusion_zone")]
    pub exclusion_zone: u64,
    /// exclusion zone in front of the epoch turnover, in seconds.
    #[serde(default = "default_pre_turnover_exclusion_zone")]
    pub pre_turnover_exclusion_zone: u64,
}

fn default_window() -> usize {
    5
}

fn default_exclusion_zone() -> u64 {
    30
}

fn default_pre_turnover_exclusion_zone() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolToolConfig {
    #[serde(rename = "userID")]
    pub user_id: String,
    #[serde(rename = "poolID")]
    pub pool_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    /// email from which messages shall be sent.
    pub source: String,
    /// the emails to which all messages shall be sent.
    #[serde(default)]
    pub destinations: Vec<String>,
    pub server: SmtpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpServerConfig {
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub authentication: SmtpAuthConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SmtpAuthConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrometheusConfig {
    pub hostname: String,
    pub port: String,
}
