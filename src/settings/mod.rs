//! Settings of the supervisor process, assembled from the command line
//! arguments and the YAML configuration file. All validation happens here,
//! before any service starts: a process with an invalid configuration
//! refuses to start.

pub mod command_arguments;
pub mod config;
pub mod logging;

pub use self::command_arguments::CommandLine;
pub use self::logging::{LogSettings, LogSettingsError};

use self::config::{Config, EmailConfig, PeerConfig};
use crate::api::RestNodeApi;
use crate::blockcfg::TimeSettings;
use crate::leadership::JurySettings;
use crate::monitor::{Mailer, MonitorSettings, Node};
use crate::secure::LeaderCertificate;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_STORAGE_DIR: &str = "heimdall_storage";

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read the configuration file")]
    Io(#[from] std::io::Error),
    #[error("could not parse the config file")]
    Format(#[from] serde_yaml::Error),
    #[error("invalid configuration at {path}: {reason}")]
    Invalid { path: &'static str, reason: String },
}

/// Everything the leader jury needs beyond the shared node handles.
#[derive(Debug)]
pub struct JurySetup {
    pub cert: LeaderCertificate,
    pub settings: JurySettings,
}

#[derive(Debug)]
pub struct Settings {
    pub log_settings: LogSettings,
    pub time_settings: TimeSettings,
    pub nodes: Vec<Node>,
    pub monitor: MonitorSettings,
    pub jury: Option<JurySetup>,
    pub storage: PathBuf,
    pub mailer: Option<Mailer>,
}

impl Settings {
    pub fn load(command_line: &CommandLine) -> Result<Self, Error> {
        Self::load_from(&command_line.config)
    }

    pub fn load_from(path: &Path) -> Result<Self, Error> {
        let data = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&data)?;
        Self::try_from_config(config)
    }

    fn try_from_config(config: Config) -> Result<Self, Error> {
        let log_settings = LogSettings::from_config(config.logging.level.as_deref())
            .map_err(|err| Error::Invalid {
                path: "logging/level",
                reason: err.to_string(),
            })?;
        let time_settings = time_settings(&config)?;
        let nodes = nodes(&config.peers)?;
        let monitor = MonitorSettings {
            interval: Duration::from_millis(config.monitor.interval),
        };
        let jury = jury_setup(&config, &time_settings)?;
        let mailer = mailer(config.email.as_ref())?;
        if let Some(prometheus) = &config.prometheus {
            if prometheus.hostname.is_empty() || prometheus.port.is_empty() {
                return Err(Error::Invalid {
                    path: "prometheus",
                    reason: "hostname and port must be specified".to_string(),
                });
            }
        }
        Ok(Settings {
            log_settings,
            time_settings,
            nodes,
            monitor,
            jury,
            storage: config
                .storage
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR)),
            mailer,
        })
    }
}

fn time_settings(config: &Config) -> Result<TimeSettings, Error> {
    let blockchain = &config.blockchain;
    if blockchain.slots_per_epoch == 0 || blockchain.slot_duration == 0 {
        return Err(Error::Invalid {
            path: "blockchain",
            reason: "time settings cannot be established, slots per epoch and slot \
                     duration must both be specified"
                .to_string(),
        });
    }
    Ok(TimeSettings {
        genesis_time: blockchain.genesis_block_time.into(),
        slot_duration: Duration::from_millis(blockchain.slot_duration),
        slots_per_epoch: blockchain.slots_per_epoch,
    })
}

fn nodes(peers: &[PeerConfig]) -> Result<Vec<Node>, Error> {
    let mut names = HashSet::new();
    let mut nodes = Vec::with_capacity(peers.len());
    for peer in peers {
        if !names.insert(peer.name.clone()) {
            return Err(Error::Invalid {
                path: "peers",
                reason: format!("the node name '{}' is used more than once", peer.name),
            });
        }
        let api_timeout = Duration::from_millis(peer.api_timeout);
        let api = RestNodeApi::new(peer.api.clone(), api_timeout).map_err(|err| {
            Error::Invalid {
                path: "peers",
                reason: format!("could not build an API for '{}': {}", peer.name, err),
            }
        })?;
        nodes.push(Node {
            name: peer.name.clone(),
            kind: peer.kind,
            api: Arc::new(api),
            max_block_lag: peer.max_block_lag,
            max_time_since_last_block: peer.max_time_since_last_block.map(Duration::from_millis),
            warm_up_time: Duration::from_millis(peer.warm_up_time),
            api_timeout,
        });
    }
    Ok(nodes)
}

fn jury_setup(config: &Config, time_settings: &TimeSettings) -> Result<Option<JurySetup>, Error> {
    let jury = match &config.monitor.leader_jury {
        Some(jury) => jury,
        None => return Ok(None),
    };
    let cert_path = jury
        .cert
        .as_ref()
        .filter(|path| !path.as_os_str().is_empty())
        .ok_or_else(|| Error::Invalid {
            path: "monitor/leader_jury/cert",
            reason: "the certificate path must be specified".to_string(),
        })?;
    let cert = LeaderCertificate::load_from_file(cert_path).map_err(|err| Error::Invalid {
        path: "monitor/leader_jury/cert",
        reason: err.to_string(),
    })?;
    let window = if jury.window == 0 { 5 } else { jury.window };
    let exclusion_zone = Duration::from_secs(jury.exclusion_zone);
    let pre_turnover_exclusion_slots = (Duration::from_secs(jury.pre_turnover_exclusion_zone)
        .as_millis()
        / time_settings.slot_duration.as_millis()) as u64;
    Ok(Some(JurySetup {
        cert,
        settings: JurySettings {
            window,
            exclusion_zone,
            pre_turnover_exclusion_slots,
            time_settings: time_settings.clone(),
        },
    }))
}

fn mailer(email: Option<&EmailConfig>) -> Result<Option<Mailer>, Error> {
    let email = match email {
        Some(email) => email,
        None => return Ok(None),
    };
    if email.server.host.is_empty() || email.server.port == 0 {
        return Err(Error::Invalid {
            path: "email/server",
            reason: "host and port must be specified for the server".to_string(),
        });
    }
    let auth = &email.server.authentication;
    if auth.username.is_empty() || auth.password.is_empty() {
        return Err(Error::Invalid {
            path: "email/server/authentication",
            reason: "username and password for the SMTP server must be specified".to_string(),
        });
    }
    let mailer = Mailer::new(
        &email.server.host,
        email.server.port,
        auth.username.clone(),
        auth.password.clone(),
        &email.source,
        &email.destinations,
    )
    .map_err(|err| Error::Invalid {
        path: "email",
        reason: err.to_string(),
    })?;
    Ok(Some(mailer))
}
