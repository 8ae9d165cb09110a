//! Actions executed at the end of every polling cycle.
//!
//! The action set is closed: nodes that fall too far behind the fleet or
//! whose chain stopped moving are either shut down or reported by email,
//! depending on what is configured.

use super::{shut_down_node, Node, StatsSnapshot};
use crate::api::NodeStatistic;
use crate::blockcfg::TimeSettings;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use num_bigint::BigInt;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{error, warn};

/// The aggregated context one polling cycle hands to each action.
pub struct ActionContext {
    pub time_settings: TimeSettings,
    pub block_heights: BTreeMap<String, BigInt>,
    pub maximum_block_height: BigInt,
    pub up_to_date_nodes: Vec<String>,
    pub stats: StatsSnapshot,
}

pub enum Action {
    ShutDownOnBlockLag,
    ShutDownWhenStuck,
    EmailOnBlockLag(Mailer),
    EmailOnStuck(Mailer),
}

impl Action {
    pub async fn execute(&self, nodes: &[Node], context: &ActionContext) {
        match self {
            Action::ShutDownOnBlockLag => {
                for (node, lag) in nodes_behind(nodes, context) {
                    warn!(node = %node.name, "pool has fallen behind {} blocks", lag);
                    let node = node.clone();
                    tokio::spawn(async move { shut_down_node(&node).await });
                }
            }
            Action::ShutDownWhenStuck => {
                for (node, staleness) in nodes_stuck(nodes, context) {
                    warn!(
                        node = %node.name,
                        "most recent received block is {} old",
                        humantime::format_duration(staleness)
                    );
                    let node = node.clone();
                    tokio::spawn(async move { shut_down_node(&node).await });
                }
            }
            Action::EmailOnBlockLag(mailer) => {
                for (node, lag) in nodes_behind(nodes, context) {
                    let report = block_lag_report(&node.name, &lag, context);
                    mailer.send_report(
                        format!("[HEIMDALL][{}] Report of Block Lag.", node.name),
                        report,
                    );
                }
            }
            Action::EmailOnStuck(mailer) => {
                for (node, staleness) in nodes_stuck(nodes, context) {
                    let report = stuck_report(&node.name, staleness, context);
                    mailer.send_report(
                        format!("[HEIMDALL][{}] Report Blockchain Stuck.", node.name),
                        report,
                    );
                }
            }
        }
    }
}

/// Nodes that lag at least their configured maximum behind the fleet.
/// Nodes without a lag limit, nodes still warming up and nodes that did
/// not report this cycle are ignored.
fn nodes_behind<'a>(nodes: &'a [Node], context: &ActionContext) -> Vec<(&'a Node, BigInt)> {
    let mut behind = Vec::new();
    for node in nodes {
        if node.max_block_lag == 0 {
            continue;
        }
        let stat = match context.stats.get(&node.name) {
            Some(stat) => stat,
            None => continue,
        };
        if stat.uptime <= node.warm_up_time {
            continue;
        }
        let lag = &context.maximum_block_height - &stat.last_block_height;
        if lag >= BigInt::from(node.max_block_lag) {
            behind.push((node, lag));
        }
    }
    behind
}

/// Nodes whose most recent block closed longer ago than their configured
/// staleness limit.
fn nodes_stuck<'a>(nodes: &'a [Node], context: &ActionContext) -> Vec<(&'a Node, Duration)> {
    let now = SystemTime::now();
    let mut stuck = Vec::new();
    for node in nodes {
        let limit = match node.max_time_since_last_block {
            Some(limit) => limit,
            None => continue,
        };
        let stat = match context.stats.get(&node.name) {
            Some(stat) => stat,
            None => continue,
        };
        let block_end = context.time_settings.slot_end(stat.last_block_date);
        if let Ok(staleness) = now.duration_since(block_end) {
            if staleness > limit {
                stuck.push((node, staleness));
            }
        }
    }
    stuck
}

fn latest_block_summary(stat: Option<&NodeStatistic>) -> String {
    match stat {
        Some(stat) => format!(
            "\nLatest Block\n------------\nUpTime: {}\nReceived Blocks: {}\nReceived Transactions: {}\nSlotDate: {}\nHeight: {}\nHash: {}\n",
            humantime::format_duration(stat.uptime),
            stat.block_recv_cnt,
            stat.tx_recv_cnt,
            stat.last_block_date,
            stat.last_block_height,
            stat.last_block_hash,
        ),
        None => "\nLatest Block: not reported this cycle\n".to_string(),
    }
}

fn block_lag_report(name: &str, lag: &BigInt, context: &ActionContext) -> String {
    format!(
        "\nNode '{}' has fallen behind {} blocks.\n\nTimestamp: {}\n{}",
        name,
        lag,
        crate::time::SystemTime::now(),
        latest_block_summary(context.stats.get(name)),
    )
}

fn stuck_report(name: &str, staleness: Duration, context: &ActionContext) -> String {
    format!(
        "\nNode '{}' most recent block was computed {} ago.\n\nTimestamp: {}\n{}",
        name,
        humantime::format_duration(staleness),
        crate::time::SystemTime::now(),
        latest_block_summary(context.stats.get(name)),
    )
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("invalid email address")]
    Address(#[from] lettre::address::AddressError),
    #[error("could not set up the SMTP transport")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Sends plain-text reports over an authenticated SMTP connection.
#[derive(Clone)]
pub struct Mailer {
    transport: SmtpTransport,
    source: Mailbox,
    destinations: Vec<Mailbox>,
}

impl std::fmt::Debug for Mailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailer")
            .field("source", &self.source)
            .field("destinations", &self.destinations)
            .finish()
    }
}

impl Mailer {
    pub fn new(
        host: &str,
        port: u16,
        username: String,
        password: String,
        source: &str,
        destinations: &[String],
    ) -> Result<Self, MailerError> {
        let transport = SmtpTransport::starttls_relay(host)?
            .port(port)
            .credentials(Credentials::new(username, password))
            .build();
        let source = source.parse()?;
        let destinations = destinations
            .iter()
            .map(|destination| destination.parse())
            .collect::<Result<Vec<Mailbox>, _>>()?;
        Ok(Mailer {
            transport,
            source,
            destinations,
        })
    }

    /// Fire-and-forget: the SMTP round trip happens on the blocking pool
    /// and a failed send is only logged.
    pub fn send_report(&self, subject: String, body: String) {
        let mailer = self.clone();
        tokio::task::spawn_blocking(move || {
            for destination in &mailer.destinations {
                let message = Message::builder()
                    .from(mailer.source.clone())
                    .to(destination.clone())
                    .subject(subject.clone())
                    .body(body.clone());
                match message {
                    Ok(message) => {
                        if let Err(err) = mailer.transport.send(&message) {
                            error!("could not send email report: {}", err);
                        }
                    }
                    Err(err) => error!("could not build email report: {}", err),
                }
            }
        });
    }
}
