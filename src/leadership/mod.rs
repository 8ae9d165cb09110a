//! The leader jury.
//!
//! Exactly one node of the fleet may hold a leader enrolment at any time;
//! two nodes signing under the same staking identity would produce an
//! adversarial fork. The jury continuously judges the health of all leader
//! candidates from the monitor's statistics broadcasts and moves the
//! enrolment to the healthiest candidate, unless a scheduled block or the
//! epoch turnover is too close for a change of leadership to be safe.

pub mod sanity;
pub mod turnover;

use crate::api::{assignments_scheduled_after, EnclaveLeaderId};
use crate::blockcfg::TimeSettings;
use crate::monitor::{shut_down_node, BlockHeightMemory, Node, StatsSnapshot};
use crate::schedule::ScheduleWatchdog;
use crate::secure::LeaderCertificate;
use crate::utils::{max_entries, min_entries};

use rand::seq::SliceRandom;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

/// Demotion of a previous leader is retried this often before the node is
/// shut down as a safety measure.
const DEMOTION_ATTEMPTS: u32 = 3;
const DEMOTION_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// When looking for the next scheduled block, assignments up to this many
/// slot durations in the past still count: the block of the current slot
/// may not have been minted yet.
const EXCLUSION_LOOKBACK_SLOTS: u32 = 2;

/// The node currently holding the leader role, together with the enrolment
/// id the node handed out for it. At most one exists across the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentLeader {
    pub name: String,
    pub enrolment: EnclaveLeaderId,
}

/// settings for the Leader Jury.
#[derive(Debug, Clone)]
pub struct JurySettings {
    /// the number of checkpoints that shall be considered for the health
    /// check and leader decisions.
    pub window: usize,
    /// the time window in front of a scheduled block in which no leader
    /// change is allowed.
    pub exclusion_zone: Duration,
    /// the number of slots before an epoch turn over in which no leader
    /// change is allowed.
    pub pre_turnover_exclusion_slots: u64,
    /// time settings of the supervised blockchain.
    pub time_settings: TimeSettings,
}

#[derive(Debug, Error)]
pub enum JuryError {
    #[error("no node has been specified as leader candidate")]
    NoLeaderCandidates,
}

pub struct LeaderJury {
    nodes: BTreeMap<String, Node>,
    watchdog: Arc<ScheduleWatchdog>,
    cert: LeaderCertificate,
    settings: JurySettings,
    leader: Mutex<Option<CurrentLeader>>,
}

impl LeaderJury {
    /// Creates the jury judging the leader candidates among the given
    /// nodes. It expects the certificate of the leader that shall be
    /// managed and the jury settings.
    pub fn new(
        nodes: Vec<Node>,
        watchdog: Arc<ScheduleWatchdog>,
        cert: LeaderCertificate,
        settings: JurySettings,
    ) -> Result<Self, JuryError> {
        let candidates: BTreeMap<String, Node> = nodes
            .into_iter()
            .filter(Node::is_leader_candidate)
            .map(|node| (node.name.clone(), node))
            .collect();
        if candidates.is_empty() {
            return Err(JuryError::NoLeaderCandidates);
        }
        Ok(LeaderJury {
            nodes: candidates,
            watchdog,
            cert,
            settings,
            leader: Mutex::new(None),
        })
    }

    /// Starts the jury and lets it continuously run; it judges every
    /// statistics snapshot the monitor broadcasts.
    pub async fn judge(self: Arc<Self>, mut stats: broadcast::Receiver<StatsSnapshot>) {
        let names: Vec<String> = self.nodes.keys().cloned().collect();
        let mut memory = BlockHeightMemory::new(&names, self.settings.window);

        if let Some(leader) = self.scan_for_leader().await {
            info!(
                node = %leader.name,
                "node is elected and has enrolment id={}", leader.enrolment
            );
            *self.leader.lock().await = Some(leader);
        }

        loop {
            let snapshot = match stats.recv().await {
                Ok(snapshot) => snapshot,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("lagged behind the monitor, skipped {} snapshots", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    error!("the monitor stopped broadcasting statistics");
                    return;
                }
            };
            self.cycle(&mut memory, snapshot).await;
        }
    }

    async fn cycle(&self, memory: &mut BlockHeightMemory, snapshot: StatsSnapshot) {
        memory.record(&snapshot);

        let viable = self.watchdog.viable_leader_nodes();
        info!("viable nodes are [{}]", viable.join(","));
        if viable.is_empty() {
            info!("no viable candidate this epoch, skipping the election");
        } else if let Some(best) = self.healthiest_nodes(memory, &snapshot, &viable) {
            let current = self.leader.lock().await.clone();
            let current_is_best = current
                .as_ref()
                .map(|leader| best.contains(&leader.name))
                .unwrap_or(false);
            if !current_is_best && !self.in_exclusion_zone(SystemTime::now()) {
                let elected = best.choose(&mut rand::thread_rng()).cloned();
                if let Some(elected) = elected {
                    self.change_leader(&elected).await;
                }
            }
        }

        if let Some(leader) = self.leader.lock().await.as_ref() {
            info!("current leader is {}", leader.name);
        }
    }

    /// The best set of this cycle: among the viable candidates with the
    /// lowest drift, the ones with the longest uptime.
    fn healthiest_nodes(
        &self,
        memory: &BlockHeightMemory,
        snapshot: &StatsSnapshot,
        viable: &[String],
    ) -> Option<Vec<String>> {
        let scores = memory.drift_scores();
        let viable_scores: BTreeMap<String, f64> = scores
            .into_iter()
            .filter(|(name, _)| viable.iter().any(|viable| viable == name))
            .collect();
        let (min_drift, min_nodes) = min_entries(&viable_scores)?;
        info!(
            "nodes [{}] have lowest drift ({})",
            min_nodes.join(","),
            min_drift
        );
        let uptimes: BTreeMap<String, Duration> = min_nodes
            .iter()
            .map(|name| {
                let uptime = snapshot
                    .get(name)
                    .map(|stat| stat.uptime)
                    .unwrap_or_default();
                (name.clone(), uptime)
            })
            .collect();
        let (_, best) = max_entries(&uptimes)?;
        info!("nodes [{}] considered to be healthiest", best.join(","));
        Some(best)
    }

    /// No leader change is allowed close to a scheduled block or close to
    /// the epoch turnover.
    fn in_exclusion_zone(&self, now: SystemTime) -> bool {
        let settings = &self.settings.time_settings;
        let position = match settings.position_at(now) {
            Some(position) => position,
            None => {
                error!("the wall clock is before the genesis time of the blockchain");
                return true;
            }
        };
        if let Some(schedule) = self.watchdog.schedule_for(position.epoch) {
            let lookback = now - settings.slot_duration * EXCLUSION_LOOKBACK_SLOTS;
            let future = assignments_scheduled_after(lookback, &schedule);
            if let Some(next) = future.first() {
                let scheduled: SystemTime = next.scheduled_at_time.into();
                let blocked = match scheduled.duration_since(now) {
                    Ok(time_to_block) => time_to_block < self.settings.exclusion_zone,
                    // the assignment is already due; certainly too close
                    Err(_) => true,
                };
                if blocked {
                    warn!("in exclusion zone before a scheduled block");
                    return true;
                }
            }
        }
        if settings.slots_until_epoch_end(position) <= self.settings.pre_turnover_exclusion_slots {
            warn!("in exclusion zone before epoch turn over, no leader change will be performed");
            return true;
        }
        false
    }

    /// Scans for the current leader among all the nodes; it expects only
    /// one leader enrolment across the fleet. The scan also corrects
    /// leftover state: every enrolment except the first one found is
    /// demoted.
    async fn scan_for_leader(&self) -> Option<CurrentLeader> {
        let mut leader: Option<CurrentLeader> = None;
        for (name, node) in &self.nodes {
            let ids = match node.api.registered_leaders().await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(node = %name, "could not scan for enrolments: {}", err);
                    continue;
                }
            };
            if !ids.is_empty() && leader.is_none() {
                leader = Some(CurrentLeader {
                    name: name.clone(),
                    enrolment: ids[0],
                });
                for id in &ids[1..] {
                    demote_leader(node, *id, DEMOTION_ATTEMPTS).await;
                }
            } else {
                for id in ids {
                    demote_leader(node, id, DEMOTION_ATTEMPTS).await;
                }
            }
        }
        leader
    }

    /// Changes the leader to the given node. The old enrolment is removed
    /// in the background; if that keeps failing, the old node is shut down
    /// so it cannot keep signing.
    async fn change_leader(&self, name: &str) {
        let mut leader = self.leader.lock().await;
        let node = match self.nodes.get(name) {
            Some(node) => node,
            None => return,
        };
        match node.api.post_leader(&self.cert).await {
            Ok(enrolment) => {
                let previous = leader.replace(CurrentLeader {
                    name: name.to_string(),
                    enrolment,
                });
                info!(node = %name, "node is elected and has enrolment id={}", enrolment);
                if let Some(previous) = previous {
                    if let Some(old_node) = self.nodes.get(&previous.name) {
                        let old_node = old_node.clone();
                        tokio::spawn(async move {
                            demote_leader(&old_node, previous.enrolment, DEMOTION_ATTEMPTS).await;
                        });
                    }
                }
            }
            Err(err) => {
                error!(node = %name, "could not change to leader: {}", err);
            }
        }
    }
}

/// Tries in `attempts` attempts to demote the given enrolment. If all of
/// them fail, the node is shut down as a safety measure.
pub(crate) async fn demote_leader(node: &Node, id: EnclaveLeaderId, attempts: u32) {
    for attempt in 1..=attempts {
        match node.api.remove_registered_leader(id).await {
            Ok(true) => return,
            Ok(false) => {
                warn!(node = %node.name, "the node was not in leader mode");
                return;
            }
            Err(err) => {
                warn!(
                    node = %node.name,
                    "the leader node could not be demoted, attempt {}: {}", attempt, err
                );
                tokio::time::sleep(DEMOTION_RETRY_PAUSE).await;
            }
        }
    }
    warn!(node = %node.name, "could not demote the node, a shutdown will be tried");
    shut_down_node(node).await;
}
