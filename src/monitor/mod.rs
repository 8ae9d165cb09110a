//! Periodic health polling of the supervised fleet.
//!
//! The monitor drives the polling pulse: every interval it queries all
//! nodes in parallel for their statistics, publishes the aggregated
//! snapshot to its subscribers (most importantly the leader jury) and runs
//! the registered actions over it. Polling is suppressed right before a
//! scheduled block so the HTTP traffic does not compete with minting.

pub mod actions;
pub mod block_height;

pub use self::actions::{Action, ActionContext, Mailer};
pub use self::block_height::BlockHeightMemory;

use crate::api::{assignments_scheduled_after, NodeApi, NodeStatistic, NodeStats};
use crate::blockcfg::TimeSettings;
use crate::schedule::ScheduleWatchdog;
use crate::utils::max_entries;

use num_bigint::BigInt;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Polling cycles this close to a scheduled block are skipped entirely.
const PRE_BLOCK_SUPPRESSION_SLOTS: u32 = 10;

/// Pause between the two shutdown requests of the shutdown primitive.
const SHUTDOWN_REPEAT_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Passive,
    LeaderCandidate,
}

/// A supervised node: a unique name, its role in the fleet, the handle to
/// its administrative API and the health tolerances configured for it.
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub api: Arc<dyn NodeApi>,
    /// the maximal number of blocks this node is allowed to lag behind the
    /// fleet maximum; 0 disables the check.
    pub max_block_lag: u64,
    /// how old the most recently seen block may grow before the node
    /// counts as stuck.
    pub max_time_since_last_block: Option<Duration>,
    /// grace period after node start during which lag is not acted upon.
    pub warm_up_time: Duration,
    /// timeout applied to every single API call to this node.
    pub api_timeout: Duration,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("max_block_lag", &self.max_block_lag)
            .field("max_time_since_last_block", &self.max_time_since_last_block)
            .field("warm_up_time", &self.warm_up_time)
            .field("api_timeout", &self.api_timeout)
            .finish()
    }
}

impl Node {
    pub fn is_leader_candidate(&self) -> bool {
        self.kind == NodeKind::LeaderCandidate
    }
}

/// One polling cycle's aggregated statistics, keyed by node name.
pub type StatsSnapshot = Arc<BTreeMap<String, NodeStatistic>>;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
}

pub struct NodeMonitor {
    nodes: Vec<Node>,
    settings: MonitorSettings,
    time_settings: TimeSettings,
    watchdog: Arc<ScheduleWatchdog>,
    actions: Vec<Action>,
    stats_sender: broadcast::Sender<StatsSnapshot>,
}

impl NodeMonitor {
    pub fn new(
        nodes: Vec<Node>,
        settings: MonitorSettings,
        time_settings: TimeSettings,
        watchdog: Arc<ScheduleWatchdog>,
        actions: Vec<Action>,
    ) -> Self {
        let (stats_sender, _) = broadcast::channel(8);
        NodeMonitor {
            nodes,
            settings,
            time_settings,
            watchdog,
            actions,
            stats_sender,
        }
    }

    /// Register a consumer of the per-cycle statistics snapshots. A slow
    /// consumer loses the oldest snapshots first.
    pub fn subscribe(&self) -> broadcast::Receiver<StatsSnapshot> {
        self.stats_sender.subscribe()
    }

    /// A blocking call which is continuously watching after the nodes.
    pub async fn watch(self: Arc<Self>) {
        info!("starting to monitor {} peers", self.nodes.len());
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if self.next_block_is_imminent(SystemTime::now()) {
                debug!("scheduled block is imminent, skipping this polling cycle");
                continue;
            }
            self.poll_cycle().await;
        }
    }

    /// Whether the next scheduled assignment of the current epoch is less
    /// than [`PRE_BLOCK_SUPPRESSION_SLOTS`] slot durations away.
    fn next_block_is_imminent(&self, now: SystemTime) -> bool {
        let position = match self.time_settings.position_at(now) {
            Some(position) => position,
            None => return false,
        };
        let schedule = match self.watchdog.schedule_for(position.epoch) {
            Some(schedule) => schedule,
            None => return false,
        };
        let future = assignments_scheduled_after(now, &schedule);
        match future.first() {
            Some(next) => {
                let horizon = now + self.time_settings.slot_duration * PRE_BLOCK_SUPPRESSION_SLOTS;
                std::time::SystemTime::from(next.scheduled_at_time) < horizon
            }
            None => false,
        }
    }

    async fn poll_cycle(&self) {
        let polls = self.nodes.iter().map(|node| async move {
            let stats = tokio::time::timeout(node.api_timeout, node.api.node_statistics()).await;
            (node.name.clone(), stats)
        });
        let mut responses = futures::future::join_all(polls).await;
        // deterministic log output, whatever order the answers came in
        responses.sort_by(|left, right| left.0.cmp(&right.0));

        let mut stats_map: BTreeMap<String, NodeStatistic> = BTreeMap::new();
        for (name, response) in responses {
            match response {
                Ok(Ok(NodeStats::Running(stat))) => {
                    info!(
                        node = %name,
                        "block height <{}>, date <{}>, hash <{}>",
                        stat.last_block_height,
                        stat.last_block_date,
                        &stat.last_block_hash[..stat.last_block_hash.len().min(8)],
                    );
                    stats_map.insert(name, stat);
                }
                Ok(Ok(NodeStats::Bootstrapping)) => {
                    info!(node = %name, "---");
                }
                Ok(Err(err)) => {
                    error!(node = %name, "node details cannot be fetched: {}", err);
                }
                Err(_) => {
                    error!(node = %name, "node did not answer within its timeout");
                }
            }
        }

        let snapshot: StatsSnapshot = Arc::new(stats_map);
        // receivers come and go; an empty subscriber list is not an error
        let _ = self.stats_sender.send(snapshot.clone());

        let context = self.action_context(snapshot);
        for action in &self.actions {
            action.execute(&self.nodes, &context).await;
        }
    }

    fn action_context(&self, stats: StatsSnapshot) -> ActionContext {
        let block_heights: BTreeMap<String, BigInt> = stats
            .iter()
            .map(|(name, stat)| (name.clone(), stat.last_block_height.clone()))
            .collect();
        let (maximum_block_height, up_to_date_nodes) = max_entries(&block_heights)
            .unwrap_or_else(|| (BigInt::default(), Vec::new()));
        ActionContext {
            time_settings: self.time_settings.clone(),
            block_heights,
            maximum_block_height,
            up_to_date_nodes,
            stats,
        }
    }
}

/// Request a node shutdown. The call is repeated once after a short pause:
/// the first request may arrive while the node is still initialising its
/// REST interface and get lost.
pub async fn shut_down_node(node: &Node) {
    warn!(node = %node.name, "node is going to be shut down");
    if let Err(err) = node.api.shutdown().await {
        warn!(node = %node.name, "shutdown request failed: {}", err);
    }
    tokio::time::sleep(SHUTDOWN_REPEAT_PAUSE).await;
    if let Err(err) = node.api.shutdown().await {
        warn!(node = %node.name, "repeated shutdown request failed: {}", err);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::mock::MockNodeApi;

    pub(crate) fn test_node(name: &str, api: Arc<MockNodeApi>) -> Node {
        Node {
            name: name.to_string(),
            kind: NodeKind::LeaderCandidate,
            api,
            max_block_lag: 0,
            max_time_since_last_block: None,
            warm_up_time: Duration::from_secs(0),
            api_timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_primitive_requests_twice_with_a_pause() {
        let api = Arc::new(MockNodeApi::new());
        let node = test_node("a", api.clone());
        shut_down_node(&node).await;
        let calls = api.shutdown_calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1] - calls[0], SHUTDOWN_REPEAT_PAUSE);
    }
}
