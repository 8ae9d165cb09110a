//! Watches for the leader schedules computed for each epoch and checks
//! whether the leader candidates have computed the same schedule.
//!
//! For every epoch the watchdog obtains one canonical schedule: the first
//! non-empty answer of the fleet, or a previously persisted copy. Every
//! other node's schedule is compared against the canonical one; a node
//! whose future portion has the same length is "viable" and may be elected
//! leader for this epoch. Nodes may legitimately format times differently,
//! so the cross-check is length equality of the future-trimmed lists, not
//! element equality.

pub mod store;

pub use self::store::{ScheduleStore, StoreError};

use crate::api::{
    assignments_in_epoch, assignments_of_leader, assignments_scheduled_after,
    sorted_by_schedule_time, LeaderAssignment, STAKING_LEADER_ID,
};
use crate::blockcfg::{Epoch, TimeSettings};
use crate::monitor::Node;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Pause between viability re-checks of a node that disagreed with the
/// canonical schedule.
const VIABILITY_RECHECK_PAUSE: Duration = Duration::from_secs(10 * 60);

/// Retry cadence while no node can serve a schedule yet: early in the
/// epoch the schedule may simply not be computed, so retry quickly.
const EARLY_EPOCH_SLOT_THRESHOLD: u64 = 500;
const EARLY_EPOCH_RETRY_SLOTS: u32 = 50;
const LATE_EPOCH_RETRY_PAUSE: Duration = Duration::from_secs(10 * 60);

/// Back-off applied when the wall clock makes no sense (before genesis);
/// avoids a tight failure loop in a long-running control plane.
const CLOCK_FAILURE_BACKOFF: Duration = Duration::from_secs(30 * 60);

/// A schedule accepted for an epoch, as published to the listeners.
#[derive(Debug, Clone)]
pub struct SchedulePublication {
    pub epoch: Epoch,
    pub assignments: Arc<Vec<LeaderAssignment>>,
}

pub struct ScheduleWatchdog {
    nodes: Vec<Node>,
    time_settings: TimeSettings,
    store: ScheduleStore,
    schedules: RwLock<HashMap<u64, Arc<Vec<LeaderAssignment>>>>,
    viable: Mutex<HashMap<u64, Vec<String>>>,
    publisher: broadcast::Sender<SchedulePublication>,
}

/// Agreement check between the canonical schedule and a node's own: both
/// lists are trimmed to their future portion at the moment of comparison,
/// and only the lengths are compared.
fn future_lengths_match(
    canonical: &[LeaderAssignment],
    candidate: &[LeaderAssignment],
    at: SystemTime,
) -> bool {
    assignments_scheduled_after(at, canonical).len()
        == assignments_scheduled_after(at, candidate).len()
}

impl ScheduleWatchdog {
    pub fn new(nodes: Vec<Node>, time_settings: TimeSettings, store: ScheduleStore) -> Self {
        let (publisher, _) = broadcast::channel(8);
        ScheduleWatchdog {
            nodes,
            time_settings,
            store,
            schedules: RwLock::new(HashMap::new()),
            viable: Mutex::new(HashMap::new()),
            publisher,
        }
    }

    /// The canonical schedule accepted for the given epoch, if any.
    pub fn schedule_for(&self, epoch: Epoch) -> Option<Arc<Vec<LeaderAssignment>>> {
        self.schedules.read().unwrap().get(&epoch.0).cloned()
    }

    /// The nodes whose own schedule agrees with the canonical schedule of
    /// the current epoch.
    pub fn viable_leader_nodes(&self) -> Vec<String> {
        let position = match self.time_settings.position_at(SystemTime::now()) {
            Some(position) => position,
            None => return Vec::new(),
        };
        self.viable
            .lock()
            .unwrap()
            .get(&position.epoch.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a consumer of schedule publications. Publishing is
    /// best-effort: a listener that lags loses the oldest publications.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulePublication> {
        self.publisher.subscribe()
    }

    fn set_viable(&self, epoch: Epoch, nodes: Vec<String>) {
        self.viable.lock().unwrap().insert(epoch.0, nodes);
    }

    fn admit_viable(&self, epoch: Epoch, name: &str) {
        let mut viable = self.viable.lock().unwrap();
        let entry = viable.entry(epoch.0).or_default();
        if !entry.iter().any(|existing| existing == name) {
            entry.push(name.to_string());
        }
    }

    /// Watches for the schedules computed for epochs. A blocking call that
    /// runs for the process lifetime.
    pub async fn watch(self: Arc<Self>) {
        info!("starting to watch the schedule");
        let mut next = Duration::ZERO;
        loop {
            tokio::time::sleep(next).await;
            let now = SystemTime::now();
            let position = match self.time_settings.position_at(now) {
                Some(position) => position,
                None => {
                    error!("the wall clock is before the genesis time of the blockchain");
                    next = CLOCK_FAILURE_BACKOFF;
                    continue;
                }
            };
            let epoch = position.epoch;

            if let Some(schedule) = self.schedule_for(epoch) {
                info!(
                    epoch = %epoch,
                    "the schedule has already been fetched for this epoch ({} entries)",
                    schedule.len()
                );
                next = self.until_shortly_after_epoch_start(now, epoch.next());
                continue;
            }

            // no agreement data yet for this epoch
            self.set_viable(epoch, Vec::new());

            let (schedule, viable) = match self.store.load(epoch) {
                Ok(Some(stored)) => {
                    info!(epoch = %epoch, "fetched schedule from persistent storage");
                    (Some(stored), Vec::new())
                }
                Ok(None) => self.fetch_from_nodes(epoch, now).await,
                Err(err) => {
                    error!("could not read the persisted schedule: {}", err);
                    self.fetch_from_nodes(epoch, now).await
                }
            };

            match schedule {
                Some(schedule) if !schedule.is_empty() => {
                    let published = self.install_schedule(epoch, schedule, viable);
                    info!(
                        epoch = %epoch,
                        "watchdog accepted {} leader assignments",
                        published.len()
                    );
                    next = self.until_shortly_after_epoch_start(now, epoch.next());
                }
                _ => {
                    next = if position.slot.0 <= EARLY_EPOCH_SLOT_THRESHOLD {
                        self.time_settings.slot_duration * EARLY_EPOCH_RETRY_SLOTS
                    } else {
                        LATE_EPOCH_RETRY_PAUSE
                            .min(self.until_shortly_after_epoch_start(now, epoch.next()))
                    };
                }
            }
            info!(
                "waiting {} for the next schedule check",
                humantime::format_duration(next)
            );
        }
    }

    /// Accept a canonical schedule for the epoch: cache it, publish it to
    /// the listeners, persist it, record the agreeing nodes and spawn a
    /// periodic viability re-check for everyone else.
    fn install_schedule(
        self: &Arc<Self>,
        epoch: Epoch,
        schedule: Vec<LeaderAssignment>,
        viable: Vec<String>,
    ) -> Arc<Vec<LeaderAssignment>> {
        let schedule = Arc::new(schedule);
        self.schedules
            .write()
            .unwrap()
            .insert(epoch.0, schedule.clone());
        let _ = self.publisher.send(SchedulePublication {
            epoch,
            assignments: schedule.clone(),
        });
        if let Err(err) = self.store.store(epoch, &schedule) {
            error!(epoch = %epoch, "could not persist the schedule: {}", err);
        }
        // the tip-reporting collaborator expects an encryption key to exist
        // for every persisted epoch
        if let Err(err) = self.store.epoch_key(epoch) {
            error!(epoch = %epoch, "could not mint the schedule encryption key: {}", err);
        }
        // record the agreeing nodes before the re-check tasks start
        // admitting stragglers
        self.set_viable(epoch, viable.clone());
        for node in &self.nodes {
            if viable.iter().any(|name| *name == node.name) {
                continue;
            }
            let watchdog = self.clone();
            let node = node.clone();
            let canonical = schedule.clone();
            tokio::spawn(async move {
                watchdog.recheck_viability(node, epoch, canonical).await;
            });
        }
        schedule
    }

    /// Fan out to the whole fleet for the epoch's schedule. The first
    /// non-empty response becomes the canonical schedule; every other
    /// response is length-compared against it after future-trimming both.
    async fn fetch_from_nodes(
        &self,
        epoch: Epoch,
        now: SystemTime,
    ) -> (Option<Vec<LeaderAssignment>>, Vec<String>) {
        info!(epoch = %epoch, "the schedule for this epoch will be fetched");
        let fetches = self.nodes.iter().map(|node| async move {
            let response = node.api.leaders_schedule().await;
            (node, response)
        });
        let responses = futures::future::join_all(fetches).await;

        let mut canonical: Option<Vec<LeaderAssignment>> = None;
        let mut viable = Vec::new();
        for (node, response) in responses {
            let schedule = match response {
                Ok(schedule) => filter_for_epoch(epoch, schedule),
                Err(err) => {
                    warn!(node = %node.name, "could not fetch the leader schedule: {}", err);
                    continue;
                }
            };
            if schedule.is_empty() {
                warn!(node = %node.name, "node serves no schedule for epoch {}", epoch);
                continue;
            }
            match &canonical {
                None => {
                    canonical = Some(schedule);
                    viable.push(node.name.clone());
                }
                Some(accepted) => {
                    if future_lengths_match(accepted, &schedule, now) {
                        viable.push(node.name.clone());
                    } else {
                        warn!(
                            node = %node.name,
                            "the leader schedule of this node is of different length, \
                             expected {} but was {}",
                            accepted.len(),
                            schedule.len()
                        );
                    }
                }
            }
        }
        (canonical, viable)
    }

    /// Periodically re-check a node that disagreed with the canonical
    /// schedule and admit it to the viable set as soon as its future
    /// portion matches. The task dies at the epoch boundary.
    async fn recheck_viability(
        &self,
        node: Node,
        epoch: Epoch,
        canonical: Arc<Vec<LeaderAssignment>>,
    ) {
        loop {
            let now = SystemTime::now();
            match self.time_settings.position_at(now) {
                Some(position) if position.epoch == epoch => {}
                _ => break,
            }
            info!(node = %node.name, "starting to check schedule viability");
            match node.api.leaders_schedule().await {
                Ok(schedule) => {
                    let schedule = filter_for_epoch(epoch, schedule);
                    if !schedule.is_empty() && future_lengths_match(&canonical, &schedule, now) {
                        info!(node = %node.name, "schedule agrees now, node is viable");
                        self.admit_viable(epoch, &node.name);
                        break;
                    }
                    warn!(
                        node = %node.name,
                        "the leader schedule of this node still disagrees"
                    );
                }
                Err(err) => {
                    warn!(node = %node.name, "could not fetch the leader schedule: {}", err);
                }
            }
            tokio::time::sleep(VIABILITY_RECHECK_PAUSE).await;
        }
    }

    /// Test seam: accept a schedule as if the watch loop had fetched it.
    #[cfg(test)]
    pub(crate) fn install_schedule_for_tests(
        self: &Arc<Self>,
        epoch: Epoch,
        schedule: Vec<LeaderAssignment>,
        viable: Vec<String>,
    ) {
        self.install_schedule(epoch, schedule, viable);
    }

    fn until_shortly_after_epoch_start(&self, now: SystemTime, epoch: Epoch) -> Duration {
        let target = self.time_settings.epoch_start(epoch) + self.time_settings.slot_duration * 3;
        target.duration_since(now).unwrap_or(Duration::ZERO)
    }
}

/// The slice of a raw leadership log that matters for an epoch: sorted by
/// schedule time, restricted to the epoch and to the staking identity.
fn filter_for_epoch(epoch: Epoch, schedule: Vec<LeaderAssignment>) -> Vec<LeaderAssignment> {
    assignments_of_leader(
        STAKING_LEADER_ID,
        assignments_in_epoch(epoch, sorted_by_schedule_time(schedule)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockNodeApi;
    use crate::api::types::tests::assignment_at;
    use crate::monitor::tests::test_node;
    use std::time::UNIX_EPOCH;

    fn time_settings() -> TimeSettings {
        TimeSettings {
            genesis_time: UNIX_EPOCH,
            slot_duration: Duration::from_secs(2),
            // effectively a single never-ending epoch, so wall-clock "now"
            // stays in epoch 0 throughout a test
            slots_per_epoch: u64::MAX / 4,
        }
    }

    fn future_schedule(entries: usize) -> Vec<LeaderAssignment> {
        let base = SystemTime::now() + Duration::from_secs(3600);
        (0..entries)
            .map(|i| assignment_at(0, i as u64, base + Duration::from_secs(2 * i as u64)))
            .collect()
    }

    fn watchdog_with(nodes: Vec<Node>) -> Arc<ScheduleWatchdog> {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = ScheduleStore::open(&db).unwrap();
        Arc::new(ScheduleWatchdog::new(nodes, time_settings(), store))
    }

    #[test]
    fn agreement_is_length_of_the_future_portion() {
        let now = SystemTime::now();
        let past = now - Duration::from_secs(100);
        let future = now + Duration::from_secs(100);
        let canonical = vec![
            assignment_at(0, 0, past),
            assignment_at(0, 1, future),
            assignment_at(0, 2, future + Duration::from_secs(2)),
        ];
        // differently aligned past portion, same future portion
        let candidate = vec![
            assignment_at(0, 1, future + Duration::from_secs(1)),
            assignment_at(0, 2, future + Duration::from_secs(3)),
        ];
        assert!(future_lengths_match(&canonical, &candidate, now));
        assert!(future_lengths_match(&candidate, &canonical, now));
        let short = vec![assignment_at(0, 1, future)];
        assert!(!future_lengths_match(&canonical, &short, now));
    }

    #[tokio::test]
    async fn first_non_empty_response_becomes_canonical() {
        let empty = Arc::new(MockNodeApi::new());
        let full = Arc::new(MockNodeApi::with_schedule(future_schedule(5)));
        let nodes = vec![test_node("a", empty), test_node("b", full)];
        let watchdog = watchdog_with(nodes);
        let (canonical, viable) = watchdog
            .fetch_from_nodes(Epoch(0), SystemTime::now())
            .await;
        assert_eq!(canonical.unwrap().len(), 5);
        assert_eq!(viable, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn disagreeing_node_is_excluded_from_the_viable_set() {
        let five_a = Arc::new(MockNodeApi::with_schedule(future_schedule(5)));
        let five_b = Arc::new(MockNodeApi::with_schedule(future_schedule(5)));
        let four = Arc::new(MockNodeApi::with_schedule(future_schedule(4)));
        let nodes = vec![
            test_node("a", five_a),
            test_node("b", five_b),
            test_node("c", four),
        ];
        let watchdog = watchdog_with(nodes);
        let (canonical, viable) = watchdog
            .fetch_from_nodes(Epoch(0), SystemTime::now())
            .await;
        assert_eq!(canonical.unwrap().len(), 5);
        assert_eq!(viable, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn installed_schedule_is_published_and_cached() {
        let api = Arc::new(MockNodeApi::new());
        let watchdog = watchdog_with(vec![test_node("a", api)]);
        let mut listener = watchdog.subscribe();
        let schedule = future_schedule(3);
        watchdog.install_schedule(Epoch(0), schedule.clone(), vec!["a".to_string()]);

        let publication = listener.recv().await.unwrap();
        assert_eq!(publication.epoch, Epoch(0));
        assert_eq!(*publication.assignments, schedule);

        // the cache hands out the same object for the whole epoch
        let first = watchdog.schedule_for(Epoch(0)).unwrap();
        let second = watchdog.schedule_for(Epoch(0)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(watchdog.viable_leader_nodes(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn reconnecting_node_becomes_viable_once_lengths_match() {
        let api = Arc::new(MockNodeApi::with_schedule(future_schedule(4)));
        let node = test_node("c", api.clone());
        let watchdog = watchdog_with(vec![node.clone()]);
        let canonical = Arc::new(future_schedule(5));

        // first attempt disagrees (4 vs 5); fix the node's schedule and
        // check again, as the periodic re-check task would
        let now = SystemTime::now();
        assert!(!future_lengths_match(
            &canonical,
            &api.schedule.lock().unwrap().clone(),
            now
        ));
        *api.schedule.lock().unwrap() = future_schedule(5);
        watchdog.recheck_viability(node, Epoch(0), canonical).await;
        assert_eq!(watchdog.viable_leader_nodes(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn admitting_a_node_twice_keeps_the_set_deduplicated() {
        let watchdog = watchdog_with(Vec::new());
        watchdog.admit_viable(Epoch(0), "a");
        watchdog.admit_viable(Epoch(0), "a");
        assert_eq!(watchdog.viable_leader_nodes(), vec!["a".to_string()]);
    }
}
