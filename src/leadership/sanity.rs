//! Sanity checks around scheduled blocks.
//!
//! Shortly before every scheduled assignment the whole fleet is audited
//! under the leader mutex: the elected node must hold exactly one
//! enrolment and every other node must hold none. Anything else is
//! repaired on the spot. An adversarial fork is the one failure that must
//! never happen, so the audit is deliberately paranoid.

use super::{demote_leader, CurrentLeader, LeaderJury, DEMOTION_ATTEMPTS};
use crate::api::{
    assignments_in_epoch, assignments_scheduled_after, sorted_by_schedule_time, EnclaveLeaderId,
};
use crate::monitor::Node;
use crate::schedule::SchedulePublication;

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The audit runs this long before each scheduled assignment.
const SANITY_LEAD_TIME: Duration = Duration::from_secs(60);

/// Assignments closer than this to now are skipped; their checks would
/// overlap with one another.
const MIN_ASSIGNMENT_DISTANCE: Duration = Duration::from_secs(2 * 60);

/// Breather after all assignments of a publication have been handled.
const POST_SCHEDULE_PAUSE: Duration = Duration::from_secs(60);

const CLOCK_FAILURE_BACKOFF: Duration = Duration::from_secs(30 * 60);

impl LeaderJury {
    /// Consumes schedule publications and audits the fleet one minute
    /// before each scheduled assignment.
    pub async fn sanity_loop(
        self: Arc<Self>,
        mut schedules: broadcast::Receiver<SchedulePublication>,
    ) {
        loop {
            let publication = match schedules.recv().await {
                Ok(publication) => publication,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("lagged behind the watchdog, skipped {} publications", missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    error!("the schedule watchdog stopped publishing");
                    return;
                }
            };
            let now = SystemTime::now();
            let position = match self.settings.time_settings.position_at(now) {
                Some(position) => position,
                None => {
                    error!("sanity check loop cannot determine the current slot");
                    tokio::time::sleep(CLOCK_FAILURE_BACKOFF).await;
                    continue;
                }
            };
            let upcoming = assignments_scheduled_after(
                now + MIN_ASSIGNMENT_DISTANCE,
                &sorted_by_schedule_time(assignments_in_epoch(
                    position.epoch,
                    publication.assignments.as_ref().clone(),
                )),
            );
            debug!("started sanity checking for {} assignments ahead", upcoming.len());
            for assignment in &upcoming {
                let scheduled: SystemTime = assignment.scheduled_at_time.into();
                let wait = scheduled
                    .duration_since(SystemTime::now())
                    .ok()
                    .and_then(|until_block| until_block.checked_sub(SANITY_LEAD_TIME));
                match wait {
                    Some(wait) if !wait.is_zero() => {
                        info!(
                            "waiting {} for the next sanity check",
                            humantime::format_duration(wait)
                        );
                        tokio::time::sleep(wait).await;
                        info!(
                            "sanity check before the assignment at {}",
                            assignment.scheduled_at_time
                        );
                        self.sanity_sweep_now().await;
                    }
                    // too close to the previous assignment
                    _ => continue,
                }
            }
            tokio::time::sleep(POST_SCHEDULE_PAUSE).await;
        }
    }

    /// Audit and repair the enrolment state of the whole fleet under the
    /// leader mutex.
    pub async fn sanity_sweep_now(&self) {
        let mut leader = self.leader.lock().await;
        self.sanity_sweep(&mut leader).await;
    }

    pub(super) async fn sanity_sweep(&self, leader: &mut Option<CurrentLeader>) {
        // list enrolments of all nodes in parallel; repairs are applied
        // sequentially in name order
        let polls = self
            .nodes
            .values()
            .map(|node| async move { (node, node.api.registered_leaders().await) });
        let responses = futures::future::join_all(polls).await;
        for (node, response) in responses {
            let ids = match response {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(node = %node.name, "sanity check could not list enrolments: {}", err);
                    continue;
                }
            };
            let holds_leader_role = leader
                .as_ref()
                .map(|leader| leader.name == node.name)
                .unwrap_or(false);
            if holds_leader_role {
                self.repair_leader_node(node, ids, leader).await;
            } else {
                Self::repair_passive_node(node, ids).await;
            }
        }
    }

    /// The elected node must hold exactly one enrolment: re-promote it if
    /// it lost its enrolment, demote every enrolment except the elected
    /// one if it holds several.
    async fn repair_leader_node(
        &self,
        node: &Node,
        ids: Vec<EnclaveLeaderId>,
        leader: &mut Option<CurrentLeader>,
    ) {
        match ids.len() {
            0 => {
                warn!(node = %node.name, "node is not promoted to leader as expected");
                match node.api.post_leader(&self.cert).await {
                    Ok(enrolment) => {
                        *leader = Some(CurrentLeader {
                            name: node.name.clone(),
                            enrolment,
                        });
                        info!(
                            node = %node.name,
                            "node is elected and has enrolment id={}", enrolment
                        );
                    }
                    Err(err) => {
                        error!(node = %node.name, "could not re-promote the leader: {}", err);
                    }
                }
            }
            1 => info!(node = %node.name, "node is leader as expected"),
            extra => {
                warn!(
                    node = %node.name,
                    "node has more than one enrolment registered ({})", extra
                );
                let keep = leader.as_ref().map(|leader| leader.enrolment);
                for id in ids {
                    if Some(id) != keep {
                        demote_leader(node, id, DEMOTION_ATTEMPTS).await;
                    }
                }
            }
        }
    }

    /// A node without the leader role must hold no enrolment at all.
    async fn repair_passive_node(node: &Node, ids: Vec<EnclaveLeaderId>) {
        if ids.is_empty() {
            info!(node = %node.name, "ok");
            return;
        }
        warn!(
            node = %node.name,
            "node is in leader mode while the jury promoted another node"
        );
        for id in ids {
            demote_leader(node, id, DEMOTION_ATTEMPTS).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockNodeApi;
    use crate::blockcfg::TimeSettings;
    use crate::leadership::JurySettings;
    use crate::monitor::tests::test_node;
    use crate::schedule::{ScheduleStore, ScheduleWatchdog};
    use crate::secure::LeaderCertificate;

    fn time_settings() -> TimeSettings {
        TimeSettings {
            genesis_time: std::time::UNIX_EPOCH,
            slot_duration: Duration::from_secs(2),
            slots_per_epoch: u64::MAX / 4,
        }
    }

    fn jury_for(nodes: Vec<Node>) -> Arc<LeaderJury> {
        let settings = time_settings();
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = ScheduleStore::open(&db).unwrap();
        let watchdog = Arc::new(ScheduleWatchdog::new(nodes.clone(), settings.clone(), store));
        Arc::new(
            LeaderJury::new(
                nodes,
                watchdog,
                LeaderCertificate::dummy(),
                JurySettings {
                    window: 3,
                    exclusion_zone: Duration::from_secs(30),
                    pre_turnover_exclusion_slots: 60,
                    time_settings: settings,
                },
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn leader_that_lost_its_enrolment_is_re_promoted() {
        let api_a = Arc::new(MockNodeApi::new());
        let jury = jury_for(vec![test_node("a", api_a.clone())]);
        *jury.leader.lock().await = Some(CurrentLeader {
            name: "a".to_string(),
            enrolment: EnclaveLeaderId(1),
        });

        jury.sanity_sweep_now().await;

        assert_eq!(api_a.enrolments().len(), 1);
        let seat = jury.leader.lock().await.clone().unwrap();
        assert_eq!(seat.name, "a");
        assert_eq!(seat.enrolment, api_a.enrolments()[0]);
    }

    #[tokio::test]
    async fn extra_enrolments_on_the_leader_are_demoted() {
        let api_a = Arc::new(MockNodeApi::with_leaders(&[4, 5, 6]));
        let jury = jury_for(vec![test_node("a", api_a.clone())]);
        *jury.leader.lock().await = Some(CurrentLeader {
            name: "a".to_string(),
            enrolment: EnclaveLeaderId(5),
        });

        jury.sanity_sweep_now().await;

        assert_eq!(api_a.enrolments(), vec![EnclaveLeaderId(5)]);
    }

    #[tokio::test]
    async fn passive_nodes_are_stripped_of_all_enrolments() {
        let api_a = Arc::new(MockNodeApi::with_leaders(&[2]));
        let api_b = Arc::new(MockNodeApi::with_leaders(&[7, 8]));
        let jury = jury_for(vec![
            test_node("a", api_a.clone()),
            test_node("b", api_b.clone()),
        ]);
        *jury.leader.lock().await = Some(CurrentLeader {
            name: "a".to_string(),
            enrolment: EnclaveLeaderId(2),
        });

        jury.sanity_sweep_now().await;

        // single-leader invariant: exactly one enrolment across the fleet
        assert_eq!(api_a.enrolments(), vec![EnclaveLeaderId(2)]);
        assert!(api_b.enrolments().is_empty());
    }

    #[tokio::test]
    async fn sweep_without_an_elected_leader_clears_everything() {
        let api_a = Arc::new(MockNodeApi::with_leaders(&[2]));
        let jury = jury_for(vec![test_node("a", api_a.clone())]);

        jury.sanity_sweep_now().await;

        assert!(api_a.enrolments().is_empty());
    }
}
