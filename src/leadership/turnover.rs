//! Epoch turnover handling.
//!
//! The node whose enrolment is live at slot 0 of the new epoch wins the
//! leader role for it. Shortly before the turnover every candidate is
//! promoted, which maximises the probability that at least one of them is
//! ready in time; the sanity sweep right after the turnover converges the
//! fleet back to exactly one enrolment.

use super::LeaderJury;
use crate::blockcfg::{EpochPosition, EpochSlotOffset, TimeSettings};
use crate::monitor::Node;
use crate::secure::LeaderCertificate;

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

/// The promotion date is pushed this far past the end of the last
/// scheduled slot, so the final minting of the epoch is not perturbed.
const POST_ASSIGNMENT_SLACK: Duration = Duration::from_millis(500);

/// Minimum pause between promotion retries, in slot durations.
const PROMOTION_RETRY_SLOTS: u32 = 5;

/// Slots of the new epoch that are allowed to pass before the
/// post-turnover sanity sweep runs.
const POST_TURNOVER_SLACK_SLOTS: u32 = 2;

/// Pause before the next turnover check once an epoch has been handled.
const TURNOVER_CYCLE_PAUSE: Duration = Duration::from_secs(10 * 60);

const CLOCK_FAILURE_BACKOFF: Duration = Duration::from_secs(30 * 60);

impl LeaderJury {
    /// Handles the epoch turnover, over and over again.
    pub async fn turnover_loop(self: Arc<Self>) {
        loop {
            let now = SystemTime::now();
            let settings = self.settings.time_settings.clone();
            let position = match settings.position_at(now) {
                Some(position) => position,
                None => {
                    error!("turn over loop cannot determine the current slot");
                    tokio::time::sleep(CLOCK_FAILURE_BACKOFF).await;
                    continue;
                }
            };
            let promotion_date = self.promotion_date(position);
            if let Ok(wait) = promotion_date.duration_since(now) {
                info!(
                    "waiting {} for handling the turn over",
                    humantime::format_duration(wait)
                );
                tokio::time::sleep(wait).await;
            }

            let next_epoch_start = settings.epoch_start(position.epoch.next());
            self.promote_all_candidates(next_epoch_start).await;

            // let the first slots of the new epoch pass before auditing
            let resume_at = settings.slot_end(EpochPosition {
                epoch: position.epoch.next(),
                slot: EpochSlotOffset(0),
            }) + settings.slot_duration * POST_TURNOVER_SLACK_SLOTS;
            if let Ok(wait) = resume_at.duration_since(SystemTime::now()) {
                tokio::time::sleep(wait).await;
            }
            self.sanity_sweep_now().await;

            tokio::time::sleep(TURNOVER_CYCLE_PAUSE).await;
        }
    }

    /// When all candidates shall be promoted for the coming turnover:
    /// `pre_turnover_exclusion_slots` before the next epoch, or right
    /// after the last scheduled assignment of the current epoch if that
    /// assignment falls into the exclusion window.
    fn promotion_date(&self, position: EpochPosition) -> SystemTime {
        let settings = &self.settings.time_settings;
        let next_epoch_start = settings.epoch_start(position.epoch.next());
        let mut promotion = next_epoch_start
            - settings.slot_duration * self.settings.pre_turnover_exclusion_slots as u32;
        if let Some(schedule) = self.watchdog.schedule_for(position.epoch) {
            if let Some(last) = schedule.last() {
                let last_slot_end = settings.slot_end(last.scheduled_at_date);
                if last_slot_end > promotion {
                    promotion = last_slot_end + POST_ASSIGNMENT_SLACK;
                }
            }
        }
        promotion
    }

    /// Promote every candidate that does not already hold the leader
    /// role. Each promotion retries on its own until the turnover is too
    /// close for another attempt to matter.
    async fn promote_all_candidates(&self, next_epoch_start: SystemTime) {
        let current = self.leader.lock().await.clone();
        for (name, node) in &self.nodes {
            let is_current = current
                .as_ref()
                .map(|leader| leader.name == *name)
                .unwrap_or(false);
            if is_current {
                continue;
            }
            let node = node.clone();
            let cert = self.cert.clone();
            let settings = self.settings.time_settings.clone();
            tokio::spawn(async move {
                promote_node(node, cert, next_epoch_start, settings).await;
            });
        }
    }
}

/// Promote the given node for the turnover. Should an attempt fail, it is
/// retried every `max(time left, 5 slot durations)` until the turnover is
/// less than one slot away and another attempt would be useless.
async fn promote_node(
    node: Node,
    cert: LeaderCertificate,
    next_epoch_start: SystemTime,
    settings: TimeSettings,
) {
    loop {
        match node.api.post_leader(&cert).await {
            Ok(enrolment) => {
                info!(
                    node = %node.name,
                    "node is promoted for the turn over, enrolment id={}", enrolment
                );
                return;
            }
            Err(err) => {
                warn!(node = %node.name, "could not promote the node: {}", err);
            }
        }
        let deadline = next_epoch_start - settings.slot_duration;
        let now = SystemTime::now();
        if now > deadline {
            return;
        }
        let time_left = deadline.duration_since(now).unwrap_or_default();
        tokio::time::sleep(time_left.max(settings.slot_duration * PROMOTION_RETRY_SLOTS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::MockNodeApi;
    use crate::api::types::tests::assignment_at;
    use crate::api::EnclaveLeaderId;
    use crate::blockcfg::Epoch;
    use crate::leadership::{CurrentLeader, JurySettings};
    use crate::monitor::tests::test_node;
    use crate::schedule::{ScheduleStore, ScheduleWatchdog};
    use std::sync::atomic::Ordering;
    use std::time::UNIX_EPOCH;

    fn small_epoch_settings() -> TimeSettings {
        TimeSettings {
            genesis_time: UNIX_EPOCH,
            slot_duration: Duration::from_secs(2),
            slots_per_epoch: 100,
        }
    }

    fn jury_with_settings(nodes: Vec<Node>, settings: TimeSettings) -> Arc<LeaderJury> {
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

    fn position(epoch: u64, slot: u64) -> EpochPosition {
        EpochPosition {
            epoch: Epoch(epoch),
            slot: EpochSlotOffset(slot),
        }
    }

    #[tokio::test]
    async fn promotion_date_is_the_exclusion_window_start() {
        let settings = small_epoch_settings();
        let api = Arc::new(MockNodeApi::new());
        let jury = jury_with_settings(vec![test_node("a", api)], settings.clone());
        let date = jury.promotion_date(position(5, 10));
        // epoch 6 starts at 1200 s; 60 slots of 2 s earlier is 1080 s
        assert_eq!(date, UNIX_EPOCH + Duration::from_secs(1080));
    }

    #[tokio::test]
    async fn promotion_date_moves_past_the_last_scheduled_assignment() {
        let settings = small_epoch_settings();
        let api = Arc::new(MockNodeApi::new());
        let jury = jury_with_settings(vec![test_node("a", api)], settings.clone());
        // last assignment of epoch 5 sits in slot 95, inside the exclusion
        // window; its slot ends at 1192 s
        jury.watchdog.install_schedule_for_tests(
            Epoch(5),
            vec![assignment_at(5, 95, UNIX_EPOCH + Duration::from_secs(1190))],
            vec!["a".to_string()],
        );
        let date = jury.promotion_date(position(5, 10));
        assert_eq!(
            date,
            UNIX_EPOCH + Duration::from_secs(1192) + Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn turnover_promotes_every_candidate_except_the_leader() {
        let api_a = Arc::new(MockNodeApi::with_leaders(&[1]));
        let api_b = Arc::new(MockNodeApi::new());
        let api_c = Arc::new(MockNodeApi::new());
        let nodes = vec![
            test_node("a", api_a.clone()),
            test_node("b", api_b.clone()),
            test_node("c", api_c.clone()),
        ];
        let jury = jury_with_settings(nodes, small_epoch_settings());
        *jury.leader.lock().await = Some(CurrentLeader {
            name: "a".to_string(),
            enrolment: EnclaveLeaderId(1),
        });

        let next_epoch_start = SystemTime::now() + Duration::from_secs(120);
        jury.promote_all_candidates(next_epoch_start).await;
        // give the spawned promotion tasks a chance to run
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(api_a.post_leader_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api_b.post_leader_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api_c.post_leader_calls.load(Ordering::SeqCst), 1);

        // the sweep right after the turnover converges back to exactly one
        // enrolment across the fleet
        jury.sanity_sweep_now().await;
        let total: usize = [&api_a, &api_b, &api_c]
            .iter()
            .map(|api| api.enrolments().len())
            .sum();
        assert_eq!(total, 1);
        assert_eq!(api_a.enrolments(), vec![EnclaveLeaderId(1)]);
    }
}
