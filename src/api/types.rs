//! Wire types of the node REST interface.
//!
//! The shapes mirror what the node serves under `/api/v0`: the node
//! statistics document, the enclave leader identifiers and the leadership
//! log entries ("leader assignments") of the current epoch.

use crate::blockcfg::{Epoch, EpochPosition};
use crate::time::SystemTime;

use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a leader enrolment on a node. Ids are handed out by the
/// node when a leader certificate is posted and are only meaningful for
/// that node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnclaveLeaderId(pub u64);

impl fmt::Display for EnclaveLeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The enclave leader id under which the staking identity signs; leadership
/// log entries of other ids belong to other certificates and are ignored.
pub const STAKING_LEADER_ID: EnclaveLeaderId = EnclaveLeaderId(1);

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeState {
    StartingRestServer,
    PreparingStorage,
    PreparingBlock0,
    Bootstrapping,
    StartingWorkers,
    Running,
}

/// Node statistics document as served by the node.
///
/// Most fields are absent while the node is still bootstrapping, hence the
/// pervasive `Option`s.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatsDto {
    pub state: NodeState,
    #[serde(default)]
    pub uptime: Option<u64>,
    #[serde(default)]
    pub tx_recv_cnt: Option<u64>,
    #[serde(default)]
    pub block_recv_cnt: Option<u64>,
    #[serde(default)]
    pub last_block_height: Option<String>,
    #[serde(default)]
    pub last_block_hash: Option<String>,
    #[serde(default)]
    pub last_block_date: Option<EpochPosition>,
}

/// A statistics snapshot of a running node, one polling cycle's worth.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatistic {
    pub last_block_height: BigInt,
    pub last_block_hash: String,
    pub last_block_date: EpochPosition,
    pub uptime: Duration,
    pub tx_recv_cnt: u64,
    pub block_recv_cnt: u64,
}

/// Outcome of a statistics poll: either a full snapshot, or the node told
/// us it is not ready yet.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStats {
    Bootstrapping,
    Running(NodeStatistic),
}

impl NodeStatsDto {
    /// Interpret the raw document. A node that does not report itself as
    /// `Running`, or that omits any of the block fields, counts as
    /// bootstrapping.
    pub fn into_stats(self) -> NodeStats {
        if self.state != NodeState::Running {
            return NodeStats::Bootstrapping;
        }
        let height = self
            .last_block_height
            .as_deref()
            .and_then(|h| h.parse::<BigInt>().ok());
        match (height, self.last_block_hash, self.last_block_date) {
            (Some(last_block_height), Some(last_block_hash), Some(last_block_date)) => {
                NodeStats::Running(NodeStatistic {
                    last_block_height,
                    last_block_hash,
                    last_block_date,
                    uptime: Duration::from_secs(self.uptime.unwrap_or(0)),
                    tx_recv_cnt: self.tx_recv_cnt.unwrap_or(0),
                    block_recv_cnt: self.block_recv_cnt.unwrap_or(0),
                })
            }
            _ => NodeStats::Bootstrapping,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadershipLogStatus {
    Pending,
    Block,
    Rejected,
}

/// One scheduled block-production opportunity out of the node's leadership
/// log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderAssignment {
    pub created_at_time: SystemTime,
    pub scheduled_at_time: SystemTime,
    pub scheduled_at_date: EpochPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at_time: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_time: Option<SystemTime>,
    pub enclave_leader_id: EnclaveLeaderId,
    pub status: LeadershipLogStatus,
}

/// Sort assignments ascending by their scheduled wall-clock time.
pub fn sorted_by_schedule_time(mut assignments: Vec<LeaderAssignment>) -> Vec<LeaderAssignment> {
    assignments.sort_by_key(|a| a.scheduled_at_time);
    assignments
}

/// Keep only assignments falling in the given epoch.
pub fn assignments_in_epoch(
    epoch: Epoch,
    assignments: Vec<LeaderAssignment>,
) -> Vec<LeaderAssignment> {
    assignments
        .into_iter()
        .filter(|a| a.scheduled_at_date.epoch == epoch)
        .collect()
}

/// Keep only assignments of the given enclave leader id.
pub fn assignments_of_leader(
    id: EnclaveLeaderId,
    assignments: Vec<LeaderAssignment>,
) -> Vec<LeaderAssignment> {
    assignments
        .into_iter()
        .filter(|a| a.enclave_leader_id == id)
        .collect()
}

/// The future portion of a schedule: assignments whose scheduled time is at
/// or after the given instant.
pub fn assignments_scheduled_after(
    at: std::time::SystemTime,
    assignments: &[LeaderAssignment],
) -> Vec<LeaderAssignment> {
    let at = SystemTime::from(at);
    assignments
        .iter()
        .filter(|a| a.scheduled_at_time >= at)
        .cloned()
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blockcfg::EpochSlotOffset;
    use std::time::{Duration, SystemTime as StdSystemTime, UNIX_EPOCH};

    pub(crate) fn assignment_at(epoch: u64, slot: u64, at: StdSystemTime) -> LeaderAssignment {
        LeaderAssignment {
            created_at_time: SystemTime::from(UNIX_EPOCH),
            scheduled_at_time: SystemTime::from(at),
            scheduled_at_date: EpochPosition {
                epoch: Epoch(epoch),
                slot: EpochSlotOffset(slot),
            },
            wake_at_time: None,
            finished_at_time: None,
            enclave_leader_id: STAKING_LEADER_ID,
            status: LeadershipLogStatus::Pending,
        }
    }

    #[test]
    fn bootstrapping_state_yields_no_statistics() {
        let dto = NodeStatsDto {
            state: NodeState::Bootstrapping,
            uptime: Some(3),
            tx_recv_cnt: None,
            block_recv_cnt: None,
            last_block_height: None,
            last_block_hash: None,
            last_block_date: None,
        };
        assert_eq!(dto.into_stats(), NodeStats::Bootstrapping);
    }

    #[test]
    fn running_state_with_missing_block_fields_counts_as_bootstrapping() {
        let dto = NodeStatsDto {
            state: NodeState::Running,
            uptime: Some(3),
            tx_recv_cnt: Some(1),
            block_recv_cnt: Some(2),
            last_block_height: None,
            last_block_hash: Some("cafe".to_string()),
            last_block_date: Some("0.1".parse().unwrap()),
        };
        assert_eq!(dto.into_stats(), NodeStats::Bootstrapping);
    }

    #[test]
    fn running_state_parses_the_block_height() {
        let dto = NodeStatsDto {
            state: NodeState::Running,
            uptime: Some(120),
            tx_recv_cnt: Some(7),
            block_recv_cnt: Some(9),
            last_block_height: Some("123456789012345678901234567890".to_string()),
            last_block_hash: Some("cafebabe".to_string()),
            last_block_date: Some("12.345".parse().unwrap()),
        };
        match dto.into_stats() {
            NodeStats::Running(stat) => {
                assert_eq!(
                    stat.last_block_height,
                    "123456789012345678901234567890".parse::<BigInt>().unwrap()
                );
                assert_eq!(stat.uptime, Duration::from_secs(120));
            }
            other => panic!("expected running statistics, got {:?}", other),
        }
    }

    #[test]
    fn future_trimming_keeps_assignments_at_or_after_the_instant() {
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        let schedule = vec![
            assignment_at(0, 1, base),
            assignment_at(0, 5, base + Duration::from_secs(10)),
            assignment_at(0, 9, base + Duration::from_secs(18)),
        ];
        let future = assignments_scheduled_after(base + Duration::from_secs(10), &schedule);
        assert_eq!(future.len(), 2);
        assert_eq!(future[0].scheduled_at_date.slot, EpochSlotOffset(5));
    }

    #[test]
    fn epoch_and_leader_filters() {
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        let mut schedule = vec![
            assignment_at(1, 0, base),
            assignment_at(2, 0, base + Duration::from_secs(4)),
        ];
        schedule[1].enclave_leader_id = EnclaveLeaderId(2);
        let in_epoch = assignments_in_epoch(Epoch(1), schedule.clone());
        assert_eq!(in_epoch.len(), 1);
        let of_leader = assignments_of_leader(STAKING_LEADER_ID, schedule);
        assert_eq!(of_leader.len(), 1);
        assert_eq!(of_leader[0].scheduled_at_date.epoch, Epoch(1));
    }

    #[test]
    fn sorting_is_by_schedule_time() {
        let base = UNIX_EPOCH + Duration::from_secs(1_000);
        let schedule = vec![
            assignment_at(0, 9, base + Duration::from_secs(18)),
            assignment_at(0, 1, base),
            assignment_at(0, 5, base + Duration::from_secs(10)),
        ];
        let sorted = sorted_by_schedule_time(schedule);
        let slots: Vec<u64> = sorted.iter().map(|a| a.scheduled_at_date.slot.0).collect();
        assert_eq!(slots, vec![1, 5, 9]);
    }

    #[test]
    fn assignment_json_round_trip() {
        let assignment = assignment_at(7, 77, UNIX_EPOCH + Duration::from_secs(42));
        let json = serde_json::to_string(&assignment).unwrap();
        let decoded: LeaderAssignment = serde_json::from_str(&json).unwrap();
        assert_eq!(assignment, decoded);
    }
}
