//! In-memory node fleet used by the tests.

use super::types::{EnclaveLeaderId, LeaderAssignment, NodeStats};
use super::{NodeApi, RestError};
use crate::secure::LeaderCertificate;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

/// A scriptable [`NodeApi`]: tests preload state and flip failure flags,
/// the supervisor under test mutates enrolments exactly as it would on a
/// live node, and every remote call is counted.
#[derive(Default)]
pub struct MockNodeApi {
    pub stats: Mutex<Option<NodeStats>>,
    pub schedule: Mutex<Vec<LeaderAssignment>>,
    pub leaders: Mutex<Vec<EnclaveLeaderId>>,
    pub next_enrolment: AtomicU64,
    pub fail_post_leader: AtomicBool,
    pub fail_remove_leader: AtomicBool,
    pub post_leader_calls: AtomicU64,
    pub remove_leader_calls: AtomicU64,
    pub shutdown_calls: Mutex<Vec<Instant>>,
}

impl MockNodeApi {
    pub fn new() -> Self {
        MockNodeApi {
            next_enrolment: AtomicU64::new(1),
            ..Default::default()
        }
    }

    pub fn with_leaders(ids: &[u64]) -> Self {
        let mock = Self::new();
        *mock.leaders.lock().unwrap() = ids.iter().map(|id| EnclaveLeaderId(*id)).collect();
        mock.next_enrolment
            .store(ids.iter().max().copied().unwrap_or(0) + 1, Ordering::SeqCst);
        mock
    }

    pub fn with_schedule(schedule: Vec<LeaderAssignment>) -> Self {
        let mock = Self::new();
        *mock.schedule.lock().unwrap() = schedule;
        mock
    }

    pub fn enrolments(&self) -> Vec<EnclaveLeaderId> {
        self.leaders.lock().unwrap().clone()
    }

    pub fn shutdown_count(&self) -> usize {
        self.shutdown_calls.lock().unwrap().len()
    }
}

#[async_trait]
impl NodeApi for MockNodeApi {
    async fn node_statistics(&self) -> Result<NodeStats, RestError> {
        self.stats
            .lock()
            .unwrap()
            .clone()
            .ok_or(RestError::Timeout)
    }

    async fn leaders_schedule(&self) -> Result<Vec<LeaderAssignment>, RestError> {
        Ok(self.schedule.lock().unwrap().clone())
    }

    async fn registered_leaders(&self) -> Result<Vec<EnclaveLeaderId>, RestError> {
        Ok(self.leaders.lock().unwrap().clone())
    }

    async fn post_leader(&self, _cert: &LeaderCertificate) -> Result<EnclaveLeaderId, RestError> {
        self.post_leader_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_post_leader.load(Ordering::SeqCst) {
            return Err(RestError::Timeout);
        }
        let id = EnclaveLeaderId(self.next_enrolment.fetch_add(1, Ordering::SeqCst));
        self.leaders.lock().unwrap().push(id);
        Ok(id)
    }

    async fn remove_registered_leader(&self, id: EnclaveLeaderId) -> Result<bool, RestError> {
        self.remove_leader_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove_leader.load(Ordering::SeqCst) {
            return Err(RestError::Timeout);
        }
        let mut leaders = self.leaders.lock().unwrap();
        let before = leaders.len();
        leaders.retain(|registered| *registered != id);
        Ok(leaders.len() != before)
    }

    async fn shutdown(&self) -> Result<(), RestError> {
        self.shutdown_calls.lock().unwrap().push(Instant::now());
        Ok(())
    }
}
