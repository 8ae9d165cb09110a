//! Access to the administrative REST interface of the supervised nodes.

use crate::secure::LeaderCertificate;

use async_trait::async_trait;
use thiserror::Error;

pub mod client;
#[cfg(test)]
pub mod mock;
pub mod types;

pub use self::client::RestNodeApi;
pub use self::types::{
    assignments_in_epoch, assignments_of_leader, assignments_scheduled_after,
    sorted_by_schedule_time, EnclaveLeaderId, LeaderAssignment, LeadershipLogStatus, NodeState,
    NodeStatistic, NodeStats, NodeStatsDto, STAKING_LEADER_ID,
};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("node address '{addr}' isn't a valid address base")]
    HostAddrNotBase { addr: url::Url },
    #[error("failed to build an HTTP client")]
    Client(#[source] reqwest::Error),
    #[error("invalid request")]
    Request(#[source] reqwest::Error),
    #[error("could not deserialize the response as JSON")]
    Json(#[source] reqwest::Error),
    #[error("connection with the node timed out")]
    Timeout,
    #[error("node rejected request because of invalid parameters")]
    InvalidParams(#[source] reqwest::Error),
    #[error("node internal error")]
    InternalError(#[source] reqwest::Error),
    #[error("redirecting error while connecting with node")]
    Redirection(#[source] reqwest::Error),
    #[error("communication with node failed in unexpected way")]
    UnexpectedError(#[source] reqwest::Error),
}

/// The per-node remote operations the supervisor relies on.
///
/// One implementation talks HTTP to a real node; tests plug in an
/// in-memory fleet.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Fetch the node's statistics document.
    async fn node_statistics(&self) -> Result<NodeStats, RestError>;

    /// Fetch the node's leadership log for the current epoch.
    async fn leaders_schedule(&self) -> Result<Vec<LeaderAssignment>, RestError>;

    /// List the leader enrolments currently registered on the node.
    async fn registered_leaders(&self) -> Result<Vec<EnclaveLeaderId>, RestError>;

    /// Register the leader certificate; the node answers with the id of the
    /// new enrolment.
    async fn post_leader(&self, cert: &LeaderCertificate) -> Result<EnclaveLeaderId, RestError>;

    /// Remove the enrolment with the given id. Returns whether the node
    /// actually had it.
    async fn remove_registered_leader(&self, id: EnclaveLeaderId) -> Result<bool, RestError>;

    /// Ask the node process to shut itself down.
    async fn shutdown(&self) -> Result<(), RestError>;
}
