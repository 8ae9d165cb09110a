//! HTTP client for the node REST interface under `/api/v0`.

use super::types::{EnclaveLeaderId, LeaderAssignment, NodeStats, NodeStatsDto};
use super::{NodeApi, RestError};
use crate::secure::LeaderCertificate;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use std::time::Duration;

/// REST implementation of [`NodeApi`] for one node.
///
/// The request timeout is fixed at construction; it covers the whole
/// request including connection setup and body download.
pub struct RestNodeApi {
    client: Client,
    base: Url,
}

impl RestNodeApi {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, RestError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RestError::Client)?;
        // reject bases like `mailto:` urls early, they cannot carry path
        // segments
        if base.cannot_be_a_base() {
            return Err(RestError::HostAddrNotBase { addr: base });
        }
        Ok(RestNodeApi { client, base })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, RestError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map(|mut path| {
                path.extend(segments);
            })
            .map_err(|_| RestError::HostAddrNotBase {
                addr: self.base.clone(),
            })?;
        Ok(url)
    }

    fn classify(err: reqwest::Error) -> RestError {
        if err.is_timeout() {
            RestError::Timeout
        } else if let Some(status) = err.status() {
            if status.is_client_error() {
                RestError::InvalidParams(err)
            } else if status.is_server_error() {
                RestError::InternalError(err)
            } else if status.is_redirection() {
                RestError::Redirection(err)
            } else {
                RestError::UnexpectedError(err)
            }
        } else {
            RestError::UnexpectedError(err)
        }
    }

    fn ok_response(response: Result<Response, reqwest::Error>) -> Result<Response, RestError> {
        response
            .and_then(|response| response.error_for_status())
            .map_err(Self::classify)
    }
}

#[async_trait]
impl NodeApi for RestNodeApi {
    async fn node_statistics(&self) -> Result<NodeStats, RestError> {
        let url = self.url(&["v0", "node", "stats"])?;
        let response = Self::ok_response(self.client.get(url).send().await)?;
        let dto: NodeStatsDto = response.json().await.map_err(RestError::Json)?;
        Ok(dto.into_stats())
    }

    async fn leaders_schedule(&self) -> Result<Vec<LeaderAssignment>, RestError> {
        let url = self.url(&["v0", "leaders", "logs"])?;
        let response = Self::ok_response(self.client.get(url).send().await)?;
        response.json().await.map_err(RestError::Json)
    }

    async fn registered_leaders(&self) -> Result<Vec<EnclaveLeaderId>, RestError> {
        let url = self.url(&["v0", "leaders"])?;
        let response = Self::ok_response(self.client.get(url).send().await)?;
        response.json().await.map_err(RestError::Json)
    }

    async fn post_leader(&self, cert: &LeaderCertificate) -> Result<EnclaveLeaderId, RestError> {
        let url = self.url(&["v0", "leaders"])?;
        let response = Self::ok_response(self.client.post(url).json(cert.secret()).send().await)?;
        response.json().await.map_err(RestError::Json)
    }

    async fn remove_registered_leader(&self, id: EnclaveLeaderId) -> Result<bool, RestError> {
        let url = self.url(&["v0", "leaders", &id.to_string()])?;
        let response = self.client.delete(url).send().await;
        match response {
            // a node that never had the enrolment answers 404; that is a
            // successful demotion for our purposes
            Ok(response) if response.status() == StatusCode::NOT_FOUND => Ok(false),
            other => {
                Self::ok_response(other)?;
                Ok(true)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), RestError> {
        let url = self.url(&["v0", "shutdown"])?;
        Self::ok_response(self.client.post(url).send().await)?;
        Ok(())
    }
}
