//! Remote worker dispatch.
//!
//! The concrete container wire protocol lives behind [`Dialer`]; the
//! default implementation ships the request as JSON to the worker's HTTP
//! port. Transport failures and worker-reported failures are kept apart so
//! the registry only counts real net errors.

use crate::error::ControllerError;
use crate::workers::WorkerEndpoint;
use async_trait::async_trait;
use distbuild_core::protocol::ExecuteRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// What a worker reports back for one action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Connection to the remote worker fleet.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Run one action on `endpoint`. An `Err` is a net error; an `Ok` with
    /// nonzero exit code is a remote execution failure.
    async fn dispatch(
        &self,
        endpoint: &WorkerEndpoint,
        req: &ExecuteRequest,
    ) -> Result<RemoteOutput, ControllerError>;
}

/// JSON-over-HTTP dialer.
pub struct HttpDialer {
    client: reqwest::Client,
}

impl HttpDialer {
    pub fn new(timeout: Duration) -> Result<Self, ControllerError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Dialer for HttpDialer {
    async fn dispatch(
        &self,
        endpoint: &WorkerEndpoint,
        req: &ExecuteRequest,
    ) -> Result<RemoteOutput, ControllerError> {
        let url = format!("http://{}:{}/execute", endpoint.host, endpoint.port);
        debug!(url = %url, action = %req.action_id, "dispatching to worker");

        let response = self.client.post(&url).json(req).send().await?;
        if !response.status().is_success() {
            return Err(ControllerError::Remote(format!(
                "worker {} returned HTTP {}",
                endpoint.key(),
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}
