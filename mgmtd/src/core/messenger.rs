use std::sync::OnceLock;
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use common::schemas::{SetConsistencyStatesRequest, SetConsistencyStatesResponse};
use common::trace_middleware::inject_trace_context_blocking;

use crate::core::error::StoreError;
use crate::core::node::Node;

/// Request/response messaging with other daemons.
pub trait NodeMessenger: Send + Sync {
    fn set_consistency_states(
        &self,
        node: &Node,
        req: &SetConsistencyStatesRequest,
    ) -> Result<SetConsistencyStatesResponse, StoreError>;
}

/// JSON over HTTP. The blocking client is built on first use, so this must only be called
/// from plain threads, never from inside the async runtime.
pub struct HttpMessenger {
    timeout: Duration,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpMessenger {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            client: OnceLock::new(),
        }
    }

    fn client(&self) -> Result<&reqwest::blocking::Client, StoreError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| StoreError::Remote(format!("failed to build http client: {}", e)))?;
        Ok(self.client.get_or_init(|| client))
    }

    fn send<Q, R>(&self, node: &Node, path: &str, req: &Q) -> Result<R, StoreError>
    where
        Q: Serialize,
        R: DeserializeOwned,
    {
        let endpoint = node
            .endpoint()
            .ok_or_else(|| StoreError::Remote(format!("{} has no usable interface", node)))?;
        let url = format!("{}{}", endpoint, path);
        debug!(%url, "sending request");

        let resp = inject_trace_context_blocking(self.client()?.post(&url))
            .json(req)
            .send()
            .map_err(|e| StoreError::Remote(format!("{}: {}", url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(StoreError::Remote(format!("{} returned {}: {}", url, status, body)));
        }

        resp.json::<R>()
            .map_err(|e| StoreError::MalformedData(format!("bad response from {}: {}", url, e)))
    }
}

impl NodeMessenger for HttpMessenger {
    fn set_consistency_states(
        &self,
        node: &Node,
        req: &SetConsistencyStatesRequest,
    ) -> Result<SetConsistencyStatesResponse, StoreError> {
        self.send(node, "/targets/consistency", req)
    }
}
