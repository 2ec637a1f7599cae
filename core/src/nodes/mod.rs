pub mod pool;
pub mod remote;

pub use pool::RemoteNodePool;
pub use remote::RemoteNode;

use std::sync::Arc;

use crate::auth::Token;
use crate::client::ApiClient;
use crate::config::Config;
use crate::error::ParseError;
use crate::metrics::Metrics;
use crate::types::NodeInfo;

/// The narrow set of services peer machinery needs: resolved config, metrics,
/// our own identity, the cluster bootstrap token, and a client factory. Peers
/// get this instead of a handle to the whole manager.
pub struct NodeContext {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub local: NodeInfo,
    pub cluster: Token,
    http: reqwest::Client,
}

impl NodeContext {
    pub fn new(
        config: Arc<Config>,
        local: NodeInfo,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ParseError> {
        let http = reqwest::Client::builder()
            .timeout(config.transport.request_timeout())
            .build()
            .map_err(|e| ParseError::invalid("transport", e.to_string()))?;
        let cluster = Token::cluster(&config.auth.cluster_secret);
        Ok(Self {
            config,
            metrics,
            local,
            cluster,
            http,
        })
    }

    pub fn new_client(&self, base_url: &str) -> ApiClient {
        ApiClient::new(base_url, self.http.clone())
    }

    pub fn local_id(&self) -> &str {
        &self.local.id
    }
}
