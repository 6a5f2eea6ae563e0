//! State shared by every session of one sync client.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;
use vellum_common::config::SyncClientConfig;
use vellum_common::lock_tag;
use vellum_common::sync::Guarded;

use crate::error::{SyncError, SyncResult};
use crate::protocol::ServerEndpoint;
use crate::resumption::ResumptionDelayInfo;
use crate::transport::{GenericNetworkTransport, SyncSocketProvider};

lock_tag!(EndpointLock, "sync.endpoint", 90);

pub(crate) struct SyncClient {
    pub(crate) config: SyncClientConfig,
    pub(crate) resumption: ResumptionDelayInfo,
    pub(crate) sockets: Arc<dyn SyncSocketProvider>,
    pub(crate) network: Option<Arc<dyn GenericNetworkTransport>>,
    pub(crate) runtime: Handle,
    endpoint: Guarded<ServerEndpoint, EndpointLock>,
}

impl SyncClient {
    pub(crate) fn new(
        config: SyncClientConfig,
        sockets: Arc<dyn SyncSocketProvider>,
        network: Option<Arc<dyn GenericNetworkTransport>>,
        runtime: Handle,
    ) -> SyncResult<Self> {
        config.validate().map_err(SyncError::InvalidConfig)?;
        let endpoint = ServerEndpoint::parse(&config.server_url)?;
        Ok(Self {
            resumption: ResumptionDelayInfo::from_config(&config),
            config,
            sockets,
            network,
            runtime,
            endpoint: Guarded::new(endpoint),
        })
    }

    pub(crate) fn endpoint(&self) -> ServerEndpoint {
        self.endpoint.lock().clone()
    }

    /// Points future connections at `url`.
    pub(crate) fn set_server_url(&self, url: &str) -> SyncResult<()> {
        let endpoint = ServerEndpoint::parse(url)?;
        info!(endpoint = %endpoint, "sync server location updated");
        *self.endpoint.lock() = endpoint;
        Ok(())
    }
}
