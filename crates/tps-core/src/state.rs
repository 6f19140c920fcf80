use crate::{
    config::ConfigStore,
    error::{TpsError, TpsResult},
    failover::{FailoverCoordinator, FailoverMode},
    pool::{ConnectionHandle, ConnectionPool, Endpoint, PoolEntry},
};

/// Process-wide engine state: built once at startup, shared by `Arc`.
#[derive(Debug)]
pub struct EngineState {
    pools: ConnectionPool,
    failover: FailoverCoordinator,
}

impl EngineState {
    pub fn new(pools: ConnectionPool, mode: FailoverMode) -> Self {
        Self {
            pools,
            failover: FailoverCoordinator::new(mode),
        }
    }

    pub fn from_config(config: &dyn ConfigStore) -> TpsResult<Self> {
        let pools = ConnectionPool::from_config(config)?;
        let mode = if config.get_bool("failover.pod.enable", false)? {
            FailoverMode::Paired
        } else {
            FailoverMode::Independent
        };
        tracing::info!(
            connectors = pools.entries().len(),
            mode = ?mode,
            "engine state initialised"
        );
        Ok(Self::new(pools, mode))
    }

    pub fn get_pool(&self, id: &str) -> Option<ConnectionHandle> {
        self.pools.get(id)
    }

    pub fn require_pool(&self, id: &str) -> TpsResult<ConnectionHandle> {
        self.get_pool(id)
            .ok_or_else(|| TpsError::PoolNotFound(id.to_string()))
    }

    pub fn current_endpoint(&self, handle: &PoolEntry) -> Endpoint {
        self.pools.current_endpoint(handle)
    }

    pub fn record_failure(&self, handle: &PoolEntry) -> Endpoint {
        self.failover.record_failure(&self.pools, handle)
    }

    pub fn failover_mode(&self) -> FailoverMode {
        self.failover.mode()
    }

    pub fn pools(&self) -> &ConnectionPool {
        &self.pools
    }
}
