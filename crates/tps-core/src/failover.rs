//! Advances active endpoints after a transport failure.
//!
//! Only shared indices are touched here; callers own the retry loop.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pool::{ConnectionPool, Endpoint, PoolEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailoverMode {
    /// Each pool walks its own replica list.
    #[default]
    Independent,
    /// CA, TKS and KRA replicas are deployed as pods and move together.
    Paired,
}

#[derive(Debug, Default)]
pub struct FailoverCoordinator {
    mode: FailoverMode,
    pod_index: Mutex<usize>,
}

impl FailoverCoordinator {
    pub fn new(mode: FailoverMode) -> Self {
        Self {
            mode,
            pod_index: Mutex::new(0),
        }
    }

    pub fn mode(&self) -> FailoverMode {
        self.mode
    }

    pub fn pod_index(&self) -> usize {
        *self.pod_index.lock()
    }

    /// Move `failed` (and, in paired mode, every pool) to the next replica.
    /// Returns the endpoint `failed` now points at.
    pub fn record_failure(&self, pools: &ConnectionPool, failed: &PoolEntry) -> Endpoint {
        match self.mode {
            FailoverMode::Independent => {
                let index = failed.endpoints.advance();
                let next = failed.endpoints.current();
                warn!(
                    pool = failed.id.as_str(),
                    index,
                    endpoint = %next,
                    "backend failover"
                );
                metrics::counter!("tps_failover_total", "mode" => "independent").increment(1);
                next
            }
            FailoverMode::Paired => {
                // Held until every pool is moved so concurrent failovers
                // apply their pods in the same order they were chosen.
                let mut pod_guard = self.pod_index.lock();
                *pod_guard = pod_guard.wrapping_add(1);
                let pod = *pod_guard;
                for entry in pools.entries() {
                    entry.endpoints.set_pod(pod);
                }
                drop(pod_guard);
                let next = failed.endpoints.current();
                warn!(
                    pool = failed.id.as_str(),
                    pod,
                    endpoint = %next,
                    "paired backend failover"
                );
                metrics::counter!("tps_failover_total", "mode" => "paired").increment(1);
                next
            }
        }
    }
}
