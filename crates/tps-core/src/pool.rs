//! Backend endpoint lists and the connection pool keyed by pool-instance id.

use std::{fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    config::ConfigStore,
    error::{TpsError, TpsResult},
};

const CONNECTOR_PREFIX: &str = "tps.connector";

/// Kind of backend a pool talks to. Paired failover moves all three together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    Ca,
    Tks,
    Kra,
}

impl PoolKind {
    pub fn parse(raw: &str) -> TpsResult<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "ca" => Ok(Self::Ca),
            "tks" => Ok(Self::Tks),
            "kra" | "drm" => Ok(Self::Kra),
            other => Err(TpsError::Config(format!("unknown connector kind {other:?}"))),
        }
    }

    /// Best guess from a conventional id such as `tks1` or `kra2`.
    fn from_id(id: &str) -> Option<Self> {
        let lower = id.to_ascii_lowercase();
        if lower.starts_with("tks") {
            Some(Self::Tks)
        } else if lower.starts_with("kra") || lower.starts_with("drm") {
            Some(Self::Kra)
        } else if lower.starts_with("ca") {
            Some(Self::Ca)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn parse(raw: &str) -> TpsResult<Self> {
        let (host, port) = raw
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| TpsError::Config(format!("endpoint {raw:?} missing port")))?;
        if host.is_empty() {
            return Err(TpsError::Config(format!("endpoint {raw:?} missing host")));
        }
        let port = port
            .parse()
            .map_err(|_| TpsError::Config(format!("endpoint {raw:?} has invalid port")))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered replicas for one logical backend with the index of the active one.
#[derive(Debug)]
pub struct EndpointList {
    endpoints: Vec<Endpoint>,
    current_index: Mutex<usize>,
    pub retry_count: u32,
    pub timeout: Duration,
    pub use_tls: bool,
    pub keep_alive: bool,
    pub client_credential_id: Option<String>,
}

impl EndpointList {
    pub fn new(endpoints: Vec<Endpoint>) -> TpsResult<Self> {
        if endpoints.is_empty() {
            return Err(TpsError::config("endpoint list must not be empty"));
        }
        Ok(Self {
            endpoints,
            current_index: Mutex::new(0),
            retry_count: 0,
            timeout: Duration::from_secs(30),
            use_tls: true,
            keep_alive: true,
            client_credential_id: None,
        })
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_client_credential(mut self, nickname: impl Into<String>) -> Self {
        self.client_credential_id = Some(nickname.into());
        self
    }

    /// Parse a space- or comma-separated `host:port` list.
    pub fn parse_hosts(raw: &str) -> TpsResult<Vec<Endpoint>> {
        raw.split(|c: char| c.is_whitespace() || c == ',')
            .filter(|part| !part.is_empty())
            .map(Endpoint::parse)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn current_index(&self) -> usize {
        *self.current_index.lock()
    }

    pub fn current(&self) -> Endpoint {
        let index = self.current_index.lock();
        self.endpoints[*index].clone()
    }

    /// Move to the next replica, wrapping around. Returns the new index.
    pub(crate) fn advance(&self) -> usize {
        let mut index = self.current_index.lock();
        *index = (*index + 1) % self.endpoints.len();
        *index
    }

    /// Point at replica `pod`, clamped to the last entry of a shorter list.
    pub(crate) fn set_pod(&self, pod: usize) -> usize {
        let len = self.endpoints.len();
        let mut index = self.current_index.lock();
        *index = (pod % len).min(len - 1);
        *index
    }
}

/// One configured backend instance.
#[derive(Debug)]
pub struct PoolEntry {
    pub id: String,
    pub kind: PoolKind,
    pub endpoints: EndpointList,
}

pub type ConnectionHandle = Arc<PoolEntry>;

/// All configured backend instances. Entries are never removed while running.
#[derive(Debug, Default)]
pub struct ConnectionPool {
    entries: Vec<ConnectionHandle>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        id: impl Into<String>,
        kind: PoolKind,
        endpoints: EndpointList,
    ) -> TpsResult<ConnectionHandle> {
        let id = id.into();
        if self.get(&id).is_some() {
            return Err(TpsError::Config(format!("duplicate connector id {id}")));
        }
        let entry = Arc::new(PoolEntry {
            id,
            kind,
            endpoints,
        });
        self.entries.push(Arc::clone(&entry));
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.entries.iter().find(|entry| entry.id == id).cloned()
    }

    pub fn current_endpoint(&self, handle: &PoolEntry) -> Endpoint {
        handle.endpoints.current()
    }

    pub fn entries(&self) -> &[ConnectionHandle] {
        &self.entries
    }

    /// Build every `tps.connector.<id>` entry found in configuration.
    pub fn from_config(config: &dyn ConfigStore) -> TpsResult<Self> {
        let mut pool = Self::new();
        for id in config.children(CONNECTOR_PREFIX) {
            let key = |field: &str| format!("{CONNECTOR_PREFIX}.{id}.{field}");
            let kind = match config.get(&key("kind")) {
                Some(raw) => PoolKind::parse(&raw)?,
                None => PoolKind::from_id(&id).ok_or_else(|| {
                    TpsError::Config(format!("connector {id}: missing kind"))
                })?,
            };
            let hosts = config
                .get(&key("host"))
                .ok_or_else(|| TpsError::Config(format!("connector {id}: missing host")))?;
            let retries = config.get_int(&key("retries"), 3)?;
            let timeout = config.get_int(&key("timeout"), 30)?;
            let retry_count = u32::try_from(retries)
                .map_err(|_| TpsError::Config(format!("connector {id}: negative retries")))?;
            let timeout = u64::try_from(timeout)
                .map_err(|_| TpsError::Config(format!("connector {id}: negative timeout")))?;
            let mut list = EndpointList::new(EndpointList::parse_hosts(&hosts)?)?
                .with_retry_count(retry_count)
                .with_timeout(Duration::from_secs(timeout))
                .with_tls(config.get_bool(&key("ssl"), true)?)
                .with_keep_alive(config.get_bool(&key("keepAlive"), true)?);
            if let Some(nickname) = config.get(&key("clientNickname")) {
                list = list.with_client_credential(nickname);
            }
            tracing::debug!(
                connector = id.as_str(),
                kind = ?kind,
                replicas = list.len(),
                "configured connector"
            );
            pool.insert(id, kind, list)?;
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigStore;

    #[test]
    fn parses_host_lists() {
        let hosts =
            EndpointList::parse_hosts("tks-a.example:8443  tks-b.example:9443,10.0.0.3:80")
                .unwrap();
        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts[1], Endpoint::new("tks-b.example", 9443));
        assert!(EndpointList::parse_hosts("nohost").is_err());
        assert!(EndpointList::new(Vec::new()).is_err());
    }

    #[test]
    fn lookup_by_id() {
        let mut pool = ConnectionPool::new();
        let list = EndpointList::new(vec![Endpoint::new("a", 1)]).unwrap();
        pool.insert("tks1", PoolKind::Tks, list).unwrap();
        assert!(pool.get("tks1").is_some());
        assert!(pool.get("tks2").is_none());
        let dup = EndpointList::new(vec![Endpoint::new("b", 2)]).unwrap();
        assert!(pool.insert("tks1", PoolKind::Tks, dup).is_err());
    }

    #[test]
    fn builds_from_config() {
        let mut config = MemoryConfigStore::new();
        config
            .set("tps.connector.tks1.host", "tks-a:8443 tks-b:8443")
            .set("tps.connector.tks1.retries", "2")
            .set("tps.connector.tks1.timeout", "5")
            .set("tps.connector.tks1.ssl", "false")
            .set("tps.connector.tks1.clientNickname", "subsystemCert")
            .set("tps.connector.escrow.host", "kra:8443")
            .set("tps.connector.escrow.kind", "kra");
        let pool = ConnectionPool::from_config(&config).unwrap();
        let tks = pool.get("tks1").unwrap();
        assert_eq!(tks.kind, PoolKind::Tks);
        assert_eq!(tks.endpoints.len(), 2);
        assert_eq!(tks.endpoints.retry_count, 2);
        assert_eq!(tks.endpoints.timeout, Duration::from_secs(5));
        assert!(!tks.endpoints.use_tls);
        assert_eq!(
            tks.endpoints.client_credential_id.as_deref(),
            Some("subsystemCert")
        );
        assert_eq!(pool.get("escrow").unwrap().kind, PoolKind::Kra);
        assert_eq!(pool.current_endpoint(&tks), Endpoint::new("tks-a", 8443));
    }
}
