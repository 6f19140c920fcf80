//! Name/value request transport to backend trust services.

use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use reqwest::blocking::Client;
use tracing::debug;
use url::form_urlencoded;

use crate::{
    config::ConfigStore,
    error::{TpsError, TpsResult},
    pool::{Endpoint, PoolEntry},
};

const CREDENTIAL_PREFIX: &str = "credentials";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

pub trait Transport: Send + Sync {
    /// Deliver one request to `endpoint`. Any `Err` is treated as a transport
    /// failure and triggers failover.
    fn send(
        &self,
        pool: &PoolEntry,
        endpoint: &Endpoint,
        path: &str,
        body: &str,
    ) -> TpsResult<TransportResponse>;
}

pub fn encode_fields<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in fields {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Parsed `name=value&...` response body.
#[derive(Debug, Clone, Default)]
pub struct ResponseFields {
    fields: HashMap<String, String>,
}

impl ResponseFields {
    pub fn parse(body: &str) -> Self {
        let fields = form_urlencoded::parse(body.trim().as_bytes())
            .into_owned()
            .collect();
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn require(&self, name: &str) -> TpsResult<&str> {
        self.get(name)
            .ok_or_else(|| TpsError::MalformedResponse(format!("missing field {name}")))
    }

    pub fn require_hex(&self, name: &str) -> TpsResult<Vec<u8>> {
        hex::decode(self.require(name)?)
            .map_err(|e| TpsError::MalformedResponse(format!("field {name}: {e}")))
    }

    /// Numeric `status`; zero means success.
    pub fn status(&self) -> TpsResult<i64> {
        self.require("status")?
            .trim()
            .parse()
            .map_err(|_| TpsError::malformed("status is not numeric"))
    }
}

/// Blocking HTTP(S) transport. Must be driven from worker threads, not from
/// inside an async runtime.
pub struct HttpTransport {
    identities: HashMap<String, reqwest::Identity>,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            identities: HashMap::new(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Register a client certificate + key (PEM) under `nickname`.
    pub fn with_identity(mut self, nickname: impl Into<String>, pem: &[u8]) -> TpsResult<Self> {
        let identity = reqwest::Identity::from_pem(pem).map_err(TpsError::config)?;
        self.identities.insert(nickname.into(), identity);
        Ok(self)
    }

    /// Load every `credentials.<nickname>.pem` path from configuration.
    pub fn from_config(config: &dyn ConfigStore) -> TpsResult<Self> {
        let mut transport = Self::new();
        for nickname in config.children(CREDENTIAL_PREFIX) {
            let Some(path) = config.get(&format!("{CREDENTIAL_PREFIX}.{nickname}.pem")) else {
                continue;
            };
            let pem = std::fs::read(&path).map_err(|e| TpsError::Config(format!("{path}: {e}")))?;
            transport = transport.with_identity(nickname, &pem)?;
        }
        Ok(transport)
    }

    fn client_for(&self, pool: &PoolEntry) -> TpsResult<Client> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&pool.id) {
            return Ok(client.clone());
        }
        let list = &pool.endpoints;
        let mut builder = Client::builder()
            .connect_timeout(list.timeout.min(Duration::from_secs(15)))
            .timeout(list.timeout);
        if !list.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }
        if let Some(nickname) = &list.client_credential_id {
            let identity = self.identities.get(nickname).ok_or_else(|| {
                TpsError::Config(format!(
                    "pool {}: unknown client credential {nickname}",
                    pool.id
                ))
            })?;
            builder = builder.identity(identity.clone());
        }
        let client = builder.build().map_err(TpsError::config)?;
        clients.insert(pool.id.clone(), client.clone());
        Ok(client)
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        pool: &PoolEntry,
        endpoint: &Endpoint,
        path: &str,
        body: &str,
    ) -> TpsResult<TransportResponse> {
        let scheme = if pool.endpoints.use_tls { "https" } else { "http" };
        let url = format!("{scheme}://{endpoint}{path}");
        debug!(pool = pool.id.as_str(), url = url.as_str(), "sending backend request");
        let response = self
            .client_for(pool)?
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/x-www-form-urlencoded",
            )
            .body(body.to_string())
            .send()
            .map_err(TpsError::transport)?;
        let status = response.status();
        let text = response.text().map_err(TpsError::transport)?;
        if !status.is_success() {
            return Err(TpsError::Transport(format!("{url} returned HTTP {status}")));
        }
        Ok(TransportResponse {
            status: status.as_u16(),
            body: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_round_trip_through_form_encoding() {
        let body = encode_fields([("CUID", "A1B2"), ("cert", "-----BEGIN+X=\n")]);
        let parsed = ResponseFields::parse(&body);
        assert_eq!(parsed.get("CUID"), Some("A1B2"));
        assert_eq!(parsed.get("cert"), Some("-----BEGIN+X=\n"));
    }

    #[test]
    fn status_and_required_fields() {
        let parsed = ResponseFields::parse("status=0&sessionKey=0011&empty=");
        assert_eq!(parsed.status().unwrap(), 0);
        assert_eq!(parsed.require_hex("sessionKey").unwrap(), vec![0x00, 0x11]);
        assert!(matches!(
            parsed.require("empty"),
            Err(TpsError::MalformedResponse(_))
        ));
        assert!(matches!(
            ResponseFields::parse("status=abc").status(),
            Err(TpsError::MalformedResponse(_))
        ));
        assert!(ResponseFields::parse("sessionKey=zz").require_hex("sessionKey").is_err());
    }
}
