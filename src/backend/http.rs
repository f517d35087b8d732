//! Consul HTTP API v1 Backend
//!
//! Maps [`CoordinationBackend`] onto the agent's REST endpoints:
//! - `/v1/kv/<key>` for reads (blocking via `?index=&wait=`), deletes and `?acquire=`.
//! - `/v1/txn` for writes, so the modify index comes back with the write.
//! - `/v1/catalog/service/<name>` for instance lists.
//! - `/v1/session/{create,renew,destroy}` for leases.
//! - `/v1/agent/service/{register,deregister}` and `/v1/agent/check/update` for TTL checks.
//!
//! The change index travels in the `X-Consul-Index` response header. Blocking reads
//! carry no client-side timeout: the server bounds them with `wait`. Renewals and
//! check updates are sent once, bounded by the keepalive timeout; the keepalive
//! loop's next tick is their retry.

use super::error::CoordinationError;
use super::types::*;
use super::CoordinationBackend;
use crate::config::CoordinatorConfig;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_ATTEMPTS: usize = 3;

pub struct HttpBackend {
    http_client: reqwest::Client,
    base_url: Url,
    token: Option<String>,
    wait_time: Duration,
    keepalive_timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &CoordinatorConfig) -> Result<Self, CoordinationError> {
        config.validate()?;

        let base_url = Url::parse(&config.base_url()).map_err(|e| {
            CoordinationError::configuration(format!("invalid address '{}': {}", config.address, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CoordinationError::configuration(format!(
                "invalid address '{}'",
                config.address
            )));
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| CoordinationError::configuration(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            token: config.token.clone(),
            wait_time: config.wait_time,
            keepalive_timeout: config.keepalive_timeout(),
        })
    }

    /// `/v1/<path>/<name>`. `path` is fixed API text; every `/`-separated part
    /// of `name` is percent-encoded as its own segment.
    pub(crate) fn url(&self, path: &str, name: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("v1").extend(path.split('/'));
            if !name.is_empty() {
                segments.extend(name.split('/'));
            }
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http_client.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Query string of a (possibly blocking) read.
    fn query_params(&self, opts: QueryOptions) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if opts.wait_index > 0 {
            params.push(("index", opts.wait_index.to_string()));
            let wait = opts.wait_time.unwrap_or(self.wait_time);
            params.push(("wait", go_duration(wait)));
        }
        params
    }

    async fn blocking_get(
        &self,
        url: Url,
        opts: QueryOptions,
    ) -> Result<reqwest::Response, CoordinationError> {
        tracing::trace!("GET {} (index={})", url, opts.wait_index);

        let response = self
            .request(reqwest::Method::GET, url)
            .query(&self.query_params(opts))
            .send()
            .await?;

        Ok(response)
    }

    /// Sends a PUT, retrying connection failures with backoff.
    ///
    /// Only used for idempotent writes that are not keepalives: a retried
    /// request must not create a second object on the server.
    async fn put_with_retry(
        &self,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, CoordinationError> {
        let mut delay_ms = 150u64;

        for attempt in 0..WRITE_ATTEMPTS {
            let mut request = self
                .request(reqwest::Method::PUT, url.clone())
                .timeout(WRITE_TIMEOUT);
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            match request.send().await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == WRITE_ATTEMPTS {
                        return Err(e.into());
                    }
                    tracing::debug!("PUT {} failed (attempt {}): {}", url, attempt + 1, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(CoordinationError::transport("Retry attempts exhausted"))
    }

    /// One keepalive PUT: single attempt, done within the keepalive timeout.
    async fn put_keepalive(
        &self,
        url: Url,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, CoordinationError> {
        let mut request = self
            .request(reqwest::Method::PUT, url)
            .timeout(self.keepalive_timeout);
        if let Some(body) = body {
            request = request.body(body);
        }

        Ok(request.send().await?)
    }

    async fn put_json<T: Serialize>(
        &self,
        url: Url,
        payload: &T,
    ) -> Result<reqwest::Response, CoordinationError> {
        let body = serde_json::to_vec(payload)?;
        let response = self.put_with_retry(url, Some(body)).await?;
        ensure_success(response).await
    }
}

#[async_trait]
impl CoordinationBackend for HttpBackend {
    async fn kv_get(
        &self,
        key: &str,
        opts: QueryOptions,
    ) -> Result<(Option<KvPair>, QueryMeta), CoordinationError> {
        let response = self.blocking_get(self.url("kv", key), opts).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            let meta = read_meta(&response).unwrap_or_default();
            return Ok((None, meta));
        }

        let response = ensure_success(response).await?;
        let meta = read_meta(&response)?;
        let entries: Vec<KvEntryWire> = response.json().await?;

        let pair = match entries.into_iter().next() {
            Some(entry) => Some(entry.into_pair()?),
            None => None,
        };

        Ok((pair, meta))
    }

    async fn kv_put(&self, key: &str, value: &[u8]) -> Result<u64, CoordinationError> {
        let ops = [TxnOpWire {
            kv: TxnKvWire {
                verb: "set",
                key,
                value: base64::engine::general_purpose::STANDARD.encode(value),
            },
        }];

        let response = self.put_json(self.url("txn", ""), &ops).await?;
        let result: TxnResponseWire = response.json().await?;

        if let Some(error) = result.errors.unwrap_or_default().into_iter().next() {
            return Err(CoordinationError::backend(
                409,
                format!("write of '{}' rejected: {}", key, error.what),
            ));
        }

        result
            .results
            .unwrap_or_default()
            .into_iter()
            .find_map(|r| r.kv)
            .map(|kv| kv.modify_index)
            .ok_or_else(|| CoordinationError::decode(format!("no result for write of '{}'", key)))
    }

    async fn kv_delete(&self, key: &str) -> Result<(), CoordinationError> {
        let response = self
            .request(reqwest::Method::DELETE, self.url("kv", key))
            .timeout(WRITE_TIMEOUT)
            .send()
            .await?;

        ensure_success(response).await?;
        Ok(())
    }

    async fn kv_acquire(
        &self,
        key: &str,
        value: &[u8],
        session: &SessionId,
    ) -> Result<bool, CoordinationError> {
        let response = self
            .request(reqwest::Method::PUT, self.url("kv", key))
            .query(&[("acquire", session.as_str())])
            .timeout(WRITE_TIMEOUT)
            .body(value.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if body.contains("invalid session") {
                return Err(CoordinationError::lease_invalid(session.as_str()));
            }
            return Err(CoordinationError::backend(status.as_u16(), body));
        }

        Ok(response.json::<bool>().await?)
    }

    async fn catalog_service(
        &self,
        name: &str,
        opts: QueryOptions,
    ) -> Result<(Vec<CatalogService>, QueryMeta), CoordinationError> {
        let response = self
            .blocking_get(self.url("catalog/service", name), opts)
            .await?;
        let response = ensure_success(response).await?;
        let meta = read_meta(&response)?;

        let entries: Vec<CatalogServiceWire> = response.json().await?;
        let instances = entries
            .into_iter()
            .filter(|entry| entry.service_name == name)
            .map(CatalogServiceWire::into_service)
            .collect();

        Ok((instances, meta))
    }

    async fn session_create(&self, req: &SessionRequest) -> Result<SessionId, CoordinationError> {
        let payload = SessionCreateWire {
            name: req.name.clone(),
            ttl: go_duration(req.ttl),
            behavior: req.behavior.as_str(),
            lock_delay: go_duration(req.lock_delay),
        };

        // Not retried: a retry after a lost response would leak a second session.
        let body = serde_json::to_vec(&payload)?;
        let response = self
            .request(reqwest::Method::PUT, self.url("session/create", ""))
            .timeout(WRITE_TIMEOUT)
            .body(body)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let created: SessionCreatedWire = response.json().await?;
        Ok(SessionId(created.id))
    }

    async fn session_renew(&self, session: &SessionId) -> Result<(), CoordinationError> {
        let url = self.url("session/renew", session.as_str());
        let response = self.put_keepalive(url, None).await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoordinationError::lease_invalid(session.as_str()));
        }

        let response = ensure_success(response).await?;

        // Older agents answer 200 with an empty list for unknown sessions.
        let sessions: Vec<serde_json::Value> = response.json().await.unwrap_or_default();
        if sessions.is_empty() {
            return Err(CoordinationError::lease_invalid(session.as_str()));
        }

        Ok(())
    }

    async fn session_destroy(&self, session: &SessionId) -> Result<(), CoordinationError> {
        let url = self.url("session/destroy", session.as_str());
        let response = self.put_with_retry(url, None).await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn agent_service_register(
        &self,
        registration: &AgentServiceRegistration,
    ) -> Result<(), CoordinationError> {
        let payload = ServiceRegistrationWire::from(registration);
        self.put_json(self.url("agent/service/register", ""), &payload)
            .await?;
        Ok(())
    }

    async fn agent_check_update(
        &self,
        check_id: &str,
        status: HealthStatus,
    ) -> Result<(), CoordinationError> {
        let payload = CheckUpdateWire {
            status: status.as_str(),
            output: String::new(),
        };
        let body = serde_json::to_vec(&payload)?;
        let url = self.url("agent/check/update", check_id);
        let response = self.put_keepalive(url, Some(body)).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND
                || body.contains("Unknown check")
                || body.contains("does not have associated TTL")
            {
                return Err(CoordinationError::lease_invalid(check_id));
            }
            return Err(CoordinationError::backend(status.as_u16(), body));
        }

        Ok(())
    }

    async fn agent_service_deregister(&self, service_id: &str) -> Result<(), CoordinationError> {
        let url = self.url("agent/service/deregister", service_id);
        let response = self.put_with_retry(url, None).await?;
        ensure_success(response).await?;
        Ok(())
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CoordinationError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CoordinationError::backend(status.as_u16(), body))
}

fn read_meta(response: &reqwest::Response) -> Result<QueryMeta, CoordinationError> {
    let raw = response
        .headers()
        .get(INDEX_HEADER)
        .ok_or_else(|| CoordinationError::decode(format!("missing {} header", INDEX_HEADER)))?;

    let last_index = raw
        .to_str()
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .ok_or_else(|| CoordinationError::decode(format!("malformed {} header", INDEX_HEADER)))?;

    Ok(QueryMeta { last_index })
}

/// Renders a duration the way the agent parses them ("10s", "250ms").
pub fn go_duration(value: Duration) -> String {
    if value.subsec_millis() == 0 {
        format!("{}s", value.as_secs())
    } else {
        format!("{}ms", value.as_millis())
    }
}

// --- Wire formats ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntryWire {
    key: String,
    value: Option<String>,
    session: Option<String>,
    #[serde(default)]
    create_index: u64,
    #[serde(default)]
    modify_index: u64,
    #[serde(default)]
    lock_index: u64,
    #[serde(default)]
    flags: u64,
}

impl KvEntryWire {
    fn into_pair(self) -> Result<KvPair, CoordinationError> {
        let value = match self.value {
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| CoordinationError::decode(format!("value of '{}': {}", self.key, e)))?,
            None => Vec::new(),
        };

        Ok(KvPair {
            key: self.key,
            value,
            session: self.session.filter(|s| !s.is_empty()).map(SessionId),
            create_index: self.create_index,
            modify_index: self.modify_index,
            lock_index: self.lock_index,
            flags: self.flags,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogServiceWire {
    service_name: String,
    #[serde(rename = "ServiceID", default)]
    service_id: String,
    #[serde(default)]
    service_address: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    service_port: u16,
}

impl CatalogServiceWire {
    fn into_service(self) -> CatalogService {
        let address = if self.service_address.is_empty() {
            self.address
        } else {
            self.service_address
        };

        CatalogService {
            service_name: self.service_name,
            service_id: self.service_id,
            address,
            port: self.service_port,
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionCreateWire {
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "Behavior")]
    behavior: &'static str,
    #[serde(rename = "LockDelay")]
    lock_delay: String,
}

#[derive(Debug, Serialize)]
struct TxnOpWire<'a> {
    #[serde(rename = "KV")]
    kv: TxnKvWire<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TxnKvWire<'a> {
    verb: &'static str,
    key: &'a str,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnResponseWire {
    #[serde(default)]
    results: Option<Vec<TxnResultWire>>,
    #[serde(default)]
    errors: Option<Vec<TxnErrorWire>>,
}

#[derive(Debug, Deserialize)]
struct TxnResultWire {
    #[serde(rename = "KV")]
    kv: Option<TxnKvResultWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnKvResultWire {
    #[serde(default)]
    modify_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TxnErrorWire {
    #[serde(default)]
    what: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreatedWire {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Serialize)]
struct CheckUpdateWire {
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Output")]
    output: String,
}

#[derive(Debug, Serialize)]
struct ServiceRegistrationWire {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Check")]
    check: ServiceCheckWire,
}

#[derive(Debug, Serialize)]
struct ServiceCheckWire {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL")]
    ttl: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_critical_service_after: String,
}

impl From<&AgentServiceRegistration> for ServiceRegistrationWire {
    fn from(registration: &AgentServiceRegistration) -> Self {
        Self {
            id: registration.id.clone(),
            name: registration.name.clone(),
            address: registration.address.clone(),
            port: registration.port,
            check: ServiceCheckWire {
                check_id: registration.check.check_id.clone(),
                ttl: go_duration(registration.check.ttl),
                deregister_critical_service_after: go_duration(
                    registration.check.deregister_critical_after,
                ),
            },
        }
    }
}
