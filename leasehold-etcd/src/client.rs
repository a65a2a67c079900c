//! etcd lease store over the v3 JSON gateway

use crate::config::EtcdConfig;
use crate::wire::{
    self, GatewayStatus, KeepAliveFrame, LeaseGrantResponse, RangeResponse, TxnResponse,
    WatchFrame,
};
use async_trait::async_trait;
use futures::StreamExt;
use leasehold_store::{
    CreateOutcome, KeyValue, LeaseGrant, LeaseId, LeaseStore, Revision, StoreError, StoreResult,
    Watcher,
};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// gRPC status codes the gateway reports in error bodies.
mod code {
    pub const DEADLINE_EXCEEDED: i32 = 4;
    pub const NOT_FOUND: i32 = 5;
    pub const RESOURCE_EXHAUSTED: i32 = 8;
    pub const ABORTED: i32 = 10;
    pub const UNAVAILABLE: i32 = 14;
    pub const UNAUTHENTICATED: i32 = 16;
}

fn status_error(code: i32, message: String) -> StoreError {
    match code {
        code::DEADLINE_EXCEEDED => StoreError::Timeout,
        code::UNAVAILABLE | code::RESOURCE_EXHAUSTED | code::ABORTED | code::UNAUTHENTICATED => {
            StoreError::Unavailable(message)
        }
        _ => StoreError::Status { code, message },
    }
}

fn is_not_found(err: &StoreError) -> bool {
    matches!(err, StoreError::Status { code, .. } if *code == code::NOT_FOUND)
}

fn map_reqwest(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else if err.is_connect() || err.is_request() {
        StoreError::Unavailable(err.to_string())
    } else if err.is_decode() {
        StoreError::InvalidResponse(err.to_string())
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

/// etcd lease store client
pub struct EtcdStore {
    config: EtcdConfig,
    client: reqwest::Client,
    current: AtomicUsize,
    token: RwLock<Option<String>>,
}

impl EtcdStore {
    /// Create new etcd store client
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use leasehold_etcd::{EtcdConfig, EtcdStore};
    ///
    /// let etcd = EtcdStore::new(EtcdConfig::new("http://localhost:2379"))?;
    /// ```
    pub fn new(config: EtcdConfig) -> StoreResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        Ok(Self {
            config,
            client,
            current: AtomicUsize::new(0),
            token: RwLock::new(None),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &EtcdConfig {
        &self.config
    }

    /// Endpoint currently preferred for requests
    pub fn current_endpoint(&self) -> &str {
        let index = self.current.load(Ordering::Relaxed) % self.config.endpoints.len();
        &self.config.endpoints[index]
    }

    /// POST `body` to `path`, failing over across endpoints on connection errors.
    async fn dispatch(
        &self,
        path: &str,
        body: &Value,
        timeout: Option<Duration>,
        token: Option<&str>,
    ) -> StoreResult<reqwest::Response> {
        let endpoints = &self.config.endpoints;
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..endpoints.len() {
            let index = (start + offset) % endpoints.len();
            let url = format!("{}{}", endpoints[index].trim_end_matches('/'), path);

            let mut request = self.client.post(&url).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            if let Some(token) = token {
                request = request.header(reqwest::header::AUTHORIZATION, token);
            }

            match request.send().await {
                Ok(response) => {
                    if offset > 0 {
                        info!(endpoint = %endpoints[index], "Switched etcd endpoint");
                    }
                    self.current.store(index, Ordering::Relaxed);
                    return check_status(response).await;
                }
                Err(e) if e.is_connect() => {
                    warn!(endpoint = %endpoints[index], error = %e, "etcd endpoint unreachable");
                    last_error = Some(map_reqwest(e));
                }
                Err(e) => return Err(map_reqwest(e)),
            }
        }

        Err(last_error.unwrap_or_else(|| StoreError::Unavailable("no etcd endpoints".to_string())))
    }

    async fn auth_token(&self) -> StoreResult<Option<String>> {
        let (Some(username), Some(password)) = (&self.config.username, &self.config.password)
        else {
            return Ok(None);
        };

        if let Some(token) = self.token.read().await.as_ref() {
            return Ok(Some(token.clone()));
        }

        #[derive(serde::Deserialize)]
        struct AuthenticateResponse {
            token: String,
        }

        let body = json!({ "name": username, "password": password });
        let response = self
            .dispatch(
                "/v3/auth/authenticate",
                &body,
                Some(self.config.request_timeout),
                None,
            )
            .await?;
        let auth: AuthenticateResponse = response.json().await.map_err(map_reqwest)?;

        debug!(username = %username, "Authenticated with etcd");
        *self.token.write().await = Some(auth.token.clone());
        Ok(Some(auth.token))
    }

    async fn send(
        &self,
        path: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> StoreResult<reqwest::Response> {
        let token = self.auth_token().await?;
        let result = self.dispatch(path, body, timeout, token.as_deref()).await;

        // An expired token surfaces as Unavailable; drop it so the retry
        // re-authenticates.
        if token.is_some() && matches!(result, Err(StoreError::Unavailable(_))) {
            *self.token.write().await = None;
        }

        result
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> StoreResult<T> {
        let response = self
            .send(path, body, Some(self.config.request_timeout))
            .await?;
        response.json().await.map_err(map_reqwest)
    }
}

async fn check_status(response: reqwest::Response) -> StoreResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let body: GatewayStatus = serde_json::from_str(&text).unwrap_or_default();

    if body.code != 0 {
        return Err(status_error(body.code, body.text().to_string()));
    }

    if status.is_server_error() {
        Err(StoreError::Unavailable(format!("{}: {}", status, text)))
    } else {
        Err(StoreError::Status {
            code: i32::from(status.as_u16()),
            message: text,
        })
    }
}

/// Read a streaming response up to and including its first line.
async fn first_line(response: reqwest::Response) -> StoreResult<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest)?;
        buffer.extend_from_slice(&chunk);
        if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            buffer.truncate(pos);
            break;
        }
    }

    String::from_utf8(buffer).map_err(|e| StoreError::InvalidResponse(e.to_string()))
}

/// Forward watch frames into `tx` until the stream ends or the receiver is dropped.
async fn pump_watch(
    key: String,
    response: reqwest::Response,
    tx: mpsc::Sender<StoreResult<leasehold_store::WatchEvent>>,
) {
    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(map_reqwest(e))).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let frame: WatchFrame = match serde_json::from_slice(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = tx.send(Err(StoreError::InvalidResponse(e.to_string()))).await;
                    return;
                }
            };

            if let Some(status) = frame.error {
                let _ = tx.send(Err(status_error(status.code, status.text().to_string()))).await;
                return;
            }

            let Some(result) = frame.result else { continue };

            if result.compact_revision > 0 {
                let _ = tx.send(Err(StoreError::Compacted(result.compact_revision))).await;
                return;
            }

            for event in result.events {
                if tx.send(event.into_event()).await.is_err() {
                    debug!(key = %key, "Watch receiver dropped");
                    return;
                }
            }

            if result.canceled {
                debug!(key = %key, reason = %result.cancel_reason, "Watch canceled by etcd");
                return;
            }
        }
    }

    debug!(key = %key, "Watch stream ended");
}

#[async_trait]
impl LeaseStore for EtcdStore {
    async fn grant_lease(&self, ttl: i64) -> StoreResult<LeaseGrant> {
        let body = json!({ "TTL": ttl.to_string(), "ID": "0" });
        let grant: LeaseGrantResponse = self.post("/v3/lease/grant", &body).await?;

        if !grant.error.is_empty() {
            return Err(StoreError::Status {
                code: 0,
                message: grant.error,
            });
        }
        if grant.id == 0 {
            return Err(StoreError::InvalidResponse("lease grant without ID".to_string()));
        }

        debug!(lease = grant.id, ttl = grant.ttl, "Granted etcd lease");
        Ok(LeaseGrant {
            id: LeaseId::new(grant.id),
            ttl: grant.ttl,
        })
    }

    async fn revoke_lease(&self, lease: LeaseId) -> StoreResult<()> {
        let body = json!({ "ID": lease.get().to_string() });
        match self.post::<Value>("/v3/lease/revoke", &body).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn keep_alive(&self, lease: LeaseId) -> StoreResult<i64> {
        let body = json!({ "ID": lease.get().to_string() });
        let response = match self
            .send("/v3/lease/keepalive", &body, Some(self.config.request_timeout))
            .await
        {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Err(StoreError::LeaseNotFound(lease)),
            Err(e) => return Err(e),
        };

        let line = first_line(response).await?;
        let frame: KeepAliveFrame =
            serde_json::from_str(&line).map_err(|e| StoreError::InvalidResponse(e.to_string()))?;

        if let Some(status) = frame.error {
            let err = status_error(status.code, status.text().to_string());
            return Err(if is_not_found(&err) {
                StoreError::LeaseNotFound(lease)
            } else {
                err
            });
        }

        match frame.result {
            Some(result) if result.ttl > 0 => Ok(result.ttl),
            _ => Err(StoreError::LeaseNotFound(lease)),
        }
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> StoreResult<CreateOutcome> {
        let body = wire::create_if_absent_txn(key, value, lease);
        let txn: TxnResponse = match self.post("/v3/kv/txn", &body).await {
            Ok(txn) => txn,
            Err(e) if is_not_found(&e) => return Err(StoreError::LeaseNotFound(lease)),
            Err(e) => return Err(e),
        };

        if txn.succeeded {
            return Ok(CreateOutcome::Created {
                revision: txn.header.revision,
            });
        }

        let current = txn
            .responses
            .into_iter()
            .find_map(|op| op.response_range)
            .and_then(|range| range.kvs.into_iter().next())
            .ok_or_else(|| {
                StoreError::InvalidResponse(format!("failed create of {} returned no holder", key))
            })?
            .into_key_value()?;

        Ok(CreateOutcome::Exists {
            current,
            revision: txn.header.revision,
        })
    }

    async fn delete_if_owned(&self, key: &str, lease: LeaseId) -> StoreResult<bool> {
        let body = wire::delete_if_owned_txn(key, lease);
        let txn: TxnResponse = self.post("/v3/kv/txn", &body).await?;
        Ok(txn.succeeded)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<KeyValue>> {
        let body = json!({ "key": wire::encode(key) });
        let range: RangeResponse = self.post("/v3/kv/range", &body).await?;

        range
            .kvs
            .into_iter()
            .next()
            .map(|kv| kv.into_key_value())
            .transpose()
    }

    async fn watch(&self, key: &str, from_revision: Revision) -> StoreResult<Watcher> {
        let body = wire::watch_request(key, from_revision);
        let response = self.send("/v3/watch", &body, None).await?;

        let (tx, rx) = mpsc::channel(leasehold_store::store::WATCH_BUFFER);
        let task = tokio::spawn(pump_watch(key.to_string(), response, tx));

        debug!(key = %key, from_revision, "Watching etcd key");
        Ok(Watcher::new(key, rx).with_task(task))
    }
}
