//! PeerClient – HTTP client for server-to-server calls.
//!
//! One shared connection pool for all calls, a 10 s default per-request
//! timeout, and bounded retries (3, exponential backoff from 1 s) on
//! timeouts and connect errors only – HTTP 4xx/5xx are never retried.
//! Responses come back as typed records; parse failures and non-2xx are
//! typed errors, never panics.

use std::time::Duration;

use log::{debug, warn};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::protocol::{RemoteTransferRequest, RemoteTransferResponse};
use crate::types::{ServerInfo, WorldStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("server unreachable after {attempts} attempt(s): {message}")]
    Unreachable { attempts: u32, message: String },
    #[error("peer returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse peer response: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeerClientConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_idle_per_host: usize,
    /// Shared secret sent as `X-Discovery-Key` on discovery endpoints.
    pub discovery_api_key: Option<String>,
}

impl Default for PeerClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_idle_per_host: 20,
            discovery_api_key: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct PeerClient {
    client: reqwest::Client,
    config: PeerClientConfig,
}

impl PeerClient {
    pub fn new(config: PeerClientConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()?;
        Ok(Self { client, config })
    }

    fn base_url(server: &ServerInfo, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("http://{}:{}{}", server.host, server.port, path)
    }

    /// Send a request, retrying only on timeouts and connect errors.
    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        discovery_auth: bool,
    ) -> Result<reqwest::Response, PeerError> {
        let mut attempt: u32 = 0;
        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }
            if discovery_auth {
                if let Some(key) = &self.config.discovery_api_key {
                    request = request.header("X-Discovery-Key", key);
                }
            }
            match request.send().await {
                Ok(response) => return Ok(response),
                Err(e) if (e.is_timeout() || e.is_connect()) && attempt < self.config.max_retries => {
                    let delay = self.config.retry_delay * 2u32.saturating_pow(attempt);
                    warn!(
                        "Request failed ({}), retrying in {:.1}s (attempt {}/{})",
                        e,
                        delay.as_secs_f32(),
                        attempt + 1,
                        self.config.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PeerError::Unreachable {
                        attempts: attempt + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        discovery_auth: bool,
    ) -> Result<T, PeerError> {
        let response = self.request(method, url, body, discovery_auth).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PeerError::Parse(e.to_string()))?;
        if !status.is_success() {
            return Err(PeerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| PeerError::Parse(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Peer-facing endpoints
    // -----------------------------------------------------------------------

    /// Liveness probe against `/api/health`.
    pub async fn ping(&self, server: &ServerInfo) -> bool {
        let url = Self::base_url(server, "/api/health");
        match self.request(Method::GET, &url, None, false).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Ping failed for {}: {}", server.server_id, e);
                false
            }
        }
    }

    pub async fn get_server_info(&self, server: &ServerInfo) -> Result<ServerInfo, PeerError> {
        let url = Self::base_url(server, "/api/servers/local");
        self.request_json(Method::GET, &url, None, false).await
    }

    pub async fn list_worlds(&self, server: &ServerInfo) -> Result<Vec<WorldStatus>, PeerError> {
        #[derive(serde::Deserialize)]
        struct WorldsResponse {
            worlds: Vec<WorldStatus>,
        }
        let url = Self::base_url(server, "/api/worlds");
        let response: WorldsResponse = self.request_json(Method::GET, &url, None, false).await?;
        Ok(response.worlds)
    }

    pub async fn get_world(
        &self,
        server: &ServerInfo,
        world_id: &str,
    ) -> Result<WorldStatus, PeerError> {
        let url = Self::base_url(server, &format!("/api/worlds/{}", world_id));
        self.request_json(Method::GET, &url, None, false).await
    }

    /// Register this server with a remote discovery hub. Best effort.
    pub async fn register_server(
        &self,
        server: &ServerInfo,
        local_server_info: &ServerInfo,
    ) -> bool {
        let url = Self::base_url(server, "/api/discovery/register");
        let body = match serde_json::to_value(local_server_info) {
            Ok(body) => body,
            Err(_) => return false,
        };
        match self.request(Method::POST, &url, Some(&body), true).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Registration with {} failed: {}", server.server_id, e);
                false
            }
        }
    }

    /// Heartbeat against a remote discovery hub. Best effort.
    pub async fn send_heartbeat(
        &self,
        server: &ServerInfo,
        local_server_info: &ServerInfo,
    ) -> bool {
        let url = Self::base_url(
            server,
            &format!("/api/discovery/heartbeat/{}", local_server_info.server_id),
        );
        let body = match serde_json::to_value(local_server_info) {
            Ok(body) => body,
            Err(_) => return false,
        };
        match self.request(Method::POST, &url, Some(&body), true).await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Heartbeat to {} failed: {}", server.server_id, e);
                false
            }
        }
    }

    /// Trigger a server-internal transfer between two worlds on `server`.
    pub async fn transfer_entity(
        &self,
        server: &ServerInfo,
        source_world_id: &str,
        destination_world_id: &str,
        entity_id: &str,
    ) -> Result<Value, PeerError> {
        let url = Self::base_url(
            server,
            &format!(
                "/api/worlds/{}/transfer?entity_id={}&destination_world_id={}",
                source_world_id, entity_id, destination_world_id
            ),
        );
        self.request_json(Method::POST, &url, None, false).await
    }

    /// Cross-server migration: hand a serialized entity to the peer.
    ///
    /// A non-2xx response with a structured JSON body (the 409
    /// `no_root_spots` back-pressure, 403 `transfers_disabled`, 404
    /// unknown world) is returned as an unsuccessful
    /// [`RemoteTransferResponse`] so the scheduler can decide whether the
    /// restore is silent. Only transport-level failures are `Err`.
    pub async fn remote_transfer_entity(
        &self,
        server: &ServerInfo,
        request: &RemoteTransferRequest,
    ) -> Result<RemoteTransferResponse, PeerError> {
        let url = Self::base_url(server, "/api/remote-transfer");
        let body = serde_json::to_value(request).map_err(|e| PeerError::Parse(e.to_string()))?;

        let response = self.request(Method::POST, &url, Some(&body), false).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PeerError::Parse(e.to_string()))?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| PeerError::Parse(e.to_string()));
        }
        if let Ok(outcome) = serde_json::from_str::<RemoteTransferResponse>(&text) {
            if outcome.error.is_some() {
                return Ok(RemoteTransferResponse {
                    success: false,
                    ..outcome
                });
            }
        }
        Err(PeerError::Status {
            status: status.as_u16(),
            body: text,
        })
    }
}
