use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::CoreConfig;
use crate::error::ErrorEnvelope;
use crate::types::{
    HeartbeatMessage, InviteRequest, JoinRequest, JoinResponse, SettingsPayload, SyncRequest,
};

#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer could not be reached; retried on the next tick
    #[error("Peer {peer} unreachable: {reason}")]
    Transport { peer: String, reason: String },

    /// The peer answered with an error envelope
    #[error("Peer {peer} rejected request ({status}): {}", .envelope.title)]
    Rejected {
        peer: String,
        status: u16,
        envelope: ErrorEnvelope,
    },
}

impl PeerError {
    /// Machine-readable code of a rejection
    pub fn code(&self) -> Option<&str> {
        match self {
            PeerError::Transport { .. } => None,
            PeerError::Rejected { envelope, .. } => Some(envelope.code()),
        }
    }
}

/// Calls from one coordinator to another
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn heartbeat(&self, fqdn: &str, msg: &HeartbeatMessage) -> Result<HeartbeatMessage, PeerError>;

    async fn join(&self, fqdn: &str, req: &JoinRequest) -> Result<JoinResponse, PeerError>;

    async fn invite(&self, fqdn: &str, req: &InviteRequest) -> Result<(), PeerError>;

    async fn sync(&self, fqdn: &str, req: &SyncRequest) -> Result<SettingsPayload, PeerError>;

    /// Resolve an FQDN to an address, failing when it cannot be reached
    async fn resolve(&self, fqdn: &str) -> Result<String, PeerError>;
}

/// Peer transport over HTTP(S)
pub struct HttpPeerClient {
    client: Client,
    scheme: String,
    port: u16,
}

impl HttpPeerClient {
    pub fn new(config: &CoreConfig, ca_pem: Option<&[u8]>) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.heartbeat_timeout)
            .connect_timeout(config.heartbeat_timeout.min(Duration::from_secs(2)))
            .user_agent(format!("morio-core/{}", config.version));

        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).context("Invalid CA certificate")?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            scheme: config.peer_scheme.clone(),
            port: config.peer_port,
        })
    }

    fn url(&self, fqdn: &str, path: &str) -> String {
        format!("{}://{}:{}{}", self.scheme, fqdn, self.port, path)
    }

    async fn post<B, R>(&self, fqdn: &str, path: &str, body: &B) -> Result<R, PeerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let resp = self.send(fqdn, path, body).await?;
        resp.json::<R>().await.map_err(|e| PeerError::Transport {
            peer: fqdn.to_string(),
            reason: format!("invalid response body: {}", e),
        })
    }

    async fn send<B>(&self, fqdn: &str, path: &str, body: &B) -> Result<reqwest::Response, PeerError>
    where
        B: Serialize + Sync,
    {
        let url = self.url(fqdn, path);
        debug!("POST {}", url);

        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PeerError::Transport {
                peer: fqdn.to_string(),
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorEnvelope>(&text) {
                Ok(envelope) => PeerError::Rejected {
                    peer: fqdn.to_string(),
                    status,
                    envelope,
                },
                Err(_) => PeerError::Transport {
                    peer: fqdn.to_string(),
                    reason: format!("HTTP {}: {}", status, text),
                },
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn heartbeat(&self, fqdn: &str, msg: &HeartbeatMessage) -> Result<HeartbeatMessage, PeerError> {
        self.post(fqdn, "/cluster/heartbeat", msg).await
    }

    async fn join(&self, fqdn: &str, req: &JoinRequest) -> Result<JoinResponse, PeerError> {
        self.post(fqdn, "/cluster/join", req).await
    }

    async fn invite(&self, fqdn: &str, req: &InviteRequest) -> Result<(), PeerError> {
        self.send(fqdn, "/cluster/invite", req).await.map(|_| ())
    }

    async fn sync(&self, fqdn: &str, req: &SyncRequest) -> Result<SettingsPayload, PeerError> {
        self.post(fqdn, "/cluster/sync", req).await
    }

    async fn resolve(&self, fqdn: &str) -> Result<String, PeerError> {
        let mut addrs = tokio::net::lookup_host((fqdn, self.port))
            .await
            .map_err(|e| PeerError::Transport {
                peer: fqdn.to_string(),
                reason: e.to_string(),
            })?;

        addrs
            .next()
            .map(|addr| addr.ip().to_string())
            .ok_or_else(|| PeerError::Transport {
                peer: fqdn.to_string(),
                reason: "no addresses".to_string(),
            })
    }
}
