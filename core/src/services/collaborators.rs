//! Seams to the data-plane services the coordinator reconfigures
//!
//! Rendering service configuration and managing containers live outside the
//! coordinator. The defaults here render a small descriptor per service and
//! track container state in memory, which is what a node without a container
//! runtime needs.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::services::identity::LocalNode;
use crate::services::settings_store::SettingsVersion;
use crate::validation::{broker_nodes, flanking_nodes};

/// Everything a renderer may look at
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub node: LocalNode,
    pub settings: Arc<SettingsVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceConfig {
    pub service: String,
    pub container: Value,
    /// Relative path to file contents
    pub files: BTreeMap<String, String>,
}

#[async_trait]
pub trait ServiceConfigRenderer: Send + Sync {
    fn service(&self) -> &str;

    /// Whether the node is failing when this service is down
    fn critical(&self) -> bool {
        false
    }

    async fn resolve_service_configuration(&self, ctx: &NodeContext) -> Result<ServiceConfig>;
}

#[async_trait]
pub trait ContainerManager: Send + Sync {
    async fn start(&self, service: &str) -> Result<()>;
    async fn stop(&self, service: &str) -> Result<()>;
    async fn restart(&self, service: &str) -> Result<()>;
    async fn is_running(&self, service: &str) -> bool;
}

// ============================================================================
// Default renderers
// ============================================================================

pub struct BrokerRenderer;
pub struct ProxyRenderer;
pub struct CaRenderer;
pub struct ConnectorRenderer;

pub fn default_renderers() -> Vec<Arc<dyn ServiceConfigRenderer>> {
    vec![
        Arc::new(BrokerRenderer),
        Arc::new(ProxyRenderer),
        Arc::new(CaRenderer),
        Arc::new(ConnectorRenderer),
    ]
}

fn container(service: &str, ctx: &NodeContext) -> Value {
    json!({
        "name": service,
        "hostname": service,
        "labels": {
            "morio.node.serial": ctx.node.serial,
            "morio.settings.serial": ctx.settings.serial,
        }
    })
}

#[async_trait]
impl ServiceConfigRenderer for BrokerRenderer {
    fn service(&self) -> &str {
        "broker"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn resolve_service_configuration(&self, ctx: &NodeContext) -> Result<ServiceConfig> {
        let brokers = broker_nodes(&ctx.settings.data);
        let seeds: Vec<Value> = brokers
            .iter()
            .enumerate()
            .map(|(i, fqdn)| json!({"node_id": i + 1, "address": fqdn, "port": 9092}))
            .collect();

        let config = json!({
            "node_id": ctx.node.serial,
            "advertised_address": ctx.node.fqdn,
            "seed_servers": seeds,
            "cluster_id": ctx.node.cluster,
        });

        Ok(ServiceConfig {
            service: self.service().to_string(),
            container: container(self.service(), ctx),
            files: BTreeMap::from([("broker.json".to_string(), config.to_string())]),
        })
    }
}

#[async_trait]
impl ServiceConfigRenderer for ProxyRenderer {
    fn service(&self) -> &str {
        "proxy"
    }

    async fn resolve_service_configuration(&self, ctx: &NodeContext) -> Result<ServiceConfig> {
        let routes = json!({
            "entrypoint": ctx.node.fqdn,
            "routes": ["/-/core", "/-/api", "/-/ui"],
        });

        Ok(ServiceConfig {
            service: self.service().to_string(),
            container: container(self.service(), ctx),
            files: BTreeMap::from([("routes.json".to_string(), routes.to_string())]),
        })
    }
}

#[async_trait]
impl ServiceConfigRenderer for CaRenderer {
    fn service(&self) -> &str {
        "ca"
    }

    async fn resolve_service_configuration(&self, ctx: &NodeContext) -> Result<ServiceConfig> {
        let keys = &ctx.settings.keys;
        Ok(ServiceConfig {
            service: self.service().to_string(),
            container: container(self.service(), ctx),
            files: BTreeMap::from([
                ("root.crt".to_string(), keys.rcrt.clone()),
                ("intermediate.crt".to_string(), keys.icrt.clone()),
            ]),
        })
    }
}

#[async_trait]
impl ServiceConfigRenderer for ConnectorRenderer {
    fn service(&self) -> &str {
        "connector"
    }

    async fn resolve_service_configuration(&self, ctx: &NodeContext) -> Result<ServiceConfig> {
        let pipelines = ctx
            .settings
            .data
            .pointer("/connector/pipelines")
            .cloned()
            .unwrap_or_else(|| json!({}));
        let config = json!({
            "pipelines": pipelines,
            "flanking_nodes": flanking_nodes(&ctx.settings.data),
        });

        Ok(ServiceConfig {
            service: self.service().to_string(),
            container: container(self.service(), ctx),
            files: BTreeMap::from([("pipelines.json".to_string(), config.to_string())]),
        })
    }
}

// ============================================================================
// In-process container manager
// ============================================================================

/// Tracks container state without a container runtime
#[derive(Default)]
pub struct LocalContainerManager {
    running: Mutex<HashSet<String>>,
    restarts: AtomicU64,
}

impl LocalContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of (re)starts issued so far
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContainerManager for LocalContainerManager {
    async fn start(&self, service: &str) -> Result<()> {
        info!("Starting {} container", service);
        self.running.lock().await.insert(service.to_string());
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn stop(&self, service: &str) -> Result<()> {
        info!("Stopping {} container", service);
        self.running.lock().await.remove(service);
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<()> {
        if !self.is_running(service).await {
            return self.start(service).await;
        }
        info!("Restarting {} container", service);
        self.restarts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn is_running(&self, service: &str) -> bool {
        self.running.lock().await.contains(service)
    }
}
