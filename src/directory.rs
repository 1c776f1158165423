//! Sources of the desired endpoint set.
//!
//! The supervisor only sees the [`EndpointDirectory`] trait. Two
//! implementations ship with the crate: [`StatusDirectory`] derives endpoints
//! from the network status service, [`StaticDirectory`] serves a fixed list.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::CollectorError;

/// Provides the set of endpoints that should be collected right now.
#[async_trait]
pub trait EndpointDirectory: Send + Sync + 'static {
    async fn desired_endpoints(&self) -> Result<Vec<Endpoint>, CollectorError>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkStatus {
    #[serde(default)]
    committee_nodes: BTreeMap<String, NodeInfo>,
    #[serde(default)]
    stand_by_nodes: BTreeMap<String, NodeInfo>,
    #[serde(default)]
    virtual_chains: BTreeMap<String, ChainInfo>,
    #[serde(default)]
    services: BTreeMap<String, ServiceInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    ip: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChainInfo {
    id: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    service_url_name: String,
    name: String,
}

/// Turn a network status document into endpoints: one per (virtual chain,
/// node) and one per (service, node), nodes being committee and standby
/// members.
pub fn endpoints_from_status(
    body: &[u8],
    node_port: u16,
) -> Result<Vec<Endpoint>, CollectorError> {
    let status: NetworkStatus = serde_json::from_slice(body)
        .map_err(|e| CollectorError::Directory(format!("invalid network status: {}", e)))?;

    let mut nodes = status.committee_nodes;
    nodes.extend(status.stand_by_nodes);

    let mut endpoints = Vec::new();
    for chain in status.virtual_chains.values() {
        let name = format!("chain-{}", chain_id(&chain.id));
        for node in nodes.values() {
            endpoints.push(
                Endpoint::new(node_log_url(&node.ip, node_port, &name), name.clone())
                    .with_source_identifier(node.ip.clone()),
            );
        }
    }
    for service in status.services.values() {
        for node in nodes.values() {
            endpoints.push(
                Endpoint::new(
                    node_log_url(&node.ip, node_port, &service.service_url_name),
                    service.name.clone(),
                )
                .with_source_identifier(node.ip.clone()),
            );
        }
    }

    Ok(endpoints)
}

fn chain_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn node_log_url(ip: &str, port: u16, name: &str) -> String {
    format!("http://{}:{}/logs/{}", ip, port, name)
}

/// Directory backed by the network status service.
#[derive(Debug, Clone)]
pub struct StatusDirectory {
    http: Client,
    url: String,
    node_port: u16,
}

impl StatusDirectory {
    pub fn new(
        url: impl Into<String>,
        node_port: u16,
        timeout: Duration,
    ) -> Result<Self, CollectorError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Setup(e.to_string()))?;
        Ok(Self {
            http,
            url: url.into(),
            node_port,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl EndpointDirectory for StatusDirectory {
    async fn desired_endpoints(&self) -> Result<Vec<Endpoint>, CollectorError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| CollectorError::Directory(e.to_string()))?
            .error_for_status()
            .map_err(|e| CollectorError::Directory(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| CollectorError::Directory(e.to_string()))?;

        let endpoints = endpoints_from_status(&body, self.node_port)?;
        debug!(url = %self.url, endpoints = endpoints.len(), "Network status fetched");
        Ok(endpoints)
    }
}

/// Directory serving a fixed endpoint list.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    source: StaticSource,
}

#[derive(Debug, Clone)]
enum StaticSource {
    List(Vec<Endpoint>),
    /// Re-read on every fetch so edits take effect at the next reconciliation.
    File(PathBuf),
}

impl StaticDirectory {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            source: StaticSource::List(endpoints),
        }
    }

    /// A JSON array of `{targetUrl, serviceName, sourceIdentifier?}` objects.
    pub fn from_file(path: impl AsRef<Path>) -> Self {
        Self {
            source: StaticSource::File(path.as_ref().to_path_buf()),
        }
    }
}

#[async_trait]
impl EndpointDirectory for StaticDirectory {
    async fn desired_endpoints(&self) -> Result<Vec<Endpoint>, CollectorError> {
        match &self.source {
            StaticSource::List(endpoints) => Ok(endpoints.clone()),
            StaticSource::File(path) => {
                let contents = tokio::fs::read(path).await.map_err(|e| {
                    CollectorError::Directory(format!("{}: {}", path.display(), e))
                })?;
                serde_json::from_slice(&contents).map_err(|e| {
                    CollectorError::Directory(format!("{}: {}", path.display(), e))
                })
            }
        }
    }
}
