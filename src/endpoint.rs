//! Endpoint and batch descriptors plus the source discovery protocol.

use reqwest::Url;
use serde::{Deserialize, Serialize};

/// One log source: a (service, node) pair reachable at `target_url`.
///
/// `target_url` is the identity key; two descriptors with the same URL
/// describe the same endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub target_url: String,
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_identifier: Option<String>,
}

impl Endpoint {
    pub fn new(target_url: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            service_name: service_name.into(),
            source_identifier: None,
        }
    }

    pub fn with_source_identifier(mut self, source_identifier: impl Into<String>) -> Self {
        self.source_identifier = Some(source_identifier.into());
        self
    }

    /// Host part of the target URL, if it parses.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.target_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }

    /// Identifier stamped on every envelope: the explicit one, else the host.
    pub fn source_identifier(&self) -> String {
        self.source_identifier
            .clone()
            .or_else(|| self.host())
            .unwrap_or_else(|| self.target_url.clone())
    }

    /// Directory name of this endpoint's offset ledger, e.g. `10_0_0_1_chain-42`.
    ///
    /// Stable across restarts so a new process re-attaches to the same files.
    pub fn ledger_key(&self) -> String {
        let host = self.host().unwrap_or_else(|| {
            let stripped = self
                .target_url
                .trim_start_matches("http://")
                .trim_start_matches("https://");
            stripped
                .split([':', '/'])
                .next()
                .unwrap_or(stripped)
                .to_string()
        });
        format!("{}_{}", directory_safe(&host), directory_safe(&self.service_name))
    }

    /// Batch list resource.
    pub fn discovery_url(&self) -> &str {
        &self.target_url
    }

    /// Streaming resource for one batch, resumed after `delivered` bytes.
    ///
    /// Sources number `start` from 1, so the first undelivered byte is
    /// `delivered + 1`.
    pub fn batch_url(&self, batch_id: u64, delivered: Option<u64>) -> String {
        let base = format!(
            "{}/batch/{}?follow",
            self.target_url.trim_end_matches('/'),
            batch_id
        );
        match delivered {
            Some(bytes) if bytes > 0 => format!("{}&start={}", base, bytes + 1),
            _ => base,
        }
    }
}

fn directory_safe(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A batch as reported by an endpoint's discovery response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDescriptor {
    pub id: u64,
    pub batch_size: u64,
}

impl BatchDescriptor {
    pub fn new(id: u64, batch_size: u64) -> Self {
        Self { id, batch_size }
    }
}

/// Discovery payload: either the batch list or an error object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DiscoveryPayload {
    Batches(Vec<BatchDescriptor>),
    Status {
        status: String,
        #[serde(flatten)]
        details: serde_json::Map<String, serde_json::Value>,
    },
}

/// Parse a discovery response body into batches sorted by ascending id.
pub fn parse_discovery(body: &[u8]) -> Result<Vec<BatchDescriptor>, String> {
    let payload: DiscoveryPayload =
        serde_json::from_slice(body).map_err(|e| format!("invalid discovery payload: {}", e))?;

    match payload {
        DiscoveryPayload::Batches(mut batches) => {
            batches.sort_by_key(|b| b.id);
            Ok(batches)
        }
        DiscoveryPayload::Status { status, details } => Err(format!(
            "endpoint reported status '{}': {}",
            status,
            serde_json::Value::Object(details)
        )),
    }
}
