//! Sources of candidate proxies.

use crate::error::SourceError;
use crate::proxy::ProxyAddr;

use async_trait::async_trait;
use futures::future;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// A protocol/anonymity capability advertised by a proxy broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyType {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub level: String,
}

impl ProxyType {
    pub fn new(kind: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            level: level.into(),
        }
    }
}

/// One candidate proxy as reported by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub host: String,
    pub port: u16,
    /// Declared capabilities; empty when the source does not declare any.
    #[serde(default)]
    pub types: Vec<ProxyType>,
}

impl ProxyRecord {
    pub fn addr(&self) -> ProxyAddr {
        ProxyAddr::new(self.host.clone(), self.port)
    }

    /// Whether this record may be used when `capability` is required.
    ///
    /// Untyped records (plain `host:port` lists) are always accepted.
    pub fn supports(&self, capability: Option<&ProxyType>) -> bool {
        match capability {
            Some(capability) if !self.types.is_empty() => self.types.contains(capability),
            _ => true,
        }
    }
}

/// Supplier of candidate proxies.
#[async_trait]
pub trait ProxySource: Send + Sync {
    /// Fetch the current list of candidates.
    async fn fetch(&self) -> Result<Vec<ProxyRecord>, SourceError>;
}

/// Proxy list read from an HTTP(S) URL or a local file.
#[derive(Debug, Clone)]
pub struct UrlSource {
    location: String,
    client: Client,
}

impl UrlSource {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            client: Client::new(),
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }
}

#[async_trait]
impl ProxySource for UrlSource {
    async fn fetch(&self) -> Result<Vec<ProxyRecord>, SourceError> {
        let content = if self.location.starts_with("http") {
            let response = self.client.get(&self.location).send().await?;
            response.error_for_status()?.text().await?
        } else {
            tokio::fs::read_to_string(&self.location).await?
        };
        parse_proxy_list(&content)
    }
}

/// Several sources queried concurrently; individual failures are logged.
#[derive(Default)]
pub struct SourceSet {
    sources: Vec<UrlSource>,
}

impl SourceSet {
    pub fn from_locations(locations: &[String]) -> Self {
        Self {
            sources: locations.iter().map(UrlSource::new).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl ProxySource for SourceSet {
    async fn fetch(&self) -> Result<Vec<ProxyRecord>, SourceError> {
        info!("Fetching proxies from {} sources", self.sources.len());

        let results = future::join_all(self.sources.iter().map(|source| source.fetch())).await;

        let mut all_records = Vec::new();
        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(records) => {
                    info!("Fetched {} proxies from {}", records.len(), source.location());
                    all_records.extend(records);
                }
                Err(e) => {
                    warn!("Failed to fetch proxies from {}: {}", source.location(), e);
                }
            }
        }
        Ok(all_records)
    }
}

/// Parse a proxy list: a JSON array of broker records, or plain text with one
/// `host:port` per line.
pub(crate) fn parse_proxy_list(content: &str) -> Result<Vec<ProxyRecord>, SourceError> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }

    Ok(content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line
                .split_once("://")
                .map_or(line, |(_, rest)| rest);
            match line.parse::<ProxyAddr>() {
                Ok(addr) => Some(ProxyRecord {
                    host: addr.host,
                    port: addr.port,
                    types: Vec::new(),
                }),
                Err(_) => {
                    warn!("Skipping malformed proxy entry {:?}", line);
                    None
                }
            }
        })
        .collect())
}
