//! HTTP transport used to run one attempt through one proxy.

use crate::config::ProxyPoolConfig;
use crate::error::{TransportError, TransportErrorKind};
use crate::proxy::ProxyAddr;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::time::Duration;

/// Per-attempt client settings.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub follow_redirects: bool,
    pub user_agent: String,
}

impl TransportSettings {
    pub fn from_config(config: &ProxyPoolConfig, follow_redirects: bool) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            follow_redirects,
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Performs a request through a given proxy.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: reqwest::Request,
        proxy: &ProxyAddr,
        settings: &TransportSettings,
    ) -> Result<reqwest::Response, TransportError>;
}

/// Transport backed by a fresh `reqwest::Client` per attempt.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport;

impl ReqwestTransport {
    fn client_for(
        proxy: &ProxyAddr,
        settings: &TransportSettings,
    ) -> Result<reqwest::Client, TransportError> {
        // An address reqwest refuses to use is the proxy's fault.
        let reqwest_proxy = reqwest::Proxy::all(proxy.url())
            .map_err(|e| TransportError::new(TransportErrorKind::Proxy, e))?;
        let redirect = if settings.follow_redirects {
            Policy::default()
        } else {
            Policy::none()
        };

        reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .connect_timeout(settings.connect_timeout)
            .timeout(settings.connect_timeout + settings.read_timeout)
            .redirect(redirect)
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(|e| TransportError::new(TransportErrorKind::Proxy, e))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: reqwest::Request,
        proxy: &ProxyAddr,
        settings: &TransportSettings,
    ) -> Result<reqwest::Response, TransportError> {
        let client = Self::client_for(proxy, settings)?;
        Ok(client.execute(request).await?)
    }
}
