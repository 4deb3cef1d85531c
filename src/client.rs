//! Request API: one entry point per HTTP verb, all routed through the pool.

use crate::classify::RetryTrigger;
use crate::error::Error;
use crate::pool::ProxyPool;
use crate::retry::{RequestPolicy, Retrier};
use crate::transport::{ReqwestTransport, Transport};

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, Request, Response};
use std::sync::Arc;
use url::{form_urlencoded, Url};

/// Optional parts of a request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Option<(Vec<u8>, Option<HeaderValue>)>,
    retry_on: RetryTrigger,
    follow_redirects: Option<bool>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append query string parameters.
    pub fn query<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Raw request body.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some((body.into(), None));
        self
    }

    /// `application/x-www-form-urlencoded` body.
    pub fn form<K, V>(mut self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields)
            .finish();
        self.body = Some((
            encoded.into_bytes(),
            Some(HeaderValue::from_static("application/x-www-form-urlencoded")),
        ));
        self
    }

    /// JSON body.
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Result<Self, Error> {
        self.body = Some((
            serde_json::to_vec(value)?,
            Some(HeaderValue::from_static("application/json")),
        ));
        Ok(self)
    }

    /// Retry with another proxy when a response matches `trigger`.
    pub fn retry_on(mut self, trigger: RetryTrigger) -> Self {
        self.retry_on = trigger;
        self
    }

    /// Override the verb's redirect default.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = Some(follow);
        self
    }

    fn into_request(self, method: Method, url: &str) -> Result<(Request, RequestPolicy), Error> {
        let mut url = Url::parse(url)?;
        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }

        // HEAD is the only verb that does not follow redirects unless asked.
        let follow_redirects = self.follow_redirects.unwrap_or(method != Method::HEAD);
        let mut request = Request::new(method, url);
        *request.headers_mut() = self.headers;
        if let Some((body, content_type)) = self.body {
            if let Some(content_type) = content_type {
                request
                    .headers_mut()
                    .entry(CONTENT_TYPE)
                    .or_insert(content_type);
            }
            *request.body_mut() = Some(body.into());
        }

        let policy = RequestPolicy {
            retry_on: self.retry_on,
            follow_redirects,
        };
        Ok((request, policy))
    }
}

/// HTTP client that sends every request through the proxy pool.
#[derive(Clone)]
pub struct ProxyClient {
    retrier: Retrier,
}

impl ProxyClient {
    /// Create a client using reqwest as transport.
    ///
    /// Attempt statistics go to the configured stats directory, if any.
    pub fn new(pool: Arc<ProxyPool>) -> Self {
        Self::with_transport(pool, Arc::new(ReqwestTransport))
    }

    /// Create a client with a custom transport.
    pub fn with_transport(pool: Arc<ProxyPool>, transport: Arc<dyn Transport>) -> Self {
        Self {
            retrier: Retrier::with_configured_stats(pool, transport),
        }
    }

    pub fn from_retrier(retrier: Retrier) -> Self {
        Self { retrier }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        self.retrier.pool()
    }

    pub fn retrier(&self) -> &Retrier {
        &self.retrier
    }

    /// Send a request with an arbitrary method.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let (request, policy) = options.into_request(method, url)?;
        self.retrier.execute(request, &policy).await
    }

    /// Send a GET request. Follows redirects by default.
    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::GET, url, options).await
    }

    /// Send a HEAD request. Does not follow redirects by default.
    pub async fn head(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::HEAD, url, options).await
    }

    /// Send a POST request.
    pub async fn post(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::POST, url, options).await
    }

    /// Send a PUT request.
    pub async fn put(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::PUT, url, options).await
    }

    /// Send a PATCH request.
    pub async fn patch(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::PATCH, url, options).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::DELETE, url, options).await
    }

    /// Send an OPTIONS request. Follows redirects by default.
    pub async fn options(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::OPTIONS, url, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn head_does_not_follow_redirects_by_default() {
        let (_, policy) = RequestOptions::new()
            .into_request(Method::HEAD, "https://example.com/")
            .unwrap();
        assert!(!policy.follow_redirects);

        for method in [Method::GET, Method::OPTIONS, Method::POST, Method::DELETE] {
            let (_, policy) = RequestOptions::new()
                .into_request(method, "https://example.com/")
                .unwrap();
            assert!(policy.follow_redirects);
        }

        let (_, policy) = RequestOptions::new()
            .follow_redirects(true)
            .into_request(Method::HEAD, "https://example.com/")
            .unwrap();
        assert!(policy.follow_redirects);
    }

    #[test]
    fn query_and_json_body_are_applied() {
        let (request, _) = RequestOptions::new()
            .query([("q", "rust proxy"), ("page", "2")])
            .json(&json!({"name": "value"}))
            .unwrap()
            .into_request(Method::POST, "https://example.com/search?lang=en")
            .unwrap();

        assert_eq!(
            request.url().as_str(),
            "https://example.com/search?lang=en&q=rust+proxy&page=2"
        );
        assert_eq!(request.headers()[CONTENT_TYPE], "application/json");
        let body = request.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(body, br#"{"name":"value"}"#);
    }

    #[test]
    fn explicit_content_type_wins_over_form_default() {
        let (request, _) = RequestOptions::new()
            .header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))
            .form([("a", "1"), ("b", "x y")])
            .into_request(Method::PUT, "https://example.com/")
            .unwrap();
        assert_eq!(request.headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(request.body().and_then(|b| b.as_bytes()).unwrap(), b"a=1&b=x+y");
    }

    #[test]
    fn invalid_url_is_rejected() {
        let result = RequestOptions::new().into_request(Method::GET, "not a url");
        assert!(matches!(result, Err(Error::InvalidUrl(_))));
    }
}
