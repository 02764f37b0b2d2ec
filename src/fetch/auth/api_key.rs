use crate::fetch::client::HttpClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// Header name and value are validated once, at construction.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(header_name.as_bytes())
            .with_context(|| format!("invalid API key header name {header_name:?}"))?;
        let mut key = HeaderValue::from_str(key).context("invalid API key")?;
        key.set_sensitive(true);
        Ok(Self {
            inner,
            header_name,
            key,
        })
    }

    /// `x-api-key: <key>`, as used by the MTA feeds.
    pub fn x_api_key(inner: C, key: &str) -> Result<Self> {
        Self::new(inner, "x-api-key", key)
    }

    /// `Authorization: Bearer <key>`.
    pub fn bearer(inner: C, key: &str) -> Result<Self> {
        Self::new(inner, "Authorization", &format!("Bearer {key}"))
    }

    fn authorize(&self, req: &mut reqwest::Request) {
        req.headers_mut()
            .insert(self.header_name.clone(), self.key.clone());
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.authorize(&mut req);
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> reqwest::Request {
        reqwest::Request::new(
            reqwest::Method::GET,
            "https://example.com/feed".parse().unwrap(),
        )
    }

    #[test]
    fn test_x_api_key_sets_header() {
        let auth = ApiKey::x_api_key((), "secret").unwrap();
        let mut req = request();
        auth.authorize(&mut req);
        assert_eq!(req.headers().get("x-api-key").unwrap(), "secret");
    }

    #[test]
    fn test_bearer_sets_authorization() {
        let auth = ApiKey::bearer((), "token").unwrap();
        let mut req = request();
        auth.authorize(&mut req);
        assert_eq!(req.headers().get("authorization").unwrap(), "Bearer token");
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        assert!(ApiKey::new((), "bad header", "x").is_err());
        assert!(ApiKey::new((), "x-api-key", "line\nbreak").is_err());
    }
}
