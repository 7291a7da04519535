//! `reqwest`-backed transport.

use super::Fetcher;
use crate::error::EngineError;
use crate::request::{DownloadOutcome, Request, Response};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::{redirect, Client, Method};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// HTTP transport. Redirects are never followed by the client; they come
/// back as [`DownloadOutcome::FollowUp`] so the engine schedules the target.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .user_agent(concat!("spider-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Wraps a preconfigured client. It should not follow redirects itself.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn follow_up(request: &Request, status: u16, location: &str) -> Result<Request, EngineError> {
    let target = request.url.join(location)?;
    // 307 and 308 keep the method; the rest degrade to GET.
    let method = if matches!(status, 307 | 308) {
        request.method.clone()
    } else {
        "GET".to_string()
    };
    let mut redirected = Request {
        url: target,
        method,
        headers: request.headers.clone(),
        priority: request.priority,
    };
    redirected.headers.remove("referer");
    Ok(redirected.with_referer(&request.url))
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<DownloadOutcome, EngineError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|e| EngineError::Download(format!("invalid method {}: {}", request.method, e)))?;

        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok());
            if let Some(location) = location {
                let redirected = follow_up(request, status.as_u16(), location)?;
                debug!(
                    "Redirecting ({}) to {} from {}",
                    status.as_u16(),
                    redirected,
                    request
                );
                return Ok(DownloadOutcome::FollowUp(redirected));
            }
        }

        let url = response.url().clone();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        let mut page = Response::new(url, status.as_u16(), body);
        page.headers = headers;
        Ok(DownloadOutcome::Response(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_resolves_relative_location() {
        let request = Request::get("https://a.com/old/page")
            .unwrap()
            .with_priority(3);
        let redirected = follow_up(&request, 301, "../new").unwrap();
        assert_eq!(redirected.url.as_str(), "https://a.com/new");
        assert_eq!(redirected.method, "GET");
        assert_eq!(redirected.priority, 3);
        assert_eq!(redirected.referer(), Some("https://a.com/old/page"));
    }

    #[test]
    fn temporary_redirect_keeps_method() {
        let mut request = Request::get("https://a.com/form").unwrap();
        request.method = "POST".to_string();
        let redirected = follow_up(&request, 307, "https://b.com/form").unwrap();
        assert_eq!(redirected.method, "POST");
        assert_eq!(redirected.host(), Some("b.com"));
    }
}
