//! Requests, responses and the polymorphic result of a download.

use crate::error::EngineError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use url::Url;

/// A unit of crawl work.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub url: Url,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Higher values are dequeued first.
    pub priority: i32,
}

impl Request {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            priority: 0,
        }
    }

    /// Parses `url` and builds a `GET` request for it.
    pub fn get(url: &str) -> Result<Self, EngineError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_referer(self, referer: &Url) -> Self {
        self.with_header("Referer", referer.as_str())
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn referer(&self) -> Option<&str> {
        self.header("referer")
    }

    /// The host this request targets, if the URL has one.
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Identity used for duplicate filtering: method plus URL without its fragment.
    pub fn fingerprint(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        format!("{} {}", self.method, url)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.method, self.url)
    }
}

/// A downloaded page.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    request: Option<Box<Request>>,
}

impl Response {
    pub fn new(url: Url, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url,
            status,
            headers: BTreeMap::new(),
            body: body.into(),
            request: None,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// The request that produced this response, once the engine has tied them together.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_deref()
    }

    pub(crate) fn set_request(&mut self, request: Request) {
        self.request = Some(Box::new(request));
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{} {}>", self.status, self.url)
    }
}

/// What a downloader hands back for a request.
#[derive(Debug, Clone)]
pub enum DownloadOutcome {
    /// A terminal response, bound for the scraper.
    Response(Response),
    /// The downloader wants this request scheduled first (a redirect, for instance).
    FollowUp(Request),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_are_case_insensitive() {
        let referer = Url::parse("https://a.com/index").unwrap();
        let request = Request::get("https://a.com/page")
            .unwrap()
            .with_header("X-Token", "abc")
            .with_referer(&referer);

        assert_eq!(request.header("x-token"), Some("abc"));
        assert_eq!(request.header("X-TOKEN"), Some("abc"));
        assert_eq!(request.referer(), Some("https://a.com/index"));
        assert_eq!(request.host(), Some("a.com"));
    }

    #[test]
    fn fingerprint_ignores_fragment() {
        let a = Request::get("https://a.com/page#top").unwrap();
        let b = Request::get("https://a.com/page#bottom").unwrap();
        let c = Request::get("https://a.com/other").unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn invalid_url_is_reported() {
        assert!(matches!(
            Request::get("not a url"),
            Err(EngineError::InvalidUrl(_))
        ));
    }
}
