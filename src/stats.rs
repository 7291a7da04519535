//! # Statistics Module
//!
//! Collects per-domain statistics about the engine's operation.
//!
//! ## Overview
//!
//! The engine reports two lifecycle facts to its [`StatsSink`]: when a domain
//! opens and when (and why) it closes. Along the way it bumps named counters
//! for scheduled, received, ignored and failed requests, and the scraper adds
//! scraped item counts. [`StatCollector`] is the bundled sink; it keeps one
//! record per domain session and global totals, and renders them as JSON,
//! Markdown or a plain-text summary.
//!
//! ## Example
//!
//! ```rust,ignore
//! use spider_engine::stats::{StatCollector, StatsSink};
//!
//! let stats = StatCollector::new();
//! stats.open_domain("example.com");
//! stats.inc_value("example.com", "response_received_count");
//! stats.close_domain("example.com", "finished");
//! println!("{}", stats.to_markdown_string());
//! ```

use crate::error::EngineError;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub const REQUEST_SCHEDULED: &str = "request_scheduled_count";
pub const RESPONSE_RECEIVED: &str = "response_received_count";
pub const REQUEST_IGNORED: &str = "request_ignored_count";
pub const REQUEST_FAILED: &str = "request_failed_count";
pub const ITEM_SCRAPED: &str = "item_scraped_count";

/// Statistics contract consumed by the engine and scraper.
pub trait StatsSink: Send + Sync {
    fn open_domain(&self, domain: &str);
    fn close_domain(&self, domain: &str, reason: &str);
    /// Bumps a named counter for `domain`.
    fn inc_value(&self, domain: &str, key: &str) {
        let _ = (domain, key);
    }
}

/// Statistics of one domain session.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStats {
    /// Seconds since the Unix epoch.
    pub start_time: u64,
    pub finish_time: Option<u64>,
    pub finish_reason: Option<String>,
    pub values: BTreeMap<String, usize>,
    #[serde(skip)]
    opened_at: Instant,
    #[serde(skip)]
    elapsed: Option<Duration>,
}

impl DomainStats {
    fn new() -> Self {
        Self {
            start_time: unix_now(),
            finish_time: None,
            finish_reason: None,
            values: BTreeMap::new(),
            opened_at: Instant::now(),
            elapsed: None,
        }
    }

    pub fn value(&self, key: &str) -> usize {
        self.values.get(key).copied().unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.finish_reason.is_none()
    }

    /// Time the session has been (or was) open.
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.opened_at.elapsed())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Collects and stores statistics about each domain session.
#[derive(Debug, Serialize)]
pub struct StatCollector {
    #[serde(skip)]
    pub start_time: Instant,
    pub domains_opened: AtomicUsize,
    pub domains_closed: AtomicUsize,
    pub domains: DashMap<String, DomainStats>,
}

impl StatCollector {
    pub fn new() -> Self {
        StatCollector {
            start_time: Instant::now(),
            domains_opened: AtomicUsize::new(0),
            domains_closed: AtomicUsize::new(0),
            domains: DashMap::new(),
        }
    }

    /// A copy of the statistics recorded for `domain`.
    pub fn domain(&self, domain: &str) -> Option<DomainStats> {
        self.domains.get(domain).map(|entry| entry.value().clone())
    }

    pub fn get_value(&self, domain: &str, key: &str) -> usize {
        self.domains
            .get(domain)
            .map(|entry| entry.value().value(key))
            .unwrap_or(0)
    }

    /// Sum of a named counter over every domain.
    pub fn total(&self, key: &str) -> usize {
        self.domains.iter().map(|entry| entry.value().value(key)).sum()
    }

    fn sorted_domains(&self) -> Vec<(String, DomainStats)> {
        let mut domains: Vec<(String, DomainStats)> = self
            .domains
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        domains.sort_by(|a, b| a.0.cmp(&b.0));
        domains
    }

    pub fn to_json_string(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_string_pretty(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Exports the current statistics to a Markdown formatted string.
    pub fn to_markdown_string(&self) -> String {
        let rows: String = self
            .sorted_domains()
            .into_iter()
            .map(|(domain, stats)| {
                format!(
                    "| {} | {} | {} | {} | {} | {} | {:?} |\n",
                    domain,
                    stats.finish_reason.as_deref().unwrap_or("open"),
                    stats.value(REQUEST_SCHEDULED),
                    stats.value(RESPONSE_RECEIVED),
                    stats.value(REQUEST_IGNORED) + stats.value(REQUEST_FAILED),
                    stats.value(ITEM_SCRAPED),
                    stats.elapsed(),
                )
            })
            .collect();

        format!(
            r#"# Crawl Statistics Report

- **Duration**: {:?}
- **Domains**: {} opened, {} closed

| Domain | Status | Scheduled | Received | Ignored/Failed | Items | Elapsed |
|--------|--------|-----------|----------|----------------|-------|---------|
{}"#,
            self.start_time.elapsed(),
            self.domains_opened.load(Ordering::SeqCst),
            self.domains_closed.load(Ordering::SeqCst),
            rows
        )
    }
}

impl Default for StatCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for StatCollector {
    fn open_domain(&self, domain: &str) {
        self.domains_opened.fetch_add(1, Ordering::SeqCst);
        let mut session = DomainStats::new();
        // Keep counters bumped while the domain waited for admission.
        if let Some((_, waiting)) = self.domains.remove(domain) {
            if waiting.is_open() {
                session.values = waiting.values;
            }
        }
        self.domains.insert(domain.to_string(), session);
    }

    fn close_domain(&self, domain: &str, reason: &str) {
        self.domains_closed.fetch_add(1, Ordering::SeqCst);
        let mut stats = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainStats::new);
        stats.finish_time = Some(unix_now());
        stats.finish_reason = Some(reason.to_string());
        stats.elapsed = Some(stats.opened_at.elapsed());
    }

    fn inc_value(&self, domain: &str, key: &str) {
        let mut stats = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(DomainStats::new);
        *stats.values.entry(key.to_string()).or_insert(0) += 1;
    }
}

impl fmt::Display for StatCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nCrawl Statistics")?;
        writeln!(f, "----------------")?;
        writeln!(f, "  duration : {:?}", self.start_time.elapsed())?;
        writeln!(
            f,
            "  domains  : opened: {}, closed: {}",
            self.domains_opened.load(Ordering::SeqCst),
            self.domains_closed.load(Ordering::SeqCst)
        )?;
        for (domain, stats) in self.sorted_domains() {
            let values = stats
                .values
                .iter()
                .map(|(key, value)| format!("{}: {}", key, value))
                .collect::<Vec<String>>()
                .join(", ");
            writeln!(
                f,
                "  {} ({}) {}",
                domain,
                stats.finish_reason.as_deref().unwrap_or("open"),
                values
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_domain_session() {
        let stats = StatCollector::new();
        stats.open_domain("a.com");
        stats.inc_value("a.com", RESPONSE_RECEIVED);
        stats.inc_value("a.com", RESPONSE_RECEIVED);
        assert!(stats.domain("a.com").unwrap().is_open());

        stats.close_domain("a.com", "finished");

        let session = stats.domain("a.com").unwrap();
        assert_eq!(session.finish_reason.as_deref(), Some("finished"));
        assert!(session.finish_time.is_some());
        assert_eq!(session.value(RESPONSE_RECEIVED), 2);
        assert_eq!(stats.domains_closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn totals_span_domains() {
        let stats = StatCollector::new();
        stats.inc_value("a.com", ITEM_SCRAPED);
        stats.inc_value("b.com", ITEM_SCRAPED);
        assert_eq!(stats.total(ITEM_SCRAPED), 2);
        assert_eq!(stats.get_value("c.com", ITEM_SCRAPED), 0);
    }

    #[test]
    fn counters_survive_admission_but_not_reopening() {
        let stats = StatCollector::new();
        stats.inc_value("a.com", REQUEST_SCHEDULED);
        stats.open_domain("a.com");
        assert_eq!(stats.get_value("a.com", REQUEST_SCHEDULED), 1);

        stats.close_domain("a.com", "finished");
        stats.open_domain("a.com");
        assert_eq!(stats.get_value("a.com", REQUEST_SCHEDULED), 0);
    }

    #[test]
    fn renders_reports() {
        let stats = StatCollector::new();
        stats.open_domain("a.com");
        stats.close_domain("a.com", "cancelled");

        let json = stats.to_json_string().unwrap();
        assert!(json.contains("\"finish_reason\":\"cancelled\""));
        assert!(stats.to_markdown_string().contains("| a.com | cancelled |"));
        assert!(stats.to_string().contains("a.com (cancelled)"));
    }
}
