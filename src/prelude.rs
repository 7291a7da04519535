//! A "prelude" for users of the `spider-engine` crate.
//!
//! This prelude re-exports the most commonly used traits and structs so that
//! they can be easily imported.
//!
//! # Example
//!
//! ```
//! use spider_engine::prelude::*;
//! ```

pub use crate::{
    // Core structs
    EngineBuilder,
    ExecutionEngine,
    // Collaborator traits
    Downloader,
    EngineListener,
    Fetcher,
    Scheduler,
    Scraper,
    Spider,
    // Data types
    DownloadOutcome,
    EngineError,
    IdleVerdict,
    ParseOutput,
    Request,
    Response,
    // Essential re-exports for trait implementation
    async_trait,
};
