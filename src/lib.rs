//! # Snapshot Worker
//!
//! A queue-driven worker that screenshots product pages. Each job arrives on
//! an AMQP queue, is captured by a remote capture service, composed into one
//! image, uploaded to object storage and answered with exactly one result
//! message on a second queue.
//!
//! ## Pipeline
//!
//! | Stage | Module | Failure status |
//! |-------|--------|----------------|
//! | Receive job | [`consumer`] | rejected, never answered |
//! | Load page, read price, screenshot | [`capture`] | `PAGE_ERROR`, `PRICE_ERROR` |
//! | Trim and splice fragments | [`imaging`] | `SCREENSHOT_ERROR` |
//! | Upload composite | [`storage`] | `UPLOAD_TO_OSS_ERROR` |
//! | Publish result | [`publisher`] | delivery requeued |
//!
//! ## Broker behaviour
//!
//! - Prefetch is one and every delivery is acknowledged explicitly after its
//!   result is published, so a crash mid-job leads to redelivery.
//! - With `retry` enabled the consumer re-dials after any connection or
//!   channel loss and never gives up.
//! - Publishing is one connection per message, bounded by a deadline
//!   (5 seconds unless configured).
//!
//! ## CLI Usage
//!
//! ```bash
//! snapshot-worker --config worker.json run
//! snapshot-worker publish '{"channel":"ebay","country":"US","asin":"B000123","price":"19.99","priceNo":"1"}'
//! snapshot-worker splice top.png bottom.png page.jpeg
//! snapshot-worker cut page.png description.png 0 0 750 1200
//! ```

/// Configuration and settings for the worker
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Broker transport traits, connection descriptors and topology
pub mod broker;

/// lapin-backed AMQP transport
pub mod amqp;

/// Reconnecting consumer with explicit acknowledgement
pub mod consumer;

/// Single-shot publisher with a deadline
pub mod publisher;

/// Image decode, encode, splice and cut
pub mod imaging;

/// Job request and result messages
pub mod job;

/// Page capture collaborator
pub mod capture;

/// Object storage collaborator
pub mod storage;

/// Job orchestration from request to published result
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection and monitoring
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod memory_broker;


pub use amqp::*;
pub use broker::*;
pub use capture::*;
pub use cli::*;
pub use config::*;
pub use consumer::*;
pub use error::*;
pub use imaging::*;
pub use job::*;
pub use publisher::*;
pub use storage::*;
pub use utils::*;
pub use worker::*;
