//! `clicktime-sync` mirrors ClickTime time entries into an Elasticsearch
//! alias and removes indexed entries that no longer exist upstream.

/// Process-lifetime lookup caches for jobs, clients, tasks and users.
pub mod cache;
/// Command-line arguments.
pub mod cli;
/// ClickTime API client and time entry models.
pub mod clicktime;
/// Runtime configuration loading and validation.
pub mod config;
/// Denormalized index documents and reconciliation matching.
pub mod document;
/// Search index client.
pub mod index;
/// Logging setup.
pub mod logging;
/// Run metrics counters.
pub mod metrics;
/// Per-project reconciliation loop.
pub mod sync;
