//! The freight metrics forwarding agent.
//!
//! Freight runs beside a single application process, collects point-in-time
//! measurements from a statsd UDP listener and a Prometheus scrape endpoint,
//! reduces them into per-interval metric sets, and POSTs those sets as JSON
//! to an upstream ingestion endpoint. This library supports the freight
//! binary found elsewhere in this project; it is not intended as a
//! general-purpose crate, although if the pieces are useful elsewhere that's
//! a nice surprise.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod reporter;
pub mod scrape;
pub mod shutdown;
pub mod statsd;

use freight_metrics::Measurement;

/// Sending half of the agent's inbox: the bounded handoff channel from every
/// ingress source to the aggregator.
pub type Inbox = tokio::sync::mpsc::Sender<Measurement>;
