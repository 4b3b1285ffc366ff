//! The Prometheus scrape poller.
//!
//! Every interval the poller fetches one exposition from the target --
//! delimited protobuf or text format 0.0.4, negotiated by Content-Type --
//! flattens the metric families into agent measurements, and forwards them
//! to the inbox. The forward never blocks: scrapes arrive in bursts that
//! must not stall the aggregator, so a full inbox drops the measurement.
//! A failed or slow scrape is abandoned and the loop resumes on the next
//! tick.
//!
//! ## Metrics
//!
//! `scrapes_completed`: Scrapes fully decoded and forwarded
//! `scrapes_failed`: Scrapes abandoned on transport, status or decode errors
//! `scrape_measurements_dropped`: Measurements dropped on a full inbox
//!

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use freight_metrics::{Measurement, MetricKind, Modifier};
use metrics::counter;
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::{shutdown::Shutdown, Inbox};

pub mod proto;
pub mod text;

use proto::{LabelPair, MetricFamily, MetricType};

/// The Accept header offered on every scrape: delimited protobuf preferred,
/// text format 0.0.4 accepted.
pub const ACCEPT_HEADER: &str = "application/vnd.google.protobuf;proto=io.prometheus.client.MetricFamily;encoding=delimited;q=0.7,text/plain;version=0.0.4;q=0.3";

const PROTOBUF_MEDIA_TYPE: &str = "application/vnd.google.protobuf";
const PROTOBUF_PROTO: &str = "io.prometheus.client.MetricFamily";
const PROTOBUF_ENCODING: &str = "delimited";

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Prometheus`].
pub enum Error {
    /// The scrape request could not be sent or its body not read.
    #[error("scrape request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with a non-success status.
    #[error("scrape returned HTTP status {0}")]
    Status(reqwest::StatusCode),
    /// A text exposition that is not UTF-8.
    #[error("exposition is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    /// A text exposition that does not parse.
    #[error("failed to decode text exposition: {0}")]
    Text(#[from] text::ParseError),
    /// A protobuf exposition that does not decode.
    #[error("failed to decode protobuf exposition: {0}")]
    Protobuf(#[from] prost::DecodeError),
    /// The inbox receiver is gone; the agent is shutting down.
    #[error("inbox closed")]
    InboxClosed,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Prometheus`].
pub struct Config {
    /// URL to scrape.
    pub url: String,
    /// Accept header override. Leave unset for the standard negotiation.
    #[serde(default)]
    pub accept: Option<String>,
}

#[derive(Debug)]
/// The Prometheus scrape poller.
pub struct Prometheus {
    config: Config,
    interval: Duration,
    inbox: Inbox,
    shutdown: Shutdown,
}

impl Prometheus {
    /// Create a new [`Prometheus`] poller instance.
    #[must_use]
    pub fn new(config: Config, interval: Duration, inbox: Inbox, shutdown: Shutdown) -> Self {
        Self {
            config,
            interval,
            inbox,
            shutdown,
        }
    }

    /// Run [`Prometheus`] to completion.
    ///
    /// Scrapes the target every interval until a shutdown signal is
    /// received. A failed scrape is logged and abandoned, never fatal; each
    /// scrape lives under a deadline of one interval so a slow endpoint
    /// cannot overlap the next tick.
    ///
    /// # Errors
    ///
    /// None are known.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            config,
            interval,
            inbox,
            shutdown,
        } = self;

        let client = reqwest::Client::new();
        let accept = config
            .accept
            .clone()
            .unwrap_or_else(|| ACCEPT_HEADER.to_string());
        info!(url = %config.url, ?interval, "prometheus scrape poller running");

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let scrape = scrape_once(&client, &config.url, &accept, &inbox);
                    match tokio::time::timeout(interval, scrape).await {
                        Ok(Ok(forwarded)) => {
                            counter!("scrapes_completed").increment(1);
                            debug!(forwarded, "scrape completed");
                        }
                        Ok(Err(Error::InboxClosed)) => {
                            warn!("inbox closed, stopping scrape poller");
                            return Ok(());
                        }
                        Ok(Err(err)) => {
                            counter!("scrapes_failed").increment(1);
                            warn!("scrape failed: {err}");
                        }
                        Err(_elapsed) => {
                            counter!("scrapes_failed").increment(1);
                            warn!("scrape deadline of {interval:?} exceeded");
                        }
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}

/// Fetch and decode one exposition, forwarding the flattened measurements.
/// Returns how many were forwarded.
async fn scrape_once(
    client: &reqwest::Client,
    url: &str,
    accept: &str,
    inbox: &Inbox,
) -> Result<usize, Error> {
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, accept)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::Status(status));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response.bytes().await?;

    let families = if is_protobuf_exposition(&content_type) {
        proto::decode_delimited(&body)?
    } else {
        // We could inspect the content type further, but the fallback would
        // be the text format anyway, so just try it.
        text::decode(std::str::from_utf8(&body)?)?
    };

    let mut forwarded = 0_usize;
    for family in &families {
        for measurement in family_to_measurements(family) {
            match inbox.try_send(measurement) {
                Ok(()) => forwarded += 1,
                Err(TrySendError::Full(measurement)) => {
                    counter!("scrape_measurements_dropped").increment(1);
                    warn!(name = %measurement.name, "inbox full, dropping scraped measurement");
                }
                Err(TrySendError::Closed(_)) => return Err(Error::InboxClosed),
            }
        }
    }
    Ok(forwarded)
}

/// True when a Content-Type names the delimited protobuf exposition: media
/// type, `proto` and `encoding` parameters must all match.
fn is_protobuf_exposition(content_type: &str) -> bool {
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case(PROTOBUF_MEDIA_TYPE) {
        return false;
    }

    let mut proto = false;
    let mut encoding = false;
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "proto" => proto = value == PROTOBUF_PROTO,
            "encoding" => encoding = value == PROTOBUF_ENCODING,
            _ => {}
        }
    }
    proto && encoding
}

/// Flatten one metric family into measurements.
///
/// Gauge families emit gauges, counter families emit derived counters --
/// Prometheus counters are raw monotonic readings, the aggregator computes
/// per-interval deltas -- and summaries emit a `_sum` and `_count` derived
/// counter pair. Histogram and untyped families emit nothing.
fn family_to_measurements(family: &MetricFamily) -> Vec<Measurement> {
    let name = family.name.as_deref().unwrap_or_default();
    let mut out = Vec::new();

    match family.kind() {
        MetricType::Gauge => {
            for metric in &family.metric {
                out.push(measurement(
                    format!("{name}{}", label_suffix(&metric.label)),
                    MetricKind::Gauge,
                    metric.gauge.and_then(|gauge| gauge.value).unwrap_or(0.0),
                    metric.timestamp_ms,
                ));
            }
        }
        MetricType::Counter => {
            for metric in &family.metric {
                out.push(measurement(
                    format!("{name}{}", label_suffix(&metric.label)),
                    MetricKind::DerivedCounter,
                    metric
                        .counter
                        .and_then(|counter| counter.value)
                        .unwrap_or(0.0),
                    metric.timestamp_ms,
                ));
            }
        }
        MetricType::Summary => {
            for metric in &family.metric {
                let Some(summary) = metric.summary.as_ref() else {
                    continue;
                };
                let suffix = label_suffix(&metric.label);
                out.push(measurement(
                    format!("{name}_sum{suffix}"),
                    MetricKind::DerivedCounter,
                    summary.sample_sum.unwrap_or(0.0),
                    metric.timestamp_ms,
                ));
                out.push(measurement(
                    format!("{name}_count{suffix}"),
                    MetricKind::DerivedCounter,
                    summary.sample_count.unwrap_or(0) as f64,
                    metric.timestamp_ms,
                ));
            }
        }
        // Histograms await a decision on bucket handling; untyped metrics
        // carry no type to aggregate under.
        MetricType::Histogram | MetricType::Untyped => {}
    }

    out
}

fn measurement(
    name: String,
    kind: MetricKind,
    value: f64,
    timestamp_ms: Option<i64>,
) -> Measurement {
    Measurement {
        name,
        timestamp: ms_to_time(timestamp_ms.unwrap_or(0)),
        kind,
        value,
        sample_rate: 1.0,
        modifier: Modifier::default(),
    }
}

/// A dot separated suffix of sanitized `key_value` pairs, in exposition
/// order. Empty when there are no labels.
fn label_suffix(labels: &[LabelPair]) -> String {
    let mut out = String::new();
    for pair in labels {
        out.push('.');
        out.push_str(&sanitize(pair.name.as_deref().unwrap_or_default()));
        out.push('_');
        out.push_str(&sanitize(pair.value.as_deref().unwrap_or_default()));
    }
    out
}

/// Restrict a label fragment to the metric name character class; anything
/// outside `[A-Za-z0-9._-]` becomes an underscore.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[allow(clippy::cast_sign_loss)]
fn ms_to_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}
