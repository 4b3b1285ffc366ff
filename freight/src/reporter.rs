//! The report loop: inbox ingest, periodic rotation, bounded upload.
//!
//! One task owns the live [`MetricSet`]. Measurements drain from the inbox
//! into it; on every tick the set is snapshotted, the snapshot becomes the
//! next interval's parent, and a flush task uploads it as JSON. Flushes are
//! spawned, never awaited inline, so upload latency cannot stall ingest;
//! each one lives under a deadline of twice the flush interval.
//!
//! ## Metrics
//!
//! `uploads_completed`: Snapshots accepted upstream
//! `uploads_failed`: Snapshots dropped after terminal upload failure
//!

use std::{sync::Arc, time::Duration};

use chrono::{SecondsFormat, Utc};
use freight_metrics::{Measurement, MetricSet};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;

/// Header carrying the snapshot's counter-plus-gauge cardinality.
pub const HEADER_MEASUREMENTS_COUNT: &str = "Measurements-Count";
/// Header carrying the flush start time, RFC3339 in UTC.
pub const HEADER_MEASUREMENTS_TIME: &str = "Measurements-Time";

/// Retries after the first attempt, for retryable statuses only.
const MAX_RETRIES: u32 = 3;
/// First pause between attempts; doubles after every retry.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
/// Upper bound on how much rejection body ends up in the error.
const BODY_EXCERPT_LIMIT: usize = 512;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Reporter`].
pub enum Error {
    /// The inbox closed while the agent was still running.
    #[error("inbox closed before shutdown")]
    EarlyInboxClose,
}

#[derive(thiserror::Error, Debug)]
/// Terminal outcomes of one upload.
pub enum SendError {
    /// The shutdown signal arrived before or between attempts.
    #[error("upload cancelled")]
    Cancelled,
    /// The request could not be delivered at all.
    #[error("upload transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The upstream rejected the upload; retrying would not help.
    #[error("upstream service replied with status={status}: {body:?}")]
    Rejected {
        /// The 4xx status the upstream answered with.
        status: reqwest::StatusCode,
        /// An excerpt of the response body.
        body: String,
    },
    /// Every attempt failed with a retryable status.
    #[error("no success after {attempts} attempts, last status={status}")]
    Exhausted {
        /// How many requests were made.
        attempts: u32,
        /// The status of the final attempt.
        status: reqwest::StatusCode,
    },
}

#[derive(Debug)]
/// The aggregator and flush driver.
pub struct Reporter {
    url: String,
    interval: Duration,
    inbox: mpsc::Receiver<Measurement>,
    shutdown: Shutdown,
}

impl Reporter {
    /// Create a new [`Reporter`] instance.
    #[must_use]
    pub fn new(
        url: String,
        interval: Duration,
        inbox: mpsc::Receiver<Measurement>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            url,
            interval,
            inbox,
            shutdown,
        }
    }

    /// Run [`Reporter`] to completion.
    ///
    /// Drains the inbox into the live metric set and rotates it on every
    /// tick until a shutdown signal is received. Flushes already in the air
    /// finish under their own deadline; no new ones start after shutdown.
    ///
    /// # Errors
    ///
    /// Function will return an error if the inbox closes while the agent is
    /// still meant to be running.
    pub async fn run(mut self) -> Result<(), Error> {
        let client = reqwest::Client::new();
        let mut current = MetricSet::new(None);
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        info!(url = %self.url, interval = ?self.interval, "reporter running");

        let shutdown_wait = self.shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                maybe_measurement = self.inbox.recv() => {
                    match maybe_measurement {
                        Some(measurement) => current.update(&measurement),
                        None => {
                            warn!("inbox closed, stopping reporter");
                            return Err(Error::EarlyInboxClose);
                        }
                    }
                }
                _ = ticker.tick() => {
                    let snapshot = Arc::new(current.snapshot());
                    current = MetricSet::new(Some(Arc::clone(&snapshot)));
                    tokio::spawn(flush(
                        client.clone(),
                        self.url.clone(),
                        snapshot,
                        self.interval * 2,
                        self.shutdown.clone(),
                    ));
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}

/// Encode and upload one snapshot. Empty snapshots are skipped; every
/// failure drops the snapshot and is recorded, never propagated.
async fn flush(
    client: reqwest::Client,
    url: String,
    set: Arc<MetricSet>,
    budget: Duration,
    shutdown: Shutdown,
) {
    let count = set.len();
    if count == 0 {
        return;
    }

    let body = match serde_json::to_vec(&*set) {
        Ok(body) => body,
        Err(err) => {
            error!("flush: encode: {err}");
            return;
        }
    };
    let flushed_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

    match tokio::time::timeout(budget, send(&client, &url, body, count, &flushed_at, shutdown))
        .await
    {
        Ok(Ok(())) => {
            counter!("uploads_completed").increment(1);
            debug!("flushed {count} measurements");
        }
        Ok(Err(err)) => {
            counter!("uploads_failed").increment(1);
            warn!("flush: send: {err}");
        }
        Err(_elapsed) => {
            counter!("uploads_failed").increment(1);
            warn!("flush: upload deadline of {budget:?} exceeded");
        }
    }
}

/// POST one snapshot body, retrying retryable statuses with exponential
/// backoff.
///
/// 2xx succeeds. 4xx is terminal with a body excerpt. Anything else retries
/// up to [`MAX_RETRIES`] times with the backoff doubling after each pause.
/// Transport errors are terminal. The pauses race the shutdown signal, and
/// a signal that has already fired short-circuits before the first request.
async fn send(
    client: &reqwest::Client,
    url: &str,
    body: Vec<u8>,
    count: usize,
    flushed_at: &str,
    shutdown: Shutdown,
) -> Result<(), SendError> {
    if shutdown.try_recv() {
        return Err(SendError::Cancelled);
    }

    let mut backoff = INITIAL_BACKOFF;
    let mut retries = 0;
    loop {
        let response = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(HEADER_MEASUREMENTS_COUNT, count.to_string())
            .header(HEADER_MEASUREMENTS_TIME, flushed_at)
            .body(body.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_client_error() {
            let body = excerpt(response.text().await.unwrap_or_default());
            return Err(SendError::Rejected { status, body });
        }

        if retries == MAX_RETRIES {
            return Err(SendError::Exhausted {
                attempts: retries + 1,
                status,
            });
        }

        tokio::select! {
            () = shutdown.recv() => return Err(SendError::Cancelled),
            () = tokio::time::sleep(backoff) => {}
        }
        retries += 1;
        backoff *= 2;
    }
}

fn excerpt(mut body: String) -> String {
    if body.len() > BODY_EXCERPT_LIMIT {
        let mut end = BODY_EXCERPT_LIMIT;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    body
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::{Instant, SystemTime},
    };

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use freight_metrics::{MetricKind, Modifier};

    use super::*;

    #[derive(Debug, Clone)]
    struct Sink {
        statuses: Arc<Vec<u16>>,
        hits: Arc<AtomicUsize>,
        requests: Arc<Mutex<Vec<(hyper::header::HeaderMap, Bytes)>>>,
    }

    impl Sink {
        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }

        fn requests(&self) -> Vec<(hyper::header::HeaderMap, Bytes)> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    /// Serve scripted statuses on an ephemeral port, recording every
    /// request. Requests past the end of the script get the last status.
    async fn spawn_sink(statuses: Vec<u16>) -> (SocketAddr, Sink) {
        let sink = Sink {
            statuses: Arc::new(statuses),
            hits: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server_sink = sink.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let sink = server_sink.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let sink = sink.clone();
                        async move {
                            let (parts, body) = req.into_parts();
                            let body = body.collect().await?.to_bytes();
                            sink.requests
                                .lock()
                                .expect("requests lock")
                                .push((parts.headers, body));
                            let idx = sink.hits.fetch_add(1, Ordering::SeqCst);
                            let status = sink
                                .statuses
                                .get(idx)
                                .or_else(|| sink.statuses.last())
                                .copied()
                                .unwrap_or(200);
                            Ok::<_, hyper::Error>(
                                hyper::Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from_static(b"try later")))
                                    .expect("response"),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, sink)
    }

    fn counter_measurement(name: &str, value: f64) -> Measurement {
        Measurement {
            name: name.to_string(),
            timestamp: SystemTime::now(),
            kind: MetricKind::Counter,
            value,
            sample_rate: 1.0,
            modifier: Modifier::default(),
        }
    }

    #[tokio::test]
    async fn send_retries_through_5xx_to_success() {
        let (addr, sink) = spawn_sink(vec![503, 503, 200]).await;
        let client = reqwest::Client::new();

        let started = Instant::now();
        let result = send(
            &client,
            &format!("http://{addr}/"),
            b"{}".to_vec(),
            0,
            "2017-01-01T00:00:00Z",
            Shutdown::new(),
        )
        .await;
        let elapsed = started.elapsed();

        result.expect("third attempt succeeds");
        assert_eq!(sink.hits(), 3);
        // Two pauses: 1ms then 2ms.
        assert!(elapsed >= Duration::from_millis(3), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn send_treats_4xx_as_terminal() {
        let (addr, sink) = spawn_sink(vec![404]).await;
        let client = reqwest::Client::new();

        let result = send(
            &client,
            &format!("http://{addr}/"),
            b"{}".to_vec(),
            0,
            "2017-01-01T00:00:00Z",
            Shutdown::new(),
        )
        .await;

        match result {
            Err(SendError::Rejected { status, body }) => {
                assert_eq!(status.as_u16(), 404);
                assert_eq!(body, "try later");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(sink.hits(), 1);
    }

    #[tokio::test]
    async fn send_gives_up_after_four_attempts() {
        let (addr, sink) = spawn_sink(vec![500]).await;
        let client = reqwest::Client::new();

        let result = send(
            &client,
            &format!("http://{addr}/"),
            b"{}".to_vec(),
            0,
            "2017-01-01T00:00:00Z",
            Shutdown::new(),
        )
        .await;

        match result {
            Err(SendError::Exhausted { attempts, status }) => {
                assert_eq!(attempts, 4);
                assert_eq!(status.as_u16(), 500);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(sink.hits(), 4);
    }

    #[tokio::test]
    async fn send_short_circuits_when_already_cancelled() {
        let (addr, sink) = spawn_sink(vec![200]).await;
        let client = reqwest::Client::new();

        let shutdown = Shutdown::new();
        shutdown.signal();

        let result = send(
            &client,
            &format!("http://{addr}/"),
            b"{}".to_vec(),
            0,
            "2017-01-01T00:00:00Z",
            shutdown,
        )
        .await;

        assert!(matches!(result, Err(SendError::Cancelled)));
        assert_eq!(sink.hits(), 0);
    }

    #[tokio::test]
    async fn transport_errors_are_terminal() {
        // Nothing listens here; the request cannot be delivered.
        let reserve = std::net::TcpListener::bind("127.0.0.1:0").expect("reserve port");
        let addr = reserve.local_addr().expect("local addr");
        drop(reserve);

        let client = reqwest::Client::new();
        let result = send(
            &client,
            &format!("http://{addr}/"),
            b"{}".to_vec(),
            0,
            "2017-01-01T00:00:00Z",
            Shutdown::new(),
        )
        .await;

        assert!(matches!(result, Err(SendError::Transport(_))));
    }

    #[tokio::test]
    async fn reporter_flushes_snapshots_with_headers() {
        let (addr, sink) = spawn_sink(vec![200]).await;

        let (tx, rx) = mpsc::channel(16);
        let shutdown = Shutdown::new();
        let reporter = Reporter::new(
            format!("http://{addr}/"),
            Duration::from_millis(50),
            rx,
            shutdown.clone(),
        );
        let handle = tokio::spawn(reporter.run());

        tx.send(counter_measurement("gorets", 1.0))
            .await
            .expect("inbox send");

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.hits() == 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let requests = sink.requests();
        assert_eq!(requests.len(), 1);
        let (headers, body) = &requests[0];

        assert_eq!(
            headers
                .get("content-type")
                .expect("content type")
                .to_str()
                .expect("header is ascii"),
            "application/json"
        );
        assert_eq!(
            headers
                .get(HEADER_MEASUREMENTS_COUNT)
                .expect("count header")
                .to_str()
                .expect("header is ascii"),
            "1"
        );
        let flushed_at = headers
            .get(HEADER_MEASUREMENTS_TIME)
            .expect("time header")
            .to_str()
            .expect("header is ascii");
        chrono::DateTime::parse_from_rfc3339(flushed_at).expect("time header is RFC3339");

        let decoded: serde_json::Value = serde_json::from_slice(body).expect("body is JSON");
        assert_eq!(decoded["counters"]["gorets"], 1.0);
        assert!(decoded.get("gauges").is_none());

        // Ticks with nothing new to report upload nothing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.hits(), 1);

        shutdown.signal();
        handle
            .await
            .expect("reporter task")
            .expect("reporter exits cleanly");
    }
}
