//! The statsd protocol speaking UDP listener.
//!
//! Datagrams are fed through the statsd [`parser`] and the resulting
//! measurements are forwarded to the agent's inbox. The forward blocks when
//! the inbox is full: statsd packets arrive one at a time and are cheap to
//! buffer, so backpressure here is absorbed by the socket buffer rather than
//! by dropping measurements in the agent.
//!
//! ## Metrics
//!
//! `statsd_bytes_received`: Total bytes received
//! `statsd_packets_received`: Total datagrams received
//! `statsd_measurements_received`: Measurements parsed and forwarded
//! `statsd_lines_malformed`: Lines that failed to parse
//!

use std::{io, net::SocketAddr, time::SystemTime};

use freight_metrics::{Measurement, MetricKind, Modifier};
use metrics::counter;
use serde::Deserialize;
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::{shutdown::Shutdown, Inbox};

pub mod parser;

/// The metric under which the listener reports its own parse failures, so
/// the agent's uploads carry a record of lines it threw away.
pub const PARSE_FAILURES_METRIC: &str = "freight.statsd.parse_failures";

/// Maximum bytes read per incoming datagram unless configured otherwise.
/// 1500 MTU minus IP and UDP headers.
const DEFAULT_MAX_PACKET_SIZE: usize = 1472;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Listener`].
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Configuration for [`Listener`].
pub struct Config {
    /// address -- IP plus port -- to bind to
    pub addr: SocketAddr,
    /// maximum bytes read per incoming datagram
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    /// whether a read may end mid-line, with the partial line completed by
    /// the next read. Off for UDP, where datagrams frame lines.
    #[serde(default)]
    pub partial_reads: bool,
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

#[derive(Debug)]
/// The statsd UDP listener.
pub struct Listener {
    config: Config,
    inbox: Inbox,
    shutdown: Shutdown,
}

#[derive(Debug)]
/// Adapts a UDP socket to the parser's [`parser::Source`] seam: each read is
/// one datagram, truncated at the caller's buffer.
struct Datagrams {
    socket: UdpSocket,
}

impl parser::Source for Datagrams {
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> impl std::future::Future<Output = io::Result<usize>> + Send {
        async move {
            loop {
                let (n, _remote) = self.socket.recv_from(buf).await?;
                counter!("statsd_packets_received").increment(1);
                counter!("statsd_bytes_received").increment(n as u64);
                // A zero-length datagram would read as end of stream; the
                // stream has no end while the socket lives.
                if n > 0 {
                    return Ok(n);
                }
            }
        }
    }
}

impl Listener {
    /// Create a new [`Listener`] instance.
    #[must_use]
    pub fn new(config: Config, inbox: Inbox, shutdown: Shutdown) -> Self {
        Self {
            config,
            inbox,
            shutdown,
        }
    }

    /// Run [`Listener`] to completion.
    ///
    /// Listens for datagrams forever, unless a shutdown signal is received
    /// or the inbox closes underneath it.
    ///
    /// # Errors
    ///
    /// Function will return an error if the socket cannot be bound.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            config,
            inbox,
            shutdown,
        } = self;

        let socket = UdpSocket::bind(&config.addr).await?;
        info!(addr = %config.addr, "statsd listener running");

        let mut parser = parser::Parser::new(
            Datagrams { socket },
            config.partial_reads,
            config.max_packet_size,
        );
        let mut reported_failures = 0;

        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                (measurement, more) = parser.next() => {
                    if let Some(m) = measurement {
                        counter!("statsd_measurements_received").increment(1);
                        if inbox.send(m).await.is_err() {
                            warn!("inbox closed, stopping statsd listener");
                            return Ok(());
                        }
                    }

                    let failures = parser.parse_failures();
                    if failures > reported_failures {
                        let delta = failures - reported_failures;
                        reported_failures = failures;
                        counter!("statsd_lines_malformed").increment(delta);
                        // Report the failures through the same aggregator
                        // everything else feeds. Non-blocking: self-reporting
                        // must never wedge the listener behind its own
                        // backpressure rule.
                        let _ = inbox.try_send(Measurement {
                            name: PARSE_FAILURES_METRIC.to_string(),
                            timestamp: SystemTime::now(),
                            kind: MetricKind::Counter,
                            value: delta as f64,
                            sample_rate: 1.0,
                            modifier: Modifier::default(),
                        });
                    }

                    if !more {
                        warn!("statsd stream ended");
                        return Ok(());
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
