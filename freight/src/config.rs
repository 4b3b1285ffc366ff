//! Configuration parsing for the agent.
//!
//! Options arrive from an optional YAML file and from command line flags,
//! flags winning. Validation lives here so that startup is the only place
//! the agent can refuse to run: at least one ingress source and the upload
//! URL are required, everything else has a default.

use std::{fs, net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;

use crate::{scrape, statsd};

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for IO operations when reading the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// No target to report to.
    #[error("upload URL is required")]
    MissingUploadUrl,
    /// Nothing to collect from.
    #[error("nothing to start: set a statsd address or a scrape URL")]
    NoSources,
    /// A statsd address that does not parse.
    #[error("invalid statsd address {addr:?}: {source}")]
    StatsdAddr {
        /// The configured address.
        addr: String,
        /// The underlying parse error.
        #[source]
        source: std::net::AddrParseError,
    },
}

fn default_flush_interval_seconds() -> u64 {
    20
}

fn default_scrape_interval_seconds() -> u64 {
    5
}

fn default_inbox_capacity() -> usize {
    1000
}

fn default_statsd_max_packet_size() -> usize {
    1472
}

/// Main configuration struct for this program.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds between metric set flushes; also the base of the per-upload
    /// deadline.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
    /// Seconds between Prometheus scrapes.
    #[serde(default = "default_scrape_interval_seconds")]
    pub scrape_interval_seconds: u64,
    /// Prometheus URL to scrape. No poller is started when unset.
    #[serde(default)]
    pub scrape_url: Option<String>,
    /// Accept header override for scrapes.
    #[serde(default)]
    pub scrape_accept: Option<String>,
    /// UDP address for the statsd listener, `host:port` or bare `:port`.
    /// No listener is started when unset.
    #[serde(default)]
    pub statsd_addr: Option<String>,
    /// Maximum bytes read per statsd datagram.
    #[serde(default = "default_statsd_max_packet_size")]
    pub statsd_max_packet_size: usize,
    /// Whether statsd reads may end mid-line.
    #[serde(default)]
    pub statsd_partial_reads: bool,
    /// Target for metric set uploads. Required.
    #[serde(default)]
    pub upload_url: Option<String>,
    /// Capacity of the measurement inbox.
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
    /// Verbose trace logging. Does not alter semantics.
    #[serde(default)]
    pub debug: bool,
    /// Address to expose the agent's own metrics on, in Prometheus format.
    /// Nothing is exposed when unset.
    #[serde(default)]
    pub telemetry_addr: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval_seconds: default_flush_interval_seconds(),
            scrape_interval_seconds: default_scrape_interval_seconds(),
            scrape_url: None,
            scrape_accept: None,
            statsd_addr: None,
            statsd_max_packet_size: default_statsd_max_packet_size(),
            statsd_partial_reads: false,
            upload_url: None,
            inbox_capacity: default_inbox_capacity(),
            debug: false,
            telemetry_addr: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not deserialize.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(Error::from)
    }

    /// Check that the configuration names somewhere to report to and at
    /// least one source to collect from.
    ///
    /// # Errors
    ///
    /// Returns an error when the upload URL is missing, when neither source
    /// is configured, or when the statsd address does not parse.
    pub fn validate(&self) -> Result<(), Error> {
        if self.upload_url.is_none() {
            return Err(Error::MissingUploadUrl);
        }
        if self.scrape_url.is_none() && self.statsd_addr.is_none() {
            return Err(Error::NoSources);
        }
        if self.statsd_addr.is_some() {
            self.statsd_listen_addr()?;
        }
        Ok(())
    }

    /// The aggregator tick period.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    /// The scrape period.
    #[must_use]
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval_seconds)
    }

    /// The statsd listener configuration, when a listener is wanted.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured address does not parse.
    pub fn statsd(&self) -> Result<Option<statsd::Config>, Error> {
        if self.statsd_addr.is_none() {
            return Ok(None);
        }
        Ok(Some(statsd::Config {
            addr: self.statsd_listen_addr()?,
            max_packet_size: self.statsd_max_packet_size,
            partial_reads: self.statsd_partial_reads,
        }))
    }

    /// The scrape poller configuration, when a poller is wanted.
    #[must_use]
    pub fn scrape(&self) -> Option<scrape::Config> {
        self.scrape_url.as_ref().map(|url| scrape::Config {
            url: url.clone(),
            accept: self.scrape_accept.clone(),
        })
    }

    fn statsd_listen_addr(&self) -> Result<SocketAddr, Error> {
        let raw = self.statsd_addr.as_deref().unwrap_or_default();
        // A bare `:8125` listens on every interface, statsd tradition.
        let full = if raw.starts_with(':') {
            format!("0.0.0.0{raw}")
        } else {
            raw.to_string()
        };
        full.parse().map_err(|source| Error::StatsdAddr {
            addr: raw.to_string(),
            source,
        })
    }
}
