//! Statsd line protocol parser.
//!
//! Lines have the shape `<name>:<value>|<type>[|@<sample>]` where `<type>`
//! is `c`, `g` or `ms`. The parser pulls bytes from an abstract [`Source`]
//! through a staging buffer, which lets it reassemble lines that arrive
//! split across reads as well as consume datagrams that frame lines without
//! a trailing newline. Malformed lines are skipped, not fatal; the parser
//! keeps a count of them so the agent can report on itself.

use std::time::SystemTime;

use freight_metrics::{Measurement, MetricKind, Modifier};
use tracing::{debug, warn};

/// An abstract byte source for the parser.
///
/// This is the seam between the parser and the network: the UDP listener
/// reads datagrams through it, tests feed scripted chunk sequences. One call
/// reads at most once; `Ok(0)` signals the end of the stream.
pub trait Source {
    /// Read bytes into `buf`, returning how many were written. `Ok(0)`
    /// means the stream is exhausted.
    fn read(
        &mut self,
        buf: &mut [u8],
    ) -> impl std::future::Future<Output = std::io::Result<usize>> + Send;
}

#[derive(Debug)]
/// A statsd protocol parser over an arbitrary [`Source`].
pub struct Parser<S> {
    source: S,
    buffer: Vec<u8>,
    partial_reads: bool,
    max_read_size: usize,
    done: bool,
    parse_failures: u64,
}

impl<S> Parser<S>
where
    S: Source,
{
    /// Construct a statsd parser.
    ///
    /// When `partial_reads` is true a read of up to `max_read_size` bytes may
    /// end mid-line and the partial bytes are held until a newline arrives.
    /// When false the source frames lines itself -- one datagram is one or
    /// more complete lines -- so a buffered chunk without a newline is
    /// already a complete line.
    pub fn new(source: S, partial_reads: bool, max_read_size: usize) -> Self {
        Self {
            source,
            buffer: Vec::new(),
            partial_reads,
            max_read_size,
            done: false,
            parse_failures: 0,
        }
    }

    /// Return the next measurement parsed from the source.
    ///
    /// The boolean is false exactly once, when the stream is exhausted;
    /// callers stop there. A malformed line yields `(None, true)` and is
    /// otherwise skipped.
    pub async fn next(&mut self) -> (Option<Measurement>, bool) {
        loop {
            if let Some(line) = self.take_line() {
                return (self.parse_candidate(&line), true);
            }

            if self.done {
                let residual = std::mem::take(&mut self.buffer);
                if residual.is_empty() {
                    return (None, false);
                }
                return (self.parse_candidate(&residual), false);
            }

            let idx = self.buffer.len();
            self.buffer.resize(idx + self.max_read_size, 0);
            match self.source.read(&mut self.buffer[idx..]).await {
                Ok(0) => {
                    self.buffer.truncate(idx);
                    self.done = true;
                }
                Ok(n) => self.buffer.truncate(idx + n),
                Err(err) => {
                    warn!("statsd read failed, ending stream: {err}");
                    self.buffer.truncate(idx);
                    self.done = true;
                }
            }
        }
    }

    /// The number of lines that failed to parse over the life of this
    /// parser. Blank lines are not counted.
    pub fn parse_failures(&self) -> u64 {
        self.parse_failures
    }

    /// Split one line candidate off the front of the staging buffer, if the
    /// buffer holds one.
    fn take_line(&mut self) -> Option<Vec<u8>> {
        if let Some(idx) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(idx + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.truncate(idx);
            return Some(line);
        }

        if !self.partial_reads && !self.buffer.is_empty() {
            return Some(std::mem::take(&mut self.buffer));
        }

        None
    }

    fn parse_candidate(&mut self, line: &[u8]) -> Option<Measurement> {
        if line.is_empty() {
            return None;
        }

        let parsed = parse_line(line, SystemTime::now());
        if parsed.is_none() {
            self.parse_failures += 1;
            debug!(
                line = %String::from_utf8_lossy(line),
                "failed to parse statsd line"
            );
        }
        parsed
    }
}

/// Parse a single statsd line into a measurement.
///
/// Returns None on any grammar violation; the caller decides whether that
/// skips the line or counts against the source.
fn parse_line(line: &[u8], captured_at: SystemTime) -> Option<Measurement> {
    let (name, rest) = read_name(line)?;
    let rest = expect(rest, b":")?;
    let (raw_value, rest) = read_value(rest, true)?;
    let rest = expect(rest, b"|")?;
    let (kind, rest) = read_kind(rest)?;
    let (raw_sample, rest) = maybe_read_sample(rest)?;
    if !rest.is_empty() {
        return None;
    }

    let (magnitude, modifier) = match kind {
        MetricKind::Counter => {
            // Statsd counters are non-signed in this dialect; signs belong
            // to gauges.
            if raw_value[0] == b'+' || raw_value[0] == b'-' {
                return None;
            }
            (raw_value, Modifier::Set)
        }
        MetricKind::Gauge => match raw_value[0] {
            b'+' => (&raw_value[1..], Modifier::Add),
            b'-' => (&raw_value[1..], Modifier::Sub),
            _ => (raw_value, Modifier::Set),
        },
        MetricKind::DerivedCounter | MetricKind::Timer => (raw_value, Modifier::Set),
    };

    let value: f64 = std::str::from_utf8(magnitude).ok()?.parse().ok()?;
    let sample_rate: f32 = if raw_sample.is_empty() {
        1.0
    } else {
        std::str::from_utf8(raw_sample).ok()?.parse().ok()?
    };

    Some(Measurement {
        name: String::from_utf8(name.to_vec()).ok()?,
        timestamp: captured_at,
        kind,
        value,
        sample_rate,
        modifier,
    })
}

/// Read a metric name, `[A-Za-z0-9._-]` and at least two characters long.
fn read_name(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => i += 1,
            _ => break,
        }
    }
    if i > 1 {
        Some((&buf[..i], &buf[i..]))
    } else {
        None
    }
}

/// Read a decimal value: digits with at most one dot, optionally signed
/// when `allow_sign` is set. A sole `.` is not a value.
fn read_value(buf: &[u8], allow_sign: bool) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    let mut saw_dot = false;

    if allow_sign && buf.len() > 1 && (buf[0] == b'+' || buf[0] == b'-') {
        i = 1;
    }

    while i < buf.len() {
        match buf[i] {
            b'0'..=b'9' => {}
            b'.' => {
                if saw_dot {
                    return None;
                }
                saw_dot = true;
            }
            _ => break,
        }
        i += 1;
    }

    if i == 1 && buf[0] == b'.' {
        return None;
    }

    if i > 0 {
        Some((&buf[..i], &buf[i..]))
    } else {
        None
    }
}

/// Read the metric type: `c`, `g`, or `ms` with a two-byte lookahead.
fn read_kind(buf: &[u8]) -> Option<(MetricKind, &[u8])> {
    match buf.first()? {
        b'c' => Some((MetricKind::Counter, &buf[1..])),
        b'g' => Some((MetricKind::Gauge, &buf[1..])),
        b'm' if buf.get(1) == Some(&b's') => Some((MetricKind::Timer, &buf[2..])),
        _ => None,
    }
}

/// Read the optional `|@<sample>` suffix. The sample shares the value
/// grammar minus the sign.
fn maybe_read_sample(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    if buf.is_empty() {
        return Some((&buf[..0], buf));
    }
    let rest = expect(buf, b"|@")?;
    read_value(rest, false)
}

fn expect<'a>(buf: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    buf.strip_prefix(prefix)
}
