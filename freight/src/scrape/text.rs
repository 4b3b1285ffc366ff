//! Decoder for the Prometheus text exposition format, version 0.0.4.
//!
//! Format doc: <https://github.com/prometheus/docs/blob/main/content/docs/instrumenting/exposition_formats.md>
//!
//! Samples are grouped into the same [`MetricFamily`] values the
//! delimited-protobuf format decodes to: `TYPE` comments establish a family's
//! type, `_sum`/`_count` samples of summaries and histograms fold into their
//! base family, quantile and `le` labels become [`Quantile`] and [`Bucket`]
//! entries, and names never mentioned in a `TYPE` comment form untyped
//! families.

use rustc_hash::FxHashMap;

use super::proto::{Bucket, Counter, Gauge, Histogram, LabelPair, Metric, MetricFamily, MetricType, Quantile, Summary, Untyped};

/// Errors that can occur while decoding the text format.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Unknown metric type in a TYPE comment.
    #[error("unknown metric type: {0}")]
    UnknownMetricType(String),
    /// A line that does not fit the format.
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    /// A sample value that is not a number.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// A sample line with no value.
    #[error("missing value in metric line")]
    MissingValue,
    /// A sample line with no name.
    #[error("missing name in metric line")]
    MissingName,
    /// A label that does not fit the format.
    #[error("invalid label: {0}")]
    InvalidLabel(String),
    /// A timestamp that is not an integer.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Decode a complete text-format exposition into metric families.
///
/// # Errors
///
/// Returns an error on the first malformed line; a scrape either decodes
/// whole or not at all.
pub(crate) fn decode(text: &str) -> Result<Vec<MetricFamily>, ParseError> {
    let mut decoder = Decoder::default();
    for line in text.lines() {
        decoder.feed_line(line)?;
    }
    Ok(decoder.families)
}

/// One parsed sample line.
#[derive(Debug)]
struct Sample {
    name: String,
    labels: Vec<(String, String)>,
    value: f64,
    timestamp_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct Decoder {
    typemap: FxHashMap<String, MetricType>,
    families: Vec<MetricFamily>,
    index: FxHashMap<String, usize>,
}

impl Decoder {
    fn feed_line(&mut self, line: &str) -> Result<(), ParseError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim_start();
            if let Some(type_line) = comment.strip_prefix("TYPE") {
                return self.feed_type_line(type_line);
            }
            // HELP and free-form comments carry nothing we aggregate.
            return Ok(());
        }

        let sample = parse_sample(line)?;
        self.route_sample(sample);
        Ok(())
    }

    fn feed_type_line(&mut self, rest: &str) -> Result<(), ParseError> {
        let mut parts = rest.split_ascii_whitespace();
        let name = parts.next().ok_or_else(|| {
            ParseError::InvalidFormat("missing metric name in TYPE comment".to_string())
        })?;
        let raw_type = parts.next().ok_or_else(|| {
            ParseError::InvalidFormat("missing metric type in TYPE comment".to_string())
        })?;

        let metric_type = match raw_type {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "summary" => MetricType::Summary,
            "histogram" => MetricType::Histogram,
            "untyped" => MetricType::Untyped,
            other => return Err(ParseError::UnknownMetricType(other.to_string())),
        };

        self.typemap.insert(name.to_string(), metric_type);
        Ok(())
    }

    fn route_sample(&mut self, sample: Sample) {
        if let Some(&family_type) = self.typemap.get(&sample.name) {
            match family_type {
                MetricType::Summary => return self.fold_quantile(sample),
                MetricType::Counter | MetricType::Gauge | MetricType::Untyped => {
                    return self.push_scalar(family_type, sample)
                }
                // A histogram's base name never carries a sample of its own;
                // fall through to the suffix checks below.
                MetricType::Histogram => {}
            }
        }

        if let Some(base) = sample.name.strip_suffix("_sum") {
            if let Some(kind @ (MetricType::Summary | MetricType::Histogram)) =
                self.typemap.get(base).copied()
            {
                return self.fold_sum(kind, base.to_string(), sample);
            }
        }
        if let Some(base) = sample.name.strip_suffix("_count") {
            if let Some(kind @ (MetricType::Summary | MetricType::Histogram)) =
                self.typemap.get(base).copied()
            {
                return self.fold_count(kind, base.to_string(), sample);
            }
        }
        if let Some(base) = sample.name.strip_suffix("_bucket") {
            if self.typemap.get(base).copied() == Some(MetricType::Histogram) {
                return self.fold_bucket(base.to_string(), sample);
            }
        }

        self.push_scalar(MetricType::Untyped, sample);
    }

    /// Record a plain counter/gauge/untyped sample as its own metric.
    fn push_scalar(&mut self, kind: MetricType, sample: Sample) {
        let mut metric = Metric {
            label: to_pairs(sample.labels),
            timestamp_ms: sample.timestamp_ms,
            ..Metric::default()
        };
        match kind {
            MetricType::Counter => {
                metric.counter = Some(Counter {
                    value: Some(sample.value),
                });
            }
            MetricType::Gauge => {
                metric.gauge = Some(Gauge {
                    value: Some(sample.value),
                });
            }
            _ => {
                metric.untyped = Some(Untyped {
                    value: Some(sample.value),
                });
            }
        }

        let idx = self.family_index(&sample.name, kind);
        self.families[idx].metric.push(metric);
    }

    fn fold_quantile(&mut self, mut sample: Sample) {
        let rank = take_label(&mut sample.labels, "quantile").and_then(|raw| parse_float(&raw));
        let name = sample.name.clone();
        let metric = self.observation_metric(MetricType::Summary, &name, sample.labels, sample.timestamp_ms);
        if let (Some(rank), Some(summary)) = (rank, metric.summary.as_mut()) {
            summary.quantile.push(Quantile {
                quantile: Some(rank),
                value: Some(sample.value),
            });
        }
    }

    fn fold_sum(&mut self, kind: MetricType, base: String, sample: Sample) {
        let metric = self.observation_metric(kind, &base, sample.labels, sample.timestamp_ms);
        match kind {
            MetricType::Summary => {
                if let Some(summary) = metric.summary.as_mut() {
                    summary.sample_sum = Some(sample.value);
                }
            }
            _ => {
                if let Some(histogram) = metric.histogram.as_mut() {
                    histogram.sample_sum = Some(sample.value);
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn fold_count(&mut self, kind: MetricType, base: String, sample: Sample) {
        let metric = self.observation_metric(kind, &base, sample.labels, sample.timestamp_ms);
        let count = sample.value as u64;
        match kind {
            MetricType::Summary => {
                if let Some(summary) = metric.summary.as_mut() {
                    summary.sample_count = Some(count);
                }
            }
            _ => {
                if let Some(histogram) = metric.histogram.as_mut() {
                    histogram.sample_count = Some(count);
                }
            }
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn fold_bucket(&mut self, base: String, mut sample: Sample) {
        let upper_bound = take_label(&mut sample.labels, "le").and_then(|raw| parse_float(&raw));
        let metric =
            self.observation_metric(MetricType::Histogram, &base, sample.labels, sample.timestamp_ms);
        if let Some(histogram) = metric.histogram.as_mut() {
            histogram.bucket.push(Bucket {
                cumulative_count: Some(sample.value as u64),
                upper_bound,
            });
        }
    }

    /// Find or create the metric of a summary/histogram family that matches
    /// the given label set, with the observation container initialized.
    fn observation_metric(
        &mut self,
        kind: MetricType,
        family_name: &str,
        labels: Vec<(String, String)>,
        timestamp_ms: Option<i64>,
    ) -> &mut Metric {
        let family_idx = self.family_index(family_name, kind);
        let family = &mut self.families[family_idx];

        let labels = to_pairs(labels);
        let metric_idx = match family.metric.iter().position(|metric| metric.label == labels) {
            Some(idx) => idx,
            None => {
                let mut metric = Metric {
                    label: labels,
                    timestamp_ms,
                    ..Metric::default()
                };
                if kind == MetricType::Summary {
                    metric.summary = Some(Summary::default());
                } else {
                    metric.histogram = Some(Histogram::default());
                }
                family.metric.push(metric);
                family.metric.len() - 1
            }
        };

        let metric = &mut family.metric[metric_idx];
        if metric.timestamp_ms.is_none() {
            metric.timestamp_ms = timestamp_ms;
        }
        metric
    }

    fn family_index(&mut self, name: &str, kind: MetricType) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.families.len();
        self.index.insert(name.to_string(), idx);
        self.families.push(MetricFamily {
            name: Some(name.to_string()),
            help: None,
            r#type: Some(kind as i32),
            metric: Vec::new(),
        });
        idx
    }
}

fn to_pairs(labels: Vec<(String, String)>) -> Vec<LabelPair> {
    labels
        .into_iter()
        .map(|(name, value)| LabelPair {
            name: Some(name),
            value: Some(value),
        })
        .collect()
}

/// Remove and return the value of the named label, if present.
fn take_label(labels: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let idx = labels.iter().position(|(label, _)| label == name)?;
    Some(labels.remove(idx).1)
}

fn parse_sample(line: &str) -> Result<Sample, ParseError> {
    let (name_and_labels, value_part) = split_sample_line(line)?;
    let (name, labels) = parse_name_and_labels(name_and_labels)?;
    let (value, timestamp_ms) = parse_value_and_timestamp(value_part)?;

    Ok(Sample {
        name,
        labels,
        value,
        timestamp_ms,
    })
}

/// Split a sample line into its name-and-labels part and its value part.
fn split_sample_line(line: &str) -> Result<(&str, &str), ParseError> {
    if let Some(brace) = line.find('{') {
        // Label values may contain anything, so the closing brace must be
        // found rather than assumed; the value follows it.
        let close = line[brace..]
            .rfind('}')
            .map(|offset| brace + offset)
            .ok_or_else(|| ParseError::InvalidFormat("unclosed label brace".to_string()))?;
        let value_part = line[close + 1..].trim();
        if value_part.is_empty() {
            return Err(ParseError::MissingValue);
        }
        Ok((&line[..=close], value_part))
    } else {
        let mut parts = line.splitn(2, char::is_whitespace);
        let name = parts.next().ok_or(ParseError::MissingName)?;
        let value_part = parts.next().map(str::trim).ok_or(ParseError::MissingValue)?;
        Ok((name, value_part))
    }
}

fn parse_name_and_labels(
    name_and_labels: &str,
) -> Result<(String, Vec<(String, String)>), ParseError> {
    if let Some((name, labels_str)) = name_and_labels.split_once('{') {
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::MissingName);
        }
        let labels_str = labels_str.trim_end_matches('}');
        let labels = parse_labels(labels_str)?;
        Ok((name.to_string(), labels))
    } else {
        let name = name_and_labels.trim();
        if name.is_empty() {
            return Err(ParseError::MissingName);
        }
        Ok((name.to_string(), Vec::new()))
    }
}

fn parse_labels(labels_str: &str) -> Result<Vec<(String, String)>, ParseError> {
    let mut labels = Vec::new();
    let mut rest = labels_str.trim();

    while !rest.is_empty() {
        // A trailing comma after the last pair is allowed.
        rest = rest.trim_start_matches(',').trim_start();
        if rest.is_empty() {
            break;
        }

        let (label_name, after_eq) = rest
            .split_once('=')
            .ok_or_else(|| ParseError::InvalidLabel(format!("label missing '=': {rest}")))?;
        let label_name = label_name.trim();
        if label_name.is_empty() {
            return Err(ParseError::InvalidLabel("empty label name".to_string()));
        }

        let (value, remainder) = parse_label_value(after_eq.trim_start())?;
        labels.push((label_name.to_string(), value));
        rest = remainder.trim_start();
    }

    Ok(labels)
}

/// Parse one quoted label value, handling `\\`, `\"` and `\n` escapes.
/// Returns the decoded value and whatever follows the closing quote.
fn parse_label_value(input: &str) -> Result<(String, &str), ParseError> {
    let inner = input
        .strip_prefix('"')
        .ok_or_else(|| ParseError::InvalidLabel("label value must be quoted".to_string()))?;

    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.char_indices();
    while let Some((idx, ch)) = chars.next() {
        match ch {
            '"' => return Ok((value, &inner[idx + 1..])),
            '\\' => match chars.next() {
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, 'n')) => value.push('\n'),
                Some((_, other)) => {
                    return Err(ParseError::InvalidLabel(format!(
                        "invalid escape sequence: \\{other}"
                    )))
                }
                None => {
                    return Err(ParseError::InvalidLabel(
                        "backslash at end of label value".to_string(),
                    ))
                }
            },
            _ => value.push(ch),
        }
    }

    Err(ParseError::InvalidLabel(
        "label value quote not closed".to_string(),
    ))
}

fn parse_value_and_timestamp(value_str: &str) -> Result<(f64, Option<i64>), ParseError> {
    let mut parts = value_str.split_whitespace();
    let value_part = parts.next().ok_or(ParseError::MissingValue)?;

    if value_part.contains('#') {
        return Err(ParseError::InvalidFormat(
            "value contains comment marker".to_string(),
        ));
    }

    let value =
        parse_float(value_part).ok_or_else(|| ParseError::InvalidValue(value_part.to_string()))?;

    let timestamp_ms = match parts.next() {
        Some(raw) => Some(
            raw.parse::<i64>()
                .map_err(|_| ParseError::InvalidTimestamp(raw.to_string()))?,
        ),
        None => None,
    };

    Ok((value, timestamp_ms))
}

/// Parse a float, honoring the exposition spellings of the specials.
fn parse_float(raw: &str) -> Option<f64> {
    match raw {
        "NaN" => Some(f64::NAN),
        "+Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        _ => raw.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn label(name: &str, value: &str) -> LabelPair {
        LabelPair {
            name: Some(name.to_string()),
            value: Some(value.to_string()),
        }
    }

    #[test]
    fn decodes_counters_and_gauges_with_types() {
        let text = r#"
# HELP http_requests_total The total number of HTTP requests.
# TYPE http_requests_total counter
http_requests_total{method="post",code="200"} 1027 1395066363000
http_requests_total{method="post",code="400"}    3 1395066363000

# TYPE memory_usage gauge
memory_usage 5264384
"#;
        let families = decode(text).expect("decodes");
        assert_eq!(families.len(), 2);

        let requests = &families[0];
        assert_eq!(requests.name.as_deref(), Some("http_requests_total"));
        assert_eq!(requests.kind(), MetricType::Counter);
        assert_eq!(requests.metric.len(), 2);
        assert_eq!(
            requests.metric[0].label,
            vec![label("method", "post"), label("code", "200")]
        );
        assert_eq!(
            requests.metric[0].counter.expect("counter").value,
            Some(1027.0)
        );
        assert_eq!(requests.metric[0].timestamp_ms, Some(1_395_066_363_000));

        let memory = &families[1];
        assert_eq!(memory.kind(), MetricType::Gauge);
        assert_eq!(memory.metric[0].gauge.expect("gauge").value, Some(5_264_384.0));
        assert_eq!(memory.metric[0].timestamp_ms, None);
    }

    #[test]
    fn folds_summary_samples_into_one_family() {
        let text = r#"
# TYPE rpc_duration_seconds summary
rpc_duration_seconds{quantile="0.5"} 4.2
rpc_duration_seconds{quantile="0.9"} 8.1
rpc_duration_seconds_sum 17560473
rpc_duration_seconds_count 2693
"#;
        let families = decode(text).expect("decodes");
        assert_eq!(families.len(), 1);

        let family = &families[0];
        assert_eq!(family.kind(), MetricType::Summary);
        assert_eq!(family.metric.len(), 1);

        let summary = family.metric[0].summary.as_ref().expect("summary");
        assert_eq!(summary.sample_sum, Some(17_560_473.0));
        assert_eq!(summary.sample_count, Some(2693));
        assert_eq!(summary.quantile.len(), 2);
        assert_eq!(summary.quantile[0].quantile, Some(0.5));
        assert_eq!(summary.quantile[0].value, Some(4.2));
    }

    #[test]
    fn summary_label_sets_stay_distinct() {
        let text = r#"
# TYPE api_latency summary
api_latency_sum{service="auth"} 12.0
api_latency_count{service="auth"} 4
api_latency_sum{service="billing"} 99.5
api_latency_count{service="billing"} 31
"#;
        let families = decode(text).expect("decodes");
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].metric.len(), 2);

        let billing = &families[0].metric[1];
        assert_eq!(billing.label, vec![label("service", "billing")]);
        let summary = billing.summary.as_ref().expect("summary");
        assert_eq!(summary.sample_sum, Some(99.5));
        assert_eq!(summary.sample_count, Some(31));
    }

    #[test]
    fn folds_histogram_samples_into_one_family() {
        let text = r#"
# TYPE request_size_bytes histogram
request_size_bytes_bucket{le="1024"} 24
request_size_bytes_bucket{le="+Inf"} 30
request_size_bytes_sum 45678
request_size_bytes_count 30
"#;
        let families = decode(text).expect("decodes");
        assert_eq!(families.len(), 1);

        let family = &families[0];
        assert_eq!(family.kind(), MetricType::Histogram);
        let histogram = family.metric[0].histogram.as_ref().expect("histogram");
        assert_eq!(histogram.sample_sum, Some(45678.0));
        assert_eq!(histogram.sample_count, Some(30));
        assert_eq!(histogram.bucket.len(), 2);
        assert_eq!(histogram.bucket[1].upper_bound, Some(f64::INFINITY));
        assert_eq!(histogram.bucket[1].cumulative_count, Some(30));
    }

    #[test]
    fn names_without_type_comments_are_untyped() {
        let families = decode("mystery_metric 12.5\n").expect("decodes");
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].kind(), MetricType::Untyped);
        assert_eq!(
            families[0].metric[0].untyped.expect("untyped").value,
            Some(12.5)
        );
    }

    #[test]
    fn label_values_keep_spaces_and_escapes() {
        let families = decode(
            r#"some_gauge{location="pantry #1",note="a\"b\\c\nd"} 71"#,
        )
        .expect("decodes");
        let labels = &families[0].metric[0].label;
        assert_eq!(labels[0].value.as_deref(), Some("pantry #1"));
        assert_eq!(labels[1].value.as_deref(), Some("a\"b\\c\nd"));
    }

    #[test]
    fn special_float_values_decode() {
        let families = decode("a_metric NaN\nb_metric +Inf\nc_metric -Inf\n").expect("decodes");
        assert!(families[0].metric[0]
            .untyped
            .expect("untyped")
            .value
            .expect("value")
            .is_nan());
        assert_eq!(
            families[1].metric[0].untyped.expect("untyped").value,
            Some(f64::INFINITY)
        );
        assert_eq!(
            families[2].metric[0].untyped.expect("untyped").value,
            Some(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn unquoted_label_value_is_an_error() {
        let result = decode("metric{key=unquoted} 1\n");
        assert!(matches!(result, Err(ParseError::InvalidLabel(_))));
    }

    #[test]
    fn unknown_type_comment_is_an_error() {
        let result = decode("# TYPE something exotic\n");
        assert!(matches!(result, Err(ParseError::UnknownMetricType(_))));
    }

    #[test]
    fn missing_value_is_an_error() {
        assert!(matches!(
            decode("lonely_metric\n"),
            Err(ParseError::MissingValue)
        ));
        assert!(matches!(
            decode("lonely_metric{a=\"b\"}\n"),
            Err(ParseError::MissingValue)
        ));
    }

    #[test]
    fn garbage_value_is_an_error() {
        assert!(matches!(
            decode("metric twelve\n"),
            Err(ParseError::InvalidValue(_))
        ));
    }

    proptest! {
        #[test]
        fn never_panics_on_any_input(input: String) {
            let _ = decode(&input);
        }

        #[test]
        fn valid_scalar_samples_decode(
            name in "[a-zA-Z_:][a-zA-Z0-9_:]{0,24}",
            value in prop::num::f64::NORMAL,
        ) {
            let families = decode(&format!("{name} {value}\n")).expect("decodes");
            prop_assert_eq!(families.len(), 1);
            prop_assert_eq!(families[0].name.as_deref(), Some(name.as_str()));
            prop_assert_eq!(
                families[0].metric[0].untyped.expect("untyped").value,
                Some(value)
            );
        }

        #[test]
        fn label_escaping_round_trips(
            name in "[a-zA-Z_][a-zA-Z0-9_]{0,16}",
            raw_value in ".*",
        ) {
            let escaped = raw_value
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('\n', "\\n");
            let families = decode(&format!("{name}{{key=\"{escaped}\"}} 1\n")).expect("decodes");
            prop_assert_eq!(
                families[0].metric[0].label[0].value.as_deref(),
                Some(raw_value.as_str())
            );
        }
    }
}
