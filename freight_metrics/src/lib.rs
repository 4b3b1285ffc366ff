//! Measurement and metric set data model for the freight agent.
//!
//! A [`Measurement`] is a single observation produced by an ingress source. A
//! [`MetricSet`] is the per-interval aggregate those observations reduce
//! into, and the unit that is shipped upstream. The reduction rules -- sample
//! rate scaling, gauge modifiers, derived counter deltas -- live here so that
//! every source feeds one reducer.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::mod_module_files)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::{sync::Arc, time::SystemTime};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The kinds of metrics a [`Measurement`] can contribute to.
pub enum MetricKind {
    /// A positive change in value within one flush interval.
    Counter,
    /// A monotonically increasing reading from which per-interval deltas are
    /// computed. The source is not expected to reset it; if it does, the
    /// post-reset reading is taken as the delta.
    DerivedCounter,
    /// A point-in-time value.
    Gauge,
    /// Parsed for statsd compatibility, aggregated into nothing.
    Timer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// How a gauge measurement amends the previous interval's value.
pub enum Modifier {
    /// Replace the gauge outright. The wire form is an unsigned value.
    #[default]
    Set,
    /// Add to the previous interval's gauge, wire form `+`.
    Add,
    /// Subtract from the previous interval's gauge, wire form `-`.
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
/// A point-in-time observation used to amend a metric.
pub struct Measurement {
    /// The metric this observation contributes to. Restricted by every source
    /// to `[A-Za-z0-9._-]+`.
    pub name: String,
    /// The instant the observation was captured, or the instant the source
    /// reported for it.
    pub timestamp: SystemTime,
    /// The kind of metric to amend.
    pub kind: MetricKind,
    /// The amount by which to amend it. For gauges the amendment may be a
    /// replacement, see [`Modifier`].
    pub value: f64,
    /// The rate this observation was sampled at, in `(0, 1]`. Counter values
    /// are scaled by its inverse.
    pub sample_rate: f32,
    /// Gauge amendment behavior. Ignored for every other kind.
    pub modifier: Modifier,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
/// A container for one flush interval's worth of metrics, and the rules for
/// how a [`Measurement`] amends them.
pub struct MetricSet {
    /// Counter deltas accumulated during the interval.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub counters: FxHashMap<String, f64>,
    /// Gauge values as of the end of the interval.
    #[serde(default, skip_serializing_if = "FxHashMap::is_empty")]
    pub gauges: FxHashMap<String, f64>,
    /// Raw last-seen readings of each derived counter. Never uploaded.
    #[serde(skip)]
    mono_counters: FxHashMap<String, f64>,
    /// The previous interval's snapshot, consulted for derived counter deltas
    /// and relative gauge arithmetic.
    #[serde(skip)]
    parent: Option<Arc<MetricSet>>,
}

impl MetricSet {
    /// Create a `MetricSet`.
    ///
    /// If a parent is given it is expected to be the previous interval's
    /// snapshot, so that derived counters and modified gauges are computed
    /// against what was last reported.
    #[must_use]
    pub fn new(parent: Option<Arc<MetricSet>>) -> Self {
        Self {
            counters: FxHashMap::default(),
            gauges: FxHashMap::default(),
            mono_counters: FxHashMap::default(),
            parent,
        }
    }

    /// Apply one [`Measurement`] to this set.
    ///
    /// A name seen with a different kind than before simply begins a bucket
    /// of that kind; nothing is migrated.
    pub fn update(&mut self, measurement: &Measurement) {
        let rate = f64::from(measurement.sample_rate);
        match measurement.kind {
            MetricKind::Counter => {
                *self.counters.entry(measurement.name.clone()).or_default() +=
                    measurement.value / rate;
            }
            MetricKind::DerivedCounter => {
                let current = measurement.value;
                let prev = self
                    .parent
                    .as_deref()
                    .and_then(|parent| parent.mono_counters.get(&measurement.name))
                    .copied()
                    .unwrap_or(0.0);

                self.mono_counters
                    .insert(measurement.name.clone(), current);

                let bucket = self.counters.entry(measurement.name.clone()).or_default();
                if current < prev {
                    // The source reset; the reading is the whole delta.
                    *bucket += current / rate;
                } else {
                    *bucket += (current - prev) / rate;
                }
            }
            MetricKind::Gauge => {
                let prev = self
                    .parent
                    .as_deref()
                    .and_then(|parent| parent.gauges.get(&measurement.name))
                    .copied()
                    .unwrap_or(0.0);

                // Dividing an instantaneous value by its sample rate is
                // dubious but long-standing behavior; sources set 1.0.
                let scaled = measurement.value / rate;
                let value = match measurement.modifier {
                    Modifier::Add => prev + scaled,
                    Modifier::Sub => prev - scaled,
                    Modifier::Set => scaled,
                };
                self.gauges.insert(measurement.name.clone(), value);
            }
            MetricKind::Timer => {}
        }
    }

    /// Produce a deep copy of this set with no parent reference.
    ///
    /// The snapshot is the uploadable artifact and the next interval's
    /// parent. Dropping the parent reference here is what keeps the snapshot
    /// chain from growing without bound.
    #[must_use]
    pub fn snapshot(&self) -> MetricSet {
        MetricSet {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
            mono_counters: self.mono_counters.clone(),
            parent: None,
        }
    }

    /// The cardinality of this set: counters plus gauges. Derived counter
    /// bookkeeping does not count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len() + self.gauges.len()
    }

    /// True if the set holds no counters and no gauges.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
