//! Per-metric interval aggregation
//!
//! An [`IntervalAccumulator`] folds samples into count, min, max and a running
//! mean in constant time. [`IntervalAccumulator::snapshot_and_reset`] freezes
//! the interval into an [`IntervalSnapshot`] and starts the next one under the
//! same lock `apply` takes, so no snapshot ever mixes two intervals.
//!
//! Non-finite samples are not sanitized. A NaN makes the running mean NaN for
//! the rest of the interval, and a NaN first sample pins min and max to NaN.
//! On the wire non-finite values are written as the strings `"NaN"`, `"inf"`
//! and `"-inf"` so a snapshot holding one still decodes.

use chrono::{DateTime, Utc};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::metric::{MetricIdentity, MetricKind};

/// Numeric type an accumulator can aggregate
pub trait Sample:
    Copy + PartialOrd + Send + Sync + Debug + Serialize + DeserializeOwned + 'static
{
    /// Value reported for min/max of an empty interval
    const ZERO: Self;

    /// Lossy widening used for the running mean
    fn to_f64(self) -> f64;

    /// Narrow a NaN or infinity back into this type, if it can hold one
    fn from_non_finite(value: f64) -> Option<Self>;
}

macro_rules! impl_sample {
    (integer: $($t:ty),*) => {
        $(
            impl Sample for $t {
                const ZERO: Self = 0;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_non_finite(_: f64) -> Option<Self> {
                    None
                }
            }
        )*
    };
    (float: $($t:ty),*) => {
        $(
            impl Sample for $t {
                const ZERO: Self = 0.0;

                fn to_f64(self) -> f64 {
                    self as f64
                }

                fn from_non_finite(value: f64) -> Option<Self> {
                    Some(value as $t)
                }
            }
        )*
    };
}

impl_sample!(integer: i32, i64, u32, u64);
impl_sample!(float: f32, f64);

/// Serde helpers that keep NaN and infinities intact through JSON
pub mod wire {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire<T> {
        Number(T),
        Text(String),
    }

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Sample,
        S: Serializer,
    {
        let widened = value.to_f64();
        if widened.is_nan() {
            serializer.serialize_str("NaN")
        } else if widened == f64::INFINITY {
            serializer.serialize_str("inf")
        } else if widened == f64::NEG_INFINITY {
            serializer.serialize_str("-inf")
        } else {
            value.serialize(serializer)
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: Sample,
        D: Deserializer<'de>,
    {
        match Wire::<T>::deserialize(deserializer)? {
            Wire::Number(value) => Ok(value),
            Wire::Text(text) => {
                let value = match text.as_str() {
                    "NaN" => f64::NAN,
                    "inf" => f64::INFINITY,
                    "-inf" => f64::NEG_INFINITY,
                    other => {
                        return Err(de::Error::custom(format!(
                            "invalid sample value: {:?}",
                            other
                        )));
                    }
                };
                T::from_non_finite(value).ok_or_else(|| {
                    de::Error::custom(format!("{} does not fit this sample type", text))
                })
            }
        }
    }
}

/// Frozen state of one accumulator for one interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Sample", deserialize = "T: Sample"))]
pub struct IntervalSnapshot<T> {
    pub identity: MetricIdentity,
    /// Per-accumulator interval number, starting at 1
    pub interval: u64,
    pub count: u64,
    #[serde(with = "wire")]
    pub min: T,
    #[serde(with = "wire")]
    pub max: T,
    #[serde(with = "wire")]
    pub average: f64,
    pub kind: MetricKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct State<T> {
    count: u64,
    min: T,
    max: T,
    average: f64,
    // Set once min/max hold a real sample; sticky metrics keep it across resets
    seeded: bool,
    interval: u64,
}

impl<T: Sample> State<T> {
    fn new() -> Self {
        Self {
            count: 0,
            min: T::ZERO,
            max: T::ZERO,
            average: 0.0,
            seeded: false,
            interval: 0,
        }
    }
}

/// Mutable aggregation state for a single [`MetricIdentity`]
#[derive(Debug)]
pub struct IntervalAccumulator<T: Sample> {
    identity: MetricIdentity,
    kind: MetricKind,
    state: Mutex<State<T>>,
}

impl<T: Sample> IntervalAccumulator<T> {
    pub fn new(identity: MetricIdentity, kind: MetricKind) -> Self {
        Self {
            identity,
            kind,
            state: Mutex::new(State::new()),
        }
    }

    pub fn identity(&self) -> &MetricIdentity {
        &self.identity
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    // Every critical section leaves State consistent, so a poisoned lock is safe to reuse
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fold one sample into the current interval
    pub fn apply(&self, sample: T) {
        let mut state = self.lock();

        if !state.seeded {
            state.min = sample;
            state.max = sample;
            state.seeded = true;
        } else {
            if sample < state.min {
                state.min = sample;
            }
            if sample > state.max {
                state.max = sample;
            }
        }

        state.count += 1;
        let n = state.count as f64;
        state.average += (sample.to_f64() - state.average) / n;
    }

    /// Samples applied in the current interval
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    /// Copy of the current interval without resetting it
    pub fn peek(&self, now: DateTime<Utc>) -> IntervalSnapshot<T> {
        let state = self.lock();
        self.freeze(&state, state.interval, now)
    }

    /// Freeze the current interval and begin the next one
    pub fn snapshot_and_reset(&self, now: DateTime<Utc>) -> IntervalSnapshot<T> {
        let mut state = self.lock();
        state.interval += 1;
        let snapshot = self.freeze(&state, state.interval, now);

        state.count = 0;
        state.average = 0.0;
        if !self.kind.is_sticky() {
            state.min = T::ZERO;
            state.max = T::ZERO;
            state.seeded = false;
        }

        snapshot
    }

    fn freeze(&self, state: &State<T>, interval: u64, now: DateTime<Utc>) -> IntervalSnapshot<T> {
        IntervalSnapshot {
            identity: self.identity.clone(),
            interval,
            count: state.count,
            min: state.min,
            max: state.max,
            average: state.average,
            kind: self.kind,
            timestamp: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn id() -> MetricIdentity {
        MetricIdentity::new("test", "latency")
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    #[test]
    fn test_aggregates_match_samples() {
        let samples = [3.5, -2.0, 17.25, 0.0, 9.0, 9.0, -11.5, 4.0];
        let acc = IntervalAccumulator::<f64>::new(id(), MetricKind::Resetting);
        for s in samples {
            acc.apply(s);
        }

        let snap = acc.snapshot_and_reset(Utc::now());
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;

        assert_eq!(snap.count, samples.len() as u64);
        assert_eq!(snap.min, -11.5);
        assert_eq!(snap.max, 17.25);
        assert_close(snap.average, mean);
        assert!(snap.min as f64 <= snap.average && snap.average <= snap.max);
    }

    #[test]
    fn test_integer_samples_do_not_overflow_mean() {
        let acc = IntervalAccumulator::<i64>::new(id(), MetricKind::Resetting);
        acc.apply(i64::MAX - 1);
        acc.apply(i64::MAX - 3);

        let snap = acc.snapshot_and_reset(Utc::now());
        assert_eq!(snap.min, i64::MAX - 3);
        assert_eq!(snap.max, i64::MAX - 1);
        assert!(snap.average > 9.2e18);
    }

    #[test]
    fn test_first_sample_is_min_and_max() {
        let acc = IntervalAccumulator::<u64>::new(id(), MetricKind::Resetting);
        acc.apply(42);
        let snap = acc.peek(Utc::now());
        assert_eq!((snap.min, snap.max, snap.count), (42, 42, 1));
        assert_close(snap.average, 42.0);
    }

    #[test]
    fn test_resetting_kind_starts_fresh() {
        let acc = IntervalAccumulator::<i64>::new(id(), MetricKind::Resetting);
        acc.apply(100);
        acc.apply(-100);
        let first = acc.snapshot_and_reset(Utc::now());
        assert_eq!(first.interval, 1);

        let empty = acc.peek(Utc::now());
        assert_eq!(empty.count, 0);
        assert_eq!((empty.min, empty.max), (0, 0));
        assert_close(empty.average, 0.0);

        // The next sample seeds both extremes again
        acc.apply(7);
        let second = acc.snapshot_and_reset(Utc::now());
        assert_eq!((second.min, second.max, second.count), (7, 7, 1));
        assert_eq!(second.interval, 2);
    }

    #[test]
    fn test_sticky_kind_keeps_extremes() {
        let acc = IntervalAccumulator::<i64>::new(id(), MetricKind::Sticky);
        acc.apply(5);
        acc.apply(10);
        let first = acc.snapshot_and_reset(Utc::now());
        assert_eq!((first.min, first.max), (5, 10));

        let after = acc.peek(Utc::now());
        assert_eq!(after.count, 0);
        assert_eq!((after.min, after.max), (5, 10));
        assert_close(after.average, 0.0);

        acc.apply(7);
        let second = acc.snapshot_and_reset(Utc::now());
        assert_eq!((second.min, second.max, second.count), (5, 10, 1));
        assert_close(second.average, 7.0);

        acc.apply(12);
        let third = acc.snapshot_and_reset(Utc::now());
        assert_eq!((third.min, third.max), (5, 12));
    }

    #[test]
    fn test_nan_propagates() {
        let acc = IntervalAccumulator::<f64>::new(id(), MetricKind::Resetting);
        acc.apply(1.0);
        acc.apply(f64::NAN);
        let snap = acc.snapshot_and_reset(Utc::now());
        assert_eq!(snap.count, 2);
        assert!(snap.average.is_nan());
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        let nan = IntervalAccumulator::<f64>::new(id(), MetricKind::Resetting);
        nan.apply(f64::NAN);
        let spike = IntervalAccumulator::<f64>::new(id(), MetricKind::Resetting);
        spike.apply(f64::NEG_INFINITY);
        spike.apply(2.0);

        let json = serde_json::to_string(&nan.snapshot_and_reset(Utc::now())).unwrap();
        assert!(json.contains("\"average\":\"NaN\""), "{}", json);
        let back: IntervalSnapshot<f64> = serde_json::from_str(&json).unwrap();
        assert!(back.min.is_nan() && back.max.is_nan() && back.average.is_nan());

        let json = serde_json::to_string(&spike.snapshot_and_reset(Utc::now())).unwrap();
        let back: IntervalSnapshot<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.min, f64::NEG_INFINITY);
        assert_eq!(back.max, 2.0);
        assert_eq!(back.average, f64::NEG_INFINITY);
    }

    #[test]
    fn test_integer_snapshot_rejects_non_finite_text() {
        let acc = IntervalAccumulator::<i64>::new(id(), MetricKind::Resetting);
        acc.apply(3);
        let mut value = serde_json::to_value(acc.snapshot_and_reset(Utc::now())).unwrap();
        assert_eq!(value["min"], 3);

        value["min"] = serde_json::Value::from("NaN");
        assert!(serde_json::from_value::<IntervalSnapshot<i64>>(value).is_err());
    }

    #[test]
    fn test_concurrent_apply_and_reset_never_tears() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 5_000;

        let acc = Arc::new(IntervalAccumulator::<f64>::new(id(), MetricKind::Resetting));
        let producers: Vec<_> = (0..THREADS)
            .map(|t| {
                let acc = Arc::clone(&acc);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        acc.apply(t as f64);
                    }
                })
            })
            .collect();

        let resetter = {
            let acc = Arc::clone(&acc);
            thread::spawn(move || {
                let mut snaps = Vec::new();
                for _ in 0..200 {
                    snaps.push(acc.snapshot_and_reset(Utc::now()));
                    thread::yield_now();
                }
                snaps
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        let mut snaps = resetter.join().unwrap();
        snaps.push(acc.snapshot_and_reset(Utc::now()));

        let total: u64 = snaps.iter().map(|s| s.count).sum();
        assert_eq!(total, (THREADS * PER_THREAD) as u64);

        let weighted: f64 = snaps.iter().map(|s| s.average * s.count as f64).sum();
        let expected: f64 = (0..THREADS).map(|t| (t * PER_THREAD) as f64).sum();
        assert!((weighted - expected).abs() / expected < 1e-6);

        for snap in snaps.iter().filter(|s| s.count > 0) {
            assert!(snap.min <= snap.average + 1e-9 && snap.average <= snap.max + 1e-9);
        }

        let intervals: Vec<u64> = snaps.iter().map(|s| s.interval).collect();
        assert!(intervals.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
