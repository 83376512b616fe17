//! Run aggregation.
//!
//! Users never touch shared counters. Each one holds a [`Recorder`], a
//! cloned sender into an unbounded channel, and a single task owns the
//! [`Aggregator`] and drains that channel until every sender is gone.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use tdigest::TDigest;

use crate::report::{CheckCount, IterationCount, LatencySummary};

/// One observation sent by a user or a scheduler.
#[derive(Debug, Clone)]
pub enum Record {
    /// A finished request. `status` is `None` for a transport error.
    Request {
        step: Arc<str>,
        status: Option<u16>,
        latency: Option<Duration>,
    },
    Check {
        label: Arc<str>,
        passed: bool,
    },
    Extraction {
        variable: Arc<str>,
        ok: bool,
    },
    Iteration {
        completed: bool,
    },
    Users(usize),
}

#[derive(Debug, Clone)]
pub struct Recorder {
    tx: crate::Sender<Record>,
}

impl Recorder {
    /// Recorder plus the receiving end an [`Aggregator`] drains.
    pub fn channel() -> (Self, crate::Receiver<Record>) {
        let (tx, rx) = crate::channel();
        (Self { tx }, rx)
    }

    pub fn record(&self, record: Record) {
        // The aggregator outlives every recorder; a closed channel only
        // happens when the run is being torn down.
        let _ = self.tx.send(record);
    }

    pub fn request(&self, step: &Arc<str>, status: Option<u16>, latency: Option<Duration>) {
        self.record(Record::Request {
            step: step.clone(),
            status,
            latency,
        })
    }

    pub fn check(&self, label: &Arc<str>, passed: bool) {
        self.record(Record::Check {
            label: label.clone(),
            passed,
        })
    }

    pub fn extraction(&self, variable: &Arc<str>, ok: bool) {
        self.record(Record::Extraction {
            variable: variable.clone(),
            ok,
        })
    }

    pub fn iteration(&self, completed: bool) {
        self.record(Record::Iteration { completed })
    }

    pub fn users(&self, active: usize) {
        self.record(Record::Users(active))
    }
}

/// Accumulated outcomes of one scenario run.
#[derive(Debug, Default)]
pub struct Aggregator {
    pub(crate) requests: u64,
    pub(crate) transport_errors: u64,
    pub(crate) statuses: BTreeMap<u16, u64>,
    pub(crate) steps: BTreeMap<Arc<str>, u64>,
    checks: Vec<(Arc<str>, CheckCount)>,
    check_index: HashMap<Arc<str>, usize>,
    pub(crate) latency: Histogram,
    pub(crate) iterations: IterationCount,
    /// Failed extractions per target variable.
    pub(crate) extraction_failures: BTreeMap<Arc<str>, u64>,
    pub(crate) max_users: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, record: Record) {
        match record {
            Record::Request {
                step,
                status,
                latency,
            } => {
                self.requests += 1;
                *self.steps.entry(step).or_default() += 1;
                match status {
                    Some(status) => *self.statuses.entry(status).or_default() += 1,
                    None => self.transport_errors += 1,
                }
                if let Some(latency) = latency {
                    self.latency.observe(latency);
                }
            }
            Record::Check { label, passed } => {
                let index = match self.check_index.get(&label) {
                    Some(index) => *index,
                    None => {
                        self.checks.push((label.clone(), CheckCount::default()));
                        self.check_index.insert(label, self.checks.len() - 1);
                        self.checks.len() - 1
                    }
                };
                let count = &mut self.checks[index].1;
                if passed {
                    count.passes += 1;
                } else {
                    count.fails += 1;
                }
            }
            Record::Extraction { variable, ok } => {
                if !ok {
                    *self.extraction_failures.entry(variable).or_default() += 1;
                }
            }
            Record::Iteration { completed } => {
                if completed {
                    self.iterations.completed += 1;
                } else {
                    self.iterations.aborted += 1;
                }
            }
            Record::Users(active) => self.max_users = self.max_users.max(active),
        }
    }

    /// Drain `rx` until every [`Recorder`] has been dropped.
    pub async fn collect(mut rx: crate::Receiver<Record>) -> Self {
        let mut this = Self::new();
        let mut buffer = Vec::with_capacity(128);
        while rx.recv_many(&mut buffer, 128).await > 0 {
            for record in buffer.drain(..) {
                this.update(record);
            }
        }
        this
    }

    /// Check counters in the order their labels were first seen.
    pub fn checks(&self) -> impl Iterator<Item = (&str, CheckCount)> {
        self.checks.iter().map(|(label, count)| (&**label, *count))
    }
}

const HISTOGRAM_BUFFER: usize = 4096;

/// Latency distribution. Exact while small, folded into a t-digest once
/// the raw buffer fills.
#[derive(Debug, Default)]
pub struct Histogram {
    digest: Option<TDigest>,
    buffer: Vec<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    pub fn observe(&mut self, value: Duration) {
        let value = value.as_secs_f64() * 1000.0;
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.buffer.push(value);
        if self.buffer.len() >= HISTOGRAM_BUFFER {
            let values = std::mem::take(&mut self.buffer);
            let digest = self.digest.take().unwrap_or_default();
            self.digest = Some(digest.merge_unsorted(values));
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Summary in milliseconds.
    pub fn summary(&self) -> LatencySummary {
        if self.count == 0 {
            return LatencySummary::default();
        }
        let quantile: Box<dyn Fn(f64) -> f64> = match &self.digest {
            Some(digest) => {
                let digest = if self.buffer.is_empty() {
                    digest.clone()
                } else {
                    digest.merge_unsorted(self.buffer.clone())
                };
                Box::new(move |q| digest.estimate_quantile(q))
            }
            None => {
                let mut sorted = self.buffer.clone();
                sorted.sort_by(f64::total_cmp);
                Box::new(move |q| nearest_rank(&sorted, q))
            }
        };
        LatencySummary {
            min: self.min,
            mean: self.sum / self.count as f64,
            max: self.max,
            p50: quantile(0.50),
            p90: quantile(0.90),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

fn nearest_rank(sorted: &[f64], q: f64) -> f64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let mut histogram = Histogram::default();
        for ms in 1..=100u64 {
            histogram.observe(Duration::from_millis(ms));
        }
        let summary = histogram.summary();
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 100.0);
        assert_eq!(summary.p50, 50.0);
        assert_eq!(summary.p90, 90.0);
        assert_eq!(summary.p95, 95.0);
        assert_eq!(summary.p99, 99.0);
        assert!((summary.mean - 50.5).abs() < 1e-9);
    }

    #[test]
    fn large_histograms_fold_into_digest() {
        let mut histogram = Histogram::default();
        for ms in 0..10_000u64 {
            histogram.observe(Duration::from_micros(ms * 100));
        }
        assert_eq!(histogram.count(), 10_000);
        let summary = histogram.summary();
        assert!((summary.p50 - 500.0).abs() < 10.0, "p50 = {}", summary.p50);
        assert!((summary.p99 - 990.0).abs() < 10.0, "p99 = {}", summary.p99);
    }

    #[test]
    fn check_labels_keep_first_seen_order() {
        let mut aggregator = Aggregator::new();
        let created: Arc<str> = "Order Success (201)".into();
        let conflict: Arc<str> = "Sold Out/Conflict (400/409)".into();
        for (label, passed) in [(&conflict, true), (&created, true), (&conflict, false)] {
            aggregator.update(Record::Check {
                label: label.clone(),
                passed,
            });
        }
        let checks: Vec<_> = aggregator.checks().collect();
        assert_eq!(checks[0].0, "Sold Out/Conflict (400/409)");
        assert_eq!(checks[0].1, CheckCount { passes: 1, fails: 1 });
        assert_eq!(checks[1].1, CheckCount { passes: 1, fails: 0 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_recorders_lose_nothing() {
        const WRITERS: usize = 200;
        const PER_WRITER: usize = 50;

        let (recorder, rx) = Recorder::channel();
        let collector = tokio::spawn(Aggregator::collect(rx));
        let step: Arc<str> = "search".into();
        let label: Arc<str> = "status 200".into();

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let recorder = recorder.clone();
                let step = step.clone();
                let label = label.clone();
                tokio::spawn(async move {
                    for i in 0..PER_WRITER {
                        let status = if (writer + i) % 5 == 0 { 500 } else { 200 };
                        recorder.request(&step, Some(status), Some(Duration::from_millis(1)));
                        recorder.check(&label, status == 200);
                        tokio::task::yield_now().await;
                    }
                    recorder.iteration(true);
                })
            })
            .collect();
        drop(recorder);
        for writer in writers {
            writer.await.unwrap();
        }

        let aggregator = collector.await.unwrap();
        let total = (WRITERS * PER_WRITER) as u64;
        assert_eq!(aggregator.requests, total);
        assert_eq!(aggregator.statuses.values().sum::<u64>(), total);
        assert_eq!(aggregator.latency.count(), total);
        let (_, check) = aggregator.checks().next().unwrap();
        assert_eq!(check.passes + check.fails, total);
        assert_eq!(check.fails, aggregator.statuses[&500]);
        assert_eq!(aggregator.iterations.completed, WRITERS as u64);
    }
}
