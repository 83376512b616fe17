use std::{collections::BTreeMap, fmt::Write as _, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::{error::Error, logical::Executor, metrics::Aggregator};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckCount {
    pub passes: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IterationCount {
    pub completed: u64,
    pub aborted: u64,
}

/// Latency summary in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min: f64,
    pub mean: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Pass criteria for a scenario. A breached threshold turns the exit
/// status non-zero but never stops the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_transport_error_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_check_failure_rate: Option<f64>,
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_p95_latency: Option<Duration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckBound>,
}

/// Bounds on how often one labeled check may pass or fail.
///
/// `{label: "Order Success (201)", min_passes: 1, max_passes: 1}` states
/// that exactly one buyer wins the last unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckBound {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_passes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_passes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fails: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub label: String,
    #[serde(flatten)]
    pub count: CheckCount,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub executor: Executor,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub requests: u64,
    pub transport_errors: u64,
    pub statuses: BTreeMap<u16, u64>,
    pub steps: BTreeMap<String, u64>,
    pub checks: Vec<CheckReport>,
    pub latency_ms: LatencySummary,
    pub iterations: IterationCount,
    pub extraction_failures: BTreeMap<String, u64>,
    pub max_users: usize,
    pub violations: Vec<String>,
}

impl ScenarioReport {
    pub(crate) fn new(
        name: impl Into<String>,
        executor: Executor,
        started_at: DateTime<Utc>,
        duration: Duration,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            name: name.into(),
            executor,
            started_at,
            duration,
            requests: aggregator.requests,
            transport_errors: aggregator.transport_errors,
            statuses: aggregator.statuses.clone(),
            steps: aggregator
                .steps
                .iter()
                .map(|(step, count)| (step.to_string(), *count))
                .collect(),
            checks: aggregator
                .checks()
                .map(|(label, count)| CheckReport {
                    label: label.to_string(),
                    count,
                })
                .collect(),
            latency_ms: aggregator.latency.summary(),
            iterations: aggregator.iterations,
            extraction_failures: aggregator
                .extraction_failures
                .iter()
                .map(|(variable, count)| (variable.to_string(), *count))
                .collect(),
            max_users: aggregator.max_users,
            violations: Vec::new(),
        }
    }

    pub fn check(&self, label: &str) -> CheckCount {
        self.checks
            .iter()
            .find(|check| check.label == label)
            .map(|check| check.count)
            .unwrap_or_default()
    }

    pub fn status_count(&self, status: u16) -> u64 {
        self.statuses.get(&status).copied().unwrap_or_default()
    }

    pub fn transport_error_rate(&self) -> f64 {
        ratio(self.transport_errors, self.requests)
    }

    pub fn check_failure_rate(&self) -> f64 {
        let (fails, total) = self.checks.iter().fold((0, 0), |(fails, total), check| {
            (
                fails + check.count.fails,
                total + check.count.fails + check.count.passes,
            )
        });
        ratio(fails, total)
    }

    /// Record every breached threshold in `violations`.
    pub fn evaluate(&mut self, thresholds: &Thresholds) {
        let mut violations = Vec::new();
        if let Some(max) = thresholds.max_transport_error_rate {
            let rate = self.transport_error_rate();
            if rate > max {
                violations.push(format!("transport error rate {rate:.4} > {max}"));
            }
        }
        if let Some(max) = thresholds.max_check_failure_rate {
            let rate = self.check_failure_rate();
            if rate > max {
                violations.push(format!("check failure rate {rate:.4} > {max}"));
            }
        }
        if let Some(max) = thresholds.max_p95_latency {
            let p95 = self.latency_ms.p95;
            if p95 > max.as_secs_f64() * 1000.0 {
                violations.push(format!("p95 latency {p95:.2}ms > {max:?}"));
            }
        }
        for bound in &thresholds.checks {
            let count = self.check(&bound.label);
            if let Some(min) = bound.min_passes {
                if count.passes < min {
                    violations.push(format!(
                        "`{}` passed {} times, expected at least {min}",
                        bound.label, count.passes
                    ));
                }
            }
            if let Some(max) = bound.max_passes {
                if count.passes > max {
                    violations.push(format!(
                        "`{}` passed {} times, expected at most {max}",
                        bound.label, count.passes
                    ));
                }
            }
            if let Some(max) = bound.max_fails {
                if count.fails > max {
                    violations.push(format!(
                        "`{}` failed {} times, expected at most {max}",
                        bound.label, count.fails
                    ));
                }
            }
        }
        self.violations = violations;
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Final, read-only outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Ulid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// The run ended early through its deadline or a stop command.
    pub stopped: bool,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.scenarios
            .iter()
            .all(|scenario| scenario.violations.is_empty())
    }

    pub fn scenario(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|scenario| scenario.name == name)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), Error> {
        let file = std::fs::File::create(path).map_err(|err| {
            Error::Generic(anyhow::Error::from(err).context(format!(
                "cannot create report file {}",
                path.display()
            )))
        })?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)
            .map_err(|err| Error::Generic(err.into()))
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "run {} ({:.2?})", self.run_id, self.duration)?;
        if self.stopped {
            writeln!(f, "  run stopped before completion")?;
        }
        for scenario in &self.scenarios {
            writeln!(f)?;
            write!(f, "{scenario}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "scenario `{}` {} ({:.2?})",
            self.name, self.executor, self.duration
        )?;

        let width = self
            .checks
            .iter()
            .map(|check| check.label.chars().count())
            .max()
            .unwrap_or(0);
        for check in &self.checks {
            let mark = if check.count.fails == 0 { '✓' } else { '✗' };
            writeln!(
                f,
                "  {mark} {:<width$}  {} passed / {} failed",
                check.label, check.count.passes, check.count.fails
            )?;
        }

        let mut statuses = String::new();
        for (status, count) in &self.statuses {
            let _ = write!(statuses, " {status}={count}");
        }
        let latency = &self.latency_ms;
        writeln!(
            f,
            "  requests......: {} (transport errors: {})",
            self.requests, self.transport_errors
        )?;
        writeln!(f, "  statuses......:{statuses}")?;
        writeln!(
            f,
            "  latency (ms)..: min={:.2} mean={:.2} p50={:.2} p90={:.2} p95={:.2} p99={:.2} max={:.2}",
            latency.min, latency.mean, latency.p50, latency.p90, latency.p95, latency.p99, latency.max
        )?;
        writeln!(
            f,
            "  iterations....: {} completed, {} aborted",
            self.iterations.completed, self.iterations.aborted
        )?;
        if !self.extraction_failures.is_empty() {
            let mut failed = String::new();
            for (variable, count) in &self.extraction_failures {
                let _ = write!(failed, " {variable}={count}");
            }
            writeln!(f, "  failed extractions:{failed}")?;
        }
        writeln!(f, "  max users.....: {}", self.max_users)?;
        if self.violations.is_empty() {
            writeln!(f, "  thresholds....: ok")?;
        } else {
            for violation in &self.violations {
                writeln!(f, "  threshold violated: {violation}")?;
            }
        }
        Ok(())
    }
}
