//! Labeled response predicates.
//!
//! A check never stops a run by itself. Its outcome is recorded under its
//! label and only a check flagged `critical` cuts the current iteration
//! short. Several checks on one step may hold at the same time: this is
//! how a clean `409` rejection is told apart from a `500` under contention.

use std::{ops::RangeInclusive, sync::Arc, time::Duration};

use serde_json::Value;

use crate::{client::HttpResponse, metrics::Recorder, session::JsonPath};

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Status(u16),
    StatusIn(Vec<u16>),
    StatusRange(RangeInclusive<u16>),
    BodyContains(String),
    /// Field exists, and equals `equals` when given.
    JsonField {
        path: JsonPath,
        equals: Option<Value>,
    },
    MaxLatency(Duration),
}

impl Predicate {
    pub fn eval(&self, response: &HttpResponse) -> bool {
        let status = response.status.as_u16();
        match self {
            Predicate::Status(expected) => status == *expected,
            Predicate::StatusIn(expected) => expected.contains(&status),
            Predicate::StatusRange(range) => range.contains(&status),
            Predicate::BodyContains(needle) => {
                String::from_utf8_lossy(&response.body).contains(needle.as_str())
            }
            Predicate::JsonField { path, equals } => {
                let Ok(body) = serde_json::from_slice::<Value>(&response.body) else {
                    return false;
                };
                match (path.lookup(&body), equals) {
                    (Some(found), Some(expected)) => found == expected,
                    (Some(_), None) => true,
                    (None, _) => false,
                }
            }
            Predicate::MaxLatency(max) => response.latency <= *max,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Check {
    pub label: Arc<str>,
    pub predicate: Predicate,
    pub critical: bool,
}

impl Check {
    pub fn new(label: impl Into<Arc<str>>, predicate: Predicate) -> Self {
        Self {
            label: label.into(),
            predicate,
            critical: false,
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Every check held.
    pub passed: bool,
    /// Index of the first critical check that failed.
    pub critical_failure: Option<usize>,
}

/// Evaluate all `checks` against `response` and record each outcome.
///
/// `None` stands for a transport error: every check is recorded as failed.
pub fn check(response: Option<&HttpResponse>, checks: &[Check], recorder: &Recorder) -> CheckOutcome {
    let mut outcome = CheckOutcome {
        passed: true,
        critical_failure: None,
    };
    for (index, check) in checks.iter().enumerate() {
        let passed = response.is_some_and(|response| check.predicate.eval(response));
        recorder.check(&check.label, passed);
        if !passed {
            outcome.passed = false;
            if check.critical && outcome.critical_failure.is_none() {
                outcome.critical_failure = Some(index);
            }
        }
    }
    outcome
}
