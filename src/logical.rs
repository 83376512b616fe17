use std::{borrow::Cow, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::scenario::Script;

/// A window of time with a concurrency target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Load shape used to drive the users of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Executor {
    /// Launch `users` at once and run exactly `iterations` iterations in
    /// total, divided among them up front. With as many iterations as
    /// users, every user runs one iteration.
    Fixed { users: usize, iterations: usize },
    /// Keep `users` busy for `duration`, doing as many iterations as possible.
    Constant {
        users: usize,
        #[serde(with = "humantime_serde")]
        duration: Duration,
    },
    /// Interpolate linearly from the previous target to each stage's
    /// target over the stage's duration. The first stage starts from
    /// `start_users`.
    Ramping {
        #[serde(default)]
        start_users: usize,
        stages: Vec<Stage>,
    },
}

impl Executor {
    /// Stage profile this executor follows, `None` for fixed iteration runs.
    pub fn profile(&self) -> Option<RampProfile> {
        match self {
            Executor::Fixed { .. } => None,
            // A constant executor is a ramp with a single flat stage
            Executor::Constant { users, duration } => Some(RampProfile {
                start_users: *users,
                stages: vec![Stage::new(*duration, *users)],
            }),
            Executor::Ramping {
                start_users,
                stages,
            } => Some(RampProfile {
                start_users: *start_users,
                stages: stages.clone(),
            }),
        }
    }
}

impl std::fmt::Display for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executor::Fixed { users, iterations } => {
                write!(f, "Fixed ({} users) {} iterations", users, iterations)
            }
            Executor::Constant { users, duration } => {
                write!(f, "Constant ({} users) {:?}", users, duration)
            }
            Executor::Ramping { stages, .. } => {
                write!(f, "Ramping ({} stages)", stages.len())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampProfile {
    pub start_users: usize,
    pub stages: Vec<Stage>,
}

impl RampProfile {
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|stage| stage.duration).sum()
    }

    /// Index of the stage running at `elapsed`, `None` once every stage is over.
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut offset = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            offset += stage.duration;
            if elapsed < offset {
                return Some(index);
            }
        }
        None
    }

    /// `round(c0 + (c1 - c0) * e / d)` for the stage running at `elapsed`.
    /// Zero length stages jump straight to their target.
    pub fn desired_users(&self, elapsed: Duration) -> usize {
        let mut from = self.start_users;
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if elapsed < end {
                let progress = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                let users = from as f64 + (stage.target as f64 - from as f64) * progress;
                return users.round().max(0.0) as usize;
            }
            offset = end;
            from = stage.target;
        }
        from
    }
}

/// Named scenario: a script and the load shape it runs under.
///
/// Scenarios of a run execute one after the other, in declaration order.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub(crate) label: Cow<'static, str>,
    pub(crate) script: Arc<Script>,
    pub(crate) executor: Executor,
}

impl Scenario {
    pub fn new(label: impl Into<Cow<'static, str>>, script: Script, executor: Executor) -> Self {
        Self {
            label: label.into(),
            script: Arc::new(script),
            executor,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn script(&self) -> &Script {
        &self.script
    }
}
