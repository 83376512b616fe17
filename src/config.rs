//! JSON run file.
//!
//! A run file is parsed with serde and then validated into typed
//! [`Scenario`]s. Every problem found here is a [`Error::Configuration`]
//! and is reported before a single user is launched.

use std::{collections::BTreeMap, path::Path, str::FromStr, time::Duration};

use http::{HeaderName, Method};
use serde::Deserialize;
use serde_json::{Map, Value};
use url::Url;

use crate::{
    check::{Check, Predicate},
    error::Error,
    logical::{Executor, Scenario},
    report::Thresholds,
    scenario::{Script, Step},
    session::JsonPath,
    template::{BodyTemplate, Template},
};

/// Environment variable overriding `base_url`.
pub const BASE_URL_ENV: &str = "SURGE_BASE_URL";

const DEFAULT_TICK: Duration = Duration::from_millis(200);
const MAX_TICK: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub base_url: String,
    /// Global deadline for the whole run.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How often ramping executors converge toward their desired user count.
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,
    #[serde(default)]
    pub session_header: Option<SessionHeaderConfig>,
    /// Thresholds for every scenario without its own.
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub report_path: Option<String>,
    pub scenarios: Vec<ScenarioConfig>,
}

fn default_tick() -> Duration {
    DEFAULT_TICK
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionHeaderConfig {
    pub name: String,
    pub variable: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    pub name: String,
    pub executor: Executor,
    /// Initial per-user variables. Values may use the builtins.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
    pub steps: Vec<StepConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepConfig {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Variable name to JSON path in the response body.
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
    #[serde(default, with = "humantime_serde")]
    pub delay: Option<Duration>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// `{"label": "Order Success (201)", "status": 201, "critical": true}`
///
/// Besides `label` and `critical` a check carries exactly one predicate key.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct CheckConfig {
    pub label: String,
    pub critical: bool,
    pub predicate: PredicateConfig,
}

impl TryFrom<Map<String, Value>> for CheckConfig {
    type Error = String;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let label = match fields.remove("label") {
            Some(Value::String(label)) => label,
            Some(other) => return Err(format!("check label must be a string, got {other}")),
            None => return Err("check without `label`".to_string()),
        };
        let critical = match fields.remove("critical") {
            None => false,
            Some(Value::Bool(critical)) => critical,
            Some(other) => {
                return Err(format!(
                    "check `{label}`: `critical` must be a boolean, got {other}"
                ))
            }
        };
        if fields.len() != 1 {
            let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
            return Err(format!(
                "check `{label}` needs exactly one predicate, got [{}]",
                keys.join(", ")
            ));
        }
        let predicate = serde_json::from_value(Value::Object(fields))
            .map_err(|err| format!("check `{label}`: {err}"))?;
        Ok(Self {
            label,
            critical,
            predicate,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateConfig {
    Status(u16),
    StatusIn(Vec<u16>),
    StatusRange([u16; 2]),
    BodyContains(String),
    JsonField {
        path: String,
        #[serde(default)]
        equals: Option<Value>,
    },
    MaxLatency(#[serde(with = "humantime_serde")] Duration),
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(|err| Error::config(format!("invalid run file: {err}")))
    }
}

impl Config {
    /// Read a run file and apply the environment overrides.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::config(format!("cannot read {}: {err}", path.display())))?;
        let mut config: Config = content.parse()?;
        if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
            config.base_url = base_url;
        }
        Ok(config)
    }

    /// Validate the whole file into runnable scenarios, in declared order.
    pub fn scenarios(&self) -> Result<Vec<(Scenario, Thresholds)>, Error> {
        if self.scenarios.is_empty() {
            return Err(Error::config("run file declares no scenario"));
        }
        if self.tick.is_zero() || self.tick > MAX_TICK {
            return Err(Error::config(format!(
                "tick must be within (0s, 1s], got {:?}",
                self.tick
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be positive"));
        }
        let base_url = Url::parse(&self.base_url)
            .map_err(|err| Error::config(format!("invalid base_url `{}`: {err}", self.base_url)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::config(format!(
                "base_url `{}` is not an http(s) url",
                self.base_url
            )));
        }

        let mut scenarios = Vec::with_capacity(self.scenarios.len());
        for (index, scenario) in self.scenarios.iter().enumerate() {
            if self.scenarios[..index]
                .iter()
                .any(|other| other.name == scenario.name)
            {
                return Err(Error::config(format!(
                    "duplicate scenario name `{}`",
                    scenario.name
                )));
            }
            let built = self.scenario(&base_url, scenario).map_err(|err| match err {
                Error::Configuration(msg) => {
                    Error::config(format!("scenario `{}`: {msg}", scenario.name))
                }
                err => err,
            })?;
            let thresholds = scenario
                .thresholds
                .clone()
                .unwrap_or_else(|| self.thresholds.clone());
            scenarios.push((built, thresholds));
        }
        if let Some(session_header) = &self.session_header {
            if !scenarios
                .iter()
                .any(|(scenario, _)| scenario.script().sets(&session_header.variable))
            {
                return Err(Error::config(format!(
                    "session header variable `{}` is neither a scenario variable nor extracted by any step",
                    session_header.variable
                )));
            }
        }
        Ok(scenarios)
    }

    fn scenario(&self, base_url: &Url, config: &ScenarioConfig) -> Result<Scenario, Error> {
        validate_executor(&config.executor)?;

        let mut script = Script::new(base_url.clone());
        if let Some(session_header) = &self.session_header {
            let name = HeaderName::from_str(&session_header.name).map_err(|err| {
                Error::config(format!(
                    "invalid session header `{}`: {err}",
                    session_header.name
                ))
            })?;
            script = script.session_header(name, session_header.variable.clone());
        }
        for (name, value) in &config.variables {
            script = script.variable(name.clone(), Template::parse(value)?);
        }
        for step in &config.steps {
            script = script.step(build_step(step)?);
        }
        script.validate()?;

        Ok(Scenario::new(
            config.name.clone(),
            script,
            config.executor.clone(),
        ))
    }
}

fn validate_executor(executor: &Executor) -> Result<(), Error> {
    match executor {
        Executor::Fixed { users, iterations } => {
            if *users == 0 || *iterations == 0 {
                return Err(Error::config(
                    "fixed executor needs at least one user and one iteration",
                ));
            }
        }
        Executor::Constant { users, duration } => {
            if *users == 0 || duration.is_zero() {
                return Err(Error::config(
                    "constant executor needs at least one user and a positive duration",
                ));
            }
        }
        Executor::Ramping { stages, .. } => {
            if stages.is_empty() {
                return Err(Error::config("ramping executor has no stage"));
            }
            if stages.iter().all(|stage| stage.duration.is_zero()) {
                return Err(Error::config("ramping executor has zero total duration"));
            }
        }
    }
    Ok(())
}

fn build_step(config: &StepConfig) -> Result<Step, Error> {
    let method = Method::from_str(&config.method.to_ascii_uppercase())
        .map_err(|err| Error::config(format!("invalid method `{}`: {err}", config.method)))?;
    let mut step = Step::new(config.name.as_str(), method, Template::parse(&config.path)?);

    for (name, value) in &config.headers {
        let name = HeaderName::from_str(name)
            .map_err(|err| Error::config(format!("invalid header `{name}`: {err}")))?;
        step = step.header(name, Template::parse(value)?);
    }
    if let Some(body) = &config.body {
        step = step.body(BodyTemplate::parse(body)?);
    }
    for (variable, path) in &config.extract {
        step = step.extract(variable.as_str(), JsonPath::parse(path)?);
    }
    for check in &config.checks {
        let mut built = Check::new(check.label.as_str(), predicate(&check.predicate)?);
        if check.critical {
            built = built.critical();
        }
        step = step.check(built);
    }
    if let Some(delay) = config.delay {
        step = step.delay(delay);
    }
    Ok(step)
}

fn predicate(config: &PredicateConfig) -> Result<Predicate, Error> {
    Ok(match config {
        PredicateConfig::Status(status) => Predicate::Status(*status),
        PredicateConfig::StatusIn(statuses) => {
            if statuses.is_empty() {
                return Err(Error::config("status_in needs at least one status"));
            }
            Predicate::StatusIn(statuses.clone())
        }
        PredicateConfig::StatusRange([low, high]) => {
            if low > high {
                return Err(Error::config(format!("empty status range {low}..={high}")));
            }
            Predicate::StatusRange(*low..=*high)
        }
        PredicateConfig::BodyContains(needle) => Predicate::BodyContains(needle.clone()),
        PredicateConfig::JsonField { path, equals } => Predicate::JsonField {
            path: JsonPath::parse(path)?,
            equals: equals.clone(),
        },
        PredicateConfig::MaxLatency(max) => Predicate::MaxLatency(*max),
    })
}
