//! Scripted, session-aware scenario steps and the virtual user that runs them.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tracing::{event, Level};
use url::Url;

use crate::{
    check::{check, Check},
    client::{HttpRequest, Transport},
    error::Error,
    metrics::Recorder,
    session::{JsonPath, SessionContext},
    template::{BodyTemplate, Template, BUILTINS},
    user::{User, UserBuilder},
    UserResult, CRATE_NAME,
};

/// Longest body excerpt written to a diagnostic log line.
const BODY_SNIPPET: usize = 512;

/// Copy the field at `path` of a response body into `variable`.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub variable: Arc<str>,
    pub path: JsonPath,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub name: Arc<str>,
    pub method: Method,
    pub path: Template,
    pub headers: Vec<(HeaderName, Template)>,
    pub body: Option<BodyTemplate>,
    pub extract: Vec<Extraction>,
    pub checks: Vec<Check>,
    /// Pause after this step, before the next one runs.
    pub delay: Option<Duration>,
}

impl Step {
    pub fn new(name: impl Into<Arc<str>>, method: Method, path: Template) -> Self {
        Self {
            name: name.into(),
            method,
            path,
            headers: Vec::new(),
            body: None,
            extract: Vec::new(),
            checks: Vec::new(),
            delay: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: Template) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn body(mut self, body: BodyTemplate) -> Self {
        self.body = Some(body);
        self
    }

    pub fn extract(mut self, variable: impl Into<Arc<str>>, path: JsonPath) -> Self {
        self.extract.push(Extraction {
            variable: variable.into(),
            path,
        });
        self
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn variables(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self.path.variables().collect();
        for (_, value) in &self.headers {
            names.extend(value.variables());
        }
        if let Some(body) = &self.body {
            names.extend(body.variables());
        }
        names
    }
}

/// Header carrying the session identifier on every request once the
/// session variable is set.
#[derive(Debug, Clone)]
pub struct SessionHeader {
    pub name: HeaderName,
    pub variable: String,
}

/// Ordered steps plus everything needed to turn them into requests.
#[derive(Debug, Clone)]
pub struct Script {
    pub base_url: Url,
    /// Per-user initial variables, rendered once when the user is built.
    pub variables: Vec<(String, Template)>,
    pub session_header: Option<SessionHeader>,
    pub steps: Vec<Step>,
}

impl Script {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            variables: Vec::new(),
            session_header: None,
            steps: Vec::new(),
        }
    }

    pub fn variable(mut self, name: impl Into<String>, value: Template) -> Self {
        self.variables.push((name.into(), value));
        self
    }

    pub fn session_header(mut self, name: HeaderName, variable: impl Into<String>) -> Self {
        self.session_header = Some(SessionHeader {
            name,
            variable: variable.into(),
        });
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Check that every template reference can be resolved: a builtin, an
    /// earlier initial variable, or a variable extracted by an earlier step.
    pub fn validate(&self) -> Result<(), Error> {
        if self.steps.is_empty() {
            return Err(Error::config("scenario has no steps"));
        }
        let mut known: BTreeSet<&str> = BUILTINS.into_iter().collect();
        for (name, value) in &self.variables {
            if let Some(missing) = value.variables().find(|var| !known.contains(var)) {
                return Err(Error::config(format!(
                    "variable `{name}` references unknown variable `{missing}`"
                )));
            }
            known.insert(name.as_str());
        }
        for step in &self.steps {
            if let Some(missing) = step.variables().into_iter().find(|var| !known.contains(var)) {
                return Err(Error::config(format!(
                    "step `{}` references `{missing}`, which is neither a builtin, a scenario variable nor extracted by an earlier step",
                    step.name
                )));
            }
            known.extend(step.extract.iter().map(|extraction| &*extraction.variable));
        }
        Ok(())
    }

    /// Whether `variable` is an initial variable or extracted by some step.
    pub fn sets(&self, variable: &str) -> bool {
        self.variables.iter().any(|(name, _)| name == variable)
            || self
                .steps
                .iter()
                .flat_map(|step| &step.extract)
                .any(|extraction| &*extraction.variable == variable)
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path).map_err(|err| Error::new(format!("invalid url `{path}`: {err}")));
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        let joined = format!("{}/{}", base, path.trim_start_matches('/'));
        Url::parse(&joined).map_err(|err| Error::new(format!("invalid url `{joined}`: {err}")))
    }

    /// Render `step` into a concrete request for the user owning `session`.
    pub fn render(&self, step: &Step, session: &SessionContext) -> Result<HttpRequest, Error> {
        let url = self.url(&step.path.render(session)?)?;

        let mut headers = HeaderMap::new();
        if let Some(session_header) = &self.session_header {
            if let Some(value) = session.get(&session_header.variable) {
                headers.insert(session_header.name.clone(), header_value(value)?);
            }
        }
        for (name, value) in &step.headers {
            headers.insert(name.clone(), header_value(&value.render(session)?)?);
        }

        let body = step
            .body
            .as_ref()
            .map(|body| body.render(session))
            .transpose()?;

        Ok(HttpRequest {
            method: step.method.clone(),
            url,
            headers,
            body,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(value)
        .map_err(|err| Error::new(format!("invalid header value `{value}`: {err}")))
}

/// Virtual user executing a [`Script`] with its own [`SessionContext`].
pub struct VirtualUser {
    script: Arc<Script>,
    transport: Arc<dyn Transport>,
    recorder: Recorder,
    session: SessionContext,
    iterations: u64,
}

impl VirtualUser {
    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    async fn run_steps(&mut self) -> UserResult {
        let script = self.script.clone();
        for step in &script.steps {
            self.run_step(&script, step).await?;
            if let Some(delay) = step.delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }

    async fn run_step(&mut self, script: &Script, step: &Step) -> UserResult {
        let vu = self.session.vu();
        let request = script.render(step, &self.session).inspect_err(|err| {
            event!(name: "render_failed", target: CRATE_NAME, Level::WARN, vu, step = %step.name, err = %err, "skipping remaining steps");
        })?;

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(err) => {
                self.recorder.request(&step.name, None, None);
                check(None, &step.checks, &self.recorder);
                event!(name: "transport_error", target: CRATE_NAME, Level::WARN, vu, step = %step.name, err = %err, "skipping remaining steps");
                return Err(err);
            }
        };

        let status = response.status.as_u16();
        self.recorder
            .request(&step.name, Some(status), Some(response.latency));
        let outcome = check(Some(&response), &step.checks, &self.recorder);

        for extraction in &step.extract {
            match self
                .session
                .extract(&extraction.variable, &extraction.path, &response.body)
            {
                Ok(()) => self.recorder.extraction(&extraction.variable, true),
                Err(err) => {
                    self.recorder.extraction(&extraction.variable, false);
                    event!(name: "extraction_failed", target: CRATE_NAME, Level::WARN, vu, step = %step.name, err = %err, "keeping previous value");
                }
            }
        }

        if let Some(index) = outcome.critical_failure {
            let label = step.checks[index].label.to_string();
            event!(
                name: "iteration_aborted",
                target: CRATE_NAME,
                Level::WARN,
                vu,
                step = %step.name,
                check = %label,
                status,
                body = %response.body_snippet(BODY_SNIPPET),
                "critical check failed, skipping remaining steps"
            );
            return Err(Error::Assertion { label, status });
        }
        Ok(())
    }
}

impl User for VirtualUser {
    async fn call(&mut self) -> UserResult {
        self.session.start_iteration(self.iterations);
        self.iterations += 1;
        self.run_steps().await
    }
}

/// Builds [`VirtualUser`]s sharing one script, transport and recorder.
pub struct VirtualUserBuilder {
    script: Arc<Script>,
    transport: Arc<dyn Transport>,
    recorder: Recorder,
}

impl VirtualUserBuilder {
    pub fn new(script: Arc<Script>, transport: Arc<dyn Transport>, recorder: Recorder) -> Self {
        Self {
            script,
            transport,
            recorder,
        }
    }
}

impl UserBuilder for VirtualUserBuilder {
    type Output = VirtualUser;

    fn build(&self, vu: usize) -> Result<Self::Output, Error> {
        let mut session = SessionContext::new(vu);
        for (name, value) in &self.script.variables {
            let value = value.render(&session)?;
            session.set(name.clone(), value);
        }
        Ok(VirtualUser {
            script: self.script.clone(),
            transport: self.transport.clone(),
            recorder: self.recorder.clone(),
            session,
            iterations: 0,
        })
    }
}
