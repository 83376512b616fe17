use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use futures::FutureExt;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{event, Instrument, Level};
use ulid::Ulid;

use crate::{
    client::{Client, Transport},
    config::Config,
    error::Error,
    executor::Scheduler,
    logical::Scenario,
    metrics::{Aggregator, Recorder},
    report::{RunReport, ScenarioReport, Thresholds},
    scenario::VirtualUserBuilder,
    CRATE_NAME, SPAN_EXEC, SPAN_SCENARIO,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCommand {
    Stop,
}

/// Handle to stop a run from outside, e.g. on Ctrl-C.
#[derive(Debug, Clone)]
pub struct RunController {
    commands: mpsc::Sender<RunCommand>,
}

impl RunController {
    /// Ask the run to stop: no iteration starts afterwards, in-flight ones
    /// finish. Remaining scenarios are skipped.
    pub async fn stop(&self) {
        let _ = self.commands.send(RunCommand::Stop).await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    /// Global deadline covering every scenario.
    pub timeout: Option<Duration>,
    pub tick: Duration,
}

/// Top level driver executing scenarios one after the other.
pub struct Runner {
    scenarios: Vec<(Scenario, Thresholds)>,
    settings: RunSettings,
    transport: Arc<dyn Transport>,
    commands: mpsc::Sender<RunCommand>,
    control: mpsc::Receiver<RunCommand>,
}

impl Runner {
    /// Validate `config` and build a reqwest backed runner for it.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let scenarios = config.scenarios()?;
        let transport = Client::new(config.request_timeout)?;
        Ok(Self::from_scenarios(
            scenarios,
            Arc::new(transport),
            RunSettings {
                timeout: config.timeout,
                tick: config.tick,
            },
        ))
    }

    pub fn from_scenarios(
        scenarios: Vec<(Scenario, Thresholds)>,
        transport: Arc<dyn Transport>,
        settings: RunSettings,
    ) -> Self {
        let (commands, control) = mpsc::channel(16);
        Self {
            scenarios,
            settings,
            transport,
            commands,
            control,
        }
    }

    pub fn controller(&self) -> RunController {
        RunController {
            commands: self.commands.clone(),
        }
    }

    pub async fn run(self) -> Result<RunReport, Error> {
        let Runner {
            scenarios,
            settings,
            transport,
            commands,
            mut control,
        } = self;
        // Only controllers handed out keep the command channel open
        drop(commands);

        let run_id = Ulid::new();
        let started_at = Utc::now();
        let started = Instant::now();
        let deadline = settings.timeout.map(|timeout| started + timeout);
        let (stop_tx, stop_rx) = watch::channel(false);
        event!(target: CRATE_NAME, Level::INFO, run_id = %run_id, scenarios = scenarios.len() as u64);

        let mut run = ControlledRun {
            control: &mut control,
            control_closed: false,
            stop_tx,
            deadline,
        };

        let mut reports = Vec::with_capacity(scenarios.len());
        for (id, (scenario, thresholds)) in scenarios.iter().enumerate() {
            if run.stopped() {
                event!(target: CRATE_NAME, Level::INFO, scenario = scenario.label(), "skipped, run stopped");
                continue;
            }
            let span = tracing::span!(target: CRATE_NAME, Level::INFO, SPAN_SCENARIO, name = scenario.label(), id = id as u64);
            let mut report = run
                .run_scenario(scenario, transport.clone(), settings.tick, stop_rx.clone())
                .instrument(span)
                .await?;
            report.evaluate(thresholds);
            for violation in &report.violations {
                event!(name: "threshold", target: CRATE_NAME, Level::WARN, scenario = scenario.label(), violation = %violation);
            }
            reports.push(report);
        }

        let stopped = run.stopped();
        if !scenarios.is_empty() {
            event!(name: "runner_exit", target: CRATE_NAME, Level::INFO, stopped, "Exit test");
        }
        Ok(RunReport {
            run_id,
            started_at,
            duration: started.elapsed(),
            stopped,
            scenarios: reports,
        })
    }
}

struct ControlledRun<'a> {
    control: &'a mut mpsc::Receiver<RunCommand>,
    control_closed: bool,
    stop_tx: watch::Sender<bool>,
    deadline: Option<Instant>,
}

impl ControlledRun<'_> {
    fn stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    async fn run_scenario(
        &mut self,
        scenario: &Scenario,
        transport: Arc<dyn Transport>,
        tick: Duration,
        stop: watch::Receiver<bool>,
    ) -> Result<ScenarioReport, Error> {
        let (recorder, rx) = Recorder::channel();
        let collector = tokio::spawn(Aggregator::collect(rx));

        let user_builder = Arc::new(VirtualUserBuilder::new(
            scenario.script.clone(),
            transport,
            recorder.clone(),
        ));
        let scheduler = Scheduler::new(user_builder, &scenario.executor, tick)?;

        let started_at = Utc::now();
        let started = Instant::now();
        let executor_name = scenario.executor.to_string();
        let span = tracing::span!(target: CRATE_NAME, Level::INFO, SPAN_EXEC, name = %executor_name, id = 0u64);
        let mut execution = scheduler.execute(recorder, stop).instrument(span).boxed();

        loop {
            tokio::select! {
                _ = &mut execution => break,
                _ = until(self.deadline), if !self.stopped() => {
                    event!(name: "deadline", target: CRATE_NAME, Level::INFO, "global timeout reached, draining users");
                    self.stop();
                }
                command = self.control.recv(), if !self.control_closed && !self.stopped() => match command {
                    Some(RunCommand::Stop) => {
                        event!(name: "stop", target: CRATE_NAME, Level::INFO, "stop requested, draining users");
                        self.stop();
                    }
                    None => self.control_closed = true,
                },
            }
        }
        // Releases the last recorders so the collector can finish
        drop(execution);
        let duration = started.elapsed();

        let aggregator = collector
            .await
            .map_err(|err| Error::Generic(anyhow::Error::from(err).context("aggregator task failed")))?;
        Ok(ScenarioReport::new(
            scenario.label(),
            scenario.executor.clone(),
            started_at,
            duration,
            aggregator,
        ))
    }
}

fn until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
