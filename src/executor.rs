use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::watch, task::JoinSet, time::Instant};
use tracing::{event, Instrument, Level};

use crate::{
    error::Error,
    logical::{self, RampProfile},
    metrics::Recorder,
    user::{User, UserBuilder},
    UserResult, CRATE_NAME, SPAN_TASK,
};

/// Drives the users of one scenario according to its [`logical::Executor`].
///
/// Every user runs on its own task and is never called concurrently with
/// itself. Once `stop` flips to `true` no new iteration starts; iterations
/// already in flight are awaited, never cancelled. A user returning a
/// termination error is not called again.
pub(crate) enum Scheduler<Ub: UserBuilder> {
    Fixed(Fixed<Ub::Output>),
    Ramping(Ramping<Ub>),
}

impl<Ub: UserBuilder> Scheduler<Ub> {
    pub fn new(
        user_builder: Arc<Ub>,
        executor: &logical::Executor,
        tick: Duration,
    ) -> Result<Self, Error> {
        if let logical::Executor::Fixed { users, iterations } = executor {
            let workers = (*users).min(*iterations);
            let users = (1..=workers)
                .map(|vu| user_builder.build(vu))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self::Fixed(Fixed::new(users, *iterations)));
        }
        let profile = executor
            .profile()
            .ok_or_else(|| Error::config("executor has no load profile"))?;
        Ok(Self::Ramping(Ramping::new(user_builder, profile, tick)))
    }

    pub async fn execute(self, recorder: Recorder, stop: watch::Receiver<bool>) {
        match self {
            Scheduler::Fixed(exec) => exec.execute(recorder, stop).await,
            Scheduler::Ramping(exec) => exec.execute(recorder, stop).await,
        }
    }
}

/// Fixed users drawing from one shared pool of iterations. A user claims
/// the next iteration as soon as its previous one ends, so fast users pick
/// up the work slow ones cannot get to.
pub(crate) struct Fixed<U> {
    users: Vec<U>,
    iterations: usize,
}

impl<U: User> Fixed<U> {
    fn new(users: Vec<U>, iterations: usize) -> Self {
        Self { users, iterations }
    }

    async fn execute(self, recorder: Recorder, stop: watch::Receiver<bool>) {
        let users_len = self.users.len();
        let iterations = self.iterations;
        let claimed = Arc::new(AtomicUsize::new(0));

        let mut tasks = JoinSet::new();
        for (index, mut user) in self.users.into_iter().enumerate() {
            let recorder = recorder.clone();
            let stop = stop.clone();
            let claimed = claimed.clone();
            let vu = index + 1;
            tasks.spawn(
                async move {
                    loop {
                        if *stop.borrow() {
                            break;
                        }
                        if claimed.fetch_add(1, Ordering::Relaxed) >= iterations {
                            break;
                        }
                        if let Err(err) = user_call(&mut user, vu, &recorder).await {
                            if err.is_termination_err() {
                                break;
                            }
                        }
                    }
                }
                .in_current_span(),
            );
        }
        event!(target: CRATE_NAME, Level::INFO, users = users_len);
        recorder.users(users_len);

        join_all(&mut tasks).await;
        recorder.users(0);
    }
}

/// Users spawned and retired at every tick to follow a [`RampProfile`].
pub(crate) struct Ramping<Ub> {
    user_builder: Arc<Ub>,
    profile: RampProfile,
    tick: Duration,
}

/// A running ramp user and the flag asking it to stop after its current iteration.
struct Worker {
    retire: Arc<AtomicBool>,
}

impl<Ub: UserBuilder> Ramping<Ub> {
    fn new(user_builder: Arc<Ub>, profile: RampProfile, tick: Duration) -> Self {
        Self {
            user_builder,
            profile,
            tick,
        }
    }

    async fn execute(self, recorder: Recorder, mut stop: watch::Receiver<bool>) {
        let total_duration = self.profile.total_duration();
        event!(target: CRATE_NAME, Level::INFO, stages = self.profile.stages.len() as u64, total_duration = total_duration.as_secs());

        let mut tasks = JoinSet::new();
        let mut active: Vec<Worker> = Vec::new();
        let mut next_vu = 1;
        let mut current_stage = None;
        let mut stop_closed = false;

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            let stage = self.profile.stage_at(elapsed);
            if stage != current_stage {
                if let Some(index) = stage {
                    let start_time = chrono::Utc::now().timestamp_millis();
                    event!(target: CRATE_NAME, Level::INFO, stage = index + 1, stage_start_time = start_time);
                }
                current_stage = stage;
            }

            let desired = self.profile.desired_users(elapsed);
            let before = active.len();
            while active.len() < desired {
                let vu = next_vu;
                next_vu += 1;
                match self.user_builder.build(vu) {
                    Ok(user) => active.push(spawn_worker(
                        &mut tasks,
                        user,
                        vu,
                        recorder.clone(),
                        stop.clone(),
                    )),
                    Err(err) => {
                        event!(name: "error", target: CRATE_NAME, Level::ERROR, vu, err = %err, "failed to build user");
                        break;
                    }
                }
            }
            while active.len() > desired {
                if let Some(worker) = active.pop() {
                    worker.retire.store(true, Ordering::Release);
                }
            }
            if active.len() != before {
                event!(target: CRATE_NAME, Level::INFO, users = active.len());
                recorder.users(active.len());
            }

            while let Some(res) = tasks.try_join_next() {
                report_join(res);
            }

            if elapsed >= total_duration || *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed(), if !stop_closed => {
                    if changed.is_err() {
                        stop_closed = true;
                    }
                }
            }
        }

        for worker in active.drain(..) {
            worker.retire.store(true, Ordering::Release);
        }
        event!(target: CRATE_NAME, Level::INFO, users = 0u64);
        recorder.users(0);
        join_all(&mut tasks).await;
    }
}

fn spawn_worker<U: User>(
    tasks: &mut JoinSet<()>,
    mut user: U,
    vu: usize,
    recorder: Recorder,
    stop: watch::Receiver<bool>,
) -> Worker {
    let retire = Arc::new(AtomicBool::new(false));
    let flag = retire.clone();
    tasks.spawn(
        async move {
            while !flag.load(Ordering::Acquire) && !*stop.borrow() {
                if let Err(err) = user_call(&mut user, vu, &recorder).await {
                    if err.is_termination_err() {
                        break;
                    }
                }
            }
        }
        .in_current_span(),
    );
    Worker { retire }
}

async fn user_call<U: User>(user: &mut U, vu: usize, recorder: &Recorder) -> UserResult {
    let res = user
        .call()
        .instrument(tracing::span!(target: CRATE_NAME, Level::INFO, SPAN_TASK, vu))
        .await;
    recorder.iteration(res.is_ok());
    match &res {
        // Already reported with step and response by the user itself
        Err(err) if err.is_iteration_err() => {
            event!(name: "error", target: CRATE_NAME, Level::DEBUG, vu, err = %err)
        }
        Err(err) => event!(name: "error", target: CRATE_NAME, Level::WARN, vu, err = %err),
        Ok(()) => {}
    }
    res
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(res) = tasks.join_next().await {
        report_join(res);
    }
}

fn report_join(res: Result<(), tokio::task::JoinError>) {
    if let Err(err) = res {
        event!(name: "error", target: CRATE_NAME, Level::ERROR, err = %err, "user task failed");
    }
}
