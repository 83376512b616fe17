pub mod check;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod logical;
pub mod metrics;
pub mod report;
pub mod runner;
pub mod scenario;
pub mod session;
pub mod template;
pub mod user;

pub use crate::logical::{Executor, Scenario, Stage};
pub use config::Config;
pub use report::{RunReport, ScenarioReport};
pub use runner::{RunController, Runner};
pub use user::{User, UserBuilder};

pub type UserResult = Result<(), error::Error>;

pub use tokio::sync::mpsc::unbounded_channel as channel;
pub use tokio::sync::mpsc::UnboundedReceiver as Receiver;
pub use tokio::sync::mpsc::UnboundedSender as Sender;

/// Target used for every event this crate emits.
pub const CRATE_NAME: &str = "surge";
/// Target for events emitted from inside a user's requests.
pub const USER_TASK: &str = "surge::user";

pub(crate) const SPAN_SCENARIO: &str = "scenario";
pub(crate) const SPAN_EXEC: &str = "exec";
pub(crate) const SPAN_TASK: &str = "task";
