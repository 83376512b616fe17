use std::borrow::Cow;

use anyhow::anyhow;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connection, TLS or timeout failure. Never retried.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
    /// A critical check failed and the rest of the iteration was skipped.
    #[error("critical check `{label}` failed with status {status}")]
    Assertion { label: String, status: u16 },
    #[error("extraction of `{variable}` failed: {reason}")]
    Extraction { variable: String, reason: String },
    /// Invalid run file or scenario. Fatal before any user is launched.
    #[error("configuration error: {0}")]
    Configuration(Cow<'static, str>),
    #[error(transparent)]
    Termination(anyhow::Error),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

impl Error {
    pub fn is_termination_err(&self) -> bool {
        matches!(self, Error::Termination(_))
    }

    /// Errors that end the current iteration but leave the user alive.
    pub fn is_iteration_err(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Assertion { .. })
    }
}

impl Error {
    pub fn new(err: impl Into<Cow<'static, str>>) -> Self {
        Self::Generic(anyhow!(err.into()))
    }

    pub fn termination(err: impl Into<Cow<'static, str>>) -> Self {
        Self::Termination(anyhow!(err.into()))
    }

    pub fn config(err: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration(err.into())
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.into())
    }
}
