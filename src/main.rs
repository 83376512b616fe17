use std::{path::Path, process::ExitCode};

use surge::{error::Error, Config, Runner, CRATE_NAME};
use tracing::{event, Level};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: surge <run-file.json>";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("surge=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(err) => {
            event!(target: CRATE_NAME, Level::ERROR, err = %err);
            eprintln!("{err}");
            ExitCode::from(2)
        }
    }
}

/// Whether every threshold held.
async fn run() -> Result<bool, Error> {
    let Some(path) = std::env::args().nth(1) else {
        return Err(Error::config(USAGE));
    };
    let config = Config::from_path(&path)?;
    let runner = Runner::new(&config)?;

    let controller = runner.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            event!(target: CRATE_NAME, Level::INFO, "ctrl-c received");
            controller.stop().await;
        }
    });

    let report = runner.run().await?;
    println!("{report}");
    if let Some(report_path) = &config.report_path {
        report.write_json(Path::new(report_path))?;
        event!(target: CRATE_NAME, Level::INFO, path = %report_path, "report written");
    }
    Ok(report.passed())
}
