use std::env;
use std::io;
use std::path::Path;
use std::process::ExitCode;

use ride_ledger::Config;
use ride_ledger::csv::{read_scenario, write_wallets};
use ride_ledger::replay::Replay;
use tokio_stream::wrappers::ReceiverStream;
use tracing::level_filters::LevelFilter;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let path = env::args()
        .nth(1)
        .expect("usage: ride-ledger <scenario.csv>");

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let steps = match read_scenario(Path::new(&path)) {
        Ok(steps) => steps,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let replay = match Replay::new(config).await {
        Ok(replay) => replay,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (step_sender, step_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in steps {
            match result {
                Ok(step) => {
                    if step_sender.send(step).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    replay.run(ReceiverStream::new(step_receiver)).await;

    let written = match replay.wallets().await {
        Ok(wallets) => write_wallets(io::stdout().lock(), wallets).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    if let Err(e) = written {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
