use std::process::ExitCode;

use docpipe_core::config::Config;
use tokio_util::sync::CancellationToken;
use tracing::error;
use worker::{logging::init_worker_logging, Worker};

#[tokio::main]
async fn main() -> ExitCode {
  let config = Config::load();

  // Guard must outlive the runtime or buffered log lines are dropped
  let _log_guard = init_worker_logging(&config.worker);

  let worker = match Worker::new(config) {
    Ok(worker) => worker,
    Err(e) => {
      error!(error = %e, "Worker startup failed");
      return ExitCode::from(1);
    }
  };

  match worker.start(CancellationToken::new()).await {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!(error = %e, "Worker exited with error");
      ExitCode::from(1)
    }
  }
}
