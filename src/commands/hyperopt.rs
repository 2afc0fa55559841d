use crate::config::BacktestConfig;
use crate::optimizer::{Hyperopt, HyperoptSummary};
use anyhow::{anyhow, Result};
use log::{info, warn};
use std::sync::atomic::Ordering;

/// Runs the optimizer on a blocking thread. Ctrl-C stops it after the
/// generation in flight.
pub async fn run(config: BacktestConfig) -> Result<HyperoptSummary> {
    let mut hyperopt = Hyperopt::for_config(config)?;
    let cancel = hyperopt.cancel_flag();
    info!(
        "Hyperopt results will be written to {}",
        hyperopt.results_file().display()
    );

    let task = tokio::task::spawn_blocking(move || hyperopt.start());
    tokio::pin!(task);
    tokio::select! {
        joined = &mut task => {
            return joined.map_err(|err| anyhow!("Hyperopt task failed: {}", err))?;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!("Unable to listen for interrupts: {}", err);
            }
            cancel.store(true, Ordering::SeqCst);
        }
    }
    task.await
        .map_err(|err| anyhow!("Hyperopt task failed: {}", err))?
}
