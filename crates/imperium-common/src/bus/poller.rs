//! Background poll loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::MessageBus;

/// Handle on a running poll loop.
pub struct BusPoller {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BusPoller {
    pub(super) fn spawn(bus: Arc<MessageBus>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(run(bus, rx));
        Self { shutdown, task }
    }

    /// Stop the timer, then wait for in-flight handlers up to the drain
    /// timeout. Handlers still running after that are aborted.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Bus poller task failed");
        }
    }
}

async fn run(bus: Arc<MessageBus>, mut shutdown: watch::Receiver<bool>) {
    let mut tasks = JoinSet::new();
    let mut timer = tokio::time::interval(bus.config().poll_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(sender = %bus.name(), interval_ms = bus.config().poll_interval_ms, "Bus poller started");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                match bus.poll(&mut tasks).await {
                    Ok(0) => {}
                    Ok(received) => debug!(received, "Polled messages"),
                    Err(e) => warn!(error = %e, "Message poll failed"),
                }
                while let Some(result) = tasks.try_join_next() {
                    log_join(result);
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    drain(tasks, bus.config().drain_timeout()).await;
    info!(sender = %bus.name(), "Bus poller stopped");
}

async fn drain(mut tasks: JoinSet<()>, timeout: Duration) {
    if tasks.is_empty() {
        return;
    }
    debug!(pending = tasks.len(), "Draining message handlers");

    let drained = tokio::time::timeout(timeout, async {
        while let Some(result) = tasks.join_next().await {
            log_join(result);
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = tasks.len(), "Aborting message handlers after drain timeout");
        tasks.abort_all();
    }
}

fn log_join(result: Result<(), JoinError>) {
    match result {
        Err(e) if e.is_panic() => error!(error = %e, "Message handler panicked"),
        _ => {}
    }
}
