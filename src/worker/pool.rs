//! Worker pool: `concurrency` independent poll loops plus a sweeper, until shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::{Sweeper, Worker};
use crate::error::{Error, Result};

/// Runs worker loops against a shared [`Worker`].
///
/// Loops only check for shutdown between deliveries, so an attempt that has
/// started runs to completion, failure, or its timeout.
#[derive(Clone)]
pub struct WorkerPool {
    worker: Arc<Worker>,
    concurrency: usize,
    sweep: bool,
    shutdown: Arc<watch::Sender<bool>>,
}

impl WorkerPool {
    pub fn new(worker: Arc<Worker>, concurrency: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            worker,
            concurrency: concurrency.max(1),
            sweep: true,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Skip the sweeper (another process runs it).
    pub fn without_sweeper(mut self) -> Self {
        self.sweep = false;
        self
    }

    /// Signal all loops to stop after their current delivery.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run until [`WorkerPool::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        let mut loops = JoinSet::new();
        for n in 0..self.concurrency {
            let worker = Arc::clone(&self.worker);
            let shutdown = self.shutdown.subscribe();
            loops.spawn(worker_loop(n, worker, shutdown));
        }
        if self.sweep {
            let sweeper = Sweeper::new(Arc::clone(&self.worker));
            let shutdown = self.shutdown.subscribe();
            loops.spawn(async move { sweeper.run(shutdown).await });
        }

        info!(concurrency = self.concurrency, sweeper = self.sweep, "worker pool started");

        while let Some(joined) = loops.join_next().await {
            joined.map_err(|e| Error::Other(format!("worker loop panicked: {e}")))?;
        }
        info!("worker pool stopped");
        Ok(())
    }
}

async fn worker_loop(n: usize, worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = worker.config().poll_interval;
    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match worker.poll_once().await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(worker = n, "delivery failed: {e}");
                true
            }
        };

        if idle {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
    info!(worker = n, "worker loop shutting down");
}
