//! Per-board work loop.
//!
//! One [`Worker`] runs per board as its own task. It follows the latest
//! published work, rebuilds the DAG when the epoch changes, and otherwise
//! keeps the board searching. New work reaches a running search through a
//! kick on the device handle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::fpga::FpgaDevice;
use crate::tracing::prelude::*;
use crate::transport::RegisterTransport;
use crate::types::{EpochContext, Solution, WorkPackage};

/// How long the worker sleeps when it has nothing to do.
pub const IDLE_PARK: Duration = Duration::from_secs(3);

/// Latest work as published by a [`WorkSource`].
pub type WorkFeed = watch::Receiver<Option<Arc<WorkPackage>>>;

#[async_trait]
pub trait WorkSource: Send + Sync {
    fn subscribe(&self) -> WorkFeed;

    /// DAG parameters for `epoch`, or `None` if they cannot be produced.
    async fn epoch_context(&self, epoch: u32) -> Option<EpochContext>;
}

#[async_trait]
pub trait SolutionSink: Send + Sync {
    async fn submit(&self, solution: Solution);
}

#[async_trait]
impl SolutionSink for mpsc::Sender<Solution> {
    async fn submit(&self, solution: Solution) {
        if let Err(e) = self.send(solution).await {
            warn!(nonce = format_args!("{:#x}", e.0.nonce), "solution dropped, sink closed");
        }
    }
}

pub struct Worker<T, K> {
    device: FpgaDevice<T>,
    source: Arc<dyn WorkSource>,
    sink: K,
}

impl<T, K> Worker<T, K>
where
    T: RegisterTransport,
    K: SolutionSink,
{
    pub fn new(device: FpgaDevice<T>, source: Arc<dyn WorkSource>, sink: K) -> Self {
        Self {
            device,
            source,
            sink,
        }
    }

    /// Run until shutdown or a fatal error. The board is disconnected
    /// either way.
    pub async fn run(self) -> Result<()> {
        let mut feed = self.source.subscribe();

        // Turn published work into kicks so a running search lets go.
        let kicker = {
            let handle = self.device.handle();
            let mut changes = feed.clone();
            tokio::spawn(async move {
                while changes.changed().await.is_ok() {
                    handle.kick().await;
                }
            })
        };

        let result = self.work_loop(&mut feed).await;
        kicker.abort();
        self.device.disconnect().await;
        result
    }

    async fn work_loop(&self, feed: &mut WorkFeed) -> Result<()> {
        let device = &self.device;
        let mut epoch: Option<u32> = None;

        while !device.shutdown_requested() {
            // A kick landing after this point ends the next search.
            device.clear_new_work();
            let latest = feed.borrow_and_update().clone();
            let Some(work) = latest else {
                device.park(IDLE_PARK).await;
                continue;
            };

            if !work.is_ethash() {
                error!(algorithm = %work.algorithm, "algorithm not supported");
                return Err(Error::UnsupportedWork {
                    algorithm: work.algorithm.clone(),
                });
            }

            if device.is_halted() {
                device.park(IDLE_PARK).await;
                continue;
            }

            if epoch != Some(work.epoch) {
                let Some(ctx) = self.source.epoch_context(work.epoch).await else {
                    warn!(epoch = work.epoch, "no DAG parameters for epoch");
                    device.park(IDLE_PARK).await;
                    continue;
                };
                match device.prepare_epoch(&ctx).await {
                    Ok(_) => epoch = Some(work.epoch),
                    Err(Error::Cancelled) => break,
                    Err(e) if e.is_terminal() => return Err(e),
                    Err(e) => {
                        warn!(epoch = work.epoch, error = %e, "epoch not prepared");
                        device.park(IDLE_PARK).await;
                    }
                }
                // DAG generation takes a while; pick up whatever is newest.
                continue;
            }

            if device.is_busy() {
                device.park(IDLE_PARK).await;
                continue;
            }

            device.search(work, &self.sink).await?;
        }

        let status = device.handle().status();
        info!(
            solutions = status.solutions_found,
            epoch = ?status.current_epoch,
            hashrate = %status.hashrate,
            "worker stopped"
        );
        Ok(())
    }
}
