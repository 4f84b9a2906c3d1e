//! Daemon lifecycle management for hbm-miner.
//!
//! Reads settings, brings up one worker per configured board, forwards
//! solutions to the log, and handles signals and shutdown.

use std::sync::Arc;

use anyhow::bail;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{info_span, Instrument};

use crate::tracing::prelude::*;
use crate::{
    config::{DeviceSettings, Endpoint, DEFAULT_PORT},
    dummy::{DummyConfig, DummySource},
    error::{Error, Result},
    fpga::FpgaDevice,
    transport::{sim::SimConnector, Connector},
    tuner::FixedTuning,
    types::Solution,
    worker::{SolutionSink, WorkSource, Worker},
};

/// The main daemon.
pub struct Daemon {
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run the daemon until shutdown is requested or a board escalates.
    ///
    /// Returns an error if a board hit a fault under the die-on-error
    /// policy or if every board stopped on its own.
    pub async fn run(self) -> anyhow::Result<()> {
        let settings = Arc::new(load_settings()?);

        // Work source
        let dummy = Arc::new(DummySource::new(DummyConfig::from_env()));
        self.tracker.spawn({
            let dummy = Arc::clone(&dummy);
            let shutdown = self.shutdown.clone();
            async move { dummy.run(shutdown).await }
        });

        // Solutions are only logged; nothing downstream submits them.
        let (solution_tx, mut solution_rx) = mpsc::channel::<Solution>(100);
        self.tracker.spawn(async move {
            while let Some(solution) = solution_rx.recv().await {
                info!(
                    device = %DeviceSettings::device_name(solution.device_index),
                    nonce = format_args!("{:#018x}", solution.nonce),
                    header = %solution.work.header,
                    "Solution found."
                );
            }
        });

        // No hardware transport is linked; boards are simulated.
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<String>(8);
        let workers = self
            .spawn_workers(
                &SimConnector::default(),
                &settings,
                dummy,
                solution_tx,
                fatal_tx,
            )
            .await;
        if workers.is_empty() {
            self.shutdown.cancel();
            self.tracker.close();
            self.tracker.wait().await;
            bail!("no board could be initialized");
        }

        self.tracker.close();

        info!(boards = workers.len(), "Started.");
        info!("For debugging, set RUST_LOG=hbm_miner=debug or trace.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        let all_stopped = futures::future::join_all(workers);
        tokio::pin!(all_stopped);

        let mut failure = None;
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT.");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM.");
            },
            Some(reason) = fatal_rx.recv() => {
                error!(%reason, "Board escalated, shutting down.");
                failure = Some(reason);
            },
            _ = &mut all_stopped => {
                failure = Some("every board stopped".to_string());
            },
        }

        // Initiate shutdown
        self.shutdown.cancel();

        // Wait for all tasks to complete
        self.tracker.wait().await;
        info!("Exiting.");

        match failure {
            Some(reason) => bail!(reason),
            None => Ok(()),
        }
    }

    /// Initialize every configured board and start its worker.
    ///
    /// A board that cannot be reached is logged and skipped; the others
    /// still run. Returns the handles of the workers that started.
    async fn spawn_workers<C, K>(
        &self,
        connector: &C,
        settings: &Arc<DeviceSettings>,
        source: Arc<dyn WorkSource>,
        sink: K,
        fatal: mpsc::Sender<String>,
    ) -> Vec<JoinHandle<()>>
    where
        C: Connector,
        K: SolutionSink + Clone + 'static,
    {
        let mut workers = Vec::new();
        for (index, endpoint) in settings.hosts.iter().enumerate() {
            let name = DeviceSettings::device_name(index);
            let span = info_span!("device", device = %name);

            let device = match FpgaDevice::init(
                connector,
                endpoint,
                index,
                Arc::clone(settings),
                Arc::new(FixedTuning),
                self.shutdown.clone(),
            )
            .instrument(span.clone())
            .await
            {
                Ok(device) => device,
                Err(e) => {
                    error!(device = %name, %endpoint, error = %e, "Board init failed.");
                    continue;
                }
            };

            let worker = Worker::new(device, Arc::clone(&source), sink.clone());
            let fatal = fatal.clone();
            workers.push(
                self.tracker.spawn(
                    async move {
                        match worker.run().await {
                            Ok(()) | Err(Error::Cancelled) => {}
                            Err(e @ Error::Escalated { .. }) => {
                                error!(error = %e, "worker died");
                                let _ = fatal.send(e.to_string()).await;
                            }
                            Err(e) if e.is_terminal() => error!(error = %e, "worker stopped"),
                            Err(e) => warn!(error = %e, "worker stopped"),
                        }
                    }
                    .instrument(span),
                ),
            );
        }
        workers
    }
}

/// Board settings from the environment, or one local board when no hosts
/// are configured.
fn load_settings() -> Result<DeviceSettings> {
    match DeviceSettings::from_env()? {
        Some(settings) => Ok(settings),
        None => {
            info!("HBM_HOSTS not set, driving one simulated board");
            Ok(DeviceSettings {
                hosts: vec![Endpoint {
                    host: "127.0.0.1".into(),
                    port: DEFAULT_PORT,
                }],
                ..Default::default()
            })
        }
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}
