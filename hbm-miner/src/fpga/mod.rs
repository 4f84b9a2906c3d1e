//! HBM FPGA board driver.
//!
//! One [`FpgaDevice`] per connected board. All register traffic goes
//! through a [`Bus`], which is only obtainable by taking the device's
//! access lock, so at most one operation talks to the board at a time.
//! Operations that wait on the hardware (status polls, interrupt waits)
//! hand the `Bus` back while they wait and take a fresh one afterwards:
//! anything read before the wait must be re-read after it.
//!
//! ```text
//!   init ──► prepare_epoch ──► search ◄──┐
//!                 ▲              │       │ new work / stall
//!                 └── epoch ─────┴───────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::{DeviceSettings, Endpoint};
use crate::error::{Error, Result};
use crate::hashrate::{HashrateAverager, HashrateAverages};
use crate::tracing::prelude::*;
use crate::transport::{self, Connector, InterruptWait, RegisterTransport};
use crate::tuner::AutoTuner;
use crate::types::{DeviceIdentity, HashRate, IntensitySettings};

pub mod clock;
pub mod dag;
pub mod regs;
pub mod search;
pub mod telemetry;
pub mod voltage;

use clock::{ClockRequest, ClockState};
use dag::EpochPhase;
use telemetry::TelemetrySnapshot;
use voltage::VoltageTable;

/// Interrupt line the search loop listens on.
pub const NONCE_INTERRUPT: u32 = 0x1;

/// Snapshot of a board for status queries.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatus {
    pub hashrate: HashRate,
    pub averages: HashrateAverages,
    pub solutions_found: u64,
    pub current_epoch: Option<u32>,
    pub clock_mhz: f64,
    pub telemetry: Option<TelemetrySnapshot>,
    pub is_searching: bool,
    pub epoch_phase: EpochPhase,
}

/// State only touched while holding the access lock.
#[derive(Debug)]
pub(crate) struct ControllerState {
    pub clock: ClockState,
    pub averager: HashrateAverager,
    /// Intensity programmed by the most recent search.
    pub applied: IntensitySettings,
    pub auto_tune: bool,
    pub last_epoch: Option<u32>,
}

pub(crate) struct Shared<T> {
    pub index: usize,
    pub name: String,
    pub transport: T,
    pub settings: Arc<DeviceSettings>,
    pub tuner: Arc<dyn AutoTuner>,
    pub identity: DeviceIdentity,
    pub calibration_id: String,
    pub voltage_table: VoltageTable,
    pub state: Mutex<ControllerState>,
    /// Set when fresh work is available; the search loop polls it.
    pub new_work: AtomicBool,
    /// DAG generation in progress, or the board halted itself.
    pub busy: AtomicBool,
    /// Latched by a stack-protection halt; only a restart clears it.
    pub halted: AtomicBool,
    pub wake: Notify,
    pub shutdown: CancellationToken,
    pub status: RwLock<DeviceStatus>,
}

impl<T: RegisterTransport> Shared<T> {
    pub(crate) async fn lock(&self) -> Bus<'_, T> {
        Bus {
            shared: self,
            state: self.state.lock().await,
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Tell the worker there is new work (or a reason to stop searching).
    pub(crate) async fn kick(&self) {
        self.new_work.store(true, Ordering::SeqCst);
        if !self.is_busy() {
            self.transport.kick_interrupts().await;
        }
        self.wake.notify_one();
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut DeviceStatus)) {
        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        f(&mut status);
    }

    pub(crate) fn status(&self) -> DeviceStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Exclusive access to the board's registers.
///
/// Dropping the `Bus` releases the access lock.
pub(crate) struct Bus<'a, T> {
    shared: &'a Shared<T>,
    pub state: MutexGuard<'a, ControllerState>,
}

impl<'a, T: RegisterTransport> Bus<'a, T> {
    pub fn shared(&self) -> &'a Shared<T> {
        self.shared
    }

    pub fn settings(&self) -> &'a DeviceSettings {
        &self.shared.settings
    }

    pub async fn read(&self, addr: u32) -> transport::Result<u32> {
        let value = self.shared.transport.read32(addr).await?;
        trace!(
            addr = format_args!("0x{:04x}", addr),
            value = format_args!("0x{:08x}", value),
            "read"
        );
        Ok(value)
    }

    /// Read, substituting `default` (and logging) on failure.
    pub async fn read_or(&self, addr: u32, default: u32, what: &str) -> u32 {
        match self.read(addr).await {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    error = %Error::register(addr, e),
                    "{} unreadable, assuming 0x{:x}",
                    what,
                    default
                );
                default
            }
        }
    }

    pub async fn write(&self, value: u32, addr: u32) -> transport::Result<()> {
        trace!(
            addr = format_args!("0x{:04x}", addr),
            value = format_args!("0x{:08x}", value),
            "write"
        );
        self.shared.transport.write32(value, addr, true).await
    }

    /// Write, logging failure. Returns whether the write went through.
    pub async fn write_or_log(&self, value: u32, addr: u32, what: &str) -> bool {
        match self.write(value, addr).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    error = %Error::register(addr, e),
                    "failed setting {}",
                    what
                );
                false
            }
        }
    }

    /// Bulk write with per-word byte swap.
    pub async fn write_words(&self, bytes: &[u8], addr: u32) -> transport::Result<()> {
        self.shared.transport.write_bulk(bytes, addr, true).await
    }

    pub async fn copy_from_host(&self, bytes: &[u8], addr: u64) -> transport::Result<()> {
        self.shared.transport.copy_from_host(bytes, addr).await
    }

    pub async fn copy_within(&self, src: u64, dst: u64, len: u64) -> transport::Result<()> {
        trace!(
            src = format_args!("0x{:09x}", src),
            dst = format_args!("0x{:09x}", dst),
            len,
            "device copy"
        );
        self.shared.transport.copy_device_to_device(src, dst, len).await
    }

    /// Under the die-on-error policy turn `err` into a fatal error.
    pub fn escalate(&self, what: &str, err: &dyn std::fmt::Display) -> Result<()> {
        if self.shared.settings.die_on_error {
            error!(error = %err, "{}; stopping (die-on-error)", what);
            return Err(Error::escalated(format!("{}: {}", what, err)));
        }
        Ok(())
    }

    /// Release the lock for `delay`, then take it again.
    pub async fn suspend(self, delay: Duration) -> Bus<'a, T> {
        let shared = self.shared;
        drop(self);
        tokio::time::sleep(delay).await;
        shared.lock().await
    }

    /// Release the lock while waiting for an interrupt.
    pub async fn wait_for_interrupt(
        self,
        timeout: Duration,
    ) -> (Bus<'a, T>, transport::Result<InterruptWait>) {
        let shared = self.shared;
        drop(self);
        let result = shared
            .transport
            .wait_for_interrupt(NONCE_INTERRUPT, timeout)
            .await;
        (shared.lock().await, result)
    }

    /// Stop the hash core.
    ///
    /// A soft stop walks the intensity down first so the rail does not see
    /// a load step; if the flags cannot be read it degrades to a hard stop.
    pub async fn stop_core(&mut self, soft: bool) -> bool {
        if soft {
            match self.read(regs::CORE_FLAGS).await {
                Ok(flags) => {
                    for value in intensity_ramp(flags) {
                        self.write_or_log(value, regs::CORE_FLAGS, "ramped intensity")
                            .await;
                    }
                }
                Err(e) => warn!(error = %e, "cannot ramp hash core down, stopping hard"),
            }
        }
        self.write_or_log(regs::CORE_OFF, regs::CORE_ENABLE, "core disable")
            .await
    }
}

/// Flag words stepping the intensity field (bits 24..32) of `flags` down
/// to zero in at most eight equal steps.
pub fn intensity_ramp(flags: u32) -> Vec<u32> {
    let base = flags & 0x00ff_ffff;
    let mut level = (flags >> 24) as i32;
    let step = (level + 7) / 8;
    let mut words = Vec::with_capacity(9);
    while level > 0 {
        words.push(base | (level as u32) << 24);
        level -= step;
    }
    if level != 0 {
        words.push(base);
    }
    words
}

/// Cloneable handle for talking to a running board from other tasks.
pub struct DeviceHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DeviceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: RegisterTransport> DeviceHandle<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Signal that the current work is stale.
    pub async fn kick(&self) {
        self.shared.kick().await;
    }

    /// Ask the worker to stop at its next loop boundary.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.shared.kick().await;
    }

    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    pub fn status(&self) -> DeviceStatus {
        self.shared.status()
    }

    pub async fn sample_telemetry(&self) -> TelemetrySnapshot {
        let mut bus = self.shared.lock().await;
        bus.check_telemetry().await
    }
}

/// A connected, initialized board.
pub struct FpgaDevice<T> {
    pub(crate) shared: Arc<Shared<T>>,
}

impl<T: RegisterTransport> FpgaDevice<T> {
    /// Connect and bring the board to a known state.
    ///
    /// Only an unreachable board is an error; everything after the
    /// connection is best-effort and logged.
    pub async fn init<C>(
        connector: &C,
        endpoint: &Endpoint,
        index: usize,
        settings: Arc<DeviceSettings>,
        tuner: Arc<dyn AutoTuner>,
        shutdown: CancellationToken,
    ) -> Result<Self>
    where
        C: Connector<Transport = T>,
    {
        let transport = connector.connect(endpoint).await?;
        info!(%endpoint, "connected");

        if let Err(e) = transport.set_timeout(settings.transport_timeout).await {
            warn!(error = %e, "failed setting transport timeout");
        }
        // Interrupts are shared with other clients of the bridge; only take
        // the nonce line.
        if let Err(e) = transport.enable_interrupts(NONCE_INTERRUPT).await {
            warn!(error = %e, "failed enabling interrupts");
        }

        let identity = read_identity(&transport).await;
        let device = Self {
            shared: Arc::new(Shared::new(
                index, transport, settings, tuner, identity, shutdown,
            )),
        };
        device.configure().await;
        Ok(device)
    }

    async fn configure(&self) {
        let shared = &self.shared;
        let settings = &shared.settings;
        info!(
            fpga = %shared.identity.device_type_name(),
            serial = %shared.identity.serial(),
            bitstream = format_args!("{:08x}", shared.identity.bitstream),
            "board identified"
        );

        let mut bus = shared.lock().await;
        bus.set_voltage(&shared.voltage_table, settings.rail_a_mv, settings.rail_b_mv)
            .await;

        bus.set_clock(ClockRequest::ResetToDefault).await;
        let baseline = bus.state.clock.baseline_mhz;
        info!(mhz = format_args!("{:.0}", baseline), "stock clock");

        // Applied once the DAG is built.
        bus.state.clock.target_mhz = if settings.target_clock_mhz != 0 {
            info!(mhz = settings.target_clock_mhz, "target clock");
            f64::from(settings.target_clock_mhz)
        } else {
            baseline
        };

        info!(id = %shared.calibration_id, "tune id");
        if settings.auto_tune > 0 {
            if let Some(path) = settings.tune_file.as_deref().filter(|p| p.exists()) {
                if shared.tuner.load_saved(path, &shared.calibration_id) {
                    info!(file = %path.display(), "applied saved tune, auto-tune off");
                    bus.state.auto_tune = false;
                }
            }
        }
        drop(bus);

        info!(
            work_delay_us = settings.work_delay.as_micros() as u64,
            intensity = %settings.intensity,
            skip_stall_detect = settings.skip_stall_detection,
            "search settings"
        );
    }

    pub fn handle(&self) -> DeviceHandle<T> {
        DeviceHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.shared.identity
    }

    pub fn calibration_id(&self) -> &str {
        &self.shared.calibration_id
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn is_busy(&self) -> bool {
        self.shared.is_busy()
    }

    /// The board refused further work after a stack-protection fault.
    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    /// Forget any pending kick before reading the latest work.
    pub(crate) fn clear_new_work(&self) {
        self.shared.new_work.store(false, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Park until kicked, shut down, or `timeout` passes.
    pub async fn park(&self, timeout: Duration) {
        tokio::select! {
            _ = self.shared.wake.notified() => {}
            _ = self.shared.shutdown.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }

    pub async fn disconnect(&self) {
        self.shared.transport.disconnect().await;
        debug!("disconnected");
    }
}

impl<T: RegisterTransport> Shared<T> {
    fn new(
        index: usize,
        transport: T,
        settings: Arc<DeviceSettings>,
        tuner: Arc<dyn AutoTuner>,
        identity: DeviceIdentity,
        shutdown: CancellationToken,
    ) -> Self {
        let calibration_id = identity.calibration_id(settings.rail_a_mv, settings.rail_b_mv);
        let auto_tune = settings.auto_tune > 0;
        Self {
            index,
            name: DeviceSettings::device_name(index),
            transport,
            settings,
            tuner,
            identity,
            calibration_id,
            voltage_table: VoltageTable::new(),
            state: Mutex::new(ControllerState {
                clock: ClockState::default(),
                averager: HashrateAverager::new(tokio::time::Instant::now()),
                applied: IntensitySettings::default(),
                auto_tune,
                last_epoch: None,
            }),
            new_work: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown,
            status: RwLock::new(DeviceStatus::default()),
        }
    }
}

// Identity is diagnostic only: unreadable words become zero.
async fn read_identity<T: RegisterTransport>(transport: &T) -> DeviceIdentity {
    async fn word<T: RegisterTransport>(t: &T, addr: u32, default: u32, what: &str) -> u32 {
        match t.read32(addr).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "error reading {}", what);
                default
            }
        }
    }

    DeviceIdentity {
        words: [
            word(transport, regs::IDENTITY_LO, 0, "identity").await,
            word(transport, regs::IDENTITY_MID, 0, "identity").await,
            word(transport, regs::IDENTITY_HI, 0, "identity").await,
        ],
        device_type: word(
            transport,
            regs::DEVICE_TYPE,
            regs::DEVICE_TYPE_UNKNOWN,
            "device type",
        )
        .await,
        bitstream: word(transport, regs::BITSTREAM_VERSION, 0, "bitstream version").await,
    }
}
