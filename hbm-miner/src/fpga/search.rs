//! The per-work-package search loop.
//!
//! ```text
//!   ProgramWork ─► Running ─┬─► NewWork ──┐
//!                           ├─► Shutdown ─┼─► SoftStopped
//!                           └─► Stalled ──┘
//! ```
//!
//! Each iteration waits for a nonce with the lock released, then samples
//! the stall and target-check counters. A stall counter that stops moving
//! is the only sign of a wedged core, and the loop exits so the worker can
//! restart the search from scratch.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::Instant;

use super::{regs, Bus, FpgaDevice};
use crate::config::NonceReporting;
use crate::error::Result;
use crate::tracing::prelude::*;
use crate::transport::{InterruptWait, RegisterTransport};
use crate::types::{HashRate, Solution, WorkPackage, H256};
use crate::u256::U256;
use crate::worker::SolutionSink;

/// Leading zero bits of the loosest boundary the core is given.
const BOUNDARY_FLOOR_ZEROS: usize = 27;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchExit {
    NewWork,
    Shutdown,
    Stalled,
}

/// The boundary actually programmed: the caller's, unless it is stricter
/// than the floor. Candidates between the two are weeded out by whoever
/// verifies solutions.
pub fn effective_boundary(boundary: &H256) -> H256 {
    let floor = U256::max_shr(BOUNDARY_FLOOR_ZEROS);
    U256::from(*boundary).max(floor).into()
}

/// Rollover-corrected view of the 64-bit target-check counter.
#[derive(Debug, Default)]
pub struct TargetCheckCounter {
    last: u64,
}

impl TargetCheckCounter {
    /// Checks completed since the previous sample. An all-zero sample means
    /// the counter was reset and counts as no progress.
    pub fn advance(&mut self, lo: u32, mut hi: u32) -> u64 {
        if lo == 0 && hi == 0 {
            self.last = 0;
            return 0;
        }
        let mut total = u64::from(hi) << 32 | u64::from(lo);
        if total < self.last {
            // Low word wrapped between the two reads.
            hi = hi.wrapping_add(1);
            total = u64::from(hi) << 32 | u64::from(lo);
        }
        let delta = total.wrapping_sub(self.last);
        self.last = total;
        delta
    }
}

impl<T: RegisterTransport> FpgaDevice<T> {
    /// Search `work` until new work arrives, shutdown is requested or the
    /// core stalls. Solutions go to `sink` as they are found.
    ///
    /// A kick that is already pending ends the search at once. The flag is
    /// left set; the worker clears it before it reads the next package.
    pub async fn search(
        &self,
        work: Arc<WorkPackage>,
        sink: &dyn SolutionSink,
    ) -> Result<SearchExit> {
        let shared = &*self.shared;
        let mut bus = shared.lock().await;
        let result = match bus.program_work(&work).await {
            Ok(()) => {
                shared.update_status(|s| s.is_searching = true);
                let (returned, result) = bus.run_search(&work, sink).await;
                bus = returned;
                result
            }
            Err(e) => Err(e),
        };
        bus.stop_core(true).await;
        drop(bus);

        shared.update_status(|s| s.is_searching = false);
        match &result {
            Ok(exit) => debug!(?exit, "search ended"),
            Err(e) => error!(error = %e, "search failed"),
        }
        result
    }
}

impl<'a, T: RegisterTransport> Bus<'a, T> {
    async fn program_work(&mut self, work: &WorkPackage) -> Result<()> {
        if let Err(e) = self.write_words(work.header.as_bytes(), regs::HEADER).await {
            warn!(error = %e, "failed setting header");
        }
        let target = effective_boundary(&work.boundary);
        if target != work.boundary {
            debug!(requested = %work.boundary, programmed = %target, "boundary raised to floor");
        }
        if let Err(e) = self.write_words(target.as_bytes(), regs::TARGET).await {
            warn!(error = %e, "failed setting target");
        }
        self.write_or_log((work.start_nonce >> 32) as u32, regs::START_NONCE_HI, "start nonce")
            .await;
        self.write_or_log(work.start_nonce as u32, regs::START_NONCE_LO, "start nonce")
            .await;

        let shared = self.shared();
        let intensity = shared
            .tuner
            .intensity_override()
            .unwrap_or(shared.settings.intensity);
        self.state.applied = intensity;
        if let Err(e) = self.write(intensity.control_word(), regs::CORE_FLAGS).await {
            warn!(error = %e, "failed setting core flags");
            self.escalate("core flags write", &e)?;
        }

        let enable = match shared.settings.nonce_reporting {
            NonceReporting::Interrupt => regs::CORE_RUN_INTERRUPT,
            NonceReporting::Polled => regs::CORE_RUN_POLLED,
        };
        self.write_or_log(enable, regs::CORE_ENABLE, "core enable").await;
        debug!(
            job = %work.header,
            nonce = format_args!("{:#x}", work.start_nonce),
            %intensity,
            "work programmed"
        );
        Ok(())
    }

    // Hands the bus back on every path so the caller can stop the core.
    async fn run_search(
        mut self,
        work: &Arc<WorkPackage>,
        sink: &dyn SolutionSink,
    ) -> (Self, Result<SearchExit>) {
        let shared = self.shared();
        let settings = &shared.settings;
        let mut checks = TargetCheckCounter::default();
        let mut last_stall: Option<u32> = None;
        let mut last_sample = Instant::now();
        let mut last_telemetry = Instant::now();

        loop {
            if shared.new_work.load(Ordering::SeqCst) {
                return (self, Ok(SearchExit::NewWork));
            }
            if shared.shutdown.is_cancelled() {
                return (self, Ok(SearchExit::Shutdown));
            }

            let nonces = match settings.nonce_reporting {
                NonceReporting::Interrupt => {
                    let (bus, waited) = self.wait_for_interrupt(settings.work_delay).await;
                    self = bus;
                    match waited {
                        Ok(InterruptWait::Fired(nonce)) => vec![nonce],
                        Ok(InterruptWait::TimedOut) => Vec::new(),
                        Err(e) => {
                            error!(error = %e, "FPGA interrupt error");
                            if let Err(fatal) = self.escalate("interrupt wait", &e) {
                                return (self, Err(fatal));
                            }
                            Vec::new()
                        }
                    }
                }
                NonceReporting::Polled => {
                    self = self.suspend(settings.work_delay).await;
                    self.poll_nonces().await
                }
            };

            let stalled = if settings.skip_stall_detection {
                false
            } else {
                let count = match self.read(regs::STALL_COUNT).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "error checking for hashcore stall");
                        0
                    }
                };
                let stalled = last_stall == Some(count);
                last_stall = Some(count);
                stalled
            };
            let lo = self.read_or(regs::TARGET_CHECKS_LO, 0, "target check counter").await;
            let hi = self.read_or(regs::TARGET_CHECKS_HI, 0, "target check counter").await;
            let delta = checks.advance(lo, hi);

            for nonce in &nonces {
                info!(
                    job = %work.header,
                    nonce = format_args!("{:#x}", nonce),
                    "solution"
                );
                sink.submit(Solution {
                    nonce: *nonce,
                    work: Arc::clone(work),
                    found_at: Instant::now(),
                    device_index: shared.index,
                })
                .await;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(last_sample).as_secs_f64();
            last_sample = now;
            shared.tuner.tune(delta);
            let averages = self
                .state
                .averager
                .record(delta, now, shared.tuner.error_rate());
            shared.update_status(|s| {
                s.solutions_found += nonces.len() as u64;
                if elapsed > 0.0 {
                    s.hashrate = HashRate::from_count(delta, elapsed);
                }
                if let Some(avg) = averages {
                    s.averages = avg;
                }
            });

            if now.duration_since(last_telemetry) >= settings.telemetry_interval {
                last_telemetry = now;
                self.check_telemetry().await;
            }

            if stalled {
                warn!("hash core stalled, restarting search");
                return (self, Ok(SearchExit::Stalled));
            }
        }
    }

    // Legacy path: the core latches up to four nonces and flags them in the
    // enable register.
    async fn poll_nonces(&self) -> Vec<u64> {
        let flags = self.read_or(regs::CORE_ENABLE, 0, "nonce flags").await;
        let mut nonces = Vec::new();
        for slot in 0..regs::POLLED_SLOTS {
            if flags & regs::polled_ready_bit(slot) == 0 {
                continue;
            }
            let hi = self.read_or(regs::polled_nonce_hi(slot), 0, "nonce").await;
            let lo = self.read_or(regs::polled_nonce_lo(slot), 0, "nonce").await;
            nonces.push(u64::from(hi) << 32 | u64::from(lo));
        }
        if !nonces.is_empty() {
            self.write_or_log(regs::CORE_CLEAR_NONCES, regs::CORE_ENABLE, "nonce clear")
                .await;
        }
        nonces
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;
    use crate::config::DeviceSettings;
    use crate::error::Error;
    use crate::fpga::testing::{harness, harness_with};
    use crate::transport::sim::SimDevice;
    use crate::tuner::RecordingTuner;
    use crate::types::{IntensitySettings, ETHASH};

    fn work() -> Arc<WorkPackage> {
        let mut header = [0u8; 32];
        header[0] = 0xaa;
        header[31] = 0x55;
        let mut boundary = [0u8; 32];
        boundary[4] = 0x01;
        Arc::new(WorkPackage {
            header: H256(header),
            boundary: H256(boundary),
            start_nonce: 0x1122_3344_5566_7788,
            epoch: 7,
            algorithm: ETHASH.into(),
        })
    }

    /// A board whose stall counter freezes at `value`.
    fn stalling(dev: &SimDevice, value: u32) {
        dev.stop_advancing(regs::STALL_COUNT);
        dev.set_register(regs::STALL_COUNT, value);
    }

    #[test]
    fn test_counter_rollover() {
        let mut c = TargetCheckCounter::default();
        assert_eq!(c.advance(100, 0), 100);
        assert_eq!(c.advance(300, 0), 200);
        // Low word wrapped before the high word was read.
        assert_eq!(c.advance(0x10, 0), (1u64 << 32) + 0x10 - 300);
        assert_eq!(c.advance(0, 0), 0);
        assert_eq!(c.advance(50, 0), 50);
    }

    #[test]
    fn test_boundary_floor() {
        let strict = work().boundary;
        let floor = effective_boundary(&strict);
        let mut expected = [0xffu8; 32];
        expected[..3].fill(0);
        expected[3] = 0x1f;
        assert_eq!(floor, H256(expected));

        let loose = H256([0xff; 32]);
        assert_eq!(effective_boundary(&loose), loose);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_ends_search_after_two_samples() {
        let dev = SimDevice::new();
        stalling(&dev, 5);
        let h = harness(dev.clone()).await;
        let (tx, _rx) = mpsc::channel(8);

        let exit = h.device.search(work(), &tx).await.unwrap();

        assert_eq!(exit, SearchExit::Stalled);
        assert_eq!(dev.read_count(regs::STALL_COUNT), 2);
        assert_eq!(dev.writes_to(regs::CORE_ENABLE).last(), Some(&regs::CORE_OFF));
        assert!(!h.device.handle().status().is_searching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_programs_work() {
        let dev = SimDevice::new();
        stalling(&dev, 5);
        let h = harness(dev.clone()).await;
        let (tx, _rx) = mpsc::channel(8);
        let work = work();

        h.device.search(work.clone(), &tx).await.unwrap();

        let bulk = dev.bulk_writes();
        assert_eq!(bulk[0].addr, regs::HEADER);
        assert_eq!(bulk[0].bytes, work.header.as_bytes().to_vec());
        assert_eq!(bulk[1].addr, regs::TARGET);
        assert_eq!(bulk[1].bytes, effective_boundary(&work.boundary).as_bytes().to_vec());
        assert!(bulk.iter().all(|b| b.endian_flip));
        assert_eq!(dev.writes_to(regs::START_NONCE_HI), vec![0x1122_3344]);
        assert_eq!(dev.writes_to(regs::START_NONCE_LO), vec![0x5566_7788]);
        assert_eq!(
            dev.writes_to(regs::CORE_ENABLE)[0],
            regs::CORE_RUN_INTERRUPT
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nonce_becomes_solution() {
        let dev = SimDevice::new();
        stalling(&dev, 5);
        dev.push_nonce(0xdead_beef);
        let h = harness(dev.clone()).await;
        let (tx, mut rx) = mpsc::channel(8);

        h.device.search(work(), &tx).await.unwrap();

        let solution = rx.try_recv().unwrap();
        assert_eq!(solution.nonce, 0xdead_beef);
        assert_eq!(solution.device_index, 0);
        assert_eq!(solution.work, work());
        assert!(rx.try_recv().is_err());
        assert_eq!(h.device.handle().status().solutions_found, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_work_ends_search() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        let handle = h.device.handle();
        let (tx, _rx) = mpsc::channel(8);

        let kicker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            handle.kick().await;
        });
        let exit = h.device.search(work(), &tx).await.unwrap();
        kicker.await.unwrap();

        assert_eq!(exit, SearchExit::NewWork);
        // Still pending for the worker to pick up.
        assert!(h.shared.new_work.load(Ordering::SeqCst));
        assert_eq!(dev.writes_to(regs::CORE_ENABLE).last(), Some(&regs::CORE_OFF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kick_before_search_is_not_lost() {
        let dev = SimDevice::new();
        stalling(&dev, 5);
        let h = harness(dev.clone()).await;
        let (tx, _rx) = mpsc::channel(8);

        // Work was published after the worker read the feed.
        h.device.handle().kick().await;
        let start = Instant::now();
        let exit = h.device.search(work(), &tx).await.unwrap();

        assert_eq!(exit, SearchExit::NewWork);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(dev.read_count(regs::STALL_COUNT), 0);
        assert_eq!(dev.writes_to(regs::CORE_ENABLE).last(), Some(&regs::CORE_OFF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_search() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        let handle = h.device.handle();
        let (tx, _rx) = mpsc::channel(8);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            handle.shutdown().await;
        });
        let exit = h.device.search(work(), &tx).await.unwrap();
        stopper.await.unwrap();

        // The kick that accompanies shutdown is seen first.
        assert!(matches!(exit, SearchExit::NewWork | SearchExit::Shutdown));
        assert!(h.device.shutdown_requested());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_error_escalates() {
        let dev = SimDevice::new();
        dev.fail_interrupts();
        let settings = DeviceSettings {
            die_on_error: true,
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;
        let (tx, _rx) = mpsc::channel(8);

        let err = h.device.search(work(), &tx).await.unwrap_err();

        assert!(matches!(err, Error::Escalated { .. }));
        assert_eq!(dev.writes_to(regs::CORE_ENABLE).last(), Some(&regs::CORE_OFF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_error_tolerated_without_policy() {
        let dev = SimDevice::new();
        dev.fail_interrupts();
        stalling(&dev, 9);
        let h = harness(dev).await;
        let (tx, _rx) = mpsc::channel(8);

        let exit = h.device.search(work(), &tx).await.unwrap();
        assert_eq!(exit, SearchExit::Stalled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tuner_override_wins() {
        let dev = SimDevice::new();
        stalling(&dev, 5);
        let tuned = IntensitySettings {
            patience: 2,
            intensity_n: 30,
            intensity_d: 4,
        };
        let settings = DeviceSettings {
            intensity: IntensitySettings {
                patience: 9,
                intensity_n: 10,
                intensity_d: 1,
            },
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::with_override(tuned)).await;
        let (tx, _rx) = mpsc::channel(8);

        h.device.search(work(), &tx).await.unwrap();

        assert_eq!(dev.writes_to(regs::CORE_FLAGS)[0], tuned.control_word());
        assert_eq!(h.shared.state.lock().await.applied, tuned);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_deltas_feed_tuner() {
        let dev = SimDevice::new();
        dev.advance_on_read(regs::TARGET_CHECKS_LO, 1000);
        dev.set_register(regs::TARGET_CHECKS_LO, 1000);
        stalling(&dev, 5);
        let h = harness(dev).await;
        let (tx, _rx) = mpsc::channel(8);

        h.device.search(work(), &tx).await.unwrap();

        assert_eq!(h.tuner.recorded().deltas, vec![1000, 1000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_mode_reports_every_ready_slot() {
        let dev = SimDevice::new();
        stalling(&dev, 5);
        dev.script_reads(
            regs::CORE_ENABLE,
            [regs::polled_ready_bit(0) | regs::polled_ready_bit(2)],
        );
        dev.set_register(regs::polled_nonce_hi(0), 0x1);
        dev.set_register(regs::polled_nonce_lo(0), 0x2);
        dev.set_register(regs::polled_nonce_hi(2), 0x3);
        dev.set_register(regs::polled_nonce_lo(2), 0x4);
        let settings = DeviceSettings {
            nonce_reporting: NonceReporting::Polled,
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;
        let (tx, mut rx) = mpsc::channel(8);

        h.device.search(work(), &tx).await.unwrap();

        assert_eq!(rx.try_recv().unwrap().nonce, 0x1_0000_0002);
        assert_eq!(rx.try_recv().unwrap().nonce, 0x3_0000_0004);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            dev.writes_to(regs::CORE_ENABLE),
            vec![regs::CORE_RUN_POLLED, regs::CORE_CLEAR_NONCES, regs::CORE_OFF]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_telemetry() {
        let dev = SimDevice::new();
        let settings = DeviceSettings {
            telemetry_interval: Duration::from_millis(250),
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;
        let handle = h.device.handle();
        let (tx, _rx) = mpsc::channel(8);

        let kicker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1050)).await;
            handle.kick().await;
        });
        h.device.search(work(), &tx).await.unwrap();
        kicker.await.unwrap();

        assert!(dev.read_count(regs::STACK_HEALTH) >= 3);
        assert!(h.device.handle().status().telemetry.is_some());
    }
}
