//! Epoch change: light cache, DAG generation and duplication.
//!
//! Generation only runs at the stock clock, so the pipeline drops the
//! clock first and restores the operating clock at the end. A status word
//! left on the board records which epoch the resident DAG belongs to; a
//! matching word short-circuits everything after the core parameters.
//!
//! ```text
//!   Idle ─► Preparing ─┬─► OnChipCacheGen ─┬─► ItemsPartitioned ─► Generating ─► Duplicating ─► Done
//!                      ├─► BulkUpload ─────┘
//!                      └─► Done (resident)
//! ```

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use tokio::time::Instant;

use super::clock::ClockRequest;
use super::{regs, Bus, FpgaDevice, Shared};
use crate::config::CacheStrategy;
use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::transport::RegisterTransport;
use crate::types::EpochContext;

const CACHE_POLL: Duration = Duration::from_millis(100);
const CACHE_POLLS: u32 = 600;
const DAG_POLL: Duration = Duration::from_secs(1);
const DAG_POLLS: u32 = 1800;
/// Progress is sampled every this many DAG status polls.
const PROGRESS_EVERY: u32 = 5;
const UPLOAD_LOG_EVERY: usize = 100;

/// Bytes per item in the hash core's view of the DAG.
const HASH_ITEM_BYTES: u64 = 128;
/// Bytes per node in the generator's view of the DAG and light cache.
const NODE_BYTES: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EpochPhase {
    #[default]
    Idle,
    Preparing,
    OnChipCacheGen,
    BulkUpload,
    ItemsPartitioned,
    Generating,
    Duplicating,
    Done,
}

impl fmt::Display for EpochPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EpochPhase::Idle => "idle",
            EpochPhase::Preparing => "preparing",
            EpochPhase::OnChipCacheGen => "on-chip cache",
            EpochPhase::BulkUpload => "cache upload",
            EpochPhase::ItemsPartitioned => "items partitioned",
            EpochPhase::Generating => "generating",
            EpochPhase::Duplicating => "duplicating",
            EpochPhase::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    /// Same epoch as last time; nothing was touched.
    Skipped,
    /// The board already held this epoch's DAG.
    AlreadyResident,
    Generated,
}

/// Fixed-point reciprocal of the item count used by the core's modulo.
///
/// `floor(2^60 / items) >> 4`; only the low 32 bits are programmed.
pub fn item_reciprocal(items: u32) -> u64 {
    if items == 0 {
        return 0;
    }
    ((1u64 << 60) / u64::from(items)) >> 4
}

/// Split `dag_items` into contiguous `[start, end)` ranges, one per mixer.
/// Mixer 0 takes the remainder.
pub fn partition_mixers(dag_items: u64, mixers: u32) -> Vec<Range<u64>> {
    let mixers = u64::from(mixers.max(1));
    let per_mixer = dag_items / mixers;
    let leftover = dag_items - per_mixer * mixers;
    let mut ranges = Vec::with_capacity(mixers as usize);
    let mut pos = 0;
    for i in 0..mixers {
        let mut end = pos + per_mixer;
        if i == 0 {
            end += leftover;
        }
        ranges.push(pos..end);
        pos = end;
    }
    ranges
}

/// Destination of staging chunk `i`: the chunk index with its nibbles
/// swapped, spreading neighbouring chunks across both stacks.
pub fn duplicate_chunk_dst(i: u64) -> u64 {
    (((i & 0x0f) << 4) | ((i & 0xf0) >> 4)) * regs::HBM_CHUNK
}

fn enter<T: RegisterTransport>(shared: &Shared<T>, phase: EpochPhase) {
    debug!(%phase, "epoch phase");
    shared.update_status(|s| s.epoch_phase = phase);
}

impl<T: RegisterTransport> FpgaDevice<T> {
    /// Make the board's DAG match `ctx`.
    ///
    /// The device is marked busy for the duration. Only a failed cache
    /// upload, a missing cache, shutdown or a die-on-error escalation
    /// return an error; other register faults are logged. A halted board
    /// is left powered down and answers [`Error::Halted`].
    pub async fn prepare_epoch(&self, ctx: &EpochContext) -> Result<EpochOutcome> {
        let shared = &*self.shared;
        if shared.is_halted() {
            warn!(epoch = ctx.epoch, "board halted, not building DAG");
            return Err(Error::Halted);
        }
        if shared.state.lock().await.last_epoch == Some(ctx.epoch) {
            return Ok(EpochOutcome::Skipped);
        }

        shared.set_busy(true);
        let result = self.run_pipeline(ctx).await;
        // A halt raised meanwhile keeps the board blocked.
        shared.set_busy(shared.is_halted());

        match &result {
            Ok(outcome) => {
                info!(epoch = ctx.epoch, ?outcome, "epoch ready");
                shared.update_status(|s| {
                    s.current_epoch = Some(ctx.epoch);
                    s.epoch_phase = EpochPhase::Done;
                });
            }
            Err(e) => {
                error!(epoch = ctx.epoch, error = %e, "epoch change failed");
                enter(shared, EpochPhase::Idle);
            }
        }
        result
    }

    async fn run_pipeline(&self, ctx: &EpochContext) -> Result<EpochOutcome> {
        let shared = &*self.shared;
        let settings = &*shared.settings;

        let mut bus = shared.lock().await;
        enter(shared, EpochPhase::Preparing);
        info!(epoch = ctx.epoch, "changing epoch");

        bus.set_clock(ClockRequest::ResetToDefault).await;
        bus.stop_core(true).await;
        bus.write_or_log(regs::DAG_POWER_ON, regs::DAG_POWER, "generator power")
            .await;
        bus.write_or_log(regs::DAG_STOP, regs::DAG_CONTROL, "generator stop")
            .await;

        // The core may have been reset even when the DAG survived, so these
        // are always programmed.
        let items = (ctx.dag_size / HASH_ITEM_BYTES) as u32;
        bus.write_or_log(items, regs::ITEM_COUNT, "item count").await;
        bus.write_or_log(
            item_reciprocal(items) as u32,
            regs::ITEM_RECIPROCAL,
            "item reciprocal",
        )
        .await;

        let status = bus.read_or(regs::DAG_STATUS, 0, "DAG status").await;
        if status & regs::DAG_STATUS_VALID != 0 && !settings.force_dag {
            let resident = status & 0xffff;
            info!(resident, "board holds a DAG");
            if resident == ctx.epoch & 0xffff {
                info!("no DAG generation needed");
                bus.write_or_log(regs::DAG_POWER_OFF, regs::DAG_POWER, "generator power")
                    .await;
                self.finish_epoch(bus, ctx.epoch).await;
                return Ok(EpochOutcome::AlreadyResident);
            }
        }

        bus.write_or_log(regs::DAG_POWER_RESET, regs::DAG_POWER, "generator reset")
            .await;
        bus.write_or_log(regs::DAG_POWER_ON, regs::DAG_POWER, "generator power")
            .await;

        let parent_nodes = (ctx.light_size / NODE_BYTES) as u32;
        bus = match settings.cache_strategy {
            CacheStrategy::OnChip => {
                enter(shared, EpochPhase::OnChipCacheGen);
                bus.build_light_cache(ctx, parent_nodes).await?
            }
            CacheStrategy::Upload => {
                enter(shared, EpochPhase::BulkUpload);
                bus.upload_light_cache(ctx).await?;
                bus
            }
        };

        enter(shared, EpochPhase::ItemsPartitioned);
        let nodes = ctx.dag_size / NODE_BYTES;
        let ranges = partition_mixers(nodes, settings.dag_mixers.min(regs::MAX_MIXERS));
        debug!(
            parent_nodes,
            mixers = ranges.len(),
            per_mixer = nodes / ranges.len() as u64,
            leftover = nodes % ranges.len() as u64,
            "DAG generator parameters"
        );
        bus.write_or_log(parent_nodes, regs::DAG_PARENT_NODES, "parent nodes")
            .await;
        for (i, range) in ranges.iter().enumerate() {
            let i = i as u32;
            bus.write_or_log(range.start as u32, regs::mixer_start(i), "mixer start")
                .await;
            bus.write_or_log(range.end as u32, regs::mixer_end(i), "mixer end")
                .await;
        }

        enter(shared, EpochPhase::Generating);
        let first = ranges.first().map(|r| r.end - r.start).unwrap_or(0);
        bus = bus.generate_dag(ctx.dag_size, first).await?;

        enter(shared, EpochPhase::Duplicating);
        bus.duplicate_dag().await?;

        bus.write_or_log(
            regs::DAG_STATUS_VALID | (ctx.epoch & 0xffff),
            regs::DAG_STATUS,
            "DAG status",
        )
        .await;
        debug!("generator to low power");
        bus.write_or_log(regs::DAG_POWER_OFF, regs::DAG_POWER, "generator power")
            .await;
        self.finish_epoch(bus, ctx.epoch).await;
        Ok(EpochOutcome::Generated)
    }

    // Restore the operating clock, then restart tuning once the lock is
    // released.
    async fn finish_epoch(&self, mut bus: Bus<'_, T>, epoch: u32) {
        let target = bus.state.clock.target_mhz;
        if target != 0.0 {
            info!(mhz = target as u32, "restoring target clock");
            bus.set_clock(ClockRequest::Target(target)).await;
        }
        let clock = bus.state.clock.current_mhz;
        bus.state.last_epoch = Some(epoch);
        drop(bus);

        self.shared.update_status(|s| s.clock_mhz = clock);
        self.shared.tuner.start_tune(clock);
    }
}

impl<'a, T: RegisterTransport> Bus<'a, T> {
    fn cancelled(&self) -> bool {
        self.shared().shutdown.is_cancelled()
    }

    async fn build_light_cache(mut self, ctx: &EpochContext, parent_nodes: u32) -> Result<Self> {
        info!("generating light cache");
        let started = Instant::now();
        self.write_or_log(regs::CACHE_RESET, regs::CACHE_CONTROL, "cache reset")
            .await;
        self.write_or_log(parent_nodes, regs::DAG_PARENT_NODES, "parent nodes")
            .await;
        if let Err(e) = self.write_words(&ctx.seed.reversed(), regs::CACHE_SEED).await {
            warn!(error = %e, "failed writing seed");
        }
        self.write_or_log(regs::CACHE_START, regs::CACHE_CONTROL, "cache start")
            .await;

        let mut status = 0;
        let mut polls = 0;
        while status & regs::CACHE_DONE == 0 {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            if polls == CACHE_POLLS {
                let err = Error::ProtocolTimeout { what: "light cache" };
                self.escalate("light cache generation", &err)?;
                warn!(error = %err, "continuing without completion");
                break;
            }
            self = self.suspend(CACHE_POLL).await;
            polls += 1;
            match self.read(regs::CACHE_CONTROL).await {
                Ok(v) => status = v,
                Err(e) => {
                    self.escalate("light cache status read", &e)?;
                    debug!(error = %e, "light cache status unreadable");
                }
            }
        }

        info!(
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "light cache generated"
        );
        Ok(self)
    }

    async fn upload_light_cache(&self, ctx: &EpochContext) -> Result<()> {
        let Some(cache) = ctx.light_cache.as_ref() else {
            return Err(Error::MissingLightCache { epoch: ctx.epoch });
        };
        info!(bytes = cache.len(), "uploading light cache");
        let started = Instant::now();

        for (n, chunk) in cache.chunks(regs::UPLOAD_CHUNK).enumerate() {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            let offset = (n * regs::UPLOAD_CHUNK) as u64;
            if let Err(e) = self.copy_from_host(chunk, offset).await {
                warn!(offset, error = %e, "cache chunk failed, retrying");
                if let Err(e) = self.copy_from_host(chunk, offset).await {
                    error!(offset, error = %e, "cache chunk failed twice");
                    return Err(Error::CacheUploadFailed { offset });
                }
            }
            if n % UPLOAD_LOG_EVERY == 0 {
                let done = offset as f64 + chunk.len() as f64;
                info!(
                    pct = format_args!("{:.1}", done / cache.len() as f64 * 100.0),
                    "cache upload"
                );
            }
        }

        info!(
            bytes = cache.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "light cache uploaded"
        );
        Ok(())
    }

    /// Start the generator and wait for it, reporting progress against the
    /// first (largest) mixer range.
    async fn generate_dag(mut self, dag_size: u64, first_range: u64) -> Result<Self> {
        info!("generating DAG");
        let started = Instant::now();
        self.write_or_log(regs::DAG_START, regs::DAG_CONTROL, "generator start")
            .await;
        let mut status = match self.read(regs::DAG_CONTROL).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "error checking DAG status");
                0
            }
        };

        if self.settings().skip_dag_wait {
            warn!("not waiting for DAG generation, expect failed hashes");
        } else {
            let mut polls = 0;
            while status & regs::DAG_DONE == 0 {
                if self.cancelled() {
                    return Err(Error::Cancelled);
                }
                if polls == DAG_POLLS {
                    let err = Error::ProtocolTimeout { what: "DAG generation" };
                    self.escalate("DAG generation", &err)?;
                    warn!(error = %err, "continuing without completion");
                    break;
                }
                self = self.suspend(DAG_POLL).await;
                polls += 1;
                match self.read(regs::DAG_CONTROL).await {
                    Ok(v) => status = v,
                    Err(e) => {
                        self.escalate("DAG status read", &e)?;
                        debug!(error = %e, "DAG status unreadable");
                    }
                }
                if polls % PROGRESS_EVERY == 0 && first_range > 0 {
                    let done = self.read_or(regs::DAG_PARENT_NODES, 0, "DAG progress").await;
                    info!(
                        pct = format_args!("{:.2}", f64::from(done) / first_range as f64 * 100.0),
                        "DAG progress"
                    );
                }
            }
        }

        info!(
            status,
            bytes = dag_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "DAG generated"
        );
        Ok(self)
    }

    /// Spread the staged DAG over both stacks, then copy the assembled
    /// image back. The first failed copy abandons the rest.
    async fn duplicate_dag(&self) -> Result<()> {
        debug!("duplicating DAG items");
        let started = Instant::now();
        for i in 0..regs::HBM_CHUNKS {
            if self.cancelled() {
                return Err(Error::Cancelled);
            }
            let src = regs::HBM_STAGING + i * regs::HBM_CHUNK;
            if let Err(e) = self
                .copy_within(src, duplicate_chunk_dst(i), regs::HBM_CHUNK)
                .await
            {
                error!(chunk = i, error = %e, "failed to duplicate DAG");
                return Ok(());
            }
        }
        if let Err(e) = self
            .copy_within(0, regs::HBM_IMAGE_DST, regs::HBM_IMAGE_LEN)
            .await
        {
            error!(error = %e, "failed to copy DAG image");
            return Ok(());
        }
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "DAG duplicated"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::config::{CacheStrategy, DeviceSettings};
    use crate::fpga::testing::{harness, harness_with};
    use crate::transport::sim::{DeviceCopy, SimDevice};
    use crate::tuner::RecordingTuner;
    use crate::types::H256;

    const EPOCH: u32 = 7;
    // 2^24 + 13 generator nodes, so mixer 0 carries a remainder of 5.
    const DAG_SIZE: u64 = (1 << 30) + 13 * 64;
    const LIGHT_SIZE: u64 = 16 * 1024 * 1024 + 3 * 64;

    fn context() -> EpochContext {
        let mut seed = [0u8; 32];
        for (i, b) in seed.iter_mut().enumerate() {
            *b = i as u8;
        }
        EpochContext {
            epoch: EPOCH,
            dag_size: DAG_SIZE,
            light_size: LIGHT_SIZE,
            seed: H256(seed),
            light_cache: None,
        }
    }

    fn starts(dev: &SimDevice) -> usize {
        dev.writes_to(regs::DAG_CONTROL)
            .iter()
            .filter(|v| **v == regs::DAG_START)
            .count()
    }

    async fn upload_harness(dev: SimDevice) -> crate::fpga::testing::Harness {
        let settings = DeviceSettings {
            cache_strategy: CacheStrategy::Upload,
            ..Default::default()
        };
        harness_with(dev, settings, RecordingTuner::new()).await
    }

    #[test]
    fn test_item_reciprocal_exact() {
        assert_eq!(item_reciprocal(1), 72_057_594_037_927_936);
        assert_eq!(item_reciprocal(7), 10_293_942_005_418_276);
        assert_eq!(item_reciprocal(123_456), 583_670_247_196);
        assert_eq!(item_reciprocal(1 << 20), 68_719_476_736);
        assert_eq!(item_reciprocal(0), 0);
    }

    #[test]
    fn test_partition_covers_items() {
        for (items, mixers) in [(1_000_003u64, 8u32), (64, 8), (5, 8), (17, 1), (0, 4)] {
            let ranges = partition_mixers(items, mixers);
            assert_eq!(ranges.len(), mixers as usize);
            assert_eq!(ranges[0].start, 0);
            assert_eq!(ranges.last().unwrap().end, items);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
            }
            let sizes: Vec<u64> = ranges.iter().map(|r| r.end - r.start).collect();
            let leftover = items % u64::from(mixers);
            assert!(sizes[1..].iter().all(|s| *s == sizes[0] - leftover));
        }
    }

    #[test]
    fn test_duplicate_destination_swaps_nibbles() {
        assert_eq!(duplicate_chunk_dst(0x00), 0);
        assert_eq!(duplicate_chunk_dst(0x01), 0x10 << 24);
        assert_eq!(duplicate_chunk_dst(0x10), 0x01 << 24);
        assert_eq!(duplicate_chunk_dst(0xa5), 0x5a << 24);
        let mut seen: Vec<u64> = (0..256).map(duplicate_chunk_dst).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 256);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_generation() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        let ctx = context();

        let outcome = h.device.prepare_epoch(&ctx).await.unwrap();
        assert_eq!(outcome, EpochOutcome::Generated);

        let items = (DAG_SIZE / 128) as u32;
        assert_eq!(dev.register(regs::ITEM_COUNT), items);
        assert_eq!(
            dev.register(regs::ITEM_RECIPROCAL),
            item_reciprocal(items) as u32
        );
        assert_eq!(
            dev.writes_to(regs::CACHE_CONTROL),
            vec![regs::CACHE_RESET, regs::CACHE_START]
        );
        let seed = dev.bulk_writes();
        assert_eq!(seed.len(), 1);
        assert_eq!(seed[0].addr, regs::CACHE_SEED);
        assert_eq!(seed[0].bytes, ctx.seed.reversed().to_vec());
        assert!(seed[0].endian_flip);

        let nodes = DAG_SIZE / 64;
        assert_eq!(dev.register(regs::mixer_start(0)), 0);
        assert_eq!(u64::from(dev.register(regs::mixer_end(0))), nodes / 8 + 5);
        assert_eq!(u64::from(dev.register(regs::mixer_end(7))), nodes);
        assert_eq!(dev.register(regs::DAG_PARENT_NODES), (LIGHT_SIZE / 64) as u32);

        assert_eq!(
            dev.writes_to(regs::DAG_CONTROL),
            vec![regs::DAG_STOP, regs::DAG_START]
        );
        let copies = dev.device_copies();
        assert_eq!(copies.len(), 257);
        assert_eq!(
            copies[1],
            DeviceCopy {
                src: regs::HBM_STAGING + regs::HBM_CHUNK,
                dst: 0x10 << 24,
                len: regs::HBM_CHUNK
            }
        );
        assert_eq!(
            copies[256],
            DeviceCopy {
                src: 0,
                dst: regs::HBM_IMAGE_DST,
                len: regs::HBM_IMAGE_LEN
            }
        );

        assert_eq!(dev.register(regs::DAG_STATUS), regs::DAG_STATUS_VALID | EPOCH);
        let power = dev.writes_to(regs::DAG_POWER);
        assert!(power
            .windows(2)
            .any(|w| w == [regs::DAG_POWER_RESET, regs::DAG_POWER_ON]));
        assert_eq!(power.last(), Some(&regs::DAG_POWER_OFF));

        assert_eq!(h.tuner.recorded().starts, vec![500.0]);
        assert!(!h.device.is_busy());
        let status = h.device.handle().status();
        assert_eq!(status.current_epoch, Some(EPOCH));
        assert_eq!(status.epoch_phase, EpochPhase::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixers_stay_inside_register_window() {
        let dev = SimDevice::new();
        let settings = DeviceSettings {
            dag_mixers: 64,
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;

        h.device.prepare_epoch(&context()).await.unwrap();

        let last = regs::MAX_MIXERS - 1;
        assert_eq!(u64::from(dev.register(regs::mixer_end(last))), DAG_SIZE / 64);
        assert!(regs::mixer_end(last) < regs::DAG_STATUS);
        assert_eq!(
            dev.writes_to(regs::DAG_STATUS),
            vec![regs::DAG_STATUS_VALID | EPOCH]
        );
        assert_eq!(
            dev.writes_to(regs::CACHE_CONTROL),
            vec![regs::CACHE_RESET, regs::CACHE_START]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_epoch_twice_starts_generator_once() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;

        h.device.prepare_epoch(&context()).await.unwrap();
        let second = h.device.prepare_epoch(&context()).await.unwrap();

        assert_eq!(second, EpochOutcome::Skipped);
        assert_eq!(starts(&dev), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_survives_epoch_change() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        h.device.prepare_epoch(&context()).await.unwrap();

        // Left stack over its catastrophic limit.
        dev.set_register(regs::STACK_HEALTH, regs::STACK_HEALTH_SAFE | 1 << 2);
        h.device.handle().sample_telemetry().await;
        let power_before = dev.writes_to(regs::DAG_POWER).len();

        let next = EpochContext {
            epoch: 9,
            ..context()
        };
        let err = h.device.prepare_epoch(&next).await.unwrap_err();

        assert!(matches!(err, Error::Halted));
        assert!(h.device.is_busy());
        assert!(h.device.is_halted());
        assert_eq!(starts(&dev), 1);
        assert_eq!(
            dev.writes_to(regs::DAG_POWER)[power_before - 1..],
            [regs::DAG_POWER_OFF]
        );
        assert_eq!(h.device.handle().status().current_epoch, Some(EPOCH));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resident_dag_takes_fast_path() {
        let dev = SimDevice::new();
        dev.set_register(regs::DAG_STATUS, regs::DAG_STATUS_VALID | EPOCH);
        let h = harness(dev.clone()).await;

        let outcome = h.device.prepare_epoch(&context()).await.unwrap();

        assert_eq!(outcome, EpochOutcome::AlreadyResident);
        assert_eq!(starts(&dev), 0);
        assert!(dev.device_copies().is_empty());
        assert!(dev.writes_to(regs::CACHE_CONTROL).is_empty());
        assert_eq!(dev.register(regs::ITEM_COUNT), (DAG_SIZE / 128) as u32);
        assert_eq!(dev.writes_to(regs::DAG_POWER).last(), Some(&regs::DAG_POWER_OFF));
        assert_eq!(h.tuner.recorded().starts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resident_dag_for_other_epoch_regenerates() {
        let dev = SimDevice::new();
        dev.set_register(regs::DAG_STATUS, regs::DAG_STATUS_VALID | (EPOCH - 1));
        let h = harness(dev.clone()).await;

        let outcome = h.device.prepare_epoch(&context()).await.unwrap();
        assert_eq!(outcome, EpochOutcome::Generated);
        assert_eq!(dev.register(regs::DAG_STATUS), regs::DAG_STATUS_VALID | EPOCH);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_dag_ignores_resident() {
        let dev = SimDevice::new();
        dev.set_register(regs::DAG_STATUS, regs::DAG_STATUS_VALID | EPOCH);
        let settings = DeviceSettings {
            force_dag: true,
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;

        let outcome = h.device.prepare_epoch(&context()).await.unwrap();
        assert_eq!(outcome, EpochOutcome::Generated);
        assert_eq!(starts(&dev), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_status_regenerates() {
        let dev = SimDevice::new();
        dev.fail_reads(regs::DAG_STATUS);
        let h = harness(dev.clone()).await;

        let outcome = h.device.prepare_epoch(&context()).await.unwrap();
        assert_eq!(outcome, EpochOutcome::Generated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_target_clock_restored_after_generation() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        h.shared.state.lock().await.clock.target_mhz = 450.0;

        h.device.prepare_epoch(&context()).await.unwrap();

        // 2000MHz VCO / ceil8(2000 / 451) = 2000 / 4.5
        let started = h.tuner.recorded().starts;
        assert_eq!(started.len(), 1);
        assert!((started[0] - 2000.0 / 4.5).abs() < 1e-9);
        assert_eq!(dev.writes_to(regs::PLL_CLK0).last(), Some(&(4 | 500 << 8)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_in_chunks() {
        let dev = SimDevice::new();
        let h = upload_harness(dev.clone()).await;
        let mut ctx = context();
        ctx.light_cache = Some(Bytes::from(vec![0xab; 3 * regs::UPLOAD_CHUNK + 100]));

        let outcome = h.device.prepare_epoch(&ctx).await.unwrap();

        assert_eq!(outcome, EpochOutcome::Generated);
        assert_eq!(
            dev.host_copies(),
            vec![(0, 65536), (65536, 65536), (131072, 65536), (196608, 100)]
        );
        assert!(dev.writes_to(regs::CACHE_CONTROL).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_retries_chunk_once() {
        let dev = SimDevice::new();
        dev.fail_host_copy(65536, 1);
        let h = upload_harness(dev.clone()).await;
        let mut ctx = context();
        ctx.light_cache = Some(Bytes::from(vec![0; 2 * regs::UPLOAD_CHUNK]));

        let outcome = h.device.prepare_epoch(&ctx).await.unwrap();
        assert_eq!(outcome, EpochOutcome::Generated);
        assert_eq!(dev.host_copies(), vec![(0, 65536), (65536, 65536)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_fails_after_retry() {
        let dev = SimDevice::new();
        dev.fail_host_copy(65536, 2);
        let h = upload_harness(dev.clone()).await;
        let mut ctx = context();
        ctx.light_cache = Some(Bytes::from(vec![0; 3 * regs::UPLOAD_CHUNK]));

        let err = h.device.prepare_epoch(&ctx).await.unwrap_err();

        assert!(matches!(err, Error::CacheUploadFailed { offset: 65536 }));
        assert_eq!(starts(&dev), 0);
        assert!(!h.device.is_busy());
        assert_eq!(h.device.handle().status().epoch_phase, EpochPhase::Idle);
        assert_eq!(h.shared.state.lock().await.last_epoch, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_without_cache() {
        let h = upload_harness(SimDevice::new()).await;
        let err = h.device.prepare_epoch(&context()).await.unwrap_err();
        assert!(matches!(err, Error::MissingLightCache { epoch: EPOCH }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplication_stops_at_first_failure() {
        let dev = SimDevice::new();
        dev.fail_device_copy_at(5);
        let h = harness(dev.clone()).await;

        let outcome = h.device.prepare_epoch(&context()).await.unwrap();

        assert_eq!(outcome, EpochOutcome::Generated);
        let copies = dev.device_copies();
        assert_eq!(copies.len(), 5);
        assert!(copies.iter().all(|c| c.len == regs::HBM_CHUNK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_sampled_every_fifth_poll() {
        let dev = SimDevice::new();
        // Status read after the start plus five polls see it still running.
        dev.script_reads(regs::DAG_CONTROL, [0; 6]);
        let h = harness(dev.clone()).await;

        let started = Instant::now();
        h.device.prepare_epoch(&context()).await.unwrap();

        assert_eq!(dev.read_count(regs::DAG_CONTROL), 7);
        assert_eq!(dev.read_count(regs::DAG_PARENT_NODES), 1);
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_dag_wait() {
        let dev = SimDevice::new();
        dev.script_reads(regs::DAG_CONTROL, [0; 10]);
        let settings = DeviceSettings {
            skip_dag_wait: true,
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;

        h.device.prepare_epoch(&context()).await.unwrap();
        assert_eq!(dev.read_count(regs::DAG_CONTROL), 1);
        assert_eq!(dev.device_copies().len(), 257);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generator_timeouts_are_not_fatal() {
        let dev = SimDevice::new();
        dev.hold_completion();
        let h = harness(dev.clone()).await;

        let outcome = h.device.prepare_epoch(&context()).await.unwrap();

        assert_eq!(outcome, EpochOutcome::Generated);
        assert_eq!(dev.read_count(regs::CACHE_CONTROL), CACHE_POLLS as usize);
        assert_eq!(dev.read_count(regs::DAG_CONTROL), DAG_POLLS as usize + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_read_failure_escalates() {
        let dev = SimDevice::new();
        dev.hold_completion();
        dev.fail_reads(regs::CACHE_CONTROL);
        let settings = DeviceSettings {
            die_on_error: true,
            ..Default::default()
        };
        let h = harness_with(dev.clone(), settings, RecordingTuner::new()).await;

        let err = h.device.prepare_epoch(&context()).await.unwrap_err();
        assert!(matches!(err, Error::Escalated { .. }));
        assert_eq!(starts(&dev), 0);
        assert!(!h.device.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_wait() {
        let dev = SimDevice::new();
        dev.hold_completion();
        let h = harness(dev.clone()).await;
        h.shared.shutdown.cancel();

        let err = h.device.prepare_epoch(&context()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(starts(&dev), 0);
    }
}
