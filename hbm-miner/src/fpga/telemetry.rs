//! Board temperature, supply and HBM stack health.
//!
//! Sampled periodically from the search loop and on demand. A stack that
//! lost calibration or tripped its catastrophic-temperature bit halts the
//! board until the process is restarted.

use std::fmt;
use std::sync::atomic::Ordering;

use super::clock::ClockRequest;
use super::{regs, Bus};
use crate::tracing::prelude::*;
use crate::transport::RegisterTransport;

/// Stack temperature above which the HBM figures join the averages line.
const HOT_STACK_C: u8 = 70;

/// Decoded stack health register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StackHealth {
    pub left_calibrated: bool,
    pub right_calibrated: bool,
    pub left_catastrophic: bool,
    pub right_catastrophic: bool,
    pub left_temp_c: u8,
    pub right_temp_c: u8,
}

impl StackHealth {
    pub fn from_raw(raw: u32) -> Self {
        Self {
            left_calibrated: raw & 1 != 0,
            right_calibrated: raw >> 1 & 1 != 0,
            left_catastrophic: raw >> 2 & 1 != 0,
            right_catastrophic: raw >> 10 & 1 != 0,
            left_temp_c: (raw >> 3 & 0x7f) as u8,
            right_temp_c: (raw >> 11 & 0x7f) as u8,
        }
    }

    pub fn catastrophic(&self) -> bool {
        self.left_catastrophic || self.right_catastrophic
    }

    pub fn requires_shutdown(&self) -> bool {
        self.catastrophic() || !self.left_calibrated || !self.right_calibrated
    }

    fn worth_reporting(&self) -> bool {
        self.catastrophic()
            || self.left_temp_c > HOT_STACK_C
            || self.right_temp_c > HOT_STACK_C
    }
}

impl fmt::Display for StackHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.left_calibrated {
            f.write_str("LCAL: 0 ")?;
        }
        if !self.right_calibrated {
            f.write_str("RCAL: 0 ")?;
        }
        if self.left_catastrophic {
            f.write_str("LCATTRIP: ")?;
        }
        if self.right_catastrophic {
            f.write_str("RCATTRIP: ")?;
        }
        write!(f, "{}C {}C", self.left_temp_c, self.right_temp_c)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetrySnapshot {
    /// Die temperature; 0 when unreadable.
    pub temperature_c: f64,
    /// Core supply; 0 when unreadable.
    pub supply_mv: f64,
    pub clock_mhz: f64,
    pub stacks: StackHealth,
}

pub fn temperature_from_raw(raw: u32) -> f64 {
    f64::from(raw) * 507.6 / 65536.0 - 279.43
}

pub fn supply_from_raw(raw: u32) -> f64 {
    f64::from(raw) * 3.0 / 65536.0 * 1000.0
}

impl<T: RegisterTransport> Bus<'_, T> {
    /// Sample telemetry, log the averages line, and halt the board if a
    /// stack is unhealthy.
    pub(crate) async fn check_telemetry(&mut self) -> TelemetrySnapshot {
        let temperature_c = match self.read(regs::SYSMON_TEMP).await {
            Ok(raw) => temperature_from_raw(raw),
            Err(e) => {
                debug!(error = %e, "temperature unreadable");
                0.0
            }
        };
        let clock_mhz = self.set_clock(ClockRequest::Read).await.unwrap_or(0.0);
        let supply_mv = match self.read(regs::SYSMON_SUPPLY).await {
            Ok(raw) => supply_from_raw(raw),
            Err(e) => {
                debug!(error = %e, "supply unreadable");
                0.0
            }
        };
        // An unreadable health word must not look like a trip.
        let raw = self
            .read_or(regs::STACK_HEALTH, regs::STACK_HEALTH_SAFE, "stack health")
            .await;
        let stacks = StackHealth::from_raw(raw);

        let snapshot = TelemetrySnapshot {
            temperature_c,
            supply_mv,
            clock_mhz,
            stacks,
        };
        self.log_averages(&snapshot);

        if stacks.requires_shutdown() {
            self.emergency_halt(&stacks).await;
        }

        self.shared().update_status(|s| {
            s.telemetry = Some(snapshot);
            s.clock_mhz = clock_mhz;
        });
        snapshot
    }

    fn log_averages(&self, snapshot: &TelemetrySnapshot) {
        let shared = self.shared();
        let avg = self.state.averager.latest();
        let stage = shared.tuner.tuning_stage();
        let hbm = (self.settings().show_stack_stats || snapshot.stacks.worth_reporting())
            .then(|| snapshot.stacks.to_string());

        info!(
            device = %shared.name,
            "Avg 1m:{:.2} 10m:{:.2} 60m:{:.2}Mhs Err={:.2}% [{}] {}MHz {:.2}V {}C{}{}",
            avg.one_minute,
            avg.ten_minute,
            avg.sixty_minute,
            avg.error_rate_pct,
            self.state.applied,
            self.state.clock.target_mhz as u32,
            snapshot.supply_mv / 1000.0,
            snapshot.temperature_c as i32,
            hbm.map(|s| format!(" HBM {}", s)).unwrap_or_default(),
            if stage > 0 {
                format!(" Tuning... S{}", stage)
            } else {
                String::new()
            },
        );
    }

    /// Stop hashing, power down the generator and keep the worker from
    /// starting another search.
    async fn emergency_halt(&mut self, stacks: &StackHealth) {
        self.stop_core(true).await;
        self.write_or_log(regs::DAG_POWER_OFF, regs::DAG_POWER, "generator power")
            .await;
        if stacks.catastrophic() {
            error!(%stacks, "HBM stack catastrophic temperature, powered off, refusing work");
        } else {
            error!(%stacks, "HBM calibration failed, refusing work");
        }

        let shared = self.shared();
        shared.halted.store(true, Ordering::SeqCst);
        shared.set_busy(true);
        shared.new_work.store(true, Ordering::SeqCst);
        shared.transport.kick_interrupts().await;
        shared.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSettings;
    use crate::fpga::testing::{harness, harness_with};
    use crate::transport::sim::SimDevice;
    use crate::tuner::RecordingTuner;

    #[test]
    fn test_health_decode() {
        let h = StackHealth::from_raw(0x3 | 45 << 3 | 1 << 10 | 46 << 11);
        assert!(h.left_calibrated && h.right_calibrated);
        assert!(!h.left_catastrophic);
        assert!(h.right_catastrophic);
        assert_eq!(h.left_temp_c, 45);
        assert_eq!(h.right_temp_c, 46);
        assert_eq!(h.to_string(), "RCATTRIP: 45C 46C");
    }

    #[test]
    fn test_safe_default_does_not_trip() {
        assert!(!StackHealth::from_raw(regs::STACK_HEALTH_SAFE).requires_shutdown());
    }

    #[test]
    fn test_conversions() {
        assert!((temperature_from_raw(42_533) - 50.0).abs() < 0.01);
        assert!((supply_from_raw(18_568) - 849.98).abs() < 0.01);
        assert_eq!(temperature_from_raw(0), -279.43);
    }

    // Every fault bit on its own, on top of an otherwise healthy word.
    const FAULTS: [(&str, u32); 4] = [
        ("left uncalibrated", 0x3 & !0x1),
        ("right uncalibrated", 0x3 & !0x2),
        ("left catastrophic", 0x3 | 1 << 2),
        ("right catastrophic", 0x3 | 1 << 10),
    ];

    #[tokio::test]
    async fn test_every_fault_halts() {
        for (what, raw) in FAULTS {
            let dev = SimDevice::new();
            dev.set_register(regs::STACK_HEALTH, raw | 40 << 3 | 40 << 11);
            dev.set_register(regs::CORE_FLAGS, 16 << 24);
            let h = harness(dev.clone()).await;

            let snapshot = h.device.handle().sample_telemetry().await;

            assert!(snapshot.stacks.requires_shutdown(), "{}", what);
            assert!(h.device.is_busy(), "{}", what);
            assert!(h.device.is_halted(), "{}", what);
            assert!(h.shared.new_work.load(Ordering::SeqCst), "{}", what);
            assert_eq!(dev.writes_to(regs::CORE_ENABLE), vec![regs::CORE_OFF], "{}", what);
            assert!(!dev.writes_to(regs::CORE_FLAGS).is_empty(), "{}", what);
            assert_eq!(
                dev.writes_to(regs::DAG_POWER),
                vec![regs::DAG_POWER_OFF],
                "{}",
                what
            );
        }
    }

    #[tokio::test]
    async fn test_combined_faults_halt() {
        for mask in 0u32..16 {
            let mut raw = 0x3;
            if mask & 1 != 0 {
                raw &= !0x1;
            }
            if mask & 2 != 0 {
                raw &= !0x2;
            }
            if mask & 4 != 0 {
                raw |= 1 << 2;
            }
            if mask & 8 != 0 {
                raw |= 1 << 10;
            }
            let dev = SimDevice::new();
            dev.set_register(regs::STACK_HEALTH, raw);
            let h = harness(dev).await;
            h.device.handle().sample_telemetry().await;
            assert_eq!(h.device.is_busy(), mask != 0, "mask {:04b}", mask);
        }
    }

    #[tokio::test]
    async fn test_healthy_board_keeps_running() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;

        let snapshot = h.device.handle().sample_telemetry().await;

        assert!(!h.device.is_busy());
        assert!(dev.writes_to(regs::CORE_ENABLE).is_empty());
        assert_eq!(snapshot.clock_mhz, 500.0);
        assert_eq!(snapshot.stacks.left_temp_c, 45);
        let status = h.device.handle().status();
        assert_eq!(status.telemetry, Some(snapshot));
    }

    #[tokio::test]
    async fn test_unreadable_health_is_safe() {
        let dev = SimDevice::new();
        dev.fail_reads(regs::STACK_HEALTH);
        dev.fail_reads(regs::SYSMON_TEMP);
        let settings = DeviceSettings {
            show_stack_stats: true,
            ..Default::default()
        };
        let h = harness_with(dev, settings, RecordingTuner::new()).await;

        let snapshot = h.device.handle().sample_telemetry().await;

        assert!(!h.device.is_busy());
        assert_eq!(snapshot.temperature_c, 0.0);
        assert_eq!(snapshot.stacks, StackHealth::from_raw(regs::STACK_HEALTH_SAFE));
    }
}
