//! Core voltage programming.
//!
//! Rail A is set through an 8-bit wiper code whose output voltage follows a
//! fitted curve; rail B sits behind a PMBus regulator reached by
//! bit-banging a two-wire port.

use std::time::Duration;

use super::{regs, Bus};
use crate::error::{Error, Rail};
use crate::tracing::prelude::*;
use crate::transport::RegisterTransport;

pub const MIN_MV: u32 = 500;
pub const MAX_MV: u32 = 920;

/// Wiper code to output voltage, strictly decreasing in the code.
#[derive(Debug, Clone)]
pub struct VoltageTable([f64; 256]);

impl Default for VoltageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VoltageTable {
    pub fn new() -> Self {
        let mut table = [0.0; 256];
        for (code, v) in table.iter_mut().enumerate() {
            *v = 0.6 + 2.661 / (20.0 - 2048.0 / (code as f64 + 153.6));
        }
        Self(table)
    }

    /// Output voltage in volts for a wiper code.
    pub fn volts(&self, code: u8) -> f64 {
        self.0[code as usize]
    }

    /// Code whose voltage is closest to `volts`.
    ///
    /// Halving search from the middle of the table, then a look at the
    /// neighbours of the landing point since the last step can overshoot by
    /// one entry.
    pub fn closest_code(&self, volts: f64) -> u8 {
        let t = &self.0;
        if volts <= t[255] {
            return 255;
        }
        if volts >= t[0] {
            return 0;
        }

        let mut idx = 0x80usize;
        let mut step = 0x40usize;
        while step > 0 {
            if volts < t[idx] {
                idx += step;
            } else if volts > t[idx] {
                idx -= step;
            } else {
                return idx as u8;
            }
            step >>= 1;
        }

        let lo = idx.saturating_sub(1);
        let hi = (idx + 1).min(255);
        let best = (lo..=hi)
            .min_by(|&a, &b| {
                (t[a] - volts)
                    .abs()
                    .total_cmp(&(t[b] - volts).abs())
            })
            .unwrap_or(idx);
        best as u8
    }
}

/// One register write in a fixed regulator sequence, with the settle time
/// that must follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub value: u32,
    pub addr: u32,
    pub settle: Duration,
}

const fn w(value: u32, addr: u32) -> Step {
    Step {
        value,
        addr,
        settle: Duration::ZERO,
    }
}

const fn go(addr: u32) -> Step {
    Step {
        value: 0x1,
        addr,
        settle: Duration::ZERO,
    }
}

const fn go_settle(addr: u32) -> Step {
    Step {
        value: 0x1,
        addr,
        settle: Duration::from_secs(1),
    }
}

// FIFO words: 0x100 marks a start condition with the address byte, 0x200 a
// stop after the data byte. Addresses are 7-bit shifted left.
const START: u32 = 0x100;
const STOP: u32 = 0x200;
const PMBUS_START: u32 = START | 0x4d << 1;

/// Regulator loop compensation fix-up for rail B.
pub const RAIL_B_LOOP_FIX: [Step; 16] = [
    w(0xa, regs::RAIL_B_CTRL),
    w(PMBUS_START, regs::RAIL_B_FIFO),
    w(0xd0, regs::RAIL_B_FIFO),
    w(0x04, regs::RAIL_B_FIFO),
    w(0x22, regs::RAIL_B_FIFO),
    w(0x08, regs::RAIL_B_FIFO),
    w(0x1c, regs::RAIL_B_FIFO),
    w(STOP | 0x5c, regs::RAIL_B_FIFO),
    w(PMBUS_START, regs::RAIL_B_FIFO),
    w(0xd0, regs::RAIL_B_FIFO),
    w(0x04, regs::RAIL_B_FIFO),
    w(0x24, regs::RAIL_B_FIFO),
    w(0x08, regs::RAIL_B_FIFO),
    w(0x22, regs::RAIL_B_FIFO),
    w(STOP | 0x2c, regs::RAIL_B_FIFO),
    go_settle(regs::RAIL_B_GO),
];

/// Over-voltage fault limit fix-up for rail B: BRAM page then INT page.
pub const RAIL_B_OV_FIX: [Step; 18] = [
    w(0xa, regs::RAIL_B_CTRL),
    w(PMBUS_START, regs::RAIL_B_FIFO),
    w(0xd0, regs::RAIL_B_FIFO),
    w(0x04, regs::RAIL_B_FIFO),
    w(0xaa, regs::RAIL_B_FIFO),
    w(0x0a, regs::RAIL_B_FIFO),
    w(0xf3, regs::RAIL_B_FIFO),
    w(STOP | 0xe0, regs::RAIL_B_FIFO),
    go_settle(regs::RAIL_B_GO),
    w(0xa, regs::RAIL_B_CTRL),
    w(PMBUS_START, regs::RAIL_B_FIFO),
    w(0xd0, regs::RAIL_B_FIFO),
    w(0x04, regs::RAIL_B_FIFO),
    w(0xaa, regs::RAIL_B_FIFO),
    w(0x06, regs::RAIL_B_FIFO),
    w(0xf3, regs::RAIL_B_FIFO),
    w(STOP | 0xe0, regs::RAIL_B_FIFO),
    go_settle(regs::RAIL_B_GO),
];

/// Rail B output voltage in the regulator's 1/256 V encoding.
pub fn rail_b_code(mv: u32) -> u32 {
    (mv as f64 / 1000.0 * 256.0).round() as u32
}

/// Final rail B transaction: VOUT_COMMAND on page 0x06.
pub fn rail_b_vout(mv: u32) -> [Step; 9] {
    let code = rail_b_code(mv);
    [
        w(0xa, regs::RAIL_B_CTRL),
        w(PMBUS_START, regs::RAIL_B_FIFO),
        w(0xd0, regs::RAIL_B_FIFO),
        w(0x04, regs::RAIL_B_FIFO),
        w(0x21 << 1, regs::RAIL_B_FIFO),
        w(0x06, regs::RAIL_B_FIFO),
        w(code & 0xff, regs::RAIL_B_FIFO),
        w(STOP | (code >> 8), regs::RAIL_B_FIFO),
        go(regs::RAIL_B_GO),
    ]
}

/// Rail A wiper select for a code.
pub fn rail_a_wiper(code: u8) -> [Step; 5] {
    [
        w(0xa, regs::RAIL_A_CTRL),
        w(0x158, regs::RAIL_A_FIFO),
        w(0x00, regs::RAIL_A_FIFO),
        w(STOP | u32::from(code), regs::RAIL_A_FIFO),
        go(regs::RAIL_A_GO),
    ]
}

pub fn check_range(rail: Rail, mv: u32) -> Result<(), Error> {
    if (MIN_MV..=MAX_MV).contains(&mv) {
        Ok(())
    } else {
        Err(Error::CalibrationOutOfRange {
            rail,
            millivolts: mv,
        })
    }
}

impl<T: RegisterTransport> Bus<'_, T> {
    /// Run a fixed sequence. A failed write is logged and the sequence
    /// carries on.
    async fn run_steps(&mut self, steps: &[Step]) {
        for step in steps {
            if let Err(e) = self.write(step.value, step.addr).await {
                warn!(
                    addr = format_args!("0x{:04x}", step.addr),
                    error = %e,
                    "regulator write failed"
                );
            }
            if !step.settle.is_zero() {
                tokio::time::sleep(step.settle).await;
            }
        }
    }

    /// Program both rails. Zero leaves a rail alone; out-of-band targets
    /// are logged and skipped.
    pub(crate) async fn set_voltage(&mut self, table: &VoltageTable, rail_a_mv: u32, rail_b_mv: u32) {
        if rail_a_mv != 0 {
            match check_range(Rail::A, rail_a_mv) {
                Ok(()) => {
                    let code = table.closest_code(rail_a_mv as f64 / 1000.0);
                    info!(
                        target_mv = rail_a_mv,
                        code,
                        actual_v = format_args!("{:.3}", table.volts(code)),
                        "setting rail A"
                    );
                    self.run_steps(&rail_a_wiper(code)).await;
                }
                Err(e) => warn!(error = %e, "voltage request dropped"),
            }
        }

        if rail_b_mv != 0 {
            match check_range(Rail::B, rail_b_mv) {
                Ok(()) => {
                    debug!("applying rail B regulator fix-ups");
                    self.run_steps(&RAIL_B_LOOP_FIX).await;
                    self.run_steps(&RAIL_B_OV_FIX).await;
                    info!(target_mv = rail_b_mv, code = rail_b_code(rail_b_mv), "setting rail B");
                    self.run_steps(&rail_b_vout(rail_b_mv)).await;
                }
                Err(e) => warn!(error = %e, "voltage request dropped"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fpga::testing::harness;
    use crate::transport::sim::SimDevice;

    fn linear_closest(t: &VoltageTable, v: f64) -> u8 {
        (0..=255u8)
            .min_by(|&a, &b| (t.volts(a) - v).abs().total_cmp(&(t.volts(b) - v).abs()))
            .unwrap()
    }

    #[test]
    fn test_table_strictly_decreasing() {
        let t = VoltageTable::new();
        for code in 0..255u8 {
            assert!(t.volts(code) > t.volts(code + 1), "code {}", code);
        }
    }

    #[test]
    fn test_closest_code_matches_linear_scan() {
        let t = VoltageTable::new();
        let (lo, hi) = (t.volts(255), t.volts(0));
        for i in 0..=2000 {
            let v = lo + (hi - lo) * i as f64 / 2000.0;
            let got = t.closest_code(v);
            let want = linear_closest(&t, v);
            assert!(
                (t.volts(got) - v).abs() <= (t.volts(want) - v).abs(),
                "v={} got {} want {}",
                v,
                got,
                want
            );
        }
    }

    #[test]
    fn test_closest_code_exact_entries() {
        let t = VoltageTable::new();
        for code in [0u8, 1, 64, 127, 128, 200, 254, 255] {
            assert_eq!(t.closest_code(t.volts(code)), code);
        }
    }

    #[test]
    fn test_closest_code_clamps() {
        let t = VoltageTable::new();
        assert_eq!(t.closest_code(t.volts(255)), 255);
        assert_eq!(t.closest_code(0.0), 255);
        assert_eq!(t.closest_code(t.volts(0)), 0);
        assert_eq!(t.closest_code(5.0), 0);
    }

    #[test]
    fn test_range_check_bounds() {
        assert!(check_range(Rail::A, 500).is_ok());
        assert!(check_range(Rail::A, 920).is_ok());
        assert!(check_range(Rail::A, 499).is_err());
        assert!(check_range(Rail::B, 921).is_err());
    }

    #[test]
    fn test_rail_b_code_rounds() {
        // 850mV * 256 / 1000 = 217.6
        assert_eq!(rail_b_code(850), 218);
        assert_eq!(rail_b_code(500), 128);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rail_a_sequence() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        let table = VoltageTable::new();
        let code = table.closest_code(0.8);

        h.shared.lock().await.set_voltage(&table, 800, 0).await;

        assert_eq!(
            dev.writes(),
            vec![
                (regs::RAIL_A_CTRL, 0xa),
                (regs::RAIL_A_FIFO, 0x158),
                (regs::RAIL_A_FIFO, 0x00),
                (regs::RAIL_A_FIFO, 0x200 | u32::from(code)),
                (regs::RAIL_A_GO, 0x1),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rail_b_sequence_ends_with_vout() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;
        let start = tokio::time::Instant::now();

        h.shared
            .lock()
            .await
            .set_voltage(&VoltageTable::new(), 0, 850)
            .await;

        let fifo = dev.writes_to(regs::RAIL_B_FIFO);
        assert_eq!(&fifo[fifo.len() - 3..], &[0x06, 218 & 0xff, 0x200]);
        assert_eq!(dev.writes_to(regs::RAIL_B_GO).len(), 4);
        assert!(dev.writes_to(regs::RAIL_A_GO).is_empty());
        // Three fix-up transactions, each followed by a 1s settle.
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_band_request_dropped() {
        let dev = SimDevice::new();
        let h = harness(dev.clone()).await;

        h.shared
            .lock()
            .await
            .set_voltage(&VoltageTable::new(), 950, 450)
            .await;

        assert!(dev.writes().is_empty());
    }
}
