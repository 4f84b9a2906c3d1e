//! Core clock control.
//!
//! The core clock is the PLL's VCO divided by the clock-0 output divisor.
//! Both are read from the PLL; only the divisor is ever reprogrammed.
//!
//! VCO register: bits 0..4 output divider, 8..16 integer multiplier,
//! 16..26 fractional multiplier in thousandths. Clock-0 register: bits
//! 0..4 integer divisor, 8..18 fractional divisor in thousandths.

use std::time::Duration;

use super::{regs, Bus};
use crate::error::Error;
use crate::tracing::prelude::*;
use crate::transport::RegisterTransport;

const REF_CLOCK_MHZ: f64 = 200.0;
const LOCK_POLLS: usize = 1000;
const MIN_DIVISOR: f64 = 2.0;
const MAX_DIVISOR: f64 = 15.875;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockRequest {
    /// Report the current clock without touching the PLL.
    Read,
    /// Return to the bitstream's default clock.
    ResetToDefault,
    /// Run as close to, without exceeding, this many MHz.
    Target(f64),
}

/// Clock bookkeeping, all in MHz.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockState {
    /// Bitstream default, read back after the last reset.
    pub baseline_mhz: f64,
    /// Clock to return to after DAG generation; 0 means stay at baseline.
    pub target_mhz: f64,
    pub current_mhz: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PllReading {
    pub vco_raw: u32,
    pub vco_mhz: f64,
    pub divisor: f64,
    pub core_mhz: f64,
}

impl PllReading {
    pub fn decode(vco_raw: u32, clk0_raw: u32) -> Option<Self> {
        let mult = f64::from((vco_raw >> 8) & 0xff);
        // The fractional field only counts when one of these bits is set.
        let frac = if (vco_raw >> 16) & 0x2f != 0 {
            f64::from((vco_raw >> 16) & 0x3ff) / 1000.0
        } else {
            0.0
        };
        let out_div = f64::from(vco_raw & 0xf);
        let divisor = f64::from(clk0_raw & 0xf) + f64::from((clk0_raw >> 8) & 0x3ff) / 1000.0;
        if out_div == 0.0 || divisor == 0.0 {
            return None;
        }
        let vco_mhz = REF_CLOCK_MHZ * (mult + frac) / out_div;
        Some(Self {
            vco_raw,
            vco_mhz,
            divisor,
            core_mhz: vco_mhz / divisor,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DivisorError {
    /// Requested clock is faster than the core allows.
    TooFast(f64),
    /// Requested clock needs a divisor wider than the register.
    TooSlow(f64),
}

/// Divisor for `target_mhz`, rounded up to an eighth so the result never
/// runs faster than requested.
pub fn divisor_for(vco_mhz: f64, target_mhz: f64) -> Result<f64, DivisorError> {
    let exact = vco_mhz / (target_mhz + 1.0);
    let div = (exact * 8.0).ceil() / 8.0;
    if div < MIN_DIVISOR {
        Err(DivisorError::TooFast(div))
    } else if div > MAX_DIVISOR {
        Err(DivisorError::TooSlow(div))
    } else {
        Ok(div)
    }
}

pub fn encode_divisor(div: f64) -> u32 {
    let int = div.trunc() as u32 & 0xf;
    let frac = (div.fract() * 1000.0).round() as u32 & 0x3ff;
    int | frac << 8
}

impl<T: RegisterTransport> Bus<'_, T> {
    async fn read_pll(&self) -> Option<PllReading> {
        let vco_raw = match self.read(regs::PLL_VCO).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cannot read VCO");
                return None;
            }
        };
        let clk0_raw = match self.read(regs::PLL_CLK0).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "cannot read clock divisor");
                return None;
            }
        };
        let pll = PllReading::decode(vco_raw, clk0_raw);
        if pll.is_none() {
            warn!(
                vco = format_args!("0x{:08x}", vco_raw),
                clk0 = format_args!("0x{:08x}", clk0_raw),
                "PLL reports a zero divider"
            );
        }
        pll
    }

    /// Read or change the core clock. Returns the resulting clock, or
    /// `None` if the PLL could not be read (nothing is changed then).
    ///
    /// Any change saves and restores the hash core's DAG parameters and
    /// the generator power state, which a PLL relock can clobber. A reset
    /// reads the stock clock back and records it as the baseline.
    pub(crate) async fn set_clock(&mut self, request: ClockRequest) -> Option<f64> {
        let Some(pll) = self.read_pll().await else {
            warn!(?request, "clock unchanged");
            return None;
        };
        let mut current = pll.core_mhz;

        if request == ClockRequest::Read {
            self.state.clock.current_mhz = current;
            return Some(current);
        }

        let mut saved = [
            (regs::ITEM_COUNT, 0),
            (regs::ITEM_RECIPROCAL, 0),
            (regs::DAG_POWER, 0),
        ];
        for (addr, value) in saved.iter_mut() {
            *value = self.read_or(*addr, 0, "parameter saved across clock change").await;
        }
        self.write_or_log(regs::DAG_POWER_ON, regs::DAG_POWER, "generator power")
            .await;

        match request {
            ClockRequest::Target(mhz) => match divisor_for(pll.vco_mhz, mhz) {
                Ok(div) => {
                    self.write_or_log(pll.vco_raw, regs::PLL_VCO, "VCO").await;
                    self.write_or_log(encode_divisor(div), regs::PLL_CLK0, "clock divisor")
                        .await;
                    self.write_or_log(0x7, regs::PLL_RECONFIG, "PLL reconfigure")
                        .await;
                    self.write_or_log(0x3, regs::PLL_RECONFIG, "PLL reconfigure")
                        .await;
                    current = pll.vco_mhz / div;
                    self.state.clock.target_mhz = current.trunc();
                    info!(mhz = current as u32, divisor = div, "core clock set");
                }
                Err(DivisorError::TooFast(div)) => {
                    warn!(requested = mhz, divisor = div, "core clock would exceed limit");
                }
                Err(DivisorError::TooSlow(div)) => {
                    warn!(requested = mhz, divisor = div, "core clock below divider range");
                }
            },
            ClockRequest::ResetToDefault => {
                debug!("resetting core clock to stock");
                self.write_or_log(0x5, regs::PLL_RECONFIG, "PLL reset").await;
                self.write_or_log(0x1, regs::PLL_RECONFIG, "PLL reset").await;
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.write_or_log(regs::CLOCK_RESET_VALUE, regs::CLOCK_RESET, "clock reset")
                    .await;
            }
            ClockRequest::Read => {}
        }

        if !self.wait_pll_lock().await {
            warn!(error = %Error::ProtocolTimeout { what: "PLL lock" }, "continuing unlocked");
        }

        if request == ClockRequest::ResetToDefault {
            match self.read_pll().await {
                Some(stock) => {
                    current = stock.core_mhz;
                    self.state.clock.baseline_mhz = current;
                }
                None => warn!(mhz = current, "stock clock unknown, keeping previous reading"),
            }
        }

        for (addr, value) in saved {
            self.write_or_log(value, addr, "restored parameter").await;
        }

        self.state.clock.current_mhz = current;
        Some(current)
    }

    async fn wait_pll_lock(&self) -> bool {
        for _ in 0..LOCK_POLLS {
            if let Ok(status) = self.read(regs::PLL_STATUS).await {
                if status & regs::PLL_LOCKED != 0 {
                    return true;
                }
            }
        }
        false
    }
}
