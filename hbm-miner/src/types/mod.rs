//! Core types shared across the driver.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use crate::u256::U256;

/// Algorithm tag of the only work the bitstream can do.
pub const ETHASH: &str = "ethash";

/// A 32-byte hash, stored in the order it travels on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct H256(pub [u8; 32]);

impl H256 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First and last four bytes, for log lines.
    pub fn abridged(&self) -> String {
        format!(
            "{}…{}",
            hex::encode(&self.0[..4]),
            hex::encode(&self.0[28..])
        )
    }

    /// Bytes in reverse order.
    pub fn reversed(&self) -> [u8; 32] {
        let mut out = self.0;
        out.reverse();
        out
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.abridged())
    }
}

impl From<U256> for H256 {
    fn from(v: U256) -> Self {
        Self(v.to_be_bytes())
    }
}

impl From<H256> for U256 {
    fn from(h: H256) -> Self {
        U256::from_be_bytes(h.0)
    }
}

/// A unit of search work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkPackage {
    pub header: H256,
    /// Largest acceptable hash, big-endian.
    pub boundary: H256,
    pub start_nonce: u64,
    pub epoch: u32,
    pub algorithm: String,
}

impl WorkPackage {
    pub fn is_ethash(&self) -> bool {
        self.algorithm == ETHASH
    }
}

/// Everything needed to build the DAG for one epoch.
#[derive(Debug, Clone)]
pub struct EpochContext {
    pub epoch: u32,
    pub dag_size: u64,
    pub light_size: u64,
    pub seed: H256,
    /// Precomputed light cache, needed only for the upload strategy.
    pub light_cache: Option<Bytes>,
}

/// A candidate nonce reported by the board.
#[derive(Debug, Clone)]
pub struct Solution {
    pub nonce: u64,
    pub work: Arc<WorkPackage>,
    pub found_at: Instant,
    pub device_index: usize,
}

/// Identity words read once after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub words: [u32; 3],
    pub device_type: u32,
    pub bitstream: u32,
}

impl DeviceIdentity {
    /// Device type word as four ASCII characters.
    pub fn device_type_name(&self) -> String {
        self.device_type
            .to_be_bytes()
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() {
                    b as char
                } else {
                    '?'
                }
            })
            .collect()
    }

    pub fn serial(&self) -> String {
        format!(
            "{:08x}{:x}{:x}",
            self.words[0], self.words[1], self.words[2]
        )
    }

    /// Key under which tuned settings for this board and these voltage
    /// targets are saved.
    pub fn calibration_id(&self, rail_a_mv: u32, rail_b_mv: u32) -> String {
        format!(
            "{}_{:08x}_{:.2}{:.2}",
            self.serial(),
            self.bitstream,
            rail_a_mv as f64,
            rail_b_mv as f64
        )
    }
}

/// Hash core pacing knobs. Zero means "leave at the bitstream default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntensitySettings {
    pub patience: u8,
    pub intensity_n: u8,
    pub intensity_d: u8,
}

impl IntensitySettings {
    /// Pack into the core flags register.
    pub fn control_word(&self) -> u32 {
        let mut flags = 0u32;
        if self.patience != 0 {
            flags |= 1 << 6 | u32::from(self.patience) << 8;
        }
        if self.intensity_n != 0 {
            let d = (u32::from(self.intensity_d) & 0x3f) * 8;
            flags |= 1 | u32::from(self.intensity_n) << 24 | d.saturating_sub(1) << 16;
        }
        flags
    }
}

impl fmt::Display for IntensitySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P={} N={} D={}",
            self.patience, self.intensity_n, self.intensity_d
        )
    }
}

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HashRate(pub u64); // hashes per second

impl HashRate {
    /// Rate from a hash count observed over `secs` seconds.
    pub fn from_count(hashes: u64, secs: f64) -> Self {
        if secs <= 0.0 {
            return Self(0);
        }
        Self((hashes as f64 / secs) as u64)
    }

    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000 {
            format!("{:.2} GH/s", self.0 as f64 / 1_000_000_000.0)
        } else if self.0 >= 1_000_000 {
            format!("{:.2} MH/s", self.0 as f64 / 1_000_000.0)
        } else if self.0 >= 1_000 {
            format!("{:.2} kH/s", self.0 as f64 / 1_000.0)
        } else {
            format!("{} H/s", self.0)
        }
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_human_readable())
    }
}
