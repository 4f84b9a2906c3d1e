//! Register map of the ethash bitstream.
//!
//! All registers are 32 bits wide and addressed by byte offset.

// ── Identity ─────────────────────────────────────────────────────────────────

/// Four ASCII characters naming the board family.
pub const DEVICE_TYPE: u32 = 0x0000;
pub const BITSTREAM_VERSION: u32 = 0x0008;
pub const IDENTITY_LO: u32 = 0x1000;
pub const IDENTITY_MID: u32 = 0x1008;
pub const IDENTITY_HI: u32 = 0x7000;

/// Substituted for an unreadable device type: "unkn".
pub const DEVICE_TYPE_UNKNOWN: u32 = 0x756e_6b6e;

// ── Telemetry ────────────────────────────────────────────────────────────────

pub const SYSMON_TEMP: u32 = 0x3400;
pub const SYSMON_SUPPLY: u32 = 0x3404;

/// Packed HBM stack health, see `telemetry::StackHealth`.
pub const STACK_HEALTH: u32 = 0x7008;

/// Both stacks calibrated, no trip. Used when the health read fails.
pub const STACK_HEALTH_SAFE: u32 = 0x3;

// ── DAG generator ────────────────────────────────────────────────────────────

pub const DAG_CONTROL: u32 = 0x4000;
pub const DAG_START: u32 = 0x1;
pub const DAG_STOP: u32 = 0x2;
pub const DAG_DONE: u32 = 0x2;

/// Parent node count on write; generation progress on read.
pub const DAG_PARENT_NODES: u32 = 0x4008;

/// Mixer range registers run up to the DAG status word.
pub const MAX_MIXERS: u32 = 21;

pub const fn mixer_start(i: u32) -> u32 {
    0x400c + 8 * i
}

pub const fn mixer_end(i: u32) -> u32 {
    0x4010 + 8 * i
}

/// Bit 31 valid, low 16 bits the epoch the resident DAG was built for.
pub const DAG_STATUS: u32 = 0x40b8;
pub const DAG_STATUS_VALID: u32 = 1 << 31;

pub const CACHE_CONTROL: u32 = 0x40bc;
pub const CACHE_START: u32 = 0x1;
pub const CACHE_RESET: u32 = 0x2;
pub const CACHE_DONE: u32 = 0x2;

/// 32-byte seed, byte-reversed, written word-swapped.
pub const CACHE_SEED: u32 = 0x40c0;

// ── Hash core ────────────────────────────────────────────────────────────────

pub const HEADER: u32 = 0x5000;
pub const TARGET: u32 = 0x5020;
pub const ITEM_COUNT: u32 = 0x5040;
pub const TARGET_CHECKS_HI: u32 = 0x5044;
pub const TARGET_CHECKS_LO: u32 = 0x5048;
pub const START_NONCE_LO: u32 = 0x5064;
pub const START_NONCE_HI: u32 = 0x5068;

/// Core enable. Reads back pending-nonce flags in polled mode.
pub const CORE_ENABLE: u32 = 0x506c;
pub const CORE_RUN_INTERRUPT: u32 = 0x0001_0001;
pub const CORE_RUN_POLLED: u32 = 0x0001_0000;
pub const CORE_CLEAR_NONCES: u32 = 0x0001_0000;
pub const CORE_OFF: u32 = 0x0;

/// Patience and intensity fields; intensity lives in bits 24..32.
pub const CORE_FLAGS: u32 = 0x5080;
pub const STALL_COUNT: u32 = 0x5084;
pub const ITEM_RECIPROCAL: u32 = 0x5088;

/// Polled-mode nonce slots.
pub const POLLED_SLOTS: u32 = 4;

pub const fn polled_nonce_hi(slot: u32) -> u32 {
    HEADER + (19 + slot) * 4
}

pub const fn polled_nonce_lo(slot: u32) -> u32 {
    HEADER + (28 + slot) * 4
}

pub const fn polled_ready_bit(slot: u32) -> u32 {
    1 << (15 - slot)
}

// ── Clocking ─────────────────────────────────────────────────────────────────

pub const CLOCK_RESET: u32 = 0x8000;
pub const CLOCK_RESET_VALUE: u32 = 0xa;
pub const PLL_STATUS: u32 = 0x8004;
pub const PLL_LOCKED: u32 = 0x1;
pub const PLL_VCO: u32 = 0x8200;
pub const PLL_CLK0: u32 = 0x8208;
pub const PLL_RECONFIG: u32 = 0x825c;

// ── Power ────────────────────────────────────────────────────────────────────

pub const DAG_POWER: u32 = 0xb000;
pub const DAG_POWER_ON: u32 = 0xffff_ffff;
pub const DAG_POWER_RESET: u32 = 0xffff_fffd;
pub const DAG_POWER_OFF: u32 = 0x0;

// ── Regulators ───────────────────────────────────────────────────────────────

/// Rail A: wiper select port.
pub const RAIL_A_CTRL: u32 = 0x9040;
pub const RAIL_A_GO: u32 = 0x9100;
pub const RAIL_A_FIFO: u32 = 0x9108;

/// Rail B: bit-banged two-wire port to a PMBus regulator.
pub const RAIL_B_CTRL: u32 = 0xa040;
pub const RAIL_B_GO: u32 = 0xa100;
pub const RAIL_B_FIFO: u32 = 0xa108;

// ── HBM address space ────────────────────────────────────────────────────────

/// Generated DAG is staged here before being spread over both stacks.
pub const HBM_STAGING: u64 = 0x1_0000_0000;
pub const HBM_CHUNK: u64 = 0x0100_0000;
pub const HBM_CHUNKS: u64 = 256;
/// Final copy of the assembled image back over the staging range.
pub const HBM_IMAGE_DST: u64 = 0x1_0000_0000;
pub const HBM_IMAGE_LEN: u64 = 0x1_0000_0000;

/// Light cache upload granularity.
pub const UPLOAD_CHUNK: usize = 64 * 1024;
